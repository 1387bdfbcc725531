//! Shadow rescue: placing an unaligned mate near its aligned partner.
//!
//! The shadow sequence is hashed by short k-mer, the rescue window around
//! the orphan (derived from the template-length model) is scanned with the
//! same k-mer generator, and every agreeing diagonal becomes a candidate
//! position for the ungapped aligner. Gapped retries only run when the best
//! ungapped placement is poor and a neighboring candidate suggests an indel.

use crate::align::{
    GappedAligner, UngappedAligner, GAPPED_DISTANCE_CUTOFF, GAPPED_MISMATCHES_CUTOFF,
};
use crate::alignment::FragmentMetadata;
use crate::quality::lp_less;
use crate::tls::TemplateLengthStatistics;
use crate::types::Contig;

pub const SHADOW_KMER_LENGTH: usize = 7;
const SHADOW_KMER_COUNT: usize = 1 << (2 * SHADOW_KMER_LENGTH);

/// Bound on tracked candidate positions; more than this means the template
/// sits in a repeat and the score would be miserable anyway.
pub const CANDIDATE_POSITIONS_MAX: usize = 1000;

/// Streams the 2-bit k-mers of a sequence, restarting after every N.
pub struct KmerGenerator<'a> {
    sequence: &'a [u8],
    kmer_length: usize,
    offset: usize,
    kmer: u32,
    valid_bases: usize,
    mask: u32,
}

impl<'a> KmerGenerator<'a> {
    pub fn new(sequence: &'a [u8], kmer_length: usize) -> Self {
        debug_assert!(kmer_length > 0 && kmer_length <= 16);
        KmerGenerator {
            sequence,
            kmer_length,
            offset: 0,
            kmer: 0,
            valid_bases: 0,
            mask: (1u32 << (2 * kmer_length)).wrapping_sub(1),
        }
    }

    fn base_bits(base: u8) -> Option<u32> {
        match base {
            b'A' => Some(0),
            b'C' => Some(1),
            b'G' => Some(2),
            b'T' => Some(3),
            _ => None,
        }
    }
}

impl<'a> Iterator for KmerGenerator<'a> {
    /// `(kmer, offset of its first base)`
    type Item = (u32, usize);

    fn next(&mut self) -> Option<(u32, usize)> {
        while self.offset < self.sequence.len() {
            let base = self.sequence[self.offset];
            self.offset += 1;
            match Self::base_bits(base) {
                Some(bits) => {
                    self.kmer = ((self.kmer << 2) | bits) & self.mask;
                    self.valid_bases += 1;
                    if self.valid_bases >= self.kmer_length {
                        return Some((self.kmer, self.offset - self.kmer_length));
                    }
                }
                None => {
                    self.valid_bases = 0;
                    self.kmer = 0;
                }
            }
        }
        None
    }
}

pub struct ShadowAligner {
    gapped_mismatches_max: u32,
    /// first-occurrence read offset per k-mer, -1 means absent
    kmer_positions: Vec<i32>,
    candidate_positions: Vec<i64>,
}

impl ShadowAligner {
    pub fn new(gapped_mismatches_max: u32) -> Self {
        ShadowAligner {
            gapped_mismatches_max,
            kmer_positions: vec![-1; SHADOW_KMER_COUNT],
            candidate_positions: Vec::with_capacity(CANDIDATE_POSITIONS_MAX),
        }
    }

    fn hash_shadow_kmers(&mut self, sequence: &[u8]) {
        self.kmer_positions.fill(-1);
        for (kmer, offset) in KmerGenerator::new(sequence, SHADOW_KMER_LENGTH) {
            if self.kmer_positions[kmer as usize] < 0 {
                self.kmer_positions[kmer as usize] = offset as i32;
            }
        }
    }

    /// Collects candidate shadow begin positions (contig coordinates) from
    /// the reference window.
    fn find_candidate_positions(&mut self, reference: &[u8], window_start: i64, sequence: &[u8]) {
        self.hash_shadow_kmers(sequence);
        self.candidate_positions.clear();
        for (kmer, offset) in KmerGenerator::new(reference, SHADOW_KMER_LENGTH) {
            let shadow_offset = self.kmer_positions[kmer as usize];
            if shadow_offset >= 0 {
                let candidate = window_start + offset as i64 - shadow_offset as i64;
                // avoid spurious repetitions of start positions
                if self.candidate_positions.last() != Some(&candidate) {
                    if self.candidate_positions.len() == CANDIDATE_POSITIONS_MAX {
                        break;
                    }
                    self.candidate_positions.push(candidate);
                }
            }
        }
        self.candidate_positions.sort_unstable();
        self.candidate_positions.dedup();
    }

    /// Widens the model window when the best pair found so far is longer
    /// than the dominant template, and pads both ends.
    fn rescue_range(
        orphan: &FragmentMetadata<'_>,
        tls: &TemplateLengthStatistics,
        shadow_read_length: u32,
        best_template_length: i64,
    ) -> (i64, i64) {
        let geometry = orphan.end_geometry();
        let mut min = tls.mate_min_position(&geometry, shadow_read_length);
        let mut max =
            tls.mate_max_position(&geometry, shadow_read_length) + shadow_read_length as i64 - 1;
        if best_template_length != 0 {
            if min < geometry.begin {
                min = min.min(geometry.end - 1 - best_template_length);
            }
            if max > geometry.begin {
                max = max.max(geometry.begin + best_template_length);
            }
        }
        (min - 10, max + 10)
    }

    /// Finds placements for the unaligned mate of `orphan`. Returns false
    /// when no viable placement exists; a false return with a non-empty
    /// `shadow_list` means the shadow hit a repeat and rescue must not be
    /// trusted.
    pub fn rescue_shadow<'a>(
        &mut self,
        contigs: &[Contig],
        orphan: &FragmentMetadata<'a>,
        shadow_list: &mut Vec<FragmentMetadata<'a>>,
        cigar_buffer: &mut Vec<u32>,
        tls: &TemplateLengthStatistics,
        best_template_length: i64,
    ) -> bool {
        shadow_list.clear();
        if !tls.coherent {
            return false;
        }
        debug_assert!(orphan.read_index < 2, "paired reads means two");
        let cluster = orphan.cluster;
        let shadow_read_index = (orphan.read_index + 1) % 2;
        let shadow_read = cluster.read(shadow_read_index);
        let contig = &contigs[orphan.contig_id as usize];

        let shadow_reverse = tls.mate_orientation(orphan.reverse);
        let (window_min, window_max) =
            Self::rescue_range(orphan, tls, shadow_read.len() as u32, best_template_length);
        if window_max < window_min || window_max + 1 + (shadow_read.len() as i64) < 0 {
            return false;
        }

        let window_start = window_min.max(0);
        let window_end = (window_max + 1).min(contig.len() as i64);
        if window_start >= window_end {
            return false;
        }
        let sequence = shadow_read.strand_sequence(shadow_reverse);
        self.find_candidate_positions(
            &contig.forward[window_start as usize..window_end as usize],
            window_start,
            sequence,
        );

        let mut best: Option<usize> = None;
        let candidates = std::mem::take(&mut self.candidate_positions);
        for at in 0..candidates.len() {
            if shadow_list.len() == CANDIDATE_POSITIONS_MAX {
                self.candidate_positions = candidates;
                return false;
            }
            let mut fragment = FragmentMetadata::new(cluster, shadow_read_index);
            fragment.reverse = shadow_reverse;
            fragment.contig_id = orphan.contig_id;
            fragment.position = candidates[at];
            if UngappedAligner::align(&mut fragment, cigar_buffer, contig) {
                let better = match best {
                    None => true,
                    Some(at) => lp_less(shadow_list[at].log_probability, fragment.log_probability),
                };
                shadow_list.push(fragment);
                if better {
                    best = Some(shadow_list.len() - 1);
                }
            }
        }
        self.candidate_positions = candidates;

        let mut best = match best {
            Some(best) => best,
            None => return false,
        };

        if shadow_list[best].mismatch_count > GAPPED_MISMATCHES_CUTOFF {
            // close candidate pairs hint at an indel; give the gapped
            // aligner a chance on each poor placement
            for at in 0..shadow_list.len() {
                let close_neighbor = shadow_list
                    .get(at + 1)
                    .map(|next| next.position - shadow_list[at].position < GAPPED_DISTANCE_CUTOFF)
                    .unwrap_or(false);
                if !close_neighbor || shadow_list[at].mismatch_count <= GAPPED_MISMATCHES_CUTOFF {
                    continue;
                }
                let mut retry = shadow_list[at].clone();
                let matched = GappedAligner::align(&mut retry, cigar_buffer, contig);
                if matched > 0
                    && matched + crate::align::WIDEST_GAP_SIZE > shadow_list[at].observed_length
                    && retry.mismatch_count <= self.gapped_mismatches_max
                    && shadow_list[at].mismatch_count > retry.mismatch_count
                    && lp_less(shadow_list[at].log_probability, retry.log_probability)
                {
                    let improves_best =
                        lp_less(shadow_list[best].log_probability, retry.log_probability);
                    shadow_list[at] = retry;
                    if improves_best {
                        best = at;
                    }
                }
            }
        }

        shadow_list.swap(0, best);
        true
    }
}
