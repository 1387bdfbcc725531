//! In-memory alignment state of one fragment during template building.
//!
//! `FragmentMetadata` is cluster-scoped and allocation-free: its CIGAR lives
//! as an `(offset, length)` range inside a shared buffer that outlives the
//! template build, so candidates can be cloned and compared freely.

use crate::cigar::{self, CigarOp};
use crate::cluster::Cluster;
use crate::position::{ReferencePosition, MAX_CONTIG_ID};
use crate::tls::EndGeometry;

/// Short seeds need extra evidence; two non-unique seeds must span at least
/// this many bases of the read for the alignment to count as anchored.
pub const WEAK_SEED_LENGTH: u32 = 32;

/// A read N matches anything; a reference N matches nothing.
pub fn is_match(read_base: u8, reference_base: u8) -> bool {
    read_base == b'N' || (read_base == reference_base && reference_base != b'N')
}

/// Finds the prefix to clip so the remaining sequence starts with
/// `MIN_MATCHES` consecutive matches. Returns `(bases clipped, edit-distance
/// mismatches removed)`, or `(0, 0)` if no such prefix exists. N counts as an
/// edit-distance mismatch here even though it aligns.
pub fn clip_mismatches<const MIN_MATCHES: u32>(
    sequence: impl Iterator<Item = u8>,
    reference: impl Iterator<Item = u8>,
) -> (u32, u32) {
    let mut matches_in_a_row = 0u32;
    let mut edit_mismatches = 0u32;
    let mut unclipped_edit_mismatches = 0u32;
    let mut advanced = 0u32;
    for (read_base, reference_base) in sequence.zip(reference) {
        if matches_in_a_row >= MIN_MATCHES {
            break;
        }
        if is_match(read_base, reference_base) {
            matches_in_a_row += 1;
            unclipped_edit_mismatches += (read_base != reference_base) as u32;
        } else {
            matches_in_a_row = 0;
            unclipped_edit_mismatches = 0;
        }
        edit_mismatches += (read_base != reference_base) as u32;
        advanced += 1;
    }
    if matches_in_a_row >= MIN_MATCHES {
        (
            advanced - matches_in_a_row,
            edit_mismatches - unclipped_edit_mismatches,
        )
    } else {
        (0, 0)
    }
}

#[derive(Clone)]
pub struct FragmentMetadata<'a> {
    pub cluster: &'a Cluster,
    pub contig_id: u32,
    /// 0-based leftmost position on the forward strand. May go negative
    /// while the CIGAR is under construction; final positions are
    /// non-negative, with leading soft clips absorbing any overhang.
    pub position: i64,
    pub low_clipped: u16,
    pub high_clipped: u16,
    pub observed_length: u32,
    pub read_index: usize,
    pub reverse: bool,
    pub cigar_offset: usize,
    pub cigar_length: usize,
    pub mismatch_count: u32,
    pub matches_in_a_row: u32,
    pub gap_count: u32,
    pub edit_distance: u32,
    pub log_probability: f64,
    pub mismatch_cycles: Vec<u16>,
    pub first_seed_index: i32,
    pub repeat_seeds_count: u32,
    pub unique_seed_count: u32,
    /// lowest and highest read offsets of seeds that have reference
    /// neighbors
    pub non_unique_seed_offsets: (u32, u32),
    /// None means unknown (the "dodgy" sentinel)
    pub alignment_score: Option<u32>,
    /// Weighted sum of mismatch and gap penalties; lower is better.
    pub smith_waterman_score: u32,
}

impl<'a> FragmentMetadata<'a> {
    pub fn new(cluster: &'a Cluster, read_index: usize) -> Self {
        FragmentMetadata {
            cluster,
            contig_id: MAX_CONTIG_ID,
            position: 0,
            low_clipped: 0,
            high_clipped: 0,
            observed_length: 0,
            read_index,
            reverse: false,
            cigar_offset: 0,
            cigar_length: 0,
            mismatch_count: 0,
            matches_in_a_row: 0,
            gap_count: 0,
            edit_distance: 0,
            log_probability: 0.0,
            mismatch_cycles: Vec::new(),
            first_seed_index: -1,
            repeat_seeds_count: 0,
            unique_seed_count: 0,
            non_unique_seed_offsets: (u32::MAX, 0),
            alignment_score: None,
            smith_waterman_score: 0,
        }
    }

    pub fn read_length(&self) -> u32 {
        self.cluster.read(self.read_index).len() as u32
    }

    pub fn is_aligned(&self) -> bool {
        self.cigar_length != 0
    }

    pub fn set_unaligned(&mut self) {
        self.cigar_length = 0;
        self.alignment_score = None;
    }

    /// Unlike `set_unaligned`, forgets the position too; unaligned shadows
    /// keep their orphan's position, no-match fragments sort into bin 0.
    pub fn set_no_match(&mut self) {
        self.set_unaligned();
        self.contig_id = MAX_CONTIG_ID;
        self.position = 0;
    }

    pub fn is_no_match(&self) -> bool {
        self.contig_id == MAX_CONTIG_ID
    }

    pub fn is_well_anchored(&self) -> bool {
        self.unique_seed_count > 0
            || (self.non_unique_seed_offsets.1 > self.non_unique_seed_offsets.0
                && self.non_unique_seed_offsets.1 - self.non_unique_seed_offsets.0
                    >= WEAK_SEED_LENGTH)
    }

    pub fn f_strand_position(&self) -> ReferencePosition {
        if self.is_no_match() {
            ReferencePosition::NO_MATCH
        } else {
            ReferencePosition::new(self.contig_id, self.position)
        }
    }

    pub fn r_strand_position(&self) -> ReferencePosition {
        if self.is_no_match() {
            ReferencePosition::NO_MATCH
        } else {
            ReferencePosition::new(
                self.contig_id,
                (self.position + self.observed_length as i64).max(1) - 1,
            )
        }
    }

    pub fn strand_position(&self) -> ReferencePosition {
        if self.reverse {
            self.r_strand_position()
        } else {
            self.f_strand_position()
        }
    }

    pub fn begin_position(&self) -> ReferencePosition {
        self.f_strand_position()
    }

    /// One past the last unclipped base, unlike the r-strand position.
    pub fn end_position(&self) -> ReferencePosition {
        if self.is_no_match() {
            ReferencePosition::NO_MATCH
        } else {
            ReferencePosition::new(self.contig_id, self.position + self.observed_length as i64)
        }
    }

    pub fn cigar<'b>(&self, cigar_buffer: &'b [u32]) -> &'b [u32] {
        &cigar_buffer[self.cigar_offset..self.cigar_offset + self.cigar_length]
    }

    pub fn begin_clipped_length(&self, cigar_buffer: &[u32]) -> u32 {
        match self.cigar(cigar_buffer).first().map(|&word| cigar::decode(word)) {
            Some((len, CigarOp::SoftClip)) => len,
            _ => 0,
        }
    }

    pub fn end_clipped_length(&self, cigar_buffer: &[u32]) -> u32 {
        match self.cigar(cigar_buffer).last().map(|&word| cigar::decode(word)) {
            Some((len, CigarOp::SoftClip)) if self.cigar_length > 1 => len,
            _ => 0,
        }
    }

    pub fn mapped_length(&self, cigar_buffer: &[u32]) -> u32 {
        cigar::mapped_length(self.cigar(cigar_buffer))
    }

    pub fn add_mismatch_cycle(&mut self, cycle: u16) {
        debug_assert!(cycle > 0, "cycle numbers are 1-based");
        self.mismatch_cycles.push(cycle);
        self.mismatch_count += 1;
    }

    pub fn reset_alignment(&mut self, cigar_buffer: &[u32]) {
        self.position -= self.begin_clipped_length(cigar_buffer) as i64;
        self.cigar_offset = cigar_buffer.len();
        self.cigar_length = 0;
        self.observed_length = 0;
        self.mismatch_cycles.clear();
        self.mismatch_count = 0;
        self.matches_in_a_row = 0;
        self.gap_count = 0;
        self.edit_distance = 0;
        self.log_probability = 0.0;
        self.alignment_score = None;
        self.smith_waterman_score = 0;
    }

    pub fn quality_sum(&self) -> u32 {
        self.cluster.read(self.read_index).quality_sum()
    }

    pub fn end_geometry(&self) -> EndGeometry {
        EndGeometry {
            contig_id: self.contig_id,
            begin: self.position,
            end: self.position + self.observed_length as i64,
            reverse: self.reverse,
        }
    }

    /// Identity of the placement, for deduplicating probabilities reached by
    /// multiple candidate paths.
    pub fn placement(&self) -> (u32, i64, bool, u32) {
        (
            self.contig_id,
            self.position,
            self.reverse,
            self.observed_length,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{bcl_from_base, Read};

    fn cluster() -> Cluster {
        let read = |seq: &[u8]| Read::new(seq.iter().map(|&b| bcl_from_base(b, 30)).collect());
        Cluster::new(11, 0, vec![read(b"ACGTACGT"), read(b"TTTTAAAA")])
    }

    #[test]
    fn unaligned_until_cigar_present() {
        let cluster = cluster();
        let mut fragment = FragmentMetadata::new(&cluster, 0);
        assert!(!fragment.is_aligned());
        assert!(fragment.is_no_match());
        fragment.contig_id = 1;
        fragment.position = 100;
        fragment.cigar_length = 1;
        assert!(fragment.is_aligned());
        assert!(!fragment.is_no_match());
    }

    #[test]
    fn well_anchored_rules() {
        let cluster = cluster();
        let mut fragment = FragmentMetadata::new(&cluster, 0);
        assert!(!fragment.is_well_anchored());
        fragment.unique_seed_count = 1;
        assert!(fragment.is_well_anchored());
        fragment.unique_seed_count = 0;
        fragment.non_unique_seed_offsets = (0, 31);
        assert!(!fragment.is_well_anchored());
        fragment.non_unique_seed_offsets = (0, 32);
        assert!(fragment.is_well_anchored());
    }

    #[test]
    fn strand_positions() {
        let cluster = cluster();
        let mut fragment = FragmentMetadata::new(&cluster, 0);
        fragment.contig_id = 2;
        fragment.position = 1000;
        fragment.observed_length = 8;
        fragment.cigar_length = 1;
        assert_eq!(fragment.f_strand_position(), ReferencePosition::new(2, 1000));
        assert_eq!(fragment.r_strand_position(), ReferencePosition::new(2, 1007));
        fragment.reverse = true;
        assert_eq!(fragment.strand_position(), ReferencePosition::new(2, 1007));
        assert_eq!(fragment.end_position(), ReferencePosition::new(2, 1008));
    }

    #[test]
    fn clip_mismatches_finds_run() {
        // first three positions mismatch, then five matches
        let read = b"AAATTTTT";
        let reference = b"CCCTTTTT";
        let (clipped, removed) = clip_mismatches::<5>(
            read.iter().copied(),
            reference.iter().copied(),
        );
        assert_eq!(clipped, 3);
        assert_eq!(removed, 3);
    }

    #[test]
    fn clip_mismatches_gives_up_without_run() {
        let read = b"ATATATAT";
        let reference = b"TATATATA";
        assert_eq!(
            clip_mismatches::<5>(read.iter().copied(), reference.iter().copied()),
            (0, 0)
        );
    }

    #[test]
    fn read_n_matches_but_reference_n_does_not() {
        assert!(is_match(b'N', b'A'));
        assert!(!is_match(b'A', b'N'));
        assert!(is_match(b'A', b'A'));
        assert!(!is_match(b'A', b'C'));
    }
}
