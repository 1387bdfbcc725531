//! Gap realignment: reducing read mismatches by introducing indels observed
//! on other reads of the same bin.
//!
//! The catalog collects every gap seen in every fragment (grouped by sample,
//! project or globally), then each aligned record tries subsets of the gaps
//! overlapping its span. A subset wins only when it strictly reduces both
//! the cost under the configured scoring and the edit distance; the winning
//! CIGAR goes into the shared realigned-CIGAR arena and the record keeps its
//! original CIGAR for the OC tag.

use std::str::FromStr;

use log::trace;

use crate::build::packed_buffer::{CigarSource, Index, PackedFragmentBuffer};
use crate::cigar::{self, CigarOp};
use crate::cluster::bcl_base_char;
use crate::collector::bam_tlen;
use crate::error::BuildError;
use crate::fragment::DODGY_ALIGNMENT_SCORE;
use crate::position::ReferencePosition;
use crate::types::Contig;

/// Number of gaps a subset can draw from; the choice fits a u16 bitmask.
pub const MAX_GAPS_AT_A_TIME: usize = 10;

/// A realigned read keeping fewer aligned bases than this is not credible.
const REALIGNED_MAPPED_LENGTH_MIN: u32 = 16;

/// How far outside the read span catalog gaps are still considered.
const GAP_SEARCH_SLACK: u64 = 100;

/// Which fragments contribute to (and realign against) one gap catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapRealignerMode {
    None,
    /// gaps found within the sample
    Sample,
    /// gaps found in all samples of the same project
    Project,
    /// all gaps present in the data
    All,
}

impl FromStr for GapRealignerMode {
    type Err = BuildError;

    fn from_str(value: &str) -> Result<Self, BuildError> {
        match value {
            "none" => Ok(GapRealignerMode::None),
            "sample" => Ok(GapRealignerMode::Sample),
            "project" => Ok(GapRealignerMode::Project),
            "all" => Ok(GapRealignerMode::All),
            other => Err(BuildError::Config(format!(
                "invalid gap realignment mode: {}",
                other
            ))),
        }
    }
}

/// One observed indel: positive length deletes reference bases, negative
/// length inserts read bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Gap {
    pub position: ReferencePosition,
    pub length: i32,
}

impl Gap {
    pub fn is_deletion(&self) -> bool {
        self.length > 0
    }

    pub fn reference_length(&self) -> u64 {
        self.length.max(0) as u64
    }

    pub fn read_length(&self) -> u64 {
        (-self.length).max(0) as u64
    }

    pub fn edit_length(&self) -> u32 {
        self.length.unsigned_abs()
    }
}

/// The gap catalog of one realignment group.
#[derive(Default)]
pub struct RealignerGaps {
    gaps: Vec<Gap>,
}

impl RealignerGaps {
    pub fn reserve(&mut self, gaps: usize) {
        self.gaps.reserve(gaps);
    }

    /// Harvests the indels of one alignment.
    pub fn add_gaps(&mut self, f_strand_position: ReferencePosition, cigar: &[u32]) {
        let mut pos = f_strand_position;
        for &word in cigar {
            match cigar::decode(word) {
                (length, CigarOp::Align) => pos = pos.add(length as u64),
                (length, CigarOp::Insert) => {
                    self.gaps.push(Gap {
                        position: pos,
                        length: -(length as i32),
                    });
                }
                (length, CigarOp::Delete) => {
                    self.gaps.push(Gap {
                        position: pos,
                        length: length as i32,
                    });
                    pos = pos.add(length as u64);
                }
                (_, CigarOp::SoftClip) => {}
                (_, op) => {
                    debug_assert!(false, "unexpected CIGAR op {:?} in stored alignment", op);
                }
            }
        }
    }

    pub fn finalize(&mut self) {
        self.gaps.sort_unstable();
        self.gaps.dedup();
    }

    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }

    /// Gaps whose position falls into `[begin, end)`.
    pub fn find_gaps(&self, begin: ReferencePosition, end: ReferencePosition) -> &[Gap] {
        let from = self.gaps.partition_point(|gap| gap.position < begin);
        let to = self.gaps.partition_point(|gap| gap.position < end);
        &self.gaps[from..to]
    }
}

/// Outcome of simulating one gap subset at one start position.
#[derive(Debug, Clone)]
struct GapChoice {
    edit_distance: u32,
    mismatches: u32,
    cost: u32,
    mapped_length: u32,
    start: ReferencePosition,
    observed_length: u32,
    gap_count: u16,
    cigar: Vec<u32>,
}

pub struct GapRealigner {
    vigorous: bool,
    realign_dodgy: bool,
    gaps_per_fragment: u32,
    mismatch_cost: u32,
    gap_open_cost: u32,
    gap_extend_cost: u32,
}

impl GapRealigner {
    /// Default costs make a new gap worth no fewer than two mismatches.
    pub fn new(vigorous: bool, realign_dodgy: bool, gaps_per_fragment: u32) -> Self {
        GapRealigner {
            vigorous,
            realign_dodgy,
            gaps_per_fragment,
            mismatch_cost: 3,
            gap_open_cost: 4,
            gap_extend_cost: 0,
        }
    }

    fn choice_cost(&self, mismatches: u32, gaps: &[Gap]) -> u32 {
        mismatches * self.mismatch_cost
            + gaps
                .iter()
                .map(|gap| self.gap_open_cost + gap.edit_length() * self.gap_extend_cost)
                .sum::<u32>()
    }

    /// Realigns one record against the catalog. Returns true when the
    /// record changed.
    #[allow(clippy::too_many_arguments)]
    pub fn realign(
        &self,
        gaps: &RealignerGaps,
        bin_start: ReferencePosition,
        bin_end: ReferencePosition,
        index: &mut Index,
        buffer: &mut PackedFragmentBuffer,
        arena: &mut Vec<u32>,
        contigs: &[Contig],
    ) -> bool {
        {
            let fragment = buffer.fragment(index.data_offset);
            if !fragment.is_aligned() {
                return false;
            }
            if !self.realign_dodgy && fragment.alignment_score() == DODGY_ALIGNMENT_SCORE {
                return false;
            }
        }
        let mut changed = false;
        loop {
            let improved =
                self.realign_once(gaps, bin_start, bin_end, index, buffer, arena, contigs);
            changed |= improved;
            if !improved || !self.vigorous {
                break;
            }
        }
        changed
    }

    #[allow(clippy::too_many_arguments)]
    fn realign_once(
        &self,
        gaps: &RealignerGaps,
        bin_start: ReferencePosition,
        bin_end: ReferencePosition,
        index: &mut Index,
        buffer: &mut PackedFragmentBuffer,
        arena: &mut Vec<u32>,
        contigs: &[Contig],
    ) -> bool {
        let current_cigar = index.resolve_cigar(buffer, arena).into_owned();
        let fragment = buffer.fragment(index.data_offset);
        let contig = &contigs[index.pos.contig_id() as usize];
        let bases: Vec<u8> = fragment.bases().iter().map(|&b| bcl_base_char(b)).collect();

        let head_clip = match current_cigar.first().map(|&w| cigar::decode(w)) {
            Some((length, CigarOp::SoftClip)) => length,
            _ => 0,
        };
        let tail_clip = match current_cigar.last().map(|&w| cigar::decode(w)) {
            Some((length, CigarOp::SoftClip)) if current_cigar.len() > 1 => length,
            _ => 0,
        };
        let aligned_bases = &bases[head_clip as usize..bases.len() - tail_clip as usize];
        if aligned_bases.is_empty() {
            return false;
        }

        let begin_pos = index.pos;
        let end_pos = begin_pos.add(cigar::reference_length(&current_cigar) as u64);

        // baseline: what the current alignment costs under the same scoring
        let baseline = match self.evaluate_cigar(begin_pos, &current_cigar, &bases, contig) {
            Some(baseline) => baseline,
            None => return false,
        };
        let original_mismatch_percent = if baseline.mapped_length > 0 {
            baseline.mismatches * 100 / baseline.mapped_length
        } else {
            return false;
        };

        let search_begin = bin_start.max(
            begin_pos
                .checked_sub(GAP_SEARCH_SLACK)
                .unwrap_or(ReferencePosition::new(begin_pos.contig_id(), 0)),
        );
        let search_end = bin_end.min(end_pos.add(GAP_SEARCH_SLACK));
        if search_end <= search_begin {
            return false;
        }
        let mut overlapping: Vec<Gap> = gaps.find_gaps(search_begin, search_end).to_vec();
        if overlapping.is_empty() {
            return false;
        }
        if overlapping.len() > MAX_GAPS_AT_A_TIME {
            // keep the gaps nearest the read span and fall back to the
            // exhaustive search over those
            let span_center = (begin_pos.offset() + end_pos.offset()) / 2;
            overlapping
                .sort_by_key(|gap| (gap.position.offset() - span_center).unsigned_abs());
            overlapping.truncate(MAX_GAPS_AT_A_TIME);
            overlapping.sort_unstable();
        }

        let mut best: Option<GapChoice> = None;
        let gap_count = overlapping.len();
        for choice in 1u16..(1u16 << gap_count) {
            if choice.count_ones() > self.gaps_per_fragment {
                continue;
            }
            let chosen: Vec<Gap> = (0..gap_count)
                .filter(|bit| choice & (1 << bit) != 0)
                .map(|bit| overlapping[bit])
                .collect();
            // candidate starts: keep the begin, or shift it across each
            // chosen gap so reads anchored downstream of the gap fit
            let mut starts = vec![begin_pos];
            for gap in &chosen {
                let shifted = if gap.length >= 0 {
                    Some(begin_pos.add(gap.length as u64))
                } else {
                    begin_pos.checked_sub((-gap.length) as u64)
                };
                if let Some(shifted) = shifted {
                    if !starts.contains(&shifted) {
                        starts.push(shifted);
                    }
                }
            }
            for &start in &starts {
                if start < bin_start || start >= bin_end {
                    continue;
                }
                if let Some(candidate) = self.simulate_choice(
                    start,
                    &chosen,
                    aligned_bases,
                    head_clip,
                    tail_clip,
                    contig,
                ) {
                    if candidate.mapped_length < REALIGNED_MAPPED_LENGTH_MIN {
                        continue;
                    }
                    if self.is_better_choice(&candidate, original_mismatch_percent, &baseline)
                        && best
                            .as_ref()
                            .map(|b| {
                                candidate.cost < b.cost
                                    || (candidate.cost == b.cost
                                        && candidate.edit_distance < b.edit_distance)
                            })
                            .unwrap_or(true)
                    {
                        best = Some(candidate);
                    }
                }
            }
        }

        let winner = match best {
            Some(winner) => winner,
            None => return false,
        };
        trace!(
            "realigned {:?}: {} -> {} mismatches, cost {} -> {}",
            index.pos,
            baseline.mismatches,
            winner.mismatches,
            baseline.cost,
            winner.cost
        );
        self.apply_choice(winner, index, buffer, arena);
        true
    }

    fn is_better_choice(
        &self,
        candidate: &GapChoice,
        original_mismatch_percent: u32,
        baseline: &GapChoice,
    ) -> bool {
        if candidate.cost >= baseline.cost || candidate.edit_distance >= baseline.edit_distance {
            return false;
        }
        if self.vigorous {
            return true;
        }
        let candidate_percent = if candidate.mapped_length > 0 {
            candidate.mismatches * 100 / candidate.mapped_length
        } else {
            return false;
        };
        // demand a fifth of the original mismatch rate gone
        candidate_percent * 100 <= original_mismatch_percent * 80
    }

    /// Scores an existing CIGAR against the reference, producing the
    /// baseline GapChoice.
    fn evaluate_cigar(
        &self,
        begin_pos: ReferencePosition,
        cigar_words: &[u32],
        bases: &[u8],
        contig: &Contig,
    ) -> Option<GapChoice> {
        let mut reference_pos = begin_pos.offset() as usize;
        let mut read_offset = 0usize;
        let mut mismatches = 0u32;
        let mut mapped = 0u32;
        let mut gaps = Vec::new();
        for &word in cigar_words {
            match cigar::decode(word) {
                (length, CigarOp::SoftClip) => read_offset += length as usize,
                (length, CigarOp::Align) => {
                    for _ in 0..length {
                        let reference_base = *contig.forward.get(reference_pos)?;
                        if !crate::alignment::is_match(bases[read_offset], reference_base) {
                            mismatches += 1;
                        }
                        reference_pos += 1;
                        read_offset += 1;
                    }
                    mapped += length;
                }
                (length, CigarOp::Delete) => {
                    gaps.push(Gap {
                        position: ReferencePosition::new(
                            begin_pos.contig_id(),
                            reference_pos as i64,
                        ),
                        length: length as i32,
                    });
                    reference_pos += length as usize;
                }
                (length, CigarOp::Insert) => {
                    gaps.push(Gap {
                        position: ReferencePosition::new(
                            begin_pos.contig_id(),
                            reference_pos as i64,
                        ),
                        length: -(length as i32),
                    });
                    read_offset += length as usize;
                }
                _ => return None,
            }
        }
        let gap_edits: u32 = gaps.iter().map(Gap::edit_length).sum();
        Some(GapChoice {
            edit_distance: mismatches + gap_edits,
            mismatches,
            cost: self.choice_cost(mismatches, &gaps),
            mapped_length: mapped,
            start: begin_pos,
            observed_length: (reference_pos as i64 - begin_pos.offset()) as u32,
            gap_count: gaps.len() as u16,
            cigar: cigar_words.to_vec(),
        })
    }

    /// Walks the read from `start` applying the chosen gaps at their catalog
    /// positions. Returns None when the walk cannot accommodate the subset.
    fn simulate_choice(
        &self,
        start: ReferencePosition,
        chosen: &[Gap],
        aligned_bases: &[u8],
        head_clip: u32,
        tail_clip: u32,
        contig: &Contig,
    ) -> Option<GapChoice> {
        let contig_id = start.contig_id();
        let mut cigar = Vec::with_capacity(chosen.len() * 2 + 3);
        if head_clip > 0 {
            cigar::append_operation(&mut cigar, head_clip, CigarOp::SoftClip);
        }
        let mut reference_pos = start.offset();
        if reference_pos < 0 {
            return None;
        }
        let mut read_offset = 0usize;
        let mut mismatches = 0u32;
        let mut mapped = 0u32;

        let mut align_segment = |cigar: &mut Vec<u32>,
                                 reference_pos: &mut i64,
                                 read_offset: &mut usize,
                                 length: u64|
         -> Option<()> {
            for _ in 0..length {
                let reference_base = *contig.forward.get(*reference_pos as usize)?;
                if !crate::alignment::is_match(aligned_bases[*read_offset], reference_base) {
                    mismatches += 1;
                }
                *reference_pos += 1;
                *read_offset += 1;
            }
            mapped += length as u32;
            cigar::append_operation(cigar, length as u32, CigarOp::Align);
            Some(())
        };

        for gap in chosen {
            let gap_offset = gap.position.offset();
            if gap.position.contig_id() != contig_id || gap_offset < reference_pos {
                return None;
            }
            let align_len = (gap_offset - reference_pos) as u64;
            if read_offset as u64 + align_len + gap.read_length()
                >= aligned_bases.len() as u64
            {
                // the gap must land strictly inside the read
                return None;
            }
            align_segment(&mut cigar, &mut reference_pos, &mut read_offset, align_len)?;
            if read_offset == 0 {
                // a gap before any aligned base only moves the start
                return None;
            }
            if gap.is_deletion() {
                cigar::append_operation(&mut cigar, gap.length as u32, CigarOp::Delete);
                reference_pos += gap.length as i64;
            } else {
                cigar::append_operation(&mut cigar, gap.edit_length(), CigarOp::Insert);
                read_offset += gap.read_length() as usize;
            }
        }
        let remaining = aligned_bases.len() - read_offset;
        // clip what runs past the contig end
        let contig_room = (contig.len() as i64 - reference_pos).max(0) as usize;
        let (aligned_tail, overflow) = if remaining > contig_room {
            (contig_room, remaining - contig_room)
        } else {
            (remaining, 0)
        };
        if aligned_tail == 0 {
            return None;
        }
        align_segment(
            &mut cigar,
            &mut reference_pos,
            &mut read_offset,
            aligned_tail as u64,
        )?;
        if tail_clip as usize + overflow > 0 {
            cigar::append_operation(
                &mut cigar,
                tail_clip + overflow as u32,
                CigarOp::SoftClip,
            );
        }

        let gap_edits: u32 = chosen.iter().map(Gap::edit_length).sum();
        Some(GapChoice {
            edit_distance: mismatches + gap_edits,
            mismatches,
            cost: self.choice_cost(mismatches, chosen),
            mapped_length: mapped,
            start,
            observed_length: (reference_pos - start.offset()) as u32,
            gap_count: chosen.len() as u16,
            cigar,
        })
    }

    /// Rewrites the record and its co-resident mate for the winning choice.
    fn apply_choice(
        &self,
        winner: GapChoice,
        index: &mut Index,
        buffer: &mut PackedFragmentBuffer,
        arena: &mut Vec<u32>,
    ) {
        let begin = arena.len();
        arena.extend_from_slice(&winner.cigar);
        index.cigar = CigarSource::Arena {
            begin,
            end: arena.len(),
        };
        index.pos = winner.start;
        {
            let mut fragment = buffer.fragment_mut(index.data_offset);
            fragment.set_f_strand_position(winner.start);
            fragment.set_observed_length(winner.observed_length);
            fragment.set_edit_distance(winner.edit_distance as u16);
            fragment.set_gap_count(winner.gap_count);
        }
        if index.has_mate() {
            let (fragment_begin, fragment_end, first_read, fragment_offset) = {
                let fragment = buffer.fragment(index.data_offset);
                (
                    fragment.f_strand_position(),
                    fragment
                        .f_strand_position()
                        .add(fragment.observed_length() as u64),
                    fragment.flags().first_read,
                    index.data_offset,
                )
            };
            let (mate_begin, mate_end) = {
                let mate = buffer.mate_of(index);
                (
                    mate.f_strand_position(),
                    mate.f_strand_position().add(mate.observed_length() as u64),
                )
            };
            let tlen =
                bam_tlen(fragment_begin, fragment_end, mate_begin, mate_end, first_read);
            buffer.fragment_mut(fragment_offset).set_bam_tlen(tlen);
            let mut mate = buffer.fragment_mut(index.mate_data_offset);
            mate.set_bam_tlen(
                bam_tlen(mate_begin, mate_end, fragment_begin, fragment_end, !first_read),
            );
            mate.set_mate_f_strand_position(fragment_begin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::bcl_from_base;
    use crate::fragment::{FragmentFlags, FragmentHeader, HEADER_SIZE};

    fn contig(sequence: &[u8]) -> Contig {
        Contig {
            name: "chr1".to_string(),
            forward: sequence.to_vec(),
        }
    }

    /// Serializes one aligned record with the given bases and CIGAR.
    fn store_record(
        bytes: &mut Vec<u8>,
        pos: ReferencePosition,
        bases: &[u8],
        cigar_words: &[u32],
        edit_distance: u16,
    ) -> usize {
        let header = FragmentHeader {
            bam_tlen: 0,
            observed_length: cigar::reference_length(cigar_words),
            f_strand_position: pos,
            low_clipped: 0,
            high_clipped: 0,
            alignment_score: 40,
            template_alignment_score: 40,
            mate_f_strand_position: pos,
            read_length: bases.len() as u16,
            cigar_length: cigar_words.len() as u16,
            gap_count: cigar_words
                .iter()
                .filter(|&&w| {
                    matches!(
                        cigar::decode(w).1,
                        CigarOp::Insert | CigarOp::Delete
                    )
                })
                .count() as u16,
            edit_distance,
            flags: FragmentFlags {
                paired: false,
                first_read: true,
                ..Default::default()
            },
            tile: 0,
            barcode: 0,
            mate_storage_bin: 0,
            barcode_sequence: 0,
            cluster_id: 1,
            cluster_x: 0,
            cluster_y: 0,
            duplicate_cluster_rank: 0,
            mate_anchor: 0,
        };
        let offset = bytes.len();
        let total = HEADER_SIZE + bases.len() + cigar_words.len() * 4;
        bytes.resize(offset + total, 0);
        header.write_to(&mut bytes[offset..]);
        for (at, &base) in bases.iter().enumerate() {
            bytes[offset + HEADER_SIZE + at] = bcl_from_base(base, 30);
        }
        for (at, &word) in cigar_words.iter().enumerate() {
            let from = offset + HEADER_SIZE + bases.len() + at * 4;
            bytes[from..from + 4].copy_from_slice(&word.to_le_bytes());
        }
        offset
    }

    #[test]
    fn catalog_collects_and_deduplicates_gaps() {
        let mut catalog = RealignerGaps::default();
        let cigar = vec![
            cigar::encode(10, CigarOp::Align),
            cigar::encode(3, CigarOp::Delete),
            cigar::encode(10, CigarOp::Align),
        ];
        catalog.add_gaps(ReferencePosition::new(0, 100), &cigar);
        catalog.add_gaps(ReferencePosition::new(0, 100), &cigar);
        catalog.finalize();
        assert_eq!(catalog.gap_count(), 1);
        let found = catalog.find_gaps(
            ReferencePosition::new(0, 100),
            ReferencePosition::new(0, 120),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0],
            Gap {
                position: ReferencePosition::new(0, 110),
                length: 3,
            }
        );
        assert!(catalog
            .find_gaps(
                ReferencePosition::new(0, 111),
                ReferencePosition::new(0, 200)
            )
            .is_empty());
    }

    /// A reference where position 40 carries a 3-base deletion relative to
    /// the reads: reads skipping bases 40..43 match perfectly.
    fn deletion_fixture() -> (Contig, Vec<u8>) {
        let mut reference: Vec<u8> = Vec::new();
        let pattern = b"ACGTCGATTGCAGCATTACG";
        while reference.len() < 100 {
            reference.extend_from_slice(pattern);
        }
        reference.truncate(100);
        // read covers reference [20..60) minus the deleted [40..43)
        let mut read = Vec::new();
        read.extend_from_slice(&reference[20..40]);
        read.extend_from_slice(&reference[43..60]);
        (contig(&reference), read)
    }

    #[test]
    fn realigns_mismatching_read_onto_catalog_deletion() {
        let (contig, read) = deletion_fixture();
        let pos = ReferencePosition::new(0, 20);
        // the read was force-aligned ungapped; its tail mismatches
        let ungapped = vec![cigar::encode(read.len() as u32, CigarOp::Align)];
        let mut bytes = Vec::new();
        let offset = store_record(&mut bytes, pos, &read, &ungapped, 10);
        let mut buffer = PackedFragmentBuffer::from_bytes(bytes);
        let mut index = Index::new(pos, offset, offset);

        let mut catalog = RealignerGaps::default();
        catalog.add_gaps(
            ReferencePosition::new(0, 20),
            &[
                cigar::encode(20, CigarOp::Align),
                cigar::encode(3, CigarOp::Delete),
                cigar::encode(17, CigarOp::Align),
            ],
        );
        catalog.finalize();

        let realigner = GapRealigner::new(false, true, 2);
        let mut arena = Vec::new();
        let changed = realigner.realign(
            &catalog,
            ReferencePosition::new(0, 0),
            ReferencePosition::new(0, 100),
            &mut index,
            &mut buffer,
            &mut arena,
            std::slice::from_ref(&contig),
        );
        assert!(changed);
        let new_cigar = index.resolve_cigar(&buffer, &arena).into_owned();
        assert_eq!(cigar::to_string(&new_cigar), "20M3D17M");
        let fragment = buffer.fragment(offset);
        assert_eq!(fragment.edit_distance(), 3);
        assert_eq!(fragment.gap_count(), 1);
        assert_eq!(fragment.observed_length(), 40);
        // the original CIGAR stays in the record for the OC tag
        assert_eq!(fragment.cigar(), ungapped);
        assert!(index.is_realigned());
    }

    #[test]
    fn perfect_alignment_is_left_alone() {
        let (contig, _) = deletion_fixture();
        let read: Vec<u8> = contig.forward[20..56].to_vec();
        let pos = ReferencePosition::new(0, 20);
        let words = vec![cigar::encode(read.len() as u32, CigarOp::Align)];
        let mut bytes = Vec::new();
        let offset = store_record(&mut bytes, pos, &read, &words, 0);
        let mut buffer = PackedFragmentBuffer::from_bytes(bytes);
        let mut index = Index::new(pos, offset, offset);

        let mut catalog = RealignerGaps::default();
        catalog.gaps.push(Gap {
            position: ReferencePosition::new(0, 40),
            length: 3,
        });
        catalog.finalize();

        let realigner = GapRealigner::new(false, true, 2);
        let mut arena = Vec::new();
        assert!(!realigner.realign(
            &catalog,
            ReferencePosition::new(0, 0),
            ReferencePosition::new(0, 100),
            &mut index,
            &mut buffer,
            &mut arena,
            std::slice::from_ref(&contig),
        ));
        assert!(!index.is_realigned());
    }

    #[test]
    fn realignment_is_idempotent() {
        let (contig, read) = deletion_fixture();
        let pos = ReferencePosition::new(0, 20);
        let ungapped = vec![cigar::encode(read.len() as u32, CigarOp::Align)];
        let mut bytes = Vec::new();
        let offset = store_record(&mut bytes, pos, &read, &ungapped, 10);
        let mut buffer = PackedFragmentBuffer::from_bytes(bytes);
        let mut index = Index::new(pos, offset, offset);

        let mut catalog = RealignerGaps::default();
        catalog.gaps.push(Gap {
            position: ReferencePosition::new(0, 40),
            length: 3,
        });
        catalog.finalize();

        let realigner = GapRealigner::new(false, true, 2);
        let mut arena = Vec::new();
        let bounds = (ReferencePosition::new(0, 0), ReferencePosition::new(0, 100));
        realigner.realign(
            &catalog,
            bounds.0,
            bounds.1,
            &mut index,
            &mut buffer,
            &mut arena,
            std::slice::from_ref(&contig),
        );
        let first = index.resolve_cigar(&buffer, &arena).into_owned();
        // a second pass over the already-realigned record finds no further
        // improvement
        let changed = realigner.realign(
            &catalog,
            bounds.0,
            bounds.1,
            &mut index,
            &mut buffer,
            &mut arena,
            std::slice::from_ref(&contig),
        );
        assert!(!changed);
        assert_eq!(index.resolve_cigar(&buffer, &arena).into_owned(), first);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(
            "sample".parse::<GapRealignerMode>().unwrap(),
            GapRealignerMode::Sample
        );
        assert!("bogus".parse::<GapRealignerMode>().is_err());
    }
}
