//! Alignment primitives used by shadow rescue.
//!
//! The ungapped aligner scores a read at a fixed candidate position,
//! producing the CIGAR, mismatch cycles and log probability. The gapped
//! aligner retries poor ungapped placements allowing one indel within a
//! bounded band; multi-gap combinations are the gap realigner's job later in
//! the pipeline.

use crate::alignment::{is_match, FragmentMetadata};
use crate::cigar::{self, CigarOp};
use crate::quality;
use crate::types::Contig;

/// Cost weights shared with candidate comparison: lower score wins.
pub const SW_MISMATCH_WEIGHT: u32 = 3;
pub const SW_GAP_OPEN_WEIGHT: u32 = 4;
pub const SW_GAP_EXTEND_WEIGHT: u32 = 0;

/// Widest indel the gapped aligner will introduce.
pub const WIDEST_GAP_SIZE: u32 = 16;
/// Above this many ungapped mismatches a gapped retry is attempted.
pub const GAPPED_MISMATCHES_CUTOFF: u32 = 5;
/// Candidate positions closer than this may be two views of one gapped
/// placement.
pub const GAPPED_DISTANCE_CUTOFF: i64 = 300;

pub struct UngappedAligner;

impl UngappedAligner {
    /// Aligns the fragment's read at `fragment.position` without gaps.
    /// Overhang beyond either contig end becomes soft clip; the position is
    /// final (non-negative) on return. Returns false when no base aligns.
    pub fn align(
        fragment: &mut FragmentMetadata<'_>,
        cigar_buffer: &mut Vec<u32>,
        contig: &Contig,
    ) -> bool {
        let read = fragment.cluster.read(fragment.read_index);
        let sequence = read.strand_sequence(fragment.reverse);
        let qualities = read.strand_quality(fragment.reverse);
        let read_length = sequence.len() as i64;
        let contig_length = contig.len() as i64;

        let head_clip = (-fragment.position).max(0).min(read_length);
        let tail_clip = ((fragment.position + read_length) - contig_length)
            .max(0)
            .min(read_length - head_clip);
        let aligned = read_length - head_clip - tail_clip;
        if aligned <= 0 {
            return false;
        }

        let start = (fragment.position + head_clip) as usize;
        fragment.cigar_offset = cigar_buffer.len();
        if head_clip > 0 {
            cigar_buffer.push(cigar::encode(head_clip as u32, CigarOp::SoftClip));
        }
        cigar_buffer.push(cigar::encode(aligned as u32, CigarOp::Align));
        if tail_clip > 0 {
            cigar_buffer.push(cigar::encode(tail_clip as u32, CigarOp::SoftClip));
        }
        fragment.cigar_length = cigar_buffer.len() - fragment.cigar_offset;

        fragment.mismatch_cycles.clear();
        fragment.mismatch_count = 0;
        fragment.matches_in_a_row = 0;
        fragment.log_probability = 0.0;
        fragment.edit_distance = 0;
        let mut run = 0u32;
        for offset in 0..aligned as usize {
            let read_base = sequence[head_clip as usize + offset];
            let reference_base = contig.forward[start + offset];
            let q = qualities[head_clip as usize + offset];
            if is_match(read_base, reference_base) {
                run += 1;
                fragment.matches_in_a_row = fragment.matches_in_a_row.max(run);
                fragment.log_probability += quality::log_match(q);
                fragment.edit_distance += (read_base != reference_base) as u32;
            } else {
                run = 0;
                fragment.add_mismatch_cycle(head_clip as u32 as u16 + offset as u16 + 1);
                fragment.log_probability += quality::log_mismatch(q);
                fragment.edit_distance += 1;
            }
        }

        fragment.position += head_clip;
        fragment.observed_length = aligned as u32;
        fragment.gap_count = 0;
        fragment.smith_waterman_score = fragment.mismatch_count * SW_MISMATCH_WEIGHT;
        true
    }
}

pub struct GappedAligner;

impl GappedAligner {
    /// Retries the fragment's placement allowing one insertion or deletion
    /// of up to [`WIDEST_GAP_SIZE`] bases, exhaustively over split points
    /// within the band. Keeps the fragment untouched and returns the number
    /// of matching bases when no gapped placement beats the input.
    pub fn align(
        fragment: &mut FragmentMetadata<'_>,
        cigar_buffer: &mut Vec<u32>,
        contig: &Contig,
    ) -> u32 {
        let read = fragment.cluster.read(fragment.read_index);
        let sequence = read.strand_sequence(fragment.reverse).to_vec();
        let qualities = read.strand_quality(fragment.reverse).to_vec();
        let read_length = sequence.len();
        let position = fragment.position;
        if position < 0 || position as usize >= contig.len() {
            return 0;
        }

        let mut best: Option<(u32, usize, i32)> = None; // (mismatches, split, gap: +del/-ins)
        for split in 1..read_length {
            for gap in 1..=WIDEST_GAP_SIZE as i32 {
                for &signed_gap in &[gap, -gap] {
                    let mismatches =
                        Self::count_split_mismatches(&sequence, contig, position, split, signed_gap);
                    if let Some(m) = mismatches {
                        if best.map(|(bm, _, _)| m < bm).unwrap_or(true) {
                            best = Some((m, split, signed_gap));
                        }
                    }
                }
            }
        }

        let (mismatches, split, signed_gap) = match best {
            Some(b) if b.0 < fragment.mismatch_count => b,
            _ => return 0,
        };

        // rebuild the fragment state along the chosen walk
        fragment.cigar_offset = cigar_buffer.len();
        fragment.cigar_length = 0;
        fragment.mismatch_cycles.clear();
        fragment.mismatch_count = 0;
        fragment.matches_in_a_row = 0;
        fragment.log_probability = 0.0;
        fragment.edit_distance = 0;

        let mut run = 0u32;
        let mut matched = 0u32;
        let mut reference_pos = position as usize;
        let score = |fragment: &mut FragmentMetadata<'_>,
                         read_offset: usize,
                         reference_base: u8,
                         run: &mut u32,
                         matched: &mut u32| {
            let read_base = sequence[read_offset];
            let q = qualities[read_offset];
            if is_match(read_base, reference_base) {
                *run += 1;
                *matched += 1;
                fragment.matches_in_a_row = fragment.matches_in_a_row.max(*run);
                fragment.log_probability += quality::log_match(q);
                fragment.edit_distance += (read_base != reference_base) as u32;
            } else {
                *run = 0;
                fragment.add_mismatch_cycle(read_offset as u16 + 1);
                fragment.log_probability += quality::log_mismatch(q);
                fragment.edit_distance += 1;
            }
        };

        for read_offset in 0..split {
            score(
                &mut *fragment,
                read_offset,
                contig.forward[reference_pos],
                &mut run,
                &mut matched,
            );
            reference_pos += 1;
        }
        if signed_gap > 0 {
            reference_pos += signed_gap as usize;
            fragment.edit_distance += signed_gap as u32;
        } else {
            fragment.edit_distance += (-signed_gap) as u32;
            run = 0;
        }
        let resume = if signed_gap < 0 {
            split + (-signed_gap) as usize
        } else {
            split
        };
        for read_offset in resume..read_length {
            score(
                &mut *fragment,
                read_offset,
                contig.forward[reference_pos],
                &mut run,
                &mut matched,
            );
            reference_pos += 1;
        }

        if signed_gap > 0 {
            cigar_buffer.push(cigar::encode(split as u32, CigarOp::Align));
            cigar_buffer.push(cigar::encode(signed_gap as u32, CigarOp::Delete));
            cigar_buffer.push(cigar::encode((read_length - split) as u32, CigarOp::Align));
        } else {
            cigar_buffer.push(cigar::encode(split as u32, CigarOp::Align));
            cigar_buffer.push(cigar::encode((-signed_gap) as u32, CigarOp::Insert));
            cigar_buffer.push(cigar::encode(
                (read_length - resume) as u32,
                CigarOp::Align,
            ));
        }
        fragment.cigar_length = cigar_buffer.len() - fragment.cigar_offset;
        fragment.observed_length = (reference_pos - position as usize) as u32;
        fragment.gap_count = 1;
        fragment.mismatch_count = mismatches;
        fragment.smith_waterman_score = mismatches * SW_MISMATCH_WEIGHT
            + SW_GAP_OPEN_WEIGHT
            + signed_gap.unsigned_abs() * SW_GAP_EXTEND_WEIGHT;
        matched
    }

    /// Mismatch count of a split walk, or None when it leaves the contig.
    fn count_split_mismatches(
        sequence: &[u8],
        contig: &Contig,
        position: i64,
        split: usize,
        signed_gap: i32,
    ) -> Option<u32> {
        let read_length = sequence.len();
        let mut reference_pos = position as usize;
        let mut mismatches = 0u32;
        for &base in &sequence[..split] {
            let reference_base = *contig.forward.get(reference_pos)?;
            mismatches += !is_match(base, reference_base) as u32;
            reference_pos += 1;
        }
        let resume = if signed_gap > 0 {
            reference_pos += signed_gap as usize;
            split
        } else {
            let skipped = (-signed_gap) as usize;
            if split + skipped > read_length {
                return None;
            }
            split + skipped
        };
        for &base in &sequence[resume..] {
            let reference_base = *contig.forward.get(reference_pos)?;
            mismatches += !is_match(base, reference_base) as u32;
            reference_pos += 1;
        }
        Some(mismatches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{bcl_from_base, Cluster, Read};

    fn contig(sequence: &str) -> Contig {
        Contig {
            name: "chr1".to_string(),
            forward: sequence.as_bytes().to_vec(),
        }
    }

    fn single_read_cluster(sequence: &[u8]) -> Cluster {
        Cluster::new(
            1,
            0,
            vec![Read::new(
                sequence.iter().map(|&b| bcl_from_base(b, 35)).collect(),
            )],
        )
    }

    #[test]
    fn perfect_ungapped_alignment() {
        let contig = contig("AAAAACGTACGTACGTAAAAA");
        let cluster = single_read_cluster(b"CGTACGTACGT");
        let mut fragment = FragmentMetadata::new(&cluster, 0);
        fragment.contig_id = 0;
        fragment.position = 5;
        let mut cigar_buffer = Vec::new();
        assert!(UngappedAligner::align(&mut fragment, &mut cigar_buffer, &contig));
        assert_eq!(fragment.mismatch_count, 0);
        assert_eq!(fragment.edit_distance, 0);
        assert_eq!(fragment.observed_length, 11);
        assert_eq!(cigar::to_string(fragment.cigar(&cigar_buffer)), "11M");
        assert!(fragment.log_probability < 0.0);
    }

    #[test]
    fn negative_position_becomes_soft_clip() {
        let contig = contig("ACGTACGTACGT");
        let cluster = single_read_cluster(b"TTACGTAC");
        let mut fragment = FragmentMetadata::new(&cluster, 0);
        fragment.contig_id = 0;
        fragment.position = -2;
        let mut cigar_buffer = Vec::new();
        assert!(UngappedAligner::align(&mut fragment, &mut cigar_buffer, &contig));
        assert_eq!(fragment.position, 0);
        assert_eq!(cigar::to_string(fragment.cigar(&cigar_buffer)), "2S6M");
        assert_eq!(fragment.mismatch_count, 0);
    }

    #[test]
    fn contig_end_overhang_becomes_soft_clip() {
        let contig = contig("ACGTACGT");
        let cluster = single_read_cluster(b"ACGTTT");
        let mut fragment = FragmentMetadata::new(&cluster, 0);
        fragment.contig_id = 0;
        fragment.position = 4;
        let mut cigar_buffer = Vec::new();
        assert!(UngappedAligner::align(&mut fragment, &mut cigar_buffer, &contig));
        assert_eq!(cigar::to_string(fragment.cigar(&cigar_buffer)), "4M2S");
    }

    #[test]
    fn gapped_retry_finds_deletion() {
        //                  0123456789
        let contig = contig("ACGTACGTTTTCCCCAAAA");
        // read skips the TTT run: deletion of 3 in the middle
        let cluster = single_read_cluster(b"ACGTACGTCCCCAAAA");
        let mut fragment = FragmentMetadata::new(&cluster, 0);
        fragment.contig_id = 0;
        fragment.position = 0;
        let mut cigar_buffer = Vec::new();
        assert!(UngappedAligner::align(&mut fragment, &mut cigar_buffer, &contig));
        assert!(fragment.mismatch_count > 0);
        let matched = GappedAligner::align(&mut fragment, &mut cigar_buffer, &contig);
        assert_eq!(matched, 16);
        assert_eq!(fragment.mismatch_count, 0);
        assert_eq!(fragment.gap_count, 1);
        assert_eq!(fragment.edit_distance, 3);
        assert_eq!(
            cigar::to_string(fragment.cigar(&cigar_buffer)),
            "8M3D8M"
        );
        assert_eq!(fragment.observed_length, 19);
    }

    #[test]
    fn gapped_retry_finds_insertion() {
        let contig = contig("ACGTACGTCCCCAAAA");
        // read carries 2 extra bases after offset 8
        let cluster = single_read_cluster(b"ACGTACGTGGCCCCAAAA");
        let mut fragment = FragmentMetadata::new(&cluster, 0);
        fragment.contig_id = 0;
        fragment.position = 0;
        let mut cigar_buffer = Vec::new();
        UngappedAligner::align(&mut fragment, &mut cigar_buffer, &contig);
        let matched = GappedAligner::align(&mut fragment, &mut cigar_buffer, &contig);
        assert!(matched > 0);
        assert_eq!(
            cigar::to_string(fragment.cigar(&cigar_buffer)),
            "8M2I8M"
        );
        assert_eq!(fragment.edit_distance, 2);
        assert_eq!(fragment.observed_length, 16);
    }

    #[test]
    fn gapped_retry_declines_when_ungapped_is_clean() {
        let contig = contig("ACGTACGTACGTACGT");
        let cluster = single_read_cluster(b"ACGTACGTACGT");
        let mut fragment = FragmentMetadata::new(&cluster, 0);
        fragment.contig_id = 0;
        fragment.position = 0;
        let mut cigar_buffer = Vec::new();
        UngappedAligner::align(&mut fragment, &mut cigar_buffer, &contig);
        assert_eq!(GappedAligner::align(&mut fragment, &mut cigar_buffer, &contig), 0);
        assert_eq!(fragment.gap_count, 0);
    }
}
