//! Soft-clipping of semialigned read ends.
//!
//! A read end that cannot produce five consecutive matches against the
//! reference is noise; the mismatch run is folded into the adjacent soft
//! clip rather than left to inflate the edit distance. Clipping never
//! consumes a whole ALIGN operation: the five-match run that stops the scan
//! always stays aligned.

use crate::alignment::clip_mismatches;
use crate::build::packed_buffer::{CigarSource, Index, PackedFragmentBuffer};
use crate::cigar::{self, CigarOp};
use crate::cluster::bcl_base_char;
use crate::position::ReferencePosition;
use crate::types::Contig;

pub const CONSECUTIVE_MATCHES_MIN: u32 = 5;

pub struct SemialignedEndsClipper;

impl SemialignedEndsClipper {
    /// Clips both ends of an aligned record. Left-side clipping moves the
    /// position (never to or past the bin end); an unaligned shadow mate
    /// piggybacking on this record's position inherits the move.
    pub fn clip(
        contigs: &[Contig],
        bin_end: ReferencePosition,
        index: &mut Index,
        buffer: &mut PackedFragmentBuffer,
        arena: &mut Vec<u32>,
    ) {
        debug_assert!(
            buffer.fragment(index.data_offset).is_aligned(),
            "clipping an unaligned record"
        );
        let left = Self::clip_left(contigs, bin_end, index, buffer, arena);
        let right = Self::clip_right(contigs, index, buffer, arena);
        if left || right {
            log::trace!("semialigned ends clipped at {:?}", index.pos);
        }
    }

    fn clip_left(
        contigs: &[Contig],
        bin_end: ReferencePosition,
        index: &mut Index,
        buffer: &mut PackedFragmentBuffer,
        arena: &mut Vec<u32>,
    ) -> bool {
        let words = index.resolve_cigar(buffer, arena).into_owned();
        let mut at = 0usize;
        let mut soft_clipped = 0u32;
        if let Some((length, CigarOp::SoftClip)) = words.first().map(|&w| cigar::decode(w)) {
            soft_clipped = length;
            at = 1;
        }
        let mapped = match words.get(at).map(|&w| cigar::decode(w)) {
            Some((length, CigarOp::Align)) => length,
            _ => return false,
        };

        let contig = &contigs[index.pos.contig_id() as usize];
        let fragment = buffer.fragment(index.data_offset);
        let sequence = fragment
            .bases()
            .iter()
            .skip(soft_clipped as usize)
            .take(mapped as usize)
            .map(|&b| bcl_base_char(b));
        let reference = contig.forward[index.pos.offset() as usize..].iter().copied();
        let (clipped, edit_removed) =
            clip_mismatches::<CONSECUTIVE_MATCHES_MIN>(sequence, reference);
        if clipped == 0 || index.pos.add(clipped as u64) >= bin_end {
            return false;
        }

        let begin = arena.len();
        arena.push(cigar::encode(soft_clipped + clipped, CigarOp::SoftClip));
        arena.push(cigar::encode(mapped - clipped, CigarOp::Align));
        arena.extend_from_slice(&words[at + 1..]);
        index.cigar = CigarSource::Arena {
            begin,
            end: arena.len(),
        };
        let new_pos = index.pos.add(clipped as u64);
        index.pos = new_pos;

        let (observed, edit) = {
            let fragment = buffer.fragment(index.data_offset);
            (fragment.observed_length(), fragment.edit_distance())
        };
        {
            let mut fragment = buffer.fragment_mut(index.data_offset);
            fragment.set_f_strand_position(new_pos);
            fragment.set_observed_length(observed - clipped);
            fragment.set_edit_distance(edit.saturating_sub(edit_removed as u16));
        }
        if index.has_mate() {
            let mate_unmapped = buffer.mate_of(index).flags().unmapped;
            if mate_unmapped {
                // the shadow sits at this record's position; move it along
                let mut mate = buffer.fragment_mut(index.mate_data_offset);
                mate.set_f_strand_position(new_pos);
                mate.set_mate_f_strand_position(new_pos);
                buffer
                    .fragment_mut(index.data_offset)
                    .set_mate_f_strand_position(new_pos);
            }
        }
        true
    }

    fn clip_right(
        contigs: &[Contig],
        index: &mut Index,
        buffer: &mut PackedFragmentBuffer,
        arena: &mut Vec<u32>,
    ) -> bool {
        let words = index.resolve_cigar(buffer, arena).into_owned();
        let mut end = words.len();
        let mut soft_clipped = 0u32;
        if let Some((length, CigarOp::SoftClip)) = words.last().map(|&w| cigar::decode(w)) {
            if words.len() > 1 {
                soft_clipped = length;
                end -= 1;
            }
        }
        let mapped = match end.checked_sub(1).and_then(|at| words.get(at)).map(|&w| cigar::decode(w))
        {
            Some((length, CigarOp::Align)) => length,
            _ => return false,
        };

        let contig = &contigs[index.pos.contig_id() as usize];
        let fragment = buffer.fragment(index.data_offset);
        let observed = fragment.observed_length();
        let sequence = fragment
            .bases()
            .iter()
            .rev()
            .skip(soft_clipped as usize)
            .take(mapped as usize)
            .map(|&b| bcl_base_char(b));
        let reference_end = index.pos.offset() as usize + observed as usize;
        let reference = contig.forward[..reference_end].iter().rev().copied();
        let (clipped, edit_removed) =
            clip_mismatches::<CONSECUTIVE_MATCHES_MIN>(sequence, reference);
        if clipped == 0 {
            return false;
        }

        let begin = arena.len();
        arena.extend_from_slice(&words[..end - 1]);
        arena.push(cigar::encode(mapped - clipped, CigarOp::Align));
        arena.push(cigar::encode(soft_clipped + clipped, CigarOp::SoftClip));
        index.cigar = CigarSource::Arena {
            begin,
            end: arena.len(),
        };

        let edit = buffer.fragment(index.data_offset).edit_distance();
        let mut fragment = buffer.fragment_mut(index.data_offset);
        fragment.set_observed_length(observed - clipped);
        fragment.set_edit_distance(edit.saturating_sub(edit_removed as u16));
        true
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
            gap_count: 0,
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
    fn clips_leading_mismatch_run() {
        let reference = b"TTTTTTTTTTACGTACGTACGTACGTACGTAC";
        let contig = contig(reference);
        // first three bases mismatch, the rest matches
        let mut read = reference[10..30].to_vec();
        read[0] = b'G';
        read[1] = b'G';
        read[2] = b'A';
        let pos = ReferencePosition::new(0, 10);
        let words = vec![cigar::encode(20, CigarOp::Align)];
        let mut bytes = Vec::new();
        let offset = store_record(&mut bytes, pos, &read, &words, 3);
        let mut buffer = PackedFragmentBuffer::from_bytes(bytes);
        let mut index = Index::new(pos, offset, offset);
        let mut arena = Vec::new();

        SemialignedEndsClipper::clip(
            std::slice::from_ref(&contig),
            ReferencePosition::new(0, 1000),
            &mut index,
            &mut buffer,
            &mut arena,
        );
        let new_cigar = index.resolve_cigar(&buffer, &arena).into_owned();
        assert_eq!(cigar::to_string(&new_cigar), "3S17M");
        assert_eq!(index.pos, ReferencePosition::new(0, 13));
        let fragment = buffer.fragment(offset);
        assert_eq!(fragment.f_strand_position(), index.pos);
        assert_eq!(fragment.edit_distance(), 0);
        assert_eq!(fragment.observed_length(), 17);
    }

    #[test]
    fn clips_trailing_mismatch_run_extending_existing_soft_clip() {
        let reference = b"ACGTACGTACGTACGTACGTACGGCATGCATG";
        let contig = contig(reference);
        let mut read = reference[0..22].to_vec();
        read[19] = b'A';
        // trailing 2 bases already soft-clipped
        let words = vec![
            cigar::encode(20, CigarOp::Align),
            cigar::encode(2, CigarOp::SoftClip),
        ];
        let pos = ReferencePosition::new(0, 0);
        let mut bytes = Vec::new();
        let offset = store_record(&mut bytes, pos, &read, &words, 1);
        let mut buffer = PackedFragmentBuffer::from_bytes(bytes);
        let mut index = Index::new(pos, offset, offset);
        let mut arena = Vec::new();

        SemialignedEndsClipper::clip(
            std::slice::from_ref(&contig),
            ReferencePosition::new(0, 1000),
            &mut index,
            &mut buffer,
            &mut arena,
        );
        let new_cigar = index.resolve_cigar(&buffer, &arena).into_owned();
        assert_eq!(cigar::to_string(&new_cigar), "19M3S");
        assert_eq!(index.pos, pos);
        assert_eq!(buffer.fragment(offset).edit_distance(), 0);
    }

    #[test]
    fn clean_alignment_is_untouched() {
        let reference = b"ACGTACGTACGTACGTACGTACGTACGTACGT";
        let contig = contig(reference);
        let read = reference[4..24].to_vec();
        let pos = ReferencePosition::new(0, 4);
        let words = vec![cigar::encode(20, CigarOp::Align)];
        let mut bytes = Vec::new();
        let offset = store_record(&mut bytes, pos, &read, &words, 0);
        let mut buffer = PackedFragmentBuffer::from_bytes(bytes);
        let mut index = Index::new(pos, offset, offset);
        let mut arena = Vec::new();

        SemialignedEndsClipper::clip(
            std::slice::from_ref(&contig),
            ReferencePosition::new(0, 1000),
            &mut index,
            &mut buffer,
            &mut arena,
        );
        assert!(!index.is_realigned());
        assert_eq!(index.pos, pos);
    }
}
