//! The in-memory byte buffer holding one bin's records, plus the index
//! entries the compute stages work through.
//!
//! An index entry never owns CIGAR storage: it either points back at the
//! record's own CIGAR words or carries a range into the bin-wide realigned
//! CIGAR arena. The record's own CIGAR stays untouched by realignment so the
//! original alignment remains available for the OC tag.

use std::borrow::Cow;
use std::cmp::Ordering;

use crate::cigar::{self, CigarOp};
use crate::fragment::{FragmentMut, FragmentRef};
use crate::position::ReferencePosition;

/// Where an index entry's current CIGAR lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarSource {
    /// the record's own serialized CIGAR
    Fragment,
    /// a range in the realigned-CIGAR arena
    Arena { begin: usize, end: usize },
}

/// Working reference to one record of the packed buffer.
#[derive(Debug, Clone, Copy)]
pub struct Index {
    /// Copy of the fragment's f-strand position. Kept in sync with the
    /// record when realignment moves it.
    pub pos: ReferencePosition,
    pub data_offset: usize,
    /// Same as `data_offset` for single-ended records.
    pub mate_data_offset: usize,
    pub cigar: CigarSource,
}

impl Index {
    pub fn new(pos: ReferencePosition, data_offset: usize, mate_data_offset: usize) -> Self {
        Index {
            pos,
            data_offset,
            mate_data_offset,
            cigar: CigarSource::Fragment,
        }
    }

    pub fn has_mate(&self) -> bool {
        self.mate_data_offset != self.data_offset
    }

    /// The entry's current CIGAR, resolved against the buffer and arena.
    pub fn resolve_cigar<'b>(
        &self,
        buffer: &PackedFragmentBuffer,
        arena: &'b [u32],
    ) -> Cow<'b, [u32]> {
        match self.cigar {
            CigarSource::Fragment => Cow::Owned(buffer.fragment(self.data_offset).cigar()),
            CigarSource::Arena { begin, end } => Cow::Borrowed(&arena[begin..end]),
        }
    }

    pub fn is_realigned(&self) -> bool {
        matches!(self.cigar, CigarSource::Arena { .. })
    }

    pub fn begin_clipped_length(&self, buffer: &PackedFragmentBuffer, arena: &[u32]) -> u32 {
        match self
            .resolve_cigar(buffer, arena)
            .first()
            .map(|&word| cigar::decode(word))
        {
            Some((length, CigarOp::SoftClip)) => length,
            _ => 0,
        }
    }

    /// The position the alignment would have without its leading soft clip.
    pub fn unclipped_position(
        &self,
        buffer: &PackedFragmentBuffer,
        arena: &[u32],
    ) -> Option<ReferencePosition> {
        self.pos
            .checked_sub(self.begin_clipped_length(buffer, arena) as u64)
    }
}

/// Owns the raw bytes of one bin.
#[derive(Default)]
pub struct PackedFragmentBuffer {
    data: Vec<u8>,
}

impl PackedFragmentBuffer {
    pub fn with_size(size: usize) -> Self {
        PackedFragmentBuffer {
            data: vec![0u8; size],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        PackedFragmentBuffer { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn fragment(&self, offset: usize) -> FragmentRef<'_> {
        FragmentRef::new(&self.data[offset..])
    }

    pub fn fragment_mut(&mut self, offset: usize) -> FragmentMut<'_> {
        FragmentMut::new(&mut self.data[offset..])
    }

    pub fn mate_of(&self, index: &Index) -> FragmentRef<'_> {
        self.fragment(index.mate_data_offset)
    }

    /// BAM output order: by position, then by global cluster id so pairs at
    /// the same spot group, unmapped after mapped, and the second read after
    /// the first to keep byte output identical across runs.
    pub fn order_for_bam(&self, left: &Index, right: &Index) -> Ordering {
        left.pos.cmp(&right.pos).then_with(|| {
            let left_fragment = self.fragment(left.data_offset);
            let right_fragment = self.fragment(right.data_offset);
            left_fragment
                .global_cluster_id()
                .cmp(&right_fragment.global_cluster_id())
                .then_with(|| {
                    let left_flags = left_fragment.flags();
                    let right_flags = right_fragment.flags();
                    left_flags
                        .unmapped
                        .cmp(&right_flags.unmapped)
                        .then(left_flags.second_read.cmp(&right_flags.second_read))
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{FragmentFlags, FragmentHeader, HEADER_SIZE};

    fn store_record(
        buffer: &mut Vec<u8>,
        pos: ReferencePosition,
        cluster_id: u64,
        unmapped: bool,
        second_read: bool,
    ) -> usize {
        let header = FragmentHeader {
            bam_tlen: 0,
            observed_length: 10,
            f_strand_position: pos,
            low_clipped: 0,
            high_clipped: 0,
            alignment_score: 1,
            template_alignment_score: 1,
            mate_f_strand_position: pos,
            read_length: 0,
            cigar_length: 0,
            gap_count: 0,
            edit_distance: 0,
            flags: FragmentFlags {
                paired: true,
                unmapped,
                second_read,
                first_read: !second_read,
                ..Default::default()
            },
            tile: 1,
            barcode: 0,
            mate_storage_bin: 0,
            barcode_sequence: 0,
            cluster_id,
            cluster_x: 0,
            cluster_y: 0,
            duplicate_cluster_rank: 0,
            mate_anchor: 0,
        };
        let offset = buffer.len();
        buffer.resize(offset + HEADER_SIZE, 0);
        header.write_to(&mut buffer[offset..]);
        offset
    }

    #[test]
    fn bam_order_is_a_strict_weak_order_on_random_records() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut bytes = Vec::new();
        let mut indexes = Vec::new();
        for _ in 0..60 {
            let pos = ReferencePosition::new(0, rng.gen_range(0..4i64));
            let offset = store_record(
                &mut bytes,
                pos,
                rng.gen_range(0..4u64),
                rng.gen_bool(0.3),
                rng.gen_bool(0.5),
            );
            indexes.push(Index::new(pos, offset, offset));
        }
        let buffer = PackedFragmentBuffer { data: bytes };

        for a in &indexes {
            assert_eq!(buffer.order_for_bam(a, a), Ordering::Equal);
        }
        for a in &indexes {
            for b in &indexes {
                let ab = buffer.order_for_bam(a, b);
                assert_eq!(ab, buffer.order_for_bam(b, a).reverse());
                for c in &indexes {
                    if ab == Ordering::Less && buffer.order_for_bam(b, c) == Ordering::Less {
                        assert_eq!(buffer.order_for_bam(a, c), Ordering::Less);
                    }
                }
            }
        }
    }

    #[test]
    fn unmapped_sorts_after_mapped_at_same_position() {
        let mut bytes = Vec::new();
        let pos = ReferencePosition::new(0, 100);
        let mapped = store_record(&mut bytes, pos, 9, false, false);
        let shadow = store_record(&mut bytes, pos, 9, true, true);
        let buffer = PackedFragmentBuffer { data: bytes };
        let mapped = Index::new(pos, mapped, shadow);
        let shadow = Index::new(pos, shadow, mapped.data_offset);
        assert_eq!(buffer.order_for_bam(&mapped, &shadow), Ordering::Less);
        assert!(mapped.has_mate());
    }
}
