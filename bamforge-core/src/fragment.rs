//! On-disk fragment records.
//!
//! Each record in a bin data file is a fixed 96-byte little-endian header
//! followed by the read's BCL bases and the CIGAR words:
//!
//! `total_length = HEADER_SIZE + read_length + 4 * cigar_length`
//!
//! The loader places records into one contiguous byte buffer and works on
//! them through [`FragmentRef`]/[`FragmentMut`] accessors over the raw
//! bytes; only the writer side materializes a [`FragmentHeader`] value.

use byteorder::{ByteOrder, LittleEndian};

use crate::cluster::pack_32_bcl_bases;
use crate::error::{BuildError, Result};
use crate::position::ReferencePosition;

pub const HEADER_SIZE: usize = 96;

/// Sentinel for an unknown ("dodgy") alignment score.
pub const DODGY_ALIGNMENT_SCORE: u16 = u16::MAX;

/// Guarantees uniqueness of the `(tile, cluster)` composition used for
/// tie-breaking; no tile ever holds this many clusters.
pub const CLUSTERS_PER_TILE_MAX: u64 = 1 << 40;

pub fn global_cluster_id(tile: u32, cluster_id: u64) -> u64 {
    tile as u64 * CLUSTERS_PER_TILE_MAX + cluster_id
}

/// Value ranking duplicate candidates: quality first, then covered bases,
/// then alignment score.
pub fn template_duplicate_rank(
    quality_sum: u32,
    total_read_length: u32,
    edit_distance: u32,
    alignment_score: u16,
) -> u64 {
    (quality_sum as u64) << 32
        | ((total_read_length.saturating_sub(edit_distance)) as u64) << 16
        | alignment_score as u64
}

/// Duplicate-grouping anchor: aligned reads anchor on their strand position,
/// shadows on their first 32 packed bases.
pub fn fragment_index_anchor(aligned: bool, strand_position: ReferencePosition, bcl: &[u8]) -> u64 {
    if aligned {
        strand_position.value()
    } else {
        pack_32_bcl_bases(bcl)
    }
}

pub const POSITION_NOT_SET: i32 = i32::MAX;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentFlags {
    pub paired: bool,
    pub unmapped: bool,
    pub mate_unmapped: bool,
    pub reverse: bool,
    pub mate_reverse: bool,
    pub first_read: bool,
    pub second_read: bool,
    pub fail_filter: bool,
    pub proper_pair: bool,
    pub duplicate: bool,
}

impl FragmentFlags {
    pub fn to_bits(self) -> u32 {
        (self.paired as u32)
            | (self.unmapped as u32) << 1
            | (self.mate_unmapped as u32) << 2
            | (self.reverse as u32) << 3
            | (self.mate_reverse as u32) << 4
            | (self.first_read as u32) << 5
            | (self.second_read as u32) << 6
            | (self.fail_filter as u32) << 7
            | (self.proper_pair as u32) << 8
            | (self.duplicate as u32) << 9
    }

    pub fn from_bits(bits: u32) -> Self {
        FragmentFlags {
            paired: bits & 1 != 0,
            unmapped: bits & (1 << 1) != 0,
            mate_unmapped: bits & (1 << 2) != 0,
            reverse: bits & (1 << 3) != 0,
            mate_reverse: bits & (1 << 4) != 0,
            first_read: bits & (1 << 5) != 0,
            second_read: bits & (1 << 6) != 0,
            fail_filter: bits & (1 << 7) != 0,
            proper_pair: bits & (1 << 8) != 0,
            duplicate: bits & (1 << 9) != 0,
        }
    }
}

/// Owned header, used when building records on the collector side.
#[derive(Debug, Clone)]
pub struct FragmentHeader {
    pub bam_tlen: i32,
    pub observed_length: u32,
    pub f_strand_position: ReferencePosition,
    pub low_clipped: u16,
    pub high_clipped: u16,
    pub alignment_score: u16,
    pub template_alignment_score: u16,
    pub mate_f_strand_position: ReferencePosition,
    pub read_length: u16,
    pub cigar_length: u16,
    pub gap_count: u16,
    pub edit_distance: u16,
    pub flags: FragmentFlags,
    pub tile: u32,
    pub barcode: u32,
    pub mate_storage_bin: u32,
    pub barcode_sequence: u64,
    pub cluster_id: u64,
    pub cluster_x: i32,
    pub cluster_y: i32,
    pub duplicate_cluster_rank: u64,
    pub mate_anchor: u64,
}

pub fn data_length(read_length: u16, cigar_length: u16) -> usize {
    read_length as usize + cigar_length as usize * 4
}

pub fn total_length(read_length: u16, cigar_length: u16) -> usize {
    HEADER_SIZE + data_length(read_length, cigar_length)
}

/// Largest record a read of the given length can occupy.
pub fn max_total_length(read_length: u32) -> usize {
    HEADER_SIZE + read_length as usize + crate::cigar::max_length_bytes(read_length)
}

impl FragmentHeader {
    pub fn total_length(&self) -> usize {
        total_length(self.read_length, self.cigar_length)
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(&mut buf[0..4], self.bam_tlen);
        LittleEndian::write_u32(&mut buf[4..8], self.observed_length);
        LittleEndian::write_u64(&mut buf[8..16], self.f_strand_position.value());
        LittleEndian::write_u16(&mut buf[16..18], self.low_clipped);
        LittleEndian::write_u16(&mut buf[18..20], self.high_clipped);
        LittleEndian::write_u16(&mut buf[20..22], self.alignment_score);
        LittleEndian::write_u16(&mut buf[22..24], self.template_alignment_score);
        LittleEndian::write_u64(&mut buf[24..32], self.mate_f_strand_position.value());
        LittleEndian::write_u16(&mut buf[32..34], self.read_length);
        LittleEndian::write_u16(&mut buf[34..36], self.cigar_length);
        LittleEndian::write_u16(&mut buf[36..38], self.gap_count);
        LittleEndian::write_u16(&mut buf[38..40], self.edit_distance);
        LittleEndian::write_u32(&mut buf[40..44], self.flags.to_bits());
        LittleEndian::write_u32(&mut buf[44..48], self.tile);
        LittleEndian::write_u32(&mut buf[48..52], self.barcode);
        LittleEndian::write_u32(&mut buf[52..56], self.mate_storage_bin);
        LittleEndian::write_u64(&mut buf[56..64], self.barcode_sequence);
        LittleEndian::write_u64(&mut buf[64..72], self.cluster_id);
        LittleEndian::write_i32(&mut buf[72..76], self.cluster_x);
        LittleEndian::write_i32(&mut buf[76..80], self.cluster_y);
        LittleEndian::write_u64(&mut buf[80..88], self.duplicate_cluster_rank);
        LittleEndian::write_u64(&mut buf[88..96], self.mate_anchor);
    }

    pub fn read_from(buf: &[u8]) -> Result<FragmentHeader> {
        if buf.len() < HEADER_SIZE {
            return Err(BuildError::Format(format!(
                "truncated fragment header: {} of {} bytes",
                buf.len(),
                HEADER_SIZE
            )));
        }
        Ok(FragmentHeader {
            bam_tlen: LittleEndian::read_i32(&buf[0..4]),
            observed_length: LittleEndian::read_u32(&buf[4..8]),
            f_strand_position: ReferencePosition::from_value(LittleEndian::read_u64(&buf[8..16])),
            low_clipped: LittleEndian::read_u16(&buf[16..18]),
            high_clipped: LittleEndian::read_u16(&buf[18..20]),
            alignment_score: LittleEndian::read_u16(&buf[20..22]),
            template_alignment_score: LittleEndian::read_u16(&buf[22..24]),
            mate_f_strand_position: ReferencePosition::from_value(LittleEndian::read_u64(
                &buf[24..32],
            )),
            read_length: LittleEndian::read_u16(&buf[32..34]),
            cigar_length: LittleEndian::read_u16(&buf[34..36]),
            gap_count: LittleEndian::read_u16(&buf[36..38]),
            edit_distance: LittleEndian::read_u16(&buf[38..40]),
            flags: FragmentFlags::from_bits(LittleEndian::read_u32(&buf[40..44])),
            tile: LittleEndian::read_u32(&buf[44..48]),
            barcode: LittleEndian::read_u32(&buf[48..52]),
            mate_storage_bin: LittleEndian::read_u32(&buf[52..56]),
            barcode_sequence: LittleEndian::read_u64(&buf[56..64]),
            cluster_id: LittleEndian::read_u64(&buf[64..72]),
            cluster_x: LittleEndian::read_i32(&buf[72..76]),
            cluster_y: LittleEndian::read_i32(&buf[76..80]),
            duplicate_cluster_rank: LittleEndian::read_u64(&buf[80..88]),
            mate_anchor: LittleEndian::read_u64(&buf[88..96]),
        })
    }
}

/// Read-only accessor over one serialized record.
#[derive(Clone, Copy)]
pub struct FragmentRef<'a> {
    bytes: &'a [u8],
}

macro_rules! le_field {
    ($name:ident, u16, $lo:expr) => {
        pub fn $name(&self) -> u16 {
            LittleEndian::read_u16(&self.bytes[$lo..$lo + 2])
        }
    };
    ($name:ident, u32, $lo:expr) => {
        pub fn $name(&self) -> u32 {
            LittleEndian::read_u32(&self.bytes[$lo..$lo + 4])
        }
    };
    ($name:ident, i32, $lo:expr) => {
        pub fn $name(&self) -> i32 {
            LittleEndian::read_i32(&self.bytes[$lo..$lo + 4])
        }
    };
    ($name:ident, u64, $lo:expr) => {
        pub fn $name(&self) -> u64 {
            LittleEndian::read_u64(&self.bytes[$lo..$lo + 8])
        }
    };
}

impl<'a> FragmentRef<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        debug_assert!(bytes.len() >= HEADER_SIZE);
        FragmentRef { bytes }
    }

    le_field!(bam_tlen, i32, 0);
    le_field!(observed_length, u32, 4);
    le_field!(low_clipped, u16, 16);
    le_field!(high_clipped, u16, 18);
    le_field!(alignment_score, u16, 20);
    le_field!(template_alignment_score, u16, 22);
    le_field!(read_length, u16, 32);
    le_field!(cigar_length, u16, 34);
    le_field!(gap_count, u16, 36);
    le_field!(edit_distance, u16, 38);
    le_field!(tile, u32, 44);
    le_field!(barcode, u32, 48);
    le_field!(mate_storage_bin, u32, 52);
    le_field!(barcode_sequence, u64, 56);
    le_field!(cluster_id, u64, 64);
    le_field!(cluster_x, i32, 72);
    le_field!(cluster_y, i32, 76);
    le_field!(duplicate_cluster_rank, u64, 80);
    le_field!(mate_anchor, u64, 88);

    pub fn f_strand_position(&self) -> ReferencePosition {
        ReferencePosition::from_value(LittleEndian::read_u64(&self.bytes[8..16]))
    }

    pub fn mate_f_strand_position(&self) -> ReferencePosition {
        ReferencePosition::from_value(LittleEndian::read_u64(&self.bytes[24..32]))
    }

    pub fn flags(&self) -> FragmentFlags {
        FragmentFlags::from_bits(LittleEndian::read_u32(&self.bytes[40..44]))
    }

    pub fn is_aligned(&self) -> bool {
        !self.flags().unmapped
    }

    pub fn is_mate_aligned(&self) -> bool {
        !self.flags().mate_unmapped
    }

    pub fn is_reverse(&self) -> bool {
        self.flags().reverse
    }

    pub fn is_cluster_xy_set(&self) -> bool {
        self.cluster_x() != POSITION_NOT_SET
    }

    pub fn total_length(&self) -> usize {
        total_length(self.read_length(), self.cigar_length())
    }

    /// Position of the last aligned base of the fragment.
    pub fn r_strand_position(&self) -> ReferencePosition {
        // observed length can be zero when a CIGAR is soft-clipped to death
        self.f_strand_position()
            .add(self.observed_length().max(1) as u64 - 1)
    }

    /// The 5' anchor: forward-strand position for forward reads, last
    /// aligned base for reverse reads.
    pub fn strand_position(&self) -> ReferencePosition {
        if self.is_reverse() {
            self.r_strand_position()
        } else {
            self.f_strand_position()
        }
    }

    pub fn global_cluster_id(&self) -> u64 {
        global_cluster_id(self.tile(), self.cluster_id())
    }

    pub fn bases(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..HEADER_SIZE + self.read_length() as usize]
    }

    pub fn cigar_bytes(&self) -> &'a [u8] {
        let begin = HEADER_SIZE + self.read_length() as usize;
        &self.bytes[begin..begin + self.cigar_length() as usize * 4]
    }

    pub fn cigar(&self) -> Vec<u32> {
        self.cigar_bytes()
            .chunks_exact(4)
            .map(LittleEndian::read_u32)
            .collect()
    }

    pub fn index_anchor(&self) -> u64 {
        fragment_index_anchor(self.is_aligned(), self.strand_position(), self.bases())
    }
}

/// Mutable accessor: the subset of fields the dedup/realign/clip stages
/// rewrite in place.
pub struct FragmentMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> FragmentMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        debug_assert!(bytes.len() >= HEADER_SIZE);
        FragmentMut { bytes }
    }

    pub fn as_ref(&self) -> FragmentRef<'_> {
        FragmentRef::new(self.bytes)
    }

    pub fn set_bam_tlen(&mut self, tlen: i32) {
        LittleEndian::write_i32(&mut self.bytes[0..4], tlen);
    }

    pub fn set_observed_length(&mut self, length: u32) {
        LittleEndian::write_u32(&mut self.bytes[4..8], length);
    }

    pub fn set_f_strand_position(&mut self, pos: ReferencePosition) {
        LittleEndian::write_u64(&mut self.bytes[8..16], pos.value());
    }

    pub fn set_mate_f_strand_position(&mut self, pos: ReferencePosition) {
        LittleEndian::write_u64(&mut self.bytes[24..32], pos.value());
    }

    pub fn set_gap_count(&mut self, gaps: u16) {
        LittleEndian::write_u16(&mut self.bytes[36..38], gaps);
    }

    pub fn set_edit_distance(&mut self, edit_distance: u16) {
        LittleEndian::write_u16(&mut self.bytes[38..40], edit_distance);
    }

    pub fn set_mate_storage_bin(&mut self, bin: u32) {
        LittleEndian::write_u32(&mut self.bytes[52..56], bin);
    }

    pub fn set_duplicate(&mut self, duplicate: bool) {
        let mut flags = self.as_ref().flags();
        flags.duplicate = duplicate;
        LittleEndian::write_u32(&mut self.bytes[40..44], flags.to_bits());
    }
}
