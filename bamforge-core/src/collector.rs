//! Fragment collection: turning built templates into binned on-disk records.
//!
//! The buffer reserves one fixed-width slot per `(cluster, read)` so threads
//! filling distinct clusters never touch overlapping byte ranges. A slot
//! holds the serialized header, the BCL bases (reverse-complemented for
//! reverse alignments) and the CIGAR words. After all clusters are in, the
//! index is ordered for binning and the records stream out to the per-bin
//! data and index side files.

use std::cmp::Ordering;
use std::fs::OpenOptions;
use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::alignment::FragmentMetadata;
use crate::bin_metadata::{BinIndexMap, BinMetadata};
use crate::build::fragment_index::{
    FStrandFragmentIndex, FragmentIndexMate, RStrandOrShadowFragmentIndex, SeFragmentIndex,
};
use crate::cluster::reverse_bcl;
use crate::error::{BuildError, Result};
use crate::fragment::{
    self, fragment_index_anchor, template_duplicate_rank, FragmentFlags, FragmentHeader,
    POSITION_NOT_SET,
};
use crate::position::ReferencePosition;
use crate::template::BamTemplate;

/// TLEN as defined by SAM v1.4, including the historical sign convention:
/// the distance is negative when this fragment begins after its mate, and
/// also when both begin at the same position and this is not the first read.
pub fn bam_tlen(
    fragment_begin: ReferencePosition,
    fragment_end: ReferencePosition,
    mate_begin: ReferencePosition,
    mate_end: ReferencePosition,
    first_read: bool,
) -> i32 {
    // TLEN is one less than the number of positions the template covers
    let distance =
        (fragment_end.max(mate_end).value() - fragment_begin.min(mate_begin).value()) as i64 - 1;
    let signed = if fragment_begin < mate_begin {
        distance
    } else if fragment_begin > mate_begin || !first_read {
        -distance
    } else {
        distance
    };
    signed as i32
}

fn template_tlen(fragment: &FragmentMetadata<'_>, mate: &FragmentMetadata<'_>) -> i32 {
    if fragment.is_aligned() || mate.is_aligned() {
        bam_tlen(
            fragment.begin_position(),
            fragment.end_position(),
            mate.begin_position(),
            mate.end_position(),
            fragment.read_index == 0,
        )
    } else {
        0
    }
}

fn paired_header(
    template: &BamTemplate<'_>,
    fragment: &FragmentMetadata<'_>,
    mate: &FragmentMetadata<'_>,
    barcode: u32,
    mate_storage_bin: u32,
) -> FragmentHeader {
    let cluster = fragment.cluster;
    let dodgy = fragment::DODGY_ALIGNMENT_SCORE;
    let fragment_score = fragment
        .alignment_score
        .map(|s| s.min(dodgy as u32 - 1) as u16)
        .unwrap_or(dodgy);
    let template_score = if template.is_proper_pair() {
        template
            .alignment_score()
            .map(|s| s.min(dodgy as u32 - 1) as u16)
            .unwrap_or(dodgy)
    } else {
        fragment_score
    };
    FragmentHeader {
        bam_tlen: template_tlen(fragment, mate),
        observed_length: if fragment.is_aligned() {
            fragment.observed_length
        } else {
            0
        },
        f_strand_position: if fragment.is_aligned() {
            fragment.f_strand_position()
        } else {
            mate.f_strand_position()
        },
        low_clipped: fragment.low_clipped,
        high_clipped: fragment.high_clipped,
        alignment_score: fragment_score,
        template_alignment_score: template_score,
        mate_f_strand_position: if mate.is_aligned() {
            mate.f_strand_position()
        } else {
            fragment.f_strand_position()
        },
        read_length: fragment.read_length() as u16,
        cigar_length: fragment.cigar_length as u16,
        gap_count: fragment.gap_count as u16,
        edit_distance: fragment.edit_distance as u16,
        flags: FragmentFlags {
            paired: true,
            unmapped: !fragment.is_aligned(),
            mate_unmapped: !mate.is_aligned(),
            reverse: fragment.reverse,
            mate_reverse: mate.reverse,
            first_read: fragment.read_index == 0,
            second_read: fragment.read_index == 1,
            fail_filter: !cluster.pf,
            proper_pair: template.is_proper_pair(),
            duplicate: false,
        },
        tile: cluster.tile,
        barcode,
        mate_storage_bin,
        barcode_sequence: cluster.barcode_sequence,
        cluster_id: cluster.id,
        cluster_x: cluster.x.unwrap_or(POSITION_NOT_SET),
        cluster_y: cluster.y.unwrap_or(POSITION_NOT_SET),
        duplicate_cluster_rank: template_duplicate_rank(
            template.quality_sum(),
            template.total_read_length(),
            template.edit_distance(),
            template
                .alignment_score()
                .map(|s| s.min(u16::MAX as u32) as u16)
                .unwrap_or(0),
        ),
        mate_anchor: fragment_index_anchor(
            mate.is_aligned(),
            mate.strand_position(),
            mate.cluster.read(mate.read_index).bcl(),
        ),
    }
}

fn single_header(
    fragment: &FragmentMetadata<'_>,
    barcode: u32,
) -> FragmentHeader {
    let cluster = fragment.cluster;
    let dodgy = fragment::DODGY_ALIGNMENT_SCORE;
    let score = fragment
        .alignment_score
        .map(|s| s.min(dodgy as u32 - 1) as u16)
        .unwrap_or(dodgy);
    FragmentHeader {
        // TLEN is zero for single-ended templates
        bam_tlen: 0,
        observed_length: if fragment.is_aligned() {
            fragment.observed_length
        } else {
            0
        },
        f_strand_position: fragment.f_strand_position(),
        low_clipped: fragment.low_clipped,
        high_clipped: fragment.high_clipped,
        alignment_score: score,
        template_alignment_score: score,
        mate_f_strand_position: ReferencePosition::NO_MATCH,
        read_length: fragment.read_length() as u16,
        cigar_length: fragment.cigar_length as u16,
        gap_count: fragment.gap_count as u16,
        edit_distance: fragment.edit_distance as u16,
        flags: FragmentFlags {
            paired: false,
            unmapped: !fragment.is_aligned(),
            mate_unmapped: true,
            reverse: fragment.reverse,
            first_read: true,
            second_read: true,
            fail_filter: !cluster.pf,
            ..Default::default()
        },
        tile: cluster.tile,
        barcode,
        mate_storage_bin: 0,
        barcode_sequence: cluster.barcode_sequence,
        cluster_id: cluster.id,
        cluster_x: cluster.x.unwrap_or(POSITION_NOT_SET),
        cluster_y: cluster.y.unwrap_or(POSITION_NOT_SET),
        duplicate_cluster_rank: 0,
        mate_anchor: 0,
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexRecord {
    f_strand_pos: ReferencePosition,
    /// slot byte offset; None until the record is initialized
    data_offset: Option<usize>,
    record_length: usize,
}

/// Fixed-slot buffer of serialized records for one batch of clusters.
pub struct FragmentBuffer {
    record_length: usize,
    read_offsets: Vec<usize>,
    cluster_count: usize,
    index: Vec<IndexRecord>,
    data: Vec<u8>,
}

impl FragmentBuffer {
    pub fn new(cluster_count: usize, read_lengths: &[u32]) -> Self {
        debug_assert!((1..=2).contains(&read_lengths.len()));
        let mut read_offsets = vec![0usize];
        if read_lengths.len() == 2 {
            read_offsets.push(fragment::max_total_length(read_lengths[0]));
        }
        let record_length: usize = read_lengths
            .iter()
            .map(|&len| fragment::max_total_length(len))
            .sum();
        debug!(
            "fragment buffer for {} clusters, record length {}",
            cluster_count, record_length
        );
        FragmentBuffer {
            record_length,
            read_offsets,
            cluster_count,
            index: vec![
                IndexRecord {
                    f_strand_pos: ReferencePosition::NO_MATCH,
                    data_offset: None,
                    record_length: 0,
                };
                cluster_count * read_lengths.len()
            ],
            data: vec![0u8; cluster_count * record_length],
        }
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    fn slot_offset(&self, cluster_id: u64, read_index: usize) -> usize {
        cluster_id as usize * self.record_length + self.read_offsets[read_index]
    }

    /// Claims the slot for `(cluster, read)`. The slot address is a pure
    /// function of the pair, so concurrent writers of distinct clusters
    /// never overlap; claiming a slot twice is a bug in the caller.
    fn initialize(
        &mut self,
        cluster_id: u64,
        read_index: usize,
        f_strand_pos: ReferencePosition,
        record_length: usize,
    ) -> usize {
        let at = cluster_id as usize * self.read_offsets.len() + read_index;
        debug_assert!(
            self.index[at].data_offset.is_none(),
            "cluster {} read {} initialized twice",
            cluster_id,
            read_index
        );
        let offset = self.slot_offset(cluster_id, read_index);
        self.index[at] = IndexRecord {
            f_strand_pos,
            data_offset: Some(offset),
            record_length,
        };
        offset
    }

    /// Serializes one fragment of a built template into its slot.
    pub fn add(
        &mut self,
        template: &BamTemplate<'_>,
        fragment_index: usize,
        barcode: u32,
        bin_index_map: &BinIndexMap,
        cigar_buffer: &[u32],
    ) {
        let fragment = template.fragment(fragment_index);
        let header = if template.fragment_count() == 2 {
            let mate = template.mate_of(fragment_index);
            let mate_storage_bin = if fragment.is_no_match() {
                debug_assert!(mate.is_no_match(), "mate of a no-match must be a no-match");
                0
            } else {
                bin_index_map.bin_index(mate.f_strand_position())
            };
            paired_header(template, fragment, mate, barcode, mate_storage_bin)
        } else {
            single_header(fragment, barcode)
        };
        self.store(fragment, &header, cigar_buffer);
    }

    fn store(
        &mut self,
        fragment: &FragmentMetadata<'_>,
        header: &FragmentHeader,
        cigar_buffer: &[u32],
    ) {
        let record_length = header.total_length();
        let offset = self.initialize(
            fragment.cluster.id,
            fragment.read_index,
            header.f_strand_position,
            record_length,
        );
        let slot = &mut self.data[offset..offset + record_length];
        header.write_to(slot);
        let bcl = fragment.cluster.read(fragment.read_index).bcl();
        let bases = &mut slot[fragment::HEADER_SIZE..fragment::HEADER_SIZE + bcl.len()];
        if fragment.reverse {
            for (dst, &src) in bases.iter_mut().zip(bcl.iter().rev()) {
                *dst = reverse_bcl(src);
            }
        } else {
            bases.copy_from_slice(bcl);
        }
        if fragment.is_aligned() {
            let cigar_begin = fragment::HEADER_SIZE + bcl.len();
            for (at, &word) in fragment.cigar(cigar_buffer).iter().enumerate() {
                LittleEndian::write_u32(
                    &mut slot[cigar_begin + at * 4..cigar_begin + at * 4 + 4],
                    word,
                );
            }
        }
    }

    /// Orders the index for binning: uninitialized entries last, no-match
    /// entries first (bin 0), then by bin, and within one bin by slot
    /// address so mates stay adjacent for realignment.
    pub fn sort_index(&mut self, bin_index_map: &BinIndexMap) {
        // stable sort keeps (cluster, read) order where nothing else differs
        self.index.sort_by(|left, right| {
            match (left.data_offset, right.data_offset) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Greater,
                (Some(_), None) => return Ordering::Less,
                (Some(_), Some(_)) => {}
            }
            let left_unaligned = left.f_strand_pos.is_no_match();
            let right_unaligned = right.f_strand_pos.is_no_match();
            match (left_unaligned, right_unaligned) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => {
                    let left_bin = bin_index_map.bin_index(left.f_strand_pos);
                    let right_bin = bin_index_map.bin_index(right.f_strand_pos);
                    left_bin
                        .cmp(&right_bin)
                        .then(left.data_offset.cmp(&right.data_offset))
                }
            }
        });
    }

    /// Streams the sorted records out to their bins, updating each bin's
    /// metadata (sizes, distribution, element and gap counts) and appending
    /// the matching index side-file entries.
    pub fn distribute(
        &self,
        bins: &mut [BinMetadata],
        bin_index_map: &BinIndexMap,
    ) -> Result<()> {
        let mut writers: Vec<BinWriters> = Vec::with_capacity(bins.len());
        for bin in bins.iter() {
            writers.push(BinWriters::open(bin)?);
        }
        for record in &self.index {
            let offset = match record.data_offset {
                Some(offset) => offset,
                None => continue,
            };
            let bytes = &self.data[offset..offset + record.record_length];
            let fragment = crate::fragment::FragmentRef::new(bytes);
            let bin_index = if record.f_strand_pos.is_no_match() {
                0
            } else {
                bin_index_map.bin_index(record.f_strand_pos) as usize
            };
            let bin = &mut bins[bin_index];
            let key = if bin.is_unaligned() {
                bin.cluster_key(fragment.cluster_id())
            } else {
                bin.position_key(record.f_strand_pos)
            };
            let (record_offset, _) = bin.increment_data_size(key, record.record_length as u64);
            let barcode = fragment.barcode() as usize;
            bin.increment_gap_count(key, fragment.gap_count() as u64, barcode);
            bin.increment_cigar_length(key, fragment.cigar_length() as u64, barcode);

            let writer = &mut writers[bin_index];
            writer
                .data
                .write_all(bytes)
                .map_err(|e| BuildError::io(&bin.data_path, e))?;

            if !bin.is_unaligned() {
                let flags = fragment.flags();
                if !flags.paired {
                    bin.increment_se_idx_elements(key, 1, barcode);
                    let entry = SeFragmentIndex {
                        f_strand_pos: record.f_strand_pos,
                        data_offset: record_offset,
                    };
                    let mut buf = [0u8; SeFragmentIndex::SIZE];
                    entry.write_to(&mut buf);
                    writer
                        .se_idx
                        .write_all(&buf)
                        .map_err(|e| BuildError::io(bin.se_idx_path(), e))?;
                } else {
                    let mate = FragmentIndexMate::new(
                        flags.mate_unmapped,
                        flags.mate_reverse,
                        fragment.mate_storage_bin(),
                        fragment.mate_anchor(),
                    );
                    if flags.reverse || flags.unmapped {
                        bin.increment_r_idx_elements(key, 1, barcode);
                        let entry = RStrandOrShadowFragmentIndex {
                            f_strand_pos: record.f_strand_pos,
                            anchor: fragment.index_anchor(),
                            mate,
                            duplicate_cluster_rank: fragment.duplicate_cluster_rank(),
                            data_offset: record_offset,
                            mate_data_offset: record_offset,
                        };
                        let mut buf = [0u8; RStrandOrShadowFragmentIndex::SIZE];
                        entry.write_to(&mut buf);
                        writer
                            .r_idx
                            .write_all(&buf)
                            .map_err(|e| BuildError::io(bin.r_idx_path(), e))?;
                    } else {
                        bin.increment_f_idx_elements(key, 1, barcode);
                        let entry = FStrandFragmentIndex {
                            f_strand_pos: record.f_strand_pos,
                            mate,
                            duplicate_cluster_rank: fragment.duplicate_cluster_rank(),
                            data_offset: record_offset,
                            mate_data_offset: record_offset,
                        };
                        let mut buf = [0u8; FStrandFragmentIndex::SIZE];
                        entry.write_to(&mut buf);
                        writer
                            .f_idx
                            .write_all(&buf)
                            .map_err(|e| BuildError::io(bin.f_idx_path(), e))?;
                    }
                }
            } else {
                bin.increment_nm_elements(key, 1, barcode);
            }
        }
        for writer in &mut writers {
            writer.flush()?;
        }
        Ok(())
    }
}

struct BinWriters {
    path: std::path::PathBuf,
    data: std::io::BufWriter<std::fs::File>,
    f_idx: std::io::BufWriter<std::fs::File>,
    r_idx: std::io::BufWriter<std::fs::File>,
    se_idx: std::io::BufWriter<std::fs::File>,
}

impl BinWriters {
    fn open(bin: &BinMetadata) -> Result<Self> {
        let open = |path: &std::path::Path| -> Result<std::io::BufWriter<std::fs::File>> {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(std::io::BufWriter::new)
                .map_err(|e| BuildError::io(path, e))
        };
        Ok(BinWriters {
            path: bin.data_path.clone(),
            data: open(&bin.data_path)?,
            f_idx: open(&bin.f_idx_path())?,
            r_idx: open(&bin.r_idx_path())?,
            se_idx: open(&bin.se_idx_path())?,
        })
    }

    fn flush(&mut self) -> Result<()> {
        for writer in [
            &mut self.data,
            &mut self.f_idx,
            &mut self.r_idx,
            &mut self.se_idx,
        ] {
            writer
                .flush()
                .map_err(|e| BuildError::io(&self.path, e))?;
        }
        Ok(())
    }
}

/// Collects built templates into the buffer, one call per fragment.
pub struct FragmentCollector<'m> {
    bin_index_map: &'m BinIndexMap,
    buffer: FragmentBuffer,
}

impl<'m> FragmentCollector<'m> {
    pub fn new(
        bin_index_map: &'m BinIndexMap,
        cluster_count: usize,
        read_lengths: &[u32],
    ) -> Self {
        FragmentCollector {
            bin_index_map,
            buffer: FragmentBuffer::new(cluster_count, read_lengths),
        }
    }

    pub fn add(
        &mut self,
        template: &BamTemplate<'_>,
        fragment_index: usize,
        barcode: u32,
        cigar_buffer: &[u32],
    ) {
        self.buffer
            .add(template, fragment_index, barcode, self.bin_index_map, cigar_buffer);
    }

    /// Sorts and writes everything collected so far into the bins.
    pub fn finish(mut self, bins: &mut [BinMetadata]) -> Result<()> {
        self.buffer.sort_index(self.bin_index_map);
        self.buffer.distribute(bins, self.bin_index_map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlen_signs() {
        let begin = ReferencePosition::new(0, 1000);
        let end = ReferencePosition::new(0, 1100);
        let mate_begin = ReferencePosition::new(0, 1200);
        let mate_end = ReferencePosition::new(0, 1300);
        assert_eq!(bam_tlen(begin, end, mate_begin, mate_end, true), 299);
        assert_eq!(bam_tlen(mate_begin, mate_end, begin, end, false), -299);
        // equal begins: the non-first read gets the negative sign
        assert_eq!(bam_tlen(begin, end, begin, end, true), 99);
        assert_eq!(bam_tlen(begin, end, begin, end, false), -99);
    }
}
