//! Bin descriptors and their chunked data distribution.
//!
//! A bin covers one contiguous region of the reference (or the special
//! unaligned bin, whose start is the `TooManyMatch` sentinel) and locates the
//! serialized fragments of that region on disk. The distribution splits the
//! bin into ~1024 chunks and tracks how many bytes of record data fall into
//! each; after `tally_offsets` the chunk sizes become cumulative offsets,
//! which lets the loader scatter records of one chunk into a disjoint byte
//! range without coordinating with other chunks.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};
use crate::position::ReferencePosition;

/// Per-barcode accounting inside one chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BarcodeCounts {
    pub elements: u64,
    pub gaps: u64,
    pub cigar_length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinChunk {
    pub barcode_breakdown: Vec<BarcodeCounts>,
    /// Bytes of record data in this chunk; after `tally_offsets`, the
    /// cumulative byte offset at which the chunk begins.
    pub data_size: u64,
}

impl BinChunk {
    fn new(barcode_count: usize) -> Self {
        BinChunk {
            barcode_breakdown: vec![BarcodeCounts::default(); barcode_count],
            data_size: 0,
        }
    }

    pub fn total_elements(&self) -> u64 {
        self.barcode_breakdown.iter().map(|b| b.elements).sum()
    }

    pub fn total_cigar_length(&self) -> u64 {
        self.barcode_breakdown.iter().map(|b| b.cigar_length).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinDataDistribution {
    chunks: Vec<BinChunk>,
    chunk_size: u64,
    offsets_tallied: bool,
}

impl BinDataDistribution {
    pub fn new(barcode_count: usize, length: u64) -> Self {
        let chunk_size = Self::chunk_size_for(length);
        // one more chunk so tally_offsets produces the end offset of the
        // last present chunk
        let chunk_count = (length / chunk_size + 2) as usize;
        BinDataDistribution {
            chunks: vec![BinChunk::new(barcode_count); chunk_count],
            chunk_size,
            offsets_tallied: false,
        }
    }

    /// Aim for about 1024 chunks per bin; small bins get a single chunk.
    pub fn chunk_size_for(length: u64) -> u64 {
        if length < 1024 {
            1024
        } else {
            length / 1024
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn chunk_index(&self, key: u64) -> usize {
        let index = (key / self.chunk_size) as usize;
        index.min(self.chunks.len() - 1)
    }

    pub fn chunk_mut(&mut self, key: u64) -> &mut BinChunk {
        let index = self.chunk_index(key);
        &mut self.chunks[index]
    }

    /// Adds record bytes to the chunk holding `key` and returns the chunk's
    /// size (offset, once tallied) prior to the increment.
    pub fn add_bytes(&mut self, key: u64, count: u64) -> u64 {
        let chunk = self.chunk_mut(key);
        let previous = chunk.data_size;
        chunk.data_size += count;
        previous
    }

    /// Replaces every chunk's size with the sum of all previous chunks'
    /// sizes. Returns the total number of bytes the chunks held.
    pub fn tally_offsets(&mut self) -> u64 {
        let mut offset = 0u64;
        for chunk in &mut self.chunks {
            let size = std::mem::replace(&mut chunk.data_size, offset);
            offset += size;
        }
        self.offsets_tallied = true;
        offset
    }

    pub fn chunk_end_offset(&self, chunk: usize) -> u64 {
        debug_assert!(self.offsets_tallied, "offsets not tallied");
        self.chunks
            .get(chunk + 1)
            .or_else(|| self.chunks.last())
            .map(|c| c.data_size)
            .unwrap_or(0)
    }

    pub fn increment_elements(&mut self, key: u64, by: u64, barcode: usize) {
        self.chunk_mut(key).barcode_breakdown[barcode].elements += by;
    }

    pub fn increment_gap_count(&mut self, key: u64, by: u64, barcode: usize) {
        self.chunk_mut(key).barcode_breakdown[barcode].gaps += by;
    }

    pub fn increment_cigar_length(&mut self, key: u64, by: u64, barcode: usize) {
        self.chunk_mut(key).barcode_breakdown[barcode].cigar_length += by;
    }

    pub fn total_elements(&self) -> u64 {
        self.chunks.iter().map(BinChunk::total_elements).sum()
    }

    pub fn total_cigar_length(&self) -> u64 {
        self.chunks.iter().map(BinChunk::total_cigar_length).sum()
    }

    pub fn barcode_elements(&self, barcode: usize) -> u64 {
        self.chunks
            .iter()
            .map(|c| c.barcode_breakdown[barcode].elements)
            .sum()
    }

    pub fn barcode_gap_count(&self, barcode: usize) -> u64 {
        self.chunks
            .iter()
            .map(|c| c.barcode_breakdown[barcode].gaps)
            .sum()
    }

    /// Drops leading chunks until at least `min_offset` bytes are removed.
    /// Returns the number of bytes removed.
    pub fn remove_chunks_before(&mut self, min_offset: u64) -> u64 {
        let mut removed = 0u64;
        let mut drop_count = 0usize;
        for chunk in &self.chunks {
            if removed >= min_offset {
                break;
            }
            removed += chunk.data_size;
            drop_count += 1;
        }
        self.chunks.drain(..drop_count);
        removed
    }

    /// Keeps leading chunks holding at least `min_offset` bytes, drops the
    /// rest. Returns the number of bytes left.
    pub fn remove_chunks_after(&mut self, min_offset: u64) -> u64 {
        let mut kept = 0u64;
        let mut keep_count = 0usize;
        for chunk in &self.chunks {
            if kept >= min_offset {
                break;
            }
            kept += chunk.data_size;
            keep_count += 1;
        }
        self.chunks.truncate(keep_count);
        kept
    }
}

/// Descriptor of one bin of serialized fragments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinMetadata {
    pub index: u32,
    /// First genomic position covered; `TooManyMatch` marks the unaligned bin.
    pub bin_start: ReferencePosition,
    /// Bin length in bases.
    pub length: u64,
    pub data_path: PathBuf,
    /// Offset into the data file. One file can back several bins after the
    /// unaligned bin is split.
    pub data_offset: u64,
    pub data_size: u64,
    pub se_idx_elements: u64,
    pub r_idx_elements: u64,
    pub f_idx_elements: u64,
    pub nm_elements: u64,
    pub distribution: BinDataDistribution,
}

impl BinMetadata {
    pub fn new(
        barcode_count: usize,
        index: u32,
        bin_start: ReferencePosition,
        length: u64,
        data_path: PathBuf,
    ) -> Self {
        BinMetadata {
            index,
            bin_start,
            length,
            data_path,
            data_offset: 0,
            data_size: 0,
            se_idx_elements: 0,
            r_idx_elements: 0,
            f_idx_elements: 0,
            nm_elements: 0,
            distribution: BinDataDistribution::new(barcode_count, length),
        }
    }

    pub fn is_unaligned(&self) -> bool {
        self.bin_start.is_too_many_match()
    }

    pub fn is_empty(&self) -> bool {
        self.data_size == 0
    }

    pub fn bin_end(&self) -> ReferencePosition {
        if self.is_unaligned() {
            ReferencePosition::NO_MATCH
        } else {
            self.bin_start.add(self.length)
        }
    }

    pub fn covers_position(&self, pos: ReferencePosition) -> bool {
        !self.is_unaligned() && pos >= self.bin_start && pos < self.bin_end()
    }

    pub fn f_idx_path(&self) -> PathBuf {
        side_file(&self.data_path, "fw-idx")
    }

    pub fn r_idx_path(&self) -> PathBuf {
        side_file(&self.data_path, "rs-idx")
    }

    pub fn se_idx_path(&self) -> PathBuf {
        side_file(&self.data_path, "se-idx")
    }

    /// Distribution key for an aligned-bin position, clamped into the bin.
    pub fn position_key(&self, pos: ReferencePosition) -> u64 {
        debug_assert!(!self.is_unaligned());
        if pos <= self.bin_start {
            0
        } else {
            (pos.distance(self.bin_start) as u64).min(self.length.saturating_sub(1))
        }
    }

    /// Distribution key for an unaligned-bin record: the cluster number.
    pub fn cluster_key(&self, cluster_number: u64) -> u64 {
        debug_assert!(self.is_unaligned());
        cluster_number
    }

    /// Increments the chunk and total data sizes; returns the total data
    /// size and the chunk's size, both prior to the increment. The chunk
    /// part tells the serializer where to place the record so writers of
    /// distinct chunks never collide.
    pub fn increment_data_size(&mut self, key: u64, by: u64) -> (u64, u64) {
        let chunk_offset = self.distribution.add_bytes(key, by);
        let total = self.data_size;
        self.data_size += by;
        (total, chunk_offset)
    }

    pub fn increment_se_idx_elements(&mut self, key: u64, by: u64, barcode: usize) {
        self.distribution.increment_elements(key, by, barcode);
        self.se_idx_elements += by;
    }

    pub fn increment_r_idx_elements(&mut self, key: u64, by: u64, barcode: usize) {
        self.distribution.increment_elements(key, by, barcode);
        self.r_idx_elements += by;
    }

    pub fn increment_f_idx_elements(&mut self, key: u64, by: u64, barcode: usize) {
        self.distribution.increment_elements(key, by, barcode);
        self.f_idx_elements += by;
    }

    pub fn increment_nm_elements(&mut self, key: u64, by: u64, barcode: usize) {
        self.distribution.increment_elements(key, by, barcode);
        self.nm_elements += by;
    }

    pub fn increment_gap_count(&mut self, key: u64, by: u64, barcode: usize) {
        self.distribution.increment_gap_count(key, by, barcode);
    }

    pub fn increment_cigar_length(&mut self, key: u64, by: u64, barcode: usize) {
        self.distribution.increment_cigar_length(key, by, barcode);
    }

    pub fn total_elements(&self) -> u64 {
        self.distribution.total_elements()
    }

    pub fn total_cigar_length(&self) -> u64 {
        self.distribution.total_cigar_length()
    }

    pub fn barcode_elements(&self, barcode: usize) -> u64 {
        self.distribution.barcode_elements(barcode)
    }

    pub fn barcode_gap_count(&self, barcode: usize) -> u64 {
        self.distribution.barcode_gap_count(barcode)
    }

    /// Sub-bin starting at `min_offset` holding about `min_size` bytes.
    /// Splitting is supported for the unaligned bin only.
    pub fn chunk_range(&self, min_offset: u64, min_size: u64) -> Result<BinMetadata> {
        if !self.is_unaligned() || self.se_idx_elements + self.r_idx_elements + self.f_idx_elements != 0
        {
            return Err(BuildError::Invariant(
                "splitting is supported only for the unaligned bin".to_string(),
            ));
        }
        let mut part = self.clone();
        let removed = part.distribution.remove_chunks_before(min_offset);
        part.data_offset += removed;
        part.data_size -= removed;
        part.data_size = part.distribution.remove_chunks_after(min_size);
        Ok(part)
    }
}

fn side_file(data_path: &Path, extension: &str) -> PathBuf {
    let mut name = data_path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

pub type BinMetadataList = Vec<BinMetadata>;

/// Maps reference positions to the storage bin index; unaligned positions go
/// to bin 0.
#[derive(Debug, Clone)]
pub struct BinIndexMap {
    starts: Vec<ReferencePosition>,
    indexes: Vec<u32>,
}

impl BinIndexMap {
    pub fn new(bins: &[BinMetadata]) -> Self {
        let mut aligned: Vec<(ReferencePosition, u32)> = bins
            .iter()
            .filter(|bin| !bin.is_unaligned())
            .map(|bin| (bin.bin_start, bin.index))
            .collect();
        aligned.sort_by_key(|&(start, _)| start);
        BinIndexMap {
            starts: aligned.iter().map(|&(start, _)| start).collect(),
            indexes: aligned.iter().map(|&(_, index)| index).collect(),
        }
    }

    pub fn bin_index(&self, pos: ReferencePosition) -> u32 {
        if pos.is_no_match() || pos.is_too_many_match() {
            return 0;
        }
        let at = self.starts.partition_point(|&start| start <= pos);
        if at == 0 {
            0
        } else {
            self.indexes[at - 1]
        }
    }
}

/// How `--bin-regex` selects which bins take part in the build.
#[derive(Debug, Clone)]
pub enum BinFilter {
    All,
    SkipEmpty,
    Regex(Regex),
}

impl BinFilter {
    /// Parses the flag value; comma-separated patterns become alternatives.
    pub fn parse(value: &str) -> Result<BinFilter> {
        match value {
            "all" => Ok(BinFilter::All),
            "skip-empty" => Ok(BinFilter::SkipEmpty),
            pattern => {
                let regex = Regex::new(&pattern.replace(',', "|"))
                    .map_err(|e| BuildError::Config(format!("invalid bin regex: {}", e)))?;
                Ok(BinFilter::Regex(regex))
            }
        }
    }

    pub fn matches(&self, bin: &BinMetadata) -> bool {
        match self {
            BinFilter::All => true,
            BinFilter::SkipEmpty => !bin.is_empty(),
            BinFilter::Regex(regex) => {
                !bin.is_empty()
                    && bin
                        .data_path
                        .file_name()
                        .map(|name| regex.is_match(&name.to_string_lossy()))
                        .unwrap_or(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aligned_bin(index: u32, contig: u32, start: i64, length: u64) -> BinMetadata {
        BinMetadata::new(
            2,
            index,
            ReferencePosition::new(contig, start),
            length,
            PathBuf::from(format!("bin-{:04}.dat", index)),
        )
    }

    #[test]
    fn tally_offsets_is_exclusive_prefix_sum() {
        let mut distribution = BinDataDistribution::new(1, 4096);
        let chunk = distribution.chunk_size();
        distribution.add_bytes(0, 10);
        distribution.add_bytes(chunk, 20);
        distribution.add_bytes(chunk * 2, 30);
        let total = distribution.tally_offsets();
        assert_eq!(total, 60);
        assert_eq!(distribution.add_bytes(0, 0), 0);
        assert_eq!(distribution.add_bytes(chunk, 0), 10);
        assert_eq!(distribution.add_bytes(chunk * 2, 0), 30);
        assert_eq!(distribution.chunk_end_offset(0), 10);
        assert_eq!(distribution.chunk_end_offset(1), 30);
        assert_eq!(distribution.chunk_end_offset(2), 60);
    }

    #[test]
    fn small_bins_get_single_chunk() {
        assert_eq!(BinDataDistribution::chunk_size_for(100), 1024);
        assert_eq!(BinDataDistribution::chunk_size_for(1 << 20), 1024);
        assert_eq!(BinDataDistribution::chunk_size_for(1 << 21), 2048);
    }

    #[test]
    fn increment_data_size_reports_prior_totals() {
        let mut bin = aligned_bin(1, 0, 1000, 4096);
        let key = bin.position_key(ReferencePosition::new(0, 1500));
        assert_eq!(bin.increment_data_size(key, 100), (0, 0));
        assert_eq!(bin.increment_data_size(key, 50), (100, 100));
        assert_eq!(bin.data_size, 150);
    }

    #[test]
    fn position_key_is_clamped() {
        let bin = aligned_bin(1, 0, 1000, 4096);
        assert_eq!(bin.position_key(ReferencePosition::new(0, 900)), 0);
        assert_eq!(bin.position_key(ReferencePosition::new(0, 1000)), 0);
        assert_eq!(bin.position_key(ReferencePosition::new(0, 2000)), 1000);
        assert_eq!(bin.position_key(ReferencePosition::new(0, 9000)), 4095);
    }

    #[test]
    fn unaligned_bin_splitting() {
        let mut bin = BinMetadata::new(
            1,
            0,
            ReferencePosition::TOO_MANY_MATCH,
            0,
            PathBuf::from("bin-0000.dat"),
        );
        assert!(bin.is_unaligned());
        // three chunks of 1024-key strides
        for cluster in 0..3u64 {
            bin.increment_data_size(bin.cluster_key(cluster * 1024), 100);
        }
        let part = bin.chunk_range(100, 100).unwrap();
        assert_eq!(part.data_offset, 100);
        assert_eq!(part.data_size, 100);
    }

    #[test]
    fn aligned_bin_split_is_rejected() {
        let bin = aligned_bin(1, 0, 0, 4096);
        assert!(bin.chunk_range(0, 10).is_err());
    }

    #[test]
    fn bin_index_map_routes_positions() {
        let bins = vec![
            BinMetadata::new(
                1,
                0,
                ReferencePosition::TOO_MANY_MATCH,
                0,
                PathBuf::from("bin-0000.dat"),
            ),
            aligned_bin(1, 0, 0, 10_000),
            aligned_bin(2, 0, 10_000, 10_000),
            aligned_bin(3, 1, 0, 10_000),
        ];
        let map = BinIndexMap::new(&bins);
        assert_eq!(map.bin_index(ReferencePosition::new(0, 5)), 1);
        assert_eq!(map.bin_index(ReferencePosition::new(0, 10_000)), 2);
        assert_eq!(map.bin_index(ReferencePosition::new(1, 1)), 3);
        assert_eq!(map.bin_index(ReferencePosition::NO_MATCH), 0);
    }

    #[test]
    fn bin_filter_variants() {
        let mut full = aligned_bin(7, 0, 0, 1024);
        full.data_size = 10;
        let empty = aligned_bin(8, 0, 1024, 1024);
        assert!(BinFilter::parse("all").unwrap().matches(&empty));
        assert!(!BinFilter::parse("skip-empty").unwrap().matches(&empty));
        assert!(BinFilter::parse("skip-empty").unwrap().matches(&full));
        let regex = BinFilter::parse("bin-0007,bin-0009").unwrap();
        assert!(regex.matches(&full));
        assert!(!regex.matches(&empty));
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let bin = aligned_bin(5, 2, 123, 4096);
        let json = serde_json::to_string(&bin).unwrap();
        let back: BinMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index, 5);
        assert_eq!(back.bin_start, bin.bin_start);
        assert_eq!(back.distribution.chunk_count(), bin.distribution.chunk_count());
    }
}
