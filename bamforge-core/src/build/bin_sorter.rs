//! Per-bin processing: load the packed records, resolve duplicates, realign
//! gaps, clip semialigned ends, order for BAM and serialize.
//!
//! One BinSorter instance is owned by one worker for the lifetime of one
//! bin; nothing here is shared across threads.

use std::fs::File;

use log::{debug, info};
use memmap2::Mmap;
use rayon::prelude::*;

use crate::bam::index::BamIndexPart;
use crate::bam::{serialize_indexed_record, BamRecordAdapter};
use crate::bam::bgzf::BgzfWriter;
use crate::bin_metadata::BinMetadata;
use crate::build::barcode_bam::BarcodeBamMapping;
use crate::build::clip::SemialignedEndsClipper;
use crate::build::dedup::{filter_duplicates, pass_all, LibraryResolver};
use crate::build::fragment_index::{
    FStrandFragmentIndex, FragmentIndexMate, RStrandOrShadowFragmentIndex, SeFragmentIndex,
};
use crate::build::packed_buffer::{Index, PackedFragmentBuffer};
use crate::build::realign::{GapRealigner, GapRealignerMode, RealignerGaps};
use crate::build::stats::BuildStats;
use crate::error::{BuildError, Result};
use crate::fragment::{FragmentHeader, HEADER_SIZE};
use crate::types::Contig;

/// Options one BinSorter needs; owned by the orchestrator and shared
/// read-only across workers.
#[derive(Debug, Clone)]
pub struct BinSorterOptions {
    pub single_library_samples: bool,
    pub keep_duplicates: bool,
    pub mark_duplicates: bool,
    pub realign_mode: GapRealignerMode,
    pub realign_vigorously: bool,
    pub realign_dodgy: bool,
    pub realigned_gaps_per_fragment: u32,
    pub clip_semialigned: bool,
}

pub struct BinSorter<'a> {
    options: &'a BinSorterOptions,
    mapping: &'a BarcodeBamMapping,
    contigs: &'a [Contig],
    bin: &'a BinMetadata,
    bin_stats_index: usize,
    data: PackedFragmentBuffer,
    se_idx: Vec<SeFragmentIndex>,
    r_idx: Vec<RStrandOrShadowFragmentIndex>,
    f_idx: Vec<FStrandFragmentIndex>,
    indexes: Vec<Index>,
    realigner_gaps: Vec<RealignerGaps>,
    realigned_cigars: Vec<u32>,
}

impl<'a> BinSorter<'a> {
    pub fn new(
        options: &'a BinSorterOptions,
        mapping: &'a BarcodeBamMapping,
        contigs: &'a [Contig],
        bin: &'a BinMetadata,
        bin_stats_index: usize,
    ) -> Self {
        let gap_groups = match options.realign_mode {
            GapRealignerMode::None => 0,
            GapRealignerMode::Sample => mapping.total_samples(),
            GapRealignerMode::Project => mapping.max_project_index() as usize + 1,
            GapRealignerMode::All => 1,
        };
        let mut realigned_cigars = Vec::new();
        if gap_groups > 0 {
            // assume each existing cigar picks up a couple of realigned gaps
            realigned_cigars.reserve(
                bin.total_cigar_length() as usize
                    + bin.total_elements() as usize
                        * (1 + options.realigned_gaps_per_fragment as usize * 2),
            );
        }
        BinSorter {
            options,
            mapping,
            contigs,
            bin,
            bin_stats_index,
            data: PackedFragmentBuffer::with_size(bin.data_size as usize),
            se_idx: Vec::with_capacity(bin.se_idx_elements as usize),
            r_idx: Vec::with_capacity(bin.r_idx_elements as usize),
            f_idx: Vec::with_capacity(bin.f_idx_elements as usize),
            indexes: Vec::with_capacity(bin.total_elements() as usize),
            realigner_gaps: (0..gap_groups).map(|_| RealignerGaps::default()).collect(),
            realigned_cigars,
        }
    }

    /// Bytes this bin needs in memory: the packed data, the index vectors
    /// and the deduplicated index.
    pub fn memory_requirements(bin: &BinMetadata) -> u64 {
        bin.data_size
            + bin.se_idx_elements * SeFragmentIndex::SIZE as u64
            + bin.r_idx_elements * RStrandOrShadowFragmentIndex::SIZE as u64
            + bin.f_idx_elements * FStrandFragmentIndex::SIZE as u64
            + bin.total_elements() * std::mem::size_of::<Index>() as u64
    }

    pub fn bin_index(&self) -> u32 {
        self.bin.index
    }

    fn is_unaligned(&self) -> bool {
        self.bin.is_unaligned()
    }

    pub fn unique_record_count(&self) -> u64 {
        if self.is_unaligned() {
            self.bin.total_elements()
        } else {
            self.indexes.len() as u64
        }
    }

    /// Reads the bin data. Aligned bins are scattered by distribution chunk
    /// so the buffer comes out roughly position-ordered; unaligned bins are
    /// an opaque blob of records.
    pub fn load(&mut self) -> Result<()> {
        if self.bin.data_size == 0 {
            return Ok(());
        }
        debug!("loading {} bytes from {:?}", self.bin.data_size, self.bin.data_path);
        let file =
            File::open(&self.bin.data_path).map_err(|e| BuildError::io(&self.bin.data_path, e))?;
        let mmap =
            unsafe { Mmap::map(&file) }.map_err(|e| BuildError::io(&self.bin.data_path, e))?;
        let from = self.bin.data_offset as usize;
        let to = from + self.bin.data_size as usize;
        if to > mmap.len() {
            return Err(BuildError::Format(format!(
                "bin data {}..{} past the end of {:?} ({} bytes)",
                from,
                to,
                self.bin.data_path,
                mmap.len()
            )));
        }
        let source = &mmap[from..to];
        if self.is_unaligned() {
            self.data.as_bytes_mut().copy_from_slice(source);
            return Ok(());
        }
        self.load_aligned(source)
    }

    fn load_aligned(&mut self, source: &[u8]) -> Result<()> {
        let mut distribution = self.bin.distribution.clone();
        distribution.tally_offsets();

        let mut read_at = 0usize;
        while read_at < source.len() {
            let offset = self.place_record(source, &mut read_at, &mut distribution)?;
            let fragment = self.data.fragment(offset);
            let flags = fragment.flags();
            if !flags.paired {
                self.se_idx.push(SeFragmentIndex {
                    f_strand_pos: fragment.f_strand_position(),
                    data_offset: offset as u64,
                });
                continue;
            }

            let mate_in_bin = self.bin.covers_position(fragment.mate_f_strand_position());
            let mut mate_offset = offset;
            if mate_in_bin {
                // the collector guarantees co-located mates are adjacent
                mate_offset = self.place_record(source, &mut read_at, &mut distribution)?;
                let fragment = self.data.fragment(offset);
                let mate = self.data.fragment(mate_offset);
                if mate.cluster_id() != fragment.cluster_id()
                    || mate.flags().unmapped != fragment.flags().mate_unmapped
                    || mate.flags().reverse != fragment.flags().mate_reverse
                {
                    return Err(BuildError::Format(format!(
                        "record at {:?} is not adjacent to its mate in {:?}",
                        fragment.f_strand_position(),
                        self.bin.data_path
                    )));
                }
                self.push_paired_index(mate_offset, offset);
            }
            self.push_paired_index(offset, mate_offset);
        }
        info!(
            "loaded bin {}: {} se, {} r/shadow, {} f records",
            self.bin.index,
            self.se_idx.len(),
            self.r_idx.len(),
            self.f_idx.len()
        );
        Ok(())
    }

    /// Reads one record off the source stream into its scattered position
    /// and returns the in-memory offset.
    fn place_record(
        &mut self,
        source: &[u8],
        read_at: &mut usize,
        distribution: &mut crate::bin_metadata::BinDataDistribution,
    ) -> Result<usize> {
        if *read_at + HEADER_SIZE > source.len() {
            return Err(BuildError::Format(format!(
                "truncated fragment header in {:?}",
                self.bin.data_path
            )));
        }
        let header = FragmentHeader::read_from(&source[*read_at..])?;
        let length = header.total_length();
        if *read_at + length > source.len() {
            return Err(BuildError::Format(format!(
                "fragment at byte {} of {:?} claims {} bytes past the end",
                *read_at, self.bin.data_path, length
            )));
        }
        let key = self.bin.position_key(header.f_strand_position);
        let offset = distribution.add_bytes(key, length as u64) as usize;
        if offset + length > self.data.len() {
            return Err(BuildError::Format(format!(
                "distribution offset {} exceeds bin size {} in {:?}",
                offset,
                self.data.len(),
                self.bin.data_path
            )));
        }
        self.data.as_bytes_mut()[offset..offset + length]
            .copy_from_slice(&source[*read_at..*read_at + length]);
        *read_at += length;
        Ok(offset)
    }

    fn push_paired_index(&mut self, offset: usize, mate_offset: usize) {
        let fragment = self.data.fragment(offset);
        let flags = fragment.flags();
        let mate = FragmentIndexMate::new(
            flags.mate_unmapped,
            flags.mate_reverse,
            fragment.mate_storage_bin(),
            fragment.mate_anchor(),
        );
        if flags.reverse || flags.unmapped {
            self.r_idx.push(RStrandOrShadowFragmentIndex {
                // shadows are stored at the position of their singletons
                f_strand_pos: fragment.f_strand_position(),
                anchor: fragment.index_anchor(),
                mate,
                duplicate_cluster_rank: fragment.duplicate_cluster_rank(),
                data_offset: offset as u64,
                mate_data_offset: mate_offset as u64,
            });
        } else {
            self.f_idx.push(FStrandFragmentIndex {
                f_strand_pos: fragment.f_strand_position(),
                mate,
                duplicate_cluster_rank: fragment.duplicate_cluster_rank(),
                data_offset: offset as u64,
                mate_data_offset: mate_offset as u64,
            });
        }
    }

    /// Deduplicates, realigns and clips. Returns the surviving record count.
    pub fn process(&mut self, stats: &mut BuildStats) -> u64 {
        if !self.is_unaligned() {
            self.resolve_duplicates(stats);
            self.se_idx = Vec::new();
            self.r_idx = Vec::new();
            self.f_idx = Vec::new();
            if self.options.realign_mode != GapRealignerMode::None {
                self.collect_gaps();
                self.realign_gaps();
            }
            if self.options.clip_semialigned {
                self.clip_semialigned_ends();
            }
        }
        self.unique_record_count()
    }

    fn resolve_duplicates(&mut self, stats: &mut BuildStats) {
        pass_all(
            &self.data,
            &self.se_idx,
            stats,
            self.bin_stats_index,
            &mut self.indexes,
        );
        if self.options.mark_duplicates {
            let resolver = LibraryResolver::new(
                self.options.single_library_samples,
                self.mapping.sample_index_map(),
            );
            let mut r_idx = std::mem::take(&mut self.r_idx);
            filter_duplicates(
                &resolver,
                &mut self.data,
                &mut r_idx,
                self.options.keep_duplicates,
                stats,
                self.bin_stats_index,
                &mut self.indexes,
            );
            let mut f_idx = std::mem::take(&mut self.f_idx);
            filter_duplicates(
                &resolver,
                &mut self.data,
                &mut f_idx,
                self.options.keep_duplicates,
                stats,
                self.bin_stats_index,
                &mut self.indexes,
            );
        } else {
            // neither marking nor removing: everything passes
            pass_all(
                &self.data,
                &self.r_idx,
                stats,
                self.bin_stats_index,
                &mut self.indexes,
            );
            pass_all(
                &self.data,
                &self.f_idx,
                stats,
                self.bin_stats_index,
                &mut self.indexes,
            );
        }
    }

    fn gap_group_index(&self, barcode: u32) -> usize {
        match self.options.realign_mode {
            GapRealignerMode::Sample => self.mapping.sample_index(barcode) as usize,
            GapRealignerMode::Project => self.mapping.project_index(barcode) as usize,
            GapRealignerMode::All => 0,
            GapRealignerMode::None => unreachable!("no gap groups without realignment"),
        }
    }

    fn collect_gaps(&mut self) {
        let mut offset = 0usize;
        while offset < self.data.len() {
            let fragment = self.data.fragment(offset);
            if fragment.gap_count() > 0 {
                let group = self.gap_group_index(fragment.barcode());
                self.realigner_gaps[group]
                    .add_gaps(fragment.f_strand_position(), &fragment.cigar());
            }
            offset += fragment.total_length();
        }
        for gaps in &mut self.realigner_gaps {
            gaps.finalize();
        }
        debug!(
            "bin {}: {} unique gaps collected",
            self.bin.index,
            self.realigner_gaps.iter().map(RealignerGaps::gap_count).sum::<usize>()
        );
    }

    fn realign_gaps(&mut self) {
        let realigner = GapRealigner::new(
            self.options.realign_vigorously,
            self.options.realign_dodgy,
            self.options.realigned_gaps_per_fragment,
        );
        let bin_start = self.bin.bin_start;
        let bin_end = self.bin.bin_end();
        let mode = self.options.realign_mode;
        let mapping = self.mapping;
        for index in &mut self.indexes {
            let fragment = self.data.fragment(index.data_offset);
            if !fragment.is_aligned() {
                continue;
            }
            let group = match mode {
                GapRealignerMode::Sample => mapping.sample_index(fragment.barcode()) as usize,
                GapRealignerMode::Project => mapping.project_index(fragment.barcode()) as usize,
                GapRealignerMode::All => 0,
                GapRealignerMode::None => unreachable!("no gap groups without realignment"),
            };
            realigner.realign(
                &self.realigner_gaps[group],
                bin_start,
                bin_end,
                index,
                &mut self.data,
                &mut self.realigned_cigars,
                self.contigs,
            );
        }
    }

    fn clip_semialigned_ends(&mut self) {
        let bin_end = self.bin.bin_end();
        for index in &mut self.indexes {
            if !self.data.fragment(index.data_offset).is_aligned() {
                continue;
            }
            SemialignedEndsClipper::clip(
                self.contigs,
                bin_end,
                index,
                &mut self.data,
                &mut self.realigned_cigars,
            );
        }
    }

    /// Orders the surviving records for BAM output. Realignment may have
    /// moved records, so positions re-sync from the headers first.
    pub fn reorder_for_bam(&mut self) {
        if self.options.realign_mode != GapRealignerMode::None || self.options.clip_semialigned {
            for index in &mut self.indexes {
                index.pos = self.data.fragment(index.data_offset).f_strand_position();
            }
        }
        let data = &self.data;
        self.indexes
            .par_sort_by(|left, right| data.order_for_bam(left, right));
    }

    /// Writes every record to its sample's BGZF stream and index part.
    pub fn serialize(
        &self,
        adapter: &BamRecordAdapter,
        writers: &mut [BgzfWriter],
        index_parts: &mut [BamIndexPart],
    ) -> Result<u64> {
        let mut written = 0u64;
        if self.is_unaligned() {
            let mut offset = 0usize;
            while offset < self.data.len() {
                let fragment = self.data.fragment(offset);
                let output = self.mapping.sample_index(fragment.barcode()) as usize;
                let view = adapter.adapt_unaligned(&fragment);
                let meta = crate::bam::BamRecordMeta {
                    ref_id: view.ref_id,
                    pos: view.pos,
                    seq_len: view.bases.len() as u32,
                    observed_length: view.observed_length,
                    unmapped: true,
                };
                let length = crate::bam::serialize_alignment(&mut writers[output], &view)?;
                index_parts[output].process_fragment(&meta, length)?;
                offset += fragment.total_length();
                written += 1;
            }
        } else {
            for index in &self.indexes {
                let fragment = self.data.fragment(index.data_offset);
                let output = self.mapping.sample_index(fragment.barcode()) as usize;
                let (length, meta) = serialize_indexed_record(
                    adapter,
                    &mut writers[output],
                    index,
                    &self.data,
                    &self.realigned_cigars,
                )?;
                index_parts[output].process_fragment(&meta, length)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::bcl_from_base;
    use crate::fragment::FragmentFlags;
    use crate::position::ReferencePosition;
    use crate::types::BarcodeMetadata;
    use std::io::Write as IoWrite;
    use std::path::Path;

    fn options() -> BinSorterOptions {
        BinSorterOptions {
            single_library_samples: false,
            keep_duplicates: false,
            mark_duplicates: true,
            realign_mode: GapRealignerMode::None,
            realign_vigorously: false,
            realign_dodgy: false,
            realigned_gaps_per_fragment: 2,
            clip_semialigned: false,
        }
    }

    fn mapping() -> BarcodeBamMapping {
        BarcodeBamMapping::new(
            Path::new("/out"),
            &vec![BarcodeMetadata {
                index: 0,
                sample_name: "s1".to_string(),
                project: "p1".to_string(),
                reference_index: 0,
                barcode_sequence: "ACGT".to_string(),
                unmapped_reference: false,
            }],
        )
    }

    fn record_bytes(
        pos: ReferencePosition,
        mate_pos: ReferencePosition,
        cluster_id: u64,
        reverse: bool,
        read_length: usize,
    ) -> Vec<u8> {
        let cigar = vec![crate::cigar::encode(
            read_length as u32,
            crate::cigar::CigarOp::Align,
        )];
        let header = FragmentHeader {
            bam_tlen: 200,
            observed_length: read_length as u32,
            f_strand_position: pos,
            low_clipped: 0,
            high_clipped: 0,
            alignment_score: 50,
            template_alignment_score: 50,
            mate_f_strand_position: mate_pos,
            read_length: read_length as u16,
            cigar_length: 1,
            gap_count: 0,
            edit_distance: 0,
            flags: FragmentFlags {
                paired: true,
                reverse,
                mate_reverse: !reverse,
                first_read: !reverse,
                second_read: reverse,
                proper_pair: true,
                ..Default::default()
            },
            tile: 0,
            barcode: 0,
            mate_storage_bin: 1,
            barcode_sequence: 0,
            cluster_id,
            cluster_x: 0,
            cluster_y: 0,
            duplicate_cluster_rank: 100,
            mate_anchor: 7,
        };
        let mut bytes = vec![0u8; header.total_length()];
        header.write_to(&mut bytes);
        for at in 0..read_length {
            bytes[HEADER_SIZE + at] = bcl_from_base(b'A', 30);
        }
        let cigar_at = HEADER_SIZE + read_length;
        bytes[cigar_at..cigar_at + 4].copy_from_slice(&cigar[0].to_le_bytes());
        bytes
    }

    #[test]
    fn loads_pairs_adjacently_and_builds_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("bin-0001.dat");
        let mut bin = BinMetadata::new(
            1,
            1,
            ReferencePosition::new(0, 0),
            100_000,
            data_path.clone(),
        );

        // a forward/reverse pair sharing the bin, then a lone forward read
        let r1 = record_bytes(
            ReferencePosition::new(0, 1000),
            ReferencePosition::new(0, 1200),
            5,
            false,
            100,
        );
        let r2 = record_bytes(
            ReferencePosition::new(0, 1200),
            ReferencePosition::new(0, 1000),
            5,
            true,
            100,
        );
        let lone = record_bytes(
            ReferencePosition::new(0, 50_000),
            ReferencePosition::new(1, 9_999),
            6,
            false,
            100,
        );
        let mut file = File::create(&data_path).unwrap();
        for record in [&r1, &r2, &lone] {
            file.write_all(record).unwrap();
        }
        drop(file);
        bin.increment_data_size(bin.position_key(ReferencePosition::new(0, 1000)), r1.len() as u64);
        bin.increment_data_size(bin.position_key(ReferencePosition::new(0, 1200)), r2.len() as u64);
        bin.increment_data_size(
            bin.position_key(ReferencePosition::new(0, 50_000)),
            lone.len() as u64,
        );

        let options = options();
        let mapping = mapping();
        let mut sorter = BinSorter::new(&options, &mapping, &[], &bin, 0);
        sorter.load().unwrap();
        assert_eq!(sorter.f_idx.len(), 2);
        assert_eq!(sorter.r_idx.len(), 1);
        assert!(sorter.se_idx.is_empty());
        // the pair points at each other
        let pair_f = sorter
            .f_idx
            .iter()
            .find(|f| f.f_strand_pos == ReferencePosition::new(0, 1000))
            .unwrap();
        assert_ne!(pair_f.data_offset, pair_f.mate_data_offset);
        let pair_r = &sorter.r_idx[0];
        assert_eq!(pair_r.mate_data_offset, pair_f.data_offset);
        // the lone read's mate is elsewhere
        let lone_f = sorter
            .f_idx
            .iter()
            .find(|f| f.f_strand_pos == ReferencePosition::new(0, 50_000))
            .unwrap();
        assert_eq!(lone_f.data_offset, lone_f.mate_data_offset);

        let mut stats = BuildStats::new(1, 1);
        let unique = sorter.process(&mut stats);
        assert_eq!(unique, 3);
        sorter.reorder_for_bam();
        let positions: Vec<_> = sorter.indexes.iter().map(|i| i.pos).collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }
}
