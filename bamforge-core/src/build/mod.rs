//! The build orchestrator: walks the bin list through the
//! allocate / load / compute / save pipeline across a pool of workers and
//! owns everything the workers share.
//!
//! Allocation and save are strictly ordered by bin index to bound peak
//! memory and to keep the output byte-identical across runs; load and
//! compute have configurable parallelism. All coordination goes through one
//! state mutex and one condition variable; any failure sets the
//! force-termination flag and every thread bails out at its next wait.

pub mod barcode_bam;
pub mod bin_sorter;
pub mod clip;
pub mod dedup;
pub mod fragment_index;
pub mod packed_buffer;
pub mod realign;
pub mod stats;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use log::{debug, info, warn};

use crate::bam::bgzf::{BgzfWriter, BGZF_EOF};
use crate::bam::index::{BamIndex, BamIndexPart};
use crate::bam::{serialize_header, BamRecordAdapter, IncludeTags};
use crate::bin_metadata::{BinFilter, BinMetadata};
use crate::error::{BuildError, Result};
use crate::template::DodgyAlignmentScore;
use crate::types::{BarcodeMetadataList, Contig, ContigInfo, TileMetadataList};
use barcode_bam::BarcodeBamMapping;
use bin_sorter::{BinSorter, BinSorterOptions};
use stats::BuildStats;

const EMPTY_BGZF_BLOCK_SIZE: u64 = 1234;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub sorter: BinSorterOptions,
    pub bam_gzip_level: u32,
    pub expected_bgzf_compression_ratio: f64,
    pub keep_unaligned: bool,
    pub put_unaligned_in_the_back: bool,
    pub bin_filter: BinFilter,
    pub include_tags: IncludeTags,
    pub dodgy_alignment_score: DodgyAlignmentScore,
    pub pessimistic_mapq: bool,
    pub max_loaders: usize,
    pub max_computers: usize,
    pub max_savers: usize,
    /// Refuse to start when a single bin plus its buffers would exceed this.
    pub memory_limit: Option<u64>,
    pub command_line: String,
    pub output_directory: PathBuf,
    pub stats_xml_path: Option<PathBuf>,
}

/// A worker's thread-affinity hook. Pinning workers and their allocations
/// to NUMA nodes needs libnuma; without it the policy is a documented no-op.
fn pin_to_numa_node(thread_number: usize) {
    debug!("worker {} runs without NUMA pinning", thread_number);
}

struct SampleOutput {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    index: Option<BamIndex<BufWriter<File>>>,
}

struct SlotState {
    next_unprocessed: usize,
    next_unallocated: usize,
    next_unloaded: usize,
    next_unsaved: usize,
    loaders_available: usize,
    computers_available: usize,
    compute_waiters: Vec<usize>,
    force_termination: bool,
    first_error: Option<BuildError>,
}

pub struct Build {
    options: BuildOptions,
    contigs: Vec<Contig>,
    barcodes: BarcodeMetadataList,
    bins: Vec<BinMetadata>,
    mapping: BarcodeBamMapping,
    adapter: BamRecordAdapter,
    outputs: Mutex<Vec<SampleOutput>>,
    stats: Mutex<BuildStats>,
    state: Mutex<SlotState>,
    state_changed: Condvar,
}

/// Breaks the unaligned bin into roughly equal parts so compute threads can
/// share it, and places the parts per configuration.
fn arrange_bins(
    bins: Vec<BinMetadata>,
    filter: &BinFilter,
    parts: usize,
    keep_unaligned: bool,
    put_unaligned_in_the_back: bool,
) -> Result<Vec<BinMetadata>> {
    let mut filtered: Vec<BinMetadata> = bins.into_iter().filter(|bin| filter.matches(bin)).collect();
    if filtered.is_empty() {
        warn!("no bins left after applying the bin filter; output will be empty");
        return Ok(filtered);
    }
    // the unaligned bin occurs at the front of the list when present
    if !filtered[0].is_unaligned() {
        return Ok(filtered);
    }
    let unaligned = filtered.remove(0);
    let mut unaligned_parts = Vec::new();
    if keep_unaligned && unaligned.data_size > 0 {
        let part_size = (unaligned.data_size / parts.max(1) as u64).max(1);
        info!(
            "breaking unaligned bin of {} bytes into ~{} parts of {} bytes",
            unaligned.data_size, parts, part_size
        );
        let mut offset = 0u64;
        while offset < unaligned.data_size {
            let part = unaligned.chunk_range(offset, part_size)?;
            offset += part.data_size;
            if part.data_size == 0 {
                break;
            }
            unaligned_parts.push(part);
        }
    }
    if put_unaligned_in_the_back {
        filtered.extend(unaligned_parts);
    } else {
        filtered.splice(0..0, unaligned_parts);
    }
    Ok(filtered)
}

impl Build {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: BuildOptions,
        contigs: Vec<Contig>,
        contig_infos: Vec<ContigInfo>,
        tiles: TileMetadataList,
        barcodes: BarcodeMetadataList,
        bins: Vec<BinMetadata>,
    ) -> Result<Build> {
        let bins = arrange_bins(
            bins,
            &options.bin_filter,
            options.max_computers,
            options.keep_unaligned,
            options.put_unaligned_in_the_back,
        )?;
        let mapping = BarcodeBamMapping::new(&options.output_directory, &barcodes);
        let adapter = BamRecordAdapter::new(
            tiles,
            barcodes.clone(),
            options.include_tags,
            options.dodgy_alignment_score,
            options.pessimistic_mapq,
        );
        let stats = BuildStats::new(bins.len(), barcodes.len());
        let outputs = Self::create_output_files(&options, &mapping, &barcodes, &contig_infos)?;

        let build = Build {
            state: Mutex::new(SlotState {
                next_unprocessed: 0,
                next_unallocated: 0,
                next_unloaded: 0,
                next_unsaved: 0,
                loaders_available: options.max_loaders.max(1),
                computers_available: options.max_computers.max(1),
                compute_waiters: Vec::new(),
                force_termination: false,
                first_error: None,
            }),
            state_changed: Condvar::new(),
            options,
            contigs,
            barcodes,
            bins,
            mapping,
            adapter,
            outputs: Mutex::new(outputs),
            stats: Mutex::new(stats),
        };
        build.check_bins_fit_in_memory()?;
        Ok(build)
    }

    fn create_output_files(
        options: &BuildOptions,
        mapping: &BarcodeBamMapping,
        barcodes: &BarcodeMetadataList,
        contig_infos: &[ContigInfo],
    ) -> Result<Vec<SampleOutput>> {
        let mut outputs = Vec::with_capacity(mapping.total_samples());
        for (sample_index, path) in mapping.paths().iter().enumerate() {
            let sample_barcodes: Vec<u32> = barcodes
                .iter()
                .filter(|b| mapping.sample_index(b.index) as usize == sample_index)
                .map(|b| b.index)
                .collect();
            let unmapped = sample_barcodes
                .iter()
                .all(|&b| barcodes[b as usize].unmapped_reference);
            if unmapped {
                info!("skipping BAM for sample with unmapped reference: {:?}", path);
                outputs.push(SampleOutput {
                    path: path.clone(),
                    file: None,
                    index: None,
                });
                continue;
            }
            let parent = path
                .parent()
                .ok_or_else(|| BuildError::Config(format!("invalid output path {:?}", path)))?;
            std::fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
            let file = File::create(path).map_err(|e| BuildError::io(path, e))?;
            let mut file = BufWriter::new(file);

            let sample_name = sample_barcodes
                .first()
                .map(|&b| barcodes[b as usize].sample_name.clone())
                .unwrap_or_default();
            let mut header_writer = BgzfWriter::new(options.bam_gzip_level);
            serialize_header(
                &mut header_writer,
                &options.command_line,
                &sample_name,
                barcodes,
                &sample_barcodes,
                contig_infos,
            )?;
            let header = header_writer.finish()?;
            file.write_all(&header).map_err(|e| BuildError::io(path, e))?;
            info!("created BAM file: {:?}", path);

            let bai_path = bai_path(path);
            let bai_file = File::create(&bai_path).map_err(|e| BuildError::io(&bai_path, e))?;
            let index = BamIndex::new(
                BufWriter::new(bai_file),
                contig_infos.len() as u32,
                header.len() as u64,
            )?;
            outputs.push(SampleOutput {
                path: path.clone(),
                file: Some(file),
                index: Some(index),
            });
        }
        Ok(outputs)
    }

    /// Size of the compressed buffer one bin is expected to produce for one
    /// output file, scaled by the demultiplexed element share.
    fn estimate_bin_compressed_size(&self, bin: &BinMetadata, sample_index: usize) -> u64 {
        let total_elements = bin.total_elements();
        if total_elements == 0 {
            return EMPTY_BGZF_BLOCK_SIZE;
        }
        let sample_elements: u64 = self
            .barcodes
            .iter()
            .filter(|b| self.mapping.sample_index(b.index) as usize == sample_index)
            .map(|b| bin.barcode_elements(b.index as usize))
            .sum();
        let bin_bytes = BinSorter::memory_requirements(bin);
        let sample_share = (bin_bytes * sample_elements + total_elements - 1) / total_elements;
        EMPTY_BGZF_BLOCK_SIZE
            + (sample_share as f64 * self.options.expected_bgzf_compression_ratio) as u64
    }

    fn check_bins_fit_in_memory(&self) -> Result<()> {
        let limit = match self.options.memory_limit {
            Some(limit) => limit,
            None => return Ok(()),
        };
        for bin in &self.bins {
            let mut required = BinSorter::memory_requirements(bin);
            for sample_index in 0..self.mapping.total_samples() {
                required += self.estimate_bin_compressed_size(bin, sample_index);
            }
            if required > limit {
                return Err(BuildError::Memory {
                    bin: format!("{:?}", bin.data_path),
                    shortfall: required - limit,
                });
            }
        }
        Ok(())
    }

    /// Runs the pipeline to completion, then finalizes every output file
    /// and its index.
    pub fn run(&self) -> Result<()> {
        let worker_count = self
            .options
            .max_computers
            .max(self.options.max_loaders)
            .max(self.options.max_savers)
            .max(1);
        std::thread::scope(|scope| {
            for thread_number in 0..worker_count {
                scope.spawn(move || {
                    pin_to_numa_node(thread_number);
                    self.worker_loop(thread_number);
                });
            }
        });

        let mut state = self.state.lock().expect("state mutex poisoned");
        if let Some(error) = state.first_error.take() {
            return Err(error);
        }
        drop(state);

        let mut outputs = self.outputs.lock().expect("output mutex poisoned");
        for output in outputs.iter_mut() {
            if let Some(file) = output.file.as_mut() {
                file.write_all(&BGZF_EOF)
                    .and_then(|_| file.flush())
                    .map_err(|e| BuildError::io(&output.path, e))?;
                info!("BAM file generated: {:?}", output.path);
            }
            if let Some(index) = output.index.take() {
                index.finish()?;
                info!("BAM index generated for {:?}", output.path);
            }
        }
        drop(outputs);

        if let Some(path) = &self.options.stats_xml_path {
            let mut file = File::create(path)
                .map(BufWriter::new)
                .map_err(|e| BuildError::io(path, e))?;
            let stats = self.stats.lock().expect("stats mutex poisoned");
            stats.write_xml(&mut file, &self.bins, &self.barcodes)?;
        }
        Ok(())
    }

    fn worker_loop(&self, thread_number: usize) {
        loop {
            match self.process_one_bin(thread_number) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(error) => {
                    let mut state = self.state.lock().expect("state mutex poisoned");
                    if state.first_error.is_none() {
                        state.first_error = Some(error);
                    }
                    state.force_termination = true;
                    self.state_changed.notify_all();
                    break;
                }
            }
        }
    }

    /// One trip through the six-phase pipeline. Returns false when no bins
    /// are left (or the build is terminating).
    fn process_one_bin(&self, thread_number: usize) -> Result<bool> {
        let terminated = || BuildError::Invariant("terminating due to failures on other threads".to_string());

        let my_bin = {
            let mut state = self.state.lock().expect("state mutex poisoned");
            if state.force_termination || state.next_unprocessed >= self.bins.len() {
                return Ok(false);
            }
            let my_bin = state.next_unprocessed;
            state.next_unprocessed += 1;

            // AllocateMemory: strictly ordered by bin index
            while state.next_unallocated != my_bin {
                if state.force_termination {
                    return Ok(false);
                }
                state = self.state_changed.wait(state).expect("state mutex poisoned");
            }
            state.next_unallocated += 1;
            self.state_changed.notify_all();
            my_bin
        };

        let bin = &self.bins[my_bin];
        debug!("worker {} takes bin {} ({:?})", thread_number, bin.index, bin.data_path);
        let mut sorter = BinSorter::new(
            &self.options.sorter,
            &self.mapping,
            &self.contigs,
            bin,
            my_bin,
        );
        let mut writers: Vec<BgzfWriter> = (0..self.mapping.total_samples())
            .map(|sample| {
                BgzfWriter::with_output_capacity(
                    self.options.bam_gzip_level,
                    self.estimate_bin_compressed_size(bin, sample) as usize,
                )
            })
            .collect();
        let mut index_parts: Vec<BamIndexPart> = (0..self.mapping.total_samples())
            .map(|_| BamIndexPart::new())
            .collect();

        // Load slot
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            while state.next_unloaded != my_bin || state.loaders_available == 0 {
                if state.force_termination {
                    return Err(terminated());
                }
                state = self.state_changed.wait(state).expect("state mutex poisoned");
            }
            state.next_unloaded += 1;
            state.loaders_available -= 1;
            self.state_changed.notify_all();
        }
        let load_result = sorter.load();
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            state.loaders_available += 1;
            self.state_changed.notify_all();
        }
        load_result?;

        // Compute slot; the lowest waiting bin index goes first so small
        // bins do not starve behind large ones
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            state.compute_waiters.push(my_bin);
            while state.computers_available == 0
                || state.compute_waiters.iter().min() != Some(&my_bin)
            {
                if state.force_termination {
                    state.compute_waiters.retain(|&bin| bin != my_bin);
                    return Err(terminated());
                }
                state = self.state_changed.wait(state).expect("state mutex poisoned");
            }
            state.compute_waiters.retain(|&bin| bin != my_bin);
            state.computers_available -= 1;
            self.state_changed.notify_all();
        }
        let compute_result = (|| -> Result<()> {
            let mut local_stats = BuildStats::new(self.bins.len(), self.barcodes.len());
            let unique = sorter.process(&mut local_stats);
            if unique > 0 {
                sorter.reorder_for_bam();
                sorter.serialize(&self.adapter, &mut writers, &mut index_parts)?;
            }
            self.stats
                .lock()
                .expect("stats mutex poisoned")
                .merge(&local_stats);
            Ok(())
        })();
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            state.computers_available += 1;
            self.state_changed.notify_all();
        }
        compute_result?;
        // release the bin memory before queueing for the save slot
        drop(sorter);
        let buffers: Vec<Vec<u8>> = writers
            .into_iter()
            .map(BgzfWriter::finish)
            .collect::<Result<_>>()?;

        // Save slot: strictly ordered by bin index
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            while state.next_unsaved != my_bin {
                if state.force_termination {
                    return Err(terminated());
                }
                state = self.state_changed.wait(state).expect("state mutex poisoned");
            }
        }
        let save_result = self.save_buffers(&buffers, &index_parts);
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            state.next_unsaved += 1;
            self.state_changed.notify_all();
        }
        save_result?;
        Ok(true)
    }

    fn save_buffers(&self, buffers: &[Vec<u8>], index_parts: &[BamIndexPart]) -> Result<()> {
        let mut outputs = self.outputs.lock().expect("output mutex poisoned");
        for (sample_index, buffer) in buffers.iter().enumerate() {
            let output = &mut outputs[sample_index];
            let file = match output.file.as_mut() {
                Some(file) => file,
                None => {
                    if !buffer.is_empty() || !index_parts[sample_index].is_empty() {
                        return Err(BuildError::Invariant(format!(
                            "data produced for sample with unmapped reference: {:?}",
                            output.path
                        )));
                    }
                    continue;
                }
            };
            debug!("saving {} compressed bytes for {:?}", buffer.len(), output.path);
            file.write_all(buffer)
                .map_err(|e| BuildError::io(&output.path, e))?;
            if let Some(index) = output.index.as_mut() {
                index.process_index_part(&index_parts[sample_index], buffer)?;
            }
        }
        Ok(())
    }
}

fn bai_path(bam_path: &Path) -> PathBuf {
    let mut name = bam_path.as_os_str().to_os_string();
    name.push(".bai");
    PathBuf::from(name)
}
