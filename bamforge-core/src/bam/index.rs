//! Concurrent BAI construction.
//!
//! While a worker serializes a bin, its [`BamIndexPart`] records chunk and
//! linear-index samples in *uncompressed* byte coordinates, because the BGZF
//! block boundaries are not final yet. When the compressed buffer is
//! appended to the output file under the save slot, [`BamIndex`] walks the
//! buffer's frames and resolves every unresolved offset into a virtual
//! offset `(compressed block start, offset within block)`.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

use super::bgzf;
use super::{reg2bin, BamRecordMeta};
use crate::error::{BuildError, Result};

/// 512 Mbases, the longest contig a BAI linear index can cover.
pub const BAM_MAX_CONTIG_LENGTH: u32 = 512 * 1024 * 1024;

/// `(8^6 - 1) / 7 + 1`, as defined by samtools.
pub const BAM_MAX_BIN: u32 = 37450;

/// Expected clusters per index bin; chunks merge across bin boundaries
/// within this many uncompressed bytes.
const BAM_MIN_CHUNK_GAP: u64 = 32768;

const UNSET_OFFSET: u64 = u64::MAX;

/// `(compressed offset: 48 bits, offset in block: 16 bits)` packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    pub fn new(compressed_offset: u64, offset_in_block: u16) -> Self {
        VirtualOffset(compressed_offset << 16 | offset_in_block as u64)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn compressed_offset(self) -> u64 {
        self.0 >> 16
    }

    pub fn uncompressed_offset(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UnresolvedBinIndexChunk {
    pub start: u64,
    pub end: u64,
    pub bin: u32,
    pub ref_id: u32,
}

/// Per-(worker, output file) index accumulation over one bin's records.
#[derive(Default)]
pub struct BamIndexPart {
    local_uncompressed_offset: u64,
    chunks: Vec<UnresolvedBinIndexChunk>,
    linear: Vec<u64>,
    mapped: u64,
    unmapped: u64,
}

impl BamIndexPart {
    pub fn new() -> Self {
        BamIndexPart::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.mapped == 0 && self.unmapped == 0
    }

    /// Accounts one serialized record.
    pub fn process_fragment(&mut self, meta: &BamRecordMeta, serialized_length: u32) -> Result<()> {
        if meta.pos >= 0 {
            // samtools derives the bin from the sequence length rather than
            // the observed span; stay byte-compatible
            let bin = reg2bin(meta.pos as u32, meta.pos as u32 + meta.seq_len.max(1)) as u32;
            self.add_chunk(
                self.local_uncompressed_offset,
                self.local_uncompressed_offset + serialized_length as u64,
                bin,
                meta.ref_id as u32,
            );
            self.add_to_linear_index(meta.pos as u32, self.local_uncompressed_offset)?;
            if meta.observed_length > 0 {
                self.add_to_linear_index(
                    meta.pos as u32 + meta.observed_length - 1,
                    self.local_uncompressed_offset,
                )?;
            }
        }
        if meta.unmapped {
            self.unmapped += 1;
        } else {
            self.mapped += 1;
        }
        self.local_uncompressed_offset += serialized_length as u64;
        Ok(())
    }

    fn add_chunk(&mut self, start: u64, end: u64, bin: u32, ref_id: u32) {
        debug_assert!(bin < BAM_MAX_BIN);
        if let Some(last) = self.chunks.last_mut() {
            if last.bin == bin && last.ref_id == ref_id {
                last.end = end;
                return;
            }
        }
        if self.chunks.len() >= 2 {
            let previous = self.chunks[self.chunks.len() - 2];
            if previous.bin == bin
                && previous.ref_id == ref_id
                && previous.end + BAM_MIN_CHUNK_GAP > end
            {
                // chunk reduction around the boundary of two adjacent bins
                let at = self.chunks.len() - 2;
                self.chunks[at].end = end;
                return;
            }
        }
        self.chunks.push(UnresolvedBinIndexChunk {
            start,
            end,
            bin,
            ref_id,
        });
    }

    fn add_to_linear_index(&mut self, pos: u32, offset: u64) -> Result<()> {
        if pos >= BAM_MAX_CONTIG_LENGTH {
            return Err(BuildError::Invariant(format!(
                "position {} exceeds the maximum the BAM index supports",
                pos
            )));
        }
        let linear_bin = (pos >> 14) as usize;
        if self.linear.len() <= linear_bin {
            let fill = self.linear.last().copied().unwrap_or(UNSET_OFFSET);
            self.linear.resize(linear_bin + 1, fill);
            self.linear[linear_bin] = offset;
        }
        Ok(())
    }
}

/// Walks a BGZF buffer frame by frame, translating uncompressed offsets
/// into virtual offsets.
struct OffsetResolver<'a> {
    buffer: &'a [u8],
    compressed_position: u64,
    uncompressed_position: u64,
    compressed_size: usize,
    uncompressed_size: usize,
}

impl<'a> OffsetResolver<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        OffsetResolver {
            buffer,
            compressed_position: 0,
            uncompressed_position: 0,
            compressed_size: 0,
            uncompressed_size: 0,
        }
    }

    /// `position_in_bam` is the compressed offset the buffer will land at.
    fn resolve(&mut self, unresolved: u64, position_in_bam: u64) -> Result<VirtualOffset> {
        if unresolved < self.uncompressed_position {
            // offsets normally arrive in order; restart for the stragglers
            *self = OffsetResolver::new(self.buffer);
        }
        while unresolved >= self.uncompressed_position + self.uncompressed_size as u64 {
            self.compressed_position += self.compressed_size as u64;
            self.uncompressed_position += self.uncompressed_size as u64;
            if self.compressed_position as usize == self.buffer.len() {
                self.compressed_size = 0;
                self.uncompressed_size = 0;
                break;
            }
            let (compressed, uncompressed) =
                bgzf::peek_block(self.buffer, self.compressed_position as usize)?;
            self.compressed_size = compressed;
            self.uncompressed_size = uncompressed;
        }
        Ok(VirtualOffset::new(
            self.compressed_position + position_in_bam,
            (unresolved - self.uncompressed_position) as u16,
        ))
    }
}

/// Merges resolved index parts and writes the `.bai` stream.
pub struct BamIndex<W: Write> {
    sink: W,
    ref_count: u32,
    last_processed_ref: Option<u32>,
    bin_index: Vec<Vec<(VirtualOffset, VirtualOffset)>>,
    linear_index: Vec<VirtualOffset>,
    mapped: u64,
    unmapped: u64,
    no_coordinate: u64,
    position_in_bam: u64,
}

impl<W: Write> BamIndex<W> {
    /// `header_compressed_length` is where alignment blocks start in the
    /// output file.
    pub fn new(mut sink: W, ref_count: u32, header_compressed_length: u64) -> Result<Self> {
        let io = |e: std::io::Error| BuildError::io("<bai>", e);
        sink.write_all(b"BAI\x01").map_err(io)?;
        sink.write_u32::<LittleEndian>(ref_count).map_err(io)?;
        Ok(BamIndex {
            sink,
            ref_count,
            last_processed_ref: None,
            bin_index: vec![Vec::new(); BAM_MAX_BIN as usize],
            linear_index: Vec::new(),
            mapped: 0,
            unmapped: 0,
            no_coordinate: 0,
            position_in_bam: header_compressed_length,
        })
    }

    /// Folds one part into the per-contig structures, resolving offsets
    /// against the BGZF buffer about to be appended to the BAM.
    pub fn process_index_part(&mut self, part: &BamIndexPart, bgzf_buffer: &[u8]) -> Result<()> {
        if bgzf_buffer.is_empty() {
            return Ok(());
        }
        if !part.chunks.is_empty() {
            let ref_id = part.chunks[0].ref_id;
            debug_assert!(
                part.chunks.iter().all(|chunk| chunk.ref_id == ref_id),
                "an index part never spans contigs"
            );
            while self.last_processed_ref != Some(ref_id) {
                match self.last_processed_ref {
                    None => self.last_processed_ref = Some(0),
                    Some(done) if done < ref_id => {
                        self.write_reference_index(done)?;
                        self.last_processed_ref = Some(done + 1);
                    }
                    Some(done) => {
                        return Err(BuildError::Invariant(format!(
                            "index part for reference {} arrived after reference {}",
                            ref_id, done
                        )));
                    }
                }
            }

            let mut resolver = OffsetResolver::new(bgzf_buffer);
            for chunk in &part.chunks {
                let start = resolver.resolve(chunk.start, self.position_in_bam)?;
                let end = resolver.resolve(chunk.end, self.position_in_bam)?;
                let bin = &mut self.bin_index[chunk.bin as usize];
                match bin.last_mut() {
                    Some(last) if last.1.compressed_offset() == start.compressed_offset() => {
                        last.1 = end;
                    }
                    _ => bin.push((start, end)),
                }
            }
            if self.linear_index.len() < part.linear.len() {
                self.linear_index
                    .resize(part.linear.len(), VirtualOffset::default());
            }
            for (at, &unresolved) in part.linear.iter().enumerate() {
                if unresolved == UNSET_OFFSET {
                    continue;
                }
                let resolved = resolver.resolve(unresolved, self.position_in_bam)?;
                let current = self.linear_index[at];
                if current.value() == 0 || resolved < current {
                    self.linear_index[at] = resolved;
                }
            }
            self.mapped += part.mapped;
            self.unmapped += part.unmapped;
        } else {
            // block of reads without coordinates
            self.no_coordinate += part.unmapped;
        }
        self.position_in_bam += bgzf_buffer.len() as u64;
        Ok(())
    }

    fn write_reference_index(&mut self, _ref_id: u32) -> Result<()> {
        let io = |e: std::io::Error| BuildError::io("<bai>", e);
        let populated_bins = self.bin_index.iter().filter(|bin| !bin.is_empty()).count() as u32;

        if populated_bins > 0 || self.mapped > 0 || self.unmapped > 0 {
            // one extra for the samtools special bin
            self.sink
                .write_u32::<LittleEndian>(populated_bins + 1)
                .map_err(io)?;
            let mut off_begin = u64::MAX;
            let mut off_end = 0u64;
            for (bin_number, bin) in self.bin_index.iter().enumerate() {
                if bin.is_empty() {
                    continue;
                }
                self.sink
                    .write_u32::<LittleEndian>(bin_number as u32)
                    .map_err(io)?;
                self.sink
                    .write_u32::<LittleEndian>(bin.len() as u32)
                    .map_err(io)?;
                for &(start, end) in bin {
                    self.sink.write_u64::<LittleEndian>(start.value()).map_err(io)?;
                    self.sink.write_u64::<LittleEndian>(end.value()).map_err(io)?;
                }
                off_begin = off_begin.min(bin[0].0.value());
                off_end = off_end.max(bin[bin.len() - 1].1.value());
            }
            if off_begin == u64::MAX {
                off_begin = 0;
            }
            // samtools' special bin: offsets then mapped/unmapped counters
            self.sink.write_u32::<LittleEndian>(BAM_MAX_BIN).map_err(io)?;
            self.sink.write_u32::<LittleEndian>(2).map_err(io)?;
            self.sink.write_u64::<LittleEndian>(off_begin).map_err(io)?;
            self.sink.write_u64::<LittleEndian>(off_end).map_err(io)?;
            self.sink.write_u64::<LittleEndian>(self.mapped).map_err(io)?;
            self.sink.write_u64::<LittleEndian>(self.unmapped).map_err(io)?;
        } else {
            self.sink.write_u32::<LittleEndian>(0).map_err(io)?;
        }

        self.sink
            .write_u32::<LittleEndian>(self.linear_index.len() as u32)
            .map_err(io)?;
        for offset in &self.linear_index {
            self.sink
                .write_u64::<LittleEndian>(offset.value())
                .map_err(io)?;
        }

        self.mapped = 0;
        self.unmapped = 0;
        for bin in &mut self.bin_index {
            bin.clear();
        }
        self.linear_index.clear();
        Ok(())
    }

    /// Emits the remaining reference sections and the no-coordinate footer.
    pub fn finish(mut self) -> Result<W> {
        let mut done = self.last_processed_ref.unwrap_or(0);
        while done < self.ref_count {
            self.write_reference_index(done)?;
            done += 1;
        }
        let io = |e: std::io::Error| BuildError::io("<bai>", e);
        self.sink
            .write_u64::<LittleEndian>(self.no_coordinate)
            .map_err(io)?;
        self.sink.flush().map_err(io)?;
        Ok(self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bam::bgzf::BgzfWriter;
    use byteorder::ByteOrder;

    fn meta(ref_id: i32, pos: i32, seq_len: u32) -> BamRecordMeta {
        BamRecordMeta {
            ref_id,
            pos,
            seq_len,
            observed_length: seq_len,
            unmapped: false,
        }
    }

    #[test]
    fn virtual_offset_packing() {
        let offset = VirtualOffset::new(0x0001_0000_0000, 513);
        assert_eq!(offset.compressed_offset(), 0x0001_0000_0000);
        assert_eq!(offset.uncompressed_offset(), 513);
        assert_eq!(offset.value(), 0x0001_0000_0000 << 16 | 513);
    }

    #[test]
    fn adjacent_records_of_one_bin_coalesce() {
        let mut part = BamIndexPart::new();
        part.process_fragment(&meta(0, 100, 100), 200).unwrap();
        part.process_fragment(&meta(0, 150, 100), 200).unwrap();
        assert_eq!(part.chunks.len(), 1);
        assert_eq!(part.chunks[0].start, 0);
        assert_eq!(part.chunks[0].end, 400);
        assert_eq!(part.mapped, 2);
    }

    #[test]
    fn linear_index_keeps_first_offset_per_window() {
        let mut part = BamIndexPart::new();
        part.process_fragment(&meta(0, 100, 100), 200).unwrap();
        part.process_fragment(&meta(0, 20000, 100), 200).unwrap();
        assert_eq!(part.linear.len(), 2);
        assert_eq!(part.linear[0], 0);
        assert_eq!(part.linear[1], 200);
    }

    #[test]
    fn oversized_position_is_rejected() {
        let mut part = BamIndexPart::new();
        assert!(part
            .process_fragment(&meta(0, BAM_MAX_CONTIG_LENGTH as i32, 100), 200)
            .is_err());
    }

    #[test]
    fn resolver_translates_offsets_across_blocks() {
        // two blocks of known uncompressed sizes
        let mut writer = BgzfWriter::new(1);
        let block = vec![7u8; crate::bam::bgzf::MAX_UNCOMPRESSED_BLOCK];
        writer.write_all(&block).unwrap();
        writer.write_all(&[9u8; 100]).unwrap();
        let buffer = writer.finish().unwrap();
        let (first_block_size, first_uncompressed) = bgzf::peek_block(&buffer, 0).unwrap();
        assert_eq!(first_uncompressed, crate::bam::bgzf::MAX_UNCOMPRESSED_BLOCK);

        let mut resolver = OffsetResolver::new(&buffer);
        let inside_first = resolver.resolve(100, 1000).unwrap();
        assert_eq!(inside_first.compressed_offset(), 1000);
        assert_eq!(inside_first.uncompressed_offset(), 100);
        let inside_second = resolver
            .resolve(crate::bam::bgzf::MAX_UNCOMPRESSED_BLOCK as u64 + 5, 1000)
            .unwrap();
        assert_eq!(
            inside_second.compressed_offset(),
            1000 + first_block_size as u64
        );
        assert_eq!(inside_second.uncompressed_offset(), 5);
    }

    #[test]
    fn bai_stream_layout() {
        let mut part = BamIndexPart::new();
        part.process_fragment(&meta(0, 100, 100), 200).unwrap();
        let mut writer = BgzfWriter::new(1);
        writer.write_all(&[0u8; 200]).unwrap();
        let buffer = writer.finish().unwrap();

        let mut index = BamIndex::new(Vec::new(), 1, 0).unwrap();
        index.process_index_part(&part, &buffer).unwrap();
        let bai = index.finish().unwrap();

        assert_eq!(&bai[0..4], b"BAI\x01");
        assert_eq!(LittleEndian::read_u32(&bai[4..8]), 1); // n_ref
        let n_bin = LittleEndian::read_u32(&bai[8..12]);
        assert_eq!(n_bin, 2); // the record's bin + the special bin
        let bin_number = LittleEndian::read_u32(&bai[12..16]);
        assert_eq!(bin_number, reg2bin(100, 200) as u32);
        let n_chunk = LittleEndian::read_u32(&bai[16..20]);
        assert_eq!(n_chunk, 1);
        // special bin follows the chunk pair
        let special_at = 20 + 16;
        assert_eq!(LittleEndian::read_u32(&bai[special_at..]), BAM_MAX_BIN);
        assert_eq!(LittleEndian::read_u32(&bai[special_at + 4..]), 2);
        let mapped_at = special_at + 8 + 16;
        assert_eq!(LittleEndian::read_u64(&bai[mapped_at..]), 1); // mapped
        assert_eq!(LittleEndian::read_u64(&bai[mapped_at + 8..]), 0); // unmapped
        let n_intv_at = mapped_at + 16;
        assert_eq!(LittleEndian::read_u32(&bai[n_intv_at..]), 1);
        // trailing no-coordinate counter closes the file
        assert_eq!(LittleEndian::read_u64(&bai[bai.len() - 8..]), 0);
    }
}
