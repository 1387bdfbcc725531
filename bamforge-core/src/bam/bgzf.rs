//! BGZF framing: gzip members of at most 64 KiB of payload, each carrying
//! its compressed size in the BC extra subfield, concatenated back to back.
//! Block boundaries are what make virtual file offsets possible.

use byteorder::{ByteOrder, LittleEndian};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use std::io::Write;

use crate::error::{BuildError, Result};

/// Payload bytes per block; kept under the 65535 format limit so a block
/// plus framing never overflows the BSIZE field.
pub const MAX_UNCOMPRESSED_BLOCK: usize = 0xff00;

const HEADER_SIZE: usize = 18;
const FOOTER_SIZE: usize = 8;

/// The 28-byte empty block every BGZF file ends with.
pub const BGZF_EOF: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Compresses a byte stream into a BGZF buffer. The output stays in memory:
/// one writer per (worker, output file), appended to the sample file under
/// the save slot.
pub struct BgzfWriter {
    level: Compression,
    pending: Vec<u8>,
    output: Vec<u8>,
    uncompressed_written: u64,
}

impl BgzfWriter {
    pub fn new(gzip_level: u32) -> Self {
        BgzfWriter {
            level: Compression::new(gzip_level),
            pending: Vec::with_capacity(MAX_UNCOMPRESSED_BLOCK),
            output: Vec::new(),
            uncompressed_written: 0,
        }
    }

    pub fn with_output_capacity(gzip_level: u32, capacity: usize) -> Self {
        let mut writer = Self::new(gzip_level);
        writer.output.reserve(capacity);
        writer
    }

    /// Total uncompressed bytes accepted so far; the index parts record
    /// their unresolved offsets in this coordinate space.
    pub fn uncompressed_position(&self) -> u64 {
        self.uncompressed_written + self.pending.len() as u64
    }

    pub fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = MAX_UNCOMPRESSED_BLOCK - self.pending.len();
            let take = room.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == MAX_UNCOMPRESSED_BLOCK {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut deflated = Vec::with_capacity(self.pending.len() / 2 + 64);
        let mut encoder = DeflateEncoder::new(&mut deflated, self.level);
        encoder
            .write_all(&self.pending)
            .and_then(|_| encoder.finish().map(|_| ()))
            .map_err(|e| BuildError::Format(format!("bgzf deflate failed: {}", e)))?;

        let block_size = HEADER_SIZE + deflated.len() + FOOTER_SIZE;
        if block_size > u16::MAX as usize + 1 {
            return Err(BuildError::Format(format!(
                "bgzf block of {} bytes exceeds the format limit",
                block_size
            )));
        }
        let mut header = [0u8; HEADER_SIZE];
        header[0] = 0x1f;
        header[1] = 0x8b;
        header[2] = 0x08; // deflate
        header[3] = 0x04; // FEXTRA
        header[9] = 0xff; // unknown OS
        header[10] = 0x06; // XLEN
        header[12] = b'B';
        header[13] = b'C';
        header[14] = 0x02; // subfield length
        LittleEndian::write_u16(&mut header[16..18], (block_size - 1) as u16);
        self.output.extend_from_slice(&header);
        self.output.extend_from_slice(&deflated);

        let mut crc = Crc::new();
        crc.update(&self.pending);
        let mut footer = [0u8; FOOTER_SIZE];
        LittleEndian::write_u32(&mut footer[0..4], crc.sum());
        LittleEndian::write_u32(&mut footer[4..8], self.pending.len() as u32);
        self.output.extend_from_slice(&footer);

        self.uncompressed_written += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Flushes the partial block and hands over the compressed buffer.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.flush_block()?;
        Ok(self.output)
    }
}

/// Reads one block's framing out of a BGZF buffer: returns
/// `(compressed size, uncompressed size)`.
pub fn peek_block(buffer: &[u8], offset: usize) -> Result<(usize, usize)> {
    let bad = |what: &str| {
        BuildError::Format(format!(
            "bgzf frame at offset {} is corrupt: {}",
            offset, what
        ))
    };
    if offset + HEADER_SIZE > buffer.len() {
        return Err(bad("truncated header"));
    }
    let header = &buffer[offset..offset + HEADER_SIZE];
    if header[0] != 0x1f || header[1] != 0x8b || header[2] != 0x08 {
        return Err(bad("bad gzip magic"));
    }
    if header[12] != b'B' || header[13] != b'C' {
        return Err(bad("missing BC subfield"));
    }
    let compressed = LittleEndian::read_u16(&header[16..18]) as usize + 1;
    if offset + compressed > buffer.len() {
        return Err(bad("truncated block"));
    }
    let uncompressed =
        LittleEndian::read_u32(&buffer[offset + compressed - 4..offset + compressed]) as usize;
    Ok((compressed, uncompressed))
}
