//! BAM CIGAR encoding.
//!
//! Each operation is a 32-bit word: length in the high 28 bits, op code in
//! the low 4. Invariants maintained throughout the pipeline: at most one
//! soft clip at each end of a CIGAR, ALIGN segments are never empty.

use std::fmt;

/// CIGAR operation codes as defined by the BAM format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CigarOp {
    Align = 0,    // 'M'
    Insert = 1,   // 'I'
    Delete = 2,   // 'D'
    Skip = 3,     // 'N'
    SoftClip = 4, // 'S'
    HardClip = 5, // 'H'
    Pad = 6,      // 'P'
    Match = 7,    // '='
    Mismatch = 8, // 'X'
    Unknown = 9,  // '?'
}

impl CigarOp {
    pub fn to_char(self) -> char {
        const OP_CODES: [char; 10] = ['M', 'I', 'D', 'N', 'S', 'H', 'P', '=', 'X', '?'];
        OP_CODES[self as usize]
    }

    fn from_code(code: u32) -> CigarOp {
        match code {
            0 => CigarOp::Align,
            1 => CigarOp::Insert,
            2 => CigarOp::Delete,
            3 => CigarOp::Skip,
            4 => CigarOp::SoftClip,
            5 => CigarOp::HardClip,
            6 => CigarOp::Pad,
            7 => CigarOp::Match,
            8 => CigarOp::Mismatch,
            _ => CigarOp::Unknown,
        }
    }
}

pub fn encode(length: u32, op: CigarOp) -> u32 {
    debug_assert!(length < (1 << 28));
    (length << 4) | op as u32
}

pub fn decode(value: u32) -> (u32, CigarOp) {
    (value >> 4, CigarOp::from_code(value & 0x0f))
}

/// Number of read bases covered by the operations (ALIGN, INSERT, SOFT_CLIP).
pub fn read_length(cigar: &[u32]) -> u32 {
    cigar
        .iter()
        .map(|&word| match decode(word) {
            (len, CigarOp::Align | CigarOp::Insert | CigarOp::SoftClip) => len,
            _ => 0,
        })
        .sum()
}

/// Number of read bases aligned against the reference (ALIGN only).
pub fn mapped_length(cigar: &[u32]) -> u32 {
    cigar
        .iter()
        .map(|&word| match decode(word) {
            (len, CigarOp::Align) => len,
            _ => 0,
        })
        .sum()
}

/// Number of reference bases the alignment spans (ALIGN + DELETE + SKIP).
pub fn reference_length(cigar: &[u32]) -> u32 {
    cigar
        .iter()
        .map(|&word| match decode(word) {
            (len, CigarOp::Align | CigarOp::Delete | CigarOp::Skip) => len,
            _ => 0,
        })
        .sum()
}

/// Upper bound on the number of operations an alignment of a read of the
/// given length can produce: two soft clips, two hard clips, one ALIGN, and
/// two operations per indel assuming at least ten bases are needed to
/// justify an indel.
pub fn max_operations(read_length: u32) -> usize {
    const MIN_BASES_PER_INDEL: u32 = 10;
    const OPS_PER_INDEL: u32 = 2;
    let max_indels = read_length / MIN_BASES_PER_INDEL;
    (2 + 2 + 1 + max_indels * OPS_PER_INDEL) as usize
}

pub fn max_length_bytes(read_length: u32) -> usize {
    max_operations(read_length) * std::mem::size_of::<u32>()
}

/// Appends an operation, merging it with the last one when the op repeats.
pub fn append_operation(cigar: &mut Vec<u32>, length: u32, op: CigarOp) {
    if length == 0 {
        return;
    }
    if let Some(last) = cigar.last_mut() {
        let (last_len, last_op) = decode(*last);
        if last_op == op {
            *last = encode(last_len + length, op);
            return;
        }
    }
    cigar.push(encode(length, op));
}

pub fn to_string(cigar: &[u32]) -> String {
    let mut result = String::new();
    for &word in cigar {
        let (len, op) = decode(word);
        fmt::Write::write_fmt(&mut result, format_args!("{}{}", len, op.to_char()))
            .expect("formatting to a String cannot fail");
    }
    result
}
