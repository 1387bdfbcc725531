//! Packed reference positions.
//!
//! A `ReferencePosition` is a 64-bit value holding `(contig id, offset)` with
//! the contig id in the high 24 bits and the offset in the low 40. Two contig
//! ids are reserved as sentinels: `NO_MATCH` for fragments with no placement
//! and `TOO_MANY_MATCH` for fragments matching too many locations (also the
//! bin-start marker of the unaligned bin). Because the sentinels use the
//! largest contig ids, the natural `u64` order is the required total order
//! with sentinels greater than any real position.

use serde::{Deserialize, Serialize};
use std::fmt;

const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

pub const MAX_CONTIG_ID: u32 = (1 << 24) - 1;
const NO_MATCH_CONTIG: u32 = MAX_CONTIG_ID;
const TOO_MANY_MATCH_CONTIG: u32 = MAX_CONTIG_ID - 1;

/// Decomposed view of a packed position, for pattern matching at use sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionKind {
    Aligned { contig_id: u32, offset: i64 },
    NoMatch,
    TooManyMatch,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReferencePosition(u64);

impl ReferencePosition {
    pub const NO_MATCH: ReferencePosition =
        ReferencePosition((NO_MATCH_CONTIG as u64) << OFFSET_BITS);
    pub const TOO_MANY_MATCH: ReferencePosition =
        ReferencePosition((TOO_MANY_MATCH_CONTIG as u64) << OFFSET_BITS);

    pub fn new(contig_id: u32, offset: i64) -> Self {
        debug_assert!(contig_id <= MAX_CONTIG_ID);
        debug_assert!(offset >= 0 && (offset as u64) <= OFFSET_MASK);
        ReferencePosition(((contig_id as u64) << OFFSET_BITS) | (offset as u64 & OFFSET_MASK))
    }

    pub fn from_value(value: u64) -> Self {
        ReferencePosition(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn contig_id(self) -> u32 {
        (self.0 >> OFFSET_BITS) as u32
    }

    /// Offset within the contig. Only a few bits are used for the contig, so
    /// the conversion to signed is always safe.
    pub fn offset(self) -> i64 {
        (self.0 & OFFSET_MASK) as i64
    }

    pub fn is_no_match(self) -> bool {
        self.contig_id() == NO_MATCH_CONTIG
    }

    pub fn is_too_many_match(self) -> bool {
        self.contig_id() == TOO_MANY_MATCH_CONTIG
    }

    pub fn kind(self) -> PositionKind {
        match self.contig_id() {
            NO_MATCH_CONTIG => PositionKind::NoMatch,
            TOO_MANY_MATCH_CONTIG => PositionKind::TooManyMatch,
            contig_id => PositionKind::Aligned {
                contig_id,
                offset: self.offset(),
            },
        }
    }

    /// Position shifted right by `length` bases on the same contig.
    pub fn add(self, length: u64) -> ReferencePosition {
        debug_assert!(!self.is_no_match() && !self.is_too_many_match());
        ReferencePosition(self.0 + length)
    }

    /// Position shifted left. The result may only be used transiently while a
    /// CIGAR is under construction; final positions are never negative.
    pub fn checked_sub(self, length: u64) -> Option<ReferencePosition> {
        if (self.0 & OFFSET_MASK) >= length {
            Some(ReferencePosition(self.0 - length))
        } else {
            None
        }
    }

    /// Signed distance in bases to another position on the same contig.
    pub fn distance(self, other: ReferencePosition) -> i64 {
        debug_assert_eq!(self.contig_id(), other.contig_id());
        self.offset() - other.offset()
    }
}

impl fmt::Debug for ReferencePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            PositionKind::Aligned { contig_id, offset } => write!(f, "{}:{}", contig_id, offset),
            PositionKind::NoMatch => write!(f, "NoMatch"),
            PositionKind::TooManyMatch => write!(f, "TooManyMatch"),
        }
    }
}

impl fmt::Display for ReferencePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
