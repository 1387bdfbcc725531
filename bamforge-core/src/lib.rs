//! bamforge core library
//!
//! The post-alignment assembly core of a short-read aligner: templates are
//! resolved per cluster, collected into position-bounded bins, and each bin
//! is sorted, deduplicated, gap-realigned, clipped and serialized into
//! per-sample BGZF-compressed, indexed BAM files.

pub mod align;
pub mod alignment;
pub mod bam;
pub mod bin_metadata;
pub mod build;
pub mod cigar;
pub mod cluster;
pub mod collector;
pub mod error;
pub mod fasta;
pub mod fragment;
pub mod manifest;
pub mod position;
pub mod quality;
pub mod shadow;
pub mod template;
pub mod tls;
pub mod types;

// Re-export the types most callers touch
pub use bin_metadata::{BinFilter, BinIndexMap, BinMetadata};
pub use build::{Build, BuildOptions};
pub use error::{BuildError, Result};
pub use position::ReferencePosition;
pub use template::{BamTemplate, DodgyAlignmentScore, TemplateBuilder};

/// Version information for the bamforge core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
