//! Shared metadata records describing the inputs of a build.
//!
//! These are produced by the upstream stages (demultiplexing, tile discovery,
//! reference preparation) and consumed read-only by the assembly core. All of
//! them travel through the JSON build manifest.

use serde::{Deserialize, Serialize};

/// One reference contig: the forward sequence as upper-case ACGTN bytes.
#[derive(Debug, Clone)]
pub struct Contig {
    pub name: String,
    pub forward: Vec<u8>,
}

impl Contig {
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

/// Contig entry of the BAM reference dictionary (@SQ line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContigInfo {
    pub name: String,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

/// Flowcell tile identity, used for read-name formatting
/// (`flowcell:lane:tile:cluster:0`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileMetadata {
    pub flowcell_id: String,
    pub lane: String,
    pub tile: String,
    pub cluster_count: u64,
}

/// One demultiplexed barcode and the sample it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarcodeMetadata {
    /// 0-based unique barcode index, stable across the whole analysis.
    pub index: u32,
    pub sample_name: String,
    pub project: String,
    /// Index into the reference list this barcode's sample aligns against.
    pub reference_index: u32,
    /// Barcode sequence from the sample sheet; the BC tag falls back to it
    /// when the flowcell carries no barcode cycles.
    pub barcode_sequence: String,
    /// Samples whose reference is not loaded produce no BAM output.
    #[serde(default)]
    pub unmapped_reference: bool,
}

pub type ContigList = Vec<Contig>;
pub type TileMetadataList = Vec<TileMetadata>;
pub type BarcodeMetadataList = Vec<BarcodeMetadata>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barcode_metadata_round_trips_through_json() {
        let barcode = BarcodeMetadata {
            index: 3,
            sample_name: "NA12878".to_string(),
            project: "wgs".to_string(),
            reference_index: 0,
            barcode_sequence: "ACGTAC".to_string(),
            unmapped_reference: false,
        };
        let json = serde_json::to_string(&barcode).unwrap();
        let back: BarcodeMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index, 3);
        assert_eq!(back.sample_name, "NA12878");
        assert_eq!(back.barcode_sequence, "ACGTAC");
    }
}
