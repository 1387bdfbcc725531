//! The build manifest: the JSON document the match-selection stage leaves
//! behind to describe where the binned data lives and how to label it.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bin_metadata::BinMetadata;
use crate::error::{BuildError, Result};
use crate::types::{BarcodeMetadataList, TileMetadataList};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildManifest {
    /// Reference the bins were aligned against.
    pub reference_fasta: std::path::PathBuf,
    pub tiles: TileMetadataList,
    pub barcodes: BarcodeMetadataList,
    pub bins: Vec<BinMetadata>,
}

impl BuildManifest {
    pub fn load(path: &Path) -> Result<BuildManifest> {
        let file = File::open(path).map_err(|e| BuildError::io(path, e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| BuildError::Format(format!("cannot parse manifest {:?}: {}", path, e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| BuildError::io(path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| BuildError::Format(format!("cannot write manifest {:?}: {}", path, e)))
    }
}
