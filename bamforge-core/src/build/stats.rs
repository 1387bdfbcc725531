//! Build statistics: per-bin per-barcode fragment counters and their XML
//! dump.

use std::io::Write;

use crate::bin_metadata::BinMetadata;
use crate::error::{BuildError, Result};
use crate::types::BarcodeMetadataList;

#[derive(Debug, Clone, Copy, Default)]
struct BinBarcodeStats {
    total_fragments: u64,
    unique_fragments: u64,
}

/// `bin x barcode -> (totalFragments, uniqueFragments)`.
#[derive(Debug, Clone)]
pub struct BuildStats {
    barcode_count: usize,
    cells: Vec<BinBarcodeStats>,
}

impl BuildStats {
    pub fn new(bin_count: usize, barcode_count: usize) -> Self {
        BuildStats {
            barcode_count,
            cells: vec![BinBarcodeStats::default(); bin_count * barcode_count],
        }
    }

    fn cell(&self, bin: usize, barcode: usize) -> usize {
        bin * self.barcode_count + barcode
    }

    pub fn increment_total(&mut self, bin: usize, barcode: usize) {
        let cell = self.cell(bin, barcode);
        self.cells[cell].total_fragments += 1;
    }

    pub fn increment_unique(&mut self, bin: usize, barcode: usize) {
        let cell = self.cell(bin, barcode);
        self.cells[cell].unique_fragments += 1;
    }

    pub fn total(&self, bin: usize, barcode: usize) -> u64 {
        self.cells[self.cell(bin, barcode)].total_fragments
    }

    pub fn unique(&self, bin: usize, barcode: usize) -> u64 {
        self.cells[self.cell(bin, barcode)].unique_fragments
    }

    /// Folds per-worker counters back into the shared totals.
    pub fn merge(&mut self, other: &BuildStats) {
        debug_assert_eq!(self.cells.len(), other.cells.len());
        for (mine, theirs) in self.cells.iter_mut().zip(&other.cells) {
            mine.total_fragments += theirs.total_fragments;
            mine.unique_fragments += theirs.unique_fragments;
        }
    }

    /// Writes the statistics document consumed by downstream reporting.
    pub fn write_xml<W: Write>(
        &self,
        writer: &mut W,
        bins: &[BinMetadata],
        barcodes: &BarcodeMetadataList,
    ) -> Result<()> {
        let io = |e: std::io::Error| BuildError::io("<stats-xml>", e);
        writeln!(writer, "<?xml version=\"1.0\" encoding=\"utf-8\"?>").map_err(io)?;
        writeln!(writer, "<Stats>").map_err(io)?;
        for (bin_stats_index, bin) in bins.iter().enumerate() {
            writeln!(
                writer,
                "  <Bin index=\"{}\" start=\"{}\" length=\"{}\">",
                bin.index, bin.bin_start, bin.length
            )
            .map_err(io)?;
            for barcode in barcodes {
                let total = self.total(bin_stats_index, barcode.index as usize);
                let unique = self.unique(bin_stats_index, barcode.index as usize);
                if total == 0 && unique == 0 {
                    continue;
                }
                writeln!(
                    writer,
                    "    <Barcode index=\"{}\" sample=\"{}\" totalFragments=\"{}\" uniqueFragments=\"{}\"/>",
                    barcode.index, barcode.sample_name, total, unique
                )
                .map_err(io)?;
            }
            writeln!(writer, "  </Bin>").map_err(io)?;
        }
        writeln!(writer, "</Stats>").map_err(io)?;
        Ok(())
    }
}
