//! Mapping barcodes to output BAM files.
//!
//! Every barcode belongs to a `(project, sample)` pair; all barcodes of one
//! sample share one output file at `<out>/<project>/<sample>/sorted.bam`.

use std::path::{Path, PathBuf};

use crate::types::BarcodeMetadataList;

#[derive(Debug, Clone)]
pub struct BarcodeBamMapping {
    barcode_project_index: Vec<u32>,
    barcode_sample_index: Vec<u32>,
    sample_paths: Vec<PathBuf>,
    project_index_max: u32,
}

fn sample_bam_path(output_directory: &Path, project: &str, sample: &str) -> PathBuf {
    output_directory.join(project).join(sample).join("sorted.bam")
}

impl BarcodeBamMapping {
    pub fn new(output_directory: &Path, barcodes: &BarcodeMetadataList) -> Self {
        let mut projects: Vec<&str> = barcodes.iter().map(|b| b.project.as_str()).collect();
        projects.sort_unstable();
        projects.dedup();

        let mut sample_paths: Vec<PathBuf> = barcodes
            .iter()
            .map(|b| sample_bam_path(output_directory, &b.project, &b.sample_name))
            .collect();
        sample_paths.sort();
        sample_paths.dedup();

        let mut barcode_project_index = vec![0u32; barcodes.len()];
        let mut barcode_sample_index = vec![0u32; barcodes.len()];
        for barcode in barcodes {
            barcode_project_index[barcode.index as usize] = projects
                .binary_search(&barcode.project.as_str())
                .expect("barcode project must be in the project list")
                as u32;
            let path = sample_bam_path(output_directory, &barcode.project, &barcode.sample_name);
            barcode_sample_index[barcode.index as usize] = sample_paths
                .binary_search(&path)
                .expect("barcode sample path must be in the path list")
                as u32;
        }
        let project_index_max = barcode_project_index.iter().copied().max().unwrap_or(0);
        BarcodeBamMapping {
            barcode_project_index,
            barcode_sample_index,
            sample_paths,
            project_index_max,
        }
    }

    pub fn sample_index_map(&self) -> &[u32] {
        &self.barcode_sample_index
    }

    pub fn sample_index(&self, barcode_index: u32) -> u32 {
        self.barcode_sample_index[barcode_index as usize]
    }

    pub fn project_index(&self, barcode_index: u32) -> u32 {
        self.barcode_project_index[barcode_index as usize]
    }

    pub fn max_project_index(&self) -> u32 {
        self.project_index_max
    }

    pub fn total_samples(&self) -> usize {
        self.sample_paths.len()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.sample_paths
    }

    pub fn path_for_barcode(&self, barcode_index: u32) -> &Path {
        &self.sample_paths[self.sample_index(barcode_index) as usize]
    }
}
