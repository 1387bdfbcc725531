//! Reference FASTA loading.
//!
//! Contigs come out as contiguous upper-case ACGTN byte arrays, addressable
//! by `(contig id, offset)`, in file order so contig ids line up with the
//! BAM reference dictionary.

use std::path::Path;

use needletail::parse_fastx_file;

use crate::error::{BuildError, Result};
use crate::types::{Contig, ContigInfo};

fn normalize_base(base: u8) -> u8 {
    match base.to_ascii_uppercase() {
        b @ (b'A' | b'C' | b'G' | b'T') => b,
        _ => b'N',
    }
}

/// Loads every contig of a FASTA (optionally gzipped) file.
pub fn load_contigs(path: &Path) -> Result<(Vec<Contig>, Vec<ContigInfo>)> {
    let mut reader = parse_fastx_file(path)
        .map_err(|e| BuildError::Format(format!("cannot parse {:?}: {}", path, e)))?;
    let mut contigs = Vec::new();
    let mut infos = Vec::new();
    while let Some(record) = reader.next() {
        let record =
            record.map_err(|e| BuildError::Format(format!("cannot parse {:?}: {}", path, e)))?;
        let name = String::from_utf8_lossy(record.id())
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            return Err(BuildError::Format(format!(
                "unnamed sequence in {:?}",
                path
            )));
        }
        let forward: Vec<u8> = record.seq().iter().map(|&b| normalize_base(b)).collect();
        infos.push(ContigInfo {
            name: name.clone(),
            length: forward.len() as u64,
            assembly: None,
            uri: None,
            md5: None,
        });
        contigs.push(Contig { name, forward });
    }
    if contigs.is_empty() {
        return Err(BuildError::Format(format!(
            "no sequences found in {:?}",
            path
        )));
    }
    Ok((contigs, infos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_normalizes_contigs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, ">chr1 description text").unwrap();
        writeln!(file, "acgtACGT").unwrap();
        writeln!(file, "nnRYacgt").unwrap();
        writeln!(file, ">chr2").unwrap();
        writeln!(file, "TTTT").unwrap();
        file.flush().unwrap();

        let (contigs, infos) = load_contigs(file.path()).unwrap();
        assert_eq!(contigs.len(), 2);
        assert_eq!(contigs[0].name, "chr1");
        assert_eq!(&contigs[0].forward, b"ACGTACGTNNNNACGT");
        assert_eq!(infos[0].length, 16);
        assert_eq!(contigs[1].name, "chr2");
    }

    #[test]
    fn empty_file_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(load_contigs(file.path()).is_err());
    }
}
