//! BAM serialization: header, reference dictionary and alignment records,
//! written through the BGZF compressor.

pub mod bgzf;
pub mod index;

use byteorder::{ByteOrder, LittleEndian};

use crate::build::packed_buffer::{Index, PackedFragmentBuffer};
use crate::cigar;
use crate::cluster::{bcl_quality, is_bcl_n};
use crate::error::{BuildError, Result};
use crate::fragment::{FragmentRef, DODGY_ALIGNMENT_SCORE};
use crate::template::DodgyAlignmentScore;
use crate::types::{BarcodeMetadataList, ContigInfo, TileMetadataList};
use bgzf::BgzfWriter;

pub const BAM_MAGIC: &[u8; 4] = b"BAM\x01";

/// Which optional tags the records carry.
#[derive(Debug, Clone, Copy)]
pub struct IncludeTags {
    pub with_as: bool,
    pub with_bc: bool,
    pub with_nm: bool,
    pub with_oc: bool,
    pub with_rg: bool,
    pub with_sm: bool,
    pub with_zx: bool,
    pub with_zy: bool,
}

impl Default for IncludeTags {
    fn default() -> Self {
        IncludeTags {
            with_as: true,
            with_bc: true,
            with_nm: true,
            with_oc: true,
            with_rg: true,
            with_sm: true,
            with_zx: false,
            with_zy: false,
        }
    }
}

impl IncludeTags {
    /// Parses the `--include-tags` comma-separated list.
    pub fn parse(value: &str) -> Result<IncludeTags> {
        let mut tags = IncludeTags {
            with_as: false,
            with_bc: false,
            with_nm: false,
            with_oc: false,
            with_rg: false,
            with_sm: false,
            with_zx: false,
            with_zy: false,
        };
        for tag in value.split(',').filter(|t| !t.is_empty()) {
            match tag {
                "AS" => tags.with_as = true,
                "BC" => tags.with_bc = true,
                "NM" => tags.with_nm = true,
                "OC" => tags.with_oc = true,
                "RG" => tags.with_rg = true,
                "SM" => tags.with_sm = true,
                "ZX" => tags.with_zx = true,
                "ZY" => tags.with_zy = true,
                other => {
                    return Err(BuildError::Config(format!("unknown tag: {}", other)));
                }
            }
        }
        Ok(tags)
    }
}

/// The standard nested-bin number for a region `[beg, end)`.
pub fn reg2bin(beg: u32, end: u32) -> u16 {
    let end = end - 1;
    if beg >> 14 == end >> 14 {
        return (4681 + (beg >> 14)) as u16;
    }
    if beg >> 17 == end >> 17 {
        return (585 + (beg >> 17)) as u16;
    }
    if beg >> 20 == end >> 20 {
        return (73 + (beg >> 20)) as u16;
    }
    if beg >> 23 == end >> 23 {
        return (9 + (beg >> 23)) as u16;
    }
    if beg >> 26 == end >> 26 {
        return (1 + (beg >> 26)) as u16;
    }
    0
}

/// Writes the BAM header and reference dictionary for one sample file.
pub fn serialize_header(
    writer: &mut BgzfWriter,
    command_line: &str,
    sample_name: &str,
    barcodes: &BarcodeMetadataList,
    sample_barcode_indexes: &[u32],
    contigs: &[ContigInfo],
) -> Result<()> {
    let mut text = String::new();
    text.push_str("@HD\tVN:1.4\tSO:coordinate\n");
    text.push_str(&format!(
        "@PG\tID:bamforge\tPN:bamforge\tCL:{}\tVN:{}\n",
        command_line,
        env!("CARGO_PKG_VERSION")
    ));
    for &barcode_index in sample_barcode_indexes {
        let barcode = &barcodes[barcode_index as usize];
        text.push_str(&format!(
            "@RG\tID:{}\tSM:{}\n",
            barcode.index, sample_name
        ));
    }
    for contig in contigs {
        text.push_str(&format!("@SQ\tSN:{}\tLN:{}", contig.name, contig.length));
        if let Some(assembly) = &contig.assembly {
            text.push_str(&format!("\tAS:{}", assembly));
        }
        if let Some(uri) = &contig.uri {
            text.push_str(&format!("\tUR:{}", uri));
        }
        if let Some(md5) = &contig.md5 {
            text.push_str(&format!("\tM5:{}", md5));
        }
        text.push('\n');
    }

    let mut buf = Vec::with_capacity(text.len() + 64);
    buf.extend_from_slice(BAM_MAGIC);
    let mut scratch = [0u8; 4];
    LittleEndian::write_i32(&mut scratch, text.len() as i32);
    buf.extend_from_slice(&scratch);
    buf.extend_from_slice(text.as_bytes());
    LittleEndian::write_i32(&mut scratch, contigs.len() as i32);
    buf.extend_from_slice(&scratch);
    for contig in contigs {
        LittleEndian::write_i32(&mut scratch, contig.name.len() as i32 + 1);
        buf.extend_from_slice(&scratch);
        buf.extend_from_slice(contig.name.as_bytes());
        buf.push(0);
        LittleEndian::write_i32(&mut scratch, contig.length as i32);
        buf.extend_from_slice(&scratch);
    }
    writer.write_all(&buf)
}

fn bam_base_from_bcl(byte: u8) -> u8 {
    if is_bcl_n(byte) {
        15
    } else {
        1 << (byte & 0x03)
    }
}

/// Everything `serialize_alignment` needs about one record, assembled from
/// the packed buffer and the index entry.
pub struct BamRecordView<'a> {
    pub ref_id: i32,
    pub pos: i32,
    pub observed_length: u32,
    pub flag: u16,
    pub mapq: u8,
    pub read_name: String,
    pub cigar: &'a [u32],
    pub bases: &'a [u8],
    pub next_ref_id: i32,
    pub next_pos: i32,
    pub tlen: i32,
    pub sm: Option<i32>,
    pub r#as: Option<i32>,
    pub rg: Option<String>,
    pub nm: Option<i32>,
    pub bc: Option<String>,
    pub oc: Option<String>,
    pub zx: Option<i32>,
    pub zy: Option<i32>,
}

/// Translates packed records into BAM record views: read names, flags,
/// MAPQ policy and the optional tag set.
pub struct BamRecordAdapter {
    tile_metadata: TileMetadataList,
    barcodes: BarcodeMetadataList,
    include_tags: IncludeTags,
    dodgy_alignment_score: DodgyAlignmentScore,
    pessimistic_mapq: bool,
}

impl BamRecordAdapter {
    pub fn new(
        tile_metadata: TileMetadataList,
        barcodes: BarcodeMetadataList,
        include_tags: IncludeTags,
        dodgy_alignment_score: DodgyAlignmentScore,
        pessimistic_mapq: bool,
    ) -> Self {
        BamRecordAdapter {
            tile_metadata,
            barcodes,
            include_tags,
            dodgy_alignment_score,
            pessimistic_mapq,
        }
    }

    fn read_name(&self, fragment: &FragmentRef<'_>) -> String {
        let tile = &self.tile_metadata[fragment.tile() as usize];
        format!(
            "{}:{}:{}:{}:0",
            tile.flowcell_id,
            tile.lane,
            tile.tile,
            fragment.cluster_id()
        )
    }

    fn flag(&self, fragment: &FragmentRef<'_>) -> u16 {
        let flags = fragment.flags();
        (flags.paired as u16)
            | (flags.proper_pair as u16) << 1
            | (flags.unmapped as u16) << 2
            | ((flags.paired && flags.mate_unmapped) as u16) << 3
            | (flags.reverse as u16) << 4
            | (flags.mate_reverse as u16) << 5
            | ((flags.paired && flags.first_read) as u16) << 6
            | ((flags.paired && flags.second_read) as u16) << 7
            | (flags.fail_filter as u16) << 9
            | (flags.duplicate as u16) << 10
    }

    fn forced_dodgy_score(&self) -> u8 {
        match self.dodgy_alignment_score {
            DodgyAlignmentScore::Score(score) => score,
            // Unaligned templates never reach emit with the sentinel set;
            // Unknown maps to 255 per the SAM convention
            DodgyAlignmentScore::Unknown | DodgyAlignmentScore::Unaligned => 255,
        }
    }

    fn mapq(&self, fragment: &FragmentRef<'_>) -> u8 {
        let single = fragment.alignment_score();
        let template = fragment.template_alignment_score();
        if fragment.flags().proper_pair {
            if template == DODGY_ALIGNMENT_SCORE {
                return self.forced_dodgy_score();
            }
            let chosen = if self.pessimistic_mapq {
                single.min(template)
            } else {
                single.max(template)
            };
            (chosen as u32).min(60) as u8
        } else if single == DODGY_ALIGNMENT_SCORE {
            self.forced_dodgy_score()
        } else {
            (single as u32).min(60) as u8
        }
    }

    /// View for an aligned-bin record: the index entry carries the current
    /// position and CIGAR, the record keeps the original CIGAR for OC.
    pub fn adapt<'a>(
        &self,
        index: &Index,
        fragment: &FragmentRef<'a>,
        current_cigar: &'a [u32],
    ) -> BamRecordView<'a> {
        let flags = fragment.flags();
        let aligned = !flags.unmapped && !index.pos.is_no_match();
        let both_unmapped = flags.unmapped && flags.mate_unmapped;
        let realigned = {
            let original = fragment.cigar_bytes();
            original.len() != current_cigar.len() * 4
                || original
                    .chunks_exact(4)
                    .map(LittleEndian::read_u32)
                    .zip(current_cigar.iter().copied())
                    .any(|(original_word, current)| original_word != current)
        };
        let barcode = &self.barcodes[fragment.barcode() as usize];
        BamRecordView {
            ref_id: if aligned {
                index.pos.contig_id() as i32
            } else if flags.paired && !both_unmapped {
                fragment.mate_f_strand_position().contig_id() as i32
            } else {
                -1
            },
            pos: if aligned {
                index.pos.offset() as i32
            } else if flags.paired && !both_unmapped {
                fragment.mate_f_strand_position().offset() as i32
            } else {
                -1
            },
            observed_length: fragment.observed_length(),
            flag: self.flag(fragment),
            mapq: if aligned { self.mapq(fragment) } else { 0 },
            read_name: self.read_name(fragment),
            cigar: if aligned { current_cigar } else { &[] },
            bases: fragment.bases(),
            next_ref_id: if flags.paired && !both_unmapped {
                fragment.mate_f_strand_position().contig_id() as i32
            } else {
                -1
            },
            next_pos: if flags.paired && !both_unmapped {
                fragment.mate_f_strand_position().offset() as i32
            } else {
                -1
            },
            tlen: fragment.bam_tlen(),
            sm: (self.include_tags.with_sm
                && fragment.alignment_score() != DODGY_ALIGNMENT_SCORE)
                .then(|| fragment.alignment_score() as i32),
            r#as: (self.include_tags.with_as
                && flags.proper_pair
                && fragment.template_alignment_score() != DODGY_ALIGNMENT_SCORE)
                .then(|| fragment.template_alignment_score() as i32),
            rg: self
                .include_tags
                .with_rg
                .then(|| fragment.barcode().to_string()),
            nm: self
                .include_tags
                .with_nm
                .then(|| fragment.edit_distance() as i32),
            bc: self
                .include_tags
                .with_bc
                .then(|| barcode.barcode_sequence.clone()),
            oc: (self.include_tags.with_oc && aligned && realigned)
                .then(|| cigar::to_string(&fragment.cigar())),
            zx: (self.include_tags.with_zx && fragment.is_cluster_xy_set())
                .then(|| fragment.cluster_x()),
            zy: (self.include_tags.with_zy && fragment.is_cluster_xy_set())
                .then(|| fragment.cluster_y()),
        }
    }

    /// View for an unaligned-bin record.
    pub fn adapt_unaligned<'a>(&self, fragment: &FragmentRef<'a>) -> BamRecordView<'a> {
        let index = Index::new(crate::position::ReferencePosition::NO_MATCH, 0, 0);
        self.adapt(&index, fragment, &[])
    }
}

fn push_i_tag(buf: &mut Vec<u8>, tag: &[u8; 2], value: i32) {
    buf.extend_from_slice(tag);
    buf.push(b'i');
    let mut scratch = [0u8; 4];
    LittleEndian::write_i32(&mut scratch, value);
    buf.extend_from_slice(&scratch);
}

fn push_z_tag(buf: &mut Vec<u8>, tag: &[u8; 2], value: &str) {
    buf.extend_from_slice(tag);
    buf.push(b'Z');
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

/// Serializes one alignment into the BGZF stream; returns the number of
/// uncompressed bytes emitted (the index parts track offsets with it).
pub fn serialize_alignment(writer: &mut BgzfWriter, record: &BamRecordView<'_>) -> Result<u32> {
    let name_len = record.read_name.len() + 1;
    if name_len > 0xff {
        return Err(BuildError::Invariant(format!(
            "read name of {} bytes does not fit the BAM layout",
            name_len
        )));
    }
    if record.cigar.len() > 0xffff {
        return Err(BuildError::Invariant(format!(
            "CIGAR of {} operations does not fit the BAM layout",
            record.cigar.len()
        )));
    }
    let seq_len = record.bases.len();

    let mut buf = Vec::with_capacity(64 + name_len + record.cigar.len() * 4 + seq_len);
    let mut scratch = [0u8; 4];
    let mut push_i32 = |buf: &mut Vec<u8>, value: i32| {
        LittleEndian::write_i32(&mut scratch, value);
        buf.extend_from_slice(&scratch);
    };

    push_i32(&mut buf, 0); // block_size backpatched below
    push_i32(&mut buf, record.ref_id);
    push_i32(&mut buf, record.pos);
    let span = if record.observed_length > 0 {
        record.observed_length
    } else {
        1
    };
    let bin = if record.pos >= 0 {
        reg2bin(record.pos as u32, record.pos as u32 + span)
    } else {
        0
    };
    push_i32(
        &mut buf,
        ((bin as u32) << 16 | (record.mapq as u32) << 8 | name_len as u32) as i32,
    );
    push_i32(
        &mut buf,
        ((record.flag as u32) << 16 | record.cigar.len() as u32) as i32,
    );
    push_i32(&mut buf, seq_len as i32);
    push_i32(&mut buf, record.next_ref_id);
    push_i32(&mut buf, record.next_pos);
    push_i32(&mut buf, record.tlen);
    buf.extend_from_slice(record.read_name.as_bytes());
    buf.push(0);
    for &word in record.cigar {
        LittleEndian::write_u32(&mut scratch, word);
        buf.extend_from_slice(&scratch);
    }
    for pair in record.bases.chunks(2) {
        let high = bam_base_from_bcl(pair[0]);
        let low = if pair.len() == 2 {
            bam_base_from_bcl(pair[1])
        } else {
            0
        };
        buf.push(high << 4 | low);
    }
    for &byte in record.bases {
        buf.push(bcl_quality(byte));
    }

    if let Some(value) = record.sm {
        push_i_tag(&mut buf, b"SM", value);
    }
    if let Some(value) = record.r#as {
        push_i_tag(&mut buf, b"AS", value);
    }
    if let Some(value) = &record.rg {
        push_z_tag(&mut buf, b"RG", value);
    }
    if let Some(value) = record.nm {
        push_i_tag(&mut buf, b"NM", value);
    }
    if let Some(value) = &record.bc {
        push_z_tag(&mut buf, b"BC", value);
    }
    if let Some(value) = &record.oc {
        push_z_tag(&mut buf, b"OC", value);
    }
    if let Some(value) = record.zx {
        push_i_tag(&mut buf, b"ZX", value);
    }
    if let Some(value) = record.zy {
        push_i_tag(&mut buf, b"ZY", value);
    }

    let block_size = (buf.len() - 4) as i32;
    LittleEndian::write_i32(&mut buf[0..4], block_size);
    writer.write_all(&buf)?;
    Ok(buf.len() as u32)
}

/// Convenience used by the bin serializer: adapts and writes one record.
pub fn serialize_indexed_record(
    adapter: &BamRecordAdapter,
    writer: &mut BgzfWriter,
    index: &Index,
    buffer: &PackedFragmentBuffer,
    arena: &[u32],
) -> Result<(u32, BamRecordMeta)> {
    let fragment = buffer.fragment(index.data_offset);
    let cigar = index.resolve_cigar(buffer, arena);
    let view = adapter.adapt(index, &fragment, &cigar);
    let meta = BamRecordMeta {
        ref_id: view.ref_id,
        pos: view.pos,
        seq_len: view.bases.len() as u32,
        observed_length: view.observed_length,
        unmapped: view.flag & 0x4 != 0,
    };
    let length = serialize_alignment(writer, &view)?;
    Ok((length, meta))
}

/// The slice of a serialized record the index builder needs.
#[derive(Debug, Clone, Copy)]
pub struct BamRecordMeta {
    pub ref_id: i32,
    pub pos: i32,
    pub seq_len: u32,
    pub observed_length: u32,
    pub unmapped: bool,
}
