//! End-to-end: templates -> collector -> bins on disk -> build pipeline ->
//! BAM + BAI, re-read and verified record by record.

use std::io::Read as IoRead;
use std::io::Write as IoWrite;
use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian};

use bamforge_core::align::UngappedAligner;
use bamforge_core::alignment::FragmentMetadata;
use bamforge_core::bam::IncludeTags;
use bamforge_core::bin_metadata::{BinFilter, BinIndexMap, BinMetadata};
use bamforge_core::build::bin_sorter::BinSorterOptions;
use bamforge_core::build::realign::GapRealignerMode;
use bamforge_core::cluster::{bcl_from_base, Cluster, Read};
use bamforge_core::collector::FragmentCollector;
use bamforge_core::position::ReferencePosition;
use bamforge_core::template::{DodgyAlignmentScore, RestOfGenomeCorrection, TemplateBuilder};
use bamforge_core::tls::TemplateLengthStatistics;
use bamforge_core::types::{BarcodeMetadata, Contig, ContigInfo, TileMetadata};
use bamforge_core::{Build, BuildOptions};

const R1_SITE: &[u8] = b"CGTCGGTTCAGCATTCGCGGTACTGCAGGATCACGGTCGC";
const R2_SITE: &[u8] = b"TGCCGATTGGCCTTAGCATCAATGCGCATTGCACGGTCAT";
const ORPHAN_SITE: &[u8] = b"GATTACCGGATCTTGCAACGTGCAGTTCCGATAGCTGACA";
const JUNK: &[u8] = b"GGGGGTTTTTGGGGGTTTTTGGGGGTTTTTGGGGGTTTTT";

fn reverse_complement(sequence: &[u8]) -> Vec<u8> {
    sequence
        .iter()
        .rev()
        .map(|&b| match b {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            _ => b'A',
        })
        .collect()
}

fn bcl_read(sequence: &[u8]) -> Read {
    Read::new(sequence.iter().map(|&b| bcl_from_base(b, 35)).collect())
}

fn reference() -> Vec<u8> {
    let mut reference = Vec::new();
    let pattern = b"ACTGAGCATACGTTAGCCAA";
    while reference.len() < 6000 {
        reference.extend_from_slice(pattern);
    }
    reference.truncate(6000);
    reference[1000..1040].copy_from_slice(R1_SITE);
    reference[1260..1300].copy_from_slice(R2_SITE);
    reference[3000..3040].copy_from_slice(ORPHAN_SITE);
    reference
}

/// Builds one paired template from candidate positions and collects it.
#[allow(clippy::too_many_arguments)]
fn build_and_collect(
    builder: &mut TemplateBuilder,
    collector: &mut FragmentCollector<'_>,
    contigs: &[Contig],
    rog: &RestOfGenomeCorrection,
    tls: &TemplateLengthStatistics,
    cluster: &Cluster,
    read1_pos: Option<i64>,
    read2_pos: Option<i64>,
) {
    let mut cigar_buffer = Vec::new();
    let mut candidates: [Vec<FragmentMetadata<'_>>; 2] = [Vec::new(), Vec::new()];
    for (read_index, position) in [(0usize, read1_pos), (1usize, read2_pos)] {
        if let Some(position) = position {
            let mut fragment = FragmentMetadata::new(cluster, read_index);
            fragment.contig_id = 0;
            fragment.position = position;
            fragment.reverse = read_index == 1;
            assert!(UngappedAligner::align(
                &mut fragment,
                &mut cigar_buffer,
                &contigs[0]
            ));
            fragment.unique_seed_count = 1;
            candidates[read_index].push(fragment);
        }
    }
    let (template, _aligned) =
        builder.build_template(contigs, rog, cluster, &candidates, tls, &mut cigar_buffer);
    collector.add(&template, 0, 0, &cigar_buffer);
    collector.add(&template, 1, 0, &cigar_buffer);
}

struct ParsedRecord {
    ref_id: i32,
    pos: i32,
    flag: u16,
    mapq: u8,
    tlen: i32,
    next_ref_id: i32,
    next_pos: i32,
    name: String,
    cigar_ops: usize,
    seq: Vec<u8>,
    qual: Vec<u8>,
}

fn parse_bam(raw: &[u8]) -> (String, Vec<ParsedRecord>) {
    assert_eq!(&raw[0..4], b"BAM\x01");
    let l_text = LittleEndian::read_i32(&raw[4..8]) as usize;
    let text = String::from_utf8_lossy(&raw[8..8 + l_text]).to_string();
    let mut at = 8 + l_text;
    let n_ref = LittleEndian::read_i32(&raw[at..at + 4]);
    at += 4;
    assert_eq!(n_ref, 1);
    let l_name = LittleEndian::read_i32(&raw[at..at + 4]) as usize;
    at += 4 + l_name + 4;

    let mut records = Vec::new();
    while at < raw.len() {
        let block_size = LittleEndian::read_i32(&raw[at..at + 4]) as usize;
        let record = &raw[at + 4..at + 4 + block_size];
        let ref_id = LittleEndian::read_i32(&record[0..4]);
        let pos = LittleEndian::read_i32(&record[4..8]);
        let bin_mq_nl = LittleEndian::read_u32(&record[8..12]);
        let name_len = (bin_mq_nl & 0xff) as usize;
        let mapq = ((bin_mq_nl >> 8) & 0xff) as u8;
        let flag_nc = LittleEndian::read_u32(&record[12..16]);
        let flag = (flag_nc >> 16) as u16;
        let cigar_ops = (flag_nc & 0xffff) as usize;
        let l_seq = LittleEndian::read_i32(&record[16..20]) as usize;
        let next_ref_id = LittleEndian::read_i32(&record[20..24]);
        let next_pos = LittleEndian::read_i32(&record[24..28]);
        let tlen = LittleEndian::read_i32(&record[28..32]);
        let name = String::from_utf8_lossy(&record[32..32 + name_len - 1]).to_string();
        let seq_at = 32 + name_len + cigar_ops * 4;
        let seq_bytes = &record[seq_at..seq_at + (l_seq + 1) / 2];
        let mut seq = Vec::with_capacity(l_seq);
        for at in 0..l_seq {
            let nibble = if at % 2 == 0 {
                seq_bytes[at / 2] >> 4
            } else {
                seq_bytes[at / 2] & 0x0f
            };
            seq.push(match nibble {
                1 => b'A',
                2 => b'C',
                4 => b'G',
                8 => b'T',
                _ => b'N',
            });
        }
        let qual_at = seq_at + (l_seq + 1) / 2;
        let qual = record[qual_at..qual_at + l_seq].to_vec();
        records.push(ParsedRecord {
            ref_id,
            pos,
            flag,
            mapq,
            tlen,
            next_ref_id,
            next_pos,
            name,
            cigar_ops,
            seq,
            qual,
        });
        at += 4 + block_size;
    }
    (text, records)
}

#[test]
fn pipeline_produces_sorted_deduplicated_indexed_bam() {
    let dir = tempfile::tempdir().unwrap();
    let reference_bytes = reference();
    let contigs = vec![Contig {
        name: "chr1".to_string(),
        forward: reference_bytes.clone(),
    }];
    let contig_infos = vec![ContigInfo {
        name: "chr1".to_string(),
        length: 6000,
        assembly: None,
        uri: None,
        md5: None,
    }];
    let tiles = vec![TileMetadata {
        flowcell_id: "FCTEST".to_string(),
        lane: "1".to_string(),
        tile: "1101".to_string(),
        cluster_count: 16,
    }];
    let barcodes = vec![BarcodeMetadata {
        index: 0,
        sample_name: "s1".to_string(),
        project: "p1".to_string(),
        reference_index: 0,
        barcode_sequence: "ACGTAC".to_string(),
        unmapped_reference: false,
    }];

    let mut bins = vec![
        BinMetadata::new(
            1,
            0,
            ReferencePosition::TOO_MANY_MATCH,
            0,
            dir.path().join("bin-0000.dat"),
        ),
        BinMetadata::new(
            1,
            1,
            ReferencePosition::new(0, 0),
            6000,
            dir.path().join("bin-0001.dat"),
        ),
    ];
    let bin_index_map = BinIndexMap::new(&bins);

    let tls = TemplateLengthStatistics::nominal(300, 30);
    let rog = RestOfGenomeCorrection::new(&contigs, [40, 40]);
    let mut builder = TemplateBuilder::new(false, DodgyAlignmentScore::Score(2), 8, 0);
    let mut collector = FragmentCollector::new(&bin_index_map, 8, &[40, 40]);

    let r2_read = bcl_read(&reverse_complement(R2_SITE));
    // a proper pair and its PCR duplicate from another cluster
    let cluster1 = Cluster::new(1, 0, vec![bcl_read(R1_SITE), r2_read.clone()]);
    let cluster2 = Cluster::new(2, 0, vec![bcl_read(R1_SITE), r2_read.clone()]);
    // an orphan whose mate aligns nowhere
    let cluster3 = Cluster::new(3, 0, vec![bcl_read(ORPHAN_SITE), bcl_read(JUNK)]);
    // a cluster with no placement at all
    let cluster4 = Cluster::new(4, 0, vec![bcl_read(JUNK), bcl_read(JUNK)]);

    for cluster in [&cluster1, &cluster2] {
        build_and_collect(
            &mut builder,
            &mut collector,
            &contigs,
            &rog,
            &tls,
            cluster,
            Some(1000),
            Some(1260),
        );
    }
    build_and_collect(
        &mut builder,
        &mut collector,
        &contigs,
        &rog,
        &tls,
        &cluster3,
        Some(3000),
        None,
    );
    build_and_collect(
        &mut builder,
        &mut collector,
        &contigs,
        &rog,
        &tls,
        &cluster4,
        None,
        None,
    );
    collector.finish(&mut bins).unwrap();
    assert!(bins[1].f_idx_elements >= 2);
    assert!(bins[0].data_size > 0);

    let reference_path = dir.path().join("ref.fa");
    {
        let mut file = std::fs::File::create(&reference_path).unwrap();
        writeln!(file, ">chr1").unwrap();
        file.write_all(&reference_bytes).unwrap();
        writeln!(file).unwrap();
    }

    let output_dir = dir.path().join("out");
    let options = BuildOptions {
        sorter: BinSorterOptions {
            single_library_samples: false,
            keep_duplicates: false,
            mark_duplicates: true,
            realign_mode: GapRealignerMode::Sample,
            realign_vigorously: false,
            realign_dodgy: false,
            realigned_gaps_per_fragment: 2,
            clip_semialigned: false,
        },
        bam_gzip_level: 6,
        expected_bgzf_compression_ratio: 1.0,
        keep_unaligned: true,
        put_unaligned_in_the_back: true,
        bin_filter: BinFilter::All,
        include_tags: IncludeTags::default(),
        dodgy_alignment_score: DodgyAlignmentScore::Score(2),
        pessimistic_mapq: false,
        max_loaders: 2,
        max_computers: 2,
        max_savers: 1,
        memory_limit: None,
        command_line: "bamforge --test".to_string(),
        output_directory: output_dir.clone(),
        stats_xml_path: Some(dir.path().join("stats.xml")),
    };

    let build = Build::new(
        options,
        contigs,
        contig_infos,
        tiles,
        barcodes,
        bins,
    )
    .unwrap();
    build.run().unwrap();

    let bam_path: PathBuf = output_dir.join("p1").join("s1").join("sorted.bam");
    assert!(bam_path.exists());

    // decompress through the noodles bgzf reader and parse the raw records
    let mut raw = Vec::new();
    noodles::bgzf::Reader::new(std::fs::File::open(&bam_path).unwrap())
        .read_to_end(&mut raw)
        .unwrap();
    let (header_text, records) = parse_bam(&raw);
    assert!(header_text.contains("SO:coordinate"));
    assert!(header_text.contains("@SQ\tSN:chr1\tLN:6000"));
    assert!(header_text.contains("@RG\tID:0\tSM:s1"));

    // 2 from the surviving pair, 2 from orphan+shadow, 2 unaligned; the PCR
    // duplicate pair was dropped
    assert_eq!(records.len(), 6);

    let mapped: Vec<&ParsedRecord> = records.iter().filter(|r| r.flag & 0x4 == 0).collect();
    assert_eq!(mapped.len(), 3);
    let positions: Vec<i32> = mapped.iter().map(|r| r.pos).collect();
    assert_eq!(positions, vec![1000, 1260, 3000]);

    // the surviving pair belongs to cluster 1
    assert!(mapped[0].name.ends_with(":1:0"));
    assert_eq!(mapped[0].flag & 0x2, 0x2); // proper pair
    assert_eq!(mapped[0].tlen, 299);
    assert_eq!(mapped[1].tlen, -299);
    assert_eq!(mapped[0].next_pos, 1260);
    assert_eq!(mapped[0].mapq, 60);
    assert_eq!(mapped[0].seq, R1_SITE);
    assert!(mapped[0].qual.iter().all(|&q| q == 35));
    assert_eq!(mapped[0].cigar_ops, 1);

    // the orphan carries the mate-unmapped flag; its shadow follows at the
    // same position, unmapped, inheriting refID and pos
    let orphan = mapped[2];
    assert_eq!(orphan.flag & 0x8, 0x8);
    let shadow_at = records
        .iter()
        .position(|r| r.flag & 0x4 != 0 && r.pos == 3000)
        .unwrap();
    let shadow = &records[shadow_at];
    assert_eq!(shadow.ref_id, orphan.ref_id);
    assert_eq!(shadow.pos, orphan.pos);
    assert_eq!(shadow.next_pos, orphan.pos);
    assert_eq!(shadow.cigar_ops, 0);
    // byte order places the orphan immediately before the shadow
    let orphan_at = records
        .iter()
        .position(|r| r.flag & 0x4 == 0 && r.pos == 3000)
        .unwrap();
    assert_eq!(shadow_at, orphan_at + 1);

    // fully unaligned records sit at the back with refID -1
    assert!(records[4..].iter().all(|r| r.ref_id == -1 && r.flag & 0x4 != 0));

    // the index exists, opens and announces one reference
    let bai = std::fs::read(bam_path.with_extension("bam.bai")).unwrap();
    assert_eq!(&bai[0..4], b"BAI\x01");
    assert_eq!(LittleEndian::read_u32(&bai[4..8]), 1);
    // two reads never got coordinates
    assert_eq!(LittleEndian::read_u64(&bai[bai.len() - 8..]), 2);

    // stats were dumped
    let stats = std::fs::read_to_string(dir.path().join("stats.xml")).unwrap();
    assert!(stats.contains("totalFragments"));
}
