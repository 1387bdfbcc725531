use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use bamforge_core::bam::IncludeTags;
use bamforge_core::build::bin_sorter::BinSorterOptions;
use bamforge_core::build::realign::GapRealignerMode;
use bamforge_core::fasta;
use bamforge_core::manifest::BuildManifest;
use bamforge_core::{BinFilter, Build, BuildOptions, DodgyAlignmentScore};

#[derive(Parser)]
#[command(name = "bamforge")]
#[command(about = "bamforge - sorted, deduplicated, realigned BAM output from binned alignments")]
#[command(version)]
#[command(long_about = "
bamforge consumes the binned fragment data produced by the match-selection
stage and assembles per-sample coordinate-sorted BAM files: duplicates are
marked or removed, indels observed in the bin are realigned across reads,
semialigned read ends are soft-clipped, and a .bai index is built alongside
the compressed output.

Example:
  bamforge --manifest run/build-manifest.json --output-dir run/Aligned \\
      --mark-duplicates --realign-gaps sample --clip-semialigned
")]
struct Cli {
    /// Build manifest produced by the match-selection stage
    #[arg(long, required = true)]
    manifest: PathBuf,

    /// Directory receiving <project>/<sample>/sorted.bam
    #[arg(short, long, required = true)]
    output_dir: PathBuf,

    /// Write per-bin per-barcode fragment statistics to this XML file
    #[arg(long)]
    stats_xml: Option<PathBuf>,

    /// Realign against gaps found in: none, sample, project, all
    #[arg(long, default_value = "sample")]
    realign_gaps: String,

    /// Keep realigning until no improvement is found
    #[arg(long)]
    realign_vigorously: bool,

    /// Realign reads whose alignment score is unknown
    #[arg(long)]
    realign_dodgy: bool,

    /// Maximum gaps introduced into one fragment by realignment
    #[arg(long, default_value = "2")]
    realigned_gaps_per_fragment: u32,

    /// Soft-clip read ends that lack five consecutive matches
    #[arg(long)]
    clip_semialigned: bool,

    /// Keep duplicate records (marked) instead of dropping them
    #[arg(long)]
    keep_duplicates: bool,

    /// Identify duplicates (losers are dropped unless --keep-duplicates)
    #[arg(long)]
    mark_duplicates: bool,

    /// Treat all lanes of one sample as a single library
    #[arg(long)]
    single_library_samples: bool,

    /// MAPQ for weakly anchored alignments: Unaligned, Unknown or a number
    #[arg(long, default_value = "Unknown")]
    dodgy_alignment_score: String,

    /// gzip level of the BGZF blocks (0-9)
    #[arg(long, default_value = "6")]
    bam_gzip_level: u32,

    /// Expected compressed/uncompressed ratio for buffer sizing
    #[arg(long, default_value = "1.0")]
    expected_bgzf_compression_ratio: f64,

    /// Emit the unaligned records (bin 0)
    #[arg(long)]
    keep_unaligned: bool,

    /// Place unaligned records after the aligned ones
    #[arg(long)]
    put_unaligned_in_the_back: bool,

    /// Bin selection: "all", "skip-empty" or a regex over bin file names
    #[arg(long, default_value = "all")]
    bin_regex: String,

    /// Comma-separated tags to emit (subset of AS,BC,NM,OC,RG,SM,ZX,ZY)
    #[arg(long, default_value = "AS,BC,NM,OC,RG,SM")]
    include_tags: String,

    /// Use min(SM, AS) rather than max(SM, AS) as the MAPQ of proper pairs
    #[arg(long)]
    pessimistic_mapq: bool,

    /// Parallel bin loads
    #[arg(long)]
    loaders: Option<usize>,

    /// Parallel bin computations
    #[arg(long)]
    computers: Option<usize>,

    /// Parallel bin saves (saving is ordered; this bounds queued buffers)
    #[arg(long, default_value = "1")]
    savers: usize,

    /// Abort before starting if one bin would need more than this many bytes
    #[arg(long)]
    memory_limit: Option<u64>,

    /// Verbose output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let cpus = num_cpus::get();

    let manifest = BuildManifest::load(&cli.manifest)
        .with_context(|| format!("loading manifest {:?}", cli.manifest))?;
    let reference_path = if manifest.reference_fasta.is_relative() {
        cli.manifest
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join(&manifest.reference_fasta)
    } else {
        manifest.reference_fasta.clone()
    };
    let (contigs, contig_infos) =
        fasta::load_contigs(&reference_path).context("loading reference")?;
    info!(
        "loaded {} contigs, {} bins, {} barcodes",
        contigs.len(),
        manifest.bins.len(),
        manifest.barcodes.len()
    );

    let options = BuildOptions {
        sorter: BinSorterOptions {
            single_library_samples: cli.single_library_samples,
            keep_duplicates: cli.keep_duplicates,
            mark_duplicates: cli.mark_duplicates,
            realign_mode: cli
                .realign_gaps
                .parse::<GapRealignerMode>()
                .map_err(anyhow::Error::from)?,
            realign_vigorously: cli.realign_vigorously,
            realign_dodgy: cli.realign_dodgy,
            realigned_gaps_per_fragment: cli.realigned_gaps_per_fragment,
            clip_semialigned: cli.clip_semialigned,
        },
        bam_gzip_level: cli.bam_gzip_level.min(9),
        expected_bgzf_compression_ratio: cli.expected_bgzf_compression_ratio,
        keep_unaligned: cli.keep_unaligned,
        put_unaligned_in_the_back: cli.put_unaligned_in_the_back,
        bin_filter: BinFilter::parse(&cli.bin_regex).map_err(anyhow::Error::from)?,
        include_tags: IncludeTags::parse(&cli.include_tags).map_err(anyhow::Error::from)?,
        dodgy_alignment_score: cli
            .dodgy_alignment_score
            .parse::<DodgyAlignmentScore>()
            .map_err(|e| anyhow::anyhow!(e))?,
        pessimistic_mapq: cli.pessimistic_mapq,
        max_loaders: cli.loaders.unwrap_or_else(|| cpus.min(8)),
        max_computers: cli.computers.unwrap_or(cpus),
        max_savers: cli.savers,
        memory_limit: cli.memory_limit,
        command_line,
        output_directory: cli.output_dir.clone(),
        stats_xml_path: cli.stats_xml.clone(),
    };

    let build = Build::new(
        options,
        contigs,
        contig_infos,
        manifest.tiles,
        manifest.barcodes,
        manifest.bins,
    )?;
    build.run()?;
    info!("build complete");
    Ok(())
}
