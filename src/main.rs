//! buscount: BUS-record quantification.
//!
//! Usage: buscount <COMMAND> [OPTIONS]

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use buscount::bus::{verify_sorted, BusError};
use buscount::commands::CountCommand;
use buscount::config::{CountConfig, MultiGenePolicy};

/// Exit code for an unparseable or unsorted input stream.
const EXIT_MALFORMED_STREAM: i32 = 2;
/// Exit code for an unwritable output path or other I/O failure.
const EXIT_IO: i32 = 3;
/// Exit code when no barcode survives the knee cut.
const EXIT_EMPTY_CELL_SET: i32 = 4;

#[derive(Parser)]
#[command(name = "buscount")]
#[command(version)]
#[command(about = "BUS-record quantification: sorted pseudoalignment streams to gene-by-cell count matrices", long_about = None)]
struct Cli {
    /// Number of threads to use (default: number of CPUs)
    #[arg(long, short = 't', global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Quantify a sorted BUS text stream into a count matrix
    Count {
        /// Sorted BUS text file (barcode, umi, ec, multiplicity)
        #[arg(short = 'i', long)]
        bus: PathBuf,

        /// Equivalence-class definitions (matrix.ec)
        #[arg(short = 'e', long)]
        ec: PathBuf,

        /// Transcript list defining the indices used by matrix.ec
        #[arg(short = 'x', long)]
        transcripts: PathBuf,

        /// Transcript-to-gene table (transcript\tgene)
        #[arg(short = 'g', long)]
        t2g: PathBuf,

        /// Output directory for matrix.mtx, barcodes.txt, genes.txt
        #[arg(short = 'o', long)]
        outdir: PathBuf,

        /// Expected number of real cells; bounds the knee search
        #[arg(long)]
        expected_cells: Option<u64>,

        /// Minimum multiplicity ratio before merging a barcode into a
        /// one-substitution neighbor
        #[arg(long, default_value = "10.0")]
        correction_multiplier: f64,

        /// Policy for multi-gene UMIs: discard or fractional-split
        #[arg(long, default_value = "discard")]
        multi_gene_policy: String,

        /// Moving-average window for knee-curve smoothing
        #[arg(long, default_value = "7")]
        smoothing_window: usize,

        /// Knee search window as lo,hi multipliers of --expected-cells
        #[arg(long, default_value = "0.1,10")]
        knee_window: String,

        /// Print the run summary to stderr
        #[arg(long)]
        stats: bool,
    },

    /// Verify that a BUS text file is sorted by (barcode, UMI)
    Verify {
        /// Input BUS text file
        #[arg(short = 'i', long)]
        input: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Count {
            bus,
            ec,
            transcripts,
            t2g,
            outdir,
            expected_cells,
            correction_multiplier,
            multi_gene_policy,
            smoothing_window,
            knee_window,
            stats,
        } => run_count(
            bus,
            ec,
            transcripts,
            t2g,
            outdir,
            expected_cells,
            correction_multiplier,
            multi_gene_policy,
            smoothing_window,
            knee_window,
            cli.threads,
            stats,
        ),
        Commands::Verify { input } => run_verify(input),
    };

    if let Err(e) = result {
        eprintln!("{}", render_failure(&e));
        process::exit(exit_code(&e));
    }
}

/// An empty cell set is a data outcome, not a program fault: flag it
/// as a warning while still exiting nonzero.
fn render_failure(error: &BusError) -> String {
    match error {
        BusError::EmptyCellSet => format!("Warning: {}", error),
        _ => format!("Error: {}", error),
    }
}

/// Map error taxonomy to distinct exit codes.
fn exit_code(error: &BusError) -> i32 {
    match error {
        BusError::Parse { .. } | BusError::Unsorted { .. } | BusError::InvalidFormat(_) => {
            EXIT_MALFORMED_STREAM
        }
        BusError::Io(_) => EXIT_IO,
        BusError::EmptyCellSet => EXIT_EMPTY_CELL_SET,
    }
}

fn run_count(
    bus: PathBuf,
    ec: PathBuf,
    transcripts: PathBuf,
    t2g: PathBuf,
    outdir: PathBuf,
    expected_cells: Option<u64>,
    correction_multiplier: f64,
    multi_gene_policy: String,
    smoothing_window: usize,
    knee_window: String,
    threads: Option<usize>,
    stats: bool,
) -> Result<(), BusError> {
    let policy = MultiGenePolicy::from_str(&multi_gene_policy).ok_or_else(|| {
        BusError::InvalidFormat(format!(
            "Invalid multi-gene policy '{}'. Use: discard, fractional-split",
            multi_gene_policy
        ))
    })?;
    let (knee_lo, knee_hi) = parse_knee_window(&knee_window).ok_or_else(|| {
        BusError::InvalidFormat(format!(
            "Invalid knee window '{}'. Use lo,hi with 0 < lo <= hi",
            knee_window
        ))
    })?;

    let config = CountConfig::new()
        .with_expected_cells(expected_cells)
        .with_correction_multiplier(correction_multiplier)
        .with_multi_gene_policy(policy)
        .with_smoothing_window(smoothing_window)
        .with_knee_window(knee_lo, knee_hi)
        .with_threads(threads.unwrap_or(0));

    let summary = CountCommand::new().with_config(config).run(
        bus.as_path(),
        ec.as_path(),
        transcripts.as_path(),
        t2g.as_path(),
        outdir.as_path(),
    )?;

    if stats {
        eprintln!("{}", summary);
    }
    Ok(())
}

/// Parse a `lo,hi` knee window. Rejects nonpositive or inverted bounds.
fn parse_knee_window(s: &str) -> Option<(f64, f64)> {
    let (lo, hi) = s.split_once(',')?;
    let lo: f64 = lo.trim().parse().ok()?;
    let hi: f64 = hi.trim().parse().ok()?;
    if !lo.is_finite() || !hi.is_finite() || lo <= 0.0 || hi < lo {
        return None;
    }
    Some((lo, hi))
}

fn run_verify(input: PathBuf) -> Result<(), BusError> {
    let records = verify_sorted(&input)?;
    eprintln!("{}: {} records, sorted", input.display(), records);
    Ok(())
}
