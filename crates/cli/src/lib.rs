use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use demand_loading_core::{replay_trace_file_synthetic, ReplaySummary, TraceFileReader, TraceRecord};
use serde::Serialize;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "demand-loading")]
#[command(about = "Inspect and replay demand loading traces")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print machine-readable statistics of a trace file.
    Info {
        #[arg(value_name = "TRACE")]
        trace: PathBuf,
    },
    /// Replay a trace file against synthetic textures.
    Replay {
        #[arg(value_name = "TRACE")]
        trace: PathBuf,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Default, Serialize)]
struct InfoOutput {
    path: String,
    num_pages: u32,
    textures: usize,
    texture_pages: u64,
    resources: usize,
    request_batches: usize,
    requested_pages: usize,
    unique_pages: usize,
    devices: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    path: String,
    total_fills: usize,
    total_failures: usize,
    #[serde(flatten)]
    summary: ReplaySummary,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Info { trace } => run_info(&trace),
        Commands::Replay { trace } => run_replay(&trace),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_info(trace: &Path) -> Result<()> {
    ensure_trace_exists(trace)?;

    let reader = TraceFileReader::open(trace).context("failed to open trace")?;
    let mut payload = InfoOutput {
        path: trace.display().to_string(),
        ..Default::default()
    };
    let mut unique = BTreeSet::new();
    let mut devices = BTreeSet::new();

    for record in reader {
        match record.context("failed to read trace")? {
            TraceRecord::Options { options } => payload.num_pages = options.num_pages,
            TraceRecord::Texture { num_pages, .. } => {
                payload.textures += 1;
                payload.texture_pages += u64::from(num_pages);
            }
            TraceRecord::Resource { .. } => payload.resources += 1,
            TraceRecord::Requests {
                device, page_ids, ..
            } => {
                payload.request_batches += 1;
                payload.requested_pages += page_ids.len();
                unique.extend(page_ids);
                devices.insert(device);
            }
        }
    }
    payload.unique_pages = unique.len();
    payload.devices = devices.into_iter().collect();

    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");

    Ok(())
}

fn run_replay(trace: &Path) -> Result<()> {
    ensure_trace_exists(trace)?;

    let summary = replay_trace_file_synthetic(trace).context("failed to replay trace")?;
    let payload = ReplayOutput {
        path: trace.display().to_string(),
        total_fills: summary.total_fills(),
        total_failures: summary.total_failures(),
        summary,
    };

    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");

    Ok(())
}

fn ensure_trace_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}
