//! CaskKV CLI
//!
//! Command-line interface for operating on a CaskKV data directory.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use caskkv::{CaskError, Config, Engine, IndexKind};
use tracing_subscriber::{fmt, EnvFilter};

/// CaskKV CLI
#[derive(Parser, Debug)]
#[command(name = "caskkv-cli")]
#[command(about = "Embedded log-structured key-value store")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./caskkv_data")]
    data_dir: PathBuf,

    /// Segment size in MB before rotation
    #[arg(short = 's', long, default_value = "1024")]
    segment_mb: u64,

    /// fsync after every write
    #[arg(long)]
    sync: bool,

    /// Keep the keydir in key order (affects `keys` output)
    #[arg(long)]
    ordered: bool,

    /// Seconds to wait for the directory lock
    #[arg(long)]
    lock_wait: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// List every live key
    Keys,

    /// Compact sealed segments
    Merge,

    /// Print store statistics
    Stats,
}

impl Commands {
    fn is_read_only(&self) -> bool {
        matches!(self, Commands::Get { .. } | Commands::Keys | Commands::Stats)
    }
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,caskkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> caskkv::Result<ExitCode> {
    let max_segment_size = args.segment_mb.checked_mul(1024 * 1024).ok_or_else(|| {
        CaskError::Config(format!("--segment-mb {} is too large", args.segment_mb))
    })?;

    // Build config from args
    let mut builder = Config::builder()
        .data_dir(&args.data_dir)
        .max_segment_size(max_segment_size)
        .sync_on_write(args.sync)
        .read_only(args.command.is_read_only() && args.data_dir.exists())
        .index_kind(if args.ordered {
            IndexKind::Ordered
        } else {
            IndexKind::Sharded
        });
    if let Some(secs) = args.lock_wait {
        builder = builder.lock_timeout(std::time::Duration::from_secs(secs));
    }

    let engine = Engine::open(builder.build())?;
    let mut code = ExitCode::SUCCESS;

    match args.command {
        Commands::Get { key } => match engine.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => {
                println!("(nil)");
                code = ExitCode::FAILURE;
            }
        },
        Commands::Put { key, value } => {
            engine.put(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::Del { key } => {
            engine.delete(key.as_bytes())?;
            println!("OK");
        }
        Commands::Keys => {
            for key in engine.list_keys() {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Commands::Merge => {
            let stats = engine.merge()?;
            println!(
                "merged {} segment(s) into {}: {} keys copied, {} skipped, {} retired",
                stats.source_segments,
                stats.output_segments,
                stats.keys_copied,
                stats.keys_skipped,
                stats.segments_retired
            );
        }
        Commands::Stats => {
            let report = engine.recovery_report();
            println!("data_dir:          {}", engine.data_dir().display());
            println!("keys:              {}", engine.len());
            println!("segments:          {}", engine.segment_count());
            println!("active_segment:    {}", engine.active_segment_id());
            println!("hints_loaded:      {}", report.hints_loaded);
            println!("segments_scanned:  {}", report.segments_scanned);
            println!("tail_truncated:    {}", report.tail_truncated);
            println!("corrupt_segments:  {}", report.corrupt_segments.len());
        }
    }

    engine.close()?;
    Ok(code)
}
