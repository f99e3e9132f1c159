//! Pakstore CLI
//!
//! Inspect, validate and edit packed archives from the command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pakstore_rs::{CompressionConfig, Config, ContentArchive, ContentHash, SlottedContainer};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pakstore")]
#[command(about = "Inspect and edit packed single-file archives")]
struct Args {
    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show container bookkeeping
    Info {
        file: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rescan guards and repair the slot table
    Validate { file: PathBuf },
    /// Store files, printing each content hash
    Put {
        file: PathBuf,
        inputs: Vec<PathBuf>,
        /// Compress blobs with LZ4 when it pays off
        #[arg(long)]
        compress: bool,
    },
    /// Fetch a blob by hash
    Get {
        file: PathBuf,
        hash: ContentHash,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove a blob by hash
    Rm { file: PathBuf, hash: ContentHash },
    /// List stored blobs
    Ls {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading settings from {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn require_existing(file: &PathBuf) -> Result<()> {
    anyhow::ensure!(file.exists(), "{} does not exist", file.display());
    Ok(())
}

fn open_archive(file: &PathBuf, config: &Config) -> Result<ContentArchive> {
    ContentArchive::open_with(file, config)
        .with_context(|| format!("opening archive {}", file.display()))
}

/// A valid `RUST_LOG` wins; otherwise `-v` picks the level
fn log_filter(verbose: bool, rust_log: Option<String>) -> EnvFilter {
    let level = if verbose { "debug" } else { "warn" };
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(args.verbose, std::env::var("RUST_LOG").ok()))
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Info { file, json } => {
            require_existing(&file)?;
            let container = SlottedContainer::open_with(&file, config.container.clone())
                .with_context(|| format!("opening container {}", file.display()))?;
            let stats = container.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("File:         {}", file.display());
                println!("End of file:  {:#x}", stats.end_of_file);
                println!("Slots:        {}", stats.slot_count);
                println!("  live:       {} ({} bytes)", stats.live_slots, stats.live_bytes);
                println!("  free:       {} ({} bytes)", stats.free_slots, stats.free_bytes);
                println!("  deletable:  {}", stats.deletable_slots);
                println!("  unused:     {}", stats.unused_slots);
                if let Some(root) = stats.root_slot {
                    println!("Root slot:    {}", root);
                }
            }
        }
        Command::Validate { file } => {
            require_existing(&file)?;
            let mut container = SlottedContainer::open_with(&file, config.container.clone())
                .with_context(|| format!("opening container {}", file.display()))?;
            let report = container.validate_file().context("validating guards")?;
            container.close()?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                info!("Slot table repaired");
            }
        }
        Command::Put {
            file,
            inputs,
            compress,
        } => {
            if compress {
                config.archive.compression = CompressionConfig::lz4();
            }
            let mut archive = open_archive(&file, &config)?;
            for input in &inputs {
                let data = fs::read(input).with_context(|| format!("reading {}", input.display()))?;
                let hash = archive.put(&data)?;
                println!("{}  {}", hash, input.display());
            }
            archive.close()?;
        }
        Command::Get { file, hash, output } => {
            require_existing(&file)?;
            let archive = open_archive(&file, &config)?;
            let data = archive.get_data(&hash)?;
            match output {
                Some(path) => fs::write(&path, &data)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => std::io::stdout().write_all(&data)?,
            }
        }
        Command::Rm { file, hash } => {
            require_existing(&file)?;
            let mut archive = open_archive(&file, &config)?;
            archive.delete_data(&hash)?;
            archive.close()?;
        }
        Command::Ls { file, json } => {
            require_existing(&file)?;
            let archive = open_archive(&file, &config)?;
            let entries: Vec<_> = archive
                .hashes()
                .iter()
                .filter_map(|hash| archive.entry(hash).copied())
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!(
                        "{}  {:>10}  slot {}",
                        entry.hash, entry.uncompressed_size, entry.slot_index
                    );
                }
            }
        }
    }

    Ok(())
}
