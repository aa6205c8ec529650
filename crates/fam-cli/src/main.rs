#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use famfs::{
    CreateOptions, FamConfig, FileMap, FsckOptions, LogplayOptions, MkfsOptions, MkfsOutcome,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "famfs-cli", version)]
#[command(about = "Create, inspect and populate famfs shared-memory file systems")]
struct Cli {
    /// JSON configuration file; flags given here take precedence.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Print results as JSON.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Format a device with a superblock and an empty log.
    Mkfs {
        device: PathBuf,
        /// Overwrite an existing file system.
        #[arg(short, long)]
        force: bool,
        /// Invalidate the superblock (requires --force on a valid one).
        #[arg(short, long)]
        kill: bool,
        #[arg(long, value_parser = parse_size)]
        log_len: Option<u64>,
    },
    /// Create the .meta files of a mount point from a device.
    Mkmeta { device: PathBuf, mountpoint: PathBuf },
    /// Check a device or a mounted instance. Exit status is the fault count.
    Fsck { path: PathBuf },
    /// Allocate and log a new file.
    Creat {
        path: PathBuf,
        #[arg(short, long, value_parser = parse_size)]
        size: u64,
        #[command(flatten)]
        create: CreateArgs,
    },
    /// Copy a regular file into the file system.
    Cp {
        src: PathBuf,
        dst: PathBuf,
        #[command(flatten)]
        create: CreateArgs,
    },
    /// Log and create a directory.
    Mkdir {
        path: PathBuf,
        #[command(flatten)]
        create: CreateArgs,
    },
    /// Print the extent map of a file.
    Getmap { path: PathBuf },
    /// Create logged files and directories missing from the mount tree.
    Logplay {
        path: PathBuf,
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
}

#[derive(Debug, Args)]
struct CreateArgs {
    /// Octal permission bits.
    #[arg(short, long, value_parser = parse_mode)]
    mode: Option<u32>,
    #[arg(short, long)]
    uid: Option<u32>,
    #[arg(short, long)]
    gid: Option<u32>,
    /// Stripe new files across this many strips.
    #[arg(long)]
    stripes: Option<u32>,
    #[arg(long, value_parser = parse_size)]
    chunk: Option<u64>,
}

impl CreateArgs {
    fn options(&self, size: u64) -> CreateOptions {
        CreateOptions {
            size,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            stripe_count: self.stripes,
            chunk_size: self.chunk,
        }
    }
}

// ── Argument parsing ────────────────────────────────────────────────────────

/// Byte count with an optional `k`, `m` or `g` suffix (powers of 1024);
/// `0x` selects hex.
fn parse_size(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let (digits, shift) = match text.chars().last() {
        Some('k' | 'K') => (&text[..text.len() - 1], 10),
        Some('m' | 'M') => (&text[..text.len() - 1], 20),
        Some('g' | 'G') => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|e| format!("invalid size {text:?}: {e}"))?;
    value
        .checked_mul(1_u64 << shift)
        .ok_or_else(|| format!("size {text:?} overflows"))
}

fn parse_mode(text: &str) -> Result<u32, String> {
    let mode = u32::from_str_radix(text.trim_start_matches("0o"), 8)
        .map_err(|e| format!("invalid mode {text:?}: {e}"))?;
    if mode > 0o7777 {
        return Err(format!("mode {text:?} has bits outside 0o7777"));
    }
    Ok(mode)
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    match run() {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<FamConfig> {
    let mut config = match &cli.config {
        Some(path) => FamConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FamConfig::default(),
    };
    config.verbose |= cli.verbose;
    Ok(config)
}

/// Returns the process exit status.
fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(&cli)?;
    debug!(?config, "configuration loaded");

    match &cli.command {
        Command::Mkfs {
            device,
            force,
            kill,
            log_len,
        } => {
            let opts = MkfsOptions {
                force: *force,
                kill: *kill,
                log_len: log_len.unwrap_or(MkfsOptions::default().log_len),
            };
            let outcome = famfs::mkfs(&config, device, &opts)
                .with_context(|| format!("mkfs failed on {}", device.display()))?;
            print_mkfs(&outcome, cli.json)?;
        }
        Command::Mkmeta { device, mountpoint } => {
            let meta = famfs::mkmeta(&config, device, mountpoint).with_context(|| {
                format!(
                    "mkmeta failed for {} at {}",
                    device.display(),
                    mountpoint.display()
                )
            })?;
            if cli.json {
                emit_json(&serde_json::json!({
                    "superblock": meta.superblock,
                    "log": meta.log,
                }))?;
            } else {
                println!("{}", meta.superblock.display());
                println!("{}", meta.log.display());
            }
        }
        Command::Fsck { path } => {
            let opts = FsckOptions {
                verbose: config.verbose,
            };
            let report = famfs::fsck(path, &opts)
                .with_context(|| format!("fsck failed on {}", path.display()))?;
            if cli.json {
                emit_json(&report)?;
            } else {
                print!("{report}");
            }
            return Ok(exit_status(report.fault_count()));
        }
        Command::Creat { path, size, create } => {
            let map = famfs::creat(&config, path, &create.options(*size))
                .with_context(|| format!("creat failed for {}", path.display()))?;
            print_map(path, &map, cli.json)?;
        }
        Command::Cp { src, dst, create } => {
            let map = famfs::cp(&config, src, dst, &create.options(0)).with_context(|| {
                format!("cp {} -> {} failed", src.display(), dst.display())
            })?;
            if cli.json {
                emit_json(&map)?;
            } else {
                println!("copied {} bytes", map.size());
            }
        }
        Command::Mkdir { path, create } => {
            famfs::mkdir(&config, path, &create.options(0))
                .with_context(|| format!("mkdir failed for {}", path.display()))?;
        }
        Command::Getmap { path } => {
            let map = famfs::getmap(path)
                .with_context(|| format!("no map for {}", path.display()))?;
            print_map(path, &map, cli.json)?;
        }
        Command::Logplay { path, dry_run } => {
            let opts = LogplayOptions { dry_run: *dry_run };
            let report = famfs::logplay(&config, path, &opts)
                .with_context(|| format!("logplay failed for {}", path.display()))?;
            if cli.json {
                emit_json(&report)?;
            } else {
                let verb = if report.dry_run { "would create" } else { "created" };
                println!(
                    "{} entries: {verb} {} files and {} directories, {} already present",
                    report.entries, report.files_created, report.dirs_created, report.skipped_existing
                );
                if report.bad_entries > 0 {
                    println!("{} undecodable entries skipped", report.bad_entries);
                }
            }
        }
    }
    Ok(0)
}

/// Exit statuses wrap at 256, so the count saturates below that.
fn exit_status(faults: u64) -> i32 {
    i32::try_from(faults.min(255)).unwrap_or(255)
}

// ── Output ──────────────────────────────────────────────────────────────────

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn print_mkfs(outcome: &MkfsOutcome, json: bool) -> Result<()> {
    if json {
        return emit_json(outcome);
    }
    match outcome {
        MkfsOutcome::Created {
            device,
            device_size,
            fs_uuid,
            system_uuid,
            log_len,
        } => {
            println!("famfs file system created on {device}");
            println!("device_size: {device_size}");
            println!("fs_uuid:     {fs_uuid}");
            println!("system_uuid: {system_uuid}");
            println!("log_len:     {log_len}");
        }
        MkfsOutcome::Killed { device } => println!("superblock on {device} invalidated"),
    }
    Ok(())
}

fn print_map(path: &Path, map: &FileMap, json: bool) -> Result<()> {
    if json {
        return emit_json(map);
    }
    println!(
        "{}: {} {} bytes, {} extents",
        path.display(),
        map.file_type(),
        map.size(),
        map.extents().len()
    );
    for (file_offset, range) in map.mappings(0, map.size()) {
        println!(
            "  {file_offset:#014x} -> dev {} {:#014x} len {:#x}",
            range.dev_index, range.device_offset, range.contiguous_len
        );
    }
    Ok(())
}
