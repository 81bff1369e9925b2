use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rdelta_common::{
    default_config_path, load_config, save_config, Configuration, DiffResult, DiffSummary,
    Operation, SkipReason,
};
use rdelta_core::{BinaryDeltaMatcher, DiffEngine};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rdelta")]
#[command(author = "RDelta Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Chunk-based binary delta and directory diff utility", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two directory trees
    Compare {
        /// Old (baseline) directory
        old: PathBuf,

        /// New directory
        new: PathBuf,

        /// Config file (defaults to the per-user rdelta.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Ignore patterns (can be specified multiple times)
        #[arg(short, long)]
        ignore: Vec<String>,

        /// Only compare files matching these patterns
        #[arg(long)]
        include: Vec<String>,

        /// Maximum number of files compared at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Store chunk payloads uncompressed
        #[arg(long)]
        no_compress: bool,

        /// Gzip level (1-9)
        #[arg(long)]
        level: Option<u32>,

        /// Skip files larger than this many bytes
        #[arg(long)]
        max_size: Option<u64>,

        /// Append engine log lines to this file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Log every compared file
        #[arg(long)]
        detailed: bool,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compute the binary delta between two files
    Delta {
        /// Old file
        old: PathBuf,

        /// New file
        new: PathBuf,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a config file with the default settings
    InitConfig {
        /// Destination (defaults to the per-user rdelta.toml)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Command-line settings layered over the loaded config file
#[derive(Default)]
struct Overrides {
    ignore: Vec<String>,
    include: Vec<String>,
    concurrency: Option<usize>,
    no_compress: bool,
    level: Option<u32>,
    max_size: Option<u64>,
    log_file: Option<PathBuf>,
    detailed: bool,
}

impl Overrides {
    fn apply(self, config: &mut Configuration) {
        config.ignore_patterns.extend(self.ignore);
        config.include_patterns.extend(self.include);
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if self.no_compress {
            config.compress_patches = false;
        }
        if let Some(level) = self.level {
            config.compression_level = level;
        }
        if let Some(max_size) = self.max_size {
            config.max_file_size_bytes = max_size;
        }
        if self.log_file.is_some() {
            config.log_file = self.log_file;
        }
        if self.detailed {
            config.detailed_logging = true;
        }
    }
}

fn main() {
    // Initialize tracing to stderr (so JSON output can go cleanly to stdout)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Compare {
            old,
            new,
            config,
            ignore,
            include,
            concurrency,
            no_compress,
            level,
            max_size,
            log_file,
            detailed,
            json,
        } => run_compare(
            &old,
            &new,
            config.as_deref(),
            Overrides {
                ignore,
                include,
                concurrency,
                no_compress,
                level,
                max_size,
                log_file,
                detailed,
            },
            json,
        ),
        Commands::Delta { old, new, json } => run_delta(&old, &new, json),
        Commands::InitConfig { path, force } => run_init_config(path, force),
    };

    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run_compare(
    old: &Path,
    new: &Path,
    config_path: Option<&Path>,
    overrides: Overrides,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !old.is_dir() {
        return Err(format!("Old path is not a directory: {}", old.display()).into());
    }
    if !new.is_dir() {
        return Err(format!("New path is not a directory: {}", new.display()).into());
    }

    let loaded = load_config(config_path)?;
    if loaded.exists {
        info!("Using config file: {}", loaded.path.display());
    }
    let mut config = loaded.config;
    overrides.apply(&mut config);

    info!("Comparing:");
    info!("  Old: {}", old.display());
    info!("  New: {}", new.display());

    let engine = DiffEngine::new(config)?;

    let spinner = if !json && std::io::stderr().is_terminal() {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")?);
        spinner.set_message("Comparing directories...");
        spinner.enable_steady_tick(Duration::from_millis(100));
        Some(spinner)
    } else {
        None
    };

    let compared = engine.compare_dirs(old, new);
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    let (summary, results) = compared?;

    if json {
        let report = build_json_report(old, new, &summary, &results);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\n{}", "=".repeat(80));
    println!("Comparison Results");
    println!("{}", "=".repeat(80));

    for result in &results {
        let symbol = match result.operation {
            Operation::Added => "  +  ",
            Operation::Modified => "  ~  ",
            Operation::Deleted => "  -  ",
        };
        println!(
            "{} {} ({}, {} chunks)",
            symbol,
            result.path.display(),
            result.file_type,
            result.chunks.len()
        );
    }
    for skipped in &summary.skipped {
        println!("  !   {} ({})", skipped.path.display(), skipped.reason);
    }

    println!("\n{}", "=".repeat(80));
    println!("Summary:");
    println!("  Total changes:   {}", summary.total_files);
    println!("  Added:           {}", summary.added_files);
    println!("  Modified:        {}", summary.modified_files);
    println!("  Deleted:         {}", summary.deleted_files);
    println!("  Skipped:         {}", summary.skipped.len());
    println!("  Changed bytes:   {}", summary.total_size_bytes);
    println!("  Payload bytes:   {}", summary.compressed_bytes);
    println!(
        "  Elapsed:         {} ms",
        summary.elapsed().num_milliseconds()
    );
    println!("{}", "=".repeat(80));

    Ok(())
}

fn run_delta(old: &Path, new: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let old_data = fs::read(old)?;
    let new_data = fs::read(new)?;

    let matcher = BinaryDeltaMatcher::new();
    let chunks = matcher.compare(&old_data, &new_data);
    let rebuilt = matcher.apply(&old_data, &chunks)?;
    if rebuilt != new_data {
        return Err("Delta does not reproduce the new file".into());
    }

    let stats = matcher.latest_stats();
    let report = DeltaReport {
        old: old.to_string_lossy().to_string(),
        new: new.to_string_lossy().to_string(),
        old_size: old_data.len() as u64,
        new_size: new_data.len() as u64,
        chunk_count: chunks.len(),
        changed_bytes: chunks.iter().map(|c| c.new_data.len() as u64).sum(),
        match_count: stats.match_count,
        total_matched_bytes: stats.total_matched_bytes,
        largest_match: stats.largest_match,
        smallest_match: stats.smallest_match,
        average_match_size: stats.average_match_size,
        compression_ratio: stats.compression_ratio,
        entropy: stats.entropy,
        min_match_length: stats.params.min_match_length,
        max_gap_size: stats.params.max_gap_size,
        verified: true,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Delta: {} -> {}", report.old, report.new);
    println!("  Sizes:           {} -> {} bytes", report.old_size, report.new_size);
    println!("  Chunks:          {}", report.chunk_count);
    println!("  Changed bytes:   {}", report.changed_bytes);
    println!(
        "  Matches:         {} ({} bytes, largest {}, smallest {})",
        report.match_count, report.total_matched_bytes, report.largest_match, report.smallest_match
    );
    println!("  Ratio:           {:.3}", report.compression_ratio);
    println!("  Entropy:         {:.3}", report.entropy);
    println!(
        "  Window / gap:    {} / {}",
        report.min_match_length, report.max_gap_size
    );
    println!("  Round trip:      ok");
    Ok(())
}

fn run_init_config(path: Option<PathBuf>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if path.exists() && !force {
        return Err(format!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        )
        .into());
    }

    save_config(&path, &Configuration::default())?;
    println!("{}", path.display());
    Ok(())
}

#[derive(Serialize)]
struct JsonReport {
    old: String,
    new: String,
    summary: JsonSummary,
    entries: Vec<JsonEntry>,
    skipped: Vec<JsonSkipped>,
}

#[derive(Serialize)]
struct JsonSummary {
    total: usize,
    added: usize,
    modified: usize,
    deleted: usize,
    skipped: usize,
    total_size_bytes: u64,
    compressed_bytes: u64,
    file_types: BTreeMap<String, usize>,
    elapsed_ms: i64,
}

#[derive(Serialize)]
struct JsonEntry {
    path: String,
    operation: Operation,
    file_type: String,
    old_hash: Option<String>,
    new_hash: Option<String>,
    size: u64,
    modified: String,
    permissions: u32,
    chunks: usize,
    payload_bytes: u64,
    compressed: bool,
}

#[derive(Serialize)]
struct JsonSkipped {
    path: String,
    #[serde(flatten)]
    reason: SkipReason,
}

#[derive(Serialize)]
struct DeltaReport {
    old: String,
    new: String,
    old_size: u64,
    new_size: u64,
    chunk_count: usize,
    changed_bytes: u64,
    match_count: usize,
    total_matched_bytes: u64,
    largest_match: u64,
    smallest_match: u64,
    average_match_size: f64,
    compression_ratio: f64,
    entropy: f64,
    min_match_length: usize,
    max_gap_size: usize,
    verified: bool,
}

fn build_json_report(
    old: &Path,
    new: &Path,
    summary: &DiffSummary,
    results: &[DiffResult],
) -> JsonReport {
    JsonReport {
        old: old.to_string_lossy().to_string(),
        new: new.to_string_lossy().to_string(),
        summary: JsonSummary {
            total: summary.total_files,
            added: summary.added_files,
            modified: summary.modified_files,
            deleted: summary.deleted_files,
            skipped: summary.skipped.len(),
            total_size_bytes: summary.total_size_bytes,
            compressed_bytes: summary.compressed_bytes,
            file_types: summary.file_types.clone(),
            elapsed_ms: summary.elapsed().num_milliseconds(),
        },
        entries: results.iter().map(json_entry).collect(),
        skipped: summary
            .skipped
            .iter()
            .map(|s| JsonSkipped {
                path: s.path.to_string_lossy().to_string(),
                reason: s.reason.clone(),
            })
            .collect(),
    }
}

fn json_entry(result: &DiffResult) -> JsonEntry {
    JsonEntry {
        path: result.path.to_string_lossy().to_string(),
        operation: result.operation,
        file_type: result.file_type.clone(),
        old_hash: result.old_hash.clone(),
        new_hash: result.new_hash.clone(),
        size: result.size,
        modified: result.modified.to_rfc3339(),
        permissions: result.permissions,
        chunks: result.chunks.len(),
        payload_bytes: result.payload_bytes(),
        compressed: result.is_compressed,
    }
}
