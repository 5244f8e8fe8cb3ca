//! CLI for pmarchive archives.
//!
//! Provides commands for inspecting, dumping, checking and uploading
//! archives.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use pmarchive::naming::FileKind;
use pmarchive::upload::{self, UploadConfig};
use pmarchive::{
    ArchiveContext, ArchiveError, ArchiveHandle, Direction, ReadOptions, Record, Timestamp, Values,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// pmarchive: multi-volume performance metrics archive tool.
#[derive(Parser)]
#[command(name = "pmarchive", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display an archive's label and files.
    Label {
        /// Archive base name or any of its files.
        archive: PathBuf,
    },

    /// List the temporal index of an archive.
    Index {
        /// Archive base name or any of its files.
        archive: PathBuf,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Print records from one archive or a chain of archives.
    Dump {
        /// Archives to chain, in any order.
        #[arg(required = true)]
        archives: Vec<PathBuf>,

        /// Start from this time (seconds since the epoch, e.g. "1700000000.5").
        #[arg(long)]
        start: Option<Timestamp>,

        /// Read backward from the end (or from --start).
        #[arg(long)]
        reverse: bool,

        /// Stop after this many records.
        #[arg(long)]
        limit: Option<usize>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,

        /// Validate every record's structure while reading.
        #[arg(long)]
        paranoid: bool,

        /// Only print these metrics, skipping records without any of them
        /// (comma-separated or repeated).
        #[arg(long = "pmid", value_delimiter = ',')]
        pmids: Vec<u32>,
    },

    /// Print the start and end time of archives.
    End {
        /// Archives to inspect.
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },

    /// Read every record with full validation and report problems.
    Check {
        /// Archive base name or any of its files.
        archive: PathBuf,
    },

    /// Upload an archive to an ingestion endpoint.
    Upload {
        /// Archive base name or any of its files.
        archive: PathBuf,

        /// Base URL of the ingestion API.
        #[arg(long)]
        endpoint: String,

        /// Extra HTTP header as "Name: value" (repeatable).
        #[arg(long = "header")]
        headers: Vec<String>,

        /// Maximum number of retries per request.
        #[arg(long, default_value = "3")]
        retries: u32,

        /// Largest byte range per request.
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Per-request timeout in seconds.
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

/// Output format for listings.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON document.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Label { archive } => cmd_label(&archive),
        Commands::Index { archive, format } => cmd_index(&archive, &format),
        Commands::Dump {
            archives,
            start,
            reverse,
            limit,
            format,
            paranoid,
            pmids,
        } => cmd_dump(&archives, start, reverse, limit, &format, paranoid, pmids),
        Commands::End { archives } => cmd_end(&archives),
        Commands::Check { archive } => cmd_check(&archive),
        Commands::Upload {
            archive,
            endpoint,
            headers,
            retries,
            chunk_size,
            timeout,
        } => cmd_upload(&archive, endpoint, &headers, retries, chunk_size, timeout),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `pmarchive label <archive>`.
fn cmd_label(archive: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let handle = ArchiveHandle::open(archive)?;
    let label = handle.label();

    println!("Archive: {}", handle.base().display());
    println!();
    println!("  Version: {}", label.version);
    println!("  Host: {}", label.hostname);
    println!("  Pid: {}", label.pid);
    println!("  Start: {}", label.start);
    println!("  Timezone: {}", label.timezone);
    if let Some(zoneinfo) = &label.zoneinfo {
        println!("  Zoneinfo: {zoneinfo}");
    }
    if let Some(features) = label.features {
        println!("  Features: {features:#010x}");
    }
    println!();

    let files = handle.files();
    if let Some(meta) = &files.meta {
        println!("  Metadata: {} ({} bytes)", meta.path.display(), handle.file_len(FileKind::Meta)?);
    }
    match &files.index {
        Some(index) => println!(
            "  Index: {} ({} entries)",
            index.path.display(),
            handle.index().len()
        ),
        None => println!("  Index: none"),
    }
    println!("  Volumes: {}", files.volumes.len());
    for (number, file) in &files.volumes {
        let compressed = if file.compressed { ", compressed" } else { "" };
        let size = handle
            .volume_bounds(*number)?
            .map_or(0, |(_, len)| len);
        println!("    {number}: {} ({size} bytes{compressed})", file.path.display());
    }

    Ok(())
}

/// Implements `pmarchive index <archive>`.
fn cmd_index(archive: &Path, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let handle = ArchiveHandle::open(archive)?;
    let entries = handle.index().entries();

    match format {
        OutputFormat::Csv => {
            println!("# archive={}, entries={}", handle.base().display(), entries.len());
            println!("timestamp,volume,meta_offset,data_offset");
            for entry in entries {
                println!(
                    "{},{},{},{}",
                    entry.timestamp, entry.volume, entry.meta_offset, entry.data_offset
                );
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "archive": handle.base().display().to_string(),
                "count": entries.len(),
                "entries": entries,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `pmarchive dump <archives>...`.
fn cmd_dump(
    archives: &[PathBuf],
    start: Option<Timestamp>,
    reverse: bool,
    limit: Option<usize>,
    format: &OutputFormat,
    paranoid: bool,
    pmids: Vec<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = ReadOptions::new().with_paranoid(paranoid).with_pmids(pmids);
    let mut context = ArchiveContext::open(archives, options)?;
    let direction = if reverse {
        Direction::Backward
    } else {
        Direction::Forward
    };

    match start {
        Some(start) => context.seek(start, direction)?,
        None if reverse => context.seek_end(),
        None => context.rewind(),
    }

    let mut records = Vec::new();
    for result in context.iter(direction) {
        if limit.is_some_and(|limit| records.len() >= limit) {
            break;
        }
        match result {
            Ok(record) => records.push(record),
            Err(e @ ArchiveError::LogOverlap { .. }) => eprintln!("Warning: {e}"),
            Err(e) => return Err(e.into()),
        }
    }

    match format {
        OutputFormat::Csv => {
            println!("# records={}", records.len());
            println!("timestamp,pmid,inst,value");
            for record in &records {
                print_csv(record);
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "archives": archives.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                "direction": direction,
                "count": records.len(),
                "records": records,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Prints one CSV row per value of `record`; a mark record prints one row
/// with the value `mark`.
fn print_csv(record: &Record) {
    let ts = record.timestamp;
    if record.is_mark() {
        println!("{ts},,,mark");
        return;
    }
    for set in &record.value_sets {
        match &set.values {
            Values::Error(code) => println!("{ts},{},,error:{code}", set.pmid),
            Values::Insitu(values) if values.is_empty() => println!("{ts},{},,", set.pmid),
            Values::Insitu(values) => {
                for v in values {
                    println!("{ts},{},{},{}", set.pmid, v.inst, v.value);
                }
            }
            Values::Blocks(values) => {
                for v in values {
                    println!(
                        "{ts},{},{},type{}:{}",
                        set.pmid,
                        v.inst,
                        v.vtype,
                        hex(&v.data)
                    );
                }
            }
        }
    }
}

/// Implements `pmarchive end <archives>...`.
fn cmd_end(archives: &[PathBuf]) -> Result<(), Box<dyn std::error::Error>> {
    for archive in archives {
        let handle = ArchiveHandle::open(archive)?;
        let start = handle.start();
        let end = handle.end_time()?;
        #[allow(clippy::cast_precision_loss)] // display-only
        let span = (end.as_nanos() - start.as_nanos()) as f64 / 1e9;
        println!(
            "{}: start={start} end={end} span={}",
            handle.base().display(),
            format_span(span)
        );
    }
    Ok(())
}

/// Implements `pmarchive check <archive>`.
fn cmd_check(archive: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let options = ReadOptions::new().with_paranoid(true);
    let mut context = ArchiveContext::open(&[archive], options)?;
    let handle = std::sync::Arc::clone(&context.archives()[0]);

    println!("Checking {}", handle.base().display());
    info!(base = %handle.base().display(), volumes = handle.files().volumes.len(), "checking archive");

    let mut records = 0u64;
    let mut marks = 0u64;
    let mut regressions = 0u64;
    let mut last: Option<Timestamp> = None;
    for result in context.iter(Direction::Forward) {
        let record = result?;
        if let Some(previous) = last
            && record.timestamp < previous
        {
            regressions += 1;
            eprintln!("Warning: time goes backwards from {previous} to {}", record.timestamp);
        }
        if record.is_mark() {
            marks += 1;
        }
        records += 1;
        last = Some(record.timestamp);
        if records % 10_000 == 0 {
            debug!(records, timestamp = %record.timestamp, "check progress");
        }
    }

    let end = handle.end_time()?;
    info!(records, marks, regressions, %end, "check finished");
    println!("  Records: {records} ({marks} marks)");
    println!("  Index entries: {}", handle.index().len());
    println!("  Start: {}", handle.start());
    println!("  End: {end}");
    if let Some(last) = last
        && last != end
    {
        eprintln!("Warning: last record at {last} but end resolves to {end}");
    }

    if regressions > 0 {
        return Err(format!("{regressions} timestamp regressions").into());
    }
    println!("OK");
    Ok(())
}

/// Implements `pmarchive upload <archive>`.
fn cmd_upload(
    archive: &Path,
    endpoint: String,
    headers: &[String],
    retries: u32,
    chunk_size: Option<u64>,
    timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let handle = ArchiveHandle::open(archive)?;

    let mut config = UploadConfig::new(endpoint)
        .with_max_retries(retries)
        .with_timeout(Duration::from_secs(timeout));
    if let Some(chunk_size) = chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    for header in headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| format!("Invalid header '{header}'. Use \"Name: value\"."))?;
        config = config.with_header(name.trim(), value.trim());
    }

    info!(base = %handle.base().display(), endpoint = %config.endpoint, "starting upload");
    let summary = upload::push(&config, &handle)?;
    debug!(archive_id = %summary.archive_id, chunks = summary.chunks, bytes = summary.bytes, "upload finished");
    println!(
        "Uploaded {} as {} ({} chunks, {})",
        handle.base().display(),
        summary.archive_id,
        summary.chunks,
        format_bytes(summary.bytes)
    );
    Ok(())
}

/// Lower-case hex encoding of a value block.
fn hex(data: &[u8]) -> String {
    use std::fmt::Write;
    data.iter().fold(String::with_capacity(data.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Formats a span in seconds as a human-readable duration.
fn format_span(secs: f64) -> String {
    if secs >= 86400.0 {
        format!("{:.1}d", secs / 86400.0)
    } else if secs >= 3600.0 {
        format!("{:.1}h", secs / 3600.0)
    } else if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{secs:.3}s")
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
