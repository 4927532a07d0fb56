//! nbdprobe - connect to an NBD export and report what was negotiated.
//!
//! Usage:
//!   nbdprobe --export sda
//!   nbdprobe --export sda --host 10.0.0.5 --checkpoint virtnbdbackup.1 --extents
//!   nbdprobe --config export.toml --json

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use nbdbackup::{ExportConfig, ExportSession, ExtentRun, parse_port};

#[derive(Parser)]
#[command(name = "nbdprobe")]
#[command(about = "Probe an NBD export: size, flags, meta contexts and extents")]
struct Cli {
    /// Path to a TOML export config. Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Export name to attach to
    #[arg(short, long)]
    export: Option<String>,

    /// NBD server host
    #[arg(long)]
    host: Option<String>,

    /// NBD server port
    #[arg(short, long, value_parser = port_arg)]
    port: Option<u16>,

    /// Meta context to request (default: base:allocation)
    #[arg(short, long, conflicts_with = "checkpoint")]
    meta_context: Option<String>,

    /// Request the dirty bitmap of this checkpoint
    #[arg(long)]
    checkpoint: Option<String>,

    /// Also print the extent map of the negotiated context
    #[arg(long)]
    extents: bool,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

fn port_arg(value: &str) -> Result<u16, String> {
    parse_port(value).map_err(|e| e.to_string())
}

#[derive(Serialize)]
struct Report {
    export: String,
    address: String,
    size_bytes: u64,
    transmission_flags: u16,
    read_only: bool,
    multi_conn: bool,
    block_size: Option<BlockSizeReport>,
    requested_context: String,
    granted_contexts: Vec<String>,
    max_request_size: u32,
    min_request_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    extents: Option<Vec<ExtentRun>>,
}

#[derive(Serialize)]
struct BlockSizeReport {
    minimum: u32,
    preferred: u32,
    maximum: u32,
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

fn build_config(cli: &Cli) -> Result<ExportConfig> {
    let mut config = match (&cli.config, &cli.export) {
        (Some(path), _) => ExportConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        (None, Some(export)) => ExportConfig::new(export.as_str()),
        (None, None) => anyhow::bail!("either --config or --export is required"),
    };

    // CLI overrides
    if let (Some(_), Some(export)) = (&cli.config, &cli.export) {
        config.export_name = export.clone();
    }
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(context) = &cli.meta_context {
        config.meta_context = context.clone();
    }
    if let Some(checkpoint) = &cli.checkpoint {
        config = config.with_dirty_bitmap(checkpoint);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&cli)?;
    let address = config.address();
    let export = config.export_name.clone();

    let mut session = ExportSession::new(config)?
        .connect()
        .await
        .with_context(|| format!("Failed to connect to export {export} at {address}"))?;

    let extents = if cli.extents {
        let size = session.export_size();
        Some(
            session
                .extents(0, size)
                .await
                .context("Failed to query block status")?,
        )
    } else {
        None
    };

    let report = Report {
        export,
        address,
        size_bytes: session.export_size(),
        transmission_flags: session.transmission_flags(),
        read_only: session.is_read_only(),
        multi_conn: session.can_multi_conn(),
        block_size: session.block_size().map(|b| BlockSizeReport {
            minimum: b.minimum,
            preferred: b.preferred,
            maximum: b.maximum,
        }),
        requested_context: session.config().meta_context.clone(),
        granted_contexts: session
            .granted_meta_contexts()
            .iter()
            .map(|c| c.name.clone())
            .collect(),
        max_request_size: session.max_request_size(),
        min_request_size: session.min_request_size(),
        extents,
    };

    session.disconnect().await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &Report) {
    println!("export:        {} @ {}", report.export, report.address);
    println!(
        "size:          {} ({} bytes)",
        format_size(report.size_bytes),
        report.size_bytes
    );
    println!(
        "flags:         0x{:04x}{}{}",
        report.transmission_flags,
        if report.read_only { " read-only" } else { "" },
        if report.multi_conn { " multi-conn" } else { "" }
    );
    if let Some(b) = &report.block_size {
        println!(
            "block size:    min {} / preferred {} / max {}",
            b.minimum, b.preferred, b.maximum
        );
    }
    println!(
        "requests:      {} .. {}",
        format_size(report.min_request_size as u64),
        format_size(report.max_request_size as u64)
    );
    if report.granted_contexts.is_empty() {
        println!("meta contexts: none granted (requested {})", report.requested_context);
    } else {
        println!("meta contexts: {}", report.granted_contexts.join(", "));
    }
    if let Some(extents) = &report.extents {
        println!("extents:");
        for run in extents {
            println!(
                "  {:>16} {:>16} flags=0x{:x}",
                run.offset, run.length, run.flags
            );
        }
    }
}
