use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mesh_decode::config::Config;
use mesh_decode::mesh::keys::KeyStore;
use mesh_decode::mesh::pipeline::Decoder;
use mesh_decode::report::DecodedPacket;
use mesh_decode::{trace, udp};

#[derive(Parser)]
#[command(name = "mesh-decode")]
#[command(about = "Decrypt and reassemble captured Bluetooth Mesh traffic")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Print one JSON report per packet instead of a summary line
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Receive proxy PDUs over UDP and decode them as they arrive
    Listen {
        /// Override the configured bind address
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Decode the network PDUs in a trace file
    Replay {
        /// Trace file: one hex or JSON record per line
        #[arg(short, long)]
        trace: PathBuf,

        /// Decode the trace this many times over the same state
        #[arg(long, default_value_t = 1)]
        passes: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("mesh-decode v{}", env!("CARGO_PKG_VERSION"));

    let (keys, rejected) = KeyStore::from_config(&config.keys);
    if !rejected.is_empty() {
        warn!("Rejected {} key configuration entries", rejected.len());
    }
    info!(
        "Loaded {} network, {} application, {} device key(s) and {} label(s)",
        keys.networks.len(),
        keys.applications.len(),
        keys.devices.len(),
        keys.labels.len()
    );

    match cli.command {
        Command::Listen { bind } => {
            if let Some(bind) = bind {
                config.udp.bind = bind;
            }
            listen(config, keys, cli.json).await
        }
        Command::Replay { trace, passes } => replay(&config, keys, &trace, passes, cli.json),
    }
}

fn emit(report: &DecodedPacket, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
    } else {
        info!("{}", report);
    }
    Ok(())
}

async fn listen(config: Config, keys: KeyStore, json: bool) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<DecodedPacket>(256);

    tokio::spawn(async move {
        if let Err(e) = udp::run_server(&config, keys, tx).await {
            error!("UDP server failed: {}", e);
        }
    });

    info!("Decoder running. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            report = rx.recv() => match report {
                Some(report) => emit(&report, json)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }
    Ok(())
}

fn replay(config: &Config, keys: KeyStore, path: &Path, passes: usize, json: bool) -> anyhow::Result<()> {
    let records = trace::load(path, config.decoder.bearer())?;
    info!("Replaying {} packet(s) from {:?}, {} pass(es)", records.len(), path, passes);

    let mut decoder = Decoder::new(keys);
    for pass in 1..=passes.max(1) {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in &records {
            let outcome = decoder.decode(&record.data, record.bearer);
            let source = format!("pass {} line {}", pass, record.line);
            let report = DecodedPacket::from_outcome(&outcome, &record.data, record.bearer, &source);
            *counts.entry(report.status.to_string()).or_default() += 1;
            emit(&report, json)?;
        }
        info!("Pass {}: {:?}", pass, counts);
    }

    for pending in decoder.pending() {
        warn!("{}", pending);
    }
    Ok(())
}
