//! netsurvey CLI - discover and fingerprint the hosts on a local network
//!
//! This binary drives the core pipeline:
//! - Expand a target list (or detect the local subnet)
//! - Run the probe steps in order with live progress
//! - Print the resulting inventory as a tree or JSON
//! - Save the inventory as `Hosts.json`

mod render;
mod targets;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use netsurvey_core::config::{self, ScanConfig};
use netsurvey_core::{
    Host, PipelineProgress, PipelineRunner, PipelineSummary, ProgressCallback, StepReport,
    detect_local_network, persistence,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Parser)]
#[command(name = "netsurvey")]
#[command(version)]
#[command(about = "Discover and fingerprint the hosts on a local network")]
#[command(long_about = "
netsurvey sweeps a set of IPv4 addresses and builds an inventory of the
hosts it finds: addresses, MACs and vendors, hostnames, open services with
their banners, and a best guess at operating system and manufacturer.

Quick start:
  1. Scan the local subnet:   netsurvey scan
  2. Scan a range:            netsurvey scan 192.168.1.1-100
  3. Skip slow steps:         netsurvey scan --skip mdns --skip ports

Targets accept literal addresses, x wildcards (10.0.0.x), ranges
(10.0.0.5-40) and CIDR blocks (10.0.0.0/24), comma separated.
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the discovery pipeline
    Scan {
        /// Targets to sweep (default: the local subnet)
        targets: Option<String>,

        /// Comma separated TCP ports for the port scan (default: well-known table)
        #[arg(short, long)]
        ports: Option<String>,

        /// Skip a step by name or prefix (repeatable)
        #[arg(short, long = "skip", value_name = "STEP")]
        skip: Vec<String>,

        /// Where to write the inventory (default: data dir / Hosts.json)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not write the inventory file
        #[arg(long)]
        no_save: bool,
    },

    /// List the pipeline steps in run order
    Steps,

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("netsurvey={},netsurvey_core={}", log_level, log_level).into()
            }),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Scan {
            targets,
            ports,
            skip,
            output,
            no_save,
        } => {
            cmd_scan(
                &cli,
                targets.as_deref(),
                ports.as_deref(),
                skip,
                output.clone(),
                *no_save,
            )
            .await
        }
        Commands::Steps => cmd_steps(&cli),
        Commands::Config => cmd_config(&cli),
    }
}

/// Resolve the target list: explicit targets, or the detected local subnet.
async fn resolve_targets(cli: &Cli, requested: Option<&str>) -> Result<Vec<String>> {
    if let Some(requested) = requested {
        return targets::parse_targets(requested);
    }
    let network = detect_local_network()
        .await
        .context("Could not detect the local network; pass targets explicitly")?;
    if let OutputFormat::Text = cli.format {
        println!(
            "Local network: {} on {} (this host {}, gateway {})",
            network.subnet,
            network.interface,
            network.local_ip,
            network.gateway.as_deref().unwrap_or("-")
        );
    }
    network.default_targets()
}

/// Text progress printer; repeats of the same line are suppressed.
fn text_progress() -> ProgressCallback {
    let last: Mutex<Option<(usize, u8, String)>> = Mutex::new(None);
    Box::new(move |p: PipelineProgress| {
        let key = (p.step_index, p.overall_percent, p.message.clone());
        let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_ref() == Some(&key) {
            return;
        }
        println!("[{:>3}%] {}: {}", p.overall_percent, p.step_name, p.message);
        *last = Some(key);
    })
}

/// JSON shape of `scan --format json`.
#[derive(Serialize)]
struct ScanOutput<'a> {
    hosts: &'a [Host],
    completed: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    steps: &'a [StepReport],
    saved_to: Option<&'a Path>,
}

fn output_path(config: &ScanConfig, requested: Option<PathBuf>) -> Result<PathBuf> {
    match requested.or_else(|| config.output.path.clone()) {
        Some(path) => Ok(path),
        None => persistence::default_inventory_path(),
    }
}

async fn cmd_scan(
    cli: &Cli,
    targets: Option<&str>,
    ports: Option<&str>,
    skip: &[String],
    output: Option<PathBuf>,
    no_save: bool,
) -> Result<()> {
    let mut config = config::load_scan_config();
    if let Some(ports) = ports {
        config.ports.ports = config::parse_port_list(ports).map_err(|e| anyhow!("--ports: {}", e))?;
    }

    let targets = resolve_targets(cli, targets).await?;
    let runner = PipelineRunner::with_default_steps(&config).skip(skip)?;
    let registry = runner.registry();

    let on_progress = match cli.format {
        OutputFormat::Text => {
            println!(
                "Scanning {} addresses with {} steps...",
                targets.len(),
                runner.steps().len()
            );
            Some(text_progress())
        }
        OutputFormat::Json => None,
    };

    let (hosts, summary): (Vec<Host>, Option<PipelineSummary>) = tokio::select! {
        result = runner.run(targets, on_progress) => {
            let summary = result?;
            (summary.hosts.clone(), Some(summary))
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, keeping the hosts found so far");
            (registry.snapshot(), None)
        }
    };

    let saved_to = if no_save {
        None
    } else {
        let path = output_path(&config, output)?;
        persistence::save_inventory(&path, &hosts)?;
        Some(path)
    };

    match cli.format {
        OutputFormat::Text => {
            println!();
            if hosts.is_empty() {
                println!("No hosts found.");
            } else {
                print!("{}", render::render_inventory(&hosts));
            }
            println!();
            match &summary {
                Some(summary) => {
                    println!(
                        "Found {} hosts in {:.1}s (finished {})",
                        hosts.len(),
                        summary.duration().num_milliseconds() as f64 / 1000.0,
                        summary
                            .finished_at
                            .with_timezone(&Local)
                            .format("%Y-%m-%d %H:%M:%S")
                    );
                    for step in &summary.steps {
                        println!("  {:<22} {:>6.1}s", step.name, step.elapsed().as_secs_f64());
                    }
                }
                None => println!("Scan interrupted: {} hosts found so far", hosts.len()),
            }
            if let Some(path) = &saved_to {
                println!("Inventory saved to {}", path.display());
            }
        }
        OutputFormat::Json => {
            let report = ScanOutput {
                hosts: &hosts,
                completed: summary.is_some(),
                started_at: summary.as_ref().map(|s| s.started_at),
                finished_at: summary.as_ref().map(|s| s.finished_at),
                steps: summary.as_ref().map(|s| s.steps.as_slice()).unwrap_or_default(),
                saved_to: saved_to.as_deref(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn cmd_steps(cli: &Cli) -> Result<()> {
    let runner = PipelineRunner::with_default_steps(&ScanConfig::default());

    match cli.format {
        OutputFormat::Text => {
            println!("Pipeline steps (in run order):");
            println!();
            for (i, step) in runner.steps().iter().enumerate() {
                println!("  {}. {:<22} {}", i + 1, step.name(), step.description());
            }
            println!();
            println!("Skip a step with: netsurvey scan --skip <name or prefix>");
        }
        OutputFormat::Json => {
            let steps: Vec<_> = runner
                .steps()
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "name": s.name(),
                        "description": s.description(),
                    })
                })
                .collect();
            println!("{}", serde_json::json!({ "steps": steps }));
        }
    }

    Ok(())
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let config = config::load_scan_config();
    let config_path = config::get_config_file_path_string();
    let inventory_path = output_path(&config, None)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "-".to_string());

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config_path);
            println!("Settings from:    {}", config.source);
            println!("Inventory file:   {}", inventory_path);
            println!("Ports scanned:    {}", config.ports.ports.len());
            println!("mDNS window:      {}ms", config.mdns.listen_ms);
            println!();
            println!("Environment variables:");
            println!("  NETSURVEY_PORTS  - Override the port list (comma separated)");
            println!("  NETSURVEY_OUTPUT - Override the inventory file path");
            println!("  RUST_LOG         - Override the log filter");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config_path,
                    "source": config.source.to_string(),
                    "inventory_file": inventory_path,
                    "settings": config,
                })
            );
        }
    }

    Ok(())
}
