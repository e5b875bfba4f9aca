//! netsurvey core library
//!
//! This crate provides the discovery and enrichment engine behind the
//! `netsurvey` CLI:
//! - A shared host inventory with merge-by-address semantics
//! - Probe steps (ping, ARP, mDNS, reverse DNS, port scan, HTTP/S,
//!   NetBIOS, MSRPC, OS/vendor inference)
//! - A sequential pipeline runner with progress reporting
//! - Layered configuration and JSON inventory export
//!
//! # Example
//!
//! ```no_run
//! use netsurvey_core::{PipelineRunner, config, persistence};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load_scan_config();
//!     let runner = PipelineRunner::with_default_steps(&config);
//!
//!     let targets = (1..=254).map(|i| format!("192.168.1.{}", i)).collect();
//!     let summary = runner
//!         .run(targets, Some(Box::new(|p| println!("[{:3}%] {}", p.overall_percent, p.message))))
//!         .await?;
//!     println!("Found {} hosts", summary.hosts.len());
//!
//!     persistence::save_inventory(&persistence::default_inventory_path()?, &summary.hosts)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod inventory;
pub mod persistence;
pub mod pipeline;
pub mod scanner;

// Re-export commonly used types
pub use config::{ConfigSource, ScanConfig};
pub use error::ProbeError;
pub use inventory::{Host, HostEvent, HostField, HostRegistry, HostStatus, NetworkInterface, Protocol, Service};
pub use pipeline::{PipelineProgress, PipelineRunner, PipelineSummary, ProgressCallback, StepReport};
pub use scanner::{LocalNetwork, ProbeStep, StepProgress, TargetScope, detect_local_network};
