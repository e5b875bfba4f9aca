//! Probe steps.
//!
//! Each step implements [`ProbeStep`]: it is started with a list of target
//! addresses, runs its own bounded-concurrency sweep on a background task,
//! writes what it finds into the shared [`HostRegistry`](crate::HostRegistry)
//! and reports progress until it completes. Steps:
//! - ARP table ingestion ([`ArpTableStep`])
//! - ICMP ping sweep ([`PingSweepStep`])
//! - mDNS / DNS-SD listener ([`MdnsStep`])
//! - Reverse DNS ([`DnsLookupStep`])
//! - TCP port scan with banner capture ([`PortScanStep`])
//! - HTTP/S header fingerprinting ([`HttpFingerprintStep`])
//! - NetBIOS name table and SMB probe ([`NetBiosStep`])
//! - MSRPC endpoint mapper and SMB probe ([`MsrpcStep`])
//! - Heuristic OS/vendor inference ([`InferenceStep`])

pub mod arp;
pub mod dns;
pub mod http;
pub mod inference;
pub mod mdns;
pub mod msrpc;
pub mod netbios;
pub mod network;
pub mod oui;
pub mod ping;
pub mod ports;
mod progress;
pub mod wire;

pub use arp::{ArpEntry, ArpSource, ArpTableStep};
pub use dns::DnsLookupStep;
pub use http::HttpFingerprintStep;
pub use inference::InferenceStep;
pub use mdns::MdnsStep;
pub use msrpc::MsrpcStep;
pub use netbios::NetBiosStep;
pub use network::{LocalNetwork, detect_local_network};
pub use ping::{EchoProbe, PingSweepStep, SystemPing};
pub use ports::{PortScanStep, well_known_service};
pub use progress::StepProgress;

use crate::error::ProbeError;
use crate::inventory::{HostField, HostRegistry, Protocol};
use futures::StreamExt;
use std::future::Future;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which addresses the pipeline hands to a step's `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScope {
    /// The caller's candidate address list.
    Candidates,
    /// Primary addresses of hosts the registry currently marks online.
    OnlineHosts,
    /// The step selects hosts from the registry itself; the list is empty.
    Registry,
}

/// Contract shared by every probe step.
pub trait ProbeStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn target_scope(&self) -> TargetScope {
        TargetScope::Candidates
    }

    /// Begin the sweep on a background task and return immediately.
    fn start(&self, targets: Vec<String>);

    fn progress(&self) -> &StepProgress;

    fn progress_message(&self) -> String {
        self.progress().message()
    }

    /// Full step log, newest line last.
    fn progress_log(&self) -> String {
        self.progress().log_text()
    }

    fn progress_percentage(&self) -> f64 {
        self.progress().percentage()
    }

    fn is_completed(&self) -> bool {
        self.progress().is_completed()
    }
}

/// Progress plus the start-once latch every step carries.
#[derive(Debug, Default)]
pub(crate) struct StepState {
    pub(crate) progress: Arc<StepProgress>,
    started: AtomicBool,
}

impl StepState {
    /// Returns false (and logs) when the step was already started.
    pub(crate) fn begin(&self, step: &str) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::warn!("{} already started, ignoring second start", step);
            return false;
        }
        tracing::info!("Starting {}", step);
        true
    }
}

/// Run a step's sweep on the runtime under a supervisor.
///
/// If the sweep panics the supervisor logs it and still marks the step
/// completed, so pollers never wait forever.
pub(crate) fn spawn_sweep<F>(step: &'static str, progress: Arc<StepProgress>, sweep: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(sweep);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            tracing::error!("{} aborted: {}", step, e);
            progress.log(format!("Error: step aborted: {}", e));
        }
        if !progress.is_completed() {
            progress.finish(format!("{} finished", step));
        }
    });
}

/// Run `probe` over `items` with at most `limit` in flight, advancing progress
/// once per item.
pub(crate) async fn sweep<T, F, Fut>(progress: &StepProgress, items: Vec<T>, limit: usize, probe: F)
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()>,
{
    progress.set_total(items.len());
    futures::stream::iter(items)
        .for_each_concurrent(limit.max(1), |item| {
            let work = probe(item);
            async move {
                work.await;
                progress.advance();
            }
        })
        .await;
}

/// Record the Windows platform signature some protocol probe saw.
pub(crate) fn mark_windows(registry: &HostRegistry, ip: &str) {
    registry.update_field(ip, HostField::Manufacturer, "Microsoft");
    registry.update_field(ip, HostField::Model, "Windows OS");
}

/// Replace a service name with a probe verdict unless it already carries it.
pub(crate) fn label_service(
    registry: &HostRegistry,
    ip: &str,
    port: u16,
    protocol: Protocol,
    label: &str,
) {
    registry.update_service(ip, port, protocol, |s| {
        if !s.service_name.contains(label) {
            s.service_name = label.to_string();
        }
    });
}

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Create a Command that hides the console window on Windows.
pub fn hidden_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Run a system command on the blocking pool and return its stdout.
pub(crate) async fn command_output(program: &'static str, args: &[&str]) -> Result<String, ProbeError> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let output = tokio::task::spawn_blocking(move || hidden_command(program).args(&args).output())
        .await
        .map_err(|e| ProbeError::Command(format!("{} task failed: {}", program, e)))?
        .map_err(|e| ProbeError::Command(format!("{}: {}", program, e)))?;

    if !output.status.success() && output.stdout.is_empty() {
        return Err(ProbeError::Command(format!(
            "{} exited with {}",
            program, output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sweep_bounds_concurrency_and_counts_items() {
        let progress = StepProgress::new();
        let in_flight = &AtomicUsize::new(0);
        let peak = &AtomicUsize::new(0);

        sweep(&progress, (0..20).collect::<Vec<_>>(), 3, move |_| async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(progress.processed(), 20);
        assert_eq!(progress.total(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_panicking_sweep_still_completes() {
        let progress = Arc::new(StepProgress::new());
        spawn_sweep("Broken Step", progress.clone(), async {
            panic!("boom");
        });

        for _ in 0..100 {
            if progress.is_completed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(progress.is_completed());
        assert!(progress.log_text().contains("Error: step aborted"));
    }

    #[test]
    fn test_step_state_starts_once() {
        let state = StepState::default();
        assert!(state.begin("Test"));
        assert!(!state.begin("Test"));
    }
}
