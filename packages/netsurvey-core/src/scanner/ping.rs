//! Ping sweep using the system ping command.
//!
//! Replies are staged while the sweep runs and merged into the registry in one
//! batch once every target has answered or timed out.

use super::{ProbeStep, StepProgress, StepState, hidden_command, spawn_sweep, sweep};
use crate::config::PingSettings;
use crate::error::ProbeError;
use crate::inventory::{Host, HostRegistry, HostStatus};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A single ICMP echo.
#[async_trait]
pub trait EchoProbe: Send + Sync {
    /// `Ok(Some(ms))` on reply, `Ok(None)` when the host stays silent.
    async fn echo(&self, ip: &str, timeout: Duration) -> Result<Option<f64>, ProbeError>;
}

/// Shells out to the platform `ping`, which needs no raw-socket privilege.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPing;

#[async_trait]
impl EchoProbe for SystemPing {
    async fn echo(&self, ip: &str, timeout: Duration) -> Result<Option<f64>, ProbeError> {
        let ip_owned = ip.to_string();

        tokio::task::spawn_blocking(move || {
            let start = Instant::now();

            #[cfg(target_os = "windows")]
            let output = hidden_command("ping")
                .args(["-n", "1", "-w", &timeout.as_millis().to_string(), &ip_owned])
                .output();

            #[cfg(target_os = "macos")]
            let output = hidden_command("ping")
                .args(["-c", "1", "-W", &timeout.as_millis().to_string(), &ip_owned])
                .output();

            #[cfg(not(any(target_os = "windows", target_os = "macos")))]
            let output = hidden_command("ping")
                .args(["-c", "1", "-W", &timeout.as_secs().max(1).to_string(), &ip_owned])
                .output();

            let output = output.map_err(|e| ProbeError::Command(format!("ping: {}", e)))?;
            let stdout = String::from_utf8_lossy(&output.stdout);

            if !ping_succeeded(output.status.success(), &stdout) {
                return Ok(None);
            }
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            Ok(Some(parse_ping_time(&stdout).unwrap_or(elapsed_ms)))
        })
        .await
        .map_err(|e| ProbeError::Command(format!("ping task failed: {}", e)))?
    }
}

/// Windows `ping` exits 0 for "destination host unreachable", so also look for a reply.
fn ping_succeeded(exit_ok: bool, stdout: &str) -> bool {
    if !exit_ok {
        return false;
    }
    if cfg!(target_os = "windows") {
        let lower = stdout.to_lowercase();
        return lower.contains("reply from") && !lower.contains("unreachable");
    }
    true
}

/// Parse ping response time from command output
fn parse_ping_time(output: &str) -> Option<f64> {
    output.split_whitespace().find_map(|word| {
        let value = word
            .strip_prefix("time=")
            .or_else(|| word.strip_prefix("time<"))?;
        value.trim_end_matches("ms").parse::<f64>().ok()
    })
}

pub struct PingSweepStep {
    registry: Arc<HostRegistry>,
    settings: PingSettings,
    probe: Arc<dyn EchoProbe>,
    state: StepState,
}

impl PingSweepStep {
    pub fn new(registry: Arc<HostRegistry>, settings: PingSettings) -> Self {
        Self::with_probe(registry, settings, Arc::new(SystemPing))
    }

    pub fn with_probe(
        registry: Arc<HostRegistry>,
        settings: PingSettings,
        probe: Arc<dyn EchoProbe>,
    ) -> Self {
        Self {
            registry,
            settings,
            probe,
            state: StepState::default(),
        }
    }
}

impl ProbeStep for PingSweepStep {
    fn name(&self) -> &'static str {
        "Ping Sweep"
    }

    fn description(&self) -> &'static str {
        "Sends one ICMP echo to every target and marks responders online."
    }

    fn start(&self, targets: Vec<String>) {
        if !self.state.begin(self.name()) {
            return;
        }
        let registry = self.registry.clone();
        let probe = self.probe.clone();
        let settings = self.settings.clone();
        let progress = self.state.progress.clone();

        spawn_sweep(self.name(), progress.clone(), async move {
            let timeout = settings.timeout();
            progress.set_message(format!("Pinging {} addresses...", targets.len()));

            let staged: Mutex<Vec<Host>> = Mutex::new(Vec::new());
            {
                let staged = &staged;
                let probe = &*probe;
                let log = &*progress;
                sweep(&progress, targets, settings.concurrency, move |ip: String| async move {
                    match probe.echo(&ip, timeout).await {
                        Ok(Some(ms)) => {
                            log.log(format!("Pinging {}... OK ({:.1}ms)", ip, ms));
                            let host = Host::with_address(ip).with_status(HostStatus::Online);
                            staged
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(host);
                        }
                        Ok(None) => log.log(format!("Pinging {}... No response", ip)),
                        Err(e) => log.log(format!("Pinging {}... {}", ip, e.describe("ping"))),
                    }
                })
                .await;
            }

            let responders = staged.into_inner().unwrap_or_else(PoisonError::into_inner);
            let count = responders.len();
            progress.set_message(format!("Recording {} responding hosts...", count));
            registry.upsert_all(responders);

            tracing::info!("Ping sweep complete: {} responding hosts", count);
            progress.finish(format!("Ping sweep complete: {} hosts responded", count));
        });
    }

    fn progress(&self) -> &StepProgress {
        &self.state.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Replies for a fixed set of addresses.
    struct FakeEcho(HashSet<&'static str>);

    #[async_trait]
    impl EchoProbe for FakeEcho {
        async fn echo(&self, ip: &str, _timeout: Duration) -> Result<Option<f64>, ProbeError> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if ip == "10.0.0.250" {
                return Err(ProbeError::Command("ping: not found".into()));
            }
            Ok(self.0.contains(ip).then_some(0.4))
        }
    }

    #[test]
    fn test_parse_ping_time() {
        assert_eq!(
            parse_ping_time("64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=0.412 ms"),
            Some(0.412)
        );
        assert_eq!(
            parse_ping_time("Reply from 10.0.0.1: bytes=32 time<1ms TTL=128"),
            Some(1.0)
        );
        assert_eq!(parse_ping_time("Request timed out."), None);
    }

    #[tokio::test]
    async fn test_sweep_merges_responders_after_completion() {
        let registry = Arc::new(HostRegistry::new());
        let mut arp_host = Host::with_address("10.0.0.2");
        arp_host.network_interfaces[0].mac = Some("AA:BB:CC:00:00:02".into());
        registry.upsert(arp_host);

        let probe = Arc::new(FakeEcho(["10.0.0.1", "10.0.0.2"].into_iter().collect()));
        let step = PingSweepStep::with_probe(registry.clone(), PingSettings::default(), probe);
        let targets: Vec<String> = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.250"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        step.start(targets);
        let mut last = 0.0;
        while !step.is_completed() {
            let now = step.progress_percentage();
            assert!(now >= last);
            last = now;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(step.progress_percentage(), 1.0);
        assert_eq!(registry.len(), 2);
        let joined = registry.find_by_address("10.0.0.2").unwrap();
        assert_eq!(joined.status, HostStatus::Online);
        assert_eq!(joined.first_mac(), Some("AA:BB:CC:00:00:02"));
        assert!(registry.find_by_address("10.0.0.3").is_none());

        let log = step.progress_log();
        assert!(log.contains("Pinging 10.0.0.3... No response"));
        assert!(log.contains("Pinging 10.0.0.250... Error: ping"));
    }
}
