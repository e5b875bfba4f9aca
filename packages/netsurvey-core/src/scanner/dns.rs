//! Reverse DNS lookups.

use super::{ProbeStep, StepProgress, StepState, TargetScope, spawn_sweep, sweep};
use crate::config::DnsSettings;
use crate::error::ProbeError;
use crate::inventory::{HostField, HostRegistry};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Resolve the PTR name for `ip` on the blocking pool, bounded by `timeout`.
///
/// Returns `Ok(None)` when the resolver has no name, or only echoes the address.
pub async fn reverse_lookup(ip: &str, timeout: Duration) -> Result<Option<String>, ProbeError> {
    let addr: IpAddr = ip
        .parse()
        .map_err(|_| ProbeError::Protocol(format!("{} is not an IP address", ip)))?;

    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr));
    let name = match tokio::time::timeout(timeout, lookup).await {
        Err(_) => return Err(ProbeError::timeout("resolving hostname", timeout)),
        Ok(Err(e)) => return Err(ProbeError::Command(format!("lookup task failed: {}", e))),
        Ok(Ok(Err(e))) => {
            tracing::trace!("reverse lookup {} failed: {}", ip, e);
            return Ok(None);
        }
        Ok(Ok(Ok(name))) => name,
    };

    let name = name.trim().trim_end_matches('.');
    if name.is_empty() || name == ip {
        return Ok(None);
    }
    Ok(Some(name.to_string()))
}

pub struct DnsLookupStep {
    registry: Arc<HostRegistry>,
    settings: DnsSettings,
    state: StepState,
}

impl DnsLookupStep {
    pub fn new(registry: Arc<HostRegistry>, settings: DnsSettings) -> Self {
        Self {
            registry,
            settings,
            state: StepState::default(),
        }
    }
}

impl ProbeStep for DnsLookupStep {
    fn name(&self) -> &'static str {
        "DNS Lookup"
    }

    fn description(&self) -> &'static str {
        "Resolves hostnames of discovered hosts through reverse DNS."
    }

    fn target_scope(&self) -> TargetScope {
        if self.settings.online_only {
            TargetScope::OnlineHosts
        } else {
            TargetScope::Candidates
        }
    }

    fn start(&self, targets: Vec<String>) {
        if !self.state.begin(self.name()) {
            return;
        }
        let registry = self.registry.clone();
        let settings = self.settings.clone();
        let progress = self.state.progress.clone();

        spawn_sweep(self.name(), progress.clone(), async move {
            let timeout = settings.timeout();
            progress.set_message(format!("Resolving {} addresses...", targets.len()));

            let registry = &*registry;
            let log = &*progress;
            sweep(&progress, targets, settings.concurrency, move |ip: String| async move {
                if !registry.contains_address(&ip) {
                    log.log(format!("Querying hostname for {}... Not in host list, skipped.", ip));
                    return;
                }
                match reverse_lookup(&ip, timeout).await {
                    Ok(Some(name)) => {
                        let applied = registry.update_field(&ip, HostField::Hostname, &name);
                        log.log(format!(
                            "Querying hostname for {}... Found: {}{}",
                            ip,
                            name,
                            if applied { "" } else { " (hostname already set)" }
                        ));
                    }
                    Ok(None) => log.log(format!("Querying hostname for {}... No hostname found.", ip)),
                    Err(e) => log.log(format!(
                        "Querying hostname for {}... {}",
                        ip,
                        e.describe("DNS lookup failed")
                    )),
                }
            })
            .await;

            progress.finish("Hostname resolution complete");
        });
    }

    fn progress(&self) -> &StepProgress {
        &self.state.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Host;

    #[tokio::test]
    async fn test_reverse_lookup_rejects_non_ip() {
        let err = reverse_lookup("not-an-ip", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_skips_addresses_not_in_registry() {
        let registry = Arc::new(HostRegistry::new());
        let step = DnsLookupStep::new(registry.clone(), DnsSettings::default());
        assert_eq!(step.target_scope(), TargetScope::OnlineHosts);

        step.start(vec!["192.0.2.44".into()]);
        while !step.is_completed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(step.progress_log().contains("Not in host list, skipped."));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_first_hostname_is_kept() {
        let registry = Arc::new(HostRegistry::new());
        let mut host = Host::with_address("127.0.0.1");
        host.hostname = Some("from-netbios".into());
        registry.upsert(host);

        let step = DnsLookupStep::new(registry.clone(), DnsSettings::default());
        step.start(vec!["127.0.0.1".into()]);
        while !step.is_completed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let host = registry.find_by_address("127.0.0.1").unwrap();
        assert_eq!(host.hostname.as_deref(), Some("from-netbios"));
        assert_eq!(host.domain, None);
    }
}
