//! mDNS / DNS-SD listener.
//!
//! Browses a fixed list of common service types and records every resolved
//! instance as a service on the announcing host.

use super::{ProbeStep, StepProgress, StepState, spawn_sweep};
use crate::config::MdnsSettings;
use crate::inventory::{Host, HostField, HostRegistry, HostStatus, Protocol, Service};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{Instant, timeout};

/// One resolved DNS-SD instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub addresses: Vec<String>,
    pub hostname: String,
    pub fullname: String,
    pub port: u16,
    pub service_type: String,
}

impl Announcement {
    fn from_info(info: &ServiceInfo) -> Self {
        let mut addresses: Vec<String> = info
            .get_addresses_v4()
            .iter()
            .map(|ip| ip.to_string())
            .collect();
        addresses.sort();
        Self {
            addresses,
            hostname: info.get_hostname().to_string(),
            fullname: info.get_fullname().to_string(),
            port: info.get_port(),
            service_type: info.get_type().to_string(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        if self.service_type.contains("._udp") {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    /// `_http._tcp.local.` becomes `http`.
    pub fn service_label(&self) -> String {
        self.service_type
            .split('.')
            .next()
            .unwrap_or_default()
            .trim_start_matches('_')
            .to_string()
    }

    /// Host name without the `.local.` suffix.
    pub fn short_hostname(&self) -> Option<&str> {
        let name = self
            .hostname
            .trim_end_matches('.')
            .trim_end_matches(".local");
        Some(name).filter(|n| !n.is_empty())
    }
}

/// Record an announcement for every address that is in `targets`
/// (or every address when `targets` is empty). Returns the addresses recorded.
pub fn record_announcement(
    registry: &HostRegistry,
    targets: &HashSet<String>,
    announcement: &Announcement,
) -> Vec<String> {
    let mut recorded = Vec::new();
    for ip in &announcement.addresses {
        if !targets.is_empty() && !targets.contains(ip) {
            continue;
        }
        let service = Service::new(
            announcement.port,
            announcement.protocol(),
            announcement.service_label(),
            announcement.fullname.clone(),
        );
        registry.upsert(
            Host::with_address(ip.clone())
                .with_status(HostStatus::Online)
                .with_service(service),
        );
        if let Some(name) = announcement.short_hostname() {
            registry.update_field(ip, HostField::Hostname, name);
        }
        recorded.push(ip.clone());
    }
    recorded
}

pub struct MdnsStep {
    registry: Arc<HostRegistry>,
    settings: MdnsSettings,
    state: StepState,
}

impl MdnsStep {
    pub fn new(registry: Arc<HostRegistry>, settings: MdnsSettings) -> Self {
        Self {
            registry,
            settings,
            state: StepState::default(),
        }
    }
}

impl ProbeStep for MdnsStep {
    fn name(&self) -> &'static str {
        "mDNS Discovery"
    }

    fn description(&self) -> &'static str {
        "Listens for mDNS / DNS-SD announcements of common service types."
    }

    fn start(&self, targets: Vec<String>) {
        if !self.state.begin(self.name()) {
            return;
        }
        let registry = self.registry.clone();
        let settings = self.settings.clone();
        let progress = self.state.progress.clone();

        spawn_sweep(self.name(), progress.clone(), async move {
            let daemon = match ServiceDaemon::new() {
                Ok(daemon) => daemon,
                Err(e) => {
                    progress.log(format!("Error: starting mDNS daemon: {}", e));
                    progress.finish("mDNS unavailable");
                    return;
                }
            };
            let targets: HashSet<String> = targets.into_iter().collect();
            let types = settings.service_types.clone();
            let slice = settings.listen_window() / types.len().max(1) as u32;
            progress.set_total(types.len());

            for service_type in &types {
                progress.set_message(format!("Browsing {}...", service_type));
                browse_type(&daemon, &registry, &progress, &targets, service_type, slice).await;
                progress.advance();
            }

            if let Err(e) = daemon.shutdown() {
                tracing::debug!("mDNS daemon shutdown: {}", e);
            }
            progress.finish("mDNS discovery complete");
        });
    }

    fn progress(&self) -> &StepProgress {
        &self.state.progress
    }
}

async fn browse_type(
    daemon: &ServiceDaemon,
    registry: &HostRegistry,
    log: &StepProgress,
    targets: &HashSet<String>,
    service_type: &str,
    window: std::time::Duration,
) {
    let receiver = match daemon.browse(service_type) {
        Ok(receiver) => receiver,
        Err(e) => {
            log.log(format!("Error: browsing {}: {}", service_type, e));
            return;
        }
    };

    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, receiver.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                let announcement = Announcement::from_info(&info);
                for ip in record_announcement(registry, targets, &announcement) {
                    log.log(format!("{} announced {}", ip, announcement.fullname));
                }
            }
            Ok(Ok(_)) => continue,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    if let Err(e) = daemon.stop_browse(service_type) {
        tracing::debug!("stop_browse {}: {}", service_type, e);
    }
}
