//! ARP table ingestion.
//!
//! Reads the operating system's neighbour cache and records the MAC address
//! of every target it already knows about. Presence in the cache does not
//! mean the host is online, so hosts created here keep status `Unknown`.

use super::{ProbeStep, StepProgress, StepState, command_output, oui, spawn_sweep};
use crate::error::ProbeError;
use crate::inventory::{Host, HostRegistry};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

/// One `ip -> mac` row of the neighbour cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: String,
    /// Normalized `XX:XX:XX:XX:XX:XX`
    pub mac: String,
}

impl ArpEntry {
    pub fn new(ip: impl Into<String>, mac: &str) -> Option<Self> {
        let mac = oui::normalize_mac(mac)?;
        if oui::is_placeholder_mac(&mac) {
            return None;
        }
        Some(Self { ip: ip.into(), mac })
    }
}

/// Where the step reads the table from.
#[derive(Debug, Clone)]
pub enum ArpSource {
    /// The platform neighbour cache.
    System,
    /// A table the caller already holds.
    Static(Vec<ArpEntry>),
}

/// An IPv4 address followed, somewhere later on the line, by a MAC.
/// Covers Windows `arp -a`, BSD `arp -a -n`, Linux `/proc/net/arp`,
/// `arp -n` and `ip neigh`.
static ARP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?P<ip>\b\d{1,3}(?:\.\d{1,3}){3}\b)\)?\s.*?(?P<mac>\b[0-9A-Fa-f]{1,2}(?:[:-][0-9A-Fa-f]{1,2}){5}\b)",
    )
    .expect("valid ARP line pattern")
});

/// Parse neighbour-cache text into entries, skipping headers and incomplete rows.
pub fn parse_arp_output(output: &str) -> Vec<ArpEntry> {
    let mut seen = HashSet::new();
    output
        .lines()
        .filter_map(|line| {
            let caps = ARP_LINE.captures(line)?;
            let ip = &caps["ip"];
            if ip.parse::<std::net::Ipv4Addr>().is_err() {
                return None;
            }
            ArpEntry::new(ip, &caps["mac"])
        })
        .filter(|entry| seen.insert(entry.ip.clone()))
        .collect()
}

/// Read the platform neighbour cache.
pub async fn read_system_table() -> Result<Vec<ArpEntry>, ProbeError> {
    #[cfg(target_os = "linux")]
    {
        match tokio::fs::read_to_string("/proc/net/arp").await {
            Ok(text) => return Ok(parse_arp_output(&text)),
            Err(e) => tracing::debug!("/proc/net/arp unavailable: {}", e),
        }
        match command_output("ip", &["neigh", "show"]).await {
            Ok(text) => return Ok(parse_arp_output(&text)),
            Err(e) => tracing::debug!("ip neigh failed: {}", e),
        }
        command_output("arp", &["-n"])
            .await
            .map(|text| parse_arp_output(&text))
    }

    #[cfg(target_os = "macos")]
    {
        command_output("arp", &["-a", "-n"])
            .await
            .map(|text| parse_arp_output(&text))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        command_output("arp", &["-a"])
            .await
            .map(|text| parse_arp_output(&text))
    }
}

pub struct ArpTableStep {
    registry: Arc<HostRegistry>,
    source: ArpSource,
    state: StepState,
}

impl ArpTableStep {
    pub fn new(registry: Arc<HostRegistry>, source: ArpSource) -> Self {
        Self {
            registry,
            source,
            state: StepState::default(),
        }
    }
}

impl ProbeStep for ArpTableStep {
    fn name(&self) -> &'static str {
        "ARP Table"
    }

    fn description(&self) -> &'static str {
        "Reads the local neighbour cache and records MAC addresses and vendors of known targets."
    }

    fn start(&self, targets: Vec<String>) {
        if !self.state.begin(self.name()) {
            return;
        }
        let registry = self.registry.clone();
        let source = self.source.clone();
        let progress = self.state.progress.clone();

        spawn_sweep(self.name(), progress.clone(), async move {
            progress.set_message("Reading ARP table...");
            let entries = match source {
                ArpSource::Static(entries) => entries,
                ArpSource::System => match read_system_table().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        progress.log(e.describe("reading ARP table"));
                        progress.finish("ARP table unavailable");
                        return;
                    }
                },
            };
            ingest(&registry, &progress, &targets, entries);
        });
    }

    fn progress(&self) -> &StepProgress {
        &self.state.progress
    }
}

fn ingest(registry: &HostRegistry, progress: &StepProgress, targets: &[String], entries: Vec<ArpEntry>) {
    let wanted: HashSet<&str> = targets.iter().map(String::as_str).collect();
    progress.set_total(entries.len());
    progress.log(format!("ARP table holds {} entries", entries.len()));

    let mut added = 0;
    let mut updated = 0;
    for entry in entries {
        if wanted.contains(entry.ip.as_str()) {
            if registry.contains_address(&entry.ip) {
                if registry.set_mac_if_empty(&entry.ip, &entry.mac) {
                    updated += 1;
                    progress.log(format!("{} ({}): Updated MAC address.", entry.ip, entry.mac));
                }
            } else {
                let mut host = Host::with_address(entry.ip.clone());
                host.network_interfaces[0].mac = Some(entry.mac.clone());
                registry.upsert(host);
                added += 1;
                progress.log(format!("{} ({}): Added new host from ARP.", entry.ip, entry.mac));
            }
            if let Some(vendor) = oui::enrich_host(registry, &entry.ip, &entry.mac) {
                progress.log(format!("{}: vendor {}", entry.ip, vendor));
            }
        }
        progress.advance();
    }

    tracing::info!("ARP table: {} hosts added, {} MACs filled", added, updated);
    progress.finish(format!(
        "ARP table processed: {} added, {} updated",
        added, updated
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::HostStatus;
    use std::time::Duration;

    const LINUX_PROC: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         a4:91:b1:00:11:22     *        eth0
192.168.1.9      0x1         0x0         00:00:00:00:00:00     *        eth0
";

    const WINDOWS: &str = "\
Interface: 192.168.1.20 --- 0x7
  Internet Address      Physical Address      Type
  192.168.1.1           a4-91-b1-00-11-22     dynamic
  192.168.1.255         ff-ff-ff-ff-ff-ff     static
";

    const MACOS: &str = "\
? (192.168.1.1) at a4:91:b1:0:11:22 on en0 ifscope [ethernet]
? (192.168.1.7) at (incomplete) on en0 ifscope [ethernet]
";

    const IP_NEIGH: &str = "192.168.1.1 dev eth0 lladdr a4:91:b1:00:11:22 REACHABLE\n";

    fn expected() -> Vec<ArpEntry> {
        vec![ArpEntry {
            ip: "192.168.1.1".into(),
            mac: "A4:91:B1:00:11:22".into(),
        }]
    }

    #[test]
    fn test_parse_platform_formats() {
        assert_eq!(parse_arp_output(LINUX_PROC), expected());
        assert_eq!(parse_arp_output(WINDOWS), expected());
        assert_eq!(parse_arp_output(MACOS), expected());
        assert_eq!(parse_arp_output(IP_NEIGH), expected());
    }

    async fn run(step: &ArpTableStep, targets: Vec<String>) {
        step.start(targets);
        while !step.is_completed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_ingests_targets_as_unknown_hosts() {
        let registry = Arc::new(HostRegistry::new());
        let entries = vec![
            ArpEntry::new("192.168.1.5", "AA:BB:CC:DD:EE:FF").unwrap(),
            ArpEntry::new("192.168.1.99", "AA:BB:CC:DD:EE:00").unwrap(),
        ];
        let step = ArpTableStep::new(registry.clone(), ArpSource::Static(entries));
        run(&step, vec!["192.168.1.5".into()]).await;

        assert_eq!(registry.len(), 1);
        let host = registry.find_by_address("192.168.1.5").unwrap();
        assert_eq!(host.status, HostStatus::Unknown);
        assert_eq!(host.network_interfaces.len(), 1);
        assert_eq!(host.first_mac(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(step.progress_percentage(), 1.0);
        assert!(step.progress_log().contains("Added new host from ARP."));
    }

    #[tokio::test]
    async fn test_fills_mac_on_existing_host_only_once() {
        let registry = Arc::new(HostRegistry::new());
        registry.upsert(Host::with_address("192.168.1.5").with_status(HostStatus::Online));

        let entries = vec![ArpEntry::new("192.168.1.5", "aa:bb:cc:dd:ee:ff").unwrap()];
        let step = ArpTableStep::new(registry.clone(), ArpSource::Static(entries));
        run(&step, vec!["192.168.1.5".into()]).await;

        let host = registry.find_by_address("192.168.1.5").unwrap();
        assert_eq!(host.status, HostStatus::Online);
        assert_eq!(host.first_mac(), Some("AA:BB:CC:DD:EE:FF"));
        assert!(step.progress_log().contains("Updated MAC address."));
    }
}
