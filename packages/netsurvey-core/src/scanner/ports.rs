//! TCP connect scan with banner capture.

use super::wire::{collapse_whitespace, connect, read_capped};
use super::{ProbeStep, StepProgress, StepState, spawn_sweep, sweep};
use crate::config::PortScanSettings;
use crate::error::ProbeError;
use crate::inventory::{Host, HostRegistry, HostStatus, Service};
use std::sync::Arc;

/// Well-known TCP/UDP port names.
pub const WELL_KNOWN_PORTS: &[(u16, &str)] = &[
    (7, "echo"),
    (9, "discard"),
    (13, "daytime"),
    (17, "quote"),
    (19, "chargen"),
    (20, "ftp-data"),
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "dns"),
    (67, "dhcp-server"),
    (68, "dhcp-client"),
    (69, "tftp"),
    (79, "finger"),
    (80, "http"),
    (88, "kerberos"),
    (109, "pop2"),
    (110, "pop3"),
    (111, "rpcbind"),
    (113, "ident"),
    (119, "nntp"),
    (123, "ntp"),
    (135, "msrpc"),
    (137, "netbios-ns"),
    (138, "netbios-dgm"),
    (139, "netbios-ssn"),
    (143, "imap"),
    (161, "snmp"),
    (162, "snmp-trap"),
    (177, "xdmcp"),
    (389, "ldap"),
    (443, "https"),
    (445, "microsoft-ds"),
    (500, "isakmp"),
    (514, "syslog"),
    (546, "dhcpv6-client"),
    (547, "dhcpv6-server"),
    (587, "submission"),
    (636, "ldaps"),
    (993, "imaps"),
    (995, "pop3s"),
    (1080, "socks"),
    (1433, "ms-sql-s"),
    (1434, "ms-sql-m"),
    (1521, "oracle"),
    (1720, "h.323-q.931"),
    (1723, "pptp"),
    (3306, "mysql"),
    (3389, "rdp"),
    (5060, "sip"),
    (5061, "sips"),
    (5432, "postgresql"),
    (5900, "vnc"),
    (8080, "http-alt"),
    (8443, "https-alt"),
    (27017, "mongodb"),
    (27018, "mongodb-shard"),
    (27019, "mongodb-config"),
];

pub fn well_known_service(port: u16) -> Option<&'static str> {
    WELL_KNOWN_PORTS
        .binary_search_by_key(&port, |(p, _)| *p)
        .ok()
        .map(|i| WELL_KNOWN_PORTS[i].1)
}

/// Every port in the well-known table, ascending.
pub fn default_ports() -> Vec<u16> {
    WELL_KNOWN_PORTS.iter().map(|(p, _)| *p).collect()
}

/// Connect to one port. `Ok(None)` means closed or filtered.
pub async fn probe_port(
    ip: &str,
    port: u16,
    settings: &PortScanSettings,
) -> Result<Option<Service>, ProbeError> {
    let mut stream = match connect(ip, port, settings.connect_timeout()).await {
        Ok(stream) => stream,
        Err(ProbeError::ConnectionRefused) | Err(ProbeError::Timeout { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };

    let limit = settings.banner_timeout();
    let description = match read_capped(&mut stream, settings.max_banner_bytes, limit, |b| {
        !b.is_empty()
    })
    .await
    {
        Ok(bytes) => collapse_whitespace(&String::from_utf8_lossy(&bytes)),
        Err(e) if e.is_timeout() => "Error: Timeout reading banner.".to_string(),
        Err(e) => e.describe("reading banner"),
    };

    Ok(Some(open_service(port, description)))
}

/// Service record for an open TCP port, named from the well-known table.
pub fn open_service(port: u16, description: impl Into<String>) -> Service {
    let name = well_known_service(port)
        .map(str::to_string)
        .unwrap_or_else(|| Service::generic_name(port));
    Service::tcp(port, name, description)
}

/// An open port proves the host is up.
fn record_open_port(registry: &HostRegistry, ip: &str, service: Service) {
    let host = Host::with_address(ip)
        .with_status(HostStatus::Online)
        .with_service(service);
    registry.upsert(host);
}

pub struct PortScanStep {
    registry: Arc<HostRegistry>,
    settings: PortScanSettings,
    state: StepState,
}

impl PortScanStep {
    pub fn new(registry: Arc<HostRegistry>, settings: PortScanSettings) -> Self {
        Self {
            registry,
            settings,
            state: StepState::default(),
        }
    }
}

impl ProbeStep for PortScanStep {
    fn name(&self) -> &'static str {
        "Port Scan Sweep"
    }

    fn description(&self) -> &'static str {
        "Connects to the configured TCP ports of every target and captures service banners."
    }

    fn start(&self, targets: Vec<String>) {
        if !self.state.begin(self.name()) {
            return;
        }
        let registry = self.registry.clone();
        let settings = self.settings.clone();
        let progress = self.state.progress.clone();

        spawn_sweep(self.name(), progress.clone(), async move {
            if settings.ports.is_empty() {
                progress.log("Error: No ports specified for scanning.");
                progress.finish("No ports specified");
                return;
            }
            progress.set_message(format!(
                "Scanning {} ports on {} addresses...",
                settings.ports.len(),
                targets.len()
            ));

            let registry = &*registry;
            let settings = &settings;
            let log = &*progress;
            sweep(&progress, targets, settings.concurrency, move |ip: String| async move {
                scan_target(registry, settings, log, &ip).await;
            })
            .await;

            progress.finish("Port scan complete");
        });
    }

    fn progress(&self) -> &StepProgress {
        &self.state.progress
    }
}

/// Scan every configured port of one target, sequentially.
async fn scan_target(
    registry: &HostRegistry,
    settings: &PortScanSettings,
    log: &StepProgress,
    ip: &str,
) {
    let mut open = 0;
    for &port in &settings.ports {
        match probe_port(ip, port, settings).await {
            Ok(Some(service)) => {
                open += 1;
                log.log(format!("  {}:{} is OPEN {}", ip, port, service.description));
                record_open_port(registry, ip, service);
            }
            Ok(None) => log.log(format!("  {}:{} is CLOSED or TIMED OUT", ip, port)),
            Err(e) => log.log(format!("  {}:{} {}", ip, port, e.describe("probe failed"))),
        }
    }
    if open == 0 {
        log.log(format!("{}: No open services found.", ip));
    } else {
        tracing::info!("{}: {} open ports", ip, open);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Protocol;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn settings(ports: Vec<u16>) -> PortScanSettings {
        PortScanSettings {
            ports,
            connect_timeout_ms: 500,
            banner_timeout_ms: 300,
            ..PortScanSettings::default()
        }
    }

    async fn wait(step: &PortScanStep) {
        while !step.is_completed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_well_known_table() {
        assert_eq!(well_known_service(80), Some("http"));
        assert_eq!(well_known_service(445), Some("microsoft-ds"));
        assert_eq!(well_known_service(27019), Some("mongodb-config"));
        assert_eq!(well_known_service(81), None);
        assert!(WELL_KNOWN_PORTS.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(default_ports().len(), WELL_KNOWN_PORTS.len());
    }

    #[tokio::test]
    async fn test_open_port_records_banner_and_online_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"SSH-2.0-OpenSSH\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let registry = Arc::new(HostRegistry::new());
        let step = PortScanStep::new(registry.clone(), settings(vec![port]));
        step.start(vec!["127.0.0.1".into()]);
        wait(&step).await;

        let host = registry.find_by_address("127.0.0.1").unwrap();
        assert_eq!(host.status, HostStatus::Online);
        let service = host.services().next().unwrap();
        assert_eq!(service.port, port);
        assert_eq!(service.protocol, Protocol::Tcp);
        assert_eq!(service.description, "SSH-2.0-OpenSSH");
        assert_eq!(
            service.service_name,
            well_known_service(port)
                .map(str::to_string)
                .unwrap_or_else(|| Service::generic_name(port))
        );
    }

    #[test]
    fn test_open_port_80_is_named_http_and_keeps_banner() {
        let registry = HostRegistry::new();
        record_open_port(&registry, "192.168.1.5", open_service(80, "SSH-2.0-OpenSSH"));

        let host = registry.find_by_address("192.168.1.5").unwrap();
        assert_eq!(host.status, HostStatus::Online);
        let services: Vec<_> = host.services().collect();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0], &Service::tcp(80, "http", "SSH-2.0-OpenSSH"));

        assert_eq!(open_service(81, "").service_name, "Port 81");
    }

    #[tokio::test]
    async fn test_well_known_port_named_through_probe() {
        // 8080 needs no privileges but may already be taken on the test machine.
        let Ok(listener) = TcpListener::bind("127.0.0.1:8080").await else {
            return;
        };
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\nServer: test\r\n\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let service = probe_port("127.0.0.1", 8080, &settings(vec![8080]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(service.service_name, "http-alt");
        assert!(service.description.starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn test_silent_service_gets_timeout_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let service = probe_port("127.0.0.1", port, &settings(vec![port]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(service.description, "Error: Timeout reading banner.");
        assert!(service.needs_probe());
    }

    #[tokio::test]
    async fn test_closed_port_creates_no_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let registry = Arc::new(HostRegistry::new());
        let step = PortScanStep::new(registry.clone(), settings(vec![port]));
        step.start(vec!["127.0.0.1".into()]);
        wait(&step).await;

        assert!(registry.is_empty());
        assert!(step.progress_log().contains("No open services found."));
    }

    #[tokio::test]
    async fn test_empty_port_list_completes_immediately() {
        let registry = Arc::new(HostRegistry::new());
        let step = PortScanStep::new(registry, settings(Vec::new()));
        step.start(vec!["127.0.0.1".into()]);
        wait(&step).await;

        assert_eq!(step.progress_percentage(), 1.0);
        assert!(step.progress_log().contains("Error: No ports specified for scanning."));
    }
}
