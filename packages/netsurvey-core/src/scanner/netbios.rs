//! NetBIOS name-table and session probes.
//!
//! UDP/137 gets a Node Status (NBSTAT) query whose answer lists the names a
//! Windows or Samba host has registered, which yields its hostname and
//! workgroup. TCP/139 gets an SMB negotiate to confirm a file-sharing stack.

use super::wire::{exchange, hex_preview, smb_negotiate_request, smb_signature};
use super::{
    ProbeStep, StepProgress, StepState, TargetScope, label_service, mark_windows, spawn_sweep, sweep,
};
use crate::config::WindowsProbeSettings;
use crate::error::ProbeError;
use crate::inventory::{Host, HostField, HostRegistry, Protocol, Service};
use regex::Regex;
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::net::UdpSocket;

pub const NAME_SERVICE_PORT: u16 = 137;
pub const SESSION_SERVICE_PORT: u16 = 139;

const WORKSTATION: u8 = 0x00;
const DOMAIN_SUFFIXES: &[u8] = &[0x1C, 0x1B, 0x1D, 0x1E];

/// One entry of a node's name table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetBiosName {
    pub name: String,
    pub suffix: u8,
    pub group: bool,
    pub deregistered: bool,
}

impl NetBiosName {
    pub fn kind(&self) -> String {
        match self.suffix {
            0x00 => "Workstation Service".to_string(),
            0x03 => "Messenger Service".to_string(),
            0x06 => "RAS Server Service".to_string(),
            0x1B => "Domain Master Browser".to_string(),
            0x1C => "Domain Controller".to_string(),
            0x1D => "Master Browser".to_string(),
            0x1E => "Browser Service Elections".to_string(),
            0x20 => "File Server Service".to_string(),
            0x21 => "RAS Client Service".to_string(),
            0xBE => "Network Monitor Agent".to_string(),
            0xBF => "Network Monitor AFA".to_string(),
            other => format!("Unknown 0x{:02X}", other),
        }
    }

    fn flag_label(&self) -> &'static str {
        if self.deregistered {
            "Deregistered"
        } else if self.group {
            "Group"
        } else {
            "Unique"
        }
    }
}

impl fmt::Display for NetBiosName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Name: '{}' <{:02X}> ({}, {})",
            self.name,
            self.suffix,
            self.kind(),
            self.flag_label()
        )
    }
}

/// NBSTAT query for the wildcard name `*`.
pub fn node_status_request(transaction_id: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(50);
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // flags: query
    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    packet.extend_from_slice(&[0x00; 6]); // AN/NS/AR counts
    // First-level encoding of "*" padded with NULs: 'C' 'K' then 30 x 'A'.
    packet.push(0x20);
    packet.extend_from_slice(b"CK");
    packet.extend_from_slice(&[b'A'; 30]);
    packet.push(0x00);
    packet.extend_from_slice(&[0x00, 0x21]); // NBSTAT
    packet.extend_from_slice(&[0x00, 0x01]); // IN
    packet
}

/// Position just past an encoded name (labels or a compression pointer).
fn skip_name(buf: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *buf.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(pos + 2);
        }
        pos += 1 + len;
    }
}

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]))
}

/// Parse a Node Status response into its name table.
pub fn parse_node_status(buf: &[u8]) -> Result<Vec<NetBiosName>, ProbeError> {
    let malformed = |what: &str| ProbeError::Protocol(format!("NBSTAT response {}", what));

    if buf.len() < 12 {
        return Err(malformed("shorter than a header"));
    }
    if buf[2] & 0x80 == 0 {
        return Err(malformed("is not a response"));
    }
    let questions = read_u16(buf, 4).unwrap_or(0);
    let answers = read_u16(buf, 6).unwrap_or(0);
    if answers == 0 {
        return Err(malformed("has no answer"));
    }

    let mut pos = 12;
    for _ in 0..questions {
        pos = skip_name(buf, pos).ok_or_else(|| malformed("truncated in question"))? + 4;
    }
    // Answer: name, type(2), class(2), ttl(4), rdlength(2)
    pos = skip_name(buf, pos).ok_or_else(|| malformed("truncated in answer name"))? + 10;

    let count = *buf.get(pos).ok_or_else(|| malformed("truncated before name count"))? as usize;
    pos += 1;

    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        let record = buf
            .get(pos..pos + 18)
            .ok_or_else(|| malformed("truncated in name table"))?;
        let name = String::from_utf8_lossy(&record[..15])
            .trim_end_matches([' ', '\0'])
            .to_string();
        names.push(NetBiosName {
            name,
            suffix: record[15],
            group: record[16] & 0x80 != 0,
            deregistered: record[16] & 0x10 != 0,
        });
        pos += 18;
    }
    Ok(names)
}

/// Unique workstation name of the node.
pub fn hostname_of(names: &[NetBiosName]) -> Option<&str> {
    names
        .iter()
        .find(|n| n.suffix == WORKSTATION && !n.group && !n.deregistered && !n.name.is_empty())
        .map(|n| n.name.as_str())
}

/// Workgroup or domain the node belongs to.
pub fn domain_of(names: &[NetBiosName]) -> Option<&str> {
    names
        .iter()
        .find(|n| n.suffix == WORKSTATION && n.group)
        .or_else(|| {
            DOMAIN_SUFFIXES
                .iter()
                .find_map(|s| names.iter().find(|n| n.suffix == *s))
        })
        .map(|n| n.name.as_str())
        .filter(|n| !n.is_empty() && !n.starts_with("__"))
}

/// Render a name table as a service description.
pub fn describe_names(names: &[NetBiosName]) -> String {
    let mut parts = vec![format!("NetBIOS Name Table ({} names):", names.len())];
    parts.extend(names.iter().map(|n| n.to_string()));
    parts.join(" | ")
}

static NAME_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Name: '([^']*)' <([0-9A-Fa-f]{2})> \([^,]+, (\w+)\)")
        .expect("valid NetBIOS name entry pattern")
});

/// Recover a name table from a description written by [`describe_names`].
pub fn names_from_description(description: &str) -> Vec<NetBiosName> {
    NAME_ENTRY
        .captures_iter(description)
        .filter_map(|c| {
            let suffix = u8::from_str_radix(&c[2], 16).ok()?;
            Some(NetBiosName {
                name: c[1].to_string(),
                suffix,
                group: &c[3] == "Group",
                deregistered: &c[3] == "Deregistered",
            })
        })
        .collect()
}

/// Send an NBSTAT query to `ip:port` over UDP and parse the answer.
pub async fn query_node_status(
    ip: &str,
    port: u16,
    limit: Duration,
) -> Result<Vec<NetBiosName>, ProbeError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let request = node_status_request(rand::random());
    socket.send_to(&request, (ip, port)).await?;

    let mut buf = vec![0u8; 1024];
    let len = match tokio::time::timeout(limit, socket.recv(&mut buf)).await {
        Err(_) => return Err(ProbeError::timeout("waiting for NBSTAT response", limit)),
        Ok(result) => result?,
    };
    parse_node_status(&buf[..len])
}

/// Outcome of the SMB negotiate on the session port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProbe {
    pub smb_detected: bool,
    pub description: String,
}

/// Send an SMB negotiate to `ip:port` and classify the reply.
pub async fn probe_session(
    ip: &str,
    port: u16,
    settings: &WindowsProbeSettings,
) -> Result<SessionProbe, ProbeError> {
    let reply = exchange(
        ip,
        port,
        &smb_negotiate_request(),
        settings.max_response_bytes,
        settings.timeout(),
    )
    .await?;
    let smb_detected = smb_signature(&reply).is_some();
    let verdict = if smb_detected {
        "SMB Detected"
    } else {
        "no SMB signature"
    };
    Ok(SessionProbe {
        smb_detected,
        description: format!(
            "NetBIOS Session Service (Port {}) - {}. Response: {}",
            port,
            verdict,
            hex_preview(&reply, 64)
        ),
    })
}

/// Write hostname and domain from a name table (first-writer-wins) and flag Windows.
pub fn apply_names(registry: &HostRegistry, ip: &str, names: &[NetBiosName]) {
    if let Some(hostname) = hostname_of(names) {
        registry.update_field(ip, HostField::Hostname, hostname);
    }
    if let Some(domain) = domain_of(names) {
        registry.update_field(ip, HostField::Domain, domain);
    }
    if hostname_of(names).is_some() {
        mark_windows(registry, ip);
    }
}

pub struct NetBiosStep {
    registry: Arc<HostRegistry>,
    settings: WindowsProbeSettings,
    name_service_port: u16,
    state: StepState,
}

impl NetBiosStep {
    pub fn new(registry: Arc<HostRegistry>, settings: WindowsProbeSettings) -> Self {
        Self {
            registry,
            settings,
            name_service_port: NAME_SERVICE_PORT,
            state: StepState::default(),
        }
    }

    /// Send NBSTAT queries to another UDP port, for a local responder.
    #[cfg(test)]
    fn with_name_service_port(mut self, port: u16) -> Self {
        self.name_service_port = port;
        self
    }
}

impl ProbeStep for NetBiosStep {
    fn name(&self) -> &'static str {
        "NetBIOS Info"
    }

    fn description(&self) -> &'static str {
        "Queries NetBIOS name tables and SMB session support of hosts exposing ports 137/139."
    }

    fn target_scope(&self) -> TargetScope {
        TargetScope::Registry
    }

    fn start(&self, _targets: Vec<String>) {
        if !self.state.begin(self.name()) {
            return;
        }
        let registry = self.registry.clone();
        let settings = self.settings.clone();
        let nbns_port = self.name_service_port;
        let progress = self.state.progress.clone();

        spawn_sweep(self.name(), progress.clone(), async move {
            let hosts = registry.hosts_with_ports(&[NAME_SERVICE_PORT, SESSION_SERVICE_PORT]);
            progress.set_message(format!("Querying NetBIOS on {} hosts...", hosts.len()));

            let registry = &*registry;
            let settings = &settings;
            let log = &*progress;
            sweep(&progress, hosts, settings.concurrency, move |host: Host| async move {
                probe_host(registry, settings, nbns_port, log, host).await;
            })
            .await;

            progress.finish("NetBIOS probing complete");
        });
    }

    fn progress(&self) -> &StepProgress {
        &self.state.progress
    }
}

async fn probe_host(
    registry: &HostRegistry,
    settings: &WindowsProbeSettings,
    nbns_port: u16,
    log: &StepProgress,
    host: Host,
) {
    for iface in &host.network_interfaces {
        let Some(ip) = iface.ip_addresses.first() else {
            continue;
        };
        let mut services: Vec<&Service> = iface
            .services
            .iter()
            .filter(|s| s.port == NAME_SERVICE_PORT || s.port == SESSION_SERVICE_PORT)
            .collect();
        services.sort_by_key(|s| s.port);

        let has_name_service = services.iter().any(|s| s.port == NAME_SERVICE_PORT);
        if !has_name_service {
            // The TCP scan rarely sees 137; ask the UDP name service directly.
            if let Ok(names) = query_node_status(ip, nbns_port, settings.timeout()).await {
                let description = describe_names(&names);
                log.log(format!("{}: {}", ip, description));
                let service = Service::new(
                    NAME_SERVICE_PORT,
                    Protocol::Udp,
                    "NetBIOS Name Service (NBNS) - Active",
                    description,
                );
                let mut found = Host::with_address(ip.clone()).with_service(service);
                found.status = host.status;
                registry.upsert(found);
                apply_names(registry, ip, &names);
            }
        }

        for service in services {
            if service.port == NAME_SERVICE_PORT {
                name_service(registry, settings, nbns_port, log, ip, service).await;
            } else {
                session_service(registry, settings, log, ip, service).await;
            }
        }
    }
}

async fn name_service(
    registry: &HostRegistry,
    settings: &WindowsProbeSettings,
    nbns_port: u16,
    log: &StepProgress,
    ip: &str,
    service: &Service,
) {
    let names = if service.needs_probe() {
        let (names, description) = match query_node_status(ip, nbns_port, settings.timeout()).await {
            Ok(names) => {
                let description = describe_names(&names);
                (names, description)
            }
            Err(e) => (Vec::new(), e.describe("NBSTAT query")),
        };
        registry.update_service(ip, service.port, service.protocol, |s| {
            s.description = description.clone()
        });
        log.log(format!("{}: {}", ip, description));
        names
    } else {
        names_from_description(&service.description)
    };

    let state = if names.is_empty() { "No Table" } else { "Active" };
    label_service(
        registry,
        ip,
        service.port,
        service.protocol,
        &format!("NetBIOS Name Service (NBNS) - {}", state),
    );
    apply_names(registry, ip, &names);
}

async fn session_service(
    registry: &HostRegistry,
    settings: &WindowsProbeSettings,
    log: &StepProgress,
    ip: &str,
    service: &Service,
) {
    let smb_detected = if service.needs_probe() {
        let (detected, description) = match probe_session(ip, service.port, settings).await {
            Ok(probe) => (probe.smb_detected, probe.description),
            Err(e) => (false, e.describe("SMB negotiate")),
        };
        registry.update_service(ip, service.port, service.protocol, |s| {
            s.description = description.clone()
        });
        log.log(format!("{}: {}", ip, description));
        detected
    } else {
        service.description.contains("SMB Detected")
    };

    let state = if smb_detected { "Active" } else { "No SMB" };
    label_service(
        registry,
        ip,
        service.port,
        service.protocol,
        &format!("NetBIOS Session Service (NBT/SMB) - {}", state),
    );
    if smb_detected {
        mark_windows(registry, ip);
    }
}
