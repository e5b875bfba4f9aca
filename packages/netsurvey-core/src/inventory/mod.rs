//! Inventory data model.
//!
//! A [`Host`] is one physical or virtual device. It owns its network
//! interfaces, and each interface owns the services observed on it. Identity
//! is transitive through interface IP addresses: two records holding the same
//! IP describe the same device and are merged by [`Host::absorb`].
//!
//! Field names serialize exactly as the exported inventory expects
//! (`Hostname`, `NetworkInterfaces`, `MAC`, `Ip_Address`, ...).

pub mod registry;

pub use registry::{HostEvent, HostRegistry, UpsertOutcome};

use crate::error::is_error_text;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder used by free-text classification fields until a probe fills them.
pub const UNKNOWN: &str = "Unknown";

/// Reachability of a host as last observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl HostStatus {
    /// Combine an existing status with a newly observed one.
    ///
    /// `Online` always wins, `Offline` only replaces `Unknown`, and `Unknown`
    /// never replaces anything.
    pub fn merge(self, observed: HostStatus) -> HostStatus {
        match (self, observed) {
            (_, HostStatus::Online) => HostStatus::Online,
            (HostStatus::Unknown, HostStatus::Offline) => HostStatus::Offline,
            (current, _) => current,
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Unknown => write!(f, "Unknown"),
            HostStatus::Online => write!(f, "Online"),
            HostStatus::Offline => write!(f, "Offline"),
        }
    }
}

/// Transport protocol of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A listening service on one interface. Unique per interface by `(Port, Protocol)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Service {
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub description: String,
}

impl Service {
    pub fn new(
        port: u16,
        protocol: Protocol,
        service_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            port,
            protocol,
            service_name: service_name.into(),
            description: description.into(),
        }
    }

    pub fn tcp(port: u16, service_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(port, Protocol::Tcp, service_name, description)
    }

    /// Name used when nothing better is known about a port.
    pub fn generic_name(port: u16) -> String {
        format!("Port {}", port)
    }

    pub fn key(&self) -> (u16, Protocol) {
        (self.port, self.protocol)
    }

    /// True when the name carries no more than the port number.
    pub fn has_generic_name(&self) -> bool {
        let name = self.service_name.trim();
        name.is_empty() || name == Self::generic_name(self.port)
    }

    /// True when the description is real data rather than blank or a diagnostic.
    pub fn has_informative_description(&self) -> bool {
        !self.description.trim().is_empty() && !is_error_text(&self.description)
    }

    /// True when a follow-up probe should fetch a fresh description.
    pub fn needs_probe(&self) -> bool {
        !self.has_informative_description()
    }

    fn description_rank(&self) -> u8 {
        if self.description.trim().is_empty() {
            0
        } else if is_error_text(&self.description) {
            1
        } else {
            2
        }
    }

    /// Merge another observation of the same `(Port, Protocol)`.
    ///
    /// The existing description survives unless the incoming one is strictly
    /// more informative; the same holds for the name.
    pub fn absorb(&mut self, other: Service) {
        let other_named = !other.has_generic_name();
        if other.description_rank() > self.description_rank() {
            self.description = other.description;
        }
        if self.has_generic_name() && other_named {
            self.service_name = other.service_name;
        }
    }
}

/// One network interface of a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "MAC", default)]
    pub mac: Option<String>,
    #[serde(rename = "Ip_Address", default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub services: Vec<Service>,
}

impl NetworkInterface {
    pub fn with_address(ip: impl Into<String>) -> Self {
        Self {
            ip_addresses: vec![ip.into()],
            ..Default::default()
        }
    }

    pub fn holds_address(&self, ip: &str) -> bool {
        self.ip_addresses.iter().any(|a| a == ip)
    }

    /// Add an address, keeping insertion order and suppressing duplicates.
    pub fn add_address(&mut self, ip: impl Into<String>) {
        let ip = ip.into();
        if !ip.is_empty() && !self.holds_address(&ip) {
            self.ip_addresses.push(ip);
        }
    }

    /// Insert a service or merge it into the one already holding its key.
    pub fn merge_service(&mut self, service: Service) {
        match self.services.iter_mut().find(|s| s.key() == service.key()) {
            Some(existing) => existing.absorb(service),
            None => self.services.push(service),
        }
    }

    pub fn service_mut(&mut self, port: u16, protocol: Protocol) -> Option<&mut Service> {
        self.services
            .iter_mut()
            .find(|s| s.port == port && s.protocol == protocol)
    }

    fn has_mac(&self) -> bool {
        self.mac.as_deref().is_some_and(|m| !m.trim().is_empty())
    }

    /// Same interface: shares an address or carries the same hardware address.
    pub fn matches(&self, other: &NetworkInterface) -> bool {
        if other.ip_addresses.iter().any(|ip| self.holds_address(ip)) {
            return true;
        }
        match (&self.mac, &other.mac) {
            (Some(a), Some(b)) if self.has_mac() => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ip_addresses.is_empty() && !self.has_mac() && self.services.is_empty()
    }

    pub fn absorb(&mut self, mut other: NetworkInterface) {
        for ip in std::mem::take(&mut other.ip_addresses) {
            self.add_address(ip);
        }
        if !self.has_mac() && other.has_mac() {
            self.mac = other.mac;
        }
        if blank(&self.name) {
            if let Some(name) = other.name.filter(|n| !n.trim().is_empty()) {
                self.name = Some(name);
            }
        }
        for service in other.services {
            self.merge_service(service);
        }
    }
}

/// Scalar host attributes written with first-writer-wins semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostField {
    Hostname,
    Domain,
    DeviceType,
    DeviceSubType,
    Manufacturer,
    Model,
    OperatingSystem,
    OperatingSystemVersion,
}

impl fmt::Display for HostField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostField::Hostname => "Hostname",
            HostField::Domain => "Domain",
            HostField::DeviceType => "DeviceType",
            HostField::DeviceSubType => "DeviceSubType",
            HostField::Manufacturer => "Manufacturer",
            HostField::Model => "Model",
            HostField::OperatingSystem => "OperatingSystem",
            HostField::OperatingSystemVersion => "OperatingSystemVersion",
        };
        f.write_str(name)
    }
}

/// One discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Host {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub status: HostStatus,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default = "unknown")]
    pub device_type: String,
    #[serde(default = "unknown")]
    pub device_sub_type: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub operating_system: Option<String>,
    #[serde(default)]
    pub operating_system_version: Option<String>,
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if blank(slot) {
        if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
            *slot = Some(v);
        }
    }
}

fn is_unknown(value: &str) -> bool {
    value.trim().is_empty() || value == UNKNOWN
}

impl Default for Host {
    fn default() -> Self {
        Self {
            hostname: None,
            domain: None,
            status: HostStatus::Unknown,
            network_interfaces: Vec::new(),
            device_type: unknown(),
            device_sub_type: unknown(),
            manufacturer: None,
            model: None,
            operating_system: None,
            operating_system_version: None,
        }
    }
}

impl Host {
    /// A host with a single interface holding `ip`.
    pub fn with_address(ip: impl Into<String>) -> Self {
        Self {
            network_interfaces: vec![NetworkInterface::with_address(ip)],
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: HostStatus) -> Self {
        self.status = status;
        self
    }

    /// Add a service to the primary interface, creating it if needed.
    pub fn with_service(mut self, service: Service) -> Self {
        if self.network_interfaces.is_empty() {
            self.network_interfaces.push(NetworkInterface::default());
        }
        self.network_interfaces[0].merge_service(service);
        self
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.network_interfaces
            .iter()
            .flat_map(|i| i.ip_addresses.iter().map(String::as_str))
    }

    /// First IP of the first interface; the key callers use to address a host.
    pub fn primary_address(&self) -> Option<&str> {
        self.addresses().next()
    }

    pub fn holds_address(&self, ip: &str) -> bool {
        self.network_interfaces.iter().any(|i| i.holds_address(ip))
    }

    pub fn shares_address_with(&self, other: &Host) -> bool {
        other.addresses().any(|ip| self.holds_address(ip))
    }

    pub fn interface_for_mut(&mut self, ip: &str) -> Option<&mut NetworkInterface> {
        self.network_interfaces
            .iter_mut()
            .find(|i| i.holds_address(ip))
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.network_interfaces.iter().flat_map(|i| i.services.iter())
    }

    pub fn has_service_on(&self, ports: &[u16]) -> bool {
        self.services().any(|s| ports.contains(&s.port))
    }

    pub fn first_mac(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .filter_map(|i| i.mac.as_deref())
            .find(|m| !m.is_empty())
    }

    /// Current value of a scalar field, `None` while it is still empty.
    pub fn field(&self, field: HostField) -> Option<&str> {
        let value = match field {
            HostField::Hostname => self.hostname.as_deref(),
            HostField::Domain => self.domain.as_deref(),
            HostField::DeviceType => Some(self.device_type.as_str()).filter(|v| !is_unknown(v)),
            HostField::DeviceSubType => {
                Some(self.device_sub_type.as_str()).filter(|v| !is_unknown(v))
            }
            HostField::Manufacturer => self.manufacturer.as_deref(),
            HostField::Model => self.model.as_deref(),
            HostField::OperatingSystem => self.operating_system.as_deref(),
            HostField::OperatingSystemVersion => self.operating_system_version.as_deref(),
        };
        value.filter(|v| !v.trim().is_empty())
    }

    /// Unconditionally assign a scalar field.
    pub fn set_field(&mut self, field: HostField, value: impl Into<String>) {
        let value = value.into();
        match field {
            HostField::Hostname => self.hostname = Some(value),
            HostField::Domain => self.domain = Some(value),
            HostField::DeviceType => self.device_type = value,
            HostField::DeviceSubType => self.device_sub_type = value,
            HostField::Manufacturer => self.manufacturer = Some(value),
            HostField::Model => self.model = Some(value),
            HostField::OperatingSystem => self.operating_system = Some(value),
            HostField::OperatingSystemVersion => self.operating_system_version = Some(value),
        }
    }

    /// Assign a scalar field only while it is empty. Returns whether it was written.
    pub fn fill_field(&mut self, field: HostField, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() || self.field(field).is_some() {
            return false;
        }
        self.set_field(field, value);
        true
    }

    fn absorb_interface(&mut self, incoming: NetworkInterface) {
        if incoming.is_empty() {
            return;
        }
        let matching: Vec<usize> = self
            .network_interfaces
            .iter()
            .enumerate()
            .filter(|(_, existing)| existing.matches(&incoming))
            .map(|(i, _)| i)
            .collect();

        let Some((&first, rest)) = matching.split_first() else {
            self.network_interfaces.push(incoming);
            return;
        };
        // An incoming interface spanning several known ones joins them, so
        // no address is listed twice on one host.
        for &index in rest.iter().rev() {
            let duplicate = self.network_interfaces.remove(index);
            self.network_interfaces[first].absorb(duplicate);
        }
        self.network_interfaces[first].absorb(incoming);
    }

    /// Merge another record of the same device into this one.
    ///
    /// Interfaces are matched by shared IP or MAC and otherwise appended,
    /// services are deduplicated, status follows [`HostStatus::merge`] and
    /// scalar fields keep the first non-empty value.
    pub fn absorb(&mut self, other: Host) {
        for iface in other.network_interfaces {
            self.absorb_interface(iface);
        }
        self.status = self.status.merge(other.status);
        fill(&mut self.hostname, other.hostname);
        fill(&mut self.domain, other.domain);
        fill(&mut self.manufacturer, other.manufacturer);
        fill(&mut self.model, other.model);
        fill(&mut self.operating_system, other.operating_system);
        fill(&mut self.operating_system_version, other.operating_system_version);
        if is_unknown(&self.device_type) && !is_unknown(&other.device_type) {
            self.device_type = other.device_type;
        }
        if is_unknown(&self.device_sub_type) && !is_unknown(&other.device_sub_type) {
            self.device_sub_type = other.device_sub_type;
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.hostname.as_deref().filter(|h| !h.is_empty());
        match (name, self.primary_address()) {
            (Some(name), Some(ip)) => write!(f, "{} ({})", name, ip),
            (Some(name), None) => write!(f, "{}", name),
            (None, Some(ip)) => write!(f, "{}", ip),
            (None, None) => write!(f, "{}", self.first_mac().unwrap_or("<unaddressed host>")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_field_names() {
        let host = Host::with_address("10.0.0.5")
            .with_status(HostStatus::Online)
            .with_service(Service::tcp(22, "ssh", "SSH-2.0-OpenSSH_9.6"));
        let json = serde_json::to_value(&host).unwrap();

        assert_eq!(json["Status"], "Online");
        assert_eq!(json["DeviceType"], "Unknown");
        assert!(json["Hostname"].is_null());
        let iface = &json["NetworkInterfaces"][0];
        assert_eq!(iface["Ip_Address"][0], "10.0.0.5");
        assert!(iface["MAC"].is_null());
        assert_eq!(iface["Services"][0]["Port"], 22);
        assert_eq!(iface["Services"][0]["Protocol"], "tcp");
        assert_eq!(iface["Services"][0]["ServiceName"], "ssh");
    }

    #[test]
    fn test_status_merge() {
        assert_eq!(HostStatus::Unknown.merge(HostStatus::Online), HostStatus::Online);
        assert_eq!(HostStatus::Offline.merge(HostStatus::Online), HostStatus::Online);
        assert_eq!(HostStatus::Unknown.merge(HostStatus::Offline), HostStatus::Offline);
        assert_eq!(HostStatus::Online.merge(HostStatus::Offline), HostStatus::Online);
        assert_eq!(HostStatus::Online.merge(HostStatus::Unknown), HostStatus::Online);
    }

    #[test]
    fn test_service_absorb_keeps_informative_description() {
        let mut svc = Service::tcp(80, "http", "HTTP/1.1 200 OK | Server: nginx");
        svc.absorb(Service::tcp(80, "Port 80", "Error: timeout"));
        assert_eq!(svc.description, "HTTP/1.1 200 OK | Server: nginx");
        assert_eq!(svc.service_name, "http");

        let mut blank = Service::tcp(80, "Port 80", "");
        blank.absorb(Service::tcp(80, "http", "Error: timeout"));
        assert_eq!(blank.description, "Error: timeout");
        assert_eq!(blank.service_name, "http");
        blank.absorb(Service::tcp(80, "http", "HTTP/1.1 404 Not Found"));
        assert_eq!(blank.description, "HTTP/1.1 404 Not Found");
    }

    #[test]
    fn test_interface_services_unique_by_port_and_protocol() {
        let mut iface = NetworkInterface::with_address("10.0.0.1");
        iface.merge_service(Service::tcp(53, "dns", ""));
        iface.merge_service(Service::new(53, Protocol::Udp, "dns", ""));
        iface.merge_service(Service::tcp(53, "dns", "banner"));
        assert_eq!(iface.services.len(), 2);
        assert_eq!(iface.services[0].description, "banner");
    }

    #[test]
    fn test_absorb_merges_matching_interface() {
        let mut host = Host::with_address("10.0.0.1");
        host.network_interfaces[0].mac = Some("AA:BB:CC:DD:EE:FF".into());

        let mut other = Host::with_address("10.0.0.2").with_status(HostStatus::Online);
        other.network_interfaces[0].mac = Some("aa:bb:cc:dd:ee:ff".into());
        other.hostname = Some("printer".into());
        host.absorb(other);

        assert_eq!(host.network_interfaces.len(), 1);
        assert_eq!(host.network_interfaces[0].ip_addresses, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(host.status, HostStatus::Online);
        assert_eq!(host.hostname.as_deref(), Some("printer"));
    }

    #[test]
    fn test_absorb_joins_interfaces_spanned_by_incoming() {
        let mut host = Host::with_address("10.0.0.1");
        host.network_interfaces.push(NetworkInterface::with_address("10.0.0.2"));
        host.network_interfaces[1].merge_service(Service::tcp(22, "ssh", ""));

        let mut bridge = Host::with_address("10.0.0.1");
        bridge.network_interfaces[0].add_address("10.0.0.2");
        host.absorb(bridge);

        assert_eq!(host.network_interfaces.len(), 1);
        assert_eq!(host.addresses().collect::<Vec<_>>(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(host.services().count(), 1);
    }

    #[test]
    fn test_interface_absorb_takes_mac_and_addresses() {
        let mut iface = NetworkInterface::with_address("10.0.0.1");
        let mut other = NetworkInterface::with_address("10.0.0.9");
        other.mac = Some("AA:BB:CC:DD:EE:FF".into());
        iface.absorb(other);

        assert_eq!(iface.ip_addresses, vec!["10.0.0.1", "10.0.0.9"]);
        assert_eq!(iface.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_absorb_appends_new_interface() {
        let mut host = Host::with_address("10.0.0.1");
        host.absorb(Host::with_address("192.168.5.1"));
        assert_eq!(host.network_interfaces.len(), 2);
        assert_eq!(host.primary_address(), Some("10.0.0.1"));
    }

    #[test]
    fn test_fill_field_first_writer_wins() {
        let mut host = Host::with_address("10.0.0.1");
        assert!(host.fill_field(HostField::Hostname, "first"));
        assert!(!host.fill_field(HostField::Hostname, "second"));
        assert_eq!(host.hostname.as_deref(), Some("first"));

        assert!(host.fill_field(HostField::DeviceType, "printer"));
        assert!(!host.fill_field(HostField::DeviceType, "computer"));
        assert!(!host.fill_field(HostField::Model, "   "));
    }

    #[test]
    fn test_display() {
        let mut host = Host::with_address("10.0.0.9");
        assert_eq!(host.to_string(), "10.0.0.9");
        host.hostname = Some("nas".into());
        assert_eq!(host.to_string(), "nas (10.0.0.9)");
    }
}
