//! Shared host registry.
//!
//! Every probe step writes into one [`HostRegistry`], shared by `Arc`. The
//! lock is held only for a single point mutation and never across an await.
//! After any mutation no two hosts share an IP address.

use super::{Host, HostField, HostStatus, Protocol, Service};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Result of an [`HostRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged,
}

/// Change notification for observers such as a live display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A new host appeared; carries its primary address.
    Added(String),
    /// An existing host changed; carries its primary address.
    Updated(String),
}

pub struct HostRegistry {
    hosts: Mutex<Vec<Host>>,
    events: broadcast::Sender<HostEvent>,
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            hosts: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Seed a registry from a previously exported inventory.
    pub fn from_hosts(hosts: Vec<Host>) -> Self {
        let registry = Self::new();
        registry.upsert_all(hosts);
        registry
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Host>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: HostEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Receive [`HostEvent`]s for every subsequent change.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn find_by_address(&self, ip: &str) -> Option<Host> {
        self.lock().iter().find(|h| h.holds_address(ip)).cloned()
    }

    pub fn contains_address(&self, ip: &str) -> bool {
        self.lock().iter().any(|h| h.holds_address(ip))
    }

    /// Insert a candidate or merge it into the host(s) sharing any of its addresses.
    pub fn upsert(&self, candidate: Host) -> UpsertOutcome {
        let (outcome, key) = {
            let mut hosts = self.lock();
            merge_into(&mut hosts, candidate)
        };
        if let Some(key) = key {
            self.notify(match outcome {
                UpsertOutcome::Inserted => HostEvent::Added(key),
                UpsertOutcome::Merged => HostEvent::Updated(key),
            });
        }
        outcome
    }

    /// Upsert a batch under a single lock acquisition.
    pub fn upsert_all(&self, candidates: Vec<Host>) -> Vec<UpsertOutcome> {
        let results: Vec<(UpsertOutcome, Option<String>)> = {
            let mut hosts = self.lock();
            candidates
                .into_iter()
                .map(|candidate| merge_into(&mut hosts, candidate))
                .collect()
        };
        results
            .into_iter()
            .map(|(outcome, key)| {
                if let Some(key) = key {
                    self.notify(match outcome {
                        UpsertOutcome::Inserted => HostEvent::Added(key),
                        UpsertOutcome::Merged => HostEvent::Updated(key),
                    });
                }
                outcome
            })
            .collect()
    }

    /// Point mutation of the host holding `ip`. Returns false if no host holds it.
    pub fn modify<F>(&self, ip: &str, f: F) -> bool
    where
        F: FnOnce(&mut Host),
    {
        let key = {
            let mut hosts = self.lock();
            let Some(host) = hosts.iter_mut().find(|h| h.holds_address(ip)) else {
                return false;
            };
            f(host);
            host.primary_address().map(str::to_string)
        };
        if let Some(key) = key {
            self.notify(HostEvent::Updated(key));
        }
        true
    }

    /// First-writer-wins update of a scalar field.
    ///
    /// Applies only when the field is still empty; blank values are ignored.
    pub fn update_field(&self, ip: &str, field: HostField, value: &str) -> bool {
        let mut applied = false;
        self.modify(ip, |host| applied = host.fill_field(field, value));
        if applied {
            tracing::debug!("{}: {} = {}", ip, field, value.trim());
        }
        applied
    }

    /// First-writer-wins update of the MAC on the interface holding `ip`.
    pub fn set_mac_if_empty(&self, ip: &str, mac: &str) -> bool {
        let mut applied = false;
        self.modify(ip, |host| {
            if let Some(iface) = host.interface_for_mut(ip) {
                if iface.mac.as_deref().is_none_or(|m| m.trim().is_empty()) && !mac.is_empty() {
                    iface.mac = Some(mac.to_string());
                    applied = true;
                }
            }
        });
        applied
    }

    /// Point mutation of one service on the host holding `ip`.
    pub fn update_service<F>(&self, ip: &str, port: u16, protocol: Protocol, f: F) -> bool
    where
        F: FnOnce(&mut Service),
    {
        let mut found = false;
        self.modify(ip, |host| {
            let service = host
                .network_interfaces
                .iter_mut()
                .find_map(|iface| iface.service_mut(port, protocol));
            if let Some(service) = service {
                f(service);
                found = true;
            }
        });
        found
    }

    pub fn snapshot(&self) -> Vec<Host> {
        self.lock().clone()
    }

    /// Primary addresses of hosts currently marked online.
    pub fn online_addresses(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|h| h.status == HostStatus::Online)
            .filter_map(|h| h.primary_address().map(str::to_string))
            .collect()
    }

    /// Hosts exposing a service on any of `ports`.
    pub fn hosts_with_ports(&self, ports: &[u16]) -> Vec<Host> {
        self.lock()
            .iter()
            .filter(|h| h.has_service_on(ports))
            .cloned()
            .collect()
    }
}

/// Merge one candidate into the host list. Returns the outcome and the key of
/// the affected host.
fn merge_into(hosts: &mut Vec<Host>, candidate: Host) -> (UpsertOutcome, Option<String>) {
    let matching: Vec<usize> = hosts
        .iter()
        .enumerate()
        .filter(|(_, h)| h.shares_address_with(&candidate))
        .map(|(i, _)| i)
        .collect();

    let Some((&first, rest)) = matching.split_first() else {
        let key = candidate.primary_address().map(str::to_string);
        hosts.push(candidate);
        return (UpsertOutcome::Inserted, key);
    };

    // Later matches are the same device seen under another address; fold them
    // into the first so the address sets stay disjoint.
    for &index in rest.iter().rev() {
        let duplicate = hosts.remove(index);
        tracing::debug!("Folding {} into {}", duplicate, hosts[first]);
        hosts[first].absorb(duplicate);
    }
    hosts[first].absorb(candidate);
    (
        UpsertOutcome::Merged,
        hosts[first].primary_address().map(str::to_string),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::NetworkInterface;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn assert_disjoint(registry: &HostRegistry) {
        let mut seen = HashSet::new();
        for host in registry.snapshot() {
            for ip in host.addresses() {
                assert!(seen.insert(ip.to_string()), "{} held by two hosts", ip);
            }
        }
    }

    #[test]
    fn test_upsert_inserts_then_merges() {
        let registry = HostRegistry::new();
        assert_eq!(registry.upsert(Host::with_address("10.0.0.1")), UpsertOutcome::Inserted);
        assert_eq!(
            registry.upsert(Host::with_address("10.0.0.1").with_status(HostStatus::Online)),
            UpsertOutcome::Merged
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.find_by_address("10.0.0.1").map(|h| h.status),
            Some(HostStatus::Online)
        );
    }

    #[test]
    fn test_presence_does_not_imply_online() {
        let registry = HostRegistry::new();
        registry.upsert(Host::with_address("10.0.0.7"));
        assert_eq!(
            registry.find_by_address("10.0.0.7").map(|h| h.status),
            Some(HostStatus::Unknown)
        );
        assert!(registry.online_addresses().is_empty());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let candidate = Host::with_address("10.0.0.2")
            .with_status(HostStatus::Online)
            .with_service(Service::tcp(22, "ssh", "SSH-2.0"));

        let once = HostRegistry::new();
        once.upsert(candidate.clone());

        let twice = HostRegistry::new();
        twice.upsert(candidate.clone());
        twice.upsert(candidate);

        assert_eq!(once.snapshot(), twice.snapshot());
    }

    #[test]
    fn test_services_deduplicated_on_merge() {
        let registry = HostRegistry::new();
        registry.upsert(Host::with_address("10.0.0.3").with_service(Service::tcp(80, "http", "")));
        registry.upsert(
            Host::with_address("10.0.0.3").with_service(Service::tcp(80, "http", "HTTP/1.1 200 OK")),
        );
        registry.upsert(Host::with_address("10.0.0.3").with_service(Service::tcp(443, "https", "")));

        let host = registry.find_by_address("10.0.0.3").unwrap();
        let services: Vec<_> = host.services().collect();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].description, "HTTP/1.1 200 OK");
    }

    #[test]
    fn test_bridging_candidate_folds_hosts() {
        let registry = HostRegistry::new();
        registry.upsert(Host::with_address("10.0.0.1"));
        registry.upsert(Host::with_address("10.0.0.2"));

        let mut bridge = Host::with_address("10.0.0.1");
        bridge.network_interfaces[0].add_address("10.0.0.2");
        assert_eq!(registry.upsert(bridge), UpsertOutcome::Merged);

        assert_eq!(registry.len(), 1);
        assert_disjoint(&registry);
        let host = registry.find_by_address("10.0.0.2").unwrap();
        assert_eq!(host.primary_address(), Some("10.0.0.1"));
        assert_eq!(host.addresses().collect::<Vec<_>>(), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_second_interface_merges_by_address() {
        let registry = HostRegistry::new();
        registry.upsert(Host::with_address("10.0.0.1"));

        let mut candidate = Host::with_address("10.0.0.1");
        candidate
            .network_interfaces
            .push(NetworkInterface::with_address("172.16.0.1"));
        registry.upsert(candidate);
        registry.upsert(Host::with_address("172.16.0.1").with_status(HostStatus::Online));

        assert_eq!(registry.len(), 1);
        let host = registry.find_by_address("172.16.0.1").unwrap();
        assert_eq!(host.network_interfaces.len(), 2);
        assert_eq!(host.status, HostStatus::Online);
    }

    #[test]
    fn test_update_field_first_writer_wins() {
        let registry = HostRegistry::new();
        registry.upsert(Host::with_address("10.0.0.4"));

        assert!(registry.update_field("10.0.0.4", HostField::Hostname, "alpha"));
        assert!(!registry.update_field("10.0.0.4", HostField::Hostname, "beta"));
        assert!(!registry.update_field("10.9.9.9", HostField::Hostname, "gamma"));
        assert_eq!(
            registry.find_by_address("10.0.0.4").unwrap().hostname.as_deref(),
            Some("alpha")
        );
    }

    #[test]
    fn test_set_mac_if_empty() {
        let registry = HostRegistry::new();
        registry.upsert(Host::with_address("10.0.0.5"));
        assert!(registry.set_mac_if_empty("10.0.0.5", "AA:BB:CC:DD:EE:01"));
        assert!(!registry.set_mac_if_empty("10.0.0.5", "AA:BB:CC:DD:EE:02"));
        assert_eq!(
            registry.find_by_address("10.0.0.5").unwrap().first_mac(),
            Some("AA:BB:CC:DD:EE:01")
        );
    }

    #[test]
    fn test_update_service() {
        let registry = HostRegistry::new();
        registry.upsert(Host::with_address("10.0.0.6").with_service(Service::tcp(80, "http", "")));
        assert!(registry.update_service("10.0.0.6", 80, Protocol::Tcp, |s| {
            s.description = "HTTP/1.0 200 OK".into()
        }));
        assert!(!registry.update_service("10.0.0.6", 81, Protocol::Tcp, |_| {}));
        assert_eq!(registry.hosts_with_ports(&[80]).len(), 1);
        assert!(registry.hosts_with_ports(&[443]).is_empty());
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let registry = HostRegistry::new();
        let mut events = registry.subscribe();
        registry.upsert(Host::with_address("10.0.0.8"));
        registry.update_field("10.0.0.8", HostField::Model, "X1");

        assert_eq!(events.recv().await.unwrap(), HostEvent::Added("10.0.0.8".into()));
        assert_eq!(events.recv().await.unwrap(), HostEvent::Updated("10.0.0.8".into()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_stay_disjoint() {
        let registry = Arc::new(HostRegistry::new());
        let mut handles = Vec::new();
        for worker in 0..8u16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..50u16 {
                    let ip = format!("10.1.{}.{}", n % 5, n % 25);
                    let host = Host::with_address(ip)
                        .with_service(Service::tcp(1000 + worker, Service::generic_name(1000 + worker), ""));
                    registry.upsert(host);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_disjoint(&registry);
        assert_eq!(registry.len(), 25);
        for host in registry.snapshot() {
            let mut keys = HashSet::new();
            for service in host.services() {
                assert!(keys.insert(service.key()));
            }
        }
    }
}
