//! Heuristic OS and vendor inference over everything already known about a host.

use super::{ProbeStep, StepProgress, StepState, TargetScope, spawn_sweep};
use crate::inventory::{Host, HostField, HostRegistry};
use regex::Regex;
use std::sync::{Arc, LazyLock};

const LINUX_DISTROS: &[(&str, &str)] = &[
    ("debian", "Debian"),
    ("ubuntu", "Ubuntu"),
    ("centos", "CentOS"),
    ("alma", "AlmaLinux"),
    ("red hat", "Red Hat"),
    ("fedora", "Fedora"),
];

static HP_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bhp\b").expect("valid HP word pattern"));

/// Field assignments derived for one host. Later rules win over earlier ones.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Inference {
    pub operating_system: Option<&'static str>,
    pub operating_system_version: Option<&'static str>,
    pub manufacturer: Option<&'static str>,
}

impl Inference {
    pub fn is_empty(&self) -> bool {
        self == &Inference::default()
    }

    fn apply(&self, host: &mut Host) {
        if let Some(os) = self.operating_system {
            host.set_field(HostField::OperatingSystem, os);
        }
        if let Some(version) = self.operating_system_version {
            host.set_field(HostField::OperatingSystemVersion, version);
        }
        if let Some(manufacturer) = self.manufacturer {
            host.set_field(HostField::Manufacturer, manufacturer);
        }
    }
}

/// Run the rule list over the host's lowercased JSON form.
pub fn infer(host: &Host) -> Result<Inference, serde_json::Error> {
    let text = serde_json::to_string(host)?.to_lowercase();
    let mut found = Inference::default();

    if host.has_service_on(&[135])
        || ["windows", "iis", "microsoft"].iter().any(|k| text.contains(k))
    {
        found.operating_system = Some("Windows");
    }

    let distro = LINUX_DISTROS
        .iter()
        .find(|(needle, _)| text.contains(needle))
        .map(|(_, name)| *name);
    if distro.is_some() || text.contains("linux") {
        found.operating_system = Some("Linux");
        if distro.is_some() {
            found.operating_system_version = distro;
        }
    }

    if text.contains("cisco") || text.contains(" ios ") {
        found.operating_system = Some("Cisco IOS");
        found.manufacturer = Some("Cisco");
    }

    if HP_WORD.is_match(&text) || text.contains("hewlett") {
        found.manufacturer = Some("HP");
    }

    Ok(found)
}

pub struct InferenceStep {
    registry: Arc<HostRegistry>,
    state: StepState,
}

impl InferenceStep {
    pub fn new(registry: Arc<HostRegistry>) -> Self {
        Self {
            registry,
            state: StepState::default(),
        }
    }
}

impl ProbeStep for InferenceStep {
    fn name(&self) -> &'static str {
        "OS/Vendor Inference"
    }

    fn description(&self) -> &'static str {
        "Infers operating system and manufacturer from the collected service data."
    }

    fn target_scope(&self) -> TargetScope {
        TargetScope::Registry
    }

    fn start(&self, _targets: Vec<String>) {
        if !self.state.begin(self.name()) {
            return;
        }
        let registry = self.registry.clone();
        let progress = self.state.progress.clone();

        spawn_sweep(self.name(), progress.clone(), async move {
            let hosts = registry.snapshot();
            progress.set_total(hosts.len());
            progress.set_message(format!("Inferring platform for {} hosts...", hosts.len()));

            for host in hosts {
                infer_host(&registry, &progress, &host);
                progress.advance();
            }
            progress.finish("Inference complete");
        });
    }

    fn progress(&self) -> &StepProgress {
        &self.state.progress
    }
}

fn infer_host(registry: &HostRegistry, log: &StepProgress, host: &Host) {
    let Some(ip) = host.primary_address() else {
        return;
    };
    match infer(host) {
        Ok(found) if found.is_empty() => {}
        Ok(found) => {
            registry.modify(ip, |h| found.apply(h));
            log.log(format!("{}: {:?}", host, found));
        }
        Err(e) => log.log(format!("{}: Error: serializing host: {}", host, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Service;
    use std::time::Duration;

    #[test]
    fn test_endpoint_mapper_port_means_windows() {
        let host = Host::with_address("10.0.0.1").with_service(Service::tcp(135, "msrpc", ""));
        assert_eq!(infer(&host).unwrap().operating_system, Some("Windows"));
    }

    #[test]
    fn test_distro_sets_linux_and_version() {
        let host = Host::with_address("10.0.0.2").with_service(Service::tcp(
            22,
            "ssh",
            "SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5",
        ));
        let found = infer(&host).unwrap();
        assert_eq!(found.operating_system, Some("Linux"));
        assert_eq!(found.operating_system_version, Some("Ubuntu"));
    }

    #[test]
    fn test_later_rules_overwrite_earlier() {
        let host = Host::with_address("10.0.0.3").with_service(Service::tcp(
            23,
            "telnet",
            "Cisco IOS Software, Microsoft compatible",
        ));
        let found = infer(&host).unwrap();
        assert_eq!(found.operating_system, Some("Cisco IOS"));
        assert_eq!(found.manufacturer, Some("Cisco"));
    }

    #[test]
    fn test_hp_needs_a_whole_word() {
        let printer = Host::with_address("10.0.0.4").with_service(Service::tcp(80, "http", "Server: HP HTTP Server"));
        assert_eq!(infer(&printer).unwrap().manufacturer, Some("HP"));

        let php = Host::with_address("10.0.0.5").with_service(Service::tcp(80, "http", "X-Powered-By: PHP/8.1"));
        assert!(infer(&php).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_step_overwrites_existing_fields() {
        let registry = Arc::new(HostRegistry::new());
        let mut host = Host::with_address("10.0.0.6")
            .with_service(Service::tcp(80, "http", "Server: Microsoft-IIS/10.0"));
        host.operating_system = Some("Something".into());
        registry.upsert(host);
        registry.upsert(Host::with_address("10.0.0.7"));

        let step = InferenceStep::new(registry.clone());
        step.start(Vec::new());
        while !step.is_completed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let host = registry.find_by_address("10.0.0.6").unwrap();
        assert_eq!(host.operating_system.as_deref(), Some("Windows"));
        assert_eq!(step.progress().processed(), 2);
        assert!(registry.find_by_address("10.0.0.7").unwrap().operating_system.is_none());
    }
}
