//! HTTP/S header fingerprinting.
//!
//! Fetches response headers from web services found by the port scan,
//! stores a condensed header summary as the service description and derives
//! web-server software, version and host OS from the `Server` header.

use super::wire::{connect, read_capped};
use super::{ProbeStep, StepProgress, StepState, TargetScope, spawn_sweep, sweep};
use crate::config::HttpSettings;
use crate::error::ProbeError;
use crate::inventory::{Host, HostField, HostRegistry, Protocol, Service};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Headers kept in the service description, in output order.
const KEPT_HEADERS: &[&str] = &["Server", "X-Powered-By", "Content-Type", "Location"];

/// `Server` token keywords and the product they identify, checked in order.
const SOFTWARE_RULES: &[(&[&str], &str)] = &[
    (&["nginx"], "Nginx"),
    (&["tomcat", "coyote"], "Apache Tomcat"),
    (&["apache"], "Apache HTTP Server"),
    (&["microsoft-iis", "iis"], "Microsoft IIS"),
    (&["lighttpd"], "Lighttpd"),
    (&["openresty"], "OpenResty"),
    (&["node.js"], "Node.js"),
    (&["express"], "Express.js"),
    (&["jetty"], "Eclipse Jetty"),
    (&["caddy"], "Caddy Server"),
    (&["gunicorn"], "Gunicorn"),
    (&["kestrel"], "Kestrel (.NET)"),
    (&["php", "hhvm"], "PHP"),
];

/// Operating-system hints found in `Server` comments such as `(Ubuntu)`.
const OS_RULES: &[(&[&str], &str)] = &[
    (&["ubuntu"], "Ubuntu Linux"),
    (&["debian"], "Debian Linux"),
    (&["centos"], "CentOS Linux"),
    (&["red hat", "rhel"], "Red Hat Enterprise Linux"),
    (&["windows"], "Microsoft Windows Server"),
    (&["freebsd"], "FreeBSD"),
    (&["macos", "darwin"], "Apple macOS Server"),
    (&["linux"], "Linux"),
];

static SERVER_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)(?:^|\|)[ \t]*Server:[ \t]*([^|\r\n]+)").expect("valid Server header pattern")
});

/// What a `Server` header says about the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFingerprint {
    pub software: String,
    pub software_version: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
}

impl ServerFingerprint {
    fn software_label(&self) -> String {
        join_version(&self.software, self.software_version.as_deref())
    }

    /// Vendor implied by the OS, if any.
    pub fn manufacturer(&self) -> Option<&'static str> {
        let os = self.os.as_deref()?;
        if os.starts_with("Microsoft") {
            Some("Microsoft")
        } else if os.starts_with("Apple") {
            Some("Apple Inc.")
        } else {
            None
        }
    }

    /// OS with version when known, otherwise the server software with version.
    pub fn model(&self) -> String {
        match &self.os {
            Some(os) => join_version(os, self.os_version.as_deref()),
            None => self.software_label(),
        }
    }

    /// Service name such as `https Nginx 1.18.0`.
    pub fn service_label(&self, scheme: &str) -> String {
        format!("{} {}", scheme, self.software_label())
    }
}

fn join_version(name: &str, version: Option<&str>) -> String {
    match version {
        Some(v) => format!("{} {}", name, v),
        None => name.to_string(),
    }
}

/// Version number right after `keyword`, as in `nginx/1.18.0` or `IIS 10.0`.
fn version_after(text: &str, keyword: &str) -> Option<String> {
    let pattern = format!(r"(?i){}[/\s]?v?(\d+(?:\.\d+)*)", regex::escape(keyword));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn match_rule(
    value: &str,
    rules: &[(&[&str], &'static str)],
) -> Option<(&'static str, Option<String>)> {
    let lower = value.to_lowercase();
    rules.iter().find_map(|(keywords, name)| {
        let hit = keywords.iter().find(|k| lower.contains(*k))?;
        let version = keywords
            .iter()
            .find_map(|k| version_after(value, k))
            .or_else(|| version_after(value, hit));
        Some((*name, version))
    })
}

/// Parse the `Server` header out of a header summary or raw header block.
pub fn fingerprint(description: &str) -> Option<ServerFingerprint> {
    let value = SERVER_HEADER
        .captures(description)?
        .get(1)?
        .as_str()
        .trim()
        .to_string();
    if value.is_empty() {
        return None;
    }

    let (software, software_version) = match match_rule(&value, SOFTWARE_RULES) {
        Some((name, version)) => (name.to_string(), version),
        None => {
            let mut parts = value.split([' ', '/']).filter(|p| !p.is_empty());
            let name = parts.next().unwrap_or(&value).to_string();
            let version = parts
                .next()
                .filter(|v| v.starts_with(|c: char| c.is_ascii_digit()))
                .map(str::to_string);
            (name, version)
        }
    };
    let (os, os_version) = match match_rule(&value, OS_RULES) {
        Some((name, version)) => (Some(name.to_string()), version),
        None => (None, None),
    };

    Some(ServerFingerprint {
        software,
        software_version,
        os,
        os_version,
    })
}

/// Whether a fingerprint should replace the current service name.
fn should_rename(service: &Service, fp: &ServerFingerprint) -> bool {
    let current = service.service_name.trim();
    let base = super::ports::well_known_service(service.port).unwrap_or("");
    service.has_generic_name()
        || current.eq_ignore_ascii_case("http")
        || current.eq_ignore_ascii_case("https")
        || current.eq_ignore_ascii_case(base)
        || !current
            .to_lowercase()
            .contains(&fp.software.to_lowercase())
}

/// Condense a raw response head into `status | Server: ... | ...`.
pub fn summarize_headers(raw: &str) -> Result<String, ProbeError> {
    let mut lines = raw.lines().map(str::trim_end);
    let status = lines
        .next()
        .map(str::trim)
        .filter(|l| l.starts_with("HTTP/"))
        .ok_or_else(|| ProbeError::Protocol("no HTTP status line".to_string()))?;

    let mut parts = vec![status.to_string()];
    let headers: Vec<(&str, &str)> = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();
    for kept in KEPT_HEADERS {
        if let Some((_, value)) = headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(kept)) {
            parts.push(format!("{}: {}", kept, value));
        }
    }
    Ok(parts.join(" | "))
}

async fn request_head<S>(stream: &mut S, ip: &str, settings: &HttpSettings) -> Result<String, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: netsurvey\r\nConnection: close\r\n\r\n",
        ip
    );
    let limit = settings.timeout();
    match tokio::time::timeout(limit, stream.write_all(request.as_bytes())).await {
        Err(_) => return Err(ProbeError::timeout("sending request", limit)),
        Ok(result) => result?,
    }

    let head = read_capped(stream, settings.max_header_bytes, limit, |buf| {
        buf.windows(4).any(|w| w == b"\r\n\r\n")
    })
    .await?;
    if head.is_empty() {
        return Err(ProbeError::NoResponse);
    }
    summarize_headers(&String::from_utf8_lossy(&head))
}

/// TLS connector that accepts any certificate and sends no SNI.
fn identification_connector() -> Result<tokio_native_tls::TlsConnector, ProbeError> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .use_sni(false)
        .build()
        .map_err(|e| ProbeError::Tls(e.to_string()))?;
    Ok(tokio_native_tls::TlsConnector::from(connector))
}

/// Fetch and summarize the response head of `GET /`, over TLS when `tls` is set.
///
/// Certificates and hostnames are not validated; the goal is identification.
pub async fn fetch_headers(
    ip: &str,
    port: u16,
    tls: bool,
    settings: &HttpSettings,
) -> Result<String, ProbeError> {
    let mut stream = connect(ip, port, settings.timeout()).await?;
    if !tls {
        return request_head(&mut stream, ip, settings).await;
    }

    let connector = identification_connector()?;
    let limit = settings.timeout();
    let mut tls_stream = match tokio::time::timeout(limit, connector.connect(ip, stream)).await {
        Err(_) => return Err(ProbeError::timeout("TLS handshake", limit)),
        Ok(Err(e)) => return Err(ProbeError::Tls(e.to_string())),
        Ok(Ok(s)) => s,
    };
    request_head(&mut tls_stream, ip, settings).await
}

pub struct HttpFingerprintStep {
    registry: Arc<HostRegistry>,
    settings: HttpSettings,
    state: StepState,
}

impl HttpFingerprintStep {
    pub fn new(registry: Arc<HostRegistry>, settings: HttpSettings) -> Self {
        Self {
            registry,
            settings,
            state: StepState::default(),
        }
    }
}

impl ProbeStep for HttpFingerprintStep {
    fn name(&self) -> &'static str {
        "HTTP Fingerprint"
    }

    fn description(&self) -> &'static str {
        "Reads HTTP/S response headers and identifies web server software and host OS."
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
        let progress = self.state.progress.clone();

        spawn_sweep(self.name(), progress.clone(), async move {
            let hosts = registry.hosts_with_ports(&settings.all_ports());
            progress.set_message(format!("Fingerprinting web services on {} hosts...", hosts.len()));

            let registry = &*registry;
            let settings = &settings;
            let log = &*progress;
            sweep(&progress, hosts, settings.concurrency, move |host: Host| async move {
                fingerprint_host(registry, settings, log, host).await;
            })
            .await;

            progress.finish("HTTP fingerprinting complete");
        });
    }

    fn progress(&self) -> &StepProgress {
        &self.state.progress
    }
}

async fn fingerprint_host(registry: &HostRegistry, settings: &HttpSettings, log: &StepProgress, host: Host) {
    for iface in &host.network_interfaces {
        let Some(ip) = iface.ip_addresses.first() else {
            continue;
        };
        for service in &iface.services {
            let tls = settings.https_ports.contains(&service.port);
            if service.protocol != Protocol::Tcp || !(tls || settings.http_ports.contains(&service.port)) {
                continue;
            }

            let description = if service.needs_probe() {
                let fresh = match fetch_headers(ip, service.port, tls, settings).await {
                    Ok(summary) => summary,
                    Err(e) => e.describe("HTTP header fetch"),
                };
                registry.update_service(ip, service.port, Protocol::Tcp, |s| {
                    s.description = fresh.clone()
                });
                fresh
            } else {
                service.description.clone()
            };
            log.log(format!("{}:{} {}", ip, service.port, description));

            let Some(fp) = fingerprint(&description) else {
                continue;
            };
            let scheme = if tls { "https" } else { "http" };
            if should_rename(service, &fp) {
                let label = fp.service_label(scheme);
                registry.update_service(ip, service.port, Protocol::Tcp, |s| {
                    s.service_name = label.clone()
                });
                log.log(format!("{}:{} identified as {}", ip, service.port, label));
            }
            if let Some(vendor) = fp.manufacturer() {
                registry.update_field(ip, HostField::Manufacturer, vendor);
            }
            registry.update_field(ip, HostField::Model, &fp.model());
        }
    }
}
