//! Local network detection from the platform's routing and interface tools.

use super::command_output;
use anyhow::{Context, Result, anyhow};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Widest subnet swept by default; larger networks are narrowed to the local /24.
const DEFAULT_SWEEP_PREFIX: u8 = 24;

/// The interface carrying the default route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNetwork {
    pub interface: String,
    /// Network address and prefix, e.g. `192.168.1.0/24`.
    pub subnet: String,
    pub gateway: Option<String>,
    pub local_ip: String,
}

impl LocalNetwork {
    fn from_address(interface: String, ip: Ipv4Addr, prefix: u8, gateway: Option<String>) -> Result<Self> {
        let network = Ipv4Network::new(ip, prefix)
            .with_context(|| format!("Invalid prefix /{} for {}", prefix, ip))?;
        Ok(Self {
            interface,
            subnet: format!("{}/{}", network.network(), prefix),
            gateway,
            local_ip: ip.to_string(),
        })
    }

    /// Host addresses to sweep when the user gave no targets.
    ///
    /// Subnets wider than /24 are narrowed to the /24 holding the local address.
    pub fn default_targets(&self) -> Result<Vec<String>> {
        let network: Ipv4Network = self
            .subnet
            .parse()
            .with_context(|| format!("Invalid subnet {}", self.subnet))?;
        let network = if network.prefix() < DEFAULT_SWEEP_PREFIX {
            let ip: Ipv4Addr = self
                .local_ip
                .parse()
                .with_context(|| format!("Invalid local address {}", self.local_ip))?;
            Ipv4Network::new(ip, DEFAULT_SWEEP_PREFIX)?
        } else {
            network
        };
        let (first, last) = (network.network(), network.broadcast());
        Ok(network
            .iter()
            .filter(|ip| network.prefix() >= 31 || (*ip != first && *ip != last))
            .map(|ip| ip.to_string())
            .collect())
    }
}

/// Detect the interface, subnet, gateway and address of the default route.
pub async fn detect_local_network() -> Result<LocalNetwork> {
    #[cfg(target_os = "linux")]
    {
        detect_linux().await
    }

    #[cfg(target_os = "macos")]
    {
        detect_macos().await
    }

    #[cfg(target_os = "windows")]
    {
        detect_windows().await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Err(anyhow!("Unsupported platform"))
    }
}

#[cfg(target_os = "linux")]
async fn detect_linux() -> Result<LocalNetwork> {
    let route = command_output("ip", &["route", "show", "default"])
        .await
        .context("Failed to run ip route command")?;
    let (gateway, interface) = parse_linux_route(&route);
    let interface = interface.ok_or_else(|| anyhow!("No default route found"))?;

    let addr = command_output("ip", &["-4", "addr", "show", "dev", interface.as_str()])
        .await
        .context("Failed to run ip addr command")?;
    let (ip, prefix) = parse_linux_addr(&addr)
        .ok_or_else(|| anyhow!("No IPv4 address on {}", interface))?;
    LocalNetwork::from_address(interface, ip, prefix, gateway)
}

#[cfg(target_os = "macos")]
async fn detect_macos() -> Result<LocalNetwork> {
    let route = command_output("route", &["-n", "get", "default"])
        .await
        .context("Failed to run route command")?;
    let (gateway, interface) = parse_macos_route(&route);
    let interface = interface.unwrap_or_else(|| "en0".to_string());

    let ifconfig = command_output("ifconfig", &[interface.as_str()])
        .await
        .context("Failed to run ifconfig command")?;
    let (ip, prefix) = parse_macos_ifconfig(&ifconfig)
        .ok_or_else(|| anyhow!("No IPv4 address on {}", interface))?;
    LocalNetwork::from_address(interface, ip, prefix, gateway)
}

#[cfg(target_os = "windows")]
async fn detect_windows() -> Result<LocalNetwork> {
    let output = command_output("ipconfig", &[])
        .await
        .context("Failed to run ipconfig")?;
    let adapter = parse_ipconfig(&output).ok_or_else(|| anyhow!("No active network adapter found"))?;
    LocalNetwork::from_address(adapter.name, adapter.ip, adapter.prefix, adapter.gateway)
}

fn word_after<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.split_whitespace().skip_while(|w| *w != marker).nth(1)
}

/// `default via 192.168.1.1 dev eth0 proto dhcp metric 100` → (gateway, interface)
pub fn parse_linux_route(output: &str) -> (Option<String>, Option<String>) {
    let line = output.lines().find(|l| l.starts_with("default")).unwrap_or("");
    (
        word_after(line, "via").map(str::to_string),
        word_after(line, "dev").map(str::to_string),
    )
}

/// First non-loopback `inet a.b.c.d/n` of `ip addr show`.
pub fn parse_linux_addr(output: &str) -> Option<(Ipv4Addr, u8)> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("inet "))
        .filter_map(|l| l.split_whitespace().nth(1))
        .filter_map(|cidr| cidr.parse::<Ipv4Network>().ok())
        .find(|n| !n.ip().is_loopback())
        .map(|n| (n.ip(), n.prefix()))
}

/// `gateway:` and `interface:` lines of `route -n get default`.
pub fn parse_macos_route(output: &str) -> (Option<String>, Option<String>) {
    let value = |key: &str| {
        output
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split(':').nth(1))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    (value("gateway:"), value("interface:"))
}

/// `inet 192.168.1.20 netmask 0xffffff00 broadcast ...` of `ifconfig`.
pub fn parse_macos_ifconfig(output: &str) -> Option<(Ipv4Addr, u8)> {
    output.lines().map(str::trim).find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.first() != Some(&"inet") {
            return None;
        }
        let ip: Ipv4Addr = parts.get(1)?.parse().ok()?;
        if ip.is_loopback() {
            return None;
        }
        let mask = u32::from_str_radix(parts.get(3)?.trim_start_matches("0x"), 16).ok()?;
        Some((ip, mask.count_ones() as u8))
    })
}

/// One adapter block of `ipconfig` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpconfigAdapter {
    pub name: String,
    pub ip: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Option<String>,
    pub is_virtual: bool,
}

const VIRTUAL_ADAPTERS: &[&str] = &[
    "vEthernet",
    "WSL",
    "Hyper-V",
    "VirtualBox",
    "VMware",
    "Docker",
    "Loopback",
    "Tailscale",
];

fn ipconfig_value(line: &str) -> Option<&str> {
    let value = line.split_once(':')?.1.trim();
    // "(Preferred)" follows the address on newer Windows builds
    let value = value.split('(').next().unwrap_or(value).trim();
    Some(value).filter(|v| !v.is_empty())
}

/// Pick the best physical adapter, preferring one with a gateway.
pub fn parse_ipconfig(output: &str) -> Option<IpconfigAdapter> {
    #[derive(Default)]
    struct Block {
        name: String,
        ip: Option<Ipv4Addr>,
        mask: Option<Ipv4Addr>,
        gateway: Option<String>,
    }

    let mut blocks: Vec<Block> = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !line.starts_with(' ') && trimmed.ends_with(':') && trimmed.contains("adapter") {
            blocks.push(Block {
                name: trimmed.trim_end_matches(':').to_string(),
                ..Default::default()
            });
            continue;
        }
        let Some(block) = blocks.last_mut() else {
            continue;
        };
        if trimmed.starts_with("IPv4 Address") || trimmed.starts_with("IP Address") {
            block.ip = ipconfig_value(trimmed)
                .and_then(|v| v.parse().ok())
                .filter(|ip: &Ipv4Addr| !ip.is_loopback() && !ip.is_link_local());
        } else if trimmed.starts_with("Subnet Mask") {
            block.mask = ipconfig_value(trimmed).and_then(|v| v.parse().ok());
        } else if trimmed.starts_with("Default Gateway") {
            block.gateway = ipconfig_value(trimmed)
                .filter(|v| v.parse::<Ipv4Addr>().is_ok())
                .map(str::to_string);
        }
    }

    let adapters: Vec<IpconfigAdapter> = blocks
        .into_iter()
        .filter_map(|b| {
            let ip = b.ip?;
            let prefix = u32::from(b.mask?).count_ones() as u8;
            let is_virtual = VIRTUAL_ADAPTERS.iter().any(|p| b.name.contains(p));
            Some(IpconfigAdapter {
                name: b.name,
                ip,
                prefix,
                gateway: b.gateway,
                is_virtual,
            })
        })
        .collect();

    adapters
        .iter()
        .find(|a| !a.is_virtual && a.gateway.is_some())
        .or_else(|| adapters.iter().find(|a| !a.is_virtual))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linux() {
        let route = "default via 192.168.1.1 dev wlp2s0 proto dhcp src 192.168.1.42 metric 600\n";
        assert_eq!(
            parse_linux_route(route),
            (Some("192.168.1.1".into()), Some("wlp2s0".into()))
        );

        let addr = "3: wlp2s0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n    inet 192.168.1.42/24 brd 192.168.1.255 scope global dynamic wlp2s0\n";
        assert_eq!(parse_linux_addr(addr), Some(("192.168.1.42".parse().unwrap(), 24)));
        assert_eq!(parse_linux_addr("    inet 127.0.0.1/8 scope host lo\n"), None);
    }

    #[test]
    fn test_parse_macos() {
        let route = "   route to: default\ndestination: default\n    gateway: 10.0.0.1\n  interface: en0\n";
        assert_eq!(parse_macos_route(route), (Some("10.0.0.1".into()), Some("en0".into())));

        let ifconfig = "en0: flags=8863<UP,BROADCAST> mtu 1500\n\tinet 10.0.0.7 netmask 0xfffff000 broadcast 10.0.15.255\n";
        assert_eq!(parse_macos_ifconfig(ifconfig), Some(("10.0.0.7".parse().unwrap(), 20)));
    }

    #[test]
    fn test_parse_ipconfig_skips_virtual_adapters() {
        let output = "\
Windows IP Configuration

Ethernet adapter vEthernet (WSL):

   IPv4 Address. . . . . . . . . . . : 172.20.0.1
   Subnet Mask . . . . . . . . . . . : 255.255.240.0
   Default Gateway . . . . . . . . . :

Wireless LAN adapter Wi-Fi:

   IPv4 Address. . . . . . . . . . . : 192.168.0.15(Preferred)
   Subnet Mask . . . . . . . . . . . : 255.255.255.0
   Default Gateway . . . . . . . . . : 192.168.0.1
";
        let adapter = parse_ipconfig(output).unwrap();
        assert_eq!(adapter.name, "Wireless LAN adapter Wi-Fi");
        assert_eq!(adapter.ip, "192.168.0.15".parse::<Ipv4Addr>().unwrap());
        assert_eq!(adapter.prefix, 24);
        assert_eq!(adapter.gateway.as_deref(), Some("192.168.0.1"));
    }

    #[test]
    fn test_default_targets_narrow_wide_subnets() {
        let home = LocalNetwork::from_address("eth0".into(), "192.168.1.42".parse().unwrap(), 24, None).unwrap();
        assert_eq!(home.subnet, "192.168.1.0/24");
        let targets = home.default_targets().unwrap();
        assert_eq!(targets.len(), 254);
        assert_eq!(targets.first().map(String::as_str), Some("192.168.1.1"));
        assert_eq!(targets.last().map(String::as_str), Some("192.168.1.254"));

        let office = LocalNetwork::from_address("eth0".into(), "10.1.7.9".parse().unwrap(), 16, None).unwrap();
        assert_eq!(office.subnet, "10.1.0.0/16");
        let targets = office.default_targets().unwrap();
        assert_eq!(targets.len(), 254);
        assert!(targets.iter().all(|t| t.starts_with("10.1.7.")));
    }
}
