//! Target list expansion.
//!
//! Accepted entries, comma separated:
//! - `192.168.1.20`         a single address
//! - `192.168.1.x`          `x` octets expand to 1..254
//! - `192.168.1.10-40`      the end replaces the trailing octets of the start
//! - `192.168.0.0/23`       host addresses of a CIDR block

use anyhow::{Context, Result, anyhow, bail};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Refuse expansions larger than a /16.
const MAX_TARGETS: usize = 65_536;

/// Expand a target specification into unique addresses, first occurrence order.
pub fn parse_targets(spec: &str) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let expanded = expand_entry(entry).with_context(|| format!("Invalid target '{}'", entry))?;
        for ip in expanded {
            if seen.insert(ip) {
                targets.push(ip.to_string());
            }
        }
        if targets.len() > MAX_TARGETS {
            bail!("Target list exceeds {} addresses", MAX_TARGETS);
        }
    }

    if targets.is_empty() {
        bail!("No targets given");
    }
    Ok(targets)
}

fn expand_entry(entry: &str) -> Result<Vec<Ipv4Addr>> {
    if entry.contains('/') {
        return expand_cidr(entry);
    }
    if let Some((start, end)) = entry.split_once('-') {
        return expand_range(start.trim(), end.trim());
    }
    if entry.split('.').any(|o| o.eq_ignore_ascii_case("x")) {
        return expand_wildcard(entry);
    }
    Ok(vec![entry.parse()?])
}

fn expand_cidr(entry: &str) -> Result<Vec<Ipv4Addr>> {
    let network: Ipv4Network = entry.parse()?;
    if network.size() as usize > MAX_TARGETS + 2 {
        bail!("/{} is larger than the {} address limit", network.prefix(), MAX_TARGETS);
    }
    let (first, last) = (network.network(), network.broadcast());
    Ok(network
        .iter()
        .filter(|ip| network.prefix() >= 31 || (*ip != first && *ip != last))
        .collect())
}

fn expand_range(start: &str, end: &str) -> Result<Vec<Ipv4Addr>> {
    let start: Ipv4Addr = start.parse()?;
    let tail: Vec<u8> = end
        .split('.')
        .map(|o| o.parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow!("range end '{}' is not a list of octets", end))?;
    if tail.is_empty() || tail.len() > 4 {
        bail!("range end '{}' must have 1 to 4 octets", end);
    }

    let mut octets = start.octets();
    octets[4 - tail.len()..].copy_from_slice(&tail);
    let (from, to) = (u32::from(start), u32::from(Ipv4Addr::from(octets)));
    if to < from {
        bail!("range end {} is before start {}", Ipv4Addr::from(to), start);
    }
    if (to - from) as usize >= MAX_TARGETS {
        bail!("range spans more than {} addresses", MAX_TARGETS);
    }
    Ok((from..=to).map(Ipv4Addr::from).collect())
}

fn expand_wildcard(entry: &str) -> Result<Vec<Ipv4Addr>> {
    let parts: Vec<&str> = entry.split('.').collect();
    if parts.len() != 4 {
        bail!("expected four octets");
    }

    let mut prefixes: Vec<Vec<u8>> = vec![Vec::new()];
    for part in parts {
        let choices: Vec<u8> = if part.eq_ignore_ascii_case("x") {
            (1..=254).collect()
        } else {
            vec![part.parse().map_err(|_| anyhow!("'{}' is not an octet", part))?]
        };
        prefixes = prefixes
            .into_iter()
            .flat_map(|p| {
                choices.iter().map(move |c| {
                    let mut next = p.clone();
                    next.push(*c);
                    next
                })
            })
            .collect();
        if prefixes.len() > MAX_TARGETS {
            bail!("wildcard expands to more than {} addresses", MAX_TARGETS);
        }
    }

    Ok(prefixes
        .into_iter()
        .map(|o| Ipv4Addr::new(o[0], o[1], o[2], o[3]))
        .collect())
}
