//! MAC OUI (Organizationally Unique Identifier) vendor lookup
//!
//! Uses the IEEE OUI database to name the manufacturer behind a hardware
//! address, and maps well-known vendors to a coarse device type.

use crate::inventory::{HostField, HostRegistry};

/// Normalize a MAC address to `XX:XX:XX:XX:XX:XX`.
///
/// Accepts colon, dash or dot separators, octets without a leading zero
/// (`0:1a:2b:3:4:5`, as printed by BSD `arp`) and bare 12-digit hex.
/// Returns `None` for anything that is not six octets of hex.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let mac = mac.trim();
    let octets: Vec<String> = if mac.contains([':', '-']) {
        mac.split([':', '-'])
            .map(|part| format!("{:0>2}", part.to_uppercase()))
            .collect()
    } else {
        let hex: String = mac.replace('.', "").to_uppercase();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        (0..6).map(|i| hex[i * 2..i * 2 + 2].to_string()).collect()
    };

    if octets.len() != 6
        || octets
            .iter()
            .any(|o| o.len() != 2 || !o.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(octets.join(":"))
}

/// Broadcast and all-zero addresses never identify a device.
pub fn is_placeholder_mac(mac: &str) -> bool {
    mac == "FF:FF:FF:FF:FF:FF" || mac == "00:00:00:00:00:00"
}

/// Lookup the vendor/manufacturer name for a MAC address.
pub fn lookup_vendor(mac: &str) -> Option<String> {
    let normalized = normalize_mac(mac)?;

    match oui_data::lookup(&normalized) {
        Some(record) => {
            let vendor = record.organization().to_string();
            tracing::debug!("OUI {} -> {} ({:?})", mac, vendor, record.registry());
            Some(vendor)
        }
        None => {
            tracing::debug!("OUI {} not in database", mac);
            None
        }
    }
}

/// Vendor keyword groups, checked in order; the first hit wins.
const VENDOR_RULES: &[(&str, &[&str])] = &[
    (
        "firewall",
        &[
            "firewalla", "pfsense", "opnsense", "sophos", "watchguard", "sonicwall",
            "barracuda", "checkpoint", "forcepoint", "untangle",
        ],
    ),
    (
        "service",
        &[
            "proxmox", "vmware", "xensource", "parallels", "virtualbox", "qemu", "docker",
        ],
    ),
    (
        "network_device",
        &[
            "cisco", "juniper", "arista", "ubiquiti", "netgear", "tp-link", "linksys",
            "d-link", "mikrotik", "aruba", "ruckus", "fortinet", "palo alto", "zyxel",
            "draytek", "meraki", "routerboard",
        ],
    ),
    (
        "server",
        &["supermicro", "dell emc", "hewlett packard enterprise", "ibm", "fujitsu", "inspur"],
    ),
    ("apple", &["apple"]),
    (
        "nas",
        &["synology", "qnap", "western digital", "drobo", "asustor", "terramaster"],
    ),
    (
        "iot",
        &[
            "sonos", "philips", "signify", "nest", "ecobee", "wyze", "tuya", "shelly",
            "espressif", "amazon", "google", "roku", "lifx", "nanoleaf",
        ],
    ),
    (
        "printer",
        &[
            "hewlett packard", "hp inc", "canon", "epson", "brother", "xerox", "lexmark",
            "ricoh", "konica", "kyocera",
        ],
    ),
    ("gaming", &["sony interactive", "nintendo", "valve"]),
    (
        "mobile",
        &[
            "samsung", "huawei", "xiaomi", "oneplus", "oppo", "motorola", "lg electronics",
        ],
    ),
    (
        "computer",
        &[
            "dell", "lenovo", "acer", "asustek", "intel", "realtek", "gigabyte",
            "micro-star", "toshiba", "microsoft",
        ],
    ),
];

/// Coarse device type from a vendor name.
pub fn infer_device_type(vendor: &str) -> Option<&'static str> {
    let vendor = vendor.to_lowercase();
    VENDOR_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| vendor.contains(k)))
        .map(|(kind, _)| *kind)
}

/// Hypervisor and container MAC prefixes.
const VIRTUAL_PREFIXES: &[&str] = &[
    "0242AC", // Docker
    "005056", "000C29", "000569", // VMware
    "00163E", // Xen
    "00155D", // Hyper-V
    "001C42", // Parallels
    "525400", // QEMU/KVM
    "080027", // VirtualBox
    "BC2411", // Proxmox VE
];

/// True when the MAC belongs to a virtual machine or container.
pub fn is_virtual_mac(mac: &str) -> bool {
    normalize_mac(mac)
        .map(|m| m.replace(':', ""))
        .is_some_and(|m| VIRTUAL_PREFIXES.iter().any(|p| m.starts_with(p)))
}

/// Fill Manufacturer and DeviceType for the host holding `ip` from its MAC.
///
/// Both writes are first-writer-wins. Returns the vendor that was found.
pub fn enrich_host(registry: &HostRegistry, ip: &str, mac: &str) -> Option<String> {
    let vendor = lookup_vendor(mac);
    let device_type = vendor
        .as_deref()
        .and_then(infer_device_type)
        .or_else(|| is_virtual_mac(mac).then_some("service"));

    match (&vendor, device_type) {
        (Some(vendor), _) => {
            registry.update_field(ip, HostField::Manufacturer, vendor);
        }
        (None, Some(_)) => {
            registry.update_field(ip, HostField::Manufacturer, "Virtual Machine");
        }
        (None, None) => {}
    }
    if let Some(kind) = device_type {
        registry.update_field(ip, HostField::DeviceType, kind);
    }
    vendor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Host;

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("aa-bb-cc-dd-ee-ff").as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(
            normalize_mac("0:1a:2b:3:4:5").as_deref(),
            Some("00:1A:2B:03:04:05")
        );
        assert_eq!(
            normalize_mac("001a.2b3c.4d5e").as_deref(),
            Some("00:1A:2B:3C:4D:5E")
        );
        assert_eq!(normalize_mac("(incomplete)"), None);
        assert_eq!(normalize_mac("00:11:22:33:44"), None);
        assert_eq!(normalize_mac("zz:11:22:33:44:55"), None);
    }

    #[test]
    fn test_normalize_mac_rejects_non_ascii() {
        assert_eq!(normalize_mac("aéééééb"), None);
        assert_eq!(normalize_mac("é:11:22:33:44:55"), None);
        assert_eq!(lookup_vendor("0011223344é"), None);
    }

    #[test]
    fn test_infer_device_type() {
        assert_eq!(
            infer_device_type("Cisco Systems, Inc."),
            Some("network_device")
        );
        assert_eq!(infer_device_type("Apple, Inc."), Some("apple"));
        assert_eq!(infer_device_type("Synology Incorporated"), Some("nas"));
        assert_eq!(infer_device_type("VMware, Inc."), Some("service"));
        assert_eq!(infer_device_type("Firewalla Inc."), Some("firewall"));
        assert_eq!(infer_device_type("Unknown Vendor"), None);
    }

    #[test]
    fn test_is_virtual_mac() {
        assert!(is_virtual_mac("00:50:56:12:34:56"));
        assert!(is_virtual_mac("02:42:ac:12:34:56"));
        assert!(!is_virtual_mac("00:17:F2:12:34:56"));
    }

    #[test]
    fn test_enrich_host_marks_virtual_machines() {
        let registry = HostRegistry::new();
        registry.upsert(Host::with_address("10.0.0.20"));

        // 52:54:00 is locally administered and absent from the IEEE registry.
        enrich_host(&registry, "10.0.0.20", "52:54:00:12:34:56");
        let host = registry.find_by_address("10.0.0.20").unwrap();
        assert_eq!(host.device_type, "service");
        assert_eq!(host.manufacturer.as_deref(), Some("Virtual Machine"));
    }
}
