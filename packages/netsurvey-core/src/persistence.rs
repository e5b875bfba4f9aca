//! Inventory export.
//!
//! The inventory is written as one indented JSON array of hosts, the format
//! downstream consumers read from `Hosts.json`.

use crate::inventory::Host;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const INVENTORY_FILE: &str = "Hosts.json";

/// `<data_local_dir>/netsurvey/Hosts.json`.
pub fn default_inventory_path() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .context("Could not find data directory")?;
    Ok(data_dir.join("netsurvey").join(INVENTORY_FILE))
}

/// Write the hosts to `path`, creating parent directories as needed.
pub fn save_inventory(path: &Path, hosts: &[Host]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(hosts).context("Failed to serialize inventory")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write inventory to {}", path.display()))?;

    tracing::info!("Saved {} hosts to {}", hosts.len(), path.display());
    Ok(())
}

/// Read an inventory written by [`save_inventory`]. A missing file is an empty inventory.
pub fn load_inventory(path: &Path) -> Result<Vec<Host>> {
    if !path.exists() {
        tracing::debug!("No inventory at {}, starting empty", path.display());
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let hosts: Vec<Host> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    tracing::info!("Loaded {} hosts from {}", hosts.len(), path.display());
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{HostStatus, Service};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("netsurvey-test-{}-{}", std::process::id(), name))
            .join(INVENTORY_FILE)
    }

    #[test]
    fn test_exported_field_names() {
        let mut host = Host::with_address("192.168.1.5")
            .with_status(HostStatus::Online)
            .with_service(Service::tcp(22, "ssh", "SSH-2.0-OpenSSH"));
        host.network_interfaces[0].mac = Some("AA:BB:CC:DD:EE:FF".into());

        let json = serde_json::to_value(vec![host]).unwrap();
        let first = &json[0];
        assert_eq!(first["Status"], "Online");
        assert_eq!(first["DeviceType"], "Unknown");
        let iface = &first["NetworkInterfaces"][0];
        assert_eq!(iface["MAC"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(iface["Ip_Address"][0], "192.168.1.5");
        assert_eq!(iface["Services"][0]["Port"], 22);
        assert_eq!(iface["Services"][0]["Protocol"], "tcp");
        assert_eq!(iface["Services"][0]["ServiceName"], "ssh");
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("roundtrip");
        let hosts = vec![
            Host::with_address("10.0.0.1").with_status(HostStatus::Online),
            Host::with_address("10.0.0.2"),
        ];
        save_inventory(&path, &hosts).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[\n"));
        assert_eq!(load_inventory(&path).unwrap(), hosts);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_file_is_empty() {
        assert!(load_inventory(&temp_path("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_default_path_ends_with_file_name() {
        if let Ok(path) = default_inventory_path() {
            assert!(path.ends_with("netsurvey/Hosts.json"));
        }
    }
}
