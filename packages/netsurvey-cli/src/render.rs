//! Text tree rendering of the inventory.

use netsurvey_core::{Host, HostField, NetworkInterface, Service};

/// Longest description shown inline; the full text is in the JSON export.
const DESCRIPTION_WIDTH: usize = 96;

/// One labelled node with children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub label: String,
    pub children: Vec<Node>,
}

impl Node {
    pub fn leaf(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            children: Vec::new(),
        }
    }

    pub fn branch(label: impl Into<String>, children: Vec<Node>) -> Self {
        Self {
            label: label.into(),
            children,
        }
    }

    /// Render with box-drawing connectors, root label unindented.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.label);
        out.push('\n');
        render_children(&self.children, "", &mut out);
        out
    }
}

fn render_children(children: &[Node], indent: &str, out: &mut String) {
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        out.push_str(indent);
        out.push_str(if last { "└─ " } else { "├─ " });
        out.push_str(&child.label);
        out.push('\n');
        let deeper = format!("{}{}", indent, if last { "   " } else { "│  " });
        render_children(&child.children, &deeper, out);
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let cut: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", cut)
}

fn service_node(service: &Service) -> Node {
    let label = format!(
        "{}/{}  {}",
        service.port,
        service.protocol,
        if service.service_name.is_empty() {
            Service::generic_name(service.port)
        } else {
            service.service_name.clone()
        }
    );
    let description = service.description.trim();
    if description.is_empty() {
        Node::leaf(label)
    } else {
        Node::branch(label, vec![Node::leaf(truncate(description, DESCRIPTION_WIDTH))])
    }
}

fn interface_node(iface: &NetworkInterface) -> Node {
    let label = match (iface.name.as_deref(), iface.mac.as_deref()) {
        (Some(name), Some(mac)) => format!("Interface {} [{}]", name, mac),
        (None, Some(mac)) => format!("Interface [{}]", mac),
        (Some(name), None) => format!("Interface {}", name),
        (None, None) => "Interface".to_string(),
    };
    let mut children = vec![Node::leaf(format!("IP: {}", iface.ip_addresses.join(", ")))];
    if !iface.services.is_empty() {
        let mut services: Vec<&Service> = iface.services.iter().collect();
        services.sort_by_key(|s| (s.port, s.protocol.to_string()));
        children.push(Node::branch(
            format!("Services ({})", services.len()),
            services.into_iter().map(service_node).collect(),
        ));
    }
    Node::branch(label, children)
}

/// Tree for one host: identity fields that are known, then its interfaces.
pub fn host_tree(host: &Host) -> Node {
    let mut children = Vec::new();
    let fields = [
        ("Domain", HostField::Domain),
        ("Device Type", HostField::DeviceType),
        ("Device Subtype", HostField::DeviceSubType),
        ("Manufacturer", HostField::Manufacturer),
        ("Model", HostField::Model),
        ("OS", HostField::OperatingSystem),
        ("OS Version", HostField::OperatingSystemVersion),
    ];
    for (label, field) in fields {
        if let Some(value) = host.field(field) {
            children.push(Node::leaf(format!("{}: {}", label, value)));
        }
    }
    children.extend(host.network_interfaces.iter().map(interface_node));
    Node::branch(format!("{}  [{}]", host, host.status), children)
}

/// Render every host, separated by blank lines.
pub fn render_inventory(hosts: &[Host]) -> String {
    hosts
        .iter()
        .map(|h| host_tree(h).render())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsurvey_core::HostStatus;

    #[test]
    fn test_render_connectors() {
        let tree = Node::branch(
            "root",
            vec![
                Node::branch("a", vec![Node::leaf("a1")]),
                Node::leaf("b"),
            ],
        );
        assert_eq!(tree.render(), "root\n├─ a\n│  └─ a1\n└─ b\n");
    }

    #[test]
    fn test_host_tree_shows_known_fields_only() {
        let mut host = Host::with_address("192.168.1.20")
            .with_status(HostStatus::Online)
            .with_service(Service::tcp(22, "ssh", "SSH-2.0-OpenSSH"));
        host.hostname = Some("nas".into());
        host.manufacturer = Some("Synology".into());

        let text = host_tree(&host).render();
        assert!(text.starts_with("nas (192.168.1.20)  [Online]\n"));
        assert!(text.contains("Manufacturer: Synology"));
        assert!(!text.contains("Device Type"));
        assert!(text.contains("22/tcp  ssh"));
        assert!(text.contains("SSH-2.0-OpenSSH"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
