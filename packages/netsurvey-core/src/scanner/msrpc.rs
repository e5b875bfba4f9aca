//! MSRPC probes: DCE/RPC bind to the Endpoint Mapper on 135 and SMB
//! negotiate on 445.

use super::wire::{exchange, hex_preview, smb_negotiate_request, smb_signature};
use super::{
    ProbeStep, StepProgress, StepState, TargetScope, label_service, mark_windows, spawn_sweep, sweep,
};
use crate::config::WindowsProbeSettings;
use crate::error::ProbeError;
use crate::inventory::{Host, HostRegistry, Service};
use std::sync::Arc;

pub const ENDPOINT_MAPPER_PORT: u16 = 135;
pub const SMB_DIRECT_PORT: u16 = 445;

const PTYPE_BIND: u8 = 11;
const PTYPE_BIND_ACK: u8 = 12;
const PTYPE_BIND_NAK: u8 = 13;

/// e1af8308-5d1f-11c9-91a4-08002b14a0fa, first three fields little-endian.
const EPM_UUID: [u8; 16] = [
    0x08, 0x83, 0xAF, 0xE1, 0x1F, 0x5D, 0xC9, 0x11, 0x91, 0xA4, 0x08, 0x00, 0x2B, 0x14, 0xA0, 0xFA,
];
/// 8a885d04-1ceb-11c9-9fe8-08002b104860 (NDR).
const NDR_UUID: [u8; 16] = [
    0x04, 0x5D, 0x88, 0x8A, 0xEB, 0x1C, 0xC9, 0x11, 0x9F, 0xE8, 0x08, 0x00, 0x2B, 0x10, 0x48, 0x60,
];

/// DCE/RPC v5 Bind for the Endpoint Mapper v3.0 over NDR v2.
pub fn epm_bind_request(call_id: u32) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(72);
    pdu.extend_from_slice(&[5, 0, PTYPE_BIND, 0x03]); // v5.0, first+last fragment
    pdu.extend_from_slice(&[0x10, 0x00, 0x00, 0x00]); // little-endian, ASCII, IEEE
    pdu.extend_from_slice(&72u16.to_le_bytes()); // frag length
    pdu.extend_from_slice(&0u16.to_le_bytes()); // auth length
    pdu.extend_from_slice(&call_id.to_le_bytes());
    pdu.extend_from_slice(&5840u16.to_le_bytes()); // max xmit frag
    pdu.extend_from_slice(&5840u16.to_le_bytes()); // max recv frag
    pdu.extend_from_slice(&0u32.to_le_bytes()); // assoc group
    pdu.extend_from_slice(&[1, 0, 0, 0]); // one context item
    pdu.extend_from_slice(&0u16.to_le_bytes()); // context id
    pdu.extend_from_slice(&[1, 0]); // one transfer syntax
    pdu.extend_from_slice(&EPM_UUID);
    pdu.extend_from_slice(&3u16.to_le_bytes());
    pdu.extend_from_slice(&0u16.to_le_bytes());
    pdu.extend_from_slice(&NDR_UUID);
    pdu.extend_from_slice(&2u32.to_le_bytes());
    pdu
}

/// Reply to the Endpoint Mapper bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindReply {
    Ack,
    Nak,
    Other,
}

pub fn classify_bind_reply(reply: &[u8]) -> BindReply {
    match reply {
        [5, _, PTYPE_BIND_ACK, ..] => BindReply::Ack,
        [5, _, PTYPE_BIND_NAK, ..] => BindReply::Nak,
        _ => BindReply::Other,
    }
}

/// Verdict for one probed service: description plus the name suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub description: String,
    pub state: &'static str,
    pub positive: bool,
}

pub async fn probe_endpoint_mapper(ip: &str, port: u16, settings: &WindowsProbeSettings) -> Verdict {
    let reply = exchange(
        ip,
        port,
        &epm_bind_request(1),
        settings.max_response_bytes,
        settings.timeout(),
    )
    .await;
    endpoint_mapper_verdict(port, reply)
}

fn endpoint_mapper_verdict(port: u16, reply: Result<Vec<u8>, ProbeError>) -> Verdict {
    let reply = match reply {
        Ok(reply) => reply,
        Err(e) => {
            return Verdict {
                description: e.describe("MSRPC bind"),
                state: "Unknown Response",
                positive: false,
            };
        }
    };
    let (outcome, state, positive) = match classify_bind_reply(&reply) {
        BindReply::Ack => ("Bind ACK received", "Active", true),
        BindReply::Nak => ("Bind NAK received", "Non-ACK", false),
        BindReply::Other => ("Non-ACK response", "Non-ACK", false),
    };
    Verdict {
        description: format!(
            "MSRPC Endpoint Mapper (Port {}) - {}. Response: {}",
            port,
            outcome,
            hex_preview(&reply, 64)
        ),
        state,
        positive,
    }
}

pub async fn probe_smb_direct(ip: &str, port: u16, settings: &WindowsProbeSettings) -> Verdict {
    let reply = exchange(
        ip,
        port,
        &smb_negotiate_request(),
        settings.max_response_bytes,
        settings.timeout(),
    )
    .await;
    match reply {
        Ok(reply) => {
            let detected = smb_signature(&reply).is_some();
            let (outcome, state) = if detected {
                ("detected", "Active")
            } else {
                ("no SMB/MSRPC signature", "No Signature")
            };
            Verdict {
                description: format!(
                    "SMB/MSRPC (Port {}) {}. Response: {}",
                    port,
                    outcome,
                    hex_preview(&reply, 64)
                ),
                state,
                positive: detected,
            }
        }
        Err(e) => Verdict {
            description: e.describe("SMB negotiate"),
            state: "Unknown Response",
            positive: false,
        },
    }
}

/// Recover a verdict from a Description an earlier run stored.
fn stored_verdict(service: &Service) -> Verdict {
    let text = &service.description;
    let positive = if service.port == ENDPOINT_MAPPER_PORT {
        text.contains("Bind ACK")
    } else {
        text.contains(") detected")
    };
    let state = match (positive, service.port == ENDPOINT_MAPPER_PORT) {
        (true, _) => "Active",
        (false, true) => "Non-ACK",
        (false, false) => "No Signature",
    };
    Verdict {
        description: text.clone(),
        state,
        positive,
    }
}

fn label(port: u16, state: &str) -> String {
    if port == ENDPOINT_MAPPER_PORT {
        format!("MSRPC RPC Endpoint Mapper ({})", state)
    } else {
        format!("MSRPC SMB/RPC ({})", state)
    }
}

pub struct MsrpcStep {
    registry: Arc<HostRegistry>,
    settings: WindowsProbeSettings,
    state: StepState,
}

impl MsrpcStep {
    pub fn new(registry: Arc<HostRegistry>, settings: WindowsProbeSettings) -> Self {
        Self {
            registry,
            settings,
            state: StepState::default(),
        }
    }
}

impl ProbeStep for MsrpcStep {
    fn name(&self) -> &'static str {
        "MSRPC Info"
    }

    fn description(&self) -> &'static str {
        "Binds to the RPC Endpoint Mapper and negotiates SMB on hosts exposing ports 135/445."
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
            let hosts = registry.hosts_with_ports(&[ENDPOINT_MAPPER_PORT, SMB_DIRECT_PORT]);
            progress.set_message(format!("Probing MSRPC on {} hosts...", hosts.len()));

            let registry = &*registry;
            let settings = &settings;
            let log = &*progress;
            sweep(&progress, hosts, settings.concurrency, move |host: Host| async move {
                probe_host(registry, settings, log, host).await;
            })
            .await;

            progress.finish("MSRPC probing complete");
        });
    }

    fn progress(&self) -> &StepProgress {
        &self.state.progress
    }
}

async fn probe_host(
    registry: &HostRegistry,
    settings: &WindowsProbeSettings,
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
            .filter(|s| s.port == ENDPOINT_MAPPER_PORT || s.port == SMB_DIRECT_PORT)
            .collect();
        services.sort_by_key(|s| s.port);

        for service in services {
            let verdict = if service.needs_probe() {
                let verdict = if service.port == ENDPOINT_MAPPER_PORT {
                    probe_endpoint_mapper(ip, service.port, settings).await
                } else {
                    probe_smb_direct(ip, service.port, settings).await
                };
                registry.update_service(ip, service.port, service.protocol, |s| {
                    s.description = verdict.description.clone()
                });
                log.log(format!("{}:{} {}", ip, service.port, verdict.description));
                verdict
            } else {
                stored_verdict(service)
            };

            label_service(
                registry,
                ip,
                service.port,
                service.protocol,
                &label(service.port, verdict.state),
            );
            if verdict.positive {
                mark_windows(registry, ip);
            }
        }
    }
}
