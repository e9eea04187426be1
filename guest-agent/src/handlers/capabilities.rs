use std::collections::BTreeMap;

use guestlink_protocol::{CapabilitiesResponse, Payload, PROTOCOL_VERSION};

use super::{HandlerContext, HandlerResult};

/// Capability names, one per independently usable request family.
pub const CAPABILITIES: &[&str] = &[
    "ping",
    "execute",
    "file_read",
    "file_write",
    "file_delete",
    "file_stat",
    "directory_list",
    "directory_create",
    "shutdown",
    "reboot",
    "reset_password",
    "configure_network",
    "quiesce",
    "thaw",
    "sync_time",
    "display_resize",
    "clipboard",
    "process_list",
    "process_kill",
    "service_list",
    "service_control",
    "hardware_info",
    "software_list",
    "self_update",
    "telemetry",
];

/// Build the capability set once at startup.
pub fn detect() -> CapabilitiesResponse {
    let linux = cfg!(target_os = "linux");
    let features = BTreeMap::from([
        ("user_context_exec".to_string(), linux),
        ("fsfreeze".to_string(), linux),
        ("vss_quiesce".to_string(), cfg!(windows)),
        ("display_resize".to_string(), linux),
        ("self_update".to_string(), true),
        ("vsock".to_string(), linux),
    ]);
    CapabilitiesResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        capabilities: CAPABILITIES.iter().map(|s| s.to_string()).collect(),
        features,
    }
}

pub async fn get(ctx: &HandlerContext) -> HandlerResult {
    Ok(Payload::Capabilities(ctx.capabilities.clone()))
}
