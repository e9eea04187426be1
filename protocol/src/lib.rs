use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod codec;
mod error;
mod messages;

pub use codec::*;
pub use error::*;
pub use messages::*;

/// Vsock port the guest agent listens on when vsock is enabled.
pub const GUEST_AGENT_PORT: u32 = 5000;

/// Maximum frame size (16 MiB) to prevent unbounded allocations.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Bumped on incompatible wire changes; reported in capabilities.
pub const PROTOCOL_VERSION: u32 = 1;

/// One complete protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation token. Responses echo the request's id; events get a
    /// fresh one.
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl Envelope {
    /// A new request with a fresh id.
    pub fn request(payload: Payload) -> Self {
        Self::fresh(payload)
    }

    /// A new unsolicited event with a fresh id.
    pub fn event(payload: Payload) -> Self {
        Self::fresh(payload)
    }

    /// The response to `self`, carrying the same id.
    pub fn reply(&self, payload: Payload) -> Self {
        Self {
            message_id: self.message_id.clone(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn direction(&self) -> Direction {
        self.payload.direction()
    }

    fn fresh(payload: Payload) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // -----------------------------------------------------------------------
    // Envelope ids
    // -----------------------------------------------------------------------

    #[test]
    fn test_reply_keeps_message_id() {
        let req = Envelope::request(Payload::Ping(PingRequest { sequence: 1 }));
        let resp = req.reply(Payload::Ok);
        assert_eq!(resp.message_id, req.message_id);
        assert_eq!(resp.direction(), Direction::Response);
    }

    #[test]
    fn test_fresh_envelopes_get_distinct_ids() {
        let a = Envelope::event(Payload::Ok);
        let b = Envelope::event(Payload::Ok);
        assert_ne!(a.message_id, b.message_id);
        assert!(uuid::Uuid::parse_str(&a.message_id).is_ok());
    }

    // -----------------------------------------------------------------------
    // Payload wire format
    // -----------------------------------------------------------------------

    fn roundtrip(payload: &Payload) -> Payload {
        let json = serde_json::to_string(payload).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_unit_variants_roundtrip() {
        for p in [
            Payload::ClipboardGet,
            Payload::HardwareInfo,
            Payload::GetCapabilities,
            Payload::UpdateStatusQuery,
            Payload::Ok,
        ] {
            assert_eq!(roundtrip(&p), p);
        }
    }

    #[test]
    fn test_tag_is_type_field() {
        let json = serde_json::to_string(&Payload::Quiesce(QuiesceRequest {
            mount_points: vec!["/data".into()],
            timeout_secs: 30,
            run_scripts: false,
        }))
        .unwrap();
        assert!(json.contains(r#""type":"Quiesce""#));
        assert!(json.contains(r#""mount_points":["/data"]"#));
    }

    #[test]
    fn test_execute_defaults() {
        let json = r#"{"type":"Execute","command":"uptime"}"#;
        let p: Payload = serde_json::from_str(json).unwrap();
        if let Payload::Execute(e) = p {
            assert_eq!(e.timeout_secs, 60);
            assert!(e.wait_for_exit);
            assert!(e.args.is_empty());
            assert!(e.env.is_empty());
            assert!(e.run_as.is_none());
        } else {
            panic!("expected Execute variant");
        }
    }

    #[test]
    fn test_file_write_defaults() {
        let json = r#"{"type":"FileWrite","path":"/tmp/a","data":"aGk="}"#;
        let p: Payload = serde_json::from_str(json).unwrap();
        if let Payload::FileWrite(w) = p {
            assert!(w.create_parents);
            assert!(!w.append);
            assert!(w.offset.is_none());
        } else {
            panic!("expected FileWrite variant");
        }
    }

    #[test]
    fn test_network_config_defaults() {
        let json = r#"{"type":"ConfigureNetwork","address":"10.0.0.5/24"}"#;
        let p: Payload = serde_json::from_str(json).unwrap();
        if let Payload::ConfigureNetwork(n) = p {
            assert_eq!(n.interface, "eth0");
            assert_eq!(n.dns, vec!["1.1.1.1", "8.8.8.8"]);
            assert!(n.gateway.is_none());
        } else {
            panic!("expected ConfigureNetwork variant");
        }
    }

    #[test]
    fn test_process_kill_default_signal() {
        let json = r#"{"type":"ProcessKill","pid":42}"#;
        let p: Payload = serde_json::from_str(json).unwrap();
        if let Payload::ProcessKill(k) = p {
            assert_eq!(k.pid, 42);
            assert_eq!(k.signal, 15);
        } else {
            panic!("expected ProcessKill variant");
        }
    }

    #[test]
    fn test_service_action_is_snake_case() {
        let p = Payload::ServiceControl(ServiceControlRequest {
            name: "sshd.service".into(),
            action: ServiceAction::Restart,
        });
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains(r#""action":"restart""#));
        assert_eq!(roundtrip(&p), p);
    }

    #[test]
    fn test_update_state_is_tagged() {
        let state = UpdateState::Failed {
            reason: "checksum mismatch".into(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "checksum mismatch");
        assert_eq!(state.name(), "failed");
    }

    #[test]
    fn test_exec_env_roundtrip() {
        let mut env = HashMap::new();
        env.insert("FOO".into(), "bar".into());
        let p = Payload::Execute(ExecuteRequest {
            env,
            ..ExecuteRequest::shell("echo $FOO", 5)
        });
        assert_eq!(roundtrip(&p), p);
    }

    #[test]
    fn test_unknown_tag_fails_to_decode() {
        let json = r#"{"type":"Teleport","to":"mars"}"#;
        assert!(serde_json::from_str::<Payload>(json).is_err());
    }

    // -----------------------------------------------------------------------
    // Kind table
    // -----------------------------------------------------------------------

    #[test]
    fn test_kinds_match_variants() {
        let samples = vec![
            Payload::Ping(PingRequest::default()),
            Payload::ClipboardGet,
            Payload::HardwareInfo,
            Payload::GetCapabilities,
            Payload::UpdateStatusQuery,
            Payload::Ok,
            Payload::Thaw(ThawRequest::default()),
            Payload::SyncTime(SyncTimeRequest::default()),
            Payload::ProcessList(ProcessListRequest::default()),
            Payload::ServiceList(ServiceListRequest::default()),
            Payload::SoftwareList(SoftwareListRequest::default()),
            Payload::Shutdown(PowerRequest::default()),
            Payload::Reboot(PowerRequest::default()),
            Payload::ExecuteResult(ExecuteResponse::default()),
        ];
        for p in samples {
            assert!(Payload::is_known_kind(p.kind()), "{} missing from KINDS", p.kind());
            let json = serde_json::to_value(&p).unwrap();
            assert_eq!(json["type"], p.kind());
        }
        assert_eq!(Payload::KINDS.len(), 48);
    }

    #[test]
    fn test_directions() {
        assert_eq!(Payload::GetCapabilities.direction(), Direction::Request);
        assert_eq!(Payload::Ok.direction(), Direction::Response);
        assert_eq!(
            Payload::ClipboardChanged(ClipboardContent {
                content: "x".into(),
                mime_type: "text/plain".into(),
            })
            .direction(),
            Direction::Event
        );
    }
}
