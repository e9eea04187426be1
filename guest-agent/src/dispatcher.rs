//! Routes one request envelope to exactly one handler.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use guestlink_protocol::{Envelope, ErrorCode, ErrorResponse, Payload, PongResponse, PowerRequest};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::handlers::lifecycle::{self, PowerPlan};
use crate::handlers::platform::PowerAction;
use crate::handlers::{
    capabilities, desktop, directory, exec, file, inventory, process, timesync, HandlerContext,
    HandlerResult,
};
use crate::security::{AuditOutcome, AuditRecord, Operation, SecurityPolicy};
use crate::update::UpdateCoordinator;

/// Work that must wait until the response has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    Power(PowerPlan),
}

pub struct Dispatcher {
    ctx: Arc<HandlerContext>,
    policy: SecurityPolicy,
    update: Mutex<UpdateCoordinator>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<HandlerContext>, policy: SecurityPolicy) -> Self {
        let update = UpdateCoordinator::new(ctx.config.update.clone());
        Self {
            ctx,
            policy,
            update: Mutex::new(update),
        }
    }

    pub async fn dispatch(&self, request: Envelope) -> Envelope {
        self.dispatch_with_followup(request).await.0
    }

    /// Evaluate policy, run the handler and build the response. The
    /// followup, if any, must be passed to [`run_followup`](Self::run_followup)
    /// after the response is on the wire.
    pub async fn dispatch_with_followup(&self, request: Envelope) -> (Envelope, Option<Followup>) {
        let started = Instant::now();
        let kind = request.payload.kind();
        debug!(message_id = %request.message_id, kind, "dispatching");

        let op = classify(&request.payload);
        let subject = op.subject().map(str::to_owned);
        let Envelope {
            message_id,
            payload,
            ..
        } = request;

        let (result, followup, outcome) = match self.policy.evaluate(&op) {
            Ok(()) => {
                let (result, followup) = self.route(payload).await;
                (result, followup, AuditOutcome::Allowed)
            }
            Err(denied) => {
                warn!(message_id = %message_id, kind, code = denied.code, "request denied by policy");
                let outcome = AuditOutcome::Denied {
                    code: denied.code,
                    name: denied.name.clone(),
                };
                (Err(denied), None, outcome)
            }
        };

        self.policy.audit(AuditRecord {
            timestamp: Utc::now(),
            operation: kind.to_string(),
            source: message_id.clone(),
            subject,
            outcome,
            duration_us: started.elapsed().as_micros() as u64,
        });

        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                debug!(message_id = %message_id, kind, code = e.code, error = %e.message, "request failed");
                Payload::Error(e)
            }
        };
        let response = Envelope {
            message_id,
            timestamp: Utc::now(),
            payload,
        };
        (response, followup)
    }

    pub async fn run_followup(&self, followup: Followup) {
        match followup {
            Followup::Power(plan) => {
                lifecycle::run_power_plan(self.ctx.platform.as_ref(), plan).await
            }
        }
    }

    async fn route(&self, payload: Payload) -> (HandlerResult, Option<Followup>) {
        let ctx = self.ctx.as_ref();
        let result = match payload {
            Payload::Ping(req) => Ok(Payload::Pong(PongResponse {
                sequence: req.sequence,
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: ctx.uptime_secs(),
            })),
            Payload::Execute(req) => exec::execute(ctx, req).await,
            Payload::FileRead(req) => file::read(ctx, req).await,
            Payload::FileWrite(req) => file::write(ctx, req).await,
            Payload::FileDelete(req) => file::delete(ctx, req).await,
            Payload::FileStat(req) => file::stat(ctx, req).await,
            Payload::DirectoryList(req) => directory::list(ctx, req).await,
            Payload::DirectoryCreate(req) => file::create_directory(ctx, req).await,
            Payload::Shutdown(req) => {
                let (result, plan) = lifecycle::plan_power(PowerAction::Poweroff, req);
                return (result, Some(Followup::Power(plan)));
            }
            Payload::Reboot(req) => {
                let (result, plan) = lifecycle::plan_power(PowerAction::Reboot, req);
                return (result, Some(Followup::Power(plan)));
            }
            Payload::ResetPassword(req) => lifecycle::reset_password(ctx, req).await,
            Payload::ConfigureNetwork(req) => lifecycle::configure_network(ctx, req).await,
            Payload::Quiesce(req) => ctx.quiesce.freeze(req).await,
            Payload::Thaw(req) => ctx.quiesce.thaw(req).await,
            Payload::SyncTime(req) => timesync::sync_time(ctx, req).await,
            Payload::DisplayResize(req) => desktop::resize(ctx, req).await,
            Payload::ClipboardGet => desktop::clipboard_get(ctx).await,
            Payload::ClipboardSet(req) => desktop::clipboard_set(ctx, req).await,
            Payload::ProcessList(req) => process::list(ctx, req).await,
            Payload::ProcessKill(req) => process::kill(ctx, req).await,
            Payload::ServiceList(req) => process::service_list(ctx, req).await,
            Payload::ServiceControl(req) => process::service_control(ctx, req).await,
            Payload::HardwareInfo => inventory::hardware(ctx).await,
            Payload::SoftwareList(req) => inventory::software(ctx, req).await,
            Payload::GetCapabilities => capabilities::get(ctx).await,
            Payload::UpdateChunk(req) => self.update.lock().await.handle_chunk(req).await,
            Payload::UpdateStatusQuery => {
                Ok(Payload::UpdateStatus(self.update.lock().await.status()))
            }

            not_a_request @ (Payload::Pong(_)
            | Payload::ExecuteResult(_)
            | Payload::FileContent(_)
            | Payload::FileInfo(_)
            | Payload::DirectoryListing(_)
            | Payload::Ok
            | Payload::Error(_)
            | Payload::QuiesceResult(_)
            | Payload::ThawResult(_)
            | Payload::TimeSyncResult(_)
            | Payload::Clipboard(_)
            | Payload::ProcessListing(_)
            | Payload::ServiceListing(_)
            | Payload::ServiceStatus(_)
            | Payload::Hardware(_)
            | Payload::Software(_)
            | Payload::Capabilities(_)
            | Payload::UpdateStatus(_)
            | Payload::AgentReady(_)
            | Payload::Telemetry(_)
            | Payload::ClipboardChanged(_)) => Err(ErrorResponse::new(
                ErrorCode::UnknownMessageType,
                format!("{} is not a request", not_a_request.kind()),
            )),
        };
        (result, None)
    }
}

/// Map a payload to what the security policy needs to judge it.
pub fn classify(payload: &Payload) -> Operation {
    match payload {
        Payload::Execute(req) => {
            let (program, command_line) = if req.args.is_empty() {
                let program = req
                    .command
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                (program, req.command.clone())
            } else {
                let mut line = req.command.clone();
                for arg in &req.args {
                    line.push(' ');
                    line.push_str(arg);
                }
                (req.command.clone(), line)
            };
            Operation::Command {
                program,
                command_line,
            }
        }
        Payload::FileRead(req) => Operation::PathRead(req.path.clone()),
        Payload::FileStat(req) => Operation::PathRead(req.path.clone()),
        Payload::DirectoryList(req) => Operation::PathRead(req.path.clone()),
        Payload::FileWrite(req) => Operation::PathWrite(req.path.clone()),
        Payload::FileDelete(req) => Operation::PathWrite(req.path.clone()),
        Payload::DirectoryCreate(req) => Operation::PathWrite(req.path.clone()),

        Payload::Shutdown(req) => privileged("poweroff", power_action("poweroff", req)),
        Payload::Reboot(req) => privileged("reboot", power_action("reboot", req)),
        Payload::ResetPassword(req) => {
            privileged("chpasswd", format!("reset password for {}", req.username))
        }
        Payload::ConfigureNetwork(req) => {
            privileged("ip", format!("configure {} as {}", req.interface, req.address))
        }
        Payload::Quiesce(req) => privileged(
            "fsfreeze",
            if req.mount_points.is_empty() {
                "freeze all writable filesystems".to_string()
            } else {
                format!("freeze {}", req.mount_points.join(" "))
            },
        ),
        Payload::Thaw(_) => privileged("fsfreeze", "thaw".to_string()),
        Payload::SyncTime(req) => privileged(
            "date",
            match req.time {
                Some(t) => format!("set clock to {}", t.to_rfc3339()),
                None => "step clock from time source".to_string(),
            },
        ),
        Payload::DisplayResize(req) => {
            privileged("xrandr", format!("resize to {}x{}", req.width, req.height))
        }
        Payload::ClipboardSet(req) => {
            privileged("xclip", format!("set clipboard ({} bytes)", req.content.len()))
        }
        Payload::ProcessKill(req) => {
            privileged("kill", format!("signal {} to pid {}", req.signal, req.pid))
        }
        Payload::ServiceControl(req) => privileged(
            "systemctl",
            format!("{} {}", req.action.as_str(), req.name),
        ),
        Payload::UpdateChunk(req) => privileged(
            "update",
            format!(
                "update {} chunk {}/{}",
                req.version,
                req.sequence + 1,
                req.total_chunks
            ),
        ),

        Payload::Ping(_)
        | Payload::ClipboardGet
        | Payload::ProcessList(_)
        | Payload::ServiceList(_)
        | Payload::HardwareInfo
        | Payload::SoftwareList(_)
        | Payload::GetCapabilities
        | Payload::UpdateStatusQuery => Operation::Unrestricted,

        // Rejected by the router; still audited as a decision.
        Payload::Pong(_)
        | Payload::ExecuteResult(_)
        | Payload::FileContent(_)
        | Payload::FileInfo(_)
        | Payload::DirectoryListing(_)
        | Payload::Ok
        | Payload::Error(_)
        | Payload::QuiesceResult(_)
        | Payload::ThawResult(_)
        | Payload::TimeSyncResult(_)
        | Payload::Clipboard(_)
        | Payload::ProcessListing(_)
        | Payload::ServiceListing(_)
        | Payload::ServiceStatus(_)
        | Payload::Hardware(_)
        | Payload::Software(_)
        | Payload::Capabilities(_)
        | Payload::UpdateStatus(_)
        | Payload::AgentReady(_)
        | Payload::Telemetry(_)
        | Payload::ClipboardChanged(_) => Operation::Unrestricted,
    }
}

fn privileged(tool: &'static str, action: String) -> Operation {
    Operation::Privileged { tool, action }
}

fn power_action(verb: &str, req: &PowerRequest) -> String {
    let mut action = format!("{verb} in {}s", req.delay_secs);
    if req.force {
        action.push_str(" (forced)");
    }
    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::handlers::platform::fake::RecordingPlatform;
    use crate::handlers::test_support::context_with;
    use crate::security::MemoryAuditSink;
    use guestlink_protocol::{
        ExecuteRequest, FileReadRequest, PingRequest, ProcessKillRequest, ResetPasswordRequest,
        ServiceAction, ServiceControlRequest, ThawRequest,
    };

    fn dispatcher_with(config: AgentConfig) -> (Dispatcher, Arc<RecordingPlatform>, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::default());
        let policy = SecurityPolicy::new(config.security.clone(), sink.clone());
        let (ctx, platform) = context_with(config, RecordingPlatform::default());
        (Dispatcher::new(Arc::new(ctx), policy), platform, sink)
    }

    fn dispatcher() -> (Dispatcher, Arc<RecordingPlatform>, Arc<MemoryAuditSink>) {
        dispatcher_with(AgentConfig::default())
    }

    fn error_of(env: &Envelope) -> &ErrorResponse {
        match &env.payload {
            Payload::Error(e) => e,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_echoes_message_id() {
        let (d, _, _) = dispatcher();
        let req = Envelope::request(Payload::Ping(PingRequest { sequence: 7 }));
        let resp = d.dispatch(req.clone()).await;
        assert_eq!(resp.message_id, req.message_id);
        match resp.payload {
            Payload::Pong(p) => {
                assert_eq!(p.sequence, 7);
                assert_eq!(p.version, env!("CARGO_PKG_VERSION"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_runs_and_is_audited() {
        let (d, _, sink) = dispatcher();
        let req = Envelope::request(Payload::Execute(ExecuteRequest::shell("true", 5)));
        let resp = d.dispatch(req.clone()).await;
        match resp.payload {
            Payload::ExecuteResult(r) => assert_eq!(r.exit_code, Some(0)),
            other => panic!("unexpected {other:?}"),
        }
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, "Execute");
        assert_eq!(records[0].source, req.message_id);
        assert_eq!(records[0].outcome, AuditOutcome::Allowed);
    }

    #[tokio::test]
    async fn test_denied_command_is_rejected_and_audited() {
        let mut config = AgentConfig::default();
        config.security.command_denylist = vec!["shutdown".into()];
        let (d, _, sink) = dispatcher_with(config);
        let req = Envelope::request(Payload::Execute(ExecuteRequest::shell("shutdown -h now", 5)));
        let resp = d.dispatch(req).await;
        assert!(error_of(&resp).is(ErrorCode::CommandNotAllowed));
        let records = sink.records();
        assert!(matches!(records[0].outcome, AuditOutcome::Denied { .. }));
        assert_eq!(records[0].subject.as_deref(), Some("shutdown -h now"));
    }

    #[tokio::test]
    async fn test_traversal_blocked_before_handler() {
        let (d, _, sink) = dispatcher();
        let req = Envelope::request(Payload::FileRead(FileReadRequest {
            path: "/tmp/../etc/passwd".into(),
            offset: 0,
            length: None,
        }));
        let resp = d.dispatch(req).await;
        assert!(error_of(&resp).is(ErrorCode::PathTraversalBlocked));
        assert!(matches!(sink.records()[0].outcome, AuditOutcome::Denied { code: 4007, .. }));
    }

    #[tokio::test]
    async fn test_responses_from_host_are_rejected() {
        let (d, _, sink) = dispatcher();
        for payload in [Payload::Ok, Payload::ClipboardChanged(guestlink_protocol::ClipboardContent {
            content: "x".into(),
            mime_type: "text/plain".into(),
        })] {
            let resp = d.dispatch(Envelope::request(payload)).await;
            assert!(error_of(&resp).is(ErrorCode::UnknownMessageType));
        }
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, "Ok");
    }

    #[tokio::test]
    async fn test_privileged_requests_are_limited_and_audited() {
        let mut config = AgentConfig::default();
        config.security.max_commands_per_minute = 1;
        let (d, platform, sink) = dispatcher_with(config);
        let stop = || {
            Envelope::request(Payload::ServiceControl(ServiceControlRequest {
                name: "sshd".into(),
                action: ServiceAction::Stop,
            }))
        };

        assert!(!matches!(d.dispatch(stop()).await.payload, Payload::Error(_)));
        for _ in 0..2 {
            let resp = d.dispatch(stop()).await;
            assert!(error_of(&resp).is(ErrorCode::RateLimitExceeded));
        }
        let reset = d
            .dispatch(Envelope::request(Payload::ResetPassword(ResetPasswordRequest {
                username: "root".into(),
                password: "hunter2".into(),
            })))
            .await;
        assert!(error_of(&reset).is(ErrorCode::RateLimitExceeded));
        assert_eq!(platform.calls().len(), 1);

        let records = sink.records();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].operation, "ServiceControl");
        assert_eq!(records[0].subject.as_deref(), Some("stop sshd"));
        assert_eq!(records[0].outcome, AuditOutcome::Allowed);
        assert!(records[1..]
            .iter()
            .all(|r| matches!(r.outcome, AuditOutcome::Denied { .. })));
        assert_eq!(records[3].operation, "ResetPassword");
        assert!(!records[3].subject.as_deref().unwrap_or_default().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_privileged_tools_follow_deny_list() {
        let mut config = AgentConfig::default();
        config.security.command_denylist = vec!["systemctl".into(), "chpasswd".into()];
        let (d, platform, sink) = dispatcher_with(config);
        let stop = d
            .dispatch(Envelope::request(Payload::ServiceControl(ServiceControlRequest {
                name: "sshd".into(),
                action: ServiceAction::Stop,
            })))
            .await;
        assert!(error_of(&stop).is(ErrorCode::CommandNotAllowed));
        let reset = d
            .dispatch(Envelope::request(Payload::ResetPassword(ResetPasswordRequest {
                username: "root".into(),
                password: "pw".into(),
            })))
            .await;
        assert!(error_of(&reset).is(ErrorCode::CommandNotAllowed));
        assert!(platform.calls().is_empty());
        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test]
    async fn test_handler_errors_become_error_payloads() {
        let (d, _, _) = dispatcher();
        let resp = d
            .dispatch(Envelope::request(Payload::Thaw(ThawRequest::default())))
            .await;
        assert!(error_of(&resp).is(ErrorCode::NotQuiesced));
    }

    #[tokio::test]
    async fn test_power_runs_only_as_followup() {
        let (d, platform, _) = dispatcher();
        let (resp, followup) = d
            .dispatch_with_followup(Envelope::request(Payload::Reboot(PowerRequest::default())))
            .await;
        assert_eq!(resp.payload, Payload::Ok);
        assert!(platform.calls().is_empty());

        d.run_followup(followup.expect("reboot has a followup")).await;
        assert_eq!(platform.calls(), vec!["power Reboot force=false"]);
    }

    #[tokio::test]
    async fn test_update_status_query() {
        let (d, _, _) = dispatcher();
        let resp = d.dispatch(Envelope::request(Payload::UpdateStatusQuery)).await;
        match resp.payload {
            Payload::UpdateStatus(s) => {
                assert_eq!(s.state, guestlink_protocol::UpdateState::Idle)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classification() {
        let direct = Payload::Execute(ExecuteRequest {
            args: vec!["-la".into(), "/tmp".into()],
            ..ExecuteRequest::shell("/bin/ls", 5)
        });
        assert_eq!(
            classify(&direct),
            Operation::Command {
                program: "/bin/ls".into(),
                command_line: "/bin/ls -la /tmp".into()
            }
        );
        let shell = Payload::Execute(ExecuteRequest::shell("  echo hi | wc", 5));
        match classify(&shell) {
            Operation::Command { program, .. } => assert_eq!(program, "echo"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(classify(&Payload::HardwareInfo), Operation::Unrestricted);
        assert_eq!(
            classify(&Payload::ProcessKill(ProcessKillRequest { pid: 42, signal: 9 })),
            Operation::Privileged {
                tool: "kill",
                action: "signal 9 to pid 42".into()
            }
        );
        match classify(&Payload::Shutdown(PowerRequest {
            delay_secs: 30,
            message: None,
            force: true,
        })) {
            Operation::Privileged { tool, action } => {
                assert_eq!(tool, "poweroff");
                assert_eq!(action, "poweroff in 30s (forced)");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
