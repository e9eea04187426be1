//! Process inspection and signalling, plus systemd service control.

use guestlink_protocol::{
    ErrorCode, ErrorResponse, Payload, ProcessInfo, ProcessKillRequest, ProcessListRequest,
    ProcessListResponse, ServiceAction, ServiceControlRequest, ServiceInfo, ServiceListRequest,
    ServiceListResponse,
};
use sysinfo::System;
use tracing::info;

use super::{HandlerContext, HandlerResult};

pub async fn list(_ctx: &HandlerContext, req: ProcessListRequest) -> HandlerResult {
    let filter = req.name_filter.map(|f| f.to_lowercase());
    let processes = tokio::task::spawn_blocking(move || snapshot(filter.as_deref()))
        .await
        .map_err(|e| ErrorResponse::new(ErrorCode::InternalError, e.to_string()))?;
    Ok(Payload::ProcessListing(ProcessListResponse { processes }))
}

fn snapshot(filter: Option<&str>) -> Vec<ProcessInfo> {
    let mut sys = System::new();
    sys.refresh_processes();

    let mut processes: Vec<ProcessInfo> = sys
        .processes()
        .values()
        .filter(|p| filter.map_or(true, |f| p.name().to_lowercase().contains(f)))
        .map(|p| ProcessInfo {
            pid: p.pid().as_u32(),
            parent_pid: p.parent().map(|pp| pp.as_u32()),
            name: p.name().to_string(),
            command: p.cmd().to_vec(),
            user_id: p.user_id().map(|uid| **uid),
            memory_bytes: p.memory(),
            cpu_percent: p.cpu_usage(),
            status: p.status().to_string(),
            start_time: p.start_time(),
        })
        .collect();
    processes.sort_by_key(|p| p.pid);
    processes
}

pub async fn kill(_ctx: &HandlerContext, req: ProcessKillRequest) -> HandlerResult {
    if !(1..=64).contains(&req.signal) {
        return Err(ErrorResponse::new(
            ErrorCode::InvalidSignal,
            format!("signal {} out of range", req.signal),
        ));
    }
    // pid 0 and negative values address process groups; 1 is init.
    let pid = match i32::try_from(req.pid) {
        Ok(pid) if pid > 1 => pid,
        _ => {
            return Err(ErrorResponse::new(
                ErrorCode::KillFailed,
                format!("refusing to signal pid {}", req.pid),
            ))
        }
    };

    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, req.signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        let code = match err.raw_os_error() {
            Some(libc::ESRCH) => ErrorCode::ProcessNotFound,
            Some(libc::EPERM) => ErrorCode::PermissionDenied,
            _ => ErrorCode::KillFailed,
        };
        return Err(ErrorResponse::new(code, err.to_string()).with_context(pid.to_string()));
    }
    info!(pid, signal = req.signal, "signal sent");
    Ok(Payload::Ok)
}

pub async fn service_list(ctx: &HandlerContext, req: ServiceListRequest) -> HandlerResult {
    let mut services = ctx.platform.list_services().await?;
    if let Some(pattern) = req.pattern {
        let pattern = pattern.to_lowercase();
        services.retain(|s| s.name.to_lowercase().contains(&pattern));
    }
    Ok(Payload::ServiceListing(ServiceListResponse { services }))
}

pub async fn service_control(ctx: &HandlerContext, req: ServiceControlRequest) -> HandlerResult {
    let unit = normalize_unit(&req.name)?;
    if req.action == ServiceAction::Status {
        let status = ctx.platform.service_status(&unit).await?;
        return Ok(Payload::ServiceStatus(status));
    }
    ctx.platform.control_service(&unit, req.action).await?;
    info!(unit = %unit, action = req.action.as_str(), "service action applied");
    Ok(Payload::Ok)
}

/// Validate a unit name and add the `.service` suffix when no unit type is
/// given.
pub fn normalize_unit(name: &str) -> Result<String, ErrorResponse> {
    let valid = !name.is_empty()
        && name.len() <= 256
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':' | '\\'));
    if !valid {
        return Err(ErrorResponse::new(
            ErrorCode::InvalidServiceName,
            format!("invalid service name: {name:?}"),
        ));
    }
    const UNIT_TYPES: &[&str] = &[".service", ".socket", ".timer", ".target", ".mount", ".path"];
    if UNIT_TYPES.iter().any(|t| name.ends_with(t)) {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}.service"))
    }
}

/// Parse `systemctl list-units --plain --no-legend` output.
pub fn parse_list_units(output: &str) -> Vec<ServiceInfo> {
    output
        .lines()
        .filter_map(|line| {
            // Failed units are prefixed with a marker even in plain mode.
            let line = line.trim_start_matches(['●', '*', ' ']);
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let load_state = parts.next()?;
            let active_state = parts.next()?;
            let sub_state = parts.next()?;
            let description = parts.collect::<Vec<_>>().join(" ");
            Some(ServiceInfo {
                name: name.to_string(),
                load_state: load_state.to_string(),
                active_state: active_state.to_string(),
                sub_state: sub_state.to_string(),
                description,
            })
        })
        .collect()
}

/// Parse `systemctl show --property=...` key=value output.
pub fn parse_show(unit: &str, output: &str) -> ServiceInfo {
    let mut info = ServiceInfo {
        name: unit.to_string(),
        load_state: String::new(),
        active_state: String::new(),
        sub_state: String::new(),
        description: String::new(),
    };
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.to_string();
        match key {
            "LoadState" => info.load_state = value,
            "ActiveState" => info.active_state = value,
            "SubState" => info.sub_state = value,
            "Description" => info.description = value,
            _ => {}
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::handlers::platform::fake::RecordingPlatform;
    use crate::handlers::test_support::{context, context_with};

    fn svc(name: &str, active: &str) -> ServiceInfo {
        ServiceInfo {
            name: name.into(),
            load_state: "loaded".into(),
            active_state: active.into(),
            sub_state: "running".into(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_lists_own_process() {
        let (ctx, _) = context();
        let me = std::process::id();
        match list(&ctx, ProcessListRequest::default()).await.unwrap() {
            Payload::ProcessListing(l) => {
                assert!(l.processes.iter().any(|p| p.pid == me));
                assert!(l.processes.windows(2).all(|w| w[0].pid < w[1].pid));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_name_filter_applies() {
        let (ctx, _) = context();
        let req = ProcessListRequest {
            name_filter: Some("no-such-process-name-xyz".into()),
        };
        match list(&ctx, req).await.unwrap() {
            Payload::ProcessListing(l) => assert!(l.processes.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_kill_child_and_missing_pid() {
        let (ctx, _) = context();
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        kill(&ctx, ProcessKillRequest { pid, signal: 9 }).await.unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());

        // Reaped, so the pid is gone.
        let err = kill(&ctx, ProcessKillRequest { pid, signal: 9 }).await.unwrap_err();
        assert!(err.is(ErrorCode::ProcessNotFound));
    }

    #[tokio::test]
    async fn test_kill_validation() {
        let (ctx, _) = context();
        let err = kill(&ctx, ProcessKillRequest { pid: 1234, signal: 0 }).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidSignal));
        let err = kill(&ctx, ProcessKillRequest { pid: 1, signal: 15 }).await.unwrap_err();
        assert!(err.is(ErrorCode::KillFailed));
        let err = kill(&ctx, ProcessKillRequest { pid: u32::MAX, signal: 15 }).await.unwrap_err();
        assert!(err.is(ErrorCode::KillFailed));
    }

    #[test]
    fn test_unit_names() {
        assert_eq!(normalize_unit("nginx").unwrap(), "nginx.service");
        assert_eq!(normalize_unit("getty@tty1.service").unwrap(), "getty@tty1.service");
        assert_eq!(normalize_unit("fstrim.timer").unwrap(), "fstrim.timer");
        for bad in ["", "-x", "a b", "x;reboot", "../etc"] {
            assert!(
                normalize_unit(bad).unwrap_err().is(ErrorCode::InvalidServiceName),
                "{bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_service_control_paths() {
        let (ctx, platform) = context_with(
            AgentConfig::default(),
            RecordingPlatform {
                services: vec![svc("sshd.service", "active")],
                ..Default::default()
            },
        );
        service_control(
            &ctx,
            ServiceControlRequest {
                name: "sshd".into(),
                action: ServiceAction::Restart,
            },
        )
        .await
        .unwrap();
        assert_eq!(platform.calls(), vec!["service restart sshd.service"]);

        match service_control(
            &ctx,
            ServiceControlRequest {
                name: "sshd".into(),
                action: ServiceAction::Status,
            },
        )
        .await
        .unwrap()
        {
            Payload::ServiceStatus(s) => assert_eq!(s.active_state, "active"),
            other => panic!("unexpected {other:?}"),
        }

        let err = service_control(
            &ctx,
            ServiceControlRequest {
                name: "x y".into(),
                action: ServiceAction::Stop,
            },
        )
        .await
        .unwrap_err();
        assert!(err.is(ErrorCode::InvalidServiceName));
    }

    #[tokio::test]
    async fn test_service_list_filters() {
        let (ctx, _) = context_with(
            AgentConfig::default(),
            RecordingPlatform {
                services: vec![svc("sshd.service", "active"), svc("cron.service", "active")],
                ..Default::default()
            },
        );
        let req = ServiceListRequest {
            pattern: Some("SSH".into()),
        };
        match service_list(&ctx, req).await.unwrap() {
            Payload::ServiceListing(l) => {
                assert_eq!(l.services.len(), 1);
                assert_eq!(l.services[0].name, "sshd.service");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_list_units_parsing() {
        let out = "\
cron.service        loaded active running Regular background program processing daemon
● nginx.service     loaded failed failed  A high performance web server
ssh.service         loaded active running OpenBSD Secure Shell server
";
        let units = parse_list_units(out);
        assert_eq!(units.len(), 3);
        assert_eq!(units[1].name, "nginx.service");
        assert_eq!(units[1].active_state, "failed");
        assert_eq!(units[2].description, "OpenBSD Secure Shell server");
    }

    #[test]
    fn test_show_parsing() {
        let out = "LoadState=loaded\nActiveState=inactive\nSubState=dead\nDescription=The thing=1\n";
        let info = parse_show("x.service", out);
        assert_eq!(info.active_state, "inactive");
        assert_eq!(info.sub_state, "dead");
        assert_eq!(info.description, "The thing=1");
    }
}
