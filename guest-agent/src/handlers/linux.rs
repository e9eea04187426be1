//! [`Platform`] backed by standard Linux userland tools.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guestlink_protocol::{
    ErrorCode, ErrorResponse, NetworkConfig, ServiceAction, ServiceInfo, SoftwarePackage,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::desktop::{detect_display_server, parse_xrandr_primary, X11_SOCKET_DIR};
use super::inventory::parse_package_lines;
use super::platform::{DisplayServer, Platform, PowerAction};
use super::process::{parse_list_units, parse_show};
use super::quiesce::parse_writable_mounts;

/// Upper bound for any single helper invocation.
const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

const RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Debug, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

/// Run a tool to completion and return its stdout. A non-zero exit becomes
/// `code` with stderr as the message.
async fn run(cmd: &mut Command, code: ErrorCode) -> Result<String, ErrorResponse> {
    run_with_input(cmd, None, code).await
}

async fn run_with_input(
    cmd: &mut Command,
    input: Option<&[u8]>,
    code: ErrorCode,
) -> Result<String, ErrorResponse> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        let msg = if e.kind() == std::io::ErrorKind::NotFound {
            format!("{program} is not installed")
        } else {
            format!("failed to start {program}: {e}")
        };
        ErrorResponse::new(code, msg)
    })?;

    if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(data)
            .await
            .map_err(|e| ErrorResponse::new(code, format!("writing to {program}: {e}")))?;
    }

    let output = tokio::time::timeout(TOOL_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| ErrorResponse::new(code, format!("{program} timed out")))?
        .map_err(|e| ErrorResponse::new(code, format!("waiting for {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ErrorResponse::new(
            code,
            format!("{program} exited with {}: {}", output.status, stderr.trim()),
        ));
    }
    debug!(program = %program, "tool succeeded");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn display_command(program: &str, server: &DisplayServer) -> Command {
    let mut cmd = Command::new(program);
    match server {
        DisplayServer::X11 { display } => cmd.env("DISPLAY", display),
        DisplayServer::Wayland { socket } => cmd.env("WAYLAND_DISPLAY", socket),
    };
    cmd
}

#[async_trait]
impl Platform for LinuxPlatform {
    async fn power(
        &self,
        action: PowerAction,
        force: bool,
        message: Option<&str>,
    ) -> Result<(), ErrorResponse> {
        if let Some(message) = message.filter(|m| !m.is_empty()) {
            if let Err(e) = run(Command::new("wall").arg(message), action.failure_code()).await {
                warn!(error = %e, "wall broadcast failed");
            }
        }
        let program = match action {
            PowerAction::Poweroff => "poweroff",
            PowerAction::Reboot => "reboot",
        };
        let mut cmd = Command::new(program);
        if force {
            cmd.arg("-f");
        }
        run(&mut cmd, action.failure_code()).await.map(|_| ())
    }

    async fn set_password(&self, username: &str, password: &str) -> Result<(), ErrorResponse> {
        let line = format!("{username}:{password}\n");
        run_with_input(
            &mut Command::new("chpasswd"),
            Some(line.as_bytes()),
            ErrorCode::PasswordResetFailed,
        )
        .await
        .map(|_| ())
    }

    async fn configure_network(&self, config: &NetworkConfig) -> Result<(), ErrorResponse> {
        let code = ErrorCode::NetworkConfigFailed;
        let dev = config.interface.as_str();

        run(Command::new("ip").args(["addr", "flush", "dev", dev]), code).await?;
        run(
            Command::new("ip").args(["addr", "add", config.address.as_str(), "dev", dev]),
            code,
        )
        .await?;
        if let Some(mtu) = config.mtu {
            let mtu = mtu.to_string();
            run(
                Command::new("ip").args(["link", "set", "dev", dev, "mtu", mtu.as_str()]),
                code,
            )
            .await?;
        }
        run(Command::new("ip").args(["link", "set", "dev", dev, "up"]), code).await?;
        if let Some(gw) = &config.gateway {
            run(
                Command::new("ip").args(["route", "replace", "default", "via", gw.as_str(), "dev", dev]),
                code,
            )
            .await?;
        }

        if !config.dns.is_empty() {
            let mut resolv = String::from("# Generated by guestlink-agent\n");
            for server in &config.dns {
                resolv.push_str(&format!("nameserver {server}\n"));
            }
            tokio::fs::write(RESOLV_CONF, resolv)
                .await
                .map_err(|e| ErrorResponse::new(code, format!("writing {RESOLV_CONF}: {e}")))?;
        }
        Ok(())
    }

    async fn writable_mounts(&self) -> Result<Vec<String>, ErrorResponse> {
        let contents = tokio::fs::read_to_string("/proc/mounts")
            .await
            .map_err(|e| ErrorResponse::new(ErrorCode::QuiesceFailed, format!("reading /proc/mounts: {e}")))?;
        Ok(parse_writable_mounts(&contents))
    }

    async fn freeze(&self, mount_point: &str) -> Result<(), ErrorResponse> {
        run(Command::new("fsfreeze").args(["-f", mount_point]), ErrorCode::QuiesceFailed)
            .await
            .map(|_| ())
    }

    async fn thaw(&self, mount_point: &str) -> Result<(), ErrorResponse> {
        run(Command::new("fsfreeze").args(["-u", mount_point]), ErrorCode::ThawFailed)
            .await
            .map(|_| ())
    }

    async fn set_clock(&self, time: Option<DateTime<Utc>>) -> Result<String, ErrorResponse> {
        let code = ErrorCode::TimeSyncFailed;
        if let Some(time) = time {
            let stamp = time.format("%Y-%m-%d %H:%M:%S").to_string();
            run(Command::new("date").args(["-u", "-s", stamp.as_str()]), code).await?;
            if let Err(e) = run(Command::new("hwclock").arg("--systohc"), code).await {
                debug!(error = %e, "hardware clock not updated");
            }
            return Ok("manual".to_string());
        }

        let sources: [(&str, &[&str]); 3] = [
            ("chronyc", &["makestep"]),
            ("ntpdate", &["-u", "pool.ntp.org"]),
            ("hwclock", &["--hctosys"]),
        ];
        let mut failures = Vec::new();
        for (program, args) in sources {
            match run(Command::new(program).args(args), code).await {
                Ok(_) => return Ok(program.to_string()),
                Err(e) => {
                    debug!(program, error = %e, "time source failed");
                    failures.push(e.message);
                }
            }
        }
        Err(ErrorResponse::new(code, failures.join("; ")))
    }

    fn display_server(&self) -> Option<DisplayServer> {
        detect_display_server(
            |key| std::env::var(key).ok(),
            std::path::Path::new(X11_SOCKET_DIR),
        )
    }

    async fn resize_display(
        &self,
        server: &DisplayServer,
        width: u32,
        height: u32,
        output: Option<&str>,
    ) -> Result<(), ErrorResponse> {
        let code = ErrorCode::DisplayResizeFailed;
        let mode = format!("{width}x{height}");
        match server {
            DisplayServer::X11 { .. } => {
                let output = match output {
                    Some(o) => o.to_string(),
                    None => {
                        let query = run(display_command("xrandr", server).arg("--query"), code).await?;
                        parse_xrandr_primary(&query).ok_or_else(|| {
                            ErrorResponse::new(ErrorCode::DisplayNotFound, "no connected output")
                        })?
                    }
                };
                let set = run(
                    display_command("xrandr", server).args(["--output", output.as_str(), "--mode", mode.as_str()]),
                    code,
                )
                .await;
                if set.is_ok() {
                    return Ok(());
                }
                // The mode may not be listed until the output rescans.
                run(display_command("xrandr", server).args(["--output", output.as_str(), "--auto"]), code)
                    .await?;
                run(
                    display_command("xrandr", server).args(["--output", output.as_str(), "--mode", mode.as_str()]),
                    ErrorCode::ResolutionNotSupported,
                )
                .await
                .map(|_| ())
            }
            DisplayServer::Wayland { .. } => {
                let mut cmd = display_command("wlr-randr", server);
                if let Some(output) = output {
                    cmd.args(["--output", output]);
                }
                cmd.args(["--custom-mode", mode.as_str()]);
                run(&mut cmd, code).await.map(|_| ())
            }
        }
    }

    async fn clipboard_get(&self, server: &DisplayServer) -> Result<String, ErrorResponse> {
        let code = ErrorCode::ClipboardAccessFailed;
        let mut cmd = match server {
            DisplayServer::X11 { .. } => {
                let mut cmd = display_command("xclip", server);
                cmd.args(["-selection", "clipboard", "-o"]);
                cmd
            }
            DisplayServer::Wayland { .. } => {
                let mut cmd = display_command("wl-paste", server);
                cmd.arg("--no-newline");
                cmd
            }
        };
        run(&mut cmd, code).await
    }

    async fn clipboard_set(
        &self,
        server: &DisplayServer,
        content: &str,
        mime_type: &str,
    ) -> Result<(), ErrorResponse> {
        let code = ErrorCode::ClipboardAccessFailed;
        let mut cmd = match server {
            DisplayServer::X11 { .. } => {
                let mut cmd = display_command("xclip", server);
                cmd.args(["-selection", "clipboard", "-t", mime_type, "-i"]);
                cmd
            }
            DisplayServer::Wayland { .. } => {
                let mut cmd = display_command("wl-copy", server);
                cmd.args(["--type", mime_type]);
                cmd
            }
        };
        run_with_input(&mut cmd, Some(content.as_bytes()), code)
            .await
            .map(|_| ())
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>, ErrorResponse> {
        let out = run(
            Command::new("systemctl").args([
                "list-units",
                "--type=service",
                "--all",
                "--no-pager",
                "--no-legend",
                "--plain",
            ]),
            ErrorCode::ServiceControlFailed,
        )
        .await?;
        Ok(parse_list_units(&out))
    }

    async fn service_status(&self, unit: &str) -> Result<ServiceInfo, ErrorResponse> {
        let out = run(
            Command::new("systemctl").args([
                "show",
                unit,
                "--property=LoadState,ActiveState,SubState,Description",
            ]),
            ErrorCode::ServiceControlFailed,
        )
        .await?;
        let info = parse_show(unit, &out);
        if info.load_state == "not-found" {
            return Err(ErrorResponse::new(ErrorCode::ServiceNotFound, "unit not found").with_context(unit));
        }
        Ok(info)
    }

    async fn control_service(&self, unit: &str, action: ServiceAction) -> Result<(), ErrorResponse> {
        run(
            Command::new("systemctl").args([action.as_str(), unit]),
            ErrorCode::ServiceControlFailed,
        )
        .await
        .map_err(|e| {
            if e.message.contains("not found") || e.message.contains("not loaded") {
                ErrorResponse::new(ErrorCode::ServiceNotFound, e.message).with_context(unit)
            } else {
                e.with_context(unit)
            }
        })
        .map(|_| ())
    }

    async fn installed_packages(&self) -> Result<Vec<SoftwarePackage>, ErrorResponse> {
        let code = ErrorCode::InventoryFailed;
        match run(
            Command::new("dpkg-query").args(["-W", "-f", "${Package}\t${Version}\n"]),
            code,
        )
        .await
        {
            Ok(out) => Ok(parse_package_lines(&out, "dpkg")),
            Err(dpkg_err) => {
                debug!(error = %dpkg_err, "dpkg-query unavailable, trying rpm");
                let out = run(
                    Command::new("rpm").args(["-qa", "--qf", "%{NAME}\t%{VERSION}-%{RELEASE}\n"]),
                    code,
                )
                .await?;
                Ok(parse_package_lines(&out, "rpm"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run(Command::new("echo").arg("hi"), ErrorCode::InternalError)
            .await
            .unwrap();
        assert_eq!(out, "hi\n");
    }

    #[tokio::test]
    async fn test_run_reports_stderr_on_failure() {
        let err = run(
            Command::new("sh").args(["-c", "echo broken >&2; exit 4"]),
            ErrorCode::ServiceControlFailed,
        )
        .await
        .unwrap_err();
        assert!(err.is(ErrorCode::ServiceControlFailed));
        assert!(err.message.contains("broken"));
    }

    #[tokio::test]
    async fn test_run_missing_tool() {
        let err = run(&mut Command::new("definitely-not-a-tool-xyz"), ErrorCode::TimeSyncFailed)
            .await
            .unwrap_err();
        assert!(err.message.contains("not installed"));
    }

    #[tokio::test]
    async fn test_run_feeds_stdin() {
        let out = run_with_input(&mut Command::new("cat"), Some(b"piped"), ErrorCode::InternalError)
            .await
            .unwrap();
        assert_eq!(out, "piped");
    }
}
