use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use guestlink_protocol::{ErrorCode, ErrorResponse, ExecuteRequest, ExecuteResponse, Payload, RunAs};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{HandlerContext, HandlerResult};

/// How long to wait for output pipes to drain after the group was killed.
/// A grandchild that left the process group could otherwise hold them open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub async fn execute(ctx: &HandlerContext, req: ExecuteRequest) -> HandlerResult {
    let limits = &ctx.config.exec;
    let timeout_secs = req.timeout_secs.clamp(1, limits.max_timeout_secs);
    let max_output = req
        .max_output_bytes
        .map(|m| m.min(limits.max_output_bytes))
        .unwrap_or(limits.max_output_bytes) as usize;

    let mut cmd = if req.args.is_empty() {
        // Shell mode: interpret command as a shell string
        let mut c = Command::new(&limits.shell);
        c.arg("-c").arg(&req.command);
        c
    } else {
        // Direct exec mode: command is the program, args are its arguments
        let mut c = Command::new(&req.command);
        c.args(&req.args);
        c
    };

    if let Some(run_as) = &req.run_as {
        let identity = resolve_identity(run_as)?;
        debug!(user = %identity.name, uid = identity.uid, gid = identity.gid, "dropping privileges");
        identity.apply(&mut cmd);
    }

    // Request env wins over identity defaults.
    cmd.envs(&req.env);

    if let Some(dir) = &req.workdir {
        if !Path::new(dir).is_dir() {
            return Err(ErrorResponse::new(
                ErrorCode::WorkingDirNotFound,
                "working directory does not exist",
            )
            .with_context(dir.as_str()));
        }
        cmd.current_dir(dir);
    }

    // Own process group so a timeout can take down the whole tree.
    cmd.process_group(0).stdin(Stdio::null());
    if req.wait_for_exit {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
    } else {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| spawn_error(&e, &req.command, req.run_as.is_some()))?;
    let pid = child.id();

    if !req.wait_for_exit {
        info!(pid = ?pid, command = %req.command, "started detached command");
        // Reap in the background so it never lingers as a zombie.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        return Ok(Payload::ExecuteResult(ExecuteResponse {
            pid,
            ..ExecuteResponse::default()
        }));
    }

    // Drain both pipes concurrently; a full pipe would otherwise block the
    // child and turn every chatty command into a timeout.
    let stdout_task = tokio::spawn(read_capped(child.stdout.take(), max_output));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take(), max_output));

    let (exit_code, timed_out) =
        match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => {
                return Err(ErrorResponse::new(
                    ErrorCode::ExecutionFailed,
                    format!("failed to wait on command: {e}"),
                ))
            }
            Err(_) => {
                warn!(pid = ?pid, timeout_secs, command = %req.command, "command timed out, killing process group");
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                let _ = child.kill().await;
                (None, true)
            }
        };

    let (stdout, out_truncated) = collect(stdout_task, timed_out).await;
    let (stderr, err_truncated) = collect(stderr_task, timed_out).await;

    Ok(Payload::ExecuteResult(ExecuteResponse {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration_ms: start.elapsed().as_millis() as u64,
        truncated: out_truncated || err_truncated,
        pid,
    }))
}

async fn collect(task: tokio::task::JoinHandle<(Vec<u8>, bool)>, timed_out: bool) -> (String, bool) {
    let joined = if timed_out {
        match tokio::time::timeout(DRAIN_GRACE, task).await {
            Ok(joined) => joined,
            Err(_) => return (String::new(), true),
        }
    } else {
        task.await
    };
    match joined {
        Ok((bytes, truncated)) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Err(_) => (String::new(), false),
    }
}

/// Read a stream to EOF, keeping at most `max` bytes.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, max: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}

fn kill_group(pid: u32) {
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if ret != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

fn spawn_error(err: &std::io::Error, command: &str, impersonating: bool) -> ErrorResponse {
    let code = match err.kind() {
        std::io::ErrorKind::NotFound => ErrorCode::CommandNotFound,
        std::io::ErrorKind::PermissionDenied if impersonating => ErrorCode::SetuidFailed,
        std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        _ => ErrorCode::SpawnFailed,
    };
    ErrorResponse::new(code, format!("failed to execute command: {err}")).with_context(command)
}

// ---------------------------------------------------------------------------
// Impersonation
// ---------------------------------------------------------------------------

/// A resolved account to run a command as.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub groups: Vec<libc::gid_t>,
    pub home: String,
}

impl Identity {
    /// Drop to this identity in the child between fork and exec:
    /// supplementary groups first, then gid, then uid.
    fn apply(self, cmd: &mut Command) {
        cmd.env("HOME", &self.home)
            .env("USER", &self.name)
            .env("LOGNAME", &self.name);
        let Identity { uid, gid, groups, .. } = self;
        unsafe {
            cmd.pre_exec(move || {
                if libc::setgroups(groups.len() as _, groups.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setgid(gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setuid(uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
}

#[cfg(target_os = "linux")]
pub fn resolve_identity(run_as: &RunAs) -> Result<Identity, ErrorResponse> {
    use std::ffi::{CStr, CString};

    let not_found = || {
        ErrorResponse::new(ErrorCode::UserNotFound, format!("no such user: {}", run_as.user))
    };
    let cname = CString::new(run_as.user.as_str()).map_err(|_| not_found())?;

    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(
            cname.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return Err(not_found());
    }

    let uid = pwd.pw_uid;
    let home = unsafe { CStr::from_ptr(pwd.pw_dir) }
        .to_string_lossy()
        .into_owned();
    let gid = match &run_as.group {
        Some(group) => resolve_group(group)?,
        None => pwd.pw_gid,
    };

    let mut groups: Vec<libc::gid_t> = vec![0; 32];
    loop {
        let mut n = groups.len() as libc::c_int;
        let rc = unsafe { libc::getgrouplist(cname.as_ptr(), gid, groups.as_mut_ptr(), &mut n) };
        if rc >= 0 {
            groups.truncate(n as usize);
            break;
        }
        let wanted = (n as usize).max(groups.len() * 2);
        if wanted > 65_536 {
            return Err(ErrorResponse::new(
                ErrorCode::GroupNotFound,
                "supplementary group list too large",
            ));
        }
        groups.resize(wanted, 0);
    }

    Ok(Identity {
        name: run_as.user.clone(),
        uid,
        gid,
        groups,
        home,
    })
}

#[cfg(target_os = "linux")]
fn resolve_group(name: &str) -> Result<libc::gid_t, ErrorResponse> {
    use std::ffi::CString;

    let not_found = || ErrorResponse::new(ErrorCode::GroupNotFound, format!("no such group: {name}"));
    let cname = CString::new(name).map_err(|_| not_found())?;
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe {
        libc::getgrnam_r(
            cname.as_ptr(),
            &mut grp,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return Err(not_found());
    }
    Ok(grp.gr_gid)
}

#[cfg(not(target_os = "linux"))]
pub fn resolve_identity(_run_as: &RunAs) -> Result<Identity, ErrorResponse> {
    Err(ErrorResponse::new(
        ErrorCode::UnsupportedOperation,
        "run_as is not supported on this platform",
    ))
}
