//! Filesystem quiescing for consistent snapshots.
//!
//! At most one freeze is active at a time. The coordinator remembers which
//! mount points it froze so that thaw (manual or automatic) undoes exactly
//! that set, in reverse order.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use guestlink_protocol::{
    ErrorCode, ErrorResponse, Payload, QuiesceRequest, QuiesceResponse, ThawRequest, ThawResponse,
};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::platform::Platform;
use super::HandlerResult;
use crate::config::QuiesceConfig;

struct Frozen {
    token: String,
    mounts: Vec<String>,
    since: Instant,
    run_scripts: bool,
    auto_thaw: Option<JoinHandle<()>>,
}

struct Inner {
    platform: Arc<dyn Platform>,
    config: QuiesceConfig,
    state: Mutex<Option<Frozen>>,
}

#[derive(Clone)]
pub struct QuiesceCoordinator {
    inner: Arc<Inner>,
}

impl QuiesceCoordinator {
    pub fn new(platform: Arc<dyn Platform>, config: QuiesceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                config,
                state: Mutex::new(None),
            }),
        }
    }

    pub async fn is_frozen(&self) -> bool {
        self.inner.state.lock().await.is_some()
    }

    pub async fn freeze(&self, req: QuiesceRequest) -> HandlerResult {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if let Some(frozen) = state.as_ref() {
            return Err(ErrorResponse::new(
                ErrorCode::AlreadyQuiesced,
                format!("{} filesystem(s) already frozen", frozen.mounts.len()),
            ));
        }

        for mp in &req.mount_points {
            validate_mount_point(mp)?;
        }
        let targets = if req.mount_points.is_empty() {
            inner.platform.writable_mounts().await?
        } else {
            dedup(req.mount_points)
        };
        if targets.is_empty() {
            return Err(ErrorResponse::new(
                ErrorCode::QuiesceFailed,
                "no writable filesystems to freeze",
            ));
        }

        if req.run_scripts {
            run_hooks(&inner.config.pre_freeze_dir, inner.config.script_timeout()).await?;
        }

        let mut frozen = Vec::with_capacity(targets.len());
        for mp in &targets {
            if let Err(e) = inner.platform.freeze(mp).await {
                error!(mount_point = %mp, error = %e, "freeze failed, rolling back");
                thaw_all(inner.platform.as_ref(), &frozen).await;
                if req.run_scripts {
                    if let Err(e) =
                        run_hooks(&inner.config.post_thaw_dir, inner.config.script_timeout()).await
                    {
                        warn!(error = %e, "post-thaw hooks failed after rollback");
                    }
                }
                return Err(ErrorResponse::new(
                    ErrorCode::QuiesceFailed,
                    format!("freezing {mp} failed: {}", e.message),
                )
                .with_context(mp.clone()));
            }
            frozen.push(mp.clone());
        }

        let timeout_secs = req.timeout_secs.clamp(1, inner.config.max_timeout_secs.max(1));
        let token = uuid::Uuid::new_v4().to_string();
        let auto_thaw = self.spawn_auto_thaw(token.clone(), Duration::from_secs(timeout_secs));
        info!(token = %token, mounts = ?frozen, timeout_secs, "filesystems frozen");

        *state = Some(Frozen {
            token: token.clone(),
            mounts: frozen.clone(),
            since: Instant::now(),
            run_scripts: req.run_scripts,
            auto_thaw: Some(auto_thaw),
        });

        Ok(Payload::QuiesceResult(QuiesceResponse {
            token,
            frozen,
            auto_thaw_at: chrono::Utc::now() + chrono::Duration::seconds(timeout_secs as i64),
        }))
    }

    pub async fn thaw(&self, req: ThawRequest) -> HandlerResult {
        let mut state = self.inner.state.lock().await;
        let token_matches = match (state.as_ref(), &req.token) {
            (None, _) => {
                return Err(ErrorResponse::new(ErrorCode::NotQuiesced, "no filesystems are frozen"))
            }
            (Some(frozen), Some(token)) => frozen.token == *token,
            (Some(_), None) => true,
        };
        if !token_matches {
            return Err(ErrorResponse::new(
                ErrorCode::NotQuiesced,
                "thaw token does not match the active freeze",
            ));
        }
        let Some(mut frozen) = state.take() else {
            return Err(ErrorResponse::new(ErrorCode::NotQuiesced, "no filesystems are frozen"));
        };
        if let Some(handle) = frozen.auto_thaw.take() {
            handle.abort();
        }
        drop(state);

        self.inner.finish_thaw(frozen).await
    }

    fn spawn_auto_thaw(&self, token: String, after: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let frozen = {
                let mut state = inner.state.lock().await;
                if state.as_ref().is_some_and(|f| f.token == token) {
                    state.take()
                } else {
                    None
                }
            };
            if let Some(frozen) = frozen {
                warn!(token = %token, "quiesce timeout reached, thawing automatically");
                if let Err(e) = inner.finish_thaw(frozen).await {
                    error!(error = %e, "automatic thaw failed");
                }
            }
        })
    }
}

impl Inner {
    fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    async fn finish_thaw(&self, frozen: Frozen) -> HandlerResult {
        let failed = thaw_all(self.platform(), &frozen.mounts).await;
        if frozen.run_scripts {
            if let Err(e) = run_hooks(&self.config.post_thaw_dir, self.config.script_timeout()).await {
                warn!(error = %e, "post-thaw hooks failed");
            }
        }
        let frozen_ms = frozen.since.elapsed().as_millis() as u64;
        if !failed.is_empty() {
            return Err(ErrorResponse::new(
                ErrorCode::ThawFailed,
                format!("failed to thaw {}", failed.join(", ")),
            ));
        }
        info!(token = %frozen.token, frozen_ms, "filesystems thawed");
        Ok(Payload::ThawResult(ThawResponse {
            thawed: frozen.mounts.into_iter().rev().collect(),
            frozen_ms,
        }))
    }
}

/// Thaw in reverse freeze order. Returns the mount points that failed.
async fn thaw_all(platform: &dyn Platform, mounts: &[String]) -> Vec<String> {
    let mut failed = Vec::new();
    for mp in mounts.iter().rev() {
        if let Err(e) = platform.thaw(mp).await {
            error!(mount_point = %mp, error = %e, "thaw failed");
            failed.push(mp.clone());
        }
    }
    failed
}

fn validate_mount_point(mp: &str) -> Result<(), ErrorResponse> {
    let path = Path::new(mp);
    if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
        return Err(
            ErrorResponse::new(ErrorCode::InvalidMountPoint, "mount point must be an absolute path")
                .with_context(mp),
        );
    }
    Ok(())
}

fn dedup(mounts: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(mounts.len());
    for mp in mounts {
        if !out.contains(&mp) {
            out.push(mp);
        }
    }
    out
}

/// Run every executable regular file in `dir`, sorted by name. A missing
/// directory means no hooks.
async fn run_hooks(dir: &Path, timeout: Duration) -> Result<(), ErrorResponse> {
    let scripts = match hook_scripts(dir).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(ErrorResponse::new(
                ErrorCode::ScriptExecutionFailed,
                format!("reading hook directory: {e}"),
            )
            .with_context(dir.display().to_string()))
        }
    };

    for script in scripts {
        let shown = script.display().to_string();
        debug!(script = %shown, "running hook");
        let child = Command::new(&script)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ErrorResponse::new(
                    ErrorCode::ScriptExecutionFailed,
                    format!("spawning hook: {e}"),
                )
                .with_context(shown))
            }
            Err(_) => {
                return Err(ErrorResponse::new(
                    ErrorCode::ScriptExecutionFailed,
                    format!("hook timed out after {}s", timeout.as_secs()),
                )
                .with_context(shown))
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ErrorResponse::new(
                ErrorCode::ScriptExecutionFailed,
                format!("hook exited with {}: {}", output.status, stderr.trim()),
            )
            .with_context(shown));
        }
    }
    Ok(())
}

async fn hook_scripts(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut scripts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
            scripts.push(entry.path());
        }
    }
    scripts.sort();
    Ok(scripts)
}

/// Writable, block-backed mount points from `/proc/mounts` content, in
/// mount order without duplicates.
pub fn parse_writable_mounts(contents: &str) -> Vec<String> {
    const SKIP_FS: &[&str] = &["squashfs", "iso9660", "udf"];

    let mut mounts: Vec<String> = Vec::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount_point), Some(fs_type), Some(options)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !device.starts_with("/dev/") || SKIP_FS.contains(&fs_type) {
            continue;
        }
        if options.split(',').any(|o| o == "ro") {
            continue;
        }
        let mount_point = unescape_mount(mount_point);
        if !mounts.contains(&mount_point) {
            mounts.push(mount_point);
        }
    }
    mounts
}

/// Undo the octal escapes the kernel uses for whitespace in mount paths.
fn unescape_mount(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::platform::fake::RecordingPlatform;

    fn coordinator(platform: RecordingPlatform, config: QuiesceConfig) -> (QuiesceCoordinator, Arc<RecordingPlatform>) {
        let platform = Arc::new(platform);
        (QuiesceCoordinator::new(platform.clone(), config), platform)
    }

    fn no_hooks() -> QuiesceConfig {
        QuiesceConfig {
            pre_freeze_dir: PathBuf::from("/nonexistent/pre-freeze.d"),
            post_thaw_dir: PathBuf::from("/nonexistent/post-thaw.d"),
            ..QuiesceConfig::default()
        }
    }

    fn request(mounts: &[&str]) -> QuiesceRequest {
        QuiesceRequest {
            mount_points: mounts.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 60,
            run_scripts: true,
        }
    }

    #[tokio::test]
    async fn test_freeze_then_thaw_reverses_order() {
        let (q, platform) = coordinator(
            RecordingPlatform {
                mounts: vec!["/".into(), "/data".into()],
                ..Default::default()
            },
            no_hooks(),
        );
        let token = match q.freeze(request(&[])).await.unwrap() {
            Payload::QuiesceResult(r) => {
                assert_eq!(r.frozen, vec!["/", "/data"]);
                r.token
            }
            other => panic!("unexpected {other:?}"),
        };
        assert!(q.is_frozen().await);

        let thawed = q.thaw(ThawRequest { token: Some(token) }).await.unwrap();
        match thawed {
            Payload::ThawResult(r) => assert_eq!(r.thawed, vec!["/data", "/"]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            platform.calls(),
            vec!["freeze /", "freeze /data", "thaw /data", "thaw /"]
        );
        assert!(!q.is_frozen().await);
    }

    #[tokio::test]
    async fn test_second_freeze_is_rejected() {
        let (q, _) = coordinator(RecordingPlatform::default(), no_hooks());
        q.freeze(request(&["/data"])).await.unwrap();
        let err = q.freeze(request(&["/data"])).await.unwrap_err();
        assert!(err.is(ErrorCode::AlreadyQuiesced));
    }

    #[tokio::test]
    async fn test_thaw_without_freeze() {
        let (q, _) = coordinator(RecordingPlatform::default(), no_hooks());
        let err = q.thaw(ThawRequest::default()).await.unwrap_err();
        assert!(err.is(ErrorCode::NotQuiesced));
    }

    #[tokio::test]
    async fn test_wrong_token_keeps_freeze() {
        let (q, _) = coordinator(RecordingPlatform::default(), no_hooks());
        q.freeze(request(&["/data"])).await.unwrap();
        let err = q
            .thaw(ThawRequest {
                token: Some("bogus".into()),
            })
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::NotQuiesced));
        assert!(q.is_frozen().await);
    }

    #[tokio::test]
    async fn test_partial_failure_thaws_what_was_frozen() {
        let (q, platform) = coordinator(
            RecordingPlatform {
                failing_freezes: ["/b".to_string()].into_iter().collect(),
                ..Default::default()
            },
            no_hooks(),
        );
        let err = q.freeze(request(&["/a", "/b", "/c"])).await.unwrap_err();
        assert!(err.is(ErrorCode::QuiesceFailed));
        assert_eq!(err.context.as_deref(), Some("/b"));
        assert_eq!(platform.calls(), vec!["freeze /a", "freeze /b", "thaw /a"]);
        assert!(!q.is_frozen().await);
    }

    #[tokio::test]
    async fn test_relative_mount_point_rejected() {
        let (q, platform) = coordinator(RecordingPlatform::default(), no_hooks());
        let err = q.freeze(request(&["data"])).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidMountPoint));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_auto_thaw_fires() {
        let (q, platform) = coordinator(RecordingPlatform::default(), no_hooks());
        let mut req = request(&["/data"]);
        req.timeout_secs = 1;
        q.freeze(req).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!q.is_frozen().await);
        assert_eq!(platform.calls(), vec!["freeze /data", "thaw /data"]);
    }

    #[tokio::test]
    async fn test_hooks_run_in_order() {
        let pre = tempfile::tempdir().unwrap();
        let post = tempfile::tempdir().unwrap();
        let log = pre.path().join("log");
        for (dir, name) in [(&pre, "20-second"), (&pre, "10-first"), (&post, "10-after")] {
            let script = dir.path().join(name);
            std::fs::write(
                &script,
                format!("#!/bin/sh\necho {name} >> {}\n", log.display()),
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        // Not executable, so skipped.
        std::fs::write(pre.path().join("00-readme"), "ignored").unwrap();

        let config = QuiesceConfig {
            pre_freeze_dir: pre.path().to_path_buf(),
            post_thaw_dir: post.path().to_path_buf(),
            ..QuiesceConfig::default()
        };
        let (q, _) = coordinator(RecordingPlatform::default(), config);
        q.freeze(request(&["/data"])).await.unwrap();
        q.thaw(ThawRequest::default()).await.unwrap();

        let ran = std::fs::read_to_string(&log).unwrap();
        assert_eq!(ran, "10-first\n20-second\n10-after\n");
    }

    #[tokio::test]
    async fn test_failing_pre_hook_aborts_freeze() {
        let pre = tempfile::tempdir().unwrap();
        let script = pre.path().join("fail");
        std::fs::write(&script, "#!/bin/sh\necho nope >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = QuiesceConfig {
            pre_freeze_dir: pre.path().to_path_buf(),
            ..no_hooks()
        };
        let (q, platform) = coordinator(RecordingPlatform::default(), config);
        let err = q.freeze(request(&["/data"])).await.unwrap_err();
        assert!(err.is(ErrorCode::ScriptExecutionFailed));
        assert!(err.message.contains("nope"));
        assert!(platform.calls().is_empty());
    }

    #[test]
    fn test_proc_mounts_parsing() {
        let mounts = "\
/dev/vda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid 0 0
tmpfs /run tmpfs rw,nosuid 0 0
/dev/vdb1 /mnt/my\\040data xfs rw,noatime 0 0
/dev/sr0 /media/cdrom iso9660 ro 0 0
/dev/vdc1 /readonly ext4 ro,relatime 0 0
/dev/loop0 /snap/core squashfs ro 0 0
/dev/vda1 / ext4 rw,relatime 0 0
";
        assert_eq!(parse_writable_mounts(mounts), vec!["/", "/mnt/my data"]);
    }
}
