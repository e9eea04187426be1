//! Request handlers, one module per capability area.
//!
//! Every handler is an `async fn(&HandlerContext, Req) -> HandlerResult`;
//! the dispatcher turns an `Err` into `Payload::Error`.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Instant;

use guestlink_protocol::{CapabilitiesResponse, ErrorCode, ErrorResponse, Payload};

use crate::config::AgentConfig;

pub mod capabilities;
pub mod desktop;
pub mod directory;
pub mod exec;
pub mod file;
pub mod inventory;
pub mod lifecycle;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod platform;
pub mod process;
pub mod quiesce;
pub mod timesync;

use platform::Platform;
use quiesce::QuiesceCoordinator;

pub type HandlerResult = Result<Payload, ErrorResponse>;

/// Shared, read-mostly state every handler can see.
pub struct HandlerContext {
    pub config: Arc<AgentConfig>,
    pub platform: Arc<dyn Platform>,
    /// Computed once at startup.
    pub capabilities: CapabilitiesResponse,
    pub quiesce: QuiesceCoordinator,
    pub started: Instant,
}

impl HandlerContext {
    pub fn new(config: Arc<AgentConfig>, platform: Arc<dyn Platform>) -> Self {
        let quiesce = QuiesceCoordinator::new(platform.clone(), config.quiesce.clone());
        Self {
            capabilities: capabilities::detect(),
            quiesce,
            platform,
            config,
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Map a filesystem error to the closest file-band code.
pub fn io_error(err: &std::io::Error, path: &str, fallback: ErrorCode) -> ErrorResponse {
    let code = match err.kind() {
        ErrorKind::NotFound => ErrorCode::FileNotFound,
        ErrorKind::PermissionDenied => ErrorCode::FileAccessDenied,
        ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
        _ => match err.raw_os_error() {
            Some(libc::ENOSPC) | Some(libc::EDQUOT) => ErrorCode::DiskFull,
            Some(libc::ENOTDIR) => ErrorCode::NotADirectory,
            Some(libc::EISDIR) => ErrorCode::NotAFile,
            _ => fallback,
        },
    };
    ErrorResponse::new(code, err.to_string()).with_context(path)
}

/// Unix permission string, e.g. "rwxr-xr-x".
pub fn format_permissions(mode: u32) -> String {
    let chars = ['x', 'w', 'r'];
    let mut s = String::with_capacity(9);
    for shift in (0..9).rev() {
        s.push(if mode & (1 << shift) != 0 { chars[shift % 3] } else { '-' });
    }
    s
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use platform::fake::RecordingPlatform;

    pub fn context_with(config: AgentConfig, platform: RecordingPlatform) -> (HandlerContext, Arc<RecordingPlatform>) {
        let platform = Arc::new(platform);
        let ctx = HandlerContext::new(Arc::new(config), platform.clone());
        (ctx, platform)
    }

    pub fn context() -> (HandlerContext, Arc<RecordingPlatform>) {
        context_with(AgentConfig::default(), RecordingPlatform::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_string() {
        assert_eq!(format_permissions(0o755), "rwxr-xr-x");
        assert_eq!(format_permissions(0o640), "rw-r-----");
        assert_eq!(format_permissions(0o100644), "rw-r--r--");
    }

    #[test]
    fn test_io_error_mapping() {
        let nf = std::io::Error::from(ErrorKind::NotFound);
        assert!(io_error(&nf, "/x", ErrorCode::FileIoError).is(ErrorCode::FileNotFound));
        let denied = std::io::Error::from(ErrorKind::PermissionDenied);
        assert!(io_error(&denied, "/x", ErrorCode::FileIoError).is(ErrorCode::FileAccessDenied));
        let full = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert!(io_error(&full, "/x", ErrorCode::FileIoError).is(ErrorCode::DiskFull));
        let other = std::io::Error::other("boom");
        let err = io_error(&other, "/x", ErrorCode::DeleteFailed);
        assert!(err.is(ErrorCode::DeleteFailed));
        assert_eq!(err.context.as_deref(), Some("/x"));
    }
}
