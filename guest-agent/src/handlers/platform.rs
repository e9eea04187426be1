//! OS seam for privileged side effects.
//!
//! Handlers validate requests and shape responses; anything that changes
//! the machine (power, clock, mounts, services, display) goes through
//! [`Platform`] so it can be swapped for a fake in tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guestlink_protocol::{
    ErrorCode, ErrorResponse, NetworkConfig, ServiceAction, ServiceInfo, SoftwarePackage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Poweroff,
    Reboot,
}

impl PowerAction {
    pub fn failure_code(self) -> ErrorCode {
        match self {
            PowerAction::Poweroff => ErrorCode::ShutdownFailed,
            PowerAction::Reboot => ErrorCode::RebootFailed,
        }
    }
}

/// A reachable graphical session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayServer {
    /// Value for `DISPLAY`, e.g. `:0`.
    X11 { display: String },
    /// Value for `WAYLAND_DISPLAY`, e.g. `wayland-0`.
    Wayland { socket: String },
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn power(
        &self,
        action: PowerAction,
        force: bool,
        message: Option<&str>,
    ) -> Result<(), ErrorResponse>;

    async fn set_password(&self, username: &str, password: &str) -> Result<(), ErrorResponse>;

    async fn configure_network(&self, config: &NetworkConfig) -> Result<(), ErrorResponse>;

    /// Every writable, block-backed mount point, in mount order.
    async fn writable_mounts(&self) -> Result<Vec<String>, ErrorResponse>;

    async fn freeze(&self, mount_point: &str) -> Result<(), ErrorResponse>;

    async fn thaw(&self, mount_point: &str) -> Result<(), ErrorResponse>;

    /// Set the clock to `time`, or step it from a time source when `None`.
    /// Returns the mechanism that succeeded.
    async fn set_clock(&self, time: Option<DateTime<Utc>>) -> Result<String, ErrorResponse>;

    fn display_server(&self) -> Option<DisplayServer>;

    async fn resize_display(
        &self,
        server: &DisplayServer,
        width: u32,
        height: u32,
        output: Option<&str>,
    ) -> Result<(), ErrorResponse>;

    async fn clipboard_get(&self, server: &DisplayServer) -> Result<String, ErrorResponse>;

    async fn clipboard_set(
        &self,
        server: &DisplayServer,
        content: &str,
        mime_type: &str,
    ) -> Result<(), ErrorResponse>;

    async fn list_services(&self) -> Result<Vec<ServiceInfo>, ErrorResponse>;

    async fn service_status(&self, unit: &str) -> Result<ServiceInfo, ErrorResponse>;

    async fn control_service(&self, unit: &str, action: ServiceAction) -> Result<(), ErrorResponse>;

    async fn installed_packages(&self) -> Result<Vec<SoftwarePackage>, ErrorResponse>;
}

/// The platform for the target this agent was built for.
pub fn native() -> Arc<dyn Platform> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(super::linux::LinuxPlatform::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedPlatform)
    }
}

/// Refuses every privileged operation.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub struct UnsupportedPlatform;

fn unsupported(what: &str) -> ErrorResponse {
    ErrorResponse::new(
        ErrorCode::UnsupportedOperation,
        format!("{what} is not supported on {}", std::env::consts::OS),
    )
}

#[async_trait]
impl Platform for UnsupportedPlatform {
    async fn power(&self, _: PowerAction, _: bool, _: Option<&str>) -> Result<(), ErrorResponse> {
        Err(unsupported("power control"))
    }

    async fn set_password(&self, _: &str, _: &str) -> Result<(), ErrorResponse> {
        Err(unsupported("password reset"))
    }

    async fn configure_network(&self, _: &NetworkConfig) -> Result<(), ErrorResponse> {
        Err(unsupported("network configuration"))
    }

    async fn writable_mounts(&self) -> Result<Vec<String>, ErrorResponse> {
        Err(unsupported("mount enumeration"))
    }

    async fn freeze(&self, _: &str) -> Result<(), ErrorResponse> {
        Err(unsupported("filesystem freeze"))
    }

    async fn thaw(&self, _: &str) -> Result<(), ErrorResponse> {
        Err(unsupported("filesystem thaw"))
    }

    async fn set_clock(&self, _: Option<DateTime<Utc>>) -> Result<String, ErrorResponse> {
        Err(unsupported("time sync"))
    }

    fn display_server(&self) -> Option<DisplayServer> {
        None
    }

    async fn resize_display(
        &self,
        _: &DisplayServer,
        _: u32,
        _: u32,
        _: Option<&str>,
    ) -> Result<(), ErrorResponse> {
        Err(unsupported("display resize"))
    }

    async fn clipboard_get(&self, _: &DisplayServer) -> Result<String, ErrorResponse> {
        Err(unsupported("clipboard access"))
    }

    async fn clipboard_set(&self, _: &DisplayServer, _: &str, _: &str) -> Result<(), ErrorResponse> {
        Err(unsupported("clipboard access"))
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>, ErrorResponse> {
        Err(unsupported("service listing"))
    }

    async fn service_status(&self, _: &str) -> Result<ServiceInfo, ErrorResponse> {
        Err(unsupported("service status"))
    }

    async fn control_service(&self, _: &str, _: ServiceAction) -> Result<(), ErrorResponse> {
        Err(unsupported("service control"))
    }

    async fn installed_packages(&self) -> Result<Vec<SoftwarePackage>, ErrorResponse> {
        Err(unsupported("software inventory"))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_platform_refuses() {
        let p = UnsupportedPlatform;
        let err = p.freeze("/").await.unwrap_err();
        assert!(err.is(ErrorCode::UnsupportedOperation));
        assert!(p.display_server().is_none());
        let err = p.installed_packages().await.unwrap_err();
        assert_eq!(err.category, guestlink_protocol::ErrorCategory::Internal);
    }

    #[test]
    fn test_power_failure_codes() {
        assert_eq!(PowerAction::Poweroff.failure_code(), ErrorCode::ShutdownFailed);
        assert_eq!(PowerAction::Reboot.failure_code(), ErrorCode::RebootFailed);
    }
}
