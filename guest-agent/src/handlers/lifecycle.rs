use std::net::IpAddr;
use std::time::Duration;

use guestlink_protocol::{
    ErrorCode, ErrorResponse, NetworkConfig, Payload, PowerRequest, ResetPasswordRequest,
};
use tracing::{error, info};

use super::platform::{Platform, PowerAction};
use super::{HandlerContext, HandlerResult};

/// A power action waiting for its acknowledgment to reach the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerPlan {
    pub action: PowerAction,
    pub delay: Duration,
    pub force: bool,
    pub message: Option<String>,
}

/// Longest delay a power request may ask for.
const MAX_POWER_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Accept a power request. The action itself runs later through
/// [`run_power_plan`], once the `Ok` has been written.
pub fn plan_power(action: PowerAction, req: PowerRequest) -> (HandlerResult, PowerPlan) {
    let plan = PowerPlan {
        action,
        delay: Duration::from_secs(req.delay_secs).min(MAX_POWER_DELAY),
        force: req.force,
        message: req.message,
    };
    info!(action = ?plan.action, delay_secs = plan.delay.as_secs(), force = plan.force, "power request accepted");
    (Ok(Payload::Ok), plan)
}

pub async fn run_power_plan(platform: &dyn Platform, plan: PowerPlan) {
    if !plan.delay.is_zero() {
        tokio::time::sleep(plan.delay).await;
    }
    info!(action = ?plan.action, "executing power action");
    if let Err(e) = platform
        .power(plan.action, plan.force, plan.message.as_deref())
        .await
    {
        error!(action = ?plan.action, error = %e, "power action failed");
    }
}

pub async fn reset_password(ctx: &HandlerContext, req: ResetPasswordRequest) -> HandlerResult {
    validate_username(&req.username)?;
    if req.password.is_empty() || req.password.contains(['\n', '\r', '\0']) {
        return Err(ErrorResponse::new(
            ErrorCode::PasswordResetFailed,
            "password must be non-empty and single-line",
        ));
    }
    ctx.platform
        .set_password(&req.username, &req.password)
        .await?;
    info!(user = %req.username, "password reset");
    Ok(Payload::Ok)
}

fn validate_username(name: &str) -> Result<(), ErrorResponse> {
    let valid = !name.is_empty()
        && name.len() <= 32
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ErrorResponse::new(
            ErrorCode::PasswordResetFailed,
            format!("invalid username: {name:?}"),
        ))
    }
}

pub async fn configure_network(ctx: &HandlerContext, config: NetworkConfig) -> HandlerResult {
    validate_network(&config)?;
    ctx.platform.configure_network(&config).await?;
    info!(interface = %config.interface, address = %config.address, "network configured");
    Ok(Payload::Ok)
}

pub fn validate_network(config: &NetworkConfig) -> Result<(), ErrorResponse> {
    let invalid = |msg: String| ErrorResponse::new(ErrorCode::NetworkConfigFailed, msg);

    let iface = &config.interface;
    if iface.is_empty()
        || iface.len() > 15
        || !iface
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(invalid(format!("invalid interface name: {iface:?}")));
    }

    let (ip, prefix) = config
        .address
        .split_once('/')
        .ok_or_else(|| invalid(format!("address must be in CIDR form: {}", config.address)))?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| invalid(format!("invalid IP address: {ip}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| invalid(format!("invalid prefix length: {prefix}")))?;
    let max_prefix = if ip.is_ipv4() { 32 } else { 128 };
    if prefix > max_prefix {
        return Err(invalid(format!("prefix length {prefix} exceeds {max_prefix}")));
    }

    if let Some(gw) = &config.gateway {
        gw.parse::<IpAddr>()
            .map_err(|_| invalid(format!("invalid gateway: {gw}")))?;
    }
    for server in &config.dns {
        server
            .parse::<IpAddr>()
            .map_err(|_| invalid(format!("invalid DNS server: {server}")))?;
    }
    if let Some(mtu) = config.mtu {
        if !(68..=65535).contains(&mtu) {
            return Err(invalid(format!("MTU {mtu} out of range")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::context;

    fn net(address: &str) -> NetworkConfig {
        NetworkConfig {
            interface: "eth0".into(),
            address: address.into(),
            gateway: Some("10.0.0.1".into()),
            dns: vec!["1.1.1.1".into()],
            mtu: None,
        }
    }

    #[test]
    fn test_power_plan_defers_action() {
        let (result, plan) = plan_power(
            PowerAction::Reboot,
            PowerRequest {
                delay_secs: 5,
                message: Some("bye".into()),
                force: false,
            },
        );
        assert_eq!(result.unwrap(), Payload::Ok);
        assert_eq!(plan.delay, Duration::from_secs(5));
        assert_eq!(plan.action, PowerAction::Reboot);
    }

    #[test]
    fn test_power_delay_is_capped() {
        let (_, plan) = plan_power(
            PowerAction::Poweroff,
            PowerRequest {
                delay_secs: u64::MAX,
                ..PowerRequest::default()
            },
        );
        assert_eq!(plan.delay, MAX_POWER_DELAY);
    }

    #[tokio::test]
    async fn test_power_plan_reaches_platform() {
        let (_, platform) = context();
        let (_, plan) = plan_power(
            PowerAction::Poweroff,
            PowerRequest {
                force: true,
                ..PowerRequest::default()
            },
        );
        run_power_plan(platform.as_ref(), plan).await;
        assert_eq!(platform.calls(), vec!["power Poweroff force=true"]);
    }

    #[tokio::test]
    async fn test_reset_password_validates_input() {
        let (ctx, platform) = context();
        let ok = reset_password(
            &ctx,
            ResetPasswordRequest {
                username: "alice".into(),
                password: "s3cret:with:colons".into(),
            },
        )
        .await;
        assert!(ok.is_ok());
        assert_eq!(platform.calls(), vec!["password alice"]);

        for (user, pass) in [("", "x"), ("-rf", "x"), ("a:b", "x"), ("bob", "two\nlines"), ("bob", "")] {
            let err = reset_password(
                &ctx,
                ResetPasswordRequest {
                    username: user.into(),
                    password: pass.into(),
                },
            )
            .await
            .unwrap_err();
            assert!(err.is(ErrorCode::PasswordResetFailed), "{user:?}/{pass:?}");
        }
    }

    #[test]
    fn test_network_validation() {
        assert!(validate_network(&net("10.0.0.5/24")).is_ok());
        assert!(validate_network(&net("fd00::5/64")).is_ok());
        assert!(validate_network(&net("10.0.0.5")).is_err());
        assert!(validate_network(&net("10.0.0.300/24")).is_err());
        assert!(validate_network(&net("10.0.0.5/33")).is_err());

        let mut bad_iface = net("10.0.0.5/24");
        bad_iface.interface = "eth0; reboot".into();
        assert!(validate_network(&bad_iface).is_err());

        let mut bad_dns = net("10.0.0.5/24");
        bad_dns.dns = vec!["dns.example".into()];
        assert!(validate_network(&bad_dns).is_err());

        let mut bad_mtu = net("10.0.0.5/24");
        bad_mtu.mtu = Some(10);
        assert!(validate_network(&bad_mtu).is_err());
    }

    #[tokio::test]
    async fn test_configure_network_calls_platform() {
        let (ctx, platform) = context();
        configure_network(&ctx, net("192.168.1.10/24")).await.unwrap();
        assert_eq!(platform.calls(), vec!["network eth0 192.168.1.10/24"]);
    }
}
