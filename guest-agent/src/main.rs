mod backoff;
mod config;
mod connection;
mod dispatcher;
mod handlers;
mod security;
mod telemetry;
mod transport;
mod update;

use std::sync::Arc;

use anyhow::{Context, Result};
use guestlink_protocol::ThawRequest;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;
use crate::connection::{ConnectionManager, Link};
use crate::dispatcher::Dispatcher;
use crate::handlers::{platform, HandlerContext};
use crate::security::SecurityPolicy;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::load_default().context("loading agent configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = guestlink_protocol::PROTOCOL_VERSION,
        "guestlink agent starting"
    );

    let config = Arc::new(config);
    let ctx = Arc::new(HandlerContext::new(config.clone(), platform::native()));
    let policy = SecurityPolicy::from_config(&config.security);
    let dispatcher = Arc::new(Dispatcher::new(ctx.clone(), policy));
    let link = Arc::new(Link::new());

    tokio::spawn(telemetry::run(link.clone(), ctx.clone()));

    let manager = ConnectionManager::new(config.transport.clone(), link, dispatcher);
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        _ = manager.run() => error!("connection manager exited"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = sigterm.recv() => info!("terminated"),
    }

    // A frozen filesystem must not outlive the agent.
    if ctx.quiesce.is_frozen().await {
        warn!("thawing filesystems before exit");
        if let Err(e) = ctx.quiesce.thaw(ThawRequest::default()).await {
            error!(error = %e, "thaw on exit failed");
        }
    }
    info!("guestlink agent stopped");
    Ok(())
}
