//! Unsolicited events: the ready notification, periodic resource
//! snapshots and clipboard changes.
//!
//! Nothing is written until the link reports ready. When the connection is
//! lost the producer returns to waiting and announces itself again on the
//! next connection.

use std::sync::Arc;
use std::time::Duration;

use guestlink_protocol::{
    AgentReadyEvent, ClipboardContent, DiskUsage, Envelope, LoadAverage, NetworkUsage, Payload,
    TelemetrySnapshot, PROTOCOL_VERSION,
};
use sysinfo::{Disks, Networks, System};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connection::{Link, LinkError};
use crate::handlers::HandlerContext;

const CLIPBOARD_POLL: Duration = Duration::from_secs(1);

/// Keeps sysinfo state between ticks; CPU usage is a delta between two
/// refreshes.
struct Sampler {
    sys: System,
    disks: Disks,
    networks: Networks,
}

impl Sampler {
    fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
        }
    }

    fn sample(&mut self) -> TelemetrySnapshot {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        self.sys.refresh_processes();
        self.disks.refresh();
        self.networks.refresh();

        let cpu = self.sys.global_cpu_info().cpu_usage();
        let load = System::load_average();

        let disks = self
            .disks
            .list()
            .iter()
            .map(|d| DiskUsage {
                mount_point: d.mount_point().to_string_lossy().into_owned(),
                total_bytes: d.total_space(),
                used_bytes: d.total_space().saturating_sub(d.available_space()),
            })
            .collect();

        let mut networks: Vec<NetworkUsage> = self
            .networks
            .iter()
            .map(|(name, data)| NetworkUsage {
                name: name.clone(),
                rx_bytes: data.total_received(),
                tx_bytes: data.total_transmitted(),
            })
            .collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));

        TelemetrySnapshot {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            uptime_secs: System::uptime(),
            cpu_percent: if cpu.is_finite() { cpu } else { 0.0 },
            load_average: LoadAverage {
                one: load.one,
                five: load.five,
                fifteen: load.fifteen,
            },
            memory_total_bytes: self.sys.total_memory(),
            memory_used_bytes: self.sys.used_memory(),
            swap_total_bytes: self.sys.total_swap(),
            swap_used_bytes: self.sys.used_swap(),
            process_count: self.sys.processes().len(),
            disks,
            networks,
        }
    }
}

fn ready_event() -> AgentReadyEvent {
    AgentReadyEvent {
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        boot_time: System::boot_time(),
    }
}

/// Run forever, following the link through reconnects.
pub async fn run(link: Arc<Link>, ctx: Arc<HandlerContext>) {
    let config = ctx.config.telemetry.clone();
    let mut sampler = Some(Sampler::new());
    let mut clipboard_seen: Option<String> = None;

    loop {
        let generation = match link.wait_ready().await {
            Ok(generation) => generation,
            Err(e) => {
                warn!(error = %e, "telemetry stopped");
                return;
            }
        };
        if let Err(e) = link
            .send(generation, &Envelope::event(Payload::AgentReady(ready_event())))
            .await
        {
            debug!(generation, error = %e, "ready event not delivered");
            continue;
        }
        info!(generation, "announced agent to host");

        let mut ticker = tokio::time::interval(config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut clipboard_poll = tokio::time::interval(CLIPBOARD_POLL);
        clipboard_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                _ = link.closed(generation) => break,
                _ = ticker.tick(), if config.enabled => {
                    let Some(taken) = sampler.take() else { break };
                    match tokio::task::spawn_blocking(move || {
                        let mut taken = taken;
                        let snapshot = taken.sample();
                        (taken, snapshot)
                    })
                    .await
                    {
                        Ok((returned, snapshot)) => {
                            sampler = Some(returned);
                            Payload::Telemetry(snapshot)
                        }
                        Err(e) => {
                            warn!(error = %e, "telemetry sampling failed");
                            sampler = Some(Sampler::new());
                            continue;
                        }
                    }
                }
                _ = clipboard_poll.tick(), if config.clipboard_watch => {
                    match poll_clipboard(&ctx, &mut clipboard_seen).await {
                        Some(content) => Payload::ClipboardChanged(content),
                        None => continue,
                    }
                }
            };

            match link.send(generation, &Envelope::event(event)).await {
                Ok(()) => {}
                Err(LinkError::Frame(e)) => warn!(error = %e, "event could not be framed"),
                Err(e) => {
                    debug!(generation, error = %e, "connection lost, pausing events");
                    break;
                }
            }
        }
    }
}

/// Report the clipboard when it differs from the last value seen. The first
/// read only records a baseline.
async fn poll_clipboard(ctx: &HandlerContext, seen: &mut Option<String>) -> Option<ClipboardContent> {
    let server = ctx.platform.display_server()?;
    let content = match ctx.platform.clipboard_get(&server).await {
        Ok(content) => content,
        Err(e) => {
            debug!(error = %e, "clipboard poll failed");
            return None;
        }
    };
    let previous = seen.replace(content.clone());
    match previous {
        Some(prev) if prev != content && !content.is_empty() => Some(ClipboardContent {
            content,
            mime_type: "text/plain".to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::handlers::platform::fake::RecordingPlatform;
    use crate::handlers::platform::DisplayServer;
    use crate::handlers::test_support::context_with;
    use guestlink_protocol::codec::FrameDecoder;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    async fn next_event(host: &mut DuplexStream, decoder: &mut FrameDecoder) -> Envelope {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(env) = decoder.next_frame().unwrap() {
                return env;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), host.read(&mut buf))
                .await
                .expect("no event within 5s")
                .unwrap();
            assert!(n > 0);
            decoder.extend(&buf[..n]);
        }
    }

    fn start(config: AgentConfig, platform: RecordingPlatform) -> (Arc<Link>, Arc<RecordingPlatform>) {
        let (ctx, platform) = context_with(config, platform);
        let link = Arc::new(Link::new());
        tokio::spawn(run(link.clone(), Arc::new(ctx)));
        (link, platform)
    }

    #[tokio::test]
    async fn test_silent_until_ready_then_announces() {
        let (link, _) = start(AgentConfig::default(), RecordingPlatform::default());
        let (guest, mut host) = duplex(1 << 16);
        let generation = link.attach(Box::new(guest)).await;

        let mut buf = [0u8; 16];
        let early = tokio::time::timeout(Duration::from_millis(200), host.read(&mut buf)).await;
        assert!(early.is_err(), "event written before the link was ready");

        assert!(link.mark_ready(generation));
        let mut decoder = FrameDecoder::new();
        let ready = next_event(&mut host, &mut decoder).await;
        match ready.payload {
            Payload::AgentReady(r) => {
                assert_eq!(r.version, env!("CARGO_PKG_VERSION"));
                assert_eq!(r.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&mut host, &mut decoder).await.payload {
            Payload::Telemetry(t) => {
                assert!(t.cpu_percent.is_finite());
                assert!(t.memory_total_bytes > 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reannounces_after_reconnect() {
        let mut config = AgentConfig::default();
        config.telemetry.enabled = false;
        let (link, _) = start(config, RecordingPlatform::default());

        let (first, mut first_host) = duplex(1 << 16);
        let generation = link.attach(Box::new(first)).await;
        link.mark_ready(generation);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            next_event(&mut first_host, &mut decoder).await.payload,
            Payload::AgentReady(_)
        ));

        link.detach(generation).await;
        let (second, mut second_host) = duplex(1 << 16);
        let generation = link.attach(Box::new(second)).await;
        link.mark_ready(generation);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            next_event(&mut second_host, &mut decoder).await.payload,
            Payload::AgentReady(_)
        ));
    }

    #[tokio::test]
    async fn test_clipboard_change_is_reported() {
        let mut config = AgentConfig::default();
        config.telemetry.enabled = false;
        config.telemetry.clipboard_watch = true;
        let platform = RecordingPlatform {
            display: Some(DisplayServer::X11 {
                display: ":0".into(),
            }),
            clipboard: std::sync::Mutex::new("before".into()),
            ..Default::default()
        };
        let (link, platform) = start(config, platform);
        let (guest, mut host) = duplex(1 << 16);
        let generation = link.attach(Box::new(guest)).await;
        link.mark_ready(generation);

        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            next_event(&mut host, &mut decoder).await.payload,
            Payload::AgentReady(_)
        ));
        // Let the baseline poll happen before changing the value.
        tokio::time::sleep(Duration::from_millis(300)).await;
        *platform.clipboard.lock().unwrap() = "after".into();

        match next_event(&mut host, &mut decoder).await.payload {
            Payload::ClipboardChanged(c) => {
                assert_eq!(c.content, "after");
                assert_eq!(c.mime_type, "text/plain");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
