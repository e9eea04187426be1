//! The single owned connection to the host.
//!
//! A [`Link`] wraps whichever writer is currently attached together with a
//! generation counter. Every frame the agent emits, responses and events
//! alike, goes through [`Link::send`], which holds the writer lock for the
//! whole frame. Sessions read frames, spawn one task per request, and detach
//! the link when the stream ends.

use std::io;
use std::sync::Arc;

use guestlink_protocol::codec::{encode_envelope, FrameDecoder, FrameError};
use guestlink_protocol::{Envelope, ErrorCode, ErrorResponse, Payload};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::TransportConfig;
use crate::dispatcher::Dispatcher;
use crate::transport;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Requests allowed to run concurrently per session. The read loop stops
/// pulling frames while all permits are taken.
const MAX_IN_FLIGHT: usize = 32;

const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Detached,
    /// A writer is present but the host has not proven it is listening.
    Attached,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub generation: u64,
    pub phase: Phase,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no host connection attached")]
    Detached,
    #[error("connection generation {0} has been replaced")]
    Stale(u64),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("write to host failed: {0}")]
    Io(#[from] io::Error),
}

pub struct Link {
    writer: Mutex<Option<BoxedWriter>>,
    state: watch::Sender<LinkState>,
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LinkState {
            generation: 0,
            phase: Phase::Detached,
        });
        Self {
            writer: Mutex::new(None),
            state,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Install a new writer and return its generation. Any previous writer
    /// is dropped, which makes its in-flight sends stale.
    pub async fn attach(&self, writer: BoxedWriter) -> u64 {
        let mut slot = self.writer.lock().await;
        *slot = Some(writer);
        let mut generation = 0;
        self.state.send_modify(|s| {
            s.generation += 1;
            s.phase = Phase::Attached;
            generation = s.generation;
        });
        generation
    }

    /// Drop the writer, unless a newer session has already replaced it.
    pub async fn detach(&self, generation: u64) {
        let mut slot = self.writer.lock().await;
        if self.state().generation != generation {
            return;
        }
        *slot = None;
        self.state.send_modify(|s| s.phase = Phase::Detached);
    }

    /// Open the gate for background producers. Returns true on the
    /// transition, false if already ready or the generation moved on.
    pub fn mark_ready(&self, generation: u64) -> bool {
        self.state.send_if_modified(|s| {
            if s.generation == generation && s.phase == Phase::Attached {
                s.phase = Phase::Ready;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the current connection is ready and return its generation.
    pub async fn wait_ready(&self) -> Result<u64, LinkError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.phase == Phase::Ready)
            .await
            .map_err(|_| LinkError::Detached)?;
        Ok(state.generation)
    }

    /// Resolves once `generation` is no longer the ready connection.
    pub async fn closed(&self, generation: u64) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|s| s.generation != generation || s.phase != Phase::Ready)
            .await;
    }

    /// Write one whole frame for `generation`. Encoding happens before the
    /// lock is taken so a large payload never holds up other writers.
    pub async fn send(&self, generation: u64, envelope: &Envelope) -> Result<(), LinkError> {
        let frame = encode_envelope(envelope)?;
        let mut slot = self.writer.lock().await;
        if self.state().generation != generation {
            return Err(LinkError::Stale(generation));
        }
        let writer = slot.as_mut().ok_or(LinkError::Detached)?;
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            *slot = None;
            self.state.send_modify(|s| s.phase = Phase::Detached);
            return Err(LinkError::Io(e));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum SessionEnd {
    Eof,
    Io(io::Error),
    /// The host sent a length prefix above the limit; framing is lost.
    Oversized { size: u64, max: u32 },
}

#[derive(Debug)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub frames: u64,
}

/// Serve one attached stream until it ends.
pub async fn run_session<R>(
    link: Arc<Link>,
    dispatcher: Arc<Dispatcher>,
    mut reader: R,
    writer: BoxedWriter,
    host_attached: bool,
    peer: &str,
) -> SessionSummary
where
    R: AsyncRead + Unpin,
{
    let generation = link.attach(writer).await;
    info!(peer, generation, host_attached, "host channel attached");
    if host_attached && link.mark_ready(generation) {
        info!(generation, "link ready");
    }

    let inflight = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut frames = 0u64;

    let end = 'session: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break SessionEnd::Eof,
            Ok(n) => n,
            Err(e) => break SessionEnd::Io(e),
        };
        decoder.extend(&buf[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(request)) => {
                    frames += 1;
                    let Ok(permit) = inflight.clone().acquire_owned().await else {
                        break 'session SessionEnd::Eof;
                    };
                    let link = link.clone();
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        let (response, followup) = dispatcher.dispatch_with_followup(request).await;
                        let delivered = deliver(&link, generation, &response).await;
                        drop(permit);
                        if let (true, Some(followup)) = (delivered, followup) {
                            dispatcher.run_followup(followup).await;
                        }
                    });
                }
                Ok(None) => break,
                Err(FrameError::Malformed {
                    consumed,
                    message_id,
                    unknown_kind,
                    reason,
                }) => {
                    warn!(consumed, message_id = ?message_id, reason = %reason, "skipping malformed frame");
                    let Some(message_id) = message_id else {
                        continue;
                    };
                    let error = match unknown_kind {
                        Some(kind) => ErrorResponse::new(
                            ErrorCode::UnknownMessageType,
                            format!("unknown message type {kind}"),
                        ),
                        None => ErrorResponse::new(ErrorCode::DecodingError, reason),
                    };
                    let reply = Envelope {
                        message_id,
                        timestamp: chrono::Utc::now(),
                        payload: Payload::Error(error),
                    };
                    deliver(&link, generation, &reply).await;
                }
                Err(FrameError::Oversized { size, max }) => {
                    break 'session SessionEnd::Oversized { size, max };
                }
                Err(e @ FrameError::Encode(_)) => {
                    error!(error = %e, "unexpected encode error while decoding");
                    break;
                }
            }
        }
    };

    link.detach(generation).await;
    match &end {
        SessionEnd::Eof => info!(peer, generation, frames, "host channel closed"),
        SessionEnd::Io(e) => warn!(peer, generation, frames, error = %e, "host channel read failed"),
        SessionEnd::Oversized { size, max } => {
            warn!(peer, generation, size, max, "oversized frame, resetting connection")
        }
    }
    SessionSummary { end, frames }
}

/// Send a response. An envelope that cannot be framed is replaced by an
/// error reply with the same id. The first successful write opens the
/// ready gate.
async fn deliver(link: &Link, generation: u64, envelope: &Envelope) -> bool {
    let result = match link.send(generation, envelope).await {
        Err(LinkError::Frame(e)) => {
            warn!(message_id = %envelope.message_id, error = %e, "response could not be framed");
            let code = match e {
                FrameError::Oversized { .. } => ErrorCode::MessageTooLarge,
                _ => ErrorCode::EncodingError,
            };
            let replacement = envelope.reply(Payload::Error(ErrorResponse::new(code, e.to_string())));
            link.send(generation, &replacement).await
        }
        other => other,
    };
    match result {
        Ok(()) => {
            if link.mark_ready(generation) {
                info!(generation, "link ready");
            }
            true
        }
        Err(e @ (LinkError::Stale(_) | LinkError::Detached)) => {
            debug!(message_id = %envelope.message_id, reason = %e, "dropping response");
            false
        }
        Err(e) => {
            warn!(message_id = %envelope.message_id, error = %e, "failed to send response");
            false
        }
    }
}

/// Keeps a host channel attached for the lifetime of the agent.
pub struct ConnectionManager {
    config: TransportConfig,
    link: Arc<Link>,
    dispatcher: Arc<Dispatcher>,
}

impl ConnectionManager {
    pub fn new(config: TransportConfig, link: Arc<Link>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            link,
            dispatcher,
        }
    }

    /// Never returns. A vsock port selects listener mode; otherwise the
    /// virtio-serial device is reopened after every loss.
    pub async fn run(&self) {
        match self.config.vsock_port {
            Some(port) => self.run_listener(port).await,
            None => self.run_device().await,
        }
    }

    async fn run_device(&self) {
        let mut backoff = Backoff::from_config(&self.config);
        loop {
            let (path, stream) = transport::wait_for_device(&self.config.device_path, &mut backoff).await;
            let endpoint = transport::Endpoint::device(&path, stream);
            let (reader, writer) = tokio::io::split(endpoint.stream);
            let summary = run_session(
                self.link.clone(),
                self.dispatcher.clone(),
                reader,
                Box::new(writer),
                endpoint.host_attached,
                &endpoint.peer,
            )
            .await;
            // A device that opens and immediately hits EOF has no host
            // behind it; keep backing off until a session does real work.
            if summary.frames > 0 {
                backoff.reset();
            }
            backoff.wait().await;
        }
    }

    async fn run_listener(&self, port: u32) {
        let mut backoff = Backoff::from_config(&self.config);
        let listener = transport::wait_for_vsock(port, &mut backoff).await;
        info!(port = listener.port(), "listening for host on vsock");
        backoff.reset();
        let mut current: Option<JoinHandle<()>> = None;
        loop {
            let endpoint = match listener.accept().await {
                Ok(endpoint) => {
                    backoff.reset();
                    endpoint
                }
                Err(e) => {
                    warn!(error = %e, "vsock accept failed");
                    backoff.wait().await;
                    continue;
                }
            };
            if let Some(previous) = current.take() {
                if !previous.is_finished() {
                    info!(peer = %endpoint.peer, "new host connection supersedes the current one");
                }
                previous.abort();
            }
            let link = self.link.clone();
            let dispatcher = self.dispatcher.clone();
            current = Some(tokio::spawn(async move {
                let (reader, writer) = tokio::io::split(endpoint.stream);
                run_session(
                    link,
                    dispatcher,
                    reader,
                    Box::new(writer),
                    endpoint.host_attached,
                    &endpoint.peer,
                )
                .await;
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::AgentConfig;
    use crate::handlers::platform::fake::RecordingPlatform;
    use crate::handlers::test_support::context_with;
    use crate::security::{MemoryAuditSink, SecurityPolicy};
    use guestlink_protocol::{LoadAverage, PingRequest, TelemetrySnapshot};
    use tokio::io::{duplex, DuplexStream};

    fn dispatcher() -> Arc<Dispatcher> {
        let config = AgentConfig::default();
        let policy = SecurityPolicy::new(config.security.clone(), Arc::new(MemoryAuditSink::default()));
        let (ctx, _) = context_with(config, RecordingPlatform::default());
        Arc::new(Dispatcher::new(Arc::new(ctx), policy))
    }

    /// Start a session over an in-memory pipe. Returns the host's end.
    fn session(link: Arc<Link>, host_attached: bool) -> (DuplexStream, JoinHandle<SessionSummary>) {
        let (host, guest) = duplex(1 << 20);
        let (reader, writer) = tokio::io::split(guest);
        let handle = tokio::spawn(async move {
            run_session(link, dispatcher(), reader, Box::new(writer), host_attached, "test").await
        });
        (host, handle)
    }

    async fn read_envelope(host: &mut DuplexStream, decoder: &mut FrameDecoder) -> Envelope {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(env) = decoder.next_frame().unwrap() {
                return env;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), host.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(n > 0, "guest closed the channel");
            decoder.extend(&buf[..n]);
        }
    }

    async fn wait_attached(link: &Link) {
        let mut rx = link.state.subscribe();
        rx.wait_for(|s| s.phase != Phase::Detached).await.unwrap();
    }

    fn snapshot() -> Envelope {
        Envelope::event(Payload::Telemetry(TelemetrySnapshot {
            hostname: "guest".into(),
            uptime_secs: 1,
            cpu_percent: 0.5,
            load_average: LoadAverage {
                one: 0.0,
                five: 0.0,
                fifteen: 0.0,
            },
            memory_total_bytes: 1,
            memory_used_bytes: 1,
            swap_total_bytes: 0,
            swap_used_bytes: 0,
            process_count: 1,
            disks: Vec::new(),
            networks: Vec::new(),
        }))
    }

    #[tokio::test]
    async fn test_ready_only_after_first_response() {
        let link = Arc::new(Link::new());
        let (mut host, handle) = session(link.clone(), false);
        wait_attached(&link).await;
        assert_eq!(link.state().phase, Phase::Attached);

        let waiter = {
            let link = link.clone();
            tokio::spawn(async move { link.wait_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let ping = Envelope::request(Payload::Ping(PingRequest { sequence: 1 }));
        host.write_all(&encode_envelope(&ping).unwrap()).await.unwrap();
        let mut decoder = FrameDecoder::new();
        let reply = read_envelope(&mut host, &mut decoder).await;
        assert_eq!(reply.message_id, ping.message_id);

        let generation = waiter.await.unwrap().unwrap();
        assert_eq!(generation, link.state().generation);

        drop(host);
        let summary = handle.await.unwrap();
        assert!(matches!(summary.end, SessionEnd::Eof));
        assert_eq!(summary.frames, 1);
        assert_eq!(link.state().phase, Phase::Detached);
    }

    #[tokio::test]
    async fn test_host_attached_signal_opens_gate() {
        let link = Arc::new(Link::new());
        let (_host, _handle) = session(link.clone(), true);
        let generation = tokio::time::timeout(Duration::from_secs(5), link.wait_ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(generation, 1);
    }

    #[tokio::test]
    async fn test_concurrent_events_and_responses_never_interleave() {
        let link = Arc::new(Link::new());
        let (mut host, _handle) = session(link.clone(), true);
        let generation = link.wait_ready().await.unwrap();

        let producer = {
            let link = link.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    link.send(generation, &snapshot()).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let mut ids = Vec::new();
        for i in 0..50 {
            let ping = Envelope::request(Payload::Ping(PingRequest { sequence: i }));
            ids.push(ping.message_id.clone());
            host.write_all(&encode_envelope(&ping).unwrap()).await.unwrap();
        }
        producer.await.unwrap();

        let mut decoder = FrameDecoder::new();
        let (mut pongs, mut events) = (0, 0);
        while pongs + events < 100 {
            let env = read_envelope(&mut host, &mut decoder).await;
            match env.payload {
                Payload::Pong(_) => {
                    assert!(ids.contains(&env.message_id));
                    pongs += 1;
                }
                Payload::Telemetry(_) => events += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!((pongs, events), (50, 50));
    }

    #[tokio::test]
    async fn test_malformed_frame_with_id_gets_error_reply() {
        let link = Arc::new(Link::new());
        let (mut host, _handle) = session(link.clone(), false);

        let body = br#"{"message_id":"abc-1","timestamp":"2024-01-01T00:00:00Z","payload":{"type":"Teleport"}}"#;
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        host.write_all(&frame).await.unwrap();

        let body = br#"{"message_id":"abc-2","timestamp":"2024-01-01T00:00:00Z","payload":{"type":"Ping","sequence":"x"}}"#;
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        host.write_all(&frame).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let first = read_envelope(&mut host, &mut decoder).await;
        assert_eq!(first.message_id, "abc-1");
        match first.payload {
            Payload::Error(e) => assert!(e.is(ErrorCode::UnknownMessageType)),
            other => panic!("unexpected {other:?}"),
        }
        let second = read_envelope(&mut host, &mut decoder).await;
        assert_eq!(second.message_id, "abc-2");
        match second.payload {
            Payload::Error(e) => assert!(e.is(ErrorCode::DecodingError)),
            other => panic!("unexpected {other:?}"),
        }

        // The stream is still usable afterwards.
        let ping = Envelope::request(Payload::Ping(PingRequest { sequence: 3 }));
        host.write_all(&encode_envelope(&ping).unwrap()).await.unwrap();
        assert_eq!(read_envelope(&mut host, &mut decoder).await.message_id, ping.message_id);
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_session() {
        let link = Arc::new(Link::new());
        let (mut host, handle) = session(link.clone(), false);
        host.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(summary.end, SessionEnd::Oversized { .. }));
        assert_eq!(link.state().phase, Phase::Detached);
    }

    #[tokio::test]
    async fn test_stale_generation_is_dropped() {
        let link = Link::new();
        let (first, _keep_first) = duplex(1024);
        let old = link.attach(Box::new(first)).await;
        let (second, mut host) = duplex(1024);
        let current = link.attach(Box::new(second)).await;
        assert_ne!(old, current);

        assert!(matches!(
            link.send(old, &snapshot()).await,
            Err(LinkError::Stale(g)) if g == old
        ));
        link.detach(old).await;
        assert_eq!(link.state().phase, Phase::Attached);

        link.send(current, &snapshot()).await.unwrap();
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            read_envelope(&mut host, &mut decoder).await.payload,
            Payload::Telemetry(_)
        ));

        link.detach(current).await;
        assert!(matches!(link.send(current, &snapshot()).await, Err(LinkError::Detached)));
    }
}
