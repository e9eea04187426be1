//! Request/response client for one guest agent.
//!
//! Requests are correlated by `message_id`, so any number of them can be in
//! flight on one connection. A background task owns the read half, routes
//! responses to their waiters and fans unsolicited events out to
//! subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use guestlink_protocol::{
    encode_envelope, CapabilitiesResponse, DirEntry, Direction, DirectoryListRequest,
    DirectoryListingResponse, Envelope, ExecuteRequest, ExecuteResponse, FileDeleteRequest,
    FileInfoResponse, FileReadRequest, FileStatRequest, FileWriteRequest, FrameDecoder, FrameError,
    NetworkConfig, Payload, PingRequest, PongResponse, PowerRequest, QuiesceRequest,
    QuiesceResponse, ResetPasswordRequest, RunAs, ThawRequest, ThawResponse, UpdateChunkRequest,
    UpdateState, UpdateStatusResponse,
};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::transport::{self, AgentAddress, BoxedWriter};

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BUF_SIZE: usize = 64 * 1024;

type Reply = std::result::Result<Envelope, ClientError>;

struct Shared {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    subscribers: Mutex<Vec<mpsc::Sender<Envelope>>>,
    closed: AtomicBool,
}

impl Shared {
    fn route(&self, envelope: Envelope) {
        if envelope.direction() == Direction::Event {
            self.publish(envelope);
            return;
        }
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&envelope.message_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(envelope));
            }
            None => debug!(message_id = %envelope.message_id, "response with no waiting request"),
        }
    }

    fn publish(&self, event: Envelope) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(kind = event.payload.kind(), "event subscriber is lagging, dropping event");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Hand an undecodable frame to the request it answers, if any.
    fn reject(&self, err: FrameError) {
        let message_id = match &err {
            FrameError::Malformed { message_id, .. } => message_id.clone(),
            _ => None,
        };
        let waiter = message_id
            .as_ref()
            .and_then(|id| self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(Err(ClientError::Frame(err)));
            }
            None => warn!(error = %err, "skipping malformed frame from guest agent"),
        }
    }

    /// Waiters see their sender dropped and report `ConnectionClosed`;
    /// subscribers see their stream end.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Drops the pending entry when a request finishes, times out or is
/// cancelled.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub struct AgentClient {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    config: ClientConfig,
    sequence: AtomicU64,
}

impl AgentClient {
    pub async fn connect(address: &AgentAddress, config: ClientConfig) -> Result<Self> {
        let limit = config.connect_timeout();
        let (reader, writer) = tokio::time::timeout(limit, transport::connect(address))
            .await
            .map_err(|_| ClientError::Timeout(limit))??;
        debug!(%address, "connected to guest agent");
        Ok(Self::from_stream(reader, writer, config))
    }

    /// Wrap an already-connected stream. Must be called inside a runtime.
    pub fn from_stream<R>(reader: R, writer: BoxedWriter, config: ClientConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(shared.clone(), reader));
        Self {
            shared,
            reader,
            config,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst) || self.reader.is_finished()
    }

    /// Tear the connection down. Waiting requests fail with
    /// `ConnectionClosed`.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.shared.shut();
    }

    /// Unsolicited events (ready, telemetry, clipboard). Each call creates
    /// an independent subscription.
    pub fn subscribe_events(&self) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        if !self.is_closed() {
            self.shared
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(tx);
        }
        rx
    }

    pub async fn request(&self, payload: Payload) -> Result<Payload> {
        self.request_with_timeout(payload, self.config.request_timeout())
            .await
    }

    /// Send one request and wait for its response. An `Error` payload is
    /// returned as `ClientError::Remote`.
    pub async fn request_with_timeout(&self, payload: Payload, timeout: Duration) -> Result<Payload> {
        if self.is_closed() {
            return Err(ClientError::NotConnected);
        }
        let kind = payload.kind();
        let envelope = Envelope::request(payload);
        let frame = encode_envelope(&envelope)?;

        let (tx, rx) = oneshot::channel();
        let id = envelope.message_id;
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);
        let _guard = PendingGuard {
            shared: &self.shared,
            id: id.clone(),
        };

        let exchange = async {
            {
                let mut slot = self.shared.writer.lock().await;
                let writer = slot.as_mut().ok_or(ClientError::NotConnected)?;
                writer.write_all(&frame).await?;
                writer.flush().await?;
            }
            trace!(message_id = %id, kind, "request sent");
            rx.await.map_err(|_| ClientError::ConnectionClosed)?
        };
        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;

        match reply.payload {
            Payload::Error(e) => Err(ClientError::Remote(e)),
            other => Ok(other),
        }
    }

    // --- health ---

    pub async fn ping(&self) -> Result<PongResponse> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        match self
            .request_with_timeout(Payload::Ping(PingRequest { sequence }), PING_TIMEOUT)
            .await?
        {
            Payload::Pong(pong) => Ok(pong),
            other => Err(unexpected("Ping", other)),
        }
    }

    pub async fn is_reachable(&self) -> bool {
        self.ping().await.is_ok()
    }

    // --- execution ---

    /// Run a shell command, optionally as another user.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        identity: Option<RunAs>,
    ) -> Result<ExecuteResponse> {
        let mut req = ExecuteRequest::shell(command, timeout.as_secs().max(1));
        req.run_as = identity;
        self.execute_full(req).await
    }

    pub async fn execute_full(&self, req: ExecuteRequest) -> Result<ExecuteResponse> {
        // The agent enforces the command timeout; allow for transfer on top.
        let wait = Duration::from_secs(req.timeout_secs) + self.config.request_timeout();
        match self.request_with_timeout(Payload::Execute(req), wait).await? {
            Payload::ExecuteResult(result) => Ok(result),
            other => Err(unexpected("Execute", other)),
        }
    }

    // --- files ---

    /// Read a whole file, one chunk per request.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut offset = 0u64;
        loop {
            let req = FileReadRequest {
                path: path.to_string(),
                offset,
                length: Some(self.config.file_chunk_size as u64),
            };
            let chunk = match self.request(Payload::FileRead(req)).await? {
                Payload::FileContent(chunk) => chunk,
                other => return Err(unexpected("FileRead", other)),
            };
            let bytes = decode_base64(&chunk.data)?;
            offset += bytes.len() as u64;
            data.extend_from_slice(&bytes);
            // An empty non-final chunk means the file shrank under us.
            if chunk.eof || bytes.is_empty() {
                break;
            }
        }
        Ok(data)
    }

    /// Write a whole file, replacing any previous content. Returns the
    /// agent's view of the file after the last chunk.
    pub async fn write_file(&self, path: &str, data: &[u8], mode: Option<u32>) -> Result<FileInfoResponse> {
        let chunk_size = self.config.file_chunk_size.max(1);
        let mut offset = 0usize;
        loop {
            let end = (offset + chunk_size).min(data.len());
            let req = FileWriteRequest {
                path: path.to_string(),
                data: BASE64.encode(&data[offset..end]),
                offset: (offset > 0).then_some(offset as u64),
                append: false,
                mode: if offset == 0 { mode } else { None },
                create_parents: true,
            };
            let info = match self.request(Payload::FileWrite(req)).await? {
                Payload::FileInfo(info) => info,
                other => return Err(unexpected("FileWrite", other)),
            };
            offset = end;
            if offset >= data.len() {
                return Ok(info);
            }
        }
    }

    /// One page of a listing. Pass the previous page's token to continue.
    pub async fn list_directory(
        &self,
        path: &str,
        continuation_token: Option<String>,
    ) -> Result<DirectoryListingResponse> {
        let req = DirectoryListRequest {
            path: path.to_string(),
            continuation_token,
            max_entries: 1000,
            include_hidden: true,
        };
        match self.request(Payload::DirectoryList(req)).await? {
            Payload::DirectoryListing(listing) => Ok(listing),
            other => Err(unexpected("DirectoryList", other)),
        }
    }

    pub async fn list_directory_all(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut token = None;
        loop {
            let page = self.list_directory(path, token).await?;
            entries.extend(page.entries);
            match page.continuation_token {
                Some(next) => token = Some(next),
                None => return Ok(entries),
            }
        }
    }

    pub async fn delete_file(&self, path: &str, recursive: bool) -> Result<()> {
        let req = FileDeleteRequest {
            path: path.to_string(),
            recursive,
        };
        match self.request(Payload::FileDelete(req)).await? {
            Payload::Ok => Ok(()),
            other => Err(unexpected("FileDelete", other)),
        }
    }

    pub async fn stat_file(&self, path: &str) -> Result<FileInfoResponse> {
        let req = FileStatRequest {
            path: path.to_string(),
        };
        match self.request(Payload::FileStat(req)).await? {
            Payload::FileInfo(info) => Ok(info),
            other => Err(unexpected("FileStat", other)),
        }
    }

    // --- lifecycle ---

    pub async fn shutdown(&self, req: PowerRequest) -> Result<()> {
        self.power(Payload::Shutdown(req), "Shutdown").await
    }

    pub async fn reboot(&self, req: PowerRequest) -> Result<()> {
        self.power(Payload::Reboot(req), "Reboot").await
    }

    /// The agent acknowledges before acting, but with no delay the channel
    /// can drop first; a closed connection counts as accepted.
    async fn power(&self, payload: Payload, request: &'static str) -> Result<()> {
        match self.request(payload).await {
            Ok(Payload::Ok) => Ok(()),
            Ok(other) => Err(unexpected(request, other)),
            Err(ClientError::ConnectionClosed) => {
                debug!(request, "connection closed during power request");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn reset_password(&self, username: &str, password: &str) -> Result<()> {
        let req = ResetPasswordRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        match self.request(Payload::ResetPassword(req)).await? {
            Payload::Ok => Ok(()),
            other => Err(unexpected("ResetPassword", other)),
        }
    }

    pub async fn configure_network(&self, config: NetworkConfig) -> Result<()> {
        match self.request(Payload::ConfigureNetwork(config)).await? {
            Payload::Ok => Ok(()),
            other => Err(unexpected("ConfigureNetwork", other)),
        }
    }

    // --- quiescing ---

    /// Freeze `mount_points` (all writable filesystems when empty). The
    /// agent thaws on its own after `auto_thaw`.
    pub async fn quiesce(&self, mount_points: Vec<String>, auto_thaw: Duration) -> Result<QuiesceResponse> {
        let req = QuiesceRequest {
            mount_points,
            timeout_secs: auto_thaw.as_secs().max(1),
            run_scripts: true,
        };
        match self.request(Payload::Quiesce(req)).await? {
            Payload::QuiesceResult(result) => Ok(result),
            other => Err(unexpected("Quiesce", other)),
        }
    }

    pub async fn thaw(&self, token: Option<String>) -> Result<ThawResponse> {
        match self.request(Payload::Thaw(ThawRequest { token })).await? {
            Payload::ThawResult(result) => Ok(result),
            other => Err(unexpected("Thaw", other)),
        }
    }

    // --- capabilities and update ---

    pub async fn get_capabilities(&self) -> Result<CapabilitiesResponse> {
        match self.request(Payload::GetCapabilities).await? {
            Payload::Capabilities(caps) => Ok(caps),
            other => Err(unexpected("GetCapabilities", other)),
        }
    }

    pub async fn update_status(&self) -> Result<UpdateStatusResponse> {
        match self.request(Payload::UpdateStatusQuery).await? {
            Payload::UpdateStatus(status) => Ok(status),
            other => Err(unexpected("UpdateStatusQuery", other)),
        }
    }

    /// Send a new agent binary in order and return every state the agent
    /// reported entering. Stops at the first rejected chunk.
    pub async fn push_update(
        &self,
        bytes: &[u8],
        version: &str,
        expected_digest: &str,
    ) -> Result<Vec<UpdateState>> {
        let chunk_size = self.config.update_chunk_size.max(1);
        let parts: Vec<&[u8]> = if bytes.is_empty() {
            vec![bytes]
        } else {
            bytes.chunks(chunk_size).collect()
        };
        let total_chunks = parts.len() as u32;
        let mut transitions = Vec::new();
        for (sequence, part) in parts.into_iter().enumerate() {
            let req = UpdateChunkRequest {
                version: version.to_string(),
                sequence: sequence as u32,
                total_chunks,
                data: BASE64.encode(part),
                expected_sha256: expected_digest.to_string(),
            };
            match self.request(Payload::UpdateChunk(req)).await? {
                Payload::UpdateStatus(status) => transitions.extend(status.transitions),
                other => return Err(unexpected("UpdateChunk", other)),
            }
        }
        debug!(version, chunks = total_chunks, "update pushed");
        Ok(transitions)
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Hex SHA-256 as expected by [`AgentClient::push_update`].
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn unexpected(request: &'static str, received: Payload) -> ClientError {
    ClientError::UnexpectedResponse {
        request,
        received: received.kind(),
    }
}

fn decode_base64(data: &str) -> Result<Vec<u8>> {
    BASE64.decode(data.as_bytes()).map_err(|e| {
        ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("file chunk is not valid base64: {e}"),
        ))
    })
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("guest agent closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "read from guest agent failed");
                break;
            }
        };
        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(envelope)) => shared.route(envelope),
                Ok(None) => break,
                Err(err) if err.is_recoverable() => shared.reject(err),
                Err(err) => {
                    warn!(error = %err, "unrecoverable framing error, dropping connection");
                    break 'read;
                }
            }
        }
    }
    shared.shut();
}
