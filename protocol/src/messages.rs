use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorResponse;

// ---------------------------------------------------------------------------
// Payload union
// ---------------------------------------------------------------------------

/// Which way a payload kind travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host -> guest, answered with exactly one response.
    Request,
    /// Guest -> host, correlated to a request by `message_id`.
    Response,
    /// Guest -> host, unsolicited, carries a fresh `message_id`.
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    // --- requests ---
    /// Health check.
    Ping(PingRequest),
    /// Run a command in the guest.
    Execute(ExecuteRequest),
    /// Read one chunk of a file.
    FileRead(FileReadRequest),
    /// Write one chunk of a file.
    FileWrite(FileWriteRequest),
    FileDelete(FileDeleteRequest),
    FileStat(FileStatRequest),
    /// One page of a directory listing.
    DirectoryList(DirectoryListRequest),
    DirectoryCreate(DirectoryCreateRequest),
    Shutdown(PowerRequest),
    Reboot(PowerRequest),
    ResetPassword(ResetPasswordRequest),
    ConfigureNetwork(NetworkConfig),
    /// Freeze filesystems for a consistent snapshot.
    Quiesce(QuiesceRequest),
    Thaw(ThawRequest),
    SyncTime(SyncTimeRequest),
    DisplayResize(DisplayResizeRequest),
    ClipboardGet,
    ClipboardSet(ClipboardSetRequest),
    ProcessList(ProcessListRequest),
    ProcessKill(ProcessKillRequest),
    ServiceList(ServiceListRequest),
    ServiceControl(ServiceControlRequest),
    HardwareInfo,
    SoftwareList(SoftwareListRequest),
    GetCapabilities,
    /// One chunk of a self-update transfer.
    UpdateChunk(UpdateChunkRequest),
    UpdateStatusQuery,

    // --- responses ---
    Pong(PongResponse),
    ExecuteResult(ExecuteResponse),
    FileContent(FileContentResponse),
    FileInfo(FileInfoResponse),
    DirectoryListing(DirectoryListingResponse),
    /// Acknowledgment of an operation with nothing to report.
    Ok,
    Error(ErrorResponse),
    QuiesceResult(QuiesceResponse),
    ThawResult(ThawResponse),
    TimeSyncResult(TimeSyncResponse),
    Clipboard(ClipboardContent),
    ProcessListing(ProcessListResponse),
    ServiceListing(ServiceListResponse),
    ServiceStatus(ServiceInfo),
    Hardware(HardwareInfoResponse),
    Software(SoftwareListResponse),
    Capabilities(CapabilitiesResponse),
    UpdateStatus(UpdateStatusResponse),

    // --- events ---
    AgentReady(AgentReadyEvent),
    Telemetry(TelemetrySnapshot),
    ClipboardChanged(ClipboardContent),
}

impl Payload {
    /// Every wire tag, in declaration order.
    pub const KINDS: &'static [&'static str] = &[
        "Ping",
        "Execute",
        "FileRead",
        "FileWrite",
        "FileDelete",
        "FileStat",
        "DirectoryList",
        "DirectoryCreate",
        "Shutdown",
        "Reboot",
        "ResetPassword",
        "ConfigureNetwork",
        "Quiesce",
        "Thaw",
        "SyncTime",
        "DisplayResize",
        "ClipboardGet",
        "ClipboardSet",
        "ProcessList",
        "ProcessKill",
        "ServiceList",
        "ServiceControl",
        "HardwareInfo",
        "SoftwareList",
        "GetCapabilities",
        "UpdateChunk",
        "UpdateStatusQuery",
        "Pong",
        "ExecuteResult",
        "FileContent",
        "FileInfo",
        "DirectoryListing",
        "Ok",
        "Error",
        "QuiesceResult",
        "ThawResult",
        "TimeSyncResult",
        "Clipboard",
        "ProcessListing",
        "ServiceListing",
        "ServiceStatus",
        "Hardware",
        "Software",
        "Capabilities",
        "UpdateStatus",
        "AgentReady",
        "Telemetry",
        "ClipboardChanged",
    ];

    pub fn is_known_kind(tag: &str) -> bool {
        Self::KINDS.contains(&tag)
    }

    /// The wire tag of this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Ping(_) => "Ping",
            Payload::Execute(_) => "Execute",
            Payload::FileRead(_) => "FileRead",
            Payload::FileWrite(_) => "FileWrite",
            Payload::FileDelete(_) => "FileDelete",
            Payload::FileStat(_) => "FileStat",
            Payload::DirectoryList(_) => "DirectoryList",
            Payload::DirectoryCreate(_) => "DirectoryCreate",
            Payload::Shutdown(_) => "Shutdown",
            Payload::Reboot(_) => "Reboot",
            Payload::ResetPassword(_) => "ResetPassword",
            Payload::ConfigureNetwork(_) => "ConfigureNetwork",
            Payload::Quiesce(_) => "Quiesce",
            Payload::Thaw(_) => "Thaw",
            Payload::SyncTime(_) => "SyncTime",
            Payload::DisplayResize(_) => "DisplayResize",
            Payload::ClipboardGet => "ClipboardGet",
            Payload::ClipboardSet(_) => "ClipboardSet",
            Payload::ProcessList(_) => "ProcessList",
            Payload::ProcessKill(_) => "ProcessKill",
            Payload::ServiceList(_) => "ServiceList",
            Payload::ServiceControl(_) => "ServiceControl",
            Payload::HardwareInfo => "HardwareInfo",
            Payload::SoftwareList(_) => "SoftwareList",
            Payload::GetCapabilities => "GetCapabilities",
            Payload::UpdateChunk(_) => "UpdateChunk",
            Payload::UpdateStatusQuery => "UpdateStatusQuery",
            Payload::Pong(_) => "Pong",
            Payload::ExecuteResult(_) => "ExecuteResult",
            Payload::FileContent(_) => "FileContent",
            Payload::FileInfo(_) => "FileInfo",
            Payload::DirectoryListing(_) => "DirectoryListing",
            Payload::Ok => "Ok",
            Payload::Error(_) => "Error",
            Payload::QuiesceResult(_) => "QuiesceResult",
            Payload::ThawResult(_) => "ThawResult",
            Payload::TimeSyncResult(_) => "TimeSyncResult",
            Payload::Clipboard(_) => "Clipboard",
            Payload::ProcessListing(_) => "ProcessListing",
            Payload::ServiceListing(_) => "ServiceListing",
            Payload::ServiceStatus(_) => "ServiceStatus",
            Payload::Hardware(_) => "Hardware",
            Payload::Software(_) => "Software",
            Payload::Capabilities(_) => "Capabilities",
            Payload::UpdateStatus(_) => "UpdateStatus",
            Payload::AgentReady(_) => "AgentReady",
            Payload::Telemetry(_) => "Telemetry",
            Payload::ClipboardChanged(_) => "ClipboardChanged",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Payload::Ping(_)
            | Payload::Execute(_)
            | Payload::FileRead(_)
            | Payload::FileWrite(_)
            | Payload::FileDelete(_)
            | Payload::FileStat(_)
            | Payload::DirectoryList(_)
            | Payload::DirectoryCreate(_)
            | Payload::Shutdown(_)
            | Payload::Reboot(_)
            | Payload::ResetPassword(_)
            | Payload::ConfigureNetwork(_)
            | Payload::Quiesce(_)
            | Payload::Thaw(_)
            | Payload::SyncTime(_)
            | Payload::DisplayResize(_)
            | Payload::ClipboardGet
            | Payload::ClipboardSet(_)
            | Payload::ProcessList(_)
            | Payload::ProcessKill(_)
            | Payload::ServiceList(_)
            | Payload::ServiceControl(_)
            | Payload::HardwareInfo
            | Payload::SoftwareList(_)
            | Payload::GetCapabilities
            | Payload::UpdateChunk(_)
            | Payload::UpdateStatusQuery => Direction::Request,

            Payload::Pong(_)
            | Payload::ExecuteResult(_)
            | Payload::FileContent(_)
            | Payload::FileInfo(_)
            | Payload::DirectoryListing(_)
            | Payload::Ok
            | Payload::Error(_)
            | Payload::QuiesceResult(_)
            | Payload::ThawResult(_)
            | Payload::TimeSyncResult(_)
            | Payload::Clipboard(_)
            | Payload::ProcessListing(_)
            | Payload::ServiceListing(_)
            | Payload::ServiceStatus(_)
            | Payload::Hardware(_)
            | Payload::Software(_)
            | Payload::Capabilities(_)
            | Payload::UpdateStatus(_) => Direction::Response,

            Payload::AgentReady(_) | Payload::Telemetry(_) | Payload::ClipboardChanged(_) => {
                Direction::Event
            }
        }
    }
}

impl From<ErrorResponse> for Payload {
    fn from(err: ErrorResponse) -> Self {
        Payload::Error(err)
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Host -> Guest requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default)]
    pub sequence: u64,
}

/// Identity to run a command as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAs {
    pub user: String,
    /// Primary group override; defaults to the user's login group.
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Shell string when `args` is empty, program path otherwise.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub run_as: Option<RunAs>,
    #[serde(default = "default_true")]
    pub wait_for_exit: bool,
    /// Per-stream output cap; the agent's configured cap applies when unset.
    #[serde(default)]
    pub max_output_bytes: Option<u64>,
}

fn default_exec_timeout() -> u64 {
    60
}

impl ExecuteRequest {
    pub fn shell(command: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            workdir: None,
            timeout_secs,
            run_as: None,
            wait_for_exit: true,
            max_output_bytes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReadRequest {
    pub path: String,
    #[serde(default)]
    pub offset: u64,
    /// Bytes to read; capped by the agent's chunk size.
    #[serde(default)]
    pub length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWriteRequest {
    pub path: String,
    /// Base64-encoded content.
    pub data: String,
    /// Write at this offset without truncating. `None` truncates first.
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub append: bool,
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default = "default_true")]
    pub create_parents: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDeleteRequest {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatRequest {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryListRequest {
    pub path: String,
    /// Opaque token from a previous page.
    #[serde(default)]
    pub continuation_token: Option<String>,
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
    #[serde(default)]
    pub include_hidden: bool,
}

fn default_max_entries() -> u32 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryCreateRequest {
    pub path: String,
    #[serde(default = "default_true")]
    pub parents: bool,
    #[serde(default)]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerRequest {
    #[serde(default)]
    pub delay_secs: u64,
    /// Wall message broadcast to logged-in users.
    #[serde(default)]
    pub message: Option<String>,
    /// Skip the init system and power off immediately.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetPasswordRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Address in CIDR form, e.g. `10.0.0.5/24`.
    pub address: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
    #[serde(default)]
    pub mtu: Option<u32>,
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_dns() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuiesceRequest {
    /// Mount points to freeze; empty means every writable local filesystem.
    #[serde(default)]
    pub mount_points: Vec<String>,
    /// Automatic thaw deadline.
    #[serde(default = "default_quiesce_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub run_scripts: bool,
}

fn default_quiesce_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThawRequest {
    /// Token from the matching quiesce; any token is accepted when unset.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncTimeRequest {
    /// Set the clock to this instant instead of asking a time source.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayResizeRequest {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipboardSetRequest {
    pub content: String,
    #[serde(default = "default_mime")]
    pub mime_type: String,
}

fn default_mime() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessListRequest {
    #[serde(default)]
    pub name_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessKillRequest {
    pub pid: u32,
    /// Signal number (default: 15 = SIGTERM).
    #[serde(default = "default_kill_signal")]
    pub signal: i32,
}

fn default_kill_signal() -> i32 {
    15
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceListRequest {
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
    Status,
}

impl ServiceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Reload => "reload",
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
            ServiceAction::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceControlRequest {
    pub name: String,
    pub action: ServiceAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SoftwareListRequest {
    #[serde(default)]
    pub name_filter: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateChunkRequest {
    pub version: String,
    /// Zero-based; sequence 0 starts a new transfer.
    pub sequence: u32,
    pub total_chunks: u32,
    /// Base64-encoded chunk bytes.
    pub data: String,
    /// Hex SHA-256 of the complete binary.
    pub expected_sha256: String,
}

// ---------------------------------------------------------------------------
// Guest -> Host responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongResponse {
    pub sequence: u64,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// `None` when the process was killed by a signal or is still running.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileContentResponse {
    /// Base64-encoded chunk.
    pub data: String,
    pub offset: u64,
    /// Bytes in this chunk.
    pub size: u64,
    pub total_size: u64,
    pub eof: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfoResponse {
    pub path: String,
    pub exists: bool,
    #[serde(default)]
    pub kind: Option<FileKind>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mode: u32,
    /// Unix permission string, e.g. "rwxr-xr-x"
    #[serde(default)]
    pub permissions: String,
    /// Modified time as Unix timestamp (seconds since epoch)
    #[serde(default)]
    pub modified: Option<u64>,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub permissions: String,
    pub modified: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryListingResponse {
    pub path: String,
    pub entries: Vec<DirEntry>,
    /// Present when more entries remain.
    #[serde(default)]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuiesceResponse {
    pub token: String,
    pub frozen: Vec<String>,
    pub auto_thaw_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThawResponse {
    pub thawed: Vec<String>,
    pub frozen_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSyncResponse {
    /// Which mechanism set the clock, e.g. "chronyc" or "manual".
    pub method: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipboardContent {
    pub content: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub command: Vec<String>,
    pub user_id: Option<u32>,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub status: String,
    pub start_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessListResponse {
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceListResponse {
    pub services: Vec<ServiceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub name: String,
    pub mount_point: String,
    pub file_system: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub removable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NicInfo {
    pub name: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfoResponse {
    pub hostname: String,
    pub os_name: String,
    pub os_version: String,
    pub kernel_version: String,
    pub arch: String,
    pub cpu_model: String,
    pub cpu_count: usize,
    pub physical_cores: Option<usize>,
    pub total_memory_bytes: u64,
    pub total_swap_bytes: u64,
    pub disks: Vec<DiskInfo>,
    pub network_interfaces: Vec<NicInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftwarePackage {
    pub name: String,
    pub version: String,
    /// Package database the entry came from ("dpkg" or "rpm").
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftwareListResponse {
    pub packages: Vec<SoftwarePackage>,
    /// Matching packages before `limit` was applied.
    pub total: usize,
}

/// What the agent can do on this guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub version: String,
    pub protocol_version: u32,
    pub os: String,
    pub arch: String,
    pub capabilities: Vec<String>,
    pub features: BTreeMap<String, bool>,
}

impl CapabilitiesResponse {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn feature(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }
}

/// Self-update progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Downloading {
        received_chunks: u32,
        total_chunks: u32,
        received_bytes: u64,
    },
    Verifying,
    Applying,
    Complete {
        version: String,
    },
    Failed {
        reason: String,
    },
    RollingBack,
}

impl UpdateState {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Downloading { .. } => "downloading",
            UpdateState::Verifying => "verifying",
            UpdateState::Applying => "applying",
            UpdateState::Complete { .. } => "complete",
            UpdateState::Failed { .. } => "failed",
            UpdateState::RollingBack => "rolling_back",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatusResponse {
    pub state: UpdateState,
    pub current_version: String,
    /// States entered while handling the request, oldest first.
    #[serde(default)]
    pub transitions: Vec<UpdateState>,
}

// ---------------------------------------------------------------------------
// Guest -> Host events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReadyEvent {
    pub version: String,
    pub protocol_version: u32,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub boot_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkUsage {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Point-in-time resource usage, sent on every telemetry tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub hostname: String,
    pub uptime_secs: u64,
    pub cpu_percent: f32,
    pub load_average: LoadAverage,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub process_count: usize,
    pub disks: Vec<DiskUsage>,
    pub networks: Vec<NetworkUsage>,
}
