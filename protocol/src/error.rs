use serde::{Deserialize, Serialize};

/// Broad class of an error. Every category owns one numeric band of a
/// thousand codes, so callers can branch on `code / 1000` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Execution,
    File,
    Lifecycle,
    Desktop,
    ProcessService,
    Security,
    Internal,
}

impl ErrorCategory {
    /// First code of the category's band.
    pub const fn band(self) -> u16 {
        match self {
            ErrorCategory::Transport => 1000,
            ErrorCategory::Protocol => 2000,
            ErrorCategory::Execution => 3000,
            ErrorCategory::File => 4000,
            ErrorCategory::Lifecycle => 5000,
            ErrorCategory::Desktop => 6000,
            ErrorCategory::ProcessService => 7000,
            ErrorCategory::Security => 8000,
            ErrorCategory::Internal => 9000,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code / 1000 {
            1 => Some(ErrorCategory::Transport),
            2 => Some(ErrorCategory::Protocol),
            3 => Some(ErrorCategory::Execution),
            4 => Some(ErrorCategory::File),
            5 => Some(ErrorCategory::Lifecycle),
            6 => Some(ErrorCategory::Desktop),
            7 => Some(ErrorCategory::ProcessService),
            8 => Some(ErrorCategory::Security),
            9 => Some(ErrorCategory::Internal),
            _ => None,
        }
    }
}

macro_rules! error_codes {
    ($( $variant:ident = $code:literal => $name:literal, )*) => {
        /// Closed set of error codes the agent can report.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ErrorCode {
            $( $variant, )*
        }

        impl ErrorCode {
            pub const ALL: &'static [ErrorCode] = &[ $( ErrorCode::$variant, )* ];

            pub const fn code(self) -> u16 {
                match self {
                    $( ErrorCode::$variant => $code, )*
                }
            }

            /// Symbolic name as it appears on the wire, e.g. `ALREADY_QUIESCED`.
            pub const fn name(self) -> &'static str {
                match self {
                    $( ErrorCode::$variant => $name, )*
                }
            }

            pub fn from_code(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(ErrorCode::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

error_codes! {
    // Transport
    DeviceNotFound = 1001 => "DEVICE_NOT_FOUND",
    DeviceOpenFailed = 1002 => "DEVICE_OPEN_FAILED",
    ConnectionLost = 1003 => "CONNECTION_LOST",
    WriteFailed = 1004 => "WRITE_FAILED",
    ReadFailed = 1005 => "READ_FAILED",
    DeviceBusy = 1006 => "DEVICE_BUSY",
    VsockUnavailable = 1007 => "VSOCK_UNAVAILABLE",
    ConnectionTimeout = 1008 => "CONNECTION_TIMEOUT",
    // Protocol
    InvalidMessage = 2001 => "INVALID_MESSAGE",
    UnknownMessageType = 2002 => "UNKNOWN_MESSAGE_TYPE",
    MessageTooLarge = 2003 => "MESSAGE_TOO_LARGE",
    MissingPayload = 2004 => "MISSING_PAYLOAD",
    InvalidMessageId = 2005 => "INVALID_MESSAGE_ID",
    EncodingError = 2006 => "ENCODING_ERROR",
    DecodingError = 2007 => "DECODING_ERROR",
    // Execution
    CommandNotFound = 3001 => "COMMAND_NOT_FOUND",
    PermissionDenied = 3002 => "PERMISSION_DENIED",
    ExecutionTimeout = 3003 => "EXECUTION_TIMEOUT",
    ExecutionFailed = 3004 => "EXECUTION_FAILED",
    UserNotFound = 3005 => "USER_NOT_FOUND",
    GroupNotFound = 3006 => "GROUP_NOT_FOUND",
    SetuidFailed = 3007 => "SETUID_FAILED",
    WorkingDirNotFound = 3008 => "WORKING_DIR_NOT_FOUND",
    SpawnFailed = 3009 => "SPAWN_FAILED",
    // File
    FileNotFound = 4001 => "FILE_NOT_FOUND",
    FileAccessDenied = 4002 => "FILE_ACCESS_DENIED",
    FileAlreadyExists = 4003 => "FILE_ALREADY_EXISTS",
    DirectoryNotFound = 4004 => "DIRECTORY_NOT_FOUND",
    NotADirectory = 4005 => "NOT_A_DIRECTORY",
    NotAFile = 4006 => "NOT_A_FILE",
    PathTraversalBlocked = 4007 => "PATH_TRAVERSAL_BLOCKED",
    InvalidPath = 4008 => "INVALID_PATH",
    DiskFull = 4010 => "DISK_FULL",
    FileTooLarge = 4011 => "FILE_TOO_LARGE",
    InvalidOffset = 4012 => "INVALID_OFFSET",
    DeleteFailed = 4013 => "DELETE_FAILED",
    MkdirFailed = 4014 => "MKDIR_FAILED",
    FileIoError = 4015 => "FILE_IO_ERROR",
    // Lifecycle
    ShutdownFailed = 5001 => "SHUTDOWN_FAILED",
    RebootFailed = 5002 => "REBOOT_FAILED",
    PasswordResetFailed = 5003 => "PASSWORD_RESET_FAILED",
    NetworkConfigFailed = 5004 => "NETWORK_CONFIG_FAILED",
    QuiesceFailed = 5005 => "QUIESCE_FAILED",
    ThawFailed = 5006 => "THAW_FAILED",
    AlreadyQuiesced = 5007 => "ALREADY_QUIESCED",
    NotQuiesced = 5008 => "NOT_QUIESCED",
    TimeSyncFailed = 5009 => "TIME_SYNC_FAILED",
    InvalidMountPoint = 5010 => "INVALID_MOUNT_POINT",
    ScriptExecutionFailed = 5011 => "SCRIPT_EXECUTION_FAILED",
    // Desktop
    DisplayNotFound = 6001 => "DISPLAY_NOT_FOUND",
    ResolutionNotSupported = 6002 => "RESOLUTION_NOT_SUPPORTED",
    DisplayResizeFailed = 6003 => "DISPLAY_RESIZE_FAILED",
    ClipboardAccessFailed = 6004 => "CLIPBOARD_ACCESS_FAILED",
    ClipboardEmpty = 6005 => "CLIPBOARD_EMPTY",
    ClipboardTypeUnsupported = 6006 => "CLIPBOARD_TYPE_UNSUPPORTED",
    NoDisplayServer = 6007 => "NO_DISPLAY_SERVER",
    // Process / service
    ProcessNotFound = 7001 => "PROCESS_NOT_FOUND",
    KillFailed = 7002 => "KILL_FAILED",
    ServiceNotFound = 7003 => "SERVICE_NOT_FOUND",
    ServiceControlFailed = 7004 => "SERVICE_CONTROL_FAILED",
    InvalidSignal = 7009 => "INVALID_SIGNAL",
    InvalidServiceName = 7011 => "INVALID_SERVICE_NAME",
    InventoryFailed = 7012 => "INVENTORY_FAILED",
    // Security
    RateLimitExceeded = 8001 => "RATE_LIMIT_EXCEEDED",
    CommandNotAllowed = 8002 => "COMMAND_NOT_ALLOWED",
    PathNotAllowed = 8003 => "PATH_NOT_ALLOWED",
    // Internal
    ConfigInvalid = 9002 => "CONFIG_INVALID",
    InternalError = 9003 => "INTERNAL_ERROR",
    UpdateFailed = 9004 => "UPDATE_FAILED",
    UpdateChecksumMismatch = 9005 => "UPDATE_CHECKSUM_MISMATCH",
    RollbackFailed = 9006 => "ROLLBACK_FAILED",
    UpdateInProgress = 9009 => "UPDATE_IN_PROGRESS",
    UnsupportedOperation = 9010 => "UNSUPPORTED_OPERATION",
}

impl ErrorCode {
    pub fn category(self) -> ErrorCategory {
        // Every code in the table sits inside a valid band.
        ErrorCategory::from_code(self.code()).unwrap_or(ErrorCategory::Internal)
    }

    /// Hint attached to new errors of this code.
    pub const fn default_resolution(self) -> Option<&'static str> {
        match self {
            ErrorCode::RateLimitExceeded => Some("wait for the rate-limit window to elapse and retry"),
            ErrorCode::MessageTooLarge => Some("split the payload into smaller chunks"),
            ErrorCode::UserNotFound => Some("create the user in the guest or omit run_as"),
            ErrorCode::NoDisplayServer => Some("start a graphical session in the guest"),
            ErrorCode::AlreadyQuiesced => Some("thaw the filesystems before quiescing again"),
            ErrorCode::NotQuiesced => Some("quiesce the filesystems first"),
            ErrorCode::PathTraversalBlocked => Some("use an absolute path without '..' segments"),
            ErrorCode::UpdateChecksumMismatch => Some("re-send the update; the staged binary was discarded"),
            ErrorCode::UnsupportedOperation => Some("check get_capabilities before calling this operation"),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Structured error carried by `Payload::Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name} ({code}): {message}")]
pub struct ErrorResponse {
    pub code: u16,
    pub category: ErrorCategory,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            category: code.category(),
            name: code.name().to_string(),
            message: message.into(),
            context: None,
            resolution: code.default_resolution().map(str::to_string),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    /// The typed code, if this error came from a known table entry.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code.code()
    }
}

impl From<ErrorCode> for ErrorResponse {
    fn from(code: ErrorCode) -> Self {
        ErrorResponse::new(code, code.name().to_lowercase().replace('_', " "))
    }
}
