//! Policy checks run before any privileged handler.
//!
//! Checks short-circuit in a fixed order: rate limit, then command
//! allow/deny, then path restrictions. Every decision is audited.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use guestlink_protocol::{ErrorCode, ErrorResponse};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::SecurityConfig;

// ---------------------------------------------------------------------------
// Operation classification
// ---------------------------------------------------------------------------

/// What a request asks the guest to do, as far as policy is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Spawn a process. `program` is the executable as given.
    Command {
        program: String,
        command_line: String,
    },
    PathRead(String),
    PathWrite(String),
    /// A state-changing action carried out through a fixed system tool
    /// (service control, kill, power, password, update). Counts against the
    /// command budget and is refused when the tool is on the deny list.
    Privileged {
        tool: &'static str,
        action: String,
    },
    /// Read-only queries. Audited, never limited.
    Unrestricted,
}

impl Operation {
    fn category(&self) -> Option<RateCategory> {
        match self {
            Operation::Command { .. } | Operation::Privileged { .. } => Some(RateCategory::Command),
            Operation::PathRead(_) | Operation::PathWrite(_) => Some(RateCategory::File),
            Operation::Unrestricted => None,
        }
    }

    /// The command line or path the operation targets, for audit records.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Operation::Command { command_line, .. } => Some(command_line),
            Operation::Privileged { action, .. } => Some(action),
            Operation::PathRead(p) | Operation::PathWrite(p) => Some(p),
            Operation::Unrestricted => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    Command,
    File,
}

impl RateCategory {
    fn as_str(self) -> &'static str {
        match self {
            RateCategory::Command => "command",
            RateCategory::File => "file",
        }
    }
}

/// Token bucket: `capacity` tokens, refilled at `capacity` per `window`.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, window: Duration, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate: capacity as f64 / window.as_secs_f64(),
            last_refill: now,
        }
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-category token buckets. A limit of 0 leaves the category unlimited.
pub struct RateLimiter {
    buckets: Mutex<HashMap<RateCategory, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: &SecurityConfig) -> Self {
        Self::with_start(config, Instant::now())
    }

    fn with_start(config: &SecurityConfig, now: Instant) -> Self {
        let mut buckets = HashMap::new();
        if config.max_commands_per_minute > 0 {
            buckets.insert(
                RateCategory::Command,
                TokenBucket::new(config.max_commands_per_minute, Duration::from_secs(60), now),
            );
        }
        if config.max_file_ops_per_second > 0 {
            buckets.insert(
                RateCategory::File,
                TokenBucket::new(config.max_file_ops_per_second, Duration::from_secs(1), now),
            );
        }
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    pub fn check(&self, category: RateCategory) -> Result<(), ErrorResponse> {
        self.check_at(category, Instant::now())
    }

    fn check_at(&self, category: RateCategory, now: Instant) -> Result<(), ErrorResponse> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let Some(bucket) = buckets.get_mut(&category) else {
            return Ok(());
        };
        if bucket.try_acquire_at(now) {
            return Ok(());
        }
        Err(ErrorResponse::new(
            ErrorCode::RateLimitExceeded,
            format!(
                "rate limit exceeded for {} operations ({} allowed per window)",
                category.as_str(),
                bucket.capacity as u32
            ),
        ))
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied { code: u16, name: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    /// Payload kind of the request.
    pub operation: String,
    /// Message id of the request that triggered the decision.
    pub source: String,
    /// Command line or path, when the operation has one.
    pub subject: Option<String>,
    pub outcome: AuditOutcome,
    pub duration_us: u64,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Emits one event per decision on the `audit` tracing target, with the
/// full record serialized as JSON in the `entry` field.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        let entry = audit_json(record);
        match &record.outcome {
            AuditOutcome::Allowed => info!(
                target: "audit",
                operation = %record.operation,
                source = %record.source,
                entry = %entry,
                "allowed"
            ),
            AuditOutcome::Denied { code, .. } => warn!(
                target: "audit",
                operation = %record.operation,
                source = %record.source,
                code = *code,
                entry = %entry,
                "denied"
            ),
        }
    }
}

fn audit_json(record: &AuditRecord) -> String {
    serde_json::to_string(record).unwrap_or_else(|_| format!("{record:?}"))
}

/// Keeps records in memory; used by tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Loaded once from `[security]`; read-only afterward apart from the
/// rate-limit buckets.
pub struct SecurityPolicy {
    config: SecurityConfig,
    limiter: RateLimiter,
    sink: Option<Arc<dyn AuditSink>>,
}

impl SecurityPolicy {
    pub fn new(config: SecurityConfig, sink: Arc<dyn AuditSink>) -> Self {
        let limiter = RateLimiter::new(&config);
        let sink = config.audit_logging.then_some(sink);
        Self {
            config,
            limiter,
            sink,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.clone(), Arc::new(TracingAuditSink))
    }

    /// Run every applicable check in order.
    pub fn evaluate(&self, op: &Operation) -> Result<(), ErrorResponse> {
        if let Some(category) = op.category() {
            self.limiter.check(category)?;
        }
        match op {
            Operation::Command {
                program,
                command_line,
            } => self.check_command(program, command_line),
            Operation::PathRead(path) => self.check_path(path, false),
            Operation::PathWrite(path) => self.check_path(path, true),
            Operation::Privileged { tool, action } => self.check_tool(tool, action),
            Operation::Unrestricted => Ok(()),
        }
    }

    pub fn audit(&self, record: AuditRecord) {
        if let Some(sink) = &self.sink {
            sink.record(&record);
        }
    }

    fn check_command(&self, program: &str, command_line: &str) -> Result<(), ErrorResponse> {
        let line = normalize(command_line);
        let base = basename(program);

        let denied = self
            .config
            .command_denylist
            .iter()
            .find(|entry| line.contains(entry.as_str()) || *entry == base);
        if let Some(entry) = denied {
            return Err(ErrorResponse::new(
                ErrorCode::CommandNotAllowed,
                format!("command matches deny entry '{entry}'"),
            )
            .with_context(line));
        }

        if self.config.command_allowlist.is_empty() {
            return Ok(());
        }
        let allowed = self
            .config
            .command_allowlist
            .iter()
            .any(|entry| *entry == base || line.starts_with(entry.as_str()));
        if allowed {
            Ok(())
        } else {
            Err(ErrorResponse::new(
                ErrorCode::CommandNotAllowed,
                format!("'{base}' is not on the command allow list"),
            )
            .with_context(line))
        }
    }

    fn check_tool(&self, tool: &str, action: &str) -> Result<(), ErrorResponse> {
        if self.config.command_denylist.iter().any(|entry| entry == tool) {
            return Err(ErrorResponse::new(
                ErrorCode::CommandNotAllowed,
                format!("'{tool}' is on the command deny list"),
            )
            .with_context(action.to_string()));
        }
        Ok(())
    }

    fn check_path(&self, raw: &str, write: bool) -> Result<(), ErrorResponse> {
        validate_path(raw)?;
        let path = Path::new(raw);

        if !write {
            if let Some(prefix) = self
                .config
                .deny_read_paths
                .iter()
                .find(|p| path.starts_with(p))
            {
                return Err(ErrorResponse::new(
                    ErrorCode::PathNotAllowed,
                    format!("reads under {prefix} are denied"),
                )
                .with_context(raw));
            }
            return Ok(());
        }

        let allow = &self.config.allow_write_paths;
        if !allow.is_empty() && !allow.iter().any(|p| path.starts_with(p)) {
            return Err(ErrorResponse::new(
                ErrorCode::PathNotAllowed,
                "path is outside the writable prefixes",
            )
            .with_context(raw));
        }
        Ok(())
    }
}

/// Shape checks shared by every path-taking operation: absolute, no `..`.
pub fn validate_path(raw: &str) -> Result<(), ErrorResponse> {
    let path = Path::new(raw);
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(
            ErrorResponse::new(ErrorCode::PathTraversalBlocked, "path contains '..'")
                .with_context(raw),
        );
    }
    if !path.is_absolute() {
        return Err(
            ErrorResponse::new(ErrorCode::InvalidPath, "path must be absolute").with_context(raw),
        );
    }
    Ok(())
}

fn normalize(command_line: &str) -> String {
    command_line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn basename(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}
