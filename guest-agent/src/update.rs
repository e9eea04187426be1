//! Chunked self-update with checksum verification and rollback.
//!
//! ```text
//! Idle -> Downloading -> Verifying -> Applying -> Complete
//!            |              |            |
//!            +--------------+------------+--> Failed -> RollingBack -> Idle
//! Failed | Complete -> Idle   (sequence 0 starts over)
//! ```
//!
//! The agent never restarts itself; a supervisor picks up the new binary.

use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use guestlink_protocol::{
    ErrorCode, ErrorResponse, Payload, UpdateChunkRequest, UpdateState, UpdateStatusResponse,
};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::config::UpdateConfig;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("no update transfer in progress")]
    NotStarted,
    #[error("chunk {got} out of order, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("chunk of {size} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { size: usize, max: usize },
    #[error("invalid transfer: {0}")]
    InvalidTransfer(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("staging failed: {0}")]
    Staging(#[source] io::Error),
    #[error("install failed: {0}")]
    Apply(#[source] io::Error),
    #[error("rollback failed: {0}")]
    Rollback(#[source] io::Error),
    #[error("illegal update state change {from} -> {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl UpdateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            UpdateError::ChecksumMismatch { .. } => ErrorCode::UpdateChecksumMismatch,
            UpdateError::Rollback(_) => ErrorCode::RollbackFailed,
            UpdateError::IllegalTransition { .. } => ErrorCode::InternalError,
            _ => ErrorCode::UpdateFailed,
        }
    }
}

impl From<UpdateError> for ErrorResponse {
    fn from(err: UpdateError) -> Self {
        ErrorResponse::new(err.code(), err.to_string())
    }
}

struct Transfer {
    version: String,
    total_chunks: u32,
    expected_sha256: String,
    next_sequence: u32,
    received_bytes: u64,
    hasher: Sha256,
    file: tokio::fs::File,
    staged: PathBuf,
}

pub struct UpdateCoordinator {
    config: UpdateConfig,
    state: UpdateState,
    transfer: Option<Transfer>,
    #[cfg(test)]
    fail_after_backup: bool,
}

impl UpdateCoordinator {
    pub fn new(config: UpdateConfig) -> Self {
        Self {
            config,
            state: UpdateState::Idle,
            transfer: None,
            #[cfg(test)]
            fail_after_backup: false,
        }
    }

    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    pub fn status(&self) -> UpdateStatusResponse {
        self.status_with(Vec::new())
    }

    fn status_with(&self, transitions: Vec<UpdateState>) -> UpdateStatusResponse {
        UpdateStatusResponse {
            state: self.state.clone(),
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            transitions,
        }
    }

    /// Handle one chunk. The response lists every state entered on the way.
    pub async fn handle_chunk(&mut self, req: UpdateChunkRequest) -> Result<Payload, ErrorResponse> {
        let mut transitions = Vec::new();
        match self.process(req, &mut transitions).await {
            Ok(()) => Ok(Payload::UpdateStatus(self.status_with(transitions))),
            Err(e) => {
                error!(error = %e, state = self.state.name(), "update chunk rejected");
                Err(e.into())
            }
        }
    }

    /// The only place `state` changes. Edges outside [`edge_allowed`] are
    /// refused and leave the state as it was.
    fn enter(&mut self, next: UpdateState, transitions: &mut Vec<UpdateState>) -> Result<(), UpdateError> {
        if !edge_allowed(&self.state, &next) {
            return Err(UpdateError::IllegalTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        if self.state.name() != next.name() {
            info!(from = self.state.name(), to = next.name(), "update state change");
        }
        self.state = next.clone();
        transitions.push(next);
        Ok(())
    }

    async fn process(
        &mut self,
        req: UpdateChunkRequest,
        transitions: &mut Vec<UpdateState>,
    ) -> Result<(), UpdateError> {
        if req.sequence == 0 {
            self.start(&req, transitions).await?;
        } else if self.transfer.is_none() {
            return Err(UpdateError::NotStarted);
        }

        if let Err(e) = self.receive(&req).await {
            return Err(self.fail(e, transitions).await);
        }
        let Some(transfer) = self.transfer.as_ref() else {
            return Err(UpdateError::NotStarted);
        };
        let progress = UpdateState::Downloading {
            received_chunks: transfer.next_sequence,
            total_chunks: transfer.total_chunks,
            received_bytes: transfer.received_bytes,
        };
        let done = transfer.next_sequence == transfer.total_chunks;
        self.enter(progress, transitions)?;

        if done {
            self.finish(transitions).await?;
        }
        Ok(())
    }

    async fn start(
        &mut self,
        req: &UpdateChunkRequest,
        transitions: &mut Vec<UpdateState>,
    ) -> Result<(), UpdateError> {
        if let Some(previous) = self.transfer.take() {
            warn!(version = %previous.version, "discarding partial update transfer");
            discard(&previous.staged).await;
        }
        if self.state != UpdateState::Idle {
            self.enter(UpdateState::Idle, transitions)?;
        }
        self.enter(
            UpdateState::Downloading {
                received_chunks: 0,
                total_chunks: req.total_chunks,
                received_bytes: 0,
            },
            transitions,
        )?;

        let expected = req.expected_sha256.to_ascii_lowercase();
        let metadata_error = if req.total_chunks == 0 {
            Some("total_chunks must be at least 1".to_string())
        } else if expected.len() != 64 || hex::decode(&expected).is_err() {
            Some(format!("expected_sha256 is not a SHA-256 hex digest: {}", req.expected_sha256))
        } else {
            None
        };
        if let Some(reason) = metadata_error {
            return Err(self.fail(UpdateError::InvalidTransfer(reason), transitions).await);
        }

        let staged = self.staged_path();
        let file = match tokio::fs::File::create(&staged).await {
            Ok(f) => f,
            Err(e) => return Err(self.fail(UpdateError::Staging(e), transitions).await),
        };
        info!(version = %req.version, total_chunks = req.total_chunks, staged = %staged.display(), "update transfer started");
        self.transfer = Some(Transfer {
            version: req.version.clone(),
            total_chunks: req.total_chunks,
            expected_sha256: expected,
            next_sequence: 0,
            received_bytes: 0,
            hasher: Sha256::new(),
            file,
            staged,
        });
        Ok(())
    }

    async fn receive(&mut self, req: &UpdateChunkRequest) -> Result<(), UpdateError> {
        let max = self.config.max_chunk_size;
        let transfer = self.transfer.as_mut().ok_or(UpdateError::NotStarted)?;
        if req.version != transfer.version
            || req.total_chunks != transfer.total_chunks
            || !req.expected_sha256.eq_ignore_ascii_case(&transfer.expected_sha256)
        {
            return Err(UpdateError::InvalidTransfer(
                "transfer metadata changed mid-transfer".to_string(),
            ));
        }
        if req.sequence != transfer.next_sequence {
            return Err(UpdateError::OutOfOrder {
                expected: transfer.next_sequence,
                got: req.sequence,
            });
        }
        let bytes = BASE64
            .decode(req.data.as_bytes())
            .map_err(|e| UpdateError::InvalidTransfer(format!("chunk is not valid base64: {e}")))?;
        if bytes.len() > max {
            return Err(UpdateError::ChunkTooLarge {
                size: bytes.len(),
                max,
            });
        }
        transfer
            .file
            .write_all(&bytes)
            .await
            .map_err(UpdateError::Staging)?;
        transfer.hasher.update(&bytes);
        transfer.next_sequence += 1;
        transfer.received_bytes += bytes.len() as u64;
        Ok(())
    }

    async fn finish(&mut self, transitions: &mut Vec<UpdateState>) -> Result<(), UpdateError> {
        let Some(transfer) = self.transfer.take() else {
            return Err(UpdateError::NotStarted);
        };
        self.enter(UpdateState::Verifying, transitions)?;

        if let Err(e) = transfer.file.sync_all().await {
            discard(&transfer.staged).await;
            return Err(self.fail(UpdateError::Staging(e), transitions).await);
        }
        drop(transfer.file);

        let actual = hex::encode(transfer.hasher.finalize());
        if actual != transfer.expected_sha256 {
            discard(&transfer.staged).await;
            let err = UpdateError::ChecksumMismatch {
                expected: transfer.expected_sha256,
                actual,
            };
            return Err(self.fail(err, transitions).await);
        }

        self.enter(UpdateState::Applying, transitions)?;
        let install = self.config.install_path.clone();
        let backup = backup_path(&install);

        let had_previous = tokio::fs::try_exists(&install).await.unwrap_or(false);
        if had_previous {
            if let Err(e) = tokio::fs::copy(&install, &backup).await {
                discard(&transfer.staged).await;
                return Err(self.fail(UpdateError::Apply(e), transitions).await);
            }
        }

        if let Err(e) = self.install(&transfer.staged, &install, had_previous).await {
            discard(&transfer.staged).await;
            let err = self.fail(UpdateError::Apply(e), transitions).await;
            self.enter(UpdateState::RollingBack, transitions)?;
            return match rollback(&install, &backup, had_previous).await {
                Ok(()) => {
                    warn!(install = %install.display(), "update rolled back");
                    self.enter(UpdateState::Idle, transitions)?;
                    Err(err)
                }
                Err(e) => {
                    error!(error = %e, "rollback failed");
                    let err = UpdateError::Rollback(e);
                    self.enter(
                        UpdateState::Failed {
                            reason: err.to_string(),
                        },
                        transitions,
                    )?;
                    Err(err)
                }
            };
        }

        info!(version = %transfer.version, install = %install.display(), "update installed");
        self.enter(
            UpdateState::Complete {
                version: transfer.version,
            },
            transitions,
        )
    }

    async fn install(&self, staged: &Path, install: &Path, had_previous: bool) -> io::Result<()> {
        #[cfg(test)]
        if self.fail_after_backup {
            return Err(io::Error::other("injected install failure"));
        }
        let permissions = if had_previous {
            tokio::fs::metadata(install).await?.permissions()
        } else {
            use std::os::unix::fs::PermissionsExt;
            std::fs::Permissions::from_mode(0o755)
        };
        tokio::fs::set_permissions(staged, permissions).await?;
        tokio::fs::rename(staged, install).await
    }

    async fn fail(&mut self, err: UpdateError, transitions: &mut Vec<UpdateState>) -> UpdateError {
        if let Some(transfer) = self.transfer.take() {
            discard(&transfer.staged).await;
        }
        let failed = UpdateState::Failed {
            reason: err.to_string(),
        };
        match self.enter(failed, transitions) {
            Ok(()) => err,
            Err(illegal) => illegal,
        }
    }

    fn staged_path(&self) -> PathBuf {
        let name = self
            .config
            .install_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "agent".to_string());
        self.config.staging_dir().join(format!("{name}.update"))
    }
}

/// Legal edges of the update state machine. `Downloading -> Idle` is the
/// restart that discards a partial transfer.
fn edge_allowed(from: &UpdateState, to: &UpdateState) -> bool {
    use UpdateState::*;
    matches!(
        (from, to),
        (Idle, Downloading { .. })
            | (Downloading { .. }, Downloading { .. } | Verifying | Failed { .. } | Idle)
            | (Verifying, Applying | Failed { .. })
            | (Applying, Complete { .. } | Failed { .. })
            | (Failed { .. }, RollingBack | Idle)
            | (RollingBack, Idle | Failed { .. })
            | (Complete { .. }, Idle)
    )
}

fn backup_path(install: &Path) -> PathBuf {
    let mut name = install.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

async fn discard(staged: &Path) {
    if let Err(e) = tokio::fs::remove_file(staged).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %staged.display(), error = %e, "failed to remove staged update");
        }
    }
}

/// Put the backup back in place through a temporary file so the install
/// path is replaced atomically.
async fn rollback(install: &Path, backup: &Path, had_previous: bool) -> io::Result<()> {
    if !had_previous {
        return match tokio::fs::remove_file(install).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }
    let mut tmp = install.as_os_str().to_owned();
    tmp.push(".rollback");
    let tmp = PathBuf::from(tmp);
    tokio::fs::copy(backup, &tmp).await?;
    tokio::fs::rename(&tmp, install).await
}
