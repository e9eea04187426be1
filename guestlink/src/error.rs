use std::time::Duration;

use guestlink_protocol::{ErrorCode, ErrorResponse, FrameError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the guest agent")]
    NotConnected,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection to the guest agent closed")]
    ConnectionClosed,
    #[error("guest agent error: {0}")]
    Remote(#[from] ErrorResponse),
    #[error("unexpected {received} in reply to {request}")]
    UnexpectedResponse {
        request: &'static str,
        received: &'static str,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// The agent's error code, when the failure came from the agent.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Remote(e) => e.error_code(),
            _ => None,
        }
    }

    /// True for failures where retrying on a fresh connection can help.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::NotConnected
                | ClientError::Timeout(_)
                | ClientError::ConnectionClosed
                | ClientError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
