use std::io;
use std::process::ExitStatus;

use thiserror::Error;

use crate::bridge::protocol::FrameError;
use crate::bridge::transport::TransportError;

/// Errors surfaced by a [`Session`](crate::Session).
///
/// Only [`RemoteEvaluation`](BridgeError::RemoteEvaluation) and
/// [`InvalidArgument`](BridgeError::InvalidArgument) leave the session usable;
/// every other variant terminates it.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn remote tool: {0}")]
    Spawn(#[source] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("{}", early_exit_message(.status))]
    EarlyExit { status: Option<ExitStatus> },

    #[error("remote evaluation of command {cmd_idx} failed: {message}")]
    RemoteEvaluation {
        cmd_idx: u64,
        message: String,
        error_info: Option<String>,
    },

    #[error("timed out waiting for the remote")]
    Timeout,

    #[error("session is closed")]
    SessionClosed,

    #[error("pipe resource failure: {0}")]
    Resource(#[source] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn early_exit_message(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => format!("remote exited before replying ({status})"),
        None => "remote exited before replying".to_string(),
    }
}

impl BridgeError {
    /// Whether this error terminates the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::RemoteEvaluation { .. } | Self::InvalidArgument(_)
        )
    }

    pub(crate) fn early_exit() -> Self {
        Self::EarlyExit { status: None }
    }
}

impl From<FrameError> for BridgeError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => Self::from(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            // The reader of an outbound pipe is gone: the remote died mid-message.
            io::ErrorKind::BrokenPipe => Self::early_exit(),
            _ => Self::Resource(err),
        }
    }
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::RemoteClosed => Self::early_exit(),
            TransportError::Timeout => Self::Timeout,
            TransportError::EmptyMessage => {
                Self::Protocol("remote closed the pipe without sending a message".to_string())
            }
            TransportError::Frame(e) => Self::from(e),
            TransportError::Io(e) => Self::from(e),
        }
    }
}
