//! Client error taxonomy.
//!
//! Every failure the client can report is one of these variants, and each
//! variant maps to one process exit code.

use std::fmt;
use std::path::PathBuf;

use crate::message::CodecError;
use crate::rotation::RotationError;
use crate::session::SessionState;
use crate::transport::TransportError;

/// Result type alias using [`ClientError`].
pub type Result<T> = std::result::Result<T, ClientError>;

/// The two kinds of request the session tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCategory {
    KeepAlive,
    Credential,
}

impl fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepAlive => f.write_str("keep-alive"),
            Self::Credential => f.write_str("credential update"),
        }
    }
}

/// Errors surfaced by the control client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Client is not initialized")]
    Uninitialized,

    #[error("Cannot issue {requested} request while in state {state}")]
    WrongState {
        state: SessionState,
        requested: RequestCategory,
    },

    #[error("Connection to controller is down")]
    ConnectionDown,

    #[error("Too many failed {category} requests")]
    TooManyFailedRequests { category: RequestCategory },

    #[error("Filesystem operation failed on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error("Memory allocation failed: {0}")]
    MemoryAllocation(&'static str),

    #[error("Unable to fork: {0}")]
    Fork(#[source] nix::errno::Errno),

    #[error("An instance is already running (pid={pid})")]
    ProcessExists { pid: i32 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] sdp_ctrl_core::Error),

    #[error("{0}")]
    Other(String),
}

impl ClientError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error. Success is 0.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Other(_) | Self::Codec(_) | Self::Config(_) => 1,
            Self::Uninitialized => 2,
            Self::ConnectionDown | Self::Transport(_) => 3,
            Self::WrongState { .. } => 4,
            Self::MemoryAllocation(_) => 5,
            Self::Filesystem { .. } | Self::Rotation(_) => 6,
            Self::Fork(_) => 7,
            Self::ProcessExists { .. } => 8,
            Self::TooManyFailedRequests { .. } => 9,
        }
    }

    /// Whether the run loop should drop the connection and reconnect.
    pub const fn is_connection_loss(&self) -> bool {
        match self {
            Self::ConnectionDown => true,
            Self::Transport(e) => !e.is_connect_failure(),
            _ => false,
        }
    }
}
