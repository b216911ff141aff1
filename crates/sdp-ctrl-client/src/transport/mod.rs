//! Controller transport seam.
//!
//! The session owns exactly one [`Transport`] and never looks inside it. A
//! [`TransportBuilder`] makes a fresh one from configuration, at start and on
//! every in-place restart.

mod spa;
mod tls;

pub use spa::{FwknopHelper, SpaSender};
pub use tls::{TlsTransport, TlsTransportBuilder};

use thiserror::Error;

use sdp_ctrl_core::ClientConfig;

use crate::credentials::SpaKeys;

/// Upper bound on a single inbound message.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected to controller")]
    NotConnected,

    #[error("Connection closed by controller")]
    Closed,

    #[error("Failed to connect to {addr} after {attempts} attempts: {reason}")]
    ConnectFailed {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("SPA failed: {0}")]
    Spa(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Inbound message exceeds {0} bytes")]
    MessageTooLarge(usize),
}

impl TransportError {
    /// Connection attempts were exhausted, as opposed to an established
    /// connection going away.
    pub const fn is_connect_failure(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. })
    }
}

/// Connection to the controller, including the SPA step before connecting.
pub trait Transport {
    /// Connect, retrying per configuration. A no-op when already connected.
    fn connect(&mut self) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn send_message(&mut self, msg: &str) -> Result<(), TransportError>;

    /// Next complete inbound message, `None` when nothing is waiting.
    fn receive_next_message(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// In-memory copy of the SPA keys most recently installed.
    fn spa_keys(&self) -> &SpaKeys;

    fn replace_spa_keys(&mut self, keys: SpaKeys);
}

/// Creates transports from configuration.
pub trait TransportBuilder {
    fn build(&self, config: &ClientConfig) -> Result<Box<dyn Transport>, TransportError>;
}
