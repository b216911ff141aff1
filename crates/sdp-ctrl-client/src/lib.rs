//! SDP Control Client Library
//!
//! Control-plane client for an SDP controller:
//! - Session state machine for keep-alive and credential-update exchanges
//! - Retry/backoff and failure escalation
//! - Multi-file credential rotation with rollback
//! - PID-file singleton lock, daemonization and signal-driven restart
//! - Run loop tying the above together

pub mod client;
pub mod clock;
pub mod credentials;
pub mod daemon;
pub mod error;
pub mod files;
pub mod message;
pub mod rotation;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;

pub use client::Client;
pub use credentials::{CredentialBundle, SpaKeys};
pub use error::{ClientError, RequestCategory, Result};
pub use session::{Session, SessionState};
