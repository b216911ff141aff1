//! Error types for the SDP control client core library.

use std::path::PathBuf;

use thiserror::Error;

use crate::keyfile::KeyFileError;

/// Result type alias using the core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for configuration and key-file handling.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A key file could not be rewritten
    #[error("Key file error in {}: {source}", path.display())]
    KeyFile {
        path: PathBuf,
        #[source]
        source: KeyFileError,
    },
}
