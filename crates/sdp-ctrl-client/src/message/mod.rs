//! Controller message codec seam.
//!
//! The session only deals in [`Subject`], [`Stage`] and decoded [`Inbound`]
//! results; the wire encoding lives behind [`MessageCodec`].

mod json;

pub use json::JsonCodec;

use std::fmt;

use thiserror::Error;

use crate::credentials::CredentialBundle;

/// What a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    KeepAlive,
    CredentialUpdate,
}

impl Subject {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepAlive => "keep_alive",
            Self::CredentialUpdate => "credential_update",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a message within an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Requesting,
    Fulfilling,
    Fulfilled,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requesting => "requesting",
            Self::Fulfilling => "fulfilling",
            Self::Fulfilled => "fulfilled",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded inbound message.
#[derive(Debug)]
pub enum Inbound {
    KeepAliveFulfilled,
    CredentialFulfilled(CredentialBundle),
    /// Well-formed but not something this client acts on.
    Unrecognized { subject: String, stage: Option<String> },
}

/// Malformed message bytes, or a message that could not be built.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed controller message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Credential update is missing field `{0}`")]
    MissingField(&'static str),

    #[error("Message is not valid UTF-8")]
    Utf8,
}

/// Encodes outbound requests and decodes inbound controller messages.
pub trait MessageCodec {
    fn process_message(&self, raw: &[u8]) -> Result<Inbound, CodecError>;

    fn make_message(&self, subject: Subject, stage: Option<Stage>) -> Result<String, CodecError>;
}
