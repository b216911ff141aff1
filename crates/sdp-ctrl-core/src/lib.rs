//! SDP Control Client Core Library
//!
//! Shared functionality for the control client:
//! - Configuration model, loading and validation
//! - Line-oriented SPA key rewriting for the client and helper config files
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod keyfile;
pub mod tracing_init;

pub use config::{ClientConfig, CliOverrides, ConfigPaths};
pub use error::{Error, Result};
