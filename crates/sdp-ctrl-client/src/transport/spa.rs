//! Single Packet Authorization before each TCP connect.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;

use sdp_ctrl_core::ClientConfig;

use super::TransportError;

/// Sends one SPA packet ahead of a connection attempt.
pub trait SpaSender {
    fn send(&self) -> Result<(), TransportError>;
}

/// Runs the external `fwknop` helper against the paired rc file.
///
/// The helper reads the SPA keys from its rc stanza, which rotation keeps in
/// step with the client's own config. Keys never appear on its command line.
#[derive(Debug, Clone)]
pub struct FwknopHelper {
    helper: PathBuf,
    rc_file: PathBuf,
    stanza: String,
    post_spa_delay: Duration,
}

impl FwknopHelper {
    pub fn new(
        helper: impl Into<PathBuf>,
        rc_file: impl Into<PathBuf>,
        stanza: impl Into<String>,
        post_spa_delay: Duration,
    ) -> Self {
        Self {
            helper: helper.into(),
            rc_file: rc_file.into(),
            stanza: stanza.into(),
            post_spa_delay,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.spa.helper.clone(),
            config.fwknoprc_file(),
            config.controller.spa_stanza.clone(),
            config.post_spa_delay(),
        )
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.helper);
        cmd.arg("--rc-file")
            .arg(&self.rc_file)
            .arg("--named-config")
            .arg(&self.stanza)
            .arg("--use-hmac")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl SpaSender for FwknopHelper {
    fn send(&self) -> Result<(), TransportError> {
        debug!(helper = %self.helper.display(), stanza = %self.stanza, "Sending SPA packet");
        let status = self.command().status().map_err(|e| {
            TransportError::Spa(format!("failed to run {}: {e}", self.helper.display()))
        })?;
        if !status.success() {
            return Err(TransportError::Spa(format!(
                "{} exited with {status}",
                self.helper.display()
            )));
        }
        std::thread::sleep(self.post_spa_delay);
        Ok(())
    }
}
