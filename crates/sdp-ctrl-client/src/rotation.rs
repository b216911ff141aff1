//! Credential rotation across the four key-bearing files.
//!
//! New material is staged as an ordered [`FileTransaction`]: certificate, key,
//! the client's own config, the SPA helper's config. Each step backs up the
//! file it replaces; the first failing step rolls every completed step back
//! in reverse order. Only after all four commit are the in-memory SPA keys
//! swapped.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use sdp_ctrl_core::ClientConfig;
use sdp_ctrl_core::keyfile::{self, Dialect};

use crate::credentials::CredentialBundle;
use crate::files;
use crate::transport::Transport;

/// One file write within a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStep {
    TlsCert,
    TlsKey,
    ClientConfigKeys,
    HelperConfigKeys,
}

impl fmt::Display for RotationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TlsCert => "TLS client certificate",
            Self::TlsKey => "TLS client key",
            Self::ClientConfigKeys => "client config SPA keys",
            Self::HelperConfigKeys => "SPA helper config keys",
        })
    }
}

#[derive(Debug, Error)]
pub enum RotationFailure {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    KeyFile(#[from] sdp_ctrl_core::Error),

    #[error("content read back does not match what was written")]
    Verify,
}

/// A rotation step failed; all earlier steps have been rolled back.
#[derive(Debug, Error)]
#[error("Failed to save {step} to {}: {source}", path.display())]
pub struct RotationError {
    pub step: RotationStep,
    pub path: PathBuf,
    #[source]
    pub source: RotationFailure,
}

/// Where a rotation writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationTargets {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub client_config: PathBuf,
    pub helper_config: PathBuf,
    pub helper_stanza: String,
}

impl RotationTargets {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            cert_file: config.tls.cert_file.clone(),
            key_file: config.tls.key_file.clone(),
            client_config: config.config_file.clone(),
            helper_config: config.fwknoprc_file().to_path_buf(),
            helper_stanza: config.controller.spa_stanza.clone(),
        }
    }

    fn paths(&self) -> [&Path; 4] {
        [
            &self.cert_file,
            &self.key_file,
            &self.client_config,
            &self.helper_config,
        ]
    }
}

enum NewContent {
    Whole(Zeroizing<Vec<u8>>),
    Keys {
        dialect: Dialect,
        section: String,
        pairs: Vec<(&'static str, Zeroizing<String>)>,
    },
}

struct FileOp {
    step: RotationStep,
    path: PathBuf,
    content: NewContent,
}

impl FileOp {
    fn render(&self, current: Option<&[u8]>) -> Result<Zeroizing<Vec<u8>>, RotationFailure> {
        match &self.content {
            NewContent::Whole(bytes) => Ok(bytes.clone()),
            NewContent::Keys {
                dialect,
                section,
                pairs,
            } => {
                let current = current.ok_or_else(|| {
                    std::io::Error::new(ErrorKind::NotFound, "key file does not exist")
                })?;
                let text = std::str::from_utf8(current)
                    .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
                let pairs: Vec<(&str, &str)> =
                    pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
                let out = keyfile::replace_keys_in(&self.path, text, *dialect, section, &pairs)?;
                Ok(Zeroizing::new(out.into_bytes()))
            }
        }
    }
}

struct Applied<'a> {
    step: RotationStep,
    path: &'a Path,
    backup: Option<Zeroizing<Vec<u8>>>,
}

/// Ordered file replacements committed all-or-nothing.
#[derive(Default)]
pub struct FileTransaction {
    ops: Vec<FileOp>,
}

impl FileTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole file with `data`.
    pub fn write(&mut self, step: RotationStep, path: &Path, data: &[u8]) -> &mut Self {
        self.ops.push(FileOp {
            step,
            path: path.to_path_buf(),
            content: NewContent::Whole(Zeroizing::new(data.to_vec())),
        });
        self
    }

    /// Rewrite `pairs` inside `section` of an existing key file.
    pub fn replace_keys(
        &mut self,
        step: RotationStep,
        path: &Path,
        dialect: Dialect,
        section: &str,
        pairs: &[(&'static str, &str)],
    ) -> &mut Self {
        self.ops.push(FileOp {
            step,
            path: path.to_path_buf(),
            content: NewContent::Keys {
                dialect,
                section: section.to_string(),
                pairs: pairs
                    .iter()
                    .map(|(k, v)| (*k, Zeroizing::new((*v).to_string())))
                    .collect(),
            },
        });
        self
    }

    pub fn commit(&self) -> Result<(), RotationError> {
        let mut applied: Vec<Applied<'_>> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let fail = |source: RotationFailure| RotationError {
                step: op.step,
                path: op.path.clone(),
                source,
            };

            let backup = match files::read_existing(&op.path) {
                Ok(backup) => backup,
                Err(e) => {
                    rollback(&applied);
                    return Err(fail(e.into()));
                }
            };
            let new = match op.render(backup.as_ref().map(|b| b.as_slice())) {
                Ok(new) => new,
                Err(source) => {
                    rollback(&applied);
                    return Err(fail(source));
                }
            };

            applied.push(Applied {
                step: op.step,
                path: &op.path,
                backup,
            });
            if let Err(source) = write_verified(&op.path, &new) {
                rollback(&applied);
                return Err(fail(source));
            }
            debug!(step = %op.step, path = %op.path.display(), "Saved");
        }
        Ok(())
    }
}

fn write_verified(path: &Path, data: &[u8]) -> Result<(), RotationFailure> {
    files::write_atomic(path, data)?;
    match files::read_existing(path)? {
        Some(written) if written.as_slice() == data => Ok(()),
        _ => Err(RotationFailure::Verify),
    }
}

fn rollback(applied: &[Applied<'_>]) {
    for done in applied.iter().rev() {
        let result = match &done.backup {
            Some(bytes) => files::write_atomic(done.path, bytes),
            None => files::resolve_target(done.path).and_then(|target| {
                match std::fs::remove_file(target) {
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            }),
        };
        match result {
            Ok(()) => info!(step = %done.step, path = %done.path.display(), "Restored previous file"),
            Err(e) => error!(
                step = %done.step,
                path = %done.path.display(),
                error = %e,
                "Failed to restore previous file"
            ),
        }
    }
}

/// Persist `bundle` to every target, then hand the new SPA keys to the
/// transport.
///
/// On error no target has changed. Failing to copy the keys into memory is
/// logged only; the files already hold them.
pub fn install(
    bundle: CredentialBundle,
    targets: &RotationTargets,
    transport: &mut dyn Transport,
) -> Result<(), RotationError> {
    for path in targets.paths() {
        if let Err(e) = files::verify_file_perms(path) {
            warn!(path = %path.display(), error = %e, "Unable to check file permissions");
        }
    }

    let spa = bundle.spa_keys();
    FileTransaction::new()
        .write(
            RotationStep::TlsCert,
            &targets.cert_file,
            bundle.tls_client_cert().as_bytes(),
        )
        .write(
            RotationStep::TlsKey,
            &targets.key_file,
            bundle.tls_client_key().as_bytes(),
        )
        .replace_keys(
            RotationStep::ClientConfigKeys,
            &targets.client_config,
            Dialect::Toml,
            keyfile::TOML_SPA_SECTION,
            &[
                (keyfile::TOML_ENCRYPTION_KEY, spa.encryption_key()),
                (keyfile::TOML_HMAC_KEY, spa.hmac_key()),
            ],
        )
        .replace_keys(
            RotationStep::HelperConfigKeys,
            &targets.helper_config,
            Dialect::Fwknop,
            &targets.helper_stanza,
            &[
                (keyfile::FWKNOP_ENCRYPTION_KEY, spa.encryption_key()),
                (keyfile::FWKNOP_HMAC_KEY, spa.hmac_key()),
            ],
        )
        .commit()?;
    info!("New credentials saved");

    match spa.try_clone() {
        Ok(keys) => transport.replace_spa_keys(keys),
        Err(e) => warn!(error = %e, "New SPA keys saved to disk but not loaded into memory"),
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rolls_back_completed_steps_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"old a").unwrap();

        let err = FileTransaction::new()
            .write(RotationStep::TlsCert, &a, b"new a")
            .write(RotationStep::TlsKey, &b, b"new b")
            .replace_keys(
                RotationStep::ClientConfigKeys,
                &dir.path().join("missing.toml"),
                Dialect::Toml,
                "spa",
                &[("encryption_key", "x")],
            )
            .commit()
            .unwrap_err();

        assert_eq!(err.step, RotationStep::ClientConfigKeys);
        assert_eq!(std::fs::read(&a).unwrap(), b"old a");
        assert!(!b.exists(), "file created by the rotation is removed again");
    }

    #[test]
    fn key_rewrite_failure_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join("fwknoprc");
        std::fs::write(&rc, "[other]\nKEY_BASE64 a\n").unwrap();

        let err = FileTransaction::new()
            .replace_keys(
                RotationStep::HelperConfigKeys,
                &rc,
                Dialect::Fwknop,
                "sdp",
                &[("KEY_BASE64", "b")],
            )
            .commit()
            .unwrap_err();

        assert!(matches!(err.source, RotationFailure::KeyFile(_)));
        assert!(err.to_string().contains("SPA helper config keys"));
        assert_eq!(std::fs::read_to_string(&rc).unwrap(), "[other]\nKEY_BASE64 a\n");
    }

    #[test]
    fn empty_transaction_commits() {
        FileTransaction::new().commit().unwrap();
    }
}
