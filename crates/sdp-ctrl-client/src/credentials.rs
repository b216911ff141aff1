//! Key material issued by the controller.
//!
//! Both types wipe their contents on drop. A [`CredentialBundle`] is consumed
//! by exactly one rotation and then dropped.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ClientError;

/// SPA encryption and HMAC keys, base64 text.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SpaKeys {
    encryption_key: String,
    hmac_key: String,
}

impl SpaKeys {
    pub fn new(encryption_key: impl Into<String>, hmac_key: impl Into<String>) -> Self {
        Self {
            encryption_key: encryption_key.into(),
            hmac_key: hmac_key.into(),
        }
    }

    pub fn encryption_key(&self) -> &str {
        &self.encryption_key
    }

    pub fn hmac_key(&self) -> &str {
        &self.hmac_key
    }

    /// Copy the keys, reporting allocation failure instead of aborting.
    pub fn try_clone(&self) -> Result<Self, ClientError> {
        Ok(Self {
            encryption_key: try_copy(&self.encryption_key)?,
            hmac_key: try_copy(&self.hmac_key)?,
        })
    }
}

impl std::fmt::Debug for SpaKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaKeys").finish_non_exhaustive()
    }
}

fn try_copy(value: &str) -> Result<String, ClientError> {
    let mut out = String::new();
    out.try_reserve_exact(value.len())
        .map_err(|_| ClientError::MemoryAllocation("copying SPA key"))?;
    out.push_str(value);
    Ok(out)
}

/// Newly issued TLS client certificate and key plus SPA keys.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CredentialBundle {
    tls_client_cert: String,
    tls_client_key: String,
    spa: SpaKeys,
}

impl CredentialBundle {
    pub fn new(
        tls_client_cert: impl Into<String>,
        tls_client_key: impl Into<String>,
        spa: SpaKeys,
    ) -> Self {
        Self {
            tls_client_cert: tls_client_cert.into(),
            tls_client_key: tls_client_key.into(),
            spa,
        }
    }

    pub fn tls_client_cert(&self) -> &str {
        &self.tls_client_cert
    }

    pub fn tls_client_key(&self) -> &str {
        &self.tls_client_key
    }

    pub const fn spa_keys(&self) -> &SpaKeys {
        &self.spa
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("tls_client_cert_len", &self.tls_client_cert.len())
            .finish_non_exhaustive()
    }
}
