//! JSON wire encoding: `{"action": ..., "stage": ..., "data": {...}}`.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{CodecError, Inbound, MessageCodec, Stage, Subject};
use crate::credentials::{CredentialBundle, SpaKeys};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[derive(Serialize)]
struct Outbound<'a> {
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'a str>,
}

#[derive(Deserialize)]
struct Envelope {
    action: String,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    data: Option<CredentialData>,
}

#[derive(Deserialize)]
struct CredentialData {
    tls_client_cert: Option<Zeroizing<String>>,
    tls_client_key: Option<Zeroizing<String>>,
    spa_encryption_key: Option<Zeroizing<String>>,
    spa_hmac_key: Option<Zeroizing<String>>,
}

impl CredentialData {
    fn into_bundle(self) -> Result<CredentialBundle, CodecError> {
        let cert = self
            .tls_client_cert
            .ok_or(CodecError::MissingField("tls_client_cert"))?;
        let key = self
            .tls_client_key
            .ok_or(CodecError::MissingField("tls_client_key"))?;
        let enc = self
            .spa_encryption_key
            .ok_or(CodecError::MissingField("spa_encryption_key"))?;
        let hmac = self
            .spa_hmac_key
            .ok_or(CodecError::MissingField("spa_hmac_key"))?;
        Ok(CredentialBundle::new(
            cert.as_str(),
            key.as_str(),
            SpaKeys::new(enc.as_str(), hmac.as_str()),
        ))
    }
}

impl MessageCodec for JsonCodec {
    fn process_message(&self, raw: &[u8]) -> Result<Inbound, CodecError> {
        let text = std::str::from_utf8(raw).map_err(|_| CodecError::Utf8)?;
        let envelope: Envelope = serde_json::from_str(text)?;

        let subject = envelope.action.as_str();
        let stage = envelope.stage.as_deref();
        let keep_alive = Subject::KeepAlive.as_str();
        let cred = Subject::CredentialUpdate.as_str();
        let fulfilling = Stage::Fulfilling.as_str();

        if subject == keep_alive && stage.is_none_or(|s| s == fulfilling) {
            return Ok(Inbound::KeepAliveFulfilled);
        }
        if subject == cred && stage == Some(fulfilling) {
            let data = envelope.data.ok_or(CodecError::MissingField("data"))?;
            return data.into_bundle().map(Inbound::CredentialFulfilled);
        }
        Ok(Inbound::Unrecognized {
            subject: envelope.action,
            stage: envelope.stage,
        })
    }

    fn make_message(&self, subject: Subject, stage: Option<Stage>) -> Result<String, CodecError> {
        let msg = Outbound {
            action: subject.as_str(),
            stage: stage.map(Stage::as_str),
        };
        Ok(serde_json::to_string(&msg)?)
    }
}
