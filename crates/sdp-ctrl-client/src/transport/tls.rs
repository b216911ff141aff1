//! Mutual-TLS transport over blocking TCP with newline-delimited framing.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConnection, RootCertStore, StreamOwned};
use tracing::{debug, info, warn};

use sdp_ctrl_core::ClientConfig;

use super::spa::{FwknopHelper, SpaSender};
use super::{MAX_MESSAGE_LEN, Transport, TransportBuilder, TransportError};
use crate::credentials::SpaKeys;

/// Bound on TCP connect plus TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

pub struct TlsTransport {
    address: String,
    port: u16,
    server_name: ServerName<'static>,
    ca_file: PathBuf,
    cert_file: PathBuf,
    key_file: PathBuf,
    tls_config: Arc<rustls::ClientConfig>,
    read_timeout: Duration,
    write_timeout: Duration,
    max_conn_attempts: u32,
    initial_conn_retry_interval: Duration,
    spa: Option<Box<dyn SpaSender>>,
    spa_keys: SpaKeys,
    stream: Option<TlsStream>,
    pending: Vec<u8>,
}

impl TlsTransport {
    pub fn from_config(config: &ClientConfig) -> Result<Self, TransportError> {
        let spa: Option<Box<dyn SpaSender>> = if config.controller.use_spa {
            Some(Box::new(FwknopHelper::from_config(config)))
        } else {
            None
        };
        let server_name = ServerName::try_from(config.controller.address.clone())
            .map_err(|e| TransportError::Tls(format!("invalid controller name: {e}")))?;

        Ok(Self {
            address: config.controller.address.clone(),
            port: config.controller.port,
            server_name,
            ca_file: config.tls.ca_file.clone(),
            cert_file: config.tls.cert_file.clone(),
            key_file: config.tls.key_file.clone(),
            tls_config: load_tls_config(
                &config.tls.ca_file,
                &config.tls.cert_file,
                &config.tls.key_file,
            )?,
            read_timeout: config.timing.read_timeout(),
            write_timeout: config.timing.write_timeout(),
            max_conn_attempts: config.timing.max_conn_attempts,
            initial_conn_retry_interval: config.timing.initial_conn_retry_interval(),
            spa,
            spa_keys: SpaKeys::new(
                config.spa.encryption_key.clone(),
                config.spa.hmac_key.clone(),
            ),
            stream: None,
            pending: Vec::new(),
        })
    }

    /// Reload the client identity from disk, so a connection made after a
    /// rotation presents the new certificate. The previous identity is kept
    /// when the files cannot be loaded.
    fn refresh_identity(&mut self) {
        match load_tls_config(&self.ca_file, &self.cert_file, &self.key_file) {
            Ok(config) => self.tls_config = config,
            Err(e) => warn!(error = %e, "Keeping previously loaded TLS identity"),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    fn try_connect(&self) -> Result<TlsStream, TransportError> {
        if let Some(spa) = &self.spa {
            spa.send()?;
        }

        let addr = (self.address.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("{} did not resolve", self.address),
                ))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, HANDSHAKE_TIMEOUT)?;
        tcp.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        tcp.set_write_timeout(Some(self.write_timeout))?;

        let conn = ClientConnection::new(Arc::clone(&self.tls_config), self.server_name.clone())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let mut stream = StreamOwned::new(conn, tcp);
        while stream.conn.is_handshaking() {
            stream.conn.complete_io(&mut stream.sock)?;
        }
        stream.sock.set_read_timeout(Some(self.read_timeout))?;
        Ok(stream)
    }
}

/// Take the next non-empty line off `pending`, without its line ending.
fn take_frame(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if !line.is_empty() {
            return Some(line);
        }
    }
    None
}

impl Transport for TlsTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.refresh_identity();
        let mut delay = self.initial_conn_retry_interval;
        let mut reason = String::new();
        for attempt in 1..=self.max_conn_attempts {
            match self.try_connect() {
                Ok(stream) => {
                    info!(endpoint = %self.endpoint(), attempt, "Connected to controller");
                    self.stream = Some(stream);
                    self.pending.clear();
                    return Ok(());
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint(), attempt, error = %e, "Connection attempt failed");
                    reason = e.to_string();
                }
            }
            if attempt < self.max_conn_attempts {
                std::thread::sleep(delay);
                delay = delay.saturating_mul(2);
            }
        }
        Err(TransportError::ConnectFailed {
            addr: self.endpoint(),
            attempts: self.max_conn_attempts,
            reason,
        })
    }

    fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.conn.send_close_notify();
            if let Err(e) = stream.conn.complete_io(&mut stream.sock) {
                debug!(error = %e, "close_notify not delivered");
            }
            info!(endpoint = %self.endpoint(), "Disconnected from controller");
        }
        self.pending.clear();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn send_message(&mut self, msg: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let result = stream
            .write_all(msg.as_bytes())
            .and_then(|()| stream.write_all(b"\n"))
            .and_then(|()| stream.flush());
        if let Err(e) = result {
            self.stream = None;
            return Err(e.into());
        }
        Ok(())
    }

    fn receive_next_message(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.stream.is_none() {
            return Err(TransportError::NotConnected);
        }
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = take_frame(&mut self.pending) {
                return Ok(Some(frame));
            }
            if self.pending.len() > MAX_MESSAGE_LEN {
                self.disconnect();
                return Err(TransportError::MessageTooLarge(MAX_MESSAGE_LEN));
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err(TransportError::NotConnected);
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.stream = None;
                    return Err(TransportError::Closed);
                }
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.stream = None;
                    return Err(e.into());
                }
            }
        }
    }

    fn spa_keys(&self) -> &SpaKeys {
        &self.spa_keys
    }

    fn replace_spa_keys(&mut self, keys: SpaKeys) {
        self.spa_keys = keys;
    }
}

/// Builds [`TlsTransport`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsTransportBuilder;

impl TransportBuilder for TlsTransportBuilder {
    fn build(&self, config: &ClientConfig) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(TlsTransport::from_config(config)?))
    }
}

fn load_tls_config(
    ca_file: &Path,
    cert_file: &Path,
    key_file: &Path,
) -> Result<Arc<rustls::ClientConfig>, TransportError> {
    let pem_err = |path: &Path, e: rustls::pki_types::pem::Error| {
        TransportError::Tls(format!("{}: {e}", path.display()))
    };

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(ca_file).map_err(|e| pem_err(ca_file, e))? {
        roots
            .add(cert.map_err(|e| pem_err(ca_file, e))?)
            .map_err(|e| TransportError::Tls(format!("{}: {e}", ca_file.display())))?;
    }

    let certs = CertificateDer::pem_file_iter(cert_file)
        .map_err(|e| pem_err(cert_file, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| pem_err(cert_file, e))?;
    let key = PrivateKeyDer::from_pem_file(key_file).map_err(|e| pem_err(key_file, e))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use rcgen::{CertificateParams, KeyPair};
    use rustls::client::ResolvesClientCert;
    use sdp_ctrl_core::ConfigPaths;

    /// Write a self-signed identity to `cert`/`key`; returns the cert DER.
    fn write_identity(cert: &Path, key: &Path) -> CertificateDer<'static> {
        let key_pair = KeyPair::generate().unwrap();
        let issued = CertificateParams::new(vec!["client.example.com".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        std::fs::write(cert, issued.pem()).unwrap();
        std::fs::write(key, key_pair.serialize_pem()).unwrap();
        issued.der().clone()
    }

    fn presented_cert(transport: &TlsTransport) -> CertificateDer<'static> {
        let key = transport
            .tls_config
            .client_auth_cert_resolver
            .resolve(&[], &[rustls::SignatureScheme::ECDSA_NISTP256_SHA256])
            .unwrap();
        key.cert[0].clone()
    }

    fn transport_in(dir: &Path) -> TlsTransport {
        let toml = format!(
            r#"
[controller]
address = "ctrl.example.com"
port = 5000

[tls]
cert_file = "{dir}/client.crt"
key_file = "{dir}/client.key"
ca_file = "{dir}/client.crt"

[spa]
fwknoprc_file = "{dir}/fwknoprc"
encryption_key = "ENC"
hmac_key = "HMAC"
"#,
            dir = dir.display()
        );
        let paths = ConfigPaths::new(dir.join("client.toml"), None);
        TlsTransport::from_config(&ClientConfig::from_toml(&toml, &paths).unwrap()).unwrap()
    }

    #[test]
    fn rotated_identity_is_loaded_before_reconnecting() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("client.crt");
        let key = dir.path().join("client.key");
        let old = write_identity(&cert, &key);
        let mut transport = transport_in(dir.path());
        assert_eq!(presented_cert(&transport), old);

        let new = write_identity(&cert, &key);
        transport.refresh_identity();

        assert_eq!(presented_cert(&transport), new);
    }

    #[test]
    fn unreadable_identity_keeps_the_loaded_one() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("client.crt");
        let key = dir.path().join("client.key");
        let old = write_identity(&cert, &key);
        let mut transport = transport_in(dir.path());

        std::fs::write(&key, "not a key").unwrap();
        transport.refresh_identity();

        assert_eq!(presented_cert(&transport), old);
    }

    #[test]
    fn missing_pem_files_are_tls_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.pem");
        assert!(matches!(
            load_tls_config(&missing, &missing, &missing),
            Err(TransportError::Tls(_))
        ));
    }

    #[test]
    fn framing_skips_blank_lines_and_strips_crlf() {
        let mut pending = b"{\"a\":1}\r\n\n{\"b\":2}\npartial".to_vec();
        assert_eq!(take_frame(&mut pending).unwrap(), b"{\"a\":1}");
        assert_eq!(take_frame(&mut pending).unwrap(), b"{\"b\":2}");
        assert!(take_frame(&mut pending).is_none());
        assert_eq!(pending, b"partial");
    }
}
