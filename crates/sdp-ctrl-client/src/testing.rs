//! Test doubles for driving a session without a controller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use sdp_ctrl_core::ClientConfig;

use crate::clock::Clock;
use crate::credentials::SpaKeys;
use crate::transport::{Transport, TransportBuilder, TransportError};

/// Shared state behind a [`MockTransport`].
#[derive(Debug, Default)]
pub struct MockState {
    pub connected: bool,
    pub connects: usize,
    pub sent: Vec<String>,
    pub inbox: VecDeque<Vec<u8>>,
    pub fail_connect: bool,
    pub fail_send: bool,
    pub drop_on_receive: bool,
}

/// Test-side view of a mock transport's state.
#[derive(Debug, Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_inbound(&self, msg: &str) {
        self.lock().inbox.push_back(msg.as_bytes().to_vec());
    }

    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Simulate the controller dropping the connection.
    pub fn drop_connection(&self) {
        self.lock().connected = false;
    }
}

/// Scripted in-memory transport.
#[derive(Debug)]
pub struct MockTransport {
    handle: MockHandle,
    spa_keys: SpaKeys,
}

impl MockTransport {
    pub fn new(handle: MockHandle, spa_keys: SpaKeys) -> Self {
        Self { handle, spa_keys }
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.handle.lock();
        if state.fail_connect {
            return Err(TransportError::ConnectFailed {
                addr: "mock".into(),
                attempts: 1,
                reason: "refused".into(),
            });
        }
        if !state.connected {
            state.connected = true;
            state.connects += 1;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.handle.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.handle.lock().connected
    }

    fn send_message(&mut self, msg: &str) -> Result<(), TransportError> {
        let mut state = self.handle.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_send {
            state.connected = false;
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock send failure",
            )));
        }
        state.sent.push(msg.to_string());
        Ok(())
    }

    fn receive_next_message(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut state = self.handle.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.drop_on_receive {
            state.drop_on_receive = false;
            state.connected = false;
            return Err(TransportError::Closed);
        }
        Ok(state.inbox.pop_front())
    }

    fn spa_keys(&self) -> &SpaKeys {
        &self.spa_keys
    }

    fn replace_spa_keys(&mut self, keys: SpaKeys) {
        self.spa_keys = keys;
    }
}

/// Builds [`MockTransport`]s sharing one [`MockHandle`].
#[derive(Debug, Clone, Default)]
pub struct MockTransportBuilder {
    handle: MockHandle,
    builds: Arc<AtomicUsize>,
}

impl MockTransportBuilder {
    pub fn new(handle: MockHandle) -> Self {
        Self {
            handle,
            builds: Arc::default(),
        }
    }

    pub fn handle(&self) -> &MockHandle {
        &self.handle
    }

    /// How many transports have been built.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl TransportBuilder for MockTransportBuilder {
    fn build(&self, config: &ClientConfig) -> Result<Box<dyn Transport>, TransportError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransport::new(
            self.handle.clone(),
            SpaKeys::new(
                config.spa.encryption_key.clone(),
                config.spa.hmac_key.clone(),
            ),
        )))
    }
}

/// A wall clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(Mutex<SystemTime>);

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self(Mutex::new(start))
    }

    /// A clock at a fixed, arbitrary point after the epoch.
    pub fn starting_at_secs(secs: u64) -> Self {
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lay out a client config plus the four key-bearing files in `dir`.
///
/// `client_toml` is appended to the `[client]` table and `extra_toml` to the
/// end of the file. Returns the path of the client config file.
pub fn write_fixture(
    dir: &std::path::Path,
    client_toml: &str,
    extra_toml: &str,
) -> std::io::Result<std::path::PathBuf> {
    let cert = dir.join("client.crt");
    let key = dir.join("client.key");
    let rc = dir.join("fwknoprc");
    let config = dir.join("client.toml");

    crate::files::write_atomic(&cert, b"OLD CERT\n")?;
    crate::files::write_atomic(&key, b"OLD KEY\n")?;
    crate::files::write_atomic(
        &rc,
        b"[default]\nSPA_SERVER ctrl.example.com\nKEY_BASE64 OLDENC\nHMAC_KEY_BASE64 OLDHMAC\n",
    )?;
    let toml = format!(
        r#"[controller]
address = "ctrl.example.com"
port = 5000

[client]
pid_file = "{pid}"
{client_toml}

[tls]
cert_file = "{cert}"
key_file = "{key}"
ca_file = "{ca}"

[spa]
fwknoprc_file = "{rc}"
encryption_key = "OLDENC"
hmac_key = "OLDHMAC"
{extra_toml}"#,
        pid = dir.join("client.pid").display(),
        cert = cert.display(),
        key = key.display(),
        ca = dir.join("ca.crt").display(),
        rc = rc.display(),
    );
    crate::files::write_atomic(&config, toml.as_bytes())?;
    Ok(config)
}
