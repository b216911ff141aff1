#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Session state machine driven through a scripted transport and a manual
//! clock.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sdp_ctrl_client::clock::Clock;
use sdp_ctrl_client::message::{JsonCodec, MessageCodec, Stage, Subject};
use sdp_ctrl_client::session::Consideration;
use sdp_ctrl_client::testing::{ManualClock, MockHandle, MockTransport, write_fixture};
use sdp_ctrl_client::{ClientError, CredentialBundle, RequestCategory, Session, SessionState, SpaKeys};
use sdp_ctrl_core::{ClientConfig, ConfigPaths};

const T0: u64 = 1_700_000_000;

const KEEP_ALIVE_RESPONSE: &str = r#"{"action":"keep_alive","stage":"fulfilling"}"#;

fn credential_message(enc: &str, hmac: &str) -> String {
    format!(
        r#"{{"action":"credential_update","stage":"fulfilling","data":{{"tls_client_cert":"NEW CERT\n","tls_client_key":"NEW KEY\n","spa_encryption_key":"{enc}","spa_hmac_key":"{hmac}"}}}}"#
    )
}

fn load_config(dir: &Path) -> ClientConfig {
    let path = write_fixture(dir, "", "").unwrap();
    let paths = ConfigPaths::new(&path, None);
    let config = ClientConfig::from_toml(&std::fs::read_to_string(&path).unwrap(), &paths).unwrap();
    config.validate().unwrap();
    config
}

struct Harness {
    session: Session,
    handle: MockHandle,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new(config: ClientConfig) -> Self {
        let handle = MockHandle::new();
        let clock = Arc::new(ManualClock::starting_at_secs(T0));
        let transport = MockTransport::new(
            handle.clone(),
            SpaKeys::new(config.spa.encryption_key.clone(), config.spa.hmac_key.clone()),
        );
        let session = Session::new(config, Box::new(transport), Box::new(JsonCodec), clock.clone());
        Self {
            session,
            handle,
            clock,
        }
    }

    fn connected(config: ClientConfig) -> Self {
        let mut h = Self::new(config);
        h.session.connect().unwrap();
        h
    }

    fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    fn now(&self) -> SystemTime {
        self.clock.now()
    }
}

fn keep_alive_request() -> String {
    JsonCodec.make_message(Subject::KeepAlive, None).unwrap()
}

fn credential_request() -> String {
    JsonCodec
        .make_message(Subject::CredentialUpdate, Some(Stage::Requesting))
        .unwrap()
}

#[test]
fn keep_alive_is_due_exactly_at_interval() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::connected(load_config(dir.path()));

    h.advance(59);
    assert_eq!(h.session.consider_keep_alive().unwrap(), Consideration::Idle);
    assert_eq!(h.session.state(), SessionState::Ready);
    assert!(h.handle.sent().is_empty());

    h.advance(1);
    assert_eq!(h.session.consider_keep_alive().unwrap(), Consideration::Requested);
    assert_eq!(h.session.state(), SessionState::KeepAliveRequesting);
    assert_eq!(h.session.req_attempts(), 1);
    assert_eq!(h.handle.sent(), vec![keep_alive_request()]);
}

#[test]
fn keep_alive_fulfillment_always_returns_to_ready() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::connected(load_config(dir.path()));
    let initial = h.session.req_retry_interval();

    for retries in 0..3u64 {
        h.advance(60);
        h.session.consider_keep_alive().unwrap();
        for k in 0..retries {
            h.advance(10 << k);
            assert_eq!(h.session.consider_keep_alive().unwrap(), Consideration::Retried);
        }
        h.handle.push_inbound(KEEP_ALIVE_RESPONSE);
        assert_eq!(h.session.check_inbox().unwrap(), 1);

        assert_eq!(h.session.state(), SessionState::Ready);
        assert_eq!(h.session.req_retry_interval(), initial);
        assert_eq!(h.session.req_attempts(), 0);
        assert_eq!(h.session.last_contact(), Some(h.now()));
    }
}

#[test]
fn unfulfilled_requests_double_the_interval_then_escalate() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::connected(load_config(dir.path()));
    let initial = Duration::from_secs(10);

    assert_eq!(
        h.session.consider_credential_update().unwrap(),
        Consideration::Requested
    );
    assert_eq!(h.session.state(), SessionState::CredRequesting);

    // Deadlines 1 and 2 (of max_req_attempts = 3) re-request.
    for k in 1..=2u32 {
        let wait = h.session.req_retry_interval().as_secs();
        h.advance(wait - 1);
        assert_eq!(h.session.consider_credential_update().unwrap(), Consideration::Idle);
        h.advance(1);
        assert_eq!(
            h.session.consider_credential_update().unwrap(),
            Consideration::Retried
        );
        assert_eq!(h.session.req_retry_interval(), initial * 2u32.pow(k));
        assert_eq!(h.session.state(), SessionState::CredRequesting);
    }

    // Deadline 3 escalates.
    h.advance(h.session.req_retry_interval().as_secs());
    let err = h.session.consider_credential_update().unwrap_err();
    assert!(matches!(
        err,
        ClientError::TooManyFailedRequests {
            category: RequestCategory::Credential
        }
    ));
    assert_eq!(err.exit_code(), 9);
    assert_eq!(h.session.state(), SessionState::TimeToQuit);
    assert_eq!(h.session.req_retry_interval(), initial);
    assert_eq!(h.session.req_attempts(), 0);
    assert!(!h.session.is_connected());
    assert_eq!(h.handle.sent(), vec![credential_request(); 3]);
}

#[test]
fn cross_category_requests_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::connected(load_config(dir.path()));

    h.session.request_credential_update().unwrap();
    let err = h.session.request_keep_alive().unwrap_err();
    assert!(matches!(
        err,
        ClientError::WrongState {
            state: SessionState::CredRequesting,
            requested: RequestCategory::KeepAlive
        }
    ));

    h.advance(3600);
    assert_eq!(h.session.consider_keep_alive().unwrap(), Consideration::Idle);
    assert_eq!(h.handle.sent(), vec![credential_request()]);
}

#[test]
fn requests_fail_while_disconnected_without_changing_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(load_config(dir.path()));

    assert!(matches!(
        h.session.request_keep_alive(),
        Err(ClientError::ConnectionDown)
    ));
    assert_eq!(h.session.state(), SessionState::Ready);
    assert_eq!(h.session.req_attempts(), 0);
    assert!(h.session.last_req_time().is_none());

    assert_eq!(h.session.consider_credential_update().unwrap(), Consideration::Idle);
}

#[test]
fn connect_stamps_contact_times() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(load_config(dir.path()));
    assert!(h.session.initial_conn_time().is_none());

    h.session.connect().unwrap();
    assert_eq!(h.session.initial_conn_time(), Some(h.now()));
    assert_eq!(h.session.last_contact(), Some(h.now()));

    h.advance(5);
    h.session.connect().unwrap();
    assert_eq!(h.handle.connects(), 1, "already connected");
}

#[test]
fn credential_update_rotates_files_and_acknowledges() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(dir.path());
    let cert = config.tls.cert_file.clone();
    let client_toml = config.config_file.clone();
    let rc = config.fwknoprc_file().to_path_buf();
    let mut h = Harness::connected(config);

    h.session.consider_credential_update().unwrap();
    h.advance(3);
    h.handle.push_inbound(&credential_message("NEWENC", "NEWHMAC"));
    assert_eq!(h.session.check_inbox().unwrap(), 1);

    assert_eq!(h.session.state(), SessionState::Ready);
    assert_eq!(h.session.last_cred_update(), Some(h.now()));
    assert_eq!(h.session.last_contact(), Some(h.now()));
    assert_eq!(std::fs::read_to_string(cert).unwrap(), "NEW CERT\n");
    assert!(std::fs::read_to_string(client_toml).unwrap().contains("encryption_key = \"NEWENC\""));
    assert!(std::fs::read_to_string(rc).unwrap().contains("HMAC_KEY_BASE64 NEWHMAC"));
    assert_eq!(h.session.transport().spa_keys(), &SpaKeys::new("NEWENC", "NEWHMAC"));

    let ack = JsonCodec
        .make_message(Subject::CredentialUpdate, Some(Stage::Fulfilled))
        .unwrap();
    assert_eq!(h.handle.sent(), vec![credential_request(), ack]);
}

#[test]
fn failed_rotation_keeps_the_episode_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = load_config(dir.path());
    config.tls.key_file = dir.path().join("missing").join("client.key");
    let cert = config.tls.cert_file.clone();
    let mut h = Harness::connected(config);

    h.session.request_credential_update().unwrap();
    let bundle = CredentialBundle::new("NEW CERT\n", "NEW KEY\n", SpaKeys::new("E", "H"));
    let err = h.session.process_credential_update(bundle).unwrap_err();

    assert!(matches!(err, ClientError::Rotation(_)));
    assert_eq!(err.exit_code(), 6);
    assert_eq!(h.session.state(), SessionState::CredRequesting);
    assert_eq!(h.session.req_attempts(), 1);
    assert!(h.session.last_cred_update().is_none());
    assert_eq!(std::fs::read_to_string(cert).unwrap(), "OLD CERT\n");
    assert_eq!(h.session.transport().spa_keys(), &SpaKeys::new("OLDENC", "OLDHMAC"));
    assert_eq!(h.handle.sent(), vec![credential_request()], "no ack sent");
}

#[test]
fn inbox_drain_is_bounded_per_call() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = load_config(dir.path());
    config.client.message_queue_len = 2;
    let mut h = Harness::connected(config);

    for _ in 0..3 {
        h.handle.push_inbound(KEEP_ALIVE_RESPONSE);
    }
    assert_eq!(h.session.check_inbox().unwrap(), 2);
    assert_eq!(h.session.check_inbox().unwrap(), 1);
    assert_eq!(h.session.check_inbox().unwrap(), 0);
}

#[test]
fn unrecognized_messages_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::connected(load_config(dir.path()));
    h.session.request_keep_alive().unwrap();

    h.handle
        .push_inbound(r#"{"action":"service_refresh","stage":"fulfilling"}"#);
    assert_eq!(h.session.check_inbox().unwrap(), 1);
    assert_eq!(h.session.state(), SessionState::KeepAliveRequesting);
}

#[test]
fn malformed_message_aborts_the_drain() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::connected(load_config(dir.path()));
    h.handle.push_inbound("not json");
    h.handle.push_inbound(KEEP_ALIVE_RESPONSE);

    assert!(matches!(h.session.check_inbox(), Err(ClientError::Codec(_))));
    assert_eq!(h.session.check_inbox().unwrap(), 1);
}

#[test]
fn describe_reports_state_without_keys() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::connected(load_config(dir.path()));
    h.session.request_keep_alive().unwrap();

    let text = h.session.describe();
    assert!(text.contains("KEEP_ALIVE_REQUESTING"));
    assert!(text.contains("ctrl.example.com"));
    assert!(!text.contains("OLDHMAC"));
}

#[test]
fn dropped_connection_makes_timers_idle() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::connected(load_config(dir.path()));
    h.handle.drop_connection();

    h.advance(3600);
    assert_eq!(h.session.consider_keep_alive().unwrap(), Consideration::Idle);
    assert_eq!(h.session.consider_credential_update().unwrap(), Consideration::Idle);
    assert!(h.handle.sent().is_empty());
}

#[test]
fn failed_send_leaves_the_episode_unstarted() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::connected(load_config(dir.path()));
    h.handle.lock().fail_send = true;

    let err = h.session.request_credential_update().unwrap_err();

    assert!(err.is_connection_loss());
    assert_eq!(h.session.state(), SessionState::Ready);
    assert_eq!(h.session.req_attempts(), 0);
    assert!(h.session.last_req_time().is_none());
    assert!(!h.session.is_connected());
}
