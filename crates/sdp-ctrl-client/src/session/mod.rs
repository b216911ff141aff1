//! The client session: request/response state machine over one transport.
//!
//! All timing decisions read the injected [`Clock`], so the evaluators are
//! pure functions of the session fields and "now".

mod retry;
mod state;

pub use retry::{RetryDecision, RetryPolicy, is_due};
pub use state::SessionState;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, warn};

use sdp_ctrl_core::ClientConfig;

use crate::clock::Clock;
use crate::credentials::CredentialBundle;
use crate::error::{ClientError, RequestCategory, Result};
use crate::message::{Inbound, MessageCodec, Stage, Subject};
use crate::rotation::{self, RotationTargets};
use crate::transport::Transport;

/// Outcome of one `consider_*` evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consideration {
    /// Nothing was due.
    Idle,
    /// A new episode started.
    Requested,
    /// An unfulfilled request was re-issued.
    Retried,
}

/// One controller session.
pub struct Session {
    config: ClientConfig,
    state: SessionState,
    transport: Box<dyn Transport>,
    codec: Box<dyn MessageCodec>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    last_contact: Option<SystemTime>,
    last_cred_update: Option<SystemTime>,
    last_access_update: Option<SystemTime>,
    last_req_time: Option<SystemTime>,
    initial_conn_time: Option<SystemTime>,
    req_attempts: u32,
    req_retry_interval: Duration,
}

impl Session {
    pub fn new(
        config: ClientConfig,
        transport: Box<dyn Transport>,
        codec: Box<dyn MessageCodec>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policy = RetryPolicy::new(
            config.timing.initial_req_retry_interval(),
            config.timing.max_req_attempts,
        );
        Self {
            config,
            state: SessionState::Ready,
            transport,
            codec,
            clock,
            policy,
            last_contact: None,
            last_cred_update: None,
            last_access_update: None,
            last_req_time: None,
            initial_conn_time: None,
            req_attempts: 0,
            req_retry_interval: policy.initial_interval,
        }
    }

    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub const fn last_contact(&self) -> Option<SystemTime> {
        self.last_contact
    }

    pub const fn last_cred_update(&self) -> Option<SystemTime> {
        self.last_cred_update
    }

    pub const fn last_access_update(&self) -> Option<SystemTime> {
        self.last_access_update
    }

    pub const fn last_req_time(&self) -> Option<SystemTime> {
        self.last_req_time
    }

    pub const fn initial_conn_time(&self) -> Option<SystemTime> {
        self.initial_conn_time
    }

    pub const fn req_attempts(&self) -> u32 {
        self.req_attempts
    }

    pub const fn req_retry_interval(&self) -> Duration {
        self.req_retry_interval
    }

    pub fn controller_address(&self) -> &str {
        &self.config.controller.address
    }

    pub const fn controller_port(&self) -> u16 {
        self.config.controller.port
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Connect if disconnected, stamping the connection and contact times.
    pub fn connect(&mut self) -> Result<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        self.transport.connect()?;
        let now = self.clock.now();
        self.initial_conn_time = Some(now);
        self.last_contact = Some(now);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    pub fn request_keep_alive(&mut self) -> Result<()> {
        self.request(RequestCategory::KeepAlive)
    }

    pub fn request_credential_update(&mut self) -> Result<()> {
        self.request(RequestCategory::Credential)
    }

    /// A keep-alive response arrived.
    pub fn process_keep_alive_response(&mut self) {
        self.last_contact = Some(self.clock.now());
        if self.state.is_tracking(RequestCategory::KeepAlive) {
            self.end_episode();
        }
    }

    /// Install newly issued credentials and acknowledge them.
    ///
    /// When rotation fails the episode stays active and nothing is sent.
    pub fn process_credential_update(&mut self, bundle: CredentialBundle) -> Result<()> {
        let targets = RotationTargets::from_config(&self.config);
        if let Err(e) = rotation::install(bundle, &targets, self.transport.as_mut()) {
            error!(error = %e, "Failed to store new credentials");
            return Err(e.into());
        }

        let now = self.clock.now();
        self.last_contact = Some(now);
        self.last_cred_update = Some(now);
        if self.state.is_tracking(RequestCategory::Credential) {
            self.end_episode();
        }

        let msg = self
            .codec
            .make_message(Subject::CredentialUpdate, Some(Stage::Fulfilled))?;
        self.transport.send_message(&msg)?;
        Ok(())
    }

    pub fn consider_keep_alive(&mut self) -> Result<Consideration> {
        let interval = self.config.timing.keep_alive_interval();
        self.consider(RequestCategory::KeepAlive, self.last_contact, interval)
    }

    pub fn consider_credential_update(&mut self) -> Result<Consideration> {
        let interval = self.config.timing.cred_update_interval();
        self.consider(RequestCategory::Credential, self.last_cred_update, interval)
    }

    /// Handle up to `message_queue_len` waiting messages. Returns how many
    /// were handled.
    pub fn check_inbox(&mut self) -> Result<usize> {
        let limit = self.config.client.message_queue_len;
        let mut handled = 0;
        while handled < limit {
            let Some(raw) = self.transport.receive_next_message()? else {
                debug!("No more incoming messages");
                break;
            };
            handled += 1;

            match self.codec.process_message(&raw)? {
                Inbound::KeepAliveFulfilled => {
                    info!("Keep-alive response received");
                    self.process_keep_alive_response();
                }
                Inbound::CredentialFulfilled(bundle) => {
                    info!("Credential update received");
                    self.process_credential_update(bundle)?;
                }
                Inbound::Unrecognized { subject, stage } => {
                    warn!(subject = %subject, stage = ?stage, "Ignoring unrecognized message");
                }
            }
        }
        Ok(handled)
    }

    /// Settings and live session values, keys excluded.
    pub fn describe(&self) -> String {
        let mut out = String::from("Control Client Context Values:\n");
        out.push_str(&"=".repeat(72));
        out.push('\n');
        out.push_str(&self.config.describe());
        let yes_no = |b: bool| if b { "Yes" } else { "No" };
        let _ = writeln!(out, "{:>40}: {}", "Connected", yes_no(self.is_connected()));
        let _ = writeln!(out, "{:>40}: {}", "State", self.state);
        let _ = writeln!(out, "{:>40}: {}", "Last contact", fmt_time(self.last_contact));
        let _ = writeln!(
            out,
            "{:>40}: {}",
            "Last credential update",
            fmt_time(self.last_cred_update)
        );
        let _ = writeln!(
            out,
            "{:>40}: {}",
            "Last full access update",
            fmt_time(self.last_access_update)
        );
        let _ = writeln!(out, "{:>40}: {}", "Request attempts", self.req_attempts);
        let _ = writeln!(
            out,
            "{:>40}: {} seconds",
            "Request retry interval",
            self.req_retry_interval.as_secs()
        );
        out
    }

    fn request(&mut self, category: RequestCategory) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(ClientError::ConnectionDown);
        }
        if !self.state.accepts(category) {
            debug!(state = %self.state, %category, "Not in proper state to request");
            return Err(ClientError::WrongState {
                state: self.state,
                requested: category,
            });
        }

        let msg = match category {
            RequestCategory::KeepAlive => self.codec.make_message(Subject::KeepAlive, None)?,
            RequestCategory::Credential => self
                .codec
                .make_message(Subject::CredentialUpdate, Some(Stage::Requesting))?,
        };
        self.transport.send_message(&msg)?;

        self.state = SessionState::requesting(category);
        self.last_req_time = Some(self.clock.now());
        self.req_attempts += 1;
        debug!(%category, attempts = self.req_attempts, "Request sent");
        Ok(())
    }

    fn consider(
        &mut self,
        category: RequestCategory,
        since: Option<SystemTime>,
        interval: Duration,
    ) -> Result<Consideration> {
        if !self.transport.is_connected() {
            return Ok(Consideration::Idle);
        }
        let now = self.clock.now();

        if self.state == SessionState::Ready {
            if since.is_some_and(|t| !is_due(now, t, interval)) {
                return Ok(Consideration::Idle);
            }
            debug!(%category, "Request is due");
            self.request(category)?;
            return Ok(Consideration::Requested);
        }
        if !self.state.is_tracking(category) {
            return Ok(Consideration::Idle);
        }

        let last_req_time = self.last_req_time.unwrap_or(now);
        match self
            .policy
            .evaluate(now, last_req_time, self.req_retry_interval, self.req_attempts)
        {
            RetryDecision::NotDue => Ok(Consideration::Idle),
            RetryDecision::Retry { next_interval } => {
                self.state = SessionState::unfulfilled(category);
                self.req_retry_interval = next_interval;
                debug!(%category, interval = ?next_interval, "Retrying unfulfilled request");
                self.request(category)?;
                Ok(Consideration::Retried)
            }
            RetryDecision::Escalate => {
                error!(%category, attempts = self.req_attempts, "Too many failed requests");
                self.transport.disconnect();
                self.end_episode();
                self.state = SessionState::TimeToQuit;
                Err(ClientError::TooManyFailedRequests { category })
            }
        }
    }

    fn end_episode(&mut self) {
        self.last_req_time = None;
        self.req_retry_interval = self.policy.initial_interval;
        self.req_attempts = 0;
        self.state = SessionState::Ready;
    }
}

fn fmt_time(t: Option<SystemTime>) -> String {
    t.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map_or_else(|| "never".to_string(), |d| format!("{} (unix)", d.as_secs()))
}
