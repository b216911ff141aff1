//! Client handle and run loop.
//!
//! The client owns the PID lock and at most one [`Session`]. An in-place
//! restart drops the session and builds a fresh one from the configuration
//! files it was started with; the PID lock is held across the rebuild.

use std::fmt::Write as _;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use sdp_ctrl_core::{ClientConfig, ConfigPaths};

use crate::clock::Clock;
use crate::daemon::{PidLock, SignalEvent, SignalFlags, reap_children};
use crate::error::{ClientError, Result};
use crate::message::JsonCodec;
use crate::session::Session;
use crate::transport::TransportBuilder;

/// Pause between loop iterations.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// What pending signals did to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Continue,
    /// The session was rebuilt from its configuration files.
    Restarted,
    Stop,
}

/// Whether the run loop keeps going after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Exit,
}

pub struct Client {
    paths: ConfigPaths,
    builder: Box<dyn TransportBuilder>,
    clock: Arc<dyn Clock>,
    signals: &'static SignalFlags,
    session: Option<Session>,
    pid_lock: Option<PidLock>,
    tick_interval: Duration,
}

impl Client {
    /// Load configuration from `paths` and build the first session.
    pub fn new(
        paths: ConfigPaths,
        builder: Box<dyn TransportBuilder>,
        clock: Arc<dyn Clock>,
        signals: &'static SignalFlags,
    ) -> Result<Self> {
        let config = ClientConfig::load(&paths)?;
        Self::from_config(config, builder, clock, signals)
    }

    /// Build around an already loaded configuration. Restarts reload from
    /// the paths recorded in it.
    pub fn from_config(
        config: ClientConfig,
        builder: Box<dyn TransportBuilder>,
        clock: Arc<dyn Clock>,
        signals: &'static SignalFlags,
    ) -> Result<Self> {
        let paths = config.paths();
        let session = build_session(config, builder.as_ref(), &clock)?;
        Ok(Self {
            paths,
            builder,
            clock,
            signals,
            session: Some(session),
            pid_lock: None,
            tick_interval: TICK_INTERVAL,
        })
    }

    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(ClientError::Uninitialized)
    }

    pub fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(ClientError::Uninitialized)
    }

    pub fn config(&self) -> Result<&ClientConfig> {
        self.session().map(Session::config)
    }

    pub const fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Hand the process's PID lock to the client for the rest of its life.
    pub fn attach_pid_lock(&mut self, lock: PidLock) {
        self.pid_lock = Some(lock);
    }

    pub const fn pid_lock(&self) -> Option<&PidLock> {
        self.pid_lock.as_ref()
    }

    pub fn connect(&mut self) -> Result<()> {
        self.session_mut()?.connect()
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.session_mut()?.disconnect();
        Ok(())
    }

    pub fn describe(&self) -> Result<String> {
        let mut out = self.session()?.describe();
        match &self.pid_lock {
            Some(lock) => {
                let _ = writeln!(out, "{:>40}: {}", "PID", lock.pid());
                let _ = writeln!(
                    out,
                    "{:>40}: {}",
                    "PID lock file descriptor",
                    lock.file().as_raw_fd()
                );
            }
            None => {
                let _ = writeln!(out, "{:>40}: {}", "PID lock file descriptor", "none");
            }
        }
        Ok(out)
    }

    /// Drop the current session and build a new one from the original
    /// configuration files. The PID lock is kept.
    pub fn restart_in_place(&mut self) -> Result<()> {
        if let Some(mut old) = self.session.take() {
            old.disconnect();
        }
        let config = ClientConfig::load(&self.paths)?;
        let session = build_session(config, self.builder.as_ref(), &self.clock)?;
        debug!("\n{}", session.describe());
        self.session = Some(session);
        Ok(())
    }

    /// Consume pending signals.
    pub fn handle_signals(&mut self) -> Result<SignalAction> {
        if self.signals.take_child_exit() {
            reap_children();
        }
        match self.signals.take() {
            None => Ok(SignalAction::Continue),
            Some(SignalEvent::Restart) => {
                warn!("Got SIGHUP. Restarting.");
                self.restart_in_place()?;
                Ok(SignalAction::Restarted)
            }
            Some(SignalEvent::Stop(signal)) => {
                warn!(%signal, "Got stop signal. Exiting...");
                Ok(SignalAction::Stop)
            }
            Some(SignalEvent::Unhandled(signal)) => {
                error!(%signal, "No defined action for signal");
                Ok(SignalAction::Continue)
            }
        }
    }

    /// One pass: signals, connect, drain inbox, credential timer, one-shot
    /// exit, keep-alive timer.
    pub fn iterate(&mut self) -> Result<Tick> {
        if self.handle_signals()? == SignalAction::Stop {
            return Ok(Tick::Exit);
        }

        let session = self.session_mut()?;
        session.connect()?;

        match session.check_inbox() {
            Ok(_) => {}
            Err(ClientError::Rotation(e)) => {
                error!(error = %e, "Credential update not installed; awaiting retry");
            }
            Err(e) => return Err(e),
        }

        session.consider_credential_update()?;

        if !session.config().client.remain_connected && session.last_cred_update().is_some() {
            info!("Credentials updated; not configured to remain connected");
            return Ok(Tick::Exit);
        }

        session.consider_keep_alive()?;
        Ok(Tick::Continue)
    }

    /// [`Self::iterate`], treating a lost connection as a reason to reconnect
    /// next time rather than to stop.
    pub fn step(&mut self) -> Result<Tick> {
        match self.iterate() {
            Err(e) if e.is_connection_loss() => {
                warn!(error = %e, "Lost connection to controller; will reconnect");
                self.disconnect()?;
                Ok(Tick::Continue)
            }
            other => other,
        }
    }

    /// Run until stopped, terminal failure, or a one-shot update completes.
    pub fn run(&mut self) -> Result<()> {
        if let Ok(session) = self.session() {
            debug!("\n{}", session.describe());
        }
        let result = loop {
            match self.step() {
                Ok(Tick::Continue) => std::thread::sleep(self.tick_interval),
                Ok(Tick::Exit) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        if let Some(session) = self.session.as_mut() {
            session.disconnect();
        }
        warn!("SDP Control Client exiting");
        result
    }
}

fn build_session(
    config: ClientConfig,
    builder: &dyn TransportBuilder,
    clock: &Arc<dyn Clock>,
) -> Result<Session> {
    let transport = builder.build(&config)?;
    Ok(Session::new(
        config,
        transport,
        Box::new(JsonCodec),
        Arc::clone(clock),
    ))
}
