//! Signal capture.
//!
//! Handlers only store into atomics. The run loop consumes the flags once per
//! tick and does all real work there, including reaping children.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::debug;

use crate::error::{ClientError, Result};

/// What a consumed signal asks the run loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGHUP: rebuild the session from its configuration files.
    Restart,
    /// SIGINT or SIGTERM: leave the run loop.
    Stop(Signal),
    /// A caught signal with no defined action.
    Unhandled(Signal),
}

/// Pending-signal flags, written from signal context.
#[derive(Debug)]
pub struct SignalFlags {
    hangup: AtomicBool,
    interrupt: AtomicBool,
    terminate: AtomicBool,
    child: AtomicBool,
    other: AtomicI32,
}

impl SignalFlags {
    pub const fn new() -> Self {
        Self {
            hangup: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            child: AtomicBool::new(false),
            other: AtomicI32::new(0),
        }
    }

    /// Mark `signal` pending. Async-signal-safe.
    pub fn record(&self, signal: Signal) {
        match signal {
            Signal::SIGHUP => self.hangup.store(true, Ordering::SeqCst),
            Signal::SIGINT => self.interrupt.store(true, Ordering::SeqCst),
            Signal::SIGTERM => self.terminate.store(true, Ordering::SeqCst),
            Signal::SIGCHLD => self.child.store(true, Ordering::SeqCst),
            other => self.other.store(other as i32, Ordering::SeqCst),
        }
    }

    /// Consume the most urgent pending event. Stop requests win over restart.
    pub fn take(&self) -> Option<SignalEvent> {
        if self.terminate.swap(false, Ordering::SeqCst) {
            return Some(SignalEvent::Stop(Signal::SIGTERM));
        }
        if self.interrupt.swap(false, Ordering::SeqCst) {
            return Some(SignalEvent::Stop(Signal::SIGINT));
        }
        if self.hangup.swap(false, Ordering::SeqCst) {
            return Some(SignalEvent::Restart);
        }
        match self.other.swap(0, Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok().map(SignalEvent::Unhandled),
        }
    }

    /// Whether SIGCHLD arrived since the last call.
    pub fn take_child_exit(&self) -> bool {
        self.child.swap(false, Ordering::SeqCst)
    }
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Flags the installed handlers write to.
pub static PROCESS_SIGNALS: SignalFlags = SignalFlags::new();

extern "C" fn handle_signal(signum: libc::c_int) {
    if let Ok(signal) = Signal::try_from(signum) {
        PROCESS_SIGNALS.record(signal);
    }
}

const CAUGHT: [Signal; 6] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCHLD,
];

/// Route the control signals to [`PROCESS_SIGNALS`].
#[allow(unsafe_code)]
pub fn install_handlers() -> Result<()> {
    for signal in CAUGHT {
        let mut flags = SaFlags::SA_RESTART;
        if signal == Signal::SIGCHLD {
            flags |= SaFlags::SA_NOCLDSTOP;
        }
        let action = SigAction::new(SigHandler::Handler(handle_signal), flags, SigSet::empty());
        // SAFETY: the handler performs a single atomic store and touches
        // nothing else, which is async-signal-safe.
        unsafe { sigaction(signal, &action) }.map_err(|e| {
            ClientError::Other(format!("Error setting {signal} handler: {e}"))
        })?;
    }
    debug!("Signal handlers installed");
    Ok(())
}

/// Collect every exited child without blocking.
pub fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => {
                debug!(?status, "Reaped child process");
                reaped += 1;
            }
        }
    }
    reaped
}
