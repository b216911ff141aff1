//! Starting, stopping and signalling the daemon process.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::sys::stat::{Mode, umask};
use nix::unistd::{ForkResult, Pid, fork, setsid};
use tracing::{error, info, warn};

use super::pid_lock::{LockOutcome, PidLock, probe};
use super::signals::install_handlers;
use crate::error::{ClientError, Result};

/// How long `stop` waits after each signal before checking again.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Which side of the fork the caller is on.
#[derive(Debug)]
pub enum Daemonized {
    /// The original process; it should report `child` and return.
    Parent { child: i32 },
    /// The detached daemon, holding the PID lock.
    Child(PidLock),
}

/// Detach into the background.
///
/// Must run before any thread is spawned. The child starts a new session,
/// takes the PID lock, moves to `/`, installs signal handlers and points its
/// standard streams at `/dev/null`.
#[allow(unsafe_code)]
pub fn daemonize(pid_file: &Path) -> Result<Daemonized> {
    umask(Mode::empty());

    // SAFETY: the process is single-threaded here; no runtime or worker
    // threads exist before daemonization.
    match unsafe { fork() }.map_err(ClientError::Fork)? {
        ForkResult::Parent { child } => {
            return Ok(Daemonized::Parent {
                child: child.as_raw(),
            });
        }
        ForkResult::Child => {}
    }

    setsid().map_err(ClientError::Fork)?;

    let lock = match PidLock::acquire(pid_file)? {
        LockOutcome::Acquired(lock) => lock,
        LockOutcome::HeldBy(pid) => {
            error!(pid, "An instance of sdp-ctrl-client is already running");
            return Err(ClientError::ProcessExists { pid });
        }
    };

    std::env::set_current_dir("/").map_err(|e| ClientError::filesystem("/", e))?;
    install_handlers()?;
    redirect_std_streams()?;
    Ok(Daemonized::Child(lock))
}

/// Take the PID lock for a process staying in the foreground.
pub fn acquire_foreground(pid_file: &Path) -> Result<PidLock> {
    match PidLock::acquire(pid_file)? {
        LockOutcome::Acquired(lock) => Ok(lock),
        LockOutcome::HeldBy(pid) => {
            error!(pid, "An instance of sdp-ctrl-client is already running");
            Err(ClientError::ProcessExists { pid })
        }
    }
}

#[allow(unsafe_code)]
fn redirect_std_streams() -> Result<()> {
    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| ClientError::filesystem("/dev/null", e))?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } < 0 {
            return Err(ClientError::filesystem(
                "/dev/null",
                std::io::Error::last_os_error(),
            ));
        }
    }
    Ok(())
}

fn is_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

fn running_pid(pid_file: &Path) -> Result<Pid> {
    match probe(pid_file)? {
        Some(pid) => Ok(Pid::from_raw(pid)),
        None => {
            warn!("No running sdp-ctrl-client detected");
            Err(ClientError::Other("no running instance detected".into()))
        }
    }
}

/// Terminate the running instance: SIGTERM, then SIGKILL if it lingers.
pub fn stop(pid_file: &Path) -> Result<i32> {
    let pid = running_pid(pid_file)?;

    for signal in [Signal::SIGTERM, Signal::SIGKILL] {
        let sent = kill(pid, signal);
        if sent.is_ok() && !is_alive(pid) {
            warn!(pid = pid.as_raw(), %signal, "Killed sdp-ctrl-client");
            return Ok(pid.as_raw());
        }
        std::thread::sleep(STOP_GRACE);
        if !is_alive(pid) {
            warn!(pid = pid.as_raw(), %signal, "Killed sdp-ctrl-client");
            return Ok(pid.as_raw());
        }
    }

    error!(pid = pid.as_raw(), "Unable to kill sdp-ctrl-client");
    Err(ClientError::Other(format!(
        "unable to kill sdp-ctrl-client (pid={pid})"
    )))
}

/// Ask the running instance to rebuild itself in place.
pub fn restart(pid_file: &Path) -> Result<i32> {
    let pid = running_pid(pid_file)?;
    kill(pid, Signal::SIGHUP).map_err(|e| {
        ClientError::Other(format!("unable to signal sdp-ctrl-client (pid={pid}): {e}"))
    })?;
    warn!(pid = pid.as_raw(), "Sent restart signal to sdp-ctrl-client");
    Ok(pid.as_raw())
}

/// PID of the running instance, if any.
pub fn status(pid_file: &Path) -> Result<Option<i32>> {
    let pid = probe(pid_file)?;
    match pid {
        Some(pid) => info!(pid, "Detected sdp-ctrl-client is running"),
        None => info!("No running sdp-ctrl-client detected"),
    }
    Ok(pid)
}
