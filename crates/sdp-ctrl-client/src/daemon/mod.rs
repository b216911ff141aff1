//! Process lifecycle: PID-file singleton lock, daemonization, signals and
//! control of a running instance by PID.

mod pid_lock;
mod process;
mod signals;

pub use pid_lock::{LockOutcome, PidLock, probe};
pub use process::{Daemonized, acquire_foreground, daemonize, restart, status, stop};
pub use signals::{PROCESS_SIGNALS, SignalEvent, SignalFlags, install_handlers, reap_children};
