#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Stop, restart and status commands against a stand-in running instance.
//!
//! The test process holds the PID lock while the file names a spawned
//! `sleep`, so signals reach the child instead of the test harness.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use sdp_ctrl_client::ClientError;
use sdp_ctrl_client::daemon::{self, LockOutcome, PidLock};

struct Instance {
    child: Child,
    _lock: PidLock,
    pid_file: PathBuf,
}

fn fake_instance(dir: &Path) -> Instance {
    let pid_file = dir.join("client.pid");
    let LockOutcome::Acquired(lock) = PidLock::acquire(&pid_file).unwrap() else {
        panic!("lock should be free");
    };
    let child = Command::new("sleep").arg("30").spawn().unwrap();
    std::fs::write(&pid_file, format!("{}\n", child.id())).unwrap();
    Instance {
        child,
        _lock: lock,
        pid_file,
    }
}

fn child_pid(child: &Child) -> i32 {
    i32::try_from(child.id()).unwrap()
}

#[test]
fn status_reports_the_lock_holder() {
    let dir = tempfile::tempdir().unwrap();
    let mut instance = fake_instance(dir.path());

    assert_eq!(
        daemon::status(&instance.pid_file).unwrap(),
        Some(child_pid(&instance.child))
    );

    instance.child.kill().unwrap();
    instance.child.wait().unwrap();
}

#[test]
fn restart_sends_sighup() {
    let dir = tempfile::tempdir().unwrap();
    let mut instance = fake_instance(dir.path());

    let pid = daemon::restart(&instance.pid_file).unwrap();
    assert_eq!(pid, child_pid(&instance.child));

    let status = instance.child.wait().unwrap();
    assert_eq!(status.signal(), Some(libc::SIGHUP));
}

#[test]
fn stop_terminates_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    let Instance {
        mut child,
        _lock,
        pid_file,
    } = fake_instance(dir.path());
    let expected = child_pid(&child);
    let waiter = std::thread::spawn(move || child.wait().unwrap());

    assert_eq!(daemon::stop(&pid_file).unwrap(), expected);

    let status = waiter.join().unwrap();
    assert_eq!(status.signal(), Some(libc::SIGTERM));
}

#[test]
fn commands_without_a_running_instance() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("client.pid");

    assert_eq!(daemon::status(&pid_file).unwrap(), None);
    assert!(matches!(daemon::stop(&pid_file), Err(ClientError::Other(_))));
    assert!(matches!(daemon::restart(&pid_file), Err(ClientError::Other(_))));

    // A file left by a dead instance is not a running instance.
    std::fs::write(&pid_file, "999999\n").unwrap();
    assert_eq!(daemon::status(&pid_file).unwrap(), None);
}
