//! Advisory lock on the PID file.
//!
//! The lock lives as long as the open descriptor. The descriptor is opened
//! close-on-exec, so helper processes never inherit it.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, error};

use crate::error::{ClientError, Result};
use crate::files;

const HOLDER_WRITE_RETRIES: u32 = 10;
const HOLDER_WRITE_WAIT: Duration = Duration::from_millis(10);

/// Exclusive ownership of the PID file for this process.
#[derive(Debug)]
pub struct PidLock {
    file: File,
    path: PathBuf,
    pid: i32,
}

/// Result of trying to take the lock.
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(PidLock),
    /// Another live process holds the lock; this is its recorded PID.
    HeldBy(i32),
}

impl PidLock {
    /// Take the lock at `path` and record this process's PID in it.
    ///
    /// Contention is not an error: the holder's PID is returned instead.
    pub fn acquire(path: &Path) -> Result<LockOutcome> {
        files::verify_file_perms(path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(files::SECRET_FILE_MODE)
            .open(path)
            .map_err(|e| ClientError::filesystem(path, e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                let pid = read_holder_pid(&mut file).map_err(|e| {
                    error!(path = %path.display(), error = %e, "Unable to read existing PID file");
                    ClientError::filesystem(path, e)
                })?;
                return Ok(LockOutcome::HeldBy(pid));
            }
            Err(e) => return Err(ClientError::filesystem(path, e)),
        }

        let pid = nix::unistd::getpid().as_raw();
        debug!(pid, path = %path.display(), "Writing PID to lock file");
        if let Err(e) = write_pid(&mut file, pid) {
            error!(path = %path.display(), error = %e, "Lock may not be valid. PID file write error");
        }

        Ok(LockOutcome::Acquired(Self {
            file,
            path: path.to_path_buf(),
            pid,
        }))
    }

    pub const fn pid(&self) -> i32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Underlying descriptor, for diagnostics.
    pub fn file(&self) -> &File {
        &self.file
    }
}

/// PID of the process holding the lock at `path`, without taking ownership.
///
/// `None` when the file is missing or nobody holds its lock, so a stale PID
/// left behind by a dead instance is never reported.
pub fn probe(path: &Path) -> Result<Option<i32>> {
    files::verify_file_perms(path)?;

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ClientError::filesystem(path, e)),
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => Ok(None),
        Err(e) if e.kind() == ErrorKind::WouldBlock => read_holder_pid(&mut file)
            .map(Some)
            .map_err(|e| ClientError::filesystem(path, e)),
        Err(e) => Err(ClientError::filesystem(path, e)),
    }
}

/// [`read_pid`], allowing a holder that has just taken the lock a moment to
/// write its PID.
fn read_holder_pid(file: &mut File) -> std::io::Result<i32> {
    let mut result = read_pid(file);
    for _ in 0..HOLDER_WRITE_RETRIES {
        match &result {
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                std::thread::sleep(HOLDER_WRITE_WAIT);
                result = read_pid(file);
            }
            _ => break,
        }
    }
    result
}

fn read_pid(file: &mut File) -> std::io::Result<i32> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut text)?;
    text.lines()
        .next()
        .unwrap_or_default()
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidData, "PID file holds no valid PID"))
}

fn write_pid(file: &mut File, pid: i32) -> std::io::Result<()> {
    let line = format!("{pid}\n");
    file.seek(SeekFrom::Start(0))?;
    file.write_all(line.as_bytes())?;
    file.set_len(line.len() as u64)?;
    file.sync_all()
}
