//! Filesystem helpers for secret-bearing files.
//!
//! Every file the client manages (PID file, TLS material, both SPA key files)
//! is expected to be a regular file or symlink, owned by the effective user,
//! with mode 0600. Deviations are logged; only a path that is neither a file
//! nor a symlink is refused.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::error;
use zeroize::Zeroizing;

use crate::error::{ClientError, Result};

/// Owner read/write only.
pub const SECRET_FILE_MODE: u32 = 0o600;

/// Same bound the kernel applies to path resolution.
const MAX_SYMLINK_HOPS: usize = 40;

/// A logged deviation from the expected ownership and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionIssue {
    Mode { actual: u32 },
    Owner { uid: u32, expected: u32 },
}

/// Check type, mode and owner of `path`. A missing file is fine.
pub fn verify_file_perms(path: &Path) -> Result<Vec<PermissionIssue>> {
    let link_meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            error!(path = %path.display(), error = %e, "stat() failed");
            return Err(ClientError::filesystem(path, e));
        }
    };

    let file_type = link_meta.file_type();
    if !file_type.is_file() && !file_type.is_symlink() {
        error!(path = %path.display(), "Not a regular file or symbolic link");
        return Err(ClientError::filesystem(
            path,
            std::io::Error::new(
                ErrorKind::InvalidInput,
                "not a regular file or symbolic link",
            ),
        ));
    }

    // Mode and owner are those of the link target.
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ClientError::filesystem(path, e)),
    };

    let mut issues = Vec::new();
    let mode = meta.permissions().mode() & 0o777;
    if mode != SECRET_FILE_MODE {
        error!(
            path = %path.display(),
            mode = format!("{mode:o}"),
            "Permissions should only be user read/write (0600, -rw-------)"
        );
        issues.push(PermissionIssue::Mode { actual: mode });
    }

    let expected = nix::unistd::geteuid().as_raw();
    if meta.uid() != expected {
        error!(
            path = %path.display(),
            owner = meta.uid(),
            euid = expected,
            "File not owned by current effective user id"
        );
        issues.push(PermissionIssue::Owner {
            uid: meta.uid(),
            expected,
        });
    }
    Ok(issues)
}

/// Read a file's bytes, `None` if it does not exist.
pub fn read_existing(path: &Path) -> std::io::Result<Option<Zeroizing<Vec<u8>>>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut buf = Zeroizing::new(Vec::new());
    file.read_to_end(&mut buf)?;
    Ok(Some(buf))
}

/// The file a write to `path` must land in: `path` itself, or the file a
/// symlink at `path` points to, following every link in the chain.
pub fn resolve_target(path: &Path) -> std::io::Result<PathBuf> {
    let mut current = path.to_path_buf();
    for _ in 0..MAX_SYMLINK_HOPS {
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let link = std::fs::read_link(&current)?;
                current = match current.parent() {
                    Some(dir) => dir.join(link),
                    None => link,
                };
            }
            Ok(_) => return Ok(current),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(current),
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        ErrorKind::InvalidInput,
        format!("too many levels of symbolic links: {}", path.display()),
    ))
}

/// Replace the file at `path` with `data` via a synced temp file in the same
/// directory. A symlink at `path` is kept and its target is replaced.
///
/// The target is either fully old or fully new; the result has mode 0600.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let target = resolve_target(path)?;
    let path = target.as_path();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".sdp-ctrl-")
        .tempfile_in(dir)?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(SECRET_FILE_MODE))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_has_no_issues() {
        let dir = tempfile::tempdir().unwrap();
        assert!(verify_file_perms(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn directory_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            verify_file_perms(dir.path()),
            Err(ClientError::Filesystem { .. })
        ));
    }

    #[test]
    fn loose_mode_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.crt");
        std::fs::write(&path, b"cert").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let issues = verify_file_perms(&path).unwrap();
        assert_eq!(issues, vec![PermissionIssue::Mode { actual: 0o644 }]);
    }

    #[test]
    fn write_atomic_creates_owner_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.key");
        write_atomic(&path, b"key material").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"key material");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert!(verify_file_perms(&path).unwrap().is_empty());
    }

    #[test]
    fn write_atomic_into_missing_directory_fails_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("client.key");
        assert!(write_atomic(&path, b"x").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn write_atomic_goes_through_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.crt");
        let link = dir.path().join("client.crt");
        write_atomic(&real, b"old").unwrap();
        std::os::unix::fs::symlink("real.crt", &link).unwrap();

        write_atomic(&link, b"new").unwrap();

        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(&real).unwrap(), b"new");
    }

    #[test]
    fn dangling_symlink_resolves_to_its_target() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("client.key");
        std::os::unix::fs::symlink("keys/client.key", &link).unwrap();
        assert_eq!(
            resolve_target(&link).unwrap(),
            dir.path().join("keys/client.key")
        );
    }

    #[test]
    fn symlink_loop_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        std::os::unix::fs::symlink("b", &a).unwrap();
        std::os::unix::fs::symlink("a", dir.path().join("b")).unwrap();
        assert!(resolve_target(&a).is_err());
    }

    #[test]
    fn read_existing_distinguishes_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        assert!(read_existing(&path).unwrap().is_none());
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(read_existing(&path).unwrap().unwrap().as_slice(), b"abc");
    }
}
