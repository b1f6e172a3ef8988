//! Thin wrappers over ownership, permission and timestamp syscalls.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use a3s_build_core::error::{BuildError, Result};

/// Seconds and nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileTime {
    pub secs: i64,
    pub nanos: u32,
}

impl FileTime {
    pub fn from_secs(secs: i64) -> Self {
        Self { secs, nanos: 0 }
    }

    pub fn from_chrono(when: &chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            secs: when.timestamp(),
            nanos: when.timestamp_subsec_nanos(),
        }
    }

    pub fn mtime_of(meta: &std::fs::Metadata) -> Self {
        Self {
            secs: meta.mtime(),
            nanos: meta.mtime_nsec() as u32,
        }
    }

    pub fn to_chrono(self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(self.secs, self.nanos).unwrap_or_default()
    }
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        BuildError::CopierError(format!("path {} contains a NUL byte", path.display()))
    })
}

pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Change ownership without following symlinks.
///
/// Unprivileged callers cannot give files away; that case is logged and
/// ignored so that unprivileged builds still produce usable trees.
pub fn lchown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    match std::os::unix::fs::lchown(path, Some(uid), Some(gid)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && !is_root() => {
            tracing::debug!(path = %path.display(), uid, gid, "Skipping chown as unprivileged user");
            Ok(())
        }
        Err(e) => Err(BuildError::CopierError(format!(
            "setting ownership of {} to {}:{}: {}",
            path.display(),
            uid,
            gid,
            e
        ))),
    }
}

/// Set permission bits (including setuid/setgid/sticky).
pub fn chmod(path: &Path, mode: u32) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).map_err(|e| {
        BuildError::CopierError(format!(
            "setting permissions on {} to 0{:o}: {}",
            path.display(),
            mode,
            e
        ))
    })
}

/// Set access and modification times, optionally on the link itself.
pub fn set_times(path: &Path, atime: FileTime, mtime: FileTime, no_follow: bool) -> Result<()> {
    let c = cstring(path)?;
    let times = [
        libc::timespec {
            tv_sec: atime.secs as libc::time_t,
            tv_nsec: atime.nanos as libc::c_long,
        },
        libc::timespec {
            tv_sec: mtime.secs as libc::time_t,
            tv_nsec: mtime.nanos as libc::c_long,
        },
    ];
    let flags = if no_follow {
        libc::AT_SYMLINK_NOFOLLOW
    } else {
        0
    };
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), flags) };
    if rc != 0 {
        return Err(BuildError::CopierError(format!(
            "setting timestamps on {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Create a device node.
pub fn mknod(path: &Path, block: bool, major: u32, minor: u32) -> Result<()> {
    use nix::sys::stat::{makedev, Mode, SFlag};
    let kind = if block { SFlag::S_IFBLK } else { SFlag::S_IFCHR };
    nix::sys::stat::mknod(
        path,
        kind,
        Mode::from_bits_truncate(0o600),
        makedev(major as u64, minor as u64),
    )
    .map_err(|e| BuildError::CopierError(format!("mknod {}: {}", path.display(), e)))
}

/// Create a named pipe.
pub fn mkfifo(path: &Path) -> Result<()> {
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600))
        .map_err(|e| BuildError::CopierError(format!("mkfifo {}: {}", path.display(), e)))
}

/// Owner of an item, from already-read metadata.
pub fn owner(meta: &std::fs::Metadata) -> (u32, u32) {
    (meta.uid(), meta.gid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_times_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "x").unwrap();
        let when = FileTime::from_secs(1_000_000);
        set_times(&path, when, when, false).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(FileTime::mtime_of(&meta), when);
    }

    #[test]
    fn test_chmod() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "x").unwrap();
        chmod(&path, 0o640).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_lchown_to_self() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "x").unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        let (uid, gid) = owner(&meta);
        lchown(&path, uid, gid).unwrap();
    }

    #[test]
    fn test_chrono_round_trip() {
        let t = FileTime {
            secs: 1_700_000_000,
            nanos: 5,
        };
        assert_eq!(FileTime::from_chrono(&t.to_chrono()), t);
    }
}
