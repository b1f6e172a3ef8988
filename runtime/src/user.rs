//! User and group lookups against a container's `/etc/passwd` and
//! `/etc/group`.

use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::IdPair;

use crate::copier::resolve_in_root;

/// The identity a process runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecUser {
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub additional_gids: Vec<u32>,
}

#[derive(Debug, Clone)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: String,
}

#[derive(Debug, Clone)]
struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

fn read_db(rootfs: &Path, file: &str) -> Result<Option<String>> {
    let path: PathBuf = resolve_in_root(rootfs, Path::new(file))?;
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BuildError::RuntimeError(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn passwd_entries(rootfs: &Path) -> Result<Vec<PasswdEntry>> {
    let content = read_db(rootfs, "/etc/passwd")?.unwrap_or_default();
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields[5].to_string(),
            })
        })
        .collect())
}

fn group_entries(rootfs: &Path) -> Result<Vec<GroupEntry>> {
    let content = read_db(rootfs, "/etc/group")?.unwrap_or_default();
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 {
                return None;
            }
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members: fields
                    .get(3)
                    .map(|m| {
                        m.split(',')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        })
        .collect())
}

fn lookup_group(groups: &[GroupEntry], spec: &str) -> Result<u32> {
    if let Ok(gid) = spec.parse::<u32>() {
        return Ok(gid);
    }
    groups
        .iter()
        .find(|g| g.name == spec)
        .map(|g| g.gid)
        .ok_or_else(|| BuildError::NotFound(format!("group {:?} not found in /etc/group", spec)))
}

/// Resolve `user[:group]` for a process inside `rootfs`.
///
/// Names must exist in the container's databases; numeric IDs need not.
/// Without an explicit group the user's primary group is used, plus any
/// supplementary groups that list the user.
pub fn lookup_user(rootfs: &Path, spec: &str) -> Result<ExecUser> {
    let spec = if spec.is_empty() { "0" } else { spec };
    let (user, group) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };
    let passwd = passwd_entries(rootfs)?;
    let entry = match user.parse::<u32>() {
        Ok(uid) => passwd.iter().find(|p| p.uid == uid).cloned().or(Some(PasswdEntry {
            name: String::new(),
            uid,
            gid: uid,
            home: "/".to_string(),
        })),
        Err(_) => passwd.iter().find(|p| p.name == user).cloned(),
    }
    .ok_or_else(|| BuildError::NotFound(format!("user {:?} not found in /etc/passwd", user)))?;

    let groups = group_entries(rootfs)?;
    let (gid, additional_gids) = match group {
        Some(g) if !g.is_empty() => (lookup_group(&groups, g)?, Vec::new()),
        _ => {
            let extra = if entry.name.is_empty() {
                Vec::new()
            } else {
                groups
                    .iter()
                    .filter(|g| g.members.contains(&entry.name) && g.gid != entry.gid)
                    .map(|g| g.gid)
                    .collect()
            };
            (entry.gid, extra)
        }
    };
    let home = if entry.home.is_empty() {
        "/".to_string()
    } else {
        entry.home
    };
    Ok(ExecUser {
        uid: entry.uid,
        gid,
        home,
        additional_gids,
    })
}

/// Resolve a `--chown` value. Numeric `uid[:gid]` is taken as-is (the
/// group defaults to the user ID); names are looked up in `rootfs`.
pub fn user_for_copy(rootfs: &Path, chown: &str) -> Result<IdPair> {
    let (user, group) = match chown.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (chown, None),
    };
    if user.is_empty() {
        return Err(BuildError::InvalidArgument(format!(
            "invalid --chown value {:?}: missing user",
            chown
        )));
    }
    let (uid, primary_gid) = match user.parse::<u32>() {
        Ok(uid) => (uid, uid),
        Err(_) => {
            let passwd = passwd_entries(rootfs)?;
            let entry = passwd.iter().find(|p| p.name == user).ok_or_else(|| {
                BuildError::NotFound(format!("user {:?} not found in /etc/passwd", user))
            })?;
            (entry.uid, entry.gid)
        }
    };
    let gid = match group {
        Some(g) if !g.is_empty() => lookup_group(&group_entries(rootfs)?, g)?,
        _ => primary_gid,
    };
    Ok(IdPair::new(uid, gid))
}

/// Whether this process runs in a user namespace that does not map the
/// full ID range, where device nodes cannot be created.
pub fn running_in_user_namespace() -> bool {
    match std::fs::read_to_string("/proc/self/uid_map") {
        Ok(map) => {
            let fields: Vec<&str> = map.split_whitespace().collect();
            fields != ["0", "0", "4294967295"]
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rootfs() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1000::/home/app:/bin/sh\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("etc/group"),
            "root:x:0:\napp:x:1000:\nwheel:x:10:app\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_lookup_by_name() {
        let dir = rootfs();
        let user = lookup_user(dir.path(), "app").unwrap();
        assert_eq!(user.uid, 1000);
        assert_eq!(user.gid, 1000);
        assert_eq!(user.home, "/home/app");
        assert_eq!(user.additional_gids, vec![10]);
    }

    #[test]
    fn test_lookup_numeric_unknown_and_group() {
        let dir = rootfs();
        let user = lookup_user(dir.path(), "4242:wheel").unwrap();
        assert_eq!((user.uid, user.gid), (4242, 10));
        assert_eq!(user.home, "/");
        let root = lookup_user(dir.path(), "").unwrap();
        assert_eq!((root.uid, root.gid, root.home.as_str()), (0, 0, "/root"));
    }

    #[test]
    fn test_lookup_missing_name() {
        let dir = rootfs();
        assert!(lookup_user(dir.path(), "nobody").unwrap_err().is_not_found());
        assert!(lookup_user(dir.path(), "app:nogroup").unwrap_err().is_not_found());
    }

    #[test]
    fn test_user_for_copy() {
        let dir = rootfs();
        assert_eq!(user_for_copy(dir.path(), "5").unwrap(), IdPair::new(5, 5));
        assert_eq!(user_for_copy(dir.path(), "5:7").unwrap(), IdPair::new(5, 7));
        assert_eq!(user_for_copy(dir.path(), "app").unwrap(), IdPair::new(1000, 1000));
        assert_eq!(user_for_copy(dir.path(), "app:wheel").unwrap(), IdPair::new(1000, 10));
        assert!(user_for_copy(dir.path(), ":5").is_err());
    }

    #[test]
    fn test_missing_databases() {
        let dir = TempDir::new().unwrap();
        assert_eq!(user_for_copy(dir.path(), "0").unwrap(), IdPair::new(0, 0));
        assert!(user_for_copy(dir.path(), "app").is_err());
    }
}
