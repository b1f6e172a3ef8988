//! Path arithmetic confined to a root directory.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};

use super::pattern::ExcludeMatcher;

/// Symlink hops allowed while resolving one path.
const MAX_LINKS_FOLLOWED: usize = 64;

/// Lexically clean a path: collapse `.`, `..` and repeated separators.
/// `..` never climbs above `/` for absolute paths.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out: Vec<OsString> = Vec::new();
    let absolute = path.has_root();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                if out.last().map(|c| c != "..").unwrap_or(false) {
                    out.pop();
                } else if !absolute {
                    out.push(OsString::from(".."));
                }
            }
            Component::Normal(name) => out.push(name.to_os_string()),
        }
    }
    let mut cleaned = if absolute {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    for c in out {
        cleaned.push(c);
    }
    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

/// `path` relative to `root`, or a path-escape error. Equal paths give `.`.
pub fn rel_subdirectory(root: &Path, path: &Path) -> Result<PathBuf> {
    let root = clean_path(root);
    let path = clean_path(path);
    match path.strip_prefix(&root) {
        Ok(rel) if rel.as_os_str().is_empty() => Ok(PathBuf::from(".")),
        Ok(rel) => Ok(rel.to_path_buf()),
        Err(_) => Err(BuildError::PathEscape {
            root: root.display().to_string(),
            path: path.display().to_string(),
        }),
    }
}

/// Whether a cleaned relative path climbs out of its base.
pub fn escapes(rel: &Path) -> bool {
    matches!(clean_path(rel).components().next(), Some(Component::ParentDir))
}

/// Join a container path onto `root` lexically, scoping `..` at `/`.
pub fn join_under(root: &Path, container_path: &Path) -> PathBuf {
    let scoped = clean_path(&Path::new("/").join(container_path));
    match scoped.strip_prefix("/") {
        Ok(rel) if !rel.as_os_str().is_empty() => root.join(rel),
        _ => root.to_path_buf(),
    }
}

/// Host path for a request path. An absolute path that already lies under
/// `root` is taken as it is; any other path, absolute or relative, names a
/// location inside the root and is joined under it.
pub fn host_path(root: &Path, path: &Path) -> PathBuf {
    let root = clean_path(root);
    let cleaned = clean_path(path);
    if cleaned.is_absolute() && cleaned.starts_with(&root) {
        cleaned
    } else {
        join_under(&root, path)
    }
}

/// Resolve symbolic links in `path` (a host path under `root`), treating
/// `root` as `/`. Absolute link targets restart at `root`; `..` never
/// leaves it. Resolution stops following links once an excluded
/// component is reached.
pub fn resolve_path(
    root: &Path,
    path: &Path,
    evaluate_final_component: bool,
    matcher: Option<&ExcludeMatcher>,
) -> Result<PathBuf> {
    let rel = rel_subdirectory(root, path)?;
    let mut working = root.to_path_buf();
    let mut followed = 0usize;
    let mut components: Vec<OsString> = split(&rel);
    let mut excluded = false;

    while !components.is_empty() {
        let candidate = working.join(&components[0]);
        if let Some(m) = matcher {
            if let Ok(candidate_rel) = rel_subdirectory(root, &candidate) {
                excluded = excluded || m.matches(&candidate_rel);
            }
        }
        if !excluded && (components.len() != 1 || evaluate_final_component) {
            if let Ok(target) = std::fs::read_link(&candidate) {
                followed += 1;
                if followed > MAX_LINKS_FOLLOWED {
                    return Err(BuildError::CopierError(format!(
                        "too many levels of symbolic links resolving {}",
                        path.display()
                    )));
                }
                let rest: Vec<OsString> = components.drain(1..).collect();
                let mut next = if target.is_absolute() {
                    split(&target)
                } else {
                    let working_rel = rel_subdirectory(root, &working)?;
                    split(&clean_path(&Path::new("/").join(working_rel).join(&target)))
                };
                next.extend(rest);
                components = next;
                working = root.to_path_buf();
                continue;
            }
        }
        if components[0] == ".." {
            if working != root {
                working.pop();
            }
        } else if components[0] != "." {
            working = candidate;
        }
        components.remove(0);
    }
    Ok(working)
}

/// Resolve a container path (absolute or relative to `/`) under `root`.
pub fn resolve_in_root(root: &Path, container_path: &Path) -> Result<PathBuf> {
    resolve_path(root, &join_under(root, container_path), true, None)
}

fn split(path: &Path) -> Vec<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(n) => Some(n.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("/a/./b/../c//d")), PathBuf::from("/a/c/d"));
        assert_eq!(clean_path(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(clean_path(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(clean_path(Path::new("")), PathBuf::from("."));
    }

    #[test]
    fn test_rel_subdirectory() {
        assert_eq!(
            rel_subdirectory(Path::new("/root"), Path::new("/root/a/b")).unwrap(),
            PathBuf::from("a/b")
        );
        assert_eq!(
            rel_subdirectory(Path::new("/root"), Path::new("/root")).unwrap(),
            PathBuf::from(".")
        );
        assert!(matches!(
            rel_subdirectory(Path::new("/root"), Path::new("/root/../etc")),
            Err(BuildError::PathEscape { .. })
        ));
    }

    #[test]
    fn test_escapes() {
        assert!(escapes(Path::new("../x")));
        assert!(escapes(Path::new("a/../../x")));
        assert!(!escapes(Path::new("a/../x")));
    }

    #[test]
    fn test_host_path_accepts_both_forms() {
        let root = Path::new("/var/lib/store/rootfs");
        assert_eq!(host_path(root, Path::new("/")), PathBuf::from("/var/lib/store/rootfs"));
        assert_eq!(
            host_path(root, Path::new("/usr/src")),
            PathBuf::from("/var/lib/store/rootfs/usr/src")
        );
        assert_eq!(
            host_path(root, Path::new("/var/lib/store/rootfs/etc")),
            PathBuf::from("/var/lib/store/rootfs/etc")
        );
        assert_eq!(
            host_path(root, Path::new("/../../etc")),
            PathBuf::from("/var/lib/store/rootfs/etc")
        );
        assert_eq!(host_path(root, Path::new("app")), PathBuf::from("/var/lib/store/rootfs/app"));
    }

    #[test]
    fn test_join_under_scopes_parent_refs() {
        let root = Path::new("/r");
        assert_eq!(join_under(root, Path::new("/../../etc")), PathBuf::from("/r/etc"));
        assert_eq!(join_under(root, Path::new("usr/bin")), PathBuf::from("/r/usr/bin"));
        assert_eq!(join_under(root, Path::new("/")), PathBuf::from("/r"));
    }

    #[test]
    fn test_resolve_absolute_symlink_stays_in_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("real/dir")).unwrap();
        symlink("/real", root.join("link")).unwrap();
        let resolved = resolve_in_root(root, Path::new("/link/dir")).unwrap();
        assert_eq!(resolved, root.join("real/dir"));
    }

    #[test]
    fn test_resolve_relative_symlink_cannot_escape() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a")).unwrap();
        symlink("../../../../etc", root.join("a/up")).unwrap();
        let resolved = resolve_in_root(root, Path::new("/a/up/passwd")).unwrap();
        assert!(resolved.starts_with(root));
        assert_eq!(resolved, root.join("etc/passwd"));
    }

    #[test]
    fn test_resolve_final_component_optional() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("target"), "x").unwrap();
        symlink("target", root.join("link")).unwrap();
        let kept = resolve_path(root, &root.join("link"), false, None).unwrap();
        assert_eq!(kept, root.join("link"));
        let followed = resolve_path(root, &root.join("link"), true, None).unwrap();
        assert_eq!(followed, root.join("target"));
    }

    #[test]
    fn test_symlink_loop() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        symlink("b", root.join("a")).unwrap();
        symlink("a", root.join("b")).unwrap();
        assert!(resolve_in_root(root, Path::new("/a")).is_err());
    }
}
