//! Root-confined file tree primitives.
//!
//! Every operation takes a `root` that plays the part of `/` and a
//! `directory` against which relative names are resolved. A `directory`
//! that is an absolute path under `root` is a host path; any other
//! `directory` is a location inside the root (`/` being the root itself).
//! Symbolic links are resolved as if the process were chrooted into
//! `root`, so no operation can reach outside of it.
//!
//! - [`stat`] expands globs and describes what they match
//! - [`get`] writes matched items to a tar stream
//! - [`put`] extracts a tar stream under a directory
//! - [`mkdir`], [`remove`], [`eval`] are single-path helpers
//! - [`ensure`] and [`conditional_remove`] create mount targets before a
//!   RUN step and remove them afterwards if they were left untouched

mod fsutil;
mod get;
mod pattern;
mod put;
pub mod resolve;

use std::collections::BTreeMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::idmap::{IdMappings, IdPair};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use fsutil::FileTime;
pub use get::{get, GetOptions};
pub use pattern::ExcludeMatcher;
pub use put::{put, PutOptions};
pub(crate) use put::Extractor;
pub use resolve::{
    clean_path, host_path, join_under, rel_subdirectory, resolve_in_root, resolve_path,
};

/// What one glob match looks like on disk (symlinks dereferenced for the
/// type and size fields).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatForItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
    /// -1 when unknown
    pub uid: i64,
    pub gid: i64,
    pub is_symlink: bool,
    pub is_dir: bool,
    pub is_regular: bool,
    pub is_archive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immediate_target: Option<String>,
}

/// Matches for one glob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsForGlob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub glob: String,
    pub globbed: Vec<String>,
    pub results: BTreeMap<String, StatForItem>,
}

#[derive(Debug, Clone, Default)]
pub struct StatOptions {
    pub id_mappings: IdMappings,
    pub check_for_archives: bool,
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MkdirOptions {
    pub id_mappings: IdMappings,
    pub mod_time_new: Option<DateTime<Utc>>,
    pub chown_new: Option<IdPair>,
    pub chmod_new: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    pub all: bool,
}

/// Type of item [`ensure`] creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnsureKind {
    File,
    Dir,
}

/// A path that must exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsurePath {
    pub path: String,
    pub kind: EnsureKind,
    /// mtime set on newly created items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    /// Defaults to 0o000 for files and 0o700 for directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chmod: Option<u32>,
    /// Defaults to 0:0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chown: Option<IdPair>,
}

#[derive(Debug, Clone, Default)]
pub struct EnsureOptions {
    pub id_mappings: IdMappings,
    pub paths: Vec<EnsurePath>,
}

/// A path to remove only if it still looks the way it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRemovePath {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<IdPair>,
}

/// Preexisting parents of items created by [`ensure`].
pub type EnsureParentPath = ConditionalRemovePath;

#[derive(Debug, Clone, Default)]
pub struct ConditionalRemoveOptions {
    pub id_mappings: IdMappings,
    pub paths: Vec<ConditionalRemovePath>,
}

/// Normalized request paths.
struct Scope {
    root: PathBuf,
    directory: PathBuf,
}

impl Scope {
    fn new(root: &Path, directory: &Path) -> Result<Self> {
        let root = clean_path(root);
        let directory = if directory.as_os_str().is_empty() {
            root.clone()
        } else {
            host_path(&root, directory)
        };
        Ok(Self { root, directory })
    }

    /// Host-side glob patterns. Absolute globs under root are used as they
    /// are; other absolute globs are taken relative to root.
    fn globs(&self, globs: &[String]) -> Result<Vec<(String, String)>> {
        globs
            .iter()
            .map(|g| {
                let pattern = if Path::new(g).is_absolute() {
                    let cleaned = clean_path(Path::new(g));
                    if cleaned.starts_with(&self.root) {
                        cleaned.display().to_string()
                    } else {
                        let base = glob::Pattern::escape(&self.root.display().to_string());
                        if cleaned == Path::new("/") {
                            base
                        } else {
                            format!("{}{}", base.trim_end_matches('/'), cleaned.display())
                        }
                    }
                } else {
                    let rel = clean_path(&Path::new("/").join(g));
                    let rel = rel.display().to_string();
                    let base = glob::Pattern::escape(&self.directory.display().to_string());
                    if rel == "/" {
                        base
                    } else {
                        format!("{}{}", base.trim_end_matches('/'), rel)
                    }
                };
                Ok((g.clone(), pattern))
            })
            .collect()
    }
}

/// Expand a host-side glob pattern; a pattern without metacharacters
/// matches itself when it exists (even as a dangling symlink).
fn extended_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let mut matches = Vec::new();
    if !pattern.contains(['*', '?', '[']) {
        let path = PathBuf::from(pattern);
        if std::fs::symlink_metadata(&path).is_ok() {
            matches.push(path);
        }
        return Ok(matches);
    }
    let paths = glob::glob_with(pattern, options).map_err(|e| {
        BuildError::InvalidArgument(format!("invalid glob pattern {:?}: {}", pattern, e))
    })?;
    for entry in paths.flatten() {
        matches.push(entry);
    }
    matches.sort();
    Ok(matches)
}

/// `path` under `base_rel`, relative to root, with `..` scoped at `/`.
fn scoped_rel(base_rel: &Path, path: &str) -> PathBuf {
    let scoped = clean_path(&Path::new("/").join(base_rel).join(path.trim_start_matches('/')));
    match scoped.strip_prefix("/") {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn has_glob_chars(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Describe what each glob matches.
pub fn stat(
    root: &Path,
    directory: &Path,
    options: &StatOptions,
    globs: &[String],
) -> Result<Vec<StatsForGlob>> {
    if globs.is_empty() {
        return Err(BuildError::CopierError(
            "stat: expected at least one glob pattern, got none".to_string(),
        ));
    }
    let scope = Scope::new(root, directory)?;
    let matcher = ExcludeMatcher::new(&options.excludes)?;
    let mut stats = Vec::new();
    for (original, pattern) in scope.globs(globs)? {
        let mut s = StatsForGlob {
            glob: original.clone(),
            ..Default::default()
        };
        let matched = match extended_glob(&pattern) {
            Ok(m) => m,
            Err(e) => {
                s.error = Some(format!("stat: {} while matching glob pattern {:?}", e, original));
                Vec::new()
            }
        };
        if matched.is_empty() && has_glob_chars(&original) {
            continue;
        }
        for globbed in matched {
            let rel = rel_subdirectory(&scope.root, &globbed)?;
            if matcher.matches(&rel) {
                continue;
            }
            let name = if Path::new(&original).is_absolute() {
                globbed.display().to_string()
            } else {
                rel_subdirectory(&scope.directory, &globbed)?
                    .display()
                    .to_string()
            };
            let result = stat_one(&scope.root, &globbed, &name, options, &matcher)?;
            s.globbed.push(name.clone());
            s.results.insert(name, result);
        }
        if s.globbed.is_empty() {
            s.results.clear();
            s.error = Some(format!(
                "stat: {:?}: no such file or directory",
                original
            ));
        }
        stats.push(s);
    }
    if stats.is_empty() {
        stats.push(StatsForGlob {
            error: Some(format!("stat: {:?}: no such file or directory", globs)),
            ..Default::default()
        });
    }
    Ok(stats)
}

fn stat_one(
    root: &Path,
    globbed: &Path,
    name: &str,
    options: &StatOptions,
    matcher: &ExcludeMatcher,
) -> Result<StatForItem> {
    let mut result = StatForItem {
        name: name.to_string(),
        uid: -1,
        gid: -1,
        ..Default::default()
    };
    let linfo = match std::fs::symlink_metadata(globbed) {
        Ok(m) => m,
        Err(e) => {
            result.error = Some(e.to_string());
            return Ok(result);
        }
    };
    result.size = linfo.len();
    result.mode = linfo.mode();
    let host = IdPair::new(linfo.uid(), linfo.gid());
    let owner = if options.id_mappings.is_identity() {
        host
    } else {
        options.id_mappings.to_container(host).map_err(|e| {
            BuildError::CopierError(format!(
                "stat: mapping host filesystem owners {:?} to container filesystem owners: {}",
                host, e
            ))
        })?
    };
    result.uid = owner.uid as i64;
    result.gid = owner.gid as i64;
    result.mod_time = FileTime::mtime_of(&linfo).to_chrono();
    result.is_dir = linfo.is_dir();
    result.is_regular = linfo.file_type().is_file();
    result.is_symlink = linfo.file_type().is_symlink();
    let mut check_for_archive = options.check_for_archives;
    if result.is_symlink {
        match std::fs::read_link(globbed) {
            Ok(target) => result.immediate_target = Some(target.display().to_string()),
            Err(e) => {
                result.error = Some(e.to_string());
                return Ok(result);
            }
        }
        let resolved = resolve_path(root, globbed, true, Some(matcher))?;
        let info = match std::fs::symlink_metadata(&resolved) {
            Ok(i) => i,
            Err(e) => {
                result.error = Some(e.to_string());
                return Ok(result);
            }
        };
        if info.file_type().is_file() && options.check_for_archives {
            result.is_archive = crate::archive::is_archive(&resolved);
            check_for_archive = false;
        }
        result.is_dir = info.is_dir();
        result.is_regular = info.file_type().is_file();
    }
    if result.is_regular && check_for_archive {
        result.is_archive = crate::archive::is_archive(globbed);
    }
    Ok(result)
}

/// Resolve `directory` (with symlinks) under `root`, returning the host path.
pub fn eval(root: &Path, directory: &Path) -> Result<PathBuf> {
    let scope = Scope::new(root, directory)?;
    resolve_path(&scope.root, &scope.directory, true, None)
        .map_err(|e| BuildError::CopierError(format!("eval: error resolving {:?}: {}", directory, e)))
}

/// Create `directory` and any missing parents.
pub fn mkdir(root: &Path, directory: &Path, options: &MkdirOptions) -> Result<()> {
    let scope = Scope::new(root, directory)?;
    let owner = options.id_mappings.to_host(options.chown_new.unwrap_or_default())?;
    let mode = options.chmod_new.unwrap_or(0o755);
    let target = resolve_path(&scope.root, &scope.directory, true, None)?;
    let rel = rel_subdirectory(&scope.root, &target)?;
    let mut created = Vec::new();
    let mut current = scope.root.clone();
    for component in rel.components() {
        current.push(component);
        match std::fs::create_dir(&current) {
            Ok(()) => {
                fsutil::lchown(&current, owner.uid, owner.gid)?;
                fsutil::chmod(&current, mode)?;
                created.push(current.clone());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(BuildError::CopierError(format!(
                    "mkdir: error checking directory {}: {}",
                    current.display(),
                    e
                )))
            }
        }
    }
    if let Some(when) = &options.mod_time_new {
        let t = FileTime::from_chrono(when);
        for dir in &created {
            fsutil::set_times(dir, t, t, false)?;
        }
    }
    Ok(())
}

/// Remove one item (or a whole tree with `all`). The final component is
/// not dereferenced.
pub fn remove(root: &Path, item: &Path, options: &RemoveOptions) -> Result<()> {
    let scope = Scope::new(root, item)?;
    let target = resolve_path(&scope.root, &scope.directory, false, None)?;
    let meta = std::fs::symlink_metadata(&target);
    let result = match meta {
        Ok(m) if m.is_dir() && options.all => std::fs::remove_dir_all(&target),
        Ok(m) if m.is_dir() => std::fs::remove_dir(&target),
        Ok(_) => std::fs::remove_file(&target),
        Err(e) => Err(e),
    };
    result.map_err(|e| BuildError::CopierError(format!("remove {:?}: {}", item, e)))
}

/// Create every listed path that does not exist yet.
///
/// Returns the created paths (relative to `root`) and snapshots of the
/// preexisting parents whose timestamps were preserved.
pub fn ensure(
    root: &Path,
    directory: &Path,
    options: &EnsureOptions,
) -> Result<(Vec<String>, Vec<EnsureParentPath>)> {
    let scope = Scope::new(root, directory)?;
    let base = resolve_path(&scope.root, &scope.directory, true, None)?;
    let base_rel = rel_subdirectory(&scope.root, &base)?;

    let mut paths = options.paths.clone();
    paths.sort_by(|a, b| a.path.cmp(&b.path));

    let mut created: Vec<String> = Vec::new();
    let mut noted: BTreeMap<String, EnsureParentPath> = BTreeMap::new();
    for item in &paths {
        let owner = options
            .id_mappings
            .to_host(item.chown.unwrap_or_default())
            .map_err(|e| BuildError::CopierError(format!("ensure: {}", e)))?;
        let mode = item.chmod.unwrap_or(match item.kind {
            EnsureKind::File => 0o000,
            EnsureKind::Dir => 0o700,
        });
        let full = scoped_rel(&base_rel, &item.path);
        let components: Vec<String> = full
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(n) => Some(n.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        let mut subdir = PathBuf::new();
        for (i, component) in components.iter().enumerate() {
            let parent_rel = if subdir.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                subdir.clone()
            };
            let parent_host = scope.root.join(&subdir);
            let leaf = subdir.join(component);
            let leaf_host = scope.root.join(&leaf);
            let parent_info = std::fs::metadata(&parent_host).map_err(|e| {
                BuildError::CopierError(format!(
                    "ensure: checking datestamps on {:?} ({}: {:?}): {}",
                    parent_rel, i, components, e
                ))
            })?;
            let parent_mtime = FileTime::mtime_of(&parent_info);
            if parent_rel != Path::new(".") {
                let key = parent_rel.display().to_string();
                noted.insert(
                    key.clone(),
                    EnsureParentPath {
                        path: key,
                        mod_time: Some(parent_mtime.to_chrono()),
                        mode: Some(parent_info.permissions().mode() & 0o7777),
                        owner: Some(IdPair::new(parent_info.uid(), parent_info.gid())),
                    },
                );
            }
            let is_dir = i < components.len() - 1 || item.kind == EnsureKind::Dir;
            let leaf_mode = if i < components.len() - 1 { 0o755 } else { mode };
            let attempt = if is_dir {
                std::fs::create_dir(&leaf_host)
            } else {
                std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&leaf_host)
                    .map(|_| ())
            };
            match attempt {
                Ok(()) => {
                    created.push(leaf.display().to_string());
                    fsutil::lchown(&leaf_host, owner.uid, owner.gid)?;
                    fsutil::chmod(&leaf_host, leaf_mode)?;
                    if let Some(when) = &item.mod_time {
                        let t = FileTime::from_chrono(when);
                        fsutil::set_times(&leaf_host, t, t, false)?;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(BuildError::CopierError(format!(
                        "ensure: error checking item {:?}: {}",
                        leaf, e
                    )))
                }
            }
            fsutil::set_times(&parent_host, parent_mtime, parent_mtime, false)?;
            if is_dir {
                subdir = leaf;
            }
        }
    }
    created.sort();
    let noted = noted
        .into_values()
        .filter(|n| !created.contains(&n.path))
        .collect();
    Ok((created, noted))
}

/// Remove each listed item that still matches its recorded mode, mtime
/// and owner. Directories are only removed when empty. Missing items
/// count as removed.
pub fn conditional_remove(
    root: &Path,
    directory: &Path,
    options: &ConditionalRemoveOptions,
) -> Result<Vec<String>> {
    let scope = Scope::new(root, directory)?;
    let base = resolve_path(&scope.root, &scope.directory, true, None)?;
    let base_rel = rel_subdirectory(&scope.root, &base)?;

    let mut paths = options.paths.clone();
    // deepest first, so emptied parents can go too
    paths.sort_by(|a, b| b.path.cmp(&a.path));

    let mut removed = Vec::new();
    for item in &paths {
        let owner = options
            .id_mappings
            .to_host(item.owner.unwrap_or_default())
            .map_err(|e| BuildError::CopierError(format!("conditional remove: {}", e)))?;
        let rel = scoped_rel(&base_rel, &item.path);
        if rel == Path::new(".") {
            continue;
        }
        let item_host = scope.root.join(&rel);
        let item_info = match std::fs::symlink_metadata(&item_host) {
            Ok(i) => i,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                removed.push(item.path.clone());
                continue;
            }
            Err(e) => {
                return Err(BuildError::CopierError(format!(
                    "conditional remove: checking on candidate {}: {}",
                    item_host.display(),
                    e
                )))
            }
        };
        let parent_host = item_host
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| scope.root.clone());
        let parent_info = std::fs::metadata(&parent_host)?;

        if let Some(mode) = item.mode {
            if item_info.permissions().mode() & 0o777 != mode & 0o777 {
                continue;
            }
        }
        if let Some(when) = &item.mod_time {
            if FileTime::from_chrono(when) != FileTime::mtime_of(&item_info) {
                continue;
            }
        }
        if item.owner.is_some() && (item_info.uid(), item_info.gid()) != (owner.uid, owner.gid) {
            continue;
        }
        let attempt = if item_info.is_dir() {
            std::fs::remove_dir(&item_host)
        } else {
            std::fs::remove_file(&item_host)
        };
        match attempt {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) || e.raw_os_error() == Some(libc::EEXIST) => {
                continue
            }
            Err(e) => {
                return Err(BuildError::CopierError(format!(
                    "conditional remove: removing {}: {}",
                    item_host.display(),
                    e
                )))
            }
        }
        removed.push(item.path.clone());
        let parent_mtime = FileTime::mtime_of(&parent_info);
        fsutil::set_times(&parent_host, parent_mtime, parent_mtime, false)?;
    }
    removed.sort();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("ctx/sub")).unwrap();
        std::fs::write(root.join("ctx/a.txt"), "a").unwrap();
        std::fs::write(root.join("ctx/b.txt"), "bb").unwrap();
        std::fs::write(root.join("ctx/sub/c.log"), "c").unwrap();
        std::os::unix::fs::symlink("/ctx/sub", root.join("ctx/link")).unwrap();
        dir
    }

    #[test]
    fn test_stat_glob_relative_names() {
        let dir = tree();
        let stats = stat(
            dir.path(),
            Path::new("ctx"),
            &StatOptions::default(),
            &["*.txt".to_string()],
        )
        .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].globbed, vec!["a.txt".to_string(), "b.txt".to_string()]);
        let b = &stats[0].results["b.txt"];
        assert_eq!(b.size, 2);
        assert!(b.is_regular);
        assert!(!b.is_dir);
    }

    #[test]
    fn test_stat_symlink_is_dereferenced() {
        let dir = tree();
        let stats = stat(
            dir.path(),
            Path::new("ctx"),
            &StatOptions::default(),
            &["link".to_string()],
        )
        .unwrap();
        let link = &stats[0].results["link"];
        assert!(link.is_symlink);
        assert!(link.is_dir);
        assert_eq!(link.immediate_target.as_deref(), Some("/ctx/sub"));
    }

    #[test]
    fn test_stat_no_match_literal() {
        let dir = tree();
        let stats = stat(
            dir.path(),
            Path::new("ctx"),
            &StatOptions::default(),
            &["missing".to_string()],
        )
        .unwrap();
        assert!(stats[0].error.as_ref().unwrap().contains("no such file"));
        assert!(stats[0].globbed.is_empty());
    }

    #[test]
    fn test_stat_no_match_wildcard_reports_overall_error() {
        let dir = tree();
        let stats = stat(
            dir.path(),
            Path::new("ctx"),
            &StatOptions::default(),
            &["*.nope".to_string()],
        )
        .unwrap();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].error.is_some());
    }

    #[test]
    fn test_stat_excludes() {
        let dir = tree();
        let options = StatOptions {
            excludes: vec!["ctx/a.txt".to_string()],
            ..Default::default()
        };
        let stats = stat(dir.path(), Path::new("ctx"), &options, &["*.txt".to_string()]).unwrap();
        assert_eq!(stats[0].globbed, vec!["b.txt".to_string()]);
    }

    #[test]
    fn test_eval_follows_links() {
        let dir = tree();
        let evaluated = eval(dir.path(), Path::new("ctx/link")).unwrap();
        assert_eq!(evaluated, dir.path().join("ctx/sub"));
    }

    #[test]
    fn test_mkdir_creates_parents_with_mode() {
        let dir = TempDir::new().unwrap();
        let options = MkdirOptions {
            chmod_new: Some(0o750),
            mod_time_new: Some(FileTime::from_secs(0).to_chrono()),
            ..Default::default()
        };
        mkdir(dir.path(), Path::new("/x/y/z"), &options).unwrap();
        let meta = std::fs::metadata(dir.path().join("x/y/z")).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o750);
        assert_eq!(meta.mtime(), 0);
    }

    #[test]
    fn test_remove() {
        let dir = tree();
        remove(dir.path(), Path::new("ctx/a.txt"), &RemoveOptions::default()).unwrap();
        assert!(!dir.path().join("ctx/a.txt").exists());
        assert!(remove(dir.path(), Path::new("ctx/sub"), &RemoveOptions::default()).is_err());
        remove(dir.path(), Path::new("ctx/sub"), &RemoveOptions { all: true }).unwrap();
        assert!(!dir.path().join("ctx/sub").exists());
    }

    #[test]
    fn test_ensure_then_conditional_remove() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("etc")).unwrap();
        let epoch = FileTime::from_secs(0).to_chrono();
        let options = EnsureOptions {
            paths: vec![
                EnsurePath {
                    path: "/etc/secrets/token".to_string(),
                    kind: EnsureKind::File,
                    mod_time: Some(epoch),
                    chmod: Some(0o644),
                    chown: None,
                },
                EnsurePath {
                    path: "/mnt/cache".to_string(),
                    kind: EnsureKind::Dir,
                    mod_time: Some(epoch),
                    chmod: Some(0o755),
                    chown: None,
                },
            ],
            ..Default::default()
        };
        let (created, noted) = ensure(root, Path::new("/"), &options).unwrap();
        assert_eq!(
            created,
            vec![
                "etc/secrets".to_string(),
                "etc/secrets/token".to_string(),
                "mnt".to_string(),
                "mnt/cache".to_string()
            ]
        );
        assert_eq!(noted.len(), 1);
        assert_eq!(noted[0].path, "etc");
        assert!(root.join("etc/secrets/token").is_file());

        let (uid, gid) = {
            let m = std::fs::metadata(root.join("mnt/cache")).unwrap();
            (m.uid(), m.gid())
        };
        let removals: Vec<ConditionalRemovePath> = created
            .iter()
            .map(|p| ConditionalRemovePath {
                path: p.clone(),
                mod_time: Some(epoch),
                mode: None,
                owner: Some(IdPair::new(uid, gid)),
            })
            .collect();
        let removed = conditional_remove(
            root,
            Path::new("/"),
            &ConditionalRemoveOptions {
                paths: removals,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(removed.len(), 4);
        assert!(!root.join("mnt").exists());
        assert!(root.join("etc").is_dir());
    }

    #[test]
    fn test_conditional_remove_keeps_modified_items() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("kept"), "changed").unwrap();
        let removed = conditional_remove(
            root,
            Path::new("/"),
            &ConditionalRemoveOptions {
                paths: vec![ConditionalRemovePath {
                    path: "kept".to_string(),
                    mod_time: Some(FileTime::from_secs(0).to_chrono()),
                    mode: None,
                    owner: None,
                }],
                ..Default::default()
            },
        )
        .unwrap();
        assert!(removed.is_empty());
        assert!(root.join("kept").exists());
    }
}
