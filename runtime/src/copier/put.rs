//! Extracting a tar stream under a root.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::idmap::{IdMappings, IdPair};

use super::fsutil::{self, FileTime};
use super::get::handle_rename;
use super::resolve::{clean_path, rel_subdirectory, resolve_path};
use super::Scope;
use crate::tarfilter::{header_gid, header_mode, header_mtime, header_uid};

/// Options for [`put`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Map container owners in the archive to host owners
    pub id_mappings: IdMappings,
    /// Owner of parent directories that have to be created (default 0:0)
    pub default_dir_owner: Option<IdPair>,
    /// Mode of parent directories that have to be created (default 0755)
    pub default_dir_mode: Option<u32>,
    pub chown_dirs: Option<IdPair>,
    pub chmod_dirs: Option<u32>,
    pub chown_files: Option<IdPair>,
    pub chmod_files: Option<u32>,
    pub strip_setuid_bit: bool,
    pub strip_setgid_bit: bool,
    pub strip_sticky_bit: bool,
    /// Fail instead of replacing a directory with a non-directory
    pub no_overwrite_dir_non_dir: bool,
    /// Fail instead of replacing a non-directory with a directory
    pub no_overwrite_non_dir_dir: bool,
    /// Item name (or leading path) replacements
    pub rename: BTreeMap<String, String>,
    /// Skip device nodes instead of creating them
    pub ignore_devices: bool,
}

struct DeferredDir {
    path: PathBuf,
    mode: u32,
    mtime: FileTime,
}

/// Extract the archive read from `reader` under `directory`.
pub fn put<R: Read>(root: &Path, directory: &Path, options: &PutOptions, reader: R) -> Result<()> {
    let mut extractor = Extractor::new(root, directory, options)?;
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| BuildError::CopierError(format!("copier: put: reading archive: {}", e)))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| BuildError::CopierError(format!("copier: put: reading archive: {}", e)))?;
        extractor.extract(&mut entry)?;
    }
    extractor.finish()?;
    // consume end-of-archive padding so a pipe writer never sees EPIPE
    std::io::copy(&mut archive.into_inner(), &mut std::io::sink())?;
    Ok(())
}

/// Entry-at-a-time extraction, for callers that interpret some entries
/// themselves.
pub(crate) struct Extractor<'a> {
    root: PathBuf,
    target: PathBuf,
    options: &'a PutOptions,
    dir_owner: IdPair,
    dir_mode: u32,
    deferred: Vec<DeferredDir>,
}

impl<'a> Extractor<'a> {
    pub(crate) fn new(root: &Path, directory: &Path, options: &'a PutOptions) -> Result<Self> {
        let scope = Scope::new(root, directory)?;
        let dir_owner = options
            .id_mappings
            .to_host(options.default_dir_owner.unwrap_or_default())?;
        let dir_mode = options.default_dir_mode.unwrap_or(0o755);
        let target = resolve_path(&scope.root, &scope.directory, true, None)?;
        ensure_dirs(&scope.root, &target, dir_owner, dir_mode)?;
        Ok(Self {
            root: scope.root,
            target,
            options,
            dir_owner,
            dir_mode,
            deferred: Vec::new(),
        })
    }

    /// Host location for an archive name: parents are resolved like the
    /// container would resolve them, the final component is not.
    pub(crate) fn host_path(&self, name: &str) -> Result<Option<PathBuf>> {
        let rel = clean_path(&Path::new("/").join(name));
        let rel = rel.strip_prefix("/").unwrap_or(&rel).to_path_buf();
        if rel.as_os_str().is_empty() {
            return Ok(None);
        }
        let joined = self.target.join(&rel);
        let parent = joined.parent().unwrap_or(&self.target);
        let parent = resolve_path(&self.root, parent, true, None)?;
        Ok(joined.file_name().map(|base| parent.join(base)))
    }

    pub(crate) fn extract<R: Read>(&mut self, entry: &mut tar::Entry<R>) -> Result<()> {
        let options = self.options;
        let header = entry.header().clone();
        let kind = header.entry_type();
        if kind.is_pax_global_extensions() || kind.is_pax_local_extensions() || kind.is_gnu_longname() {
            return Ok(());
        }
        let raw_name = entry.path()?.display().to_string();
        let name = handle_rename(&options.rename, raw_name.trim_end_matches('/'));
        let path = match self.host_path(&name)? {
            Some(p) => p,
            None => {
                // the directory itself
                if kind.is_dir() {
                    self.deferred.push(DeferredDir {
                        path: self.target.clone(),
                        mode: entry_mode(&header, options, true)?,
                        mtime: FileTime::from_secs(header_mtime(&header)? as i64),
                    });
                }
                return Ok(());
            }
        };
        if let Some(parent) = path.parent() {
            ensure_dirs(&self.root, parent, self.dir_owner, self.dir_mode)?;
        }

        let is_dir = kind.is_dir();
        let mut owner = IdPair::new(header_uid(&header)?, header_gid(&header)?);
        let chown = if is_dir { options.chown_dirs } else { options.chown_files };
        if let Some(c) = chown {
            owner = c;
        }
        let owner = options.id_mappings.to_host(owner).map_err(|e| {
            BuildError::CopierError(format!("copier: put: mapping owner of {:?}: {}", name, e))
        })?;
        let mode = entry_mode(&header, options, is_dir)?;
        let mtime = FileTime::from_secs(header_mtime(&header)? as i64);

        match kind {
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
                make_room(&path, false, options)?;
                write_file(&path, entry)?;
            }
            tar::EntryType::Link => {
                let link = entry.link_name()?.ok_or_else(|| {
                    BuildError::CopierError(format!("copier: put: hard link {:?} has no target", name))
                })?;
                let link_target = clean_path(&Path::new("/").join(&*link));
                let link_target = self
                    .target
                    .join(link_target.strip_prefix("/").unwrap_or(&link_target));
                let link_target = resolve_path(&self.root, &link_target, false, None)?;
                make_room(&path, false, options)?;
                std::fs::hard_link(&link_target, &path).map_err(|e| {
                    BuildError::CopierError(format!(
                        "copier: put: creating hard link {} to {}: {}",
                        path.display(),
                        link_target.display(),
                        e
                    ))
                })?;
            }
            tar::EntryType::Symlink => {
                let link = entry.link_name()?.ok_or_else(|| {
                    BuildError::CopierError(format!("copier: put: symlink {:?} has no target", name))
                })?;
                make_room(&path, false, options)?;
                std::os::unix::fs::symlink(&*link, &path).map_err(|e| {
                    BuildError::CopierError(format!(
                        "copier: put: creating symlink {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
            tar::EntryType::Char | tar::EntryType::Block => {
                if options.ignore_devices {
                    tracing::debug!(name = %name, "Skipping device node");
                    return Ok(());
                }
                make_room(&path, false, options)?;
                let major = header.device_major()?.unwrap_or(0);
                let minor = header.device_minor()?.unwrap_or(0);
                if let Err(e) = fsutil::mknod(&path, kind == tar::EntryType::Block, major, minor) {
                    if fsutil::is_root() {
                        return Err(e);
                    }
                    tracing::warn!(name = %name, "Cannot create device node as unprivileged user, skipping");
                    return Ok(());
                }
            }
            tar::EntryType::Fifo => {
                make_room(&path, false, options)?;
                fsutil::mkfifo(&path)?;
            }
            tar::EntryType::Directory => {
                make_room(&path, true, options)?;
                if !path.is_dir() {
                    create_dir(&path, owner, 0o700)?;
                }
                fsutil::lchown(&path, owner.uid, owner.gid)?;
                // writable until finish() so children can be created
                fsutil::chmod(&path, 0o700 | mode)?;
                self.deferred.push(DeferredDir { path, mode, mtime });
                return Ok(());
            }
            other => {
                tracing::debug!(name = %name, kind = ?other, "Skipping unsupported entry type");
                return Ok(());
            }
        }

        fsutil::lchown(&path, owner.uid, owner.gid)?;
        let is_symlink = kind == tar::EntryType::Symlink;
        if !is_symlink {
            fsutil::chmod(&path, mode)?;
        }
        fsutil::set_times(&path, mtime, mtime, is_symlink)
    }

    /// Restore directory modes and timestamps.
    pub(crate) fn finish(self) -> Result<()> {
        for dir in self.deferred.iter().rev() {
            fsutil::chmod(&dir.path, dir.mode)?;
            fsutil::set_times(&dir.path, dir.mtime, dir.mtime, false)?;
        }
        Ok(())
    }
}

fn entry_mode(header: &tar::Header, options: &PutOptions, is_dir: bool) -> Result<u32> {
    let mut mode = header_mode(header)? & 0o7777;
    let chmod = if is_dir { options.chmod_dirs } else { options.chmod_files };
    if let Some(m) = chmod {
        mode = m & 0o7777;
    }
    if options.strip_setuid_bit {
        mode &= !0o4000;
    }
    if options.strip_setgid_bit {
        mode &= !0o2000;
    }
    if options.strip_sticky_bit {
        mode &= !0o1000;
    }
    Ok(mode)
}

/// Create `dir` and any missing directories between it and `root`.
fn ensure_dirs(root: &Path, dir: &Path, owner: IdPair, mode: u32) -> Result<()> {
    let rel = rel_subdirectory(root, dir)?;
    let mut current = root.to_path_buf();
    for component in rel.components() {
        current.push(component);
        if current.is_dir() {
            continue;
        }
        create_dir(&current, owner, mode)?;
    }
    Ok(())
}

fn create_dir(path: &Path, owner: IdPair, mode: u32) -> Result<()> {
    match std::fs::create_dir(path) {
        Ok(()) => {
            fsutil::lchown(path, owner.uid, owner.gid)?;
            fsutil::chmod(path, mode)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(BuildError::CopierError(format!(
            "copier: put: creating directory {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Clear whatever is at `path` so a new item can take its place.
/// Directories replacing directories are merged.
fn make_room(path: &Path, want_dir: bool, options: &PutOptions) -> Result<()> {
    let existing = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let result = match (existing.is_dir(), want_dir) {
        (true, true) => return Ok(()),
        (true, false) => {
            if options.no_overwrite_dir_non_dir {
                return Err(BuildError::CopierError(format!(
                    "copier: put: refusing to replace directory {:?} with a non-directory",
                    path
                )));
            }
            std::fs::remove_dir_all(path)
        }
        (false, true) => {
            if options.no_overwrite_non_dir_dir {
                return Err(BuildError::CopierError(format!(
                    "copier: put: refusing to replace non-directory {:?} with a directory",
                    path
                )));
            }
            std::fs::remove_file(path)
        }
        (false, false) => std::fs::remove_file(path),
    };
    result.map_err(|e| {
        BuildError::CopierError(format!("copier: put: removing {}: {}", path.display(), e))
    })
}

fn write_file<R: Read>(path: &Path, content: &mut R) -> Result<()> {
    let mut file: File = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| {
            BuildError::CopierError(format!("copier: put: creating {}: {}", path.display(), e))
        })?;
    std::io::copy(content, &mut file).map_err(|e| {
        BuildError::CopierError(format!("copier: put: writing {}: {}", path.display(), e))
    })?;
    Ok(())
}
