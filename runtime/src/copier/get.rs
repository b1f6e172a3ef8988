//! Reading items out of a root as a tar stream.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, Metadata};
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::idmap::{IdMappings, IdPair};
use chrono::{DateTime, Utc};

use super::fsutil::FileTime;
use super::pattern::ExcludeMatcher;
use super::resolve::{rel_subdirectory, resolve_path};
use super::{extended_glob, has_glob_chars, Scope};
use crate::tarfilter::{append_item, header_mode, TarItem};

/// Options for [`get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Map host owners back into the container
    pub id_mappings: IdMappings,
    /// Dockerignore-style patterns, relative to the root
    pub excludes: Vec<String>,
    /// Emit the contents of archives instead of the archives
    pub expand_archives: bool,
    pub chown_dirs: Option<IdPair>,
    pub chmod_dirs: Option<u32>,
    pub chown_files: Option<IdPair>,
    pub chmod_files: Option<u32>,
    /// Name items by their path relative to the directory, with parents
    pub parents: bool,
    pub strip_setuid_bit: bool,
    pub strip_setgid_bit: bool,
    pub strip_sticky_bit: bool,
    /// Include a directory match itself, named by its base name
    pub keep_directory_names: bool,
    /// Item name (or leading path) replacements
    pub rename: BTreeMap<String, String>,
    /// Copy a matched symlink instead of what it points to
    pub no_deref_symlinks: bool,
    /// Do not descend into other filesystems
    pub no_cross_device: bool,
    /// Skip items that cannot be read instead of failing
    pub ignore_unreadable: bool,
    /// Timestamp forced onto every entry
    pub timestamp: Option<DateTime<Utc>>,
}

/// Write the items matched by `globs` to `writer` as a tar stream.
pub fn get<W: Write>(
    root: &Path,
    directory: &Path,
    options: &GetOptions,
    globs: &[String],
    writer: W,
) -> Result<W> {
    let scope = Scope::new(root, directory)?;
    let matcher = ExcludeMatcher::new(&options.excludes)?;
    let mut getter = Getter {
        root: &scope.root,
        directory: &scope.directory,
        options,
        matcher: &matcher,
        builder: tar::Builder::new(writer),
        hardlinks: HashMap::new(),
        parents_written: HashSet::new(),
        copied: 0,
    };
    getter.builder.mode(tar::HeaderMode::Complete);
    getter.builder.follow_symlinks(false);

    for (original, pattern) in scope.globs(globs)? {
        let matched = extended_glob(&pattern)?;
        if matched.is_empty() {
            if has_glob_chars(&original) {
                continue;
            }
            return Err(BuildError::NotFound(format!(
                "copier: get: {:?}: no such file or directory",
                original
            )));
        }
        for globbed in matched {
            getter.get_match(&globbed)?;
        }
    }
    if getter.copied == 0 {
        return Err(BuildError::CopierError(format!(
            "copier: get: {:?}: copied no items",
            globs
        )));
    }
    getter
        .builder
        .into_inner()
        .map_err(|e| BuildError::CopierError(format!("copier: get: finishing archive: {}", e)))
}

struct Getter<'a, W: Write> {
    root: &'a Path,
    directory: &'a Path,
    options: &'a GetOptions,
    matcher: &'a ExcludeMatcher,
    builder: tar::Builder<W>,
    /// (dev, ino) to the name the first link was written under
    hardlinks: HashMap<(u64, u64), String>,
    parents_written: HashSet<String>,
    copied: usize,
}

impl<'a, W: Write> Getter<'a, W> {
    fn get_match(&mut self, globbed: &Path) -> Result<()> {
        let rel = rel_subdirectory(self.root, globbed)?;
        if self.matcher.matches(&rel) {
            return Ok(());
        }
        let item = if self.options.no_deref_symlinks {
            globbed.to_path_buf()
        } else {
            resolve_path(self.root, globbed, true, Some(self.matcher))?
        };
        let meta = match std::fs::symlink_metadata(&item) {
            Ok(m) => m,
            Err(e) => {
                return Err(BuildError::CopierError(format!(
                    "copier: get: lstat {:?}: {}",
                    globbed, e
                )))
            }
        };

        let base_name = if self.options.parents {
            let name = rel_subdirectory(self.directory, globbed)?;
            self.write_parents(&name)?;
            name
        } else {
            PathBuf::from(globbed.file_name().unwrap_or(globbed.as_os_str()))
        };

        if meta.is_dir() {
            if self.options.keep_directory_names || self.options.parents {
                let name = self.renamed(&base_name);
                self.write_one(&item, &meta, &name)?;
            }
            let dev = meta.dev();
            self.walk(&item, &item, &base_name, dev)?;
            // an empty directory still counts as copied
            self.copied += 1;
            return Ok(());
        }

        if meta.file_type().is_file()
            && self.options.expand_archives
            && crate::archive::is_archive(&item)
        {
            return self.expand_archive(&item);
        }
        let name = self.renamed(&base_name);
        self.write_one(&item, &meta, &name)
    }

    fn walk(&mut self, top: &Path, dir: &Path, base_name: &Path, dev: u64) -> Result<()> {
        let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .collect(),
            Err(e) if self.options.ignore_unreadable && e.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::debug!(path = %dir.display(), "Skipping unreadable directory");
                return Ok(());
            }
            Err(e) => {
                return Err(BuildError::CopierError(format!(
                    "copier: get: reading directory {}: {}",
                    dir.display(),
                    e
                )))
            }
        };
        entries.sort();
        for path in entries {
            let rel_root = rel_subdirectory(self.root, &path)?;
            let meta = std::fs::symlink_metadata(&path)?;
            if self.matcher.matches(&rel_root) {
                if meta.is_dir() && self.matcher.may_reinclude_below(&rel_root) {
                    self.walk(top, &path, base_name, dev)?;
                }
                continue;
            }
            let rel_item = rel_subdirectory(top, &path)?;
            let name = if self.options.keep_directory_names || self.options.parents {
                base_name.join(&rel_item)
            } else {
                rel_item
            };
            let name = self.renamed(&name);
            if meta.file_type().is_socket() {
                continue;
            }
            self.write_one(&path, &meta, &name)?;
            if meta.is_dir() {
                if self.options.no_cross_device && meta.dev() != dev {
                    continue;
                }
                self.walk(top, &path, base_name, dev)?;
            }
        }
        Ok(())
    }

    /// Directory entries for every ancestor of `name` below the directory.
    fn write_parents(&mut self, name: &Path) -> Result<()> {
        let mut ancestors: Vec<&Path> = name
            .ancestors()
            .skip(1)
            .filter(|a| !a.as_os_str().is_empty() && *a != Path::new("."))
            .collect();
        ancestors.reverse();
        for parent in ancestors {
            let key = parent.display().to_string();
            if !self.parents_written.insert(key) {
                continue;
            }
            let host = self.directory.join(parent);
            let meta = std::fs::symlink_metadata(&host).map_err(|e| {
                BuildError::CopierError(format!(
                    "copier: get: checking parent {}: {}",
                    host.display(),
                    e
                ))
            })?;
            let renamed = self.renamed(parent);
            self.write_one(&host, &meta, &renamed)?;
        }
        Ok(())
    }

    fn renamed(&self, name: &Path) -> PathBuf {
        PathBuf::from(handle_rename(
            &self.options.rename,
            &name.display().to_string(),
        ))
    }

    fn write_one(&mut self, path: &Path, meta: &Metadata, name: &Path) -> Result<()> {
        let name_str = name.display().to_string();
        let name_str = name_str.trim_start_matches('/').to_string();
        if name_str.is_empty() || name_str == "." {
            return Ok(());
        }
        let file_type = meta.file_type();
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        let mut link_name = None;
        let mut content: Option<File> = None;

        if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
        } else if file_type.is_symlink() {
            header.set_entry_type(tar::EntryType::Symlink);
            link_name = Some(std::fs::read_link(path)?);
        } else if file_type.is_file() {
            let key = (meta.dev(), meta.ino());
            let first = if meta.nlink() > 1 {
                self.hardlinks.get(&key).cloned()
            } else {
                None
            };
            match first {
                Some(first) => {
                    header.set_entry_type(tar::EntryType::Link);
                    link_name = Some(PathBuf::from(first));
                }
                None => {
                    match File::open(path) {
                        Ok(f) => content = Some(f),
                        Err(e)
                            if self.options.ignore_unreadable
                                && e.kind() == std::io::ErrorKind::PermissionDenied =>
                        {
                            tracing::debug!(path = %path.display(), "Skipping unreadable file");
                            return Ok(());
                        }
                        Err(e) => {
                            return Err(BuildError::CopierError(format!(
                                "copier: get: opening {}: {}",
                                path.display(),
                                e
                            )))
                        }
                    }
                    if meta.nlink() > 1 {
                        self.hardlinks.insert(key, name_str.clone());
                    }
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(meta.len());
                }
            }
        } else if file_type.is_char_device() || file_type.is_block_device() {
            header.set_entry_type(if file_type.is_char_device() {
                tar::EntryType::Char
            } else {
                tar::EntryType::Block
            });
            let rdev = meta.rdev();
            header.set_device_major(libc::major(rdev))?;
            header.set_device_minor(libc::minor(rdev))?;
        } else if file_type.is_fifo() {
            header.set_entry_type(tar::EntryType::Fifo);
        } else {
            return Ok(());
        }

        header.set_mode(meta.mode() & 0o7777);
        let host = IdPair::new(meta.uid(), meta.gid());
        let owner = self.options.id_mappings.to_container(host).map_err(|e| {
            BuildError::CopierError(format!(
                "copier: get: mapping owner of {}: {}",
                path.display(),
                e
            ))
        })?;
        header.set_uid(owner.uid as u64);
        header.set_gid(owner.gid as u64);
        header.set_mtime(FileTime::mtime_of(meta).secs.max(0) as u64);
        adjust_header(&mut header, self.options)?;

        let mut item = TarItem::new(header, name_str.clone());
        item.link_name = link_name;
        match content {
            Some(f) => append_item(&mut self.builder, &mut item, f)?,
            None => append_item(&mut self.builder, &mut item, std::io::empty())?,
        }
        self.copied += 1;
        tracing::trace!(name = %name_str, "Copied item");
        Ok(())
    }

    fn expand_archive(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let (_, stream) = crate::archive::decompress(file)?;
        let mut archive = tar::Archive::new(stream);
        let entries = archive.entries().map_err(|e| {
            BuildError::CopierError(format!("copier: get: reading {}: {}", path.display(), e))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                BuildError::CopierError(format!(
                    "copier: get: reading entry of {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let mut header = entry.header().clone();
            let name = entry.path()?.display().to_string();
            let link_name = entry.link_name()?.map(|l| l.into_owned());
            adjust_header(&mut header, self.options)?;
            let mut item = TarItem::new(header, self.renamed(Path::new(&name)));
            item.link_name = link_name;
            append_item(&mut self.builder, &mut item, entry)?;
            self.copied += 1;
        }
        Ok(())
    }
}

/// Apply ownership, permission and timestamp overrides.
fn adjust_header(header: &mut tar::Header, options: &GetOptions) -> Result<()> {
    let kind = header.entry_type();
    let mut mode = header_mode(header)?;
    if options.strip_setuid_bit {
        mode &= !0o4000;
    }
    if options.strip_setgid_bit {
        mode &= !0o2000;
    }
    if options.strip_sticky_bit {
        mode &= !0o1000;
    }
    if kind.is_dir() {
        if let Some(m) = options.chmod_dirs {
            mode = m;
        }
        if let Some(owner) = options.chown_dirs {
            header.set_uid(owner.uid as u64);
            header.set_gid(owner.gid as u64);
        }
    } else if !kind.is_symlink() {
        if let Some(m) = options.chmod_files {
            mode = m;
        }
        if let Some(owner) = options.chown_files {
            header.set_uid(owner.uid as u64);
            header.set_gid(owner.gid as u64);
        }
    } else if let Some(owner) = options.chown_files {
        header.set_uid(owner.uid as u64);
        header.set_gid(owner.gid as u64);
    }
    header.set_mode(mode & 0o7777);
    if let Some(when) = &options.timestamp {
        header.set_mtime(when.timestamp().max(0) as u64);
    }
    Ok(())
}

/// Replace `name`, or its longest renamed leading directory.
pub(crate) fn handle_rename(rename: &BTreeMap<String, String>, name: &str) -> String {
    if rename.is_empty() {
        return name.to_string();
    }
    if let Some(mapped) = rename.get(name) {
        return mapped.clone();
    }
    let trimmed = name.trim_end_matches('/');
    let mut prefix = trimmed;
    while let Some(idx) = prefix.rfind('/') {
        prefix = &prefix[..idx];
        let remainder = &trimmed[idx + 1..];
        for candidate in [prefix.to_string(), format!("{}/", prefix)] {
            if let Some(mapped) = rename.get(&candidate) {
                return format!("{}/{}", mapped.trim_end_matches('/'), remainder);
            }
        }
    }
    name.to_string()
}
