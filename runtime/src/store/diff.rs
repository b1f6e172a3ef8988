//! Layer diffs: computing them between two directory trees and applying
//! them with whiteout handling.

use std::collections::HashMap;
use std::fs::Metadata;
use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};

use crate::copier::{self, Extractor, GetOptions, PutOptions};
use crate::pipe::os_pipe;
use crate::tarfilter::{append_item, TarItem};

/// Prefix marking a removed item in a layer diff.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marks a directory whose lower contents are hidden entirely.
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

/// Prefix reserved for whiteout metadata entries.
const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// Copy the contents of `src` into `dst`, keeping ownership, permissions
/// and timestamps.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let empty = std::fs::read_dir(src)
        .map_err(|e| {
            BuildError::StorageError(format!("Failed to read {}: {}", src.display(), e))
        })?
        .next()
        .is_none();
    if empty {
        return Ok(());
    }
    let (reader, writer) = os_pipe()?;
    let src = src.to_path_buf();
    let producer = std::thread::spawn(move || -> Result<()> {
        let options = GetOptions::default();
        copier::get(&src, &src, &options, &[".".to_string()], writer)?;
        Ok(())
    });
    let consumed = copier::put(dst, dst, &PutOptions::default(), reader);
    let produced = producer
        .join()
        .map_err(|_| BuildError::Internal("layer copy thread panicked".to_string()))?;
    match (produced, consumed) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(p), Err(c)) => Err(BuildError::from_many(vec![p, c])),
    }
}

/// Write the changes that turn `lower` into `upper` to `writer`.
pub fn write_diff<W: Write>(lower: Option<&Path>, upper: &Path, writer: W) -> Result<W> {
    let mut differ = Differ {
        lower,
        upper,
        builder: tar::Builder::new(writer),
        hardlinks: HashMap::new(),
    };
    differ.walk(Path::new(""))?;
    differ
        .builder
        .into_inner()
        .map_err(|e| BuildError::StorageError(format!("Failed to finish layer diff: {}", e)))
}

struct Differ<'a, W: Write> {
    lower: Option<&'a Path>,
    upper: &'a Path,
    builder: tar::Builder<W>,
    hardlinks: HashMap<(u64, u64), PathBuf>,
}

impl<'a, W: Write> Differ<'a, W> {
    fn walk(&mut self, rel: &Path) -> Result<()> {
        let dir = self.upper.join(rel);
        let mut names: Vec<_> = std::fs::read_dir(&dir)
            .map_err(|e| {
                BuildError::StorageError(format!("Failed to read {}: {}", dir.display(), e))
            })?
            .flatten()
            .map(|e| e.file_name())
            .collect();
        names.sort();

        if let Some(lower_dir) = self.lower.map(|l| l.join(rel)) {
            if lower_dir.is_dir() && !lower_dir.is_symlink() {
                let mut removed: Vec<_> = std::fs::read_dir(&lower_dir)
                    .map_err(|e| {
                        BuildError::StorageError(format!(
                            "Failed to read {}: {}",
                            lower_dir.display(),
                            e
                        ))
                    })?
                    .flatten()
                    .map(|e| e.file_name())
                    .filter(|name| !names.contains(name))
                    .collect();
                removed.sort();
                for name in removed {
                    let mut whiteout = std::ffi::OsString::from(WHITEOUT_PREFIX);
                    whiteout.push(&name);
                    self.write_whiteout(&rel.join(whiteout))?;
                }
            }
        }

        for name in names {
            let item = rel.join(&name);
            let path = self.upper.join(&item);
            let meta = std::fs::symlink_metadata(&path).map_err(|e| {
                BuildError::StorageError(format!("Failed to stat {}: {}", path.display(), e))
            })?;
            if meta.file_type().is_socket() {
                continue;
            }
            let lower_meta = self
                .lower
                .and_then(|l| std::fs::symlink_metadata(l.join(&item)).ok());
            let changed = match &lower_meta {
                Some(lower_meta) => self.differs(&item, &meta, lower_meta),
                None => true,
            };
            if changed {
                self.write_entry(&item, &path, &meta)?;
            }
            if meta.is_dir() {
                self.walk(&item)?;
            }
        }
        Ok(())
    }

    fn differs(&self, item: &Path, upper: &Metadata, lower: &Metadata) -> bool {
        if upper.file_type() != lower.file_type()
            || upper.mode() != lower.mode()
            || upper.uid() != lower.uid()
            || upper.gid() != lower.gid()
            || upper.mtime() != lower.mtime()
        {
            return true;
        }
        if upper.is_dir() {
            return false;
        }
        if upper.size() != lower.size() || upper.rdev() != lower.rdev() {
            return true;
        }
        if upper.file_type().is_symlink() {
            let targets = (
                std::fs::read_link(self.upper.join(item)).ok(),
                self.lower.and_then(|l| std::fs::read_link(l.join(item)).ok()),
            );
            return targets.0 != targets.1;
        }
        false
    }

    fn write_whiteout(&mut self, name: &Path) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o600);
        let mut item = TarItem::new(header, name);
        append_item(&mut self.builder, &mut item, std::io::empty())
    }

    fn write_entry(&mut self, item: &Path, path: &Path, meta: &Metadata) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(meta, tar::HeaderMode::Complete);
        let mut entry = TarItem::new(header, item);
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(path)?;
            entry.header.set_size(0);
            entry.link_name = Some(target);
            return append_item(&mut self.builder, &mut entry, std::io::empty());
        }
        if file_type.is_file() {
            let key = (meta.dev(), meta.ino());
            if meta.nlink() > 1 {
                if let Some(first) = self.hardlinks.get(&key).cloned() {
                    entry.header.set_entry_type(tar::EntryType::Link);
                    entry.header.set_size(0);
                    entry.link_name = Some(first);
                    return append_item(&mut self.builder, &mut entry, std::io::empty());
                }
                self.hardlinks.insert(key, item.to_path_buf());
            }
            let file = std::fs::File::open(path).map_err(|e| {
                BuildError::StorageError(format!("Failed to open {}: {}", path.display(), e))
            })?;
            return append_item(&mut self.builder, &mut entry, file);
        }
        entry.header.set_size(0);
        append_item(&mut self.builder, &mut entry, std::io::empty())
    }
}

/// Apply the layer diff in `reader` to the directory `root`.
pub fn apply_diff<R: Read>(root: &Path, reader: R) -> Result<()> {
    let options = PutOptions::default();
    let mut extractor = Extractor::new(root, root, &options)?;
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| BuildError::StorageError(format!("Failed to read layer diff: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| BuildError::StorageError(format!("Failed to read layer diff: {}", e)))?;
        let name = entry.path()?.into_owned();
        let base = name
            .file_name()
            .map(|b| b.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(hidden) = base.strip_prefix(WHITEOUT_PREFIX) {
            let parent = name.parent().unwrap_or(Path::new(""));
            if base == WHITEOUT_OPAQUE_DIR {
                if let Some(dir) = extractor.host_path(&parent.display().to_string())? {
                    clear_dir(&dir)?;
                }
            } else if !base.starts_with(WHITEOUT_META_PREFIX) {
                let target = parent.join(hidden);
                if let Some(path) = extractor.host_path(&target.display().to_string())? {
                    remove_any(&path)?;
                }
            }
            continue;
        }
        extractor.extract(&mut entry)?;
    }
    extractor.finish()
}

fn remove_any(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let removed = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    removed.map_err(|e| {
        BuildError::StorageError(format!("Failed to remove {}: {}", path.display(), e))
    })
}

fn clear_dir(dir: &Path) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries.flatten() {
        remove_any(&entry.path())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(data: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_copy_tree_and_empty_diff() {
        let dir = TempDir::new().unwrap();
        let lower = dir.path().join("lower");
        let upper = dir.path().join("upper");
        std::fs::create_dir_all(lower.join("etc")).unwrap();
        std::fs::write(lower.join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();
        std::os::unix::fs::symlink("hosts", lower.join("etc/hosts.link")).unwrap();
        std::fs::create_dir_all(&upper).unwrap();
        copy_tree(&lower, &upper).unwrap();
        assert_eq!(
            std::fs::read_link(upper.join("etc/hosts.link")).unwrap(),
            PathBuf::from("hosts")
        );
        let out = write_diff(Some(&lower), &upper, Vec::new()).unwrap();
        assert!(names(&out).is_empty(), "unexpected entries {:?}", names(&out));
    }

    #[test]
    fn test_diff_reports_additions_changes_and_removals() {
        let dir = TempDir::new().unwrap();
        let lower = dir.path().join("lower");
        let upper = dir.path().join("upper");
        std::fs::create_dir_all(lower.join("app")).unwrap();
        std::fs::write(lower.join("app/keep"), "same").unwrap();
        std::fs::write(lower.join("app/gone"), "bye").unwrap();
        std::fs::create_dir_all(&upper).unwrap();
        copy_tree(&lower, &upper).unwrap();

        std::fs::remove_file(upper.join("app/gone")).unwrap();
        std::fs::write(upper.join("app/new"), "hello").unwrap();

        let out = write_diff(Some(&lower), &upper, Vec::new()).unwrap();
        let entries = names(&out);
        assert!(entries.contains(&"app/.wh.gone".to_string()));
        assert!(entries.contains(&"app/new".to_string()));
        assert!(!entries.contains(&"app/keep".to_string()));

        let applied = dir.path().join("applied");
        std::fs::create_dir_all(&applied).unwrap();
        copy_tree(&lower, &applied).unwrap();
        apply_diff(&applied, out.as_slice()).unwrap();
        assert!(!applied.join("app/gone").exists());
        assert_eq!(std::fs::read_to_string(applied.join("app/new")).unwrap(), "hello");
        assert_eq!(std::fs::read_to_string(applied.join("app/keep")).unwrap(), "same");
    }

    #[test]
    fn test_base_diff_includes_everything() {
        let dir = TempDir::new().unwrap();
        let upper = dir.path().join("upper");
        std::fs::create_dir_all(upper.join("bin")).unwrap();
        std::fs::write(upper.join("bin/tool"), "#!/bin/sh\n").unwrap();
        std::fs::hard_link(upper.join("bin/tool"), upper.join("bin/alias")).unwrap();
        let out = write_diff(None, &upper, Vec::new()).unwrap();
        let mut archive = tar::Archive::new(out.as_slice());
        let kinds: Vec<(String, tar::EntryType)> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.path().unwrap().display().to_string(), e.header().entry_type())
            })
            .collect();
        assert_eq!(kinds[0].0, "bin");
        assert_eq!(kinds[1], ("bin/alias".to_string(), tar::EntryType::Regular));
        assert_eq!(kinds[2], ("bin/tool".to_string(), tar::EntryType::Link));
    }

    #[test]
    fn test_opaque_whiteout_clears_directory() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("var/cache")).unwrap();
        std::fs::write(root.join("var/cache/a"), "a").unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o600);
        builder
            .append_data(&mut header, "var/cache/.wh..wh..opq", std::io::empty())
            .unwrap();
        let data = builder.into_inner().unwrap();
        apply_diff(root, data.as_slice()).unwrap();
        assert!(root.join("var/cache").is_dir());
        assert!(!root.join("var/cache/a").exists());
        assert!(!root.join("var/cache/.wh..wh..opq").exists());
    }
}
