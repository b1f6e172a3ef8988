//! Mount points created in the rootfs for a run.
//!
//! Missing mount targets are created before the run with the epoch as
//! their timestamp, recorded so that commit leaves them out of the layer,
//! and removed again afterwards if nothing changed them. Parents whose
//! timestamps were restored are recorded too.

use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::{IdMappings, IdPair};
use chrono::{DateTime, Utc};
use oci_spec::runtime::Mount;

use crate::copier::{
    self, clean_path, ConditionalRemoveOptions, ConditionalRemovePath, EnsureKind, EnsureOptions,
    EnsureParentPath, EnsurePath,
};
use crate::store::write_json_atomic;

/// Directory under the container directory listing created mount targets.
pub(crate) const EXCLUDES_DIR: &str = "commit-excludes";
/// Directory under the container directory listing preserved parents.
pub(crate) const PULLED_UP_DIR: &str = "commit-pulled-up";

/// Top-level directories every image is expected to have.
const EXEMPT: &[&str] = &["dev", "proc", "sys"];

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default()
}

/// Targets created for one run.
#[derive(Debug, Default)]
pub(crate) struct MountTargets {
    pub created: Vec<ConditionalRemovePath>,
    pub pulled_up: Vec<EnsureParentPath>,
}

/// Create every mount destination missing from `rootfs` and record what
/// was created under `container_dir`.
pub(crate) fn create_mount_targets(
    rootfs: &Path,
    container_dir: &Path,
    mounts: &[Mount],
    id_mappings: &IdMappings,
) -> Result<MountTargets> {
    let then = epoch();
    let mut paths: Vec<EnsurePath> = Vec::new();
    for m in mounts {
        let destination = clean_path(&Path::new("/").join(m.destination()));
        if destination == Path::new("/") {
            continue;
        }
        let is_file = m.typ().as_deref() == Some("bind")
            && m
                .source()
                .as_ref()
                .and_then(|s| std::fs::metadata(s).ok())
                .map(|meta| !meta.is_dir())
                .unwrap_or(false);
        let top = destination
            .components()
            .nth(1)
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_default();
        let exempt = EXEMPT.contains(&top.as_str()) && destination.components().count() == 2;
        paths.push(EnsurePath {
            path: destination.display().to_string(),
            kind: if is_file { EnsureKind::File } else { EnsureKind::Dir },
            mod_time: if exempt { None } else { Some(then) },
            chmod: Some(if is_file { 0o644 } else { 0o755 }),
            chown: None,
        });
    }
    if paths.is_empty() {
        return Ok(MountTargets::default());
    }

    let options = EnsureOptions {
        id_mappings: id_mappings.clone(),
        paths,
    };
    let (created, pulled_up) = copier::ensure(rootfs, Path::new("/"), &options)?;
    let created: Vec<ConditionalRemovePath> = created
        .into_iter()
        .filter(|p| !EXEMPT.contains(&p.as_str()))
        .map(|p| ConditionalRemovePath {
            owner: Some(created_owner(rootfs, &p, id_mappings)),
            path: format!("/{}", p.trim_start_matches('/')),
            mod_time: Some(then),
            mode: None,
        })
        .collect();
    let pulled_up: Vec<EnsureParentPath> = pulled_up
        .into_iter()
        .map(|mut p| {
            p.path = format!("/{}", p.path.trim_start_matches('/'));
            p
        })
        .collect();

    let name = format!("{}.json", uuid::Uuid::new_v4().simple());
    if !created.is_empty() {
        write_json_atomic(&container_dir.join(EXCLUDES_DIR).join(&name), &created)?;
    }
    if !pulled_up.is_empty() {
        write_json_atomic(&container_dir.join(PULLED_UP_DIR).join(&name), &pulled_up)?;
    }
    tracing::debug!(
        created = created.len(),
        pulled_up = pulled_up.len(),
        "Created mount targets"
    );
    Ok(MountTargets { created, pulled_up })
}

/// Container-side owner of a freshly created target. Unprivileged runs
/// cannot hand items to root, so this is read back from disk.
fn created_owner(rootfs: &Path, rel: &str, id_mappings: &IdMappings) -> IdPair {
    use std::os::unix::fs::MetadataExt;
    match std::fs::symlink_metadata(rootfs.join(rel.trim_start_matches('/'))) {
        Ok(meta) => id_mappings
            .to_container(IdPair::new(meta.uid(), meta.gid()))
            .unwrap_or_default(),
        Err(_) => IdPair::default(),
    }
}

/// Remove the targets created for a run, if they are still as created.
pub(crate) fn remove_mount_targets(rootfs: &Path, targets: &MountTargets, id_mappings: &IdMappings) {
    if targets.created.is_empty() {
        return;
    }
    let options = ConditionalRemoveOptions {
        id_mappings: id_mappings.clone(),
        paths: targets.created.clone(),
    };
    match copier::conditional_remove(rootfs, Path::new("/"), &options) {
        Ok(removed) => tracing::debug!(removed = removed.len(), "Removed mount targets"),
        Err(e) => tracing::warn!(error = %e, "Failed to remove mount targets"),
    }
}

fn read_lists<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
        .collect();
    files.sort();
    let mut out = Vec::new();
    for file in files {
        let data = std::fs::read(&file)?;
        let mut items: Vec<T> = serde_json::from_slice(&data).map_err(|e| {
            BuildError::SerializationError(format!("parsing {}: {}", file.display(), e))
        })?;
        out.append(&mut items);
    }
    Ok(out)
}

/// Everything recorded by earlier runs: created targets and preserved
/// parents.
pub(crate) fn read_exclusions(
    container_dir: &Path,
) -> Result<(Vec<ConditionalRemovePath>, Vec<EnsureParentPath>)> {
    Ok((
        read_lists(&container_dir.join(EXCLUDES_DIR))?,
        read_lists(&container_dir.join(PULLED_UP_DIR))?,
    ))
}
