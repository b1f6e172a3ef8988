//! Directory-backed layer, image and container store.
//!
//! Layout under the store root:
//!
//! ```text
//! layers/<id>/layer.json        layer record
//! layers/<id>/diff/             full filesystem view of the layer
//! images/<id>/image.json        image record
//! images/<id>/manifest          manifest blob as committed
//! images/<id>/config            config blob as committed
//! containers/<id>/container.json
//! containers/<id>/userdata/     per-container working files
//! ```
//!
//! A child layer starts as a copy of its parent, so a layer's `diff/`
//! directory can be used directly as a root filesystem. Layers created
//! from blobs are keyed by chain ID, which lets identical layers be
//! shared between images.

pub mod diff;
pub mod layout;

use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::BuildConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::digest::sha256_bytes;

/// Uncompressed diff kept for layers created from a blob, so that their
/// diff reproduces the blob exactly.
const DIFF_TAR: &str = "diff.tar";

/// One layer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    pub created: DateTime<Utc>,
    /// Digest of the uncompressed diff, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_size: Option<u64>,
    /// Digest of the blob the layer was created from, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_digest: Option<String>,
}

/// One image record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Hex digest of the config blob
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_layer: Option<String>,
    /// Manifest digest
    pub digest: String,
    pub created: DateTime<Utc>,
}

/// One container record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    /// Image ID, empty for scratch
    #[serde(default)]
    pub image: String,
    pub layer: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub mount_count: u32,
}

/// Chain ID of a layer applied on top of `parent`.
pub fn chain_id(parent: Option<&str>, diff_id: &str) -> String {
    match parent {
        None => crate::digest::encoded(diff_id).to_string(),
        Some(parent) => sha256_bytes(format!("{} {}", parent, diff_id).as_bytes()),
    }
}

/// A fresh random 64-hex-character ID.
pub fn random_id() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Write JSON to `path` through a temporary file and rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data)
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, data).map_err(|e| {
        BuildError::StorageError(format!("Failed to write {}: {}", tmp_path.display(), e))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        BuildError::StorageError(format!(
            "Failed to rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        ))
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BuildError::NotFound(format!("{}", path.display()))
        } else {
            BuildError::StorageError(format!("Failed to read {}: {}", path.display(), e))
        }
    })?;
    serde_json::from_slice(&data).map_err(|e| {
        BuildError::StorageError(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// The store.
pub struct Store {
    root: PathBuf,
    run_root: PathBuf,
    lock: Mutex<()>,
}

impl Store {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: &Path, run_root: &Path) -> Result<Self> {
        for sub in ["layers", "images", "containers"] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| {
                BuildError::StorageError(format!(
                    "Failed to create store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        std::fs::create_dir_all(run_root).map_err(|e| {
            BuildError::StorageError(format!(
                "Failed to create run root {}: {}",
                run_root.display(),
                e
            ))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            run_root: run_root.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn open(config: &BuildConfig) -> Result<Self> {
        Self::new(&config.root, &config.run_root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    fn layer_dir(&self, id: &str) -> PathBuf {
        self.root.join("layers").join(id)
    }

    /// Filesystem view of a layer.
    pub fn layer_path(&self, id: &str) -> PathBuf {
        self.layer_dir(id).join("diff")
    }

    fn image_dir(&self, id: &str) -> PathBuf {
        self.root.join("images").join(id)
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join("containers").join(id)
    }

    // ---- layers ----

    pub fn layer(&self, id: &str) -> Result<Layer> {
        read_json(&self.layer_dir(id).join("layer.json"))
            .map_err(|e| not_found_as(e, format!("layer {:?} not known", id)))
    }

    pub fn layer_exists(&self, id: &str) -> bool {
        self.layer_dir(id).join("layer.json").exists()
    }

    pub fn layers(&self) -> Result<Vec<Layer>> {
        list_records(&self.root.join("layers"), "layer.json")
    }

    /// Layers from the bottom of the stack up to and including `top`.
    pub fn layer_chain(&self, top: Option<&str>) -> Result<Vec<Layer>> {
        let mut chain = Vec::new();
        let mut next = top.map(str::to_string);
        while let Some(id) = next {
            let layer = self.layer(&id)?;
            next = layer.parent.clone();
            chain.push(layer);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Create an empty read-write layer seeded with its parent's contents.
    pub fn create_layer(&self, parent: Option<&str>) -> Result<Layer> {
        self.create_layer_with_id(&random_id(), parent)
    }

    fn create_layer_with_id(&self, id: &str, parent: Option<&str>) -> Result<Layer> {
        let _guard = self.lock.lock();
        if let Some(parent) = parent {
            if !self.layer_exists(parent) {
                return Err(BuildError::NotFound(format!(
                    "parent layer {:?} not known",
                    parent
                )));
            }
        }
        let dir = self.layer_dir(id);
        let diff_dir = dir.join("diff");
        std::fs::create_dir_all(&diff_dir).map_err(|e| {
            BuildError::StorageError(format!(
                "Failed to create layer directory {}: {}",
                diff_dir.display(),
                e
            ))
        })?;
        std::fs::set_permissions(&diff_dir, std::os::unix::fs::PermissionsExt::from_mode(0o755))?;
        if let Some(parent) = parent {
            if let Err(e) = diff::copy_tree(&self.layer_path(parent), &diff_dir) {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        }
        let layer = Layer {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            names: Vec::new(),
            created: Utc::now(),
            uncompressed_digest: None,
            uncompressed_size: None,
            compressed_digest: None,
        };
        write_json_atomic(&dir.join("layer.json"), &layer)?;
        tracing::debug!(layer = %id, parent = ?parent, "Created layer");
        Ok(layer)
    }

    fn save_layer(&self, layer: &Layer) -> Result<()> {
        write_json_atomic(&self.layer_dir(&layer.id).join("layer.json"), layer)
    }

    /// Write the changes between a layer and its parent to `writer` as an
    /// uncompressed tar stream.
    pub fn diff<W: std::io::Write>(&self, id: &str, mut writer: W) -> Result<W> {
        let layer = self.layer(id)?;
        let saved = self.layer_dir(id).join(DIFF_TAR);
        if saved.exists() {
            let mut file = std::fs::File::open(&saved).map_err(|e| {
                BuildError::StorageError(format!("Failed to open {}: {}", saved.display(), e))
            })?;
            std::io::copy(&mut file, &mut writer)?;
            return Ok(writer);
        }
        let lower = layer.parent.as_deref().map(|p| self.layer_path(p));
        diff::write_diff(lower.as_deref(), &self.layer_path(id), writer)
    }

    /// Create (or reuse) the layer that results from applying the diff in
    /// `reader` on top of `parent`. The stream must hash to `diff_id`.
    pub fn apply_diff<R: std::io::Read>(
        &self,
        parent: Option<&str>,
        diff_id: &str,
        compressed_digest: Option<&str>,
        reader: R,
    ) -> Result<Layer> {
        let id = chain_id(parent, diff_id);
        if self.layer_exists(&id) {
            tracing::debug!(layer = %id, "Reusing existing layer");
            return self.layer(&id);
        }
        let mut layer = self.create_layer_with_id(&id, parent)?;
        let saved = self.layer_dir(&id).join(DIFF_TAR);
        let received = std::fs::File::create(&saved)
            .map_err(BuildError::from)
            .and_then(|file| {
                let mut writer = crate::digest::HashingWriter::new(file);
                let mut reader = reader;
                std::io::copy(&mut reader, &mut writer)?;
                Ok((writer.digest(), writer.count()))
            });
        let (actual, size) = match received {
            Ok(r) => r,
            Err(e) => {
                let _ = std::fs::remove_dir_all(self.layer_dir(&id));
                return Err(e);
            }
        };
        if actual != diff_id {
            let _ = std::fs::remove_dir_all(self.layer_dir(&id));
            return Err(BuildError::ChecksumMismatch {
                expected: diff_id.to_string(),
                actual,
            });
        }
        let applied = std::fs::File::open(&saved)
            .map_err(BuildError::from)
            .and_then(|file| diff::apply_diff(&self.layer_path(&id), file));
        if let Err(e) = applied {
            let _ = std::fs::remove_dir_all(self.layer_dir(&id));
            return Err(e);
        }
        layer.uncompressed_digest = Some(actual);
        layer.uncompressed_size = Some(size);
        layer.compressed_digest = compressed_digest.map(str::to_string);
        self.save_layer(&layer)?;
        tracing::debug!(layer = %id, diff_id = %diff_id, "Applied layer diff");
        Ok(layer)
    }

    /// Record the digest and size of a layer's diff after computing them.
    pub fn set_layer_digest(&self, id: &str, digest: &str, size: u64) -> Result<()> {
        let mut layer = self.layer(id)?;
        layer.uncompressed_digest = Some(digest.to_string());
        layer.uncompressed_size = Some(size);
        self.save_layer(&layer)
    }

    pub fn delete_layer(&self, id: &str) -> Result<()> {
        let dir = self.layer_dir(id);
        std::fs::remove_dir_all(&dir).map_err(|e| {
            BuildError::StorageError(format!("Failed to remove layer {}: {}", dir.display(), e))
        })
    }

    // ---- images ----

    /// Record an image. Its names are taken away from any other image.
    pub fn create_image(
        &self,
        id: &str,
        names: &[String],
        top_layer: Option<&str>,
        manifest: &[u8],
        config: &[u8],
    ) -> Result<Image> {
        let _guard = self.lock.lock();
        for mut other in self.images()? {
            if other.id != id && other.names.iter().any(|n| names.contains(n)) {
                other.names.retain(|n| !names.contains(n));
                write_json_atomic(&self.image_dir(&other.id).join("image.json"), &other)?;
            }
        }
        let dir = self.image_dir(id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            BuildError::StorageError(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        let mut image = match read_json::<Image>(&dir.join("image.json")) {
            Ok(existing) => existing,
            Err(_) => Image {
                id: id.to_string(),
                names: Vec::new(),
                top_layer: top_layer.map(str::to_string),
                digest: String::new(),
                created: Utc::now(),
            },
        };
        for name in names {
            if !image.names.contains(name) {
                image.names.push(name.clone());
            }
        }
        image.top_layer = top_layer.map(str::to_string);
        image.digest = crate::digest::sha256_digest(manifest);
        write_atomic(&dir.join("manifest"), manifest)?;
        write_atomic(&dir.join("config"), config)?;
        write_json_atomic(&dir.join("image.json"), &image)?;
        tracing::debug!(image = %id, names = ?image.names, "Recorded image");
        Ok(image)
    }

    /// Look an image up by ID, unique ID prefix, or name (a name without a
    /// tag also matches `:latest`).
    pub fn image(&self, name_or_id: &str) -> Result<Image> {
        let images = self.images()?;
        let id = name_or_id.strip_prefix("sha256:").unwrap_or(name_or_id);
        if let Some(image) = images.iter().find(|i| i.id == id) {
            return Ok(image.clone());
        }
        let tagged = if has_tag(name_or_id) {
            None
        } else {
            Some(format!("{}:latest", name_or_id))
        };
        if let Some(image) = images.iter().find(|i| {
            i.names.iter().any(|n| {
                n == name_or_id
                    || tagged.as_deref() == Some(n.as_str())
                    || short_name(n) == name_or_id
                    || tagged.as_deref().map(|t| short_name(n) == t).unwrap_or(false)
            })
        }) {
            return Ok(image.clone());
        }
        if id.len() >= 3 && id.chars().all(|c| c.is_ascii_hexdigit()) {
            let matches: Vec<&Image> = images.iter().filter(|i| i.id.starts_with(id)).collect();
            if matches.len() == 1 {
                return Ok(matches[0].clone());
            }
        }
        Err(BuildError::NotFound(format!(
            "image {:?} not known",
            name_or_id
        )))
    }

    pub fn images(&self) -> Result<Vec<Image>> {
        list_records(&self.root.join("images"), "image.json")
    }

    pub fn image_manifest(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.image_dir(id).join("manifest");
        std::fs::read(&path).map_err(|e| {
            BuildError::StorageError(format!("Failed to read {}: {}", path.display(), e))
        })
    }

    pub fn image_config(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.image_dir(id).join("config");
        std::fs::read(&path).map_err(|e| {
            BuildError::StorageError(format!("Failed to read {}: {}", path.display(), e))
        })
    }

    /// Remove an image record. Layers are kept for other images to share.
    pub fn delete_image(&self, id: &str) -> Result<()> {
        let image = self.image(id)?;
        if self.containers()?.iter().any(|c| c.image == image.id) {
            return Err(BuildError::InvalidArgument(format!(
                "image {} is in use by a container",
                image.id
            )));
        }
        let dir = self.image_dir(&image.id);
        std::fs::remove_dir_all(&dir).map_err(|e| {
            BuildError::StorageError(format!("Failed to remove image {}: {}", dir.display(), e))
        })
    }

    /// Read-only view of an image's top layer.
    pub fn mount_image(&self, id: &str) -> Result<PathBuf> {
        let image = self.image(id)?;
        match image.top_layer {
            Some(layer) => Ok(self.layer_path(&layer)),
            None => {
                let empty = self.run_root.join("empty");
                std::fs::create_dir_all(&empty)?;
                Ok(empty)
            }
        }
    }

    // ---- containers ----

    /// Create a container with a new read-write layer on top of `image`'s
    /// top layer.
    pub fn create_container(&self, names: &[String], image: Option<&Image>) -> Result<Container> {
        for existing in self.containers()? {
            if let Some(taken) = existing.names.iter().find(|n| names.contains(n)) {
                return Err(BuildError::InvalidArgument(format!(
                    "the container name {:?} is already in use by {}",
                    taken, existing.id
                )));
            }
        }
        let layer = self.create_layer(image.and_then(|i| i.top_layer.as_deref()))?;
        let container = Container {
            id: random_id(),
            names: names.to_vec(),
            image: image.map(|i| i.id.clone()).unwrap_or_default(),
            layer: layer.id,
            created: Utc::now(),
            mount_count: 0,
        };
        let dir = self.container_dir(&container.id);
        std::fs::create_dir_all(dir.join("userdata")).map_err(|e| {
            BuildError::StorageError(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        write_json_atomic(&dir.join("container.json"), &container)?;
        tracing::debug!(container = %container.id, names = ?names, "Created container");
        Ok(container)
    }

    pub fn container(&self, name_or_id: &str) -> Result<Container> {
        let containers = self.containers()?;
        if let Some(c) = containers
            .iter()
            .find(|c| c.id == name_or_id || c.names.iter().any(|n| n == name_or_id))
        {
            return Ok(c.clone());
        }
        let matches: Vec<&Container> = containers
            .iter()
            .filter(|c| name_or_id.len() >= 3 && c.id.starts_with(name_or_id))
            .collect();
        if matches.len() == 1 {
            return Ok(matches[0].clone());
        }
        Err(BuildError::NotFound(format!(
            "container {:?} not known",
            name_or_id
        )))
    }

    pub fn containers(&self) -> Result<Vec<Container>> {
        list_records(&self.root.join("containers"), "container.json")
    }

    /// Per-container working directory.
    pub fn container_directory(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("userdata")
    }

    /// Per-container directory for transient runtime state.
    pub fn container_run_directory(&self, id: &str) -> Result<PathBuf> {
        let dir = self.run_root.join("containers").join(id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            BuildError::StorageError(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        Ok(dir)
    }

    fn save_container(&self, container: &Container) -> Result<()> {
        write_json_atomic(
            &self.container_dir(&container.id).join("container.json"),
            container,
        )
    }

    /// Remove a container and its read-write layer.
    pub fn delete_container(&self, id: &str) -> Result<()> {
        let container = self.container(id)?;
        if self.layer_exists(&container.layer) {
            self.delete_layer(&container.layer)?;
        }
        let run_dir = self.run_root.join("containers").join(&container.id);
        if run_dir.exists() {
            let _ = std::fs::remove_dir_all(&run_dir);
        }
        let dir = self.container_dir(&container.id);
        std::fs::remove_dir_all(&dir).map_err(|e| {
            BuildError::StorageError(format!(
                "Failed to remove container {}: {}",
                dir.display(),
                e
            ))
        })?;
        tracing::debug!(container = %container.id, "Deleted container");
        Ok(())
    }

    /// Mount a container's layer, returning its root filesystem path.
    pub fn mount(&self, id: &str) -> Result<PathBuf> {
        let _guard = self.lock.lock();
        let mut container = self.container(id)?;
        container.mount_count += 1;
        self.save_container(&container)?;
        Ok(self.layer_path(&container.layer))
    }

    /// Drop one mount reference (all of them with `force`). Returns the
    /// remaining count.
    pub fn unmount(&self, id: &str, force: bool) -> Result<u32> {
        let _guard = self.lock.lock();
        let mut container = self.container(id)?;
        container.mount_count = if force {
            0
        } else {
            container.mount_count.saturating_sub(1)
        };
        self.save_container(&container)?;
        Ok(container.mount_count)
    }

    pub fn mounted(&self, id: &str) -> Result<u32> {
        Ok(self.container(id)?.mount_count)
    }
}

fn not_found_as(e: BuildError, message: String) -> BuildError {
    if e.is_not_found() {
        BuildError::NotFound(message)
    } else {
        e
    }
}

fn list_records<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<Vec<T>> {
    let mut records = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(e) => {
            return Err(BuildError::StorageError(format!(
                "Failed to read {}: {}",
                dir.display(),
                e
            )))
        }
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path().join(file)).collect();
    paths.sort();
    for path in paths {
        match read_json::<T>(&path) {
            Ok(record) => records.push(record),
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

/// Whether the last path component of an image name carries a tag.
fn has_tag(name: &str) -> bool {
    let last = name.rsplit('/').next().unwrap_or(name);
    last.contains(':') || name.contains('@')
}

/// `localhost/foo:tag` and `docker.io/library/foo:tag` are also known as
/// `foo:tag`.
fn short_name(name: &str) -> &str {
    match a3s_build_core::registry::registry_domain(name) {
        Some(domain) => {
            let rest = &name[domain.len() + 1..];
            rest.strip_prefix("library/").unwrap_or(rest)
        }
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Store {
        Store::new(&dir.path().join("root"), &dir.path().join("run")).unwrap()
    }

    #[test]
    fn test_chain_id() {
        let base = chain_id(None, "sha256:abcd");
        assert_eq!(base, "abcd");
        let next = chain_id(Some(&base), "sha256:ef01");
        assert_eq!(next, sha256_bytes(b"abcd sha256:ef01"));
    }

    #[test]
    fn test_layer_copy_on_create() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let base = store.create_layer(None).unwrap();
        std::fs::write(store.layer_path(&base.id).join("hello"), "world").unwrap();
        let child = store.create_layer(Some(&base.id)).unwrap();
        assert_eq!(
            std::fs::read_to_string(store.layer_path(&child.id).join("hello")).unwrap(),
            "world"
        );
        let chain = store.layer_chain(Some(&child.id)).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, base.id);
    }

    #[test]
    fn test_missing_layer_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.layer("nope").unwrap_err().is_not_found());
        assert!(store.create_layer(Some("nope")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_apply_diff_and_reuse() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        builder.append_data(&mut header, "etc/motd", &b"hi"[..]).unwrap();
        let data = builder.into_inner().unwrap();
        let diff_id = crate::digest::sha256_digest(&data);

        let layer = store.apply_diff(None, &diff_id, None, data.as_slice()).unwrap();
        assert_eq!(layer.uncompressed_digest.as_deref(), Some(diff_id.as_str()));
        assert!(store.layer_path(&layer.id).join("etc/motd").is_file());

        let again = store.apply_diff(None, &diff_id, None, data.as_slice()).unwrap();
        assert_eq!(again.id, layer.id);
        assert_eq!(store.diff(&layer.id, Vec::new()).unwrap(), data);

        let bad = store.apply_diff(Some(&layer.id), "sha256:0000", None, data.as_slice());
        assert!(matches!(bad, Err(BuildError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_images_by_name_and_prefix() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = sha256_bytes(b"config");
        store
            .create_image(&id, &["localhost/app:latest".to_string()], None, b"{}", b"config")
            .unwrap();
        assert_eq!(store.image("localhost/app:latest").unwrap().id, id);
        assert_eq!(store.image("app").unwrap().id, id);
        assert_eq!(store.image(&id[..8]).unwrap().id, id);
        assert_eq!(store.image_config(&id).unwrap(), b"config");
        assert!(store.image("other").unwrap_err().is_not_found());

        let second = sha256_bytes(b"config2");
        store
            .create_image(&second, &["localhost/app:latest".to_string()], None, b"{}", b"config2")
            .unwrap();
        assert_eq!(store.image("app").unwrap().id, second);
        assert!(store.image(&id).unwrap().names.is_empty());
    }

    #[test]
    fn test_container_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let container = store
            .create_container(&["work".to_string()], None)
            .unwrap();
        assert!(store
            .create_container(&["work".to_string()], None)
            .is_err());
        let mountpoint = store.mount("work").unwrap();
        assert!(mountpoint.is_dir());
        assert_eq!(store.mounted(&container.id).unwrap(), 1);
        assert_eq!(store.unmount(&container.id, false).unwrap(), 0);
        assert!(store.container_directory(&container.id).is_dir());
        store.delete_container("work").unwrap();
        assert!(store.container("work").unwrap_err().is_not_found());
        assert!(!store.layer_exists(&container.layer));
    }
}
