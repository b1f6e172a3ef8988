//! Working containers.
//!
//! A [`Builder`] is the persistent record of one in-progress image build:
//! where it came from, the image configuration being assembled, the ID
//! mappings of its filesystem and any layers waiting to be added at commit
//! time. It is saved to the container's directory in the store after every
//! change. Builders for the same container are not synchronized with each
//! other; callers serialize access.

mod config;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::IdMappings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::define::{
    Isolation, ManifestType, NamespaceOption, NetworkPolicy, CONTAINER_TYPE, PACKAGE, STATE_FILE,
};
use crate::image::oci::{OciManifest, ANNOTATION_BASE_DIGEST, ANNOTATION_BASE_NAME};
use crate::image::{History, ImageConfig};
use crate::store::layout::{import_image, parse_layout_reference, OciLayout};
use crate::store::{self, Container, Image, Store};

/// Image name meaning "no base image".
pub const SCRATCH: &str = "scratch";

/// A layer supplied from outside the store: a blob file or a directory
/// whose contents become the layer. History-only entries have no blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedLayer {
    history: History,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blob_path: Option<PathBuf>,
}

impl LinkedLayer {
    pub fn new(
        created: Option<DateTime<Utc>>,
        created_by: &str,
        author: &str,
        comment: &str,
        blob_path: Option<PathBuf>,
    ) -> Self {
        Self {
            history: History {
                created,
                created_by: created_by.to_string(),
                author: author.to_string(),
                comment: comment.to_string(),
                empty_layer: blob_path.is_none(),
            },
            blob_path,
        }
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn blob_path(&self) -> Option<&Path> {
        self.blob_path.as_deref()
    }

    /// Re-establish the empty-layer flag after reading untrusted state.
    fn fixup(&mut self) {
        self.history.empty_layer = self.blob_path.is_none();
    }
}

/// Options for [`Builder::new`].
#[derive(Debug, Clone, Default)]
pub struct BuilderOptions {
    /// Store image name or ID, `oci:<dir>[:<tag>]`, or `scratch`
    pub from_image: String,
    /// Exact container name; taken names are an error
    pub container: Option<String>,
    /// Replaces `working-container` in generated names
    pub container_suffix: Option<String>,
    pub isolation: Isolation,
    pub namespace_options: Vec<NamespaceOption>,
    pub network_policy: NetworkPolicy,
    pub id_mappings: IdMappings,
    pub capabilities: Vec<String>,
    pub devices: Vec<String>,
    pub group_add: Vec<String>,
    pub format: ManifestType,
    pub args: BTreeMap<String, String>,
    /// Environment added unless the image already sets the variable
    pub default_env: Vec<String>,
    /// Keep the base image's base-name/base-digest annotations
    pub preserve_base_image_annotations: bool,
    pub mount: bool,
}

/// Persistent state of a working container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Builder {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "image", default)]
    pub from_image: String,
    #[serde(rename = "image-id", default)]
    pub from_image_id: String,
    #[serde(rename = "image-digest", default)]
    pub from_image_digest: String,
    #[serde(rename = "container-name")]
    pub container: String,
    #[serde(rename = "container-id")]
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,
    #[serde(rename = "annotations", default)]
    pub image_annotations: BTreeMap<String, String>,
    #[serde(rename = "created-by", default)]
    pub image_created_by: String,
    #[serde(rename = "history-comment", default)]
    pub image_history_comment: String,
    pub config: ImageConfig,
    #[serde(default)]
    pub format: ManifestType,
    #[serde(default)]
    pub isolation: Isolation,
    #[serde(default)]
    pub namespace_options: Vec<NamespaceOption>,
    #[serde(default)]
    pub network_policy: NetworkPolicy,
    #[serde(default)]
    pub id_mappings: IdMappings,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub group_add: Vec<String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub prepended_empty_layers: Vec<History>,
    #[serde(default)]
    pub appended_empty_layers: Vec<History>,
    #[serde(default)]
    pub prepended_linked_layers: Vec<LinkedLayer>,
    #[serde(default)]
    pub appended_linked_layers: Vec<LinkedLayer>,
    /// Top layer of the base image
    #[serde(default)]
    pub top_layer: String,
    /// `type:digest` of the most recent ADD/COPY
    #[serde(skip)]
    pub content_summary: Option<String>,
}

impl Builder {
    /// Create a working container from an image (or from nothing).
    pub fn new(store: &Store, options: BuilderOptions) -> Result<Self> {
        let from = if options.from_image == SCRATCH {
            String::new()
        } else {
            options.from_image.clone()
        };
        let image = if from.is_empty() {
            None
        } else {
            Some(resolve_base_image(store, &from)?)
        };
        let image_spec = match &image {
            Some(image) => image_name(&image_name_prefix(&from), image),
            None => String::new(),
        };

        let base = match (&options.container, &options.container_suffix) {
            (Some(name), _) => name.clone(),
            (None, suffix) => {
                let suffix = suffix.clone().unwrap_or_else(|| "working-container".to_string());
                if image_spec.is_empty() {
                    suffix
                } else {
                    format!("{}-{}", image_name_prefix(&image_spec), suffix)
                }
            }
        };
        let name = if options.container.is_some() {
            base
        } else {
            find_unused_container(&base, &store.containers()?)
        };
        let container = store.create_container(&[name.clone()], image.as_ref())?;

        match Self::init(store, &options, image.as_ref(), &image_spec, &container) {
            Ok(builder) => Ok(builder),
            Err(e) => {
                if let Err(e2) = store.delete_container(&container.id) {
                    tracing::error!(container = %container.id, error = %e2, "Failed to delete container");
                }
                Err(e)
            }
        }
    }

    fn init(
        store: &Store,
        options: &BuilderOptions,
        image: Option<&Image>,
        image_spec: &str,
        container: &Container,
    ) -> Result<Self> {
        let mut builder = Builder {
            kind: CONTAINER_TYPE.to_string(),
            from_image: image_spec.to_string(),
            from_image_id: image.map(|i| i.id.clone()).unwrap_or_default(),
            from_image_digest: image.map(|i| i.digest.clone()).unwrap_or_default(),
            container: container.names.first().cloned().unwrap_or_default(),
            container_id: container.id.clone(),
            mount_point: None,
            image_annotations: BTreeMap::new(),
            image_created_by: String::new(),
            image_history_comment: String::new(),
            config: ImageConfig::default(),
            format: options.format,
            isolation: options.isolation,
            namespace_options: options.namespace_options.clone(),
            network_policy: options.network_policy,
            id_mappings: options.id_mappings.clone(),
            capabilities: options.capabilities.clone(),
            devices: options.devices.clone(),
            group_add: options.group_add.clone(),
            args: options.args.clone(),
            prepended_empty_layers: Vec::new(),
            appended_empty_layers: Vec::new(),
            prepended_linked_layers: Vec::new(),
            appended_linked_layers: Vec::new(),
            top_layer: image.and_then(|i| i.top_layer.clone()).unwrap_or_default(),
            content_summary: None,
        };
        builder.init_config(store, image)?;
        for entry in &options.default_env {
            if let Some((key, value)) = entry.split_once('=') {
                if builder.config.env_value(key).is_none() {
                    builder.set_env(key, value);
                }
            }
        }
        if !options.preserve_base_image_annotations {
            let digest = builder.from_image_digest.clone();
            builder.set_annotation(ANNOTATION_BASE_DIGEST, &digest);
            if a3s_build_core::registry::registry_domain(image_spec).is_some() {
                builder.set_annotation(ANNOTATION_BASE_NAME, image_spec);
            } else {
                builder.unset_annotation(ANNOTATION_BASE_NAME);
            }
        }
        if options.mount {
            builder.mount(store)?;
        }
        builder.save(store)?;
        tracing::info!(container = %builder.container, image = %builder.from_image, "Created working container");
        Ok(builder)
    }

    fn init_config(&mut self, store: &Store, image: Option<&Image>) -> Result<()> {
        match image {
            Some(image) => {
                let raw = store.image_config(&image.id)?;
                self.config = ImageConfig::from_json(&raw)?;
                let manifest = store.image_manifest(&image.id)?;
                if let Ok(oci) = serde_json::from_slice::<OciManifest>(&manifest) {
                    if oci.media_type != crate::define::DOCKER_MANIFEST_MEDIA_TYPE {
                        self.image_annotations.extend(oci.annotations);
                    }
                }
            }
            None => {
                self.config = ImageConfig::default();
                self.config.config.working_dir = "/".to_string();
            }
        }
        self.fixup_config();
        Ok(())
    }

    fn fixup_config(&mut self) {
        if self.config.created.is_none() {
            self.config.created = Some(Utc::now());
        }
        let host = ImageConfig::for_host();
        if self.config.os.is_empty() {
            self.config.os = host.os;
        }
        if self.config.architecture.is_empty() {
            self.config.architecture = host.architecture;
        }
        if self.format == ManifestType::Docker && self.config.config.hostname.is_empty() {
            self.config.config.hostname = store::random_id()[..12].to_string();
        }
        for layer in self
            .prepended_linked_layers
            .iter_mut()
            .chain(self.appended_linked_layers.iter_mut())
        {
            layer.fixup();
        }
    }

    /// Rebuild state for a store container that has no state file.
    pub fn import(store: &Store, container: &str) -> Result<Self> {
        let container = store.container(container)?;
        let state_path = store.container_directory(&container.id).join(STATE_FILE);
        if state_path.exists() {
            return Self::open(store, &container.id);
        }
        let image = if container.image.is_empty() {
            None
        } else {
            Some(store.image(&container.image)?)
        };
        let image_spec = image
            .as_ref()
            .and_then(|i| i.names.first().cloned())
            .unwrap_or_default();
        let options = BuilderOptions::default();
        let builder = Self::init(store, &options, image.as_ref(), &image_spec, &container)?;
        tracing::info!(container = %builder.container_id, "Imported container");
        Ok(builder)
    }

    /// Load the state of a working container by name or ID.
    pub fn open(store: &Store, container: &str) -> Result<Self> {
        let container = store.container(container)?;
        let path = store.container_directory(&container.id).join(STATE_FILE);
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BuildError::NotFound(format!(
                    "container {:?} has no {} state at {}",
                    container.id,
                    PACKAGE,
                    path.display()
                ))
            } else {
                BuildError::StorageError(format!("Failed to read {}: {}", path.display(), e))
            }
        })?;
        let mut builder = parse_state(&data, &path)?;
        if builder.kind != CONTAINER_TYPE {
            return Err(BuildError::InvalidArgument(format!(
                "container {:?} is not a {} container (is a {:?} container)",
                container.id, PACKAGE, builder.kind
            )));
        }
        builder.fixup_config();
        Ok(builder)
    }

    /// Every working container in the store. Containers whose state was
    /// written by something else are skipped.
    pub fn open_all(store: &Store) -> Result<Vec<Self>> {
        let mut builders = Vec::new();
        for container in store.containers()? {
            let path = store.container_directory(&container.id).join(STATE_FILE);
            let data = match std::fs::read(&path) {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(container = %container.id, "No state file, ignoring container");
                    continue;
                }
                Err(e) => {
                    return Err(BuildError::StorageError(format!(
                        "Failed to read {}: {}",
                        path.display(),
                        e
                    )))
                }
            };
            match parse_state(&data, &path) {
                Ok(mut b) if b.kind == CONTAINER_TYPE => {
                    b.fixup_config();
                    builders.push(b);
                }
                Ok(b) => {
                    tracing::debug!(container = %container.id, kind = %b.kind, "Not our container, ignoring");
                }
                Err(e) => {
                    tracing::debug!(container = %container.id, error = %e, "Unparseable state, ignoring");
                }
            }
        }
        Ok(builders)
    }

    /// The working container currently mounted at `path`.
    pub fn open_by_path(store: &Store, path: &Path) -> Result<Self> {
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let abs = crate::copier::clean_path(&abs);
        Self::open_all(store)?
            .into_iter()
            .find(|b| b.mount_point.as_deref() == Some(abs.as_path()))
            .ok_or_else(|| {
                BuildError::NotFound(format!(
                    "no working container is mounted at {}",
                    abs.display()
                ))
            })
    }

    /// Atomically write the state file.
    pub fn save(&self, store: &Store) -> Result<()> {
        let path = store.container_directory(&self.container_id).join(STATE_FILE);
        store::write_json_atomic(&path, self).map_err(|e| {
            BuildError::StorageError(format!(
                "saving builder state to {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Remove the working container and everything it owns.
    pub fn delete(self, store: &Store) -> Result<()> {
        store.delete_container(&self.container_id)?;
        tracing::info!(container = %self.container, "Removed working container");
        Ok(())
    }

    /// Mount the container's root filesystem, recording the mount point.
    pub fn mount(&mut self, store: &Store) -> Result<PathBuf> {
        let path = store.mount(&self.container_id)?;
        self.mount_point = Some(path.clone());
        self.save(store)?;
        Ok(path)
    }

    pub fn unmount(&mut self, store: &Store) -> Result<()> {
        if store.unmount(&self.container_id, false)? == 0 {
            self.mount_point = None;
        }
        self.save(store)
    }

    /// The root filesystem, mounting it if needed.
    pub fn rootfs(&mut self, store: &Store) -> Result<PathBuf> {
        match &self.mount_point {
            Some(path) if path.is_dir() => Ok(path.clone()),
            _ => self.mount(store),
        }
    }

    /// The container's read-write layer.
    pub fn layer(&self, store: &Store) -> Result<String> {
        Ok(store.container(&self.container_id)?.layer)
    }

    /// Per-container working directory.
    pub fn container_directory(&self, store: &Store) -> PathBuf {
        store.container_directory(&self.container_id)
    }

    /// Full history: the image's, then pending empty layers.
    pub fn history(&self) -> Vec<History> {
        let mut history = self.config.history.clone();
        history.extend(self.prepended_empty_layers.iter().cloned());
        history.extend(self.appended_empty_layers.iter().cloned());
        history
    }
}

fn parse_state(data: &[u8], path: &Path) -> Result<Builder> {
    serde_json::from_slice(data).map_err(|e| {
        BuildError::SerializationError(format!("parsing builder state read from {}: {}", path.display(), e))
    })
}

fn resolve_base_image(store: &Store, from: &str) -> Result<Image> {
    if let Some((dir, tag)) = parse_layout_reference(from) {
        let layout = OciLayout::open(&dir)?;
        return import_image(store, &layout, tag.as_deref(), &[]);
    }
    store.image(from).map_err(|e| {
        if e.is_not_found() {
            BuildError::NotFound(format!(
                "image {:?} not known; import it with oci:<path> first",
                from
            ))
        } else {
            e
        }
    })
}

/// The name an image is best known by, preferring one that contains
/// what the user typed.
fn image_name(prefix: &str, image: &Image) -> String {
    image
        .names
        .iter()
        .find(|n| n.contains(prefix))
        .or_else(|| image.names.first())
        .cloned()
        .unwrap_or_else(|| prefix.to_string())
}

/// Short form of an image reference used to name containers.
pub fn image_name_prefix(image: &str) -> String {
    let mut prefix = image;
    if let Some(rest) = prefix.strip_prefix("sha256:") {
        let end = rest.char_indices().nth(12).map_or(rest.len(), |(i, _)| i);
        prefix = &rest[..end];
    }
    if prefix.len() == 64 && prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        prefix = &prefix[..12];
    }
    if let Some(rest) = prefix.strip_prefix("oci:") {
        prefix = rest;
        if let Some((dir, _)) = prefix.rsplit_once(':') {
            prefix = dir;
        }
        prefix = prefix.trim_end_matches('/');
    } else {
        prefix = prefix.split(':').next().unwrap_or(prefix);
    }
    prefix = prefix.rsplit('/').next().unwrap_or(prefix);
    prefix = prefix.split('@').next().unwrap_or(prefix);
    prefix.to_string()
}

fn find_unused_container(name: &str, containers: &[Container]) -> String {
    let taken = |n: &str| containers.iter().any(|c| c.names.iter().any(|x| x == n));
    let mut candidate = name.to_string();
    let mut suffix = 1;
    while taken(&candidate) {
        candidate = format!("{}-{}", name, suffix);
        suffix += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Store {
        Store::new(&dir.path().join("root"), &dir.path().join("run")).unwrap()
    }

    #[test]
    fn test_image_name_prefix() {
        assert_eq!(image_name_prefix("docker.io/library/alpine:3.19"), "alpine");
        assert_eq!(image_name_prefix("localhost:5000/app@sha256:abc"), "localhost");
        assert_eq!(image_name_prefix("quay.io/team/app@sha256:abc"), "app");
        assert_eq!(image_name_prefix(&format!("sha256:{}", "a".repeat(64))), "aaaaaaaaaaaa");
        assert_eq!(image_name_prefix("oci:/tmp/images/base:v1"), "base");
        assert_eq!(image_name_prefix("sha256:ééééééééééééééé"), "é".repeat(12));
        assert_eq!(image_name_prefix("sha256:ab"), "ab");
    }

    #[test]
    fn test_linked_layer_invariant() {
        let empty = LinkedLayer::new(None, "ENV", "", "", None);
        assert!(empty.history().empty_layer);
        let full = LinkedLayer::new(None, "COPY", "", "", Some(PathBuf::from("/tmp/blob")));
        assert!(!full.history().empty_layer);

        let mut tampered: LinkedLayer = serde_json::from_str(
            r#"{"history":{"created_by":"x","empty_layer":true},"blob_path":"/b"}"#,
        )
        .unwrap();
        tampered.fixup();
        assert!(!tampered.history().empty_layer);
    }

    #[test]
    fn test_scratch_builder_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let builder = Builder::new(
            &store,
            BuilderOptions {
                from_image: SCRATCH.to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(builder.container, "working-container");
        assert_eq!(builder.config.config.working_dir, "/");
        assert!(builder.config.created.is_some());
        assert!(!builder.config.os.is_empty());

        let second = Builder::new(&store, BuilderOptions::default()).unwrap();
        assert_eq!(second.container, "working-container-1");

        let reopened = Builder::open(&store, "working-container").unwrap();
        assert_eq!(reopened.container_id, builder.container_id);
        assert_eq!(Builder::open_all(&store).unwrap().len(), 2);

        builder.delete(&store).unwrap();
        assert!(Builder::open(&store, "working-container").is_err());
        assert_eq!(Builder::open_all(&store).unwrap().len(), 1);
    }

    #[test]
    fn test_foreign_state_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let builder = Builder::new(&store, BuilderOptions::default()).unwrap();
        let path = store.container_directory(&builder.container_id).join(STATE_FILE);
        let mut state: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        state["type"] = serde_json::Value::String("other 1.0".to_string());
        std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

        let err = Builder::open(&store, &builder.container_id).unwrap_err();
        assert!(err.to_string().contains("is not a a3s-build container"));
        assert!(Builder::open_all(&store).unwrap().is_empty());
    }

    #[test]
    fn test_mount_and_open_by_path() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut builder = Builder::new(
            &store,
            BuilderOptions {
                container: Some("named".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        let mountpoint = builder.mount(&store).unwrap();
        let found = Builder::open_by_path(&store, &mountpoint).unwrap();
        assert_eq!(found.container, "named");
        builder.unmount(&store).unwrap();
        assert!(Builder::open_by_path(&store, &mountpoint).is_err());

        assert!(Builder::new(
            &store,
            BuilderOptions {
                container: Some("named".to_string()),
                ..Default::default()
            },
        )
        .is_err());
    }

    #[test]
    fn test_import_container_without_state() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let container = store.create_container(&["bare".to_string()], None).unwrap();
        let builder = Builder::import(&store, "bare").unwrap();
        assert_eq!(builder.container_id, container.id);
        assert!(Builder::open(&store, "bare").is_ok());
    }

    #[test]
    fn test_missing_base_image() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = Builder::new(
            &store,
            BuilderOptions {
                from_image: "nosuchimage".to_string(),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.containers().unwrap().is_empty());
    }
}
