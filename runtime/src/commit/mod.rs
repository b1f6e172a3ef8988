//! Committing a working container to an image.
//!
//! The layers of the new image are, in order: the prepended linked
//! layers, the base image's layers (unless squashing), the working
//! container's changes, a layer of extra content when requested, and the
//! appended linked layers. Base layers whose diff digest the store
//! already knows are reused without being read again. Everything else is
//! diffed, filtered, optionally gzipped and hashed into a blob file, then
//! handed to the destination: the local store or an OCI layout directory.

mod confidential;
mod layers;
mod manifest;

pub use confidential::{ConfidentialWorkloadOptions, TeeType};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::registry::registry_domain;
use a3s_build_core::{IdMappings, RegistrySources};
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::archive::{decompress, Compression};
use crate::builder::{Builder, LinkedLayer};
use crate::define::ManifestType;
use crate::digest::{encoded, sha256_digest, SHA256_PREFIX};
use crate::image::changes::apply_changes;
use crate::image::History;
use crate::retry::{retry_if_necessary, RetryOptions};
use crate::run::read_exclusions;
use crate::store::layout::{parse_layout_reference, OciLayout};
use crate::store::{chain_id, Store};
use crate::tarfilter::Chain;

use layers::{
    inspect_blob, materialize_store_layer, open_uncompressed, root_owned, seconds,
    stage_extra_content, unmap_owners, write_layer_blob, write_tree, BlobSource, CommitLayer,
    Exclusions, LayerBlob, Timestamps,
};
use manifest::{manifest_builder, oci_annotations, HistoryPlan, ManifestBuilder};

/// Options for [`Builder::commit`].
#[derive(Debug, Clone)]
pub struct CommitOptions {
    /// Image format; the builder's own format when unset
    pub preferred_manifest_type: Option<ManifestType>,
    /// Layer compression: uncompressed or gzip
    pub compression: Compression,
    /// Collapse the base image's layers and the changes into one layer
    pub squash: bool,
    /// Leave all history out of the image
    pub omit_history: bool,
    /// Add no history entry for the working layer
    pub omit_layer_history_entry: bool,
    /// Record the working layer in history only
    pub empty_layer: bool,
    /// Creation time of the image and of its layer contents
    pub history_timestamp: Option<DateTime<Utc>>,
    /// Creation time of the image
    pub source_date_epoch: Option<DateTime<Utc>>,
    /// Clamp layer content newer than `source_date_epoch` to it
    pub rewrite_timestamp: bool,
    /// Use the epoch as every timestamp
    pub omit_timestamp: bool,
    /// `key=value` manifest annotations (OCI only)
    pub annotations: Vec<String>,
    pub unset_annotations: Vec<String>,
    /// Record the creation time as a manifest annotation (OCI only)
    pub created_annotation: bool,
    /// Environment variables removed from the image
    pub unset_envs: Vec<String>,
    /// Dockerfile-style instructions applied to the config
    pub override_changes: Vec<String>,
    /// Image path to host file or directory, added as an extra layer
    pub extra_image_content: BTreeMap<String, PathBuf>,
    pub prepended_linked_layers: Vec<LinkedLayer>,
    pub appended_linked_layers: Vec<LinkedLayer>,
    /// Record the base image as `parent` (Docker only)
    pub compat_set_parent: bool,
    /// Leave root-owned /dev, /proc and /sys entries out of the layer
    pub compat_layer_omissions: bool,
    /// Keep layer blobs here instead of a temporary directory
    pub blob_directory: Option<PathBuf>,
    pub confidential_workload: Option<ConfidentialWorkloadOptions>,
    /// Receives `sha256:<image id>`
    pub iid_file: Option<PathBuf>,
    pub retry: RetryOptions,
    /// Registry policy; read from the environment when unset
    pub registry_sources: Option<RegistrySources>,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            preferred_manifest_type: None,
            compression: Compression::Uncompressed,
            squash: false,
            omit_history: false,
            omit_layer_history_entry: false,
            empty_layer: false,
            history_timestamp: None,
            source_date_epoch: None,
            rewrite_timestamp: false,
            omit_timestamp: false,
            annotations: Vec::new(),
            unset_annotations: Vec::new(),
            created_annotation: true,
            unset_envs: Vec::new(),
            override_changes: Vec::new(),
            extra_image_content: BTreeMap::new(),
            prepended_linked_layers: Vec::new(),
            appended_linked_layers: Vec::new(),
            compat_set_parent: false,
            compat_layer_omissions: false,
            blob_directory: None,
            confidential_workload: None,
            iid_file: None,
            retry: RetryOptions::default(),
            registry_sources: None,
        }
    }
}

/// What a commit produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitResult {
    /// Hex digest of the config blob
    pub image_id: String,
    /// The name the image can be found by, if it got one
    pub reference: Option<String>,
    pub manifest_digest: String,
}

/// Where a commit writes the image.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitDestination {
    /// The local store, under a name (or none)
    Store(Option<String>),
    /// An OCI image layout directory
    Layout { dir: PathBuf, tag: Option<String> },
}

impl CommitDestination {
    /// `oci:<dir>[:<tag>]` for a layout, anything else names a store image.
    pub fn parse(destination: &str) -> Result<Self> {
        if let Some((dir, tag)) = parse_layout_reference(destination) {
            if dir.as_os_str().is_empty() {
                return Err(BuildError::InvalidArgument(format!(
                    "no directory in {:?}",
                    destination
                )));
            }
            return Ok(CommitDestination::Layout { dir, tag });
        }
        if destination.is_empty() {
            return Ok(CommitDestination::Store(None));
        }
        if destination.chars().any(|c| c.is_whitespace()) || destination.starts_with('/') {
            return Err(BuildError::InvalidArgument(format!(
                "invalid image name {:?}",
                destination
            )));
        }
        Ok(CommitDestination::Store(Some(normalize_name(destination))))
    }
}

/// `name` with `:latest` added when it carries no tag or digest.
fn normalize_name(name: &str) -> String {
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') || last.contains('@') {
        name.to_string()
    } else {
        format!("{}:latest", name)
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default()
}

/// Layers made or found on disk for this commit.
struct LayerSet<'a> {
    blob_dir: &'a Path,
    compression: Compression,
    timestamps: Timestamps,
    builder: Box<dyn ManifestBuilder>,
    layers: Vec<CommitLayer>,
}

impl LayerSet<'_> {
    fn push_blob(&mut self, what: &str, blob: LayerBlob) -> Result<()> {
        let media_type = self.builder.layer_media_type(what, blob.compression)?;
        self.push(CommitLayer {
            what: what.to_string(),
            media_type,
            digest: blob.digest,
            size: blob.size,
            diff_id: blob.diff_id,
            source: BlobSource::File(blob.path),
        });
        Ok(())
    }

    fn push(&mut self, layer: CommitLayer) {
        tracing::debug!(
            what = %layer.what,
            digest = %layer.digest,
            diff_id = %layer.diff_id,
            media_type = layer.media_type,
            "Adding layer"
        );
        self.builder
            .add_layer(layer.media_type, &layer.digest, layer.size, &layer.diff_id);
        self.layers.push(layer);
    }

    /// A chain with the commit's timestamp handling and `extra` first.
    fn chain(&self, extra: Chain) -> Option<Chain> {
        let mut chain = extra;
        if let Some(t) = self.timestamps.transform() {
            chain.push(t);
        }
        if chain.is_empty() {
            None
        } else {
            Some(chain)
        }
    }

    fn add_linked(&mut self, layer: &LinkedLayer, id_mappings: &IdMappings) -> Result<()> {
        let path = match layer.blob_path() {
            Some(p) => p,
            None => return Ok(()),
        };
        let what = format!("linked layer {}", path.display());
        if path.is_dir() {
            let mut extra = Chain::new();
            if let Some(t) = unmap_owners(id_mappings.clone()) {
                extra.push(t);
            }
            let chain = self.chain(extra);
            let blob = write_layer_blob(self.blob_dir, &what, self.compression, chain, |w| {
                write_tree(path, w)
            })?;
            return self.push_blob(&what, blob);
        }
        let (digest, size, diff_id, compression) = inspect_blob(path)?;
        match compression {
            Compression::Uncompressed | Compression::Gzip => {
                let media_type = self.builder.layer_media_type(&what, compression)?;
                self.push(CommitLayer {
                    what,
                    media_type,
                    digest,
                    size,
                    diff_id,
                    source: BlobSource::File(path.to_path_buf()),
                });
                Ok(())
            }
            _ => {
                let blob = write_layer_blob(self.blob_dir, &what, self.compression, None, |w| {
                    let file = std::fs::File::open(path)?;
                    let (_, mut stream) = decompress(file)?;
                    std::io::copy(&mut stream, w)?;
                    Ok(())
                })?;
                self.push_blob(&what, blob)
            }
        }
    }
}

impl Builder {
    /// Write the working container out as an image at `destination`
    /// (`oci:<dir>[:<tag>]`, a store image name, or empty for an unnamed
    /// store image).
    pub async fn commit(
        &self,
        store: &Store,
        destination: &str,
        options: CommitOptions,
    ) -> Result<CommitResult> {
        if options.omit_timestamp && options.history_timestamp.is_some() {
            return Err(BuildError::InvalidArgument(
                "omitting the timestamp and setting a history timestamp are mutually exclusive"
                    .to_string(),
            ));
        }
        match options.compression {
            Compression::Uncompressed | Compression::Gzip => {}
            other => {
                return Err(BuildError::InvalidArgument(format!(
                    "{} compression is not supported for image layers",
                    other.name()
                )))
            }
        }
        let target = CommitDestination::parse(destination)?;
        if let CommitDestination::Store(Some(name)) = &target {
            if let Some(domain) = registry_domain(name) {
                let sources = match &options.registry_sources {
                    Some(s) => Some(s.clone()),
                    None => RegistrySources::from_env()?,
                };
                if let Some(sources) = sources {
                    sources.check(domain)?;
                }
            }
        }

        let created = if options.omit_timestamp {
            epoch()
        } else {
            options
                .history_timestamp
                .or(options.source_date_epoch)
                .unwrap_or_else(Utc::now)
        };
        let timestamps = if options.omit_timestamp || options.history_timestamp.is_some() {
            Timestamps::Exact(seconds(&created))
        } else if let (Some(sde), true) = (options.source_date_epoch, options.rewrite_timestamp) {
            Timestamps::Clamp(seconds(&sde))
        } else {
            Timestamps::Keep
        };
        let format = options.preferred_manifest_type.unwrap_or(self.format);
        let confidential = options.confidential_workload.as_ref();
        let collapse = options.squash || confidential.is_some();
        // A squashed or confidential image always carries the working layer
        // and its history entry.
        let omit_layer_entry = options.omit_layer_history_entry && !collapse;
        let empty_layer = (options.empty_layer || options.omit_layer_history_entry) && !collapse;

        let mut config = self.config.clone();
        for key in &options.unset_envs {
            config.config.env.retain(|e| e.split('=').next() != Some(key.as_str()));
        }
        apply_changes(&mut config, &options.override_changes)?;
        if confidential.is_some() {
            confidential::force_config(&mut config);
        }
        config.created = Some(created);
        let omit_history = options.omit_history
            || (!config.diff_ids.is_empty() && config.history.is_empty());
        if collapse {
            config.history.clear();
        }

        let annotations = match format {
            ManifestType::Oci => oci_annotations(
                &self.image_annotations,
                &options.annotations,
                &options.unset_annotations,
                options.created_annotation.then_some(&created),
            )?,
            ManifestType::Docker => BTreeMap::new(),
        };
        let parent = if options.compat_set_parent && !self.from_image_id.is_empty() {
            Some(format!("{}{}", SHA256_PREFIX, self.from_image_id))
        } else {
            None
        };
        let builder = manifest_builder(
            format,
            config,
            annotations,
            &self.container_id,
            parent.as_deref(),
        );

        let container = store.container(&self.container_id)?;
        let container_dir = self.container_directory(store);
        let work = TempDir::with_prefix_in("commit-", &container_dir).map_err(|e| {
            BuildError::CommitError(format!(
                "creating commit directory in {}: {}",
                container_dir.display(),
                e
            ))
        })?;
        let blob_dir = match &options.blob_directory {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => work.path().to_path_buf(),
        };
        let mut set = LayerSet {
            blob_dir: &blob_dir,
            compression: options.compression,
            timestamps,
            builder,
            layers: Vec::new(),
        };

        let prepended: Vec<LinkedLayer> = self
            .prepended_linked_layers
            .iter()
            .chain(&options.prepended_linked_layers)
            .cloned()
            .collect();
        let appended: Vec<LinkedLayer> = self
            .appended_linked_layers
            .iter()
            .chain(&options.appended_linked_layers)
            .cloned()
            .collect();

        for layer in &prepended {
            set.add_linked(layer, &self.id_mappings)?;
        }

        let ancestry = if collapse {
            vec![store.layer(&container.layer)?]
        } else {
            store.layer_chain(Some(&container.layer))?
        };
        let rootfs = store.layer_path(&container.layer);
        for layer in ancestry {
            if layer.id != container.layer {
                if let (Some(digest), Some(size)) = (&layer.uncompressed_digest, layer.uncompressed_size) {
                    let what = format!("layer {}", layer.id);
                    let media_type = set.builder.layer_media_type(&what, Compression::Uncompressed)?;
                    set.push(CommitLayer {
                        what,
                        media_type,
                        digest: digest.clone(),
                        size,
                        diff_id: digest.clone(),
                        source: BlobSource::StoreLayer(layer.id.clone()),
                    });
                } else {
                    let what = format!("layer {}", layer.id);
                    let blob = write_layer_blob(&blob_dir, &what, options.compression, None, |w| {
                        store.diff(&layer.id, w).map(|_| ())
                    })?;
                    set.push_blob(&what, blob)?;
                }
                continue;
            }
            if empty_layer {
                continue;
            }

            if let Some(cw) = confidential {
                let staging = work.path().join("confidential");
                std::fs::create_dir_all(&staging)?;
                confidential::stage(&rootfs, &staging, &self.container, cw).await?;
                let chain = set.chain(Chain::new().with(root_owned));
                let blob = write_layer_blob(&blob_dir, "container", options.compression, chain, |w| {
                    write_tree(&staging, w)
                })?;
                set.push_blob("container", blob)?;
                continue;
            }

            let (created_targets, pulled_up) = read_exclusions(&container_dir)?;
            let base = match (&layer.parent, options.squash) {
                (Some(parent), false) => Some(store.layer_path(parent)),
                _ => None,
            };
            let exclusions = Exclusions::new(
                created_targets,
                &pulled_up,
                base.as_deref(),
                options.compat_layer_omissions,
                &self.id_mappings,
            )?;
            let mut extra = Chain::new();
            if !exclusions.is_empty() {
                extra.push(exclusions.transform());
            }
            if let Some(t) = unmap_owners(self.id_mappings.clone()) {
                extra.push(t);
            }
            let chain = set.chain(extra);
            let what = if options.squash {
                "container".to_string()
            } else {
                format!("layer {}", layer.id)
            };
            let blob = write_layer_blob(&blob_dir, &what, options.compression, chain, |w| {
                if options.squash {
                    write_tree(&rootfs, w)
                } else {
                    store.diff(&layer.id, w).map(|_| ())
                }
            })?;
            set.push_blob(&what, blob)?;
        }

        let mut extra_content = None;
        if !options.extra_image_content.is_empty() {
            let staging = work.path().join("extra-content");
            std::fs::create_dir_all(&staging)?;
            stage_extra_content(&staging, &options.extra_image_content)?;
            let mut chain = Chain::new().with(root_owned);
            if let Some(t) = Timestamps::Exact(seconds(&created)).transform() {
                chain.push(t);
            }
            let blob = write_layer_blob(&blob_dir, "extra content", options.compression, Some(chain), |w| {
                write_tree(&staging, w)
            })?;
            extra_content = Some(blob.diff_id.clone());
            set.push_blob("extra content", blob)?;
        }

        for layer in &appended {
            set.add_linked(layer, &self.id_mappings)?;
        }

        if omit_history {
            set.builder.omit_history();
        } else {
            let from_comment = if !self.from_image.is_empty()
                && !self.from_image_id.starts_with(&self.from_image)
            {
                Some(format!("FROM {}", self.from_image))
            } else {
                None
            };
            let plan = HistoryPlan {
                prepended_empty: self.prepended_empty_layers.clone(),
                prepended_linked: prepended.clone(),
                layer: (!omit_layer_entry).then(|| History {
                    created: Some(created),
                    created_by: self.image_created_by.clone(),
                    author: String::new(),
                    comment: self.image_history_comment.clone(),
                    empty_layer,
                }),
                extra_content,
                appended_empty: self.appended_empty_layers.clone(),
                appended_linked: appended.clone(),
                from_comment,
                created: Some(created),
            };
            set.builder.build_history(&plan)?;
        }

        let (manifest, config) = set.builder.manifest_and_config()?;
        tracing::debug!(manifest = %String::from_utf8_lossy(&manifest), "Built manifest");
        tracing::debug!(config = %String::from_utf8_lossy(&config), "Built config");
        let manifest_media_type = set.builder.manifest_media_type();
        let image_id = encoded(&sha256_digest(&config)).to_string();
        let layers = std::mem::take(&mut set.layers);

        let written = retry_if_necessary("writing image", options.retry, || {
            write_image(
                store,
                &target,
                &layers,
                &image_id,
                manifest_media_type,
                &manifest,
                &config,
                work.path(),
            )
        })
        .await?;

        if let Some(path) = &options.iid_file {
            std::fs::write(path, format!("{}{}", SHA256_PREFIX, image_id)).map_err(|e| {
                BuildError::CommitError(format!("writing image ID to {}: {}", path.display(), e))
            })?;
        }
        tracing::info!(
            container = %self.container,
            image = %image_id,
            reference = ?written.reference,
            layers = layers.len(),
            "Committed image"
        );
        Ok(written)
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_image(
    store: &Store,
    target: &CommitDestination,
    layers: &[CommitLayer],
    image_id: &str,
    manifest_media_type: &str,
    manifest: &[u8],
    config: &[u8],
    scratch: &Path,
) -> Result<CommitResult> {
    match target {
        CommitDestination::Store(name) => {
            let mut parent: Option<String> = None;
            for layer in layers {
                let id = chain_id(parent.as_deref(), &layer.diff_id);
                let record = if store.layer_exists(&id) {
                    tracing::debug!(layer = %id, what = %layer.what, "Layer already in store");
                    store.layer(&id)?
                } else {
                    let reader = open_uncompressed(store, layer, scratch)?;
                    store.apply_diff(parent.as_deref(), &layer.diff_id, Some(&layer.digest), reader)?
                };
                parent = Some(record.id);
            }
            let names: Vec<String> = name.iter().cloned().collect();
            let image = store.create_image(image_id, &names, parent.as_deref(), manifest, config)?;
            Ok(CommitResult {
                image_id: image.id,
                reference: name.clone(),
                manifest_digest: image.digest,
            })
        }
        CommitDestination::Layout { dir, tag } => {
            let layout = OciLayout::create(dir)?;
            for layer in layers {
                if layout.blob_path(&layer.digest).exists() {
                    continue;
                }
                match &layer.source {
                    BlobSource::File(path) => layout.put_blob_file(path, &layer.digest)?,
                    BlobSource::StoreLayer(id) => {
                        let path = materialize_store_layer(store, id, &layer.diff_id, scratch)?;
                        let stored = layout.put_blob_file(&path, &layer.digest);
                        let _ = std::fs::remove_file(&path);
                        stored?;
                    }
                }
            }
            layout.put_blob(config)?;
            let manifest_digest = layout.add_manifest(manifest_media_type, manifest, tag.as_deref())?;
            let reference = match tag {
                Some(tag) => format!("oci:{}:{}", dir.display(), tag),
                None => format!("oci:{}", dir.display()),
            };
            Ok(CommitResult {
                image_id: image_id.to_string(),
                reference: Some(reference),
                manifest_digest,
            })
        }
    }
}
