//! Manifest and config assembly for the two supported image formats.
//!
//! The layer walk in [`super`] feeds layers to a [`ManifestBuilder`]
//! without knowing which format it is producing. Everything that differs
//! between OCI and Docker v2s2 output (media types, manifest annotations,
//! the `container` and `parent` fields, history authorship) lives here.

use std::collections::BTreeMap;

use a3s_build_core::error::{BuildError, Result};
use chrono::{DateTime, Utc};

use crate::archive::Compression;
use crate::builder::LinkedLayer;
use crate::define::{
    ManifestType, DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_GZIP_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE, OCI_CONFIG_MEDIA_TYPE, OCI_LAYER_GZIP_MEDIA_TYPE,
    OCI_LAYER_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use crate::digest::{sha256_digest, SHA256_PREFIX};
use crate::image::docker::{DockerDescriptor, DockerManifest};
use crate::image::oci::{Descriptor, OciManifest, ANNOTATION_CREATED};
use crate::image::{History, ImageConfig};

/// Entries added to the history by one commit, in layer order.
#[derive(Debug, Clone, Default)]
pub(crate) struct HistoryPlan {
    pub prepended_empty: Vec<History>,
    pub prepended_linked: Vec<LinkedLayer>,
    /// Entry for the working layer; `None` when omitted
    pub layer: Option<History>,
    /// Diff ID of the synthesized extra-content layer, if one was added
    pub extra_content: Option<String>,
    pub appended_empty: Vec<History>,
    pub appended_linked: Vec<LinkedLayer>,
    /// Appended to the comment of the first new entry
    pub from_comment: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

/// Builds one image's manifest and config from the layers handed to it.
pub(crate) trait ManifestBuilder: Send {
    /// Media type for a layer blob with the given compression.
    fn layer_media_type(&self, what: &str, compression: Compression) -> Result<&'static str>;

    fn add_layer(&mut self, media_type: &str, digest: &str, size: u64, diff_id: &str);

    /// Append this commit's history entries and check them against the
    /// layers added so far.
    fn build_history(&mut self, plan: &HistoryPlan) -> Result<()>;

    /// Drop all history, including the base image's.
    fn omit_history(&mut self);

    fn manifest_media_type(&self) -> &'static str;

    /// Serialized manifest and config.
    fn manifest_and_config(&self) -> Result<(Vec<u8>, Vec<u8>)>;
}

/// Create the builder for `format`. `config` must already carry every
/// override; its diff IDs are rebuilt from the added layers.
pub(crate) fn manifest_builder(
    format: ManifestType,
    mut config: ImageConfig,
    annotations: BTreeMap<String, String>,
    container_id: &str,
    parent: Option<&str>,
) -> Box<dyn ManifestBuilder> {
    config.diff_ids.clear();
    match format {
        ManifestType::Oci => Box::new(OciBuilder {
            config,
            layers: Vec::new(),
            annotations,
        }),
        ManifestType::Docker => {
            config.container = container_id.to_string();
            config.parent = parent.map(str::to_string).unwrap_or_default();
            Box::new(DockerBuilder {
                config,
                layers: Vec::new(),
            })
        }
    }
}

fn unsupported(what: &str, compression: Compression, format: &str) -> BuildError {
    BuildError::CommitError(format!(
        "{} compression is not supported for {} in {} images",
        compression.name(),
        what,
        format
    ))
}

fn append_entries(history: &mut Vec<History>, entries: &[History], empty: bool) {
    for entry in entries {
        let mut entry = entry.clone();
        entry.empty_layer = empty;
        history.push(entry);
    }
}

fn append_linked(history: &mut Vec<History>, layers: &[LinkedLayer]) {
    for layer in layers {
        history.push(layer.history().clone());
    }
}

/// Append the plan's entries to `config.history` with `author` on the
/// working layer's entry.
fn append_history(config: &mut ImageConfig, plan: &HistoryPlan, author: &str) -> Result<()> {
    let base_len = config.history.len();
    let history = &mut config.history;
    append_entries(history, &plan.prepended_empty, true);
    append_linked(history, &plan.prepended_linked);
    if let Some(layer) = &plan.layer {
        let mut entry = layer.clone();
        entry.author = author.to_string();
        history.push(entry);
    }
    if let Some(diff_id) = &plan.extra_content {
        history.push(History {
            created: plan.created,
            created_by: format!(
                "/bin/sh -c #(nop) ADD dir:{} in / ",
                diff_id.strip_prefix(SHA256_PREFIX).unwrap_or(diff_id)
            ),
            ..Default::default()
        });
    }
    append_entries(history, &plan.appended_empty, true);
    append_linked(history, &plan.appended_linked);

    if let (Some(from), Some(first)) = (&plan.from_comment, history.get_mut(base_len)) {
        if !first.comment.is_empty() {
            first.comment.push(' ');
        }
        first.comment.push_str(from);
    }
    check_history(config)
}

/// Non-empty history entries must pair up with diff IDs.
pub(crate) fn check_history(config: &ImageConfig) -> Result<()> {
    if config.history.is_empty() {
        return Ok(());
    }
    let non_empty = config.history.iter().filter(|h| !h.empty_layer).count();
    if non_empty != config.diff_ids.len() {
        return Err(BuildError::Internal(format!(
            "history lists {} non-empty layers, but we have {} layers on disk",
            non_empty,
            config.diff_ids.len()
        )));
    }
    Ok(())
}

struct OciBuilder {
    config: ImageConfig,
    layers: Vec<Descriptor>,
    annotations: BTreeMap<String, String>,
}

impl ManifestBuilder for OciBuilder {
    fn layer_media_type(&self, what: &str, compression: Compression) -> Result<&'static str> {
        match compression {
            Compression::Uncompressed => Ok(OCI_LAYER_MEDIA_TYPE),
            Compression::Gzip => Ok(OCI_LAYER_GZIP_MEDIA_TYPE),
            other => Err(unsupported(what, other, "OCI")),
        }
    }

    fn add_layer(&mut self, media_type: &str, digest: &str, size: u64, diff_id: &str) {
        self.layers
            .push(Descriptor::new(media_type, digest, size as i64));
        self.config.diff_ids.push(diff_id.to_string());
    }

    fn build_history(&mut self, plan: &HistoryPlan) -> Result<()> {
        let author = self.config.author.clone();
        append_history(&mut self.config, plan, &author)
    }

    fn omit_history(&mut self) {
        self.config.history.clear();
    }

    fn manifest_media_type(&self) -> &'static str {
        OCI_MANIFEST_MEDIA_TYPE
    }

    fn manifest_and_config(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        // labels are kept in a hash map by the OCI types; going through a
        // JSON value sorts every object's keys
        let value = serde_json::to_value(self.config.to_oci()?)?;
        let config = serde_json::to_vec(&value)?;
        let mut manifest = OciManifest::new(Descriptor::new(
            OCI_CONFIG_MEDIA_TYPE,
            &sha256_digest(&config),
            config.len() as i64,
        ));
        manifest.layers = self.layers.clone();
        manifest.annotations = self.annotations.clone();
        Ok((serde_json::to_vec(&manifest)?, config))
    }
}

struct DockerBuilder {
    config: ImageConfig,
    layers: Vec<DockerDescriptor>,
}

impl ManifestBuilder for DockerBuilder {
    fn layer_media_type(&self, what: &str, compression: Compression) -> Result<&'static str> {
        match compression {
            Compression::Uncompressed => Ok(DOCKER_LAYER_MEDIA_TYPE),
            Compression::Gzip => Ok(DOCKER_LAYER_GZIP_MEDIA_TYPE),
            other => Err(unsupported(what, other, "Docker")),
        }
    }

    fn add_layer(&mut self, media_type: &str, digest: &str, size: u64, diff_id: &str) {
        self.layers.push(DockerDescriptor {
            media_type: media_type.to_string(),
            size: size as i64,
            digest: digest.to_string(),
            urls: Vec::new(),
        });
        self.config.diff_ids.push(diff_id.to_string());
    }

    fn build_history(&mut self, plan: &HistoryPlan) -> Result<()> {
        let author = self.config.maintainer.clone();
        append_history(&mut self.config, plan, &author)
    }

    fn omit_history(&mut self) {
        self.config.history.clear();
    }

    fn manifest_media_type(&self) -> &'static str {
        DOCKER_MANIFEST_MEDIA_TYPE
    }

    fn manifest_and_config(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let config = serde_json::to_vec(&self.config.to_docker())?;
        let manifest = DockerManifest {
            schema_version: 2,
            media_type: DOCKER_MANIFEST_MEDIA_TYPE.to_string(),
            config: DockerDescriptor {
                media_type: DOCKER_CONFIG_MEDIA_TYPE.to_string(),
                size: config.len() as i64,
                digest: sha256_digest(&config),
                urls: Vec::new(),
            },
            layers: self.layers.clone(),
        };
        Ok((serde_json::to_vec(&manifest)?, config))
    }
}

/// Manifest annotations for an OCI image.
pub(crate) fn oci_annotations(
    base: &BTreeMap<String, String>,
    add: &[String],
    unset: &[String],
    created: Option<&DateTime<Utc>>,
) -> Result<BTreeMap<String, String>> {
    let mut annotations = base.clone();
    for key in unset {
        annotations.remove(key);
    }
    for entry in add {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                annotations.insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(BuildError::InvalidArgument(format!(
                    "invalid annotation {:?}: expected key=value",
                    entry
                )))
            }
        }
    }
    if let Some(created) = created {
        annotations.insert(
            ANNOTATION_CREATED.to_string(),
            created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
    }
    Ok(annotations)
}
