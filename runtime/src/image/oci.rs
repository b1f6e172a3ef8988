//! OCI image manifest, index and descriptor JSON shapes.
//!
//! Maps are ordered so that serializing the same value twice yields the
//! same bytes, and therefore the same digest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::define::{OCI_INDEX_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE};

/// Annotation naming the tag of an image in an OCI layout index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Annotation recording when an image was created.
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

/// Annotation naming the base image.
pub const ANNOTATION_BASE_NAME: &str = "org.opencontainers.image.base.name";

/// Annotation recording the base image's manifest digest.
pub const ANNOTATION_BASE_DIGEST: &str = "org.opencontainers.image.base.digest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: &str, size: i64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: digest.to_string(),
            size,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl OciManifest {
    pub fn new(config: Descriptor) -> Self {
        Self {
            schema_version: 2,
            media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
            config,
            layers: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl Default for OciIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: OCI_INDEX_MEDIA_TYPE.to_string(),
            manifests: Vec::new(),
        }
    }
}

impl OciIndex {
    /// Descriptor tagged `tag`, or the only manifest when no tag is given.
    pub fn find(&self, tag: Option<&str>) -> Option<&Descriptor> {
        match tag {
            Some(tag) => self
                .manifests
                .iter()
                .find(|d| d.annotations.get(ANNOTATION_REF_NAME).map(String::as_str) == Some(tag)),
            None => self.manifests.first(),
        }
    }

    /// Add a manifest, taking `tag` away from any manifest that had it.
    pub fn add(&mut self, mut descriptor: Descriptor, tag: Option<&str>) {
        match tag {
            Some(tag) => {
                self.manifests.retain(|d| {
                    d.annotations.get(ANNOTATION_REF_NAME).map(String::as_str) != Some(tag)
                });
                descriptor
                    .annotations
                    .insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());
            }
            None => self.manifests.retain(|d| d.digest != descriptor.digest),
        }
        self.manifests.push(descriptor);
    }
}
