//! Shared constants and option enums.

use a3s_build_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name used in state files, temp-directory prefixes and container names.
pub const PACKAGE: &str = "a3s-build";

/// State-file format version.
pub const STATE_VERSION: &str = "0.0.1";

/// Magic `type` tag of builder state files.
pub const CONTAINER_TYPE: &str = "a3s-build 0.0.1";

/// Builder state file name inside the container directory.
pub const STATE_FILE: &str = "a3s-build.json";

/// Default PATH for RUN processes.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// OCI media types
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Docker v2 schema 2 media types
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// How RUN isolates its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    #[default]
    Oci,
    Chroot,
    Rootless,
}

impl FromStr for Isolation {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "oci" | "default" => Ok(Isolation::Oci),
            "chroot" => Ok(Isolation::Chroot),
            "rootless" | "oci-rootless" => Ok(Isolation::Rootless),
            other => Err(BuildError::InvalidArgument(format!(
                "unrecognized isolation type {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isolation::Oci => write!(f, "oci"),
            Isolation::Chroot => write!(f, "chroot"),
            Isolation::Rootless => write!(f, "rootless"),
        }
    }
}

/// Image manifest/config flavor produced by commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestType {
    #[default]
    Oci,
    Docker,
}

impl ManifestType {
    pub fn manifest_media_type(&self) -> &'static str {
        match self {
            ManifestType::Oci => OCI_MANIFEST_MEDIA_TYPE,
            ManifestType::Docker => DOCKER_MANIFEST_MEDIA_TYPE,
        }
    }

    pub fn config_media_type(&self) -> &'static str {
        match self {
            ManifestType::Oci => OCI_CONFIG_MEDIA_TYPE,
            ManifestType::Docker => DOCKER_CONFIG_MEDIA_TYPE,
        }
    }
}

impl FromStr for ManifestType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "oci" | OCI_MANIFEST_MEDIA_TYPE => Ok(ManifestType::Oci),
            "docker" | DOCKER_MANIFEST_MEDIA_TYPE => Ok(ManifestType::Docker),
            other => Err(BuildError::InvalidArgument(format!(
                "unrecognized image format {:?}",
                other
            ))),
        }
    }
}

/// Whether RUN gets a network namespace of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    #[default]
    Default,
    Disabled,
    Enabled,
}

/// Whether RUN allocates a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalPolicy {
    #[default]
    Default,
    Enabled,
    Disabled,
}

/// One namespace setting for RUN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceOption {
    /// "ipc", "mount", "network", "pid", "user", "uts", "cgroup"
    pub name: String,
    /// Share the host's namespace instead of creating one
    #[serde(default)]
    pub host: bool,
    /// Join the namespace at this path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl NamespaceOption {
    pub fn private(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: false,
            path: None,
        }
    }

    pub fn host(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: true,
            path: None,
        }
    }
}
