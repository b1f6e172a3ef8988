//! Canonical image configuration.
//!
//! A working container keeps one [`ImageConfig`]; the OCI and Docker
//! renderings are produced from it on demand by [`ImageConfig::to_oci`]
//! and [`ImageConfig::to_docker`], so the two can never drift apart.

pub mod changes;
pub mod docker;
pub mod oci;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use a3s_build_core::error::{BuildError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use oci_spec::image::{
    Arch, ConfigBuilder, HistoryBuilder, ImageConfiguration, ImageConfigurationBuilder, Os,
    RootFsBuilder,
};
use serde::{Deserialize, Serialize};

pub use docker::{
    DockerContainerConfig, DockerDescriptor, DockerHistory, DockerImage, DockerManifest, DockerRootFs,
    Empty, HealthConfig,
};

/// One history entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default)]
    pub empty_layer: bool,
}

impl From<&DockerHistory> for History {
    fn from(h: &DockerHistory) -> Self {
        Self {
            created: h.created,
            created_by: h.created_by.clone(),
            author: h.author.clone(),
            comment: h.comment.clone(),
            empty_layer: h.empty_layer,
        }
    }
}

impl From<&History> for DockerHistory {
    fn from(h: &History) -> Self {
        Self {
            created: h.created,
            author: h.author.clone(),
            created_by: h.created_by.clone(),
            comment: h.comment.clone(),
            empty_layer: h.empty_layer,
        }
    }
}

/// Runtime defaults for containers started from the image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub exposed_ports: BTreeSet<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub volumes: BTreeSet<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub stop_signal: String,
    /// Docker format only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthConfig>,
    /// Docker format only
    #[serde(default)]
    pub shell: Vec<String>,
    /// Docker format only
    #[serde(default)]
    pub on_build: Vec<String>,
    /// Docker format only
    #[serde(default)]
    pub domainname: String,
    /// Docker format only
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub args_escaped: bool,
}

/// The single source of truth for an image's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// OCI `author`
    #[serde(default)]
    pub author: String,
    /// Docker `author`
    #[serde(default)]
    pub maintainer: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub os_features: Vec<String>,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub diff_ids: Vec<String>,
    #[serde(default)]
    pub history: Vec<History>,
    /// Docker `comment`
    #[serde(default)]
    pub comment: String,
    /// Docker `container`
    #[serde(default)]
    pub container: String,
    /// Docker `parent`
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub docker_version: String,
}

fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn oci_err(e: impl std::fmt::Display) -> BuildError {
    BuildError::CommitError(format!("building OCI image configuration: {}", e))
}

/// Normalize Go-style architecture names.
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" | "x86-64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        "i386" | "i686" => "386".to_string(),
        "armv7l" | "armhf" => "arm".to_string(),
        other => other.to_string(),
    }
}

impl ImageConfig {
    /// A config for an empty image on this host's platform.
    pub fn for_host() -> Self {
        Self {
            architecture: normalize_arch(std::env::consts::ARCH),
            os: std::env::consts::OS.to_string(),
            ..Default::default()
        }
    }

    /// Parse an OCI or Docker image config blob.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let image: DockerImage = serde_json::from_slice(data).map_err(|e| {
            BuildError::SerializationError(format!("parsing image configuration: {}", e))
        })?;
        Ok(Self::from_docker(&image))
    }

    pub fn from_docker(image: &DockerImage) -> Self {
        let c = image.config.clone().unwrap_or_default();
        let keys = |m: Option<BTreeMap<String, Empty>>| -> BTreeSet<String> {
            m.map(|m| m.into_keys().collect()).unwrap_or_default()
        };
        Self {
            created: image.created,
            author: image.author.clone(),
            maintainer: image.author.clone(),
            architecture: image.architecture.clone(),
            os: image.os.clone(),
            os_version: image.os_version.clone(),
            os_features: image.os_features.clone(),
            variant: image.variant.clone(),
            config: RunConfig {
                user: c.user,
                exposed_ports: keys(c.exposed_ports),
                env: c.env.unwrap_or_default(),
                entrypoint: c.entrypoint,
                cmd: c.cmd,
                volumes: keys(c.volumes),
                working_dir: c.working_dir,
                labels: c.labels.unwrap_or_default(),
                stop_signal: c.stop_signal,
                healthcheck: c.healthcheck,
                shell: c.shell.unwrap_or_default(),
                on_build: c.on_build.unwrap_or_default(),
                domainname: c.domainname,
                hostname: c.hostname,
                args_escaped: c.args_escaped,
            },
            diff_ids: image
                .rootfs
                .as_ref()
                .map(|r| r.diff_ids.clone())
                .unwrap_or_default(),
            history: image.history.iter().map(History::from).collect(),
            comment: image.comment.clone(),
            container: image.container.clone(),
            parent: image.parent.clone(),
            docker_version: image.docker_version.clone(),
        }
    }

    /// Render as an OCI image configuration. Docker-only settings are
    /// dropped.
    pub fn to_oci(&self) -> Result<ImageConfiguration> {
        let c = &self.config;
        let mut config = ConfigBuilder::default();
        if !c.user.is_empty() {
            config = config.user(c.user.clone());
        }
        if !c.exposed_ports.is_empty() {
            config = config.exposed_ports(c.exposed_ports.iter().cloned().collect::<Vec<_>>());
        }
        if !c.env.is_empty() {
            config = config.env(c.env.clone());
        }
        if let Some(entrypoint) = &c.entrypoint {
            config = config.entrypoint(entrypoint.clone());
        }
        if let Some(cmd) = &c.cmd {
            config = config.cmd(cmd.clone());
        }
        if !c.volumes.is_empty() {
            config = config.volumes(c.volumes.iter().cloned().collect::<Vec<_>>());
        }
        if !c.working_dir.is_empty() {
            config = config.working_dir(c.working_dir.clone());
        }
        if !c.labels.is_empty() {
            config = config.labels(
                c.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            );
        }
        if !c.stop_signal.is_empty() {
            config = config.stop_signal(c.stop_signal.clone());
        }
        let config = config.build().map_err(oci_err)?;

        let rootfs = RootFsBuilder::default()
            .typ("layers")
            .diff_ids(self.diff_ids.clone())
            .build()
            .map_err(oci_err)?;

        let mut history = Vec::with_capacity(self.history.len());
        for h in &self.history {
            let mut entry = HistoryBuilder::default();
            if let Some(created) = &h.created {
                entry = entry.created(rfc3339(created));
            }
            if !h.created_by.is_empty() {
                entry = entry.created_by(h.created_by.clone());
            }
            if !h.author.is_empty() {
                entry = entry.author(h.author.clone());
            }
            if !h.comment.is_empty() {
                entry = entry.comment(h.comment.clone());
            }
            if h.empty_layer {
                entry = entry.empty_layer(true);
            }
            history.push(entry.build().map_err(oci_err)?);
        }

        let mut image = ImageConfigurationBuilder::default()
            .architecture(Arch::from(self.architecture.as_str()))
            .os(Os::from(self.os.as_str()))
            .config(config)
            .rootfs(rootfs)
            .history(history);
        if let Some(created) = &self.created {
            image = image.created(rfc3339(created));
        }
        if !self.author.is_empty() {
            image = image.author(self.author.clone());
        }
        if !self.os_version.is_empty() {
            image = image.os_version(self.os_version.clone());
        }
        if !self.os_features.is_empty() {
            image = image.os_features(self.os_features.clone());
        }
        if !self.variant.is_empty() {
            image = image.variant(self.variant.clone());
        }
        image.build().map_err(oci_err)
    }

    /// Render as a Docker v2s2 image config.
    pub fn to_docker(&self) -> DockerImage {
        let c = &self.config;
        let set = |s: &BTreeSet<String>| -> Option<BTreeMap<String, Empty>> {
            if s.is_empty() {
                None
            } else {
                Some(s.iter().map(|k| (k.clone(), Empty {})).collect())
            }
        };
        let non_empty = |v: &Vec<String>| -> Option<Vec<String>> {
            if v.is_empty() {
                None
            } else {
                Some(v.clone())
            }
        };
        let container_config = DockerContainerConfig {
            hostname: c.hostname.clone(),
            domainname: c.domainname.clone(),
            user: c.user.clone(),
            exposed_ports: set(&c.exposed_ports),
            env: non_empty(&c.env),
            cmd: c.cmd.clone(),
            healthcheck: c.healthcheck.clone(),
            args_escaped: c.args_escaped,
            image: String::new(),
            volumes: set(&c.volumes),
            working_dir: c.working_dir.clone(),
            entrypoint: c.entrypoint.clone(),
            on_build: non_empty(&c.on_build),
            labels: if c.labels.is_empty() {
                None
            } else {
                Some(c.labels.clone())
            },
            stop_signal: c.stop_signal.clone(),
            shell: non_empty(&c.shell),
        };
        DockerImage {
            id: String::new(),
            parent: self.parent.clone(),
            comment: self.comment.clone(),
            created: self.created,
            container: self.container.clone(),
            container_config: Some(container_config.clone()),
            docker_version: self.docker_version.clone(),
            author: self.maintainer.clone(),
            config: Some(container_config),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
            os: self.os.clone(),
            os_version: self.os_version.clone(),
            os_features: self.os_features.clone(),
            size: None,
            rootfs: Some(DockerRootFs {
                kind: "layers".to_string(),
                diff_ids: self.diff_ids.clone(),
            }),
            history: self.history.iter().map(DockerHistory::from).collect(),
        }
    }

    /// `KEY=value` environment lookup.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.config
            .env
            .iter()
            .filter_map(|e| e.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}
