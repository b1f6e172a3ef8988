use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Capabilities granted to RUN processes unless overridden.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_NET_BIND_SERVICE",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_CHROOT",
];

/// Global build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Layer, image and container store root
    pub root: PathBuf,

    /// Per-boot state (mount counts, run bundles)
    pub run_root: PathBuf,

    /// OCI runtime binary name or path
    pub runtime: String,

    /// Extra arguments passed to every runtime invocation
    pub runtime_args: Vec<String>,

    /// Isolation used when RUN does not ask for one ("oci", "chroot", "rootless")
    pub default_isolation: String,

    /// Parent directory of cache mounts
    pub cache_parent: PathBuf,

    /// Scratch space for downloads and commit blobs
    pub tmp_dir: PathBuf,

    /// Bounded retry for remote fetches
    pub max_retries: u32,

    /// Delay between retries, in seconds
    pub retry_delay_secs: u64,

    /// Capabilities for RUN processes
    pub default_capabilities: Vec<String>,

    /// Default rlimits, `name=soft[:hard]`
    pub default_ulimits: Vec<String>,

    /// DNS servers written to the run-time resolv.conf
    pub dns_servers: Vec<String>,

    /// DNS search domains
    pub dns_search: Vec<String>,

    /// resolv.conf options
    pub dns_options: Vec<String>,

    /// Disk-image tool used for confidential workloads
    pub cw_archiver: String,

    /// Attestation helper copied in as the confidential workload entrypoint
    pub cw_entrypoint: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let home = build_home();
        Self {
            root: home.join("storage"),
            run_root: home.join("run"),
            runtime: "runc".to_string(),
            runtime_args: Vec::new(),
            default_isolation: "oci".to_string(),
            cache_parent: std::env::temp_dir(),
            tmp_dir: std::env::temp_dir(),
            max_retries: 3,
            retry_delay_secs: 2,
            default_capabilities: DEFAULT_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
            default_ulimits: Vec::new(),
            dns_servers: Vec::new(),
            dns_search: Vec::new(),
            dns_options: Vec::new(),
            cw_archiver: "mkcw-disk".to_string(),
            cw_entrypoint: None,
        }
    }
}

impl BuildConfig {
    /// Load defaults, then `~/.a3s/build/config.yaml`, then the environment.
    pub fn load() -> Result<Self> {
        let path = build_home().join("config.yaml");
        let mut config = if path.exists() {
            tracing::debug!(path = %path.display(), "Loading build configuration");
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a YAML configuration file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BuildError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    /// Apply `A3S_BUILD_*` overrides.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("A3S_BUILD_ROOT") {
            self.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("A3S_BUILD_RUNROOT") {
            self.run_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("A3S_BUILD_RUNTIME") {
            self.runtime = v;
        }
        if let Some(v) = lookup("A3S_BUILD_ISOLATION") {
            self.default_isolation = v;
        }
        if let Some(v) = lookup("TMPDIR") {
            self.tmp_dir = PathBuf::from(&v);
            self.cache_parent = PathBuf::from(v);
        }
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_delay_secs)
    }
}

/// `~/.a3s/build`
pub fn build_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".a3s")
        .join("build")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BuildConfig::default();
        assert_eq!(config.runtime, "runc");
        assert_eq!(config.default_isolation, "oci");
        assert_eq!(config.max_retries, 3);
        assert!(config
            .default_capabilities
            .contains(&"CAP_SYS_CHROOT".to_string()));
        assert!(config.root.ends_with("storage"));
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "runtime: crun\nmax_retries: 5\ndns_servers: [\"1.1.1.1\"]\n")
            .unwrap();
        let config = BuildConfig::from_file(&path).unwrap();
        assert_eq!(config.runtime, "crun");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.dns_servers, vec!["1.1.1.1".to_string()]);
        assert_eq!(config.default_isolation, "oci");
    }

    #[test]
    fn test_from_file_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "max_retries: [not, a, number]\n").unwrap();
        assert!(matches!(
            BuildConfig::from_file(&path),
            Err(BuildError::SerializationError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("A3S_BUILD_ROOT", "/srv/store"),
            ("A3S_BUILD_RUNTIME", "crun"),
            ("A3S_BUILD_ISOLATION", "chroot"),
            ("TMPDIR", "/var/tmp"),
        ]
        .into_iter()
        .collect();
        let mut config = BuildConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.root, PathBuf::from("/srv/store"));
        assert_eq!(config.runtime, "crun");
        assert_eq!(config.default_isolation, "chroot");
        assert_eq!(config.tmp_dir, PathBuf::from("/var/tmp"));
        assert_eq!(config.cache_parent, PathBuf::from("/var/tmp"));
    }
}
