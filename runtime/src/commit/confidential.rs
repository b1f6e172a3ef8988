//! Confidential workload images.
//!
//! The container's root filesystem is handed to an external disk-image
//! tool which writes an encrypted disk image. The committed layer holds
//! only that image, a workload description for the launcher and the
//! attestation helper that runs as the image's entrypoint.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use a3s_build_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::image::ImageConfig;

/// Name of the disk image inside the layer.
pub const DISK_IMAGE: &str = "disk.img";
/// Name of the workload description inside the layer.
pub const WORKLOAD_CONFIG: &str = "krun-sev.json";
/// Name of the attestation helper inside the layer.
pub const ENTRYPOINT: &str = "entrypoint";

/// Trusted execution environment the workload targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeeType {
    #[default]
    Sev,
    Snp,
}

impl std::str::FromStr for TeeType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sev" => Ok(TeeType::Sev),
            "snp" | "sev-snp" => Ok(TeeType::Snp),
            other => Err(BuildError::InvalidArgument(format!(
                "unsupported TEE type {:?}",
                other
            ))),
        }
    }
}

/// Settings for converting the image into a confidential workload.
#[derive(Debug, Clone, Default)]
pub struct ConfidentialWorkloadOptions {
    /// Disk-image tool, invoked as `<archiver> <rootfs> <disk-image>`
    /// with the passphrase (if any) on its standard input
    pub archiver: String,
    /// Attestation helper copied in as `/entrypoint`
    pub entrypoint: PathBuf,
    /// Defaults to the container name
    pub workload_id: String,
    pub cpus: u32,
    pub memory_mib: u64,
    pub tee_type: TeeType,
    pub attestation_url: String,
    pub passphrase: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkloadConfig {
    workload_id: String,
    cpus: u32,
    ram_mib: u64,
    tee: TeeType,
    tee_data: String,
    attestation_url: String,
}

/// Fill `staging` with the disk image, workload description and
/// entrypoint for `rootfs`.
pub(crate) async fn stage(
    rootfs: &Path,
    staging: &Path,
    container_name: &str,
    options: &ConfidentialWorkloadOptions,
) -> Result<()> {
    if options.archiver.is_empty() {
        return Err(BuildError::InvalidArgument(
            "no disk-image tool configured for confidential workloads".to_string(),
        ));
    }
    if !options.entrypoint.is_file() {
        return Err(BuildError::NotFound(format!(
            "attestation helper {} not found",
            options.entrypoint.display()
        )));
    }

    let disk = staging.join(DISK_IMAGE);
    tracing::debug!(archiver = %options.archiver, rootfs = %rootfs.display(), "Creating disk image");
    let mut child = tokio::process::Command::new(&options.archiver)
        .arg(rootfs)
        .arg(&disk)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            BuildError::CommitError(format!("running {:?}: {}", options.archiver, e))
        })?;
    if let Some(mut stdin) = child.stdin.take() {
        if !options.passphrase.is_empty() {
            if let Err(e) = stdin.write_all(options.passphrase.as_bytes()).await {
                tracing::debug!(error = %e, "Disk-image tool did not read the passphrase");
            }
        }
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(BuildError::CommitError(format!(
            "{:?} failed ({}): {}",
            options.archiver,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    if !disk.is_file() {
        return Err(BuildError::CommitError(format!(
            "{:?} did not create {}",
            options.archiver,
            disk.display()
        )));
    }

    let workload = WorkloadConfig {
        workload_id: if options.workload_id.is_empty() {
            container_name.to_string()
        } else {
            options.workload_id.clone()
        },
        cpus: options.cpus.max(1),
        ram_mib: options.memory_mib.max(512),
        tee: options.tee_type,
        tee_data: String::new(),
        attestation_url: options.attestation_url.clone(),
    };
    std::fs::write(staging.join(WORKLOAD_CONFIG), serde_json::to_vec_pretty(&workload)?)?;

    let entrypoint = staging.join(ENTRYPOINT);
    std::fs::copy(&options.entrypoint, &entrypoint).map_err(|e| {
        BuildError::CommitError(format!(
            "copying attestation helper {}: {}",
            options.entrypoint.display(),
            e
        ))
    })?;
    std::fs::set_permissions(
        &entrypoint,
        std::os::unix::fs::PermissionsExt::from_mode(0o755),
    )?;
    Ok(())
}

/// Point the image at the attestation helper.
pub(crate) fn force_config(config: &mut ImageConfig) {
    config.config.entrypoint = Some(vec![format!("/{}", ENTRYPOINT)]);
    config.config.cmd = None;
    config.config.working_dir = "/".to_string();
    config.config.user = String::new();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("archiver.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn options(dir: &Path, archiver: &Path) -> ConfidentialWorkloadOptions {
        let helper = dir.join("attest");
        std::fs::write(&helper, "#!/bin/sh\n").unwrap();
        ConfidentialWorkloadOptions {
            archiver: archiver.display().to_string(),
            entrypoint: helper,
            cpus: 2,
            memory_mib: 1024,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stage_writes_layer_contents() {
        let dir = TempDir::new().unwrap();
        let rootfs = dir.path().join("rootfs");
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::create_dir_all(&staging).unwrap();
        let archiver = script(dir.path(), "cat > /dev/null; echo disk > \"$2\"");
        let mut opts = options(dir.path(), &archiver);
        opts.passphrase = "secret".to_string();

        stage(&rootfs, &staging, "app-working-container", &opts).await.unwrap();
        assert!(staging.join(DISK_IMAGE).is_file());
        let raw = std::fs::read(staging.join(WORKLOAD_CONFIG)).unwrap();
        let workload: WorkloadConfig = serde_json::from_slice(&raw).unwrap();
        assert_eq!(workload.workload_id, "app-working-container");
        assert_eq!(workload.cpus, 2);
        assert_eq!(workload.tee, TeeType::Sev);
        let mode = std::fs::metadata(staging.join(ENTRYPOINT)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_archiver_failure() {
        let dir = TempDir::new().unwrap();
        let archiver = script(dir.path(), "echo broken >&2; exit 3");
        let opts = options(dir.path(), &archiver);
        let err = stage(dir.path(), dir.path(), "c", &opts).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_force_config_and_tee_type() {
        let mut config = ImageConfig::for_host();
        config.config.cmd = Some(vec!["sh".to_string()]);
        force_config(&mut config);
        assert_eq!(config.config.entrypoint, Some(vec!["/entrypoint".to_string()]));
        assert!(config.config.cmd.is_none());
        assert_eq!("SNP".parse::<TeeType>().unwrap(), TeeType::Snp);
        assert!("tdx".parse::<TeeType>().is_err());
    }
}
