//! `a3s-build commit` command - Create an image from a working container.
//!
//! Writes the image to local storage, or to an OCI layout directory when
//! the destination is `oci:<dir>[:<tag>]`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use a3s_build_runtime::{
    CommitOptions, Compression, ConfidentialWorkloadOptions, ManifestType, TeeType,
};
use chrono::{DateTime, TimeZone, Utc};
use clap::Args;

use super::{load_config, open_builder, open_store, retry_options, CmdResult, GlobalArgs};

#[derive(Args, Debug)]
pub struct CommitArgs {
    /// Working container name or ID
    pub container: String,

    /// Image name or `oci:<dir>[:<tag>]`; unnamed when omitted
    pub image: Option<String>,

    /// Image format: oci or docker
    #[arg(short, long)]
    pub format: Option<String>,

    /// Compress layers with gzip
    #[arg(long)]
    pub compress: bool,

    /// Collapse all layers into one
    #[arg(long)]
    pub squash: bool,

    /// Leave history out of the image
    #[arg(long)]
    pub omit_history: bool,

    /// Seconds since the epoch used for the image and its content
    #[arg(long)]
    pub timestamp: Option<i64>,

    /// Seconds since the epoch used as the image creation time
    #[arg(long = "source-date-epoch", env = "SOURCE_DATE_EPOCH")]
    pub source_date_epoch: Option<i64>,

    /// Clamp content newer than the source date epoch
    #[arg(long)]
    pub rewrite_timestamp: bool,

    /// Manifest annotation `key=value`
    #[arg(long)]
    pub annotation: Vec<String>,

    /// Manifest annotation to remove
    #[arg(long)]
    pub unsetannotation: Vec<String>,

    /// Do not record the creation time as an annotation
    #[arg(long)]
    pub no_created_annotation: bool,

    /// Environment variable to remove
    #[arg(long)]
    pub unsetenv: Vec<String>,

    /// Dockerfile instruction applied to the configuration
    #[arg(short, long)]
    pub change: Vec<String>,

    /// Extra content `<host path>:<image path>` added as a layer
    #[arg(long = "add-file")]
    pub add_file: Vec<String>,

    /// Record the base image as the parent (docker format)
    #[arg(long)]
    pub identity_parent: bool,

    /// Leave root-owned /dev, /proc and /sys out of the layer
    #[arg(long)]
    pub omit_layer_omissions: bool,

    /// Directory to keep layer blobs in
    #[arg(long)]
    pub blob_dir: Option<PathBuf>,

    /// File that receives the image ID
    #[arg(long)]
    pub iidfile: Option<PathBuf>,

    /// Convert into a confidential workload for this TEE: sev or snp
    #[arg(long = "cw-tee")]
    pub cw_tee: Option<String>,

    /// Attestation server URL for a confidential workload
    #[arg(long = "cw-attestation-url", default_value = "")]
    pub cw_attestation_url: String,

    /// Disk encryption passphrase for a confidential workload
    #[arg(long = "cw-passphrase", env = "A3S_BUILD_CW_PASSPHRASE", default_value = "")]
    pub cw_passphrase: String,

    /// CPUs for a confidential workload
    #[arg(long = "cw-cpus", default_value_t = 2)]
    pub cw_cpus: u32,

    /// Memory in MiB for a confidential workload
    #[arg(long = "cw-memory", default_value_t = 512)]
    pub cw_memory: u64,

    /// Remove the working container afterwards
    #[arg(long)]
    pub rm: bool,

    /// Do not print the image ID
    #[arg(short, long)]
    pub quiet: bool,
}

fn epoch_time(secs: i64) -> Result<DateTime<Utc>, String> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| format!("invalid timestamp {secs}"))
}

fn parse_add_files(specs: &[String]) -> Result<BTreeMap<String, PathBuf>, String> {
    let mut files = BTreeMap::new();
    for spec in specs {
        let (host, image) = spec
            .rsplit_once(':')
            .ok_or_else(|| format!("expected <host path>:<image path>, got {spec:?}"))?;
        if host.is_empty() || image.is_empty() {
            return Err(format!("expected <host path>:<image path>, got {spec:?}"));
        }
        files.insert(image.to_string(), PathBuf::from(host));
    }
    Ok(files)
}

pub async fn execute(global: &GlobalArgs, args: CommitArgs) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;
    let builder = open_builder(&store, &args.container)?;

    let preferred_manifest_type = match &args.format {
        Some(f) => Some(f.parse::<ManifestType>()?),
        None => None,
    };
    let confidential_workload = match &args.cw_tee {
        Some(tee) => Some(ConfidentialWorkloadOptions {
            archiver: config.cw_archiver.clone(),
            entrypoint: config
                .cw_entrypoint
                .clone()
                .ok_or("no attestation helper configured (cw_entrypoint)")?,
            workload_id: String::new(),
            cpus: args.cw_cpus,
            memory_mib: args.cw_memory,
            tee_type: tee.parse::<TeeType>()?,
            attestation_url: args.cw_attestation_url.clone(),
            passphrase: args.cw_passphrase.clone(),
        }),
        None => None,
    };

    let options = CommitOptions {
        preferred_manifest_type,
        compression: if args.compress {
            Compression::Gzip
        } else {
            Compression::Uncompressed
        },
        squash: args.squash,
        omit_history: args.omit_history,
        history_timestamp: args.timestamp.map(epoch_time).transpose()?,
        source_date_epoch: args.source_date_epoch.map(epoch_time).transpose()?,
        rewrite_timestamp: args.rewrite_timestamp,
        annotations: args.annotation.clone(),
        unset_annotations: args.unsetannotation.clone(),
        created_annotation: !args.no_created_annotation,
        unset_envs: args.unsetenv.clone(),
        override_changes: args.change.clone(),
        extra_image_content: parse_add_files(&args.add_file)?,
        compat_set_parent: args.identity_parent,
        compat_layer_omissions: args.omit_layer_omissions,
        blob_directory: args.blob_dir.clone(),
        confidential_workload,
        iid_file: args.iidfile.clone(),
        retry: retry_options(&config),
        ..Default::default()
    };

    let destination = args.image.clone().unwrap_or_default();
    let result = builder.commit(&store, &destination, options).await?;

    if args.rm {
        builder.delete(&store)?;
    }
    if !args.quiet {
        println!("{}", result.image_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add_files() {
        let files = parse_add_files(&["/tmp/ca.pem:/etc/ssl/ca.pem".to_string()]).unwrap();
        assert_eq!(files["/etc/ssl/ca.pem"], PathBuf::from("/tmp/ca.pem"));
        assert!(parse_add_files(&["nocolon".to_string()]).is_err());
        assert!(parse_add_files(&[":/x".to_string()]).is_err());
    }

    #[test]
    fn test_epoch_time() {
        assert_eq!(epoch_time(0).unwrap().timestamp(), 0);
    }
}
