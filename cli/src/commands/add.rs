//! `a3s-build add` and `a3s-build copy` commands.

use std::path::PathBuf;

use a3s_build_runtime::AddOptions;
use chrono::{TimeZone, Utc};
use clap::Args;

use super::{load_config, open_builder, open_store, retry_options, CmdResult, GlobalArgs};

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Working container name or ID
    pub container: String,

    /// Sources followed by the destination
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<String>,

    /// Owner of the copied content, `user[:group]`
    #[arg(long)]
    pub chown: Option<String>,

    /// Octal permissions of the copied content
    #[arg(long)]
    pub chmod: Option<String>,

    /// Expected `sha256:<hex>` of a remote source
    #[arg(long)]
    pub checksum: Option<String>,

    /// Directory that local sources are relative to
    #[arg(long = "contextdir")]
    pub context_dir: Option<PathBuf>,

    /// File of exclusion patterns, `.containerignore` in the context
    /// directory when unset
    #[arg(long = "ignorefile")]
    pub ignore_file: Option<PathBuf>,

    /// Keep parent directories after a `/./` marker in a source
    #[arg(long)]
    pub parents: bool,

    /// Seconds since the epoch forced onto all copied content
    #[arg(long)]
    pub timestamp: Option<i64>,

    /// Stage the content as a separate layer
    #[arg(long)]
    pub link: bool,

    /// Directory of `*.crt` files trusted for remote sources
    #[arg(long = "cert-dir")]
    pub cert_dir: Option<PathBuf>,

    /// Verify TLS certificates of remote sources
    #[arg(long = "tls-verify", default_value_t = true, action = clap::ArgAction::Set)]
    pub tls_verify: bool,

    /// Number of attempts for remote sources
    #[arg(long)]
    pub retry: Option<u32>,

    /// Do not print the content digest
    #[arg(short, long)]
    pub quiet: bool,
}

fn read_ignore_file(args: &AddArgs) -> Result<(Vec<String>, String), Box<dyn std::error::Error>> {
    let path = match (&args.ignore_file, &args.context_dir) {
        (Some(path), _) => path.clone(),
        (None, Some(dir)) => {
            let candidate = dir.join(".containerignore");
            if !candidate.exists() {
                return Ok((Vec::new(), String::new()));
            }
            candidate
        }
        (None, None) => return Ok((Vec::new(), String::new())),
    };
    let data = std::fs::read_to_string(&path)
        .map_err(|e| format!("reading {}: {e}", path.display()))?;
    let patterns = data
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect();
    Ok((patterns, path.display().to_string()))
}

pub async fn execute(global: &GlobalArgs, args: AddArgs, extract: bool) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;
    let mut builder = open_builder(&store, &args.container)?;

    let mut paths = args.paths.clone();
    let destination = if paths.len() > 1 {
        paths.pop().unwrap_or_default()
    } else {
        String::new()
    };
    let (excludes, ignore_file) = read_ignore_file(&args)?;
    let timestamp = match args.timestamp {
        Some(secs) => Some(
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| format!("invalid timestamp {secs}"))?,
        ),
        None => None,
    };
    let mut retry = retry_options(&config);
    if let Some(n) = args.retry {
        retry.max_retries = n;
    }

    let options = AddOptions {
        chmod: args.chmod.clone().unwrap_or_default(),
        chown: args.chown.clone().unwrap_or_default(),
        checksum: args.checksum.clone().unwrap_or_default(),
        excludes,
        ignore_file,
        context_dir: args.context_dir.clone(),
        cert_path: args.cert_dir.clone(),
        insecure_skip_tls_verify: !args.tls_verify,
        retry,
        parents: args.parents,
        timestamp,
        link: args.link,
        ..Default::default()
    };
    builder
        .add(&store, &destination, extract, options, &paths)
        .await?;

    let verb = if extract { "ADD" } else { "COPY" };
    let summary = builder.content_summary.clone().unwrap_or_default();
    let dest = if destination.is_empty() { "/" } else { destination.as_str() };
    builder.set_created_by(&format!("/bin/sh -c #(nop) {verb} {summary} in {dest} "));
    builder.save(&store)?;

    if !args.quiet {
        if let Some((_, digest)) = summary.split_once(':') {
            println!("{digest}");
        }
    }
    Ok(())
}
