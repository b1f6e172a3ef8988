//! `a3s-build config` command.

use clap::Args;

use super::{load_config, open_builder, open_store, CmdResult, GlobalArgs};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Working container name or ID
    pub container: String,

    /// Default command, JSON array or shell form
    #[arg(long)]
    pub cmd: Option<String>,

    /// Entrypoint, JSON array or shell form
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// `KEY=value` to set, or `KEY-` to remove
    #[arg(short, long)]
    pub env: Vec<String>,

    /// `key=value` label to set, or `key-` to remove
    #[arg(short, long)]
    pub label: Vec<String>,

    /// `key=value` annotation to set, or `key-` to remove
    #[arg(short, long)]
    pub annotation: Vec<String>,

    /// Port to expose, or `port-` to remove
    #[arg(short, long)]
    pub port: Vec<String>,

    /// Volume to declare, or `path-` to remove
    #[arg(short, long)]
    pub volume: Vec<String>,

    #[arg(long)]
    pub workingdir: Option<String>,

    #[arg(short, long)]
    pub user: Option<String>,

    #[arg(long)]
    pub author: Option<String>,

    #[arg(long)]
    pub os: Option<String>,

    #[arg(long)]
    pub arch: Option<String>,

    #[arg(long)]
    pub stop_signal: Option<String>,

    /// Shell for shell-form commands, JSON array
    #[arg(long)]
    pub shell: Option<String>,

    #[arg(long)]
    pub hostname: Option<String>,

    /// ONBUILD trigger to add
    #[arg(long)]
    pub onbuild: Vec<String>,

    /// Description of how the next layer was made
    #[arg(long)]
    pub created_by: Option<String>,

    /// History comment of the next layer
    #[arg(long)]
    pub history_comment: Option<String>,
}

/// A JSON string array as-is, anything else wrapped in `/bin/sh -c`.
fn command_form(value: &str) -> Option<Vec<String>> {
    if value.is_empty() {
        return None;
    }
    match serde_json::from_str::<Vec<String>>(value) {
        Ok(list) => Some(list),
        Err(_) => Some(vec!["/bin/sh".to_string(), "-c".to_string(), value.to_string()]),
    }
}

/// `key=value` to set or `key-` to remove.
enum Setting<'a> {
    Set(&'a str, &'a str),
    Unset(&'a str),
}

fn setting(spec: &str) -> Result<Setting<'_>, String> {
    if let Some((key, value)) = spec.split_once('=') {
        return Ok(Setting::Set(key, value));
    }
    match spec.strip_suffix('-') {
        Some(key) if !key.is_empty() => Ok(Setting::Unset(key)),
        _ => Err(format!("expected key=value or key-, got {spec:?}")),
    }
}

pub async fn execute(global: &GlobalArgs, args: ConfigArgs) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;
    let mut builder = open_builder(&store, &args.container)?;

    if let Some(cmd) = &args.cmd {
        builder.set_cmd(command_form(cmd));
    }
    if let Some(entrypoint) = &args.entrypoint {
        builder.set_entrypoint(command_form(entrypoint));
    }
    for spec in &args.env {
        match setting(spec)? {
            Setting::Set(key, value) => builder.set_env(key, value),
            Setting::Unset(key) => builder.unset_env(key),
        }
    }
    for spec in &args.label {
        match setting(spec)? {
            Setting::Set(key, value) => builder.set_label(key, value),
            Setting::Unset(key) => builder.unset_label(key),
        }
    }
    for spec in &args.annotation {
        match setting(spec)? {
            Setting::Set(key, value) => builder.set_annotation(key, value),
            Setting::Unset(key) => builder.unset_annotation(key),
        }
    }
    for port in &args.port {
        match port.strip_suffix('-') {
            Some(p) => builder.remove_port(p),
            None => builder.set_port(port),
        }
    }
    for volume in &args.volume {
        match volume.strip_suffix('-') {
            Some(v) => builder.remove_volume(v),
            None => builder.add_volume(volume),
        }
    }
    if let Some(dir) = &args.workingdir {
        builder.set_workdir(dir);
    }
    if let Some(user) = &args.user {
        builder.set_user(user);
    }
    if let Some(author) = &args.author {
        builder.set_author(author);
    }
    if let Some(os) = &args.os {
        builder.set_os(os);
    }
    if let Some(arch) = &args.arch {
        builder.set_architecture(arch);
    }
    if let Some(signal) = &args.stop_signal {
        builder.set_stop_signal(signal);
    }
    if let Some(shell) = &args.shell {
        let shell: Vec<String> = serde_json::from_str(shell)
            .map_err(|e| format!("--shell must be a JSON array: {e}"))?;
        builder.set_shell(&shell);
    }
    if let Some(hostname) = &args.hostname {
        builder.set_hostname(hostname);
    }
    for trigger in &args.onbuild {
        builder.set_onbuild(trigger);
    }
    if let Some(created_by) = &args.created_by {
        builder.set_created_by(created_by);
    }
    if let Some(comment) = &args.history_comment {
        builder.set_history_comment(comment);
    }
    builder.save(&store)?;
    Ok(())
}
