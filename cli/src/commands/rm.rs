//! `a3s-build rm` command - Remove working containers.

use a3s_build_runtime::Builder;
use clap::Args;

use super::{load_config, open_builder, open_store, CmdResult, GlobalArgs};

#[derive(Args, Debug)]
pub struct RmArgs {
    /// Working container names or IDs
    pub containers: Vec<String>,

    /// Remove every working container
    #[arg(short, long)]
    pub all: bool,
}

pub async fn execute(global: &GlobalArgs, args: RmArgs) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;

    if args.all && !args.containers.is_empty() {
        return Err("--all and container names are mutually exclusive".into());
    }
    if !args.all && args.containers.is_empty() {
        return Err("no container specified".into());
    }

    let builders = if args.all {
        Builder::open_all(&store)?
    } else {
        let mut builders = Vec::with_capacity(args.containers.len());
        for name in &args.containers {
            builders.push(open_builder(&store, name)?);
        }
        builders
    };
    for builder in builders {
        let id = builder.container_id.clone();
        builder.delete(&store)?;
        println!("{id}");
    }
    Ok(())
}
