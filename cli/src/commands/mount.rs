//! `a3s-build mount` and `a3s-build umount` commands.

use clap::Args;

use super::{load_config, open_builder, open_store, CmdResult, GlobalArgs};

#[derive(Args, Debug)]
pub struct MountArgs {
    /// Working container names or IDs
    #[arg(required = true)]
    pub containers: Vec<String>,
}

#[derive(Args, Debug)]
pub struct UmountArgs {
    /// Working container names or IDs
    #[arg(required = true)]
    pub containers: Vec<String>,
}

pub async fn execute(global: &GlobalArgs, args: MountArgs) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;
    let many = args.containers.len() > 1;
    for name in &args.containers {
        let mut builder = open_builder(&store, name)?;
        let path = builder.mount(&store)?;
        if many {
            println!("{} {}", builder.container, path.display());
        } else {
            println!("{}", path.display());
        }
    }
    Ok(())
}

pub async fn execute_umount(global: &GlobalArgs, args: UmountArgs) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;
    for name in &args.containers {
        let mut builder = open_builder(&store, name)?;
        builder.unmount(&store)?;
        println!("{}", builder.container_id);
    }
    Ok(())
}
