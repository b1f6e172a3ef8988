//! `a3s-build containers` command.

use a3s_build_runtime::Builder;
use clap::Args;

use crate::output;

use super::{load_config, open_store, CmdResult, GlobalArgs};

#[derive(Args, Debug)]
pub struct ContainersArgs {
    /// Only show container IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Show full IDs
    #[arg(long)]
    pub no_trunc: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(global: &GlobalArgs, args: ContainersArgs) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;
    let builders = Builder::open_all(&store)?;

    if args.quiet {
        for builder in &builders {
            println!("{}", id(&builder.container_id, args.no_trunc));
        }
        return Ok(());
    }

    if args.json {
        let rows: Vec<serde_json::Value> = builders
            .iter()
            .map(|b| {
                serde_json::json!({
                    "id": b.container_id,
                    "builder": true,
                    "imageid": b.from_image_id,
                    "imagename": b.from_image,
                    "containername": b.container,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let mut table = output::new_table(&["CONTAINER ID", "IMAGE ID", "IMAGE NAME", "CONTAINER NAME"]);
    for builder in &builders {
        table.add_row(vec![
            id(&builder.container_id, args.no_trunc),
            id(&builder.from_image_id, args.no_trunc),
            builder.from_image.clone(),
            builder.container.clone(),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn id(full: &str, no_trunc: bool) -> String {
    if no_trunc {
        full.to_string()
    } else {
        output::short_id(full)
    }
}
