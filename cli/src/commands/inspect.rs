//! `a3s-build inspect` command - Configuration as JSON.

use a3s_build_runtime::ImageConfig;
use clap::{Args, ValueEnum};

use super::{load_config, open_builder, open_store, CmdResult, GlobalArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InspectKind {
    Container,
    Image,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Container or image name or ID
    pub name: String,

    /// What the name refers to
    #[arg(short, long, value_enum, default_value_t = InspectKind::Container)]
    pub r#type: InspectKind,
}

pub async fn execute(global: &GlobalArgs, args: InspectArgs) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;

    let json = match args.r#type {
        InspectKind::Container => {
            let builder = open_builder(&store, &args.name)?;
            serde_json::to_string_pretty(&builder)?
        }
        InspectKind::Image => {
            let image = store.image(&args.name)?;
            let config = ImageConfig::from_json(&store.image_config(&image.id)?)?;
            let manifest: serde_json::Value =
                serde_json::from_slice(&store.image_manifest(&image.id)?)?;
            serde_json::to_string_pretty(&serde_json::json!({
                "image": image,
                "manifest": manifest,
                "config": config,
            }))?
        }
    };
    println!("{json}");
    Ok(())
}
