//! `a3s-build from` command.

use a3s_build_runtime::{Builder, BuilderOptions, Isolation, ManifestType};
use a3s_build_core::{IdMap, IdMappings};
use clap::Args;

use super::{load_config, open_store, CmdResult, GlobalArgs};

#[derive(Args, Debug)]
pub struct FromArgs {
    /// Image name, `oci:<dir>[:<tag>]`, or `scratch`
    pub image: String,

    /// Name of the working container
    #[arg(long)]
    pub name: Option<String>,

    /// Suffix for generated container names
    #[arg(long)]
    pub suffix: Option<String>,

    /// Image format used by later commits: oci or docker
    #[arg(long)]
    pub format: Option<String>,

    /// Isolation for RUN: oci, chroot or rootless
    #[arg(long)]
    pub isolation: Option<String>,

    /// UID mapping `container:host:size`
    #[arg(long = "userns-uid-map")]
    pub uid_map: Vec<String>,

    /// GID mapping `container:host:size`
    #[arg(long = "userns-gid-map")]
    pub gid_map: Vec<String>,

    /// Capabilities added for RUN
    #[arg(long = "cap-add")]
    pub cap_add: Vec<String>,

    /// Devices added for RUN
    #[arg(long)]
    pub device: Vec<String>,

    /// Keep the base image's base-name and base-digest annotations
    #[arg(long)]
    pub preserve_annotations: bool,

    /// Mount the root filesystem right away
    #[arg(long)]
    pub mount: bool,
}

fn parse_maps(specs: &[String]) -> Result<Vec<IdMap>, Box<dyn std::error::Error>> {
    let mut maps = Vec::with_capacity(specs.len());
    for spec in specs {
        maps.push(IdMap::parse(spec)?);
    }
    Ok(maps)
}

pub async fn execute(global: &GlobalArgs, args: FromArgs) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;

    let isolation: Isolation = match &args.isolation {
        Some(s) => s.parse()?,
        None => config.default_isolation.parse()?,
    };
    let format: ManifestType = match &args.format {
        Some(s) => s.parse()?,
        None => ManifestType::Oci,
    };
    let mut capabilities = config.default_capabilities.clone();
    for cap in args.cap_add {
        if !capabilities.contains(&cap) {
            capabilities.push(cap);
        }
    }

    let options = BuilderOptions {
        from_image: args.image,
        container: args.name,
        container_suffix: args.suffix,
        isolation,
        id_mappings: IdMappings::new(parse_maps(&args.uid_map)?, parse_maps(&args.gid_map)?),
        capabilities,
        devices: args.device,
        format,
        preserve_base_image_annotations: args.preserve_annotations,
        mount: args.mount,
        ..Default::default()
    };
    let builder = Builder::new(&store, options)?;
    println!("{}", builder.container);
    Ok(())
}
