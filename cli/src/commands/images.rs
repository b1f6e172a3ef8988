//! `a3s-build images` command.

use clap::Args;

use crate::output;

use super::{load_config, open_store, CmdResult, GlobalArgs};

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Only show image IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Show full IDs
    #[arg(long)]
    pub no_trunc: bool,

    /// Format output using placeholders: {{.ID}}, {{.Name}}, {{.Tag}},
    /// {{.Digest}}, {{.Created}}
    #[arg(long)]
    pub format: Option<String>,
}

pub async fn execute(global: &GlobalArgs, args: ImagesArgs) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;
    let mut images = store.images()?;
    images.sort_by(|a, b| b.created.cmp(&a.created));

    let mut rows = Vec::new();
    for image in &images {
        let id = if args.no_trunc {
            image.id.clone()
        } else {
            output::short_id(&image.id)
        };
        let created = output::format_ago(&image.created);
        if image.names.is_empty() {
            rows.push(ImageRow {
                id,
                name: "<none>".to_string(),
                tag: "<none>".to_string(),
                digest: image.digest.clone(),
                created,
            });
            continue;
        }
        for name in &image.names {
            let (repo, tag) = split_name(name);
            rows.push(ImageRow {
                id: id.clone(),
                name: repo.to_string(),
                tag: tag.to_string(),
                digest: image.digest.clone(),
                created: created.clone(),
            });
        }
    }

    if args.quiet {
        let mut seen = std::collections::BTreeSet::new();
        for row in &rows {
            if seen.insert(row.id.clone()) {
                println!("{}", row.id);
            }
        }
        return Ok(());
    }

    if let Some(ref fmt) = args.format {
        for row in &rows {
            println!("{}", row.apply_format(fmt));
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "IMAGE ID", "CREATED"]);
    for row in &rows {
        table.add_row(vec![&row.name, &row.tag, &row.id, &row.created]);
    }
    println!("{table}");
    Ok(())
}

/// Repository and tag of a store name.
fn split_name(name: &str) -> (&str, &str) {
    let slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[slash..].rfind(':') {
        Some(i) => (&name[..slash + i], &name[slash + i + 1..]),
        None => (name, "<none>"),
    }
}

/// Pre-computed display fields for a single image row.
struct ImageRow {
    id: String,
    name: String,
    tag: String,
    digest: String,
    created: String,
}

impl ImageRow {
    /// Apply a format template, replacing `{{.Field}}` placeholders.
    fn apply_format(&self, fmt: &str) -> String {
        fmt.replace("{{.ID}}", &self.id)
            .replace("{{.Name}}", &self.name)
            .replace("{{.Tag}}", &self.tag)
            .replace("{{.Digest}}", &self.digest)
            .replace("{{.Created}}", &self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("app:latest"), ("app", "latest"));
        assert_eq!(split_name("localhost:5000/app:v1"), ("localhost:5000/app", "v1"));
        assert_eq!(split_name("localhost:5000/app"), ("localhost:5000/app", "<none>"));
    }

    #[test]
    fn test_apply_format() {
        let row = ImageRow {
            id: "abc".to_string(),
            name: "app".to_string(),
            tag: "v1".to_string(),
            digest: "sha256:00".to_string(),
            created: "now".to_string(),
        };
        assert_eq!(row.apply_format("{{.Name}}:{{.Tag}} {{.ID}}"), "app:v1 abc");
    }
}
