//! End-to-end: working container, COPY, commit, and a second build on top.
//!
//! Everything here runs unprivileged against a temporary store; RUN is not
//! exercised because it needs a runtime or the chroot helper binary.

use std::path::Path;

use a3s_build_runtime::image::oci::OciManifest;
use a3s_build_runtime::{
    AddOptions, Builder, BuilderOptions, CommitOptions, Compression, ImageConfig, OciLayout, Store,
};
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

fn store(dir: &Path) -> Store {
    Store::new(&dir.join("root"), &dir.join("run")).unwrap()
}

fn context(dir: &Path) -> std::path::PathBuf {
    let ctx = dir.join("context");
    std::fs::create_dir_all(ctx.join("src")).unwrap();
    std::fs::write(ctx.join("src/main.txt"), "main").unwrap();
    std::fs::write(ctx.join("src/skip.log"), "noise").unwrap();
    std::fs::write(ctx.join("VERSION"), "1.0").unwrap();
    ctx
}

fn options(ctx: &Path) -> AddOptions<'static> {
    AddOptions {
        context_dir: Some(ctx.to_path_buf()),
        excludes: vec!["**/*.log".to_string()],
        ..Default::default()
    }
}

fn pinned() -> CommitOptions {
    CommitOptions {
        history_timestamp: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_copy_commit_and_rebuild() {
    let dir = TempDir::new().unwrap();
    let store = store(dir.path());
    let ctx = context(dir.path());

    let mut builder = Builder::new(
        &store,
        BuilderOptions {
            from_image: "scratch".to_string(),
            ..Default::default()
        },
    )
    .unwrap();
    builder
        .add(&store, "/app/", false, options(&ctx), &["src".to_string()])
        .await
        .unwrap();
    builder.set_created_by("COPY src /app/");
    builder.set_cmd(Some(vec!["/app/main.txt".to_string()]));
    builder.save(&store).unwrap();
    let base = builder.commit(&store, "base", pinned()).await.unwrap();

    let mut next = Builder::new(
        &store,
        BuilderOptions {
            from_image: "base".to_string(),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(next.from_image_id, base.image_id);
    let rootfs = next.rootfs(&store).unwrap();
    assert_eq!(std::fs::read_to_string(rootfs.join("app/main.txt")).unwrap(), "main");
    assert!(!rootfs.join("app/skip.log").exists());

    next.add(&store, "/", false, options(&ctx), &["VERSION".to_string()])
        .await
        .unwrap();
    next.set_created_by("COPY VERSION /");

    let out = dir.path().join("layout");
    let dest = format!("oci:{}:v1", out.display());
    let options = CommitOptions {
        compression: Compression::Gzip,
        ..pinned()
    };
    next.commit(&store, &dest, options).await.unwrap();

    let layout = OciLayout::open(&out).unwrap();
    let image = layout.image(Some("v1")).unwrap();
    let manifest: OciManifest = serde_json::from_slice(&image.manifest).unwrap();
    let config = ImageConfig::from_json(&image.config).unwrap();
    assert_eq!(manifest.layers.len(), 2);
    assert_eq!(config.diff_ids.len(), 2);
    assert_eq!(config.history.len(), 2);
    assert_eq!(config.history[0].created_by, "COPY src /app/");
    assert_eq!(config.history[1].created_by, "COPY VERSION /");
    assert_eq!(config.config.cmd, Some(vec!["/app/main.txt".to_string()]));

    // the layout image can itself be used as a base
    let mut from_layout = Builder::new(
        &store,
        BuilderOptions {
            from_image: format!("oci:{}:v1", out.display()),
            ..Default::default()
        },
    )
    .unwrap();
    let rootfs = from_layout.rootfs(&store).unwrap();
    assert_eq!(std::fs::read_to_string(rootfs.join("VERSION")).unwrap(), "1.0");
    assert_eq!(std::fs::read_to_string(rootfs.join("app/main.txt")).unwrap(), "main");
}

#[tokio::test]
async fn test_pinned_commits_are_reproducible() {
    let dir = TempDir::new().unwrap();
    let store = store(dir.path());
    let ctx = context(dir.path());

    let mut digests = Vec::new();
    for i in 0..2 {
        let mut builder = Builder::new(
            &store,
            BuilderOptions {
                from_image: "scratch".to_string(),
                container: Some(format!("repro-{i}")),
                ..Default::default()
            },
        )
        .unwrap();
        let mut add = options(&ctx);
        add.timestamp = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        builder
            .add(&store, "/app/", false, add, &["src".to_string()])
            .await
            .unwrap();
        builder.set_created_by("COPY src /app/");
        let out = dir.path().join(format!("out-{i}"));
        let result = builder
            .commit(&store, &format!("oci:{}", out.display()), pinned())
            .await
            .unwrap();
        digests.push((result.image_id, result.manifest_digest));
    }
    assert_eq!(digests[0], digests[1]);
}
