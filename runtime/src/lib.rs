//! A3S Build Runtime - container image build and commit pipeline.
//!
//! This crate provides working containers backed by a local layer store,
//! copying content into them, running commands inside them, and
//! committing them to images in the store or in OCI layout directories.

#![allow(clippy::result_large_err)]

pub mod add;
pub mod archive;
pub mod builder;
pub mod commit;
pub mod copier;
pub mod define;
pub mod digest;
pub mod digester;
pub mod image;
pub mod pipe;
pub mod retry;
pub mod run;
pub mod store;
pub mod tarfilter;
pub mod user;

// Re-export common types
pub use add::{AddOptions, SourceKind};
pub use archive::Compression;
pub use builder::{Builder, BuilderOptions, LinkedLayer};
pub use commit::{
    CommitDestination, CommitOptions, CommitResult, ConfidentialWorkloadOptions, TeeType,
};
pub use define::{Isolation, ManifestType, NamespaceOption, NetworkPolicy, TerminalPolicy};
pub use digester::{CompositeDigester, ContentType, Digester};
pub use image::{History, ImageConfig};
pub use retry::RetryOptions;
pub use run::{run_chroot_helper, RunMount, RunOptions, CHROOT_HELPER_COMMAND};
pub use store::layout::OciLayout;
pub use store::{Container, Image, Layer, Store};

/// A3S Build Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
