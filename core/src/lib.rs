//! A3S Build Core - Foundational Types
//!
//! Error taxonomy, global configuration, ID-mapping arithmetic and
//! registry policy shared by the build runtime and the CLI.

pub mod config;
pub mod dns;
pub mod error;
pub mod idmap;
pub mod registry;

// Re-export commonly used types
pub use config::BuildConfig;
pub use error::{BuildError, Result};
pub use idmap::{IdMap, IdMappings, IdPair};
pub use registry::RegistrySources;

/// A3S Build version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
