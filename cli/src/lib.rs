//! A3S Build CLI - buildah-style image building from the command line.

pub mod commands;
pub mod output;
