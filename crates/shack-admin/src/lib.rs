//! ShackDB admin library exports.
//!
//! This crate provides the operator binary for a local ShackDB data root.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (types, storages, keys)

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands, KeyCommands, StorageCommands};
pub use commands::{init_logging, load_settings, run, run_cli};
