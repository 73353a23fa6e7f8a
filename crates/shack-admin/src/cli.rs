//! CLI argument parsing for the ShackDB admin tool.
//!
//! CLI flags override all other config sources.

use clap::{Parser, Subcommand};

/// ShackDB admin
///
/// Inspect and modify the storages of a local ShackDB data root.
#[derive(Parser, Debug)]
#[command(name = "shackdb-admin")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/shackdb/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override the data root
    #[arg(long, global = true)]
    pub data_root: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List configured storage types
    Types,

    /// Manage the storages of an owner
    Storages {
        /// Owner whose storages to manage
        owner: String,

        /// Storage type (default from config)
        #[arg(short = 't', long = "type")]
        storage_type: Option<String>,

        #[command(subcommand)]
        command: StorageCommands,
    },

    /// Read and write keys of one storage
    Keys {
        /// Owner of the storage
        owner: String,

        /// Storage id
        storage: String,

        /// Storage type (default from config)
        #[arg(short = 't', long = "type")]
        storage_type: Option<String>,

        #[command(subcommand)]
        command: KeyCommands,
    },
}

/// Storage subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum StorageCommands {
    /// List storage ids
    List,

    /// Create a storage and print its access keys
    Create { id: String },

    /// Delete a storage and all its data
    Delete { id: String },

    /// Show metadata and usage of a storage
    Info { id: String },

    /// Generate a new secret key
    RotateSecret { id: String },

    /// Generate a new readonly key
    RotateReadonly { id: String },

    /// Delete every storage of this type
    Purge,
}

/// Key subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum KeyCommands {
    /// List keys
    List,

    /// Print the value of a key
    Get {
        key: String,

        /// Include modification time and source
        #[arg(long)]
        metadata: bool,
    },

    /// Set a key to a JSON value
    Set {
        key: String,

        /// JSON value
        #[arg(allow_hyphen_values = true)]
        value: String,

        /// Recorded as the writer of the value
        #[arg(long)]
        source: Option<String>,
    },

    /// Merge a JSON object into the object stored under a key
    Update {
        key: String,

        /// JSON object
        patch: String,

        /// Recorded as the writer of the value
        #[arg(long)]
        source: Option<String>,
    },

    /// Delete a key
    Delete { key: String },

    /// Print whether a key exists
    Exist { key: String },

    /// Delete every key, keeping the access keys
    Purge,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
