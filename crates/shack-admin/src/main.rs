//! ShackDB admin
//!
//! Inspect and modify storages on a local data root.
//!
//! # Usage
//!
//! ```bash
//! shackdb-admin types
//! shackdb-admin storages <OWNER> [--type TYPE] list|create|delete|info|rotate-secret|rotate-readonly|purge
//! shackdb-admin keys <OWNER> <STORAGE> [--type TYPE] list|get|set|update|delete|exist|purge
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/shackdb/config.toml)
//! 3. Environment variables (SHACK__*)
//! 4. CLI flags

use anyhow::Result;

use shack_admin::{run_cli, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    run_cli(Cli::parse_args()).await
}
