//! Command implementations for the admin tool.
//!
//! Every command builds a catalog from the loaded settings, resolves the
//! manager for one owner and storage type, runs, and flushes the manager
//! before returning so batched writes are never left behind.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{debug, info};

use shack_storage::{StorageCatalog, StoragesManager};
use shack_types::Settings;

use crate::cli::{Cli, Commands, KeyCommands, StorageCommands};

/// Load settings and apply CLI overrides (highest precedence).
pub fn load_settings(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    data_root_override: Option<&str>,
) -> Result<Settings> {
    let settings = Settings::load(config_path).context("Failed to load configuration")?;
    Ok(apply_overrides(settings, log_level_override, data_root_override))
}

/// Apply CLI flag overrides to loaded settings.
pub fn apply_overrides(
    mut settings: Settings,
    log_level_override: Option<&str>,
    data_root_override: Option<&str>,
) -> Settings {
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
    if let Some(data_root) = data_root_override {
        settings.data_root = data_root.to_string();
    }
    settings
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `log_level`.
pub fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Run a parsed command against `settings`, writing results to `out`.
pub async fn run(settings: &Settings, command: Commands, out: &mut dyn Write) -> Result<()> {
    let catalog = StorageCatalog::from_settings(settings).context("Invalid storage configuration")?;
    debug!(data_root = %settings.expanded_data_root().display(), "Loaded storage catalog");

    match command {
        Commands::Types => show_types(&catalog, out),
        Commands::Storages {
            owner,
            storage_type,
            command,
        } => {
            let manager = open_manager(settings, &catalog, &owner, storage_type.as_deref())?;
            let result = handle_storages(&manager, command, out).await;
            finish(&manager, result).await
        }
        Commands::Keys {
            owner,
            storage,
            storage_type,
            command,
        } => {
            let manager = open_manager(settings, &catalog, &owner, storage_type.as_deref())?;
            let result = handle_keys(&manager, &storage, command, out).await;
            finish(&manager, result).await
        }
    }
}

/// Parse the CLI, load settings, install logging and run.
pub async fn run_cli(cli: Cli) -> Result<()> {
    let settings = load_settings(
        cli.config.as_deref(),
        cli.log_level.as_deref(),
        cli.data_root.as_deref(),
    )?;
    init_logging(&settings.log_level)?;
    let mut stdout = std::io::stdout().lock();
    run(&settings, cli.command, &mut stdout).await
}

fn open_manager(
    settings: &Settings,
    catalog: &StorageCatalog,
    owner: &str,
    storage_type: Option<&str>,
) -> Result<Arc<StoragesManager>> {
    if !shack_types::is_valid_id(owner) {
        bail!("Invalid owner name: {owner}");
    }
    catalog
        .manager(settings.owner_root(owner), storage_type)
        .with_context(|| format!("Failed to open storages of {owner}"))
}

async fn finish(manager: &StoragesManager, result: Result<()>) -> Result<()> {
    let flushed = manager
        .flush_all()
        .await
        .context("Failed to flush pending writes");
    result?;
    let count = flushed?;
    debug!(count, "Flushed storages");
    Ok(())
}

fn show_types(catalog: &StorageCatalog, out: &mut dyn Write) -> Result<()> {
    for name in catalog.storage_types() {
        let info = catalog.describe(Some(&name))?;
        let marker = if name == catalog.default_type() {
            " (default)"
        } else {
            ""
        };
        writeln!(out, "{name}{marker}")?;
        writeln!(out, "  drivers:    {}", info.drivers)?;
        writeln!(out, "  persistent: {}", info.persistent)?;
        writeln!(out, "  policy:     {}", info.policy.as_deref().unwrap_or("-"))?;
        writeln!(out, "  cache:      {}", info.cache.as_deref().unwrap_or("-"))?;
        writeln!(out, "  {}", info.description)?;
    }
    Ok(())
}

async fn handle_storages(
    manager: &StoragesManager,
    command: StorageCommands,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        StorageCommands::List => {
            for id in manager.list().await? {
                writeln!(out, "{id}")?;
            }
        }
        StorageCommands::Create { id } => {
            let storage = manager.create(&id).await?;
            info!(storage_id = %id, "Created storage");
            writeln!(out, "id:           {}", storage.id())?;
            writeln!(out, "api key:      {}", storage.api_key())?;
            writeln!(out, "secret key:   {}", storage.secret_key())?;
            writeln!(out, "readonly key: {}", storage.readonly_key())?;
        }
        StorageCommands::Delete { id } => {
            manager.delete(&id).await?;
            writeln!(out, "Deleted storage {id}")?;
        }
        StorageCommands::Info { id } => {
            let storage = manager.get(&id).await?;
            let stats = storage.stats().await?;
            writeln!(out, "id:           {}", storage.id())?;
            writeln!(out, "type:         {}", manager.storage_type())?;
            writeln!(out, "version:      {}", storage.metadata_version())?;
            writeln!(out, "api key:      {}", storage.api_key())?;
            writeln!(out, "secret key:   {}", storage.secret_key())?;
            writeln!(out, "readonly key: {}", storage.readonly_key())?;
            writeln!(out, "keys:         {}", stats.keys)?;
            writeln!(out, "size bytes:   {}", stats.size_bytes)?;
            writeln!(out, "pending:      {}", stats.pending_changes)?;
            writeln!(out, "cached keys:  {}", stats.cached_keys)?;
        }
        StorageCommands::RotateSecret { id } => {
            let storage = manager.get(&id).await?;
            writeln!(out, "{}", storage.generate_secret_key().await?)?;
        }
        StorageCommands::RotateReadonly { id } => {
            let storage = manager.get(&id).await?;
            writeln!(out, "{}", storage.generate_readonly_key().await?)?;
        }
        StorageCommands::Purge => {
            manager.purge().await?;
            writeln!(out, "Purged all {} storages", manager.storage_type())?;
        }
    }
    Ok(())
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Not valid JSON: {text}"))
}

async fn handle_keys(
    manager: &StoragesManager,
    storage_id: &str,
    command: KeyCommands,
    out: &mut dyn Write,
) -> Result<()> {
    let storage = manager.get(storage_id).await?;
    match command {
        KeyCommands::List => {
            for key in storage.list().await? {
                writeln!(out, "{key}")?;
            }
        }
        KeyCommands::Get { key, metadata } => {
            let value = if metadata {
                storage.get_with_metadata(&key).await?
            } else {
                storage.get(&key).await?
            };
            writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
        }
        KeyCommands::Set { key, value, source } => {
            storage.set(&key, parse_json(&value)?, source.as_deref()).await?;
            writeln!(out, "OK")?;
        }
        KeyCommands::Update { key, patch, source } => {
            let (merged, created) = storage
                .update(&key, parse_json(&patch)?, source.as_deref())
                .await?;
            if created {
                info!(storage_id, key = %key, "Created key by update");
            }
            writeln!(out, "{}", serde_json::to_string_pretty(&merged)?)?;
        }
        KeyCommands::Delete { key } => {
            storage.delete(&key).await?;
            writeln!(out, "OK")?;
        }
        KeyCommands::Exist { key } => {
            writeln!(out, "{}", storage.exist(&key).await?)?;
        }
        KeyCommands::Purge => {
            storage.purge().await?;
            writeln!(out, "Purged storage {storage_id}")?;
        }
    }
    Ok(())
}
