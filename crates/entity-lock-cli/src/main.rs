//! entity-lock CLI - schema bootstrap, lock id lookup, and lock diagnostics

use anyhow::Context;
use clap::{Parser, Subcommand};
use entity_lock_core::config::Config;
use entity_lock_core::store::{self, MappingStore};
use entity_lock_core::{DistributedLockService, LockHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "entity-lock")]
#[command(author, version, about = "Entity-keyed shared/exclusive locks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the mapping table if missing and apply pending migrations
    Migrate,

    /// Show backend, schema version, and mapping count
    Status,

    /// Print the lock id for an entity, creating the mapping if needed
    Resolve {
        /// Entity UUID
        entity: Uuid,
    },

    /// Acquire a lock on an entity, hold it, then release it
    Hold {
        /// Entity UUID
        entity: Uuid,
        /// Take a write (exclusive) lock instead of a read lock
        #[arg(short, long)]
        write: bool,
        /// Seconds to hold the lock before releasing
        #[arg(short, long, default_value_t = 0)]
        seconds: u64,
        /// Give up if the lock is not granted within this many milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so json output stays parseable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("entity_lock=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => cmd_migrate(cli.format, cli.quiet).await,
        Commands::Status => cmd_status(cli.format).await,
        Commands::Resolve { entity } => cmd_resolve(entity, cli.format).await,
        Commands::Hold {
            entity,
            write,
            seconds,
            deadline_ms,
        } => cmd_hold(entity, write, seconds, deadline_ms, cli.format, cli.quiet).await,
        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Open the mapping store without touching its schema
async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn MappingStore>> {
    let mut database = config.database.clone();
    database.auto_migrate = false;
    store::connect(&database)
        .await
        .with_context(|| format!("Failed to open mapping store at {}", database.redacted_url()))
}

async fn cmd_migrate(format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let store = open_store(&config).await?;

    let before = store.migration_status().await?;
    store.migrate().await?;
    let after = store.migration_status().await?;
    info!(
        from = before.current_version,
        to = after.current_version,
        "Mapping store schema is current"
    );

    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "previous_version": before.current_version,
                "current_version": after.current_version,
                "applied": before.needs_migration,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            if !quiet {
                if before.needs_migration {
                    println!(
                        "Migrated schema from v{} to v{}",
                        before.current_version, after.current_version
                    );
                } else {
                    println!("Schema already at v{}", after.current_version);
                }
            }
        }
    }
    Ok(())
}

async fn cmd_status(format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load()?;
    let backend = config.database.backend()?;
    let store = open_store(&config).await?;

    let status = store.migration_status().await?;
    let mappings = if status.needs_migration {
        None
    } else {
        Some(store.count().await?)
    };

    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "backend": format!("{:?}", backend).to_lowercase(),
                "url": config.database.redacted_url(),
                "schema": status,
                "mappings": mappings,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            println!("entity-lock Status");
            println!("==================");
            println!();
            println!("Backend:  {:?}", backend);
            println!("URL:      {}", config.database.redacted_url());
            println!(
                "Schema:   v{} (latest v{}){}",
                status.current_version,
                status.target_version,
                if status.needs_migration {
                    " - run `entity-lock migrate`"
                } else {
                    ""
                }
            );
            match mappings {
                Some(count) => println!("Mappings: {}", count),
                None => println!("Mappings: (schema not created)"),
            }
        }
    }
    Ok(())
}

async fn cmd_resolve(entity: Uuid, format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load()?;
    let service = DistributedLockService::connect(&config).await?;

    let start = Instant::now();
    let lock_id = service.resolver().resolve(entity).await?;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "entity_id": entity,
                "lock_id": lock_id,
                "elapsed_ms": elapsed_ms,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => println!("{}", lock_id),
    }
    Ok(())
}

async fn cmd_hold(
    entity: Uuid,
    write: bool,
    seconds: u64,
    deadline_ms: Option<u64>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let service = DistributedLockService::connect(&config).await?;
    let deadline = deadline_ms.map(Duration::from_millis);

    let start = Instant::now();
    let handle: LockHandle = match (write, deadline) {
        (true, Some(deadline)) => service.acquire_write_lock_within(entity, deadline).await?,
        (true, None) => service.acquire_write_lock(entity).await?,
        (false, Some(deadline)) => service.acquire_read_lock_within(entity, deadline).await?,
        (false, None) => service.acquire_read_lock(entity).await?,
    };
    let acquire_ms = start.elapsed().as_millis() as u64;
    let lock_id = handle.lock_id();
    let mode = handle.mode();

    if format == OutputFormat::Text && !quiet {
        println!(
            "Acquired {} lock {} on {} in {} ms",
            mode.access(),
            lock_id,
            entity,
            acquire_ms
        );
    }

    if seconds > 0 {
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    }

    let start = Instant::now();
    if write {
        service.release_write_lock(handle).await?;
    } else {
        service.release_read_lock(handle).await?;
    }
    let release_ms = start.elapsed().as_millis() as u64;

    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "entity_id": entity,
                "lock_id": lock_id,
                "mode": mode,
                "acquire_ms": acquire_ms,
                "held_seconds": seconds,
                "release_ms": release_ms,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            if !quiet {
                println!("Released {} lock {} in {} ms", mode.access(), lock_id, release_ms);
            }
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
