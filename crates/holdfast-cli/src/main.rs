//! Holdfast CLI - inspect and administer resource locks

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use holdfast_core::config::Config;
use holdfast_core::domain::locking::{FileLockStore, Lock, LockManager, lock_key};
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "holdfast")]
#[command(author, version, about = "Resource locks and version guards", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Lock directory (defaults to locking.lock_dir from config)
    #[arg(long, global = true)]
    lock_dir: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage resource locks
    Locks {
        #[command(subcommand)]
        action: LockAction,
    },

    /// Remove expired lock records
    Sweep {
        /// Keep sweeping periodically until interrupted
        #[arg(short, long)]
        watch: bool,
        /// Seconds between sweeps (defaults to locking.cleanup_interval_secs)
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// List active locks
    List {
        /// Only locks held by this owner
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show the active lock on a resource
    Show {
        resource_type: String,
        resource_id: String,
    },
    /// Acquire (or renew) a lock on a resource
    Acquire {
        resource_type: String,
        resource_id: String,
        /// Owner ID
        #[arg(long)]
        owner: String,
        /// Owner display name (defaults to the owner ID)
        #[arg(long)]
        name: Option<String>,
        /// Lock lifetime in seconds (defaults to locking.default_ttl_secs)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Extend a lock's expiry
    Renew {
        lock_id: Uuid,
        /// New lifetime in seconds, counted from now
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Release a lock held by the given owner
    Release {
        lock_id: Uuid,
        #[arg(long)]
        owner: String,
    },
    /// Release a lock regardless of its owner
    ForceRelease {
        lock_id: Uuid,
        /// Operator performing the release
        #[arg(long)]
        admin: String,
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

/// Output settings shared by every command
#[derive(Clone, Copy)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn print_json<T: serde::Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "holdfast=info".parse::<tracing_subscriber::filter::Directive>() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(&err),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Locks { action } => {
            let config = Config::load()?;
            let manager = open_manager(&config, cli.lock_dir).await?;
            cmd_locks(&manager, action, out).await
        }

        Commands::Sweep {
            watch,
            interval_secs,
        } => {
            let config = Config::load()?;
            let manager = open_manager(&config, cli.lock_dir).await?;
            cmd_sweep(&manager, watch, interval_secs.map(Duration::from_secs), out).await
        }

        Commands::Config { action } => cmd_config(action, out),
    }
}

/// Print an error with its code and hint, and pick the exit status
///
/// Conflicts exit with 2 so scripts can tell "try later" from failure.
fn report(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<holdfast_core::Error>() {
        Some(e) => {
            eprintln!("Error [{}]: {}", e.code(), e);
            if let Some(hint) = e.suggestion() {
                eprintln!("  Hint: {}", hint);
            }
            if e.is_conflict() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
        None => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn open_manager(config: &Config, lock_dir: Option<PathBuf>) -> anyhow::Result<LockManager> {
    let mut lock_config = config.lock_config();
    if let Some(dir) = lock_dir {
        lock_config = lock_config.with_lock_dir(dir);
    }

    let store = FileLockStore::open(lock_config.lock_dir.clone()).await?;
    Ok(LockManager::new(Arc::new(store), lock_config))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_locks(manager: &LockManager, action: LockAction, out: Output) -> anyhow::Result<()> {
    match action {
        LockAction::List { owner } => {
            let mut locks = match owner.as_deref() {
                Some(owner_id) => manager.get_user_locks(owner_id).await?,
                None => manager.list_locks().await?,
            };
            locks.sort_by(|a, b| a.lock_key().cmp(&b.lock_key()));

            if out.json() {
                return out.print_json(&locks);
            }
            if locks.is_empty() {
                if !out.quiet {
                    println!("No active locks.");
                }
                return Ok(());
            }
            for lock in &locks {
                println!(
                    "{}  {:<30}  {} ({})  expires in {}s",
                    lock.lock_id,
                    lock.lock_key(),
                    lock.owner_name,
                    lock.owner_id,
                    lock.remaining().as_secs()
                );
            }
        }

        LockAction::Show {
            resource_type,
            resource_id,
        } => {
            let lock = manager.check_lock(&resource_type, &resource_id).await?;
            if out.json() {
                return out.print_json(&lock);
            }
            match lock {
                Some(lock) => print_lock(&lock),
                None => println!("{} is unlocked", lock_key(&resource_type, &resource_id)),
            }
        }

        LockAction::Acquire {
            resource_type,
            resource_id,
            owner,
            name,
            ttl_secs,
        } => {
            let owner_name = name.as_deref().unwrap_or(&owner);
            let lock = manager
                .acquire_lock(
                    &resource_type,
                    &resource_id,
                    &owner,
                    owner_name,
                    ttl_secs.map(Duration::from_secs),
                )
                .await?;

            if out.json() {
                return out.print_json(&lock);
            }
            if out.quiet {
                println!("{}", lock.lock_id);
            } else {
                println!("Lock acquired.");
                print_lock(&lock);
            }
        }

        LockAction::Renew { lock_id, ttl_secs } => {
            let lock = manager
                .renew_lock(lock_id, ttl_secs.map(Duration::from_secs))
                .await?;

            if out.json() {
                return out.print_json(&lock);
            }
            if !out.quiet {
                println!("Lock renewed until {}", lock.expires_at);
            }
        }

        LockAction::Release { lock_id, owner } => {
            manager.release_lock(lock_id, &owner).await?;
            if out.json() {
                return out.print_json(&serde_json::json!({ "lock_id": lock_id, "released": true }));
            }
            if !out.quiet {
                println!("Lock {} released.", lock_id);
            }
        }

        LockAction::ForceRelease { lock_id, admin } => {
            let removed = manager.force_release_lock(lock_id, &admin).await?;
            if out.json() {
                return out
                    .print_json(&serde_json::json!({ "lock_id": lock_id, "released": removed }));
            }
            if !out.quiet {
                if removed {
                    println!("Lock {} force-released by {}.", lock_id, admin);
                } else {
                    println!("Lock {} was not held.", lock_id);
                }
            }
        }
    }
    Ok(())
}

fn print_lock(lock: &Lock) {
    println!("  ID: {}", lock.lock_id);
    println!("  Resource: {}", lock.lock_key());
    println!("  Owner: {} ({})", lock.owner_name, lock.owner_id);
    println!("  Acquired: {}", lock.acquired_at);
    println!(
        "  Expires: {} (in {}s)",
        lock.expires_at,
        lock.remaining().as_secs()
    );
    if lock.renewal_count > 0 {
        println!("  Renewals: {}", lock.renewal_count);
    }
}

async fn cmd_sweep(
    manager: &LockManager,
    watch: bool,
    interval: Option<Duration>,
    out: Output,
) -> anyhow::Result<()> {
    if !watch {
        let removed = manager.cleanup_expired_locks().await?;
        if out.json() {
            return out.print_json(&serde_json::json!({ "removed": removed }));
        }
        if !out.quiet {
            println!("Removed {} expired lock(s).", removed);
        }
        return Ok(());
    }

    let task = manager.spawn_cleanup_task(interval);
    if !out.quiet {
        println!("Sweeping expired locks. Press Ctrl-C to stop.");
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, stopping sweeper");
    task.shutdown().await;
    Ok(())
}

fn cmd_config(action: ConfigAction, out: Output) -> anyhow::Result<()> {
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
            if !out.quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            if out.json() {
                let map: serde_json::Map<String, serde_json::Value> = items
                    .into_iter()
                    .map(|(key, value)| (key, serde_json::Value::String(value)))
                    .collect();
                return out.print_json(&map);
            }
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !out.quiet {
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
