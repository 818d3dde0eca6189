//! lvstore CLI - Operator command line for lvol stores
//!
//! Every command opens the device file, loads (or creates) the store on it,
//! performs one operation and unloads the store again.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lvstore_blob::{BsDev, DevEngine, FileDev};
use lvstore_common::Config;
use lvstore_lvol::{Lvol, LvolManager, LvolStore, LvsRegistry};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "lvstore-cli")]
#[command(about = "Logical volume store CLI")]
#[command(version)]
struct Args {
    /// Device file holding the store
    #[arg(short, long, env = "LVSTORE_DEVICE")]
    device: PathBuf,

    /// JSON configuration file
    #[arg(short, long, env = "LVSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Format the device and create an empty store
    Init {
        /// Format an existing device file, erasing whatever it holds
        #[arg(long)]
        force: bool,
    },
    /// Show the store summary
    Show,
    /// List lvols
    List,
    /// Create an lvol
    Create {
        /// Size (e.g. 10G, 500M, 4096)
        #[arg(short, long)]
        size: String,
    },
    /// Resize an lvol
    Resize {
        /// Lvol UUID
        #[arg(short, long)]
        uuid: Uuid,
        /// New size (e.g. 20G)
        #[arg(short, long)]
        size: String,
    },
    /// Delete an lvol
    Delete {
        /// Lvol UUID
        #[arg(short, long)]
        uuid: Uuid,
    },
    /// Destroy the store; it must hold no lvols
    Destroy {
        /// Also discard the whole device
        #[arg(long)]
        unmap: bool,
    },
}

/// Parse a human-readable size string (e.g. "10G", "1T", "500M") into bytes.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, multiplier): (&str, u64) = if let Some(n) = s.strip_suffix('T') {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        (s, 1)
    };
    let value: u64 = num
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid size: '{s}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Size out of range: '{s}'"))
}

/// Format bytes as a human-readable size string.
#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    if bytes >= GIB && bytes.is_multiple_of(GIB) {
        format!("{} GiB", bytes / GIB)
    } else if bytes >= MIB && bytes.is_multiple_of(MIB) {
        format!("{} MiB", bytes / MIB)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

/// Refuse to format a device file that already exists unless forced
fn check_init_target(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Device {} already exists; pass --force to erase it",
            path.display()
        );
    }
    Ok(())
}

fn open_device(path: &Path, config: &Config, create: bool) -> Result<Arc<dyn BsDev>> {
    let dev = if create && !path.exists() {
        info!("Creating device file {}", path.display());
        FileDev::create(path, config.device.size_bytes, config.device.block_len)
    } else {
        FileDev::open(path, config.device.block_len)
    }
    .with_context(|| format!("Failed to open device {}", path.display()))?;
    Ok(Arc::new(dev))
}

fn find_lvol(lvs: &LvolStore, uuid: &Uuid) -> Result<Arc<Lvol>> {
    lvs.lvol_by_uuid(uuid)
        .with_context(|| format!("No lvol {uuid} in store {}", lvs.uuid()))
}

fn lvol_json(lvol: &Lvol) -> serde_json::Value {
    json!({
        "uuid": lvol.uuid().to_string(),
        "blob_id": lvol.blob_id().as_u64(),
        "num_clusters": lvol.num_clusters(),
        "size_bytes": lvol.size_bytes(),
    })
}

fn print_store(lvs: &LvolStore, as_json: bool) -> Result<()> {
    if as_json {
        let summary = json!({
            "uuid": lvs.uuid().to_string(),
            "device": lvs.device().name(),
            "cluster_size": lvs.cluster_size(),
            "page_size": lvs.page_size(),
            "total_clusters": lvs.total_clusters(),
            "free_clusters": lvs.free_clusters(),
            "lvols": lvs.lvol_count(),
            "skipped_blobs": lvs.skipped_blobs().iter().map(|id| id.as_u64()).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Lvol Store");
    println!("==========");
    println!("UUID:           {}", lvs.uuid());
    println!("Device:         {}", lvs.device().name());
    println!("Cluster size:   {}", format_size(lvs.cluster_size()));
    println!("Total clusters: {}", lvs.total_clusters());
    println!("Free clusters:  {}", lvs.free_clusters());
    println!(
        "Free space:     {}",
        format_size(lvs.free_clusters() * lvs.cluster_size())
    );
    println!("Lvols:          {}", lvs.lvol_count());
    if !lvs.skipped_blobs().is_empty() {
        println!("Skipped blobs:  {}", lvs.skipped_blobs().len());
    }
    Ok(())
}

fn print_lvols(lvs: &LvolStore, as_json: bool) -> Result<()> {
    let lvols = lvs.lvols();
    if as_json {
        let list: Vec<_> = lvols.iter().map(|l| lvol_json(l)).collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if lvols.is_empty() {
        println!("No lvols found");
        return Ok(());
    }
    println!("{:<38} {:<10} {:<10} {:<12}", "UUID", "BLOB", "CLUSTERS", "SIZE");
    println!("{}", "-".repeat(72));
    for lvol in lvols {
        println!(
            "{:<38} {:<10} {:<10} {:<12}",
            lvol.uuid(),
            lvol.blob_id().to_string(),
            lvol.num_clusters(),
            format_size(lvol.size_bytes())
        );
    }
    Ok(())
}

fn print_lvol(action: &str, lvol: &Lvol, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(&lvol_json(lvol))?);
    } else {
        println!("Lvol {action} successfully!");
        println!();
        println!("  UUID:     {}", lvol.uuid());
        println!("  Blob:     {}", lvol.blob_id());
        println!("  Clusters: {}", lvol.num_clusters());
        println!("  Size:     {}", format_size(lvol.size_bytes()));
    }
    Ok(())
}

/// Destroy a loaded store, unloading it again if the destroy fails
async fn destroy_store(manager: &LvolManager, lvs: &Arc<LvolStore>, unmap: bool) -> Result<()> {
    if let Err(e) = manager.destroy(lvs, unmap).await {
        if let Err(unload) = manager.unload(lvs).await {
            warn!(
                "Failed to unload lvol store {} after failed destroy: {}",
                lvs.uuid(),
                unload
            );
        }
        return Err(e).context("Failed to destroy lvol store");
    }
    Ok(())
}

/// Run one command against a loaded store; the caller unloads it
async fn run_loaded(command: Commands, lvs: &Arc<LvolStore>, as_json: bool) -> Result<()> {
    match command {
        Commands::Show => print_store(lvs, as_json)?,
        Commands::List => print_lvols(lvs, as_json)?,
        Commands::Create { size } => {
            let size = parse_size(&size)?;
            let lvol = lvs.create_lvol(size).await.context("Failed to create lvol")?;
            let printed = print_lvol("created", &lvol, as_json);
            lvol.close().await.context("Failed to close lvol")?;
            printed?;
        }
        Commands::Resize { uuid, size } => {
            let size = parse_size(&size)?;
            let lvol = find_lvol(lvs, &uuid)?;
            lvol.open().await.context("Failed to open lvol")?;
            let resized = lvol.resize(size).await.context("Failed to resize lvol");
            lvol.close().await.context("Failed to close lvol")?;
            resized?;
            print_lvol("resized", &lvol, as_json)?;
        }
        Commands::Delete { uuid } => {
            let lvol = find_lvol(lvs, &uuid)?;
            lvol.destroy().await.context("Failed to delete lvol")?;
            if as_json {
                println!("{}", json!({ "deleted": uuid.to_string() }));
            } else {
                println!("Lvol {uuid} deleted");
            }
        }
        Commands::Init { .. } | Commands::Destroy { .. } => {
            bail!("command does not run against a loaded store")
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(args.config.as_deref())?;
    let manager = LvolManager::new(Arc::new(DevEngine), Arc::new(LvsRegistry::new()));

    match args.command {
        Commands::Init { force } => {
            check_init_target(&args.device, force)?;
            let dev = open_device(&args.device, &config, true)?;
            let lvs = manager
                .init(dev, &config.lvs)
                .await
                .context("Failed to initialize lvol store")?;
            print_store(&lvs, args.json)?;
            manager
                .unload(&lvs)
                .await
                .context("Failed to unload lvol store")?;
        }
        Commands::Destroy { unmap } => {
            let dev = open_device(&args.device, &config, false)?;
            let lvs = manager
                .load(dev)
                .await
                .context("Failed to load lvol store")?;
            let uuid = lvs.uuid();
            destroy_store(&manager, &lvs, unmap).await?;
            if args.json {
                println!("{}", json!({ "destroyed": uuid.to_string() }));
            } else {
                println!("Lvol store {uuid} destroyed");
            }
        }
        command => {
            let dev = open_device(&args.device, &config, false)?;
            let lvs = manager
                .load(dev)
                .await
                .context("Failed to load lvol store")?;
            let result = run_loaded(command, &lvs, args.json).await;
            manager
                .unload(&lvs)
                .await
                .context("Failed to unload lvol store")?;
            result?;
        }
    }

    Ok(())
}
