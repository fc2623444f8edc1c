use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use serde_json::json;
use swap_intermediary::config::LpConfig;
use swap_intermediary::engine::SwapStatus;
use swap_intermediary::storage::{SqliteSwapStorage, SwapStorage as _};
use swap_intermediary::swap::{SwapDirection, SwapId, SwapRecord};

#[derive(Debug, clap::Parser)]
#[command(name = "swap-lp", about = "Operator tooling for the swap intermediary")]
struct Args {
    #[arg(long, default_value = "swap-lp.toml")]
    config: PathBuf,

    /// Overrides `storage.path` from the config.
    #[arg(long)]
    store_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Writes a default config file.
    InitConfig {
        #[arg(long)]
        force: bool,
    },
    #[command(flatten)]
    Store(StoreCommand),
}

/// Commands working on the swap storage.
#[derive(Debug, Subcommand)]
enum StoreCommand {
    /// Lists active swaps.
    List {
        #[arg(long, value_parser = parse_direction)]
        direction: Option<SwapDirection>,
    },
    Show {
        id: String,

        #[arg(long, value_parser = parse_direction)]
        direction: Option<SwapDirection>,
    },
    /// Drops a stuck swap from active storage.
    ForceTerminate {
        id: String,

        #[arg(long, value_parser = parse_direction)]
        direction: Option<SwapDirection>,
    },
}

fn parse_direction(s: &str) -> Result<SwapDirection, String> {
    SwapDirection::parse(s).ok_or_else(|| {
        format!("unknown direction {s}; expected one of to_btc, from_btc, to_btc_ln, from_btc_ln")
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let command = match args.command {
        Command::InitConfig { force } => return init_config(&args.config, force),
        Command::Store(command) => command,
    };

    let config = LpConfig::load(&args.config)?;
    swap_intermediary::logging::init_with_filter(&config.logging.level).ok();
    let store_path = args.store_path.unwrap_or(config.storage.path);
    let storage = SqliteSwapStorage::open(store_path).context("open swap storage")?;

    let out = match command {
        StoreCommand::List { direction } => {
            let records = storage.list().await?;
            let swaps: Vec<_> = records
                .iter()
                .filter(|r| direction.is_none_or(|d| r.direction() == d))
                .map(summary)
                .collect();
            json!({ "swaps": swaps })
        }
        StoreCommand::Show { id, direction } => {
            let record = find(&storage, &id, direction).await?;
            serde_json::to_value(&record).context("encode swap record")?
        }
        StoreCommand::ForceTerminate { id, direction } => {
            let record = find(&storage, &id, direction).await?;
            storage.remove(record.direction(), &record.id).await?;
            tracing::warn!(
                direction = %record.direction(),
                swap_id = %record.id,
                state = record.payload.state_name(),
                "swap force-terminated by operator"
            );
            json!({ "terminated": summary(&record) })
        }
    };

    println!("{}", serde_json::to_string_pretty(&out).context("encode output")?);
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    anyhow::ensure!(
        force || !path.exists(),
        "config {} already exists, pass --force to overwrite",
        path.display()
    );
    LpConfig::default().save(path)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn summary(record: &SwapRecord) -> serde_json::Value {
    json!({
        "status": SwapStatus::of(record),
        "chain_id": record.chain_id,
        "input": record.input_amount().to_string(),
        "output": record.output_amount().to_string(),
        "swap_fee": record.swap_fee().to_string(),
        "created_at": record.metadata.created_at,
    })
}

async fn find(
    storage: &SqliteSwapStorage,
    id: &str,
    direction: Option<SwapDirection>,
) -> Result<SwapRecord> {
    let swap_id: SwapId = id.parse()?;
    let directions = match direction {
        Some(d) => vec![d],
        None => SwapDirection::ALL.to_vec(),
    };
    let mut found = Vec::new();
    for d in directions {
        if let Some(record) = storage.get(d, &swap_id).await? {
            found.push(record);
        }
    }
    match found.len() {
        0 => anyhow::bail!("swap {id} not found"),
        1 => Ok(found.remove(0)),
        _ => anyhow::bail!("swap {id} exists in several directions, pass --direction"),
    }
}
