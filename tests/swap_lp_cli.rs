use std::path::Path;

use anyhow::{Context as _, Result};
use assert_cmd::Command;
use predicates::prelude::*;

use swap_intermediary::storage::{SqliteSwapStorage, SwapStorage as _};
use swap_intermediary::swap::{
    FeeQuote, FromBtcData, FromBtcState, SwapDirection, SwapFees, SwapId, SwapPayload, SwapRecord,
};

fn swap_lp(config: &Path, store: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("swap-lp").context("locate swap-lp binary")?;
    cmd.arg("--config")
        .arg(config)
        .arg("--store-path")
        .arg(store)
        .env("RUST_LOG", "warn");
    Ok(cmd)
}

fn stuck_swap() -> SwapRecord {
    SwapRecord::new(
        SwapId::new("ef".repeat(32), Some(3)),
        "main",
        SwapPayload::FromBtc(FromBtcData {
            state: FromBtcState::Created,
            address: "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".to_string(),
            amount: 20_000,
            output: 198_000,
            gas_amount: 0,
        }),
        SwapFees {
            swap_fee: 160,
            swap_fee_in_token: 1_600,
            quote: FeeQuote::default(),
        },
    )
}

#[test]
fn init_config_refuses_to_overwrite() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let config = dir.path().join("lp.toml");
    let store = dir.path().join("swaps.sqlite3");

    swap_lp(&config, &store)?
        .arg("init-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote"));
    let written = std::fs::read_to_string(&config).context("read written config")?;
    assert!(written.contains("default_chain"));

    swap_lp(&config, &store)?
        .arg("init-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    swap_lp(&config, &store)?
        .args(["init-config", "--force"])
        .assert()
        .success();
    Ok(())
}

#[test]
fn list_and_show_on_empty_store() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let config = dir.path().join("lp.toml");
    let store = dir.path().join("swaps.sqlite3");

    swap_lp(&config, &store)?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"swaps\": []"));

    swap_lp(&config, &store)?
        .args(["show", &"12".repeat(32)])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));

    swap_lp(&config, &store)?
        .args(["list", "--direction", "sideways"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown direction"));
    Ok(())
}

#[tokio::test]
async fn force_terminate_removes_stuck_swap() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let config = dir.path().join("lp.toml");
    let store_path = dir.path().join("swaps.sqlite3");

    let record = stuck_swap();
    let id = record.id.to_string();
    let store = SqliteSwapStorage::open(store_path.clone()).context("open sqlite store")?;
    store.save(&record).await?;

    swap_lp(&config, &store_path)?
        .args(["list", "--direction", "from_btc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"swap_fee\": \"160\""));

    swap_lp(&config, &store_path)?
        .args(["show", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"));

    swap_lp(&config, &store_path)?
        .args(["force-terminate", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("terminated"));

    assert!(store.get(SwapDirection::FromBtc, &record.id).await?.is_none());
    swap_lp(&config, &store_path)?
        .args(["show", &id])
        .assert()
        .failure();
    Ok(())
}
