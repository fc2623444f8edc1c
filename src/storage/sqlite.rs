use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension as _, params, params_from_iter};

use super::SwapStorage;
use crate::swap::{SwapDirection, SwapId, SwapRecord, unix_time};

#[derive(Debug, Clone)]
pub struct SqliteSwapStorage {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteSwapStorage {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))?;
            f(&conn)
        })
        .await
        .context("sqlite task join")?
    }
}

fn sequence_key(id: &SwapId) -> String {
    id.sequence.map(|s| s.to_string()).unwrap_or_default()
}

fn decode_rows(rows: Vec<(String, String)>) -> Result<Vec<SwapRecord>> {
    rows.into_iter()
        .map(|(key, data)| {
            serde_json::from_str(&data).with_context(|| format!("decode swap record {key}"))
        })
        .collect()
}

fn query_sync(conn: &Connection, direction: SwapDirection, states: &[i32]) -> Result<Vec<SwapRecord>> {
    if states.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; states.len()].join(", ");
    let sql = format!(
        "SELECT hash, data FROM swaps WHERE direction = ? AND state IN ({placeholders}) ORDER BY hash, sequence"
    );
    let mut stmt = conn.prepare(&sql).context("prepare query swaps")?;
    let mut args: Vec<rusqlite::types::Value> = vec![direction.as_str().to_string().into()];
    args.extend(states.iter().map(|s| rusqlite::types::Value::from(i64::from(*s))));
    let rows = stmt
        .query_map(params_from_iter(args), |row| Ok((row.get(0)?, row.get(1)?)))
        .context("query swaps")?
        .collect::<rusqlite::Result<Vec<(String, String)>>>()
        .context("read swap rows")?;
    decode_rows(rows)
}

fn get_sync(conn: &Connection, direction: SwapDirection, id: &SwapId) -> Result<Option<SwapRecord>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM swaps WHERE direction = ?1 AND hash = ?2 AND sequence = ?3",
            params![direction.as_str(), &id.hash, sequence_key(id)],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("get swap {id}"))?;
    data.map(|data| serde_json::from_str(&data).with_context(|| format!("decode swap record {id}")))
        .transpose()
}

fn save_sync(conn: &Connection, record: &SwapRecord) -> Result<()> {
    let data = serde_json::to_string(record).context("encode swap record")?;
    let updated_at = i64::try_from(unix_time()).unwrap_or(i64::MAX);
    conn.execute(
        r#"
INSERT INTO swaps (
  direction,
  hash,
  sequence,
  chain_id,
  state,
  data,
  updated_at
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7
)
ON CONFLICT(direction, hash, sequence) DO UPDATE SET
  chain_id = excluded.chain_id,
  state = excluded.state,
  data = excluded.data,
  updated_at = excluded.updated_at
"#,
        params![
            record.direction().as_str(),
            &record.id.hash,
            sequence_key(&record.id),
            &record.chain_id,
            record.state_code(),
            data,
            updated_at,
        ],
    )
    .with_context(|| format!("save swap {}", record.id))?;
    Ok(())
}

fn remove_sync(conn: &Connection, direction: SwapDirection, id: &SwapId) -> Result<bool> {
    let rows = conn
        .execute(
            "DELETE FROM swaps WHERE direction = ?1 AND hash = ?2 AND sequence = ?3",
            params![direction.as_str(), &id.hash, sequence_key(id)],
        )
        .with_context(|| format!("remove swap {id}"))?;
    Ok(rows > 0)
}

fn list_sync(conn: &Connection) -> Result<Vec<SwapRecord>> {
    let mut stmt = conn
        .prepare("SELECT hash, data FROM swaps ORDER BY direction, hash, sequence")
        .context("prepare list swaps")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .context("list swaps")?
        .collect::<rusqlite::Result<Vec<(String, String)>>>()
        .context("read swap rows")?;
    decode_rows(rows)
}

#[async_trait]
impl SwapStorage for SqliteSwapStorage {
    async fn query(&self, direction: SwapDirection, states: &[i32]) -> Result<Vec<SwapRecord>> {
        let states = states.to_vec();
        self.blocking(move |conn| query_sync(conn, direction, &states))
            .await
    }

    async fn get(&self, direction: SwapDirection, id: &SwapId) -> Result<Option<SwapRecord>> {
        let id = id.clone();
        self.blocking(move |conn| get_sync(conn, direction, &id)).await
    }

    async fn save(&self, record: &SwapRecord) -> Result<()> {
        let record = record.clone();
        self.blocking(move |conn| save_sync(conn, &record)).await
    }

    async fn remove(&self, direction: SwapDirection, id: &SwapId) -> Result<bool> {
        let id = id.clone();
        self.blocking(move |conn| remove_sync(conn, direction, &id))
            .await
    }

    async fn list(&self) -> Result<Vec<SwapRecord>> {
        self.blocking(list_sync).await
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  direction TEXT NOT NULL,
  hash TEXT NOT NULL,
  sequence TEXT NOT NULL DEFAULT '',
  chain_id TEXT NOT NULL,
  state INTEGER NOT NULL,
  data TEXT NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (direction, hash, sequence)
);
CREATE INDEX IF NOT EXISTS swaps_state_idx ON swaps(direction, state);
"#,
    )
    .context("create tables")?;
    Ok(())
}
