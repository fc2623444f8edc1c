use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context as _, Result, anyhow};
use async_trait::async_trait;

use super::SwapStorage;
use crate::swap::{SwapDirection, SwapId, SwapRecord};

/// Keeps serialized records in memory, so records still go through the same
/// encode/decode path as with a durable engine.
type Records = BTreeMap<(SwapDirection, SwapId), (i32, String)>;

#[derive(Debug, Default)]
pub struct MemorySwapStorage {
    records: Mutex<Records>,
}

impl MemorySwapStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> Result<MutexGuard<'_, Records>> {
        self.records
            .lock()
            .map_err(|_| anyhow!("memory storage mutex poisoned"))
    }
}

fn decode(id: &SwapId, data: &str) -> Result<SwapRecord> {
    serde_json::from_str(data).with_context(|| format!("decode swap record {id}"))
}

#[async_trait]
impl SwapStorage for MemorySwapStorage {
    async fn query(&self, direction: SwapDirection, states: &[i32]) -> Result<Vec<SwapRecord>> {
        let records = self.records()?;
        records
            .iter()
            .filter(|((dir, _), (state, _))| *dir == direction && states.contains(state))
            .map(|((_, id), (_, data))| decode(id, data))
            .collect()
    }

    async fn get(&self, direction: SwapDirection, id: &SwapId) -> Result<Option<SwapRecord>> {
        let records = self.records()?;
        records
            .get(&(direction, id.clone()))
            .map(|(_, data)| decode(id, data))
            .transpose()
    }

    async fn save(&self, record: &SwapRecord) -> Result<()> {
        let data = serde_json::to_string(record).context("encode swap record")?;
        let mut records = self.records()?;
        records.insert(
            (record.direction(), record.id.clone()),
            (record.state_code(), data),
        );
        Ok(())
    }

    async fn remove(&self, direction: SwapDirection, id: &SwapId) -> Result<bool> {
        let mut records = self.records()?;
        Ok(records.remove(&(direction, id.clone())).is_some())
    }

    async fn list(&self) -> Result<Vec<SwapRecord>> {
        let records = self.records()?;
        records
            .iter()
            .map(|((_, id), (_, data))| decode(id, data))
            .collect()
    }
}
