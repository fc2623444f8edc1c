//! Persistence of swap records. Engines store whole records as JSON
//! documents keyed by direction and identifier, with the state code indexed.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::swap::{SwapDirection, SwapId, SwapRecord};

pub use memory::MemorySwapStorage;
pub use sqlite::SqliteSwapStorage;

#[async_trait]
pub trait SwapStorage: Send + Sync {
    /// Records of `direction` whose state code is in `states`.
    async fn query(&self, direction: SwapDirection, states: &[i32]) -> Result<Vec<SwapRecord>>;

    async fn get(&self, direction: SwapDirection, id: &SwapId) -> Result<Option<SwapRecord>>;

    /// Atomic insert-or-replace.
    async fn save(&self, record: &SwapRecord) -> Result<()>;

    /// Returns whether a record was removed.
    async fn remove(&self, direction: SwapDirection, id: &SwapId) -> Result<bool>;

    /// Every stored record, ordered by direction then id.
    async fn list(&self) -> Result<Vec<SwapRecord>>;
}
