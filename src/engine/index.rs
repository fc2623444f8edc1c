use dashmap::DashMap;

use crate::swap::SwapId;

/// Chain-scoped escrow hash → swap id, for the cached records that carry an
/// escrow.
#[derive(Debug, Default)]
pub struct EscrowHashIndex {
    entries: DashMap<(String, String), SwapId>,
}

impl EscrowHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, chain_id: &str, escrow_hash: &str, id: SwapId) {
        self.entries
            .insert((chain_id.to_string(), escrow_hash.to_string()), id);
    }

    /// Removes the entry only if it still points at `id`.
    pub fn remove(&self, chain_id: &str, escrow_hash: &str, id: &SwapId) {
        self.entries
            .remove_if(&(chain_id.to_string(), escrow_hash.to_string()), |_, v| v == id);
    }

    pub fn get(&self, chain_id: &str, escrow_hash: &str) -> Option<SwapId> {
        self.entries
            .get(&(chain_id.to_string(), escrow_hash.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
