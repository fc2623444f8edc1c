//! Direction-independent swap lifecycle: the record cache and escrow index,
//! persistence with notifications, pre-fetch helpers, chain event routing and
//! the reconciliation loop.

pub mod index;
pub mod watchdog;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio::task::JoinHandle;

use crate::abort::AbortController;
use crate::chain::{ChainEntry, ChainEvent, ChainRegistry, SwapContract};
use crate::error::{SwapError, SwapResult};
use crate::plugin::PluginRegistry;
use crate::price::PriceOracle;
use crate::storage::SwapStorage;
use crate::swap::{
    FromBtcLnState, FromBtcState, PayloadState, StateChange, SwapDirection, SwapId, SwapLock,
    SwapLockGuard, SwapRecord, SwapState, ToBtcLnState, ToBtcState,
};

pub use index::EscrowHashIndex;
pub use watchdog::{ReconcileReport, reconcile, spawn_watchdog};

const NOTIFICATION_CAPACITY: usize = 256;

/// A cached record. The lease guards side effects; the mutex guards the
/// record's data and is never held across chain, Bitcoin or Lightning I/O.
#[derive(Debug)]
pub struct SwapCell {
    pub id: SwapId,
    lock: SwapLock,
    record: Mutex<SwapRecord>,
}

pub type SharedSwap = Arc<SwapCell>;

impl SwapCell {
    fn new(record: SwapRecord) -> Self {
        Self {
            id: record.id.clone(),
            lock: record.lock_handle(),
            record: Mutex::new(record),
        }
    }

    pub fn try_lock(&self, duration: Duration) -> Option<SwapLockGuard> {
        self.lock.try_lock(duration)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub async fn record(&self) -> MutexGuard<'_, SwapRecord> {
        self.record.lock().await
    }

    pub async fn snapshot(&self) -> SwapRecord {
        self.record.lock().await.clone()
    }
}

/// Active records of one direction, backed by [`SwapStorage`].
pub struct SwapStore {
    direction: SwapDirection,
    storage: Arc<dyn SwapStorage>,
    swaps: DashMap<SwapId, SharedSwap>,
    index: EscrowHashIndex,
}

impl SwapStore {
    pub fn new(direction: SwapDirection, storage: Arc<dyn SwapStorage>) -> Self {
        Self {
            direction,
            storage,
            swaps: DashMap::new(),
            index: EscrowHashIndex::new(),
        }
    }

    fn index_record(&self, record: &SwapRecord) {
        if let Some(hash) = record.escrow_hash() {
            self.index.insert(&record.chain_id, &hash, record.id.clone());
        }
    }

    /// Returns the cached cell for `record`, caching it first if needed.
    fn cache(&self, record: SwapRecord) -> SharedSwap {
        if let Some(existing) = self.swaps.get(&record.id) {
            return existing.value().clone();
        }
        self.index_record(&record);
        let id = record.id.clone();
        self.swaps
            .entry(id)
            .or_insert_with(|| Arc::new(SwapCell::new(record)))
            .value()
            .clone()
    }

    /// Caches every persisted record in `states`.
    pub async fn load(&self, states: &[i32]) -> anyhow::Result<usize> {
        let records = self
            .storage
            .query(self.direction, states)
            .await
            .with_context(|| format!("load {} swaps", self.direction))?;
        let count = records.len();
        for record in records {
            self.cache(record);
        }
        Ok(count)
    }

    pub async fn insert(&self, record: SwapRecord) -> anyhow::Result<SharedSwap> {
        self.storage
            .save(&record)
            .await
            .with_context(|| format!("persist new swap {}", record.id))?;
        Ok(self.cache(record))
    }

    /// Persists a cached record. Returns `false` without writing when the
    /// record was removed in the meantime.
    pub async fn save(&self, record: &SwapRecord) -> anyhow::Result<bool> {
        if !self.swaps.contains_key(&record.id) {
            return Ok(false);
        }
        self.storage
            .save(record)
            .await
            .with_context(|| format!("persist swap {}", record.id))?;
        self.index_record(record);
        Ok(true)
    }

    pub async fn remove(&self, record: &SwapRecord) -> anyhow::Result<bool> {
        let removed = self.swaps.remove(&record.id).is_some();
        if let Some(hash) = record.escrow_hash() {
            self.index.remove(&record.chain_id, &hash, &record.id);
        }
        self.storage
            .remove(self.direction, &record.id)
            .await
            .with_context(|| format!("remove swap {}", record.id))?;
        Ok(removed)
    }

    pub fn get(&self, id: &SwapId) -> Option<SharedSwap> {
        self.swaps.get(id).map(|entry| entry.value().clone())
    }

    pub fn by_escrow_hash(&self, chain_id: &str, escrow_hash: &str) -> Option<SharedSwap> {
        let id = self.index.get(chain_id, escrow_hash)?;
        self.get(&id)
    }

    /// Persisted records in `states`, resolved to their cached cells.
    pub async fn query(&self, states: &[i32]) -> anyhow::Result<Vec<SharedSwap>> {
        let records = self
            .storage
            .query(self.direction, states)
            .await
            .with_context(|| format!("query {} swaps", self.direction))?;
        Ok(records.into_iter().map(|record| self.cache(record)).collect())
    }

    pub async fn load_one(&self, id: &SwapId) -> anyhow::Result<Option<SwapRecord>> {
        if let Some(swap) = self.get(id) {
            return Ok(Some(swap.snapshot().await));
        }
        self.storage.get(self.direction, id).await
    }

    pub fn len(&self) -> usize {
        self.swaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swaps.is_empty()
    }

    pub fn index(&self) -> &EscrowHashIndex {
        &self.index
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapNotification {
    Created {
        id: SwapId,
        direction: SwapDirection,
        state: i32,
    },
    StateChanged(StateChange),
    Removed {
        id: SwapId,
        direction: SwapDirection,
        state: i32,
    },
}

/// What a client sees when polling a swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapStatus {
    pub id: String,
    pub direction: SwapDirection,
    pub state: i32,
    pub state_name: String,
    /// `false` while the swap can still move.
    pub terminal: bool,
}

impl SwapStatus {
    pub fn of(record: &SwapRecord) -> Self {
        Self {
            id: record.id.to_string(),
            direction: record.direction(),
            state: record.state_code(),
            state_name: record.payload.state_name().to_string(),
            terminal: record.is_terminal(),
        }
    }
}

pub struct SwapEngine {
    pub direction: SwapDirection,
    pub store: SwapStore,
    pub chains: Arc<ChainRegistry>,
    pub plugins: Arc<PluginRegistry>,
    pub price: Arc<dyn PriceOracle>,
    lock_duration: Duration,
    notifications: broadcast::Sender<SwapNotification>,
}

impl SwapEngine {
    pub fn new(
        direction: SwapDirection,
        storage: Arc<dyn SwapStorage>,
        chains: Arc<ChainRegistry>,
        plugins: Arc<PluginRegistry>,
        price: Arc<dyn PriceOracle>,
        lock_duration: Duration,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            direction,
            store: SwapStore::new(direction, storage),
            chains,
            plugins,
            price,
            lock_duration,
            notifications,
        }
    }

    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapNotification> {
        self.notifications.subscribe()
    }

    fn notify(&self, notification: SwapNotification) {
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }

    pub fn chain(&self, chain_id: &str) -> SwapResult<&ChainEntry> {
        self.chains
            .get(chain_id)
            .ok_or_else(|| SwapError::InvariantViolation(format!("no adapter for chain {chain_id}")))
    }

    pub fn contract(&self, chain_id: &str) -> SwapResult<Arc<dyn SwapContract>> {
        Ok(self.chain(chain_id)?.contract.clone())
    }

    /// Loads persisted records that are not terminal.
    pub async fn load(&self) -> SwapResult<usize> {
        let states = non_terminal_states(self.direction);
        let count = self.store.load(&states).await?;
        tracing::info!(direction = %self.direction, count, "loaded swaps");
        Ok(count)
    }

    pub async fn create_swap(&self, record: SwapRecord) -> SwapResult<SharedSwap> {
        let swap = self.store.insert(record.clone()).await?;
        tracing::info!(
            direction = %self.direction,
            swap_id = %record.id,
            state = record.payload.state_name(),
            "swap created"
        );
        self.plugins.on_swap_create(&record).await;
        self.notify(SwapNotification::Created {
            id: record.id.clone(),
            direction: self.direction,
            state: record.state_code(),
        });
        Ok(swap)
    }

    /// Persists without a state change.
    pub async fn save(&self, record: &SwapRecord) -> SwapResult<()> {
        self.store.save(record).await?;
        Ok(())
    }

    /// Persists `record`, then emits `change`.
    pub async fn save_state(&self, record: &SwapRecord, change: StateChange) -> SwapResult<()> {
        if !self.store.save(record).await? {
            tracing::debug!(swap_id = %record.id, "state change on removed swap not persisted");
            return Ok(());
        }
        tracing::info!(
            direction = %self.direction,
            swap_id = %record.id,
            from = self.direction.state_name(change.from).unwrap_or("?"),
            to = self.direction.state_name(change.to).unwrap_or("?"),
            "swap state changed"
        );
        self.plugins.on_swap_state_change(record, &change).await;
        self.notify(SwapNotification::StateChanged(change));
        Ok(())
    }

    pub async fn remove_swap(&self, record: &SwapRecord) -> SwapResult<()> {
        if !self.store.remove(record).await? {
            return Ok(());
        }
        tracing::info!(
            direction = %self.direction,
            swap_id = %record.id,
            state = record.payload.state_name(),
            "swap removed"
        );
        self.plugins.on_swap_remove(record).await;
        self.notify(SwapNotification::Removed {
            id: record.id.clone(),
            direction: self.direction,
            state: record.state_code(),
        });
        Ok(())
    }

    /// Moves `swap` to `next` if it is currently in one of `from`, applying
    /// `mutate` in the same write. Terminal states remove the record from
    /// active storage. Returns the updated record, or `None` when the guard
    /// did not match.
    pub async fn transition<S, F>(
        &self,
        swap: &SwapCell,
        from: &[S],
        next: S,
        mutate: F,
    ) -> SwapResult<Option<SwapRecord>>
    where
        S: PayloadState,
        F: FnOnce(&mut SwapRecord) -> SwapResult<()> + Send,
    {
        let mut record = swap.record().await;
        let current = record.state::<S>()?;
        if !from.contains(&current) {
            return Ok(None);
        }
        mutate(&mut record)?;
        let change = record.set_state(next)?;
        self.save_state(&record, change).await?;
        let updated = record.clone();
        drop(record);
        if next.is_terminal() {
            self.remove_swap(&updated).await?;
        }
        Ok(Some(updated))
    }

    pub fn get(&self, id: &SwapId) -> Option<SharedSwap> {
        self.store.get(id)
    }

    pub fn by_escrow_hash(&self, chain_id: &str, escrow_hash: &str) -> Option<SharedSwap> {
        self.store.by_escrow_hash(chain_id, escrow_hash)
    }

    pub async fn get_status(&self, id: &SwapId) -> SwapResult<SwapStatus> {
        let record = self
            .store
            .load_one(id)
            .await?
            .ok_or_else(|| SwapError::NotFound(id.to_string()))?;
        Ok(SwapStatus::of(&record))
    }

    /// Price snapshot for one quote. Failure aborts the sibling pre-fetches.
    pub async fn pre_fetch_price(
        &self,
        chain_id: &str,
        token: &str,
        abort: &AbortController,
    ) -> SwapResult<Option<u128>> {
        pre_fetch(abort, "price", self.price.pre_fetch_price(chain_id, token)).await
    }

    pub async fn pre_fetch_sign_data(
        &self,
        contract: &dyn SwapContract,
        abort: &AbortController,
    ) -> SwapResult<Option<Value>> {
        pre_fetch(abort, "sign_data", contract.pre_fetch_sign_data()).await
    }

    pub async fn pre_fetch_balance(
        &self,
        contract: &dyn SwapContract,
        token: &str,
        abort: &AbortController,
    ) -> SwapResult<u128> {
        pre_fetch(abort, "balance", contract.get_balance(token)).await
    }

    pub fn check_balance(available: u128, required: u128) -> SwapResult<()> {
        if available < required {
            return Err(SwapError::insufficient_liquidity(available, required));
        }
        Ok(())
    }
}

/// Runs one quote pre-fetch under `abort`. A failure aborts the siblings
/// sharing the controller.
pub async fn pre_fetch<T, F>(abort: &AbortController, what: &'static str, fut: F) -> SwapResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let res = abort.signal().run(fut).await?;
    res.with_context(|| format!("pre-fetch {what}")).map_err(|err| {
        tracing::warn!(pre_fetch = what, error = %format!("{err:#}"), "pre-fetch failed");
        abort.abort();
        SwapError::Transient(err)
    })
}

pub fn non_terminal_states(direction: SwapDirection) -> Vec<i32> {
    direction
        .state_codes()
        .into_iter()
        .filter(|code| !is_terminal_code(direction, *code))
        .collect()
}

fn is_terminal_code(direction: SwapDirection, code: i32) -> bool {
    match direction {
        SwapDirection::ToBtc => ToBtcState::from_code(code).is_some_and(ToBtcState::is_terminal),
        SwapDirection::FromBtc => FromBtcState::from_code(code).is_some_and(FromBtcState::is_terminal),
        SwapDirection::ToBtcLn => ToBtcLnState::from_code(code).is_some_and(ToBtcLnState::is_terminal),
        SwapDirection::FromBtcLn => {
            FromBtcLnState::from_code(code).is_some_and(FromBtcLnState::is_terminal)
        }
    }
}

/// Direction-specific callbacks driven by chain events and the watchdog.
#[async_trait]
pub trait EscrowHandler: Send + Sync + 'static {
    fn engine(&self) -> &SwapEngine;

    async fn process_initialize_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()>;

    async fn process_claim_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()>;

    async fn process_refund_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()>;

    /// States the watchdog revisits.
    fn active_states(&self) -> Vec<i32> {
        non_terminal_states(self.engine().direction)
    }

    /// Re-derives the next step of `swap` from external state. Returns
    /// whether the swap moved.
    async fn process_past_swap(&self, swap: SharedSwap) -> SwapResult<bool>;

    /// Extra periodic tasks (payout or payment watchers).
    fn spawn_background(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        Vec::new()
    }
}

/// Routes one chain event. Unknown escrows are ignored.
pub async fn dispatch_event<H>(handler: &H, chain_id: &str, event: &ChainEvent)
where
    H: EscrowHandler + ?Sized,
{
    let engine = handler.engine();
    let Some(swap) = engine.by_escrow_hash(chain_id, event.escrow_hash()) else {
        tracing::trace!(
            direction = %engine.direction,
            chain_id,
            escrow_hash = event.escrow_hash(),
            event = event.kind(),
            "event for unknown escrow"
        );
        return;
    };
    let swap_id = swap.id.clone();
    let res = match event {
        ChainEvent::Initialize { .. } => handler.process_initialize_event(swap, event).await,
        ChainEvent::Claim { .. } => handler.process_claim_event(swap, event).await,
        ChainEvent::Refund { .. } => handler.process_refund_event(swap, event).await,
    };
    if let Err(err) = res {
        tracing::warn!(
            direction = %engine.direction,
            swap_id = %swap_id,
            event = event.kind(),
            txid = event.txid(),
            error = %err,
            "event processing failed"
        );
    }
}

/// Feeds one chain's events to `handler` in order.
pub fn spawn_event_listener<H>(
    handler: Arc<H>,
    chain_id: String,
    mut events: broadcast::Receiver<ChainEvent>,
) -> JoinHandle<()>
where
    H: EscrowHandler + ?Sized,
{
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => dispatch_event(handler.as_ref(), &chain_id, &event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        direction = %handler.engine().direction,
                        chain_id = %chain_id,
                        skipped,
                        "chain event stream lagged; watchdog will reconcile"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!(chain_id = %chain_id, "chain event stream closed");
                    break;
                }
            }
        }
    })
}
