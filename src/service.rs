//! Wires configuration, storage, adapters and plugins into the four swap
//! handlers, then runs their event listeners, watchdogs and watchers.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::task::JoinHandle;

use crate::bitcoin_rpc::BitcoinRpc;
use crate::chain::{ChainEntry, ChainRegistry, SwapContract};
use crate::config::{LpConfig, WatchdogConfig};
use crate::engine::{self, EscrowHandler, SwapEngine};
use crate::error::{SwapError, SwapResult};
use crate::handlers::{FromBtcHandler, FromBtcLnHandler, ToBtcHandler, ToBtcLnHandler};
use crate::lightning::LightningClient;
use crate::plugin::{PluginRegistry, ServiceContext};
use crate::price::PriceOracle;
use crate::storage::SwapStorage;
use crate::swap::SwapDirection;

/// External systems the LP talks to.
pub struct LpAdapters {
    pub storage: Arc<dyn SwapStorage>,
    pub contracts: Vec<Arc<dyn SwapContract>>,
    pub bitcoin: Arc<dyn BitcoinRpc>,
    /// Lightning directions are disabled without a node.
    pub lightning: Option<Arc<dyn LightningClient>>,
    pub price: Arc<dyn PriceOracle>,
    pub plugins: Arc<PluginRegistry>,
}

pub struct LpService {
    pub chains: Arc<ChainRegistry>,
    pub plugins: Arc<PluginRegistry>,
    pub to_btc: Arc<ToBtcHandler>,
    pub from_btc: Arc<FromBtcHandler>,
    pub to_btc_ln: Option<Arc<ToBtcLnHandler>>,
    pub from_btc_ln: Option<Arc<FromBtcLnHandler>>,
    watchdog: WatchdogConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl LpService {
    /// Validates `config`, builds the handlers and loads their persisted
    /// swaps. Nothing runs until [`Self::start`].
    pub async fn new(config: LpConfig, adapters: LpAdapters) -> SwapResult<Self> {
        config.validate()?;

        let mut entries = Vec::with_capacity(adapters.contracts.len());
        for contract in adapters.contracts {
            let chain_config = config.chain(contract.chain_id()).ok_or_else(|| {
                SwapError::Config(format!("chain {} has no configuration", contract.chain_id()))
            })?;
            entries.push(ChainEntry::new(contract, chain_config));
        }
        let chains = Arc::new(ChainRegistry::new(config.default_chain.clone(), entries)?);

        let watchdog = config.watchdog.clone();
        let new_engine = |direction| {
            SwapEngine::new(
                direction,
                adapters.storage.clone(),
                chains.clone(),
                adapters.plugins.clone(),
                adapters.price.clone(),
                watchdog.lock_duration(),
            )
        };

        let to_btc = Arc::new(ToBtcHandler::new(
            new_engine(SwapDirection::ToBtc),
            config.to_btc.clone(),
            adapters.bitcoin.clone(),
            watchdog.tx_check_interval(),
        ));
        let from_btc = Arc::new(FromBtcHandler::new(
            new_engine(SwapDirection::FromBtc),
            config.from_btc.clone(),
            adapters.bitcoin.clone(),
        ));
        let (to_btc_ln, from_btc_ln) = match &adapters.lightning {
            Some(lightning) => (
                Some(Arc::new(ToBtcLnHandler::new(
                    new_engine(SwapDirection::ToBtcLn),
                    config.to_btc_ln.clone(),
                    lightning.clone(),
                    adapters.bitcoin.network(),
                    watchdog.tx_check_interval(),
                ))),
                Some(Arc::new(FromBtcLnHandler::new(
                    new_engine(SwapDirection::FromBtcLn),
                    config.from_btc_ln.clone(),
                    lightning.clone(),
                ))),
            ),
            None => {
                tracing::info!("no lightning node configured, lightning swaps disabled");
                (None, None)
            }
        };

        let service = Self {
            chains,
            plugins: adapters.plugins,
            to_btc,
            from_btc,
            to_btc_ln,
            from_btc_ln,
            watchdog,
            tasks: Vec::new(),
        };
        for engine in service.engines() {
            engine
                .load()
                .await
                .map_err(|err| SwapError::Config(format!("load {} swaps: {err}", engine.direction)))?;
        }
        Ok(service)
    }

    pub fn directions(&self) -> Vec<SwapDirection> {
        self.engines().map(|engine| engine.direction).collect()
    }

    fn engines(&self) -> impl Iterator<Item = &SwapEngine> {
        [
            Some(self.to_btc.engine()),
            Some(self.from_btc.engine()),
            self.to_btc_ln.as_ref().map(|h| h.engine()),
            self.from_btc_ln.as_ref().map(|h| h.engine()),
        ]
        .into_iter()
        .flatten()
    }

    /// Subscribes to every chain, starts the watchdogs and background
    /// watchers, then tells plugins the service is up.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.tasks.is_empty(), "service already started");
        self.spawn_handler(self.to_btc.clone());
        self.spawn_handler(self.from_btc.clone());
        if let Some(handler) = self.to_btc_ln.clone() {
            self.spawn_handler(handler);
        }
        if let Some(handler) = self.from_btc_ln.clone() {
            self.spawn_handler(handler);
        }

        let ctx = ServiceContext {
            directions: self.directions(),
            chains: self.chains.iter().map(|c| c.chain_id().to_string()).collect(),
        };
        self.plugins.on_service_initialize(&ctx).await;
        tracing::info!(
            directions = ?ctx.directions,
            chains = ?ctx.chains,
            tasks = self.tasks.len(),
            "swap service started"
        );
        Ok(())
    }

    fn spawn_handler<H: EscrowHandler>(&mut self, handler: Arc<H>) {
        for chain in self.chains.iter() {
            let events = chain.contract.subscribe();
            self.tasks.push(engine::spawn_event_listener(
                handler.clone(),
                chain.chain_id().to_string(),
                events,
            ));
        }
        self.tasks
            .push(engine::spawn_watchdog(handler.clone(), self.watchdog.interval()));
        self.tasks.extend(handler.spawn_background());
    }

    /// Runs one reconciliation pass over every direction.
    pub async fn reconcile_all(&self) -> SwapResult<()> {
        engine::reconcile(self.to_btc.as_ref()).await?;
        engine::reconcile(self.from_btc.as_ref()).await?;
        if let Some(handler) = &self.to_btc_ln {
            engine::reconcile(handler.as_ref()).await?;
        }
        if let Some(handler) = &self.from_btc_ln {
            engine::reconcile(handler.as_ref()).await?;
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("swap service stopped");
    }
}

impl Drop for LpService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens the configured SQLite store.
pub fn open_storage(config: &LpConfig) -> anyhow::Result<Arc<dyn SwapStorage>> {
    let storage = crate::storage::SqliteSwapStorage::open(config.storage.path.clone())
        .with_context(|| format!("open swap storage {}", config.storage.path.display()))?;
    Ok(Arc::new(storage))
}
