//! Plugin hooks. Quote hooks short-circuit on the first plugin that answers;
//! notification hooks run for every plugin and never fail the caller.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::amount::decimal;
use crate::error::{SwapError, SwapResult};
use crate::swap::{FeeQuote, StateChange, SwapDirection, SwapRecord};

/// An amount and the side of the swap it denominates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedAmount {
    /// `true` when `amount` is what the user pays in.
    pub input: bool,
    #[serde(with = "decimal")]
    pub amount: u128,
}

/// Static bounds in sats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountBounds {
    pub min: u128,
    pub max: u128,
}

#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub request_id: Uuid,
    pub direction: SwapDirection,
    pub chain_id: String,
    pub token: String,
    /// Raw client parameters, for plugins that inspect them.
    pub params: Value,
}

impl QuoteRequest {
    pub fn new(direction: SwapDirection, chain_id: &str, token: &str, params: Value) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            direction,
            chain_id: chain_id.to_string(),
            token: token.to_string(),
            params,
        }
    }
}

/// Unset fields fall back to the static configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeOverride {
    pub base_fee: Option<u128>,
    pub fee_ppm: Option<u128>,
    pub security_deposit_apy_ppm: Option<u128>,
    pub security_deposit_base_multiplier_ppm: Option<u128>,
}

impl FeeQuote {
    pub fn apply(&mut self, fees: &FeeOverride) {
        if let Some(v) = fees.base_fee {
            self.base_fee = v;
        }
        if let Some(v) = fees.fee_ppm {
            self.fee_ppm = v;
        }
        if let Some(v) = fees.security_deposit_apy_ppm {
            self.security_deposit_apy_ppm = v;
        }
        if let Some(v) = fees.security_deposit_base_multiplier_ppm {
            self.security_deposit_base_multiplier_ppm = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreQuoteResponse {
    Throw { message: String },
    Fees(FeeOverride),
}

/// A fully priced quote supplied by a plugin. `amount` is the side the
/// client did not specify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginQuote {
    pub amount: RequestedAmount,
    pub swap_fee: u128,
    pub swap_fee_in_token: u128,
    /// Network fee in sats, for BTC payouts.
    pub network_fee: Option<u128>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostQuoteResponse {
    Throw { message: String },
    Fees(FeeOverride),
    Quote(PluginQuote),
}

#[derive(Debug, Clone)]
pub struct PreQuoteContext {
    pub request: QuoteRequest,
    pub requested: RequestedAmount,
    pub bounds: AmountBounds,
    pub fees: FeeQuote,
}

#[derive(Debug, Clone)]
pub struct PostQuoteContext {
    pub request: QuoteRequest,
    pub requested: RequestedAmount,
    pub bounds: AmountBounds,
    pub fees: FeeQuote,
    pub price_pre_fetch: Option<u128>,
    /// Native-token gas drop requested alongside a FromBtc swap.
    pub gas_amount: Option<u128>,
}

#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub directions: Vec<SwapDirection>,
    pub chains: Vec<String>,
}

#[async_trait]
pub trait SwapPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn on_enable(&self) -> Result<()> {
        Ok(())
    }

    async fn on_disable(&self) -> Result<()> {
        Ok(())
    }

    async fn on_service_initialize(&self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    async fn on_swap_create(&self, _swap: &SwapRecord) -> Result<()> {
        Ok(())
    }

    async fn on_swap_state_change(&self, _swap: &SwapRecord, _change: &StateChange) -> Result<()> {
        Ok(())
    }

    async fn on_swap_remove(&self, _swap: &SwapRecord) -> Result<()> {
        Ok(())
    }

    async fn on_handle_pre_from_btc_quote(
        &self,
        _ctx: &PreQuoteContext,
    ) -> Result<Option<PreQuoteResponse>> {
        Ok(None)
    }

    async fn on_handle_post_from_btc_quote(
        &self,
        _ctx: &PostQuoteContext,
    ) -> Result<Option<PostQuoteResponse>> {
        Ok(None)
    }

    async fn on_handle_pre_to_btc_quote(
        &self,
        _ctx: &PreQuoteContext,
    ) -> Result<Option<PreQuoteResponse>> {
        Ok(None)
    }

    async fn on_handle_post_to_btc_quote(
        &self,
        _ctx: &PostQuoteContext,
    ) -> Result<Option<PostQuoteResponse>> {
        Ok(None)
    }

    /// Bitcoin transactions the LP may treat as trusted before confirmation.
    async fn get_whitelisted_tx_ids(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Which side of the exchange a quote hook is priced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteSide {
    /// BTC in, token out.
    FromBtc,
    /// Token in, BTC out.
    ToBtc,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<Arc<dyn SwapPlugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<Arc<dyn SwapPlugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|p| p.name().to_string()).collect()
    }

    /// Appends `plugin`; hooks run in registration order.
    pub async fn register(&self, plugin: Arc<dyn SwapPlugin>) -> Result<()> {
        plugin.on_enable().await?;
        tracing::info!(plugin = plugin.name(), "plugin registered");
        self.plugins
            .write()
            .map_err(|_| anyhow::anyhow!("plugin registry lock poisoned"))?
            .push(plugin);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
            plugins
                .iter()
                .position(|p| p.name() == name)
                .map(|idx| plugins.remove(idx))
        };
        let Some(plugin) = removed else {
            return false;
        };
        if let Err(err) = plugin.on_disable().await {
            tracing::warn!(plugin = name, error = %err, "plugin on_disable failed");
        }
        tracing::info!(plugin = name, "plugin unregistered");
        true
    }

    pub async fn on_service_initialize(&self, ctx: &ServiceContext) {
        for plugin in self.snapshot() {
            if let Err(err) = plugin.on_service_initialize(ctx).await {
                tracing::warn!(plugin = plugin.name(), error = %err, "plugin initialize failed");
            }
        }
    }

    pub async fn on_swap_create(&self, swap: &SwapRecord) {
        for plugin in self.snapshot() {
            if let Err(err) = plugin.on_swap_create(swap).await {
                tracing::warn!(plugin = plugin.name(), swap_id = %swap.id, error = %err, "plugin on_swap_create failed");
            }
        }
    }

    pub async fn on_swap_state_change(&self, swap: &SwapRecord, change: &StateChange) {
        for plugin in self.snapshot() {
            if let Err(err) = plugin.on_swap_state_change(swap, change).await {
                tracing::warn!(plugin = plugin.name(), swap_id = %swap.id, error = %err, "plugin on_swap_state_change failed");
            }
        }
    }

    pub async fn on_swap_remove(&self, swap: &SwapRecord) {
        for plugin in self.snapshot() {
            if let Err(err) = plugin.on_swap_remove(swap).await {
                tracing::warn!(plugin = plugin.name(), swap_id = %swap.id, error = %err, "plugin on_swap_remove failed");
            }
        }
    }

    /// First plugin returning `Some` decides. A failing plugin is logged and
    /// skipped.
    pub async fn pre_quote(&self, side: QuoteSide, ctx: &PreQuoteContext) -> Option<PreQuoteResponse> {
        for plugin in self.snapshot() {
            let res = match side {
                QuoteSide::FromBtc => plugin.on_handle_pre_from_btc_quote(ctx).await,
                QuoteSide::ToBtc => plugin.on_handle_pre_to_btc_quote(ctx).await,
            };
            match res {
                Ok(Some(response)) => {
                    tracing::debug!(plugin = plugin.name(), request_id = %ctx.request.request_id, "pre-quote answered by plugin");
                    return Some(response);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(plugin = plugin.name(), error = %err, "plugin pre-quote hook failed")
                }
            }
        }
        None
    }

    /// Like [`Self::pre_quote`]. A plugin quote must be denominated on the
    /// side opposite to the request.
    pub async fn post_quote(
        &self,
        side: QuoteSide,
        ctx: &PostQuoteContext,
    ) -> SwapResult<Option<PostQuoteResponse>> {
        for plugin in self.snapshot() {
            let res = match side {
                QuoteSide::FromBtc => plugin.on_handle_post_from_btc_quote(ctx).await,
                QuoteSide::ToBtc => plugin.on_handle_post_to_btc_quote(ctx).await,
            };
            match res {
                Ok(Some(PostQuoteResponse::Quote(quote)))
                    if quote.amount.input == ctx.requested.input =>
                {
                    return Err(SwapError::InvariantViolation(format!(
                        "plugin {} quoted the requested side of the swap",
                        plugin.name()
                    )));
                }
                Ok(Some(response)) => {
                    tracing::debug!(plugin = plugin.name(), request_id = %ctx.request.request_id, "post-quote answered by plugin");
                    return Ok(Some(response));
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(plugin = plugin.name(), error = %err, "plugin post-quote hook failed")
                }
            }
        }
        Ok(None)
    }

    pub async fn whitelisted_tx_ids(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for plugin in self.snapshot() {
            match plugin.get_whitelisted_tx_ids().await {
                Ok(ids) => out.extend(ids),
                Err(err) => {
                    tracing::warn!(plugin = plugin.name(), error = %err, "plugin whitelist query failed")
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Fixed {
        name: &'static str,
        pre: Option<PreQuoteResponse>,
        post: Option<PostQuoteResponse>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, pre: Option<PreQuoteResponse>) -> Arc<Self> {
            Arc::new(Self {
                name,
                pre,
                post: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SwapPlugin for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_handle_pre_from_btc_quote(
            &self,
            _ctx: &PreQuoteContext,
        ) -> Result<Option<PreQuoteResponse>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pre.clone())
        }

        async fn on_handle_post_from_btc_quote(
            &self,
            _ctx: &PostQuoteContext,
        ) -> Result<Option<PostQuoteResponse>> {
            Ok(self.post.clone())
        }

        async fn on_swap_create(&self, _swap: &SwapRecord) -> Result<()> {
            anyhow::bail!("{} always fails", self.name)
        }
    }

    fn pre_ctx() -> PreQuoteContext {
        PreQuoteContext {
            request: QuoteRequest::new(SwapDirection::FromBtc, "main", "USDC", Value::Null),
            requested: RequestedAmount {
                input: true,
                amount: 10_000,
            },
            bounds: AmountBounds { min: 1_000, max: 10_000_000 },
            fees: FeeQuote::default(),
        }
    }

    #[tokio::test]
    async fn first_answer_short_circuits() {
        let registry = PluginRegistry::new();
        let silent = Fixed::new("silent", None);
        let fees = Fixed::new(
            "fees",
            Some(PreQuoteResponse::Fees(FeeOverride {
                fee_ppm: Some(5_000),
                ..FeeOverride::default()
            })),
        );
        let reject = Fixed::new(
            "reject",
            Some(PreQuoteResponse::Throw {
                message: "no".into(),
            }),
        );
        registry.register(silent.clone()).await.unwrap();
        registry.register(fees.clone()).await.unwrap();
        registry.register(reject.clone()).await.unwrap();

        let res = registry.pre_quote(QuoteSide::FromBtc, &pre_ctx()).await;
        assert!(matches!(res, Some(PreQuoteResponse::Fees(f)) if f.fee_ppm == Some(5_000)));
        assert_eq!(silent.calls.load(Ordering::SeqCst), 1);
        assert_eq!(reject.calls.load(Ordering::SeqCst), 0);

        assert!(registry.unregister("fees").await);
        let res = registry.pre_quote(QuoteSide::FromBtc, &pre_ctx()).await;
        assert!(matches!(res, Some(PreQuoteResponse::Throw { .. })));
        assert_eq!(registry.names(), vec!["silent", "reject"]);
    }

    #[tokio::test]
    async fn same_side_plugin_quote_is_rejected() {
        let registry = PluginRegistry::new();
        let plugin = Arc::new(Fixed {
            name: "bad",
            pre: None,
            post: Some(PostQuoteResponse::Quote(PluginQuote {
                amount: RequestedAmount {
                    input: true,
                    amount: 1,
                },
                swap_fee: 0,
                swap_fee_in_token: 0,
                network_fee: None,
            })),
            calls: AtomicUsize::new(0),
        });
        registry.register(plugin).await.unwrap();
        let pre = pre_ctx();
        let ctx = PostQuoteContext {
            request: pre.request,
            requested: pre.requested,
            bounds: pre.bounds,
            fees: pre.fees,
            price_pre_fetch: None,
            gas_amount: None,
        };
        let err = registry.post_quote(QuoteSide::FromBtc, &ctx).await.unwrap_err();
        assert!(matches!(err, SwapError::InvariantViolation(_)));
    }

    #[test]
    fn fee_override_keeps_unset_fields() {
        let mut fees = FeeQuote {
            base_fee: 10,
            fee_ppm: 3_000,
            security_deposit_apy_ppm: 1,
            security_deposit_base_multiplier_ppm: 2,
        };
        fees.apply(&FeeOverride {
            base_fee: Some(0),
            ..FeeOverride::default()
        });
        assert_eq!(fees.base_fee, 0);
        assert_eq!(fees.fee_ppm, 3_000);
    }
}
