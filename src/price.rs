use std::collections::HashMap;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

/// Prices are expressed in micro-sats per token base unit.
pub const PRICE_SCALE: u128 = 1_000_000;

/// Converts between BTC and smart-chain token amounts.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Snapshot reused across the conversions of one quote. `None` lets each
    /// conversion fetch on its own.
    async fn pre_fetch_price(&self, chain_id: &str, token: &str) -> Result<Option<u128>>;

    /// Token amount worth `sats`.
    async fn to_token_amount(
        &self,
        sats: u128,
        chain_id: &str,
        token: &str,
        round_up: bool,
        pre_fetched: Option<u128>,
    ) -> Result<u128>;

    /// Sats worth `token_amount`.
    async fn to_btc_amount(
        &self,
        token_amount: u128,
        chain_id: &str,
        token: &str,
        round_up: bool,
        pre_fetched: Option<u128>,
    ) -> Result<u128>;
}

/// Static price table.
#[derive(Debug, Clone, Default)]
pub struct FixedPriceOracle {
    prices: HashMap<(String, String), u128>,
}

impl FixedPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, chain_id: &str, token: &str, micro_sats_per_unit: u128) -> Self {
        self.prices
            .insert((chain_id.to_string(), token.to_string()), micro_sats_per_unit);
        self
    }

    fn price(&self, chain_id: &str, token: &str, pre_fetched: Option<u128>) -> Result<u128> {
        let price = match pre_fetched {
            Some(price) => price,
            None => *self
                .prices
                .get(&(chain_id.to_string(), token.to_string()))
                .with_context(|| format!("no price for {token} on {chain_id}"))?,
        };
        anyhow::ensure!(price > 0, "zero price for {token} on {chain_id}");
        Ok(price)
    }
}

fn div_round(num: u128, den: u128, round_up: bool) -> u128 {
    if round_up { num.div_ceil(den) } else { num / den }
}

#[async_trait]
impl PriceOracle for FixedPriceOracle {
    async fn pre_fetch_price(&self, chain_id: &str, token: &str) -> Result<Option<u128>> {
        self.price(chain_id, token, None).map(Some)
    }

    async fn to_token_amount(
        &self,
        sats: u128,
        chain_id: &str,
        token: &str,
        round_up: bool,
        pre_fetched: Option<u128>,
    ) -> Result<u128> {
        let price = self.price(chain_id, token, pre_fetched)?;
        let scaled = sats
            .checked_mul(PRICE_SCALE)
            .context("token amount overflow")?;
        Ok(div_round(scaled, price, round_up))
    }

    async fn to_btc_amount(
        &self,
        token_amount: u128,
        chain_id: &str,
        token: &str,
        round_up: bool,
        pre_fetched: Option<u128>,
    ) -> Result<u128> {
        let price = self.price(chain_id, token, pre_fetched)?;
        let scaled = token_amount
            .checked_mul(price)
            .context("btc amount overflow")?;
        Ok(div_round(scaled, PRICE_SCALE, round_up))
    }
}
