//! Amount and fee checks shared by every quote path. Static limits are in
//! sats; plugins can override fees or price a quote entirely.

pub mod from_btc;
pub mod to_btc;

use std::sync::Arc;

use anyhow::Context as _;

use crate::abort::AbortSignal;
use crate::amount::{self, PPM};
use crate::config::SwapLimits;
use crate::error::{SwapError, SwapResult};
use crate::plugin::{
    AmountBounds, PluginRegistry, PreQuoteContext, PreQuoteResponse, QuoteRequest, QuoteSide,
    RequestedAmount,
};
use crate::price::PriceOracle;
use crate::swap::FeeQuote;

pub use from_btc::FromBtcAmountAssertions;
pub use to_btc::ToBtcAmountAssertions;

/// Result of pricing a quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountInfo {
    /// BTC side of the swap, in sats.
    pub amount_bd: u128,
    /// In sats.
    pub swap_fee: u128,
    pub swap_fee_in_token: u128,
    /// BTC network or routing fee charged to the user, in sats.
    pub network_fee: u128,
    pub network_fee_in_token: u128,
    /// Token side of the swap: paid out for FromBtc, paid in for ToBtc.
    pub total_in_token: u128,
    pub gas: Option<GasInfo>,
    pub fees: FeeQuote,
}

/// Native-token drop priced into a FromBtc swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasInfo {
    /// Native token units.
    pub amount: u128,
    /// Sats the user pays for it.
    pub amount_bd: u128,
}

/// Fee and bound parameters in `u128` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min: u128,
    pub max: u128,
    pub base_fee: u128,
    pub fee_ppm: u128,
    pub tolerance_ppm: u128,
}

impl From<&SwapLimits> for Limits {
    fn from(limits: &SwapLimits) -> Self {
        Self {
            min: limits.min.into(),
            max: limits.max.into(),
            base_fee: limits.base_fee.into(),
            fee_ppm: limits.fee_ppm.into(),
            tolerance_ppm: limits.tolerance_ppm.into(),
        }
    }
}

pub struct AmountAssertions {
    pub limits: Limits,
    pub plugins: Arc<PluginRegistry>,
    pub price: Arc<dyn PriceOracle>,
}

/// Where a sats amount sits relative to the configured limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoundCheck {
    Ok,
    /// Inside the tolerance band but outside `[min, max]`.
    SoftLow,
    SoftHigh,
    /// Outside the tolerance band.
    HardLow,
    HardHigh,
}

impl AmountAssertions {
    pub fn new(limits: &SwapLimits, plugins: Arc<PluginRegistry>, price: Arc<dyn PriceOracle>) -> Self {
        Self {
            limits: limits.into(),
            plugins,
            price,
        }
    }

    pub fn bounds(&self) -> AmountBounds {
        AmountBounds {
            min: self.limits.min,
            max: self.limits.max,
        }
    }

    /// Static fees before any plugin override.
    pub fn default_fees(&self) -> FeeQuote {
        FeeQuote {
            base_fee: self.limits.base_fee,
            fee_ppm: self.limits.fee_ppm,
            ..FeeQuote::default()
        }
    }

    /// `[min * (1 - tol), max * (1 + tol)]`.
    pub fn tolerance_band(&self) -> (u128, u128) {
        let tol = self.limits.tolerance_ppm;
        let low = amount::apply_ppm(self.limits.min, PPM.saturating_sub(tol));
        let high = amount::apply_ppm(self.limits.max, PPM + tol);
        (low, high)
    }

    pub(crate) fn classify(&self, amount_bd: u128) -> BoundCheck {
        let (low, high) = self.tolerance_band();
        if amount_bd < low {
            BoundCheck::HardLow
        } else if amount_bd > high {
            BoundCheck::HardHigh
        } else if amount_bd < self.limits.min {
            BoundCheck::SoftLow
        } else if amount_bd > self.limits.max {
            BoundCheck::SoftHigh
        } else {
            BoundCheck::Ok
        }
    }

    /// Pre-price check. A plugin may reject or override fees; otherwise a
    /// BTC-denominated amount is checked against the tolerance band.
    pub(crate) async fn pre_check(
        &self,
        side: QuoteSide,
        request: &QuoteRequest,
        requested: RequestedAmount,
        btc_denominated: bool,
        mut fees: FeeQuote,
    ) -> SwapResult<FeeQuote> {
        let ctx = PreQuoteContext {
            request: request.clone(),
            requested,
            bounds: self.bounds(),
            fees,
        };
        match self.plugins.pre_quote(side, &ctx).await {
            Some(PreQuoteResponse::Throw { message }) => Err(SwapError::plugin_rejected(message)),
            Some(PreQuoteResponse::Fees(overrides)) => {
                fees.apply(&overrides);
                Ok(fees)
            }
            None => {
                if btc_denominated {
                    match self.classify(requested.amount) {
                        BoundCheck::HardLow => {
                            return Err(SwapError::amount_too_low(self.limits.min, self.limits.max));
                        }
                        BoundCheck::HardHigh => {
                            return Err(SwapError::amount_too_high(self.limits.min, self.limits.max));
                        }
                        _ => {}
                    }
                }
                Ok(fees)
            }
        }
    }

    pub(crate) async fn to_token(
        &self,
        sats: u128,
        chain_id: &str,
        token: &str,
        round_up: bool,
        pre_fetched: Option<u128>,
        signal: &AbortSignal,
    ) -> SwapResult<u128> {
        let fut = self
            .price
            .to_token_amount(sats, chain_id, token, round_up, pre_fetched);
        Ok(signal.run(fut).await?.context("convert sats to token")?)
    }

    pub(crate) async fn to_btc(
        &self,
        token_amount: u128,
        chain_id: &str,
        token: &str,
        round_up: bool,
        pre_fetched: Option<u128>,
        signal: &AbortSignal,
    ) -> SwapResult<u128> {
        let fut = self
            .price
            .to_btc_amount(token_amount, chain_id, token, round_up, pre_fetched);
        Ok(signal.run(fut).await?.context("convert token to sats")?)
    }
}
