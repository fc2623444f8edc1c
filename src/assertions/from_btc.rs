use std::sync::Arc;

use super::{AmountAssertions, AmountInfo, BoundCheck, GasInfo};
use crate::abort::AbortSignal;
use crate::amount;
use crate::config::SwapLimits;
use crate::error::{SwapError, SwapResult};
use crate::plugin::{
    PluginRegistry, PostQuoteContext, PostQuoteResponse, QuoteRequest, QuoteSide, RequestedAmount,
};
use crate::price::PriceOracle;
use crate::swap::FeeQuote;

/// Native-token drop requested with a FromBtc swap.
#[derive(Debug, Clone)]
pub struct GasRequest {
    pub token: String,
    pub amount: u128,
    pub price_pre_fetch: Option<u128>,
}

/// BTC in, token out. `requested.input == true` means the sats paid in are
/// fixed; otherwise the token output is.
pub struct FromBtcAmountAssertions {
    pub base: AmountAssertions,
    pub gas_max: u128,
}

impl FromBtcAmountAssertions {
    pub fn new(
        limits: &SwapLimits,
        gas_max: u128,
        plugins: Arc<PluginRegistry>,
        price: Arc<dyn PriceOracle>,
    ) -> Self {
        Self {
            base: AmountAssertions::new(limits, plugins, price),
            gas_max,
        }
    }

    pub async fn pre_check(
        &self,
        request: &QuoteRequest,
        requested: RequestedAmount,
        fees: FeeQuote,
    ) -> SwapResult<FeeQuote> {
        self.base
            .pre_check(QuoteSide::FromBtc, request, requested, requested.input, fees)
            .await
    }

    /// Prices the swap. Runs after the price pre-fetch, so conversions reuse
    /// `price_pre_fetch`.
    pub async fn check_amount(
        &self,
        request: &QuoteRequest,
        requested: RequestedAmount,
        mut fees: FeeQuote,
        gas: Option<GasRequest>,
        price_pre_fetch: Option<u128>,
        signal: &AbortSignal,
    ) -> SwapResult<AmountInfo> {
        let gas = gas.filter(|g| g.amount > 0);
        if let Some(gas) = &gas
            && gas.amount > self.gas_max
        {
            return Err(SwapError::gas_too_high(self.gas_max));
        }

        let ctx = PostQuoteContext {
            request: request.clone(),
            requested,
            bounds: self.base.bounds(),
            fees,
            price_pre_fetch,
            gas_amount: gas.as_ref().map(|g| g.amount),
        };
        match self.base.plugins.post_quote(QuoteSide::FromBtc, &ctx).await? {
            Some(PostQuoteResponse::Throw { message }) => {
                return Err(SwapError::plugin_rejected(message));
            }
            Some(PostQuoteResponse::Fees(overrides)) => fees.apply(&overrides),
            Some(PostQuoteResponse::Quote(quote)) => {
                // Plugin quotes cover any gas drop themselves.
                let (amount_bd, total_in_token) = if requested.input {
                    (requested.amount, quote.amount.amount)
                } else {
                    (quote.amount.amount, requested.amount)
                };
                return Ok(AmountInfo {
                    amount_bd,
                    swap_fee: quote.swap_fee,
                    swap_fee_in_token: quote.swap_fee_in_token,
                    network_fee: 0,
                    network_fee_in_token: 0,
                    total_in_token,
                    gas: gas.map(|g| GasInfo {
                        amount: g.amount,
                        amount_bd: 0,
                    }),
                    fees,
                });
            }
            None => {}
        }

        let chain_id = request.chain_id.as_str();
        let token = request.token.as_str();
        signal.check()?;

        let gas_bd = match &gas {
            Some(g) => {
                self.base
                    .to_btc(g.amount, chain_id, &g.token, true, g.price_pre_fetch, signal)
                    .await?
            }
            None => 0,
        };

        let amount_bd = if requested.input {
            requested.amount
        } else {
            let out_bd = self
                .base
                .to_btc(requested.amount, chain_id, token, true, price_pre_fetch, signal)
                .await?;
            amount::gross_up(out_bd.saturating_add(gas_bd), fees.base_fee, fees.fee_ppm)
                .ok_or_else(|| SwapError::amount_too_high(self.base.limits.min, self.base.limits.max))?
        };

        let check = self.base.classify(amount_bd);
        if matches!(check, BoundCheck::HardLow | BoundCheck::HardHigh) {
            return Err(self
                .bound_error(check, requested, &fees, gas_bd, price_pre_fetch, request, signal)
                .await?);
        }

        let swap_fee = amount::fee(amount_bd, fees.base_fee, fees.fee_ppm);
        let swap_fee_in_token = self
            .base
            .to_token(swap_fee, chain_id, token, false, price_pre_fetch, signal)
            .await?;

        let total_in_token = if requested.input {
            let remaining = amount_bd
                .checked_sub(swap_fee)
                .and_then(|r| r.checked_sub(gas_bd));
            match remaining {
                Some(remaining) if remaining > 0 => {
                    self.base
                        .to_token(remaining, chain_id, token, false, price_pre_fetch, signal)
                        .await?
                }
                _ => {
                    return Err(SwapError::amount_too_low(
                        self.base.limits.min,
                        self.base.limits.max,
                    ));
                }
            }
        } else {
            requested.amount
        };

        if check != BoundCheck::Ok {
            tracing::debug!(
                request_id = %request.request_id,
                amount_bd,
                swap_fee,
                total_in_token,
                "priced amount outside limits"
            );
            return Err(self
                .bound_error(check, requested, &fees, gas_bd, price_pre_fetch, request, signal)
                .await?);
        }

        Ok(AmountInfo {
            amount_bd,
            swap_fee,
            swap_fee_in_token,
            network_fee: 0,
            network_fee_in_token: 0,
            total_in_token,
            gas: gas.map(|g| GasInfo {
                amount: g.amount,
                amount_bd: gas_bd,
            }),
            fees,
        })
    }

    /// Bounds error in the requested amount's denomination.
    #[allow(clippy::too_many_arguments)]
    async fn bound_error(
        &self,
        check: BoundCheck,
        requested: RequestedAmount,
        fees: &FeeQuote,
        gas_bd: u128,
        price_pre_fetch: Option<u128>,
        request: &QuoteRequest,
        signal: &AbortSignal,
    ) -> SwapResult<SwapError> {
        let limits = self.base.limits;
        let (min, max) = if requested.input {
            (limits.min, limits.max)
        } else {
            let token_bound = |bound: u128| {
                let fee = amount::fee(bound, fees.base_fee, fees.fee_ppm);
                bound.saturating_sub(fee).saturating_sub(gas_bd)
            };
            let min = self
                .base
                .to_token(token_bound(limits.min), &request.chain_id, &request.token, false, price_pre_fetch, signal)
                .await?;
            let max = self
                .base
                .to_token(token_bound(limits.max), &request.chain_id, &request.token, false, price_pre_fetch, signal)
                .await?;
            (min, max)
        };
        Ok(match check {
            BoundCheck::HardLow | BoundCheck::SoftLow => SwapError::amount_too_low(min, max),
            _ => SwapError::amount_too_high(min, max),
        })
    }
}
