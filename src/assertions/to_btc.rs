use std::sync::Arc;

use super::{AmountAssertions, AmountInfo, BoundCheck};
use crate::abort::AbortSignal;
use crate::amount;
use crate::config::SwapLimits;
use crate::error::{SwapError, SwapResult};
use crate::plugin::{
    PluginRegistry, PostQuoteContext, PostQuoteResponse, QuoteRequest, QuoteSide, RequestedAmount,
};
use crate::price::PriceOracle;
use crate::swap::FeeQuote;

/// Network fee in sats for paying out the given sats amount.
pub type NetworkFeeFn<'a> = &'a (dyn Fn(u128) -> u128 + Send + Sync);

/// Token in, BTC out. `requested.input == true` means the token amount paid
/// in is fixed; otherwise the sats paid out are.
pub struct ToBtcAmountAssertions {
    pub base: AmountAssertions,
}

impl ToBtcAmountAssertions {
    pub fn new(limits: &SwapLimits, plugins: Arc<PluginRegistry>, price: Arc<dyn PriceOracle>) -> Self {
        Self {
            base: AmountAssertions::new(limits, plugins, price),
        }
    }

    pub async fn pre_check(
        &self,
        request: &QuoteRequest,
        requested: RequestedAmount,
        fees: FeeQuote,
    ) -> SwapResult<FeeQuote> {
        self.base
            .pre_check(QuoteSide::ToBtc, request, requested, !requested.input, fees)
            .await
    }

    pub async fn check_amount(
        &self,
        request: &QuoteRequest,
        requested: RequestedAmount,
        mut fees: FeeQuote,
        network_fee: NetworkFeeFn<'_>,
        price_pre_fetch: Option<u128>,
        signal: &AbortSignal,
    ) -> SwapResult<AmountInfo> {
        let chain_id = request.chain_id.as_str();
        let token = request.token.as_str();

        let ctx = PostQuoteContext {
            request: request.clone(),
            requested,
            bounds: self.base.bounds(),
            fees,
            price_pre_fetch,
            gas_amount: None,
        };
        match self.base.plugins.post_quote(QuoteSide::ToBtc, &ctx).await? {
            Some(PostQuoteResponse::Throw { message }) => {
                return Err(SwapError::plugin_rejected(message));
            }
            Some(PostQuoteResponse::Fees(overrides)) => fees.apply(&overrides),
            Some(PostQuoteResponse::Quote(quote)) => {
                let (amount_bd, total_in_token) = if requested.input {
                    (quote.amount.amount, requested.amount)
                } else {
                    (requested.amount, quote.amount.amount)
                };
                let network_fee = quote.network_fee.unwrap_or_else(|| network_fee(amount_bd));
                let network_fee_in_token = self
                    .base
                    .to_token(network_fee, chain_id, token, true, price_pre_fetch, signal)
                    .await?;
                return Ok(AmountInfo {
                    amount_bd,
                    swap_fee: quote.swap_fee,
                    swap_fee_in_token: quote.swap_fee_in_token,
                    network_fee,
                    network_fee_in_token,
                    total_in_token,
                    gas: None,
                    fees,
                });
            }
            None => {}
        }

        signal.check()?;

        let (amount_bd, network_fee_bd) = if requested.input {
            let in_bd = self
                .base
                .to_btc(requested.amount, chain_id, token, false, price_pre_fetch, signal)
                .await?;
            let network_fee_bd = network_fee(in_bd);
            let amount_bd =
                amount::net_down(in_bd.saturating_sub(network_fee_bd), fees.base_fee, fees.fee_ppm);
            (amount_bd, network_fee_bd)
        } else {
            (requested.amount, network_fee(requested.amount))
        };

        let check = self.base.classify(amount_bd);
        if matches!(check, BoundCheck::HardLow | BoundCheck::HardHigh) {
            return Err(self
                .bound_error(check, requested, &fees, network_fee, price_pre_fetch, request, signal)
                .await?);
        }

        let swap_fee = amount::fee(amount_bd, fees.base_fee, fees.fee_ppm);
        let swap_fee_in_token = self
            .base
            .to_token(swap_fee, chain_id, token, true, price_pre_fetch, signal)
            .await?;
        let network_fee_in_token = self
            .base
            .to_token(network_fee_bd, chain_id, token, true, price_pre_fetch, signal)
            .await?;

        let total_in_token = if requested.input {
            requested.amount
        } else {
            let total_bd = amount_bd
                .saturating_add(swap_fee)
                .saturating_add(network_fee_bd);
            self.base
                .to_token(total_bd, chain_id, token, true, price_pre_fetch, signal)
                .await?
        };

        if check != BoundCheck::Ok {
            tracing::debug!(
                request_id = %request.request_id,
                amount_bd,
                swap_fee,
                network_fee = network_fee_bd,
                "priced amount outside limits"
            );
            return Err(self
                .bound_error(check, requested, &fees, network_fee, price_pre_fetch, request, signal)
                .await?);
        }

        Ok(AmountInfo {
            amount_bd,
            swap_fee,
            swap_fee_in_token,
            network_fee: network_fee_bd,
            network_fee_in_token,
            total_in_token,
            gas: None,
            fees,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn bound_error(
        &self,
        check: BoundCheck,
        requested: RequestedAmount,
        fees: &FeeQuote,
        network_fee: NetworkFeeFn<'_>,
        price_pre_fetch: Option<u128>,
        request: &QuoteRequest,
        signal: &AbortSignal,
    ) -> SwapResult<SwapError> {
        let limits = self.base.limits;
        let (min, max) = if requested.input {
            let token_bound = |bound: u128| {
                bound
                    .saturating_add(amount::fee(bound, fees.base_fee, fees.fee_ppm))
                    .saturating_add(network_fee(bound))
            };
            let min = self
                .base
                .to_token(token_bound(limits.min), &request.chain_id, &request.token, true, price_pre_fetch, signal)
                .await?;
            let max = self
                .base
                .to_token(token_bound(limits.max), &request.chain_id, &request.token, true, price_pre_fetch, signal)
                .await?;
            (min, max)
        } else {
            (limits.min, limits.max)
        };
        Ok(match check {
            BoundCheck::HardLow | BoundCheck::SoftLow => SwapError::amount_too_low(min, max),
            _ => SwapError::amount_too_high(min, max),
        })
    }
}
