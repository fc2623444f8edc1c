//! Smart-chain token → Lightning. The user locks tokens in an HTLC escrow on
//! the invoice's payment hash; paying the invoice reveals the preimage the LP
//! claims with.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{authorization_deadline, request_params};
use crate::abort::{AbortController, AbortSignal};
use crate::amount::{self, decimal};
use crate::assertions::ToBtcAmountAssertions;
use crate::chain::{ChainEvent, CommitStatus, EscrowData, EscrowKind, SignatureData};
use crate::config::ToBtcLnConfig;
use crate::engine::{self, EscrowHandler, SharedSwap, SwapCell, SwapEngine, SwapStatus};
use crate::error::{SwapError, SwapResult, codes};
use crate::lightning::LightningClient;
use crate::lightning::PaymentStatus;
use crate::lightning::invoice::{self, ParsedInvoice};
use crate::plugin::{QuoteRequest, RequestedAmount};
use crate::swap::{
    SwapDirection, SwapFees, SwapId, SwapPayload, SwapRecord, SwapState, ToBtcLnData, ToBtcLnState,
    unix_time,
};

const OPEN: &[ToBtcLnState] = &[
    ToBtcLnState::Saved,
    ToBtcLnState::Commited,
    ToBtcLnState::NonPayable,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToBtcLnQuoteRequest {
    #[serde(default)]
    pub chain_id: Option<String>,
    pub token: String,
    /// User's smart-chain address, offerer of the escrow.
    pub offerer: String,
    pub bolt11: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToBtcLnQuote {
    pub id: String,
    /// Sats delivered over Lightning.
    #[serde(with = "decimal")]
    pub amount: u128,
    /// Routing fee budget in sats.
    #[serde(with = "decimal")]
    pub max_fee: u128,
    #[serde(with = "decimal")]
    pub max_fee_in_token: u128,
    #[serde(with = "decimal")]
    pub swap_fee: u128,
    #[serde(with = "decimal")]
    pub swap_fee_in_token: u128,
    #[serde(with = "decimal")]
    pub total: u128,
    pub escrow: EscrowData,
    pub signature: SignatureData,
}

pub struct ToBtcLnHandler {
    engine: SwapEngine,
    config: ToBtcLnConfig,
    lightning: Arc<dyn LightningClient>,
    network: Network,
    assertions: ToBtcAmountAssertions,
    tx_check_interval: Duration,
}

fn no_route() -> SwapError {
    SwapError::QuoteRejected {
        code: codes::INSUFFICIENT_LIQUIDITY,
        msg: "No route found".to_string(),
        data: None,
    }
}

impl ToBtcLnHandler {
    pub fn new(
        engine: SwapEngine,
        config: ToBtcLnConfig,
        lightning: Arc<dyn LightningClient>,
        network: Network,
        tx_check_interval: Duration,
    ) -> Self {
        let assertions =
            ToBtcAmountAssertions::new(&config.limits, engine.plugins.clone(), engine.price.clone());
        Self {
            engine,
            config,
            lightning,
            network,
            assertions,
            tx_check_interval,
        }
    }

    /// `max(base, amount * ppm)`.
    fn max_routing_fee(&self, amount: u128) -> u128 {
        let proportional = amount::apply_ppm(amount, u128::from(self.config.routing_fee_ppm));
        proportional.max(u128::from(self.config.routing_fee_base))
    }

    fn parse_invoice(&self, bolt11: &str) -> SwapResult<(ParsedInvoice, u128)> {
        let parsed = invoice::parse_bolt11(bolt11, self.network)
            .map_err(|err| SwapError::invalid_invoice(format!("invalid invoice: {err:#}")))?;
        let amount_msat = parsed
            .amount_msat
            .filter(|msat| *msat > 0)
            .ok_or_else(|| SwapError::invalid_invoice("invoice has no amount"))?;
        let min_expiry = unix_time().saturating_add(self.config.min_invoice_expiry_secs);
        if parsed.expires_at < min_expiry {
            return Err(SwapError::invalid_invoice("invoice expires too soon"));
        }
        Ok((parsed, u128::from(amount_msat.div_ceil(1000))))
    }

    pub async fn create_quote(
        &self,
        request: ToBtcLnQuoteRequest,
        signal: &AbortSignal,
    ) -> SwapResult<ToBtcLnQuote> {
        let chain = self.engine.chains.resolve(request.chain_id.as_deref())?;
        chain.check_token(&request.token)?;
        let (parsed, amount) = self.parse_invoice(&request.bolt11)?;
        let id = SwapId::new(parsed.payment_hash.clone(), None);
        if self.engine.store.load_one(&id).await?.is_some() {
            return Err(SwapError::invalid_request("a swap for this invoice already exists"));
        }
        let chain_id = chain.chain_id().to_string();
        let contract = chain.contract.clone();

        let params = request_params(&request)?;
        let quote_request =
            QuoteRequest::new(SwapDirection::ToBtcLn, &chain_id, &request.token, params.clone());
        let requested = RequestedAmount {
            input: false,
            amount,
        };
        let fees = self
            .assertions
            .pre_check(&quote_request, requested, self.assertions.base.default_fees())
            .await?;

        let abort = AbortController::linked(signal);
        let (price, sign_data, outbound, route_fee_msat) = tokio::try_join!(
            self.engine.pre_fetch_price(&chain_id, &request.token, &abort),
            self.engine.pre_fetch_sign_data(contract.as_ref(), &abort),
            engine::pre_fetch(&abort, "outbound_liquidity", self.lightning.get_outbound_liquidity()),
            engine::pre_fetch(&abort, "route_fee", self.lightning.probe_route_fee(&request.bolt11)),
        )?;

        let max_fee = self.max_routing_fee(amount);
        let route_fee = route_fee_msat.ok_or_else(no_route)?;
        if u128::from(route_fee.div_ceil(1000)) > max_fee {
            return Err(no_route());
        }

        let network_fee_fn = move |_: u128| max_fee;
        let info = self
            .assertions
            .check_amount(
                &quote_request,
                requested,
                fees,
                &network_fee_fn,
                price,
                &abort.signal(),
            )
            .await?;
        SwapEngine::check_balance(u128::from(outbound), amount.saturating_add(info.network_fee))?;

        let escrow_expiry = unix_time().saturating_add(self.config.escrow_expiry_secs);
        let escrow = EscrowData {
            kind: EscrowKind::Htlc,
            offerer: request.offerer.clone(),
            claimer: contract.address().to_string(),
            token: request.token.clone(),
            amount: info.total_in_token,
            claim_hash: parsed.payment_hash.clone(),
            sequence: 0,
            expiry: escrow_expiry,
            confirmations: 0,
            security_deposit: 0,
            claimer_bounty: 0,
            pay_in: true,
            pay_out: false,
        };
        let signature = abort
            .signal()
            .run(contract.get_init_signature(&escrow, authorization_deadline(chain), sign_data))
            .await?
            .context("sign init authorization")?;
        signal.check()?;

        let mut record = SwapRecord::new(
            id,
            &chain_id,
            SwapPayload::ToBtcLn(ToBtcLnData {
                state: ToBtcLnState::Saved,
                bolt11: request.bolt11.clone(),
                amount,
                max_fee: info.network_fee,
                real_fee_msat: None,
                secret: None,
            }),
            SwapFees {
                swap_fee: info.swap_fee,
                swap_fee_in_token: info.swap_fee_in_token,
                quote: info.fees,
            },
        );
        record.escrow = Some(escrow.clone());
        record.authorization = Some(signature.clone());
        record.metadata.request = Some(params);
        let id = record.id.to_string();
        self.engine.create_swap(record).await?;

        Ok(ToBtcLnQuote {
            id,
            amount,
            max_fee: info.network_fee,
            max_fee_in_token: info.network_fee_in_token,
            swap_fee: info.swap_fee,
            swap_fee_in_token: info.swap_fee_in_token,
            total: info.total_in_token,
            escrow,
            signature,
        })
    }

    pub async fn get_status(&self, id: &SwapId) -> SwapResult<SwapStatus> {
        self.engine.get_status(id).await
    }

    pub async fn get_refund_authorization(&self, id: &SwapId) -> SwapResult<SignatureData> {
        let swap = self
            .engine
            .get(id)
            .ok_or_else(|| SwapError::NotFound(id.to_string()))?;
        let record = swap.snapshot().await;
        if record.state::<ToBtcLnState>()? != ToBtcLnState::NonPayable {
            return Err(SwapError::not_refundable(format!("swap {id} is not refundable")));
        }
        let chain = self.engine.chain(&record.chain_id)?;
        let signature = chain
            .contract
            .get_refund_signature(record.escrow()?, authorization_deadline(chain))
            .await
            .context("sign refund authorization")?;
        Ok(signature)
    }

    /// Pays the invoice of a committed swap, unless a payment was already
    /// attempted.
    async fn process_payment(&self, swap: &SwapCell) -> SwapResult<bool> {
        let Some(guard) = swap.try_lock(self.engine.lock_duration()) else {
            tracing::debug!(swap_id = %swap.id, "payment skipped, swap locked");
            return Ok(false);
        };
        let record = swap.snapshot().await;
        if record.state::<ToBtcLnState>()? != ToBtcLnState::Commited {
            return Ok(false);
        }
        let data = record.to_btc_ln()?.clone();
        let escrow = record.escrow()?;

        let existing = self
            .lightning
            .get_payment(&escrow.claim_hash)
            .await
            .context("look up payment")?;
        if existing.is_some() {
            drop(guard);
            return self.resolve_payment(swap).await;
        }

        let timeout = Duration::from_secs(self.config.payment_timeout_secs);
        let deadline = unix_time().saturating_add(self.config.payment_timeout_secs);
        if escrow.expiry <= deadline {
            return self.mark_non_payable(swap, "escrow expires before the payment times out").await;
        }
        if !guard.is_held() {
            return Ok(false);
        }

        let max_fee_msat = u64::try_from(data.max_fee.saturating_mul(1000)).unwrap_or(u64::MAX);
        if let Err(err) = self.lightning.pay(&data.bolt11, max_fee_msat, timeout).await {
            // A payment that never started leaves no status behind.
            let status = self
                .lightning
                .get_payment(&escrow.claim_hash)
                .await
                .context("look up payment")?;
            if status.is_none() {
                return self.mark_non_payable(swap, &format!("payment failed: {err:#}")).await;
            }
        }
        tracing::info!(swap_id = %swap.id, amount = %data.amount, "lightning payment started");
        drop(guard);
        self.resolve_payment(swap).await
    }

    async fn mark_non_payable(&self, swap: &SwapCell, reason: &str) -> SwapResult<bool> {
        tracing::warn!(swap_id = %swap.id, reason, "swap not payable");
        let moved = self
            .engine
            .transition(swap, &[ToBtcLnState::Commited], ToBtcLnState::NonPayable, |r| {
                r.set_diagnostic("non_payable_reason", reason);
                Ok(())
            })
            .await?;
        Ok(moved.is_some())
    }

    /// Applies the node's view of the payment to a committed swap.
    async fn resolve_payment(&self, swap: &SwapCell) -> SwapResult<bool> {
        let record = swap.snapshot().await;
        if record.state::<ToBtcLnState>()? != ToBtcLnState::Commited {
            return Ok(false);
        }
        let payment_hash = record.escrow()?.claim_hash.clone();
        let status = self
            .lightning
            .get_payment(&payment_hash)
            .await
            .context("look up payment")?;
        match status {
            None | Some(PaymentStatus::Pending) => Ok(false),
            Some(PaymentStatus::Failed { reason }) => self.mark_non_payable(swap, &reason).await,
            Some(PaymentStatus::Succeeded { secret, fee_msat }) => {
                if invoice::payment_hash_of_secret(&secret)? != payment_hash {
                    return Err(SwapError::InvariantViolation(format!(
                        "node returned a preimage not matching swap {}",
                        swap.id
                    )));
                }
                let paid = self
                    .engine
                    .transition(swap, &[ToBtcLnState::Commited], ToBtcLnState::Paid, move |r| {
                        let data = r.to_btc_ln_mut()?;
                        data.secret = Some(secret);
                        data.real_fee_msat = Some(fee_msat);
                        Ok(())
                    })
                    .await?;
                if paid.is_none() {
                    return Ok(false);
                }
                tracing::info!(swap_id = %swap.id, fee_msat, "lightning payment succeeded");
                self.claim(swap).await?;
                Ok(true)
            }
        }
    }

    /// Claims the escrow with the payment preimage.
    async fn claim(&self, swap: &SwapCell) -> SwapResult<bool> {
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            return Ok(false);
        };
        let record = swap.snapshot().await;
        if record.state::<ToBtcLnState>()? != ToBtcLnState::Paid {
            return Ok(false);
        }
        let secret = record.to_btc_ln()?.secret.clone().ok_or_else(|| {
            SwapError::InvariantViolation(format!("paid swap {} has no preimage", swap.id))
        })?;
        let contract = self.engine.contract(&record.chain_id)?;
        let txid = contract
            .claim_with_secret(record.escrow()?, &secret)
            .await
            .with_context(|| format!("claim escrow of swap {}", swap.id))?;
        let moved = self
            .engine
            .transition(swap, &[ToBtcLnState::Paid], ToBtcLnState::Claimed, move |r| {
                r.txids.claim = Some(txid);
                Ok(())
            })
            .await?;
        Ok(moved.is_some())
    }

    /// Resolves started payments and claims paid swaps.
    pub async fn check_payments(&self) -> SwapResult<usize> {
        let states = [ToBtcLnState::Commited.code(), ToBtcLnState::Paid.code()];
        let swaps = self.engine.store.query(&states).await?;
        let mut advanced = 0;
        for swap in swaps {
            let record = swap.snapshot().await;
            let res = match record.state::<ToBtcLnState>() {
                Ok(ToBtcLnState::Commited) => self.resolve_payment(&swap).await,
                Ok(ToBtcLnState::Paid) => self.claim(&swap).await,
                Ok(_) => Ok(false),
                Err(err) => Err(err),
            };
            match res {
                Ok(true) => advanced += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!(swap_id = %swap.id, error = %err, "payment check failed"),
            }
        }
        Ok(advanced)
    }

    async fn close(&self, swap: &SwapCell, next: ToBtcLnState, txid: Option<String>) -> SwapResult<bool> {
        let from: &[ToBtcLnState] = match next {
            ToBtcLnState::Claimed => &[
                ToBtcLnState::Saved,
                ToBtcLnState::Commited,
                ToBtcLnState::Paid,
                ToBtcLnState::NonPayable,
            ],
            _ => OPEN,
        };
        let moved = self
            .engine
            .transition(swap, from, next, move |r| {
                match next {
                    ToBtcLnState::Claimed => r.txids.claim = txid,
                    _ => r.txids.refund = txid,
                }
                Ok(())
            })
            .await?;
        Ok(moved.is_some())
    }
}

#[async_trait]
impl EscrowHandler for ToBtcLnHandler {
    fn engine(&self) -> &SwapEngine {
        &self.engine
    }

    async fn process_initialize_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        let txid = event.txid().to_string();
        let moved = self
            .engine
            .transition(&swap, &[ToBtcLnState::Saved], ToBtcLnState::Commited, move |r| {
                r.txids.init = Some(txid);
                Ok(())
            })
            .await?;
        if moved.is_some() {
            self.process_payment(&swap).await?;
        }
        Ok(())
    }

    async fn process_claim_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        self.close(&swap, ToBtcLnState::Claimed, Some(event.txid().to_string()))
            .await?;
        Ok(())
    }

    async fn process_refund_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        let record = swap.snapshot().await;
        if record.state::<ToBtcLnState>()? == ToBtcLnState::Paid {
            tracing::error!(swap_id = %swap.id, "escrow refunded after the invoice was paid");
        }
        self.close(&swap, ToBtcLnState::Refunded, Some(event.txid().to_string()))
            .await?;
        Ok(())
    }

    async fn process_past_swap(&self, swap: SharedSwap) -> SwapResult<bool> {
        let record = swap.snapshot().await;
        if record.is_terminal() {
            return Ok(false);
        }
        let state = record.state::<ToBtcLnState>()?;
        if state == ToBtcLnState::Paid {
            return self.claim(&swap).await;
        }

        let contract = self.engine.contract(&record.chain_id)?;
        let status = contract
            .get_commit_status(record.escrow()?)
            .await
            .with_context(|| format!("commit status of swap {}", swap.id))?;

        match (state, status) {
            (_, CommitStatus::Paid) => self.close(&swap, ToBtcLnState::Claimed, None).await,
            (ToBtcLnState::Saved, CommitStatus::Committed | CommitStatus::Refundable) => {
                let moved = self
                    .engine
                    .transition(&swap, &[ToBtcLnState::Saved], ToBtcLnState::Commited, |_| Ok(()))
                    .await?;
                Ok(moved.is_some())
            }
            (ToBtcLnState::Saved, _) => {
                let now = unix_time();
                let lapsed = record.authorization.as_ref().is_none_or(|a| a.is_expired(now));
                if status == CommitStatus::Expired || lapsed {
                    let moved = self
                        .engine
                        .transition(&swap, &[ToBtcLnState::Saved], ToBtcLnState::Canceled, |_| {
                            Ok(())
                        })
                        .await?;
                    return Ok(moved.is_some());
                }
                Ok(false)
            }
            (ToBtcLnState::Commited, CommitStatus::Committed | CommitStatus::Refundable) => {
                self.process_payment(&swap).await
            }
            (ToBtcLnState::NonPayable, CommitStatus::Committed | CommitStatus::Refundable) => {
                Ok(false)
            }
            (_, CommitStatus::NotCommitted | CommitStatus::Expired) => {
                self.close(&swap, ToBtcLnState::Refunded, None).await
            }
            _ => Ok(false),
        }
    }

    fn spawn_background(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let interval = self.tx_check_interval;
        vec![tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.check_payments().await {
                    tracing::warn!(error = %err, "payment watcher pass failed");
                }
            }
        })]
    }
}
