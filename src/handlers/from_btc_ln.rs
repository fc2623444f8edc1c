//! Lightning → smart-chain token. The LP issues a hodl invoice on a payment
//! hash chosen by the user, and only once the HTLC is held does it authorize
//! an HTLC escrow on the same hash. The user's claim reveals the preimage,
//! which then settles the invoice.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{authorization_deadline, ensure_positive, is_payment_hash, request_params, sats_u64};
use crate::abort::{AbortController, AbortSignal};
use crate::amount::{self, decimal};
use crate::assertions::FromBtcAmountAssertions;
use crate::chain::{ChainEvent, CommitStatus, EscrowData, EscrowKind, SignatureData};
use crate::config::FromBtcLnConfig;
use crate::engine::{self, EscrowHandler, SharedSwap, SwapCell, SwapEngine, SwapStatus};
use crate::error::{SwapError, SwapResult};
use crate::lightning::invoice;
use crate::lightning::{HodlInvoiceRequest, InvoiceState, LightningClient};
use crate::plugin::{QuoteRequest, RequestedAmount};
use crate::swap::{
    FeeQuote, FromBtcLnData, FromBtcLnState, SwapDirection, SwapFees, SwapId, SwapPayload,
    SwapRecord, unix_time,
};

/// CLTV delta requested for the final hop, in blocks.
pub const MIN_FINAL_CLTV_EXPIRY_DELTA: u64 = 144;
const BLOCK_SECS: u64 = 600;

const ESCROWED: &[FromBtcLnState] = &[FromBtcLnState::Received, FromBtcLnState::Commited];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FromBtcLnQuoteRequest {
    #[serde(default)]
    pub chain_id: Option<String>,
    pub token: String,
    /// User's smart-chain address, claimer of the escrow.
    pub claimer: String,
    /// Hex sha256 of the user's secret.
    pub payment_hash: String,
    #[serde(with = "decimal")]
    pub amount: u128,
    #[serde(default)]
    pub exact_in: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FromBtcLnQuote {
    pub id: String,
    pub bolt11: String,
    /// Sats the invoice asks for.
    #[serde(with = "decimal")]
    pub amount: u128,
    #[serde(with = "decimal")]
    pub total: u128,
    #[serde(with = "decimal")]
    pub swap_fee: u128,
    #[serde(with = "decimal")]
    pub swap_fee_in_token: u128,
    #[serde(with = "decimal")]
    pub security_deposit: u128,
}

/// Handed to the user once their payment is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FromBtcLnAuthorization {
    pub escrow: EscrowData,
    pub signature: SignatureData,
}

pub struct FromBtcLnHandler {
    engine: SwapEngine,
    config: FromBtcLnConfig,
    lightning: Arc<dyn LightningClient>,
    assertions: FromBtcAmountAssertions,
}

impl FromBtcLnHandler {
    pub fn new(engine: SwapEngine, config: FromBtcLnConfig, lightning: Arc<dyn LightningClient>) -> Self {
        let assertions = FromBtcAmountAssertions::new(
            &config.limits,
            0,
            engine.plugins.clone(),
            engine.price.clone(),
        );
        Self {
            engine,
            config,
            lightning,
            assertions,
        }
    }

    fn default_fees(&self) -> FeeQuote {
        FeeQuote {
            security_deposit_apy_ppm: self.config.security_deposit_apy_ppm(),
            security_deposit_base_multiplier_ppm: u128::from(
                self.config.security_deposit_base_multiplier_ppm,
            ),
            ..self.assertions.base.default_fees()
        }
    }

    /// Escrow lifetime expected for an HTLC accepted right away.
    fn expected_lock_secs(&self) -> u64 {
        (MIN_FINAL_CLTV_EXPIRY_DELTA * BLOCK_SECS).saturating_sub(self.config.escrow_safety_margin_secs)
    }

    /// Latest escrow expiry still safely before the held HTLC times out.
    fn escrow_expiry(&self, htlc_expiry: u64) -> u64 {
        htlc_expiry.saturating_sub(self.config.escrow_safety_margin_secs)
    }

    pub async fn create_quote(
        &self,
        request: FromBtcLnQuoteRequest,
        signal: &AbortSignal,
    ) -> SwapResult<FromBtcLnQuote> {
        let chain = self.engine.chains.resolve(request.chain_id.as_deref())?;
        chain.check_token(&request.token)?;
        ensure_positive(request.amount, "amount")?;
        if !is_payment_hash(&request.payment_hash) {
            return Err(SwapError::invalid_request("payment_hash must be 32 bytes of hex"));
        }
        let payment_hash = request.payment_hash.to_ascii_lowercase();
        let id = SwapId::new(payment_hash.clone(), None);
        if self.engine.store.load_one(&id).await?.is_some() {
            return Err(SwapError::invalid_request("a swap for this payment hash already exists"));
        }
        let chain_id = chain.chain_id().to_string();
        let contract = chain.contract.clone();
        let native = contract.native_token().to_string();

        let params = request_params(&request)?;
        let quote_request =
            QuoteRequest::new(SwapDirection::FromBtcLn, &chain_id, &request.token, params.clone());
        let requested = RequestedAmount {
            input: request.exact_in,
            amount: request.amount,
        };
        let fees = self
            .assertions
            .pre_check(&quote_request, requested, self.default_fees())
            .await?;

        let abort = AbortController::linked(signal);
        let (price, balance, refund_fee) = tokio::try_join!(
            self.engine.pre_fetch_price(&chain_id, &request.token, &abort),
            self.engine.pre_fetch_balance(contract.as_ref(), &request.token, &abort),
            engine::pre_fetch(&abort, "refund_fee", contract.get_refund_fee()),
        )?;

        let signal = abort.signal();
        let info = self
            .assertions
            .check_amount(&quote_request, requested, fees, None, price, &signal)
            .await?;
        SwapEngine::check_balance(balance, info.total_in_token)?;

        let locked_in_native = self
            .assertions
            .base
            .to_token(info.amount_bd, &chain_id, &native, true, None, &signal)
            .await?;
        let security_deposit = amount::security_deposit(
            refund_fee,
            info.fees.security_deposit_base_multiplier_ppm,
            locked_in_native,
            info.fees.security_deposit_apy_ppm,
            self.expected_lock_secs(),
        );

        let amount_msat = sats_u64(info.amount_bd)?.saturating_mul(1000);
        let bolt11 = signal
            .run(self.lightning.create_hodl_invoice(&HodlInvoiceRequest {
                payment_hash: payment_hash.clone(),
                amount_msat,
                description: request.description.clone(),
                expiry_secs: self.config.invoice_expiry_secs,
                min_final_cltv_expiry_delta: MIN_FINAL_CLTV_EXPIRY_DELTA,
            }))
            .await?
            .context("create hodl invoice")?;
        if let Err(err) = signal.check() {
            self.cancel_invoice(&payment_hash).await;
            return Err(err);
        }

        let mut record = SwapRecord::new(
            id,
            &chain_id,
            SwapPayload::FromBtcLn(FromBtcLnData {
                state: FromBtcLnState::Created,
                bolt11: bolt11.clone(),
                amount: info.amount_bd,
                output: info.total_in_token,
                claimer: request.claimer.clone(),
                token: request.token.clone(),
                security_deposit,
                htlc_expiry: None,
                secret: None,
            }),
            SwapFees {
                swap_fee: info.swap_fee,
                swap_fee_in_token: info.swap_fee_in_token,
                quote: info.fees,
            },
        );
        record.metadata.request = Some(params);
        let id = record.id.to_string();
        self.engine.create_swap(record).await?;

        Ok(FromBtcLnQuote {
            id,
            bolt11,
            amount: info.amount_bd,
            total: info.total_in_token,
            swap_fee: info.swap_fee,
            swap_fee_in_token: info.swap_fee_in_token,
            security_deposit,
        })
    }

    pub async fn get_status(&self, id: &SwapId) -> SwapResult<SwapStatus> {
        self.engine.get_status(id).await
    }

    /// Issues the escrow authorization for a swap whose payment is held.
    /// Repeated calls return the same escrow, re-signed once the previous
    /// authorization lapsed.
    pub async fn authorize_payment(
        &self,
        id: &SwapId,
        signal: &AbortSignal,
    ) -> SwapResult<FromBtcLnAuthorization> {
        let swap = self
            .engine
            .get(id)
            .ok_or_else(|| SwapError::NotFound(id.to_string()))?;
        if swap.snapshot().await.state::<FromBtcLnState>()? == FromBtcLnState::Received {
            return self.reauthorize(&swap, signal).await;
        }

        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            return Err(SwapError::invalid_request("swap is being processed, retry later"));
        };
        let record = swap.snapshot().await;
        match record.state::<FromBtcLnState>()? {
            FromBtcLnState::Created => {}
            state => {
                return Err(SwapError::invalid_request(format!(
                    "swap {id} is already {state}"
                )));
            }
        }

        let payment_hash = record.id.hash.clone();
        let data = record.from_btc_ln()?.clone();
        let held = self
            .lightning
            .get_invoice(&payment_hash)
            .await
            .context("look up invoice")?;
        let htlc_expiry = match held {
            Some(InvoiceState::Held {
                amount_msat,
                htlc_expiry,
            }) if u128::from(amount_msat) >= data.amount.saturating_mul(1000) => htlc_expiry,
            Some(InvoiceState::Held { .. }) => {
                return Err(SwapError::invalid_request("held payment is below the invoice amount"));
            }
            _ => return Err(SwapError::invalid_request("invoice not paid yet")),
        };

        let chain = self.engine.chain(&record.chain_id)?;
        let deadline = authorization_deadline(chain);
        let escrow_expiry = self.escrow_expiry(htlc_expiry);
        if escrow_expiry <= deadline {
            tracing::warn!(swap_id = %id, htlc_expiry, "held HTLC expires too soon, canceling");
            self.cancel_locked(&swap, &[FromBtcLnState::Created], FromBtcLnState::Canceled)
                .await?;
            return Err(SwapError::invalid_request("payment HTLC expires too soon"));
        }

        let contract = chain.contract.clone();
        let balance = signal
            .run(contract.get_balance(&data.token))
            .await?
            .context("fetch balance")?;
        SwapEngine::check_balance(balance, data.output)?;

        let escrow = EscrowData {
            kind: EscrowKind::Htlc,
            offerer: contract.address().to_string(),
            claimer: data.claimer.clone(),
            token: data.token.clone(),
            amount: data.output,
            claim_hash: payment_hash,
            sequence: 0,
            expiry: escrow_expiry,
            confirmations: 0,
            security_deposit: data.security_deposit,
            claimer_bounty: 0,
            pay_in: false,
            pay_out: true,
        };
        let signature = signal
            .run(contract.get_init_signature(&escrow, deadline, None))
            .await?
            .context("sign init authorization")?;
        signal.check()?;

        let authorization = FromBtcLnAuthorization {
            escrow: escrow.clone(),
            signature: signature.clone(),
        };
        let moved = self
            .engine
            .transition(&swap, &[FromBtcLnState::Created], FromBtcLnState::Received, move |r| {
                r.from_btc_ln_mut()?.htlc_expiry = Some(htlc_expiry);
                r.escrow = Some(escrow);
                r.authorization = Some(signature);
                Ok(())
            })
            .await?;
        if moved.is_none() {
            return Err(SwapError::invalid_request(format!("swap {id} changed state, retry")));
        }
        tracing::info!(swap_id = %id, escrow_expiry, "payment held, escrow authorized");
        Ok(authorization)
    }

    async fn reauthorize(&self, swap: &SwapCell, signal: &AbortSignal) -> SwapResult<FromBtcLnAuthorization> {
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            return Err(SwapError::invalid_request("swap is being processed, retry later"));
        };
        let record = swap.snapshot().await;
        if record.state::<FromBtcLnState>()? != FromBtcLnState::Received {
            return Err(SwapError::invalid_request(format!("swap {} changed state, retry", swap.id)));
        }
        let escrow = record.escrow()?.clone();
        let now = unix_time();
        if let Some(signature) = record.authorization.clone()
            && !signature.is_expired(now)
        {
            return Ok(FromBtcLnAuthorization { escrow, signature });
        }

        let chain = self.engine.chain(&record.chain_id)?;
        let deadline = authorization_deadline(chain);
        if escrow.expiry <= deadline {
            return Err(SwapError::invalid_request("escrow expires too soon to re-authorize"));
        }
        let signature = signal
            .run(chain.contract.get_init_signature(&escrow, deadline, None))
            .await?
            .context("sign init authorization")?;
        {
            let mut current = swap.record().await;
            current.authorization = Some(signature.clone());
            self.engine.save(&current).await?;
        }
        Ok(FromBtcLnAuthorization { escrow, signature })
    }

    async fn cancel_invoice(&self, payment_hash: &str) {
        if let Err(err) = self.lightning.cancel_hodl_invoice(payment_hash).await {
            tracing::warn!(payment_hash, error = %format!("{err:#}"), "cancel invoice failed");
        }
    }

    /// Releases the held HTLC back to the payer and closes the swap. The
    /// caller holds the swap's lock.
    async fn cancel_locked(&self, swap: &SwapCell, from: &[FromBtcLnState], next: FromBtcLnState) -> SwapResult<bool> {
        if !from.contains(&swap.snapshot().await.state::<FromBtcLnState>()?) {
            return Ok(false);
        }
        self.lightning
            .cancel_hodl_invoice(&swap.id.hash)
            .await
            .with_context(|| format!("cancel invoice of swap {}", swap.id))?;
        let moved = self.engine.transition(swap, from, next, |_| Ok(())).await?;
        Ok(moved.is_some())
    }

    async fn cancel(&self, swap: &SwapCell, from: &[FromBtcLnState], next: FromBtcLnState) -> SwapResult<bool> {
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            tracing::debug!(swap_id = %swap.id, "cancel skipped, swap locked");
            return Ok(false);
        };
        self.cancel_locked(swap, from, next).await
    }

    /// Cancels an authorized swap the user never committed, once its
    /// authorization lapsed or the escrow can no longer be created.
    async fn cancel_uncommitted(&self, swap: &SwapCell, status: CommitStatus) -> SwapResult<bool> {
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            tracing::debug!(swap_id = %swap.id, "cancel skipped, swap locked");
            return Ok(false);
        };
        let record = swap.snapshot().await;
        if record.state::<FromBtcLnState>()? != FromBtcLnState::Received {
            return Ok(false);
        }
        let lapsed = record
            .authorization
            .as_ref()
            .is_none_or(|a| a.is_expired(unix_time()));
        if status != CommitStatus::Expired && !lapsed {
            return Ok(false);
        }
        self.cancel_locked(swap, &[FromBtcLnState::Received], FromBtcLnState::Canceled)
            .await
    }

    /// Records the preimage revealed by the user's claim, then settles.
    async fn claimed(&self, swap: &SwapCell, secret: String, txid: Option<String>) -> SwapResult<bool> {
        if invoice::payment_hash_of_secret(&secret)? != swap.id.hash {
            return Err(SwapError::InvariantViolation(format!(
                "claim of swap {} revealed a mismatching preimage",
                swap.id
            )));
        }
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            tracing::debug!(swap_id = %swap.id, "claim handling deferred, swap locked");
            return Ok(false);
        };
        let moved = self
            .engine
            .transition(swap, ESCROWED, FromBtcLnState::Claimed, move |r| {
                r.from_btc_ln_mut()?.secret = Some(secret);
                r.txids.claim = txid;
                Ok(())
            })
            .await?;
        if moved.is_none() {
            return Ok(false);
        }
        self.settle_locked(swap).await?;
        Ok(true)
    }

    async fn settle(&self, swap: &SwapCell) -> SwapResult<bool> {
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            return Ok(false);
        };
        self.settle_locked(swap).await
    }

    async fn settle_locked(&self, swap: &SwapCell) -> SwapResult<bool> {
        let record = swap.snapshot().await;
        if record.state::<FromBtcLnState>()? != FromBtcLnState::Claimed {
            return Ok(false);
        }
        let secret = record.from_btc_ln()?.secret.clone().ok_or_else(|| {
            SwapError::InvariantViolation(format!("claimed swap {} has no preimage", swap.id))
        })?;
        self.lightning
            .settle_hodl_invoice(&secret)
            .await
            .with_context(|| format!("settle invoice of swap {}", swap.id))?;
        tracing::info!(swap_id = %swap.id, "invoice settled");
        let moved = self
            .engine
            .transition(swap, &[FromBtcLnState::Claimed], FromBtcLnState::Settled, |_| Ok(()))
            .await?;
        Ok(moved.is_some())
    }

    /// Takes the tokens back from an expired escrow and releases the HTLC.
    async fn refund(&self, swap: &SwapCell) -> SwapResult<bool> {
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            tracing::debug!(swap_id = %swap.id, "refund skipped, swap locked");
            return Ok(false);
        };
        let record = swap.snapshot().await;
        if record.state::<FromBtcLnState>()? != FromBtcLnState::Commited {
            return Ok(false);
        }
        let contract = self.engine.contract(&record.chain_id)?;
        let txid = contract
            .refund(record.escrow()?)
            .await
            .with_context(|| format!("refund escrow of swap {}", swap.id))?;
        tracing::info!(swap_id = %swap.id, txid = %txid, "escrow refunded");
        self.lightning
            .cancel_hodl_invoice(&swap.id.hash)
            .await
            .with_context(|| format!("cancel invoice of swap {}", swap.id))?;
        let moved = self
            .engine
            .transition(swap, &[FromBtcLnState::Commited], FromBtcLnState::Refunded, move |r| {
                r.txids.refund = Some(txid);
                Ok(())
            })
            .await?;
        Ok(moved.is_some())
    }

    async fn reconcile_unescrowed(&self, swap: &SwapCell) -> SwapResult<bool> {
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            return Ok(false);
        };
        let record = swap.snapshot().await;
        if record.state::<FromBtcLnState>()? != FromBtcLnState::Created {
            return Ok(false);
        }
        let invoice = self
            .lightning
            .get_invoice(&swap.id.hash)
            .await
            .context("look up invoice")?;
        let now = unix_time();
        let expire = match invoice {
            None | Some(InvoiceState::Canceled) => true,
            Some(InvoiceState::Unpaid) => {
                now > record
                    .metadata
                    .created_at
                    .saturating_add(self.config.invoice_expiry_secs)
            }
            Some(InvoiceState::Held { htlc_expiry, .. }) => {
                let chain = self.engine.chain(&record.chain_id)?;
                self.escrow_expiry(htlc_expiry) <= authorization_deadline(chain)
            }
            Some(InvoiceState::Settled) => {
                tracing::error!(swap_id = %swap.id, "invoice settled before any escrow");
                false
            }
        };
        if !expire {
            return Ok(false);
        }
        self.cancel_locked(swap, &[FromBtcLnState::Created], FromBtcLnState::Canceled)
            .await
    }
}

#[async_trait]
impl EscrowHandler for FromBtcLnHandler {
    fn engine(&self) -> &SwapEngine {
        &self.engine
    }

    async fn process_initialize_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        let txid = event.txid().to_string();
        self.engine
            .transition(&swap, &[FromBtcLnState::Received], FromBtcLnState::Commited, move |r| {
                r.txids.init = Some(txid);
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn process_claim_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        let ChainEvent::Claim { secret, txid, .. } = event else {
            return Ok(());
        };
        if self.claimed(&swap, secret.clone(), Some(txid.clone())).await? {
            return Ok(());
        }
        // Replayed event: the preimage is already stored, settling may remain.
        self.settle(&swap).await?;
        Ok(())
    }

    async fn process_refund_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        // A busy swap is picked up again by the watchdog.
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            tracing::debug!(swap_id = %swap.id, "refund event deferred, swap locked");
            return Ok(());
        };
        let record = swap.snapshot().await;
        if !ESCROWED.contains(&record.state::<FromBtcLnState>()?) {
            return Ok(());
        }
        let txid = event.txid().to_string();
        self.lightning
            .cancel_hodl_invoice(&swap.id.hash)
            .await
            .with_context(|| format!("cancel invoice of swap {}", swap.id))?;
        self.engine
            .transition(&swap, ESCROWED, FromBtcLnState::Refunded, move |r| {
                r.txids.refund = Some(txid);
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn process_past_swap(&self, swap: SharedSwap) -> SwapResult<bool> {
        let record = swap.snapshot().await;
        if record.is_terminal() {
            return Ok(false);
        }
        let state = record.state::<FromBtcLnState>()?;
        match state {
            FromBtcLnState::Created => return self.reconcile_unescrowed(&swap).await,
            FromBtcLnState::Claimed => return self.settle(&swap).await,
            _ => {}
        }

        let contract = self.engine.contract(&record.chain_id)?;
        let escrow = record.escrow()?;
        let status = contract
            .get_commit_status(escrow)
            .await
            .with_context(|| format!("commit status of swap {}", swap.id))?;

        match (state, status) {
            (_, CommitStatus::Paid) => {
                let secret = contract
                    .get_claim_secret(escrow)
                    .await
                    .with_context(|| format!("claim secret of swap {}", swap.id))?;
                match secret {
                    Some(secret) => self.claimed(&swap, secret, None).await,
                    None => {
                        tracing::warn!(swap_id = %swap.id, "escrow claimed but secret not yet visible");
                        Ok(false)
                    }
                }
            }
            (FromBtcLnState::Received, CommitStatus::Committed | CommitStatus::Refundable) => {
                let moved = self
                    .engine
                    .transition(&swap, &[FromBtcLnState::Received], FromBtcLnState::Commited, |_| {
                        Ok(())
                    })
                    .await?;
                Ok(moved.is_some())
            }
            (FromBtcLnState::Received, _) => self.cancel_uncommitted(&swap, status).await,
            (FromBtcLnState::Commited, CommitStatus::Refundable) => self.refund(&swap).await,
            (FromBtcLnState::Commited, CommitStatus::NotCommitted | CommitStatus::Expired) => {
                self.cancel(&swap, &[FromBtcLnState::Commited], FromBtcLnState::Refunded)
                    .await
            }
            _ => Ok(false),
        }
    }
}
