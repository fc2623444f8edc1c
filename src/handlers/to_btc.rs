//! Smart-chain token → on-chain BTC. The user locks tokens in a nonced escrow
//! that the LP claims by proving it paid the agreed output.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{authorization_deadline, ensure_positive, new_sequence, request_params, sats_u64};
use crate::abort::{AbortController, AbortSignal};
use crate::amount::{self, decimal};
use crate::assertions::ToBtcAmountAssertions;
use crate::bitcoin_rpc::{self, BitcoinRpc, PayoutRequest};
use crate::chain::{ChainEvent, CommitStatus, EscrowData, EscrowKind, SignatureData};
use crate::config::ToBtcConfig;
use crate::engine::{self, EscrowHandler, SharedSwap, SwapCell, SwapEngine, SwapStatus};
use crate::error::{SwapError, SwapResult};
use crate::plugin::{QuoteRequest, RequestedAmount};
use crate::swap::{
    SwapDirection, SwapFees, SwapId, SwapPayload, SwapRecord, SwapState, ToBtcData, ToBtcState,
    unix_time,
};

const OPEN: &[ToBtcState] = &[
    ToBtcState::Saved,
    ToBtcState::Commited,
    ToBtcState::BtcSending,
    ToBtcState::BtcSent,
    ToBtcState::NonPayable,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToBtcQuoteRequest {
    #[serde(default)]
    pub chain_id: Option<String>,
    pub token: String,
    /// User's smart-chain address, offerer of the escrow.
    pub offerer: String,
    /// Bitcoin address to pay.
    pub address: String,
    #[serde(with = "decimal")]
    pub amount: u128,
    /// `amount` is the token input instead of the sats output.
    #[serde(default)]
    pub exact_in: bool,
    pub confirmations: u32,
    pub confirmation_target: u32,
    #[serde(with = "decimal")]
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToBtcQuote {
    pub id: String,
    pub address: String,
    /// Sats paid to `address`.
    #[serde(with = "decimal")]
    pub amount: u128,
    #[serde(with = "decimal")]
    pub swap_fee: u128,
    #[serde(with = "decimal")]
    pub swap_fee_in_token: u128,
    #[serde(with = "decimal")]
    pub network_fee: u128,
    #[serde(with = "decimal")]
    pub network_fee_in_token: u128,
    /// Tokens the user locks.
    #[serde(with = "decimal")]
    pub total: u128,
    pub sats_per_vbyte: u64,
    pub escrow: EscrowData,
    pub signature: SignatureData,
}

pub struct ToBtcHandler {
    engine: SwapEngine,
    config: ToBtcConfig,
    bitcoin: Arc<dyn BitcoinRpc>,
    assertions: ToBtcAmountAssertions,
    tx_check_interval: Duration,
}

impl ToBtcHandler {
    pub fn new(
        engine: SwapEngine,
        config: ToBtcConfig,
        bitcoin: Arc<dyn BitcoinRpc>,
        tx_check_interval: Duration,
    ) -> Self {
        let assertions =
            ToBtcAmountAssertions::new(&config.limits, engine.plugins.clone(), engine.price.clone());
        Self {
            engine,
            config,
            bitcoin,
            assertions,
            tx_check_interval,
        }
    }

    fn network(&self) -> Network {
        self.bitcoin.network()
    }

    /// Network fee charged for a payout at `sats_per_vbyte`.
    fn quoted_network_fee(&self, sats_per_vbyte: u64) -> u128 {
        let base = u128::from(sats_per_vbyte) * u128::from(self.config.payout_vsize);
        amount::apply_ppm(base, u128::from(self.config.network_fee_multiplier_ppm))
    }

    fn validate(&self, request: &ToBtcQuoteRequest) -> SwapResult<()> {
        ensure_positive(request.amount, "amount")?;
        let cfg = &self.config;
        if !(cfg.min_confirmations..=cfg.max_confirmations).contains(&request.confirmations) {
            return Err(SwapError::invalid_request(format!(
                "confirmations must be within {}..={}",
                cfg.min_confirmations, cfg.max_confirmations
            )));
        }
        if !(cfg.min_confirmation_target..=cfg.max_confirmation_target)
            .contains(&request.confirmation_target)
        {
            return Err(SwapError::invalid_request(format!(
                "confirmation_target must be within {}..={}",
                cfg.min_confirmation_target, cfg.max_confirmation_target
            )));
        }
        bitcoin_rpc::parse_address(&request.address, self.network())
            .map_err(|err| SwapError::invalid_request(format!("invalid address: {err:#}")))?;
        Ok(())
    }

    pub async fn create_quote(
        &self,
        request: ToBtcQuoteRequest,
        signal: &AbortSignal,
    ) -> SwapResult<ToBtcQuote> {
        let chain = self.engine.chains.resolve(request.chain_id.as_deref())?;
        chain.check_token(&request.token)?;
        self.validate(&request)?;
        let chain_id = chain.chain_id().to_string();
        let contract = chain.contract.clone();

        let params = request_params(&request)?;
        let quote_request =
            QuoteRequest::new(SwapDirection::ToBtc, &chain_id, &request.token, params.clone());
        let requested = RequestedAmount {
            input: request.exact_in,
            amount: request.amount,
        };
        let fees = self
            .assertions
            .pre_check(&quote_request, requested, self.assertions.base.default_fees())
            .await?;

        let abort = AbortController::linked(signal);
        let (price, sign_data, sats_per_vbyte, btc_balance) = tokio::try_join!(
            self.engine.pre_fetch_price(&chain_id, &request.token, &abort),
            self.engine.pre_fetch_sign_data(contract.as_ref(), &abort),
            engine::pre_fetch(
                &abort,
                "fee_rate",
                self.bitcoin.get_fee_rate(request.confirmation_target)
            ),
            engine::pre_fetch(&abort, "btc_balance", self.bitcoin.get_balance()),
        )?;

        let network_fee = self.quoted_network_fee(sats_per_vbyte);
        let network_fee_fn = move |_: u128| network_fee;
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

        SwapEngine::check_balance(
            u128::from(btc_balance),
            info.amount_bd.saturating_add(info.network_fee),
        )?;

        let amount_sats = sats_u64(info.amount_bd)?;
        let script = bitcoin_rpc::output_script(&request.address, self.network())?;
        let claim_hash = bitcoin_rpc::txo_hash(request.nonce, amount_sats, &script);
        let sequence = new_sequence();
        let escrow = EscrowData {
            kind: EscrowKind::ChainNonced,
            offerer: request.offerer.clone(),
            claimer: contract.address().to_string(),
            token: request.token.clone(),
            amount: info.total_in_token,
            claim_hash: claim_hash.clone(),
            sequence,
            expiry: unix_time().saturating_add(self.config.escrow_expiry_secs),
            confirmations: request.confirmations,
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
            SwapId::new(claim_hash, Some(sequence)),
            &chain_id,
            SwapPayload::ToBtc(ToBtcData {
                state: ToBtcState::Saved,
                address: request.address.clone(),
                amount: info.amount_bd,
                network_fee: info.network_fee,
                network_fee_in_token: info.network_fee_in_token,
                sats_per_vbyte,
                nonce: request.nonce,
                confirmation_target: request.confirmation_target,
                payout: None,
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

        Ok(ToBtcQuote {
            id,
            address: request.address,
            amount: info.amount_bd,
            swap_fee: info.swap_fee,
            swap_fee_in_token: info.swap_fee_in_token,
            network_fee: info.network_fee,
            network_fee_in_token: info.network_fee_in_token,
            total: info.total_in_token,
            sats_per_vbyte,
            escrow,
            signature,
        })
    }

    pub async fn get_status(&self, id: &SwapId) -> SwapResult<SwapStatus> {
        self.engine.get_status(id).await
    }

    /// Cooperative refund signature for a swap the LP gave up on.
    pub async fn get_refund_authorization(&self, id: &SwapId) -> SwapResult<SignatureData> {
        let swap = self
            .engine
            .get(id)
            .ok_or_else(|| SwapError::NotFound(id.to_string()))?;
        let record = swap.snapshot().await;
        if record.state::<ToBtcState>()? != ToBtcState::NonPayable {
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

    async fn mark_non_payable(&self, swap: &SwapCell, reason: &str) -> SwapResult<bool> {
        tracing::warn!(swap_id = %swap.id, reason, "swap not payable");
        let moved = self
            .engine
            .transition(swap, &[ToBtcState::Commited], ToBtcState::NonPayable, |r| {
                r.set_diagnostic("non_payable_reason", reason);
                Ok(())
            })
            .await?;
        Ok(moved.is_some())
    }

    /// Pays out a committed swap: re-check the fee, sign, persist
    /// `BTC_SENDING`, broadcast, persist `BTC_SENT`.
    async fn process_payout(&self, swap: &SwapCell) -> SwapResult<bool> {
        let Some(guard) = swap.try_lock(self.engine.lock_duration()) else {
            tracing::debug!(swap_id = %swap.id, "payout skipped, swap locked");
            return Ok(false);
        };
        let record = swap.snapshot().await;
        if record.state::<ToBtcState>()? != ToBtcState::Commited {
            return Ok(false);
        }
        let data = record.to_btc()?.clone();
        let escrow = record.escrow()?;

        if escrow.expiry.saturating_sub(unix_time()) < self.config.min_escrow_time_left_secs {
            return self.mark_non_payable(swap, "escrow expires too soon").await;
        }

        let current_rate = self
            .bitcoin
            .get_fee_rate(data.confirmation_target)
            .await
            .context("estimate payout fee rate")?;
        if u128::from(current_rate) * u128::from(self.config.payout_vsize) > data.network_fee {
            return self.mark_non_payable(swap, "fee rate above quote").await;
        }

        let amount = sats_u64(data.amount)?;
        let trusted_unconfirmed: Vec<String> =
            self.engine.plugins.whitelisted_tx_ids().await.into_iter().collect();
        if !trusted_unconfirmed.is_empty() {
            tracing::debug!(
                swap_id = %swap.id,
                trusted = trusted_unconfirmed.len(),
                "payout may spend whitelisted unconfirmed outputs"
            );
        }
        let payout = self
            .bitcoin
            .sign_payout(&PayoutRequest {
                address: data.address.clone(),
                amount,
                sats_per_vbyte: current_rate.max(data.sats_per_vbyte),
                nonce: data.nonce,
                trusted_unconfirmed,
            })
            .await
            .with_context(|| format!("sign payout for swap {}", swap.id))?;
        if u128::from(payout.fee) > data.network_fee {
            tracing::warn!(
                swap_id = %swap.id,
                fee = payout.fee,
                quoted = %data.network_fee,
                "payout fee above quote"
            );
            return self.mark_non_payable(swap, "network fee above quote").await;
        }
        if !guard.is_held() {
            tracing::warn!(swap_id = %swap.id, "lease lost before broadcast");
            return Ok(false);
        }

        let sending = self
            .engine
            .transition(swap, &[ToBtcState::Commited], ToBtcState::BtcSending, |r| {
                r.to_btc_mut()?.payout = Some(payout.clone());
                Ok(())
            })
            .await?;
        if sending.is_none() {
            return Ok(false);
        }

        let txid = self
            .bitcoin
            .broadcast(&payout.raw_hex)
            .await
            .with_context(|| format!("broadcast payout for swap {}", swap.id))?;
        tracing::info!(swap_id = %swap.id, txid = %txid, amount, fee = payout.fee, "payout broadcast");
        self.engine
            .transition(swap, &[ToBtcState::BtcSending], ToBtcState::BtcSent, |_| Ok(()))
            .await?;
        Ok(true)
    }

    /// A crash between persisting `BTC_SENDING` and `BTC_SENT` leaves the
    /// signed payout in the record; it is re-broadcast rather than re-signed.
    async fn recover_sending(&self, swap: &SwapCell, record: &SwapRecord) -> SwapResult<bool> {
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            return Ok(false);
        };
        let Some(payout) = record.to_btc()?.payout.clone() else {
            let moved = self
                .engine
                .transition(swap, &[ToBtcState::BtcSending], ToBtcState::Commited, |_| Ok(()))
                .await?;
            return Ok(moved.is_some());
        };

        let known = self
            .bitcoin
            .get_transaction(&payout.txid)
            .await
            .context("look up payout")?;
        if known.is_none() {
            if let Err(err) = self.bitcoin.broadcast(&payout.raw_hex).await {
                tracing::warn!(
                    swap_id = %swap.id,
                    txid = %payout.txid,
                    error = %format!("{err:#}"),
                    "payout rejected on re-broadcast, signing a new one"
                );
                let moved = self
                    .engine
                    .transition(swap, &[ToBtcState::BtcSending], ToBtcState::Commited, |r| {
                        r.to_btc_mut()?.payout = None;
                        r.set_diagnostic("rebroadcast_error", format!("{err:#}"));
                        Ok(())
                    })
                    .await?;
                return Ok(moved.is_some());
            }
            tracing::info!(swap_id = %swap.id, txid = %payout.txid, "payout re-broadcast");
        }
        let moved = self
            .engine
            .transition(swap, &[ToBtcState::BtcSending], ToBtcState::BtcSent, |_| Ok(()))
            .await?;
        Ok(moved.is_some())
    }

    /// Claims the escrow once the payout has enough confirmations.
    async fn check_payout(&self, swap: &SwapCell) -> SwapResult<bool> {
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            tracing::debug!(swap_id = %swap.id, "payout check skipped, swap locked");
            return Ok(false);
        };
        let record = swap.snapshot().await;
        if record.state::<ToBtcState>()? != ToBtcState::BtcSent {
            return Ok(false);
        }
        let data = record.to_btc()?;
        let escrow = record.escrow()?;
        let payout = data.payout.as_ref().ok_or_else(|| {
            SwapError::InvariantViolation(format!("swap {} sent without a payout", swap.id))
        })?;

        let Some(tx) = self
            .bitcoin
            .get_transaction(&payout.txid)
            .await
            .context("look up payout")?
        else {
            tracing::debug!(swap_id = %swap.id, txid = %payout.txid, "payout not seen yet");
            return Ok(false);
        };
        if tx.confirmations < escrow.confirmations {
            return Ok(false);
        }

        let amount = sats_u64(data.amount)?;
        let script = bitcoin_rpc::output_script(&data.address, self.network())?;
        let vout = tx.find_output(&script, amount).ok_or_else(|| {
            SwapError::InvariantViolation(format!(
                "payout {} of swap {} has no output paying {amount} sats to {}",
                tx.txid, swap.id, data.address
            ))
        })?;
        if bitcoin_rpc::txo_hash(data.nonce, amount, &script) != escrow.claim_hash {
            return Err(SwapError::InvariantViolation(format!(
                "payout of swap {} does not match the claim hash",
                swap.id
            )));
        }

        let contract = self.engine.contract(&record.chain_id)?;
        let txid = contract
            .claim_with_bitcoin_tx(escrow, &tx, vout)
            .await
            .with_context(|| format!("claim escrow of swap {}", swap.id))?;
        let moved = self
            .engine
            .transition(swap, &[ToBtcState::BtcSent], ToBtcState::Claimed, move |r| {
                r.txids.claim = Some(txid);
                Ok(())
            })
            .await?;
        Ok(moved.is_some())
    }

    /// Claims every confirmed payout. Returns how many swaps were claimed.
    pub async fn check_payouts(&self) -> SwapResult<usize> {
        let swaps = self
            .engine
            .store
            .query(&[ToBtcState::BtcSent.code()])
            .await?;
        let mut claimed = 0;
        for swap in swaps {
            match self.check_payout(&swap).await {
                Ok(true) => claimed += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(swap_id = %swap.id, error = %err, "payout check failed");
                }
            }
        }
        Ok(claimed)
    }

    async fn close(&self, swap: &SwapCell, next: ToBtcState, txid: Option<String>) -> SwapResult<bool> {
        let moved = self
            .engine
            .transition(swap, OPEN, next, move |r| {
                match next {
                    ToBtcState::Claimed => r.txids.claim = txid,
                    _ => r.txids.refund = txid,
                }
                Ok(())
            })
            .await?;
        Ok(moved.is_some())
    }
}

#[async_trait]
impl EscrowHandler for ToBtcHandler {
    fn engine(&self) -> &SwapEngine {
        &self.engine
    }

    async fn process_initialize_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        let txid = event.txid().to_string();
        let moved = self
            .engine
            .transition(&swap, &[ToBtcState::Saved], ToBtcState::Commited, move |r| {
                r.txids.init = Some(txid);
                Ok(())
            })
            .await?;
        if moved.is_some() {
            self.process_payout(&swap).await?;
        }
        Ok(())
    }

    async fn process_claim_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        self.close(&swap, ToBtcState::Claimed, Some(event.txid().to_string()))
            .await?;
        Ok(())
    }

    async fn process_refund_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        let record = swap.snapshot().await;
        if matches!(record.state::<ToBtcState>()?, ToBtcState::BtcSending | ToBtcState::BtcSent) {
            tracing::error!(swap_id = %swap.id, "escrow refunded after the payout was sent");
        }
        self.close(&swap, ToBtcState::Refunded, Some(event.txid().to_string()))
            .await?;
        Ok(())
    }

    async fn process_past_swap(&self, swap: SharedSwap) -> SwapResult<bool> {
        let record = swap.snapshot().await;
        if record.is_terminal() {
            return Ok(false);
        }
        let state = record.state::<ToBtcState>()?;
        let contract = self.engine.contract(&record.chain_id)?;
        let status = contract
            .get_commit_status(record.escrow()?)
            .await
            .with_context(|| format!("commit status of swap {}", swap.id))?;

        match (state, status) {
            (_, CommitStatus::Paid) => self.close(&swap, ToBtcState::Claimed, None).await,
            (ToBtcState::Saved, CommitStatus::Committed | CommitStatus::Refundable) => {
                let moved = self
                    .engine
                    .transition(&swap, &[ToBtcState::Saved], ToBtcState::Commited, |_| Ok(()))
                    .await?;
                Ok(moved.is_some())
            }
            (ToBtcState::Saved, _) => {
                let now = unix_time();
                let lapsed = record.authorization.as_ref().is_none_or(|a| a.is_expired(now));
                if status == CommitStatus::Expired || lapsed {
                    let moved = self
                        .engine
                        .transition(&swap, &[ToBtcState::Saved], ToBtcState::Canceled, |_| Ok(()))
                        .await?;
                    return Ok(moved.is_some());
                }
                Ok(false)
            }
            (ToBtcState::Commited, CommitStatus::Committed | CommitStatus::Refundable) => {
                self.process_payout(&swap).await
            }
            (ToBtcState::BtcSending, _) => self.recover_sending(&swap, &record).await,
            (ToBtcState::BtcSent, CommitStatus::Committed | CommitStatus::Refundable) => {
                self.check_payout(&swap).await
            }
            (ToBtcState::NonPayable, CommitStatus::Committed | CommitStatus::Refundable) => Ok(false),
            // Escrow gone without a claim: the user refunded.
            (_, CommitStatus::NotCommitted | CommitStatus::Expired) => {
                self.close(&swap, ToBtcState::Refunded, None).await
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
                if let Err(err) = self.check_payouts().await {
                    tracing::warn!(error = %err, "payout watcher pass failed");
                }
            }
        })]
    }
}
