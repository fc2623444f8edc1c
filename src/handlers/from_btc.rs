//! On-chain BTC → smart-chain token. The LP locks tokens for the user, who
//! claims them by proving the BTC payment to a fresh LP address.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{authorization_deadline, ensure_positive, new_sequence, request_params, sats_u64};
use crate::abort::{AbortController, AbortSignal};
use crate::amount::{self, decimal};
use crate::assertions::from_btc::GasRequest;
use crate::assertions::FromBtcAmountAssertions;
use crate::bitcoin_rpc::{self, BitcoinRpc};
use crate::chain::{ChainEvent, CommitStatus, EscrowData, EscrowKind, SignatureData};
use crate::config::FromBtcConfig;
use crate::engine::{self, EscrowHandler, SharedSwap, SwapCell, SwapEngine, SwapStatus};
use crate::error::SwapResult;
use crate::plugin::{QuoteRequest, RequestedAmount};
use crate::swap::{
    FeeQuote, FromBtcData, FromBtcState, SwapDirection, SwapFees, SwapId, SwapPayload, SwapRecord,
    unix_time,
};

const OPEN: &[FromBtcState] = &[FromBtcState::Created, FromBtcState::Commited];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FromBtcQuoteRequest {
    #[serde(default)]
    pub chain_id: Option<String>,
    pub token: String,
    /// User's smart-chain address, claimer of the escrow.
    pub claimer: String,
    #[serde(with = "decimal")]
    pub amount: u128,
    /// `amount` is the sats input instead of the token output.
    #[serde(default)]
    pub exact_in: bool,
    /// Native token to drop to the claimer along with the swap.
    #[serde(default, with = "decimal")]
    pub gas_amount: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct FromBtcQuote {
    pub id: String,
    /// Where the user sends BTC.
    pub address: String,
    #[serde(with = "decimal")]
    pub amount: u128,
    /// Tokens paid out.
    #[serde(with = "decimal")]
    pub total: u128,
    #[serde(with = "decimal")]
    pub swap_fee: u128,
    #[serde(with = "decimal")]
    pub swap_fee_in_token: u128,
    #[serde(with = "decimal")]
    pub gas_amount: u128,
    #[serde(with = "decimal")]
    pub security_deposit: u128,
    pub escrow: EscrowData,
    pub signature: SignatureData,
}

pub struct FromBtcHandler {
    engine: SwapEngine,
    config: FromBtcConfig,
    bitcoin: Arc<dyn BitcoinRpc>,
    assertions: FromBtcAmountAssertions,
}

impl FromBtcHandler {
    pub fn new(engine: SwapEngine, config: FromBtcConfig, bitcoin: Arc<dyn BitcoinRpc>) -> Self {
        let assertions = FromBtcAmountAssertions::new(
            &config.limits,
            u128::from(config.gas_max),
            engine.plugins.clone(),
            engine.price.clone(),
        );
        Self {
            engine,
            config,
            bitcoin,
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

    pub async fn create_quote(
        &self,
        request: FromBtcQuoteRequest,
        signal: &AbortSignal,
    ) -> SwapResult<FromBtcQuote> {
        let chain = self.engine.chains.resolve(request.chain_id.as_deref())?;
        chain.check_token(&request.token)?;
        ensure_positive(request.amount, "amount")?;
        let chain_id = chain.chain_id().to_string();
        let contract = chain.contract.clone();
        let native = contract.native_token().to_string();

        let params = request_params(&request)?;
        let quote_request =
            QuoteRequest::new(SwapDirection::FromBtc, &chain_id, &request.token, params.clone());
        let requested = RequestedAmount {
            input: request.exact_in,
            amount: request.amount,
        };
        let fees = self
            .assertions
            .pre_check(&quote_request, requested, self.default_fees())
            .await?;

        let abort = AbortController::linked(signal);
        let gas_price = async {
            if request.gas_amount == 0 {
                return Ok(None);
            }
            self.engine.pre_fetch_price(&chain_id, &native, &abort).await
        };
        let (price, gas_price, sign_data, balance, refund_fee) = tokio::try_join!(
            self.engine.pre_fetch_price(&chain_id, &request.token, &abort),
            gas_price,
            self.engine.pre_fetch_sign_data(contract.as_ref(), &abort),
            self.engine.pre_fetch_balance(contract.as_ref(), &request.token, &abort),
            engine::pre_fetch(&abort, "refund_fee", contract.get_refund_fee()),
        )?;

        let gas = (request.gas_amount > 0).then(|| GasRequest {
            token: native.clone(),
            amount: request.gas_amount,
            price_pre_fetch: gas_price,
        });
        let signal = abort.signal();
        let info = self
            .assertions
            .check_amount(&quote_request, requested, fees, gas, price, &signal)
            .await?;

        let mut required = info.total_in_token;
        if request.token == native {
            required = required.saturating_add(request.gas_amount);
        }
        SwapEngine::check_balance(balance, required)?;

        let escrow_secs = self.config.escrow_expiry_secs;
        let locked_in_native = self
            .assertions
            .base
            .to_token(info.amount_bd, &chain_id, &native, true, gas_price, &signal)
            .await?;
        let security_deposit = amount::security_deposit(
            refund_fee,
            info.fees.security_deposit_base_multiplier_ppm,
            locked_in_native,
            info.fees.security_deposit_apy_ppm,
            escrow_secs,
        );

        let address = signal
            .run(self.bitcoin.get_new_address())
            .await?
            .context("derive receive address")?;
        let amount_sats = sats_u64(info.amount_bd)?;
        let script = bitcoin_rpc::output_script(&address, self.bitcoin.network())?;
        let sequence = new_sequence();
        let claim_hash = bitcoin_rpc::txo_hash(0, amount_sats, &script);
        let escrow = EscrowData {
            kind: EscrowKind::Chain,
            offerer: contract.address().to_string(),
            claimer: request.claimer.clone(),
            token: request.token.clone(),
            amount: info.total_in_token,
            claim_hash: claim_hash.clone(),
            sequence,
            expiry: unix_time().saturating_add(escrow_secs),
            confirmations: self.config.confirmations,
            security_deposit,
            claimer_bounty: 0,
            pay_in: false,
            pay_out: true,
        };
        let signature = signal
            .run(contract.get_init_signature(&escrow, authorization_deadline(chain), sign_data))
            .await?
            .context("sign init authorization")?;
        signal.check()?;

        let gas_amount = info.gas.map_or(0, |g| g.amount);
        let mut record = SwapRecord::new(
            SwapId::new(claim_hash, Some(sequence)),
            &chain_id,
            SwapPayload::FromBtc(FromBtcData {
                state: FromBtcState::Created,
                address: address.clone(),
                amount: info.amount_bd,
                output: info.total_in_token,
                gas_amount,
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

        Ok(FromBtcQuote {
            id,
            address,
            amount: info.amount_bd,
            total: info.total_in_token,
            swap_fee: info.swap_fee,
            swap_fee_in_token: info.swap_fee_in_token,
            gas_amount,
            security_deposit,
            escrow,
            signature,
        })
    }

    pub async fn get_status(&self, id: &SwapId) -> SwapResult<SwapStatus> {
        self.engine.get_status(id).await
    }

    async fn close(&self, swap: &SwapCell, next: FromBtcState, txid: Option<String>) -> SwapResult<bool> {
        let moved = self
            .engine
            .transition(swap, OPEN, next, move |r| {
                match next {
                    FromBtcState::Claimed => r.txids.claim = txid,
                    _ => r.txids.refund = txid,
                }
                Ok(())
            })
            .await?;
        Ok(moved.is_some())
    }

    /// Takes the tokens back from an expired escrow.
    async fn refund(&self, swap: &SwapCell, record: &SwapRecord) -> SwapResult<bool> {
        let Some(_guard) = swap.try_lock(self.engine.lock_duration()) else {
            tracing::debug!(swap_id = %swap.id, "refund skipped, swap locked");
            return Ok(false);
        };
        let current = swap.snapshot().await;
        if current.state::<FromBtcState>()? != FromBtcState::Commited {
            return Ok(false);
        }
        let contract = self.engine.contract(&record.chain_id)?;
        let txid = contract
            .refund(record.escrow()?)
            .await
            .with_context(|| format!("refund escrow of swap {}", swap.id))?;
        tracing::info!(swap_id = %swap.id, txid = %txid, "escrow refunded");
        self.close(swap, FromBtcState::Refunded, Some(txid)).await
    }
}

#[async_trait]
impl EscrowHandler for FromBtcHandler {
    fn engine(&self) -> &SwapEngine {
        &self.engine
    }

    async fn process_initialize_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        let txid = event.txid().to_string();
        self.engine
            .transition(&swap, &[FromBtcState::Created], FromBtcState::Commited, move |r| {
                r.txids.init = Some(txid);
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn process_claim_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        self.close(&swap, FromBtcState::Claimed, Some(event.txid().to_string()))
            .await?;
        Ok(())
    }

    async fn process_refund_event(&self, swap: SharedSwap, event: &ChainEvent) -> SwapResult<()> {
        self.close(&swap, FromBtcState::Refunded, Some(event.txid().to_string()))
            .await?;
        Ok(())
    }

    async fn process_past_swap(&self, swap: SharedSwap) -> SwapResult<bool> {
        let record = swap.snapshot().await;
        if record.is_terminal() {
            return Ok(false);
        }
        let state = record.state::<FromBtcState>()?;
        let contract = self.engine.contract(&record.chain_id)?;
        let status = contract
            .get_commit_status(record.escrow()?)
            .await
            .with_context(|| format!("commit status of swap {}", swap.id))?;

        match (state, status) {
            (_, CommitStatus::Paid) => self.close(&swap, FromBtcState::Claimed, None).await,
            (FromBtcState::Created, CommitStatus::Committed | CommitStatus::Refundable) => {
                let moved = self
                    .engine
                    .transition(&swap, &[FromBtcState::Created], FromBtcState::Commited, |_| Ok(()))
                    .await?;
                Ok(moved.is_some())
            }
            (FromBtcState::Created, _) => {
                let now = unix_time();
                let lapsed = record.authorization.as_ref().is_none_or(|a| a.is_expired(now));
                if status == CommitStatus::Expired || lapsed {
                    let moved = self
                        .engine
                        .transition(&swap, &[FromBtcState::Created], FromBtcState::Canceled, |_| {
                            Ok(())
                        })
                        .await?;
                    return Ok(moved.is_some());
                }
                Ok(false)
            }
            (FromBtcState::Commited, CommitStatus::Refundable) => self.refund(&swap, &record).await,
            (FromBtcState::Commited, CommitStatus::NotCommitted | CommitStatus::Expired) => {
                self.close(&swap, FromBtcState::Refunded, None).await
            }
            _ => Ok(false),
        }
    }
}
