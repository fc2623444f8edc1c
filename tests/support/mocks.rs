#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::{Address, Network, ScriptBuf};
use serde_json::{Value, json};
use tokio::sync::broadcast;

use swap_intermediary::bitcoin_rpc::{BitcoinRpc, BitcoinTx, PayoutRequest, SignedPayout, TxOutput};
use swap_intermediary::chain::{ChainEvent, CommitStatus, EscrowData, SignatureData, SwapContract};
use swap_intermediary::lightning::invoice::{payment_hash_from_bolt11, payment_hash_of_secret};
use swap_intermediary::lightning::{HodlInvoiceRequest, InvoiceState, LightningClient, PaymentStatus};

pub const CHAIN: &str = "main";
pub const TOKEN: &str = "USDC";
pub const NATIVE: &str = "NATIVE";
pub const LP_ADDRESS: &str = "lp-address";

/// Virtual size the mock wallet charges for every payout.
pub const MOCK_PAYOUT_VSIZE: u64 = 140;

#[derive(Debug, Default)]
struct ChainState {
    statuses: HashMap<String, CommitStatus>,
    secrets: HashMap<String, String>,
    balances: HashMap<String, u128>,
    claims: Vec<String>,
    claim_attempts: usize,
    refunds: Vec<String>,
    init_signatures: usize,
    fail_sign_data: bool,
}

/// In-memory escrow contract. Escrows are keyed by their escrow hash.
pub struct MockContract {
    events: broadcast::Sender<ChainEvent>,
    state: Mutex<ChainState>,
    refund_fee: u128,
    txs: AtomicU64,
}

impl MockContract {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let mut state = ChainState::default();
        state.balances.insert(TOKEN.to_string(), 100_000_000_000);
        state.balances.insert(NATIVE.to_string(), 100_000_000_000);
        Self {
            events,
            state: Mutex::new(state),
            refund_fee: 5_000,
            txs: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().expect("mock chain mutex poisoned")
    }

    fn next_txid(&self, kind: &str) -> String {
        format!("{kind}-{}", self.txs.fetch_add(1, Ordering::Relaxed))
    }

    pub fn set_balance(&self, token: &str, amount: u128) {
        self.lock().balances.insert(token.to_string(), amount);
    }

    pub fn set_status(&self, escrow: &EscrowData, status: CommitStatus) {
        self.lock().statuses.insert(escrow.escrow_hash(), status);
    }

    pub fn status(&self, escrow: &EscrowData) -> CommitStatus {
        self.lock()
            .statuses
            .get(&escrow.escrow_hash())
            .copied()
            .unwrap_or(CommitStatus::NotCommitted)
    }

    pub fn fail_sign_data(&self, fail: bool) {
        self.lock().fail_sign_data = fail;
    }

    /// Marks the escrow claimed by the user with `secret`, as seen on chain.
    pub fn user_claim(&self, escrow: &EscrowData, secret: &str) -> ChainEvent {
        let hash = escrow.escrow_hash();
        let mut state = self.lock();
        state.statuses.insert(hash.clone(), CommitStatus::Paid);
        state.secrets.insert(hash.clone(), secret.to_string());
        drop(state);
        ChainEvent::Claim {
            escrow_hash: hash,
            secret: secret.to_string(),
            txid: self.next_txid("user-claim"),
        }
    }

    /// Commits the escrow and returns the matching event, without emitting it.
    pub fn commit(&self, escrow: &EscrowData) -> ChainEvent {
        self.set_status(escrow, CommitStatus::Committed);
        ChainEvent::Initialize {
            escrow_hash: escrow.escrow_hash(),
            txid: self.next_txid("init"),
        }
    }

    pub fn emit(&self, event: ChainEvent) {
        let _ = self.events.send(event);
    }

    pub fn claims(&self) -> Vec<String> {
        self.lock().claims.clone()
    }

    /// Claim calls made by the LP, successful or not.
    pub fn claim_attempts(&self) -> usize {
        self.lock().claim_attempts
    }

    pub fn refunds(&self) -> Vec<String> {
        self.lock().refunds.clone()
    }

    pub fn init_signatures(&self) -> usize {
        self.lock().init_signatures
    }

    fn signature(prefix: &str, escrow: &EscrowData, timeout: u64) -> SignatureData {
        SignatureData {
            prefix: prefix.to_string(),
            timeout,
            signature: format!("{prefix}:{}:{timeout}", escrow.escrow_hash()),
        }
    }
}

#[async_trait]
impl SwapContract for MockContract {
    fn chain_id(&self) -> &str {
        CHAIN
    }

    fn native_token(&self) -> &str {
        NATIVE
    }

    fn address(&self) -> &str {
        LP_ADDRESS
    }

    fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    async fn pre_fetch_sign_data(&self) -> Result<Option<Value>> {
        if self.lock().fail_sign_data {
            anyhow::bail!("rpc unavailable");
        }
        Ok(Some(json!({ "block_hash": "00".repeat(32) })))
    }

    async fn get_init_signature(
        &self,
        escrow: &EscrowData,
        timeout: u64,
        _pre_fetched: Option<Value>,
    ) -> Result<SignatureData> {
        self.lock().init_signatures += 1;
        Ok(Self::signature("init", escrow, timeout))
    }

    async fn get_refund_signature(&self, escrow: &EscrowData, timeout: u64) -> Result<SignatureData> {
        Ok(Self::signature("refund", escrow, timeout))
    }

    async fn get_commit_status(&self, escrow: &EscrowData) -> Result<CommitStatus> {
        Ok(self.status(escrow))
    }

    async fn get_claim_secret(&self, escrow: &EscrowData) -> Result<Option<String>> {
        Ok(self.lock().secrets.get(&escrow.escrow_hash()).cloned())
    }

    async fn claim_with_secret(&self, escrow: &EscrowData, secret: &str) -> Result<String> {
        let hash = escrow.escrow_hash();
        anyhow::ensure!(
            payment_hash_of_secret(secret)? == escrow.claim_hash,
            "secret does not match claim hash"
        );
        let mut state = self.lock();
        state.claim_attempts += 1;
        anyhow::ensure!(
            state.statuses.get(&hash) == Some(&CommitStatus::Committed),
            "escrow not claimable"
        );
        state.statuses.insert(hash.clone(), CommitStatus::Paid);
        state.secrets.insert(hash.clone(), secret.to_string());
        state.claims.push(hash);
        drop(state);
        Ok(self.next_txid("claim"))
    }

    async fn claim_with_bitcoin_tx(&self, escrow: &EscrowData, tx: &BitcoinTx, _vout: u32) -> Result<String> {
        let hash = escrow.escrow_hash();
        let mut state = self.lock();
        state.claim_attempts += 1;
        anyhow::ensure!(
            state.statuses.get(&hash) == Some(&CommitStatus::Committed),
            "escrow not claimable"
        );
        anyhow::ensure!(
            tx.confirmations >= escrow.confirmations,
            "transaction not confirmed enough"
        );
        state.statuses.insert(hash.clone(), CommitStatus::Paid);
        state.claims.push(hash);
        drop(state);
        Ok(self.next_txid("claim"))
    }

    async fn refund(&self, escrow: &EscrowData) -> Result<String> {
        let hash = escrow.escrow_hash();
        let mut state = self.lock();
        anyhow::ensure!(
            state.statuses.get(&hash) == Some(&CommitStatus::Refundable),
            "escrow not refundable"
        );
        state.statuses.insert(hash.clone(), CommitStatus::NotCommitted);
        state.refunds.push(hash);
        drop(state);
        Ok(self.next_txid("refund"))
    }

    async fn get_balance(&self, token: &str) -> Result<u128> {
        Ok(self.lock().balances.get(token).copied().unwrap_or_default())
    }

    async fn get_refund_fee(&self) -> Result<u128> {
        Ok(self.refund_fee)
    }
}

#[derive(Debug, Default)]
struct WalletState {
    fee_rate: u64,
    balance: u64,
    signed: HashMap<String, (String, PayoutRequest)>,
    txs: HashMap<String, BitcoinTx>,
    broadcasts: usize,
    reject_broadcast: bool,
    addresses: u8,
    lookup_delay: Duration,
}

/// Bitcoin wallet on mainnet whose payouts only exist once broadcast.
pub struct MockBitcoin {
    state: Mutex<WalletState>,
}

impl MockBitcoin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WalletState {
                fee_rate: 10,
                balance: 1_000_000_000,
                ..WalletState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WalletState> {
        self.state.lock().expect("mock wallet mutex poisoned")
    }

    pub fn set_fee_rate(&self, sats_per_vbyte: u64) {
        self.lock().fee_rate = sats_per_vbyte;
    }

    pub fn set_balance(&self, sats: u64) {
        self.lock().balance = sats;
    }

    /// Slows down transaction lookups, widening race windows.
    pub fn set_lookup_delay(&self, delay: Duration) {
        self.lock().lookup_delay = delay;
    }

    pub fn reject_broadcast(&self, reject: bool) {
        self.lock().reject_broadcast = reject;
    }

    pub fn confirm(&self, txid: &str, confirmations: u32) {
        if let Some(tx) = self.lock().txs.get_mut(txid) {
            tx.confirmations = confirmations;
        }
    }

    /// Forgets a broadcast transaction, as if it was evicted from the mempool.
    pub fn drop_tx(&self, txid: &str) {
        self.lock().txs.remove(txid);
    }

    pub fn broadcasts(&self) -> usize {
        self.lock().broadcasts
    }

    pub fn signed_payouts(&self) -> usize {
        self.lock().signed.len()
    }

    pub fn payout_requests(&self) -> Vec<PayoutRequest> {
        let mut signed: Vec<_> = self.lock().signed.values().cloned().collect();
        signed.sort_by(|a, b| a.0.cmp(&b.0));
        signed.into_iter().map(|(_, request)| request).collect()
    }
}

#[async_trait]
impl BitcoinRpc for MockBitcoin {
    fn network(&self) -> Network {
        Network::Bitcoin
    }

    async fn get_fee_rate(&self, _target_blocks: u32) -> Result<u64> {
        Ok(self.lock().fee_rate)
    }

    async fn get_balance(&self) -> Result<u64> {
        Ok(self.lock().balance)
    }

    async fn get_new_address(&self) -> Result<String> {
        let mut state = self.lock();
        state.addresses = state.addresses.wrapping_add(1);
        let script = ScriptBuf::from_bytes(vec![0x51, state.addresses]);
        Ok(Address::p2wsh(&script, Network::Bitcoin).to_string())
    }

    async fn sign_payout(&self, request: &PayoutRequest) -> Result<SignedPayout> {
        let mut state = self.lock();
        let n = state.signed.len();
        let payout = SignedPayout {
            txid: format!("payout-{n}"),
            raw_hex: format!("raw-{n}"),
            fee: request.sats_per_vbyte * MOCK_PAYOUT_VSIZE,
        };
        state
            .signed
            .insert(payout.raw_hex.clone(), (payout.txid.clone(), request.clone()));
        Ok(payout)
    }

    async fn broadcast(&self, raw_hex: &str) -> Result<String> {
        let mut state = self.lock();
        anyhow::ensure!(!state.reject_broadcast, "transaction rejected");
        let (txid, request) = state
            .signed
            .get(raw_hex)
            .cloned()
            .context("unknown raw transaction")?;
        let address = swap_intermediary::bitcoin_rpc::output_script(&request.address, Network::Bitcoin)?;
        state.broadcasts += 1;
        state.txs.insert(
            txid.clone(),
            BitcoinTx {
                txid: txid.clone(),
                raw_hex: raw_hex.to_string(),
                confirmations: 0,
                outputs: vec![TxOutput {
                    script_pubkey_hex: hex::encode(address),
                    value: request.amount,
                }],
            },
        );
        Ok(txid)
    }

    async fn get_transaction(&self, txid: &str) -> Result<Option<BitcoinTx>> {
        let delay = self.lock().lookup_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.lock().txs.get(txid).cloned())
    }
}

/// Outcome of the next payments started through [`MockLightning::pay`].
#[derive(Debug, Clone)]
pub enum PayOutcome {
    /// Succeeds with the preimage registered for the payment hash.
    Succeed,
    Fail(String),
    /// Stays pending until resolved by the test.
    Hang,
}

#[derive(Debug)]
struct NodeState {
    invoices: HashMap<String, InvoiceState>,
    preimages: HashMap<String, String>,
    payments: HashMap<String, PaymentStatus>,
    pays: usize,
    outcome: PayOutcome,
    outbound_sats: u64,
    route_fee_msat: Option<u64>,
    settled: Vec<String>,
    canceled: Vec<String>,
}

pub struct MockLightning {
    state: Mutex<NodeState>,
}

impl MockLightning {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NodeState {
                invoices: HashMap::new(),
                preimages: HashMap::new(),
                payments: HashMap::new(),
                pays: 0,
                outcome: PayOutcome::Succeed,
                outbound_sats: 100_000_000,
                route_fee_msat: Some(1_000),
                settled: Vec::new(),
                canceled: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().expect("mock node mutex poisoned")
    }

    /// Makes payments to `sha256(secret)` reveal `secret`.
    pub fn learn_preimage(&self, secret: &str) -> Result<()> {
        let hash = payment_hash_of_secret(secret)?;
        self.lock().preimages.insert(hash, secret.to_string());
        Ok(())
    }

    pub fn set_outcome(&self, outcome: PayOutcome) {
        self.lock().outcome = outcome;
    }

    pub fn set_route_fee(&self, fee_msat: Option<u64>) {
        self.lock().route_fee_msat = fee_msat;
    }

    pub fn set_outbound(&self, sats: u64) {
        self.lock().outbound_sats = sats;
    }

    pub fn set_payment(&self, payment_hash: &str, status: PaymentStatus) {
        self.lock().payments.insert(payment_hash.to_string(), status);
    }

    /// The payer's HTLC arrives and is held.
    pub fn hold(&self, payment_hash: &str, amount_msat: u64, htlc_expiry: u64) {
        self.lock().invoices.insert(
            payment_hash.to_string(),
            InvoiceState::Held {
                amount_msat,
                htlc_expiry,
            },
        );
    }

    pub fn invoice(&self, payment_hash: &str) -> Option<InvoiceState> {
        self.lock().invoices.get(payment_hash).copied()
    }

    pub fn pays(&self) -> usize {
        self.lock().pays
    }

    pub fn settled(&self) -> Vec<String> {
        self.lock().settled.clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.lock().canceled.clone()
    }
}

#[async_trait]
impl LightningClient for MockLightning {
    async fn create_hodl_invoice(&self, request: &HodlInvoiceRequest) -> Result<String> {
        let mut state = self.lock();
        anyhow::ensure!(
            !state.invoices.contains_key(&request.payment_hash),
            "invoice already exists"
        );
        state
            .invoices
            .insert(request.payment_hash.clone(), InvoiceState::Unpaid);
        Ok(format!("lnbcmock{}{}", request.amount_msat, request.payment_hash))
    }

    async fn get_invoice(&self, payment_hash: &str) -> Result<Option<InvoiceState>> {
        Ok(self.invoice(payment_hash))
    }

    async fn settle_hodl_invoice(&self, secret: &str) -> Result<()> {
        let hash = payment_hash_of_secret(secret)?;
        let mut state = self.lock();
        match state.invoices.get(&hash) {
            Some(InvoiceState::Held { .. }) => {}
            Some(InvoiceState::Settled) => return Ok(()),
            other => anyhow::bail!("cannot settle invoice in state {other:?}"),
        }
        state.invoices.insert(hash.clone(), InvoiceState::Settled);
        state.settled.push(hash);
        Ok(())
    }

    async fn cancel_hodl_invoice(&self, payment_hash: &str) -> Result<()> {
        let mut state = self.lock();
        anyhow::ensure!(
            state.invoices.get(payment_hash) != Some(&InvoiceState::Settled),
            "invoice already settled"
        );
        state
            .invoices
            .insert(payment_hash.to_string(), InvoiceState::Canceled);
        state.canceled.push(payment_hash.to_string());
        Ok(())
    }

    async fn pay(&self, bolt11: &str, _max_fee_msat: u64, _timeout: Duration) -> Result<()> {
        let hash = hex::encode(payment_hash_from_bolt11(bolt11)?);
        let mut state = self.lock();
        state.pays += 1;
        let status = match state.outcome.clone() {
            PayOutcome::Succeed => {
                let secret = state
                    .preimages
                    .get(&hash)
                    .cloned()
                    .context("no preimage for payment hash")?;
                PaymentStatus::Succeeded {
                    secret,
                    fee_msat: 500,
                }
            }
            PayOutcome::Fail(reason) => PaymentStatus::Failed { reason },
            PayOutcome::Hang => PaymentStatus::Pending,
        };
        state.payments.insert(hash, status);
        Ok(())
    }

    async fn get_payment(&self, payment_hash: &str) -> Result<Option<PaymentStatus>> {
        Ok(self.lock().payments.get(payment_hash).cloned())
    }

    async fn get_outbound_liquidity(&self) -> Result<u64> {
        Ok(self.lock().outbound_sats)
    }

    async fn probe_route_fee(&self, _bolt11: &str) -> Result<Option<u64>> {
        Ok(self.lock().route_fee_msat)
    }
}
