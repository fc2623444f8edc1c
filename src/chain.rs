//! Smart-chain escrow adapter interface and the per-chain registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::amount::decimal;
use crate::bitcoin_rpc::BitcoinTx;
use crate::config::ChainConfig;
use crate::error::{SwapError, SwapResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowKind {
    /// Claimed with a hash preimage.
    Htlc,
    /// Claimed with a proof of a Bitcoin transaction output.
    Chain,
    /// Like `Chain`, with a nonce bound into the claim hash.
    ChainNonced,
}

impl EscrowKind {
    fn tag(self) -> u8 {
        match self {
            Self::Htlc => 0,
            Self::Chain => 1,
            Self::ChainNonced => 2,
        }
    }
}

/// Escrow parameters as committed on the smart chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowData {
    pub kind: EscrowKind,
    pub offerer: String,
    pub claimer: String,
    pub token: String,
    #[serde(with = "decimal")]
    pub amount: u128,
    /// Hex-encoded claim hash (payment hash or output commitment).
    pub claim_hash: String,
    #[serde(with = "decimal")]
    pub sequence: u64,
    /// Unix seconds after which the offerer may refund.
    pub expiry: u64,
    pub confirmations: u32,
    #[serde(with = "decimal")]
    pub security_deposit: u128,
    #[serde(with = "decimal")]
    pub claimer_bounty: u128,
    pub pay_in: bool,
    pub pay_out: bool,
}

impl EscrowData {
    /// SHA-256 over a canonical encoding of the escrow fields, hex encoded.
    pub fn escrow_hash(&self) -> String {
        let mut buf = Vec::with_capacity(256);
        buf.push(self.kind.tag());
        for field in [&self.offerer, &self.claimer, &self.token, &self.claim_hash] {
            buf.extend_from_slice(&(field.len() as u32).to_le_bytes());
            buf.extend_from_slice(field.as_bytes());
        }
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.expiry.to_le_bytes());
        buf.extend_from_slice(&self.confirmations.to_le_bytes());
        buf.extend_from_slice(&self.security_deposit.to_le_bytes());
        buf.extend_from_slice(&self.claimer_bounty.to_le_bytes());
        buf.push(u8::from(self.pay_in) | (u8::from(self.pay_out) << 1));
        hex::encode(sha256::Hash::hash(&buf).to_byte_array())
    }

    /// Sequence-protected escrows are identified by hash and sequence.
    pub fn is_sequenced(&self) -> bool {
        self.kind != EscrowKind::Htlc
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiry
    }
}

/// Authorization handed to a client so it can initialize an escrow, or
/// cooperatively refund one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureData {
    pub prefix: String,
    /// Unix seconds after which the authorization is void.
    pub timeout: u64,
    pub signature: String,
}

impl SignatureData {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    NotCommitted,
    Committed,
    /// Claimed by the claimer.
    Paid,
    /// Never committed and the authorization lapsed.
    Expired,
    /// Committed and past expiry.
    Refundable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Initialize {
        escrow_hash: String,
        txid: String,
    },
    Claim {
        escrow_hash: String,
        /// Hex preimage for HTLC escrows, empty for proof-based claims.
        secret: String,
        txid: String,
    },
    Refund {
        escrow_hash: String,
        txid: String,
    },
}

impl ChainEvent {
    pub fn escrow_hash(&self) -> &str {
        match self {
            Self::Initialize { escrow_hash, .. }
            | Self::Claim { escrow_hash, .. }
            | Self::Refund { escrow_hash, .. } => escrow_hash,
        }
    }

    pub fn txid(&self) -> &str {
        match self {
            Self::Initialize { txid, .. } | Self::Claim { txid, .. } | Self::Refund { txid, .. } => {
                txid
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::Claim { .. } => "claim",
            Self::Refund { .. } => "refund",
        }
    }
}

/// Binding to the escrow contract on one smart chain.
#[async_trait]
pub trait SwapContract: Send + Sync {
    fn chain_id(&self) -> &str;

    fn native_token(&self) -> &str;

    /// LP's own address on this chain.
    fn address(&self) -> &str;

    /// Escrow lifecycle events observed on chain.
    fn subscribe(&self) -> broadcast::Receiver<ChainEvent>;

    /// Data (e.g. a recent block hash) reused by the next signature.
    async fn pre_fetch_sign_data(&self) -> Result<Option<Value>>;

    async fn get_init_signature(
        &self,
        escrow: &EscrowData,
        timeout: u64,
        pre_fetched: Option<Value>,
    ) -> Result<SignatureData>;

    async fn get_refund_signature(&self, escrow: &EscrowData, timeout: u64)
    -> Result<SignatureData>;

    async fn get_commit_status(&self, escrow: &EscrowData) -> Result<CommitStatus>;

    /// Preimage revealed by the claim of an HTLC escrow, once claimed.
    async fn get_claim_secret(&self, escrow: &EscrowData) -> Result<Option<String>>;

    /// Returns the claim transaction id.
    async fn claim_with_secret(&self, escrow: &EscrowData, secret: &str) -> Result<String>;

    async fn claim_with_bitcoin_tx(
        &self,
        escrow: &EscrowData,
        tx: &BitcoinTx,
        vout: u32,
    ) -> Result<String>;

    async fn refund(&self, escrow: &EscrowData) -> Result<String>;

    async fn get_balance(&self, token: &str) -> Result<u128>;

    /// Cost of a refund transaction in native token units.
    async fn get_refund_fee(&self) -> Result<u128>;
}

pub struct ChainEntry {
    pub contract: Arc<dyn SwapContract>,
    pub tokens: Vec<String>,
    pub authorization_timeout: Duration,
}

impl ChainEntry {
    pub fn new(contract: Arc<dyn SwapContract>, config: &ChainConfig) -> Self {
        Self {
            contract,
            tokens: config.tokens.clone(),
            authorization_timeout: Duration::from_secs(config.authorization_timeout_secs),
        }
    }

    pub fn chain_id(&self) -> &str {
        self.contract.chain_id()
    }

    /// The native token is always accepted.
    pub fn check_token(&self, token: &str) -> SwapResult<()> {
        if token == self.contract.native_token() || self.tokens.iter().any(|t| t == token) {
            return Ok(());
        }
        Err(SwapError::unsupported_token(self.chain_id(), token))
    }
}

pub struct ChainRegistry {
    default_chain: String,
    chains: HashMap<String, ChainEntry>,
}

impl ChainRegistry {
    pub fn new(
        default_chain: impl Into<String>,
        entries: impl IntoIterator<Item = ChainEntry>,
    ) -> SwapResult<Self> {
        let default_chain = default_chain.into();
        let chains: HashMap<_, _> = entries
            .into_iter()
            .map(|entry| (entry.chain_id().to_string(), entry))
            .collect();
        if !chains.contains_key(&default_chain) {
            return Err(SwapError::Config(format!(
                "no adapter registered for default chain {default_chain}"
            )));
        }
        Ok(Self {
            default_chain,
            chains,
        })
    }

    pub fn default_chain(&self) -> &str {
        &self.default_chain
    }

    pub fn get(&self, chain_id: &str) -> Option<&ChainEntry> {
        self.chains.get(chain_id)
    }

    /// Resolves a request's chain, falling back to the default one.
    pub fn resolve(&self, chain_id: Option<&str>) -> SwapResult<&ChainEntry> {
        let chain_id = chain_id.unwrap_or(&self.default_chain);
        self.chains.get(chain_id).ok_or_else(|| SwapError::ClientInput {
            code: crate::error::codes::UNSUPPORTED_TOKEN,
            msg: format!("unsupported chain {chain_id}"),
            data: None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainEntry> {
        self.chains.values()
    }
}
