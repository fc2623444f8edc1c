//! Bitcoin wallet/node interface. Transaction construction stays behind the
//! trait; the LP only needs payouts, lookups and fee estimates.

use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::{Address, Network};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub script_pubkey_hex: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitcoinTx {
    pub txid: String,
    pub raw_hex: String,
    pub confirmations: u32,
    pub outputs: Vec<TxOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutRequest {
    pub address: String,
    pub amount: u64,
    pub sats_per_vbyte: u64,
    /// Committed into the transaction so the claim hash can bind it.
    pub nonce: u64,
    /// Unconfirmed transactions whose outputs the wallet may spend to fund
    /// the payout. Anything else must be confirmed.
    pub trusted_unconfirmed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayout {
    pub txid: String,
    pub raw_hex: String,
    pub fee: u64,
}

#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    fn network(&self) -> Network;

    /// Fee estimate in sat/vB for confirmation within `target_blocks`.
    async fn get_fee_rate(&self, target_blocks: u32) -> Result<u64>;

    /// Spendable wallet balance in sats.
    async fn get_balance(&self) -> Result<u64>;

    async fn get_new_address(&self) -> Result<String>;

    /// Builds and signs, but does not broadcast, a payout.
    async fn sign_payout(&self, request: &PayoutRequest) -> Result<SignedPayout>;

    /// Returns the txid.
    async fn broadcast(&self, raw_hex: &str) -> Result<String>;

    /// `None` when the transaction is neither in the mempool nor in a block.
    async fn get_transaction(&self, txid: &str) -> Result<Option<BitcoinTx>>;
}

pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    Address::from_str(address)
        .with_context(|| format!("parse bitcoin address {address}"))?
        .require_network(network)
        .with_context(|| format!("address {address} is not valid for {network}"))
}

pub fn output_script(address: &str, network: Network) -> Result<Vec<u8>> {
    Ok(parse_address(address, network)?.script_pubkey().to_bytes())
}

/// Commitment to a transaction output, bound to `nonce`:
/// `sha256(nonce_le || amount_le || script_pubkey)`.
pub fn txo_hash(nonce: u64, amount: u64, script_pubkey: &[u8]) -> String {
    let mut buf = Vec::with_capacity(16 + script_pubkey.len());
    buf.extend_from_slice(&nonce.to_le_bytes());
    buf.extend_from_slice(&amount.to_le_bytes());
    buf.extend_from_slice(script_pubkey);
    hex::encode(sha256::Hash::hash(&buf).to_byte_array())
}

impl BitcoinTx {
    /// Index of the output paying exactly `value` to `script_pubkey`.
    pub fn find_output(&self, script_pubkey: &[u8], value: u64) -> Option<u32> {
        let script_hex = hex::encode(script_pubkey);
        self.outputs
            .iter()
            .position(|out| out.value == value && out.script_pubkey_hex == script_hex)
            .and_then(|idx| u32::try_from(idx).ok())
    }
}
