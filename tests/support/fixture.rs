#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bitcoin::Network;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

use swap_intermediary::bitcoin_rpc::BitcoinRpc;
use swap_intermediary::chain::{ChainEntry, ChainRegistry, SwapContract};
use swap_intermediary::config::{ChainConfig, LpConfig};
use swap_intermediary::engine::SwapEngine;
use swap_intermediary::handlers::{FromBtcHandler, FromBtcLnHandler, ToBtcHandler, ToBtcLnHandler};
use swap_intermediary::lightning::LightningClient;
use swap_intermediary::lightning::invoice::payment_hash_of_secret;
use swap_intermediary::plugin::PluginRegistry;
use swap_intermediary::price::{FixedPriceOracle, PRICE_SCALE};
use swap_intermediary::service::{LpAdapters, LpService};
use swap_intermediary::storage::{MemorySwapStorage, SwapStorage};
use swap_intermediary::swap::SwapDirection;

use super::mocks::{CHAIN, MockBitcoin, MockContract, MockLightning, NATIVE, TOKEN};

/// A mainnet address the mock wallet can pay to.
pub const BTC_ADDRESS: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

/// Everything a handler needs, backed by in-memory mocks.
pub struct Harness {
    pub config: LpConfig,
    pub contract: Arc<MockContract>,
    pub bitcoin: Arc<MockBitcoin>,
    pub lightning: Arc<MockLightning>,
    pub storage: Arc<MemorySwapStorage>,
    pub plugins: Arc<PluginRegistry>,
    pub price: Arc<FixedPriceOracle>,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = LpConfig::default();
        config.chains.insert(
            CHAIN.to_string(),
            ChainConfig {
                tokens: vec![TOKEN.to_string()],
                authorization_timeout_secs: 180,
            },
        );
        config.default_chain = CHAIN.to_string();
        config.watchdog.interval_secs = 1;
        config.watchdog.tx_check_interval_secs = 1;

        // 1 sat = 10 USDC units, 1 sat = 1 native unit
        let price = FixedPriceOracle::new()
            .with_price(CHAIN, TOKEN, PRICE_SCALE / 10)
            .with_price(CHAIN, NATIVE, PRICE_SCALE);

        Self {
            config,
            contract: Arc::new(MockContract::new()),
            bitcoin: Arc::new(MockBitcoin::new()),
            lightning: Arc::new(MockLightning::new()),
            storage: Arc::new(MemorySwapStorage::new()),
            plugins: Arc::new(PluginRegistry::new()),
            price: Arc::new(price),
        }
    }

    pub fn chains(&self) -> Result<Arc<ChainRegistry>> {
        let chain_config = self
            .config
            .chain(CHAIN)
            .ok_or_else(|| anyhow::anyhow!("chain {CHAIN} not configured"))?;
        let entry = ChainEntry::new(self.contract.clone(), chain_config);
        Ok(Arc::new(ChainRegistry::new(CHAIN, [entry])?))
    }

    pub fn engine(&self, direction: SwapDirection) -> Result<SwapEngine> {
        Ok(SwapEngine::new(
            direction,
            self.storage.clone(),
            self.chains()?,
            self.plugins.clone(),
            self.price.clone(),
            self.config.watchdog.lock_duration(),
        ))
    }

    pub fn to_btc(&self) -> Result<Arc<ToBtcHandler>> {
        Ok(Arc::new(ToBtcHandler::new(
            self.engine(SwapDirection::ToBtc)?,
            self.config.to_btc.clone(),
            self.bitcoin.clone(),
            Duration::from_millis(50),
        )))
    }

    pub fn from_btc(&self) -> Result<Arc<FromBtcHandler>> {
        Ok(Arc::new(FromBtcHandler::new(
            self.engine(SwapDirection::FromBtc)?,
            self.config.from_btc.clone(),
            self.bitcoin.clone(),
        )))
    }

    pub fn to_btc_ln(&self) -> Result<Arc<ToBtcLnHandler>> {
        Ok(Arc::new(ToBtcLnHandler::new(
            self.engine(SwapDirection::ToBtcLn)?,
            self.config.to_btc_ln.clone(),
            self.lightning.clone(),
            Network::Bitcoin,
            Duration::from_millis(50),
        )))
    }

    pub fn from_btc_ln(&self) -> Result<Arc<FromBtcLnHandler>> {
        Ok(Arc::new(FromBtcLnHandler::new(
            self.engine(SwapDirection::FromBtcLn)?,
            self.config.from_btc_ln.clone(),
            self.lightning.clone(),
        )))
    }

    pub fn adapters(&self) -> LpAdapters {
        LpAdapters {
            storage: self.storage.clone() as Arc<dyn SwapStorage>,
            contracts: vec![self.contract.clone() as Arc<dyn SwapContract>],
            bitcoin: self.bitcoin.clone() as Arc<dyn BitcoinRpc>,
            lightning: Some(self.lightning.clone() as Arc<dyn LightningClient>),
            price: self.price.clone(),
            plugins: self.plugins.clone(),
        }
    }

    pub async fn service(&self) -> Result<LpService> {
        Ok(LpService::new(self.config.clone(), self.adapters()).await?)
    }
}

/// Hex secret filled with `byte`, and its payment hash.
pub fn secret(byte: u8) -> Result<(String, String)> {
    let secret = hex::encode([byte; 32]);
    let hash = payment_hash_of_secret(&secret)?;
    Ok((secret, hash))
}

/// Mainnet BOLT11 invoice for `payment_hash`, issued now.
pub fn signed_invoice(payment_hash: &str, amount_msat: u64, expiry_secs: u64) -> Result<String> {
    let hash: [u8; 32] = hex::decode(payment_hash)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("payment hash must be 32 bytes"))?;
    let key = SecretKey::from_slice(&[0x42; 32])?;
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?;
    let invoice = InvoiceBuilder::new(Currency::Bitcoin)
        .description("swap".to_string())
        .payment_hash(sha256::Hash::from_byte_array(hash))
        .payment_secret(PaymentSecret([7u8; 32]))
        .duration_since_epoch(now)
        .min_final_cltv_expiry_delta(144)
        .amount_milli_satoshis(amount_msat)
        .expiry_time(Duration::from_secs(expiry_secs))
        .build_signed(|hash| Secp256k1::new().sign_ecdsa_recoverable(hash, &key))
        .map_err(|err| anyhow::anyhow!("sign invoice: {err:?}"))?;
    Ok(invoice.to_string())
}
