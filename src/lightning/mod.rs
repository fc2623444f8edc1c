pub mod invoice;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HodlInvoiceRequest {
    /// Hex payment hash chosen by the payer.
    pub payment_hash: String,
    pub amount_msat: u64,
    pub description: String,
    pub expiry_secs: u64,
    pub min_final_cltv_expiry_delta: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum InvoiceState {
    Unpaid,
    /// HTLC accepted and held; `htlc_expiry` is the unix time at which the
    /// incoming HTLC times out.
    Held { amount_msat: u64, htlc_expiry: u64 },
    Settled,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PaymentStatus {
    Pending,
    Succeeded { secret: String, fee_msat: u64 },
    Failed { reason: String },
}

/// Lightning node operations the LP relies on.
#[async_trait]
pub trait LightningClient: Send + Sync {
    /// Returns the BOLT11 invoice.
    async fn create_hodl_invoice(&self, request: &HodlInvoiceRequest) -> Result<String>;

    async fn get_invoice(&self, payment_hash: &str) -> Result<Option<InvoiceState>>;

    /// Settles the held HTLC paying to `sha256(secret)`.
    async fn settle_hodl_invoice(&self, secret: &str) -> Result<()>;

    async fn cancel_hodl_invoice(&self, payment_hash: &str) -> Result<()>;

    /// Starts a payment; completion is observed through [`Self::get_payment`].
    async fn pay(&self, bolt11: &str, max_fee_msat: u64, timeout: Duration) -> Result<()>;

    /// `None` when no payment to `payment_hash` was ever attempted.
    async fn get_payment(&self, payment_hash: &str) -> Result<Option<PaymentStatus>>;

    /// Spendable outbound capacity in sats.
    async fn get_outbound_liquidity(&self) -> Result<u64>;

    /// Estimated routing fee in msat, `None` if no route is known.
    async fn probe_route_fee(&self, _bolt11: &str) -> Result<Option<u64>> {
        Ok(Some(0))
    }
}
