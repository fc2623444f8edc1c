//! Concrete swap directions built on [`crate::engine`].

pub mod from_btc;
pub mod from_btc_ln;
pub mod to_btc;
pub mod to_btc_ln;

use anyhow::Context as _;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::chain::ChainEntry;
use crate::error::{SwapError, SwapResult};
use crate::swap::unix_time;

pub use from_btc::{FromBtcHandler, FromBtcQuote, FromBtcQuoteRequest};
pub use from_btc_ln::{FromBtcLnAuthorization, FromBtcLnHandler, FromBtcLnQuote, FromBtcLnQuoteRequest};
pub use to_btc::{ToBtcHandler, ToBtcQuote, ToBtcQuoteRequest};
pub use to_btc_ln::{ToBtcLnHandler, ToBtcLnQuote, ToBtcLnQuoteRequest};

/// Replay-protection sequence for a new nonced escrow.
pub(crate) fn new_sequence() -> u64 {
    Uuid::new_v4().as_u64_pair().0
}

/// Unix time at which an authorization issued now stops being valid.
pub(crate) fn authorization_deadline(chain: &ChainEntry) -> u64 {
    unix_time().saturating_add(chain.authorization_timeout.as_secs())
}

pub(crate) fn request_params<T: Serialize>(request: &T) -> SwapResult<Value> {
    Ok(serde_json::to_value(request).context("encode quote request")?)
}

pub(crate) fn ensure_positive(amount: u128, field: &str) -> SwapResult<()> {
    if amount == 0 {
        return Err(SwapError::invalid_request(format!("{field} must be > 0")));
    }
    Ok(())
}

pub(crate) fn sats_u64(sats: u128) -> SwapResult<u64> {
    u64::try_from(sats)
        .map_err(|_| SwapError::InvariantViolation(format!("{sats} sats does not fit u64")))
}

pub(crate) fn is_payment_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}
