use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lock::{SwapLock, SwapLockGuard};
use super::state::{
    FromBtcLnState, FromBtcState, SwapDirection, SwapState, ToBtcLnState, ToBtcState,
};
use crate::amount::{decimal, decimal_opt};
use crate::bitcoin_rpc::SignedPayout;
use crate::chain::{EscrowData, SignatureData};
use crate::error::{SwapError, SwapResult};

/// `hash` alone, or `hash_sequence` for sequence-protected escrows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwapId {
    pub hash: String,
    #[serde(default, with = "decimal_opt", skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl SwapId {
    pub fn new(hash: impl Into<String>, sequence: Option<u64>) -> Self {
        Self {
            hash: hash.into(),
            sequence,
        }
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence {
            Some(seq) => write!(f, "{}_{seq}", self.hash),
            None => f.write_str(&self.hash),
        }
    }
}

impl FromStr for SwapId {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, sequence) = match s.split_once('_') {
            Some((hash, seq)) => {
                let seq = seq
                    .parse::<u64>()
                    .map_err(|_| SwapError::invalid_request(format!("invalid swap id {s}")))?;
                (hash, Some(seq))
            }
            None => (s, None),
        };
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SwapError::invalid_request(format!("invalid swap id {s}")));
        }
        Ok(Self::new(hash.to_ascii_lowercase(), sequence))
    }
}

/// Fee parameters applied to one quote. Plugins may override any of them
/// before they are frozen into the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    #[serde(with = "decimal")]
    pub base_fee: u128,
    #[serde(with = "decimal")]
    pub fee_ppm: u128,
    #[serde(with = "decimal")]
    pub security_deposit_apy_ppm: u128,
    #[serde(with = "decimal")]
    pub security_deposit_base_multiplier_ppm: u128,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapFees {
    /// Denominated in sats.
    #[serde(with = "decimal")]
    pub swap_fee: u128,
    /// Denominated in the swap's smart-chain token.
    #[serde(with = "decimal")]
    pub swap_fee_in_token: u128,
    pub quote: FeeQuote,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapMetadata {
    pub created_at: u64,
    /// Unix time each state was entered, keyed by state name.
    #[serde(default)]
    pub times: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub diagnostics: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTxIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToBtcData {
    pub state: ToBtcState,
    pub address: String,
    /// Sats paid to `address`.
    #[serde(with = "decimal")]
    pub amount: u128,
    /// Network fee charged to the user, in sats.
    #[serde(with = "decimal")]
    pub network_fee: u128,
    #[serde(with = "decimal")]
    pub network_fee_in_token: u128,
    /// Fee rate the quote was priced at.
    pub sats_per_vbyte: u64,
    #[serde(with = "decimal")]
    pub nonce: u64,
    pub confirmation_target: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout: Option<SignedPayout>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FromBtcData {
    pub state: FromBtcState,
    /// LP address the user pays to.
    pub address: String,
    /// Sats expected at `address`.
    #[serde(with = "decimal")]
    pub amount: u128,
    /// Token paid out through the escrow.
    #[serde(with = "decimal")]
    pub output: u128,
    /// Native token dropped to the claimer alongside the swap.
    #[serde(with = "decimal")]
    pub gas_amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToBtcLnData {
    pub state: ToBtcLnState,
    pub bolt11: String,
    #[serde(with = "decimal")]
    pub amount: u128,
    /// Routing fee budget in sats.
    #[serde(with = "decimal")]
    pub max_fee: u128,
    #[serde(default, with = "decimal_opt", skip_serializing_if = "Option::is_none")]
    pub real_fee_msat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FromBtcLnData {
    pub state: FromBtcLnState,
    pub bolt11: String,
    /// Sats received over Lightning.
    #[serde(with = "decimal")]
    pub amount: u128,
    #[serde(with = "decimal")]
    pub output: u128,
    pub claimer: String,
    pub token: String,
    #[serde(with = "decimal")]
    pub security_deposit: u128,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub htlc_expiry: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum SwapPayload {
    ToBtc(ToBtcData),
    FromBtc(FromBtcData),
    ToBtcLn(ToBtcLnData),
    FromBtcLn(FromBtcLnData),
}

/// Links a state enum to its payload variant.
pub trait PayloadState: SwapState {
    const DIRECTION: SwapDirection;
    fn get(payload: &SwapPayload) -> Option<Self>;
    fn put(payload: &mut SwapPayload, state: Self) -> bool;
}

macro_rules! payload_state {
    ($state:ident, $variant:ident) => {
        impl PayloadState for $state {
            const DIRECTION: SwapDirection = SwapDirection::$variant;

            fn get(payload: &SwapPayload) -> Option<Self> {
                match payload {
                    SwapPayload::$variant(data) => Some(data.state),
                    _ => None,
                }
            }

            fn put(payload: &mut SwapPayload, state: Self) -> bool {
                match payload {
                    SwapPayload::$variant(data) => {
                        data.state = state;
                        true
                    }
                    _ => false,
                }
            }
        }
    };
}

payload_state!(ToBtcState, ToBtc);
payload_state!(FromBtcState, FromBtc);
payload_state!(ToBtcLnState, ToBtcLn);
payload_state!(FromBtcLnState, FromBtcLn);

impl SwapPayload {
    pub fn direction(&self) -> SwapDirection {
        match self {
            Self::ToBtc(_) => SwapDirection::ToBtc,
            Self::FromBtc(_) => SwapDirection::FromBtc,
            Self::ToBtcLn(_) => SwapDirection::ToBtcLn,
            Self::FromBtcLn(_) => SwapDirection::FromBtcLn,
        }
    }

    pub fn state_code(&self) -> i32 {
        match self {
            Self::ToBtc(d) => d.state.code(),
            Self::FromBtc(d) => d.state.code(),
            Self::ToBtcLn(d) => d.state.code(),
            Self::FromBtcLn(d) => d.state.code(),
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            Self::ToBtc(d) => d.state.name(),
            Self::FromBtc(d) => d.state.name(),
            Self::ToBtcLn(d) => d.state.name(),
            Self::FromBtcLn(d) => d.state.name(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::ToBtc(d) => d.state.is_terminal(),
            Self::FromBtc(d) => d.state.is_terminal(),
            Self::ToBtcLn(d) => d.state.is_terminal(),
            Self::FromBtcLn(d) => d.state.is_terminal(),
        }
    }
}

/// Emitted by [`SwapRecord::set_state`]; the caller persists, then notifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub id: SwapId,
    pub direction: SwapDirection,
    pub from: i32,
    pub to: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRecord {
    pub id: SwapId,
    pub chain_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow: Option<EscrowData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<SignatureData>,
    pub payload: SwapPayload,
    pub fees: SwapFees,
    pub metadata: SwapMetadata,
    #[serde(default)]
    pub txids: SwapTxIds,
    #[serde(skip)]
    lock: SwapLock,
}

fn wrong_direction(id: &SwapId, expected: SwapDirection) -> SwapError {
    SwapError::InvariantViolation(format!("swap {id} is not a {expected} swap"))
}

impl SwapRecord {
    pub fn new(id: SwapId, chain_id: impl Into<String>, payload: SwapPayload, fees: SwapFees) -> Self {
        let now = super::unix_time();
        let mut metadata = SwapMetadata {
            created_at: now,
            ..SwapMetadata::default()
        };
        metadata
            .times
            .insert(payload.state_name().to_ascii_lowercase(), now);
        Self {
            id,
            chain_id: chain_id.into(),
            escrow: None,
            authorization: None,
            payload,
            fees,
            metadata,
            txids: SwapTxIds::default(),
            lock: SwapLock::new(),
        }
    }

    pub fn direction(&self) -> SwapDirection {
        self.payload.direction()
    }

    pub fn state_code(&self) -> i32 {
        self.payload.state_code()
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    pub fn state<S: PayloadState>(&self) -> SwapResult<S> {
        S::get(&self.payload).ok_or_else(|| wrong_direction(&self.id, S::DIRECTION))
    }

    /// Moves along the direction's transition graph. Only mutates; persisting
    /// and notifying are up to the caller.
    pub fn set_state<S: PayloadState>(&mut self, next: S) -> SwapResult<StateChange> {
        let prev = self.state::<S>()?;
        if !prev.can_transition_to(next) {
            return Err(SwapError::InvariantViolation(format!(
                "swap {}: illegal transition {prev} -> {next}",
                self.id
            )));
        }
        S::put(&mut self.payload, next);
        self.metadata
            .times
            .insert(next.name().to_ascii_lowercase(), super::unix_time());
        Ok(StateChange {
            id: self.id.clone(),
            direction: S::DIRECTION,
            from: prev.code(),
            to: next.code(),
        })
    }

    /// Non-blocking lease on this record, shared by every clone.
    pub fn try_lock(&self, duration: Duration) -> Option<SwapLockGuard> {
        self.lock.try_lock(duration)
    }

    pub fn lock_handle(&self) -> SwapLock {
        self.lock.clone()
    }

    pub fn escrow_hash(&self) -> Option<String> {
        self.escrow.as_ref().map(EscrowData::escrow_hash)
    }

    pub fn escrow(&self) -> SwapResult<&EscrowData> {
        self.escrow
            .as_ref()
            .ok_or_else(|| SwapError::InvariantViolation(format!("swap {} has no escrow", self.id)))
    }

    pub fn set_diagnostic(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.diagnostics.insert(key.to_string(), value.into());
    }

    /// What the user pays: token units for smart-chain → BTC, sats otherwise.
    pub fn input_amount(&self) -> u128 {
        match &self.payload {
            SwapPayload::ToBtc(_) | SwapPayload::ToBtcLn(_) => {
                self.escrow.as_ref().map_or(0, |e| e.amount)
            }
            SwapPayload::FromBtc(d) => d.amount,
            SwapPayload::FromBtcLn(d) => d.amount,
        }
    }

    /// What the user receives.
    pub fn output_amount(&self) -> u128 {
        match &self.payload {
            SwapPayload::ToBtc(d) => d.amount,
            SwapPayload::ToBtcLn(d) => d.amount,
            SwapPayload::FromBtc(d) => d.output,
            SwapPayload::FromBtcLn(d) => d.output,
        }
    }

    pub fn swap_fee(&self) -> u128 {
        self.fees.swap_fee
    }

    pub fn swap_fee_in_token(&self) -> u128 {
        self.fees.swap_fee_in_token
    }

    pub fn to_btc(&self) -> SwapResult<&ToBtcData> {
        match &self.payload {
            SwapPayload::ToBtc(d) => Ok(d),
            _ => Err(wrong_direction(&self.id, SwapDirection::ToBtc)),
        }
    }

    pub fn to_btc_mut(&mut self) -> SwapResult<&mut ToBtcData> {
        match &mut self.payload {
            SwapPayload::ToBtc(d) => Ok(d),
            _ => Err(wrong_direction(&self.id, SwapDirection::ToBtc)),
        }
    }

    pub fn from_btc(&self) -> SwapResult<&FromBtcData> {
        match &self.payload {
            SwapPayload::FromBtc(d) => Ok(d),
            _ => Err(wrong_direction(&self.id, SwapDirection::FromBtc)),
        }
    }

    pub fn from_btc_mut(&mut self) -> SwapResult<&mut FromBtcData> {
        match &mut self.payload {
            SwapPayload::FromBtc(d) => Ok(d),
            _ => Err(wrong_direction(&self.id, SwapDirection::FromBtc)),
        }
    }

    pub fn to_btc_ln(&self) -> SwapResult<&ToBtcLnData> {
        match &self.payload {
            SwapPayload::ToBtcLn(d) => Ok(d),
            _ => Err(wrong_direction(&self.id, SwapDirection::ToBtcLn)),
        }
    }

    pub fn to_btc_ln_mut(&mut self) -> SwapResult<&mut ToBtcLnData> {
        match &mut self.payload {
            SwapPayload::ToBtcLn(d) => Ok(d),
            _ => Err(wrong_direction(&self.id, SwapDirection::ToBtcLn)),
        }
    }

    pub fn from_btc_ln(&self) -> SwapResult<&FromBtcLnData> {
        match &self.payload {
            SwapPayload::FromBtcLn(d) => Ok(d),
            _ => Err(wrong_direction(&self.id, SwapDirection::FromBtcLn)),
        }
    }

    pub fn from_btc_ln_mut(&mut self) -> SwapResult<&mut FromBtcLnData> {
        match &mut self.payload {
            SwapPayload::FromBtcLn(d) => Ok(d),
            _ => Err(wrong_direction(&self.id, SwapDirection::FromBtcLn)),
        }
    }
}
