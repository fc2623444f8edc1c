pub mod lock;
pub mod record;
pub mod state;

use std::time::{SystemTime, UNIX_EPOCH};

pub use lock::{SwapLock, SwapLockGuard};
pub use record::{
    FeeQuote, FromBtcData, FromBtcLnData, PayloadState, StateChange, SwapFees, SwapId,
    SwapMetadata, SwapPayload, SwapRecord, SwapTxIds, ToBtcData, ToBtcLnData,
};
pub use state::{FromBtcLnState, FromBtcState, SwapDirection, SwapState, ToBtcLnState, ToBtcState};

pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
