use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Stable numeric codes surfaced to clients.
pub mod codes {
    pub const INVALID_REQUEST: u32 = 20001;
    pub const UNSUPPORTED_TOKEN: u32 = 20002;
    pub const AMOUNT_TOO_LOW: u32 = 20003;
    pub const AMOUNT_TOO_HIGH: u32 = 20004;
    pub const GAS_AMOUNT_TOO_HIGH: u32 = 20005;
    pub const INSUFFICIENT_LIQUIDITY: u32 = 20100;
    pub const INVALID_INVOICE: u32 = 20200;
    pub const SWAP_NOT_FOUND: u32 = 20300;
    pub const NOT_REFUNDABLE: u32 = 20301;
    pub const PLUGIN_REJECTED: u32 = 29999;
    pub const INTERNAL: u32 = 50000;
}

pub type SwapResult<T> = std::result::Result<T, SwapError>;

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    /// Malformed or out-of-policy request; never retried.
    #[error("{msg}")]
    ClientInput {
        code: u32,
        msg: String,
        data: Option<Value>,
    },

    /// Quote refused for economic reasons (bounds, liquidity, plugin).
    #[error("{msg}")]
    QuoteRejected {
        code: u32,
        msg: String,
        data: Option<Value>,
    },

    #[error("swap not found: {0}")]
    NotFound(String),

    /// Adapter or storage failure; the reconciliation loop retries these.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("request aborted")]
    Aborted,
}

/// Transport-neutral error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SwapError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::ClientInput {
            code: codes::INVALID_REQUEST,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn unsupported_token(chain_id: &str, token: &str) -> Self {
        Self::ClientInput {
            code: codes::UNSUPPORTED_TOKEN,
            msg: format!("unsupported token {token} on chain {chain_id}"),
            data: None,
        }
    }

    pub fn amount_too_low(min: u128, max: u128) -> Self {
        Self::QuoteRejected {
            code: codes::AMOUNT_TOO_LOW,
            msg: "Amount too low!".to_string(),
            data: Some(bounds_data(min, max)),
        }
    }

    pub fn amount_too_high(min: u128, max: u128) -> Self {
        Self::QuoteRejected {
            code: codes::AMOUNT_TOO_HIGH,
            msg: "Amount too high!".to_string(),
            data: Some(bounds_data(min, max)),
        }
    }

    pub fn gas_too_high(max: u128) -> Self {
        Self::QuoteRejected {
            code: codes::GAS_AMOUNT_TOO_HIGH,
            msg: "Gas token amount too high!".to_string(),
            data: Some(json!({ "max": max.to_string() })),
        }
    }

    pub fn insufficient_liquidity(available: u128, required: u128) -> Self {
        Self::QuoteRejected {
            code: codes::INSUFFICIENT_LIQUIDITY,
            msg: "Not enough liquidity".to_string(),
            data: Some(json!({
                "available": available.to_string(),
                "required": required.to_string(),
            })),
        }
    }

    pub fn invalid_invoice(msg: impl Into<String>) -> Self {
        Self::ClientInput {
            code: codes::INVALID_INVOICE,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn not_refundable(msg: impl Into<String>) -> Self {
        Self::ClientInput {
            code: codes::NOT_REFUNDABLE,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn plugin_rejected(msg: impl Into<String>) -> Self {
        Self::QuoteRejected {
            code: codes::PLUGIN_REJECTED,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::ClientInput { code, .. } | Self::QuoteRejected { code, .. } => *code,
            Self::NotFound(_) => codes::SWAP_NOT_FOUND,
            Self::Aborted => codes::INVALID_REQUEST,
            Self::Transient(_) | Self::InvariantViolation(_) | Self::Config(_) => codes::INTERNAL,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Internal failures are reported without their detail.
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            Self::ClientInput { code, msg, data } | Self::QuoteRejected { code, msg, data } => {
                ErrorResponse {
                    code: *code,
                    msg: msg.clone(),
                    data: data.clone(),
                }
            }
            Self::NotFound(_) | Self::Aborted => ErrorResponse {
                code: self.code(),
                msg: self.to_string(),
                data: None,
            },
            Self::Transient(_) | Self::InvariantViolation(_) | Self::Config(_) => ErrorResponse {
                code: codes::INTERNAL,
                msg: "Internal server error".to_string(),
                data: None,
            },
        }
    }
}

fn bounds_data(min: u128, max: u128) -> Value {
    json!({ "min": min.to_string(), "max": max.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_render_as_decimal_strings() {
        let err = SwapError::amount_too_high(1_000, u128::MAX);
        let resp = err.to_response();
        assert_eq!(resp.code, codes::AMOUNT_TOO_HIGH);
        let data = resp.data.unwrap();
        assert_eq!(data["min"], "1000");
        assert_eq!(data["max"], u128::MAX.to_string());
    }

    #[test]
    fn internal_errors_hide_detail() {
        let err = SwapError::from(anyhow::anyhow!("rpc password rejected"));
        assert!(err.is_transient());
        let resp = err.to_response();
        assert_eq!(resp.code, codes::INTERNAL);
        assert!(!resp.msg.contains("password"));
    }
}
