//! Per-direction swap states. Codes are stable and persisted; negative codes
//! are failure outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDirection {
    ToBtc,
    FromBtc,
    ToBtcLn,
    FromBtcLn,
}

impl SwapDirection {
    pub const ALL: [SwapDirection; 4] = [Self::ToBtc, Self::FromBtc, Self::ToBtcLn, Self::FromBtcLn];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToBtc => "to_btc",
            Self::FromBtc => "from_btc",
            Self::ToBtcLn => "to_btc_ln",
            Self::FromBtcLn => "from_btc_ln",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == s)
    }

    /// Every state code of this direction.
    pub fn state_codes(self) -> Vec<i32> {
        match self {
            Self::ToBtc => ToBtcState::ALL.iter().map(|s| s.code()).collect(),
            Self::FromBtc => FromBtcState::ALL.iter().map(|s| s.code()).collect(),
            Self::ToBtcLn => ToBtcLnState::ALL.iter().map(|s| s.code()).collect(),
            Self::FromBtcLn => FromBtcLnState::ALL.iter().map(|s| s.code()).collect(),
        }
    }

    pub fn state_name(self, code: i32) -> Option<&'static str> {
        match self {
            Self::ToBtc => ToBtcState::from_code(code).map(ToBtcState::name),
            Self::FromBtc => FromBtcState::from_code(code).map(FromBtcState::name),
            Self::ToBtcLn => ToBtcLnState::from_code(code).map(ToBtcLnState::name),
            Self::FromBtcLn => FromBtcLnState::from_code(code).map(FromBtcLnState::name),
        }
    }
}

impl fmt::Display for SwapDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait SwapState: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn code(self) -> i32;
    fn from_code(code: i32) -> Option<Self>;
    fn name(self) -> &'static str;
    /// No further transitions happen from a terminal state.
    fn is_terminal(self) -> bool;
    fn can_transition_to(self, next: Self) -> bool;
}

macro_rules! swap_state {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($variant:ident = $code:literal => $label:literal),+ $(,)?
        }
        terminal: [$($terminal:ident),*]
        transitions: { $($from:ident => [$($to:ident),*]),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "i32", try_from = "i32")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl SwapState for $name {
            fn code(self) -> i32 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            fn is_terminal(self) -> bool {
                matches!(self, $($name::$terminal)|*)
            }

            #[allow(unreachable_patterns)]
            fn can_transition_to(self, next: Self) -> bool {
                match self {
                    $($name::$from => matches!(next, $($name::$to)|*),)*
                    _ => false,
                }
            }
        }

        impl From<$name> for i32 {
            fn from(state: $name) -> i32 {
                state.code()
            }
        }

        impl TryFrom<i32> for $name {
            type Error = String;

            fn try_from(code: i32) -> Result<Self, Self::Error> {
                <$name as SwapState>::from_code(code)
                    .ok_or_else(|| format!("unknown {} code {code}", stringify!($name)))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", self.name(), self.code())
            }
        }
    };
}

swap_state! {
    /// Smart-chain token in, on-chain BTC out.
    ToBtcState {
        Saved = 0 => "SAVED",
        Commited = 1 => "COMMITED",
        BtcSending = 2 => "BTC_SENDING",
        BtcSent = 3 => "BTC_SENT",
        Claimed = 4 => "CLAIMED",
        NonPayable = -1 => "NON_PAYABLE",
        Canceled = -2 => "CANCELED",
        Refunded = -3 => "REFUNDED",
    }
    terminal: [Claimed, Canceled, Refunded]
    transitions: {
        Saved => [Commited, Canceled, Claimed, Refunded],
        Commited => [BtcSending, NonPayable, Claimed, Refunded],
        // BtcSending falls back to Commited when the signed payout never
        // reached the network.
        BtcSending => [BtcSent, Commited, Claimed, Refunded],
        BtcSent => [Claimed, Refunded],
        NonPayable => [Refunded, Claimed],
    }
}

swap_state! {
    /// On-chain BTC in, smart-chain token out.
    FromBtcState {
        Created = 0 => "CREATED",
        Commited = 1 => "COMMITED",
        Claimed = 2 => "CLAIMED",
        Canceled = -1 => "CANCELED",
        Refunded = -2 => "REFUNDED",
    }
    terminal: [Claimed, Canceled, Refunded]
    transitions: {
        Created => [Commited, Canceled, Claimed, Refunded],
        Commited => [Claimed, Refunded],
    }
}

swap_state! {
    /// Smart-chain token in, Lightning payment out.
    ToBtcLnState {
        Saved = 0 => "SAVED",
        Commited = 1 => "COMMITED",
        Paid = 2 => "PAID",
        Claimed = 3 => "CLAIMED",
        NonPayable = -1 => "NON_PAYABLE",
        Canceled = -2 => "CANCELED",
        Refunded = -3 => "REFUNDED",
    }
    terminal: [Claimed, Canceled, Refunded]
    transitions: {
        Saved => [Commited, Canceled, Claimed, Refunded],
        Commited => [Paid, NonPayable, Claimed, Refunded],
        Paid => [Claimed],
        NonPayable => [Refunded, Claimed],
    }
}

swap_state! {
    /// Lightning payment in (held), smart-chain token out.
    FromBtcLnState {
        Created = 0 => "CREATED",
        Received = 1 => "RECEIVED",
        Commited = 2 => "COMMITED",
        Claimed = 3 => "CLAIMED",
        Settled = 4 => "SETTLED",
        Canceled = -1 => "CANCELED",
        Refunded = -2 => "REFUNDED",
    }
    terminal: [Settled, Canceled, Refunded]
    transitions: {
        Created => [Received, Canceled],
        Received => [Commited, Claimed, Canceled, Refunded],
        Commited => [Claimed, Refunded],
        Claimed => [Settled],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_serde() {
        let json = serde_json::to_string(&ToBtcState::BtcSending).unwrap();
        assert_eq!(json, "2");
        let state: ToBtcState = serde_json::from_str("-3").unwrap();
        assert_eq!(state, ToBtcState::Refunded);
        assert!(serde_json::from_str::<ToBtcState>("42").is_err());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for state in ToBtcState::ALL {
            if state.is_terminal() {
                assert!(ToBtcState::ALL.iter().all(|next| !state.can_transition_to(*next)));
            }
        }
        for state in FromBtcLnState::ALL {
            if state.is_terminal() {
                assert!(FromBtcLnState::ALL.iter().all(|next| !state.can_transition_to(*next)));
            }
        }
    }

    #[test]
    fn payout_recovery_edge_exists() {
        assert!(ToBtcState::BtcSending.can_transition_to(ToBtcState::Commited));
        assert!(!ToBtcState::BtcSent.can_transition_to(ToBtcState::Commited));
        assert!(!ToBtcState::Claimed.can_transition_to(ToBtcState::Refunded));
    }

    #[test]
    fn direction_names() {
        for dir in SwapDirection::ALL {
            assert_eq!(SwapDirection::parse(dir.as_str()), Some(dir));
        }
        assert_eq!(SwapDirection::ToBtc.state_name(3), Some("BTC_SENT"));
        assert_eq!(SwapDirection::FromBtcLn.state_codes().len(), 7);
    }
}
