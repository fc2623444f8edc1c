//! Integer money helpers. Every amount is a `u128` in base units (sats or the
//! token's smallest unit) and crosses serialization boundaries as a decimal
//! string.

pub const PPM: u128 = 1_000_000;
pub const SECONDS_PER_YEAR: u128 = 31_536_000;

/// Proportional fee plus base: `base + amount * ppm / 10^6`, rounded down.
pub fn fee(amount: u128, base: u128, ppm: u128) -> u128 {
    base.saturating_add(amount.saturating_mul(ppm) / PPM)
}

/// Smallest input such that `input - fee(input) >= net`.
///
/// Solves `input = (net + base) / (1 - ppm/10^6)`, rounding up.
pub fn gross_up(net: u128, base: u128, ppm: u128) -> Option<u128> {
    let denom = PPM.checked_sub(ppm).filter(|d| *d > 0)?;
    net.checked_add(base)?.checked_mul(PPM)?.checked_add(denom - 1).map(|n| n / denom)
}

/// Largest output such that `output + fee(output) <= gross`.
///
/// Inverts an additive fee: `(gross - base) * 10^6 / (10^6 + ppm)`.
pub fn net_down(gross: u128, base: u128, ppm: u128) -> u128 {
    gross.saturating_sub(base).saturating_mul(PPM) / (PPM + ppm)
}

/// Scales `amount` by `factor_ppm`, rounding down.
pub fn apply_ppm(amount: u128, factor_ppm: u128) -> u128 {
    amount.saturating_mul(factor_ppm) / PPM
}

/// Converts an APY given in percent into PPM. This is the only place a float
/// touches money-adjacent configuration.
pub fn apy_percent_to_ppm(percent: f64) -> u128 {
    if !percent.is_finite() || percent <= 0.0 {
        return 0;
    }
    (percent * 10_000.0).round() as u128
}

/// Deposit the LP demands for locking its own liquidity: a multiple of the
/// refund fee plus time-value of the locked amount.
pub fn security_deposit(
    refund_fee: u128,
    base_multiplier_ppm: u128,
    locked_amount: u128,
    apy_ppm: u128,
    lock_secs: u64,
) -> u128 {
    let base = apply_ppm(refund_fee, base_multiplier_ppm);
    let time_value = locked_amount
        .saturating_mul(apy_ppm)
        .saturating_mul(u128::from(lock_secs))
        / (PPM * SECONDS_PER_YEAR);
    base.saturating_add(time_value)
}

/// Serde adapter rendering integers (`u128`, `u64`) as decimal strings.
pub mod decimal {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{Deserialize as _, Deserializer, Serializer, de};

    pub fn serialize<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<T>()
            .map_err(|e| de::Error::custom(format!("invalid decimal {raw:?}: {e}")))
    }
}

/// Like [`decimal`] for optional values.
pub mod decimal_opt {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{Deserialize as _, Deserializer, Serializer, de};

    pub fn serialize<T: Display, S: Serializer>(
        value: &Option<T>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|raw| {
            raw.parse::<T>()
                .map_err(|e| de::Error::custom(format!("invalid decimal {raw:?}: {e}")))
        })
        .transpose()
    }
}
