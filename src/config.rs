//! LP configuration loaded from TOML. Amounts are in base units (sats for the
//! BTC side) and fit `u64`; the engine widens them to `u128`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::amount::{self, PPM};
use crate::error::SwapError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LpConfig {
    /// Chain used when a request does not name one.
    #[serde(default = "default_chain_id")]
    pub default_chain: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default = "default_chains")]
    pub chains: BTreeMap<String, ChainConfig>,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub to_btc: ToBtcConfig,

    #[serde(default)]
    pub from_btc: FromBtcConfig,

    #[serde(default)]
    pub to_btc_ln: ToBtcLnConfig,

    #[serde(default)]
    pub from_btc_ln: FromBtcLnConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Token addresses the LP quotes on this chain.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Validity of init/refund authorizations handed to clients.
    #[serde(default = "default_authorization_timeout_secs")]
    pub authorization_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval_secs")]
    pub interval_secs: u64,

    /// Poll interval of the payout/payment watchers.
    #[serde(default = "default_tx_check_interval_secs")]
    pub tx_check_interval_secs: u64,

    /// Lease held on a record while a side effect is in flight.
    #[serde(default = "default_lock_secs")]
    pub lock_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapLimits {
    #[serde(default = "default_min")]
    pub min: u64,
    #[serde(default = "default_max")]
    pub max: u64,
    #[serde(default = "default_base_fee")]
    pub base_fee: u64,
    #[serde(default = "default_fee_ppm")]
    pub fee_ppm: u64,
    /// Relative slack around `[min, max]` inside which a request is still
    /// priced before it is rejected.
    #[serde(default = "default_tolerance_ppm")]
    pub tolerance_ppm: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToBtcConfig {
    /// Virtual size assumed for a payout transaction when quoting.
    #[serde(default = "default_payout_vsize")]
    pub payout_vsize: u64,
    /// Markup applied to the estimated fee rate when quoting.
    #[serde(default = "default_network_fee_multiplier_ppm")]
    pub network_fee_multiplier_ppm: u64,
    #[serde(default = "default_one")]
    pub min_confirmations: u32,
    #[serde(default = "default_max_confirmations")]
    pub max_confirmations: u32,
    #[serde(default = "default_one")]
    pub min_confirmation_target: u32,
    #[serde(default = "default_max_confirmation_target")]
    pub max_confirmation_target: u32,
    #[serde(default = "default_to_btc_escrow_secs")]
    pub escrow_expiry_secs: u64,
    /// Payouts are refused when the escrow expires sooner than this.
    #[serde(default = "default_min_escrow_time_left_secs")]
    pub min_escrow_time_left_secs: u64,
    #[serde(default)]
    pub limits: SwapLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FromBtcConfig {
    #[serde(default = "default_deposit_apy_percent")]
    pub security_deposit_apy_percent: f64,
    #[serde(default = "default_deposit_base_multiplier_ppm")]
    pub security_deposit_base_multiplier_ppm: u64,
    /// Upper bound for the native-token gas drop; zero disables it.
    #[serde(default)]
    pub gas_max: u64,
    #[serde(default = "default_from_btc_confirmations")]
    pub confirmations: u32,
    #[serde(default = "default_from_btc_escrow_secs")]
    pub escrow_expiry_secs: u64,
    #[serde(default)]
    pub limits: SwapLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToBtcLnConfig {
    #[serde(default = "default_routing_fee_base")]
    pub routing_fee_base: u64,
    #[serde(default = "default_routing_fee_ppm")]
    pub routing_fee_ppm: u64,
    /// Invoices expiring sooner than this are rejected at quote time.
    #[serde(default = "default_min_invoice_expiry_secs")]
    pub min_invoice_expiry_secs: u64,
    #[serde(default = "default_payment_timeout_secs")]
    pub payment_timeout_secs: u64,
    #[serde(default = "default_to_btc_ln_escrow_secs")]
    pub escrow_expiry_secs: u64,
    #[serde(default)]
    pub limits: SwapLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FromBtcLnConfig {
    #[serde(default = "default_invoice_expiry_secs")]
    pub invoice_expiry_secs: u64,
    /// Gap kept between the escrow expiry and the held HTLC's expiry.
    #[serde(default = "default_escrow_safety_margin_secs")]
    pub escrow_safety_margin_secs: u64,
    #[serde(default = "default_deposit_apy_percent")]
    pub security_deposit_apy_percent: f64,
    #[serde(default = "default_deposit_base_multiplier_ppm")]
    pub security_deposit_base_multiplier_ppm: u64,
    #[serde(default)]
    pub limits: SwapLimits,
}

fn default_chain_id() -> String {
    "main".into()
}
fn default_chains() -> BTreeMap<String, ChainConfig> {
    BTreeMap::from([(
        default_chain_id(),
        ChainConfig {
            tokens: Vec::new(),
            authorization_timeout_secs: default_authorization_timeout_secs(),
        },
    )])
}
fn default_log_level() -> String {
    "info".into()
}
fn default_storage_path() -> PathBuf {
    PathBuf::from("./data/swaps.sqlite")
}
fn default_authorization_timeout_secs() -> u64 {
    180
}
fn default_watchdog_interval_secs() -> u64 {
    30
}
fn default_tx_check_interval_secs() -> u64 {
    10
}
fn default_lock_secs() -> u64 {
    30
}
fn default_min() -> u64 {
    1_000
}
fn default_max() -> u64 {
    10_000_000
}
fn default_base_fee() -> u64 {
    100
}
fn default_fee_ppm() -> u64 {
    3_000
}
fn default_tolerance_ppm() -> u64 {
    50_000
}
fn default_payout_vsize() -> u64 {
    200
}
fn default_network_fee_multiplier_ppm() -> u64 {
    1_250_000
}
fn default_one() -> u32 {
    1
}
fn default_max_confirmations() -> u32 {
    6
}
fn default_max_confirmation_target() -> u32 {
    6
}
fn default_to_btc_escrow_secs() -> u64 {
    3 * 24 * 3600
}
fn default_min_escrow_time_left_secs() -> u64 {
    3600
}
fn default_deposit_apy_percent() -> f64 {
    20.0
}
fn default_deposit_base_multiplier_ppm() -> u64 {
    2_000_000
}
fn default_from_btc_confirmations() -> u32 {
    2
}
fn default_from_btc_escrow_secs() -> u64 {
    24 * 3600
}
fn default_routing_fee_base() -> u64 {
    10
}
fn default_routing_fee_ppm() -> u64 {
    2_000
}
fn default_min_invoice_expiry_secs() -> u64 {
    600
}
fn default_payment_timeout_secs() -> u64 {
    60
}
fn default_to_btc_ln_escrow_secs() -> u64 {
    24 * 3600
}
fn default_invoice_expiry_secs() -> u64 {
    3600
}
fn default_escrow_safety_margin_secs() -> u64 {
    3600
}

impl Default for LpConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            default_chain: default_chain_id(),
            chains: default_chains(),
            watchdog: WatchdogConfig::default(),
            to_btc: ToBtcConfig::default(),
            from_btc: FromBtcConfig::default(),
            to_btc_ln: ToBtcLnConfig::default(),
            from_btc_ln: FromBtcLnConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval_secs(),
            tx_check_interval_secs: default_tx_check_interval_secs(),
            lock_secs: default_lock_secs(),
        }
    }
}

impl Default for SwapLimits {
    fn default() -> Self {
        Self {
            min: default_min(),
            max: default_max(),
            base_fee: default_base_fee(),
            fee_ppm: default_fee_ppm(),
            tolerance_ppm: default_tolerance_ppm(),
        }
    }
}

impl Default for ToBtcConfig {
    fn default() -> Self {
        Self {
            limits: SwapLimits::default(),
            payout_vsize: default_payout_vsize(),
            network_fee_multiplier_ppm: default_network_fee_multiplier_ppm(),
            min_confirmations: default_one(),
            max_confirmations: default_max_confirmations(),
            min_confirmation_target: default_one(),
            max_confirmation_target: default_max_confirmation_target(),
            escrow_expiry_secs: default_to_btc_escrow_secs(),
            min_escrow_time_left_secs: default_min_escrow_time_left_secs(),
        }
    }
}

impl Default for FromBtcConfig {
    fn default() -> Self {
        Self {
            limits: SwapLimits::default(),
            security_deposit_apy_percent: default_deposit_apy_percent(),
            security_deposit_base_multiplier_ppm: default_deposit_base_multiplier_ppm(),
            gas_max: 0,
            confirmations: default_from_btc_confirmations(),
            escrow_expiry_secs: default_from_btc_escrow_secs(),
        }
    }
}

impl Default for ToBtcLnConfig {
    fn default() -> Self {
        Self {
            limits: SwapLimits::default(),
            routing_fee_base: default_routing_fee_base(),
            routing_fee_ppm: default_routing_fee_ppm(),
            min_invoice_expiry_secs: default_min_invoice_expiry_secs(),
            payment_timeout_secs: default_payment_timeout_secs(),
            escrow_expiry_secs: default_to_btc_ln_escrow_secs(),
        }
    }
}

impl Default for FromBtcLnConfig {
    fn default() -> Self {
        Self {
            limits: SwapLimits::default(),
            invoice_expiry_secs: default_invoice_expiry_secs(),
            escrow_safety_margin_secs: default_escrow_safety_margin_secs(),
            security_deposit_apy_percent: default_deposit_apy_percent(),
            security_deposit_base_multiplier_ppm: default_deposit_base_multiplier_ppm(),
        }
    }
}

impl SwapLimits {
    pub fn validate(&self, section: &str) -> Result<(), SwapError> {
        if self.min > self.max {
            return Err(SwapError::Config(format!(
                "{section}: min {} exceeds max {}",
                self.min, self.max
            )));
        }
        if u128::from(self.fee_ppm) >= PPM || u128::from(self.tolerance_ppm) >= PPM {
            return Err(SwapError::Config(format!(
                "{section}: fee_ppm and tolerance_ppm must be below {PPM}"
            )));
        }
        Ok(())
    }
}

impl FromBtcConfig {
    pub fn security_deposit_apy_ppm(&self) -> u128 {
        amount::apy_percent_to_ppm(self.security_deposit_apy_percent)
    }
}

impl FromBtcLnConfig {
    pub fn security_deposit_apy_ppm(&self) -> u128 {
        amount::apy_percent_to_ppm(self.security_deposit_apy_percent)
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn tx_check_interval(&self) -> Duration {
        Duration::from_secs(self.tx_check_interval_secs.max(1))
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_secs.max(1))
    }
}

impl LpConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            let config: LpConfig = toml::from_str(&contents)
                .with_context(|| format!("parse config {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self).context("serialize config")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
        std::fs::write(path, contents).with_context(|| format!("write config {}", path.display()))
    }

    /// Startup validation; any failure here must abort the service.
    pub fn validate(&self) -> Result<(), SwapError> {
        if !self.chains.contains_key(&self.default_chain) {
            return Err(SwapError::Config(format!(
                "default chain {} is not configured",
                self.default_chain
            )));
        }
        self.to_btc.limits.validate("to_btc")?;
        self.from_btc.limits.validate("from_btc")?;
        self.to_btc_ln.limits.validate("to_btc_ln")?;
        self.from_btc_ln.limits.validate("from_btc_ln")?;
        if self.to_btc.min_confirmations == 0
            || self.to_btc.min_confirmations > self.to_btc.max_confirmations
        {
            return Err(SwapError::Config(
                "to_btc: invalid confirmation range".to_string(),
            ));
        }
        if self.to_btc.min_confirmation_target > self.to_btc.max_confirmation_target {
            return Err(SwapError::Config(
                "to_btc: invalid confirmation target range".to_string(),
            ));
        }
        Ok(())
    }

    pub fn chain(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.chains.get(chain_id)
    }
}
