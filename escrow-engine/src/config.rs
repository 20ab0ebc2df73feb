//! Engine configuration
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `ESCROW__SECTION__KEY` environment variables.

use crate::{error::EscrowError, EscrowResult};
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Longest dispute window a transaction may use
pub const MAX_DISPUTE_WINDOW_HOURS: u32 = 24 * 30;

/// Longest reaper timeout accepted, one week
pub const MAX_REAPER_TIMEOUT_MINUTES: i64 = 7 * 24 * 60;

/// Platform settings the core reads but never computes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    /// Fee charged on settlement, in percent of the transaction amount
    pub fee_percent: Decimal,
    /// Dispute window applied to new transactions unless overridden
    pub default_dispute_window_hours: u32,
    /// Smallest accepted transaction amount, in minor units
    pub min_transaction_amount: i64,
    /// Smallest accepted payout, in minor units
    pub min_withdrawal_amount: i64,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            fee_percent: Decimal::new(5, 0),
            default_dispute_window_hours: 24,
            min_transaction_amount: 10_000,
            min_withdrawal_amount: 10_000,
        }
    }
}

/// Which pending deposits the deposit sweep removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositSweepPolicy {
    /// Only deposits the user never marked as paid
    UnsubmittedOnly,
    /// Every stale pending deposit, submitted or not
    AllPending,
}

/// Configuration for the stale-resource reaper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub pending_timeout_minutes: i64,
    pub deposit_timeout_minutes: i64,
    pub interval_secs: u64,
    pub deposit_policy: DepositSweepPolicy,
    /// Complete shipped transactions whose dispute window elapsed
    pub auto_complete_shipping: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            pending_timeout_minutes: 30,
            deposit_timeout_minutes: 15,
            interval_secs: 60,
            deposit_policy: DepositSweepPolicy::UnsubmittedOnly,
            auto_complete_shipping: true,
        }
    }
}

/// Audit trail behaviour for privileged actions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Record actions of the highest privilege tier as well
    pub log_super_admin_actions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub channel_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpGateConfig {
    /// Remote ban lookup endpoint; the in-memory list is used when unset
    pub lookup_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for IpGateConfig {
    fn default() -> Self {
        Self {
            lookup_url: None,
            timeout_ms: 1500,
        }
    }
}

/// Complete engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowSettings {
    pub platform: PlatformSettings,
    pub reaper: ReaperConfig,
    pub audit: AuditConfig,
    pub realtime: RealtimeConfig,
    pub ip_gate: IpGateConfig,
}

impl EscrowSettings {
    /// Load settings from an optional file and the environment
    pub fn load(path: Option<&str>) -> EscrowResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings: Self = builder
            .add_source(Environment::with_prefix("ESCROW").separator("__"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> EscrowResult<()> {
        let fee = self.platform.fee_percent;
        if fee < Decimal::ZERO || fee >= Decimal::ONE_HUNDRED {
            return Err(EscrowError::config(format!(
                "fee_percent must be within [0, 100), got {}",
                fee
            )));
        }
        if self.platform.min_transaction_amount <= 0 {
            return Err(EscrowError::config("min_transaction_amount must be positive"));
        }
        if self.platform.min_withdrawal_amount <= 0 {
            return Err(EscrowError::config("min_withdrawal_amount must be positive"));
        }
        let window = self.platform.default_dispute_window_hours;
        if window == 0 || window > MAX_DISPUTE_WINDOW_HOURS {
            return Err(EscrowError::config(format!(
                "default_dispute_window_hours must be within 1..={}, got {}",
                MAX_DISPUTE_WINDOW_HOURS, window
            )));
        }
        for (name, minutes) in [
            ("pending_timeout_minutes", self.reaper.pending_timeout_minutes),
            ("deposit_timeout_minutes", self.reaper.deposit_timeout_minutes),
        ] {
            if !(1..=MAX_REAPER_TIMEOUT_MINUTES).contains(&minutes) {
                return Err(EscrowError::config(format!(
                    "{} must be within 1..={}, got {}",
                    name, MAX_REAPER_TIMEOUT_MINUTES, minutes
                )));
            }
        }
        if self.reaper.interval_secs == 0 {
            return Err(EscrowError::config("interval_secs must be positive"));
        }
        if self.realtime.channel_capacity == 0 {
            return Err(EscrowError::config("channel_capacity must be positive"));
        }
        Ok(())
    }
}
