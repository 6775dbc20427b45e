//! Runtime configuration.
//!
//! Fee and penalty policy, matching limits and payment polling are all
//! plain values with defaults, optionally overridden from a TOML file:
//!
//! ```toml
//! [policy]
//! platform_fee = 15
//! penalty = 190
//! lead_time_minutes = 45
//!
//! [matching]
//! top_n = 5
//!
//! [payments]
//! poll_interval_ms = 3000
//! ```

use std::path::Path;
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;

use crate::Amount;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Money policy applied by the wallet engine and deal lifecycle.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Policy {
    /// Flat fee charged to the client when funds are frozen for a deal.
    pub platform_fee: Amount,
    /// Fixed compensation paid to the contractor on a late cancellation.
    pub penalty: Amount,
    /// Cancelling closer than this to the scheduled start incurs the penalty.
    pub lead_time_minutes: i64,
    /// Number of completed deals a contractor gets without payout commission.
    pub free_completed_deals: u32,
    /// Commission withheld from payouts once the free deals are used up.
    pub payout_commission: Amount,
    /// Amount charged through the payment gateway to confirm a selection.
    pub confirmation_fee: Amount,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            platform_fee: Amount::from_units(15),
            penalty: Amount::from_units(190),
            lead_time_minutes: 45,
            free_completed_deals: 3,
            payout_commission: Amount::from_units(15),
            confirmation_fee: Amount::from_units(15),
        }
    }
}

/// Longest lead time or offer lifetime a config may ask for.
fn max_window() -> TimeDelta {
    TimeDelta::days(365)
}

fn window(delta: Option<TimeDelta>) -> TimeDelta {
    delta
        .unwrap_or(TimeDelta::MAX)
        .clamp(TimeDelta::zero(), max_window())
}

fn check_window(name: &str, delta: Option<TimeDelta>) -> Result<(), ConfigError> {
    match delta {
        Some(delta) if delta <= max_window() => Ok(()),
        _ => Err(ConfigError::Invalid(format!(
            "{name} must not exceed {} days",
            max_window().num_days()
        ))),
    }
}

impl Policy {
    pub fn lead_time(&self) -> TimeDelta {
        window(TimeDelta::try_minutes(self.lead_time_minutes))
    }

    /// Commission for a payout, given how many deals the contractor had
    /// already completed before this one.
    pub fn payout_commission_for(&self, completed_before: u32) -> Amount {
        if completed_before < self.free_completed_deals {
            Amount::ZERO
        } else {
            self.payout_commission
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let non_negative = [
            ("platform_fee", self.platform_fee),
            ("penalty", self.penalty),
            ("payout_commission", self.payout_commission),
            ("confirmation_fee", self.confirmation_fee),
        ];
        for (name, value) in non_negative {
            if value.is_negative() {
                return Err(ConfigError::Invalid(format!("policy.{name} must not be negative")));
            }
        }
        if self.lead_time_minutes < 0 {
            return Err(ConfigError::Invalid(
                "policy.lead_time_minutes must not be negative".to_string(),
            ));
        }
        check_window(
            "policy.lead_time_minutes",
            TimeDelta::try_minutes(self.lead_time_minutes),
        )
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchingConfig {
    /// Candidates offered per matching round.
    pub top_n: usize,
    /// Cap on simultaneously active offers for a single order.
    pub max_active_offers_per_order: usize,
    pub offer_ttl_secs: i64,
    /// Search radius passed to the candidate provider.
    pub radius_km: f64,
    /// Characters of the order description copied onto each offer.
    pub snapshot_description_len: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            top_n: 5,
            max_active_offers_per_order: 5,
            offer_ttl_secs: 10 * 60,
            radius_km: 50.0,
            snapshot_description_len: 200,
        }
    }
}

impl MatchingConfig {
    pub fn offer_ttl(&self) -> TimeDelta {
        window(TimeDelta::try_seconds(self.offer_ttl_secs))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.top_n == 0 {
            return Err(ConfigError::Invalid(
                "matching.top_n must be at least 1".to_string(),
            ));
        }
        if self.max_active_offers_per_order == 0 {
            return Err(ConfigError::Invalid(
                "matching.max_active_offers_per_order must be at least 1".to_string(),
            ));
        }
        if self.offer_ttl_secs <= 0 {
            return Err(ConfigError::Invalid(
                "matching.offer_ttl_secs must be positive".to_string(),
            ));
        }
        check_window(
            "matching.offer_ttl_secs",
            TimeDelta::try_seconds(self.offer_ttl_secs),
        )
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PaymentConfig {
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    /// Where the gateway sends the payer after confirmation.
    pub return_url: String,
    pub api_url: String,
    pub currency: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            max_poll_attempts: 20,
            return_url: "easyjob://payment-success".to_string(),
            api_url: "https://api.yookassa.ru/v3".to_string(),
            currency: "RUB".to_string(),
        }
    }
}

impl PaymentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub policy: Policy,
    pub matching: MatchingConfig,
    pub payments: PaymentConfig,
    /// Optimistic transaction attempts before giving up on contention.
    pub store_attempts: Option<u32>,
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.policy.validate()?;
        config.matching.validate()?;
        if config.payments.max_poll_attempts == 0 {
            return Err(ConfigError::Invalid(
                "payments.max_poll_attempts must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_platform_policy() {
        let policy = Policy::default();
        assert_eq!(policy.platform_fee, Amount::from_units(15));
        assert_eq!(policy.penalty, Amount::from_units(190));
        assert_eq!(policy.lead_time(), TimeDelta::minutes(45));
        assert_eq!(policy.free_completed_deals, 3);
    }

    #[test]
    fn commission_tier_starts_at_fourth_deal() {
        let policy = Policy::default();
        assert_eq!(policy.payout_commission_for(0), Amount::ZERO);
        assert_eq!(policy.payout_commission_for(2), Amount::ZERO);
        assert_eq!(policy.payout_commission_for(3), Amount::from_units(15));
        assert_eq!(policy.payout_commission_for(40), Amount::from_units(15));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml("[policy]\npenalty = 250\n").unwrap();
        assert_eq!(config.policy.penalty, Amount::from_units(250));
        assert_eq!(config.policy.platform_fee, Amount::from_units(15));
        assert_eq!(config.matching, MatchingConfig::default());
        assert_eq!(config.payments.max_poll_attempts, 20);
    }

    #[test]
    fn negative_fee_is_rejected() {
        let err = AppConfig::from_toml("[policy]\nplatform_fee = -1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_poll_attempts_is_rejected() {
        let err = AppConfig::from_toml("[payments]\nmax_poll_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn out_of_range_windows_are_rejected() {
        for toml in [
            "[matching]\noffer_ttl_secs = -600\n",
            "[matching]\noffer_ttl_secs = 0\n",
            "[matching]\noffer_ttl_secs = 9223372036854775807\n",
            "[policy]\nlead_time_minutes = 9223372036854775807\n",
            "[policy]\nlead_time_minutes = 600000\n",
            "[matching]\ntop_n = 0\n",
            "[matching]\nmax_active_offers_per_order = 0\n",
        ] {
            let err = AppConfig::from_toml(toml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{toml}");
        }
    }

    #[test]
    fn windows_never_panic_when_built_in_code() {
        let policy = Policy {
            lead_time_minutes: i64::MAX,
            ..Policy::default()
        };
        assert_eq!(policy.lead_time(), TimeDelta::days(365));

        let matching = MatchingConfig {
            offer_ttl_secs: -10,
            ..MatchingConfig::default()
        };
        assert_eq!(matching.offer_ttl(), TimeDelta::zero());
    }

    #[test]
    fn load_reads_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[matching]\ntop_n = 3\noffer_ttl_secs = 60\n").unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.matching.top_n, 3);
        assert_eq!(config.matching.offer_ttl(), TimeDelta::seconds(60));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = AppConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
