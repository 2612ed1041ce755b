//! Configuration for micropay-gateway.

use crate::voucher::Atoms;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which collateral figure the voucher collateral check compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollateralCheck {
    /// Effective on-chain collateral.
    #[default]
    Full,
    /// Collateral divided by subscription exposure (the credit cap).
    RiskAdjusted,
}

/// Policy once every voucher in the client's chain is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// No credit beyond the voucher chain.
    #[default]
    Reject,
    /// Allow `grace_atoms` of dust beyond the chain, charged to the next voucher.
    Grace,
}

/// Credit computation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditConfig {
    /// Margin added to the subscription count when dividing collateral.
    /// Absorbs subscriptions the oracle has not seen yet.
    #[serde(default = "default_expand_risk_factor")]
    pub expand_risk_factor: u64,

    /// Collateral figure used by the voucher collateral check.
    #[serde(default)]
    pub collateral_check: CollateralCheck,

    /// Behavior once the voucher chain is exhausted.
    #[serde(default)]
    pub exhaustion_policy: ExhaustionPolicy,

    /// Atoms of dust allowed beyond the chain under the `grace` policy.
    #[serde(default)]
    pub grace_atoms: Atoms,
}

impl CreditConfig {
    /// Atoms of credit beyond the voucher chain.
    #[must_use]
    pub fn grace(&self) -> Atoms {
        match self.exhaustion_policy {
            ExhaustionPolicy::Reject => 0,
            ExhaustionPolicy::Grace => self.grace_atoms,
        }
    }
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            expand_risk_factor: default_expand_risk_factor(),
            collateral_check: CollateralCheck::default(),
            exhaustion_policy: ExhaustionPolicy::default(),
            grace_atoms: 0,
        }
    }
}

/// Chain oracle cache and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Maximum age of a served snapshot in milliseconds (0 disables caching).
    #[serde(default = "default_oracle_ttl_ms")]
    pub ttl_ms: u64,

    /// Retries after a failed read before reporting `OracleUnavailable`.
    #[serde(default = "default_oracle_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay between retries in milliseconds, grows linearly.
    #[serde(default = "default_oracle_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Number of (client, vendor) snapshots to cache.
    #[serde(default = "default_oracle_cache_capacity")]
    pub cache_capacity: usize,
}

impl OracleConfig {
    /// Snapshot TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Base retry delay.
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_oracle_ttl_ms(),
            retry_attempts: default_oracle_retry_attempts(),
            retry_backoff_ms: default_oracle_retry_backoff_ms(),
            cache_capacity: default_oracle_cache_capacity(),
        }
    }
}

/// Rounding applied when converting usage to atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    /// Round fractional atoms up.
    #[default]
    Up,
    /// Truncate fractional atoms.
    Down,
}

/// Usage prices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Atoms charged per hour of work.
    #[serde(default)]
    pub hour_price: Atoms,

    /// Atoms charged per gigabyte (10^9 bytes) returned.
    #[serde(default)]
    pub gigabyte_price: Atoms,

    /// Rounding of fractional atoms.
    #[serde(default)]
    pub rounding: Rounding,
}

/// Session and query lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Prior nonce assumed for a client with no accepted voucher.
    #[serde(default)]
    pub genesis_nonce: u64,

    /// Seconds a query may stay locked before it is force-aborted.
    #[serde(default = "default_query_deadline")]
    pub query_deadline_secs: u64,

    /// Seconds without activity before an idle session is closed.
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    /// Seconds a settled or aborted query is kept for idempotent retries.
    #[serde(default = "default_query_retention")]
    pub query_retention_secs: u64,

    /// Seconds between reaper passes.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl EngineConfig {
    /// Locked query deadline.
    #[must_use]
    pub fn query_deadline(&self) -> Duration {
        Duration::from_secs(self.query_deadline_secs)
    }

    /// Session idle timeout.
    #[must_use]
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    /// Finalized query retention.
    #[must_use]
    pub fn query_retention(&self) -> Duration {
        Duration::from_secs(self.query_retention_secs)
    }

    /// Reaper interval.
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            genesis_nonce: 0,
            query_deadline_secs: default_query_deadline(),
            session_idle_timeout_secs: default_session_idle_timeout(),
            query_retention_secs: default_query_retention(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

/// Metrics settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// File to persist counters to. Counters are in-memory only if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_path: Option<PathBuf>,
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Log level for `micropay-voucher --config` when the command line sets none.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Credit computation.
    #[serde(default)]
    pub credit: CreditConfig,

    /// Chain oracle cache.
    #[serde(default)]
    pub oracle: OracleConfig,

    /// Usage prices.
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Session and query lifecycle.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Metrics.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            credit: CreditConfig::default(),
            oracle: OracleConfig::default(),
            pricing: PricingConfig::default(),
            engine: EngineConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Check settings that would make the gateway unusable.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first bad setting.
    pub fn validate(&self) -> crate::Result<()> {
        if self.engine.query_deadline_secs == 0 {
            return Err(crate::Error::Config(
                "engine.query_deadline_secs must be greater than 0".to_string(),
            ));
        }
        if self.engine.reap_interval_secs == 0 {
            return Err(crate::Error::Config(
                "engine.reap_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.oracle.cache_capacity == 0 {
            return Err(crate::Error::Config(
                "oracle.cache_capacity must be greater than 0".to_string(),
            ));
        }
        if self.credit.exhaustion_policy == ExhaustionPolicy::Reject && self.credit.grace_atoms > 0
        {
            return Err(crate::Error::Config(
                "credit.grace_atoms is only meaningful with exhaustion_policy = \"grace\""
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }
}

const fn default_expand_risk_factor() -> u64 {
    5
}

const fn default_oracle_ttl_ms() -> u64 {
    5_000
}

const fn default_oracle_retry_attempts() -> u32 {
    2
}

const fn default_oracle_retry_backoff_ms() -> u64 {
    100
}

const fn default_oracle_cache_capacity() -> usize {
    10_000
}

const fn default_query_deadline() -> u64 {
    300
}

const fn default_session_idle_timeout() -> u64 {
    900
}

const fn default_query_retention() -> u64 {
    3_600
}

const fn default_reap_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}
