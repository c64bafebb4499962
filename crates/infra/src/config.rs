//! Ledger configuration from the environment.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use stockledger_inventory::CostingPolicy;
use stockledger_observability::LogFormat;

pub const ENV_ALLOW_NEGATIVE_STOCK: &str = "STOCKLEDGER_ALLOW_NEGATIVE_STOCK";
pub const ENV_QTY_EPSILON: &str = "STOCKLEDGER_QTY_EPSILON";
pub const ENV_QTY_SCALE: &str = "STOCKLEDGER_QTY_SCALE";
pub const ENV_COST_SCALE: &str = "STOCKLEDGER_COST_SCALE";
pub const ENV_STOCK_CARD_LIMIT: &str = "STOCKLEDGER_STOCK_CARD_LIMIT";
pub const ENV_STOCK_CARD_MAX_LIMIT: &str = "STOCKLEDGER_STOCK_CARD_MAX_LIMIT";
pub const ENV_LOCK_TIMEOUT_MS: &str = "STOCKLEDGER_LOCK_TIMEOUT_MS";
pub const ENV_TX_RETRY_LIMIT: &str = "STOCKLEDGER_TX_RETRY_LIMIT";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_DB_MAX_CONNECTIONS: &str = "STOCKLEDGER_DB_MAX_CONNECTIONS";
pub const ENV_LOG_FORMAT: &str = "STOCKLEDGER_LOG_FORMAT";

/// Rust's `Decimal` holds at most 28 fractional digits.
const MAX_SCALE: u32 = 28;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub allow_negative_stock: bool,
    pub qty_epsilon: Decimal,
    pub qty_scale: u32,
    pub cost_scale: u32,
    pub stock_card_default_limit: u32,
    pub stock_card_max_limit: u32,
    /// Bound on waiting for a balance lock (in-memory store).
    pub lock_timeout: Option<Duration>,
    /// Extra attempts after a serialization failure.
    pub tx_retry_limit: u32,
    pub database_url: Option<String>,
    /// Pool size of the Postgres stores.
    pub db_max_connections: u32,
    pub log_format: LogFormat,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let policy = CostingPolicy::default();
        Self {
            allow_negative_stock: policy.allow_negative_stock,
            qty_epsilon: policy.qty_epsilon,
            qty_scale: policy.qty_scale,
            cost_scale: policy.cost_scale,
            stock_card_default_limit: 200,
            stock_card_max_limit: 1000,
            lock_timeout: None,
            tx_retry_limit: 3,
            database_url: None,
            db_max_connections: 10,
            log_format: LogFormat::Json,
        }
    }
}

impl LedgerConfig {
    /// Read the process environment; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |var: &'static str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (var, v))
        };

        if let Some((var, v)) = get(ENV_ALLOW_NEGATIVE_STOCK) {
            cfg.allow_negative_stock = parse_bool(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_QTY_EPSILON) {
            cfg.qty_epsilon = parse(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_QTY_SCALE) {
            cfg.qty_scale = parse(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_COST_SCALE) {
            cfg.cost_scale = parse(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_STOCK_CARD_LIMIT) {
            cfg.stock_card_default_limit = parse(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_STOCK_CARD_MAX_LIMIT) {
            cfg.stock_card_max_limit = parse(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_LOCK_TIMEOUT_MS) {
            cfg.lock_timeout = Some(Duration::from_millis(parse(var, &v)?));
        }
        if let Some((var, v)) = get(ENV_TX_RETRY_LIMIT) {
            cfg.tx_retry_limit = parse(var, &v)?;
        }
        if let Some((_, v)) = get(ENV_DATABASE_URL) {
            cfg.database_url = Some(v);
        }
        if let Some((var, v)) = get(ENV_DB_MAX_CONNECTIONS) {
            cfg.db_max_connections = parse(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_LOG_FORMAT) {
            cfg.log_format = parse(var, &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qty_epsilon < Decimal::ZERO {
            return Err(ConfigError::Inconsistent("qty_epsilon must not be negative".into()));
        }
        if self.qty_scale > MAX_SCALE || self.cost_scale > MAX_SCALE {
            return Err(ConfigError::Inconsistent(format!(
                "scales must be at most {MAX_SCALE}"
            )));
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::Inconsistent("db max connections must be positive".into()));
        }
        if self.stock_card_default_limit == 0 {
            return Err(ConfigError::Inconsistent("stock card limit must be positive".into()));
        }
        if self.stock_card_default_limit > self.stock_card_max_limit {
            return Err(ConfigError::Inconsistent(format!(
                "stock card limit {} exceeds max limit {}",
                self.stock_card_default_limit, self.stock_card_max_limit
            )));
        }
        Ok(())
    }

    /// `database_url`, or [`ConfigError::Missing`].
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_DATABASE_URL))
    }

    pub fn costing_policy(&self) -> CostingPolicy {
        CostingPolicy {
            allow_negative_stock: self.allow_negative_stock,
            qty_epsilon: self.qty_epsilon,
            qty_scale: self.qty_scale,
            cost_scale: self.cost_scale,
        }
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| map.get(var).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = LedgerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, LedgerConfig::default());
        assert_eq!(cfg.costing_policy(), CostingPolicy::default());
        assert_eq!(cfg.stock_card_default_limit, 200);
        assert_eq!(cfg.tx_retry_limit, 3);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = LedgerConfig::from_lookup(lookup(&[
            (ENV_ALLOW_NEGATIVE_STOCK, "true"),
            (ENV_QTY_EPSILON, "0.001"),
            (ENV_COST_SCALE, "4"),
            (ENV_LOCK_TIMEOUT_MS, "250"),
            (ENV_LOG_FORMAT, "pretty"),
            (ENV_DATABASE_URL, "postgres://localhost/ledger"),
            (ENV_DB_MAX_CONNECTIONS, "4"),
        ]))
        .unwrap();

        assert!(cfg.allow_negative_stock);
        assert_eq!(cfg.qty_epsilon, Decimal::new(1, 3));
        assert_eq!(cfg.cost_scale, 4);
        assert_eq!(cfg.lock_timeout, Some(Duration::from_millis(250)));
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert_eq!(cfg.require_database_url(), Ok("postgres://localhost/ledger"));
        assert_eq!(cfg.db_max_connections, 4);
    }

    #[test]
    fn database_url_is_required_only_when_asked_for() {
        let cfg = LedgerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.require_database_url(), Err(ConfigError::Missing(ENV_DATABASE_URL)));
    }

    #[test]
    fn unparseable_value_names_the_variable() {
        let err = LedgerConfig::from_lookup(lookup(&[(ENV_QTY_SCALE, "four")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: ENV_QTY_SCALE,
                value: "four".to_string()
            }
        );

        let err = LedgerConfig::from_lookup(lookup(&[(ENV_ALLOW_NEGATIVE_STOCK, "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, .. } if var == ENV_ALLOW_NEGATIVE_STOCK));
    }

    #[test]
    fn default_limit_above_max_is_rejected() {
        let err = LedgerConfig::from_lookup(lookup(&[
            (ENV_STOCK_CARD_LIMIT, "500"),
            (ENV_STOCK_CARD_MAX_LIMIT, "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }
}
