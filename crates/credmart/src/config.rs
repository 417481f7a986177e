//! Process configuration read from `CREDMART_*` environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::UserId;
use crate::session::{DEFAULT_SYSTEM_SENDER, DEFAULT_TEARDOWN_AFTER, RegistryConfig};
use crate::settlement::DEFAULT_DISCOUNT_AMOUNT;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid value {value:?} for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: IpAddr,
    pub port: u16,
    pub gateway_url: String,
    pub notify_url: Option<String>,
    pub notify_token: Option<String>,
    pub admin_ids: Vec<UserId>,
    pub discount_amount: i64,
    pub teardown_after: Duration,
    pub system_sender: i64,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
    pub await_explicit_shutdown: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5080,
            gateway_url: "http://127.0.0.1:5090".to_string(),
            notify_url: None,
            notify_token: None,
            admin_ids: Vec::new(),
            discount_amount: DEFAULT_DISCOUNT_AMOUNT,
            teardown_after: DEFAULT_TEARDOWN_AFTER,
            system_sender: DEFAULT_SYSTEM_SENDER,
            snapshot_path: None,
            snapshot_interval: Duration::from_secs(30),
            await_explicit_shutdown: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let discount_amount = parse_or("CREDMART_DISCOUNT_AMOUNT", get, defaults.discount_amount)?;
        if discount_amount < 0 {
            return Err(invalid(
                "CREDMART_DISCOUNT_AMOUNT",
                discount_amount.to_string(),
                "must be non-negative",
            ));
        }

        let snapshot_secs: u64 = parse_or(
            "CREDMART_SNAPSHOT_INTERVAL_SECS",
            get,
            defaults.snapshot_interval.as_secs(),
        )?;
        if snapshot_secs == 0 {
            return Err(invalid(
                "CREDMART_SNAPSHOT_INTERVAL_SECS",
                "0".to_string(),
                "must be at least 1",
            ));
        }

        Ok(Self {
            host: parse_or("CREDMART_HOST", get, defaults.host)?,
            port: parse_or("CREDMART_PORT", get, defaults.port)?,
            gateway_url: get("CREDMART_GATEWAY_URL").unwrap_or(defaults.gateway_url),
            notify_url: get("CREDMART_NOTIFY_URL"),
            notify_token: get("CREDMART_NOTIFY_TOKEN"),
            admin_ids: parse_admin_ids(get("CREDMART_ADMIN_IDS"))?,
            discount_amount,
            teardown_after: Duration::from_secs(parse_or(
                "CREDMART_TEARDOWN_SECS",
                get,
                defaults.teardown_after.as_secs(),
            )?),
            system_sender: parse_or("CREDMART_SYSTEM_SENDER", get, defaults.system_sender)?,
            snapshot_path: get("CREDMART_SNAPSHOT_PATH").map(PathBuf::from),
            snapshot_interval: Duration::from_secs(snapshot_secs),
            await_explicit_shutdown: parse_bool("CREDMART_AWAIT_EXPLICIT_SHUTDOWN", get)?,
        })
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            teardown_after: self.teardown_after,
            system_sender: self.system_sender,
            admin_ids: self.admin_ids.clone(),
        }
    }
}

fn invalid(var: &'static str, value: String, reason: &str) -> ConfigError {
    ConfigError {
        var,
        value,
        reason: reason.to_string(),
    }
}

fn parse_or<T, G>(var: &'static str, get: G, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| invalid(var, raw.clone(), &e.to_string())),
        None => Ok(default),
    }
}

fn parse_bool<G>(var: &'static str, get: G) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var).map(|v| v.to_ascii_lowercase()).as_deref() {
        None | Some("0" | "false" | "no") => Ok(false),
        Some("1" | "true" | "yes") => Ok(true),
        Some(other) => Err(invalid(var, other.to_string(), "expected true or false")),
    }
}

fn parse_admin_ids(raw: Option<String>) -> Result<Vec<UserId>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse()
                .map_err(|_| invalid("CREDMART_ADMIN_IDS", raw.clone(), "expected comma-separated ids"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.port, 5080);
        assert_eq!(config.discount_amount, 5);
        assert_eq!(config.teardown_after, Duration::from_secs(600));
        assert_eq!(config.system_sender, 777000);
        assert!(!config.await_explicit_shutdown);
    }

    #[test]
    fn reads_every_variable() {
        let config = load(&[
            ("CREDMART_HOST", "127.0.0.1"),
            ("CREDMART_PORT", "8080"),
            ("CREDMART_GATEWAY_URL", "http://gateway:9000"),
            ("CREDMART_NOTIFY_URL", "http://bot/notify"),
            ("CREDMART_NOTIFY_TOKEN", "secret"),
            ("CREDMART_ADMIN_IDS", "1, 2,,3"),
            ("CREDMART_DISCOUNT_AMOUNT", "7"),
            ("CREDMART_TEARDOWN_SECS", "60"),
            ("CREDMART_SYSTEM_SENDER", "42"),
            ("CREDMART_SNAPSHOT_PATH", "/var/lib/credmart/state.json"),
            ("CREDMART_SNAPSHOT_INTERVAL_SECS", "5"),
            ("CREDMART_AWAIT_EXPLICIT_SHUTDOWN", "TRUE"),
        ])
        .unwrap();

        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.port, 8080);
        assert_eq!(config.gateway_url, "http://gateway:9000");
        assert_eq!(config.notify_url.as_deref(), Some("http://bot/notify"));
        assert_eq!(config.notify_token.as_deref(), Some("secret"));
        assert_eq!(config.admin_ids, vec![1, 2, 3]);
        assert_eq!(config.discount_amount, 7);
        assert_eq!(config.snapshot_path, Some(PathBuf::from("/var/lib/credmart/state.json")));
        assert_eq!(config.snapshot_interval, Duration::from_secs(5));
        assert!(config.await_explicit_shutdown);

        let registry = config.registry();
        assert_eq!(registry.teardown_after, Duration::from_secs(60));
        assert_eq!(registry.system_sender, 42);
        assert_eq!(registry.admin_ids, vec![1, 2, 3]);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("CREDMART_PORT", "  "), ("CREDMART_NOTIFY_URL", "")]).unwrap();
        assert_eq!(config.port, 5080);
        assert_eq!(config.notify_url, None);
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = load(&[("CREDMART_PORT", "eighty")]).unwrap_err();
        assert_eq!(err.var, "CREDMART_PORT");
        assert_eq!(err.value, "eighty");

        assert_eq!(
            load(&[("CREDMART_TEARDOWN_SECS", "-1")]).unwrap_err().var,
            "CREDMART_TEARDOWN_SECS"
        );
        assert_eq!(
            load(&[("CREDMART_ADMIN_IDS", "1,abc")]).unwrap_err().var,
            "CREDMART_ADMIN_IDS"
        );
        assert_eq!(
            load(&[("CREDMART_DISCOUNT_AMOUNT", "-3")]).unwrap_err().var,
            "CREDMART_DISCOUNT_AMOUNT"
        );
        assert_eq!(
            load(&[("CREDMART_SNAPSHOT_INTERVAL_SECS", "0")]).unwrap_err().var,
            "CREDMART_SNAPSHOT_INTERVAL_SECS"
        );
        assert_eq!(
            load(&[("CREDMART_AWAIT_EXPLICIT_SHUTDOWN", "maybe")]).unwrap_err().var,
            "CREDMART_AWAIT_EXPLICIT_SHUTDOWN"
        );
    }
}
