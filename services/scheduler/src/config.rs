//! Configuration for the scheduler binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use drover_retry::RetryPolicy;

use crate::controller::ControllerConfig;
use crate::ha::HaConfig;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name registered with the master.
    pub framework_name: String,

    /// Address the leader liveness listener binds to.
    pub ha_listen_addr: SocketAddr,

    /// Address recorded as leader and dialed by standbys.
    pub ha_advertise_addr: String,

    /// SQLite database path. In-memory storage when unset.
    pub store_path: Option<PathBuf>,

    /// Framework failover timeout in seconds.
    pub failover_timeout_secs: u64,

    /// Reconciliation interval in seconds.
    pub reconcile_interval_secs: u64,

    /// Delay before re-subscribing, in seconds.
    pub resubscribe_delay_secs: u64,

    /// Refuse duration attached to declined offers.
    pub decline_refuse_secs: f64,

    /// Retries per storage operation.
    pub store_max_retries: u32,

    /// Reschedules per failed task.
    pub task_max_retries: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ControllerConfig::default();
        let ha_defaults = HaConfig::default();

        let framework_name =
            var("DROVER_FRAMEWORK_NAME").unwrap_or_else(|| defaults.framework_name.clone());

        let ha_listen_addr = match var("DROVER_HA_LISTEN_ADDR") {
            Some(addr) => addr
                .parse()
                .with_context(|| format!("invalid DROVER_HA_LISTEN_ADDR: {addr}"))?,
            None => ha_defaults.listen_addr,
        };

        // Standbys dial this, so it defaults to the listen port on loopback
        let ha_advertise_addr = var("DROVER_HA_ADVERTISE_ADDR")
            .unwrap_or_else(|| format!("127.0.0.1:{}", ha_listen_addr.port()));

        let store_path = var("DROVER_STORE_PATH")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let failover_timeout_secs = parse_or(
            &var,
            "DROVER_FAILOVER_TIMEOUT",
            defaults.failover_timeout.as_secs(),
        );
        let reconcile_interval_secs = parse_or(
            &var,
            "DROVER_RECONCILE_INTERVAL",
            defaults.reconcile_interval.as_secs(),
        );
        let resubscribe_delay_secs = parse_or(
            &var,
            "DROVER_RESUBSCRIBE_DELAY",
            defaults.resubscribe_delay.as_secs(),
        );
        let decline_refuse_secs = parse_or(
            &var,
            "DROVER_DECLINE_REFUSE_SECS",
            defaults.decline_refuse_seconds,
        );
        let store_max_retries = parse_or(&var, "DROVER_STORE_MAX_RETRIES", 5);
        let task_max_retries = parse_or(&var, "DROVER_TASK_MAX_RETRIES", 3);

        let log_level = var("DROVER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            framework_name,
            ha_listen_addr,
            ha_advertise_addr,
            store_path,
            failover_timeout_secs,
            reconcile_interval_secs,
            resubscribe_delay_secs,
            decline_refuse_secs,
            store_max_retries,
            task_max_retries,
            log_level,
        })
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            framework_name: self.framework_name.clone(),
            failover_timeout: Duration::from_secs(self.failover_timeout_secs),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            resubscribe_delay: Duration::from_secs(self.resubscribe_delay_secs),
            decline_refuse_seconds: self.decline_refuse_secs,
        }
    }

    pub fn ha_config(&self) -> HaConfig {
        HaConfig {
            listen_addr: self.ha_listen_addr,
            advertise_addr: self.ha_advertise_addr.clone(),
            ..HaConfig::default()
        }
    }

    /// Template policy copied for every storage operation.
    pub fn store_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.store_max_retries, Duration::from_millis(100), true)
    }

    /// Template policy copied for every task that fails.
    pub fn task_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.task_max_retries, Duration::from_secs(1), true)
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> T {
    var(name).and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.framework_name, "drover");
        assert_eq!(config.ha_listen_addr.port(), 7070);
        assert_eq!(config.ha_advertise_addr, "127.0.0.1:7070");
        assert!(config.store_path.is_none());
        assert_eq!(config.log_level, "info");

        let controller = config.controller_config();
        assert_eq!(controller.failover_timeout, Duration::from_secs(604_800));
        assert_eq!(controller.reconcile_interval, Duration::from_secs(300));
        assert_eq!(controller.decline_refuse_seconds, 5.0);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DROVER_FRAMEWORK_NAME", "batch"),
            ("DROVER_HA_LISTEN_ADDR", "0.0.0.0:9000"),
            ("DROVER_STORE_PATH", "/var/lib/drover/state.db"),
            ("DROVER_RECONCILE_INTERVAL", "60"),
            ("DROVER_DECLINE_REFUSE_SECS", "2.5"),
            ("DROVER_TASK_MAX_RETRIES", "7"),
        ])
        .unwrap();

        assert_eq!(config.framework_name, "batch");
        assert_eq!(config.ha_advertise_addr, "127.0.0.1:9000");
        assert_eq!(
            config.store_path,
            Some(PathBuf::from("/var/lib/drover/state.db"))
        );
        assert_eq!(config.ha_config().listen_addr.port(), 9000);
        assert_eq!(
            config.controller_config().reconcile_interval,
            Duration::from_secs(60)
        );
        assert_eq!(config.decline_refuse_secs, 2.5);
        assert_eq!(config.task_retry_policy().max_retries, 7);
    }

    #[test]
    fn test_unparseable_numbers_fall_back() {
        let config = load(&[("DROVER_STORE_MAX_RETRIES", "lots")]).unwrap();
        assert_eq!(config.store_max_retries, 5);
    }

    #[test]
    fn test_invalid_listen_addr_is_an_error() {
        assert!(load(&[("DROVER_HA_LISTEN_ADDR", "not-an-addr")]).is_err());
    }
}
