//! Controller configuration.
//!
//! Read once at startup from environment variables. Every variable has a
//! default; malformed values are rejected instead of silently defaulted.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// What to do with a node whose drain outlives `DRAIN_TIMEOUT_SECS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTimeoutPolicy {
    /// Power the machine off anyway
    ForcePowerOff,
    /// Stay in `draining`, record the problem and keep warning
    HoldAndAlert,
}

impl FromStr for DrainTimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "force-power-off" => Ok(Self::ForcePowerOff),
            "hold-and-alert" => Ok(Self::HoldAndAlert),
            other => Err(format!("expected force-power-off or hold-and-alert, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace holding the BMC credential Secrets
    pub credentials_namespace: String,
    pub node_workers: usize,
    pub pool_workers: usize,
    /// Global cap on simultaneous BMC calls
    pub max_concurrent_driver_calls: usize,
    pub reconcile_timeout: Duration,
    pub boot_timeout: Duration,
    pub drain_timeout: Duration,
    pub drain_timeout_policy: DrainTimeoutPolicy,
    pub bmc_grace_period: Duration,
    /// Consecutive transient failures tolerated before a node goes to `error`
    pub driver_retry_budget: u32,
    pub auto_recover: bool,
    pub error_cooldown: Duration,
    pub resync_interval: Duration,
    pub transition_poll: Duration,
    pub autoscaler_interval: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub redfish_insecure_tls: bool,
    pub probe_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials_namespace: "bamel-system".to_string(),
            node_workers: 8,
            pool_workers: 2,
            max_concurrent_driver_calls: 16,
            reconcile_timeout: Duration::from_secs(120),
            boot_timeout: Duration::from_secs(900),
            drain_timeout: Duration::from_secs(600),
            drain_timeout_policy: DrainTimeoutPolicy::ForcePowerOff,
            bmc_grace_period: Duration::from_secs(300),
            driver_retry_budget: 5,
            auto_recover: false,
            error_cooldown: Duration::from_secs(1800),
            resync_interval: Duration::from_secs(300),
            transition_poll: Duration::from_secs(15),
            autoscaler_interval: Duration::from_secs(30),
            backoff_min: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            redfish_insecure_tls: false,
            probe_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let config = Config {
            credentials_namespace: lookup("CREDENTIALS_NAMESPACE")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.credentials_namespace),
            node_workers: parse(&lookup, "NODE_WORKERS", defaults.node_workers)?,
            pool_workers: parse(&lookup, "POOL_WORKERS", defaults.pool_workers)?,
            max_concurrent_driver_calls: parse(&lookup, "MAX_CONCURRENT_DRIVER_CALLS", defaults.max_concurrent_driver_calls)?,
            reconcile_timeout: seconds(&lookup, "RECONCILE_TIMEOUT_SECS", defaults.reconcile_timeout)?,
            boot_timeout: seconds(&lookup, "BOOT_TIMEOUT_SECS", defaults.boot_timeout)?,
            drain_timeout: seconds(&lookup, "DRAIN_TIMEOUT_SECS", defaults.drain_timeout)?,
            drain_timeout_policy: parse(&lookup, "DRAIN_TIMEOUT_POLICY", defaults.drain_timeout_policy)?,
            bmc_grace_period: seconds(&lookup, "BMC_GRACE_PERIOD_SECS", defaults.bmc_grace_period)?,
            driver_retry_budget: parse(&lookup, "DRIVER_RETRY_BUDGET", defaults.driver_retry_budget)?,
            auto_recover: parse(&lookup, "AUTO_RECOVER", defaults.auto_recover)?,
            error_cooldown: seconds(&lookup, "ERROR_COOLDOWN_SECS", defaults.error_cooldown)?,
            resync_interval: seconds(&lookup, "RESYNC_INTERVAL_SECS", defaults.resync_interval)?,
            transition_poll: seconds(&lookup, "TRANSITION_POLL_SECS", defaults.transition_poll)?,
            autoscaler_interval: seconds(&lookup, "AUTOSCALER_INTERVAL_SECS", defaults.autoscaler_interval)?,
            backoff_min: seconds(&lookup, "BACKOFF_MIN_SECS", defaults.backoff_min)?,
            backoff_max: seconds(&lookup, "BACKOFF_MAX_SECS", defaults.backoff_max)?,
            redfish_insecure_tls: parse(&lookup, "REDFISH_INSECURE_TLS", defaults.redfish_insecure_tls)?,
            probe_addr: parse(&lookup, "PROBE_ADDR", defaults.probe_addr)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ControllerError> {
        let positive = [
            ("NODE_WORKERS", self.node_workers),
            ("POOL_WORKERS", self.pool_workers),
            ("MAX_CONCURRENT_DRIVER_CALLS", self.max_concurrent_driver_calls),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ControllerError::InvalidConfig(format!("{key} must be at least 1")));
            }
        }
        if self.driver_retry_budget == 0 {
            return Err(ControllerError::InvalidConfig("DRIVER_RETRY_BUDGET must be at least 1".to_string()));
        }
        let intervals = [
            ("RECONCILE_TIMEOUT_SECS", self.reconcile_timeout),
            ("RESYNC_INTERVAL_SECS", self.resync_interval),
            ("TRANSITION_POLL_SECS", self.transition_poll),
            ("AUTOSCALER_INTERVAL_SECS", self.autoscaler_interval),
            ("BACKOFF_MIN_SECS", self.backoff_min),
        ];
        for (key, value) in intervals {
            if value.is_zero() {
                return Err(ControllerError::InvalidConfig(format!("{key} must be greater than 0")));
            }
        }
        if self.backoff_min > self.backoff_max {
            return Err(ControllerError::InvalidConfig(
                "BACKOFF_MIN_SECS must not exceed BACKOFF_MAX_SECS".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw}: {e}"))),
    }
}

fn seconds<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, key, default.as_secs()).map(Duration::from_secs)
}
