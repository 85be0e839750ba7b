//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Runtime configuration.
//!
//! [`IslandConfig`] is built once at startup and shared by `Arc` with every
//! component. It can be assembled by hand from [`Default`] and the `with_*`
//! methods, or read from the environment with [`IslandConfig::from_env`].
//!
//! # Environment
//!
//! | key | default |
//! |---|---|
//! | `ISLAND_SERVICE_NAME` (legacy `SERVICE_NAME`) | `no-service-name` |
//! | `ISLAND_HOST_NAME` (legacy `HOSTNAME`) | `no-host-name` |
//! | `ISLAND_RABBITMQ_HOST` (legacy `RABBITMQ_HOST`) | `amqp://rabbitmq:5672` |
//! | `ISLAND_RABBITMQ_POOLSIZE` | `100` |
//! | `ISLAND_EVENT_PREFETCH` | `100` |
//! | `ISLAND_RPC_PREFETCH` | `100` |
//! | `ISLAND_RPC_EXEC_TIMEOUT` | `25s` |
//! | `ISLAND_RPC_WAIT_TIMEOUT` | `60s` |
//! | `ISLAND_RPC_REPLY_MARGIN_TIME` | `1s` |
//! | `ISLAND_SERVICE_LOAD_TIME` | `60s` |
//! | `ISLAND_RPC_RES_NOACK` | `false` |
//! | `ISLAND_RPC_DISTRIB_SIZE` | `16` |
//! | `ISLAND_FLOWMODE_DELAY` | `10s` |
//! | `ISLAND_STATUS_EXPORT` | `false` |
//! | `ISLAND_STATUS_EXPORT_TIME` | `10s` |
//! | `ISLAND_STATUS_EXPORT_TYPE` | `FILE` |
//! | `ISLAND_STATUS_FILE_NAME` | `island.status.json` |
//! | `ISLAND_USE_CIRCUIT_BREAK` | `false` |
//! | `ISLAND_CIRCUIT_BREAK_TIME` | `1m` |
//! | `ISLAND_CIRCUIT_BREAK_FAILRATE_THRESHOLD` | `0.2` |
//! | `ISLAND_CIRCUIT_BREAK_REQUEST_THRESHOLD` | `10` |
//! | `ISLAND_PROC_DIR` | `.` |
//! | `ISLAND_CODE` | `100` |
//!
//! Durations accept `500ms`, `25s`, `1m`, `1h`, `1d` or a bare number of
//! milliseconds.

use crate::error::IslandCode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while reading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value could not be parsed.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// The configuration key
        key: String,
        /// The raw value
        value: String,
        /// What was expected
        reason: &'static str,
    },

    /// The assembled configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How periodic status snapshots are exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusExportType {
    /// Write the snapshot to a file.
    #[default]
    File,
    /// Publish the snapshot as an `island.status.export` event.
    Event,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakConfig {
    /// Whether circuit-break decisions are computed at all.
    ///
    /// Default: false
    pub enabled: bool,

    /// Length of the sliding failure-rate window.
    ///
    /// Default: 1 minute
    pub window: Duration,

    /// Error rate at or above which the circuit breaks.
    ///
    /// Default: 0.2
    pub fail_rate_threshold: f64,

    /// Minimum number of requests in the window before the rate is trusted.
    ///
    /// Default: 10
    pub request_threshold: u64,
}

impl Default for CircuitBreakConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: Duration::from_secs(60),
            fail_rate_threshold: 0.2,
            request_threshold: 10,
        }
    }
}

/// Configuration shared by every runtime component.
///
/// # Examples
///
/// ```rust
/// use island::config::IslandConfig;
/// use std::time::Duration;
///
/// let config = IslandConfig::new("accounts")
///     .with_rpc_wait_timeout(Duration::from_secs(5))
///     .with_rpc_distrib_size(4);
///
/// assert_eq!(config.service_name, "accounts");
/// assert_eq!(config.rpc_exec_timeout, Duration::from_secs(25));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct IslandConfig {
    /// Name of the service; prefixes every queue the service owns.
    ///
    /// Default: `no-service-name`
    pub service_name: String,

    /// Name of this host; part of the reply queue and consumer tags.
    ///
    /// Default: `no-host-name`
    pub host_name: String,

    /// Service namespace code merged into error codes.
    ///
    /// Default: 100
    pub island_code: IslandCode,

    /// Broker url.
    ///
    /// Default: `amqp://rabbitmq:5672`
    pub broker_url: String,

    /// Number of reusable channels kept by the channel pool.
    ///
    /// Default: 100
    pub pool_size: usize,

    /// Prefetch count of event consumer channels.
    ///
    /// Default: 100
    pub event_prefetch: u16,

    /// Prefetch count of RPC consumer channels.
    ///
    /// Default: 100
    pub rpc_prefetch: u16,

    /// Longest a handler may run before its request fails.
    ///
    /// Default: 25 seconds
    pub rpc_exec_timeout: Duration,

    /// Longest a caller waits for a response.
    ///
    /// Default: 60 seconds
    pub rpc_wait_timeout: Duration,

    /// Budget reserved at every hop for delivering the reply.
    ///
    /// Default: 1 second
    pub rpc_reply_margin: Duration,

    /// Expected time for a service to come up; extends the reply queue lifetime.
    ///
    /// Default: 60 seconds
    pub service_load_time: Duration,

    /// Consume responses without acknowledgement.
    ///
    /// Default: false
    pub rpc_res_noack: bool,

    /// Number of request queue shards.
    ///
    /// Default: 16
    pub rpc_distrib_size: usize,

    /// How long a shard that signalled flow mode is avoided.
    ///
    /// Default: 10 seconds
    pub flow_mode_delay: Duration,

    /// Whether status snapshots are exported periodically.
    ///
    /// Default: false
    pub status_export: bool,

    /// Interval between status exports; also the width of one circuit window bucket.
    ///
    /// Default: 10 seconds
    pub status_export_interval: Duration,

    /// Where status snapshots go.
    ///
    /// Default: [`StatusExportType::File`]
    pub status_export_type: StatusExportType,

    /// File written by the file exporter.
    ///
    /// Default: `island.status.json`
    pub status_file_name: PathBuf,

    /// Circuit breaker settings.
    pub circuit_break: CircuitBreakConfig,

    /// Directory of the `rpc.proc` and `event.proc` status files.
    ///
    /// Default: `.`
    pub proc_dir: PathBuf,
}

impl Default for IslandConfig {
    fn default() -> Self {
        Self {
            service_name: "no-service-name".to_string(),
            host_name: "no-host-name".to_string(),
            island_code: IslandCode::UNKNOWN,
            broker_url: "amqp://rabbitmq:5672".to_string(),
            pool_size: 100,
            event_prefetch: 100,
            rpc_prefetch: 100,
            rpc_exec_timeout: Duration::from_secs(25),
            rpc_wait_timeout: Duration::from_secs(60),
            rpc_reply_margin: Duration::from_secs(1),
            service_load_time: Duration::from_secs(60),
            rpc_res_noack: false,
            rpc_distrib_size: 16,
            flow_mode_delay: Duration::from_secs(10),
            status_export: false,
            status_export_interval: Duration::from_secs(10),
            status_export_type: StatusExportType::File,
            status_file_name: PathBuf::from("island.status.json"),
            circuit_break: CircuitBreakConfig::default(),
            proc_dir: PathBuf::from("."),
        }
    }
}

impl IslandConfig {
    /// Creates a default configuration for a named service.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable holds an unparseable value or the
    /// result fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through a lookup function.
    ///
    /// Unset and empty keys keep their defaults.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use island::config::IslandConfig;
    /// use std::collections::HashMap;
    /// use std::time::Duration;
    ///
    /// let env: HashMap<&str, &str> = [
    ///     ("SERVICE_NAME", "legacy"),
    ///     ("ISLAND_RPC_EXEC_TIMEOUT", "1500ms"),
    /// ]
    /// .into_iter()
    /// .collect();
    ///
    /// let config = IslandConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
    /// assert_eq!(config.service_name, "legacy");
    /// assert_eq!(config.rpc_exec_timeout, Duration::from_millis(1500));
    /// ```
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);
        let defaults = Self::default();

        let island_code = match env.get("ISLAND_CODE") {
            Some(raw) => raw
                .parse::<u16>()
                .ok()
                .and_then(IslandCode::new)
                .ok_or_else(|| invalid("ISLAND_CODE", &raw, "an integer in 100..1000"))?,
            None => defaults.island_code,
        };
        let status_export_type = match env.get("ISLAND_STATUS_EXPORT_TYPE") {
            Some(raw) => match raw.to_ascii_uppercase().as_str() {
                "FILE" => StatusExportType::File,
                "EVENT" => StatusExportType::Event,
                _ => return Err(invalid("ISLAND_STATUS_EXPORT_TYPE", &raw, "FILE or EVENT")),
            },
            None => defaults.status_export_type,
        };

        let config = Self {
            service_name: env
                .get_or_legacy("ISLAND_SERVICE_NAME", "SERVICE_NAME")
                .unwrap_or(defaults.service_name),
            host_name: env
                .get_or_legacy("ISLAND_HOST_NAME", "HOSTNAME")
                .unwrap_or(defaults.host_name),
            island_code,
            broker_url: env
                .get_or_legacy("ISLAND_RABBITMQ_HOST", "RABBITMQ_HOST")
                .unwrap_or(defaults.broker_url),
            pool_size: env.number("ISLAND_RABBITMQ_POOLSIZE")?.unwrap_or(defaults.pool_size),
            event_prefetch: env.number("ISLAND_EVENT_PREFETCH")?.unwrap_or(defaults.event_prefetch),
            rpc_prefetch: env.number("ISLAND_RPC_PREFETCH")?.unwrap_or(defaults.rpc_prefetch),
            rpc_exec_timeout: env
                .duration("ISLAND_RPC_EXEC_TIMEOUT")?
                .unwrap_or(defaults.rpc_exec_timeout),
            rpc_wait_timeout: env
                .duration("ISLAND_RPC_WAIT_TIMEOUT")?
                .unwrap_or(defaults.rpc_wait_timeout),
            rpc_reply_margin: env
                .duration("ISLAND_RPC_REPLY_MARGIN_TIME")?
                .unwrap_or(defaults.rpc_reply_margin),
            service_load_time: env
                .duration("ISLAND_SERVICE_LOAD_TIME")?
                .unwrap_or(defaults.service_load_time),
            rpc_res_noack: env.flag("ISLAND_RPC_RES_NOACK")?.unwrap_or(defaults.rpc_res_noack),
            rpc_distrib_size: env
                .number("ISLAND_RPC_DISTRIB_SIZE")?
                .unwrap_or(defaults.rpc_distrib_size),
            flow_mode_delay: env
                .duration("ISLAND_FLOWMODE_DELAY")?
                .unwrap_or(defaults.flow_mode_delay),
            status_export: env.flag("ISLAND_STATUS_EXPORT")?.unwrap_or(defaults.status_export),
            status_export_interval: env
                .duration("ISLAND_STATUS_EXPORT_TIME")?
                .unwrap_or(defaults.status_export_interval),
            status_export_type,
            status_file_name: env
                .get("ISLAND_STATUS_FILE_NAME")
                .map(PathBuf::from)
                .unwrap_or(defaults.status_file_name),
            circuit_break: CircuitBreakConfig {
                enabled: env
                    .flag("ISLAND_USE_CIRCUIT_BREAK")?
                    .unwrap_or(defaults.circuit_break.enabled),
                window: env
                    .duration("ISLAND_CIRCUIT_BREAK_TIME")?
                    .unwrap_or(defaults.circuit_break.window),
                fail_rate_threshold: env
                    .number("ISLAND_CIRCUIT_BREAK_FAILRATE_THRESHOLD")?
                    .unwrap_or(defaults.circuit_break.fail_rate_threshold),
                request_threshold: env
                    .number("ISLAND_CIRCUIT_BREAK_REQUEST_THRESHOLD")?
                    .unwrap_or(defaults.circuit_break.request_threshold),
            },
            proc_dir: env
                .get("ISLAND_PROC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.proc_dir),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::Invalid("service name must not be empty".into()));
        }
        if self.rpc_distrib_size == 0 {
            return Err(ConfigError::Invalid("rpc distrib size must be at least 1".into()));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool size must be at least 1".into()));
        }
        if self.status_export_interval.is_zero() {
            return Err(ConfigError::Invalid("status export interval must not be zero".into()));
        }
        if !(0.0..=1.0).contains(&self.circuit_break.fail_rate_threshold) {
            return Err(ConfigError::Invalid(
                "circuit break fail rate threshold must be within 0..=1".into(),
            ));
        }
        Ok(())
    }

    /// Sets the host name.
    #[must_use]
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// Sets the island code.
    #[must_use]
    pub fn with_island_code(mut self, island_code: IslandCode) -> Self {
        self.island_code = island_code;
        self
    }

    /// Sets the broker url.
    #[must_use]
    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    /// Sets the channel pool size.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the handler execution timeout.
    #[must_use]
    pub fn with_rpc_exec_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_exec_timeout = timeout;
        self
    }

    /// Sets the caller wait timeout.
    #[must_use]
    pub fn with_rpc_wait_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_wait_timeout = timeout;
        self
    }

    /// Sets the per-hop reply margin.
    #[must_use]
    pub fn with_rpc_reply_margin(mut self, margin: Duration) -> Self {
        self.rpc_reply_margin = margin;
        self
    }

    /// Sets the number of request queue shards.
    #[must_use]
    pub fn with_rpc_distrib_size(mut self, size: usize) -> Self {
        self.rpc_distrib_size = size;
        self
    }

    /// Sets how long a slow shard is avoided.
    #[must_use]
    pub fn with_flow_mode_delay(mut self, delay: Duration) -> Self {
        self.flow_mode_delay = delay;
        self
    }

    /// Sets the status export interval.
    #[must_use]
    pub fn with_status_export_interval(mut self, interval: Duration) -> Self {
        self.status_export_interval = interval;
        self
    }

    /// Sets the circuit breaker settings.
    #[must_use]
    pub fn with_circuit_break(mut self, circuit_break: CircuitBreakConfig) -> Self {
        self.circuit_break = circuit_break;
        self
    }

    /// Sets the proc file directory.
    #[must_use]
    pub fn with_proc_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.proc_dir = dir.into();
        self
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn get_or_legacy(&self, key: &str, legacy: &str) -> Option<String> {
        self.get(key).or_else(|| self.get(legacy))
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|raw| raw.parse::<T>().map_err(|_| invalid(key, &raw, "a number")))
            .transpose()
    }

    fn duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        self.get(key)
            .map(|raw| parse_duration(&raw).ok_or_else(|| invalid(key, &raw, "a duration")))
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.get(key)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(invalid(key, &raw, "a boolean")),
            })
            .transpose()
    }
}

fn invalid(key: &str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    }
}

/// Parses a human duration such as `500ms`, `25s`, `1.5m` or `1h`.
///
/// A bare number is read as milliseconds.
///
/// # Examples
///
/// ```rust
/// use island::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("250"), Some(Duration::from_millis(250)));
/// assert_eq!(parse_duration("25s"), Some(Duration::from_secs(25)));
/// assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
/// assert_eq!(parse_duration("soon"), None);
/// ```
#[must_use]
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    let millis = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "ms" | "msec" | "msecs" => value,
        "s" | "sec" | "secs" | "second" | "seconds" => value * 1_000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => value * 60_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => value * 3_600_000.0,
        "d" | "day" | "days" => value * 86_400_000.0,
        _ => return None,
    };
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }
    Some(Duration::from_millis(millis.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> Result<IslandConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IslandConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = lookup(&[]).unwrap();
        assert_eq!(config, IslandConfig::default());
        assert_eq!(config.rpc_distrib_size, 16);
        assert_eq!(config.flow_mode_delay, Duration::from_secs(10));
        assert_eq!(config.circuit_break.request_threshold, 10);
    }

    #[test]
    fn test_prefers_new_keys_over_legacy() {
        let config = lookup(&[
            ("SERVICE_NAME", "legacy"),
            ("ISLAND_SERVICE_NAME", "modern"),
            ("HOSTNAME", "box-1"),
            ("RABBITMQ_HOST", "amqp://mq:5672"),
        ])
        .unwrap();
        assert_eq!(config.service_name, "modern");
        assert_eq!(config.host_name, "box-1");
        assert_eq!(config.broker_url, "amqp://mq:5672");
    }

    #[test]
    fn test_reads_typed_values() {
        let config = lookup(&[
            ("ISLAND_RPC_WAIT_TIMEOUT", "3s"),
            ("ISLAND_RPC_REPLY_MARGIN_TIME", "100"),
            ("ISLAND_RPC_RES_NOACK", "true"),
            ("ISLAND_STATUS_EXPORT_TYPE", "event"),
            ("ISLAND_CIRCUIT_BREAK_FAILRATE_THRESHOLD", "0.5"),
            ("ISLAND_CODE", "123"),
        ])
        .unwrap();
        assert_eq!(config.rpc_wait_timeout, Duration::from_secs(3));
        assert_eq!(config.rpc_reply_margin, Duration::from_millis(100));
        assert!(config.rpc_res_noack);
        assert_eq!(config.status_export_type, StatusExportType::Event);
        assert_eq!(config.circuit_break.fail_rate_threshold, 0.5);
        assert_eq!(config.island_code.get(), 123);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            lookup(&[("ISLAND_RPC_PREFETCH", "lots")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            lookup(&[("ISLAND_CODE", "42")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            lookup(&[("ISLAND_RPC_DISTRIB_SIZE", "0")]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("2 d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("5w"), None);
    }
}
