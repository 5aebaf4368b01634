//! Hub configuration
//!
//! [`RelayHubConfig`] is what the host layer hands to [`RelayHub::new`]
//! (usually deserialized from its own config store). Every field has a
//! default, durations are stored in milliseconds, and ranges are checked
//! once by [`RelayHubConfig::validate`] when the hub is built.
//!
//! [`RelayHub::new`]: crate::hub::RelayHub::new

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::constants::MAX_RELAYS;
use crate::coordinator::PollingConfig;
use crate::error::{RelayError, RelayResult};
use crate::retry::RetryConfig;

pub const DEFAULT_NUM_RELAYS: u16 = 8;
pub const DEFAULT_DEVICE_ADDRESS: u8 = 1;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound for the per-call timeout
pub const MAX_TIMEOUT_MS: u64 = 60_000;

/// Upper bound for `max_retries`
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// How the host presents a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayRole {
    Light,
    Switch,
}

/// One relay exposed to the host layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEntity {
    /// 1-based relay address
    pub address: u16,
    pub name: String,
    pub role: RelayRole,
}

impl RelayEntity {
    pub fn new(address: u16, name: impl Into<String>, role: RelayRole) -> Self {
        Self {
            address,
            name: name.into(),
            role,
        }
    }

    /// Stable identifier: `"{hub}_{name}"`, name lowercased with spaces
    /// replaced by underscores
    pub fn unique_id(&self, hub_name: &str) -> String {
        format!("{}_{}", hub_name, self.name.to_lowercase().replace(' ', "_"))
    }
}

/// Construction input for one gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayHubConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Modbus slave address of the relay board
    pub device_address: u8,
    pub num_relays: u16,
    /// Per-call timeout covering connect, and write plus read
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Ceiling for the adaptive poll interval
    pub max_poll_interval_ms: u64,
    /// Total tries per command, the first one included
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_backoff_factor: f64,
    pub retry_jitter: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
    /// Log every frame as hex
    pub packet_logging: bool,
    /// Seed the state cache from persisted states on start
    pub restore_state: bool,
    pub entities: Vec<RelayEntity>,
}

impl Default for RelayHubConfig {
    fn default() -> Self {
        Self {
            name: "relay-hub".to_string(),
            host: String::new(),
            port: crate::DEFAULT_TCP_PORT,
            device_address: DEFAULT_DEVICE_ADDRESS,
            num_relays: DEFAULT_NUM_RELAYS,
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            retry_backoff_factor: 2.0,
            retry_jitter: true,
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 1,
            packet_logging: false,
            restore_state: false,
            entities: Vec::new(),
        }
    }
}

impl RelayHubConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> RelayResult<Self> {
        serde_json::from_str(json).map_err(|e| RelayError::validation("config", e.to_string()))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_device_address(mut self, address: u8) -> Self {
        self.device_address = address;
        self
    }

    pub fn with_num_relays(mut self, num_relays: u16) -> Self {
        self.num_relays = num_relays;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    pub fn with_max_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.max_poll_interval_ms = interval_ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delays_ms(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.retry_base_delay_ms = base_ms;
        self.retry_max_delay_ms = max_ms;
        self
    }

    pub fn with_retry_jitter(mut self, jitter: bool) -> Self {
        self.retry_jitter = jitter;
        self
    }

    pub fn with_circuit_breaker(mut self, threshold: u32, recovery_ms: u64) -> Self {
        self.failure_threshold = threshold;
        self.recovery_timeout_ms = recovery_ms;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn with_restore_state(mut self, restore: bool) -> Self {
        self.restore_state = restore;
        self
    }

    pub fn with_entity(mut self, entity: RelayEntity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries.saturating_sub(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_factor: self.retry_backoff_factor,
            jitter: self.retry_jitter,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            half_open_max_calls: self.half_open_max_calls,
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        PollingConfig {
            base_interval: Duration::from_millis(self.poll_interval_ms),
            max_interval: Duration::from_millis(self.max_poll_interval_ms),
        }
    }

    /// Check every range once; the first violation is returned
    pub fn validate(&self) -> RelayResult<()> {
        if self.host.trim().is_empty() {
            return Err(RelayError::validation("host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(RelayError::validation("port", "must be between 1 and 65535"));
        }
        if self.device_address == 0 {
            return Err(RelayError::validation(
                "device_address",
                "must be between 1 and 255",
            ));
        }
        if self.num_relays == 0 || self.num_relays > MAX_RELAYS {
            return Err(RelayError::validation(
                "num_relays",
                format!("{} not in 1..={}", self.num_relays, MAX_RELAYS),
            ));
        }
        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(RelayError::validation(
                "timeout_ms",
                format!("{} not in 1..={}", self.timeout_ms, MAX_TIMEOUT_MS),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(RelayError::validation("poll_interval_ms", "must be positive"));
        }
        if self.max_poll_interval_ms < self.poll_interval_ms {
            return Err(RelayError::validation(
                "max_poll_interval_ms",
                "must not be below poll_interval_ms",
            ));
        }
        if self.max_retries == 0 || self.max_retries > MAX_RETRIES_LIMIT {
            return Err(RelayError::validation(
                "max_retries",
                format!("{} not in 1..={}", self.max_retries, MAX_RETRIES_LIMIT),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(RelayError::validation(
                "retry_base_delay_ms",
                "must not exceed retry_max_delay_ms",
            ));
        }
        if !(self.retry_backoff_factor >= 1.0 && self.retry_backoff_factor.is_finite()) {
            return Err(RelayError::validation(
                "retry_backoff_factor",
                "must be a finite value >= 1.0",
            ));
        }
        if self.failure_threshold == 0 {
            return Err(RelayError::validation("failure_threshold", "must be at least 1"));
        }
        if self.half_open_max_calls == 0 {
            return Err(RelayError::validation(
                "half_open_max_calls",
                "must be at least 1",
            ));
        }

        let mut seen = HashSet::new();
        for entity in &self.entities {
            if entity.address == 0 || entity.address > self.num_relays {
                return Err(RelayError::invalid_address(entity.address, self.num_relays));
            }
            if !seen.insert(entity.address) {
                return Err(RelayError::validation(
                    "entities",
                    format!("relay {} mapped twice", entity.address),
                ));
            }
            if entity.name.trim().is_empty() {
                return Err(RelayError::validation(
                    "entities",
                    format!("relay {} has an empty name", entity.address),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RelayHubConfig {
        RelayHubConfig::new("192.168.1.200", 502)
    }

    fn field_of(err: RelayError) -> String {
        match err {
            RelayError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = valid();
        config.validate().unwrap();
        assert_eq!(config.num_relays, 8);
        assert_eq!(config.device_address, 1);
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.endpoint(), "192.168.1.200:502");
    }

    #[test]
    fn test_range_checks() {
        assert_eq!(field_of(RelayHubConfig::default().validate().unwrap_err()), "host");
        assert_eq!(field_of(RelayHubConfig::new("h", 0).validate().unwrap_err()), "port");
        assert_eq!(
            field_of(valid().with_device_address(0).validate().unwrap_err()),
            "device_address"
        );
        assert_eq!(
            field_of(valid().with_num_relays(33).validate().unwrap_err()),
            "num_relays"
        );
        assert_eq!(
            field_of(valid().with_num_relays(0).validate().unwrap_err()),
            "num_relays"
        );
        assert_eq!(
            field_of(valid().with_timeout_ms(60_001).validate().unwrap_err()),
            "timeout_ms"
        );
        assert_eq!(
            field_of(valid().with_max_retries(11).validate().unwrap_err()),
            "max_retries"
        );
        assert_eq!(
            field_of(valid().with_max_poll_interval_ms(10).validate().unwrap_err()),
            "max_poll_interval_ms"
        );
        assert_eq!(
            field_of(valid().with_retry_delays_ms(2_000, 1_000).validate().unwrap_err()),
            "retry_base_delay_ms"
        );
        assert_eq!(
            field_of(valid().with_circuit_breaker(0, 1_000).validate().unwrap_err()),
            "failure_threshold"
        );

        valid().with_device_address(255).validate().unwrap();
        valid().with_num_relays(32).validate().unwrap();
    }

    #[test]
    fn test_entity_checks() {
        let config = valid()
            .with_num_relays(4)
            .with_entity(RelayEntity::new(5, "Porch", RelayRole::Light));
        assert!(matches!(
            config.validate().unwrap_err(),
            RelayError::InvalidAddress { address: 5, max: 4 }
        ));

        let config = valid()
            .with_entity(RelayEntity::new(1, "Porch", RelayRole::Light))
            .with_entity(RelayEntity::new(1, "Pump", RelayRole::Switch));
        assert_eq!(field_of(config.validate().unwrap_err()), "entities");
    }

    #[test]
    fn test_unique_id() {
        let entity = RelayEntity::new(2, "Garden Lights", RelayRole::Light);
        assert_eq!(entity.unique_id("relay_1"), "relay_1_garden_lights");
    }

    #[test]
    fn test_retry_budget_excludes_first_try() {
        let config = valid().with_max_retries(3);
        assert_eq!(config.retry_config().max_attempts, 2);
    }

    #[test]
    fn test_from_json_uses_defaults() {
        let config = RelayHubConfig::from_json(
            r#"{
                "name": "garage",
                "host": "10.0.0.7",
                "num_relays": 16,
                "entities": [{"address": 3, "name": "Door", "role": "switch"}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.port, 502);
        assert_eq!(config.num_relays, 16);
        assert_eq!(config.entities[0].role, RelayRole::Switch);
        config.validate().unwrap();

        assert!(RelayHubConfig::from_json("{\"port\": \"x\"}").is_err());
    }
}
