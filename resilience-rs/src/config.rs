//! # Configuration
//!
//! Startup configuration for the resilience service. Everything here stays
//! settable at runtime through the monitor and limiter APIs; this type only
//! seeds the initial values.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::limiter::DEFAULT_MAX_RECOVERY_ATTEMPTS;
use crate::logging::LoggingConfig;
use crate::monitor::{AlertThresholds, LevelThresholds, MonitorCapacity};
use crate::performance::PerformanceCapacity;
use crate::types::ConfigError;

/// Bounds for every ring buffer kept by the monitors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Error metric history
    pub error_metrics: usize,
    /// Alert history used for queries and dedup
    pub alerts: usize,
    /// Successful response-time samples used for percentiles
    pub response_samples: usize,
    /// Completed performance operations
    pub completed_operations: usize,
    /// Cache, reranking and search-mode event rings
    pub events: usize,
    /// Recent exception records
    pub recent_exceptions: usize,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        let monitor = MonitorCapacity::default();
        let performance = PerformanceCapacity::default();
        Self {
            error_metrics: monitor.metrics,
            alerts: monitor.alerts,
            response_samples: performance.response_samples,
            completed_operations: performance.completed_operations,
            events: performance.events,
            recent_exceptions: performance.recent_exceptions,
        }
    }
}

impl CapacityConfig {
    pub fn monitor(&self) -> MonitorCapacity {
        MonitorCapacity {
            metrics: self.error_metrics,
            alerts: self.alerts,
        }
    }

    pub fn performance(&self) -> PerformanceCapacity {
        PerformanceCapacity {
            response_samples: self.response_samples,
            completed_operations: self.completed_operations,
            events: self.events,
            recent_exceptions: self.recent_exceptions,
        }
    }
}

/// Configuration for the resilience service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Alert rule trip points and windows
    pub thresholds: AlertThresholds,
    /// History capacities
    pub capacities: CapacityConfig,
    /// Recovery attempts allowed per (code, component, operation)
    pub max_recovery_attempts: u32,
    /// Logging setup
    pub logging: LoggingConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            thresholds: AlertThresholds::default(),
            capacities: CapacityConfig::default(),
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            logging: LoggingConfig::default(),
        }
    }
}

impl ResilienceConfig {
    /// Loads `RESILIENCE_*` variables (after reading `.env`) over the defaults,
    /// e.g. `RESILIENCE_ERROR_RATE_WARNING=20`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("RESILIENCE")
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?;

        Self::from_source(&cfg, "")
    }

    /// Reads flat keys under `prefix` over the defaults
    fn from_source(cfg: &config::Config, prefix: &str) -> Result<Self, ConfigError> {
        let key = |name: &str| format!("{}{}", prefix, name);
        let mut base = ResilienceConfig::default();

        let levels = [
            ("error_rate", &mut base.thresholds.error_rate),
            ("critical_errors", &mut base.thresholds.critical_errors),
            ("component_errors", &mut base.thresholds.component_errors),
            ("pattern", &mut base.thresholds.pattern),
        ];
        for (name, target) in levels {
            read_levels(cfg, &key(name), target)?;
        }

        if let Some(minutes) = optional::<i64>(cfg, &key("pattern_window_minutes"))? {
            base.thresholds.pattern_window_minutes = minutes;
        }
        if let Some(minutes) = optional::<i64>(cfg, &key("accumulation_window_minutes"))? {
            base.thresholds.accumulation_window_minutes = minutes;
        }
        if let Some(minutes) = optional::<i64>(cfg, &key("dedup_window_minutes"))? {
            base.thresholds.dedup_window_minutes = minutes;
        }
        if let Some(attempts) = optional::<u32>(cfg, &key("max_recovery_attempts"))? {
            base.max_recovery_attempts = attempts;
        }

        let capacities = &mut base.capacities;
        let sizes = [
            ("error_metrics_capacity", &mut capacities.error_metrics),
            ("alerts_capacity", &mut capacities.alerts),
            ("response_samples_capacity", &mut capacities.response_samples),
            ("completed_operations_capacity", &mut capacities.completed_operations),
            ("events_capacity", &mut capacities.events),
            ("recent_exceptions_capacity", &mut capacities.recent_exceptions),
        ];
        for (name, target) in sizes {
            if let Some(size) = optional::<usize>(cfg, &key(name))? {
                *target = size;
            }
        }

        base.logging = LoggingConfig::try_from(cfg)?;
        base.validate()?;
        Ok(base)
    }

    /// Rejects non-positive thresholds and windows
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        let levels = [
            ("error_rate", t.error_rate),
            ("critical_errors", t.critical_errors),
            ("component_errors", t.component_errors),
            ("pattern", t.pattern),
        ];
        for (kind, level) in levels {
            for value in [level.warning, level.critical] {
                if !value.is_finite() || value <= 0.0 {
                    return Err(ConfigError::InvalidThreshold {
                        kind: kind.to_string(),
                        value,
                    });
                }
            }
        }

        let windows = [
            ("pattern_window_minutes", t.pattern_window_minutes),
            ("accumulation_window_minutes", t.accumulation_window_minutes),
            ("dedup_window_minutes", t.dedup_window_minutes),
        ];
        for (kind, minutes) in windows {
            if minutes <= 0 {
                return Err(ConfigError::InvalidThreshold {
                    kind: kind.to_string(),
                    value: minutes as f64,
                });
            }
        }

        Ok(())
    }
}

/// Reads a key that may be absent. A present value that fails to parse is
/// an error rather than a silent fallback to the default.
pub(crate) fn optional<T: DeserializeOwned>(cfg: &config::Config, key: &str) -> Result<Option<T>, config::ConfigError> {
    match cfg.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

fn read_levels(cfg: &config::Config, key: &str, target: &mut LevelThresholds) -> Result<(), ConfigError> {
    if let Some(warning) = optional::<f64>(cfg, &format!("{}_warning", key))? {
        target.warning = warning;
    }
    if let Some(critical) = optional::<f64>(cfg, &format!("{}_critical", key))? {
        target.critical = critical;
    }
    Ok(())
}

impl TryFrom<config::Config> for ResilienceConfig {
    type Error = ConfigError;

    fn try_from(cfg: config::Config) -> Result<Self, Self::Error> {
        Self::from_source(&cfg, "resilience.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResilienceConfig::default();
        assert_eq!(config.thresholds.error_rate, LevelThresholds::new(10.0, 50.0));
        assert_eq!(config.thresholds.pattern, LevelThresholds::new(3.0, 10.0));
        assert_eq!(config.thresholds.dedup_window_minutes, 5);
        assert_eq!(config.capacities.error_metrics, 10_000);
        assert_eq!(config.capacities.response_samples, 1_000);
        assert_eq!(config.capacities.recent_exceptions, 100);
        assert_eq!(config.max_recovery_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_try_from_config_overrides() {
        let cfg = config::Config::builder()
            .set_override("resilience.error_rate_warning", 20.0)
            .unwrap()
            .set_override("resilience.pattern_window_minutes", 10)
            .unwrap()
            .set_override("resilience.max_recovery_attempts", 5)
            .unwrap()
            .set_override("resilience.alerts_capacity", 50)
            .unwrap()
            .set_override("logging.level", "debug")
            .unwrap()
            .build()
            .unwrap();

        let config = ResilienceConfig::try_from(cfg).unwrap();
        assert_eq!(config.thresholds.error_rate.warning, 20.0);
        assert_eq!(config.thresholds.error_rate.critical, 50.0);
        assert_eq!(config.thresholds.pattern_window_minutes, 10);
        assert_eq!(config.max_recovery_attempts, 5);
        assert_eq!(config.capacities.alerts, 50);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let cfg = config::Config::builder()
            .set_override("resilience.pattern_critical", -1.0)
            .unwrap()
            .build()
            .unwrap();

        assert!(matches!(
            ResilienceConfig::try_from(cfg),
            Err(ConfigError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_unparseable_value_is_reported() {
        let cfg = config::Config::builder()
            .set_override("resilience.error_rate_warning", "abc")
            .unwrap()
            .build()
            .unwrap();

        assert!(matches!(ResilienceConfig::try_from(cfg), Err(ConfigError::Load(_))));

        let cfg = config::Config::builder()
            .set_override("logging.json_format", "sometimes")
            .unwrap()
            .build()
            .unwrap();

        assert!(matches!(ResilienceConfig::try_from(cfg), Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_missing_keys_keep_defaults() {
        let cfg = config::Config::builder().build().unwrap();
        assert_eq!(ResilienceConfig::try_from(cfg).unwrap(), ResilienceConfig::default());
    }
}
