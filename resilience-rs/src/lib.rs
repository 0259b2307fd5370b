//! # Retrieval Pipeline Resilience
//!
//! Failure handling for a retrieval-augmented pipeline: classifies failures
//! from search, reranking, caching and configuration, attempts bounded
//! fallback recovery, and tracks error and performance statistics to raise
//! deduplicated alerts.
//!
//! ## Features
//!
//! - Tagged domain errors with a static severity/category table
//! - Ordered, pluggable fallback strategies
//! - Per-key recovery attempt limiting
//! - Trailing-window error rates, pattern detection and alert dedup
//! - Latency percentiles, cache/reranking/search-mode statistics and a
//!   stability score
//!
//! Everything hangs off an explicitly constructed [`ResilienceService`].

pub mod clock;
pub mod config;
pub mod context;
pub mod fallback;
pub mod handler;
pub mod limiter;
pub mod logging;
pub mod monitor;
pub mod performance;
pub mod sanitization;
pub mod service;
pub mod strategies;
pub mod types;

mod sync;

// Re-export commonly used types
pub use clock::{Clock, MockClock, SystemClock};
pub use crate::config::{CapacityConfig, ResilienceConfig};
pub use context::{ClassifiedError, ErrorContext, ErrorResponse};
pub use fallback::{FallbackOutcome, FallbackRegistry, FallbackRequest, FallbackStrategy, SearchBackend};
pub use handler::{ErrorHandler, ErrorObserver, FallbackResult, HandledError};
pub use limiter::RecoveryLimiter;
pub use logging::{current_correlation_id, init_logging, set_correlation_id, LoggingConfig};
pub use monitor::{Alert, AlertHandler, AlertLevel, AlertThresholds, ErrorMetric, ErrorMonitor, ErrorStatistics, ThresholdKind};
pub use performance::{OperationHandle, OperationType, PerformanceMonitor, PerformanceReport};
pub use service::ResilienceService;
pub use types::{ConfigError, Error, ErrorCategory, ErrorKind, Result, SearchMode, Severity};

/// Initializes logging and builds a service with default settings
pub fn init() -> std::result::Result<ResilienceService, ConfigError> {
    let config = ResilienceConfig::default();
    init_logging(Some(config.logging.clone())).map_err(|err| ConfigError::Logging(err.to_string()))?;
    ResilienceService::new(config)
}

/// Initializes logging and builds a service from loaded configuration
pub fn init_with_config(config: ::config::Config) -> std::result::Result<ResilienceService, ConfigError> {
    let config = ResilienceConfig::try_from(config)?;
    init_logging(Some(config.logging.clone())).map_err(|err| ConfigError::Logging(err.to_string()))?;
    ResilienceService::new(config)
}
