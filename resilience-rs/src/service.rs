//! # Resilience Service
//!
//! Explicitly constructed owner of the handler, monitors, strategy registry
//! and recovery limiter. Call sites receive it by reference (or `Arc`); there
//! is no global instance.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::ResilienceConfig;
use crate::context::{ErrorContext, ErrorResponse};
use crate::fallback::{FallbackRegistry, FallbackRequest, FallbackStrategy};
use crate::handler::{ErrorHandler, FallbackResult};
use crate::limiter::RecoveryLimiter;
use crate::monitor::{log_alert, Alert, AlertHandler, ErrorMonitor, ErrorStatistics};
use crate::performance::{PerformanceMonitor, PerformanceReport};
use crate::strategies::{CacheFallback, ConfigurationFallback, RerankingFallback, SearchModeFallback};
use crate::types::{ConfigError, Error, Result};

/// Window used for the performance section of exported metrics
const EXPORT_WINDOW_MINUTES: u64 = 60;

pub struct ResilienceService {
    config: ResilienceConfig,
    clock: Arc<dyn Clock>,
    handler: ErrorHandler,
    monitor: Arc<ErrorMonitor>,
    performance: Arc<PerformanceMonitor>,
    limiter: RecoveryLimiter,
    shut_down: AtomicBool,
}

impl ResilienceService {
    /// Builds a service on the system clock
    pub fn new(config: ResilienceConfig) -> std::result::Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds a service reading time from `clock`.
    ///
    /// The built-in strategies are registered in the order search mode,
    /// reranking, cache, configuration, and the log sink is registered as
    /// the first alert handler.
    pub fn with_clock(config: ResilienceConfig, clock: Arc<dyn Clock>) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(FallbackRegistry::new());
        registry.register(Arc::new(SearchModeFallback));
        registry.register(Arc::new(RerankingFallback));
        registry.register(Arc::new(CacheFallback));
        registry.register(Arc::new(ConfigurationFallback));

        let monitor = Arc::new(ErrorMonitor::new(
            clock.clone(),
            config.thresholds.clone(),
            config.capacities.monitor(),
        ));
        monitor.register_alert_handler(log_alert);

        let performance = Arc::new(PerformanceMonitor::new(clock.clone(), config.capacities.performance()));

        let handler = ErrorHandler::new(registry);
        handler.register_observer(monitor.clone());
        handler.register_observer(performance.clone());

        info!(
            strategies = ?handler.registry().strategy_names(),
            max_recovery_attempts = config.max_recovery_attempts,
            "Resilience service started"
        );

        Ok(Self {
            limiter: RecoveryLimiter::new(config.max_recovery_attempts),
            config,
            clock,
            handler,
            monitor,
            performance,
            shut_down: AtomicBool::new(false),
        })
    }

    /// See [`ErrorHandler::handle`]
    pub async fn handle(
        &self,
        error: &Error,
        context: ErrorContext,
        original_request: Option<&FallbackRequest>,
        enable_fallback: bool,
    ) -> ErrorResponse {
        self.handler
            .handle(error, context, original_request, enable_fallback)
            .await
    }

    /// See [`ErrorHandler::guard`]
    pub async fn guard<T, F>(
        &self,
        operation: F,
        context: ErrorContext,
        request: Option<&FallbackRequest>,
    ) -> FallbackResult<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.handler.guard(operation, context, request).await
    }

    pub fn should_attempt_recovery(&self, error_code: &str, context: &ErrorContext) -> bool {
        self.limiter.should_attempt_recovery(error_code, context)
    }

    pub fn reset_recovery_attempts(&self, error_code: &str, context: &ErrorContext) {
        self.limiter.reset_recovery_attempts(error_code, context)
    }

    /// Appends a strategy after the built-in ones
    pub fn register_strategy(&self, strategy: Arc<dyn FallbackStrategy>) {
        self.handler.registry().register(strategy);
    }

    pub fn register_alert_handler<F>(&self, handler: F) -> std::result::Result<(), ConfigError>
    where
        F: Fn(&Alert) -> Result<()> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        self.monitor.register_alert_handler(handler);
        Ok(())
    }

    pub fn register_async_alert_handler(&self, handler: Arc<dyn AlertHandler>) -> std::result::Result<(), ConfigError> {
        self.ensure_running()?;
        self.monitor.register_async_alert_handler(handler);
        Ok(())
    }

    pub fn get_error_statistics(&self, time_range_minutes: Option<u64>) -> ErrorStatistics {
        self.monitor.get_statistics(time_range_minutes)
    }

    pub fn get_performance_report(&self, time_range_minutes: u64) -> PerformanceReport {
        self.performance.get_report(time_range_minutes)
    }

    pub fn get_recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.monitor.get_recent_alerts(limit)
    }

    /// Serializes error statistics, recent alerts and the performance
    /// report. Only `json` is supported.
    pub fn export_metrics(&self, format: &str) -> std::result::Result<String, ConfigError> {
        if !format.eq_ignore_ascii_case("json") {
            return Err(ConfigError::UnsupportedFormat(format.to_string()));
        }

        let document = json!({
            "generated_at": self.clock.now(),
            "error_statistics": self.get_error_statistics(None),
            "recent_alerts": self.get_recent_alerts(self.config.capacities.alerts),
            "handled_by_code": self.handler.statistics(),
            "performance": self.get_performance_report(EXPORT_WINDOW_MINUTES),
        });
        Ok(serde_json::to_string_pretty(&document)?)
    }

    pub fn handler(&self) -> &ErrorHandler {
        &self.handler
    }

    pub fn monitor(&self) -> &Arc<ErrorMonitor> {
        &self.monitor
    }

    pub fn performance(&self) -> &Arc<PerformanceMonitor> {
        &self.performance
    }

    pub fn limiter(&self) -> &RecoveryLimiter {
        &self.limiter
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stops accepting alert handlers and waits for pending alert deliveries
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitor.flush().await;
        info!(
            active_operations = self.performance.active_operations(),
            "Resilience service shut down"
        );
    }

    fn ensure_running(&self) -> std::result::Result<(), ConfigError> {
        if self.is_shut_down() {
            Err(ConfigError::ShutDown)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ResilienceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceService")
            .field("handler", &self.handler)
            .field("monitor", &self.monitor)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SearchMode;

    #[test]
    fn test_builtin_strategy_order() {
        let service = ResilienceService::new(ResilienceConfig::default()).unwrap();
        assert_eq!(
            service.handler().registry().strategy_names(),
            vec![
                "search_mode_degradation",
                "reranking_bypass",
                "cache_bypass",
                "configuration_recovery"
            ]
        );
        assert_eq!(service.monitor().handler_count(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ResilienceConfig::default();
        config.thresholds.dedup_window_minutes = 0;
        assert!(matches!(
            ResilienceService::new(config),
            Err(ConfigError::InvalidThreshold { .. })
        ));
    }

    #[tokio::test]
    async fn test_cache_failure_is_bypassed() {
        let service = ResilienceService::new(ResilienceConfig::default()).unwrap();
        let request = FallbackRequest::new()
            .with_query("rust ownership")
            .with_search_mode(SearchMode::Hybrid)
            .with_cache_operation("q:rust", "get");

        let response = service
            .handle(&Error::cache("redis refused"), ErrorContext::new("cache", "get"), Some(&request), true)
            .await;

        let fallback = response.fallback_result.unwrap();
        assert_eq!(fallback["cache_hit"], json!(false));
        assert_eq!(fallback["bypassed"], json!(true));
        assert_eq!(fallback["cache_key"], json!("q:rust"));
        assert_eq!(service.get_error_statistics(None).total_errors, 1);
        assert_eq!(service.get_performance_report(5).exceptions.total, 1);
    }

    #[tokio::test]
    async fn test_export_and_shutdown() {
        let service = ResilienceService::new(ResilienceConfig::default()).unwrap();
        service
            .handle(&Error::search("down"), ErrorContext::new("search", "query"), None, false)
            .await;

        let exported = service.export_metrics("JSON").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(parsed["error_statistics"]["total_errors"], json!(1));
        assert_eq!(parsed["handled_by_code"]["SEARCH_ERROR"], json!(1));

        assert!(matches!(
            service.export_metrics("prometheus"),
            Err(ConfigError::UnsupportedFormat(_))
        ));

        service.shutdown().await;
        assert!(service.is_shut_down());
        assert!(matches!(
            service.register_alert_handler(|_| Ok(())),
            Err(ConfigError::ShutDown)
        ));
    }
}
