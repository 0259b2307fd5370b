//! # Structured Logging
//!
//! Subscriber initialisation, per-thread correlation ids, and the
//! severity-driven log line emitted for every handled failure.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};
use uuid::Uuid;

use crate::config::optional;
use crate::context::{ClassifiedError, ErrorContext};
use crate::types::{Error, ErrorKind, Result, Severity};

thread_local! {
    static CORRELATION_ID: RefCell<Option<String>> = RefCell::new(None);
}

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to output logs to a file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Custom fields to add to the initialisation record
    pub custom_fields: HashMap<String, serde_json::Value>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "rag-resilience".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
            custom_fields: HashMap::new(),
        }
    }
}

/// Installs the global tracing subscriber. Subsequent calls are no-ops.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let console = if config.json_format {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let file = match (config.file_output, config.log_dir.as_ref()) {
        (true, Some(log_dir)) => {
            let appender = RollingFileAppender::new(
                Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (writer, guard) = NonBlocking::new(appender);
            // The writer stops flushing once the guard drops.
            Box::leak(Box::new(guard));
            Some(fmt::layer().with_writer(writer).with_ansi(false).boxed())
        }
        _ => None,
    };

    let subscriber = Registry::default().with(filter).with(console).with(file);

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        Error::new(ErrorKind::Configuration, format!("Failed to set global subscriber: {}", e))
    })?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        custom_fields = ?config.custom_fields,
        "Structured logging initialized"
    );

    Ok(())
}

/// Sets the correlation ID for the current thread
pub fn set_correlation_id<S: Into<String>>(correlation_id: S) {
    CORRELATION_ID.with(|id| *id.borrow_mut() = Some(correlation_id.into()));
}

/// Generates and sets a new correlation ID
pub fn generate_correlation_id() -> String {
    let id = Uuid::new_v4().to_string();
    set_correlation_id(id.clone());
    id
}

/// Retrieves the current correlation ID
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.with(|id| id.borrow().clone())
}

/// Clears the correlation ID for the current thread
pub fn clear_correlation_id() {
    CORRELATION_ID.with(|id| *id.borrow_mut() = None);
}

/// Executes a function with a specific correlation ID
pub fn with_correlation_id<F, R, S>(correlation_id: S, f: F) -> R
where
    F: FnOnce() -> R,
    S: Into<String>,
{
    let previous = current_correlation_id();
    set_correlation_id(correlation_id);

    let result = f();

    match previous {
        Some(id) => set_correlation_id(id),
        None => clear_correlation_id(),
    }

    result
}

/// Emits the log line for a handled failure at a level chosen by severity
pub fn log_classified_error(classified: &ClassifiedError, context: &ErrorContext) {
    let request_id = context.request_id().unwrap_or("unknown");
    let user_id = context.user_id().unwrap_or("anonymous");

    match classified.severity {
        Severity::Critical => tracing::error!(
            critical = true,
            error_code = %classified.code,
            component = %context.component(),
            operation = %context.operation(),
            category = %classified.category,
            severity = %classified.severity,
            request_id = %request_id,
            user_id = %user_id,
            additional = ?context.additional(),
            "Critical failure: {}", classified.message
        ),
        Severity::High => tracing::error!(
            error_code = %classified.code,
            component = %context.component(),
            operation = %context.operation(),
            category = %classified.category,
            severity = %classified.severity,
            request_id = %request_id,
            "Failure: {}", classified.message
        ),
        Severity::Medium => tracing::warn!(
            error_code = %classified.code,
            component = %context.component(),
            operation = %context.operation(),
            category = %classified.category,
            severity = %classified.severity,
            request_id = %request_id,
            "Degraded: {}", classified.message
        ),
        Severity::Low => tracing::info!(
            error_code = %classified.code,
            component = %context.component(),
            operation = %context.operation(),
            category = %classified.category,
            severity = %classified.severity,
            request_id = %request_id,
            "Minor failure: {}", classified.message
        ),
    }
}

impl TryFrom<&config::Config> for LoggingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: &config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = LoggingConfig::default();

        if let Some(level) = optional::<String>(cfg, "logging.level")? {
            base.level = level;
        }
        if let Some(service_name) = optional::<String>(cfg, "logging.service_name")? {
            base.service_name = service_name;
        }
        if let Some(file_output) = optional::<bool>(cfg, "logging.file_output")? {
            base.file_output = file_output;
        }
        if let Some(log_dir) = optional::<String>(cfg, "logging.log_dir")? {
            base.log_dir = Some(log_dir);
        }
        if let Some(json_format) = optional::<bool>(cfg, "logging.json_format")? {
            base.json_format = json_format;
        }

        Ok(base)
    }
}
