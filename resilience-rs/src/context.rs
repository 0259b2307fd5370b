//! # Failure Context
//!
//! The where/when/who record attached to a handled failure, the
//! classification derived from it, and the response returned to callers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logging::current_correlation_id;
use crate::types::{suggestions_for, Error, ErrorCategory, Severity};

/// Describes the operation that failed
///
/// Built once through the `with_*` methods and then only read; fields are
/// private so a context cannot change after it is handed to the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    timestamp: DateTime<Utc>,
    request_id: Option<String>,
    user_id: Option<String>,
    operation: String,
    component: String,
    additional: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    /// Creates a context stamped now. The request id defaults to the current
    /// correlation id.
    pub fn new<O, C>(component: C, operation: O) -> Self
    where
        O: Into<String>,
        C: Into<String>,
    {
        Self {
            timestamp: Utc::now(),
            request_id: current_correlation_id(),
            user_id: None,
            operation: operation.into(),
            component: component.into(),
            additional: serde_json::Map::new(),
        }
    }

    pub fn with_request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Adds a key-value pair to the open context map
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.additional.insert(key.into(), value);
        }
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn additional(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.additional
    }

    /// Reads a string entry from the open context map
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.additional.get(key).and_then(|value| value.as_str())
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.component, self.operation)?;
        if let Some(request_id) = &self.request_id {
            write!(f, " [request: {}]", request_id)?;
        }
        Ok(())
    }
}

/// Classification of a failure, as passed to monitors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub category: ErrorCategory,
}

impl ClassifiedError {
    /// Classifies a domain error. Unknown kinds resolve to
    /// `UNKNOWN_ERROR` / MEDIUM / SYSTEM through the kind table.
    pub fn from_error(error: &Error) -> Self {
        Self {
            code: error.error_code().to_string(),
            message: error.message.clone(),
            severity: error.effective_severity(),
            category: error.effective_category(),
        }
    }
}

/// Structured result of handling one failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub context: ErrorContext,
    /// Substitute result produced by a fallback strategy
    pub fallback_result: Option<serde_json::Value>,
    pub suggestions: Vec<String>,
}

impl ErrorResponse {
    pub(crate) fn new(
        classified: ClassifiedError,
        context: ErrorContext,
        fallback_result: Option<serde_json::Value>,
    ) -> Self {
        let suggestions = suggestions_for(&classified.code);
        Self {
            error_code: classified.code,
            message: classified.message,
            severity: classified.severity,
            category: classified.category,
            context,
            fallback_result,
            suggestions,
        }
    }

    /// True when a strategy produced a substitute result
    pub fn recovered(&self) -> bool {
        self.fallback_result.is_some()
    }
}
