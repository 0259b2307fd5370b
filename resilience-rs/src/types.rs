//! # Failure Taxonomy
//!
//! Severity and category enumerations, the tagged domain error used across the
//! retrieval pipeline, and the static tables that classify each error kind.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Code assigned to failures that carry no recognised kind
pub const UNKNOWN_ERROR_CODE: &str = "UNKNOWN_ERROR";

/// How badly a failure affects the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Cosmetic or self-healing
    Low,
    /// Degrades a single request
    Medium,
    /// Degrades a subsystem
    High,
    /// Pipeline is unusable
    Critical,
}

impl Severity {
    /// Stable upper-case name used as an aggregation key
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

/// Where the fault originates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    System,
    Business,
    External,
    UserInput,
    Configuration,
}

impl ErrorCategory {
    /// Stable upper-case name used as an aggregation key
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::System => "SYSTEM",
            ErrorCategory::Business => "BUSINESS",
            ErrorCategory::External => "EXTERNAL",
            ErrorCategory::UserInput => "USER_INPUT",
            ErrorCategory::Configuration => "CONFIGURATION",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ErrorCategory {
    fn default() -> Self {
        ErrorCategory::System
    }
}

/// Retrieval strategy used by the search subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Semantic,
    Keyword,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Semantic => "semantic",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        }
    }

    /// Parses the lower-case wire name
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "semantic" => Some(SearchMode::Semantic),
            "keyword" => Some(SearchMode::Keyword),
            "hybrid" => Some(SearchMode::Hybrid),
            _ => None,
        }
    }

    /// The next cheaper mode to try after a failure in this one.
    ///
    /// Semantic search has nothing simpler to fall back to.
    pub fn degraded(&self) -> Option<Self> {
        match self {
            SearchMode::Hybrid | SearchMode::Keyword => Some(SearchMode::Semantic),
            SearchMode::Semantic => None,
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit tag carried by every domain error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Retrieval against the vector or keyword index failed
    Search,
    /// Cross-encoder or LLM reranking failed
    Reranking,
    /// Result cache read or write failed
    Cache,
    /// Pipeline configuration is missing or invalid
    Configuration,
    /// Embedding model call failed
    Embedding,
    /// Vector store engine failure
    VectorStore,
    /// Caller supplied malformed input
    Validation,
    /// A collaborator did not answer in time
    Timeout,
    /// Third-party API failure
    ExternalService,
    /// Relational persistence failure
    Database,
    /// Anything that was not raised as a domain error
    Unknown,
}

/// Static classification attached to an error kind
#[derive(Debug, Clone, Copy)]
pub struct KindProfile {
    pub code: &'static str,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub type_name: &'static str,
}

impl ErrorKind {
    /// Looks up the default code, severity and category for this kind
    pub fn profile(&self) -> KindProfile {
        use ErrorCategory as C;
        use Severity as S;

        let (code, severity, category, type_name) = match self {
            ErrorKind::Search => ("SEARCH_ERROR", S::High, C::External, "SearchError"),
            ErrorKind::Reranking => ("RERANKING_ERROR", S::Medium, C::External, "RerankingError"),
            ErrorKind::Cache => ("CACHE_ERROR", S::Low, C::System, "CacheError"),
            ErrorKind::Configuration => {
                ("CONFIGURATION_ERROR", S::High, C::Configuration, "ConfigurationError")
            }
            ErrorKind::Embedding => ("EMBEDDING_ERROR", S::High, C::External, "EmbeddingError"),
            ErrorKind::VectorStore => {
                ("VECTOR_STORE_ERROR", S::Critical, C::System, "VectorStoreError")
            }
            ErrorKind::Validation => ("VALIDATION_ERROR", S::Low, C::UserInput, "ValidationError"),
            ErrorKind::Timeout => ("TIMEOUT_ERROR", S::Medium, C::External, "TimeoutError"),
            ErrorKind::ExternalService => {
                ("EXTERNAL_SERVICE_ERROR", S::High, C::External, "ExternalServiceError")
            }
            ErrorKind::Database => ("DATABASE_ERROR", S::High, C::System, "DatabaseError"),
            ErrorKind::Unknown => (UNKNOWN_ERROR_CODE, S::Medium, C::System, "UnknownError"),
        };

        KindProfile {
            code,
            severity,
            category,
            type_name,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.profile().type_name)
    }
}

static SUGGESTIONS: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert(
        "SEARCH_ERROR",
        vec![
            "Retry the query with a simpler search mode",
            "Check that the vector store is reachable and the collection exists",
            "Reduce top_k or the query length",
        ],
    );
    table.insert(
        "RERANKING_ERROR",
        vec![
            "Serve results in their original retrieval order",
            "Check the reranking model endpoint and its resource limits",
            "Lower the number of documents sent for reranking",
        ],
    );
    table.insert(
        "CACHE_ERROR",
        vec![
            "Continue without the cache; results will be recomputed",
            "Verify the cache backend connection and available memory",
        ],
    );
    table.insert(
        "CONFIGURATION_ERROR",
        vec![
            "Validate the configuration against the documented defaults",
            "Remove unknown keys and fix value types",
            "Restore the last known good configuration",
        ],
    );
    table.insert(
        "EMBEDDING_ERROR",
        vec![
            "Check the embedding provider credentials and quota",
            "Retry with exponential backoff",
        ],
    );
    table.insert(
        "VECTOR_STORE_ERROR",
        vec![
            "Check vector store health and disk space",
            "Fail over to a replica if one is configured",
        ],
    );
    table.insert(
        "VALIDATION_ERROR",
        vec!["Correct the request parameters and resubmit"],
    );
    table.insert(
        "TIMEOUT_ERROR",
        vec![
            "Increase the operation timeout",
            "Reduce the amount of work per request",
        ],
    );
    table.insert(
        "EXTERNAL_SERVICE_ERROR",
        vec![
            "Check the status of the upstream provider",
            "Retry later or switch to a secondary provider",
        ],
    );
    table.insert(
        "DATABASE_ERROR",
        vec![
            "Check database connectivity and connection pool limits",
            "Inspect recent migrations",
        ],
    );
    table
});

/// Remediation hints registered for an error code; empty when none exist
pub fn suggestions_for(code: &str) -> Vec<String> {
    SUGGESTIONS
        .get(code)
        .map(|hints| hints.iter().map(|hint| hint.to_string()).collect())
        .unwrap_or_default()
}

/// Domain error raised by pipeline components
///
/// The kind tag selects default classification; `code`, `severity` and
/// `category` set on the instance override the defaults.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// A unique identifier for this error instance
    pub id: Uuid,
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Detailed error message
    pub message: String,
    /// The time when the error occurred
    pub timestamp: DateTime<Utc>,
    /// Code override
    pub code: Option<String>,
    /// Severity override
    pub severity: Option<Severity>,
    /// Category override
    pub category: Option<ErrorCategory>,
    /// Additional context as key-value pairs
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Rust type name of a wrapped foreign error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    /// Chain of causes (not serialized)
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Clone for Error {
    /// The opaque `cause` is dropped; structured fields are kept.
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            message: self.message.clone(),
            timestamp: self.timestamp,
            code: self.code.clone(),
            severity: self.severity,
            category: self.category,
            context: self.context.clone(),
            source_type: self.source_type.clone(),
            cause: None,
        }
    }
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            code: None,
            severity: None,
            category: None,
            context: serde_json::Map::new(),
            source_type: None,
            cause: None,
        }
    }

    /// Wraps an error that was not raised as a domain error
    pub fn unclassified<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<E>();
        let short = type_name.rsplit("::").next().unwrap_or(type_name);
        let mut error = Self::new(ErrorKind::Unknown, err.to_string()).cause(err);
        error.source_type = Some(short.to_string());
        error
    }

    pub fn search<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Search, message)
    }

    pub fn reranking<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Reranking, message)
    }

    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Cache, message)
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Overrides the code
    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Overrides the severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Overrides the category
    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Adds context information to the error
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Effective error code
    pub fn error_code(&self) -> &str {
        self.code.as_deref().unwrap_or(self.kind.profile().code)
    }

    /// Effective severity
    pub fn effective_severity(&self) -> Severity {
        self.severity.unwrap_or(self.kind.profile().severity)
    }

    /// Effective category
    pub fn effective_category(&self) -> ErrorCategory {
        self.category.unwrap_or(self.kind.profile().category)
    }

    /// Name used in exception frequency tables
    pub fn type_name(&self) -> &str {
        self.source_type
            .as_deref()
            .unwrap_or(self.kind.profile().type_name)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {} (Code: {})",
            self.effective_severity(),
            self.kind,
            self.message,
            self.error_code()
        )
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::unclassified(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::unclassified(err)
    }
}

/// Misuse of the configuration or query surface
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("alert level {0} cannot carry a threshold; use WARNING or CRITICAL")]
    UnsupportedLevel(String),

    #[error("threshold for {kind} must be a positive number, got {value}")]
    InvalidThreshold { kind: String, value: f64 },

    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("service is shut down")]
    ShutDown,

    #[error("failed to initialise logging: {0}")]
    Logging(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to serialize metrics: {0}")]
    Serialize(#[from] serde_json::Error),
}
