//! # Fallback Strategies
//!
//! Pluggable recovery for failed retrieval operations. A strategy recognises
//! a class of failures and produces a best-effort substitute result.
//!
//! Strategies are consulted in registration order and the first applicable
//! one is the only one executed, even when it yields no result.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::context::ErrorContext;
use crate::sync::{read, write};
use crate::types::{Error, Result, SearchMode};

/// Retrieval service a strategy may call for an alternate search
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, mode: SearchMode, top_k: usize) -> Result<Vec<Value>>;
}

/// Open description of the request whose failure is being handled
///
/// Strategies read only the keys they need: `query`, `search_mode`, `top_k`,
/// `config`, `original_results`, `cache_key`, `cache_operation`, plus caller
/// identifiers. An alternate search service can be attached as a handle.
#[derive(Clone, Default)]
pub struct FallbackRequest {
    fields: Map<String, Value>,
    search: Option<Arc<dyn SearchBackend>>,
    timeout: Option<Duration>,
}

impl FallbackRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an arbitrary field
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: serde::Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.fields.insert(key.into(), value);
        }
        self
    }

    pub fn with_query<S: Into<String>>(self, query: S) -> Self {
        self.with("query", query.into())
    }

    pub fn with_search_mode(self, mode: SearchMode) -> Self {
        self.with("search_mode", mode.as_str())
    }

    pub fn with_original_results(self, results: Vec<Value>) -> Self {
        self.with("original_results", results)
    }

    pub fn with_config(self, config: Value) -> Self {
        self.with("config", config)
    }

    /// Describes a failed cache access; `operation` is `get` or `set`
    pub fn with_cache_operation<K, O>(self, key: K, operation: O) -> Self
    where
        K: Into<String>,
        O: Into<String>,
    {
        self.with("cache_key", key.into())
            .with("cache_operation", operation.into())
    }

    pub fn with_search_backend(mut self, backend: Arc<dyn SearchBackend>) -> Self {
        self.search = Some(backend);
        self
    }

    /// Upper bound for the single fallback invocation
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn query(&self) -> Option<&str> {
        self.get_str("query")
    }

    pub fn search_mode(&self) -> Option<SearchMode> {
        self.get_str("search_mode").and_then(SearchMode::parse)
    }

    pub fn top_k(&self) -> Option<usize> {
        self.get("top_k").and_then(Value::as_u64).map(|k| k as usize)
    }

    pub fn original_results(&self) -> Option<&Vec<Value>> {
        self.get("original_results").and_then(Value::as_array)
    }

    pub fn config(&self) -> Option<&Map<String, Value>> {
        self.get("config").and_then(Value::as_object)
    }

    pub fn search_backend(&self) -> Option<&Arc<dyn SearchBackend>> {
        self.search.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for FallbackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackRequest")
            .field("fields", &self.fields)
            .field("search_backend", &self.search.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A unit of recovery for one class of failures
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Whether this strategy recognises the failure
    fn is_applicable(&self, error: &Error, context: &ErrorContext) -> bool;

    /// Produces a substitute result. `Ok(None)` means the strategy matched
    /// but had nothing to offer.
    async fn execute(
        &self,
        request: &FallbackRequest,
        error: &Error,
        context: &ErrorContext,
    ) -> Result<Option<Value>>;
}

/// Outcome of running the selected strategy
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome {
    /// Strategy that was executed
    pub strategy: String,
    /// Its result, if any
    pub result: Option<Value>,
}

/// Ordered collection of strategies
#[derive(Default)]
pub struct FallbackRegistry {
    strategies: RwLock<Vec<Arc<dyn FallbackStrategy>>>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a strategy; earlier registrations take precedence
    pub fn register(&self, strategy: Arc<dyn FallbackStrategy>) {
        debug!(strategy = %strategy.name(), "Registered fallback strategy");
        write(&self.strategies).push(strategy);
    }

    pub fn strategy_names(&self) -> Vec<String> {
        read(&self.strategies)
            .iter()
            .map(|strategy| strategy.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        read(&self.strategies).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.strategies).is_empty()
    }

    /// First strategy, in registration order, that accepts the failure
    pub fn select(&self, error: &Error, context: &ErrorContext) -> Option<Arc<dyn FallbackStrategy>> {
        read(&self.strategies)
            .iter()
            .find(|strategy| strategy.is_applicable(error, context))
            .cloned()
    }

    /// Executes the first applicable strategy exactly once.
    ///
    /// Returns `Ok(None)` when no strategy applies. The registry lock is
    /// released before the strategy runs.
    pub async fn execute_first(
        &self,
        request: &FallbackRequest,
        error: &Error,
        context: &ErrorContext,
    ) -> Result<Option<FallbackOutcome>> {
        let strategy = match self.select(error, context) {
            Some(strategy) => strategy,
            None => {
                debug!(
                    error_code = %error.error_code(),
                    component = %context.component(),
                    "No applicable fallback strategy"
                );
                return Ok(None);
            }
        };

        let name = strategy.name().to_string();
        let start = Instant::now();
        let result = strategy.execute(request, error, context).await;
        histogram!(
            format!("resilience.fallback.{}.duration_ms", name),
            start.elapsed().as_millis() as f64
        );

        match result {
            Ok(result) => {
                counter!(format!("resilience.fallback.{}.success", name), 1);
                info!(
                    strategy = %name,
                    error_code = %error.error_code(),
                    produced_result = result.is_some(),
                    duration_ms = %start.elapsed().as_millis(),
                    "Fallback strategy executed"
                );
                Ok(Some(FallbackOutcome {
                    strategy: name,
                    result,
                }))
            }
            Err(err) => {
                counter!(format!("resilience.fallback.{}.failure", name), 1);
                warn!(strategy = %name, error = %err, "Fallback strategy failed");
                Err(err)
            }
        }
    }
}

impl fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackRegistry")
            .field("strategies", &self.strategy_names())
            .finish()
    }
}
