//! # Error Handler
//!
//! Turns a raw failure into an [`ErrorResponse`]: classifies it, logs it,
//! notifies observers (the error and performance monitors), and optionally
//! runs the first applicable fallback strategy once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use futures::FutureExt;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, warn};

use crate::context::{ClassifiedError, ErrorContext, ErrorResponse};
use crate::fallback::{FallbackRegistry, FallbackRequest};
use crate::logging::log_classified_error;
use crate::sync::{lock, read, write};
use crate::types::{Error, Result};

/// Receives every handled failure
///
/// Observer failures and panics are logged and never reach the caller.
pub trait ErrorObserver: Send + Sync {
    fn on_error(&self, error: &Error, context: &ErrorContext, classified: &ClassifiedError) -> Result<()>;
}

/// A failure that no fallback could cover
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct HandledError {
    pub error: Error,
    pub response: ErrorResponse,
}

/// Result of a guarded operation
#[derive(Debug)]
pub enum FallbackResult<T> {
    /// The operation succeeded
    Primary(T),
    /// The operation failed and a strategy produced a substitute
    Fallback(Value),
    /// The operation failed and nothing substituted for it
    Failure(Box<HandledError>),
}

impl<T> FallbackResult<T> {
    pub fn is_primary(&self) -> bool {
        matches!(self, FallbackResult::Primary(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, FallbackResult::Fallback(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FallbackResult::Failure(_))
    }

    /// Converts to a standard Result, decoding a substitute into `T`
    pub fn into_result(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        match self {
            FallbackResult::Primary(value) => Ok(value),
            FallbackResult::Fallback(value) => Ok(serde_json::from_value(value)?),
            FallbackResult::Failure(handled) => Err(handled.error),
        }
    }
}

/// Central failure handler
pub struct ErrorHandler {
    registry: Arc<FallbackRegistry>,
    observers: RwLock<Vec<Arc<dyn ErrorObserver>>>,
    stats: Mutex<HashMap<String, u64>>,
}

impl ErrorHandler {
    pub fn new(registry: Arc<FallbackRegistry>) -> Self {
        Self {
            registry,
            observers: RwLock::new(Vec::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<FallbackRegistry> {
        &self.registry
    }

    pub fn register_observer(&self, observer: Arc<dyn ErrorObserver>) {
        write(&self.observers).push(observer);
    }

    /// Handles one failure.
    ///
    /// Always returns a response; failures inside observers or the fallback
    /// strategy are logged and degrade to "no fallback".
    pub async fn handle(
        &self,
        error: &Error,
        context: ErrorContext,
        original_request: Option<&FallbackRequest>,
        enable_fallback: bool,
    ) -> ErrorResponse {
        let classified = ClassifiedError::from_error(error);

        *lock(&self.stats).entry(classified.code.clone()).or_insert(0) += 1;
        counter!("resilience.handler.handled", 1);

        log_classified_error(&classified, &context);
        self.notify_observers(error, &context, &classified);

        let fallback_result = match original_request {
            Some(request) if enable_fallback => self.run_fallback(request, error, &context).await,
            _ => None,
        };

        ErrorResponse::new(classified, context, fallback_result)
    }

    fn notify_observers(&self, error: &Error, context: &ErrorContext, classified: &ClassifiedError) {
        let observers = read(&self.observers).clone();

        for observer in observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_error(error, context, classified))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %err, error_code = %classified.code, "Error observer failed");
                }
                Err(_) => {
                    error!(error_code = %classified.code, "Error observer panicked");
                }
            }
        }
    }

    async fn run_fallback(&self, request: &FallbackRequest, error: &Error, context: &ErrorContext) -> Option<Value> {
        let attempt = AssertUnwindSafe(self.registry.execute_first(request, error, context)).catch_unwind();

        let caught = match request.timeout() {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(caught) => caught,
                Err(_) => {
                    counter!("resilience.fallback.timeout", 1);
                    warn!(
                        error_code = %error.error_code(),
                        component = %context.component(),
                        timeout_ms = limit.as_millis() as u64,
                        "Fallback timed out"
                    );
                    return None;
                }
            },
            None => attempt.await,
        };

        let outcome = match caught {
            Ok(outcome) => outcome,
            Err(_) => {
                counter!("resilience.fallback.panic", 1);
                error!(
                    error_code = %error.error_code(),
                    component = %context.component(),
                    "Fallback strategy panicked; continuing without fallback"
                );
                return None;
            }
        };

        match outcome {
            Ok(Some(outcome)) => outcome.result,
            Ok(None) => None,
            Err(err) => {
                error!(
                    error = %err,
                    error_code = %error.error_code(),
                    component = %context.component(),
                    "Fallback strategy raised; continuing without fallback"
                );
                None
            }
        }
    }

    /// Runs `operation`, routing a failure through [`handle`](Self::handle)
    /// with fallback enabled.
    pub async fn guard<T, F>(
        &self,
        operation: F,
        context: ErrorContext,
        request: Option<&FallbackRequest>,
    ) -> FallbackResult<T>
    where
        F: Future<Output = Result<T>>,
    {
        match operation.await {
            Ok(value) => FallbackResult::Primary(value),
            Err(error) => {
                let response = self.handle(&error, context, request, true).await;
                match response.fallback_result.clone() {
                    Some(substitute) => FallbackResult::Fallback(substitute),
                    None => FallbackResult::Failure(Box::new(HandledError { error, response })),
                }
            }
        }
    }

    /// Failures handled so far, by code
    pub fn statistics(&self) -> BTreeMap<String, u64> {
        lock(&self.stats)
            .iter()
            .map(|(code, count)| (code.clone(), *count))
            .collect()
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("registry", &self.registry)
            .field("observers", &read(&self.observers).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FallbackStrategy;
    use crate::types::{ErrorCategory, ErrorKind, Severity};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixed {
        value: Option<Value>,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl FallbackStrategy for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn is_applicable(&self, _error: &Error, _context: &ErrorContext) -> bool {
            true
        }

        async fn execute(&self, _request: &FallbackRequest, _error: &Error, _context: &ErrorContext) -> Result<Option<Value>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.clone())
        }
    }

    struct Stalled;

    #[async_trait]
    impl FallbackStrategy for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        fn is_applicable(&self, _error: &Error, _context: &ErrorContext) -> bool {
            true
        }

        async fn execute(&self, _request: &FallbackRequest, _error: &Error, _context: &ErrorContext) -> Result<Option<Value>> {
            std::future::pending::<()>().await;
            Ok(None)
        }
    }

    struct Raising;

    #[async_trait]
    impl FallbackStrategy for Raising {
        fn name(&self) -> &str {
            "raising"
        }

        fn is_applicable(&self, _error: &Error, _context: &ErrorContext) -> bool {
            true
        }

        async fn execute(&self, _request: &FallbackRequest, _error: &Error, _context: &ErrorContext) -> Result<Option<Value>> {
            Err(Error::new(ErrorKind::ExternalService, "strategy broke"))
        }
    }

    struct Exploding;

    #[async_trait]
    impl FallbackStrategy for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn is_applicable(&self, _error: &Error, _context: &ErrorContext) -> bool {
            true
        }

        async fn execute(&self, _request: &FallbackRequest, _error: &Error, _context: &ErrorContext) -> Result<Option<Value>> {
            let picks: Vec<Value> = Vec::new();
            let index = picks.len() + 3;
            Ok(Some(picks[index].clone()))
        }
    }

    struct Counting(AtomicUsize);

    impl ErrorObserver for Counting {
        fn on_error(&self, _error: &Error, _context: &ErrorContext, _classified: &ClassifiedError) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl ErrorObserver for Failing {
        fn on_error(&self, _error: &Error, _context: &ErrorContext, _classified: &ClassifiedError) -> Result<()> {
            Err(Error::new(ErrorKind::Database, "metrics store offline"))
        }
    }

    struct Panicking;

    impl ErrorObserver for Panicking {
        fn on_error(&self, _error: &Error, _context: &ErrorContext, _classified: &ClassifiedError) -> Result<()> {
            panic!("observer bug");
        }
    }

    fn handler_with(strategy: Arc<dyn FallbackStrategy>) -> ErrorHandler {
        let registry = Arc::new(FallbackRegistry::new());
        registry.register(strategy);
        ErrorHandler::new(registry)
    }

    #[tokio::test]
    async fn test_fallback_runs_once() {
        let strategy = Arc::new(Fixed {
            value: Some(json!({"cache_hit": false})),
            runs: AtomicUsize::new(0),
        });
        let handler = handler_with(strategy.clone());

        let response = handler
            .handle(
                &Error::cache("redis down"),
                ErrorContext::new("cache", "get"),
                Some(&FallbackRequest::new()),
                true,
            )
            .await;

        assert_eq!(response.error_code, "CACHE_ERROR");
        assert_eq!(response.severity, Severity::Low);
        assert_eq!(response.fallback_result, Some(json!({"cache_hit": false})));
        assert!(!response.suggestions.is_empty());
        assert_eq!(strategy.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_skipped_when_disabled_or_no_request() {
        let strategy = Arc::new(Fixed {
            value: Some(json!(1)),
            runs: AtomicUsize::new(0),
        });
        let handler = handler_with(strategy.clone());
        let error = Error::search("index offline");

        let disabled = handler
            .handle(&error, ErrorContext::new("search", "q"), Some(&FallbackRequest::new()), false)
            .await;
        let no_request = handler.handle(&error, ErrorContext::new("search", "q"), None, true).await;

        assert!(disabled.fallback_result.is_none());
        assert!(no_request.fallback_result.is_none());
        assert_eq!(strategy.runs.load(Ordering::SeqCst), 0);
        assert_eq!(handler.statistics().get("SEARCH_ERROR"), Some(&2));
    }

    #[tokio::test]
    async fn test_strategy_error_and_timeout_give_no_fallback() {
        let handler = handler_with(Arc::new(Raising));
        let response = handler
            .handle(
                &Error::reranking("oom"),
                ErrorContext::new("reranker", "rerank"),
                Some(&FallbackRequest::new()),
                true,
            )
            .await;
        assert!(response.fallback_result.is_none());

        let handler = handler_with(Arc::new(Stalled));
        let request = FallbackRequest::new().with_timeout(Duration::from_millis(20));
        let response = handler
            .handle(&Error::search("slow"), ErrorContext::new("search", "q"), Some(&request), true)
            .await;
        assert!(response.fallback_result.is_none());
    }

    #[tokio::test]
    async fn test_panicking_strategy_gives_no_fallback() {
        let handler = Arc::new(handler_with(Arc::new(Exploding)));

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .handle(
                        &Error::reranking("model crashed"),
                        ErrorContext::new("reranker", "rerank"),
                        Some(&FallbackRequest::new()),
                        true,
                    )
                    .await
            })
        };

        let response = task.await.unwrap();
        assert_eq!(response.error_code, "RERANKING_ERROR");
        assert!(response.fallback_result.is_none());
        assert_eq!(handler.statistics().get("RERANKING_ERROR"), Some(&1));
    }

    #[tokio::test]
    async fn test_observer_failures_are_isolated() {
        let handler = ErrorHandler::new(Arc::new(FallbackRegistry::new()));
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        handler.register_observer(Arc::new(Failing));
        handler.register_observer(Arc::new(Panicking));
        handler.register_observer(counting.clone());

        let response = handler
            .handle(
                &Error::new(ErrorKind::Unknown, "mystery"),
                ErrorContext::new("pipeline", "retrieve"),
                None,
                true,
            )
            .await;

        assert_eq!(response.error_code, "UNKNOWN_ERROR");
        assert_eq!(response.category, ErrorCategory::System);
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard() {
        let handler = handler_with(Arc::new(Fixed {
            value: Some(json!(["cached doc"])),
            runs: AtomicUsize::new(0),
        }));
        let request = FallbackRequest::new();

        let primary = handler
            .guard(async { Ok::<_, Error>(vec!["fresh doc".to_string()]) }, ErrorContext::new("search", "q"), Some(&request))
            .await;
        assert!(primary.is_primary());

        let degraded = handler
            .guard(
                async { Err::<Vec<String>, _>(Error::search("down")) },
                ErrorContext::new("search", "q"),
                Some(&request),
            )
            .await;
        assert!(degraded.is_fallback());
        assert_eq!(degraded.into_result().unwrap(), vec!["cached doc".to_string()]);

        let bare = ErrorHandler::new(Arc::new(FallbackRegistry::new()));
        let failed = bare
            .guard(
                async { Err::<u32, _>(Error::configuration("bad yaml")) },
                ErrorContext::new("config", "load"),
                None,
            )
            .await;
        match failed {
            FallbackResult::Failure(handled) => {
                assert_eq!(handled.response.error_code, "CONFIGURATION_ERROR");
                assert_eq!(handled.error.message, "bad yaml");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
