//! Recovery attempt limiter
//!
//! Bounds how many times callers may automatically retry a failing
//! operation, keyed by (error code, component, operation).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use metrics::counter;
use tracing::{debug, warn};

use crate::context::ErrorContext;
use crate::sync::lock;

/// Default ceiling on recovery attempts per key
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecoveryKey {
    error_code: String,
    component: String,
    operation: String,
}

impl RecoveryKey {
    fn new(error_code: &str, context: &ErrorContext) -> Self {
        Self {
            error_code: error_code.to_string(),
            component: context.component().to_string(),
            operation: context.operation().to_string(),
        }
    }
}

/// Process-wide bounded counters with explicit reset
#[derive(Debug)]
pub struct RecoveryLimiter {
    max_attempts: AtomicU32,
    attempts: Mutex<HashMap<RecoveryKey, u32>>,
}

impl RecoveryLimiter {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: AtomicU32::new(max_attempts),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes one attempt for the key if any remain.
    ///
    /// The check and the increment happen under one lock, so concurrent
    /// callers on the same key never exceed the ceiling.
    pub fn should_attempt_recovery(&self, error_code: &str, context: &ErrorContext) -> bool {
        let max = self.max_attempts.load(Ordering::SeqCst);
        let key = RecoveryKey::new(error_code, context);

        let mut attempts = lock(&self.attempts);
        let used = attempts.entry(key).or_insert(0);

        if *used >= max {
            counter!("resilience.recovery.denied", 1);
            warn!(
                error_code = %error_code,
                component = %context.component(),
                operation = %context.operation(),
                max_attempts = max,
                "Recovery attempts exhausted"
            );
            return false;
        }

        *used += 1;
        debug!(
            error_code = %error_code,
            component = %context.component(),
            operation = %context.operation(),
            attempt = *used,
            max_attempts = max,
            "Recovery attempt granted"
        );
        true
    }

    /// Clears the counter for one key
    pub fn reset_recovery_attempts(&self, error_code: &str, context: &ErrorContext) {
        let key = RecoveryKey::new(error_code, context);
        lock(&self.attempts).remove(&key);
    }

    /// Attempts consumed so far for a key
    pub fn attempts(&self, error_code: &str, context: &ErrorContext) -> u32 {
        let key = RecoveryKey::new(error_code, context);
        lock(&self.attempts).get(&key).copied().unwrap_or(0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.load(Ordering::SeqCst)
    }

    /// Changes the ceiling; existing counters are kept
    pub fn set_max_attempts(&self, max_attempts: u32) {
        self.max_attempts.store(max_attempts, Ordering::SeqCst);
    }

    pub fn reset_all(&self) {
        lock(&self.attempts).clear();
    }
}

impl Default for RecoveryLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECOVERY_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ceiling_and_reset() {
        let limiter = RecoveryLimiter::new(3);
        let ctx = ErrorContext::new("search", "hybrid_search");

        assert!(limiter.should_attempt_recovery("SEARCH_ERROR", &ctx));
        assert!(limiter.should_attempt_recovery("SEARCH_ERROR", &ctx));
        assert!(limiter.should_attempt_recovery("SEARCH_ERROR", &ctx));
        assert!(!limiter.should_attempt_recovery("SEARCH_ERROR", &ctx));
        assert!(!limiter.should_attempt_recovery("SEARCH_ERROR", &ctx));
        assert_eq!(limiter.attempts("SEARCH_ERROR", &ctx), 3);

        limiter.reset_recovery_attempts("SEARCH_ERROR", &ctx);
        for _ in 0..3 {
            assert!(limiter.should_attempt_recovery("SEARCH_ERROR", &ctx));
        }
        assert!(!limiter.should_attempt_recovery("SEARCH_ERROR", &ctx));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RecoveryLimiter::new(1);
        let search = ErrorContext::new("search", "query");
        let rerank = ErrorContext::new("reranker", "query");

        assert!(limiter.should_attempt_recovery("TIMEOUT_ERROR", &search));
        assert!(!limiter.should_attempt_recovery("TIMEOUT_ERROR", &search));
        assert!(limiter.should_attempt_recovery("TIMEOUT_ERROR", &rerank));
        assert!(limiter.should_attempt_recovery("SEARCH_ERROR", &search));
    }

    #[test]
    fn test_concurrent_increments_respect_ceiling() {
        let limiter = Arc::new(RecoveryLimiter::new(10));
        let ctx = ErrorContext::new("cache", "get");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    (0..5)
                        .filter(|_| limiter.should_attempt_recovery("CACHE_ERROR", &ctx))
                        .count()
                })
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 10);
        assert_eq!(limiter.attempts("CACHE_ERROR", &ctx), 10);
    }
}
