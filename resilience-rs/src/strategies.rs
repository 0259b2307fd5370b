//! Built-in fallback strategies for the retrieval pipeline.

use std::cmp::Ordering;
use std::collections::HashSet;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::context::ErrorContext;
use crate::fallback::{FallbackRequest, FallbackStrategy};
use crate::types::{Error, ErrorKind, Result, SearchMode};

/// Code raised when the reranker itself ran out of compute
pub const RERANKING_COMPUTE_ERROR: &str = "RERANKING_COMPUTE_ERROR";

const DEFAULT_TOP_K: usize = 10;

/// Hard-coded pipeline configuration used when the live one is unusable
pub static DEFAULT_PIPELINE_CONFIG: Lazy<Map<String, Value>> = Lazy::new(|| {
    let config = json!({
        "search_mode": "hybrid",
        "top_k": 10,
        "similarity_threshold": 0.7,
        "semantic_weight": 0.7,
        "keyword_weight": 0.3,
        "enable_reranking": true,
        "rerank_top_k": 5,
        "cache_enabled": true,
        "cache_ttl_seconds": 3600,
        "chunk_size": 1000,
        "chunk_overlap": 200,
        "embedding_model": "text-embedding-3-small"
    });
    match config {
        Value::Object(map) => map,
        _ => Map::new(),
    }
});

/// Degrades the search mode one step: hybrid or keyword fall back to
/// semantic, semantic has nothing left to try.
#[derive(Debug, Default)]
pub struct SearchModeFallback;

impl SearchModeFallback {
    fn failed_mode(request: &FallbackRequest, error: &Error, context: &ErrorContext) -> Option<SearchMode> {
        request
            .search_mode()
            .or_else(|| context.get_str("search_mode").and_then(SearchMode::parse))
            .or_else(|| {
                error
                    .context
                    .get("search_mode")
                    .and_then(Value::as_str)
                    .and_then(SearchMode::parse)
            })
    }
}

#[async_trait]
impl FallbackStrategy for SearchModeFallback {
    fn name(&self) -> &str {
        "search_mode_degradation"
    }

    fn is_applicable(&self, error: &Error, _context: &ErrorContext) -> bool {
        error.kind == ErrorKind::Search
    }

    async fn execute(
        &self,
        request: &FallbackRequest,
        error: &Error,
        context: &ErrorContext,
    ) -> Result<Option<Value>> {
        let failed = match Self::failed_mode(request, error, context) {
            Some(mode) => mode,
            None => {
                debug!("Search failure carries no search mode; nothing to degrade");
                return Ok(None);
            }
        };

        let degraded = match failed.degraded() {
            Some(mode) => mode,
            None => {
                debug!(mode = %failed, "Search mode has no cheaper alternative");
                return Ok(None);
            }
        };

        let (query, backend) = match (request.query(), request.search_backend()) {
            (Some(query), Some(backend)) => (query, backend),
            _ => {
                debug!("Search degradation needs both a query and a search backend");
                return Ok(None);
            }
        };

        let top_k = request.top_k().unwrap_or(DEFAULT_TOP_K);
        info!(from = %failed, to = %degraded, top_k, "Retrying search in degraded mode");

        let results = backend.search(query, degraded, top_k).await?;

        Ok(Some(json!({
            "results": results,
            "search_mode": degraded.as_str(),
            "degraded_from": failed.as_str(),
        })))
    }
}

/// Serves results without the reranker. Compute failures get a cheap
/// lexical-overlap ordering instead of the raw retrieval order.
#[derive(Debug, Default)]
pub struct RerankingFallback;

impl RerankingFallback {
    fn is_compute_failure(error: &Error) -> bool {
        error.error_code() == RERANKING_COMPUTE_ERROR
            || error.context.get("failure").and_then(Value::as_str) == Some("compute")
    }
}

#[async_trait]
impl FallbackStrategy for RerankingFallback {
    fn name(&self) -> &str {
        "reranking_bypass"
    }

    fn is_applicable(&self, error: &Error, _context: &ErrorContext) -> bool {
        error.kind == ErrorKind::Reranking
    }

    async fn execute(
        &self,
        request: &FallbackRequest,
        error: &Error,
        _context: &ErrorContext,
    ) -> Result<Option<Value>> {
        let original = match request.original_results() {
            Some(results) => results.clone(),
            None => return Ok(None),
        };

        let limit = request
            .get("rerank_top_k")
            .and_then(Value::as_u64)
            .map(|k| k as usize)
            .or_else(|| request.top_k());

        let (mut results, method) = match request.query() {
            Some(query) if Self::is_compute_failure(error) => {
                (lexical_overlap_rerank(query, original), "lexical_overlap")
            }
            _ => (original, "original_order"),
        };

        if let Some(limit) = limit {
            results.truncate(limit);
        }

        Ok(Some(json!({
            "results": results,
            "reranked": method == "lexical_overlap",
            "method": method,
        })))
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

fn document_text(document: &Value) -> String {
    match document {
        Value::String(text) => text.clone(),
        Value::Object(map) => ["content", "text", "page_content"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// Orders documents by the share of query terms they contain.
/// Ties keep their retrieval order.
pub fn lexical_overlap_rerank(query: &str, documents: Vec<Value>) -> Vec<Value> {
    let query_terms = tokenize(query);
    if query_terms.is_empty() {
        return documents;
    }

    let mut scored: Vec<(f64, Value)> = documents
        .into_iter()
        .map(|document| {
            let terms = tokenize(&document_text(&document));
            let overlap = query_terms.intersection(&terms).count();
            let score = overlap as f64 / query_terms.len() as f64;

            let document = match document {
                Value::Object(mut map) => {
                    map.insert("rerank_score".to_string(), json!(score));
                    Value::Object(map)
                }
                other => other,
            };
            (score, document)
        })
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    scored.into_iter().map(|(_, document)| document).collect()
}

/// Treats a failed cache read as a miss and a failed write as a no-op
#[derive(Debug, Default)]
pub struct CacheFallback;

#[async_trait]
impl FallbackStrategy for CacheFallback {
    fn name(&self) -> &str {
        "cache_bypass"
    }

    fn is_applicable(&self, error: &Error, _context: &ErrorContext) -> bool {
        error.kind == ErrorKind::Cache
    }

    async fn execute(
        &self,
        request: &FallbackRequest,
        _error: &Error,
        context: &ErrorContext,
    ) -> Result<Option<Value>> {
        let operation = request
            .get_str("cache_operation")
            .unwrap_or_else(|| context.operation())
            .to_ascii_lowercase();
        let key = request.get_str("cache_key");

        let outcome = match operation.as_str() {
            "get" | "read" | "fetch" => json!({
                "cache_hit": false,
                "bypassed": true,
                "cache_key": key,
            }),
            "set" | "put" | "write" | "store" => json!({
                "written": false,
                "bypassed": true,
                "cache_key": key,
            }),
            other => {
                debug!(operation = %other, "Cache operation has no bypass");
                return Ok(None);
            }
        };

        Ok(Some(outcome))
    }
}

/// Replaces an unusable configuration with defaults, or repairs a partial
/// one by keeping only known keys whose type matches the default.
#[derive(Debug, Default)]
pub struct ConfigurationFallback;

impl ConfigurationFallback {
    fn same_type(default: &Value, candidate: &Value) -> bool {
        match (default, candidate) {
            (Value::Number(d), Value::Number(c)) => d.is_f64() || !c.is_f64(),
            (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_)) => true,
            _ => false,
        }
    }

    /// Merges the valid subset of `candidate` over the defaults.
    /// Returns the repaired map and the rejected keys in sorted order.
    pub fn repair(candidate: &Map<String, Value>) -> (Map<String, Value>, Vec<String>) {
        let mut repaired = DEFAULT_PIPELINE_CONFIG.clone();
        let mut dropped = Vec::new();

        for (key, value) in candidate {
            match DEFAULT_PIPELINE_CONFIG.get(key) {
                Some(default) if Self::same_type(default, value) => {
                    repaired.insert(key.clone(), value.clone());
                }
                _ => dropped.push(key.clone()),
            }
        }

        dropped.sort();
        (repaired, dropped)
    }
}

#[async_trait]
impl FallbackStrategy for ConfigurationFallback {
    fn name(&self) -> &str {
        "configuration_recovery"
    }

    fn is_applicable(&self, error: &Error, _context: &ErrorContext) -> bool {
        error.kind == ErrorKind::Configuration
    }

    async fn execute(
        &self,
        request: &FallbackRequest,
        _error: &Error,
        _context: &ErrorContext,
    ) -> Result<Option<Value>> {
        let recovered = match request.config() {
            Some(candidate) => {
                let (config, dropped) = Self::repair(candidate);
                if !dropped.is_empty() {
                    info!(dropped = ?dropped, "Dropped invalid configuration keys");
                }
                json!({ "config": config, "source": "repaired", "dropped_keys": dropped })
            }
            None => json!({
                "config": DEFAULT_PIPELINE_CONFIG.clone(),
                "source": "default",
                "dropped_keys": [],
            }),
        };

        Ok(Some(recovered))
    }
}
