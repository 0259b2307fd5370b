//! # Performance Monitoring
//!
//! Companion aggregator for retrieval latency and outcomes: response time
//! percentiles, cache hit rate, reranking success, search-mode usage, a
//! derived stability score, and a log of raw exception occurrences.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::context::{ClassifiedError, ErrorContext};
use crate::handler::ErrorObserver;
use crate::sanitization::{redact_context, sanitize_message};
use crate::sync::lock;
use crate::types::{Error, Result, SearchMode};

/// Below this many samples p95 and p99 collapse to the maximum
const MIN_PERCENTILE_SAMPLES: usize = 20;
/// Stability points lost per percentage point of failed operations
const STABILITY_PENALTY: f64 = 5.0;
const REPORTED_EXCEPTIONS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Search,
    CacheRead,
    CacheWrite,
    Reranking,
    FullRetrieval,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Search => "search",
            OperationType::CacheRead => "cache_read",
            OperationType::CacheWrite => "cache_write",
            OperationType::Reranking => "reranking",
            OperationType::FullRetrieval => "full_retrieval",
        };
        f.write_str(name)
    }
}

/// Opaque handle returned by [`PerformanceMonitor::start_operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationHandle(Uuid);

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One timed operation; open until completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub query_id: String,
    pub operation: OperationType,
    pub search_mode: Option<SearchMode>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    pub success: bool,
    pub result_count: usize,
    pub metadata: Map<String, Value>,
    pub error_details: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct CacheEvent {
    timestamp: DateTime<Utc>,
    hit: bool,
    duration_ms: f64,
}

#[derive(Debug, Clone, Copy)]
struct RerankEvent {
    timestamp: DateTime<Utc>,
    success: bool,
    duration_ms: f64,
    documents: usize,
}

#[derive(Debug, Clone, Copy)]
struct ModeEvent {
    timestamp: DateTime<Utc>,
    mode: SearchMode,
    duration_ms: f64,
    success: bool,
}

/// A retained exception occurrence with secrets redacted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub timestamp: DateTime<Utc>,
    pub exception_type: String,
    pub error_code: String,
    pub message: String,
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone)]
struct ExceptionEvent {
    timestamp: DateTime<Utc>,
    exception_type: String,
}

#[derive(Debug, Default)]
struct ExceptionLog {
    events: VecDeque<ExceptionEvent>,
    lifetime_by_type: HashMap<String, u64>,
    recent: VecDeque<ExceptionRecord>,
}

/// Latency distribution of successful operations, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimeStats {
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl ResponseTimeStats {
    /// Nearest-rank statistics over the given samples
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(|a, b| a.total_cmp(b));

        let count = samples.len();
        let max_ms = samples[count - 1];
        let median_ms = if count % 2 == 1 {
            samples[count / 2]
        } else {
            (samples[count / 2 - 1] + samples[count / 2]) / 2.0
        };
        let (p95_ms, p99_ms) = if count < MIN_PERCENTILE_SAMPLES {
            (max_ms, max_ms)
        } else {
            (nearest_rank(&samples, 95.0), nearest_rank(&samples, 99.0))
        };

        Self {
            count,
            mean_ms: samples.iter().sum::<f64>() / count as f64,
            median_ms,
            p95_ms,
            p99_ms,
            min_ms: samples[0],
            max_ms,
        }
    }
}

/// Value at rank `ceil(p/100 * n)` of an ascending, non-empty sample
pub fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankingStats {
    pub total: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub avg_documents: f64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeStats {
    pub count: u64,
    pub avg_duration_ms: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionSummary {
    /// Exceptions inside the report window
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    /// Newest first, inside the report window
    pub recent: Vec<ExceptionRecord>,
    /// Every exception logged since startup, regardless of window
    pub lifetime_by_type: BTreeMap<String, u64>,
}

/// Snapshot of every performance aggregate over a trailing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub time_range_minutes: u64,
    pub total_operations: u64,
    pub failed_operations: u64,
    /// Failed operations as a percentage of completed ones
    pub error_rate: f64,
    pub stability_score: f64,
    pub response_time: ResponseTimeStats,
    pub cache: CacheStats,
    pub reranking: RerankingStats,
    pub search_modes: BTreeMap<String, ModeStats>,
    pub exceptions: ExceptionSummary,
    pub active_operations: usize,
}

/// Stability in [0, 100] from the percentage of failed operations
pub fn stability_score(error_rate_percent: f64) -> f64 {
    (100.0 - STABILITY_PENALTY * error_rate_percent).clamp(0.0, 100.0)
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn mean<I: Iterator<Item = f64>>(values: I) -> f64 {
    let (sum, count) = values.fold((0.0, 0u64), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(item);
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let elapsed = end - start;
    match elapsed.num_microseconds() {
        Some(micros) => micros as f64 / 1000.0,
        None => elapsed.num_milliseconds() as f64,
    }
}

/// History capacities for the performance monitor
#[derive(Debug, Clone, Copy)]
pub struct PerformanceCapacity {
    pub response_samples: usize,
    pub completed_operations: usize,
    pub events: usize,
    pub recent_exceptions: usize,
}

impl Default for PerformanceCapacity {
    fn default() -> Self {
        Self {
            response_samples: 1_000,
            completed_operations: 10_000,
            events: 10_000,
            recent_exceptions: 100,
        }
    }
}

/// Performance aggregator
pub struct PerformanceMonitor {
    clock: Arc<dyn Clock>,
    capacity: PerformanceCapacity,
    active: Mutex<HashMap<OperationHandle, PerformanceMetric>>,
    completed: Mutex<VecDeque<PerformanceMetric>>,
    response_times: Mutex<VecDeque<(DateTime<Utc>, f64)>>,
    cache_events: Mutex<VecDeque<CacheEvent>>,
    rerank_events: Mutex<VecDeque<RerankEvent>>,
    mode_events: Mutex<VecDeque<ModeEvent>>,
    exceptions: Mutex<ExceptionLog>,
}

impl PerformanceMonitor {
    pub fn new(clock: Arc<dyn Clock>, capacity: PerformanceCapacity) -> Self {
        Self {
            clock,
            capacity,
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            response_times: Mutex::new(VecDeque::new()),
            cache_events: Mutex::new(VecDeque::new()),
            rerank_events: Mutex::new(VecDeque::new()),
            mode_events: Mutex::new(VecDeque::new()),
            exceptions: Mutex::new(ExceptionLog::default()),
        }
    }

    /// Opens a timed operation
    pub fn start_operation<S: Into<String>>(
        &self,
        query_id: S,
        operation: OperationType,
        search_mode: Option<SearchMode>,
        metadata: Option<Map<String, Value>>,
    ) -> OperationHandle {
        let handle = OperationHandle(Uuid::new_v4());
        let metric = PerformanceMetric {
            query_id: query_id.into(),
            operation,
            search_mode,
            start_time: self.clock.now(),
            end_time: None,
            duration_ms: None,
            success: false,
            result_count: 0,
            metadata: metadata.unwrap_or_default(),
            error_details: None,
        };

        lock(&self.active).insert(handle, metric);
        handle
    }

    /// Closes an operation. Unknown or already completed handles are
    /// ignored with a warning.
    pub fn complete_operation(
        &self,
        handle: OperationHandle,
        success: bool,
        result_count: usize,
        error_details: Option<String>,
    ) -> Option<PerformanceMetric> {
        let mut metric = match lock(&self.active).remove(&handle) {
            Some(metric) => metric,
            None => {
                warn!(handle = %handle, "Completed an operation that was never started");
                return None;
            }
        };

        let end = self.clock.now();
        let duration_ms = elapsed_ms(metric.start_time, end);
        metric.end_time = Some(end);
        metric.duration_ms = Some(duration_ms);
        metric.success = success;
        metric.result_count = result_count;
        metric.error_details = error_details.map(|details| sanitize_message(&details));

        histogram!("resilience.operation.duration_ms", duration_ms);
        counter!(format!("resilience.operation.{}.{}", metric.operation, if success { "success" } else { "failure" }), 1);

        if success {
            push_bounded(&mut lock(&self.response_times), (end, duration_ms), self.capacity.response_samples);
        }
        if let Some(mode) = metric.search_mode {
            push_bounded(
                &mut lock(&self.mode_events),
                ModeEvent {
                    timestamp: end,
                    mode,
                    duration_ms,
                    success,
                },
                self.capacity.events,
            );
        }
        push_bounded(&mut lock(&self.completed), metric.clone(), self.capacity.completed_operations);

        debug!(
            query_id = %metric.query_id,
            operation = %metric.operation,
            duration_ms,
            success,
            "Operation completed"
        );
        Some(metric)
    }

    pub fn active_operations(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn record_cache_operation(&self, hit: bool, duration_ms: f64) {
        let key = if hit { "resilience.cache.hit" } else { "resilience.cache.miss" };
        counter!(key, 1);
        let event = CacheEvent {
            timestamp: self.clock.now(),
            hit,
            duration_ms,
        };
        push_bounded(&mut lock(&self.cache_events), event, self.capacity.events);
    }

    pub fn record_reranking_operation(&self, success: bool, duration_ms: f64, document_count: usize) {
        histogram!("resilience.reranking.duration_ms", duration_ms);
        let event = RerankEvent {
            timestamp: self.clock.now(),
            success,
            duration_ms,
            documents: document_count,
        };
        push_bounded(&mut lock(&self.rerank_events), event, self.capacity.events);
    }

    pub fn record_search_mode_usage(&self, mode: SearchMode, duration_ms: f64, success: bool) {
        counter!(format!("resilience.search_mode.{}", mode), 1);
        let event = ModeEvent {
            timestamp: self.clock.now(),
            mode,
            duration_ms,
            success,
        };
        push_bounded(&mut lock(&self.mode_events), event, self.capacity.events);
    }

    /// Counts the exception by type and keeps a redacted copy
    pub fn log_exception(&self, error: &Error, context: &Map<String, Value>) {
        let record = ExceptionRecord {
            timestamp: self.clock.now(),
            exception_type: error.type_name().to_string(),
            error_code: error.error_code().to_string(),
            message: sanitize_message(&error.message),
            context: redact_context(context),
        };

        let event = ExceptionEvent {
            timestamp: record.timestamp,
            exception_type: record.exception_type.clone(),
        };

        let mut log = lock(&self.exceptions);
        *log.lifetime_by_type.entry(record.exception_type.clone()).or_insert(0) += 1;
        push_bounded(&mut log.events, event, self.capacity.events);
        push_bounded(&mut log.recent, record, self.capacity.recent_exceptions);
    }

    /// Composes every aggregate over the trailing window
    pub fn get_report(&self, time_range_minutes: u64) -> PerformanceReport {
        let now = self.clock.now();
        let window = Duration::minutes(time_range_minutes as i64);
        let in_window = |at: DateTime<Utc>| now - at <= window;

        let response_time = {
            let samples = lock(&self.response_times)
                .iter()
                .filter(|(at, _)| in_window(*at))
                .map(|(_, duration)| *duration)
                .collect();
            ResponseTimeStats::from_samples(samples)
        };

        let (total_operations, failed_operations) = {
            let completed = lock(&self.completed);
            completed
                .iter()
                .filter(|metric| metric.end_time.map_or(false, |end| in_window(end)))
                .fold((0u64, 0u64), |(total, failed), metric| {
                    (total + 1, failed + u64::from(!metric.success))
                })
        };
        let error_rate = ratio(failed_operations * 100, total_operations);

        let cache = {
            let events = lock(&self.cache_events);
            let recent: Vec<&CacheEvent> = events.iter().filter(|e| in_window(e.timestamp)).collect();
            let hits = recent.iter().filter(|e| e.hit).count() as u64;
            let total = recent.len() as u64;
            CacheStats {
                hits,
                misses: total - hits,
                hit_rate: ratio(hits, total),
                avg_duration_ms: mean(recent.iter().map(|e| e.duration_ms)),
            }
        };

        let reranking = {
            let events = lock(&self.rerank_events);
            let recent: Vec<&RerankEvent> = events.iter().filter(|e| in_window(e.timestamp)).collect();
            let successes = recent.iter().filter(|e| e.success).count() as u64;
            let total = recent.len() as u64;
            RerankingStats {
                total,
                successes,
                success_rate: ratio(successes, total),
                avg_documents: mean(recent.iter().map(|e| e.documents as f64)),
                avg_duration_ms: mean(recent.iter().map(|e| e.duration_ms)),
            }
        };

        let search_modes = {
            let events = lock(&self.mode_events);
            let mut grouped: BTreeMap<String, Vec<&ModeEvent>> = BTreeMap::new();
            for event in events.iter().filter(|e| in_window(e.timestamp)) {
                grouped.entry(event.mode.to_string()).or_default().push(event);
            }
            grouped
                .into_iter()
                .map(|(mode, events)| {
                    let count = events.len() as u64;
                    let successes = events.iter().filter(|e| e.success).count() as u64;
                    let stats = ModeStats {
                        count,
                        avg_duration_ms: mean(events.iter().map(|e| e.duration_ms)),
                        success_rate: ratio(successes, count),
                    };
                    (mode, stats)
                })
                .collect()
        };

        let exceptions = {
            let log = lock(&self.exceptions);
            let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
            for event in log.events.iter().filter(|e| in_window(e.timestamp)) {
                *by_type.entry(event.exception_type.clone()).or_insert(0) += 1;
            }
            ExceptionSummary {
                total: by_type.values().sum(),
                by_type,
                recent: log
                    .recent
                    .iter()
                    .rev()
                    .filter(|record| in_window(record.timestamp))
                    .take(REPORTED_EXCEPTIONS)
                    .cloned()
                    .collect(),
                lifetime_by_type: log
                    .lifetime_by_type
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect(),
            }
        };

        let stability = stability_score(error_rate);
        gauge!("resilience.stability_score", stability);

        PerformanceReport {
            time_range_minutes,
            total_operations,
            failed_operations,
            error_rate,
            stability_score: stability,
            response_time,
            cache,
            reranking,
            search_modes,
            exceptions,
            active_operations: self.active_operations(),
        }
    }
}

impl ErrorObserver for PerformanceMonitor {
    fn on_error(&self, error: &Error, context: &ErrorContext, classified: &ClassifiedError) -> Result<()> {
        let mut details = context.additional().clone();
        details.insert("component".to_string(), Value::from(context.component()));
        details.insert("operation".to_string(), Value::from(context.operation()));
        details.insert("severity".to_string(), Value::from(classified.severity.as_str()));
        self.log_exception(error, &details);
        Ok(())
    }
}

impl fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("capacity", &self.capacity)
            .field("active_operations", &self.active_operations())
            .finish()
    }
}
