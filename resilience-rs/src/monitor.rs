//! # Error Monitoring and Alerting
//!
//! Ingests classified failures as time-stamped metrics, keeps rolling
//! aggregates, evaluates rate, accumulation and repetition rules after every
//! record, and dispatches deduplicated alerts to registered handlers.
//!
//! Each logical structure sits behind its own lock so unrelated requests do
//! not serialize on one another. Handler delivery is spawned per handler and
//! never runs on the recording path.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::context::{ClassifiedError, ErrorContext};
use crate::handler::ErrorObserver;
use crate::sync::{lock, read, write};
use crate::types::{ConfigError, Error, ErrorCategory, Result, Severity};

/// Alert code for a trailing error rate above the warning threshold
pub const ELEVATED_ERROR_RATE: &str = "ELEVATED_ERROR_RATE";
/// Alert code for a trailing error rate above the critical threshold
pub const CRITICAL_ERROR_RATE: &str = "CRITICAL_ERROR_RATE";
/// Alert code for accumulated CRITICAL-severity failures
pub const CRITICAL_ERROR_ACCUMULATION: &str = "CRITICAL_ERROR_ACCUMULATION";
/// Alert code for a component exceeding its error budget
pub const COMPONENT_ERROR_THRESHOLD: &str = "COMPONENT_ERROR_THRESHOLD";

const RATE_WINDOW_SECS: i64 = 60;

/// Urgency of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Error => "ERROR",
            AlertLevel::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// A fired threshold or pattern rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub component: String,
    pub error_code: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl Alert {
    fn same_signature(&self, other: &Alert) -> bool {
        self.error_code == other.error_code
            && self.component == other.component
            && self.level == other.level
    }
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetric {
    pub error_code: String,
    pub message: String,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub component: String,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Rule families that carry warning/critical thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    /// Errors in the trailing minute
    ErrorRate,
    /// CRITICAL-severity errors in the accumulation window
    CriticalErrors,
    /// Errors for one component in the accumulation window
    ComponentErrors,
    /// Repeats of one (code, component) pair in the pattern window
    Pattern,
}

impl fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThresholdKind::ErrorRate => "error_rate",
            ThresholdKind::CriticalErrors => "critical_errors",
            ThresholdKind::ComponentErrors => "component_errors",
            ThresholdKind::Pattern => "pattern",
        };
        f.write_str(name)
    }
}

/// Warning and critical trip points for one rule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl LevelThresholds {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    fn level_for(&self, observed: f64) -> Option<(AlertLevel, f64)> {
        if observed >= self.critical {
            Some((AlertLevel::Critical, self.critical))
        } else if observed >= self.warning {
            Some((AlertLevel::Warning, self.warning))
        } else {
            None
        }
    }
}

/// Runtime-settable alert rule configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub error_rate: LevelThresholds,
    pub critical_errors: LevelThresholds,
    pub component_errors: LevelThresholds,
    pub pattern: LevelThresholds,
    pub pattern_window_minutes: i64,
    pub accumulation_window_minutes: i64,
    pub dedup_window_minutes: i64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: LevelThresholds::new(10.0, 50.0),
            critical_errors: LevelThresholds::new(1.0, 5.0),
            component_errors: LevelThresholds::new(20.0, 100.0),
            pattern: LevelThresholds::new(3.0, 10.0),
            pattern_window_minutes: 5,
            accumulation_window_minutes: 60,
            dedup_window_minutes: 5,
        }
    }
}

impl AlertThresholds {
    fn for_kind_mut(&mut self, kind: ThresholdKind) -> &mut LevelThresholds {
        match kind {
            ThresholdKind::ErrorRate => &mut self.error_rate,
            ThresholdKind::CriticalErrors => &mut self.critical_errors,
            ThresholdKind::ComponentErrors => &mut self.component_errors,
            ThresholdKind::Pattern => &mut self.pattern,
        }
    }
}

/// Aggregate view over recorded failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    /// `None` for the live running aggregate
    pub time_range_minutes: Option<u64>,
    pub total_errors: u64,
    /// Errors in the 60 seconds before the query
    pub error_rate_per_minute: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub by_category: BTreeMap<String, u64>,
    pub by_component: BTreeMap<String, u64>,
    pub by_code: BTreeMap<String, u64>,
    pub resolved_errors: u64,
    pub avg_resolution_time_secs: Option<f64>,
    /// Most frequent codes, highest count first
    pub top_errors: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Default)]
struct RunningStats {
    total: u64,
    by_severity: BTreeMap<String, u64>,
    by_category: BTreeMap<String, u64>,
    by_component: BTreeMap<String, u64>,
    by_code: BTreeMap<String, u64>,
    resolved: u64,
    avg_resolution_time_secs: Option<f64>,
}

impl RunningStats {
    fn add(&mut self, metric: &ErrorMetric) {
        self.total += 1;
        *self.by_severity.entry(metric.severity.to_string()).or_insert(0) += 1;
        *self.by_category.entry(metric.category.to_string()).or_insert(0) += 1;
        *self.by_component.entry(metric.component.clone()).or_insert(0) += 1;
        *self.by_code.entry(metric.error_code.clone()).or_insert(0) += 1;
        if metric.resolved {
            self.resolved += 1;
        }
    }

    fn into_statistics(self, time_range_minutes: Option<u64>, error_rate_per_minute: u64) -> ErrorStatistics {
        let mut top_errors: Vec<(String, u64)> =
            self.by_code.iter().map(|(code, count)| (code.clone(), *count)).collect();
        top_errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_errors.truncate(10);

        ErrorStatistics {
            time_range_minutes,
            total_errors: self.total,
            error_rate_per_minute,
            by_severity: self.by_severity,
            by_category: self.by_category,
            by_component: self.by_component,
            by_code: self.by_code,
            resolved_errors: self.resolved,
            avg_resolution_time_secs: self.avg_resolution_time_secs,
            top_errors,
        }
    }
}

fn mean_resolution_secs<'a, I>(metrics: I) -> Option<f64>
where
    I: Iterator<Item = &'a ErrorMetric>,
{
    let (sum, count) = metrics
        .filter_map(|metric| metric.resolved_at.map(|at| at - metric.timestamp))
        .fold((0.0, 0u64), |(sum, count), elapsed| {
            (sum + elapsed.num_milliseconds() as f64 / 1000.0, count + 1)
        });

    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Asynchronous alert receiver (e.g. one that posts to a pager)
#[async_trait]
pub trait AlertHandler: Send + Sync {
    async fn handle(&self, alert: &Alert) -> Result<()>;
}

type SyncAlertFn = dyn Fn(&Alert) -> Result<()> + Send + Sync;

#[derive(Clone)]
enum HandlerSlot {
    Sync(Arc<SyncAlertFn>),
    Async(Arc<dyn AlertHandler>),
}

impl HandlerSlot {
    async fn deliver(self, alert: Alert) {
        let result = match self {
            HandlerSlot::Sync(handler) => handler(&alert),
            HandlerSlot::Async(handler) => handler.handle(&alert).await,
        };
        if let Err(err) = result {
            error!(alert_id = %alert.id, alert = %alert.title, error = %err, "Alert handler failed");
        }
    }
}

/// Log sink used as the default alert handler
pub fn log_alert(alert: &Alert) -> Result<()> {
    match alert.level {
        AlertLevel::Info => info!(
            alert = true, level = %alert.level, component = %alert.component,
            error_code = %alert.error_code, metadata = ?alert.metadata,
            "{}: {}", alert.title, alert.message
        ),
        AlertLevel::Warning => warn!(
            alert = true, level = %alert.level, component = %alert.component,
            error_code = %alert.error_code, metadata = ?alert.metadata,
            "{}: {}", alert.title, alert.message
        ),
        AlertLevel::Error | AlertLevel::Critical => error!(
            alert = true, level = %alert.level, component = %alert.component,
            error_code = %alert.error_code, metadata = ?alert.metadata,
            "{}: {}", alert.title, alert.message
        ),
    }
    Ok(())
}

/// History capacities for the monitor
#[derive(Debug, Clone, Copy)]
pub struct MonitorCapacity {
    pub metrics: usize,
    pub alerts: usize,
}

impl Default for MonitorCapacity {
    fn default() -> Self {
        Self {
            metrics: 10_000,
            alerts: 1_000,
        }
    }
}

/// Counts inside the trailing windows at record time
struct WindowCounts {
    rate: u64,
    critical: u64,
    component: u64,
}

/// Timestamps still inside the rate and accumulation windows.
///
/// Each deque only holds entries younger than its window, so evaluating the
/// rules costs the number of recent errors rather than the metric history.
#[derive(Debug, Default)]
struct RecentWindows {
    rate: VecDeque<DateTime<Utc>>,
    critical: VecDeque<DateTime<Utc>>,
    by_component: HashMap<String, VecDeque<DateTime<Utc>>>,
}

fn slide(window: &mut VecDeque<DateTime<Utc>>, at: Option<DateTime<Utc>>, now: DateTime<Utc>, span: Duration, cap: usize) -> u64 {
    if let Some(at) = at {
        if cap > 0 {
            while window.len() >= cap {
                window.pop_front();
            }
            window.push_back(at);
        }
    }
    window.retain(|seen| now - *seen <= span);
    window.len() as u64
}

impl RecentWindows {
    fn observe(&mut self, metric: &ErrorMetric, now: DateTime<Utc>, accumulation: Duration, cap: usize) -> WindowCounts {
        let rate = slide(&mut self.rate, Some(metric.timestamp), now, Duration::seconds(RATE_WINDOW_SECS), cap);
        let critical_at = (metric.severity == Severity::Critical).then_some(metric.timestamp);
        let critical = slide(&mut self.critical, critical_at, now, accumulation, cap);
        let component = slide(
            self.by_component.entry(metric.component.clone()).or_default(),
            Some(metric.timestamp),
            now,
            accumulation,
            cap,
        );
        WindowCounts {
            rate,
            critical,
            component,
        }
    }

    fn rate_at(&self, now: DateTime<Utc>) -> u64 {
        self.rate
            .iter()
            .filter(|at| now - **at <= Duration::seconds(RATE_WINDOW_SECS))
            .count() as u64
    }

    fn purge(&mut self, cutoff: DateTime<Utc>) {
        self.rate.retain(|at| *at >= cutoff);
        self.critical.retain(|at| *at >= cutoff);
        for window in self.by_component.values_mut() {
            window.retain(|at| *at >= cutoff);
        }
        self.by_component.retain(|_, window| !window.is_empty());
    }
}

/// Error monitor with threshold and pattern alerting
pub struct ErrorMonitor {
    clock: Arc<dyn Clock>,
    capacity: MonitorCapacity,
    metrics: Mutex<VecDeque<ErrorMetric>>,
    windows: Mutex<RecentWindows>,
    running: RwLock<RunningStats>,
    patterns: Mutex<HashMap<(String, String), VecDeque<DateTime<Utc>>>>,
    alerts: RwLock<VecDeque<Alert>>,
    handlers: RwLock<Vec<HandlerSlot>>,
    thresholds: RwLock<AlertThresholds>,
    dispatches: Mutex<JoinSet<()>>,
}

impl ErrorMonitor {
    pub fn new(clock: Arc<dyn Clock>, thresholds: AlertThresholds, capacity: MonitorCapacity) -> Self {
        Self {
            clock,
            capacity,
            metrics: Mutex::new(VecDeque::with_capacity(capacity.metrics.min(1024))),
            windows: Mutex::new(RecentWindows::default()),
            running: RwLock::new(RunningStats::default()),
            patterns: Mutex::new(HashMap::new()),
            alerts: RwLock::new(VecDeque::with_capacity(capacity.alerts.min(1024))),
            handlers: RwLock::new(Vec::new()),
            thresholds: RwLock::new(thresholds),
            dispatches: Mutex::new(JoinSet::new()),
        }
    }

    /// Records one classified failure and evaluates alert rules
    pub fn record(&self, _error: &Error, context: &ErrorContext, classified: &ClassifiedError) {
        let metric = ErrorMetric {
            error_code: classified.code.clone(),
            message: classified.message.clone(),
            severity: classified.severity,
            category: classified.category,
            component: context.component().to_string(),
            operation: context.operation().to_string(),
            timestamp: context.timestamp(),
            resolved: false,
            resolved_at: None,
        };

        let thresholds = read(&self.thresholds).clone();
        let now = self.clock.now();

        {
            let mut metrics = lock(&self.metrics);
            if self.capacity.metrics > 0 {
                while metrics.len() >= self.capacity.metrics {
                    metrics.pop_front();
                }
                metrics.push_back(metric.clone());
            }
        }

        let counts = lock(&self.windows).observe(
            &metric,
            now,
            Duration::minutes(thresholds.accumulation_window_minutes),
            self.capacity.metrics,
        );

        write(&self.running).add(&metric);

        let repeats = self.track_pattern(&metric, now, thresholds.pattern_window_minutes);

        counter!("resilience.errors.total", 1);
        counter!(format!("resilience.errors.code.{}", metric.error_code), 1);
        gauge!("resilience.errors.rate_per_minute", counts.rate as f64);

        debug!(
            error_code = %metric.error_code,
            component = %metric.component,
            error_rate = counts.rate,
            repeats,
            "Recorded error metric"
        );

        for alert in self.evaluate_rules(&metric, &counts, repeats, &thresholds, now) {
            if self.admit_alert(&alert, thresholds.dedup_window_minutes) {
                self.dispatch(alert);
            }
        }
    }

    fn track_pattern(&self, metric: &ErrorMetric, now: DateTime<Utc>, window_minutes: i64) -> u64 {
        let window = Duration::minutes(window_minutes);
        let key = (metric.error_code.clone(), metric.component.clone());

        let mut patterns = lock(&self.patterns);
        let occurrences = patterns.entry(key).or_default();
        occurrences.push_back(metric.timestamp);
        occurrences.retain(|at| now - *at <= window);
        occurrences.len() as u64
    }

    fn evaluate_rules(
        &self,
        metric: &ErrorMetric,
        counts: &WindowCounts,
        repeats: u64,
        thresholds: &AlertThresholds,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let mut fired = Vec::new();
        let build = |level: AlertLevel, code: &str, title: &str, message: String, rule: ThresholdKind, observed: u64, threshold: f64| {
            let mut metadata = Map::new();
            metadata.insert("rule".to_string(), json!(rule.to_string()));
            metadata.insert("observed".to_string(), json!(observed));
            metadata.insert("threshold".to_string(), json!(threshold));
            metadata.insert("trigger_code".to_string(), json!(metric.error_code));
            metadata.insert("operation".to_string(), json!(metric.operation));
            Alert {
                id: Uuid::new_v4(),
                level,
                title: title.to_string(),
                message,
                component: metric.component.clone(),
                error_code: code.to_string(),
                timestamp: now,
                metadata,
            }
        };

        if let Some((level, threshold)) = thresholds.error_rate.level_for(counts.rate as f64) {
            let code = if level == AlertLevel::Critical {
                CRITICAL_ERROR_RATE
            } else {
                ELEVATED_ERROR_RATE
            };
            fired.push(build(
                level,
                code,
                "Elevated error rate",
                format!("{} errors in the last minute (threshold {})", counts.rate, threshold),
                ThresholdKind::ErrorRate,
                counts.rate,
                threshold,
            ));
        }

        if metric.severity == Severity::Critical {
            if let Some((level, threshold)) = thresholds.critical_errors.level_for(counts.critical as f64) {
                fired.push(build(
                    level,
                    CRITICAL_ERROR_ACCUMULATION,
                    "Critical errors accumulating",
                    format!(
                        "{} critical errors in the last {} minutes",
                        counts.critical, thresholds.accumulation_window_minutes
                    ),
                    ThresholdKind::CriticalErrors,
                    counts.critical,
                    threshold,
                ));
            }
        }

        if let Some((level, threshold)) = thresholds.component_errors.level_for(counts.component as f64) {
            fired.push(build(
                level,
                COMPONENT_ERROR_THRESHOLD,
                "Component error threshold exceeded",
                format!(
                    "{} has {} errors in the last {} minutes",
                    metric.component, counts.component, thresholds.accumulation_window_minutes
                ),
                ThresholdKind::ComponentErrors,
                counts.component,
                threshold,
            ));
        }

        if let Some((level, threshold)) = thresholds.pattern.level_for(repeats as f64) {
            let mut alert = build(
                level,
                metric.error_code.as_str(),
                "Recurring error pattern",
                format!(
                    "{} occurred {} times in {} within {} minutes",
                    metric.error_code, repeats, metric.component, thresholds.pattern_window_minutes
                ),
                ThresholdKind::Pattern,
                repeats,
                threshold,
            );
            alert
                .metadata
                .insert("window_minutes".to_string(), json!(thresholds.pattern_window_minutes));
            fired.push(alert);
        }

        fired
    }

    /// Inserts the alert into history unless an alert with the same
    /// (code, component, level) was recorded inside the dedup window.
    fn admit_alert(&self, alert: &Alert, dedup_window_minutes: i64) -> bool {
        let window = Duration::minutes(dedup_window_minutes);
        let mut alerts = write(&self.alerts);

        let duplicate = alerts
            .iter()
            .rev()
            .any(|seen| seen.same_signature(alert) && alert.timestamp - seen.timestamp <= window);
        if duplicate {
            debug!(
                error_code = %alert.error_code,
                component = %alert.component,
                level = %alert.level,
                "Suppressed duplicate alert"
            );
            return false;
        }

        if self.capacity.alerts > 0 {
            while alerts.len() >= self.capacity.alerts {
                alerts.pop_front();
            }
            alerts.push_back(alert.clone());
        }
        counter!(format!("resilience.alerts.{}", alert.level.to_string().to_lowercase()), 1);
        true
    }

    /// Hands the alert to every handler without waiting on any of them
    fn dispatch(&self, alert: Alert) {
        let handlers = read(&self.handlers).clone();
        if handlers.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(_) => {
                let mut pending = lock(&self.dispatches);
                while pending.try_join_next().is_some() {}
                for handler in handlers {
                    pending.spawn(handler.deliver(alert.clone()));
                }
            }
            Err(_) => {
                for handler in handlers {
                    match handler {
                        HandlerSlot::Sync(handler) => match catch_unwind(AssertUnwindSafe(|| handler(&alert))) {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                error!(alert_id = %alert.id, error = %err, "Alert handler failed");
                            }
                            Err(_) => {
                                error!(alert_id = %alert.id, "Alert handler panicked");
                            }
                        },
                        HandlerSlot::Async(_) => {
                            warn!(alert_id = %alert.id, "No async runtime; skipped async alert handler");
                        }
                    }
                }
            }
        }
    }

    /// Waits for every alert delivery spawned so far
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *lock(&self.dispatches));
        while let Some(joined) = pending.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Alert handler task aborted");
            }
        }
    }

    /// Registers a synchronous alert handler
    pub fn register_alert_handler<F>(&self, handler: F)
    where
        F: Fn(&Alert) -> Result<()> + Send + Sync + 'static,
    {
        write(&self.handlers).push(HandlerSlot::Sync(Arc::new(handler)));
    }

    /// Registers an asynchronous alert handler
    pub fn register_async_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        write(&self.handlers).push(HandlerSlot::Async(handler));
    }

    pub fn handler_count(&self) -> usize {
        read(&self.handlers).len()
    }

    /// Changes one warning or critical trip point
    pub fn set_alert_threshold(
        &self,
        kind: ThresholdKind,
        level: AlertLevel,
        value: f64,
    ) -> std::result::Result<(), ConfigError> {
        if !value.is_finite() || value <= 0.0 {
            return Err(ConfigError::InvalidThreshold {
                kind: kind.to_string(),
                value,
            });
        }

        let mut thresholds = write(&self.thresholds);
        let target = thresholds.for_kind_mut(kind);
        match level {
            AlertLevel::Warning => target.warning = value,
            AlertLevel::Critical => target.critical = value,
            other => return Err(ConfigError::UnsupportedLevel(other.to_string())),
        }

        info!(kind = %kind, level = %level, value, "Alert threshold updated");
        Ok(())
    }

    /// Changes the pattern detection window
    pub fn set_pattern_window(&self, minutes: i64) -> std::result::Result<(), ConfigError> {
        if minutes <= 0 {
            return Err(ConfigError::InvalidThreshold {
                kind: "pattern_window_minutes".to_string(),
                value: minutes as f64,
            });
        }
        write(&self.thresholds).pattern_window_minutes = minutes;
        Ok(())
    }

    pub fn thresholds(&self) -> AlertThresholds {
        read(&self.thresholds).clone()
    }

    /// Statistics over all recorded errors, or over the trailing window
    pub fn get_statistics(&self, time_range_minutes: Option<u64>) -> ErrorStatistics {
        let now = self.clock.now();
        let rate = lock(&self.windows).rate_at(now);

        match time_range_minutes {
            None => read(&self.running).clone().into_statistics(None, rate),
            Some(minutes) => {
                let metrics = lock(&self.metrics);
                let window = Duration::minutes(minutes as i64);
                let in_range: Vec<&ErrorMetric> = metrics
                    .iter()
                    .filter(|metric| now - metric.timestamp <= window)
                    .collect();

                let mut stats = RunningStats::default();
                for metric in &in_range {
                    stats.add(metric);
                }
                stats.avg_resolution_time_secs = mean_resolution_secs(in_range.into_iter());
                stats.into_statistics(Some(minutes), rate)
            }
        }
    }

    /// Most recent alerts, newest first
    pub fn get_recent_alerts(&self, limit: usize) -> Vec<Alert> {
        read(&self.alerts).iter().rev().take(limit).cloned().collect()
    }

    pub fn clear_alerts(&self) {
        write(&self.alerts).clear();
    }

    /// Snapshot of the metric history, oldest first
    pub fn metrics(&self) -> Vec<ErrorMetric> {
        lock(&self.metrics).iter().cloned().collect()
    }

    /// Marks unresolved metrics with the code (and component, if given)
    /// as resolved now. Returns how many were updated.
    pub fn mark_resolved(&self, error_code: &str, component: Option<&str>) -> usize {
        let now = self.clock.now();
        let (updated, avg) = {
            let mut metrics = lock(&self.metrics);
            let mut updated = 0;
            for metric in metrics.iter_mut().filter(|metric| {
                !metric.resolved
                    && metric.error_code == error_code
                    && component.map_or(true, |c| metric.component == c)
            }) {
                metric.resolved = true;
                metric.resolved_at = Some(now);
                updated += 1;
            }
            (updated, mean_resolution_secs(metrics.iter()))
        };

        if updated > 0 {
            let mut running = write(&self.running);
            running.resolved += updated as u64;
            running.avg_resolution_time_secs = avg;
            info!(error_code = %error_code, resolved = updated, "Marked errors resolved");
        }
        updated
    }

    /// Evicts metrics and pattern entries older than the retention period
    pub fn purge_older_than(&self, retention: Duration) -> usize {
        let cutoff = self.clock.now() - retention;

        let removed = {
            let mut metrics = lock(&self.metrics);
            let before = metrics.len();
            metrics.retain(|metric| metric.timestamp >= cutoff);
            before - metrics.len()
        };

        lock(&self.windows).purge(cutoff);

        let mut patterns = lock(&self.patterns);
        for occurrences in patterns.values_mut() {
            occurrences.retain(|at| *at >= cutoff);
        }
        patterns.retain(|_, occurrences| !occurrences.is_empty());

        if removed > 0 {
            info!(removed, "Purged expired error metrics");
        }
        removed
    }
}

impl ErrorObserver for ErrorMonitor {
    fn on_error(&self, error: &Error, context: &ErrorContext, classified: &ClassifiedError) -> Result<()> {
        self.record(error, context, classified);
        Ok(())
    }
}

impl fmt::Debug for ErrorMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMonitor")
            .field("capacity", &self.capacity)
            .field("thresholds", &self.thresholds())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::types::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor_with_clock() -> (ErrorMonitor, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new());
        let monitor = ErrorMonitor::new(clock.clone(), AlertThresholds::default(), MonitorCapacity::default());
        (monitor, clock)
    }

    fn record(monitor: &ErrorMonitor, clock: &MockClock, error: Error, component: &str) {
        let context = ErrorContext::new(component, "op").with_timestamp(clock.now());
        let classified = ClassifiedError::from_error(&error);
        monitor.record(&error, &context, &classified);
    }

    #[test]
    fn test_rate_uses_trailing_minute() {
        let (monitor, clock) = monitor_with_clock();

        record(&monitor, &clock, Error::search("a"), "search");
        record(&monitor, &clock, Error::search("b"), "search");
        assert_eq!(monitor.get_statistics(None).error_rate_per_minute, 2);

        let stale = Error::search("old");
        let context = ErrorContext::new("search", "op").with_timestamp(clock.now() - Duration::seconds(61));
        monitor.record(&stale, &context, &ClassifiedError::from_error(&stale));
        assert_eq!(monitor.get_statistics(None).error_rate_per_minute, 2);
        assert_eq!(monitor.get_statistics(None).total_errors, 3);

        clock.advance(Duration::seconds(61));
        assert_eq!(monitor.get_statistics(None).error_rate_per_minute, 0);
    }

    #[test]
    fn test_aggregates_by_dimension() {
        let (monitor, clock) = monitor_with_clock();
        record(&monitor, &clock, Error::search("a"), "search");
        record(&monitor, &clock, Error::cache("b"), "cache");
        record(&monitor, &clock, Error::new(ErrorKind::Unknown, "c"), "cache");

        let stats = monitor.get_statistics(None);
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.by_component.get("cache"), Some(&2));
        assert_eq!(stats.by_severity.get("MEDIUM"), Some(&1));
        assert_eq!(stats.by_category.get("SYSTEM"), Some(&2));
        assert_eq!(stats.by_code.get("UNKNOWN_ERROR"), Some(&1));
        assert_eq!(stats.top_errors.len(), 3);
    }

    #[test]
    fn test_windowed_statistics_are_idempotent() {
        let (monitor, clock) = monitor_with_clock();
        record(&monitor, &clock, Error::search("old"), "search");
        clock.advance(Duration::minutes(10));
        record(&monitor, &clock, Error::cache("new"), "cache");

        let first = monitor.get_statistics(Some(5));
        let second = monitor.get_statistics(Some(5));
        assert_eq!(first, second);
        assert_eq!(first.total_errors, 1);
        assert_eq!(first.by_code.get("CACHE_ERROR"), Some(&1));
        assert_eq!(monitor.get_statistics(Some(15)).total_errors, 2);
    }

    #[test]
    fn test_pattern_alert_and_dedup() {
        let (monitor, clock) = monitor_with_clock();
        for _ in 0..4 {
            record(&monitor, &clock, Error::reranking("timeout"), "reranker");
        }

        let pattern_alerts: Vec<Alert> = monitor
            .get_recent_alerts(100)
            .into_iter()
            .filter(|alert| alert.error_code == "RERANKING_ERROR")
            .collect();
        assert_eq!(pattern_alerts.len(), 1);
        assert_eq!(pattern_alerts[0].level, AlertLevel::Warning);
        assert_eq!(pattern_alerts[0].metadata["rule"], json!("pattern"));

        clock.advance(Duration::minutes(6));
        for _ in 0..3 {
            record(&monitor, &clock, Error::reranking("timeout"), "reranker");
        }
        let pattern_alerts = monitor
            .get_recent_alerts(100)
            .into_iter()
            .filter(|alert| alert.error_code == "RERANKING_ERROR")
            .count();
        assert_eq!(pattern_alerts, 2);
    }

    #[test]
    fn test_critical_accumulation() {
        let (monitor, clock) = monitor_with_clock();
        let fatal = || Error::new(ErrorKind::VectorStore, "segment corrupted");

        record(&monitor, &clock, fatal(), "vector_store");
        let alerts = monitor.get_recent_alerts(10);
        assert!(alerts
            .iter()
            .any(|a| a.error_code == CRITICAL_ERROR_ACCUMULATION && a.level == AlertLevel::Warning));

        for _ in 0..4 {
            record(&monitor, &clock, fatal(), "vector_store");
        }
        let alerts = monitor.get_recent_alerts(20);
        assert!(alerts
            .iter()
            .any(|a| a.error_code == CRITICAL_ERROR_ACCUMULATION && a.level == AlertLevel::Critical));
    }

    #[test]
    fn test_set_alert_threshold_validation() {
        let (monitor, _) = monitor_with_clock();
        monitor
            .set_alert_threshold(ThresholdKind::ErrorRate, AlertLevel::Warning, 2.0)
            .unwrap();
        assert_eq!(monitor.thresholds().error_rate.warning, 2.0);

        assert!(matches!(
            monitor.set_alert_threshold(ThresholdKind::Pattern, AlertLevel::Info, 2.0),
            Err(ConfigError::UnsupportedLevel(_))
        ));
        assert!(matches!(
            monitor.set_alert_threshold(ThresholdKind::Pattern, AlertLevel::Critical, -1.0),
            Err(ConfigError::InvalidThreshold { .. })
        ));
        assert!(monitor.set_pattern_window(0).is_err());
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let clock = Arc::new(MockClock::new());
        let monitor = ErrorMonitor::new(
            clock.clone(),
            AlertThresholds::default(),
            MonitorCapacity { metrics: 3, alerts: 2 },
        );
        for code in ["A", "B", "C", "D"] {
            record(&monitor, &clock, Error::search("x").code(code), &format!("c-{}", code));
        }

        let codes: Vec<String> = monitor.metrics().into_iter().map(|m| m.error_code).collect();
        assert_eq!(codes, vec!["B", "C", "D"]);
        assert_eq!(monitor.get_statistics(None).total_errors, 4);
        assert!(monitor.get_recent_alerts(10).len() <= 2);
    }

    #[test]
    fn test_mark_resolved_and_purge() {
        let (monitor, clock) = monitor_with_clock();
        record(&monitor, &clock, Error::cache("a"), "cache");
        record(&monitor, &clock, Error::search("b"), "search");

        clock.advance(Duration::seconds(30));
        assert_eq!(monitor.mark_resolved("CACHE_ERROR", Some("cache")), 1);
        assert_eq!(monitor.mark_resolved("CACHE_ERROR", Some("cache")), 0);

        let stats = monitor.get_statistics(None);
        assert_eq!(stats.resolved_errors, 1);
        assert_eq!(stats.avg_resolution_time_secs, Some(30.0));

        clock.advance(Duration::hours(2));
        assert_eq!(monitor.purge_older_than(Duration::hours(1)), 2);
        assert!(monitor.metrics().is_empty());
    }

    #[test]
    fn test_sync_handlers_run_inline_without_runtime() {
        let (monitor, clock) = monitor_with_clock();
        let delivered = Arc::new(AtomicUsize::new(0));

        monitor.register_alert_handler(|_| Err(Error::new(ErrorKind::ExternalService, "pager down")));
        let seen = delivered.clone();
        monitor.register_alert_handler(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        monitor.set_alert_threshold(ThresholdKind::Pattern, AlertLevel::Warning, 1.0).unwrap();
        record(&monitor, &clock, Error::cache("boom"), "cache");

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_sync_handler_is_contained_without_runtime() {
        let (monitor, clock) = monitor_with_clock();
        let delivered = Arc::new(AtomicUsize::new(0));

        monitor.register_alert_handler(|alert| {
            let escalation: Vec<&str> = Vec::new();
            let _ = escalation[alert.metadata.len()];
            Ok(())
        });
        let seen = delivered.clone();
        monitor.register_alert_handler(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        monitor.set_alert_threshold(ThresholdKind::Pattern, AlertLevel::Warning, 1.0).unwrap();
        record(&monitor, &clock, Error::cache("boom"), "cache");

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.get_statistics(None).total_errors, 1);
    }

    #[test]
    fn test_component_window_slides() {
        let (monitor, clock) = monitor_with_clock();
        monitor
            .set_alert_threshold(ThresholdKind::ComponentErrors, AlertLevel::Warning, 2.0)
            .unwrap();
        let component_alerts = |monitor: &ErrorMonitor| {
            monitor
                .get_recent_alerts(100)
                .into_iter()
                .filter(|alert| alert.error_code == COMPONENT_ERROR_THRESHOLD)
                .count()
        };

        record(&monitor, &clock, Error::cache("a"), "cache");
        clock.advance(Duration::minutes(61));
        record(&monitor, &clock, Error::cache("b"), "cache");
        record(&monitor, &clock, Error::search("c"), "search");
        assert_eq!(component_alerts(&monitor), 0);

        record(&monitor, &clock, Error::cache("d"), "cache");
        assert_eq!(component_alerts(&monitor), 1);
        assert_eq!(monitor.get_statistics(None).error_rate_per_minute, 3);

        clock.advance(Duration::hours(2));
        monitor.purge_older_than(Duration::hours(1));
        assert_eq!(monitor.get_statistics(None).error_rate_per_minute, 0);
    }
}
