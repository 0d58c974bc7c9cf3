//! Health monitoring for storage backends.
//!
//! The monitor owns an [`ErrorTracker`] shared with retry executors, a
//! bounded ring of operation metrics, and probe routines that exercise
//! a fresh backend under a deadline. A probe never takes the monitor
//! down with it: failures and timeouts come back as an unhealthy
//! report.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::{
    classify_io, classify_sqlx, JsonFileStorage, PostgresStorage, SqliteStorage, StorageBackend,
    StorageConfig, StorageEngine, StorageError, StorageErrorKind, StorageResult,
};
use entities::TaskRecord;

/// Maximum entries kept in the recent-error log.
pub const MAX_RECENT_ERRORS: usize = 50;

/// Ring buffer capacity for operation metrics.
pub const MAX_METRICS: usize = 1000;

/// Rolling-statistics window over the most recent metrics.
pub const METRICS_WINDOW: usize = 100;

/// Errors younger than this count as recent for health verdicts.
pub const RECENT_ERROR_WINDOW: Duration = Duration::from_secs(300);

/// Budget for one backend probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON state files larger than this raise a soft warning.
const MAX_HEALTHY_JSON_BYTES: u64 = 5 * 1024 * 1024;

/// Active Postgres connections above this raise a soft warning.
const MAX_HEALTHY_PG_CONNECTIONS: i64 = 80;

/// One entry in the bounded recent-error log.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedError {
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
    /// Engine that failed.
    pub engine: StorageEngine,
    /// Failure category.
    pub kind: StorageErrorKind,
    /// Operation that was running.
    pub operation: String,
    /// Display form of the error.
    pub message: String,
}

#[derive(Debug, Default)]
struct TrackerInner {
    counters: HashMap<String, u64>,
    recent: VecDeque<RecordedError>,
}

/// Process-local record of classified storage failures.
///
/// Shared between retry executors (writers) and the health monitor
/// (reader) via `Arc`; there is no global state.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    inner: Mutex<TrackerInner>,
}

impl ErrorTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a classified failure and appends it to the recent log.
    /// Unclassified errors (not-found, conflicts) are not tracked.
    pub fn record_error(&self, error: &StorageError, operation: &str) {
        let backend = match error {
            StorageError::Backend(backend) => backend,
            _ => return,
        };
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(backend.counter_key()).or_insert(0) += 1;
        if inner.recent.len() == MAX_RECENT_ERRORS {
            inner.recent.pop_front();
        }
        inner.recent.push_back(RecordedError {
            at: Utc::now(),
            engine: backend.engine,
            kind: backend.kind,
            operation: operation.to_string(),
            message: backend.to_string(),
        });
    }

    /// Count recorded under one `"{engine}:{kind}"` key.
    pub fn count(&self, key: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .counters
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of all failure counters.
    pub fn counters(&self) -> HashMap<String, u64> {
        self.inner.lock().unwrap().counters.clone()
    }

    /// Recent errors, oldest first.
    pub fn recent_errors(&self) -> Vec<RecordedError> {
        self.inner.lock().unwrap().recent.iter().cloned().collect()
    }

    /// Number of errors recorded within `window` of now.
    pub fn recent_error_count(&self, window: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        self.inner
            .lock()
            .unwrap()
            .recent
            .iter()
            .filter(|e| e.at > cutoff)
            .count()
    }
}

/// One storage operation measurement.
#[derive(Debug, Clone, Serialize)]
pub struct OperationMetric {
    /// Operation name, e.g. `create_entity`.
    pub operation: String,
    /// Engine that served it.
    pub engine: StorageEngine,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Whether it succeeded.
    pub success: bool,
    /// When it finished.
    pub at: DateTime<Utc>,
}

/// Result of probing one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    /// Engine that was probed.
    pub engine: StorageEngine,
    /// Whether the probe completed within budget.
    pub healthy: bool,
    /// Probe duration in milliseconds.
    pub response_time_ms: u64,
    /// When the probe ran.
    pub checked_at: DateTime<Utc>,
    /// Engine-specific diagnostics: sizes, pragmas, connection counts.
    pub details: BTreeMap<String, serde_json::Value>,
    /// Probe failure, when unhealthy.
    pub error: Option<String>,
}

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthVerdict {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthVerdict {
    /// Wire name of the verdict.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthVerdict::Healthy => "HEALTHY",
            HealthVerdict::Degraded => "DEGRADED",
            HealthVerdict::Unhealthy => "UNHEALTHY",
        }
    }
}

impl std::fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collects storage metrics and probes backend health.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    tracker: Arc<ErrorTracker>,
    metrics: Mutex<VecDeque<OperationMetric>>,
}

impl HealthMonitor {
    /// Monitor with an empty tracker and metric buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker handle to share with retry executors.
    pub fn tracker(&self) -> Arc<ErrorTracker> {
        self.tracker.clone()
    }

    /// Appends a measurement, evicting the oldest beyond [`MAX_METRICS`].
    pub fn record_metric(&self, metric: OperationMetric) {
        let mut metrics = self.metrics.lock().unwrap();
        if metrics.len() == MAX_METRICS {
            metrics.pop_front();
        }
        metrics.push_back(metric);
    }

    /// Convenience wrapper around [`Self::record_metric`].
    pub fn record_operation(
        &self,
        engine: StorageEngine,
        operation: impl Into<String>,
        duration: Duration,
        success: bool,
    ) {
        self.record_metric(OperationMetric {
            operation: operation.into(),
            engine,
            duration_ms: duration.as_millis() as u64,
            success,
            at: Utc::now(),
        });
    }

    /// Number of buffered measurements.
    pub fn metric_count(&self) -> usize {
        self.metrics.lock().unwrap().len()
    }

    /// Success rate over the most recent window; `1.0` when empty.
    pub fn success_rate(&self) -> f64 {
        let metrics = self.metrics.lock().unwrap();
        let window: Vec<_> = metrics.iter().rev().take(METRICS_WINDOW).collect();
        if window.is_empty() {
            return 1.0;
        }
        let successes = window.iter().filter(|m| m.success).count();
        successes as f64 / window.len() as f64
    }

    /// Average latency in milliseconds over the most recent window.
    pub fn average_latency_ms(&self) -> f64 {
        let metrics = self.metrics.lock().unwrap();
        let window: Vec<_> = metrics.iter().rev().take(METRICS_WINDOW).collect();
        if window.is_empty() {
            return 0.0;
        }
        let total: u64 = window.iter().map(|m| m.duration_ms).sum();
        total as f64 / window.len() as f64
    }

    /// Probes the backend described by `config`.
    ///
    /// Builds a fresh backend, runs initialize + read + engine-specific
    /// diagnostics under [`PROBE_TIMEOUT`], and reports the outcome.
    /// Probe failures never propagate.
    pub async fn check_backend_health(&self, config: &StorageConfig) -> BackendHealth {
        let started = Instant::now();
        let checked_at = Utc::now();
        let outcome = tokio::time::timeout(PROBE_TIMEOUT, probe_backend(config)).await;

        let (healthy, details, error) = match outcome {
            Ok(Ok(details)) => (true, details, None),
            Ok(Err(e)) => {
                warn!(engine = %config.engine, error = %e, "backend health probe failed");
                (false, BTreeMap::new(), Some(e.to_string()))
            }
            Err(_) => {
                warn!(engine = %config.engine, "backend health probe timed out");
                (
                    false,
                    BTreeMap::new(),
                    Some(format!(
                        "health probe timed out after {}s",
                        PROBE_TIMEOUT.as_secs()
                    )),
                )
            }
        };

        BackendHealth {
            engine: config.engine,
            healthy,
            response_time_ms: started.elapsed().as_millis() as u64,
            checked_at,
            details,
            error,
        }
    }

    /// Combines a probe result with rolling metrics into a verdict.
    ///
    /// Healthy needs a passing probe, a success rate of at least 0.98,
    /// average latency under two seconds, at most three recent errors
    /// and no engine soft warning. A passing probe within softer bounds
    /// (success rate at least 0.90, at most ten recent errors) or with
    /// only a soft warning is degraded. Everything else is unhealthy.
    pub fn overall_health(&self, backend: &BackendHealth) -> HealthVerdict {
        if !backend.healthy {
            return HealthVerdict::Unhealthy;
        }

        let success_rate = self.success_rate();
        let average_latency = self.average_latency_ms();
        let recent_errors = self.tracker.recent_error_count(RECENT_ERROR_WINDOW);
        let soft_warning = has_soft_warning(backend);

        if success_rate >= 0.98 && average_latency < 2000.0 && recent_errors <= 3 && !soft_warning
        {
            return HealthVerdict::Healthy;
        }
        if (success_rate >= 0.90 && recent_errors <= 10) || soft_warning {
            return HealthVerdict::Degraded;
        }
        HealthVerdict::Unhealthy
    }
}

fn has_soft_warning(backend: &BackendHealth) -> bool {
    match backend.engine {
        StorageEngine::Json => backend
            .details
            .get("fileSizeBytes")
            .and_then(serde_json::Value::as_u64)
            .is_some_and(|size| size > MAX_HEALTHY_JSON_BYTES),
        StorageEngine::Sqlite => backend
            .details
            .get("journalMode")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|mode| !mode.eq_ignore_ascii_case("wal")),
        StorageEngine::Postgres => backend
            .details
            .get("activeConnections")
            .and_then(serde_json::Value::as_i64)
            .is_some_and(|n| n > MAX_HEALTHY_PG_CONNECTIONS),
    }
}

async fn probe_backend(config: &StorageConfig) -> StorageResult<BTreeMap<String, serde_json::Value>> {
    match config.engine {
        StorageEngine::Json => probe_json(config).await,
        StorageEngine::Sqlite => probe_sqlite(config).await,
        StorageEngine::Postgres => probe_postgres(config).await,
    }
}

async fn probe_json(config: &StorageConfig) -> StorageResult<BTreeMap<String, serde_json::Value>> {
    let path = config.json_state_path();
    let storage = JsonFileStorage::<TaskRecord>::new(&path);
    storage.initialize().await?;
    let state = storage.read_state().await?;

    let mut details = BTreeMap::new();
    details.insert("entityCount".to_string(), json!(state.entities.len()));

    let size = tokio::fs::metadata(&path)
        .await
        .map_err(|e| classify_io(StorageEngine::Json, "health_check", e))?
        .len();
    details.insert("fileSizeBytes".to_string(), json!(size));

    let writable = match path.parent() {
        Some(parent) => directory_writable(parent).await,
        None => false,
    };
    details.insert("writable".to_string(), json!(writable));
    Ok(details)
}

async fn probe_sqlite(config: &StorageConfig) -> StorageResult<BTreeMap<String, serde_json::Value>> {
    let storage = SqliteStorage::<TaskRecord>::connect(config).await?;
    storage.initialize().await?;
    let state = storage.read_state().await?;

    let mut details = BTreeMap::new();
    details.insert("entityCount".to_string(), json!(state.entities.len()));

    let integrity: String = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_one(storage.pool())
        .await
        .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "health_check", e))?;
    details.insert("integrityCheck".to_string(), json!(integrity));

    let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(storage.pool())
        .await
        .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "health_check", e))?;
    details.insert("journalMode".to_string(), json!(journal_mode));

    let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
        .fetch_one(storage.pool())
        .await
        .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "health_check", e))?;
    details.insert("pageCount".to_string(), json!(page_count));

    storage.close().await?;
    Ok(details)
}

async fn probe_postgres(
    config: &StorageConfig,
) -> StorageResult<BTreeMap<String, serde_json::Value>> {
    let storage = PostgresStorage::<TaskRecord>::connect(config).await?;
    storage.initialize().await?;
    let state = storage.read_state().await?;

    let mut details = BTreeMap::new();
    details.insert("entityCount".to_string(), json!(state.entities.len()));

    let version: String = sqlx::query_scalar("SELECT current_setting('server_version')")
        .fetch_one(storage.pool())
        .await
        .map_err(|e| classify_sqlx(StorageEngine::Postgres, "health_check", e))?;
    details.insert("serverVersion".to_string(), json!(version));

    let active: i64 =
        sqlx::query_scalar("SELECT count(*) FROM pg_stat_activity WHERE state = 'active'")
            .fetch_one(storage.pool())
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Postgres, "health_check", e))?;
    details.insert("activeConnections".to_string(), json!(active));

    let size: i64 = sqlx::query_scalar("SELECT pg_database_size(current_database())")
        .fetch_one(storage.pool())
        .await
        .map_err(|e| classify_sqlx(StorageEngine::Postgres, "health_check", e))?;
    details.insert("databaseSizeBytes".to_string(), json!(size));

    let blocked: i64 =
        sqlx::query_scalar("SELECT count(*) FROM pg_stat_activity WHERE wait_event_type = 'Lock'")
            .fetch_one(storage.pool())
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Postgres, "health_check", e))?;
    details.insert("blockedQueries".to_string(), json!(blocked));

    storage.close().await?;
    Ok(details)
}

async fn directory_writable(dir: &Path) -> bool {
    let probe = dir.join(".trellis-health-probe");
    match tokio::fs::write(&probe, b"probe").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            true
        }
        Err(_) => false,
    }
}
