//! Per-worker health tracking
//!
//! One `WorkerHealth` record exists per worker the coordinator has ever
//! seen. Records are created lazily on first sight and never deleted;
//! a worker that can no longer be checked is marked `Offline`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sdk::types::AgentId;

/// Smoothing factor for the response-time and quality moving averages
pub const EMA_ALPHA: f64 = 0.2;

/// Classification of a worker's health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// No update within the staleness threshold
    Degraded,
    /// Error counter above the threshold
    Unhealthy,
    /// Health check itself failed
    Offline,
}

impl HealthStatus {
    /// Whether a worker in this state may receive new assignments
    pub fn is_assignable(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Ordering class used by delegation: Healthy candidates sort
    /// before Degraded ones; Unhealthy/Offline are excluded upstream.
    pub fn preference_rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
            HealthStatus::Offline => 3,
        }
    }
}

/// Health record for one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Worker identifier
    pub worker_id: AgentId,

    /// Whether the worker currently holds any assignment
    pub is_active: bool,

    /// Last time the worker reported in (heartbeat or task outcome)
    pub last_heartbeat: DateTime<Utc>,

    /// Number of tasks currently assigned
    pub task_count: usize,

    /// Error counter, bumped on task failures and dispatch errors
    pub error_count: usize,

    /// Exponential moving average of response time in milliseconds
    pub average_response_ms: f64,

    /// Memory-pressure proxy reported in heartbeats
    pub memory_usage: f64,

    /// Exponential moving average of worker-reported output quality
    pub output_quality: f64,

    /// Current classification
    pub status: HealthStatus,
}

impl WorkerHealth {
    /// Create a fresh record for a worker seen for the first time
    pub fn new(worker_id: impl Into<AgentId>) -> Self {
        Self {
            worker_id: worker_id.into(),
            is_active: false,
            last_heartbeat: Utc::now(),
            task_count: 0,
            error_count: 0,
            average_response_ms: 0.0,
            memory_usage: 0.0,
            output_quality: 0.0,
            status: HealthStatus::Healthy,
        }
    }

    /// Fold one observed response time into the moving average
    pub fn record_response_time(&mut self, elapsed_ms: f64) {
        if self.average_response_ms == 0.0 {
            self.average_response_ms = elapsed_ms;
        } else {
            self.average_response_ms =
                EMA_ALPHA * elapsed_ms + (1.0 - EMA_ALPHA) * self.average_response_ms;
        }
    }

    /// Fold one worker-reported quality sample into the moving average
    pub fn record_quality(&mut self, quality: f64) {
        let quality = quality.clamp(0.0, 1.0);
        if self.output_quality == 0.0 {
            self.output_quality = quality;
        } else {
            self.output_quality = EMA_ALPHA * quality + (1.0 - EMA_ALPHA) * self.output_quality;
        }
    }

    /// Mark a heartbeat, refreshing staleness tracking
    pub fn record_heartbeat(&mut self, memory_usage: Option<f64>) {
        self.last_heartbeat = Utc::now();
        if let Some(m) = memory_usage {
            self.memory_usage = m;
        }
    }

    /// Fraction of tracked work that ended in error
    pub fn error_rate(&self) -> f64 {
        let total = self.task_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        }
    }

    /// Classify this record given staleness and error thresholds
    ///
    /// The caller supplies `now` so the poll loop classifies every
    /// worker against a single instant.
    pub fn classify(&self, now: DateTime<Utc>, stale_after: chrono::Duration, max_errors: usize) -> HealthStatus {
        if self.error_count > max_errors {
            HealthStatus::Unhealthy
        } else if now - self.last_heartbeat > stale_after {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
