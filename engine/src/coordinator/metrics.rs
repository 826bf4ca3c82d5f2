//! Coordinator-wide performance metrics
//!
//! A single instance lives inside the coordinator for the life of the
//! process; it is reset only on restart.

use serde::{Deserialize, Serialize};

use super::health::EMA_ALPHA;

/// Rolling performance counters for the whole coordinator
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerformanceMetrics {
    /// Exponential moving average of task success (1.0 per success,
    /// 0.0 per failure, α = 0.2)
    pub average_success_rate: f64,

    /// Exponential moving average of completion time in milliseconds
    pub average_completion_ms: f64,

    /// Tasks created since process start
    pub tasks_created: u64,

    /// Tasks completed successfully
    pub tasks_completed: u64,

    /// Tasks that reached `Failed`
    pub tasks_failed: u64,

    /// Delegations performed (timeouts, unhealthy assignees, urgent
    /// failures)
    pub tasks_delegated: u64,

    /// Assistance tasks created on behalf of struggling workers
    pub assistance_requests: u64,

    /// Whether any outcome has been folded into the averages yet
    #[serde(skip)]
    seeded: bool,
}

impl PerformanceMetrics {
    /// Fold one task outcome into the moving averages
    pub fn record_outcome(&mut self, success: bool, completion_ms: f64) {
        let sample = if success { 1.0 } else { 0.0 };
        if !self.seeded {
            self.average_success_rate = sample;
            self.average_completion_ms = completion_ms;
            self.seeded = true;
        } else {
            self.average_success_rate =
                EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * self.average_success_rate;
            self.average_completion_ms =
                EMA_ALPHA * completion_ms + (1.0 - EMA_ALPHA) * self.average_completion_ms;
        }
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
    }
}
