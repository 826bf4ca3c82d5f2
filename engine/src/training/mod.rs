//! Training cycle controller
//!
//! Periodically samples the experience buffer and drives a learning
//! pass across the worker pool. A cycle notifies each target worker
//! with the batch id and one sample experience (the full batch is
//! intentionally not transmitted, to bound message size), then scores
//! each worker by the weighted, clamped deltas of its metrics across
//! the cycle and broadcasts the score back.
//!
//! Only one cycle runs at a time and only one schedule may be active;
//! both guards are cheap to probe and safe to probe repeatedly.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use sdk::errors::{MeshError, MeshResult};
use sdk::types::{AgentId, Event, EventKind, TRAINER_ID};

use crate::config::TrainingConfig;
use crate::coordinator::TaskCoordinator;
use crate::event_bus::EventBus;
use crate::experience::ExperienceBuffer;

/// Improvement-score weights, applied to the clamped per-metric deltas
const WEIGHT_SUCCESS: f64 = 0.30;
const WEIGHT_REWARD: f64 = 0.20;
const WEIGHT_COMPLETION: f64 = 0.15;
const WEIGHT_ERROR_RATE: f64 = 0.20;
const WEIGHT_QUALITY: f64 = 0.15;

/// Per-cycle tuning; `Default` trains every known worker with the
/// configured batch size
#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Restrict the cycle to these workers; `None` means all known
    pub target_worker_ids: Option<Vec<AgentId>>,

    /// Override the configured sample size for this cycle
    pub batch_size: Option<usize>,
}

/// Outcome of one completed training cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batch_id: Uuid,
    pub batch_size: usize,
    /// Improvement score per trained worker, each in [0, 1]-ish range
    pub improvements: HashMap<AgentId, f64>,
}

/// Point-in-time view of the metrics the improvement score compares
#[derive(Debug, Clone, Copy, Default)]
struct WorkerSnapshot {
    success_rate: f64,
    average_reward: f64,
    average_response_ms: f64,
    error_rate: f64,
    output_quality: f64,
}

/// Weighted improvement across two snapshots of the same worker
///
/// Each sub-term is clamped to >= 0 before weighting so a regression
/// in one metric cannot drag the score negative.
fn improvement_score(before: &WorkerSnapshot, after: &WorkerSnapshot) -> f64 {
    let success = (after.success_rate - before.success_rate).max(0.0);
    let reward = (after.average_reward - before.average_reward).max(0.0);
    let completion = if before.average_response_ms > 0.0 {
        ((before.average_response_ms - after.average_response_ms) / before.average_response_ms)
            .max(0.0)
    } else {
        0.0
    };
    let errors = (before.error_rate - after.error_rate).max(0.0);
    let quality = (after.output_quality - before.output_quality).max(0.0);

    WEIGHT_SUCCESS * success
        + WEIGHT_REWARD * reward
        + WEIGHT_COMPLETION * completion
        + WEIGHT_ERROR_RATE * errors
        + WEIGHT_QUALITY * quality
}

/// Drives periodic training passes over the worker pool
pub struct TrainingController {
    bus: Arc<EventBus>,
    coordinator: Arc<TaskCoordinator>,
    buffer: Arc<ExperienceBuffer>,
    config: TrainingConfig,

    running: AtomicBool,
    schedule_handle: Mutex<Option<JoinHandle<()>>>,
    history: RwLock<VecDeque<TrainingResult>>,
}

impl TrainingController {
    /// Create a controller wired to the bus, coordinator, and buffer
    pub fn new(
        bus: Arc<EventBus>,
        coordinator: Arc<TaskCoordinator>,
        buffer: Arc<ExperienceBuffer>,
        config: TrainingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            coordinator,
            buffer,
            config,
            running: AtomicBool::new(false),
            schedule_handle: Mutex::new(None),
            history: RwLock::new(VecDeque::new()),
        })
    }

    /// Schedule `run_cycle` on the configured interval
    ///
    /// Refuses to start while another schedule is active.
    pub async fn start_automated(self: &Arc<Self>, options: CycleOptions) -> MeshResult<()> {
        let mut guard = self.schedule_handle.lock().await;
        if guard.is_some() {
            return Err(MeshError::TrainingAlreadyScheduled);
        }
        let controller = Arc::clone(self);
        let interval = self.config.interval();
        info!(interval_secs = interval.as_secs(), "starting training schedule");
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = controller.run_cycle(options.clone()).await {
                    tracing::warn!(error = %e, "scheduled training cycle failed");
                }
            }
        }));
        Ok(())
    }

    /// Stop the schedule; safe to call repeatedly
    pub async fn stop(&self) {
        if let Some(handle) = self.schedule_handle.lock().await.take() {
            handle.abort();
            info!("training schedule stopped");
        }
    }

    /// Whether a cycle is executing right now
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one training cycle
    ///
    /// Returns `None` without doing anything when a cycle is already
    /// running, the buffer is below its minimum size, or there is no
    /// worker to train.
    pub async fn run_cycle(&self, options: CycleOptions) -> Result<Option<TrainingResult>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("training cycle already running, skipping");
            return Ok(None);
        }
        let result = self.run_cycle_inner(options).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_cycle_inner(&self, options: CycleOptions) -> Result<Option<TrainingResult>> {
        let buffer_size = self.buffer.len().await;
        if buffer_size < self.config.min_buffer_size {
            debug!(
                buffer_size,
                min = self.config.min_buffer_size,
                "buffer below training threshold"
            );
            return Ok(None);
        }

        let targets = match options.target_worker_ids {
            Some(ids) => ids,
            None => self.coordinator.known_workers().await,
        };
        if targets.is_empty() {
            debug!("no workers to train");
            return Ok(None);
        }

        let started_at = Utc::now();
        let cycle_id = Uuid::new_v4();
        info!(cycle_id = %cycle_id, workers = targets.len(), "training cycle started");

        let before = self.snapshot_workers(&targets).await;

        let batch_size = options.batch_size.unwrap_or(self.config.batch_size);
        let batch = self
            .buffer
            .create_training_batch(batch_size, Some(targets.clone()))
            .await;

        for worker_id in &targets {
            let sample = batch
                .experiences
                .iter()
                .find(|e| &e.worker_id == worker_id)
                .or_else(|| batch.experiences.first());
            self.bus
                .publish(
                    Event::new(EventKind::TrainingStarted, TRAINER_ID)
                        .with_target(worker_id.clone())
                        .with_payload(json!({
                            "cycle_id": cycle_id,
                            "batch_id": batch.batch_id,
                            "sample": sample,
                        })),
                )
                .await;
        }

        let after = self.snapshot_workers(&targets).await;

        let mut improvements = HashMap::new();
        for worker_id in &targets {
            let score = improvement_score(
                before.get(worker_id).unwrap_or(&WorkerSnapshot::default()),
                after.get(worker_id).unwrap_or(&WorkerSnapshot::default()),
            );
            improvements.insert(worker_id.clone(), score);
        }

        for (worker_id, score) in &improvements {
            self.bus
                .publish(
                    Event::new(EventKind::TrainingCompleted, TRAINER_ID)
                        .with_target(worker_id.clone())
                        .with_payload(json!({
                            "cycle_id": cycle_id,
                            "batch_id": batch.batch_id,
                            "improvement": score,
                        })),
                )
                .await;
        }

        let result = TrainingResult {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            batch_id: batch.batch_id,
            batch_size: batch.experiences.len(),
            improvements,
        };

        {
            let mut history = self.history.write().await;
            history.push_back(result.clone());
            while history.len() > self.config.result_history {
                history.pop_front();
            }
        }

        info!(cycle_id = %cycle_id, batch_size = result.batch_size, "training cycle finished");
        Ok(Some(result))
    }

    /// Retained cycle results, oldest first
    pub async fn results(&self) -> Vec<TrainingResult> {
        self.history.read().await.iter().cloned().collect()
    }

    async fn snapshot_workers(&self, targets: &[AgentId]) -> HashMap<AgentId, WorkerSnapshot> {
        let mut snapshots = HashMap::new();
        for worker_id in targets {
            let health = self.coordinator.get_worker_health(Some(worker_id)).await;
            let average_reward = self.buffer.average_reward(worker_id).await;
            let snapshot = match health.first() {
                Some(h) => WorkerSnapshot {
                    success_rate: 1.0 - h.error_rate(),
                    average_reward,
                    average_response_ms: h.average_response_ms,
                    error_rate: h.error_rate(),
                    output_quality: h.output_quality,
                },
                None => WorkerSnapshot {
                    average_reward,
                    ..WorkerSnapshot::default()
                },
            };
            snapshots.insert(worker_id.clone(), snapshot);
        }
        snapshots
    }
}
