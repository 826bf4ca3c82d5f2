//! Prioritized experience buffer
//!
//! Bounded, priority-weighted store of learning signals. Every recorded
//! task outcome becomes one `ExperienceEntry`; when the buffer grows
//! past capacity the lowest-priority entries are evicted, so the
//! retained set is always the highest-priority subset seen (modulo ties).
//!
//! Sampling is priority-weighted without replacement: each candidate's
//! selection probability is its priority share of the candidate pool's
//! total priority mass.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use sdk::types::AgentId;

/// One recorded (state, action, result, reward) tuple
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceEntry {
    /// Entry identifier
    pub id: Uuid,

    /// When the entry was recorded
    pub timestamp: DateTime<Utc>,

    /// Worker the experience belongs to
    pub worker_id: AgentId,

    /// Opaque context snapshot before the action
    pub state: serde_json::Value,

    /// Label of the action taken
    pub action: String,

    /// Outcome of the action
    pub result: serde_json::Value,

    /// Opaque context snapshot after the action
    pub next_state: serde_json::Value,

    /// Signed learning signal
    pub reward: f64,

    /// Selection weight in [0, 1]
    pub priority: f64,

    /// Free-form annotations (task id, correlation id, ...)
    pub metadata: serde_json::Value,
}

/// An experience to be recorded; the buffer assigns id and timestamp
#[derive(Debug, Clone)]
pub struct NewExperience {
    pub worker_id: AgentId,
    pub state: serde_json::Value,
    pub action: String,
    pub result: serde_json::Value,
    pub next_state: serde_json::Value,
    pub reward: f64,
    /// Defaults to the buffer's configured default when `None`
    pub priority: Option<f64>,
    pub metadata: serde_json::Value,
}

/// A sampled batch handed to the training controller
///
/// Ephemeral; produced and consumed within one training cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingBatch {
    pub batch_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub experiences: Vec<ExperienceEntry>,
    pub target_worker_ids: Option<Vec<AgentId>>,
}

/// Diagnostic summary of the buffer contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStats {
    pub size: usize,
    pub per_worker: HashMap<AgentId, usize>,
    pub mean_priority: f64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Bounded, priority-weighted experience store
pub struct ExperienceBuffer {
    capacity: usize,
    default_priority: f64,
    entries: RwLock<Vec<ExperienceEntry>>,
}

impl ExperienceBuffer {
    /// Create a buffer with the given capacity and default priority
    pub fn new(capacity: usize, default_priority: f64) -> Self {
        Self {
            capacity,
            default_priority: default_priority.clamp(0.0, 1.0),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Record one experience; returns its assigned id
    ///
    /// If the buffer exceeds capacity afterwards, the globally
    /// lowest-priority entries are evicted until it is back at capacity.
    pub async fn add(&self, new: NewExperience) -> Uuid {
        let id = Uuid::new_v4();
        let entry = ExperienceEntry {
            id,
            timestamp: Utc::now(),
            worker_id: new.worker_id,
            state: new.state,
            action: new.action,
            result: new.result,
            next_state: new.next_state,
            reward: new.reward,
            priority: new.priority.unwrap_or(self.default_priority).clamp(0.0, 1.0),
            metadata: new.metadata,
        };

        let mut entries = self.entries.write().await;
        entries.push(entry);
        while entries.len() > self.capacity {
            let lowest = entries
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.priority
                        .partial_cmp(&b.priority)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i);
            if let Some(i) = lowest {
                let evicted = entries.swap_remove(i);
                debug!(id = %evicted.id, priority = evicted.priority, "evicting experience");
            }
        }
        id
    }

    /// Draw up to `count` entries, optionally restricted to one worker
    ///
    /// When the candidate pool is no larger than `count` the whole pool
    /// is returned. Otherwise entries are drawn without replacement by
    /// roulette selection over normalized priorities, with a uniform
    /// fallback when floating-point rounding leaves a draw unmatched.
    pub async fn sample(&self, count: usize, worker_id: Option<&str>) -> Vec<ExperienceEntry> {
        self.sample_where(count, |e| match worker_id {
            Some(w) => e.worker_id == w,
            None => true,
        })
        .await
    }

    /// Draw a batch for the training controller
    pub async fn create_training_batch(
        &self,
        count: usize,
        target_worker_ids: Option<Vec<AgentId>>,
    ) -> TrainingBatch {
        let experiences = self
            .sample_where(count, |e| match &target_worker_ids {
                Some(ids) => ids.iter().any(|id| *id == e.worker_id),
                None => true,
            })
            .await;
        TrainingBatch {
            batch_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            experiences,
            target_worker_ids,
        }
    }

    async fn sample_where<F>(&self, count: usize, keep: F) -> Vec<ExperienceEntry>
    where
        F: Fn(&ExperienceEntry) -> bool,
    {
        let pool: Vec<ExperienceEntry> = {
            let entries = self.entries.read().await;
            entries.iter().filter(|e| keep(e)).cloned().collect()
        };

        if pool.len() <= count {
            return pool;
        }

        let mut rng = rand::thread_rng();
        let mut remaining: Vec<usize> = (0..pool.len()).collect();
        let mut total: f64 = pool.iter().map(|e| e.priority).sum();
        let mut selected = Vec::with_capacity(count);

        while selected.len() < count && !remaining.is_empty() {
            let pick = if total > 0.0 {
                let r = rng.gen::<f64>() * total;
                let mut cumulative = 0.0;
                let mut hit = None;
                for (slot, &idx) in remaining.iter().enumerate() {
                    cumulative += pool[idx].priority;
                    if r < cumulative {
                        hit = Some(slot);
                        break;
                    }
                }
                // Rounding can leave the draw past the last cumulative
                // step; fall back to a uniform pick.
                hit.unwrap_or_else(|| rng.gen_range(0..remaining.len()))
            } else {
                rng.gen_range(0..remaining.len())
            };

            let idx = remaining.swap_remove(pick);
            total -= pool[idx].priority;
            selected.push(pool[idx].clone());
        }

        selected
    }

    /// Re-weight an entry; clamps to [0, 1], no-op if the id is unknown
    pub async fn update_priority(&self, id: Uuid, priority: f64) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.priority = priority.clamp(0.0, 1.0);
        }
    }

    /// Number of retained entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the buffer is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Mean reward over one worker's retained entries
    pub async fn average_reward(&self, worker_id: &str) -> f64 {
        let entries = self.entries.read().await;
        let rewards: Vec<f64> = entries
            .iter()
            .filter(|e| e.worker_id == worker_id)
            .map(|e| e.reward)
            .collect();
        if rewards.is_empty() {
            0.0
        } else {
            rewards.iter().sum::<f64>() / rewards.len() as f64
        }
    }

    /// Diagnostic summary of the buffer contents
    pub async fn stats(&self) -> BufferStats {
        let entries = self.entries.read().await;
        let mut per_worker: HashMap<AgentId, usize> = HashMap::new();
        for entry in entries.iter() {
            *per_worker.entry(entry.worker_id.clone()).or_default() += 1;
        }
        let mean_priority = if entries.is_empty() {
            0.0
        } else {
            entries.iter().map(|e| e.priority).sum::<f64>() / entries.len() as f64
        };
        BufferStats {
            size: entries.len(),
            per_worker,
            mean_priority,
            oldest: entries.iter().map(|e| e.timestamp).min(),
            newest: entries.iter().map(|e| e.timestamp).max(),
        }
    }
}
