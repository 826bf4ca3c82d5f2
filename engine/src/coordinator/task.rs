//! Task record and status state machine
//!
//! Tasks are owned by the coordinator. Status moves only along the
//! edges of the state machine below; `Completed` and `Failed` are
//! terminal under the normal completion handlers, and delegation
//! reassigns the same task object rather than creating a new task.
//!
//! ```text
//! Pending -> InProgress -> { Completed, Failed }
//! InProgress -> Delegated -> InProgress   (reassignment)
//! Delegated -> Failed                     (no candidate found)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sdk::types::{AgentId, EventPriority, TaskKind};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Delegated,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether the state machine permits moving from `self` to `to`
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Delegated)
                | (Delegated, InProgress)
                | (Delegated, Failed)
                // Re-delegation of an urgent failure reopens the task.
                | (Failed, Delegated)
        )
    }

    /// Whether this state is terminal for the normal completion handlers
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Delegated => write!(f, "delegated"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work tracked by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier
    pub id: Uuid,

    /// What kind of work this is (determines routing)
    pub kind: TaskKind,

    /// Current lifecycle state
    pub status: TaskStatus,

    /// Priority; High/Critical tasks are assigned synchronously and
    /// re-delegated on failure
    pub priority: EventPriority,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,

    /// Worker currently responsible for the task
    pub assigned_to: Option<AgentId>,

    /// Worker that most recently handed the task off
    pub delegated_by: Option<AgentId>,

    /// First assignee, preserved through the delegation chain
    pub original_agent: Option<AgentId>,

    /// Opaque task parameters, reshaped into the dispatch payload
    pub parameters: serde_json::Value,

    /// Result reported on completion
    pub result: Option<serde_json::Value>,

    /// Error reported on failure
    pub error_message: Option<String>,

    /// Links the dispatch event to the worker's response
    pub correlation_id: Uuid,
}

impl Task {
    /// Create a new pending task
    pub fn new(kind: TaskKind, parameters: serde_json::Value, priority: EventPriority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            status: TaskStatus::Pending,
            priority,
            created_at: now,
            updated_at: now,
            assigned_to: None,
            delegated_by: None,
            original_agent: None,
            parameters,
            result: None,
            error_message: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Elapsed time since the last status change
    pub fn age_since_update(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}

/// Filter for task queries; `None` fields match everything
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub kind: Option<TaskKind>,
    pub assigned_to: Option<AgentId>,
}

impl TaskFilter {
    /// Whether the task passes every set field
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if task.kind != kind {
                return false;
            }
        }
        if let Some(assignee) = &self.assigned_to {
            if task.assigned_to.as_ref() != Some(assignee) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(TaskStatus::Pending.can_transition(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition(TaskStatus::Delegated));
        assert!(TaskStatus::Delegated.can_transition(TaskStatus::InProgress));
        assert!(TaskStatus::Delegated.can_transition(TaskStatus::Failed));
        assert!(TaskStatus::Failed.can_transition(TaskStatus::Delegated));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!TaskStatus::Completed.can_transition(TaskStatus::InProgress));
        assert!(!TaskStatus::Completed.can_transition(TaskStatus::Failed));
        assert!(!TaskStatus::Pending.can_transition(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition(TaskStatus::Delegated));
        assert!(!TaskStatus::Failed.can_transition(TaskStatus::Completed));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Delegated.is_terminal());
    }

    #[test]
    fn test_filter_matching() {
        let mut task = Task::new(
            TaskKind::Validation,
            serde_json::json!({}),
            EventPriority::Medium,
        );
        task.assigned_to = Some("worker-1".into());

        let all = TaskFilter::default();
        assert!(all.matches(&task));

        let by_assignee = TaskFilter {
            assigned_to: Some("worker-1".into()),
            ..Default::default()
        };
        assert!(by_assignee.matches(&task));

        let wrong_status = TaskFilter {
            status: Some(TaskStatus::Completed),
            ..Default::default()
        };
        assert!(!wrong_status.matches(&task));
    }
}
