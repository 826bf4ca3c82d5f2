//! Event and task types shared between the engine and worker implementations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a worker agent on the bus
pub type AgentId = String;

/// Identifier the coordinator uses for its own bus traffic
pub const COORDINATOR_ID: &str = "coordinator";

/// Identifier the training controller uses for its own bus traffic
pub const TRAINER_ID: &str = "trainer";

/// Kinds of tasks the coordinator knows how to route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Validate a record against domain rules
    Validation,
    /// Analyze a data set and produce findings
    Analysis,
    /// Produce a cost/effort estimate
    Estimation,
    /// Help a struggling worker (routed to the healthiest peer)
    AssistWorker,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Validation => write!(f, "validation"),
            TaskKind::Analysis => write!(f, "analysis"),
            TaskKind::Estimation => write!(f, "estimation"),
            TaskKind::AssistWorker => write!(f, "assist_worker"),
        }
    }
}

/// Priority attached to tasks and events
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl EventPriority {
    /// Whether this priority warrants synchronous assignment and
    /// automatic re-delegation on failure
    pub fn is_urgent(&self) -> bool {
        matches!(self, EventPriority::High | EventPriority::Critical)
    }
}

/// Kinds of events that travel over the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Coordinator dispatching a validation task to a worker
    ValidationRequested,
    /// Coordinator dispatching an analysis task to a worker
    AnalysisRequested,
    /// Coordinator dispatching an estimation task to a worker
    EstimationRequested,
    /// Coordinator asking a healthy worker to assist a struggling one
    AssistanceRequested,
    /// Worker reporting a task finished successfully
    TaskCompleted,
    /// Worker reporting a task failed
    TaskFailed,
    /// Worker liveness report
    Heartbeat,
    /// Training controller starting a learning pass on a worker
    TrainingStarted,
    /// Training controller reporting a worker's improvement score
    TrainingCompleted,
}

impl EventKind {
    /// The dispatch event kind for a task of the given kind
    pub fn for_task(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Validation => EventKind::ValidationRequested,
            TaskKind::Analysis => EventKind::AnalysisRequested,
            TaskKind::Estimation => EventKind::EstimationRequested,
            TaskKind::AssistWorker => EventKind::AssistanceRequested,
        }
    }
}

/// Subscription filter: a single event kind, or every kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFilter {
    /// Match every event kind
    All,
    /// Match exactly one event kind
    Kind(EventKind),
}

impl EventFilter {
    /// Whether this filter accepts the given event kind
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kind(k) => *k == kind,
        }
    }
}

/// A message on the event bus
///
/// Events are immutable once published. The payload is opaque to the
/// bus; producer and consumer agree on its shape per event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// What kind of message this is
    pub kind: EventKind,

    /// Agent that published the event
    pub source: AgentId,

    /// Addressee; `None` means broadcast to every subscriber
    pub target: Option<AgentId>,

    /// When the event was created
    pub timestamp: DateTime<Utc>,

    /// Opaque message body
    pub payload: serde_json::Value,

    /// Optional priority hint for the consumer
    pub priority: Option<EventPriority>,

    /// Ties a dispatched task to its eventual response
    pub correlation_id: Option<Uuid>,
}

impl Event {
    /// Create a broadcast event with an empty payload
    pub fn new(kind: EventKind, source: impl Into<AgentId>) -> Self {
        Self {
            kind,
            source: source.into(),
            target: None,
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
            priority: None,
            correlation_id: None,
        }
    }

    /// Address the event to a single subscriber
    pub fn with_target(mut self, target: impl Into<AgentId>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attach a priority hint
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Attach a correlation id
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Get a string field out of the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Get an f64 field out of the payload
    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(|v| v.as_f64())
    }
}
