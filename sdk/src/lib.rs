//! Taskmesh SDK
//!
//! Shared library providing the event model, error types, and the handler
//! trait worker agents implement. This crate is used by both the engine
//! and external worker implementations.

/// Error types and handling
pub mod errors;

/// Event handler trait for bus subscribers
pub mod subscriber;

/// Event and task types
pub mod types;

// Re-export commonly used types
pub use errors::{MeshError, MeshResult};
pub use subscriber::{handler_fn, EventHandler, FnHandler};
pub use types::{
    AgentId, Event, EventFilter, EventKind, EventPriority, TaskKind, COORDINATOR_ID, TRAINER_ID,
};
