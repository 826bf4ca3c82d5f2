//! Error types and handling
//!
//! This module provides the error types used throughout the Taskmesh engine.
//! Errors carry enough context to be surfaced to an external caller (for
//! example the HTTP binding) without exposing internal engine state.

use thiserror::Error;
use uuid::Uuid;

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Task lifecycle**: Unknown tasks, illegal state transitions
/// - **Routing**: No route or no healthy candidate for a task
/// - **Delivery**: Event handler failures surfaced by subscribers
/// - **Training**: Scheduling conflicts in the cycle controller
#[derive(Debug, Error)]
pub enum MeshError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Task lifecycle errors
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // Routing errors
    #[error("No route for task kind: {0}")]
    NoRoute(String),

    #[error("No healthy candidate for delegation: {0}")]
    DelegationExhausted(String),

    // Delivery errors
    #[error("Event handler failed: {0}")]
    HandlerFailed(String),

    // Training errors
    #[error("Training schedule already running")]
    TrainingAlreadyScheduled,
}

impl MeshError {
    /// Whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around by the caller.
    /// Non-recoverable errors describe a terminal outcome for the entity
    /// they refer to.
    pub fn is_recoverable(&self) -> bool {
        match self {
            MeshError::Config(_) => false,
            MeshError::TaskNotFound(_) => false,
            MeshError::InvalidTransition { .. } => false,
            MeshError::NoRoute(_) => false,
            MeshError::DelegationExhausted(_) => false,
            MeshError::HandlerFailed(_) => true,
            MeshError::TrainingAlreadyScheduled => true,
        }
    }
}

/// Result alias used across the sdk surface
pub type MeshResult<T> = Result<T, MeshError>;
