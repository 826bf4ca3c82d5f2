//! Taskmesh Engine Library
//!
//! This library provides the core functionality of the Taskmesh
//! runtime: the event bus, the task coordinator, the prioritized
//! experience buffer, and the training cycle controller. It is used by
//! embedding applications and integration tests.
//!
//! Every subsystem is an explicitly constructed object wired together
//! at startup and shared via `Arc`; there are no ambient globals.

/// Configuration management module
pub mod config;

/// Task coordination module
pub mod coordinator;

/// Event bus for inter-component communication
pub mod event_bus;

/// Prioritized experience buffer module
pub mod experience;

/// Telemetry and Observability
pub mod telemetry;

/// Training cycle controller module
pub mod training;

pub use config::Config;
pub use coordinator::TaskCoordinator;
pub use event_bus::EventBus;
pub use experience::ExperienceBuffer;
pub use training::TrainingController;
