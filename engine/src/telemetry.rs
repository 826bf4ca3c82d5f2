//! Telemetry and Observability
//!
//! Sets up `tracing-subscriber` for the runtime. The base level and
//! output format come from the `[telemetry]` config section; a
//! `RUST_LOG` environment variable overrides the configured level.
//! Pretty output suits an interactive session, JSON suits log shipping
//! from a deployed coordinator.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, TelemetryConfig};

/// Default filter directives derived from the configured level
///
/// The runtime's own crate gets an explicit directive so an embedding
/// application that quiets the base level still sees engine logs.
fn filter_directives(config: &TelemetryConfig) -> String {
    format!("{},taskmesh_engine={}", config.level, config.level)
}

/// Initialize the tracing subscriber from the telemetry config
///
/// Priority: `RUST_LOG` env var > configured level. Safe to call more
/// than once; later calls keep the first subscriber.
pub fn init_telemetry(config: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_target(false))
                .try_init()
                .ok();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_current_span(true))
                .try_init()
                .ok();
        }
    }
}
