//! brickflow-core: Shared components for the brickflow control peer.
//!
//! This crate holds the plumbing that is not specific to flows and bricks:
//!
//! - `config/` - Config file discovery, environment interpolation and merging
//! - `metrics/` - Prometheus recorder, metrics server and the `emit!` event interface
//! - `signal` - Signal handling for graceful shutdown
//! - `tracing` - Subscriber initialisation
//! - `error` - Common error types

pub mod config;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod tracing;

// Re-export commonly used items
pub use config::{
    CliArgs, ConfigPath, InterpolationResult, MetricsConfig, Mergeable, interpolate,
    load_from_paths,
};
pub use error::{ConfigError, MetricsError};
pub use metrics::{
    DEFAULT_METRICS_ADDR, MetricsController, init_global as init_metrics,
    init_test as init_metrics_test,
};
pub use signal::{cancel_on_signal, shutdown_signal};
pub use self::tracing::init_tracing;
