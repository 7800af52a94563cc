//! Metrics and observability infrastructure.
//!
//! - `events`: the `InternalEvent` trait that domain crates implement
//! - `server`: Prometheus recorder and HTTP endpoint

pub mod events;
pub mod server;

pub use server::{DEFAULT_METRICS_ADDR, MetricsController, init_global, init_test};

/// Emit a metric event.
///
/// Calls [`events::InternalEvent::emit`] on the given event, which records the
/// corresponding metric and a trace line.
///
/// ```ignore
/// emit!(RunnerReady { flow: "f1".into(), brick: "b1".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
