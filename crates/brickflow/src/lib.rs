//! brickflow: orchestration core for brick pipelines.
//!
//! A [`ControlPeer`] turns a declarative topology into [`Flow`]s, each an
//! ordered chain of [`Brick`]s. Starting a brick launches a worker process
//! (a [`BrickRunner`]) which dials back to the peer's registration server,
//! identifies itself, reports the address it listens on and is told where to
//! send its own output.
//!
//! This crate handles:
//! - Topology configuration and validation
//! - The length-delimited wire protocol spoken with workers
//! - Worker process launch and supervision
//! - Runner registration and output routing
//! - Ordered start/stop of flows and an HTTP control surface

pub mod api;
pub mod brick;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod flow;
pub mod id;
pub mod launcher;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod runner;
pub mod status;
pub mod wire;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use brick::Brick;
pub use config::Config;
pub use connection::{Connection, Transport};
pub use context::RunnerContext;
pub use error::{
    ControlPeerError, FlowError, LaunchError, RegistrationError, TransportError, WorkerEnvError,
};
pub use flow::{Flow, FlowState};
pub use id::{BrickId, FlowId, RunnerId};
pub use launcher::{ProcessLauncher, WorkerExit, WorkerHandle, WorkerLauncher, WorkerSpec};
pub use peer::ControlPeer;
pub use registry::RunnerRegistry;
pub use runner::{BrickRunner, RunnerState, RunnerStatus};
pub use wire::Message;

// Re-export from brickflow-core
pub use brickflow_core::{
    CliArgs, ConfigPath, cancel_on_signal, init_metrics, init_tracing, shutdown_signal,
};
