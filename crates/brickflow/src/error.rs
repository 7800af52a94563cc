//! Error types for the brickflow control peer.

use std::time::Duration;

use snafu::prelude::*;

use crate::runner::RunnerState;

// Re-export common errors
pub use brickflow_core::error::{ConfigError, MetricsError};

/// Failures on a framed [`Connection`](crate::connection::Connection).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// Reading, writing or framing failed on the underlying stream.
    #[snafu(display("I/O error on connection {label}: {source}"))]
    Io {
        label: String,
        source: std::io::Error,
    },

    /// A message could not be serialized.
    #[snafu(display("Failed to encode message on connection {label}: {source}"))]
    Encode {
        label: String,
        source: serde_json::Error,
    },

    /// A frame did not contain a valid message.
    #[snafu(display("Malformed message on connection {label}: {source}"))]
    Decode {
        label: String,
        source: serde_json::Error,
    },
}

/// Failures of the registration handshake for an accepted connection.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistrationError {
    /// The handshake frame could not be read.
    #[snafu(display("Registration handshake failed: {source}"))]
    Handshake { source: TransportError },

    /// The peer closed the connection before registering.
    #[snafu(display("Connection from {peer} closed before registering"))]
    ClosedEarly { peer: String },

    /// The first message was not a registration.
    #[snafu(display("Expected a register message from {peer}, got '{kind}'"))]
    UnexpectedMessage { peer: String, kind: &'static str },

    /// The runner identifier is not in the registry.
    #[snafu(display("Unknown runner identifier '{runner_id}'"))]
    UnknownRunner { runner_id: String },

    /// No registration arrived in time.
    #[snafu(display("No registration from {peer} within {}s", timeout.as_secs()))]
    HandshakeTimeout { peer: String, timeout: Duration },

    /// The runner is not waiting for a connection.
    #[snafu(display("Runner {runner_id} cannot accept a connection in state {state}"))]
    NotAttachable {
        runner_id: String,
        state: RunnerState,
    },
}

impl RegistrationError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::ClosedEarly { .. } => "closed_early",
            Self::UnexpectedMessage { .. } => "unexpected_message",
            Self::UnknownRunner { .. } => "unknown_runner",
            Self::HandshakeTimeout { .. } => "timeout",
            Self::NotAttachable { .. } => "not_attachable",
        }
    }
}

/// Failures to launch a worker process for a runner.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LaunchError {
    /// The configured runner command is empty.
    #[snafu(display("Runner command is empty"))]
    EmptyCommand,

    /// The registration server is not bound yet, so workers could not dial back.
    #[snafu(display("Registration server is not listening"))]
    NotListening,

    /// Spawning the worker process failed.
    #[snafu(display("Failed to spawn '{program}' for module '{module}': {source}"))]
    Spawn {
        program: String,
        module: String,
        source: std::io::Error,
    },
}

/// Failures of flow lifecycle operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FlowError {
    /// A brick of the flow could not launch its runner.
    #[snafu(display("Flow '{flow}': brick '{brick}' failed to launch a runner: {source}"))]
    Launch {
        flow: String,
        brick: String,
        source: LaunchError,
    },
}

/// Failures reading a worker's startup parameters.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WorkerEnvError {
    /// A required environment variable is not set.
    #[snafu(display("Required environment variable {name} is not set"))]
    MissingVariable { name: &'static str },
}

/// Top-level control peer errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ControlPeerError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// The registration server could not bind.
    #[snafu(display("Failed to bind registration server to {address}: {source}"))]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// The control API could not bind.
    #[snafu(display("Failed to bind control API to {address}: {source}"))]
    ApiBind {
        address: String,
        source: std::io::Error,
    },

    /// No flow has this identifier or name.
    #[snafu(display("Unknown flow '{id}'"))]
    UnknownFlow { id: String },

    /// A flow lifecycle operation failed.
    #[snafu(display("{source}"))]
    Flow { source: FlowError },

    /// Some flows failed to start.
    #[snafu(display("Failed to start flows: {}", flows.join(", ")))]
    StartFlows { flows: Vec<String> },
}

impl From<ConfigError> for ControlPeerError {
    fn from(source: ConfigError) -> Self {
        ControlPeerError::Config { source }
    }
}

impl From<FlowError> for ControlPeerError {
    fn from(source: FlowError) -> Self {
        ControlPeerError::Flow { source }
    }
}
