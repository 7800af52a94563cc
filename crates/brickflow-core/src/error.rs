//! Common error types for configuration loading and metrics setup.

use std::path::PathBuf;

use snafu::prelude::*;

// ============ Config Errors ============

/// Errors that can occur while loading and validating configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to read a configuration directory.
    #[snafu(display("Failed to read directory {}: {source}", path.display()))]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Unsupported config file format.
    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: PathBuf },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// The same flow name is declared more than once.
    #[snafu(display("Duplicate flow names: {}", names.join(", ")))]
    DuplicateFlows { names: Vec<String> },

    /// The same brick name is declared more than once.
    #[snafu(display("Duplicate brick names: {}", names.join(", ")))]
    DuplicateBricks { names: Vec<String> },

    /// A flow declares an empty chain.
    #[snafu(display("Flow '{flow}' has an empty chain"))]
    EmptyChain { flow: String },

    /// A chain references a brick that is not declared.
    #[snafu(display("Flow '{flow}' references unknown brick '{brick}'"))]
    UnknownBrick { flow: String, brick: String },

    /// A chain lists the same brick twice, which would turn the chain into a cycle.
    #[snafu(display("Flow '{flow}' lists brick '{brick}' more than once"))]
    DuplicateChainEntry { flow: String, brick: String },

    /// A brick has no module to run.
    #[snafu(display("Brick '{brick}' has an empty module"))]
    EmptyModule { brick: String },

    /// The runner command is empty.
    #[snafu(display("runner.command must contain at least the program to execute"))]
    EmptyRunnerCommand,

    /// A setting that must be positive is zero.
    #[snafu(display("{setting} must be greater than zero"))]
    ZeroSetting { setting: &'static str },

    /// Multiple configuration errors occurred.
    #[snafu(display("Multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to parse the metrics address.
    #[snafu(display("Failed to parse metrics address '{address}': {source}"))]
    AddressParse {
        address: String,
        source: std::net::AddrParseError,
    },

    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics server already initialized (double-init attempted).
    #[snafu(display("Metrics server already initialized"))]
    AlreadyInitialized,

    /// Metrics server not initialized (controller accessed before init).
    #[snafu(display("Metrics server not initialized"))]
    NotInitialized,
}
