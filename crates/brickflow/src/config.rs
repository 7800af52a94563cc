//! Configuration for the brickflow control peer.
//!
//! The topology uses the `Flows`/`Bricks` layout:
//!
//! ```yaml
//! Flows:
//!   - Name: wordcount
//!     Chain: [reader, tokenize, count]
//! Bricks:
//!   - Name: reader
//!     Module: bricks.reader
//!   - Name: tokenize
//!     Module: bricks.tokenize
//!   - Name: count
//!     Module: bricks.count
//!
//! control:
//!   registration_address: 127.0.0.1:0
//!   api_address: 127.0.0.1:8080
//!   transport: ${KAFKA_BROKERS:-localhost:9092}
//! runner:
//!   command: [python, -m, brick_runner]
//! ```
//!
//! Several files may be given; their flows and bricks are concatenated and the
//! other sections take the last explicitly set value.

use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

pub use brickflow_core::config::{ConfigPath, MetricsConfig, Mergeable, interpolate};
use brickflow_core::config::load_from_paths;
use brickflow_core::error::YamlParseSnafu;

use crate::connection::DEFAULT_MAX_FRAME_BYTES;
use crate::error::ConfigError;

/// One pipeline: a name and the bricks it chains, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowConfig {
    #[serde(rename = "Name")]
    pub name: String,
    /// Brick names, inlet first.
    #[serde(rename = "Chain")]
    pub chain: Vec<String>,
}

/// A brick declaration: a name and the worker module it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrickConfig {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Module")]
    pub module: String,
}

/// Control peer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    /// Address of the registration server workers dial back to.
    #[serde(default = "default_registration_address")]
    pub registration_address: String,
    /// Address of the HTTP control API. Disabled when unset.
    #[serde(default)]
    pub api_address: Option<String>,
    /// Message-transport connection string, passed to workers untouched.
    #[serde(default)]
    pub transport: String,
    /// Seconds a worker gets to exit after a shutdown request.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Seconds an accepted connection gets to send its registration.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Largest accepted wire frame.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            registration_address: default_registration_address(),
            api_address: None,
            transport: String::new(),
            stop_timeout_secs: default_stop_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ControlConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Merge values from another ControlConfig (last non-default wins).
    pub fn merge_from(&mut self, other: Self) {
        let defaults = Self::default();
        if other.registration_address != defaults.registration_address {
            self.registration_address = other.registration_address;
        }
        if other.api_address.is_some() {
            self.api_address = other.api_address;
        }
        if !other.transport.is_empty() {
            self.transport = other.transport;
        }
        if other.stop_timeout_secs != defaults.stop_timeout_secs {
            self.stop_timeout_secs = other.stop_timeout_secs;
        }
        if other.handshake_timeout_secs != defaults.handshake_timeout_secs {
            self.handshake_timeout_secs = other.handshake_timeout_secs;
        }
        if other.max_frame_bytes != defaults.max_frame_bytes {
            self.max_frame_bytes = other.max_frame_bytes;
        }
    }
}

fn default_registration_address() -> String {
    "127.0.0.1:0".to_string()
}

fn default_stop_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

/// How worker processes are launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Program and leading arguments; the brick's module is appended.
    #[serde(default = "default_runner_command")]
    pub command: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
        }
    }
}

fn default_runner_command() -> Vec<String> {
    vec!["brick-runner".to_string()]
}

/// Main configuration for brickflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "Flows", default)]
    pub flows: Vec<FlowConfig>,
    #[serde(rename = "Bricks", default)]
    pub bricks: Vec<BrickConfig>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load, merge and validate configuration from files and directories.
    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config: Self = load_from_paths(paths)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a single YAML document, interpolating the environment.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let result = interpolate(contents);
        if !result.is_ok() {
            return Err(ConfigError::EnvInterpolation {
                message: result.errors.join("\n"),
            });
        }

        let config = Self::parse_yaml(&result.text)?;
        config.validate()?;
        Ok(config)
    }

    /// Modules by brick name, in declaration order.
    pub fn brick_modules(&self) -> IndexMap<&str, &str> {
        self.bricks
            .iter()
            .map(|brick| (brick.name.as_str(), brick.module.as_str()))
            .collect()
    }

    /// Resolve a flow's chain into `(brick, module)` pairs.
    pub fn resolve_chain(&self, flow: &FlowConfig) -> Result<Vec<(String, String)>, ConfigError> {
        let modules = self.brick_modules();
        flow.chain
            .iter()
            .map(|brick| match modules.get(brick.as_str()) {
                Some(module) => Ok((brick.clone(), module.to_string())),
                None => Err(ConfigError::UnknownBrick {
                    flow: flow.name.clone(),
                    brick: brick.clone(),
                }),
            })
            .collect()
    }

    /// Check the topology and settings, reporting every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let duplicate_flows = duplicates(self.flows.iter().map(|f| f.name.as_str()));
        if !duplicate_flows.is_empty() {
            errors.push(ConfigError::DuplicateFlows {
                names: duplicate_flows,
            });
        }
        let duplicate_bricks = duplicates(self.bricks.iter().map(|b| b.name.as_str()));
        if !duplicate_bricks.is_empty() {
            errors.push(ConfigError::DuplicateBricks {
                names: duplicate_bricks,
            });
        }

        for brick in &self.bricks {
            if brick.module.trim().is_empty() {
                errors.push(ConfigError::EmptyModule {
                    brick: brick.name.clone(),
                });
            }
        }

        for flow in &self.flows {
            if flow.chain.is_empty() {
                errors.push(ConfigError::EmptyChain {
                    flow: flow.name.clone(),
                });
                continue;
            }
            if let Err(e) = self.resolve_chain(flow) {
                errors.push(e);
            }
            if let Some(brick) = duplicates(flow.chain.iter().map(String::as_str)).pop() {
                errors.push(ConfigError::DuplicateChainEntry {
                    flow: flow.name.clone(),
                    brick,
                });
            }
        }

        if self.runner.command.is_empty() {
            errors.push(ConfigError::EmptyRunnerCommand);
        }

        let control = &self.control;
        for (setting, value) in [
            ("control.stop_timeout_secs", control.stop_timeout_secs),
            ("control.handshake_timeout_secs", control.handshake_timeout_secs),
            ("control.max_frame_bytes", control.max_frame_bytes as u64),
        ] {
            if value == 0 {
                errors.push(ConfigError::ZeroSetting { setting });
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleErrors {
                errors: errors.iter().map(ToString::to_string).collect(),
            }),
        }
    }
}

impl Mergeable for Config {
    fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).context(YamlParseSnafu)
    }

    fn merge(&mut self, other: Self) -> Result<(), ConfigError> {
        let existing: HashSet<&str> = self.flows.iter().map(|f| f.name.as_str()).collect();
        let clashing: Vec<String> = other
            .flows
            .iter()
            .filter(|f| existing.contains(f.name.as_str()))
            .map(|f| f.name.clone())
            .collect();
        if !clashing.is_empty() {
            return Err(ConfigError::DuplicateFlows { names: clashing });
        }

        let existing: HashSet<&str> = self.bricks.iter().map(|b| b.name.as_str()).collect();
        let clashing: Vec<String> = other
            .bricks
            .iter()
            .filter(|b| existing.contains(b.name.as_str()))
            .map(|b| b.name.clone())
            .collect();
        if !clashing.is_empty() {
            return Err(ConfigError::DuplicateBricks { names: clashing });
        }

        self.flows.extend(other.flows);
        self.bricks.extend(other.bricks);
        self.control.merge_from(other.control);
        if other.runner != RunnerConfig::default() {
            self.runner = other.runner;
        }
        self.metrics.merge_from(other.metrics);
        Ok(())
    }
}

/// Names that occur more than once, each reported once, in first-seen order.
fn duplicates<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut duplicates = Vec::new();
    for name in names {
        if !seen.insert(name) && reported.insert(name) {
            duplicates.push(name.to_string());
        }
    }
    duplicates
}
