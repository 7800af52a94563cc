//! Configuration plumbing shared by every brickflow binary.

mod loader;
mod path;
mod vars;

pub use loader::{Mergeable, load_from_paths};
pub use path::{CliArgs, ConfigPath, is_yaml_file};
pub use vars::{InterpolationResult, interpolate, interpolate_with};

use serde::{Deserialize, Serialize};

use crate::metrics::DEFAULT_METRICS_ADDR;

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
        }
    }
}

impl MetricsConfig {
    /// Merge values from another MetricsConfig (last non-default wins).
    pub fn merge_from(&mut self, other: Self) {
        if other.address != default_metrics_address() {
            self.address = other.address;
        }
    }
}

fn default_metrics_address() -> String {
    DEFAULT_METRICS_ADDR.to_string()
}
