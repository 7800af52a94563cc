//! Serializable snapshots of the control peer's flows, bricks and runners.

use serde::Serialize;

use crate::flow::FlowState;
use crate::runner::RunnerState;

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    /// Address workers register at, once bound.
    pub registration_address: Option<String>,
    /// Runners currently in the registry, across all flows.
    pub runners: usize,
    pub flows: Vec<FlowStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowStatus {
    pub id: String,
    pub name: String,
    pub state: FlowState,
    /// Bricks in chain order.
    pub bricks: Vec<BrickStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrickStatus {
    pub id: String,
    pub name: String,
    pub module: String,
    pub inlet: bool,
    /// Name of the downstream brick.
    pub output: Option<String>,
    pub runners: Vec<RunnerInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerInfo {
    pub id: String,
    pub state: RunnerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}
