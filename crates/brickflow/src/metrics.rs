//! Internal events for runner and flow lifecycle metrics.
//!
//! Every metric carries `flow` and `brick` labels so per-stage behaviour can
//! be told apart when several flows run in one control peer.

use std::time::Duration;

use brickflow_core::metrics::events::InternalEvent;
use metrics::{counter, gauge, histogram};
use tracing::trace;

use crate::flow::FlowState;

/// A worker process was launched for a runner.
pub struct RunnerLaunched {
    pub flow: String,
    pub brick: String,
}

impl InternalEvent for RunnerLaunched {
    fn emit(self) {
        trace!(flow = %self.flow, brick = %self.brick, "Runner launched");
        counter!("brickflow_runners_launched_total", "flow" => self.flow, "brick" => self.brick)
            .increment(1);
    }
}

/// A worker dialed back and was attached to its runner.
pub struct RunnerRegistered {
    pub flow: String,
    pub brick: String,
    /// Time from launch to registration.
    pub elapsed: Duration,
}

impl InternalEvent for RunnerRegistered {
    fn emit(self) {
        trace!(
            flow = %self.flow,
            brick = %self.brick,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "Runner registered"
        );
        histogram!(
            "brickflow_runner_registration_seconds",
            "flow" => self.flow,
            "brick" => self.brick
        )
        .record(self.elapsed.as_secs_f64());
    }
}

/// A runner published its input address.
pub struct RunnerReady {
    pub flow: String,
    pub brick: String,
}

impl InternalEvent for RunnerReady {
    fn emit(self) {
        trace!(flow = %self.flow, brick = %self.brick, "Runner ready");
        counter!("brickflow_runners_ready_total", "flow" => self.flow, "brick" => self.brick)
            .increment(1);
    }
}

/// Point in the runner lifecycle where a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Before the worker registered.
    Registration,
    /// Registered, but no input address yet.
    Startup,
    /// After the runner was ready.
    Running,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Registration => "registration",
            FailureStage::Startup => "startup",
            FailureStage::Running => "running",
        }
    }
}

/// A runner's worker died or disconnected without being asked to stop.
pub struct RunnerFailed {
    pub flow: String,
    pub brick: String,
    pub stage: FailureStage,
}

impl InternalEvent for RunnerFailed {
    fn emit(self) {
        trace!(
            flow = %self.flow,
            brick = %self.brick,
            stage = self.stage.as_str(),
            "Runner failed"
        );
        counter!(
            "brickflow_runners_failed_total",
            "flow" => self.flow,
            "brick" => self.brick,
            "stage" => self.stage.as_str()
        )
        .increment(1);
    }
}

/// A runner finished stopping.
pub struct RunnerStopped {
    pub flow: String,
    pub brick: String,
    pub duration: Duration,
}

impl InternalEvent for RunnerStopped {
    fn emit(self) {
        trace!(
            flow = %self.flow,
            brick = %self.brick,
            duration_ms = self.duration.as_millis() as u64,
            "Runner stopped"
        );
        histogram!("brickflow_runner_stop_seconds", "flow" => self.flow, "brick" => self.brick)
            .record(self.duration.as_secs_f64());
    }
}

/// An accepted connection did not complete registration.
pub struct RegistrationRejected {
    pub reason: &'static str,
}

impl InternalEvent for RegistrationRejected {
    fn emit(self) {
        trace!(reason = self.reason, "Registration rejected");
        counter!("brickflow_registrations_rejected_total", "reason" => self.reason).increment(1);
    }
}

/// A flow changed state.
pub struct FlowStateChanged {
    pub flow: String,
    pub state: FlowState,
}

impl InternalEvent for FlowStateChanged {
    fn emit(self) {
        trace!(flow = %self.flow, state = %self.state, "Flow state changed");
        let active = if self.state == FlowState::Active { 1.0 } else { 0.0 };
        gauge!("brickflow_flow_active", "flow" => self.flow).set(active);
    }
}

/// A flow could not be started and was rolled back.
pub struct FlowStartFailed {
    pub flow: String,
    pub brick: String,
}

impl InternalEvent for FlowStartFailed {
    fn emit(self) {
        trace!(flow = %self.flow, brick = %self.brick, "Flow start failed");
        counter!("brickflow_flow_start_failures_total", "flow" => self.flow, "brick" => self.brick)
            .increment(1);
    }
}

/// Number of runners currently in the registry.
pub struct ActiveRunners {
    pub count: usize,
}

impl InternalEvent for ActiveRunners {
    fn emit(self) {
        trace!(count = self.count, "Active runners");
        gauge!("brickflow_active_runners").set(self.count as f64);
    }
}

/// A worker reported a named event.
pub struct WorkerEventReceived {
    pub flow: String,
    pub brick: String,
    pub name: String,
}

impl InternalEvent for WorkerEventReceived {
    fn emit(self) {
        trace!(flow = %self.flow, brick = %self.brick, name = %self.name, "Worker event");
        counter!(
            "brickflow_worker_events_total",
            "flow" => self.flow,
            "brick" => self.brick,
            "name" => self.name
        )
        .increment(1);
    }
}
