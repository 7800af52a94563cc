//! Flows: ordered chains of bricks with a shared lifecycle.

use std::fmt;
use std::sync::Arc;

use brickflow_core::emit;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{error, info};

use crate::brick::Brick;
use crate::context::RunnerContext;
use crate::error::{ConfigError, FlowError};
use crate::id::FlowId;
use crate::metrics::{FlowStartFailed, FlowStateChanged};
use crate::status::FlowStatus;

/// Whether a flow's bricks are running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Active,
    Inactive,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Active => f.write_str("active"),
            FlowState::Inactive => f.write_str("inactive"),
        }
    }
}

/// A configured pipeline: bricks in chain order plus runtime state.
pub struct Flow {
    id: FlowId,
    name: String,
    bricks: Vec<Arc<Brick>>,
    state: watch::Sender<FlowState>,
    /// Serializes `start` and `stop`.
    lifecycle: Mutex<()>,
}

impl Flow {
    /// Build a flow from `(brick name, module)` pairs in chain order.
    ///
    /// The first brick is the inlet and each brick's output is the next one.
    /// Nothing is launched.
    pub fn new(
        name: impl Into<String>,
        chain: &[(String, String)],
        context: Arc<RunnerContext>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if chain.is_empty() {
            return Err(ConfigError::EmptyChain { flow: name });
        }

        let id = FlowId::generate();

        // Built back to front so every brick can hold its successor.
        let mut bricks = Vec::with_capacity(chain.len());
        let mut output: Option<Arc<Brick>> = None;
        for (position, (brick, module)) in chain.iter().enumerate().rev() {
            let brick = Arc::new(Brick::new(
                id.clone(),
                name.as_str(),
                brick.as_str(),
                module.as_str(),
                position == 0,
                output.take(),
                Arc::clone(&context),
            ));
            output = Some(Arc::clone(&brick));
            bricks.push(brick);
        }
        bricks.reverse();

        let (state, _) = watch::channel(FlowState::Inactive);
        Ok(Self {
            id,
            name,
            bricks,
            state,
            lifecycle: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &FlowId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FlowState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.state.subscribe()
    }

    /// Bricks in chain order.
    pub fn bricks(&self) -> &[Arc<Brick>] {
        &self.bricks
    }

    pub fn brick(&self, name: &str) -> Option<&Arc<Brick>> {
        self.bricks.iter().find(|brick| brick.name() == name)
    }

    /// The entry brick of the chain.
    pub fn inlet(&self) -> &Arc<Brick> {
        &self.bricks[0]
    }

    /// Start one runner per brick, in chain order.
    ///
    /// Starting an active flow scales every brick out by one more runner. If
    /// any brick fails to launch, the runners started by this call are
    /// stopped again and the flow keeps its previous state.
    pub async fn start(&self) -> Result<(), FlowError> {
        let _lifecycle = self.lifecycle.lock().await;
        info!(flow = %self.name, bricks = self.bricks.len(), "Starting flow");

        let mut started = Vec::with_capacity(self.bricks.len());
        for brick in &self.bricks {
            match brick.start().await {
                Ok(runner) => started.push((brick, runner)),
                Err(source) => {
                    error!(
                        flow = %self.name,
                        brick = %brick.name(),
                        error = %source,
                        "Flow start failed, rolling back"
                    );
                    for (brick, runner) in started.iter().rev() {
                        brick.stop_runner(runner.id()).await;
                    }
                    emit!(FlowStartFailed {
                        flow: self.name.clone(),
                        brick: brick.name().to_string(),
                    });
                    return Err(FlowError::Launch {
                        flow: self.name.clone(),
                        brick: brick.name().to_string(),
                        source,
                    });
                }
            }
        }

        self.set_state(FlowState::Active);
        info!(flow = %self.name, "Flow started");
        Ok(())
    }

    /// Stop every brick in chain order and mark the flow inactive.
    ///
    /// When this returns no runner of the flow is left, in the bricks or in
    /// the registry. Stopping an inactive flow is a no-op.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        info!(flow = %self.name, "Stopping flow");

        for brick in &self.bricks {
            brick.stop().await;
        }

        self.set_state(FlowState::Inactive);
        info!(flow = %self.name, "Flow stopped");
    }

    fn set_state(&self, state: FlowState) {
        if self.state.send_replace(state) != state {
            emit!(FlowStateChanged {
                flow: self.name.clone(),
                state,
            });
        }
    }

    pub async fn status(&self) -> FlowStatus {
        let mut bricks = Vec::with_capacity(self.bricks.len());
        for brick in &self.bricks {
            bricks.push(brick.status().await);
        }
        FlowStatus {
            id: self.id.to_string(),
            name: self.name.clone(),
            state: self.state(),
            bricks,
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("bricks", &self.bricks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunnerState;
    use crate::testing::{IdleLauncher, bound_context_with};

    fn chain(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(brick, module)| (brick.to_string(), module.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_chain_rejected() {
        let ctx = bound_context_with(Arc::new(IdleLauncher::default()));
        let err = Flow::new("f1", &[], ctx).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyChain { .. }));
    }

    #[test]
    fn test_chain_wiring() {
        let ctx = bound_context_with(Arc::new(IdleLauncher::default()));
        let flow = Flow::new("f1", &chain(&[("a", "m1"), ("b", "m2"), ("c", "m3")]), ctx).unwrap();

        assert_eq!(flow.state(), FlowState::Inactive);
        let names: Vec<_> = flow.bricks().iter().map(|b| b.name()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let inlets: Vec<_> = flow.bricks().iter().filter(|b| b.is_inlet()).collect();
        assert_eq!(inlets.len(), 1);
        assert_eq!(flow.inlet().name(), "a");

        assert!(Arc::ptr_eq(flow.bricks()[0].output().unwrap(), &flow.bricks()[1]));
        assert!(Arc::ptr_eq(flow.bricks()[1].output().unwrap(), &flow.bricks()[2]));
        assert!(flow.bricks()[2].output().is_none());
        assert!(flow.bricks().iter().all(|b| b.flow_id() == flow.id()));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let ctx = bound_context_with(Arc::new(IdleLauncher::default()));
        let flow = Flow::new("f1", &chain(&[("a", "m1"), ("b", "m2")]), ctx.clone()).unwrap();

        flow.start().await.unwrap();
        assert_eq!(flow.state(), FlowState::Active);
        for brick in flow.bricks() {
            let runners = brick.runners().await;
            assert_eq!(runners.len(), 1);
            assert_eq!(runners[0].state(), RunnerState::Starting);
        }
        assert_eq!(ctx.registry().len(), 2);

        flow.stop().await;
        assert_eq!(flow.state(), FlowState::Inactive);
        assert!(ctx.registry().is_empty());

        flow.stop().await;
        assert_eq!(flow.state(), FlowState::Inactive);
        for brick in flow.bricks() {
            assert!(brick.runners().await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let ctx = bound_context_with(Arc::new(IdleLauncher::failing_on("broken")));
        let flow = Flow::new("f1", &chain(&[("a", "m1"), ("b", "broken")]), ctx.clone()).unwrap();

        let err = flow.start().await.unwrap_err();
        assert!(err.to_string().contains("'b'"));
        assert_eq!(flow.state(), FlowState::Inactive);
        assert!(ctx.registry().is_empty());
        assert!(flow.bricks()[0].runners().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_active_flow_scales_out() {
        let ctx = bound_context_with(Arc::new(IdleLauncher::default()));
        let flow = Flow::new("f1", &chain(&[("a", "m1")]), ctx.clone()).unwrap();

        flow.start().await.unwrap();
        flow.start().await.unwrap();
        assert_eq!(flow.inlet().runners().await.len(), 2);
        assert_eq!(ctx.registry().len(), 2);

        flow.stop().await;
        assert!(ctx.registry().is_empty());
    }

    #[tokio::test]
    async fn test_status_lists_bricks_in_order() {
        let ctx = bound_context_with(Arc::new(IdleLauncher::default()));
        let flow = Flow::new("f1", &chain(&[("a", "m1"), ("b", "m2")]), ctx).unwrap();
        let status = flow.status().await;
        assert_eq!(status.name, "f1");
        assert_eq!(status.state, FlowState::Inactive);
        assert_eq!(status.bricks[0].output.as_deref(), Some("b"));
        assert_eq!(status.bricks[1].output, None);
    }
}
