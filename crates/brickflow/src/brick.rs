//! Bricks: named pipeline stages and the runners that execute them.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::context::RunnerContext;
use crate::error::LaunchError;
use crate::id::{BrickId, FlowId, RunnerId};
use crate::runner::{BrickRunner, RunnerState};
use crate::status::{BrickStatus, RunnerInfo};

/// One stage of a flow, bound to a worker module.
///
/// A brick owns its runners. `start` adds one runner, so starting a brick
/// repeatedly scales it out. `output` is the next brick in the chain; the
/// chain only ever points downstream, so bricks form no reference cycles.
pub struct Brick {
    id: BrickId,
    name: String,
    module: String,
    flow_id: FlowId,
    flow: String,
    inlet: bool,
    output: Option<Arc<Brick>>,
    runners: Mutex<Vec<Arc<BrickRunner>>>,
    /// Fired whenever a runner is added, removed or changes state.
    changed: Arc<Notify>,
    context: Arc<RunnerContext>,
}

impl Brick {
    pub fn new(
        flow_id: FlowId,
        flow: impl Into<String>,
        name: impl Into<String>,
        module: impl Into<String>,
        inlet: bool,
        output: Option<Arc<Brick>>,
        context: Arc<RunnerContext>,
    ) -> Self {
        Self {
            id: BrickId::generate(),
            name: name.into(),
            module: module.into(),
            flow_id,
            flow: flow.into(),
            inlet,
            output,
            runners: Mutex::new(Vec::new()),
            changed: Arc::new(Notify::new()),
            context,
        }
    }

    pub fn id(&self) -> &BrickId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    pub fn flow_name(&self) -> &str {
        &self.flow
    }

    /// Whether this brick is the entry point of its flow.
    pub fn is_inlet(&self) -> bool {
        self.inlet
    }

    /// The next brick in the chain.
    pub fn output(&self) -> Option<&Arc<Brick>> {
        self.output.as_ref()
    }

    pub(crate) fn change_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    /// Snapshot of the owned runners, oldest first.
    pub async fn runners(&self) -> Vec<Arc<BrickRunner>> {
        self.runners.lock().await.clone()
    }

    pub async fn start(&self) -> Result<Arc<BrickRunner>, LaunchError> {
        self.start_new_runner().await
    }

    /// Create a runner, register it and launch its worker.
    ///
    /// The runner is in the registry before its worker exists, so the worker
    /// can never dial back before it can be found. If the launch fails the
    /// runner is removed again.
    pub async fn start_new_runner(&self) -> Result<Arc<BrickRunner>, LaunchError> {
        let ctx = self.context.as_ref();
        let runner = loop {
            let runner = Arc::new(BrickRunner::new(
                RunnerId::generate(),
                self,
                ctx.stop_timeout(),
            ));
            if ctx.registry().insert(Arc::clone(&runner)) {
                break runner;
            }
        };

        self.runners.lock().await.push(Arc::clone(&runner));
        self.changed.notify_waiters();

        if let Err(e) = runner.start(ctx).await {
            warn!(
                flow = %self.flow,
                brick = %self.name,
                runner = %runner.id(),
                error = %e,
                "Failed to launch runner"
            );
            self.stop_runner(runner.id()).await;
            return Err(e);
        }

        debug!(flow = %self.flow, brick = %self.name, runner = %runner.id(), "Runner added");
        Ok(runner)
    }

    /// Stop one runner and forget it. Returns `false` if it is not owned here.
    pub async fn stop_runner(&self, id: &RunnerId) -> bool {
        let runner = self
            .runners
            .lock()
            .await
            .iter()
            .find(|runner| runner.id() == id)
            .cloned();
        let Some(runner) = runner else {
            return false;
        };

        runner.stop().await;
        self.runners
            .lock()
            .await
            .retain(|owned| !Arc::ptr_eq(owned, &runner));
        self.context.registry().remove(id.as_str());
        self.changed.notify_waiters();
        true
    }

    /// Stop every runner, waiting for all of them, and deregister them.
    pub async fn stop(&self) {
        let runners = self.runners().await;
        if runners.is_empty() {
            return;
        }

        info!(flow = %self.flow, brick = %self.name, runners = runners.len(), "Stopping brick");
        join_all(runners.iter().map(|runner| runner.stop())).await;

        self.runners
            .lock()
            .await
            .retain(|owned| !runners.iter().any(|stopped| Arc::ptr_eq(owned, stopped)));
        for runner in &runners {
            self.context.registry().remove(runner.id().as_str());
        }
        self.changed.notify_waiters();
    }

    /// Wait for the first ready runner.
    ///
    /// Suspends while the brick has no runner at all as well as while none of
    /// its runners is ready yet.
    pub async fn runner_available(&self) -> Arc<BrickRunner> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register for wakeups before looking, so a change between the
            // check and the await is not missed.
            notified.as_mut().enable();

            if let Some(runner) = self.ready_runner().await {
                return runner;
            }
            notified.await;
        }
    }

    /// Input address of the first ready runner, waiting for one if needed.
    pub async fn ready_address(&self) -> String {
        loop {
            if let Some(address) = self.runner_available().await.input_address() {
                return address;
            }
        }
    }

    async fn ready_runner(&self) -> Option<Arc<BrickRunner>> {
        self.runners
            .lock()
            .await
            .iter()
            .find(|runner| runner.state() == RunnerState::Ready)
            .cloned()
    }

    pub async fn status(&self) -> BrickStatus {
        let runners = self
            .runners()
            .await
            .iter()
            .map(|runner| {
                let status = runner.status();
                RunnerInfo {
                    id: runner.id().to_string(),
                    state: status.state,
                    input_address: status.input_address,
                    failure: status.failure,
                }
            })
            .collect();

        BrickStatus {
            id: self.id.to_string(),
            name: self.name.clone(),
            module: self.module.clone(),
            inlet: self.inlet,
            output: self.output.as_ref().map(|brick| brick.name.clone()),
            runners,
        }
    }
}

impl std::fmt::Debug for Brick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Brick")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("module", &self.module)
            .field("flow", &self.flow)
            .field("inlet", &self.inlet)
            .field("output", &self.output.as_ref().map(|brick| &brick.name))
            .finish_non_exhaustive()
    }
}
