//! Brick runners: one live worker process per runner.
//!
//! A runner walks through `starting -> registered -> ready` as its worker
//! launches, dials back and reports its input address, and ends in `stopped`
//! after [`BrickRunner::stop`]. A worker that dies or disconnects on its own
//! moves the runner to `failed` instead; failed runners are not restarted and
//! stay visible in their brick until it is stopped.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use brickflow_core::emit;
use futures::future::OptionFuture;
use serde::Serialize;
use snafu::OptionExt;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::brick::Brick;
use crate::connection::Connection;
use crate::context::RunnerContext;
use crate::error::{LaunchError, NotAttachableSnafu, NotListeningSnafu, RegistrationError};
use crate::id::{BrickId, RunnerId};
use crate::launcher::{WorkerExit, WorkerSpec};
use crate::metrics::{
    FailureStage, RunnerFailed, RunnerLaunched, RunnerReady, RunnerRegistered, RunnerStopped,
    WorkerEventReceived,
};
use crate::wire::{LogLevel, Message};

/// Lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    /// Worker launch requested, no connection yet.
    Starting,
    /// The worker dialed back and its connection is attached.
    Registered,
    /// The worker reported its input address.
    Ready,
    Stopping,
    Stopped,
    /// The worker exited or disconnected without being asked to.
    Failed,
}

impl RunnerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerState::Starting => "starting",
            RunnerState::Registered => "registered",
            RunnerState::Ready => "ready",
            RunnerState::Stopping => "stopping",
            RunnerState::Stopped => "stopped",
            RunnerState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable runner status, published through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerStatus {
    pub state: RunnerState,
    pub input_address: Option<String>,
    /// Why the runner failed, if it did.
    pub failure: Option<String>,
}

impl Default for RunnerStatus {
    fn default() -> Self {
        Self {
            state: RunnerState::Starting,
            input_address: None,
            failure: None,
        }
    }
}

#[derive(Default)]
struct RunnerTasks {
    /// Waits for the worker to exit.
    supervisor: Option<JoinHandle<()>>,
    /// Runs `process_messages` once the worker registered.
    session: Option<JoinHandle<()>>,
}

/// Kill switch of a launched worker, and the task that owns it.
struct WorkerControl {
    kill: CancellationToken,
    exit: AbortHandle,
}

/// How a message session ended.
enum SessionEnd {
    Stopped,
    Closed,
    Broken(String),
}

/// One worker process instance for a [`Brick`].
///
/// The owning brick is referenced by identifier and name only. The downstream
/// brick (`output`) is held so the runner can route its worker's output once
/// a downstream runner is ready.
pub struct BrickRunner {
    id: RunnerId,
    flow: String,
    brick_id: BrickId,
    brick: String,
    module: String,
    inlet: bool,
    output: Option<Arc<Brick>>,
    status: watch::Sender<RunnerStatus>,
    brick_changed: Arc<Notify>,
    stop_requested: AtomicBool,
    session: CancellationToken,
    /// Set once the worker is launched.
    worker: OnceLock<WorkerControl>,
    tasks: Mutex<RunnerTasks>,
    stop_timeout: Duration,
    created_at: Instant,
}

impl BrickRunner {
    /// Create a runner for `brick`. Nothing is launched until [`start`](Self::start).
    pub fn new(id: RunnerId, brick: &Brick, stop_timeout: Duration) -> Self {
        let (status, _) = watch::channel(RunnerStatus::default());
        Self {
            id,
            flow: brick.flow_name().to_string(),
            brick_id: brick.id().clone(),
            brick: brick.name().to_string(),
            module: brick.module().to_string(),
            inlet: brick.is_inlet(),
            output: brick.output().cloned(),
            status,
            brick_changed: brick.change_notifier(),
            stop_requested: AtomicBool::new(false),
            session: CancellationToken::new(),
            worker: OnceLock::new(),
            tasks: Mutex::new(RunnerTasks::default()),
            stop_timeout,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &RunnerId {
        &self.id
    }

    pub fn brick_id(&self) -> &BrickId {
        &self.brick_id
    }

    pub fn brick_name(&self) -> &str {
        &self.brick
    }

    pub fn flow_name(&self) -> &str {
        &self.flow
    }

    pub fn state(&self) -> RunnerState {
        self.status.borrow().state
    }

    pub fn status(&self) -> RunnerStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<RunnerStatus> {
        self.status.subscribe()
    }

    /// The worker's input address. Only available while the runner is ready.
    pub fn input_address(&self) -> Option<String> {
        let status = self.status.borrow();
        match status.state {
            RunnerState::Ready => status.input_address.clone(),
            _ => None,
        }
    }

    /// Wait until the runner is ready and return its input address.
    ///
    /// Returns the state the runner ended up in if it failed or was stopped
    /// before becoming ready.
    pub async fn wait_ready(&self) -> Result<String, RunnerState> {
        let mut status = self.status.subscribe();
        let settled = status
            .wait_for(|s| !matches!(s.state, RunnerState::Starting | RunnerState::Registered))
            .await
            .map(|s| (*s).clone());

        match settled {
            Ok(RunnerStatus {
                state: RunnerState::Ready,
                input_address: Some(address),
                ..
            }) => Ok(address),
            Ok(status) => Err(status.state),
            Err(_) => Err(self.state()),
        }
    }

    /// Launch the worker process. Returns as soon as it is spawned.
    pub async fn start(self: &Arc<Self>, ctx: &RunnerContext) -> Result<(), LaunchError> {
        let registration_address = ctx.registration_address().context(NotListeningSnafu)?;

        let spec = WorkerSpec {
            runner_id: self.id.clone(),
            flow: self.flow.clone(),
            brick: self.brick.clone(),
            module: self.module.clone(),
            inlet: self.inlet,
            registration_address,
            transport: ctx.transport().to_string(),
        };
        let handle = ctx.launcher().launch(&spec)?;

        let kill = handle.kill_token();
        let exit = handle.abort_handle();
        let runner = Arc::clone(self);
        let supervisor = tokio::spawn(async move {
            let exit = handle.wait().await;
            runner.worker_exited(exit);
        });

        let _ = self.worker.set(WorkerControl {
            kill: kill.clone(),
            exit,
        });
        self.tasks.lock().await.supervisor = Some(supervisor);
        if self.stop_requested.load(Ordering::SeqCst) {
            kill.cancel();
        }

        emit!(RunnerLaunched {
            flow: self.flow.clone(),
            brick: self.brick.clone(),
        });
        info!(
            flow = %self.flow,
            brick = %self.brick,
            runner = %self.id,
            module = %self.module,
            "Runner launched"
        );
        Ok(())
    }

    /// Hand a registered connection to this runner.
    ///
    /// Moves the runner from `starting` to `registered` and spawns
    /// [`process_messages`](Self::process_messages). Any other state is
    /// rejected and the connection is dropped by the caller.
    pub async fn attach(self: &Arc<Self>, connection: Connection) -> Result<(), RegistrationError> {
        let mut tasks = self.tasks.lock().await;

        if !self.transition(&[RunnerState::Starting], RunnerState::Registered) {
            return NotAttachableSnafu {
                runner_id: self.id.to_string(),
                state: self.state(),
            }
            .fail();
        }

        emit!(RunnerRegistered {
            flow: self.flow.clone(),
            brick: self.brick.clone(),
            elapsed: self.created_at.elapsed(),
        });
        info!(flow = %self.flow, brick = %self.brick, runner = %self.id, "Runner registered");

        let runner = Arc::clone(self);
        tasks.session = Some(tokio::spawn(runner.process_messages(connection)));
        Ok(())
    }

    /// Interpret the worker's message stream until it ends or the runner stops.
    ///
    /// Transport errors are treated as a disconnect and never returned.
    pub async fn process_messages(self: Arc<Self>, mut connection: Connection) {
        connection.set_label(self.id.as_str());

        let output = self.output.clone();
        let route: OptionFuture<_> = output
            .map(|brick| async move { brick.ready_address().await })
            .into();
        tokio::pin!(route);
        let mut routed = false;

        let end = loop {
            tokio::select! {
                _ = self.session.cancelled() => break SessionEnd::Stopped,

                address = &mut route, if !routed => {
                    routed = true;
                    if let Some(address) = address {
                        debug!(
                            flow = %self.flow,
                            brick = %self.brick,
                            runner = %self.id,
                            %address,
                            "Routing output downstream"
                        );
                        if let Err(e) = connection.send(&Message::ConnectOutput { address }).await {
                            break SessionEnd::Broken(e.to_string());
                        }
                    }
                }

                received = connection.receive() => match received {
                    Ok(Some(message)) => self.handle_message(message),
                    Ok(None) => break SessionEnd::Closed,
                    Err(e) => break SessionEnd::Broken(e.to_string()),
                },
            }
        };

        match end {
            SessionEnd::Stopped => {
                if let Err(e) = connection.send(&Message::Shutdown).await {
                    debug!(runner = %self.id, error = %e, "Worker gone before shutdown request");
                }
                let _ = connection.close().await;
            }
            SessionEnd::Closed if self.stop_requested.load(Ordering::SeqCst) => {
                debug!(runner = %self.id, "Worker disconnected while stopping");
            }
            SessionEnd::Closed => self.fail("worker closed its connection".to_string()),
            SessionEnd::Broken(_) if self.stop_requested.load(Ordering::SeqCst) => {}
            SessionEnd::Broken(reason) => self.fail(format!("connection lost: {reason}")),
        }
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::InputAddress { address } => self.publish_address(address),
            Message::Log { level, message } => self.forward_log(level, &message),
            Message::Event { name } => {
                trace!(runner = %self.id, event = %name, "Worker event");
                emit!(WorkerEventReceived {
                    flow: self.flow.clone(),
                    brick: self.brick.clone(),
                    name,
                });
            }
            other => warn!(
                flow = %self.flow,
                brick = %self.brick,
                runner = %self.id,
                kind = other.kind(),
                "Ignoring unexpected message from worker"
            ),
        }
    }

    fn publish_address(&self, address: String) {
        let mut became_ready = false;
        let updated = self.status.send_if_modified(|status| match status.state {
            RunnerState::Registered => {
                status.state = RunnerState::Ready;
                status.input_address = Some(address.clone());
                became_ready = true;
                true
            }
            RunnerState::Ready => {
                status.input_address = Some(address.clone());
                true
            }
            _ => false,
        });

        if !updated {
            debug!(runner = %self.id, %address, "Ignoring input address after stop");
            return;
        }
        self.brick_changed.notify_waiters();

        if became_ready {
            emit!(RunnerReady {
                flow: self.flow.clone(),
                brick: self.brick.clone(),
            });
            info!(
                flow = %self.flow,
                brick = %self.brick,
                runner = %self.id,
                %address,
                "Runner ready"
            );
        } else {
            warn!(runner = %self.id, %address, "Worker changed its input address");
        }
    }

    fn forward_log(&self, level: LogLevel, message: &str) {
        let (flow, brick, runner) = (&self.flow, &self.brick, &self.id);
        macro_rules! forward {
            ($log:ident) => {
                $log!(
                    target: "brickflow::worker",
                    flow = %flow,
                    brick = %brick,
                    runner = %runner,
                    "{}",
                    message
                )
            };
        }
        match level {
            LogLevel::Error => forward!(error),
            LogLevel::Warn => forward!(warn),
            LogLevel::Info => forward!(info),
            LogLevel::Debug => forward!(debug),
            LogLevel::Trace => forward!(trace),
        }
    }

    fn worker_exited(&self, exit: WorkerExit) {
        if self.stop_requested.load(Ordering::SeqCst) {
            debug!(runner = %self.id, %exit, "Worker exited");
            return;
        }
        self.fail(format!("worker {exit}"));
    }

    /// Mark the runner failed unless it is already stopping or failed.
    fn fail(&self, reason: String) {
        let mut stage = None;
        self.status.send_if_modified(|status| {
            stage = match status.state {
                RunnerState::Starting => Some(FailureStage::Registration),
                RunnerState::Registered => Some(FailureStage::Startup),
                RunnerState::Ready => Some(FailureStage::Running),
                _ => None,
            };
            if stage.is_some() {
                status.state = RunnerState::Failed;
                status.input_address = None;
                status.failure = Some(reason.clone());
            }
            stage.is_some()
        });
        let Some(stage) = stage else {
            return;
        };

        self.brick_changed.notify_waiters();
        self.session.cancel();
        if let Some(worker) = self.worker.get() {
            worker.kill.cancel();
        }

        emit!(RunnerFailed {
            flow: self.flow.clone(),
            brick: self.brick.clone(),
            stage,
        });
        error!(
            flow = %self.flow,
            brick = %self.brick,
            runner = %self.id,
            stage = stage.as_str(),
            %reason,
            "Runner failed"
        );
    }

    /// Stop the runner and its worker.
    ///
    /// A registered worker is asked to shut down and given the stop timeout
    /// to exit before it is killed. A worker that never registered is killed
    /// right away. Every wait is bounded. Calling this again is a no-op that
    /// waits for the first call to finish.
    pub async fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            let mut status = self.status.subscribe();
            let stopped = status.wait_for(|s| s.state == RunnerState::Stopped);
            if timeout(self.stop_timeout * 3 + Duration::from_secs(1), stopped)
                .await
                .is_err()
            {
                warn!(runner = %self.id, "Timed out waiting for runner to stop");
            }
            return;
        }

        let started = Instant::now();
        let mut previous = RunnerState::Stopped;
        self.status.send_modify(|status| {
            previous = status.state;
            status.state = RunnerState::Stopping;
            status.input_address = None;
        });
        self.brick_changed.notify_waiters();
        debug!(runner = %self.id, from = %previous, "Stopping runner");

        let RunnerTasks {
            mut supervisor,
            session,
        } = std::mem::take(&mut *self.tasks.lock().await);
        self.session.cancel();

        if let Some(session) = session {
            self.join_bounded("session", session).await;

            // Give the worker a chance to act on the shutdown request.
            let exited = match supervisor.as_mut() {
                Some(handle) => timeout(self.stop_timeout, handle).await.is_ok(),
                None => true,
            };
            if exited {
                supervisor = None;
            } else {
                warn!(
                    flow = %self.flow,
                    brick = %self.brick,
                    runner = %self.id,
                    "Worker did not exit after shutdown request, killing it"
                );
            }
        }

        if let Some(worker) = self.worker.get() {
            worker.kill.cancel();
        }
        if let Some(supervisor) = supervisor {
            self.join_bounded("supervisor", supervisor).await;
        }
        // A worker that ignored its kill must not outlive the runner.
        if let Some(worker) = self.worker.get() {
            worker.exit.abort();
        }

        self.status.send_modify(|status| status.state = RunnerState::Stopped);
        self.brick_changed.notify_waiters();

        emit!(RunnerStopped {
            flow: self.flow.clone(),
            brick: self.brick.clone(),
            duration: started.elapsed(),
        });
        info!(flow = %self.flow, brick = %self.brick, runner = %self.id, "Runner stopped");
    }

    async fn join_bounded(&self, task: &'static str, mut handle: JoinHandle<()>) {
        if timeout(self.stop_timeout, &mut handle).await.is_err() {
            warn!(
                runner = %self.id,
                task,
                timeout_secs = self.stop_timeout.as_secs_f64(),
                "Runner task did not finish in time, aborting"
            );
            handle.abort();
        }
    }

    /// Move from one of `from` to `to`, waking brick waiters on change.
    fn transition(&self, from: &[RunnerState], to: RunnerState) -> bool {
        let changed = self.status.send_if_modified(|status| {
            if from.contains(&status.state) {
                status.state = to;
                true
            } else {
                false
            }
        });
        if changed {
            self.brick_changed.notify_waiters();
        }
        changed
    }
}

impl fmt::Debug for BrickRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrickRunner")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .field("brick", &self.brick)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{WorkerHandle, WorkerLauncher};
    use crate::testing::{IdleLauncher, bound_context_with, context_with};

    fn runner_for(ctx: &Arc<RunnerContext>) -> Arc<BrickRunner> {
        let brick = Brick::new(
            crate::id::FlowId::new("F-test"),
            "f1",
            "b1",
            "m1",
            true,
            None,
            Arc::clone(ctx),
        );
        Arc::new(BrickRunner::new(
            RunnerId::generate(),
            &brick,
            Duration::from_millis(200),
        ))
    }

    fn worker_pair(runner: &BrickRunner) -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::new(a, runner.id().as_str()),
            Connection::new(b, "worker"),
        )
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RunnerState::Starting.to_string(), "starting");
        assert_eq!(RunnerState::Failed.to_string(), "failed");
    }

    #[tokio::test]
    async fn test_start_requires_registration_server() {
        let ctx = context_with(Arc::new(IdleLauncher::default()));
        let runner = runner_for(&ctx);
        let err = runner.start(&ctx).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotListening));
    }

    #[tokio::test]
    async fn test_attach_then_ready() {
        let ctx = context_with(Arc::new(IdleLauncher::default()));
        let runner = runner_for(&ctx);
        assert_eq!(runner.state(), RunnerState::Starting);
        assert_eq!(runner.input_address(), None);

        let (peer_side, mut worker) = worker_pair(&runner);
        runner.attach(peer_side).await.unwrap();
        assert_eq!(runner.state(), RunnerState::Registered);
        assert_eq!(runner.input_address(), None);

        worker
            .send(&Message::InputAddress {
                address: "127.0.0.1:7001".to_string(),
            })
            .await
            .unwrap();

        let address = timeout(Duration::from_secs(5), runner.wait_ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(address, "127.0.0.1:7001");
        assert_eq!(runner.input_address().as_deref(), Some("127.0.0.1:7001"));

        runner.stop().await;
    }

    #[tokio::test]
    async fn test_second_attach_rejected() {
        let ctx = context_with(Arc::new(IdleLauncher::default()));
        let runner = runner_for(&ctx);

        let (first, _worker1) = worker_pair(&runner);
        runner.attach(first).await.unwrap();

        let (second, _worker2) = worker_pair(&runner);
        let err = runner.attach(second).await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::NotAttachable {
                state: RunnerState::Registered,
                ..
            }
        ));

        runner.stop().await;
    }

    #[tokio::test]
    async fn test_stop_sends_shutdown_and_is_idempotent() {
        let ctx = context_with(Arc::new(IdleLauncher::default()));
        let runner = runner_for(&ctx);
        let (peer_side, mut worker) = worker_pair(&runner);
        runner.attach(peer_side).await.unwrap();

        runner.stop().await;
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert_eq!(worker.receive().await.unwrap(), Some(Message::Shutdown));

        runner.stop().await;
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn test_attach_after_stop_rejected() {
        let ctx = context_with(Arc::new(IdleLauncher::default()));
        let runner = runner_for(&ctx);
        runner.stop().await;

        let (peer_side, _worker) = worker_pair(&runner);
        let err = runner.attach(peer_side).await.unwrap_err();
        assert!(matches!(err, RegistrationError::NotAttachable { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_before_ready_fails_runner() {
        let ctx = context_with(Arc::new(IdleLauncher::default()));
        let runner = runner_for(&ctx);
        let (peer_side, worker) = worker_pair(&runner);
        runner.attach(peer_side).await.unwrap();
        drop(worker);

        let state = timeout(Duration::from_secs(5), runner.wait_ready())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(state, RunnerState::Failed);
        assert!(runner.status().failure.is_some());

        runner.stop().await;
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn test_address_ignored_before_registration_state() {
        let ctx = context_with(Arc::new(IdleLauncher::default()));
        let runner = runner_for(&ctx);
        runner.publish_address("127.0.0.1:1".to_string());
        assert_eq!(runner.state(), RunnerState::Starting);
        assert_eq!(runner.input_address(), None);
    }

    /// Sets its flag when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Workers that ignore the kill switch entirely.
    struct StuckLauncher {
        dropped: Arc<AtomicBool>,
    }

    impl WorkerLauncher for StuckLauncher {
        fn launch(&self, _spec: &WorkerSpec) -> Result<WorkerHandle, LaunchError> {
            let guard = DropFlag(Arc::clone(&self.dropped));
            Ok(WorkerHandle::spawn(move |_kill| async move {
                let _guard = guard;
                std::future::pending::<WorkerExit>().await
            }))
        }
    }

    #[tokio::test]
    async fn test_stop_drops_worker_that_ignores_kill() {
        let dropped = Arc::new(AtomicBool::new(false));
        let ctx = bound_context_with(Arc::new(StuckLauncher {
            dropped: Arc::clone(&dropped),
        }));
        let runner = runner_for(&ctx);
        runner.start(&ctx).await.unwrap();

        timeout(Duration::from_secs(5), runner.stop()).await.unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);

        timeout(Duration::from_secs(5), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
