//! Worker process launch and supervision handles.
//!
//! A [`WorkerLauncher`] turns a [`WorkerSpec`] into a running worker and
//! returns a [`WorkerHandle`]: a kill switch plus a task that resolves with the
//! worker's [`WorkerExit`]. The runner watches that task, which is how a
//! worker dying before it registers becomes an observable failure instead of a
//! runner stuck in `starting`.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::process::Stdio;

use snafu::{OptionExt, ResultExt};
use tokio::process::Command;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EmptyCommandSnafu, LaunchError, SpawnSnafu};
use crate::id::RunnerId;
use crate::worker::{ENV_INLET, ENV_MODULE, ENV_REGISTRATION_ADDR, ENV_RUNNER_ID, ENV_TRANSPORT};

/// Everything a worker needs to start and dial back.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub runner_id: RunnerId,
    pub flow: String,
    pub brick: String,
    pub module: String,
    pub inlet: bool,
    pub registration_address: SocketAddr,
    pub transport: String,
}

impl WorkerSpec {
    /// Environment variables passed to the worker process.
    pub fn env(&self) -> [(&'static str, String); 5] {
        [
            (ENV_RUNNER_ID, self.runner_id.to_string()),
            (ENV_REGISTRATION_ADDR, self.registration_address.to_string()),
            (ENV_MODULE, self.module.clone()),
            (ENV_TRANSPORT, self.transport.clone()),
            (ENV_INLET, if self.inlet { "1" } else { "0" }.to_string()),
        ]
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The worker exited by itself.
    Exited { code: Option<i32> },
    /// The worker was killed through its handle.
    Killed,
    /// The worker's fate is unknown (wait failed, supervisor panicked).
    Lost { reason: String },
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code: Some(code) } => write!(f, "exited with code {code}"),
            Self::Exited { code: None } => write!(f, "exited by signal"),
            Self::Killed => write!(f, "killed"),
            Self::Lost { reason } => write!(f, "lost: {reason}"),
        }
    }
}

/// Kill switch and exit-status channel of one launched worker.
#[derive(Debug)]
pub struct WorkerHandle {
    kill: CancellationToken,
    exit: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    /// Run `worker` as a task. It receives the kill token and must resolve
    /// promptly once the token is cancelled.
    pub fn spawn<F, Fut>(worker: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = WorkerExit> + Send + 'static,
    {
        let kill = CancellationToken::new();
        let exit = tokio::spawn(worker(kill.clone()));
        Self { kill, exit }
    }

    /// Token that kills the worker when cancelled.
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Handle that drops the worker task, and with it anything the task owns,
    /// when aborted.
    pub fn abort_handle(&self) -> AbortHandle {
        self.exit.abort_handle()
    }

    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Wait for the worker to end.
    pub async fn wait(self) -> WorkerExit {
        match self.exit.await {
            Ok(exit) => exit,
            Err(e) => WorkerExit::Lost {
                reason: e.to_string(),
            },
        }
    }
}

/// Starts worker processes for runners.
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Launch a worker. Must not wait for the worker to register.
    fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle, LaunchError>;
}

/// Launches each worker as an OS process: `<command...> <module>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: Vec<String>,
}

impl ProcessLauncher {
    /// `command` is the program followed by its leading arguments.
    pub fn new(command: Vec<String>) -> Result<Self, LaunchError> {
        if command.is_empty() {
            return EmptyCommandSnafu.fail();
        }
        Ok(Self { command })
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle, LaunchError> {
        let (program, args) = self.command.split_first().context(EmptyCommandSnafu)?;

        let mut child = Command::new(program)
            .args(args)
            .arg(&spec.module)
            .envs(spec.env())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context(SpawnSnafu {
                program,
                module: &spec.module,
            })?;

        debug!(
            runner = %spec.runner_id,
            brick = %spec.brick,
            pid = child.id(),
            "Worker process spawned"
        );

        let runner = spec.runner_id.clone();
        Ok(WorkerHandle::spawn(move |kill| async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => WorkerExit::Exited { code: status.code() },
                    Err(e) => WorkerExit::Lost { reason: e.to_string() },
                },
                _ = kill.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(runner = %runner, error = %e, "Failed to kill worker process");
                    }
                    WorkerExit::Killed
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(module: &str) -> WorkerSpec {
        WorkerSpec {
            runner_id: RunnerId::new("R-test"),
            flow: "f1".to_string(),
            brick: "b1".to_string(),
            module: module.to_string(),
            inlet: true,
            registration_address: "127.0.0.1:4000".parse().unwrap(),
            transport: "kafka:9092".to_string(),
        }
    }

    #[test]
    fn test_spec_env() {
        let env = spec("m1").env();
        assert!(env.contains(&(ENV_RUNNER_ID, "R-test".to_string())));
        assert!(env.contains(&(ENV_REGISTRATION_ADDR, "127.0.0.1:4000".to_string())));
        assert!(env.contains(&(ENV_INLET, "1".to_string())));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            ProcessLauncher::new(vec![]),
            Err(LaunchError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_handle_kill() {
        let handle = WorkerHandle::spawn(|kill| async move {
            kill.cancelled().await;
            WorkerExit::Killed
        });
        handle.kill();
        assert_eq!(handle.wait().await, WorkerExit::Killed);
    }

    #[tokio::test]
    async fn test_handle_panicking_worker_is_lost() {
        let handle = WorkerHandle::spawn(|_kill| async move { panic!("worker blew up") });
        assert!(matches!(handle.wait().await, WorkerExit::Lost { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let launcher =
            ProcessLauncher::new(vec!["/nonexistent/brickflow-worker".to_string()]).unwrap();
        let err = launcher.launch(&spec("m1")).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(err.to_string().contains("m1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_code_reported() {
        // `sh -c 'exit 3' <module>`: the module lands in $0 and is ignored.
        let launcher = ProcessLauncher::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "exit 3".to_string(),
        ])
        .unwrap();
        let handle = launcher.launch(&spec("m1")).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap();
        assert_eq!(exit, WorkerExit::Exited { code: Some(3) });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_kill() {
        let launcher = ProcessLauncher::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "sleep 30".to_string(),
        ])
        .unwrap();
        let handle = launcher.launch(&spec("m1")).unwrap();
        handle.kill();

        let exit = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap();
        assert_eq!(exit, WorkerExit::Killed);
    }
}
