//! Helpers shared by unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::context::RunnerContext;
use crate::error::LaunchError;
use crate::launcher::{WorkerExit, WorkerHandle, WorkerLauncher, WorkerSpec};
use crate::registry::RunnerRegistry;

/// Launcher whose workers do nothing until killed. Records every spec.
#[derive(Default)]
pub(crate) struct IdleLauncher {
    pub(crate) launched: Mutex<Vec<WorkerSpec>>,
    pub(crate) fail_module: Option<String>,
}

impl IdleLauncher {
    pub(crate) fn failing_on(module: &str) -> Self {
        Self {
            launched: Mutex::default(),
            fail_module: Some(module.to_string()),
        }
    }

    pub(crate) fn launched(&self) -> Vec<WorkerSpec> {
        self.launched.lock().unwrap().clone()
    }
}

impl WorkerLauncher for IdleLauncher {
    fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle, LaunchError> {
        if self.fail_module.as_deref() == Some(spec.module.as_str()) {
            return Err(LaunchError::Spawn {
                program: "idle".to_string(),
                module: spec.module.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such module"),
            });
        }
        self.launched.lock().unwrap().push(spec.clone());
        Ok(WorkerHandle::spawn(|kill| async move {
            kill.cancelled().await;
            WorkerExit::Killed
        }))
    }
}

/// Context with a fresh registry and a short stop timeout. Not bound.
pub(crate) fn context_with(launcher: Arc<dyn WorkerLauncher>) -> Arc<RunnerContext> {
    Arc::new(RunnerContext::new(
        RunnerRegistry::new(),
        launcher,
        "kafka:9092",
        Duration::from_millis(200),
    ))
}

/// Like [`context_with`], with a registration address set.
pub(crate) fn bound_context_with(launcher: Arc<dyn WorkerLauncher>) -> Arc<RunnerContext> {
    let ctx = context_with(launcher);
    ctx.set_registration_address("127.0.0.1:4000".parse().unwrap());
    ctx
}
