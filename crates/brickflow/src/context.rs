//! Shared resources handed to bricks when they start runners.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::launcher::WorkerLauncher;
use crate::registry::RunnerRegistry;

/// Default time a runner gets to exit before its worker is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a runner needs to launch its worker.
///
/// Owned by the control peer and shared with its flows. The registration
/// address is filled in once the registration server is bound.
pub struct RunnerContext {
    registry: RunnerRegistry,
    launcher: Arc<dyn WorkerLauncher>,
    transport: String,
    stop_timeout: Duration,
    registration_address: RwLock<Option<SocketAddr>>,
}

impl RunnerContext {
    pub fn new(
        registry: RunnerRegistry,
        launcher: Arc<dyn WorkerLauncher>,
        transport: impl Into<String>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            launcher,
            transport: transport.into(),
            stop_timeout,
            registration_address: RwLock::new(None),
        }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn launcher(&self) -> &dyn WorkerLauncher {
        self.launcher.as_ref()
    }

    /// Opaque message-transport connection string passed to workers.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Address workers dial to register, once the server is bound.
    pub fn registration_address(&self) -> Option<SocketAddr> {
        match self.registration_address.read() {
            Ok(address) => *address,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_registration_address(&self, address: SocketAddr) {
        match self.registration_address.write() {
            Ok(mut slot) => *slot = Some(address),
            Err(poisoned) => *poisoned.into_inner() = Some(address),
        }
    }
}

impl std::fmt::Debug for RunnerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerContext")
            .field("transport", &self.transport)
            .field("stop_timeout", &self.stop_timeout)
            .field("registration_address", &self.registration_address())
            .finish_non_exhaustive()
    }
}
