//! The control peer: flows, the registration server and ordered shutdown.
//!
//! # Registration
//!
//! Every worker dials the registration server and sends `register` with the
//! runner identifier it was launched with. The peer looks the identifier up in
//! the [`RunnerRegistry`] and hands the connection to that runner, which then
//! owns it. Connections that fail the handshake are logged and dropped; the
//! accept loop is never affected.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use brickflow_core::emit;
use indexmap::IndexMap;
use snafu::{OptionExt, ResultExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::ApiServer;
use crate::config::{Config, ControlConfig};
use crate::connection::{Connection, Transport};
use crate::context::RunnerContext;
use crate::error::{
    BindSnafu, ClosedEarlySnafu, ConfigError, ControlPeerError, HandshakeSnafu,
    HandshakeTimeoutSnafu, RegistrationError, UnexpectedMessageSnafu, UnknownFlowSnafu,
    UnknownRunnerSnafu,
};
use crate::flow::Flow;
use crate::id::FlowId;
use crate::launcher::{ProcessLauncher, WorkerLauncher};
use crate::metrics::RegistrationRejected;
use crate::registry::RunnerRegistry;
use crate::runner::BrickRunner;
use crate::status::PeerStatus;
use crate::wire::Message;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Running network surfaces, torn down by [`ControlPeer::shutdown`].
#[derive(Default)]
struct Surfaces {
    accept: Option<(CancellationToken, JoinHandle<()>)>,
    api: Option<ApiServer>,
}

/// Process-wide orchestrator for a set of flows.
pub struct ControlPeer {
    flows: IndexMap<FlowId, Flow>,
    context: Arc<RunnerContext>,
    settings: ControlConfig,
    surfaces: Mutex<Surfaces>,
}

impl ControlPeer {
    /// Build flows from `config`. Nothing is bound or launched.
    pub fn new(
        config: &Config,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, ControlPeerError> {
        config.validate()?;

        let context = Arc::new(RunnerContext::new(
            RunnerRegistry::new(),
            launcher,
            config.control.transport.as_str(),
            config.control.stop_timeout(),
        ));

        let mut flows = IndexMap::with_capacity(config.flows.len());
        for flow_config in &config.flows {
            let chain = config.resolve_chain(flow_config)?;
            let flow = Flow::new(flow_config.name.as_str(), &chain, Arc::clone(&context))?;
            debug!(flow = %flow.name(), id = %flow.id(), bricks = chain.len(), "Flow built");
            flows.insert(flow.id().clone(), flow);
        }

        Ok(Self {
            flows,
            context,
            settings: config.control.clone(),
            surfaces: Mutex::new(Surfaces::default()),
        })
    }

    /// Build a peer that launches workers as OS processes per `runner.command`.
    pub fn from_config(config: &Config) -> Result<Self, ControlPeerError> {
        let launcher = ProcessLauncher::new(config.runner.command.clone())
            .map_err(|_| ConfigError::EmptyRunnerCommand)?;
        Self::new(config, Arc::new(launcher))
    }

    /// Flows in configuration order.
    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    /// Look a flow up by identifier or, failing that, by name.
    pub fn flow(&self, key: &str) -> Option<&Flow> {
        self.flows
            .get(key)
            .or_else(|| self.flows.values().find(|flow| flow.name() == key))
    }

    pub fn registry(&self) -> &RunnerRegistry {
        self.context.registry()
    }

    /// Address of the registration server, once bound.
    pub fn registration_address(&self) -> Option<SocketAddr> {
        self.context.registration_address()
    }

    /// Address of the control API, if it is running.
    pub async fn api_address(&self) -> Option<SocketAddr> {
        self.surfaces.lock().await.api.as_ref().map(ApiServer::local_addr)
    }

    /// Bind the registration server and publish its address to runners.
    pub async fn bind(&self) -> Result<TcpListener, ControlPeerError> {
        let address = self.settings.registration_address.as_str();
        let listener = TcpListener::bind(address)
            .await
            .context(BindSnafu { address })?;
        let local = listener.local_addr().context(BindSnafu { address })?;

        self.context.set_registration_address(local);
        info!(address = %local, "Registration server listening");
        Ok(listener)
    }

    /// Bind the registration server and accept connections in the background
    /// until [`shutdown`](Self::shutdown).
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr, ControlPeerError> {
        let listener = self.bind().await?;
        let local = listener.local_addr().context(BindSnafu {
            address: self.settings.registration_address.as_str(),
        })?;

        let stop = CancellationToken::new();
        let accept = tokio::spawn(Arc::clone(self).serve(listener, stop.clone()));
        self.surfaces.lock().await.accept = Some((stop, accept));
        Ok(local)
    }

    /// Accept registrations until `shutdown` is cancelled, then close the
    /// listener. Each connection is handled on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted registration connection");
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = this.establish_communication(stream, peer).await {
                                emit!(RegistrationRejected { reason: e.reason() });
                                match &e {
                                    RegistrationError::UnknownRunner { .. }
                                    | RegistrationError::NotAttachable { .. } => {
                                        error!(%peer, error = %e, "Dropping connection");
                                    }
                                    _ => warn!(%peer, error = %e, "Dropping connection"),
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        info!("Registration server closed");
    }

    /// Run the registration handshake on a freshly accepted stream.
    ///
    /// Reads exactly one message, which must be `register`, and attaches the
    /// connection to the runner it names. Returns that runner.
    pub async fn establish_communication<S: Transport>(
        &self,
        stream: S,
        peer: impl Display,
    ) -> Result<Arc<BrickRunner>, RegistrationError> {
        let peer = peer.to_string();
        let mut connection =
            Connection::with_max_frame_bytes(stream, peer.as_str(), self.settings.max_frame_bytes);

        let handshake = self.settings.handshake_timeout();
        let first = timeout(handshake, connection.receive())
            .await
            .ok()
            .context(HandshakeTimeoutSnafu {
                peer: peer.as_str(),
                timeout: handshake,
            })?
            .context(HandshakeSnafu)?;

        let runner_id = match first {
            Some(Message::Register { runner_id }) => runner_id,
            Some(other) => {
                return UnexpectedMessageSnafu {
                    peer,
                    kind: other.kind(),
                }
                .fail();
            }
            None => return ClosedEarlySnafu { peer }.fail(),
        };

        let runner = self
            .registry()
            .get(&runner_id)
            .context(UnknownRunnerSnafu {
                runner_id: runner_id.as_str(),
            })?;
        runner.attach(connection).await?;
        Ok(runner)
    }

    /// Start a flow by identifier or name.
    pub async fn start_flow(&self, key: &str) -> Result<&Flow, ControlPeerError> {
        let flow = self.flow(key).context(UnknownFlowSnafu { id: key })?;
        flow.start().await?;
        Ok(flow)
    }

    /// Stop a flow by identifier or name.
    pub async fn stop_flow(&self, key: &str) -> Result<&Flow, ControlPeerError> {
        let flow = self.flow(key).context(UnknownFlowSnafu { id: key })?;
        flow.stop().await;
        Ok(flow)
    }

    /// Start every flow in configuration order.
    ///
    /// A flow that fails to start does not prevent the others from starting;
    /// the failures are reported together.
    pub async fn start_flows(&self) -> Result<(), ControlPeerError> {
        let mut failed = Vec::new();
        for flow in self.flows.values() {
            if let Err(e) = flow.start().await {
                error!(flow = %flow.name(), error = %e, "Failed to start flow");
                failed.push(flow.name().to_string());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ControlPeerError::StartFlows { flows: failed })
        }
    }

    pub async fn stop_flows(&self) {
        for flow in self.flows.values() {
            flow.stop().await;
        }
    }

    /// Stop all flows, then the control API, then the registration server.
    ///
    /// Flows go first so runners still have a connection while they wind
    /// down. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("Shutting down control peer");
        self.stop_flows().await;

        let surfaces = std::mem::take(&mut *self.surfaces.lock().await);
        if let Some(api) = surfaces.api {
            api.stop().await;
        }
        if let Some((stop, accept)) = surfaces.accept {
            stop.cancel();
            if let Err(e) = accept.await {
                error!(error = %e, "Registration server task failed");
            }
        }
        info!("Control peer stopped");
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// Binds the registration server, starts the control API when configured,
    /// starts every flow and waits. Only binding is fatal. A flow that fails
    /// to start has already been rolled back; it stays inactive and can be
    /// started again through the control API.
    pub async fn run(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<(), ControlPeerError> {
        self.listen().await?;

        if let Some(address) = self.settings.api_address.as_deref() {
            let api = match ApiServer::bind(address, Arc::clone(self)).await {
                Ok(api) => api,
                Err(e) => {
                    self.shutdown().await;
                    return Err(e);
                }
            };
            self.surfaces.lock().await.api = Some(api);
        }

        if let Err(e) = self.start_flows().await {
            warn!(error = %e, "Continuing with the flows that started");
        }

        info!(flows = self.flows.len(), "Control peer running");
        shutdown.cancelled().await;

        self.shutdown().await;
        Ok(())
    }

    /// Snapshot of every flow, brick and runner.
    pub async fn status(&self) -> PeerStatus {
        let mut flows = Vec::with_capacity(self.flows.len());
        for flow in self.flows.values() {
            flows.push(flow.status().await);
        }
        PeerStatus {
            registration_address: self.registration_address().map(|a| a.to_string()),
            runners: self.registry().len(),
            flows,
        }
    }
}

impl std::fmt::Debug for ControlPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPeer")
            .field("flows", &self.flows.len())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::IdleLauncher;
    use crate::worker;

    const TOPOLOGY: &str = r#"
Flows:
  - Name: f1
    Chain: [b1, b2]
  - Name: f2
    Chain: [b2]
Bricks:
  - Name: b1
    Module: m1
  - Name: b2
    Module: m2
control:
  handshake_timeout_secs: 1
  stop_timeout_secs: 1
"#;

    fn peer() -> Arc<ControlPeer> {
        let config = Config::parse(TOPOLOGY).unwrap();
        Arc::new(ControlPeer::new(&config, Arc::new(IdleLauncher::default())).unwrap())
    }

    #[test]
    fn test_flow_lookup_by_id_or_name() {
        let peer = peer();
        let f1 = peer.flow("f1").unwrap();
        assert_eq!(f1.name(), "f1");
        let by_id = peer.flow(f1.id().as_str()).unwrap();
        assert!(std::ptr::eq(f1, by_id));
        assert!(peer.flow("nope").is_none());
    }

    #[test]
    fn test_flows_keep_config_order() {
        let peer = peer();
        let names: Vec<_> = peer.flows().map(Flow::name).collect();
        assert_eq!(names, ["f1", "f2"]);
    }

    #[tokio::test]
    async fn test_start_unknown_flow() {
        let peer = peer();
        let err = peer.start_flow("nope").await.unwrap_err();
        assert!(matches!(err, ControlPeerError::UnknownFlow { .. }));
    }

    #[tokio::test]
    async fn test_start_before_bind_fails() {
        let peer = peer();
        let err = peer.start_flow("f1").await.unwrap_err();
        assert!(err.to_string().contains("not listening"), "{err}");
        assert!(peer.registry().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_first_message() {
        let peer = peer();
        let (a, b) = tokio::io::duplex(1024);
        let mut worker = Connection::new(b, "worker");
        worker
            .send(&Message::InputAddress {
                address: "127.0.0.1:1".to_string(),
            })
            .await
            .unwrap();

        let err = peer.establish_communication(a, "test").await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::UnexpectedMessage {
                kind: "input_address",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let peer = peer();
        let (a, _b) = tokio::io::duplex(1024);
        let err = peer.establish_communication(a, "silent").await.unwrap_err();
        assert!(matches!(err, RegistrationError::HandshakeTimeout { .. }));
    }

    #[tokio::test]
    async fn test_handshake_closed_early() {
        let peer = peer();
        let (a, b) = tokio::io::duplex(1024);
        drop(b);
        let err = peer.establish_communication(a, "gone").await.unwrap_err();
        assert!(matches!(err, RegistrationError::ClosedEarly { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener() {
        let peer = peer();
        let address = peer.listen().await.unwrap();
        assert_eq!(peer.registration_address(), Some(address));

        peer.shutdown().await;
        peer.shutdown().await;

        // Either refused outright or accepted by nobody and closed.
        if let Ok(mut connection) = worker::register(address, "R-late").await {
            let reply = timeout(Duration::from_secs(2), connection.receive()).await;
            assert!(!matches!(reply, Ok(Ok(Some(_)))));
        }
    }
}
