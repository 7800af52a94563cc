//! Worker side of the registration protocol.
//!
//! Worker processes learn who they are from environment variables set by the
//! launcher, dial the registration server and send `register` before anything
//! else. Rust workers (and tests simulating workers) use these helpers.

use tokio::net::{TcpStream, ToSocketAddrs};

use crate::connection::Connection;
use crate::error::{TransportError, WorkerEnvError};
use crate::wire::Message;

pub const ENV_RUNNER_ID: &str = "BRICKFLOW_RUNNER_ID";
pub const ENV_REGISTRATION_ADDR: &str = "BRICKFLOW_REGISTRATION_ADDR";
pub const ENV_MODULE: &str = "BRICKFLOW_MODULE";
pub const ENV_TRANSPORT: &str = "BRICKFLOW_TRANSPORT";
pub const ENV_INLET: &str = "BRICKFLOW_INLET";

/// Startup parameters handed to a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub runner_id: String,
    pub registration_address: String,
    pub module: String,
    pub transport: String,
    pub inlet: bool,
}

impl WorkerEnv {
    /// Read the parameters from the process environment.
    pub fn from_env() -> Result<Self, WorkerEnvError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the parameters through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WorkerEnvError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &'static str| {
            lookup(name).ok_or(WorkerEnvError::MissingVariable { name })
        };

        Ok(Self {
            runner_id: require(ENV_RUNNER_ID)?,
            registration_address: require(ENV_REGISTRATION_ADDR)?,
            module: require(ENV_MODULE)?,
            transport: lookup(ENV_TRANSPORT).unwrap_or_default(),
            inlet: lookup(ENV_INLET).is_some_and(|v| v == "1"),
        })
    }

    /// Dial the registration server and register as this runner.
    pub async fn register(&self) -> Result<Connection, TransportError> {
        register(self.registration_address.as_str(), &self.runner_id).await
    }
}

/// Dial `address` and send the registration message for `runner_id`.
pub async fn register<A: ToSocketAddrs>(
    address: A,
    runner_id: &str,
) -> Result<Connection, TransportError> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|source| TransportError::Io {
            label: runner_id.to_string(),
            source,
        })?;

    let mut connection = Connection::new(stream, runner_id);
    connection
        .send(&Message::Register {
            runner_id: runner_id.to_string(),
        })
        .await?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_from_lookup_complete() {
        let env = WorkerEnv::from_lookup(lookup(&[
            (ENV_RUNNER_ID, "R-1"),
            (ENV_REGISTRATION_ADDR, "127.0.0.1:4000"),
            (ENV_MODULE, "bricks.tokenize"),
            (ENV_TRANSPORT, "kafka:9092"),
            (ENV_INLET, "1"),
        ]))
        .unwrap();

        assert_eq!(env.runner_id, "R-1");
        assert_eq!(env.module, "bricks.tokenize");
        assert_eq!(env.transport, "kafka:9092");
        assert!(env.inlet);
    }

    #[test]
    fn test_from_lookup_optional_fields() {
        let env = WorkerEnv::from_lookup(lookup(&[
            (ENV_RUNNER_ID, "R-1"),
            (ENV_REGISTRATION_ADDR, "127.0.0.1:4000"),
            (ENV_MODULE, "m"),
        ]))
        .unwrap();

        assert_eq!(env.transport, "");
        assert!(!env.inlet);
    }

    #[test]
    fn test_from_lookup_reports_missing() {
        let err = WorkerEnv::from_lookup(lookup(&[(ENV_RUNNER_ID, "R-1")])).unwrap_err();
        assert!(matches!(
            err,
            WorkerEnvError::MissingVariable { name } if name == ENV_REGISTRATION_ADDR
        ));
    }

    #[tokio::test]
    async fn test_register_sends_identifier_first() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { register(addr, "R-hello").await });

        let (stream, _) = listener.accept().await.unwrap();
        let mut server = Connection::new(stream, "server");
        assert_eq!(
            server.receive().await.unwrap(),
            Some(Message::Register {
                runner_id: "R-hello".to_string()
            })
        );
        client.await.unwrap().unwrap();
    }
}
