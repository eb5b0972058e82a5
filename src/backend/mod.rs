//! # Backend Provisioner
//!
//! Owns the lifecycle of a dev-mode secret store running in a container:
//! start it, wait until it answers health probes, write the scenario secret,
//! issue a token scoped to that secret, and remove the container again.
//!
//! Talking to the store goes through the [`SecretStore`] trait so the
//! provisioner can be exercised without a running server.

pub mod vault;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::config::{BackendKind, ScenarioConfig, SecretLocation};
use crate::engine::{ContainerLaunch, Engine, EngineResult, Removal};
use crate::errors::{HarnessError, Result};
use crate::poll::{poll_until, PollPolicy};
use crate::types::SecretString;

pub use vault::{VaultConnector, VaultKvStore};

/// Result type for secret store calls
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by a secret store client
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Server could not be reached at all
    #[error("Store unreachable: {message}")]
    Unreachable { message: String },

    /// Server answered the health probe with a non-ready status
    #[error("Store not ready: health endpoint returned {status}")]
    Unhealthy { status: u16 },

    /// Credential was rejected
    #[error("Permission denied: {message}")]
    Denied { message: String },

    /// Any other API error
    #[error("Store API error: {message}")]
    Api { message: String },
}

impl StoreError {
    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        Self::Unreachable { message: message.into() }
    }

    pub fn api<S: Into<String>>(message: S) -> Self {
        Self::Api { message: message.into() }
    }
}

/// Operations the harness performs against a Vault-compatible store
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `GET /v1/sys/health`; `Ok` only when the server is initialized, unsealed and active
    async fn health(&self) -> StoreResult<()>;

    /// KV v2 write of a single field
    async fn write_kv(&self, location: &SecretLocation, value: &SecretString) -> StoreResult<()>;

    /// KV v2 read of a single field; `None` when the secret or field is missing
    async fn read_kv(&self, location: &SecretLocation) -> StoreResult<Option<SecretString>>;

    /// Create or replace an ACL policy
    async fn write_policy(&self, name: &str, document: &str) -> StoreResult<()>;

    /// Issue a token carrying only `policy`
    async fn create_token(&self, policy: &str) -> StoreResult<SecretString>;
}

/// Builds a store client once the backend address is known
pub trait StoreConnector: Send + Sync {
    fn connect(&self, address: &str, token: &SecretString) -> StoreResult<Arc<dyn SecretStore>>;
}

/// Parameters for launching a backend container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub kind: BackendKind,
    pub image: String,
    pub container_name: String,
    /// Host address the server is published on
    pub listen_addr: SocketAddr,
    pub root_token: SecretString,
}

impl BackendSpec {
    pub fn from_config(config: &ScenarioConfig) -> Self {
        Self {
            kind: config.backend,
            image: config.backend_image.clone(),
            container_name: config.container_name.clone(),
            listen_addr: config.listen_addr,
            root_token: config.root_token.clone(),
        }
    }

    pub fn address(&self) -> String {
        format!("http://{}", self.listen_addr)
    }

    fn launch(&self) -> ContainerLaunch {
        let (token_var, listen_var) = self.kind.dev_env_names();
        let port = self.kind.container_port();
        ContainerLaunch {
            name: self.container_name.clone(),
            image: self.image.clone(),
            env: vec![
                (token_var.to_string(), self.root_token.expose_secret().to_string()),
                (listen_var.to_string(), format!("0.0.0.0:{port}")),
            ],
            command: self.kind.dev_command(),
            container_port: port,
            publish: self.listen_addr,
            cap_add: vec!["IPC_LOCK".to_string()],
        }
    }
}

/// A running backend and what has been done to it
#[derive(Clone)]
pub struct BackendSession {
    pub kind: BackendKind,
    pub container_name: String,
    pub container_id: String,
    pub address: String,
    pub root_token: SecretString,
    pub policy_name: Option<String>,
    pub scoped_token: Option<SecretString>,
    pub current_value: Option<SecretString>,
    store: Arc<dyn SecretStore>,
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("kind", &self.kind)
            .field("container_name", &self.container_name)
            .field("container_id", &self.container_id)
            .field("address", &self.address)
            .field("root_token", &self.root_token)
            .field("policy_name", &self.policy_name)
            .field("scoped_token", &self.scoped_token)
            .field("current_value", &self.current_value)
            .finish_non_exhaustive()
    }
}

/// Starts, seeds and stops backend containers
#[derive(Clone)]
pub struct Provisioner {
    engine: Arc<dyn Engine>,
    connector: Arc<dyn StoreConnector>,
}

impl Provisioner {
    pub fn new(engine: Arc<dyn Engine>, connector: Arc<dyn StoreConnector>) -> Self {
        Self { engine, connector }
    }

    /// Launch the dev-mode server container.
    ///
    /// The server is not necessarily ready when this returns; call
    /// [`Provisioner::await_ready`] next.
    #[instrument(skip(self, spec), fields(backend = %spec.kind, container = %spec.container_name))]
    pub async fn start(&self, spec: &BackendSpec) -> Result<BackendSession> {
        let address = spec.address();
        let store = self
            .connector
            .connect(&address, &spec.root_token)
            .map_err(|e| HarnessError::provision(format!("cannot build store client: {e}")))?;

        let container_id = self
            .engine
            .run_container(&spec.launch())
            .await
            .map_err(|e| HarnessError::provision(e.to_string()))?;

        info!(address = %address, image = %spec.image, "Backend container started");
        Ok(BackendSession {
            kind: spec.kind,
            container_name: spec.container_name.clone(),
            container_id,
            address,
            root_token: spec.root_token.clone(),
            policy_name: None,
            scoped_token: None,
            current_value: None,
            store,
        })
    }

    /// Probe health at a fixed interval until the server reports ready
    pub async fn await_ready(&self, session: &BackendSession, policy: PollPolicy) -> Result<()> {
        let store = session.store.clone();
        let polled = poll_until(policy, &session.container_name, || {
            let store = store.clone();
            async move { store.health().await }
        })
        .await
        .map_err(|expired| HarnessError::ReadinessTimeout {
            target: session.container_name.clone(),
            waited: expired.waited,
            attempts: expired.attempts,
            last_error: expired.last.map(|e| e.to_string()),
        })?;

        info!(
            backend = %session.kind,
            attempts = polled.attempts,
            elapsed = ?polled.elapsed,
            "Backend ready"
        );
        Ok(())
    }

    /// Write `value` into the secret's field; used for seeding and rotation
    pub async fn write_secret(
        &self,
        session: &mut BackendSession,
        location: &SecretLocation,
        value: &SecretString,
    ) -> Result<()> {
        session
            .store
            .write_kv(location, value)
            .await
            .map_err(|e| HarnessError::write(location.display_path(), e.to_string()))?;

        info!(path = %location.display_path(), field = %location.field, "Secret written");
        session.current_value = Some(value.clone());
        Ok(())
    }

    /// Read the secret's field back from the store
    pub async fn read_secret(
        &self,
        session: &BackendSession,
        location: &SecretLocation,
    ) -> Result<Option<SecretString>> {
        session.store.read_kv(location).await.map_err(|e| {
            HarnessError::write(location.display_path(), format!("read-back failed: {e}"))
        })
    }

    /// Apply a read-only policy and issue a token bound to it
    pub async fn issue_scoped_token(
        &self,
        session: &mut BackendSession,
        policy_name: &str,
        document: &str,
    ) -> Result<SecretString> {
        session.store.write_policy(policy_name, document).await.map_err(|e| {
            HarnessError::auth_setup(format!("writing policy '{policy_name}' failed: {e}"))
        })?;
        session.policy_name = Some(policy_name.to_string());

        let token = session.store.create_token(policy_name).await.map_err(|e| {
            HarnessError::auth_setup(format!("token creation for '{policy_name}' failed: {e}"))
        })?;
        if token.is_empty() {
            return Err(HarnessError::auth_setup("store returned an empty token"));
        }

        info!(policy = policy_name, "Scoped token issued");
        session.scoped_token = Some(token.clone());
        Ok(token)
    }

    /// Remove the backend container; a missing container is not an error
    pub async fn stop(&self, container_name: &str) -> EngineResult<Removal> {
        let removal = self.engine.remove_container(container_name).await?;
        info!(container = container_name, outcome = removal.as_str(), "Backend container removed");
        Ok(removal)
    }
}
