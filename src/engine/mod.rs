//! # Docker Engine seam
//!
//! Everything the harness does to Docker goes through the [`Engine`] trait.
//! The production implementation ([`DockerEngine`]) talks to the Engine API
//! through `bollard` for containers, swarm objects, exec and logs, and shells
//! out to the `docker` CLI for the operations the API client does not cover
//! (managed plugins and `docker stack`).
//!
//! Removal operations are idempotent: removing something that does not exist
//! yields [`Removal::Absent`] rather than an error.

pub mod cli;
pub mod docker;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

pub use cli::DockerCli;
pub use docker::DockerEngine;

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors raised by the Docker seam
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Object does not exist (HTTP 404 or "No such ..." from the CLI)
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Docker daemon could not be reached
    #[error("Docker daemon unreachable: {message}")]
    Connection { message: String },

    /// Engine API call failed
    #[error("Docker API error during {operation}: {message}")]
    Api { operation: String, message: String },

    /// CLI invocation exited non-zero
    #[error("`{command}` failed with {status}: {stderr}")]
    Command { command: String, status: String, stderr: String },

    /// Command inside a container exited non-zero
    #[error("exec in container '{container}' exited with {exit_code}: {stderr}")]
    Exec { container: String, exit_code: i64, stderr: String },
}

impl EngineError {
    pub fn not_found<S: Into<String>>(kind: &'static str, name: S) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    pub fn api<O: Into<String>, S: Into<String>>(operation: O, message: S) -> Self {
        Self::Api { operation: operation.into(), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Outcome of an idempotent removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    Absent,
}

impl Removal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Removed => "removed",
            Self::Absent => "absent",
        }
    }
}

/// Fold a removal result: a missing object counts as already removed
pub fn absent_ok(result: EngineResult<Removal>) -> EngineResult<Removal> {
    match result {
        Err(err) if err.is_not_found() => Ok(Removal::Absent),
        other => other,
    }
}

/// Detached container to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLaunch {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// Command override; `None` keeps the image default
    pub command: Option<Vec<String>>,
    /// Port inside the container
    pub container_port: u16,
    /// Host address `container_port` is published on
    pub publish: SocketAddr,
    pub cap_add: Vec<String>,
}

/// How to produce a plugin artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginBuild {
    pub plugin_name: String,
    pub workdir: PathBuf,
    /// Shell command, run with `sh -c`
    pub command: String,
}

/// Activation state reported by `docker plugin inspect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginState {
    pub name: String,
    pub enabled: bool,
}

/// Driver-backed swarm secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretDecl {
    pub name: String,
    pub driver: String,
    pub labels: BTreeMap<String, String>,
}

/// Replicated swarm service consuming one secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDecl {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub secret_id: String,
    pub secret_name: String,
    /// File name under `/run/secrets/`
    pub secret_target: String,
    pub replicas: u64,
}

/// One swarm task of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    /// Lower-case task state (`running`, `pending`, `failed`, ...)
    pub state: String,
    pub container_id: Option<String>,
}

impl TaskInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Docker operations needed by the harness
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create and start a detached container, returning its id.
    ///
    /// A container that was created but failed to start is removed before
    /// the error is returned.
    async fn run_container(&self, launch: &ContainerLaunch) -> EngineResult<String>;

    /// Force-remove a container together with its anonymous volumes
    async fn remove_container(&self, name: &str) -> EngineResult<Removal>;

    /// Contents of `path` inside a running container
    async fn read_file(&self, container: &str, path: &str) -> EngineResult<Vec<u8>>;

    /// Last `tail` lines of combined stdout/stderr
    async fn container_logs(&self, container: &str, tail: usize) -> EngineResult<String>;

    /// Run a plugin build command
    async fn build_plugin(&self, build: &PluginBuild) -> EngineResult<()>;

    /// `None` when no plugin of that name is installed
    async fn inspect_plugin(&self, name: &str) -> EngineResult<Option<PluginState>>;

    /// Apply all settings in a single `docker plugin set`
    async fn set_plugin(&self, name: &str, settings: &[String]) -> EngineResult<()>;

    async fn enable_plugin(&self, name: &str, timeout: Duration) -> EngineResult<()>;

    async fn disable_plugin(&self, name: &str) -> EngineResult<()>;

    async fn remove_plugin(&self, name: &str) -> EngineResult<Removal>;

    /// Create a swarm secret, returning its id
    async fn create_secret(&self, secret: &SecretDecl) -> EngineResult<String>;

    async fn remove_secret(&self, name: &str) -> EngineResult<Removal>;

    /// Create a swarm service, returning its id
    async fn create_service(&self, service: &ServiceDecl) -> EngineResult<String>;

    async fn remove_service(&self, name: &str) -> EngineResult<Removal>;

    /// `docker stack deploy` with the given compose manifest
    async fn deploy_stack(&self, name: &str, manifest: &str) -> EngineResult<()>;

    async fn remove_stack(&self, name: &str) -> EngineResult<Removal>;

    /// Tasks of a service whose desired state is running
    async fn list_tasks(&self, service: &str) -> EngineResult<Vec<TaskInfo>>;
}
