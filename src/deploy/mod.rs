//! # Deployment Controller
//!
//! Materializes the consumer workload that references the driver: either a
//! driver-backed swarm secret plus a replicated service (service mode), or a
//! compose stack declaring both (stack mode). After submission it waits for
//! the service to reach its desired number of running tasks.
//!
//! Observability helpers ([`DeploymentController::fetch_logs`],
//! [`DeploymentController::read_file_from_task`]) resolve the current running
//! task on every call. Swarm may replace a task at any time, so a container id
//! is never kept between calls.

pub mod stack;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::{BackendKind, SecretLocation};
use crate::engine::{Engine, EngineError, EngineResult, Removal, SecretDecl, ServiceDecl};
use crate::errors::{HarnessError, Result};
use crate::poll::{poll_until, PollPolicy};

/// Label carrying the backend path of the secret
pub const LABEL_PATH: &str = "vault_path";
/// Label carrying the field inside the backend secret
pub const LABEL_FIELD: &str = "vault_field";

const CONSUMER_IMAGE: &str = "busybox:latest";

/// How the consumer workload is deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// `docker secret create` + `docker service create`
    Service,
    /// `docker stack deploy` with a compose manifest
    Stack,
}

impl DeploymentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Stack => "stack",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" => Ok(Self::Service),
            "stack" => Ok(Self::Stack),
            other => Err(HarnessError::configuration(format!(
                "unknown deployment mode '{other}' (expected one of: service, stack)"
            ))),
        }
    }
}

/// Desired consumer workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentSpec {
    pub mode: DeploymentMode,
    /// Stack name; only used in stack mode
    pub stack_name: Option<String>,
    /// Service name as declared (stack mode prefixes it with the stack name)
    pub service: String,
    pub secret_name: String,
    /// Secret driver (the plugin identity)
    pub driver: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub command: Vec<String>,
    pub replicas: u64,
    /// Optional overlay network the service joins
    pub network: Option<String>,
}

impl DeploymentSpec {
    /// Busybox consumer that prints the mounted secret every few seconds
    pub fn smoke_consumer(
        backend: BackendKind,
        mode: DeploymentMode,
        driver: &str,
        location: &SecretLocation,
    ) -> Self {
        let kind = backend.as_str();
        let secret_name = format!("smoke_secret_{kind}");
        let (stack_name, service) = match mode {
            DeploymentMode::Service => (None, format!("smoke-{kind}-consumer")),
            DeploymentMode::Stack => (Some(format!("smoke-{kind}")), "consumer".to_string()),
        };
        let script = format!("while true; do cat /run/secrets/{secret_name}; echo; sleep 5; done");

        Self {
            mode,
            stack_name,
            service,
            labels: BTreeMap::from([
                (LABEL_PATH.to_string(), location.path.clone()),
                (LABEL_FIELD.to_string(), location.field.clone()),
            ]),
            secret_name,
            driver: driver.to_string(),
            image: CONSUMER_IMAGE.to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), script],
            replicas: 1,
            network: None,
        }
    }

    /// Service name as Swarm knows it
    pub fn service_name(&self) -> String {
        match (&self.mode, &self.stack_name) {
            (DeploymentMode::Stack, Some(stack)) => format!("{stack}_{}", self.service),
            _ => self.service.clone(),
        }
    }

    /// Where the secret is mounted inside each task
    pub fn secret_path(&self) -> String {
        format!("/run/secrets/{}", self.secret_name)
    }
}

/// Identity of a submitted deployment; read-only after creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentHandle {
    pub mode: DeploymentMode,
    pub stack_name: Option<String>,
    pub service_name: String,
    pub secret_name: String,
    pub labels: BTreeMap<String, String>,
    pub replicas: u64,
    pub secret_path: String,
}

impl DeploymentHandle {
    /// Handle naming what `spec` creates, without creating it
    pub fn for_spec(spec: &DeploymentSpec) -> Self {
        Self {
            mode: spec.mode,
            stack_name: spec.stack_name.clone(),
            service_name: spec.service_name(),
            secret_name: spec.secret_name.clone(),
            labels: spec.labels.clone(),
            replicas: spec.replicas,
            secret_path: spec.secret_path(),
        }
    }
}

/// Creates, observes and removes consumer deployments
#[derive(Clone)]
pub struct DeploymentController {
    engine: Arc<dyn Engine>,
}

impl DeploymentController {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Submit and wait for convergence
    pub async fn apply(&self, spec: &DeploymentSpec, policy: PollPolicy) -> Result<DeploymentHandle> {
        let handle = self.submit(spec).await?;
        self.await_convergence(&handle, policy).await?;
        Ok(handle)
    }

    /// Create the deployment objects without waiting for tasks
    #[instrument(skip(self, spec), fields(mode = %spec.mode, service = %spec.service_name()))]
    pub async fn submit(&self, spec: &DeploymentSpec) -> Result<DeploymentHandle> {
        match spec.mode {
            DeploymentMode::Service => self.submit_service(spec).await?,
            DeploymentMode::Stack => self.submit_stack(spec).await?,
        }

        let handle = DeploymentHandle::for_spec(spec);
        info!(secret = %handle.secret_name, replicas = handle.replicas, "Deployment submitted");
        Ok(handle)
    }

    async fn submit_service(&self, spec: &DeploymentSpec) -> Result<()> {
        let secret = SecretDecl {
            name: spec.secret_name.clone(),
            driver: spec.driver.clone(),
            labels: spec.labels.clone(),
        };
        let secret_id = self
            .engine
            .create_secret(&secret)
            .await
            .map_err(|e| HarnessError::deploy(&spec.secret_name, e.to_string()))?;

        let service = ServiceDecl {
            name: spec.service_name(),
            image: spec.image.clone(),
            command: spec.command.clone(),
            secret_id,
            secret_name: spec.secret_name.clone(),
            secret_target: spec.secret_name.clone(),
            replicas: spec.replicas,
        };

        if let Err(e) = self.engine.create_service(&service).await {
            // Do not leave a secret behind that no service references
            if let Err(cleanup) = self.engine.remove_secret(&spec.secret_name).await {
                warn!(secret = %spec.secret_name, error = %cleanup, "Failed to remove orphaned secret");
            }
            return Err(HarnessError::deploy(service.name, e.to_string()));
        }
        Ok(())
    }

    async fn submit_stack(&self, spec: &DeploymentSpec) -> Result<()> {
        let stack = spec.stack_name.as_deref().ok_or_else(|| {
            HarnessError::configuration("stack mode deployment requires a stack name")
        })?;
        let manifest = stack::render_manifest(spec)
            .map_err(|e| HarnessError::deploy(stack, format!("cannot render manifest: {e}")))?;
        debug!(stack, manifest = %manifest, "Rendered stack manifest");

        self.engine
            .deploy_stack(stack, &manifest)
            .await
            .map_err(|e| HarnessError::deploy(stack, e.to_string()))
    }

    /// Poll until `replicas` tasks of the service are running
    pub async fn await_convergence(&self, handle: &DeploymentHandle, policy: PollPolicy) -> Result<()> {
        let desired = handle.replicas;
        let polled = poll_until(policy, &handle.service_name, || async move {
            let running = match self.engine.list_tasks(&handle.service_name).await {
                Ok(tasks) => tasks.iter().filter(|t| t.is_running()).count(),
                Err(e) => {
                    debug!(service = %handle.service_name, error = %e, "Task listing failed");
                    0
                }
            };
            if running as u64 >= desired {
                Ok(running)
            } else {
                Err(running)
            }
        })
        .await
        .map_err(|expired| HarnessError::ConvergenceTimeout {
            service: handle.service_name.clone(),
            running: expired.last.unwrap_or(0),
            desired,
            waited: expired.waited,
        })?;

        info!(
            service = %handle.service_name,
            running = polled.value,
            elapsed = ?polled.elapsed,
            "Deployment converged"
        );
        Ok(())
    }

    /// Remove everything the deployment created; absent objects are skipped
    pub async fn remove(&self, handle: &DeploymentHandle) -> EngineResult<Removal> {
        match (handle.mode, handle.stack_name.as_deref()) {
            (DeploymentMode::Stack, Some(stack)) => self.engine.remove_stack(stack).await,
            _ => {
                // Service first: a secret referenced by a service cannot be removed
                let service = self.engine.remove_service(&handle.service_name).await;
                let secret = self.engine.remove_secret(&handle.secret_name).await;
                match (service?, secret?) {
                    (Removal::Absent, Removal::Absent) => Ok(Removal::Absent),
                    _ => Ok(Removal::Removed),
                }
            }
        }
    }

    /// Container of a currently running task
    pub async fn current_container(&self, handle: &DeploymentHandle) -> EngineResult<String> {
        let tasks = self.engine.list_tasks(&handle.service_name).await?;
        tasks
            .into_iter()
            .filter(|t| t.is_running())
            .find_map(|t| t.container_id)
            .ok_or_else(|| EngineError::not_found("running task", handle.service_name.clone()))
    }

    /// Tail of the current task's logs
    pub async fn fetch_logs(&self, handle: &DeploymentHandle, tail: usize) -> EngineResult<String> {
        let container = self.current_container(handle).await?;
        self.engine.container_logs(&container, tail).await
    }

    /// Contents of `path` inside the current task
    pub async fn read_file_from_task(
        &self,
        handle: &DeploymentHandle,
        path: &str,
    ) -> EngineResult<Vec<u8>> {
        let container = self.current_container(handle).await?;
        self.engine.read_file(&container, path).await
    }
}
