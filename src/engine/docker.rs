//! Production [`Engine`] backed by `bollard` and the `docker` CLI.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    Driver, HostConfig, PortBinding, SecretSpec, ServiceSpec, ServiceSpecMode,
    ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec, TaskSpecContainerSpecFile,
    TaskSpecContainerSpecSecrets, TaskSpecRestartPolicy, TaskSpecRestartPolicyConditionEnum,
};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use super::{
    ContainerLaunch, DockerCli, Engine, EngineError, EngineResult, PluginBuild, PluginState,
    Removal, SecretDecl, ServiceDecl, TaskInfo,
};

/// Docker engine client
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: bollard::Docker,
    cli: DockerCli,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket
    pub fn connect_local() -> EngineResult<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            EngineError::Connection { message: format!("failed to connect to docker: {e}") }
        })?;
        Ok(Self { docker, cli: DockerCli::locate()? })
    }

    /// Verify the daemon answers
    pub async fn ping(&self) -> EngineResult<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Connection { message: format!("ping failed: {e}") })?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> EngineResult<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if status_code(&e) == Some(404) => {}
            Err(e) => return Err(map_error("inspect image", "image", image)(e)),
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions { from_image: image, ..Default::default() };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(map_error("pull image", "image", image))?;
        Ok(())
    }
}

/// Status code of an Engine API error response
fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Map a bollard error, turning 404 into [`EngineError::NotFound`]
fn map_error<'a>(
    operation: &'a str,
    kind: &'static str,
    name: &'a str,
) -> impl Fn(bollard::errors::Error) -> EngineError + 'a {
    move |err| match err {
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
            EngineError::not_found(kind, name)
        }
        bollard::errors::Error::DockerResponseServerError { message, .. } => {
            EngineError::api(format!("{operation} '{name}'"), message)
        }
        other => EngineError::api(format!("{operation} '{name}'"), other.to_string()),
    }
}

fn removed(
    result: Result<(), bollard::errors::Error>,
    operation: &str,
    kind: &'static str,
    name: &str,
) -> EngineResult<Removal> {
    match result {
        Ok(()) => Ok(Removal::Removed),
        Err(e) if status_code(&e) == Some(404) => Ok(Removal::Absent),
        Err(e) => Err(map_error(operation, kind, name)(e)),
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn run_container(&self, launch: &ContainerLaunch) -> EngineResult<String> {
        self.ensure_image(&launch.image).await?;

        let port_key = format!("{}/tcp", launch.container_port);
        let port_bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(launch.publish.ip().to_string()),
                host_port: Some(launch.publish.port().to_string()),
            }]),
        )]);

        let config = Config {
            image: Some(launch.image.clone()),
            env: Some(launch.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            cmd: launch.command.clone(),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                cap_add: Some(launch.cap_add.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: launch.name.clone(), platform: None };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_error("create container", "container", &launch.name))?;

        if let Err(e) =
            self.docker.start_container(&created.id, None::<StartContainerOptions<String>>).await
        {
            let start_error = map_error("start container", "container", &launch.name)(e);
            if let Err(cleanup) = self.remove_container(&launch.name).await {
                warn!(container = %launch.name, error = %cleanup, "Failed to remove container after start failure");
            }
            return Err(start_error);
        }

        debug!(container = %launch.name, id = %created.id, "Container started");
        Ok(created.id)
    }

    async fn remove_container(&self, name: &str) -> EngineResult<Removal> {
        let options = RemoveContainerOptions { force: true, v: true, ..Default::default() };
        let result = self.docker.remove_container(name, Some(options)).await;
        removed(result, "remove container", "container", name)
    }

    async fn read_file(&self, container: &str, path: &str) -> EngineResult<Vec<u8>> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec!["cat", path]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_error("create exec", "container", container))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_error("start exec", "container", container))?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(map_error("read exec output", "container", container))? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.extend_from_slice(&message)
                    }
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(map_error("inspect exec", "container", container))?;
        match inspect.exit_code {
            Some(0) | None => Ok(stdout),
            Some(exit_code) => Err(EngineError::Exec {
                container: container.to_string(),
                exit_code,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            }),
        }
    }

    async fn container_logs(&self, container: &str, tail: usize) -> EngineResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let chunks: Vec<LogOutput> = self
            .docker
            .logs(container, Some(options))
            .try_collect()
            .await
            .map_err(map_error("fetch logs", "container", container))?;

        Ok(chunks.into_iter().map(|chunk| chunk.to_string()).collect())
    }

    async fn build_plugin(&self, build: &PluginBuild) -> EngineResult<()> {
        self.cli.build_plugin(build).await
    }

    async fn inspect_plugin(&self, name: &str) -> EngineResult<Option<PluginState>> {
        self.cli.inspect_plugin(name).await
    }

    async fn set_plugin(&self, name: &str, settings: &[String]) -> EngineResult<()> {
        self.cli.set_plugin(name, settings).await
    }

    async fn enable_plugin(&self, name: &str, timeout: Duration) -> EngineResult<()> {
        self.cli.enable_plugin(name, timeout).await
    }

    async fn disable_plugin(&self, name: &str) -> EngineResult<()> {
        self.cli.disable_plugin(name).await
    }

    async fn remove_plugin(&self, name: &str) -> EngineResult<Removal> {
        self.cli.remove_plugin(name).await
    }

    async fn create_secret(&self, secret: &SecretDecl) -> EngineResult<String> {
        let spec = SecretSpec {
            name: Some(secret.name.clone()),
            labels: Some(secret.labels.clone().into_iter().collect()),
            driver: Some(Driver { name: secret.driver.clone(), options: None }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_secret(spec)
            .await
            .map_err(map_error("create secret", "secret", &secret.name))?;
        Ok(response.id)
    }

    async fn remove_secret(&self, name: &str) -> EngineResult<Removal> {
        let result = self.docker.delete_secret(name).await;
        removed(result, "remove secret", "secret", name)
    }

    async fn create_service(&self, service: &ServiceDecl) -> EngineResult<String> {
        let container_spec = TaskSpecContainerSpec {
            image: Some(service.image.clone()),
            command: Some(service.command.clone()),
            secrets: Some(vec![TaskSpecContainerSpecSecrets {
                file: Some(TaskSpecContainerSpecFile {
                    name: Some(service.secret_target.clone()),
                    uid: Some("0".to_string()),
                    gid: Some("0".to_string()),
                    mode: Some(0o444),
                }),
                secret_id: Some(service.secret_id.clone()),
                secret_name: Some(service.secret_name.clone()),
            }]),
            ..Default::default()
        };

        let spec = ServiceSpec {
            name: Some(service.name.clone()),
            task_template: Some(TaskSpec {
                container_spec: Some(container_spec),
                restart_policy: Some(TaskSpecRestartPolicy {
                    condition: Some(TaskSpecRestartPolicyConditionEnum::ANY),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated {
                    replicas: Some(i64::try_from(service.replicas).unwrap_or(i64::MAX)),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_service(spec, None)
            .await
            .map_err(map_error("create service", "service", &service.name))?;
        Ok(response.id.unwrap_or_default())
    }

    async fn remove_service(&self, name: &str) -> EngineResult<Removal> {
        let result = self.docker.delete_service(name).await;
        removed(result, "remove service", "service", name)
    }

    async fn deploy_stack(&self, name: &str, manifest: &str) -> EngineResult<()> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{name}-"))
            .suffix(".yml")
            .tempfile()
            .map_err(|e| EngineError::api("write stack manifest", e.to_string()))?;
        file.write_all(manifest.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| EngineError::api("write stack manifest", e.to_string()))?;

        self.cli.deploy_stack(name, file.path()).await
    }

    async fn remove_stack(&self, name: &str) -> EngineResult<Removal> {
        self.cli.remove_stack(name).await
    }

    async fn list_tasks(&self, service: &str) -> EngineResult<Vec<TaskInfo>> {
        self.cli.list_tasks(service).await
    }
}
