//! `docker` CLI runner for operations the Engine API client does not expose:
//! managed plugins, stacks and swarm tasks.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::{EngineError, EngineResult, PluginBuild, PluginState, Removal, TaskInfo};

/// One line per task: id, state and the container id once one is assigned
const TASK_FORMAT: &str =
    "{{.ID}} {{.Status.State}} {{with .Status.ContainerStatus}}{{.ContainerID}}{{end}}";

/// Thin wrapper over the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    /// Locate `docker` on `PATH`
    pub fn locate() -> EngineResult<Self> {
        let binary = which::which("docker").map_err(|e| EngineError::Connection {
            message: format!("docker CLI not found on PATH: {e}"),
        })?;
        Ok(Self { binary })
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// Run `docker <args>` and return trimmed stdout
    pub async fn run(&self, args: &[&str]) -> EngineResult<String> {
        debug!(args = ?args, "Running docker CLI");
        let output = self.output(args).await?;
        check(&render("docker", args), output).map(|(stdout, _)| stdout)
    }

    /// Like [`run`](Self::run), but keeps stderr of a successful command
    async fn run_captured(&self, args: &[&str]) -> EngineResult<(String, String)> {
        debug!(args = ?args, "Running docker CLI");
        let output = self.output(args).await?;
        check(&render("docker", args), output)
    }

    async fn output(&self, args: &[&str]) -> EngineResult<Output> {
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Connection {
                message: format!("failed to spawn {}: {e}", self.binary.display()),
            })
    }

    /// Run a build command with `sh -c` in its working directory.
    ///
    /// `PLUGIN_NAME` is exported so generic build scripts can tag the artifact.
    pub async fn build_plugin(&self, build: &PluginBuild) -> EngineResult<()> {
        debug!(command = %build.command, workdir = %build.workdir.display(), "Running plugin build");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&build.command)
            .current_dir(&build.workdir)
            .env("PLUGIN_NAME", &build.plugin_name)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::api("plugin build", format!("failed to spawn sh: {e}")))?;

        check(&build.command, output).map(|_| ())
    }

    pub async fn inspect_plugin(&self, name: &str) -> EngineResult<Option<PluginState>> {
        match self.run(&["plugin", "inspect", "--format", "{{.Enabled}}", name]).await {
            Ok(stdout) => Ok(Some(PluginState { name: name.to_string(), enabled: stdout == "true" })),
            Err(err) if missing(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn set_plugin(&self, name: &str, settings: &[String]) -> EngineResult<()> {
        let mut args = vec!["plugin", "set", name];
        args.extend(settings.iter().map(String::as_str));
        debug!(plugin = name, keys = settings.len(), "Running docker plugin set");
        let output = self.output(&args).await?;
        // Settings carry credentials, keep them out of the error text.
        check(&format!("docker plugin set {name} <{} settings>", settings.len()), output).map(|_| ())
    }

    pub async fn enable_plugin(&self, name: &str, timeout: Duration) -> EngineResult<()> {
        let timeout = timeout.as_secs().max(1).to_string();
        self.run(&["plugin", "enable", "--timeout", &timeout, name]).await.map(|_| ())
    }

    pub async fn disable_plugin(&self, name: &str) -> EngineResult<()> {
        match self.run(&["plugin", "disable", "-f", name]).await {
            Err(err) if missing(&err) => Err(EngineError::not_found("plugin", name)),
            other => other.map(|_| ()),
        }
    }

    pub async fn remove_plugin(&self, name: &str) -> EngineResult<Removal> {
        match self.run(&["plugin", "rm", "-f", name]).await {
            Ok(_) => Ok(Removal::Removed),
            Err(err) if missing(&err) => Ok(Removal::Absent),
            Err(err) => Err(err),
        }
    }

    pub async fn deploy_stack(&self, name: &str, manifest: &Path) -> EngineResult<()> {
        let manifest = manifest.to_string_lossy();
        self.run(&["stack", "deploy", "--compose-file", &manifest, name]).await.map(|_| ())
    }

    pub async fn remove_stack(&self, name: &str) -> EngineResult<Removal> {
        let (stdout, stderr) = self.run_captured(&["stack", "rm", name]).await?;
        Ok(stack_removal(&stdout, &stderr))
    }

    /// Tasks of `service` whose desired state is running
    pub async fn list_tasks(&self, service: &str) -> EngineResult<Vec<TaskInfo>> {
        let listed = self
            .run(&["service", "ps", "--filter", "desired-state=running", "--no-trunc", "--quiet", service])
            .await;
        let ids = match listed {
            Ok(stdout) => stdout,
            Err(err) if missing(&err) => return Err(EngineError::not_found("service", service)),
            Err(err) => return Err(err),
        };

        let ids: Vec<&str> = ids.lines().map(str::trim).filter(|id| !id.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect", "--type", "task", "--format", TASK_FORMAT];
        args.extend(ids);

        match self.run(&args).await {
            Ok(stdout) => Ok(parse_tasks(&stdout)),
            // A task replaced between the two calls; the next poll sees its successor
            Err(err) if missing(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

fn render(program: &str, args: &[&str]) -> String {
    std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>().join(" ")
}

/// Trimmed stdout and stderr of a successful command
fn check(command: &str, output: Output) -> EngineResult<(String, String)> {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if output.status.success() {
        return Ok((stdout, stderr));
    }

    Err(EngineError::Command {
        command: command.to_string(),
        status: output.status.to_string(),
        stderr: if stderr.is_empty() { stdout } else { stderr },
    })
}

// `stack rm` of an unknown stack exits 0 and reports "Nothing found in stack" on stderr
fn stack_removal(stdout: &str, stderr: &str) -> Removal {
    if stdout.contains("Nothing found") || stderr.contains("Nothing found") {
        Removal::Absent
    } else {
        Removal::Removed
    }
}

fn parse_tasks(stdout: &str) -> Vec<TaskInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.to_string();
            let state = fields.next().unwrap_or_default().to_ascii_lowercase();
            let container_id = fields.next().map(str::to_string);
            Some(TaskInfo { id, state, container_id })
        })
        .collect()
}

fn missing(err: &EngineError) -> bool {
    match err {
        EngineError::Command { stderr, .. } => {
            let stderr = stderr.to_ascii_lowercase();
            stderr.contains("no such ") || stderr.contains("not found")
        }
        EngineError::NotFound { .. } => true,
        _ => false,
    }
}
