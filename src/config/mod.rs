//! # Configuration Management
//!
//! Scenario constants for each backend kind. A run is fully described by one
//! [`ScenarioConfig`], chosen by a single selector string and never mutated
//! afterwards. The only environment overrides are the ones that describe the
//! host rather than the scenario: where the driver source lives, how to build
//! it, and which backend image to pull.

pub mod driver;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::deploy::{DeploymentMode, DeploymentSpec};
use crate::errors::{HarnessError, Result};
use crate::poll::PollPolicy;
use crate::types::SecretString;

pub use driver::{DriverAuth, DriverOptions, OptionKey, RotationSettings};

/// Supported secret-store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Vault,
    OpenBao,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [Self::Vault, Self::OpenBao];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vault => "vault",
            Self::OpenBao => "openbao",
        }
    }

    /// Prefix of the backend-specific driver settings
    pub fn option_prefix(self) -> &'static str {
        match self {
            Self::Vault => "VAULT",
            Self::OpenBao => "OPENBAO",
        }
    }

    pub fn default_image(self) -> &'static str {
        match self {
            Self::Vault => "hashicorp/vault:1.17",
            Self::OpenBao => "openbao/openbao:2.1.0",
        }
    }

    /// Environment understood by the image's dev mode: (root token var, listen address var)
    pub fn dev_env_names(self) -> (&'static str, &'static str) {
        match self {
            Self::Vault => ("VAULT_DEV_ROOT_TOKEN_ID", "VAULT_DEV_LISTEN_ADDRESS"),
            Self::OpenBao => ("BAO_DEV_ROOT_TOKEN_ID", "BAO_DEV_LISTEN_ADDRESS"),
        }
    }

    /// Command override; the Vault image starts a dev server by default
    pub fn dev_command(self) -> Option<Vec<String>> {
        match self {
            Self::Vault => None,
            Self::OpenBao => Some(vec!["server".to_string(), "-dev".to_string()]),
        }
    }

    /// Port the server listens on inside its container
    pub fn container_port(self) -> u16 {
        8200
    }

    fn host_port(self) -> u16 {
        match self {
            Self::Vault => 8200,
            Self::OpenBao => 8300,
        }
    }

    fn default_mode(self) -> DeploymentMode {
        match self {
            Self::Vault => DeploymentMode::Service,
            Self::OpenBao => DeploymentMode::Stack,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vault" => Ok(Self::Vault),
            "openbao" => Ok(Self::OpenBao),
            other => Err(HarnessError::configuration(format!(
                "unknown backend '{other}' (expected one of: vault, openbao)"
            ))),
        }
    }
}

/// Where the scenario's secret lives in the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretLocation {
    /// KV v2 mount
    pub mount: String,
    /// Path below the mount
    pub path: String,
    /// Field inside the secret's data map
    pub field: String,
}

impl SecretLocation {
    /// `mount/path`, as an operator would type it into `vault kv get`
    pub fn display_path(&self) -> String {
        format!("{}/{}", self.mount, self.path)
    }

    /// Least-privilege ACL document for a driver that only reads this secret
    pub fn read_policy(&self) -> String {
        format!(
            "path \"{mount}/data/{path}\" {{\n  capabilities = [\"read\"]\n}}\n\n\
             path \"{mount}/metadata/{path}\" {{\n  capabilities = [\"read\", \"list\"]\n}}\n",
            mount = self.mount,
            path = self.path
        )
    }
}

/// How the driver artifact is produced and identified
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverBuild {
    /// Plugin identity (`name:tag`)
    pub plugin_name: String,
    /// Directory the build command runs in
    pub workdir: PathBuf,
    /// Shell command that builds and installs the plugin under `plugin_name`
    pub command: String,
    /// Startup budget handed to `docker plugin enable --timeout`
    #[serde(with = "humantime_serde")]
    pub enable_timeout: Duration,
}

/// Per-stage poll budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageTimeouts {
    pub backend_ready: PollPolicy,
    pub convergence: PollPolicy,
    pub verify: PollPolicy,
    pub rotation_verify: PollPolicy,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            backend_ready: PollPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
            convergence: PollPolicy::new(Duration::from_secs(2), Duration::from_secs(90)),
            verify: PollPolicy::attempts(20, Duration::from_secs(1)),
            rotation_verify: PollPolicy::attempts(20, Duration::from_secs(1)),
        }
    }
}

/// Immutable description of one scenario run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioConfig {
    pub name: String,
    pub backend: BackendKind,
    pub backend_image: String,
    pub container_name: String,
    /// Host address the backend is published on; also the driver's backend address
    pub listen_addr: SocketAddr,
    pub root_token: SecretString,
    pub policy_name: String,
    pub secret: SecretLocation,
    pub expected_value: SecretString,
    pub rotated_value: SecretString,
    #[serde(with = "humantime_serde")]
    pub rotation_interval: Duration,
    /// Wait between the rotation write and rotation verification
    #[serde(with = "humantime_serde")]
    pub rotation_settle: Duration,
    pub monitoring: bool,
    pub driver: DriverBuild,
    pub deployment: DeploymentSpec,
    pub timeouts: StageTimeouts,
}

impl ScenarioConfig {
    /// Resolve a selector (`vault`, `openbao`) into a scenario, applying host overrides.
    ///
    /// `mode` replaces the backend's default deployment mode when given.
    pub fn from_selector(selector: &str, mode: Option<DeploymentMode>) -> Result<Self> {
        let backend: BackendKind = selector.parse()?;
        let mode = mode.unwrap_or_else(|| backend.default_mode());
        Self::for_backend_with_mode(backend, mode).with_env_overrides()
    }

    /// Scenario constants for `backend` in its default deployment mode
    pub fn for_backend(backend: BackendKind) -> Self {
        Self::for_backend_with_mode(backend, backend.default_mode())
    }

    pub fn for_backend_with_mode(backend: BackendKind, mode: DeploymentMode) -> Self {
        let kind = backend.as_str();
        let (expected, rotated) = match backend {
            BackendKind::Vault => ("smoke_test_value_123", "smoke_test_value_456"),
            BackendKind::OpenBao => ("openbao-smoke-pass-v1", "openbao-smoke-pass-v2"),
        };
        let secret = SecretLocation {
            mount: "secret".to_string(),
            path: "smoke_service/smoke".to_string(),
            field: "password".to_string(),
        };
        let plugin_name = format!("swarm-secrets-driver:{kind}-smoke");
        let deployment = DeploymentSpec::smoke_consumer(backend, mode, &plugin_name, &secret);

        Self {
            name: format!("{kind}-{}", mode.as_str()),
            backend,
            backend_image: backend.default_image().to_string(),
            container_name: format!("smoke-{kind}"),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], backend.host_port())),
            root_token: SecretString::new(format!("smoke-root-{kind}")),
            policy_name: format!("smoke-driver-read-{kind}"),
            secret,
            expected_value: SecretString::new(expected),
            rotated_value: SecretString::new(rotated),
            rotation_interval: Duration::from_secs(10),
            rotation_settle: Duration::from_secs(15),
            monitoring: false,
            driver: DriverBuild {
                plugin_name,
                workdir: PathBuf::from("."),
                command: "make plugin".to_string(),
                enable_timeout: Duration::from_secs(30),
            },
            deployment,
            timeouts: StageTimeouts::default(),
        }
    }

    /// Apply host-level overrides from the environment.
    ///
    /// - `SMOKE_DRIVER_DIR`: driver source directory (build working directory)
    /// - `SMOKE_DRIVER_BUILD_CMD`: build command; receives `PLUGIN_NAME` in its environment
    /// - `SMOKE_BACKEND_IMAGE`: backend container image
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("SMOKE_DRIVER_DIR") {
            let workdir = PathBuf::from(dir);
            if !workdir.is_dir() {
                return Err(HarnessError::configuration(format!(
                    "SMOKE_DRIVER_DIR '{}' is not a directory",
                    workdir.display()
                )));
            }
            self.driver.workdir = workdir;
        }

        if let Ok(command) = std::env::var("SMOKE_DRIVER_BUILD_CMD") {
            if command.trim().is_empty() {
                return Err(HarnessError::configuration("SMOKE_DRIVER_BUILD_CMD cannot be empty"));
            }
            self.driver.command = command;
        }

        if let Ok(image) = std::env::var("SMOKE_BACKEND_IMAGE") {
            self.backend_image = image;
        }

        Ok(self)
    }

    /// Backend URL shared by the harness and the driver
    pub fn address(&self) -> String {
        format!("http://{}", self.listen_addr)
    }

    /// Driver settings for this scenario, authenticated with `token`
    pub fn driver_options(&self, token: SecretString) -> DriverOptions {
        DriverOptions {
            provider: self.backend,
            address: self.address(),
            auth: DriverAuth::Token { token },
            mount_path: self.secret.mount.clone(),
            rotation: RotationSettings { enabled: true, interval: self.rotation_interval },
            monitoring: self.monitoring,
        }
    }

    /// Reject driver options that no longer describe this scenario.
    ///
    /// Overrides may tune the driver, but it must still talk to the backend
    /// this run provisioned, read from the seeded mount, and rotate.
    pub fn check_driver_options(&self, options: &DriverOptions) -> Result<()> {
        let address = self.address();
        if options.address != address {
            return Err(HarnessError::configuration(format!(
                "{} must be {address}, the address of the provisioned backend (got {})",
                OptionKey::Address.name(options.provider),
                options.address
            )));
        }
        if options.mount_path != self.secret.mount {
            return Err(HarnessError::configuration(format!(
                "{} must be {}, the mount the secret is seeded in (got {})",
                OptionKey::MountPath.name(options.provider),
                self.secret.mount,
                options.mount_path
            )));
        }
        if !options.rotation.enabled {
            return Err(HarnessError::configuration(format!(
                "{} cannot be disabled, the scenario verifies rotation",
                OptionKey::EnableRotation.name(options.provider)
            )));
        }
        Ok(())
    }
}
