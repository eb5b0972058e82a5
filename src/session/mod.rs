//! # Session Controller
//!
//! Sequences one scenario through its stages:
//!
//! ```text
//! INIT → BACKEND_UP → SECRET_SEEDED → DRIVER_BUILT → DRIVER_CONFIGURED →
//! DRIVER_ENABLED → DEPLOYED → BASELINE_VERIFIED → ROTATED → ROTATION_VERIFIED
//! ```
//!
//! Every resource is entered into a teardown ledger before it is created, and
//! the ledger is unwound in reverse order exactly once when the run ends,
//! whether it passed, failed at any stage, or was cancelled.

pub mod report;

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{BackendSpec, Provisioner, StoreConnector};
use crate::config::ScenarioConfig;
use crate::deploy::{DeploymentController, DeploymentHandle, DeploymentMode};
use crate::engine::{Engine, EngineResult, Removal};
use crate::errors::{HarnessError, Result};
use crate::plugin::PluginController;
use crate::verify::{VerificationOutcome, Verifier};

pub use report::{
    RunReport, StageFailure, TeardownRecord, Terminal, VerificationRecord, EXIT_FAILURE,
    EXIT_INTERRUPTED, EXIT_PASS,
};

/// Scenario state machine stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    BackendUp,
    SecretSeeded,
    DriverBuilt,
    DriverConfigured,
    DriverEnabled,
    Deployed,
    BaselineVerified,
    Rotated,
    RotationVerified,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::BackendUp => "BACKEND_UP",
            Self::SecretSeeded => "SECRET_SEEDED",
            Self::DriverBuilt => "DRIVER_BUILT",
            Self::DriverConfigured => "DRIVER_CONFIGURED",
            Self::DriverEnabled => "DRIVER_ENABLED",
            Self::Deployed => "DEPLOYED",
            Self::BaselineVerified => "BASELINE_VERIFIED",
            Self::Rotated => "ROTATED",
            Self::RotationVerified => "ROTATION_VERIFIED",
        }
    }

    /// Successor in the happy path; `None` for the final stage
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Init => Some(Self::BackendUp),
            Self::BackendUp => Some(Self::SecretSeeded),
            Self::SecretSeeded => Some(Self::DriverBuilt),
            Self::DriverBuilt => Some(Self::DriverConfigured),
            Self::DriverConfigured => Some(Self::DriverEnabled),
            Self::DriverEnabled => Some(Self::Deployed),
            Self::Deployed => Some(Self::BaselineVerified),
            Self::BaselineVerified => Some(Self::Rotated),
            Self::Rotated => Some(Self::RotationVerified),
            Self::RotationVerified => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage bookkeeping for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    reached: Stage,
    entering: Stage,
}

impl Progress {
    fn new() -> Self {
        Self { reached: Stage::Init, entering: Stage::Init }
    }

    fn begin(&mut self, stage: Stage) {
        debug_assert_eq!(self.reached.next(), Some(stage));
        self.entering = stage;
    }

    fn complete(&mut self) {
        self.reached = self.entering;
        info!(stage = %self.reached, "Stage reached");
    }
}

/// Something the run created and must remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Backend { container: String },
    Driver { plugin: String },
    Deployment(DeploymentHandle),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { container } => write!(f, "container {container}"),
            Self::Driver { plugin } => write!(f, "plugin {plugin}"),
            Self::Deployment(handle) => match (&handle.mode, &handle.stack_name) {
                (DeploymentMode::Stack, Some(stack)) => write!(f, "stack {stack}"),
                _ => write!(f, "service {} + secret {}", handle.service_name, handle.secret_name),
            },
        }
    }
}

/// Resources in creation order; unwound at most once
#[derive(Debug, Default)]
pub struct Ledger {
    resources: Vec<Resource>,
    unwound: bool,
}

impl Ledger {
    pub fn record(&mut self, resource: Resource) {
        if !self.resources.contains(&resource) {
            self.resources.push(resource);
        }
    }

    /// Resources in removal order, or `None` once already taken
    pub fn take_for_teardown(&mut self) -> Option<Vec<Resource>> {
        if self.unwound {
            return None;
        }
        self.unwound = true;
        Some(std::mem::take(&mut self.resources).into_iter().rev().collect())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Runs scenarios end to end
#[derive(Clone)]
pub struct Session {
    provisioner: Provisioner,
    plugins: PluginController,
    deployments: DeploymentController,
    verifier: Verifier,
    driver_overrides: Vec<String>,
}

impl Session {
    pub fn new(engine: Arc<dyn Engine>, connector: Arc<dyn StoreConnector>) -> Self {
        let deployments = DeploymentController::new(engine.clone());
        Self {
            provisioner: Provisioner::new(engine.clone(), connector),
            plugins: PluginController::new(engine),
            verifier: Verifier::new(deployments.clone()),
            deployments,
            driver_overrides: Vec::new(),
        }
    }

    /// Operator-supplied `KEY=VALUE` driver settings applied on top of the scenario's
    pub fn with_driver_overrides(mut self, overrides: Vec<String>) -> Self {
        self.driver_overrides = overrides;
        self
    }

    /// Resolve `selector` and run it; an unknown selector fails in INIT without side effects
    pub async fn run_selector(
        &self,
        selector: &str,
        mode: Option<DeploymentMode>,
        cancel: CancellationToken,
    ) -> RunReport {
        match ScenarioConfig::from_selector(selector, mode) {
            Ok(config) => self.run(&config, cancel).await,
            Err(e) => {
                error!(selector, error = %e, "Scenario selection failed");
                let now = Utc::now();
                RunReport {
                    run_id: Uuid::new_v4(),
                    scenario: selector.to_string(),
                    backend: None,
                    mode,
                    started_at: now,
                    finished_at: now,
                    reached: Stage::Init,
                    terminal: Terminal::Failed(StageFailure::new(Stage::Init, &e)),
                    verifications: Vec::new(),
                    teardown: Vec::new(),
                }
            }
        }
    }

    /// Drive one scenario to a terminal state, then tear down
    pub async fn run(&self, config: &ScenarioConfig, cancel: CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, scenario = %config.name, backend = %config.backend, "Starting smoke run");

        let mut ledger = Ledger::default();
        let mut progress = Progress::new();
        let mut verifications = Vec::new();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HarnessError::Interrupted),
            result = self.drive(config, &mut ledger, &mut progress, &mut verifications) => result,
        };

        let terminal = match outcome {
            Ok(()) => {
                info!(scenario = %config.name, "Smoke run passed");
                Terminal::Passed
            }
            Err(HarnessError::Interrupted) => {
                warn!(stage = %progress.entering, "Smoke run interrupted");
                Terminal::Interrupted { stage: progress.entering }
            }
            Err(e) => {
                let failure = StageFailure::new(progress.entering, &e);
                error!(
                    stage = %failure.stage,
                    kind = %failure.kind,
                    reason = %failure.reason,
                    last_observed = ?failure.last_observed,
                    "Smoke run failed"
                );
                Terminal::Failed(failure)
            }
        };

        let teardown = self.teardown(&mut ledger).await;

        RunReport {
            run_id,
            scenario: config.name.clone(),
            backend: Some(config.backend),
            mode: Some(config.deployment.mode),
            started_at,
            finished_at: Utc::now(),
            reached: progress.reached,
            terminal,
            verifications,
            teardown,
        }
    }

    async fn drive(
        &self,
        config: &ScenarioConfig,
        ledger: &mut Ledger,
        progress: &mut Progress,
        verifications: &mut Vec<VerificationRecord>,
    ) -> Result<()> {
        progress.begin(Stage::BackendUp);
        ledger.record(Resource::Backend { container: config.container_name.clone() });
        let mut backend = self.provisioner.start(&BackendSpec::from_config(config)).await?;
        self.provisioner.await_ready(&backend, config.timeouts.backend_ready).await?;
        progress.complete();

        progress.begin(Stage::SecretSeeded);
        let token = self
            .provisioner
            .issue_scoped_token(&mut backend, &config.policy_name, &config.secret.read_policy())
            .await?;
        self.provisioner.write_secret(&mut backend, &config.secret, &config.expected_value).await?;
        progress.complete();

        progress.begin(Stage::DriverBuilt);
        ledger.record(Resource::Driver { plugin: config.driver.plugin_name.clone() });
        let mut driver = self.plugins.build(&config.driver).await?;
        progress.complete();

        progress.begin(Stage::DriverConfigured);
        let mut options = config.driver_options(token);
        options.apply_overrides(&self.driver_overrides)?;
        config.check_driver_options(&options)?;
        self.plugins.configure(&mut driver, &options).await?;
        progress.complete();

        progress.begin(Stage::DriverEnabled);
        self.plugins.enable(&mut driver, config.driver.enable_timeout).await?;
        progress.complete();

        progress.begin(Stage::Deployed);
        ledger.record(Resource::Deployment(DeploymentHandle::for_spec(&config.deployment)));
        let handle = self.deployments.apply(&config.deployment, config.timeouts.convergence).await?;
        progress.complete();

        progress.begin(Stage::BaselineVerified);
        let baseline = self
            .verifier
            .verify_value(&handle, &config.expected_value, config.timeouts.verify)
            .await?;
        verifications.push(record("baseline", &baseline));
        progress.complete();

        progress.begin(Stage::Rotated);
        self.verifier
            .rotate(&self.provisioner, &mut backend, &config.secret, &config.rotated_value)
            .await?;
        progress.complete();

        progress.begin(Stage::RotationVerified);
        let rotated = self
            .verifier
            .await_rotation(
                &handle,
                &config.rotated_value,
                options.rotation.interval,
                config.rotation_settle,
                config.timeouts.rotation_verify,
            )
            .await?;
        verifications.push(record("rotation", &rotated));
        progress.complete();

        Ok(())
    }

    /// Unwind the ledger; failures are logged and recorded, never raised
    pub async fn teardown(&self, ledger: &mut Ledger) -> Vec<TeardownRecord> {
        let Some(resources) = ledger.take_for_teardown() else {
            return Vec::new();
        };

        let mut records = Vec::with_capacity(resources.len());
        for resource in resources {
            let result = self.remove(&resource).await;
            let record = match result {
                Ok(removal) => TeardownRecord {
                    resource: resource.to_string(),
                    outcome: removal.as_str().to_string(),
                    error: None,
                },
                Err(e) => {
                    warn!(resource = %resource, error = %e, "Teardown step failed");
                    TeardownRecord {
                        resource: resource.to_string(),
                        outcome: "failed".to_string(),
                        error: Some(e.to_string()),
                    }
                }
            };
            records.push(record);
        }

        info!(steps = records.len(), "Teardown complete");
        records
    }

    async fn remove(&self, resource: &Resource) -> EngineResult<Removal> {
        match resource {
            Resource::Backend { container } => self.provisioner.stop(container).await,
            Resource::Driver { plugin } => self.plugins.teardown_named(plugin).await,
            Resource::Deployment(handle) => self.deployments.remove(handle).await,
        }
    }

    /// Remove everything a scenario could have created, e.g. after the harness was killed
    pub async fn cleanup(&self, config: &ScenarioConfig) -> Vec<TeardownRecord> {
        let mut ledger = Ledger::default();
        ledger.record(Resource::Backend { container: config.container_name.clone() });
        ledger.record(Resource::Driver { plugin: config.driver.plugin_name.clone() });
        ledger.record(Resource::Deployment(DeploymentHandle::for_spec(&config.deployment)));
        self.teardown(&mut ledger).await
    }
}

fn record(phase: &'static str, outcome: &VerificationOutcome) -> VerificationRecord {
    VerificationRecord { phase, attempts: outcome.attempts, elapsed: outcome.elapsed }
}
