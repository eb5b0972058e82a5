//! # Plugin Lifecycle Controller
//!
//! Drives the secrets driver through `build -> configure -> enable`, and back
//! down through `disable -> remove` at teardown. Docker only accepts
//! `plugin set` while a plugin is disabled, so configuration is applied in a
//! single call before the one and only `enable`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::config::{DriverBuild, DriverOptions};
use crate::engine::{Engine, EngineResult, PluginBuild, Removal};
use crate::errors::{HarnessError, Result};

/// Lifecycle state of the driver within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Built,
    Configured,
    Enabled,
    Disabled,
}

/// The driver artifact as the harness has left it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSession {
    pub plugin_name: String,
    /// Setting names applied by the last `configure`
    pub applied_keys: Vec<String>,
    pub phase: DriverPhase,
}

impl DriverSession {
    pub fn is_enabled(&self) -> bool {
        self.phase == DriverPhase::Enabled
    }
}

/// Builds, configures and toggles the driver plugin
#[derive(Clone)]
pub struct PluginController {
    engine: Arc<dyn Engine>,
}

impl PluginController {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Produce a fresh plugin artifact.
    ///
    /// A plugin left over under the same name is disabled and removed first so
    /// the build installs the current source.
    #[instrument(skip(self, build), fields(plugin = %build.plugin_name))]
    pub async fn build(&self, build: &DriverBuild) -> Result<DriverSession> {
        if let Some(existing) = self
            .engine
            .inspect_plugin(&build.plugin_name)
            .await
            .map_err(|e| HarnessError::build(e.to_string()))?
        {
            info!(enabled = existing.enabled, "Removing pre-existing plugin");
            self.teardown_named(&build.plugin_name)
                .await
                .map_err(|e| HarnessError::build(format!("cannot remove stale plugin: {e}")))?;
        }

        let job = PluginBuild {
            plugin_name: build.plugin_name.clone(),
            workdir: build.workdir.clone(),
            command: build.command.clone(),
        };
        self.engine.build_plugin(&job).await.map_err(|e| HarnessError::build(e.to_string()))?;

        match self.engine.inspect_plugin(&build.plugin_name).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(HarnessError::build(format!(
                    "build command '{}' finished but plugin '{}' is not installed",
                    build.command, build.plugin_name
                )))
            }
            Err(e) => return Err(HarnessError::build(e.to_string())),
        }

        info!("Driver built");
        Ok(DriverSession {
            plugin_name: build.plugin_name.clone(),
            applied_keys: Vec::new(),
            phase: DriverPhase::Built,
        })
    }

    /// Validate and apply the full option set in one `plugin set`
    pub async fn configure(&self, session: &mut DriverSession, options: &DriverOptions) -> Result<()> {
        if session.is_enabled() {
            return Err(HarnessError::configuration(format!(
                "plugin '{}' is enabled; settings can only be changed while disabled",
                session.plugin_name
            )));
        }
        options.validate()?;

        self.engine
            .set_plugin(&session.plugin_name, &options.to_settings())
            .await
            .map_err(|e| HarnessError::configuration(e.to_string()))?;

        session.applied_keys = options.keys();
        session.phase = DriverPhase::Configured;
        info!(plugin = %session.plugin_name, options = %options, "Driver configured");
        Ok(())
    }

    /// Enable a configured plugin and confirm Docker reports it enabled
    pub async fn enable(&self, session: &mut DriverSession, timeout: Duration) -> Result<()> {
        match session.phase {
            DriverPhase::Configured => {}
            DriverPhase::Enabled => {
                return Err(HarnessError::activation(&session.plugin_name, "already enabled"))
            }
            DriverPhase::Built | DriverPhase::Disabled => {
                return Err(HarnessError::activation(
                    &session.plugin_name,
                    "plugin must be configured before it is enabled",
                ))
            }
        }

        self.engine
            .enable_plugin(&session.plugin_name, timeout)
            .await
            .map_err(|e| HarnessError::activation(&session.plugin_name, e.to_string()))?;

        match self.engine.inspect_plugin(&session.plugin_name).await {
            Ok(Some(state)) if state.enabled => {}
            Ok(_) => {
                return Err(HarnessError::activation(
                    &session.plugin_name,
                    "enable returned but the plugin does not report enabled",
                ))
            }
            Err(e) => return Err(HarnessError::activation(&session.plugin_name, e.to_string())),
        }

        session.phase = DriverPhase::Enabled;
        info!(plugin = %session.plugin_name, "Driver enabled");
        Ok(())
    }

    pub async fn disable(&self, session: &mut DriverSession) -> Result<()> {
        self.engine
            .disable_plugin(&session.plugin_name)
            .await
            .map_err(|e| HarnessError::activation(&session.plugin_name, e.to_string()))?;
        session.phase = DriverPhase::Disabled;
        Ok(())
    }

    /// Disable (best-effort) and remove the plugin; safe to call repeatedly
    pub async fn teardown_named(&self, plugin_name: &str) -> EngineResult<Removal> {
        match self.engine.disable_plugin(plugin_name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(Removal::Absent),
            Err(e) => warn!(plugin = plugin_name, error = %e, "Disable failed; forcing removal"),
        }

        let removal = self.engine.remove_plugin(plugin_name).await?;
        info!(plugin = plugin_name, outcome = removal.as_str(), "Driver removed");
        Ok(removal)
    }

    pub async fn teardown(&self, session: &DriverSession) -> EngineResult<Removal> {
        self.teardown_named(&session.plugin_name).await
    }
}
