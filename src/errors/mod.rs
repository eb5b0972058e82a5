//! # Error Handling
//!
//! Stage-level error taxonomy for the smoke harness. Every stage function
//! returns one of these; the session controller records the failing stage and
//! proceeds to teardown. None of them is retried across stages.

use std::time::Duration;

/// Custom result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Main error type for the smoke harness
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HarnessError {
    /// Backend container could not be created or started
    #[error("Provisioning failed: {message}")]
    Provision { message: String },

    /// A readiness probe did not succeed within its budget
    #[error(
        "Readiness timeout: '{target}' not ready within {waited:?} after {attempts} probes (last error: {})",
        .last_error.as_deref().unwrap_or("none")
    )]
    ReadinessTimeout {
        target: String,
        waited: Duration,
        attempts: u32,
        last_error: Option<String>,
    },

    /// Key/value write against the backend failed
    #[error("Secret write failed at '{path}': {message}")]
    Write { path: String, message: String },

    /// Policy application or token issuance failed
    #[error("Auth setup failed: {message}")]
    AuthSetup { message: String },

    /// Driver artifact could not be built or is not inspectable
    #[error("Driver build failed: {message}")]
    Build { message: String },

    /// Invalid scenario selector, invalid driver option, or a plugin-state violation
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Driver did not reach the enabled state
    #[error("Activation failed for driver '{driver}': {message}")]
    Activation { driver: String, message: String },

    /// Deployment objects could not be created
    #[error("Deployment failed for '{target}': {message}")]
    Deploy { target: String, message: String },

    /// Deployment did not reach its desired replica count in time
    #[error(
        "Convergence timeout: service '{service}' has {running}/{desired} running tasks after {waited:?}"
    )]
    ConvergenceTimeout {
        service: String,
        running: usize,
        desired: u64,
        waited: Duration,
    },

    /// Delivered secret never matched the expected bytes
    #[error(
        "Verification timeout: secret '{secret}' did not match after {attempts} attempts in {waited:?} (last observed: {})",
        .last_observed.as_deref().map(|v| format!("{v:?}")).unwrap_or_else(|| "nothing".to_string())
    )]
    VerificationTimeout {
        secret: String,
        attempts: u32,
        waited: Duration,
        last_observed: Option<String>,
    },

    /// The run was cancelled from outside (Ctrl-C, SIGTERM, CI job cancellation)
    #[error("Interrupted by external cancellation")]
    Interrupted,
}

impl HarnessError {
    /// Create a provisioning error
    pub fn provision<S: Into<String>>(message: S) -> Self {
        Self::Provision { message: message.into() }
    }

    /// Create a write error for the given backend path
    pub fn write<P: Into<String>, S: Into<String>>(path: P, message: S) -> Self {
        Self::Write { path: path.into(), message: message.into() }
    }

    /// Create an auth setup error
    pub fn auth_setup<S: Into<String>>(message: S) -> Self {
        Self::AuthSetup { message: message.into() }
    }

    /// Create a build error
    pub fn build<S: Into<String>>(message: S) -> Self {
        Self::Build { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an activation error
    pub fn activation<D: Into<String>, S: Into<String>>(driver: D, message: S) -> Self {
        Self::Activation { driver: driver.into(), message: message.into() }
    }

    /// Create a deployment error
    pub fn deploy<T: Into<String>, S: Into<String>>(target: T, message: S) -> Self {
        Self::Deploy { target: target.into(), message: message.into() }
    }

    /// Taxonomy name used in reports and diagnostic output
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provision { .. } => "ProvisionError",
            Self::ReadinessTimeout { .. } => "ReadinessTimeout",
            Self::Write { .. } => "WriteError",
            Self::AuthSetup { .. } => "AuthSetupError",
            Self::Build { .. } => "BuildError",
            Self::Configuration { .. } => "ConfigurationError",
            Self::Activation { .. } => "ActivationError",
            Self::Deploy { .. } => "DeployError",
            Self::ConvergenceTimeout { .. } => "ConvergenceTimeout",
            Self::VerificationTimeout { .. } => "VerificationTimeout",
            Self::Interrupted => "Interrupted",
        }
    }

    /// Last value observed by the verification engine, if this error carries one
    pub fn last_observed(&self) -> Option<&str> {
        match self {
            Self::VerificationTimeout { last_observed, .. } => last_observed.as_deref(),
            _ => None,
        }
    }
}
