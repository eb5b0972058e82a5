//! Run report: what happened, where it stopped, and what teardown did

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::BackendKind;
use crate::deploy::DeploymentMode;
use crate::errors::HarnessError;

use super::Stage;

/// Process exit code for a passed run
pub const EXIT_PASS: i32 = 0;
/// Process exit code for a stage failure
pub const EXIT_FAILURE: i32 = 1;
/// Process exit code when interrupted (128 + SIGINT)
pub const EXIT_INTERRUPTED: i32 = 130;

/// Where and why a run stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    /// Stage being entered when the error occurred
    pub stage: Stage,
    /// Error taxonomy name
    pub kind: String,
    pub reason: String,
    /// Last secret content seen by the verifier, if any
    pub last_observed: Option<String>,
}

impl StageFailure {
    pub fn new(stage: Stage, error: &HarnessError) -> Self {
        Self {
            stage,
            kind: error.kind().to_string(),
            reason: error.to_string(),
            last_observed: error.last_observed().map(str::to_string),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FAIL({}, {}): {}", self.stage, self.kind, self.reason)
    }
}

/// Final state of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Terminal {
    Passed,
    Failed(StageFailure),
    Interrupted { stage: Stage },
}

impl Terminal {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Passed => EXIT_PASS,
            Self::Failed(_) => EXIT_FAILURE,
            Self::Interrupted { .. } => EXIT_INTERRUPTED,
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// One verification pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationRecord {
    /// `baseline` or `rotation`
    pub phase: &'static str,
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Result of removing one ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownRecord {
    pub resource: String,
    /// `removed`, `absent` or `failed`
    pub outcome: String,
    pub error: Option<String>,
}

impl TeardownRecord {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Machine-readable account of one scenario run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Scenario name, or the raw selector when it did not resolve
    pub scenario: String,
    pub backend: Option<BackendKind>,
    pub mode: Option<DeploymentMode>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Last stage completed
    pub reached: Stage,
    pub terminal: Terminal,
    pub verifications: Vec<VerificationRecord>,
    pub teardown: Vec<TeardownRecord>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.terminal.exit_code()
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        match &self.terminal {
            Terminal::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn teardown_issues(&self) -> impl Iterator<Item = &TeardownRecord> {
        self.teardown.iter().filter(|record| record.failed())
    }

    /// Total wall-clock duration of the run
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Terminal::Passed.exit_code(), 0);
        assert_eq!(Terminal::Interrupted { stage: Stage::Deployed }.exit_code(), 130);

        let failure = StageFailure::new(Stage::Init, &HarnessError::configuration("bad"));
        assert_eq!(Terminal::Failed(failure).exit_code(), 1);
    }

    #[test]
    fn test_failure_display() {
        let failure = StageFailure::new(Stage::BackendUp, &HarnessError::provision("port in use"));
        assert_eq!(
            failure.to_string(),
            "FAIL(BACKEND_UP, ProvisionError): Provisioning failed: port in use"
        );
    }

    #[test]
    fn test_terminal_serialization() {
        let failure = StageFailure::new(Stage::Init, &HarnessError::configuration("unknown"));
        let json = serde_json::to_value(Terminal::Failed(failure)).unwrap();

        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "INIT");
        assert_eq!(json["kind"], "ConfigurationError");
    }
}
