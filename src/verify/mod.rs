//! # Verification Engine
//!
//! Reads the secret file from the consumer's running task and compares it with
//! the expected value, byte for byte. No trimming or newline normalization is
//! applied: a driver that appends a newline delivers a different secret.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{BackendSession, Provisioner};
use crate::config::SecretLocation;
use crate::deploy::{DeploymentController, DeploymentHandle};
use crate::errors::{HarnessError, Result};
use crate::poll::{poll_until, PollPolicy};
use crate::types::SecretString;

/// Lines of task output logged when verification times out
const DIAGNOSTIC_LOG_TAIL: usize = 50;

/// Result of one verification run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    /// Bytes of the last read, if any read succeeded
    pub observed: Option<Vec<u8>>,
    pub elapsed: Duration,
    pub attempts: u32,
    pub passed: bool,
}

impl VerificationOutcome {
    /// Observed bytes as text, lossy for non-UTF-8 content
    pub fn observed_display(&self) -> Option<String> {
        self.observed.as_deref().map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Strict content oracle
pub fn values_match(observed: &[u8], expected: &[u8]) -> bool {
    observed == expected
}

/// One failed read or mismatching read
#[derive(Debug)]
enum Attempt {
    Mismatch(Vec<u8>),
    ReadFailed(String),
}

/// Checks delivered secret content in running tasks
#[derive(Clone)]
pub struct Verifier {
    deployments: DeploymentController,
}

impl Verifier {
    pub fn new(deployments: DeploymentController) -> Self {
        Self { deployments }
    }

    /// Poll the secret file until it equals `expected`; never errors
    pub async fn observe(
        &self,
        handle: &DeploymentHandle,
        expected: &SecretString,
        policy: PollPolicy,
    ) -> VerificationOutcome {
        let expected = expected.expose_secret().as_bytes();
        let result = poll_until(policy, &handle.secret_path, || async move {
            match self.deployments.read_file_from_task(handle, &handle.secret_path).await {
                Ok(bytes) if values_match(&bytes, expected) => Ok(bytes),
                Ok(bytes) => Err(Attempt::Mismatch(bytes)),
                Err(e) => Err(Attempt::ReadFailed(e.to_string())),
            }
        })
        .await;

        match result {
            Ok(polled) => VerificationOutcome {
                observed: Some(polled.value),
                elapsed: polled.elapsed,
                attempts: polled.attempts,
                passed: true,
            },
            Err(expired) => {
                let observed = match expired.last {
                    Some(Attempt::Mismatch(bytes)) => Some(bytes),
                    Some(Attempt::ReadFailed(error)) => {
                        debug!(error = %error, "Last verification read failed");
                        None
                    }
                    None => None,
                };
                VerificationOutcome {
                    observed,
                    elapsed: expired.waited,
                    attempts: expired.attempts,
                    passed: false,
                }
            }
        }
    }

    /// Like [`Verifier::observe`], but a mismatch after the budget is a
    /// `VerificationTimeout` and the task's recent logs are logged.
    pub async fn verify_value(
        &self,
        handle: &DeploymentHandle,
        expected: &SecretString,
        policy: PollPolicy,
    ) -> Result<VerificationOutcome> {
        let outcome = self.observe(handle, expected, policy).await;
        if outcome.passed {
            info!(
                secret = %handle.secret_name,
                attempts = outcome.attempts,
                elapsed = ?outcome.elapsed,
                "Secret content verified"
            );
            return Ok(outcome);
        }

        match self.deployments.fetch_logs(handle, DIAGNOSTIC_LOG_TAIL).await {
            Ok(logs) => {
                warn!(service = %handle.service_name, logs = %logs, "Task logs at verification timeout")
            }
            Err(e) => {
                warn!(service = %handle.service_name, error = %e, "Could not fetch task logs")
            }
        }

        Err(HarnessError::VerificationTimeout {
            secret: handle.secret_name.clone(),
            attempts: outcome.attempts,
            waited: outcome.elapsed,
            last_observed: outcome.observed_display(),
        })
    }

    /// Rewrite the backend value and wait for the driver to deliver it.
    ///
    /// The driver is never signalled; propagation is entirely its rotation
    /// loop's job.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_rotation_scenario(
        &self,
        provisioner: &Provisioner,
        session: &mut BackendSession,
        location: &SecretLocation,
        handle: &DeploymentHandle,
        new_value: &SecretString,
        interval: Duration,
        settle: Duration,
        policy: PollPolicy,
    ) -> Result<VerificationOutcome> {
        self.rotate(provisioner, session, location, new_value).await?;
        self.await_rotation(handle, new_value, interval, settle, policy).await
    }

    /// Write the new value and read it back from the backend
    pub async fn rotate(
        &self,
        provisioner: &Provisioner,
        session: &mut BackendSession,
        location: &SecretLocation,
        new_value: &SecretString,
    ) -> Result<()> {
        provisioner.write_secret(session, location, new_value).await?;

        match provisioner.read_secret(session, location).await? {
            Some(stored) if stored == *new_value => Ok(()),
            Some(_) => Err(HarnessError::write(
                location.display_path(),
                "read-back returned a different value than was written",
            )),
            None => Err(HarnessError::write(
                location.display_path(),
                format!("field '{}' missing after write", location.field),
            )),
        }
    }

    /// Sleep `max(interval, settle)`, then verify the rotated value
    pub async fn await_rotation(
        &self,
        handle: &DeploymentHandle,
        new_value: &SecretString,
        interval: Duration,
        settle: Duration,
        policy: PollPolicy,
    ) -> Result<VerificationOutcome> {
        let wait = interval.max(settle);
        info!(wait = ?wait, "Waiting for driver rotation");
        tokio::time::sleep(wait).await;

        self.verify_value(handle, new_value, policy).await
    }
}
