//! # swarm-secrets-smoke
//!
//! End-to-end verification harness for a Docker Swarm secrets driver backed by
//! a Vault-compatible secret store (HashiCorp Vault or OpenBao).
//!
//! A run provisions a dev-mode backend, builds and configures the driver
//! plugin, deploys a consumer service that mounts a driver-backed secret,
//! checks the delivered bytes, rotates the backend value, checks again, and
//! always tears everything down.
//!
//! ## Architecture
//!
//! ```text
//!                      Session (state machine + teardown ledger)
//!        ┌──────────────┬───────────────┼────────────────┬─────────────┐
//!   Provisioner   PluginController  DeploymentController      Verifier
//!        │              │               │                        │
//!   SecretStore ────────┴──── Engine (bollard + docker CLI) ─────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use swarm_secrets_smoke::{
//!     backend::VaultConnector, engine::DockerEngine, session::Session, ScenarioConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let session = Session::new(Arc::new(DockerEngine::connect_local()?), Arc::new(VaultConnector));
//! let config = ScenarioConfig::from_selector("vault", None)?;
//! let report = session.run(&config, CancellationToken::new()).await;
//! std::process::exit(report.exit_code());
//! # }
//! ```

pub mod backend;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod plugin;
pub mod poll;
pub mod session;
pub mod types;
pub mod verify;

// Re-export commonly used types
pub use config::{BackendKind, ScenarioConfig};
pub use errors::{HarnessError, Result};
pub use session::{RunReport, Session, Stage, Terminal};
pub use types::SecretString;
