//! # Command Line Interface
//!
//! `smoke run` executes one or more scenarios and exits with the run's exit
//! code, `smoke plan` prints the resolved scenario without touching Docker, and
//! `smoke cleanup` removes whatever a killed run left behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::VaultConnector;
use crate::config::ScenarioConfig;
use crate::deploy::DeploymentMode;
use crate::engine::DockerEngine;
use crate::observability::{init_logging, LoggingConfig};
use crate::session::{RunReport, Session, TeardownRecord, Terminal, EXIT_FAILURE, EXIT_PASS};

/// Backend used when neither `--backend` nor `SMOKE_BACKEND` is given
const DEFAULT_BACKEND: &str = "vault";

#[derive(Parser)]
#[command(name = "smoke")]
#[command(about = "End-to-end smoke tests for the Swarm secrets driver")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run scenarios end to end
    Run {
        /// Backend to test (vault, openbao); repeat to run several concurrently.
        /// Defaults to $SMOKE_BACKEND, then vault.
        #[arg(short, long = "backend")]
        backends: Vec<String>,

        /// Deployment mode override (service, stack)
        #[arg(long)]
        mode: Option<DeploymentMode>,

        /// Write the run reports as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Extra driver setting, e.g. ROTATION_INTERVAL=20s
        #[arg(long = "driver-opt", value_name = "KEY=VALUE")]
        driver_opts: Vec<String>,
    },
    /// Print the resolved scenario as JSON (secrets redacted)
    Plan {
        #[arg(short, long = "backend")]
        backends: Vec<String>,

        #[arg(long)]
        mode: Option<DeploymentMode>,
    },
    /// Remove containers, plugins and deployments left by an interrupted run
    Cleanup {
        #[arg(short, long = "backend")]
        backends: Vec<String>,

        #[arg(long)]
        mode: Option<DeploymentMode>,
    },
}

/// Run the CLI and return the process exit code
pub async fn run_cli() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    init_logging(&LoggingConfig::from_env(cli.verbose));

    match cli.command {
        Commands::Run { backends, mode, report, driver_opts } => {
            run_scenarios(&selectors(backends), mode, report.as_deref(), driver_opts).await
        }
        Commands::Plan { backends, mode } => {
            for selector in selectors(backends) {
                let config = ScenarioConfig::from_selector(&selector, mode)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            Ok(EXIT_PASS)
        }
        Commands::Cleanup { backends, mode } => {
            let session = connect_session()?;
            let mut failed = false;
            for selector in selectors(backends) {
                let config = ScenarioConfig::from_selector(&selector, mode)?;
                let records = session.cleanup(&config).await;
                print_teardown(&config.name, &records);
                failed |= records.iter().any(TeardownRecord::failed);
            }
            Ok(if failed { EXIT_FAILURE } else { EXIT_PASS })
        }
    }
}

fn selectors(backends: Vec<String>) -> Vec<String> {
    if !backends.is_empty() {
        return backends;
    }
    vec![std::env::var("SMOKE_BACKEND").unwrap_or_else(|_| DEFAULT_BACKEND.to_string())]
}

fn connect_session() -> anyhow::Result<Session> {
    let engine = DockerEngine::connect_local().context("Docker is required to run smoke tests")?;
    Ok(Session::new(Arc::new(engine), Arc::new(VaultConnector)))
}

async fn run_scenarios(
    selectors: &[String],
    mode: Option<DeploymentMode>,
    report_path: Option<&Path>,
    driver_opts: Vec<String>,
) -> anyhow::Result<i32> {
    let session = connect_session()?.with_driver_overrides(driver_opts);
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let runs = selectors
        .iter()
        .map(|selector| session.run_selector(selector, mode, cancel.child_token()));
    let reports = futures::future::join_all(runs).await;

    for report in &reports {
        print_summary(report);
    }

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&reports)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Run report written");
    }

    // Interrupted (130) outranks failure (1), which outranks pass (0)
    Ok(reports.iter().map(RunReport::exit_code).max().unwrap_or(EXIT_PASS))
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        warn!("Shutdown signal received, cancelling runs and tearing down");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM; only Ctrl-C will cancel");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_summary(report: &RunReport) {
    let duration = humantime::format_duration(Duration::from_secs(report.duration().as_secs()));
    match &report.terminal {
        Terminal::Passed => {
            println!("{} {} ({})", "PASS".green().bold(), report.scenario, duration);
        }
        Terminal::Failed(failure) => {
            println!("{} {} ({})", "FAIL".red().bold(), report.scenario, duration);
            eprintln!("  stage:  {}", failure.stage);
            eprintln!("  error:  {}", failure.kind);
            eprintln!("  reason: {}", failure.reason);
            if let Some(observed) = &failure.last_observed {
                eprintln!("  last observed: {observed:?}");
            }
        }
        Terminal::Interrupted { stage } => {
            println!("{} {} during {}", "INTERRUPTED".yellow().bold(), report.scenario, stage);
        }
    }

    for issue in report.teardown_issues() {
        eprintln!(
            "  {} {}: {}",
            "teardown".yellow(),
            issue.resource,
            issue.error.as_deref().unwrap_or("failed")
        );
    }
}

fn print_teardown(scenario: &str, records: &[TeardownRecord]) {
    println!("{}", scenario.bold());
    for record in records {
        match &record.error {
            None => println!("  {} {}", record.outcome.green(), record.resource),
            Some(error) => println!("  {} {}: {}", "failed".red(), record.resource, error),
        }
    }
}
