//! rollgate: rollout orchestration from the command line.
//!
//! - `run` drives one plan to a terminal status and exits with a code
//!   describing the outcome (see [`exit`]).
//! - `validate` parses and checks a plan without touching anything.
//! - `serve` exposes the orchestrator over the REST API.
//!
//! # Usage
//!
//! ```text
//! rollgate run demos/checkout.toml --data-dir /var/lib/rollgate
//! rollgate validate demos/checkout.toml
//! rollgate serve --port 8480
//! ```

mod adapters;
mod exit;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rollgate_core::{OrchestratorConfig, RolloutPlan, format_duration};
use rollgate_rollout::{AutoApprove, Orchestrator, TracingNotifier};
use rollgate_state::StateStore;

use crate::adapters::{CommandSignalSource, ShellExecutor, ShellProbe};

#[derive(Parser)]
#[command(name = "rollgate", about = "Progressive rollouts with automatic rollback")]
struct Cli {
    /// Orchestrator configuration file.
    #[arg(long, global = true, default_value = "rollgate.toml")]
    config: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a rollout plan to completion.
    Run {
        plan: PathBuf,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep state in memory only.
        #[arg(long)]
        in_memory: bool,

        /// Grant every phase that requires approval.
        #[arg(long)]
        auto_approve: bool,
    },

    /// Parse and validate a plan, then print a summary.
    Validate { plan: PathBuf },

    /// Serve the REST API.
    Serve {
        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long)]
        auto_approve: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let result = match cli.command {
        Command::Run {
            plan,
            data_dir,
            in_memory,
            auto_approve,
        } => run(&cli.config, &plan, data_dir, in_memory, auto_approve).await,
        Command::Validate { plan } => Ok(validate(&plan)),
        Command::Serve {
            port,
            data_dir,
            auto_approve,
        } => serve(&cli.config, port, data_dir, auto_approve)
            .await
            .map(|()| exit::SUCCEEDED),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "rollgate failed");
            eprintln!("error: {e:#}");
            ExitCode::from(exit::RUNTIME)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rollgate=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("rollgate.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

fn build_orchestrator(
    store: StateStore,
    config: &OrchestratorConfig,
    auto_approve: bool,
) -> Orchestrator {
    let orchestrator = Orchestrator::new(
        store,
        Arc::new(ShellExecutor),
        Arc::new(CommandSignalSource::new(config.signals.clone())),
    )
    .with_config(config)
    .with_probe(Arc::new(ShellProbe))
    .with_notifier(Arc::new(TracingNotifier));
    if auto_approve {
        orchestrator.with_approval(Arc::new(AutoApprove))
    } else {
        orchestrator
    }
}

// ── run ───────────────────────────────────────────────────────────

async fn run(
    config_path: &Path,
    plan_path: &Path,
    data_dir: Option<PathBuf>,
    in_memory: bool,
    auto_approve: bool,
) -> anyhow::Result<u8> {
    let config = OrchestratorConfig::load_or_default(config_path)?;
    let plan = match RolloutPlan::from_file(plan_path) {
        Ok(plan) => plan,
        Err(e) => {
            error!(plan = ?plan_path, error = %e, "cannot load plan");
            eprintln!("error: {e}");
            return Ok(exit::INVALID);
        }
    };

    let store = if in_memory {
        StateStore::open_in_memory()?
    } else {
        open_store(&data_dir.unwrap_or_else(|| config.data_dir.clone()))?
    };
    let orchestrator = build_orchestrator(store, &config, auto_approve);

    let started = match orchestrator.start(plan).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "rollout not started");
            eprintln!("error: {e}");
            return Ok(exit::for_error(&e));
        }
    };
    let id = started.id.clone();

    // Ctrl-C requests an abort; the rollout still reverts before exiting.
    let aborter = orchestrator.clone();
    let abort_id = id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(rollout = %abort_id, "interrupt received, aborting rollout");
            if let Err(e) = aborter.abort(&abort_id).await {
                error!(rollout = %abort_id, error = %e, "abort failed");
            }
        }
    });

    let finished = orchestrator.wait(&id).await?;
    let summary = serde_json::json!({
        "id": finished.id,
        "target": finished.target,
        "status": finished.status(),
        "reason": finished.reason(),
        "manual_intervention": finished.manual_intervention(),
        "rollback_attempts": finished.rollback_attempts(),
        "decisions": finished.decisions().len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(exit::for_status(finished.status()))
}

// ── validate ──────────────────────────────────────────────────────

fn validate(plan_path: &Path) -> u8 {
    let plan = match RolloutPlan::from_file(plan_path).and_then(|p| p.validate().map(|()| p)) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("invalid plan {}: {e}", plan_path.display());
            return exit::INVALID;
        }
    };

    println!("target: {}", plan.target);
    println!("global timeout: {}", format_duration(plan.global_timeout));
    println!("preflight checks: {}", plan.preflight.len());
    for (i, phase) in plan.phases.iter().enumerate() {
        let gate = if phase.requires_approval { " (approval)" } else { "" };
        println!("phase {i}: {} -> {}{gate}", phase.name, phase.action.name);
        for window in phase.windows_in_order() {
            println!(
                "  window {}: {} every {}, {} rule(s)",
                window.name,
                format_duration(window.duration),
                format_duration(window.interval),
                window.rules.len()
            );
        }
    }
    println!(
        "policy: {} rule(s), {} retries",
        plan.policy.rules.len(),
        plan.policy.max_retries
    );
    match plan.rollback_verify_window() {
        Some(w) => println!("rollback: {} verified by {}", plan.rollback.action.name, w.name),
        None => println!("rollback: {} (no verification window)", plan.rollback.action.name),
    }
    for warning in plan.warnings() {
        println!("warning: {warning}");
    }
    exit::SUCCEEDED
}

// ── serve ─────────────────────────────────────────────────────────

async fn serve(
    config_path: &Path,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
    auto_approve: bool,
) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load_or_default(config_path)?;
    let store = open_store(&data_dir.unwrap_or_else(|| config.data_dir.clone()))?;
    let orchestrator = build_orchestrator(store, &config, auto_approve);

    let router = rollgate_api::build_router(orchestrator);
    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(config.port)));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("failed to install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("rollgate server stopped");
    Ok(())
}
