//! Control Agent - online postdiction control for neural robot models
//!
//! Loads a model descriptor, then runs the requested modes in order:
//! `train` fits the model, `sim` runs the predictive control loop.

use anyhow::{Context, Result};
use clap::Parser;
use control_lib::{
    api::{self, AppState},
    control::{PostureSource, StaticPosture, TrajectoryPosture},
    health::{components, HealthRegistry},
    observability::{LoopMetrics, StructuredLogger},
    ControlError, ControlLoopBuilder, EngineClient, JointState, ReferenceEngine,
    TrainingInvoker,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Online postdiction control loop for neural robotics models
#[derive(Parser, Debug)]
#[command(name = "control-agent", version, about)]
struct Cli {
    /// Model descriptor (JSON); nothing is run without it
    model_path: Option<PathBuf>,

    /// Modes to run in order: train, sim
    modes: Vec<String>,

    /// Settings file layered under CONTROL_* environment variables
    #[arg(long, env = "CONTROL_CONFIG")]
    config: Option<PathBuf>,

    /// Serve /healthz, /readyz, /status and /metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Train,
    Sim,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Mode::Train),
            "sim" => Ok(Mode::Sim),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// Keep recognized modes in order; unknown ones are reported and skipped
fn parse_modes(args: &[String]) -> Vec<Mode> {
    args.iter()
        .filter_map(|arg| match arg.parse() {
            Ok(mode) => Some(mode),
            Err(_) => {
                warn!(argument = %arg, "Please indicate a valid argument [train,sim] !");
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();

    let mut settings = config::Settings::load(cli.config.as_deref())?;
    if cli.metrics_port.is_some() {
        settings.metrics_port = cli.metrics_port;
    }

    let logger = StructuredLogger::new(&settings.instance_name);
    logger.log_startup(AGENT_VERSION, cli.model_path.as_deref());

    let health_registry = HealthRegistry::new();
    health_registry.register(components::ENGINE).await;
    health_registry.register(components::CONTROL_LOOP).await;
    health_registry.register(components::TRAINING).await;

    let metrics = LoopMetrics::new();

    let api_handle = settings.metrics_port.map(|port| {
        let app_state = Arc::new(AppState::new(health_registry.clone(), metrics.clone()));
        tokio::spawn(api::serve(port, app_state))
    });

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut stop = shutdown_tx.subscribe();
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(());
            }
        }
    });

    let Some(model_path) = cli.model_path else {
        warn!("No model path given, nothing to run");
        logger.log_shutdown("no model path");
        return Ok(());
    };

    let engine = ReferenceEngine::new_model(&model_path).unwrap_or_else(|e| {
        error!(path = %model_path.display(), error = %e, "Failed to create the model");
        ReferenceEngine::empty()
    });
    let mut client = EngineClient::new(Box::new(engine));

    for mode in parse_modes(&cli.modes) {
        client = match mode {
            Mode::Train => train(client, &settings, &health_registry, &logger).await?,
            Mode::Sim => {
                simulate(
                    client,
                    &settings,
                    &health_registry,
                    &logger,
                    shutdown_tx.subscribe(),
                )
                .await?
            }
        };

        if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
            logger.log_shutdown("SIGINT received");
            break;
        }
    }

    if let Some(handle) = api_handle {
        handle.abort();
    }
    info!("Shutting down");
    Ok(())
}

/// Train the model, in the background or in reported rounds
async fn train(
    client: EngineClient,
    settings: &config::Settings,
    registry: &HealthRegistry,
    logger: &StructuredLogger,
) -> Result<EngineClient> {
    registry
        .set_degraded(components::TRAINING, "training in progress")
        .await;
    let invoker = TrainingInvoker::new(logger.clone());

    let handle = if settings.training_rounds > 0 {
        let (tx, mut rx) = mpsc::channel(16);
        let handle = invoker.run_interactive(
            client,
            settings.training_rounds,
            settings.epochs_per_round,
            tx,
        );

        let mut last = None;
        while let Some(report) = rx.recv().await {
            last = Some(report);
        }
        if let Some(report) = last {
            info!(step = report.step, loss = report.loss, "Last training round");
        }
        handle
    } else {
        invoker.spawn(client)
    };

    let (client, result) = handle.wait().await.context("Training task panicked")?;
    match result {
        Ok(()) => registry.set_healthy(components::TRAINING).await,
        Err(e) => {
            error!(error = %e, "Training failed");
            registry
                .set_unhealthy(components::TRAINING, e.to_string())
                .await;
        }
    }
    Ok(client)
}

/// Run the control loop once and hand the client back
async fn simulate(
    client: EngineClient,
    settings: &config::Settings,
    registry: &HealthRegistry,
    logger: &StructuredLogger,
    shutdown: broadcast::Receiver<()>,
) -> Result<EngineClient> {
    let source: Box<dyn PostureSource> = match &settings.posture_file {
        Some(path) => Box::new(load_postures(path)?),
        None => Box::new(StaticPosture::zeros()),
    };

    let (mut control, mut records) = ControlLoopBuilder::new()
        .client(client)
        .posture_source(source)
        .config(settings.loop_config())
        .logger(logger.clone())
        .build()?;

    let tracker = tokio::spawn({
        let registry = registry.clone();
        let status = control.status();
        async move { registry.track_loop(status).await }
    });
    let recorder = tokio::spawn(async move {
        while let Some(record) = records.recv().await {
            debug!(
                iteration = record.iteration,
                tick = record.tick,
                phase = record.phase.as_str(),
                busy_us = record.busy.as_micros() as u64,
                "Cycle"
            );
        }
    });

    match control.run(shutdown).await {
        Ok(report) => {
            info!(
                phase = report.phase.as_str(),
                ticks = report.ticks,
                iterations = report.iterations,
                overruns = report.overruns,
                "Simulation finished"
            );
            if let Some(path) = &settings.save_path {
                if let Err(e) = control.client_mut().save(path) {
                    warn!(path = %path.display(), error = %e, "Failed to save experiment data");
                }
            }
        }
        // already reported by the loop
        Err(ControlError::ModelUnavailable { .. }) => {}
        Err(e) => error!(error = %e, "Simulation stopped"),
    }

    let client = control.into_client();
    let _ = tracker.await;
    let _ = recorder.await;
    Ok(client)
}

/// Recorded postures as a JSON list of joint vectors
fn load_postures(path: &Path) -> Result<TrajectoryPosture> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read postures from {}", path.display()))?;
    let samples: Vec<Vec<f32>> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid posture file {}", path.display()))?;

    let source = TrajectoryPosture::new(samples.into_iter().map(JointState::new).collect())?;
    info!(path = %path.display(), samples = source.len(), "Replaying recorded postures");
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_modes_are_case_insensitive_and_ordered() {
        let args = vec!["TRAIN".to_string(), "sim".to_string(), "Sim".to_string()];
        assert_eq!(parse_modes(&args), vec![Mode::Train, Mode::Sim, Mode::Sim]);
    }

    #[test]
    fn test_unknown_modes_are_skipped() {
        let args = vec!["fly".to_string(), "sim".to_string()];
        assert_eq!(parse_modes(&args), vec![Mode::Sim]);
    }

    #[test]
    fn test_cli_positional_arguments() {
        let cli = Cli::try_parse_from(["control-agent", "model.json", "train", "sim"]).unwrap();
        assert_eq!(cli.model_path, Some(PathBuf::from("model.json")));
        assert_eq!(cli.modes, vec!["train", "sim"]);

        let cli = Cli::try_parse_from(["control-agent", "--metrics-port", "9100"]).unwrap();
        assert!(cli.model_path.is_none());
        assert_eq!(cli.metrics_port, Some(9100));
    }

    #[test]
    fn test_load_postures() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[[0.0, 1.0], [2.0, 3.0]]").unwrap();

        let source = load_postures(file.path()).unwrap();
        assert_eq!(source.len(), 2);

        let mut empty = tempfile::NamedTempFile::new().unwrap();
        write!(empty, "[]").unwrap();
        assert!(load_postures(empty.path()).is_err());
    }
}
