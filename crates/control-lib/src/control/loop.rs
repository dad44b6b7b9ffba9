//! Control loop scheduler
//!
//! Runs the read / generate / push / postdict cycle at a fixed period until
//! the expected number of full-window ticks is reached or shutdown is
//! signalled.

use super::io::{NullActuator, StaticPosture};
use super::window::SlidingWindow;
use super::{Actuator, PostureSource};
use crate::engine::EngineClient;
use crate::error::{ControlError, Result};
use crate::models::{Elbo, EstimatorConfig, JointState};
use crate::observability::{LoopMetrics, StructuredLogger};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Configuration for the control loop
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Estimator enabled on the engine before the first iteration
    pub estimator: EstimatorConfig,
    /// Target iteration period; zero runs back to back
    pub period: Duration,
    /// Read the latent state after every postdiction
    pub fetch_state: bool,
    /// Emit a structured log line per postdiction tick
    pub log_postdiction: bool,
    /// Channel buffer size for cycle records
    pub record_buffer: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorConfig::default(),
            period: Duration::ZERO,
            fetch_state: false,
            log_postdiction: true,
            record_buffer: 1024,
        }
    }
}

/// Lifecycle of one loop run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    /// Not started yet
    Idle,
    /// The engine has no usable model; nothing was run
    AwaitingModel,
    /// Filling the window, no postdiction yet
    Warming,
    /// Postdicting every iteration
    Active,
    /// Reached the expected number of ticks
    Done,
    /// Cancelled by shutdown
    Stopped,
    /// An engine or posture call failed
    Failed,
}

impl LoopPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopPhase::Idle => "idle",
            LoopPhase::AwaitingModel => "awaiting_model",
            LoopPhase::Warming => "warming",
            LoopPhase::Active => "active",
            LoopPhase::Done => "done",
            LoopPhase::Stopped => "stopped",
            LoopPhase::Failed => "failed",
        }
    }

    /// Whether the run is over
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopPhase::AwaitingModel | LoopPhase::Done | LoopPhase::Stopped | LoopPhase::Failed
        )
    }
}

/// Snapshot published after every iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    pub phase: LoopPhase,
    pub tick: u64,
    pub iterations: u64,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            phase: LoopPhase::Idle,
            tick: 0,
            iterations: 0,
        }
    }
}

/// What happened in one iteration
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    /// 1-based iteration number
    pub iteration: u64,
    /// Full-window tick count after this iteration
    pub tick: u64,
    pub phase: LoopPhase,
    pub observed: JointState,
    pub target: JointState,
    pub elbo: Option<Elbo>,
    pub state: Option<Vec<f32>>,
    /// Time spent before the period sleep
    pub busy: Duration,
    pub sleep: Duration,
}

/// Summary of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoopReport {
    pub phase: LoopPhase,
    pub iterations: u64,
    pub ticks: u64,
    pub overruns: u64,
    pub dropped_records: u64,
    pub last_elbo: Option<Elbo>,
}

impl LoopReport {
    fn new() -> Self {
        Self {
            phase: LoopPhase::Idle,
            iterations: 0,
            ticks: 0,
            overruns: 0,
            dropped_records: 0,
            last_elbo: None,
        }
    }
}

/// Time left to sleep so an iteration lasts `period`; never negative
pub fn sleep_budget(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

/// Predictive control loop over one engine client
pub struct ControlLoop {
    client: EngineClient,
    source: Box<dyn PostureSource>,
    actuator: Box<dyn Actuator>,
    config: LoopConfig,
    records_tx: mpsc::Sender<CycleRecord>,
    status_tx: watch::Sender<LoopStatus>,
    metrics: LoopMetrics,
    logger: StructuredLogger,
    progress: LoopReport,
}

impl ControlLoop {
    /// Create a new control loop
    pub fn new(
        client: EngineClient,
        source: Box<dyn PostureSource>,
        actuator: Box<dyn Actuator>,
        config: LoopConfig,
        logger: StructuredLogger,
    ) -> (Self, mpsc::Receiver<CycleRecord>) {
        let (records_tx, records_rx) = mpsc::channel(config.record_buffer.max(1));
        let (status_tx, _) = watch::channel(LoopStatus::default());

        let control = Self {
            client,
            source,
            actuator,
            config,
            records_tx,
            status_tx,
            metrics: LoopMetrics::new(),
            logger,
            progress: LoopReport::new(),
        };

        (control, records_rx)
    }

    /// Subscribe to phase and tick updates
    pub fn status(&self) -> watch::Receiver<LoopStatus> {
        self.status_tx.subscribe()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn client(&self) -> &EngineClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut EngineClient {
        &mut self.client
    }

    /// Give the engine client back, e.g. to train after a run
    pub fn into_client(self) -> EngineClient {
        self.client
    }

    fn publish(&mut self, phase: LoopPhase) {
        self.progress.phase = phase;
        self.status_tx.send_replace(LoopStatus {
            phase,
            tick: self.progress.ticks,
            iterations: self.progress.iterations,
        });
    }

    fn fail(&mut self, operation: &str, err: ControlError) -> ControlError {
        self.metrics.inc_engine_errors();
        self.logger.log_engine_failure(operation, &err);
        self.publish(LoopPhase::Failed);
        err
    }

    /// Run one experiment: load, enable, then iterate until done or shutdown.
    ///
    /// Returns `ModelUnavailable` without touching the engine again when no
    /// trained model is available. Failed engine calls end the run.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<LoopReport> {
        self.progress = LoopReport::new();

        let shape = match self.client.load() {
            Ok(shape) => shape,
            Err(ControlError::ModelUnavailable { n_dof }) => {
                self.logger.log_model_unavailable(n_dof);
                self.metrics.clear_model_shape();
                self.publish(LoopPhase::AwaitingModel);
                return Err(ControlError::ModelUnavailable { n_dof });
            }
            Err(e) => return Err(self.fail("load", e)),
        };
        self.logger.log_model_loaded(&shape);
        self.metrics.set_model_shape(&shape);

        let estimator = self.config.estimator.clone();
        let exp_time = estimator.exp_time as u64;
        let mut window = SlidingWindow::new(estimator.win_size, shape.n_dof)?;
        if let Err(e) = self.client.enable(estimator) {
            return Err(self.fail("enable", e));
        }

        info!(
            n_dof = shape.n_dof,
            win_size = window.capacity(),
            exp_time,
            period_ms = self.config.period.as_millis() as u64,
            "Starting control loop"
        );
        self.publish(LoopPhase::Warming);

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => {
                    info!("Shutting down control loop");
                    self.publish(LoopPhase::Stopped);
                    break;
                }
            }

            let start = Instant::now();

            let observed = tokio::select! {
                observed = self.source.read(shape.n_dof) => observed,
                _ = shutdown.recv() => {
                    info!("Shutting down control loop");
                    self.publish(LoopPhase::Stopped);
                    break;
                }
            };
            let observed = match observed {
                Ok(o) if o.len() == shape.n_dof => o,
                Ok(o) => {
                    let err = ControlError::size_mismatch("observed posture", shape.n_dof, o.len());
                    return Err(self.fail("read_posture", err));
                }
                Err(e) => return Err(self.fail("read_posture", e)),
            };

            let target = match self.client.generate() {
                Ok(target) => target,
                Err(e) => return Err(self.fail("generate", e)),
            };
            self.actuator.dispatch(&target);

            window.push(observed.clone())?;

            let mut elbo = None;
            let mut state = None;
            if window.is_full() {
                self.progress.ticks += 1;
                let tick = self.progress.ticks;
                let flat = window.flatten()?;

                let postdict_start = Instant::now();
                let result = match self.client.postdict(&flat) {
                    Ok(result) => result,
                    Err(e) => return Err(self.fail("postdict", e)),
                };
                let postdict_elapsed = postdict_start.elapsed();

                self.metrics
                    .observe_postdiction_latency(postdict_elapsed.as_secs_f64());
                self.metrics.record_postdiction(tick, &result);
                if self.config.log_postdiction {
                    self.logger.log_postdiction(
                        tick,
                        &result,
                        postdict_elapsed.as_secs_f64() * 1000.0,
                    );
                }

                if self.config.fetch_state {
                    match self.client.get_state() {
                        Ok(s) => state = Some(s),
                        Err(e) => return Err(self.fail("get_state", e)),
                    }
                }

                self.progress.last_elbo = Some(result);
                elbo = Some(result);
            }

            let busy = start.elapsed();
            self.metrics.observe_cycle_latency(busy.as_secs_f64());
            let sleep = sleep_budget(self.config.period, busy);
            if !self.config.period.is_zero() && busy > self.config.period {
                self.progress.overruns += 1;
                self.metrics.inc_timing_overruns();
                debug!(
                    busy_us = busy.as_micros() as u64,
                    period_us = self.config.period.as_micros() as u64,
                    "Iteration overran its period"
                );
            }

            self.progress.iterations += 1;
            let phase = if self.progress.ticks >= exp_time {
                LoopPhase::Done
            } else if self.progress.ticks > 0 {
                LoopPhase::Active
            } else {
                LoopPhase::Warming
            };

            let record = CycleRecord {
                iteration: self.progress.iterations,
                tick: self.progress.ticks,
                phase,
                observed,
                target,
                elbo,
                state,
                busy,
                sleep,
            };
            match self.records_tx.try_send(record) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.progress.dropped_records += 1;
                    debug!(iteration = self.progress.iterations, "Record channel full");
                }
                // nobody listening
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
            self.publish(phase);

            // the final tick still honours its period before finishing
            if sleep.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = shutdown.recv() => {
                        if phase != LoopPhase::Done {
                            info!("Shutting down control loop");
                            self.publish(LoopPhase::Stopped);
                        }
                        break;
                    }
                }
            }

            if phase == LoopPhase::Done {
                break;
            }
        }

        self.logger.log_loop_finished(
            self.progress.phase.as_str(),
            self.progress.ticks,
            self.progress.iterations,
        );
        Ok(self.progress)
    }
}

/// Builder for creating the control loop
pub struct ControlLoopBuilder {
    client: Option<EngineClient>,
    source: Option<Box<dyn PostureSource>>,
    actuator: Option<Box<dyn Actuator>>,
    config: LoopConfig,
    logger: Option<StructuredLogger>,
}

impl ControlLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            client: None,
            source: None,
            actuator: None,
            config: LoopConfig::default(),
            logger: None,
        }
    }

    pub fn client(mut self, client: EngineClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Posture source; defaults to a static zero posture
    pub fn posture_source(mut self, source: Box<dyn PostureSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Target sink; defaults to discarding targets
    pub fn actuator(mut self, actuator: Box<dyn Actuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn estimator(mut self, estimator: EstimatorConfig) -> Self {
        self.config.estimator = estimator;
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.config.period = period;
        self
    }

    pub fn fetch_state(mut self, fetch_state: bool) -> Self {
        self.config.fetch_state = fetch_state;
        self
    }

    pub fn log_postdiction(mut self, log: bool) -> Self {
        self.config.log_postdiction = log;
        self
    }

    pub fn record_buffer(mut self, size: usize) -> Self {
        self.config.record_buffer = size;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the control loop
    pub fn build(self) -> anyhow::Result<(ControlLoop, mpsc::Receiver<CycleRecord>)> {
        let client = self
            .client
            .ok_or_else(|| anyhow::anyhow!("Engine client is required"))?;
        self.config.estimator.validate()?;

        let source = self
            .source
            .unwrap_or_else(|| Box::new(StaticPosture::zeros()));
        let actuator = self.actuator.unwrap_or_else(|| Box::new(NullActuator));
        let logger = self
            .logger
            .unwrap_or_else(|| StructuredLogger::new("control-loop"));

        Ok(ControlLoop::new(
            client,
            source,
            actuator,
            self.config,
            logger,
        ))
    }
}

impl Default for ControlLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::models::RawDims;

    #[test]
    fn test_sleep_budget_never_negative() {
        let period = Duration::from_millis(10);
        assert_eq!(
            sleep_budget(period, Duration::from_millis(3)),
            Duration::from_millis(7)
        );
        assert_eq!(sleep_budget(period, period), Duration::ZERO);
        assert_eq!(
            sleep_budget(period, Duration::from_millis(25)),
            Duration::ZERO
        );
        assert_eq!(
            sleep_budget(Duration::ZERO, Duration::from_millis(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_loop_config_default() {
        let config = LoopConfig::default();
        assert_eq!(config.period, Duration::ZERO);
        assert_eq!(config.estimator.win_size, 15);
        assert_eq!(config.estimator.exp_time, 15);
        assert!(!config.fetch_state);
    }

    #[test]
    fn test_phase_terminality() {
        assert!(LoopPhase::Done.is_terminal());
        assert!(LoopPhase::AwaitingModel.is_terminal());
        assert!(!LoopPhase::Warming.is_terminal());
        assert!(!LoopPhase::Active.is_terminal());
        assert_eq!(LoopPhase::AwaitingModel.as_str(), "awaiting_model");
    }

    #[test]
    fn test_builder_missing_client() {
        assert!(ControlLoopBuilder::new().build().is_err());
    }

    #[test]
    fn test_builder_rejects_invalid_estimator() {
        let client = EngineClient::new(Box::new(MockEngine::new(RawDims {
            n_dof: 2,
            state_dim: 4,
            n_layers: 2,
        })));
        let result = ControlLoopBuilder::new()
            .client(client)
            .estimator(EstimatorConfig {
                win_size: 0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }
}
