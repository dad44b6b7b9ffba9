//! Observability infrastructure for the control loop
//!
//! Provides:
//! - Prometheus metrics (cycle latency, postdiction latency, ticks, overruns, ELBO, model shape)
//! - Structured JSON logging with tracing

use crate::models::{Elbo, ModelShape, TrainingReport};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_gauge, GaugeVec,
    Histogram, IntCounter, IntGauge,
};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<LoopMetricsInner> = OnceLock::new();

struct LoopMetricsInner {
    cycle_latency_seconds: Histogram,
    postdiction_latency_seconds: Histogram,
    postdiction_ticks: IntCounter,
    timing_overruns: IntCounter,
    engine_errors: IntCounter,
    loop_tick: IntGauge,
    elbo: GaugeVec,
    model_shape_info: GaugeVec,
    training_step: IntGauge,
    training_loss: GaugeVec,
}

impl LoopMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "control_loop_cycle_latency_seconds",
                "Busy time of one control iteration, excluding the period sleep",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            postdiction_latency_seconds: register_histogram!(
                "control_loop_postdiction_latency_seconds",
                "Time spent inside engine postdiction",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register postdiction_latency_seconds"),

            postdiction_ticks: register_int_counter!(
                "control_loop_postdiction_ticks_total",
                "Full-window iterations that ran a postdiction"
            )
            .expect("Failed to register postdiction_ticks"),

            timing_overruns: register_int_counter!(
                "control_loop_timing_overruns_total",
                "Iterations whose busy time exceeded the period"
            )
            .expect("Failed to register timing_overruns"),

            engine_errors: register_int_counter!(
                "control_loop_engine_errors_total",
                "Engine calls that failed"
            )
            .expect("Failed to register engine_errors"),

            loop_tick: register_int_gauge!(
                "control_loop_tick",
                "Current full-window tick of the running loop"
            )
            .expect("Failed to register loop_tick"),

            elbo: register_gauge_vec!(
                "control_loop_elbo",
                "Last postdiction ELBO terms",
                &["term"]
            )
            .expect("Failed to register elbo"),

            model_shape_info: register_gauge_vec!(
                "control_loop_model_shape_info",
                "Dimensions of the currently loaded model",
                &["n_dof", "state_dim", "n_layers"]
            )
            .expect("Failed to register model_shape_info"),

            training_step: register_int_gauge!(
                "control_training_step",
                "Last reported training epoch"
            )
            .expect("Failed to register training_step"),

            training_loss: register_gauge_vec!(
                "control_training_loss",
                "Last reported training loss terms",
                &["term"]
            )
            .expect("Failed to register training_loss"),
        }
    }
}

/// Control loop metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct LoopMetrics {
    _private: (),
}

impl Default for LoopMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(LoopMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &LoopMetricsInner {
        GLOBAL_METRICS.get_or_init(LoopMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn observe_postdiction_latency(&self, duration_secs: f64) {
        self.inner().postdiction_latency_seconds.observe(duration_secs);
    }

    /// Record a completed postdiction tick and its ELBO
    pub fn record_postdiction(&self, tick: u64, elbo: &Elbo) {
        let inner = self.inner();
        inner.postdiction_ticks.inc();
        inner.loop_tick.set(tick as i64);
        inner.elbo.with_label_values(&["loss"]).set(elbo.loss as f64);
        inner
            .elbo
            .with_label_values(&["reconstruction"])
            .set(elbo.reconstruction as f64);
        inner
            .elbo
            .with_label_values(&["regulation"])
            .set(elbo.regulation as f64);
    }

    pub fn inc_timing_overruns(&self) {
        self.inner().timing_overruns.inc();
    }

    pub fn inc_engine_errors(&self) {
        self.inner().engine_errors.inc();
    }

    /// Publish the loaded model's dimensions
    pub fn set_model_shape(&self, shape: &ModelShape) {
        let inner = self.inner();
        let n_dof = shape.n_dof.to_string();
        let state_dim = shape.state_dim.to_string();
        let n_layers = shape.n_layers.to_string();

        inner.model_shape_info.reset();
        inner
            .model_shape_info
            .with_label_values(&[n_dof.as_str(), state_dim.as_str(), n_layers.as_str()])
            .set(1.0);
    }

    pub fn clear_model_shape(&self) {
        self.inner().model_shape_info.reset();
    }

    pub fn record_training(&self, report: &TrainingReport) {
        let inner = self.inner();
        inner.training_step.set(report.step as i64);
        inner
            .training_loss
            .with_label_values(&["loss"])
            .set(report.loss as f64);
        inner
            .training_loss
            .with_label_values(&["reconstruction_posterior"])
            .set(report.reconstruction_posterior as f64);
        inner
            .training_loss
            .with_label_values(&["reconstruction_prior"])
            .set(report.reconstruction_prior as f64);
        inner
            .training_loss
            .with_label_values(&["regulation"])
            .set(report.regulation as f64);
    }
}

/// Structured logger for lifecycle events
///
/// Consistent JSON-formatted logging for model loading, postdiction ticks,
/// training progress and shutdown.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, model_path: Option<&Path>) {
        info!(
            event = "agent_started",
            instance = %self.instance,
            agent_version = %version,
            model_path = ?model_path,
            "Control agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Control agent shutting down"
        );
    }

    pub fn log_model_loaded(&self, shape: &ModelShape) {
        info!(
            event = "model_loaded",
            instance = %self.instance,
            n_dof = shape.n_dof,
            state_dim = shape.state_dim,
            n_layers = shape.n_layers,
            "Model ready for control"
        );
    }

    /// The engine reported no usable model
    pub fn log_model_unavailable(&self, n_dof: i32) {
        warn!(
            event = "model_unavailable",
            instance = %self.instance,
            n_dof = n_dof,
            "There is no valid model, try to train it first"
        );
    }

    pub fn log_postdiction(&self, tick: u64, elbo: &Elbo, elapsed_ms: f64) {
        info!(
            event = "postdiction",
            instance = %self.instance,
            tick = tick,
            loss = elbo.loss,
            reconstruction = elbo.reconstruction,
            regulation = elbo.regulation,
            elapsed_ms = elapsed_ms,
            "Postdiction tick"
        );
    }

    pub fn log_engine_failure(&self, operation: &str, err: &dyn std::error::Error) {
        error!(
            event = "engine_failure",
            instance = %self.instance,
            operation = %operation,
            error = %err,
            "Engine call failed, stopping"
        );
    }

    pub fn log_loop_finished(&self, phase: &str, ticks: u64, iterations: u64) {
        info!(
            event = "loop_finished",
            instance = %self.instance,
            phase = %phase,
            ticks = ticks,
            iterations = iterations,
            "Control loop finished"
        );
    }

    pub fn log_training_progress(&self, report: &TrainingReport) {
        info!(
            event = "training_progress",
            instance = %self.instance,
            step = report.step,
            elapsed_ms = report.elapsed_ms,
            re_q = report.reconstruction_posterior,
            re_p = report.reconstruction_prior,
            regulation = report.regulation,
            loss = report.loss,
            saved = report.saved,
            "Training progress"
        );
    }

    pub fn log_training_finished(&self, success: bool) {
        if success {
            info!(
                event = "training_finished",
                instance = %self.instance,
                "Training finished"
            );
        } else {
            warn!(
                event = "training_failed",
                instance = %self.instance,
                "Training failed, the previous weights are kept"
            );
        }
    }
}
