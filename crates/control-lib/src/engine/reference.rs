//! In-process reference engine
//!
//! A small latent model implementing [`InferenceEngine`] so the control loop
//! can run end to end without the production engine. Each primitive is a
//! learned mean trajectory in normalized joint space; the latent state is one
//! offset vector per layer, summed onto the trajectory to form the output.
//!
//! Postdiction fits the offsets to the observed window with Adam, trading
//! reconstruction error against a per-layer weighted penalty, and keeps the
//! best epoch. Training fits the trajectories to recorded primitives.

use super::adam::Adam;
use super::InferenceEngine;
use crate::error::EngineError;
use crate::models::{Elbo, EstimatorConfig, RawDims, TrainingReport};
use crate::robot::{RobotKind, RobotModel};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

const WEIGHTS_FILE: &str = "weights.json";
const CHECKPOINT_FILE: &str = "epoch.json";
const PREDICTION_FILE: &str = "prediction.json";

/// Model description read by [`ReferenceEngine::new_model`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Directory holding trained weights and the training checkpoint
    pub model_path: PathBuf,
    /// JSON file with primitives as `[primitive][time][joint]`, raw joint units
    pub data_path: PathBuf,
    pub robot: RobotKind,
    pub active_joints: Vec<bool>,
    #[serde(default = "default_layers")]
    pub n_layers: usize,
    /// Training epochs for background training
    #[serde(default = "default_epochs")]
    pub epochs: u64,
    #[serde(default = "default_train_alpha")]
    pub alpha: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    /// Weight of the trajectory smoothness penalty
    #[serde(default = "default_smoothness")]
    pub smoothness: f32,
    /// Resume from the last checkpoint
    #[serde(default)]
    pub retrain: bool,
    /// Only persist weights when the loss improves
    #[serde(default)]
    pub greedy: bool,
    /// Epochs between progress reports in background training
    #[serde(default = "default_report_every")]
    pub report_every: u64,
}

fn default_layers() -> usize {
    2
}

fn default_epochs() -> u64 {
    1000
}

fn default_train_alpha() -> f32 {
    0.001
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_smoothness() -> f32 {
    0.01
}

fn default_report_every() -> u64 {
    100
}

/// Trained parameters persisted in `weights.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedWeights {
    pub n_dof: usize,
    pub n_layers: usize,
    /// Normalized mean trajectory per primitive, `[primitive][time][joint]`
    pub trajectories: Vec<Vec<Vec<f32>>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Checkpoint {
    step: u64,
    loss: f32,
}

#[derive(Serialize)]
struct ExperimentRecord<'a> {
    primitive_id: usize,
    states: &'a [Vec<f32>],
    elbos: &'a [Elbo],
}

#[derive(Serialize)]
struct PredictionRecord {
    primitive_id: usize,
    steps: usize,
    outputs: Vec<Vec<f32>>,
}

/// Online estimation state of the enabled primitive
#[derive(Debug)]
struct Estimator {
    config: EstimatorConfig,
    primitive: usize,
    latent: Vec<f32>,
    cursor: usize,
    step: u64,
    adam: Adam,
    states: Vec<Vec<f32>>,
    elbos: Vec<Elbo>,
}

/// Interactive training state
#[derive(Debug)]
struct TrainingSession {
    data: Vec<Vec<Vec<f32>>>,
    trajectories: Vec<Vec<Vec<f32>>>,
    adam: Adam,
    step: u64,
    best_loss: f32,
    log_stdout: bool,
}

/// Reference implementation of the inference engine
#[derive(Debug, Default)]
pub struct ReferenceEngine {
    descriptor: Option<ModelDescriptor>,
    robot: Option<RobotModel>,
    weights: Option<TrainedWeights>,
    estimator: Option<Estimator>,
    training: Option<TrainingSession>,
}

impl ReferenceEngine {
    /// An engine with no model; `load` reports it as unavailable
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a model from a JSON descriptor file. Relative paths inside the
    /// descriptor are resolved against the descriptor's directory.
    pub fn new_model(descriptor_path: &Path) -> Result<Self, EngineError> {
        let content = fs::read_to_string(descriptor_path)?;
        let mut descriptor: ModelDescriptor = serde_json::from_str(&content)?;

        let base = descriptor_path.parent().unwrap_or_else(|| Path::new("."));
        if descriptor.model_path.is_relative() {
            descriptor.model_path = base.join(&descriptor.model_path);
        }
        if descriptor.data_path.is_relative() {
            descriptor.data_path = base.join(&descriptor.data_path);
        }

        Self::from_descriptor(descriptor)
    }

    pub fn from_descriptor(descriptor: ModelDescriptor) -> Result<Self, EngineError> {
        if descriptor.n_layers == 0 {
            return Err(EngineError::Model("n_layers must be at least 1".into()));
        }
        let robot = RobotModel::new(descriptor.robot, &descriptor.active_joints)
            .map_err(|e| EngineError::Model(e.to_string()))?;

        info!(
            robot = ?descriptor.robot,
            n_dof = robot.n_dof(),
            n_layers = descriptor.n_layers,
            model_path = %descriptor.model_path.display(),
            "Model created"
        );

        Ok(Self {
            descriptor: Some(descriptor),
            robot: Some(robot),
            ..Default::default()
        })
    }

    fn descriptor(&self) -> Result<&ModelDescriptor, EngineError> {
        self.descriptor.as_ref().ok_or(EngineError::NotCreated)
    }

    fn robot(&self) -> Result<&RobotModel, EngineError> {
        self.robot.as_ref().ok_or(EngineError::NotCreated)
    }

    fn loaded(&self, op: &'static str) -> Result<&TrainedWeights, EngineError> {
        self.descriptor()?;
        self.weights.as_ref().ok_or(EngineError::NotLoaded(op))
    }

    fn n_layers(&self) -> usize {
        self.descriptor.as_ref().map_or(0, |d| d.n_layers)
    }

    fn read_weights(&self) -> Result<TrainedWeights, EngineError> {
        let descriptor = self.descriptor()?;
        let path = descriptor.model_path.join(WEIGHTS_FILE);
        let weights: TrainedWeights = serde_json::from_str(&fs::read_to_string(path)?)?;

        let n_dof = self.robot()?.n_dof();
        if weights.n_dof != n_dof || weights.n_layers != descriptor.n_layers {
            return Err(EngineError::Model(format!(
                "weights were trained for n_dof = {}, n_layers = {} but the model declares {}, {}",
                weights.n_dof, weights.n_layers, n_dof, descriptor.n_layers
            )));
        }
        if weights.trajectories.is_empty() || weights.trajectories.iter().any(|t| t.is_empty()) {
            return Err(EngineError::Model("weights contain an empty primitive".into()));
        }
        for (p, trajectory) in weights.trajectories.iter().enumerate() {
            if let Some(sample) = trajectory.iter().find(|s| s.len() != n_dof) {
                return Err(EngineError::Model(format!(
                    "primitive {p} has a trained sample of {} joints, expected {n_dof}",
                    sample.len()
                )));
            }
        }
        Ok(weights)
    }

    /// Normalized recorded primitives, validated against the robot
    fn read_dataset(&self) -> Result<Vec<Vec<Vec<f32>>>, EngineError> {
        let descriptor = self.descriptor()?;
        let robot = self.robot()?;
        let mut data: Vec<Vec<Vec<f32>>> =
            serde_json::from_str(&fs::read_to_string(&descriptor.data_path)?)?;

        if data.is_empty() {
            return Err(EngineError::Model("dataset contains no primitives".into()));
        }
        for (p, primitive) in data.iter_mut().enumerate() {
            if primitive.is_empty() {
                return Err(EngineError::Model(format!("primitive {p} is empty")));
            }
            for sample in primitive.iter_mut() {
                if sample.len() != robot.n_dof() {
                    return Err(EngineError::Model(format!(
                        "primitive {p} has a sample of {} joints, expected {}",
                        sample.len(),
                        robot.n_dof()
                    )));
                }
                robot.normalize(sample);
            }
        }
        Ok(data)
    }

    fn read_checkpoint(&self) -> Option<Checkpoint> {
        let path = self.descriptor.as_ref()?.model_path.join(CHECKPOINT_FILE);
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Run the open session in rounds of `report_every` until `epochs` is reached
    fn train_until(&mut self, epochs: u64, report_every: u64) -> Result<(), EngineError> {
        loop {
            let step = self.training.as_ref().map_or(epochs + 1, |s| s.step);
            if step > epochs {
                return Ok(());
            }
            let remaining = epochs - step + 1;
            self.train_loop(remaining.min(report_every) as usize)?;
        }
    }

    fn persist(
        &self,
        trajectories: &[Vec<Vec<f32>>],
        step: u64,
        loss: f32,
    ) -> Result<(), EngineError> {
        let descriptor = self.descriptor()?;
        fs::create_dir_all(&descriptor.model_path)?;

        let weights = TrainedWeights {
            n_dof: self.robot()?.n_dof(),
            n_layers: descriptor.n_layers,
            trajectories: trajectories.to_vec(),
        };
        fs::write(
            descriptor.model_path.join(WEIGHTS_FILE),
            serde_json::to_vec(&weights)?,
        )?;
        fs::write(
            descriptor.model_path.join(CHECKPOINT_FILE),
            serde_json::to_vec(&Checkpoint { step, loss })?,
        )?;
        debug!(step, loss, "Model saved");
        Ok(())
    }
}

/// Normalized output at `time` for a given latent offset set
fn output_at(trajectory: &[Vec<f32>], time: usize, latent: &[f32], n_dof: usize) -> Vec<f32> {
    let base = &trajectory[time.min(trajectory.len() - 1)];
    let mut out = base.clone();
    for layer in latent.chunks(n_dof) {
        for (o, z) in out.iter_mut().zip(layer) {
            *o += z;
        }
    }
    out
}

/// Free energy of `latent` against a normalized window ending just before `cursor`.
/// Returns the ELBO and fills `grad`.
fn free_energy(
    trajectory: &[Vec<f32>],
    window: &[f32],
    win_size: usize,
    cursor: usize,
    latent: &[f32],
    weights: &[f32],
    grad: &mut [f32],
) -> Elbo {
    let n_dof = window.len() / win_size;
    let scale = 1.0 / (win_size * n_dof) as f32;

    let mut residual_sum = vec![0.0f32; n_dof];
    let mut reconstruction = 0.0;
    for (t, observed) in window.chunks(n_dof).enumerate() {
        let time = (cursor + t).saturating_sub(win_size);
        let predicted = output_at(trajectory, time, latent, n_dof);
        for j in 0..n_dof {
            let r = observed[j] - predicted[j];
            reconstruction += r * r;
            residual_sum[j] += r;
        }
    }
    reconstruction *= scale;

    let mut regulation = 0.0;
    for (l, layer) in latent.chunks(n_dof).enumerate() {
        let w = weights.get(l).copied().unwrap_or(0.0);
        let norm: f32 = layer.iter().map(|z| z * z).sum::<f32>() / n_dof as f32;
        regulation += w * norm;
        for (j, z) in layer.iter().enumerate() {
            grad[l * n_dof + j] = -2.0 * scale * residual_sum[j] + 2.0 * w * z / n_dof as f32;
        }
    }

    Elbo {
        loss: reconstruction + regulation,
        reconstruction,
        regulation,
    }
}

/// Reconstruction and smoothness terms of the training objective, with gradient
fn training_loss(
    data: &[Vec<Vec<f32>>],
    trajectories: &[Vec<Vec<f32>>],
    smoothness: f32,
    grad: &mut [f32],
) -> (f32, f32) {
    let total: usize = data.iter().map(|p| p.iter().map(Vec::len).sum::<usize>()).sum();
    let scale = 1.0 / total.max(1) as f32;

    let mut reconstruction = 0.0;
    let mut regulation = 0.0;
    let mut offset = 0;
    for (primitive, trajectory) in data.iter().zip(trajectories) {
        let n_dof = primitive[0].len();
        for (t, (observed, predicted)) in primitive.iter().zip(trajectory).enumerate() {
            for j in 0..n_dof {
                let r = predicted[j] - observed[j];
                reconstruction += r * r * scale;
                grad[offset + t * n_dof + j] = 2.0 * r * scale;
            }
        }
        for t in 1..trajectory.len() {
            for j in 0..n_dof {
                let d = trajectory[t][j] - trajectory[t - 1][j];
                regulation += smoothness * d * d * scale;
                grad[offset + t * n_dof + j] += 2.0 * smoothness * d * scale;
                grad[offset + (t - 1) * n_dof + j] -= 2.0 * smoothness * d * scale;
            }
        }
        offset += trajectory.len() * n_dof;
    }
    (reconstruction, regulation)
}

fn flatten_trajectories(trajectories: &[Vec<Vec<f32>>]) -> Vec<f32> {
    trajectories.iter().flatten().flatten().copied().collect()
}

fn unflatten_into(flat: &[f32], trajectories: &mut [Vec<Vec<f32>>]) {
    debug_assert_eq!(flat.len(), flatten_trajectories(trajectories).len());
    for (v, x) in trajectories.iter_mut().flatten().flatten().zip(flat) {
        *v = *x;
    }
}

impl InferenceEngine for ReferenceEngine {
    fn load(&mut self) -> Result<RawDims, EngineError> {
        self.weights = None;
        self.estimator = None;

        if self.descriptor.is_none() {
            warn!("Load requested but the model was not created yet");
            return Ok(RawDims::UNAVAILABLE);
        }

        match self.read_weights() {
            Ok(weights) => {
                let dims = RawDims {
                    n_dof: weights.n_dof as i32,
                    state_dim: (weights.n_dof * weights.n_layers) as i32,
                    n_layers: weights.n_layers as i32,
                };
                self.weights = Some(weights);
                Ok(dims)
            }
            Err(e) => {
                warn!(error = %e, "Trained weights unavailable");
                Ok(RawDims::UNAVAILABLE)
            }
        }
    }

    fn enable(&mut self, config: &EstimatorConfig) -> Result<(), EngineError> {
        let weights = self.loaded("e_enable")?;
        if config.weights.len() != weights.n_layers {
            return Err(EngineError::Model(format!(
                "expected {} layer weights, got {}",
                weights.n_layers,
                config.weights.len()
            )));
        }

        let n_primitives = weights.trajectories.len();
        let mut primitive = config.primitive_id as usize;
        if primitive >= n_primitives {
            warn!(
                primitive_id = primitive,
                available = n_primitives,
                "Primitive id out of range, selecting primitive 0"
            );
            primitive = 0;
        }

        let state_dim = weights.n_dof * weights.n_layers;
        self.estimator = Some(Estimator {
            config: config.clone(),
            primitive,
            latent: vec![0.0; state_dim],
            cursor: 0,
            step: 1,
            adam: Adam::new(state_dim, config.alpha, config.beta1, config.beta2),
            states: Vec::new(),
            elbos: Vec::new(),
        });
        Ok(())
    }

    fn postdict(&mut self, window: &[f32]) -> Result<Elbo, EngineError> {
        let robot = self.robot()?.clone();
        let weights = self
            .weights
            .as_ref()
            .ok_or(EngineError::NotLoaded("e_postdict"))?;
        let estimator = self
            .estimator
            .as_mut()
            .ok_or_else(|| EngineError::Model("no estimator enabled".into()))?;

        let win_size = estimator.config.win_size;
        if window.len() != win_size * weights.n_dof {
            return Err(EngineError::Model(format!(
                "window of {} values does not match {} x {}",
                window.len(),
                win_size,
                weights.n_dof
            )));
        }

        let mut observed = window.to_vec();
        robot.normalize(&mut observed);

        let trajectory = &weights.trajectories[estimator.primitive];
        let mut grad = vec![0.0; estimator.latent.len()];
        let mut best: Option<(Elbo, Vec<f32>)> = None;

        for epoch in 1..=estimator.config.epochs {
            let elbo = free_energy(
                trajectory,
                &observed,
                win_size,
                estimator.cursor,
                &estimator.latent,
                &estimator.config.weights,
                &mut grad,
            );
            debug!(
                epoch,
                step = estimator.step,
                reconstruction = elbo.reconstruction,
                regulation = elbo.regulation,
                loss = elbo.loss,
                "Postdiction epoch"
            );

            if best.as_ref().map_or(true, |(b, _)| elbo.loss < b.loss) {
                best = Some((elbo, estimator.latent.clone()));
            }

            estimator
                .adam
                .step(&mut estimator.latent, &grad, estimator.step);
            estimator.step += 1;
        }

        let (elbo, latent) = best.ok_or_else(|| EngineError::Model("no postdiction epochs".into()))?;
        estimator.latent = latent;

        if estimator.config.store_states {
            estimator.states.push(estimator.latent.clone());
        }
        if estimator.config.store_er {
            estimator.elbos.push(elbo);
        }
        Ok(elbo)
    }

    fn generate(&mut self, target: &mut [f32]) -> Result<(), EngineError> {
        let robot = self.robot()?.clone();
        let weights = self
            .weights
            .as_ref()
            .ok_or(EngineError::NotLoaded("e_generate"))?;

        let (primitive, cursor, latent) = match self.estimator.as_mut() {
            Some(e) => {
                let cursor = e.cursor;
                e.cursor += 1;
                (e.primitive, cursor, e.latent.clone())
            }
            None => (0, 0, vec![0.0; weights.n_dof * weights.n_layers]),
        };

        let mut out = output_at(&weights.trajectories[primitive], cursor, &latent, weights.n_dof);
        robot.denormalize(&mut out);
        target.copy_from_slice(&out);
        Ok(())
    }

    fn get_state(&mut self, state: &mut [f32]) -> Result<(), EngineError> {
        self.loaded("e_getState")?;
        let estimator = self
            .estimator
            .as_ref()
            .ok_or_else(|| EngineError::Model("no estimator enabled".into()))?;
        state.copy_from_slice(&estimator.latent);
        Ok(())
    }

    fn save(&mut self, path: &Path) -> Result<(), EngineError> {
        self.loaded("e_save")?;
        let estimator = self
            .estimator
            .as_ref()
            .ok_or_else(|| EngineError::Model("no estimator enabled".into()))?;

        if !estimator.config.store_states && !estimator.config.store_er {
            warn!("Neither states nor ELBO traces were retained; saving an empty record");
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = ExperimentRecord {
            primitive_id: estimator.primitive,
            states: &estimator.states,
            elbos: &estimator.elbos,
        };
        fs::write(path, serde_json::to_vec_pretty(&record)?)?;
        Ok(())
    }

    fn predict(&mut self, path: &Path, steps: usize, init_state: &[f32]) -> Result<(), EngineError> {
        let robot = self.robot()?.clone();
        let weights = self.loaded("a_predict")?;
        let primitive = self.estimator.as_ref().map_or(0, |e| e.primitive);
        let trajectory = &weights.trajectories[primitive];

        let outputs = (0..steps)
            .map(|time| {
                let mut out = output_at(trajectory, time, init_state, weights.n_dof);
                robot.denormalize(&mut out);
                out
            })
            .collect();

        fs::create_dir_all(path)?;
        let record = PredictionRecord {
            primitive_id: primitive,
            steps,
            outputs,
        };
        fs::write(
            path.join(PREDICTION_FILE),
            serde_json::to_vec_pretty(&record)?,
        )?;
        info!(path = %path.display(), steps, "Offline prediction written");
        Ok(())
    }

    fn feed_forward_output_from_context(
        &self,
        context: &[f32],
        output: &mut [f32],
    ) -> Result<(), EngineError> {
        let robot = self.robot()?;
        let weights = self.loaded("a_feedForwardOutputFromContext")?;
        let (primitive, cursor) = self
            .estimator
            .as_ref()
            .map_or((0, 0), |e| (e.primitive, e.cursor));

        let mut out = output_at(&weights.trajectories[primitive], cursor, context, weights.n_dof);
        robot.denormalize(&mut out);
        output.copy_from_slice(&out);
        Ok(())
    }

    fn train_background(&mut self) -> Result<(), EngineError> {
        self.train_init(true)?;
        let (epochs, report_every) = {
            let d = self.descriptor()?;
            (d.epochs, d.report_every.max(1))
        };

        let result = self.train_until(epochs, report_every);
        if let Err(ref e) = result {
            error!(error = %e, "Background training failed");
        }
        self.train_end()?;
        result
    }

    fn train_init(&mut self, log_stdout: bool) -> Result<(), EngineError> {
        let descriptor = self.descriptor()?.clone();
        let data = self.read_dataset()?;

        let mut trajectories: Vec<Vec<Vec<f32>>> = data
            .iter()
            .map(|p| p.iter().map(|s| vec![0.5; s.len()]).collect())
            .collect();
        let mut step = 1;
        let mut best_loss = f32::MAX;

        if descriptor.retrain {
            match (self.read_checkpoint(), self.read_weights()) {
                (Some(checkpoint), Ok(weights))
                    if weights.trajectories.len() == trajectories.len()
                        && weights
                            .trajectories
                            .iter()
                            .zip(&trajectories)
                            .all(|(a, b)| a.len() == b.len()) =>
                {
                    trajectories = weights.trajectories;
                    step = checkpoint.step + 1;
                    best_loss = checkpoint.loss;
                    info!(step, best_loss, "Retraining the model");
                }
                _ => warn!("Checkpoint unavailable or incompatible, training from scratch"),
            }
        } else {
            info!("Training from scratch");
        }

        let n_params = flatten_trajectories(&trajectories).len();
        self.weights = None;
        self.estimator = None;
        self.training = Some(TrainingSession {
            data,
            trajectories,
            adam: Adam::new(n_params, descriptor.alpha, descriptor.beta1, descriptor.beta2),
            step,
            best_loss,
            log_stdout,
        });
        Ok(())
    }

    fn train_loop(&mut self, epochs: usize) -> Result<TrainingReport, EngineError> {
        let (smoothness, greedy) = {
            let d = self.descriptor()?;
            (d.smoothness, d.greedy)
        };
        let session = self
            .training
            .as_mut()
            .ok_or_else(|| EngineError::Model("training session not initialized".into()))?;

        let start = Instant::now();
        let mut params = flatten_trajectories(&session.trajectories);
        let mut grad = vec![0.0; params.len()];
        let mut reconstruction = 0.0;
        let mut regulation = 0.0;

        for _ in 0..epochs {
            (reconstruction, regulation) =
                training_loss(&session.data, &session.trajectories, smoothness, &mut grad);
            session.adam.step(&mut params, &grad, session.step);
            unflatten_into(&params, &mut session.trajectories);
            session.step += 1;
        }

        let loss = reconstruction + regulation;
        let (reconstruction_prior, _) =
            training_loss(&session.data, &session.trajectories, 0.0, &mut grad);

        let step = session.step - 1;
        let save = !greedy || loss < session.best_loss;
        if save {
            session.best_loss = loss;
        }
        let report = TrainingReport {
            step,
            elapsed_ms: start.elapsed().as_secs_f32() * 1000.0,
            reconstruction_posterior: reconstruction,
            reconstruction_prior,
            regulation,
            loss,
            saved: save,
        };

        if session.log_stdout {
            info!(
                epoch = report.step,
                elapsed_ms = report.elapsed_ms,
                re_q = report.reconstruction_posterior,
                re_p = report.reconstruction_prior,
                regulation = report.regulation,
                loss = report.loss,
                "Training progress"
            );
        } else {
            debug!(epoch = report.step, loss = report.loss, "Training progress");
        }

        if save {
            let trajectories = session.trajectories.clone();
            self.persist(&trajectories, step, loss)?;
        }
        Ok(report)
    }

    fn train_end(&mut self) -> Result<(), EngineError> {
        self.descriptor()?;
        if let Some(session) = self.training.take() {
            info!(last_step = session.step - 1, best_loss = session.best_loss, "Training end");
        }
        Ok(())
    }
}
