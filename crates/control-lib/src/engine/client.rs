//! Size-checked client over an inference engine

use super::InferenceEngine;
use crate::error::{ControlError, Result};
use crate::models::{Elbo, EstimatorConfig, JointState, ModelShape, TrainingReport};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Owns one engine instance and guards every call crossing into it.
///
/// The client tracks what the engine has been told (model shape, enabled
/// estimator, whether a postdiction happened) so that out-of-order calls and
/// mis-sized buffers fail here instead of inside the engine.
pub struct EngineClient {
    engine: Box<dyn InferenceEngine>,
    shape: Option<ModelShape>,
    estimator: Option<EstimatorConfig>,
    postdictions: u64,
}

impl EngineClient {
    pub fn new(engine: Box<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            shape: None,
            estimator: None,
            postdictions: 0,
        }
    }

    /// Load the model. `ModelUnavailable` when the engine reports no model.
    pub fn load(&mut self) -> Result<ModelShape> {
        self.shape = None;
        self.estimator = None;
        self.postdictions = 0;

        let raw = self.engine.load()?;
        let shape = ModelShape::try_from(raw)?;

        info!(
            n_dof = shape.n_dof,
            state_dim = shape.state_dim,
            n_layers = shape.n_layers,
            "Model loaded"
        );
        self.shape = Some(shape);
        Ok(shape)
    }

    pub fn shape(&self) -> Option<ModelShape> {
        self.shape
    }

    pub fn estimator(&self) -> Option<&EstimatorConfig> {
        self.estimator.as_ref()
    }

    /// Number of successful postdictions since the last load
    pub fn postdiction_count(&self) -> u64 {
        self.postdictions
    }

    fn loaded_shape(&self) -> Result<ModelShape> {
        self.shape.ok_or(ControlError::NotLoaded)
    }

    /// Configure the estimation primitive; the last call wins and resets the belief
    pub fn enable(&mut self, config: EstimatorConfig) -> Result<()> {
        let shape = self.loaded_shape()?;
        config.validate()?;
        if config.weights.len() != shape.n_layers {
            return Err(ControlError::size_mismatch(
                "layer weights",
                shape.n_layers,
                config.weights.len(),
            ));
        }

        self.engine.enable(&config)?;
        // the engine starts a fresh belief for the new primitive
        self.postdictions = 0;
        debug!(
            primitive_id = config.primitive_id,
            win_size = config.win_size,
            epochs = config.epochs,
            "Estimator enabled"
        );
        self.estimator = Some(config);
        Ok(())
    }

    /// Run postdiction over a flattened window of `win_size * n_dof` values
    pub fn postdict(&mut self, window: &[f32]) -> Result<Elbo> {
        let shape = self.loaded_shape()?;
        let win_size = self
            .estimator
            .as_ref()
            .map(|e| e.win_size)
            .ok_or(ControlError::NotEnabled)?;

        let expected = win_size * shape.n_dof;
        if window.len() != expected {
            return Err(ControlError::size_mismatch(
                "postdiction window",
                expected,
                window.len(),
            ));
        }

        let start = Instant::now();
        let elbo = self.engine.postdict(window)?;
        self.postdictions += 1;
        debug!(
            elapsed_us = start.elapsed().as_micros() as u64,
            loss = elbo.loss,
            "Postdiction completed"
        );
        Ok(elbo)
    }

    /// Next target posture from the current belief
    pub fn generate(&mut self) -> Result<JointState> {
        let shape = self.loaded_shape()?;
        let mut target = vec![0.0; shape.n_dof];
        self.engine.generate(&mut target)?;
        Ok(JointState::new(target))
    }

    /// Copy of the latent state; only valid after a postdiction
    pub fn get_state(&mut self) -> Result<Vec<f32>> {
        let shape = self.loaded_shape()?;
        if self.postdictions == 0 {
            return Err(ControlError::StateUnavailable);
        }
        let mut state = vec![0.0; shape.state_dim];
        self.engine.get_state(&mut state)?;
        Ok(state)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.loaded_shape()?;
        self.engine.save(path)?;
        info!(path = %path.display(), "Experiment data saved");
        Ok(())
    }

    /// Offline generation of `steps` outputs starting from `init_state`
    pub fn predict(&mut self, path: &Path, steps: usize, init_state: &[f32]) -> Result<()> {
        let shape = self.loaded_shape()?;
        if init_state.len() != shape.state_dim {
            return Err(ControlError::size_mismatch(
                "initial state",
                shape.state_dim,
                init_state.len(),
            ));
        }
        self.engine.predict(path, steps, init_state)?;
        Ok(())
    }

    /// Output posture for a latent context, leaving engine state untouched
    pub fn feed_forward_output_from_context(&self, context: &[f32]) -> Result<JointState> {
        let shape = self.loaded_shape()?;
        if context.len() != shape.state_dim {
            return Err(ControlError::size_mismatch(
                "context",
                shape.state_dim,
                context.len(),
            ));
        }
        let mut output = vec![0.0; shape.n_dof];
        self.engine
            .feed_forward_output_from_context(context, &mut output)?;
        Ok(JointState::new(output))
    }

    /// Train using the engine's own parameters. The loaded shape is dropped
    /// since weights change underneath it; call `load` again afterwards.
    pub fn train_background(&mut self) -> Result<()> {
        self.invalidate();
        self.engine.train_background()?;
        Ok(())
    }

    pub fn train_init(&mut self, log_stdout: bool) -> Result<()> {
        self.invalidate();
        self.engine.train_init(log_stdout)?;
        Ok(())
    }

    pub fn train_loop(&mut self, epochs: usize) -> Result<TrainingReport> {
        if epochs == 0 {
            return Err(ControlError::InvalidConfig(
                "training rounds need at least one epoch".into(),
            ));
        }
        Ok(self.engine.train_loop(epochs)?)
    }

    pub fn train_end(&mut self) -> Result<()> {
        self.engine.train_end()?;
        Ok(())
    }

    fn invalidate(&mut self) {
        if self.shape.is_some() {
            warn!("Training invalidates the loaded model; reload before running the loop");
        }
        self.shape = None;
        self.estimator = None;
        self.postdictions = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{CallLog, MockEngine};
    use crate::models::RawDims;
    use std::sync::Arc;

    fn loaded_client(n_dof: i32, n_layers: i32) -> (EngineClient, Arc<CallLog>) {
        let engine = MockEngine::new(RawDims {
            n_dof,
            state_dim: n_dof * n_layers,
            n_layers,
        });
        let calls = engine.calls();
        let mut client = EngineClient::new(Box::new(engine));
        client.load().unwrap();
        (client, calls)
    }

    #[test]
    fn test_load_unavailable_model() {
        let engine = MockEngine::new(RawDims {
            n_dof: 0,
            state_dim: 0,
            n_layers: 0,
        });
        let mut client = EngineClient::new(Box::new(engine));
        assert!(matches!(
            client.load(),
            Err(ControlError::ModelUnavailable { n_dof: 0 })
        ));
        assert!(client.shape().is_none());
        assert!(client.generate().is_err());
    }

    #[test]
    fn test_enable_rejects_weight_count_mismatch() {
        let (mut client, calls) = loaded_client(4, 2);
        let config = EstimatorConfig {
            weights: vec![0.1, 0.1, 0.1],
            ..Default::default()
        };
        let err = client.enable(config).unwrap_err();
        assert!(matches!(
            err,
            ControlError::SizeMismatch {
                expected: 2,
                actual: 3,
                ..
            }
        ));
        assert_eq!(calls.enable(), 0);
    }

    #[test]
    fn test_postdict_requires_enable() {
        let (mut client, calls) = loaded_client(4, 2);
        assert!(matches!(
            client.postdict(&[0.0; 60]),
            Err(ControlError::NotEnabled)
        ));
        assert_eq!(calls.postdict(), 0);
    }

    #[test]
    fn test_postdict_rejects_wrong_window_before_engine() {
        let (mut client, calls) = loaded_client(4, 2);
        client.enable(EstimatorConfig::default()).unwrap();

        let err = client.postdict(&[0.0; 59]).unwrap_err();
        assert!(matches!(
            err,
            ControlError::SizeMismatch {
                expected: 60,
                actual: 59,
                ..
            }
        ));
        assert_eq!(calls.postdict(), 0);

        client.postdict(&[0.0; 60]).unwrap();
        assert_eq!(calls.postdict(), 1);
        assert_eq!(client.postdiction_count(), 1);
    }

    #[test]
    fn test_get_state_only_after_postdiction() {
        let (mut client, _calls) = loaded_client(4, 2);
        client.enable(EstimatorConfig::default()).unwrap();
        assert!(matches!(
            client.get_state(),
            Err(ControlError::StateUnavailable)
        ));

        client.postdict(&[0.0; 60]).unwrap();
        let state = client.get_state().unwrap();
        assert_eq!(state.len(), 8);
    }

    #[test]
    fn test_generate_sizes_target_to_dof() {
        let (mut client, calls) = loaded_client(16, 2);
        let target = client.generate().unwrap();
        assert_eq!(target.len(), 16);
        assert_eq!(calls.generate(), 1);
    }

    #[test]
    fn test_offline_calls_check_state_dim() {
        let (mut client, _calls) = loaded_client(3, 2);
        let dir = std::env::temp_dir();
        assert!(client.predict(&dir, 5, &[0.0; 5]).is_err());
        assert!(client.predict(&dir, 5, &[0.0; 6]).is_ok());

        assert!(client.feed_forward_output_from_context(&[0.0; 2]).is_err());
        let out = client.feed_forward_output_from_context(&[0.0; 6]).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_engine_failure_is_not_retried() {
        let (mut client, calls) = loaded_client(2, 2);
        client
            .enable(EstimatorConfig {
                win_size: 1,
                ..Default::default()
            })
            .unwrap();
        calls.fail_postdict(true);

        let err = client.postdict(&[0.0; 2]).unwrap_err();
        assert!(matches!(err, ControlError::EngineFailure(_)));
        assert_eq!(calls.postdict(), 1);
        assert_eq!(client.postdiction_count(), 0);
    }

    #[test]
    fn test_training_invalidates_shape() {
        let (mut client, _calls) = loaded_client(2, 2);
        client.train_background().unwrap();
        assert!(client.shape().is_none());
        assert!(client.train_loop(0).is_err());
    }

    #[test]
    fn test_calls_before_load_report_not_loaded() {
        let engine = MockEngine::new(RawDims {
            n_dof: 2,
            state_dim: 4,
            n_layers: 2,
        });
        let calls = engine.calls();
        let mut client = EngineClient::new(Box::new(engine));

        assert!(matches!(client.generate(), Err(ControlError::NotLoaded)));
        assert!(matches!(
            client.enable(EstimatorConfig::default()),
            Err(ControlError::NotLoaded)
        ));
        assert_eq!(calls.generate(), 0);
        assert_eq!(calls.enable(), 0);
    }

    #[test]
    fn test_reenable_invalidates_latent_state() {
        let (mut client, _calls) = loaded_client(2, 2);
        let config = EstimatorConfig {
            win_size: 1,
            ..Default::default()
        };
        client.enable(config.clone()).unwrap();
        client.postdict(&[0.0; 2]).unwrap();
        assert!(client.get_state().is_ok());

        client.enable(config).unwrap();
        assert_eq!(client.postdiction_count(), 0);
        assert!(matches!(
            client.get_state(),
            Err(ControlError::StateUnavailable)
        ));
    }
}
