//! Core data models for the control loop

use crate::error::{ControlError, Result};
use serde::{Deserialize, Serialize};

/// One robot posture sample, one value per degree of freedom
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointState(Vec<f32>);

impl JointState {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn zeros(n_dof: usize) -> Self {
        Self(vec![0.0; n_dof])
    }

    /// Wrap `values`, rejecting anything that is not exactly `n_dof` long
    pub fn with_dof(values: Vec<f32>, n_dof: usize) -> Result<Self> {
        if values.len() != n_dof {
            return Err(ControlError::size_mismatch("joint state", n_dof, values.len()));
        }
        Ok(Self(values))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

impl From<Vec<f32>> for JointState {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Dimensions reported by an engine, signed as on the native boundary.
/// `n_dof <= 0` means the engine has no usable model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDims {
    pub n_dof: i32,
    pub state_dim: i32,
    pub n_layers: i32,
}

impl RawDims {
    pub const UNAVAILABLE: RawDims = RawDims {
        n_dof: -1,
        state_dim: -1,
        n_layers: -1,
    };
}

/// Validated dimensions of a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub n_dof: usize,
    pub state_dim: usize,
    pub n_layers: usize,
}

impl TryFrom<RawDims> for ModelShape {
    type Error = ControlError;

    fn try_from(raw: RawDims) -> Result<Self> {
        if raw.n_dof <= 0 {
            return Err(ControlError::ModelUnavailable { n_dof: raw.n_dof });
        }
        if raw.state_dim <= 0 || raw.n_layers <= 0 {
            return Err(ControlError::InvalidConfig(format!(
                "engine reported state_dim = {}, n_layers = {}",
                raw.state_dim, raw.n_layers
            )));
        }
        Ok(Self {
            n_dof: raw.n_dof as usize,
            state_dim: raw.state_dim as usize,
            n_layers: raw.n_layers as usize,
        })
    }
}

/// Configuration of one estimation primitive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Primitive id selecting the estimation unit inside the engine
    pub primitive_id: u32,
    /// Sliding window size in samples
    pub win_size: usize,
    /// Per-layer regulation weights, one per engine layer
    pub weights: Vec<f32>,
    /// Expected number of postdiction steps in the experiment
    pub exp_time: usize,
    /// Inner optimization epochs per postdiction
    pub epochs: usize,
    /// Adam learning rate
    pub alpha: f32,
    /// Adam first-moment decay
    pub beta1: f32,
    /// Adam second-moment decay
    pub beta2: f32,
    /// Retain latent states inside the engine
    pub store_states: bool,
    /// Retain ELBO traces inside the engine
    pub store_er: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            primitive_id: 0,
            win_size: 15,
            weights: vec![0.025, 0.025],
            exp_time: 15,
            epochs: 15,
            alpha: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            store_states: false,
            store_er: false,
        }
    }
}

impl EstimatorConfig {
    /// Check parameter ranges that do not depend on the loaded model
    pub fn validate(&self) -> Result<()> {
        if self.win_size == 0 {
            return Err(ControlError::InvalidConfig("win_size must be at least 1".into()));
        }
        if self.exp_time == 0 {
            return Err(ControlError::InvalidConfig("exp_time must be at least 1".into()));
        }
        if self.epochs == 0 {
            return Err(ControlError::InvalidConfig("epochs must be at least 1".into()));
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(ControlError::InvalidConfig(format!(
                "alpha must be positive, got {}",
                self.alpha
            )));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(ControlError::InvalidConfig(format!(
                    "{name} must lie in [0, 1), got {beta}"
                )));
            }
        }
        if self.weights.iter().any(|w| !w.is_finite()) {
            return Err(ControlError::InvalidConfig("weights must be finite".into()));
        }
        Ok(())
    }
}

/// Free-energy summary returned by one postdiction
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Elbo {
    pub loss: f32,
    pub reconstruction: f32,
    pub regulation: f32,
}

impl Elbo {
    /// Slice order used on the engine boundary
    pub fn to_array(self) -> [f32; 3] {
        [self.loss, self.reconstruction, self.regulation]
    }

    pub fn from_array(values: [f32; 3]) -> Self {
        Self {
            loss: values[0],
            reconstruction: values[1],
            regulation: values[2],
        }
    }
}

/// Progress record of one interactive training round
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub step: u64,
    pub elapsed_ms: f32,
    /// Reconstruction error from the posterior
    pub reconstruction_posterior: f32,
    /// Reconstruction error when generating from the prior
    pub reconstruction_prior: f32,
    pub regulation: f32,
    pub loss: f32,
    /// Whether the model was persisted this round
    pub saved: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joint_state_with_dof() {
        assert!(JointState::with_dof(vec![0.0; 3], 3).is_ok());
        let err = JointState::with_dof(vec![0.0; 2], 3).unwrap_err();
        assert!(matches!(
            err,
            ControlError::SizeMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_model_shape_rejects_missing_model() {
        let raw = RawDims {
            n_dof: 0,
            state_dim: 4,
            n_layers: 2,
        };
        assert!(matches!(
            ModelShape::try_from(raw),
            Err(ControlError::ModelUnavailable { n_dof: 0 })
        ));
        assert!(ModelShape::try_from(RawDims::UNAVAILABLE).is_err());
    }

    #[test]
    fn test_model_shape_from_valid_dims() {
        let shape = ModelShape::try_from(RawDims {
            n_dof: 16,
            state_dim: 32,
            n_layers: 2,
        })
        .unwrap();
        assert_eq!(shape.n_dof, 16);
        assert_eq!(shape.state_dim, 32);
        assert_eq!(shape.n_layers, 2);
    }

    #[test]
    fn test_estimator_config_default_is_valid() {
        assert!(EstimatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_estimator_config_rejects_bad_ranges() {
        let mut config = EstimatorConfig {
            exp_time: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.exp_time = 5;
        config.beta2 = 1.0;
        assert!(config.validate().is_err());

        config.beta2 = 0.999;
        config.alpha = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_elbo_array_order() {
        let elbo = Elbo {
            loss: 3.0,
            reconstruction: 2.0,
            regulation: 1.0,
        };
        assert_eq!(elbo.to_array(), [3.0, 2.0, 1.0]);
        assert_eq!(Elbo::from_array([3.0, 2.0, 1.0]), elbo);
    }
}
