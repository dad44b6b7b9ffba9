//! Error types for the control loop and the engine boundary

use thiserror::Error;

/// Failures raised inside an inference engine implementation
#[derive(Debug, Error)]
pub enum EngineError {
    /// No model has been created (descriptor missing or invalid)
    #[error("the model was not created yet")]
    NotCreated,

    /// The model exists but has not been loaded
    #[error("the model should be loaded before calling '{0}'")]
    NotLoaded(&'static str),

    /// The model itself rejected the request
    #[error("model error: {0}")]
    Model(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the engine client and the control loop
#[derive(Debug, Error)]
pub enum ControlError {
    /// The engine reported no usable model after `load`
    #[error(
        "no valid model available (n_dof = {n_dof}); the model path may be incorrect, \
         or perhaps it requires to be trained"
    )]
    ModelUnavailable { n_dof: i32 },

    /// A buffer handed to the engine does not match the model dimensions
    #[error("size mismatch for {buffer}: expected {expected} values, got {actual}")]
    SizeMismatch {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The engine call itself failed
    #[error("engine failure: {0}")]
    EngineFailure(#[from] EngineError),

    /// `flatten` was called before the window reached capacity
    #[error("sliding window not full: {len} of {capacity} samples")]
    WindowNotFull { len: usize, capacity: usize },

    /// An engine call was made before a successful `load`
    #[error("model not loaded; call load() first")]
    NotLoaded,

    /// Postdiction was requested before an estimator was enabled
    #[error("estimator not enabled; call enable() first")]
    NotEnabled,

    /// Latent state was requested before any postdiction
    #[error("latent state unavailable until at least one postdiction has run")]
    StateUnavailable,

    /// An estimator or loop parameter is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ControlError {
    pub(crate) fn size_mismatch(buffer: &'static str, expected: usize, actual: usize) -> Self {
        ControlError::SizeMismatch {
            buffer,
            expected,
            actual,
        }
    }
}

pub type Result<T, E = ControlError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_unavailable_message_hints_training() {
        let err = ControlError::ModelUnavailable { n_dof: -1 };
        let msg = err.to_string();
        assert!(msg.contains("trained"));
        assert!(msg.contains("-1"));
    }

    #[test]
    fn test_engine_error_converts() {
        let err: ControlError = EngineError::NotLoaded("e_generate").into();
        assert!(matches!(err, ControlError::EngineFailure(_)));
        assert!(err.to_string().contains("e_generate"));
    }
}
