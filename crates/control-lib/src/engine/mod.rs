//! Inference engine capability
//!
//! The engine that performs postdiction and generation is treated as an
//! opaque collaborator. [`InferenceEngine`] is the narrow surface the control
//! loop needs from it; [`EngineClient`] wraps any implementation and enforces
//! buffer sizes and call ordering before anything reaches the engine.

mod adam;
mod client;
mod reference;
mod training;

#[cfg(test)]
pub(crate) mod mock;

pub use client::EngineClient;
pub use reference::{ModelDescriptor, ReferenceEngine, TrainedWeights};
pub use training::{TrainingHandle, TrainingInvoker};

use crate::error::EngineError;
use crate::models::{Elbo, EstimatorConfig, RawDims, TrainingReport};
use std::path::Path;

/// Operations a conforming engine provides.
///
/// Buffers are caller-owned slices sized by the client; implementations may
/// assume lengths already match the dimensions they reported from `load`.
pub trait InferenceEngine: Send {
    /// Materialize a trained model and report its dimensions
    fn load(&mut self) -> Result<RawDims, EngineError>;

    /// (Re)configure an estimation primitive
    fn enable(&mut self, config: &EstimatorConfig) -> Result<(), EngineError>;

    /// Refine the latent belief against a flattened observation window
    fn postdict(&mut self, window: &[f32]) -> Result<Elbo, EngineError>;

    /// Write the next target posture into `target`
    fn generate(&mut self, target: &mut [f32]) -> Result<(), EngineError>;

    /// Copy the current latent state into `state`
    fn get_state(&mut self, state: &mut [f32]) -> Result<(), EngineError>;

    /// Persist experiment data
    fn save(&mut self, path: &Path) -> Result<(), EngineError>;

    /// Offline `steps`-step generation from `init_state`, written under `path`
    fn predict(&mut self, path: &Path, steps: usize, init_state: &[f32])
        -> Result<(), EngineError>;

    /// Output layer for a given latent context, without touching engine state
    fn feed_forward_output_from_context(
        &self,
        context: &[f32],
        output: &mut [f32],
    ) -> Result<(), EngineError>;

    /// Train with parameters taken from the model descriptor, until done
    fn train_background(&mut self) -> Result<(), EngineError>;

    /// Start an interactive training session
    fn train_init(&mut self, log_stdout: bool) -> Result<(), EngineError>;

    /// Run `epochs` training epochs and report progress
    fn train_loop(&mut self, epochs: usize) -> Result<TrainingReport, EngineError>;

    /// Close an interactive training session
    fn train_end(&mut self) -> Result<(), EngineError>;
}
