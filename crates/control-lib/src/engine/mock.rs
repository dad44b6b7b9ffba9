//! Call-counting engine used by unit tests

use super::InferenceEngine;
use crate::error::EngineError;
use crate::models::{Elbo, EstimatorConfig, RawDims, TrainingReport};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct CallLog {
    load: AtomicUsize,
    enable: AtomicUsize,
    postdict: AtomicUsize,
    generate: AtomicUsize,
    get_state: AtomicUsize,
    fail_postdict: AtomicBool,
    postdict_delay_ms: AtomicU64,
}

impl CallLog {
    pub fn load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    pub fn enable(&self) -> usize {
        self.enable.load(Ordering::SeqCst)
    }

    pub fn postdict(&self) -> usize {
        self.postdict.load(Ordering::SeqCst)
    }

    pub fn generate(&self) -> usize {
        self.generate.load(Ordering::SeqCst)
    }

    pub fn get_state(&self) -> usize {
        self.get_state.load(Ordering::SeqCst)
    }

    /// Total calls of any kind other than `load`
    pub fn after_load(&self) -> usize {
        self.enable() + self.postdict() + self.generate() + self.get_state()
    }

    pub fn fail_postdict(&self, fail: bool) {
        self.fail_postdict.store(fail, Ordering::SeqCst);
    }

    pub fn set_postdict_delay(&self, delay: Duration) {
        self.postdict_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

pub struct MockEngine {
    dims: RawDims,
    calls: Arc<CallLog>,
    last_window_sum: f32,
}

impl MockEngine {
    pub fn new(dims: RawDims) -> Self {
        Self {
            dims,
            calls: Arc::new(CallLog::default()),
            last_window_sum: 0.0,
        }
    }

    pub fn calls(&self) -> Arc<CallLog> {
        self.calls.clone()
    }
}

impl InferenceEngine for MockEngine {
    fn load(&mut self) -> Result<RawDims, EngineError> {
        self.calls.load.fetch_add(1, Ordering::SeqCst);
        Ok(self.dims)
    }

    fn enable(&mut self, _config: &EstimatorConfig) -> Result<(), EngineError> {
        self.calls.enable.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn postdict(&mut self, window: &[f32]) -> Result<Elbo, EngineError> {
        self.calls.postdict.fetch_add(1, Ordering::SeqCst);
        let delay = self.calls.postdict_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.calls.fail_postdict.load(Ordering::SeqCst) {
            return Err(EngineError::Model("postdiction diverged".into()));
        }
        self.last_window_sum = window.iter().sum();
        Ok(Elbo {
            loss: self.last_window_sum,
            reconstruction: self.last_window_sum,
            regulation: 0.0,
        })
    }

    fn generate(&mut self, target: &mut [f32]) -> Result<(), EngineError> {
        self.calls.generate.fetch_add(1, Ordering::SeqCst);
        target.fill(1.0);
        Ok(())
    }

    fn get_state(&mut self, state: &mut [f32]) -> Result<(), EngineError> {
        self.calls.get_state.fetch_add(1, Ordering::SeqCst);
        state.fill(self.last_window_sum);
        Ok(())
    }

    fn save(&mut self, _path: &Path) -> Result<(), EngineError> {
        Ok(())
    }

    fn predict(&mut self, _path: &Path, _steps: usize, _init: &[f32]) -> Result<(), EngineError> {
        Ok(())
    }

    fn feed_forward_output_from_context(
        &self,
        context: &[f32],
        output: &mut [f32],
    ) -> Result<(), EngineError> {
        output.fill(context.iter().sum());
        Ok(())
    }

    fn train_background(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn train_init(&mut self, _log_stdout: bool) -> Result<(), EngineError> {
        Ok(())
    }

    fn train_loop(&mut self, epochs: usize) -> Result<TrainingReport, EngineError> {
        Ok(TrainingReport {
            step: epochs as u64,
            ..Default::default()
        })
    }

    fn train_end(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}
