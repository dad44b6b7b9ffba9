//! Sliding window over observed joint states
//!
//! Fixed-capacity FIFO of the most recent postures. The flattened view fed to
//! the engine is built on demand since the window changes every tick.

use crate::error::{ControlError, Result};
use crate::models::JointState;
use std::collections::VecDeque;

/// Fixed-capacity FIFO of joint states, oldest first
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<JointState>,
    capacity: usize,
    n_dof: usize,
}

impl SlidingWindow {
    /// Create an empty window holding up to `capacity` samples of `n_dof` values
    pub fn new(capacity: usize, n_dof: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ControlError::InvalidConfig(
                "sliding window capacity must be at least 1".into(),
            ));
        }
        if n_dof == 0 {
            return Err(ControlError::InvalidConfig(
                "sliding window n_dof must be at least 1".into(),
            ));
        }
        Ok(Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            n_dof,
        })
    }

    /// Append a sample, evicting the oldest one once at capacity
    pub fn push(&mut self, sample: JointState) -> Result<()> {
        if sample.len() != self.n_dof {
            return Err(ControlError::size_mismatch(
                "window sample",
                self.n_dof,
                sample.len(),
            ));
        }

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn n_dof(&self) -> usize {
        self.n_dof
    }

    /// Contiguous `capacity * n_dof` values, time-major. Fails unless full.
    pub fn flatten(&self) -> Result<Vec<f32>> {
        if !self.is_full() {
            return Err(ControlError::WindowNotFull {
                len: self.samples.len(),
                capacity: self.capacity,
            });
        }

        let mut flat = Vec::with_capacity(self.capacity * self.n_dof);
        for sample in &self.samples {
            flat.extend_from_slice(sample.as_slice());
        }
        Ok(flat)
    }

    /// Drop every sample. Only called explicitly; the loop never resets on its own.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f32, n_dof: usize) -> JointState {
        JointState::new(vec![value; n_dof])
    }

    #[test]
    fn test_len_is_min_of_pushes_and_capacity() {
        let capacity = 4;
        let mut window = SlidingWindow::new(capacity, 2).unwrap();

        for k in 1..=10 {
            window.push(sample(k as f32, 2)).unwrap();
            assert_eq!(window.len(), k.min(capacity));
            assert_eq!(window.is_full(), k >= capacity);
        }
    }

    #[test]
    fn test_fifo_eviction_order() {
        let capacity = 3;
        let mut window = SlidingWindow::new(capacity, 2).unwrap();

        for k in 1..=(capacity + 1) {
            window
                .push(JointState::new(vec![k as f32, k as f32 * 10.0]))
                .unwrap();
        }

        let flat = window.flatten().unwrap();
        assert_eq!(flat, vec![2.0, 20.0, 3.0, 30.0, 4.0, 40.0]);
    }

    #[test]
    fn test_flatten_requires_full_window() {
        let mut window = SlidingWindow::new(3, 2).unwrap();
        assert!(matches!(
            window.flatten(),
            Err(ControlError::WindowNotFull { len: 0, capacity: 3 })
        ));

        window.push(sample(1.0, 2)).unwrap();
        window.push(sample(2.0, 2)).unwrap();
        assert!(matches!(
            window.flatten(),
            Err(ControlError::WindowNotFull { len: 2, capacity: 3 })
        ));

        window.push(sample(3.0, 2)).unwrap();
        assert_eq!(window.flatten().unwrap().len(), 6);
    }

    #[test]
    fn test_capacity_one_is_full_after_every_push() {
        let mut window = SlidingWindow::new(1, 3).unwrap();
        for k in 0..5 {
            window.push(sample(k as f32, 3)).unwrap();
            assert!(window.is_full());
            assert_eq!(window.flatten().unwrap(), vec![k as f32; 3]);
        }
    }

    #[test]
    fn test_push_rejects_wrong_dimension() {
        let mut window = SlidingWindow::new(2, 3).unwrap();
        let err = window.push(sample(0.0, 4)).unwrap_err();
        assert!(matches!(
            err,
            ControlError::SizeMismatch {
                expected: 3,
                actual: 4,
                ..
            }
        ));
        assert!(window.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(SlidingWindow::new(0, 3).is_err());
        assert!(SlidingWindow::new(3, 0).is_err());
    }

    #[test]
    fn test_clear_restarts_warmup() {
        let mut window = SlidingWindow::new(2, 1).unwrap();
        window.push(sample(1.0, 1)).unwrap();
        window.push(sample(2.0, 1)).unwrap();
        assert!(window.is_full());

        window.clear();
        assert!(!window.is_full());
        assert_eq!(window.len(), 0);
    }
}
