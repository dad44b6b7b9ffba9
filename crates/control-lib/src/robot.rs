//! Robot joint descriptions
//!
//! Joint limits (in degrees for articulated robots, arbitrary units for
//! cartesian/generic ones) and active-joint masks. The active joints define
//! the model's degrees of freedom and the joint space normalization used by
//! the reference engine.

use crate::error::{ControlError, Result};
use serde::{Deserialize, Serialize};

const TOROBO_LOW: [f32; 16] = [
    -65.0, -40.0, -155.0, -45.0, -155.0, -100.0, -65.0, -40.0, -155.0, -45.0, -155.0, -100.0,
    -75.0, -20.0, -85.0, -40.0,
];
const TOROBO_HIGH: [f32; 16] = [
    245.0, 100.0, 155.0, 110.0, 155.0, 100.0, 245.0, 100.0, 155.0, 110.0, 155.0, 100.0, 75.0,
    50.0, 85.0, 40.0,
];

const CARTESIAN_LIMIT: f32 = 50.0;
const GENERIC_LIMIT: f32 = 1.0;

/// Supported robot families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotKind {
    /// 16-joint humanoid upper body
    Torobo,
    /// 3-axis cartesian end effector
    Cartesian,
    /// Any number of joints with unit limits
    Generic,
}

impl RobotKind {
    /// Number of joints before masking, `None` when the mask decides
    pub fn full_dof(&self) -> Option<usize> {
        match self {
            RobotKind::Torobo => Some(TOROBO_LOW.len()),
            RobotKind::Cartesian => Some(3),
            RobotKind::Generic => None,
        }
    }

    fn limits(&self, joint: usize) -> (f32, f32) {
        match self {
            RobotKind::Torobo => (TOROBO_LOW[joint], TOROBO_HIGH[joint]),
            RobotKind::Cartesian => (-CARTESIAN_LIMIT, CARTESIAN_LIMIT),
            RobotKind::Generic => (-GENERIC_LIMIT, GENERIC_LIMIT),
        }
    }
}

/// A robot restricted to its active joints
#[derive(Debug, Clone, PartialEq)]
pub struct RobotModel {
    kind: RobotKind,
    low: Vec<f32>,
    high: Vec<f32>,
}

impl RobotModel {
    /// Build from a full-length activity mask
    pub fn new(kind: RobotKind, active_joints: &[bool]) -> Result<Self> {
        if let Some(full) = kind.full_dof() {
            if active_joints.len() != full {
                return Err(ControlError::InvalidConfig(format!(
                    "the activity of {} joints must be specified for a {:?} robot, got {}",
                    full,
                    kind,
                    active_joints.len()
                )));
            }
        }

        let (low, high): (Vec<f32>, Vec<f32>) = active_joints
            .iter()
            .enumerate()
            .filter(|(_, active)| **active)
            .map(|(joint, _)| kind.limits(joint))
            .unzip();

        if low.is_empty() {
            return Err(ControlError::InvalidConfig(
                "at least one joint must be active".into(),
            ));
        }

        Ok(Self { kind, low, high })
    }

    pub fn kind(&self) -> RobotKind {
        self.kind
    }

    /// Number of active joints
    pub fn n_dof(&self) -> usize {
        self.low.len()
    }

    pub fn low_limits(&self) -> &[f32] {
        &self.low
    }

    pub fn high_limits(&self) -> &[f32] {
        &self.high
    }

    pub fn ranges(&self) -> Vec<f32> {
        self.low
            .iter()
            .zip(&self.high)
            .map(|(lo, hi)| hi - lo)
            .collect()
    }

    /// Map joint values into [0, 1] per joint (in place)
    pub fn normalize(&self, values: &mut [f32]) {
        for (i, v) in values.iter_mut().enumerate() {
            let j = i % self.low.len();
            *v = (*v - self.low[j]) / (self.high[j] - self.low[j]);
        }
    }

    /// Inverse of [`normalize`](Self::normalize)
    pub fn denormalize(&self, values: &mut [f32]) {
        for (i, v) in values.iter_mut().enumerate() {
            let j = i % self.low.len();
            *v = self.low[j] + *v * (self.high[j] - self.low[j]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torobo_requires_sixteen_joint_mask() {
        assert!(RobotModel::new(RobotKind::Torobo, &[true; 15]).is_err());
        let robot = RobotModel::new(RobotKind::Torobo, &[true; 16]).unwrap();
        assert_eq!(robot.n_dof(), 16);
        assert_eq!(robot.ranges()[0], 310.0);
    }

    #[test]
    fn test_mask_selects_active_limits() {
        let mut mask = [false; 16];
        mask[2] = true;
        mask[15] = true;
        let robot = RobotModel::new(RobotKind::Torobo, &mask).unwrap();
        assert_eq!(robot.n_dof(), 2);
        assert_eq!(robot.low_limits(), &[-155.0, -40.0]);
        assert_eq!(robot.high_limits(), &[155.0, 40.0]);
    }

    #[test]
    fn test_generic_accepts_any_length() {
        let robot = RobotModel::new(RobotKind::Generic, &[true; 5]).unwrap();
        assert_eq!(robot.n_dof(), 5);
        assert!(RobotModel::new(RobotKind::Generic, &[false; 5]).is_err());
    }

    #[test]
    fn test_normalize_round_trip_over_window() {
        let robot = RobotModel::new(RobotKind::Cartesian, &[true; 3]).unwrap();
        // two samples back to back
        let original = vec![-50.0, 0.0, 50.0, 25.0, -25.0, 10.0];
        let mut values = original.clone();

        robot.normalize(&mut values);
        assert_eq!(&values[..3], &[0.0, 0.5, 1.0]);

        robot.denormalize(&mut values);
        for (a, b) in values.iter().zip(&original) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}
