//! Online predictive control
//!
//! The loop reads the robot posture, asks the engine for the next target,
//! keeps a sliding window of observations and runs postdiction once the window
//! is full. Posture input and target output are abstracted so the loop can be
//! driven by a robot driver, a recording or a test harness.

mod io;
mod r#loop;
mod window;


pub use io::{ChannelActuator, NullActuator, StaticPosture, TrajectoryPosture};
pub use r#loop::{
    sleep_budget, ControlLoop, ControlLoopBuilder, CycleRecord, LoopConfig, LoopPhase, LoopReport,
    LoopStatus,
};
pub use window::SlidingWindow;

use crate::error::Result;
use crate::models::JointState;

pub use async_trait::async_trait;

/// Source of observed robot postures
#[async_trait]
pub trait PostureSource: Send {
    /// Read the current posture; implementations must return `n_dof` values
    async fn read(&mut self, n_dof: usize) -> Result<JointState>;
}

/// Sink for target postures.
///
/// Dispatch must not block the loop; slow consumers drop targets instead.
pub trait Actuator: Send {
    fn dispatch(&mut self, target: &JointState);
}
