//! Posture sources and actuators

use super::{Actuator, PostureSource};
use crate::error::{ControlError, Result};
use crate::models::JointState;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Always reports the same posture; zeros unless one is given
#[derive(Debug, Clone, Default)]
pub struct StaticPosture {
    posture: Option<JointState>,
}

impl StaticPosture {
    pub fn zeros() -> Self {
        Self { posture: None }
    }

    pub fn new(posture: JointState) -> Self {
        Self {
            posture: Some(posture),
        }
    }
}

#[async_trait]
impl PostureSource for StaticPosture {
    async fn read(&mut self, n_dof: usize) -> Result<JointState> {
        match &self.posture {
            Some(posture) => JointState::with_dof(posture.as_slice().to_vec(), n_dof),
            None => Ok(JointState::zeros(n_dof)),
        }
    }
}

/// Replays recorded postures in order, starting over at the end
#[derive(Debug, Clone)]
pub struct TrajectoryPosture {
    samples: Vec<JointState>,
    next: usize,
}

impl TrajectoryPosture {
    pub fn new(samples: Vec<JointState>) -> Result<Self> {
        if samples.is_empty() {
            return Err(ControlError::InvalidConfig(
                "a posture trajectory needs at least one sample".into(),
            ));
        }
        Ok(Self { samples, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[async_trait]
impl PostureSource for TrajectoryPosture {
    async fn read(&mut self, n_dof: usize) -> Result<JointState> {
        let sample = &self.samples[self.next];
        self.next = (self.next + 1) % self.samples.len();
        JointState::with_dof(sample.as_slice().to_vec(), n_dof)
    }
}

/// Forwards targets to a driver task over a bounded channel
pub struct ChannelActuator {
    tx: mpsc::Sender<JointState>,
    dropped: u64,
}

impl ChannelActuator {
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<JointState>) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        (Self { tx, dropped: 0 }, rx)
    }

    /// Targets dropped because the driver lagged or went away
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Actuator for ChannelActuator {
    fn dispatch(&mut self, target: &JointState) {
        match self.tx.try_send(target.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                warn!(dropped = self.dropped, "Actuator channel full, dropping target");
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped += 1;
                debug!("Actuator receiver closed");
            }
        }
    }
}

/// Discards every target
#[derive(Debug, Clone, Copy, Default)]
pub struct NullActuator;

impl Actuator for NullActuator {
    fn dispatch(&mut self, _target: &JointState) {}
}
