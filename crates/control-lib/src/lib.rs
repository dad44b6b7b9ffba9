//! Predictive control library for neural robot controllers
//!
//! This crate provides:
//! - A sliding-window control loop driving an inference engine
//! - A size-checked client over the engine capability
//! - A reference engine with training support
//! - Robot joint models and posture I/O seams
//! - Health checks, metrics and the HTTP API

pub mod api;
pub mod control;
pub mod engine;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod robot;

pub use control::{
    ControlLoop, ControlLoopBuilder, CycleRecord, LoopConfig, LoopPhase, LoopReport, LoopStatus,
    SlidingWindow,
};
pub use engine::{EngineClient, InferenceEngine, ReferenceEngine, TrainingHandle, TrainingInvoker};
pub use error::{ControlError, EngineError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{LoopMetrics, StructuredLogger};
pub use robot::{RobotKind, RobotModel};
