//! Training invocation
//!
//! Training is long and blocking, so it runs on the blocking pool. The client
//! is moved into the task and handed back through [`TrainingHandle`] once the
//! engine is done with it; nothing else can reach the engine meanwhile.

use super::EngineClient;
use crate::error::Result;
use crate::models::TrainingReport;
use crate::observability::{LoopMetrics, StructuredLogger};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};

/// Awaitable completion of a training task
///
/// Dropping the handle detaches the task; training still runs to completion.
pub struct TrainingHandle {
    task: JoinHandle<(EngineClient, Result<()>)>,
}

impl TrainingHandle {
    /// Wait for training to finish and take the client back
    pub async fn wait(self) -> std::result::Result<(EngineClient, Result<()>), JoinError> {
        self.task.await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Starts engine training off the async runtime
#[derive(Clone)]
pub struct TrainingInvoker {
    metrics: LoopMetrics,
    logger: StructuredLogger,
}

impl TrainingInvoker {
    pub fn new(logger: StructuredLogger) -> Self {
        Self {
            metrics: LoopMetrics::new(),
            logger,
        }
    }

    /// Train with the engine's own parameters
    pub fn spawn(&self, mut client: EngineClient) -> TrainingHandle {
        let logger = self.logger.clone();
        info!("Starting background training");

        let task = tokio::task::spawn_blocking(move || {
            let result = client.train_background();
            logger.log_training_finished(result.is_ok());
            (client, result)
        });
        TrainingHandle { task }
    }

    /// Train in `rounds` rounds of `epochs_per_round` epochs, streaming a
    /// report after each round. A closed receiver ends training early.
    pub fn run_interactive(
        &self,
        mut client: EngineClient,
        rounds: usize,
        epochs_per_round: usize,
        reports: mpsc::Sender<TrainingReport>,
    ) -> TrainingHandle {
        let logger = self.logger.clone();
        let metrics = self.metrics.clone();
        info!(rounds, epochs_per_round, "Starting interactive training");

        let task = tokio::task::spawn_blocking(move || {
            let result = interactive_rounds(
                &mut client,
                rounds,
                epochs_per_round,
                &reports,
                &logger,
                &metrics,
            );
            let end = client.train_end();
            let result = result.and(end);
            logger.log_training_finished(result.is_ok());
            (client, result)
        });
        TrainingHandle { task }
    }
}

fn interactive_rounds(
    client: &mut EngineClient,
    rounds: usize,
    epochs_per_round: usize,
    reports: &mpsc::Sender<TrainingReport>,
    logger: &StructuredLogger,
    metrics: &LoopMetrics,
) -> Result<()> {
    client.train_init(false)?;

    for round in 0..rounds {
        let report = client.train_loop(epochs_per_round)?;
        metrics.record_training(&report);
        logger.log_training_progress(&report);

        if reports.blocking_send(report).is_err() {
            debug!(round, "Report receiver closed, ending training");
            break;
        }
    }
    Ok(())
}
