//! WorkerPool: consumes work items from the task queue and runs one
//! [`ReportTask`] per item on the tokio runtime.
//!
//! * Items are processed concurrently, bounded by a semaphore; there is no
//!   ordering between reports of the same batch or across batches.
//! * A delivery that fails with a persistence error is redelivered after a
//!   short delay, up to `max_deliveries` in total. Duplicate deliveries are
//!   harmless because the report task detects terminal reports. Items given
//!   up on stay non-terminal in the store and are picked up again by
//!   [`SubmissionService::requeue_unfinished`](crate::SubmissionService::requeue_unfinished).
//! * The pool stops once every queue sender is dropped and all in-flight
//!   items are done.

use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Semaphore, mpsc::UnboundedReceiver},
    task::{JoinHandle, JoinSet},
};
use tracing::{error, info, warn};

use crate::{
    error::Result,
    models::WorkItem,
    task::{ReportTask, TaskOutcome},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub max_deliveries: u32,
    pub redelivery_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_deliveries: 3,
            redelivery_delay: Duration::from_secs(2),
        }
    }
}

/// Counts reported when the pool shuts down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub finished: u64,
    pub skipped: u64,
    pub abandoned: u64,
}

pub struct WorkerPool {
    task: ReportTask,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(task: ReportTask, config: WorkerConfig) -> Self {
        Self { task, config }
    }

    /// Run the pool on a background tokio task.
    pub fn spawn(self, receiver: UnboundedReceiver<WorkItem>) -> JoinHandle<PoolSummary> {
        tokio::spawn(self.run(receiver))
    }

    pub async fn run(self, mut receiver: UnboundedReceiver<WorkItem>) -> PoolSummary {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight: JoinSet<Result<TaskOutcome>> = JoinSet::new();
        let mut summary = PoolSummary::default();

        info!(concurrency = self.config.concurrency, "Worker pool started");

        loop {
            tokio::select! {
                received = receiver.recv() => {
                    let Some(item) = received else { break };
                    let permit = match permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let task = self.task.clone();
                    let config = self.config;
                    in_flight.spawn(async move {
                        let result = deliver(&task, item, config).await;
                        drop(permit);
                        result
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    tally(&mut summary, joined);
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            tally(&mut summary, joined);
        }

        info!(
            finished = summary.finished,
            skipped = summary.skipped,
            abandoned = summary.abandoned,
            "Worker pool stopped"
        );
        summary
    }
}

/// Run one item, redelivering it on persistence failures.
async fn deliver(task: &ReportTask, mut item: WorkItem, config: WorkerConfig) -> Result<TaskOutcome> {
    loop {
        match task.run(item).await {
            Err(e) if e.is_redeliverable() && item.delivery < config.max_deliveries => {
                warn!(
                    report_id = %item.report_id,
                    delivery = item.delivery,
                    error = %e,
                    "Delivery failed, scheduling redelivery"
                );
                tokio::time::sleep(config.redelivery_delay).await;
                item = item.redelivered();
            }
            Err(e) => {
                error!(
                    report_id = %item.report_id,
                    delivery = item.delivery,
                    error = %e,
                    "Giving up on work item"
                );
                return Err(e);
            }
            Ok(outcome) => return Ok(outcome),
        }
    }
}

fn tally(summary: &mut PoolSummary, joined: std::result::Result<Result<TaskOutcome>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(TaskOutcome::Finished(_))) => summary.finished += 1,
        Ok(Ok(TaskOutcome::AlreadyTerminal(_) | TaskOutcome::Superseded)) => summary.skipped += 1,
        Ok(Err(_)) => summary.abandoned += 1,
        Err(e) => {
            error!(error = %e, "Report task panicked");
            summary.abandoned += 1;
        }
    }
}
