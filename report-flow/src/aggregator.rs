//! Batch progress: counters, derived status, and the aggregator that applies
//! terminal report outcomes to them.
//!
//! Counters are the only state shared between concurrent report tasks. Stores
//! apply [`BatchCounters::record`] in the same atomic unit as the report's
//! terminal write (entry locks in memory, one transaction with a row lock in
//! PostgreSQL), so an outcome is counted exactly when its report becomes
//! terminal.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{FlowError, Result},
    models::{ReportBatch, ReportOutcome, ReportResolution, StructuredReport},
    storage::ReportStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchCounters {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl BatchCounters {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            completed: 0,
            failed: 0,
        }
    }

    pub fn finished(&self) -> u32 {
        self.completed + self.failed
    }

    pub fn status(&self) -> BatchStatus {
        derive_status(self)
    }

    /// Counters after one more terminal outcome.
    ///
    /// Fails rather than exceed `total`; counters never decrease.
    pub fn record(&self, outcome: ReportOutcome) -> std::result::Result<Self, CounterOverflow> {
        if self.finished() >= self.total {
            return Err(CounterOverflow(*self));
        }
        let mut next = *self;
        match outcome {
            ReportOutcome::Succeeded => next.completed += 1,
            ReportOutcome::Failed => next.failed += 1,
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOverflow(pub BatchCounters);

impl From<CounterOverflow> for FlowError {
    fn from(e: CounterOverflow) -> Self {
        FlowError::Aggregate(format!(
            "batch already has {} of {} outcomes recorded",
            e.0.finished(),
            e.0.total
        ))
    }
}

/// Pure function of the counters
pub fn derive_status(counters: &BatchCounters) -> BatchStatus {
    let finished = counters.finished();
    if finished == 0 {
        BatchStatus::Pending
    } else if finished < counters.total {
        BatchStatus::Processing
    } else if counters.failed == 0 {
        BatchStatus::Completed
    } else if counters.failed < counters.total {
        BatchStatus::CompletedWithErrors
    } else {
        BatchStatus::Failed
    }
}

/// Applies terminal report outcomes to their batch
#[derive(Clone)]
pub struct BatchAggregator {
    store: Arc<dyn ReportStore>,
}

impl BatchAggregator {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self { store }
    }

    /// Record a report's terminal outcome in its batch.
    ///
    /// Returns `None` when another delivery already finished the report; its
    /// outcome was counted then and is not counted again.
    pub async fn record_outcome(
        &self,
        report: &StructuredReport,
        resolution: ReportResolution,
    ) -> Result<Option<ReportBatch>> {
        let outcome = resolution.outcome();
        let batch = self
            .store
            .complete_report(report.id, resolution)
            .await
            .map_err(|e| {
                warn!(batch_id = %report.batch_id, report_id = %report.id, outcome = ?outcome, error = %e, "Failed to record report outcome");
                e
            })?;

        let Some(batch) = batch else {
            return Ok(None);
        };

        info!(
            batch_id = %batch.id,
            report_id = %report.id,
            outcome = ?outcome,
            completed = batch.counters.completed,
            failed = batch.counters.failed,
            total = batch.counters.total,
            status = %batch.status,
            "Batch progress updated"
        );

        if batch.status.is_terminal() {
            info!(batch_id = %batch.id, status = %batch.status, "Batch finished");
        }

        Ok(Some(batch))
    }
}
