use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::{FlowError, Result},
    models::{ReportBatch, ReportResolution, ReportStatus, StructuredReport, Template},
};

/// Result of trying to move a report into `processing`
#[derive(Debug, Clone)]
pub enum Claim {
    /// The report is now `processing` and owned by the caller
    Claimed(StructuredReport),
    /// The report already reached a terminal state; nothing to do
    AlreadyTerminal(ReportStatus),
}

/// Persistence handle shared by submission, report tasks, the aggregator and readers
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn save_template(&self, template: Template) -> Result<()>;
    async fn get_template(&self, id: Uuid) -> Result<Option<Template>>;
    async fn list_templates(&self) -> Result<Vec<Template>>;

    /// Persist a batch together with its reports as one unit.
    async fn create_batch(&self, batch: ReportBatch, reports: Vec<StructuredReport>) -> Result<()>;
    async fn get_batch(&self, id: Uuid) -> Result<Option<ReportBatch>>;
    async fn list_batches(&self, skip: usize, limit: usize) -> Result<Vec<ReportBatch>>;

    async fn get_report(&self, id: Uuid) -> Result<Option<StructuredReport>>;
    async fn list_reports(&self, batch_id: Uuid) -> Result<Vec<StructuredReport>>;

    /// Move a non-terminal report to `processing`.
    async fn mark_processing(&self, report_id: Uuid) -> Result<Claim>;

    /// Write the terminal state and count it in the report's batch as one unit.
    ///
    /// Returns the batch with updated counters and status, or `None` when
    /// another delivery already finished the report. On error neither the
    /// report nor the counters change.
    async fn complete_report(
        &self,
        report_id: Uuid,
        resolution: ReportResolution,
    ) -> Result<Option<ReportBatch>>;

    /// Reports not yet terminal, across all batches, in submission order.
    async fn list_unfinished_reports(&self) -> Result<Vec<StructuredReport>>;
}

/// In-memory implementation of ReportStore
#[derive(Default)]
pub struct InMemoryReportStore {
    templates: Arc<DashMap<Uuid, Template>>,
    batches: Arc<DashMap<Uuid, ReportBatch>>,
    reports: Arc<DashMap<Uuid, StructuredReport>>,
    batch_reports: Arc<DashMap<Uuid, Vec<Uuid>>>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn save_template(&self, template: Template) -> Result<()> {
        self.templates.insert(template.id, template);
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>> {
        Ok(self.templates.get(&id).map(|entry| entry.clone()))
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let mut templates: Vec<Template> =
            self.templates.iter().map(|entry| entry.clone()).collect();
        templates.sort_by_key(|t| t.created_at);
        Ok(templates)
    }

    async fn create_batch(&self, batch: ReportBatch, reports: Vec<StructuredReport>) -> Result<()> {
        let ids = reports.iter().map(|r| r.id).collect();
        for report in reports {
            self.reports.insert(report.id, report);
        }
        self.batch_reports.insert(batch.id, ids);
        self.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<ReportBatch>> {
        Ok(self.batches.get(&id).map(|entry| entry.clone()))
    }

    async fn list_batches(&self, skip: usize, limit: usize) -> Result<Vec<ReportBatch>> {
        let mut batches: Vec<ReportBatch> =
            self.batches.iter().map(|entry| entry.clone()).collect();
        batches.sort_by_key(|b| (b.created_at, b.id));
        Ok(batches.into_iter().skip(skip).take(limit).collect())
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<StructuredReport>> {
        Ok(self.reports.get(&id).map(|entry| entry.clone()))
    }

    async fn list_reports(&self, batch_id: Uuid) -> Result<Vec<StructuredReport>> {
        let ids = match self.batch_reports.get(&batch_id) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.reports.get(id).map(|entry| entry.clone()))
            .collect())
    }

    async fn mark_processing(&self, report_id: Uuid) -> Result<Claim> {
        let mut report = self
            .reports
            .get_mut(&report_id)
            .ok_or_else(|| FlowError::not_found("report", report_id))?;

        if report.status.is_terminal() {
            return Ok(Claim::AlreadyTerminal(report.status));
        }
        report.status = ReportStatus::Processing;
        report.updated_at = Utc::now();
        Ok(Claim::Claimed(report.clone()))
    }

    async fn complete_report(
        &self,
        report_id: Uuid,
        resolution: ReportResolution,
    ) -> Result<Option<ReportBatch>> {
        // lock order is report entry, then batch entry
        let mut report = self
            .reports
            .get_mut(&report_id)
            .ok_or_else(|| FlowError::not_found("report", report_id))?;
        if report.status.is_terminal() {
            return Ok(None);
        }

        let batch_id = report.batch_id;
        let mut batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| FlowError::not_found("batch", batch_id))?;
        let counters = batch.counters.record(resolution.outcome())?;

        apply_resolution(&mut report, resolution);
        batch.counters = counters;
        batch.status = counters.status();
        Ok(Some(batch.clone()))
    }

    async fn list_unfinished_reports(&self) -> Result<Vec<StructuredReport>> {
        let mut batches: Vec<(DateTime<Utc>, Uuid)> = self
            .batches
            .iter()
            .map(|entry| (entry.created_at, entry.id))
            .collect();
        batches.sort();

        let mut unfinished = Vec::new();
        for (_, batch_id) in batches {
            for report in self.list_reports(batch_id).await? {
                if !report.status.is_terminal() {
                    unfinished.push(report);
                }
            }
        }
        Ok(unfinished)
    }
}

fn apply_resolution(report: &mut StructuredReport, resolution: ReportResolution) {
    match resolution {
        ReportResolution::Succeeded { data, metadata } => {
            report.status = ReportStatus::Succeeded;
            report.structured_data = Some(data);
            report.metadata = Some(metadata);
            report.error_message = None;
        }
        ReportResolution::Failed { error } => {
            report.status = ReportStatus::Failed;
            report.structured_data = None;
            report.error_message = Some(error);
        }
    }
    report.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionMetadata, ReportText};
    use serde_json::json;

    async fn seeded(store: &InMemoryReportStore, texts: &[&str]) -> (ReportBatch, Vec<StructuredReport>) {
        let batch = ReportBatch::new("seed", Uuid::new_v4(), texts.len() as u32);
        let reports: Vec<StructuredReport> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| StructuredReport::queued(&batch, ReportText::new(format!("r{}", i), *t)))
            .collect();
        store
            .create_batch(batch.clone(), reports.clone())
            .await
            .unwrap();
        (batch, reports)
    }

    #[tokio::test]
    async fn reports_listed_in_submission_order() {
        let store = InMemoryReportStore::new();
        let (batch, reports) = seeded(&store, &["a", "b", "c"]).await;

        let listed = store.list_reports(batch.id).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|r| r.id).collect();
        let expected: Vec<Uuid> = reports.iter().map(|r| r.id).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn terminal_state_is_write_once() {
        let store = InMemoryReportStore::new();
        let (_, reports) = seeded(&store, &["text"]).await;
        let id = reports[0].id;

        assert!(matches!(
            store.mark_processing(id).await.unwrap(),
            Claim::Claimed(_)
        ));

        let first = ReportResolution::Succeeded {
            data: json!({ "impression": "normal" }),
            metadata: ExtractionMetadata::default(),
        };
        let batch = store.complete_report(id, first).await.unwrap().unwrap();
        assert_eq!(batch.counters.completed, 1);
        assert_eq!(batch.status, crate::aggregator::BatchStatus::Completed);

        let second = ReportResolution::Failed {
            error: "late duplicate".to_string(),
        };
        assert!(store.complete_report(id, second).await.unwrap().is_none());

        let report = store.get_report(id).await.unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Succeeded);
        assert_eq!(report.structured_data, Some(json!({ "impression": "normal" })));
        assert!(report.error_message.is_none());

        assert!(matches!(
            store.mark_processing(id).await.unwrap(),
            Claim::AlreadyTerminal(ReportStatus::Succeeded)
        ));
    }

    #[tokio::test]
    async fn missing_report_is_not_found() {
        let store = InMemoryReportStore::new();
        let err = store.mark_processing(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, FlowError::NotFound { entity: "report", .. }));
    }

    #[tokio::test]
    async fn completion_is_refused_when_counters_are_full() {
        let store = InMemoryReportStore::new();
        // batch claims one report but carries two
        let batch = ReportBatch::new("short", Uuid::new_v4(), 1);
        let reports: Vec<StructuredReport> = ["a", "b"]
            .iter()
            .map(|t| StructuredReport::queued(&batch, ReportText::new("f.json", *t)))
            .collect();
        store.create_batch(batch.clone(), reports.clone()).await.unwrap();

        let done = ReportResolution::Failed {
            error: "bad".to_string(),
        };
        store.complete_report(reports[0].id, done.clone()).await.unwrap();
        let err = store.complete_report(reports[1].id, done).await.unwrap_err();
        assert!(matches!(err, FlowError::Aggregate(_)));

        let untouched = store.get_report(reports[1].id).await.unwrap().unwrap();
        assert_eq!(untouched.status, ReportStatus::Queued);
        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.counters.failed, 1);
    }

    #[tokio::test]
    async fn unfinished_reports_in_submission_order() {
        let store = InMemoryReportStore::new();
        let (_, first) = seeded(&store, &["a", "b"]).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let (_, second) = seeded(&store, &["c"]).await;

        let done = ReportResolution::Failed {
            error: "bad".to_string(),
        };
        store.complete_report(first[0].id, done).await.unwrap();
        store.mark_processing(second[0].id).await.unwrap();

        let unfinished: Vec<Uuid> = store
            .list_unfinished_reports()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(unfinished, vec![first[1].id, second[0].id]);
    }
}
