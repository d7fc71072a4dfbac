use serde_json::Value;
use std::{path::Path, sync::Arc};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::{FlowError, Result, ValidationError},
    models::{ReportBatch, ReportText, StructuredReport, WorkItem},
    queue::TaskQueue,
    storage::ReportStore,
};

const ALLOWED_EXTENSIONS: &[&str] = &["json"];

/// Parse one uploaded file: a JSON array of non-blank report strings.
pub fn parse_report_upload(filename: &str, content: &[u8]) -> std::result::Result<Vec<ReportText>, ValidationError> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    if !extension.is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str())) {
        return Err(ValidationError::UnsupportedFile(filename.to_string()));
    }

    let malformed = |reason: String| ValidationError::MalformedUpload {
        file: filename.to_string(),
        reason,
    };

    let text = std::str::from_utf8(content).map_err(|e| malformed(e.to_string()))?;
    let parsed: Value = serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
    let items = parsed
        .as_array()
        .ok_or_else(|| malformed("expected an array of report texts".to_string()))?;

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let report = item.as_str().ok_or_else(|| {
                malformed(format!("report at index {} is not a string", index))
            })?;
            let source_name = format!("{}_report_{}", filename, index + 1);
            if report.trim().is_empty() {
                return Err(ValidationError::BlankReport { source_name });
            }
            Ok(ReportText::new(source_name, report))
        })
        .collect()
}

/// Creates batches and hands their reports to the task queue
#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn ReportStore>,
    queue: Arc<dyn TaskQueue>,
}

impl SubmissionService {
    pub fn new(store: Arc<dyn ReportStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Validate, persist the batch with its reports, then enqueue one task per report.
    ///
    /// Enqueueing starts only after the batch and every report are stored, so a
    /// worker never sees a work item before its report exists.
    pub async fn submit_batch(
        &self,
        name: &str,
        template_id: Uuid,
        reports: Vec<ReportText>,
    ) -> Result<ReportBatch> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyBatchName.into());
        }
        if self.store.get_template(template_id).await?.is_none() {
            return Err(ValidationError::UnknownTemplate(template_id).into());
        }
        if reports.is_empty() {
            return Err(ValidationError::NoReports.into());
        }
        if let Some(report) = reports.iter().find(|r| r.text.trim().is_empty()) {
            return Err(ValidationError::BlankReport {
                source_name: report.source_name.clone(),
            }
            .into());
        }

        let total = u32::try_from(reports.len())
            .map_err(|_| FlowError::Aggregate("too many reports in one batch".to_string()))?;
        let batch = ReportBatch::new(name, template_id, total);
        let records: Vec<StructuredReport> = reports
            .into_iter()
            .map(|text| StructuredReport::queued(&batch, text))
            .collect();
        let work: Vec<WorkItem> = records
            .iter()
            .map(|r| WorkItem::new(r.id, template_id))
            .collect();

        self.store.create_batch(batch.clone(), records).await?;
        info!(batch_id = %batch.id, template_id = %template_id, total, "Batch created");

        for item in work {
            if let Err(e) = self.queue.enqueue(item).await {
                error!(batch_id = %batch.id, report_id = %item.report_id, error = %e, "Failed to enqueue report");
                return Err(e);
            }
        }
        info!(batch_id = %batch.id, total, "Batch reports enqueued");

        Ok(batch)
    }

    /// Enqueue a work item for every report that has not reached a terminal state.
    ///
    /// Queued items do not outlive the process, so this runs at startup to
    /// resume batches left unfinished by a restart or by abandoned deliveries.
    pub async fn requeue_unfinished(&self) -> Result<usize> {
        let unfinished = self.store.list_unfinished_reports().await?;
        for report in &unfinished {
            self.queue
                .enqueue(WorkItem::new(report.id, report.template_id))
                .await?;
        }
        if !unfinished.is_empty() {
            info!(reports = unfinished.len(), "Unfinished reports requeued");
        }
        Ok(unfinished.len())
    }

    /// Convenience for callers holding plain strings, e.g. a JSON API body.
    pub async fn submit_texts(
        &self,
        name: &str,
        template_id: Uuid,
        texts: Vec<String>,
    ) -> Result<ReportBatch> {
        let reports = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| ReportText::new(format!("report_{}", i + 1), text))
            .collect();
        self.submit_batch(name, template_id, reports).await
    }
}
