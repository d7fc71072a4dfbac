//! Read-only projections polled by the API layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    aggregator::BatchStatus,
    error::{FlowError, Result},
    models::{ReportBatch, ReportStatus, StructuredReport},
    storage::ReportStore,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatusView {
    pub id: Uuid,
    pub name: String,
    pub template_id: Uuid,
    pub status: BatchStatus,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub created_at: DateTime<Utc>,
}

impl From<ReportBatch> for BatchStatusView {
    fn from(batch: ReportBatch) -> Self {
        Self {
            id: batch.id,
            name: batch.name,
            template_id: batch.template_id,
            status: batch.status,
            total: batch.counters.total,
            completed: batch.counters.completed,
            failed: batch.counters.failed,
            created_at: batch.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportView {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub source_name: String,
    pub status: ReportStatus,
    pub original_text: String,
    pub structured_data: Option<Value>,
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<crate::models::ExtractionMetadata>,
    pub updated_at: DateTime<Utc>,
}

impl From<StructuredReport> for ReportView {
    fn from(report: StructuredReport) -> Self {
        Self {
            id: report.id,
            batch_id: report.batch_id,
            source_name: report.source_name,
            status: report.status,
            original_text: report.original_text,
            structured_data: report.structured_data,
            error_message: report.error_message,
            metadata: report.metadata,
            updated_at: report.updated_at,
        }
    }
}

pub async fn get_batch_status(store: &dyn ReportStore, batch_id: Uuid) -> Result<BatchStatusView> {
    store
        .get_batch(batch_id)
        .await?
        .map(BatchStatusView::from)
        .ok_or_else(|| FlowError::not_found("batch", batch_id))
}

pub async fn get_report(store: &dyn ReportStore, report_id: Uuid) -> Result<ReportView> {
    store
        .get_report(report_id)
        .await?
        .map(ReportView::from)
        .ok_or_else(|| FlowError::not_found("report", report_id))
}

pub async fn list_batches(store: &dyn ReportStore, skip: usize, limit: usize) -> Result<Vec<BatchStatusView>> {
    Ok(store
        .list_batches(skip, limit)
        .await?
        .into_iter()
        .map(BatchStatusView::from)
        .collect())
}

pub async fn list_batch_reports(store: &dyn ReportStore, batch_id: Uuid) -> Result<Vec<ReportView>> {
    if store.get_batch(batch_id).await?.is_none() {
        return Err(FlowError::not_found("batch", batch_id));
    }
    Ok(store
        .list_reports(batch_id)
        .await?
        .into_iter()
        .map(ReportView::from)
        .collect())
}
