use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::{
    aggregator::{BatchCounters, BatchStatus},
    error::{FlowError, Result},
    models::{
        ExtractionMetadata, ReportBatch, ReportResolution, ReportStatus,
        StructuredReport, Template,
    },
    schema::TemplateSchema,
    storage::{Claim, ReportStore},
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS templates (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    template_type TEXT NOT NULL,
    schema JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS report_batches (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    template_id UUID NOT NULL REFERENCES templates(id),
    total INTEGER NOT NULL CHECK (total >= 0),
    completed INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CHECK (completed + failed <= total)
);

CREATE TABLE IF NOT EXISTS structured_reports (
    id UUID PRIMARY KEY,
    batch_id UUID NOT NULL REFERENCES report_batches(id),
    template_id UUID NOT NULL REFERENCES templates(id),
    position INTEGER NOT NULL,
    source_name TEXT NOT NULL,
    original_text TEXT NOT NULL,
    status TEXT NOT NULL,
    structured_data JSONB,
    error_message TEXT,
    metadata JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_structured_reports_batch
    ON structured_reports (batch_id, position);
"#;

const REPORT_COLUMNS: &str = "id, batch_id, template_id, source_name, original_text, status, \
     structured_data, error_message, metadata, created_at, updated_at";

const BATCH_COLUMNS: &str = "id, name, template_id, total, completed, failed, status, created_at";

/// PostgreSQL implementation of ReportStore
pub struct PostgresReportStore {
    pool: Arc<PgPool>,
}

impl PostgresReportStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        let store = Self {
            pool: Arc::new(pool),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(self.pool.as_ref()).await?;
        info!("Report store schema ready");
        Ok(())
    }
}

/// Checked conversion between Rust counts and INTEGER columns.
fn int_column<T, U>(value: T, column: &str) -> Result<U>
where
    T: Copy + std::fmt::Display,
    U: TryFrom<T>,
{
    U::try_from(value)
        .map_err(|_| FlowError::Persistence(format!("{} out of range: {}", column, value)))
}

fn batch_from_row(row: &PgRow) -> Result<ReportBatch> {
    let status: String = row.try_get("status")?;
    let counters = BatchCounters {
        total: int_column(row.try_get::<i32, _>("total")?, "total")?,
        completed: int_column(row.try_get::<i32, _>("completed")?, "completed")?,
        failed: int_column(row.try_get::<i32, _>("failed")?, "failed")?,
    };
    Ok(ReportBatch {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        template_id: row.try_get("template_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        status: BatchStatus::parse(&status)
            .ok_or_else(|| FlowError::Persistence(format!("unknown batch status '{}'", status)))?,
        counters,
    })
}

fn report_from_row(row: &PgRow) -> Result<StructuredReport> {
    let status: String = row.try_get("status")?;
    let metadata: Option<Value> = row.try_get("metadata")?;
    Ok(StructuredReport {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        template_id: row.try_get("template_id")?,
        source_name: row.try_get("source_name")?,
        original_text: row.try_get("original_text")?,
        status: ReportStatus::parse(&status)
            .ok_or_else(|| FlowError::Persistence(format!("unknown report status '{}'", status)))?,
        structured_data: row.try_get("structured_data")?,
        error_message: row.try_get("error_message")?,
        metadata: metadata
            .map(serde_json::from_value::<ExtractionMetadata>)
            .transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn template_from_row(row: &PgRow) -> Result<Template> {
    let schema: Value = row.try_get("schema")?;
    Ok(Template {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        template_type: row.try_get("template_type")?,
        schema: serde_json::from_value::<TemplateSchema>(schema)?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ReportStore for PostgresReportStore {
    async fn save_template(&self, template: Template) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO templates (id, name, description, template_type, schema, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                template_type = EXCLUDED.template_type,
                schema = EXCLUDED.schema
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(&template.template_type)
        .bind(serde_json::to_value(&template.schema)?)
        .bind(template.created_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>> {
        let row = sqlx::query(
            "SELECT id, name, description, template_type, schema, created_at FROM templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.as_ref().map(template_from_row).transpose()
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let rows = sqlx::query(
            "SELECT id, name, description, template_type, schema, created_at FROM templates ORDER BY created_at",
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(template_from_row).collect()
    }

    async fn create_batch(&self, batch: ReportBatch, reports: Vec<StructuredReport>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO report_batches (id, name, template_id, total, completed, failed, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(batch.id)
        .bind(&batch.name)
        .bind(batch.template_id)
        .bind(int_column::<_, i32>(batch.counters.total, "total")?)
        .bind(int_column::<_, i32>(batch.counters.completed, "completed")?)
        .bind(int_column::<_, i32>(batch.counters.failed, "failed")?)
        .bind(batch.status.as_str())
        .bind(batch.created_at)
        .execute(&mut *tx)
        .await?;

        for (position, report) in reports.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO structured_reports
                    (id, batch_id, template_id, position, source_name, original_text, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(report.id)
            .bind(report.batch_id)
            .bind(report.template_id)
            .bind(int_column::<_, i32>(position, "position")?)
            .bind(&report.source_name)
            .bind(&report.original_text)
            .bind(report.status.as_str())
            .bind(report.created_at)
            .bind(report.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<ReportBatch>> {
        let sql = format!("SELECT {} FROM report_batches WHERE id = $1", BATCH_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn list_batches(&self, skip: usize, limit: usize) -> Result<Vec<ReportBatch>> {
        let sql = format!(
            "SELECT {} FROM report_batches ORDER BY created_at, id OFFSET $1 LIMIT $2",
            BATCH_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(skip).unwrap_or(i64::MAX))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.pool.as_ref())
            .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<StructuredReport>> {
        let sql = format!("SELECT {} FROM structured_reports WHERE id = $1", REPORT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.as_ref().map(report_from_row).transpose()
    }

    async fn list_reports(&self, batch_id: Uuid) -> Result<Vec<StructuredReport>> {
        let sql = format!(
            "SELECT {} FROM structured_reports WHERE batch_id = $1 ORDER BY position",
            REPORT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(batch_id)
            .fetch_all(self.pool.as_ref())
            .await?;
        rows.iter().map(report_from_row).collect()
    }

    async fn mark_processing(&self, report_id: Uuid) -> Result<Claim> {
        let sql = format!(
            r#"
            UPDATE structured_reports
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'processing')
            RETURNING {}
            "#,
            REPORT_COLUMNS
        );
        if let Some(row) = sqlx::query(&sql)
            .bind(report_id)
            .fetch_optional(self.pool.as_ref())
            .await?
        {
            return Ok(Claim::Claimed(report_from_row(&row)?));
        }

        // either missing or already terminal
        match self.get_report(report_id).await? {
            Some(report) => Ok(Claim::AlreadyTerminal(report.status)),
            None => Err(FlowError::not_found("report", report_id)),
        }
    }

    async fn complete_report(
        &self,
        report_id: Uuid,
        resolution: ReportResolution,
    ) -> Result<Option<ReportBatch>> {
        let outcome = resolution.outcome();
        let (status, data, error, metadata) = match resolution {
            ReportResolution::Succeeded { data, metadata } => (
                ReportStatus::Succeeded,
                Some(data),
                None,
                Some(serde_json::to_value(metadata)?),
            ),
            ReportResolution::Failed { error } => (ReportStatus::Failed, None, Some(error), None),
        };

        let mut tx = self.pool.begin().await?;

        // a concurrent delivery blocks on the row lock, then matches no row
        let batch_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE structured_reports
            SET status = $2,
                structured_data = $3,
                error_message = $4,
                metadata = $5,
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('succeeded', 'failed')
            RETURNING batch_id
            "#,
        )
        .bind(report_id)
        .bind(status.as_str())
        .bind(data)
        .bind(error)
        .bind(metadata)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(batch_id) = batch_id else {
            tx.rollback().await?;
            return match self.get_report(report_id).await? {
                Some(_) => Ok(None),
                None => Err(FlowError::not_found("report", report_id)),
            };
        };

        let sql = format!(
            "SELECT {} FROM report_batches WHERE id = $1 FOR UPDATE",
            BATCH_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(batch_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| FlowError::not_found("batch", batch_id))?;
        let mut batch = batch_from_row(&row)?;

        let counters = batch.counters.record(outcome)?;
        let batch_status = counters.status();

        sqlx::query(
            "UPDATE report_batches SET completed = $2, failed = $3, status = $4 WHERE id = $1",
        )
        .bind(batch_id)
        .bind(int_column::<_, i32>(counters.completed, "completed")?)
        .bind(int_column::<_, i32>(counters.failed, "failed")?)
        .bind(batch_status.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        batch.counters = counters;
        batch.status = batch_status;
        Ok(Some(batch))
    }

    async fn list_unfinished_reports(&self) -> Result<Vec<StructuredReport>> {
        let sql = format!(
            r#"
            SELECT {} FROM structured_reports
            WHERE status IN ('queued', 'processing')
            ORDER BY (SELECT b.created_at FROM report_batches b WHERE b.id = batch_id),
                     batch_id, position
            "#,
            REPORT_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(self.pool.as_ref()).await?;
        rows.iter().map(report_from_row).collect()
    }
}
