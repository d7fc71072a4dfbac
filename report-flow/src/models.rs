use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    aggregator::{BatchCounters, BatchStatus},
    error::ValidationError,
    schema::TemplateSchema,
};

/// Named schema describing what to extract from a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub template_type: String,
    pub schema: TemplateSchema,
    pub created_at: DateTime<Utc>,
}

/// Template definition as submitted by the CRUD layer or a seed file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_template_type")]
    pub template_type: String,
    pub schema: TemplateSchema,
}

fn default_template_type() -> String {
    "radiology".to_string()
}

impl Template {
    pub fn create(draft: NewTemplate) -> Result<Self, ValidationError> {
        if draft.name.trim().is_empty() {
            return Err(ValidationError::InvalidTemplate(
                "template name must not be empty".to_string(),
            ));
        }
        draft.schema.validate()?;

        Ok(Self {
            id: Uuid::new_v4(),
            name: draft.name.trim().to_string(),
            description: draft.description,
            template_type: draft.template_type,
            schema: draft.schema,
            created_at: Utc::now(),
        })
    }
}

/// Parse a YAML list of template definitions
pub fn templates_from_yaml(source: &str) -> Result<Vec<NewTemplate>, ValidationError> {
    serde_yaml::from_str(source).map_err(|e| ValidationError::InvalidTemplate(e.to_string()))
}

/// A named group of reports submitted together against one template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportBatch {
    pub id: Uuid,
    pub name: String,
    pub template_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub counters: BatchCounters,
    pub status: BatchStatus,
}

impl ReportBatch {
    pub fn new(name: impl Into<String>, template_id: Uuid, total: u32) -> Self {
        let counters = BatchCounters::new(total);
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            template_id,
            created_at: Utc::now(),
            status: counters.status(),
            counters,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
}

impl ReportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Provider-reported details attached to a finished extraction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub provider: String,
    pub model: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// One report's text plus its extraction outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredReport {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub template_id: Uuid,
    pub source_name: String,
    pub original_text: String,
    pub status: ReportStatus,
    pub structured_data: Option<Value>,
    pub error_message: Option<String>,
    pub metadata: Option<ExtractionMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StructuredReport {
    pub fn queued(batch: &ReportBatch, text: ReportText) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            batch_id: batch.id,
            template_id: batch.template_id,
            source_name: text.source_name,
            original_text: text.text,
            status: ReportStatus::Queued,
            structured_data: None,
            error_message: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single report text and where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportText {
    pub source_name: String,
    pub text: String,
}

impl ReportText {
    pub fn new(source_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            text: text.into(),
        }
    }
}

/// Terminal result a report task writes exactly once
#[derive(Debug, Clone, PartialEq)]
pub enum ReportResolution {
    Succeeded {
        data: Value,
        metadata: ExtractionMetadata,
    },
    Failed {
        error: String,
    },
}

impl ReportResolution {
    pub fn outcome(&self) -> ReportOutcome {
        match self {
            Self::Succeeded { .. } => ReportOutcome::Succeeded,
            Self::Failed { .. } => ReportOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Succeeded,
    Failed,
}

/// Unit of work carried by the task queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub report_id: Uuid,
    pub template_id: Uuid,
    /// 1 for the first delivery, incremented on every redelivery
    pub delivery: u32,
}

impl WorkItem {
    pub fn new(report_id: Uuid, template_id: Uuid) -> Self {
        Self {
            report_id,
            template_id,
            delivery: 1,
        }
    }

    pub fn redelivered(self) -> Self {
        Self {
            delivery: self.delivery + 1,
            ..self
        }
    }
}
