pub mod aggregator;
pub mod error;
pub mod extraction;
pub mod models;
pub mod query;
pub mod queue;
pub mod runner;
pub mod schema;
pub mod storage;
#[cfg(feature = "postgres")]
pub mod storage_postgres;
pub mod submission;
pub mod task;

// Re-export commonly used types
pub use aggregator::{BatchAggregator, BatchCounters, BatchStatus, derive_status};
pub use error::{ExtractionError, ExtractionErrorKind, FlowError, Result, ValidationError};
pub use extraction::{Extraction, Extractor, HttpExtractor, ProviderConfig, ProviderKind};
pub use models::{
    ExtractionMetadata, NewTemplate, ReportBatch, ReportOutcome, ReportStatus, ReportText,
    StructuredReport, Template, WorkItem, templates_from_yaml,
};
pub use query::{BatchStatusView, ReportView};
pub use queue::{ChannelTaskQueue, TaskQueue};
pub use runner::{PoolSummary, WorkerConfig, WorkerPool};
pub use schema::{FieldKind, FieldSpec, TemplateSchema};
pub use storage::{Claim, InMemoryReportStore, ReportStore};
#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresReportStore;
pub use submission::{SubmissionService, parse_report_upload};
pub use task::{ReportTask, RetryPolicy, TaskOutcome};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::{collections::HashMap, sync::Arc, sync::Mutex, time::Duration};

    /// Fails reports whose text starts with "garbled" as an unusable response
    struct ScenarioExtractor {
        failures: Mutex<HashMap<String, Vec<ExtractionErrorKind>>>,
    }

    impl ScenarioExtractor {
        fn new() -> Self {
            Self {
                failures: Mutex::new(HashMap::new()),
            }
        }

        fn fail_first(self, text: &str, kinds: Vec<ExtractionErrorKind>) -> Self {
            self.failures.lock().unwrap().insert(text.to_string(), kinds);
            self
        }
    }

    #[async_trait]
    impl Extractor for ScenarioExtractor {
        async fn extract(
            &self,
            report_text: &str,
            schema: &TemplateSchema,
            _config: &ProviderConfig,
        ) -> std::result::Result<Extraction, ExtractionError> {
            if report_text.starts_with("garbled") {
                return Err(ExtractionError::invalid_response_shape("not JSON"));
            }
            let pending = {
                let mut failures = self.failures.lock().unwrap();
                failures
                    .get_mut(report_text)
                    .and_then(|kinds| (!kinds.is_empty()).then(|| kinds.remove(0)))
            };
            if let Some(kind) = pending {
                return Err(ExtractionError::new(kind, "scripted"));
            }
            Ok(Extraction {
                data: schema
                    .conform(&json!({ "impression": format!("impression of {}", report_text) }))
                    .unwrap_or(Value::Null),
                metadata: ExtractionMetadata::default(),
            })
        }
    }

    struct Pipeline {
        store: Arc<InMemoryReportStore>,
        submission: SubmissionService,
        workers: tokio::task::JoinHandle<PoolSummary>,
        template_id: uuid::Uuid,
    }

    async fn pipeline(extractor: ScenarioExtractor) -> Pipeline {
        let store = Arc::new(InMemoryReportStore::new());
        let template = Template::create(NewTemplate {
            name: "Impression only".to_string(),
            description: String::new(),
            template_type: "radiology".to_string(),
            schema: TemplateSchema::new(vec![FieldSpec::text("impression", "Final impression")]),
        })
        .unwrap();
        let template_id = template.id;
        store.save_template(template).await.unwrap();

        let (queue, receiver) = ChannelTaskQueue::new();
        let task = ReportTask::new(
            store.clone(),
            Arc::new(extractor),
            ProviderConfig::new(ProviderKind::Anthropic, "test-model"),
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        let workers = WorkerPool::new(task, WorkerConfig::default()).spawn(receiver);
        let submission = SubmissionService::new(store.clone(), Arc::new(queue));

        Pipeline {
            store,
            submission,
            workers,
            template_id,
        }
    }

    impl Pipeline {
        async fn finish(self) -> Arc<InMemoryReportStore> {
            drop(self.submission);
            self.workers.await.unwrap();
            self.store
        }
    }

    #[tokio::test]
    async fn all_reports_succeed() {
        let p = pipeline(ScenarioExtractor::new()).await;
        let batch = p
            .submission
            .submit_texts("three", p.template_id, vec!["r1".into(), "r2".into(), "r3".into()])
            .await
            .unwrap();
        let store = p.finish().await;

        let view = query::get_batch_status(store.as_ref(), batch.id).await.unwrap();
        assert_eq!(view.status, BatchStatus::Completed);
        assert_eq!((view.completed, view.failed, view.total), (3, 0, 3));

        for report in query::list_batch_reports(store.as_ref(), batch.id).await.unwrap() {
            assert_eq!(report.status, ReportStatus::Succeeded);
            assert!(report.structured_data.unwrap()["impression"].is_string());
        }
    }

    #[tokio::test]
    async fn one_bad_response_gives_completed_with_errors() {
        let p = pipeline(ScenarioExtractor::new()).await;
        let batch = p
            .submission
            .submit_texts("mixed", p.template_id, vec!["fine".into(), "garbled scan".into()])
            .await
            .unwrap();
        let store = p.finish().await;

        let view = query::get_batch_status(store.as_ref(), batch.id).await.unwrap();
        assert_eq!(view.status, BatchStatus::CompletedWithErrors);
        assert_eq!((view.completed, view.failed), (1, 1));

        let reports = query::list_batch_reports(store.as_ref(), batch.id).await.unwrap();
        let failed = reports.iter().find(|r| r.status == ReportStatus::Failed).unwrap();
        assert!(failed.structured_data.is_none());
        assert!(failed.error_message.as_deref().unwrap().contains("invalid_response_shape"));
    }

    #[tokio::test]
    async fn timeouts_then_success_counts_once() {
        let extractor = ScenarioExtractor::new().fail_first(
            "slow",
            vec![ExtractionErrorKind::Timeout, ExtractionErrorKind::Timeout],
        );
        let p = pipeline(extractor).await;
        let batch = p
            .submission
            .submit_texts("slow one", p.template_id, vec!["slow".into()])
            .await
            .unwrap();
        let store = p.finish().await;

        let view = query::get_batch_status(store.as_ref(), batch.id).await.unwrap();
        assert_eq!(view.status, BatchStatus::Completed);
        assert_eq!((view.completed, view.failed), (1, 0));

        let reports = query::list_batch_reports(store.as_ref(), batch.id).await.unwrap();
        assert_eq!(
            reports[0].structured_data,
            Some(json!({ "impression": "impression of slow" }))
        );
        assert_eq!(reports[0].metadata.as_ref().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn empty_submission_is_rejected() {
        let p = pipeline(ScenarioExtractor::new()).await;
        let err = p
            .submission
            .submit_texts("nothing", p.template_id, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(ValidationError::NoReports)));

        let store = p.finish().await;
        assert!(query::list_batches(store.as_ref(), 0, 10).await.unwrap().is_empty());
    }
}
