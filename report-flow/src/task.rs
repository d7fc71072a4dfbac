use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use crate::{
    aggregator::BatchAggregator,
    error::{ExtractionError, Result},
    extraction::{Extractor, ProviderConfig},
    models::{ReportOutcome, ReportResolution, ReportStatus, StructuredReport, WorkItem},
    storage::{Claim, ReportStore},
};

/// Bounded retry for transient extraction failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based): initial * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// What a single delivery of a work item did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// This delivery wrote the terminal state and counted it
    Finished(ReportOutcome),
    /// The report was already terminal when the delivery arrived
    AlreadyTerminal(ReportStatus),
    /// A concurrent delivery wrote the terminal state first
    Superseded,
}

/// Drives one report from `queued` to a terminal state
#[derive(Clone)]
pub struct ReportTask {
    store: Arc<dyn ReportStore>,
    extractor: Arc<dyn Extractor>,
    aggregator: BatchAggregator,
    provider: Arc<ProviderConfig>,
    retry: RetryPolicy,
}

impl ReportTask {
    pub fn new(
        store: Arc<dyn ReportStore>,
        extractor: Arc<dyn Extractor>,
        provider: ProviderConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            aggregator: BatchAggregator::new(store.clone()),
            store,
            extractor,
            provider: Arc::new(provider),
            retry,
        }
    }

    pub async fn run(&self, item: WorkItem) -> Result<TaskOutcome> {
        let report = match self.store.mark_processing(item.report_id).await? {
            Claim::Claimed(report) => report,
            Claim::AlreadyTerminal(status) => {
                info!(
                    report_id = %item.report_id,
                    status = status.as_str(),
                    delivery = item.delivery,
                    "Report already terminal, skipping duplicate delivery"
                );
                return Ok(TaskOutcome::AlreadyTerminal(status));
            }
        };

        if report.template_id != item.template_id {
            warn!(
                report_id = %report.id,
                queued_template = %item.template_id,
                report_template = %report.template_id,
                "Work item template differs from report, using the report's"
            );
        }

        info!(
            report_id = %report.id,
            batch_id = %report.batch_id,
            delivery = item.delivery,
            "Processing report"
        );

        let resolution = self.resolve(&report).await?;
        let outcome = resolution.outcome();

        match self.aggregator.record_outcome(&report, resolution).await? {
            Some(_) => Ok(TaskOutcome::Finished(outcome)),
            None => {
                info!(report_id = %report.id, "Report finished by another delivery");
                Ok(TaskOutcome::Superseded)
            }
        }
    }

    async fn resolve(&self, report: &StructuredReport) -> Result<ReportResolution> {
        let Some(template) = self.store.get_template(report.template_id).await? else {
            error!(report_id = %report.id, template_id = %report.template_id, "Template not found");
            return Ok(ReportResolution::Failed {
                error: format!("Template {} not found", report.template_id),
            });
        };

        let mut attempt = 1;
        loop {
            match self
                .extractor
                .extract(&report.original_text, &template.schema, &self.provider)
                .await
            {
                Ok(mut extraction) => {
                    extraction.metadata.attempts = attempt;
                    info!(report_id = %report.id, attempt, "Extraction succeeded");
                    return Ok(ReportResolution::Succeeded {
                        data: extraction.data,
                        metadata: extraction.metadata,
                    });
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        report_id = %report.id,
                        attempt,
                        kind = %e.kind,
                        delay_ms = delay.as_millis() as u64,
                        "Transient extraction failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(report_id = %report.id, attempt, kind = %e.kind, error = %e.message, "Extraction failed");
                    return Ok(ReportResolution::Failed {
                        error: failure_message(&e, attempt),
                    });
                }
            }
        }
    }
}

fn failure_message(error: &ExtractionError, attempts: u32) -> String {
    if error.is_transient() {
        format!(
            "AI processing failed after {} attempts ({}): {}",
            attempts, error.kind, error.message
        )
    } else {
        format!("AI processing failed ({}): {}", error.kind, error.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ExtractionErrorKind,
        extraction::{Extraction, ProviderKind},
        models::{ExtractionMetadata, NewTemplate, ReportBatch, ReportText, Template},
        schema::{FieldSpec, TemplateSchema},
        storage::InMemoryReportStore,
    };
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    /// Replays a fixed script of attempt results, then keeps succeeding
    struct ScriptedExtractor {
        script: Mutex<VecDeque<std::result::Result<Value, ExtractionErrorKind>>>,
        calls: AtomicU32,
    }

    impl ScriptedExtractor {
        fn new(script: Vec<std::result::Result<Value, ExtractionErrorKind>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn extract(
            &self,
            _report_text: &str,
            schema: &TemplateSchema,
            _config: &ProviderConfig,
        ) -> std::result::Result<Extraction, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Err(kind)) => Err(ExtractionError::new(kind, "scripted failure")),
                Some(Ok(value)) => Ok(Extraction {
                    data: schema.conform(&value).unwrap(),
                    metadata: ExtractionMetadata::default(),
                }),
                None => Ok(Extraction {
                    data: schema.empty_document(),
                    metadata: ExtractionMetadata::default(),
                }),
            }
        }
    }

    async fn setup(extractor: Arc<ScriptedExtractor>) -> (Arc<InMemoryReportStore>, ReportTask, WorkItem) {
        let store = Arc::new(InMemoryReportStore::new());
        let template = Template::create(NewTemplate {
            name: "CXR".to_string(),
            description: String::new(),
            template_type: "radiology".to_string(),
            schema: TemplateSchema::new(vec![FieldSpec::text("impression", "")]),
        })
        .unwrap();
        store.save_template(template.clone()).await.unwrap();

        let batch = ReportBatch::new("b", template.id, 1);
        let report = StructuredReport::queued(&batch, ReportText::new("f.json", "Lungs clear."));
        let item = WorkItem::new(report.id, template.id);
        store.create_batch(batch, vec![report]).await.unwrap();

        let task = ReportTask::new(
            store.clone(),
            extractor,
            ProviderConfig::new(ProviderKind::Ollama, "test"),
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        (store, task, item)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn timeouts_then_success_counts_once() {
        let extractor = Arc::new(ScriptedExtractor::new(vec![
            Err(ExtractionErrorKind::Timeout),
            Err(ExtractionErrorKind::Timeout),
            Ok(json!({ "impression": "third time lucky" })),
        ]));
        let (store, task, item) = setup(extractor.clone()).await;

        let outcome = task.run(item).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Finished(ReportOutcome::Succeeded));
        assert_eq!(extractor.calls(), 3);

        let report = store.get_report(item.report_id).await.unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Succeeded);
        assert_eq!(
            report.structured_data,
            Some(json!({ "impression": "third time lucky" }))
        );
        assert_eq!(report.metadata.unwrap().attempts, 3);

        let batch = store.get_batch(report.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.counters.completed, 1);
        assert_eq!(batch.counters.failed, 0);
    }

    #[tokio::test]
    async fn exhausted_transient_retries_fail_the_report() {
        let extractor = Arc::new(ScriptedExtractor::new(vec![
            Err(ExtractionErrorKind::RateLimited),
            Err(ExtractionErrorKind::ProviderUnavailable),
            Err(ExtractionErrorKind::Timeout),
        ]));
        let (store, task, item) = setup(extractor.clone()).await;

        let outcome = task.run(item).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Finished(ReportOutcome::Failed));
        assert_eq!(extractor.calls(), 3);

        let report = store.get_report(item.report_id).await.unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Failed);
        assert!(report.structured_data.is_none());
        let message = report.error_message.unwrap();
        assert!(message.contains("after 3 attempts"));
        assert_ne!(message, report.original_text);
    }

    #[tokio::test]
    async fn invalid_shape_is_not_retried() {
        let extractor = Arc::new(ScriptedExtractor::new(vec![Err(
            ExtractionErrorKind::InvalidResponseShape,
        )]));
        let (store, task, item) = setup(extractor.clone()).await;

        task.run(item).await.unwrap();
        assert_eq!(extractor.calls(), 1);

        let report = store.get_report(item.report_id).await.unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Failed);
        assert!(report.error_message.unwrap().contains("invalid_response_shape"));
    }

    #[tokio::test]
    async fn redelivery_of_terminal_report_is_a_no_op() {
        let extractor = Arc::new(ScriptedExtractor::new(vec![Ok(
            json!({ "impression": "first" }),
        )]));
        let (store, task, item) = setup(extractor.clone()).await;

        task.run(item).await.unwrap();
        let again = task.run(item.redelivered()).await.unwrap();

        assert_eq!(again, TaskOutcome::AlreadyTerminal(ReportStatus::Succeeded));
        assert_eq!(extractor.calls(), 1);

        let report = store.get_report(item.report_id).await.unwrap().unwrap();
        assert_eq!(report.structured_data, Some(json!({ "impression": "first" })));
        let batch = store.get_batch(report.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.counters.completed, 1);
    }

    #[tokio::test]
    async fn missing_template_fails_report_without_calling_provider() {
        let extractor = Arc::new(ScriptedExtractor::new(vec![]));
        let store = Arc::new(InMemoryReportStore::new());
        let batch = ReportBatch::new("orphan", uuid::Uuid::new_v4(), 1);
        let report = StructuredReport::queued(&batch, ReportText::new("f.json", "text"));
        let item = WorkItem::new(report.id, batch.template_id);
        store.create_batch(batch.clone(), vec![report]).await.unwrap();

        let task = ReportTask::new(
            store.clone(),
            extractor.clone(),
            ProviderConfig::new(ProviderKind::Ollama, "test"),
            RetryPolicy::default(),
        );
        let outcome = task.run(item).await.unwrap();

        assert_eq!(outcome, TaskOutcome::Finished(ReportOutcome::Failed));
        assert_eq!(extractor.calls(), 0);
        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::aggregator::BatchStatus::Failed);
    }

    /// Holds every extraction until released, so two deliveries overlap
    struct GatedExtractor {
        gate: tokio::sync::Barrier,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Extractor for GatedExtractor {
        async fn extract(
            &self,
            report_text: &str,
            schema: &TemplateSchema,
            _config: &ProviderConfig,
        ) -> std::result::Result<Extraction, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.wait().await;
            Ok(Extraction {
                data: schema
                    .conform(&json!({ "impression": report_text }))
                    .unwrap(),
                metadata: ExtractionMetadata::default(),
            })
        }
    }

    #[tokio::test]
    async fn overlapping_deliveries_count_once() {
        let store = Arc::new(InMemoryReportStore::new());
        let template = Template::create(NewTemplate {
            name: "CXR".to_string(),
            description: String::new(),
            template_type: "radiology".to_string(),
            schema: TemplateSchema::new(vec![FieldSpec::text("impression", "")]),
        })
        .unwrap();
        store.save_template(template.clone()).await.unwrap();
        let batch = ReportBatch::new("b", template.id, 1);
        let report = StructuredReport::queued(&batch, ReportText::new("f.json", "Lungs clear."));
        let item = WorkItem::new(report.id, template.id);
        store.create_batch(batch.clone(), vec![report]).await.unwrap();

        let extractor = Arc::new(GatedExtractor {
            gate: tokio::sync::Barrier::new(2),
            calls: AtomicU32::new(0),
        });
        let task = ReportTask::new(
            store.clone(),
            extractor.clone(),
            ProviderConfig::new(ProviderKind::Ollama, "test"),
            RetryPolicy::new(3, Duration::from_millis(1)),
        );

        // both deliveries claim the report before either finishes
        let (first, second) = tokio::join!(task.run(item), task.run(item.redelivered()));
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, TaskOutcome::Superseded));

        assert_eq!(
            outcomes,
            vec![
                TaskOutcome::Finished(ReportOutcome::Succeeded),
                TaskOutcome::Superseded
            ]
        );
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);

        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.counters.completed, 1);
        assert_eq!(stored.counters.failed, 0);
        assert_eq!(stored.status, crate::aggregator::BatchStatus::Completed);
    }
}
