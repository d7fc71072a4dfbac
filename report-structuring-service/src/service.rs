use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::Json,
    routing::{get, post},
};
use report_flow::{
    ChannelTaskQueue, FlowError, HttpExtractor, InMemoryReportStore, NewTemplate, PoolSummary,
    PostgresReportStore, ReportStore, ReportTask, ReportText, SubmissionService, Template,
    ValidationError, WorkerPool, parse_report_upload, query, templates_from_yaml,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    models::{BatchUpload, Pagination, UploadedFile},
};

type ApiResult<T> = Result<Json<T>, ApiError>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &Uuid) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "id": id
        })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

fn flow_error(e: FlowError) -> ApiError {
    match e {
        FlowError::Validation(ValidationError::UnknownTemplate(id)) => {
            not_found_error("Template not found", &id)
        }
        FlowError::Validation(v) => bad_request_error(&v.to_string()),
        FlowError::NotFound { entity, id } => {
            not_found_error(&format!("{} not found", capitalize(entity)), &id)
        }
        other => {
            error!(error = %other, "Request failed");
            internal_error("Internal error", &other.to_string())
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReportStore>,
    pub submission: SubmissionService,
}

/// Build the router and start the worker pool that drains the task queue.
pub async fn create_app(config: &AppConfig) -> anyhow::Result<(Router, JoinHandle<PoolSummary>)> {
    let store = create_store(config).await?;
    if let Some(path) = &config.templates_path {
        seed_templates(store.as_ref(), path).await?;
    }

    let (queue, receiver) = ChannelTaskQueue::new();
    let task = ReportTask::new(
        store.clone(),
        Arc::new(HttpExtractor::new()),
        config.provider.clone(),
        config.retry,
    );
    let workers = WorkerPool::new(task, config.workers).spawn(receiver);

    let state = AppState {
        submission: SubmissionService::new(store.clone(), Arc::new(queue)),
        store,
    };
    state.submission.requeue_unfinished().await?;

    Ok((build_router(state, config.max_upload_size), workers))
}

async fn create_store(config: &AppConfig) -> anyhow::Result<Arc<dyn ReportStore>> {
    match &config.database_url {
        Some(database_url) => {
            info!("Using PostgreSQL report store");
            let store = PostgresReportStore::connect(database_url).await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory report store");
            Ok(Arc::new(InMemoryReportStore::new()))
        }
    }
}

async fn seed_templates(store: &dyn ReportStore, path: &std::path::Path) -> anyhow::Result<()> {
    let source = tokio::fs::read_to_string(path).await?;
    let existing: Vec<String> = store
        .list_templates()
        .await?
        .into_iter()
        .map(|t| t.name)
        .collect();

    for draft in templates_from_yaml(&source)? {
        if existing.iter().any(|name| name == draft.name.trim()) {
            continue;
        }
        let template = Template::create(draft)?;
        info!(template_id = %template.id, name = %template.name, "Seeding template");
        store.save_template(template).await?;
    }
    Ok(())
}

pub fn build_router(app_state: AppState, max_upload_size: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/templates", post(create_template).get(list_templates))
        .route("/templates/{template_id}", get(get_template))
        .route("/reports/batches", post(create_batch).get(list_batches))
        .route("/reports/batches/{batch_id}", get(get_batch))
        .route("/reports/batches/{batch_id}/reports", get(get_batch_reports))
        .route("/reports/{report_id}", get(get_report))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(from_fn(correlation_id_middleware))
                .layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .with_state(app_state)
}

/// Tag each request with a correlation id, reusing the caller's when present
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = request
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value);
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Radiology Report Structuring Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Batch structuring of free-text radiology reports with LLM extraction",
        "endpoints": {
            "POST /templates": "Create a template",
            "GET /templates": "List templates",
            "GET /templates/{template_id}": "Get a template",
            "POST /reports/batches": "Upload JSON files of report texts as a new batch",
            "GET /reports/batches": "List batches",
            "GET /reports/batches/{batch_id}": "Batch status and counters",
            "GET /reports/batches/{batch_id}/reports": "Reports in a batch",
            "GET /reports/{report_id}": "A single structured report",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn create_template(
    State(state): State<AppState>,
    Json(request): Json<NewTemplate>,
) -> Result<(StatusCode, Json<Template>), ApiError> {
    let template = Template::create(request).map_err(|e| bad_request_error(&e.to_string()))?;
    state
        .store
        .save_template(template.clone())
        .await
        .map_err(flow_error)?;

    info!(template_id = %template.id, name = %template.name, "Template created");
    Ok((StatusCode::CREATED, Json(template)))
}

async fn list_templates(State(state): State<AppState>) -> ApiResult<Vec<Template>> {
    state.store.list_templates().await.map(Json).map_err(flow_error)
}

async fn get_template(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
) -> ApiResult<Template> {
    match state.store.get_template(template_id).await {
        Ok(Some(template)) => Ok(Json(template)),
        Ok(None) => Err(not_found_error("Template not found", &template_id)),
        Err(e) => Err(flow_error(e)),
    }
}

async fn create_batch(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<query::BatchStatusView>), ApiError> {
    let upload = read_batch_upload(multipart).await?;

    let name = upload
        .name
        .ok_or_else(|| bad_request_error("Field 'name' is required"))?;
    let template_id = upload
        .template_id
        .ok_or_else(|| bad_request_error("Field 'template_id' is required"))?;
    let template_id = Uuid::parse_str(template_id.trim())
        .map_err(|_| bad_request_error("Field 'template_id' must be a UUID"))?;
    if upload.files.is_empty() {
        return Err(bad_request_error("At least one file is required"));
    }

    let mut reports: Vec<ReportText> = Vec::new();
    for file in &upload.files {
        let parsed = parse_report_upload(&file.filename, &file.content)
            .map_err(|e| bad_request_error(&e.to_string()))?;
        reports.extend(parsed);
    }

    info!(
        name = %name,
        template_id = %template_id,
        files = upload.files.len(),
        reports = reports.len(),
        "Creating report batch"
    );

    let batch = state
        .submission
        .submit_batch(&name, template_id, reports)
        .await
        .map_err(flow_error)?;

    Ok((StatusCode::CREATED, Json(batch.into())))
}

async fn read_batch_upload(mut multipart: Multipart) -> Result<BatchUpload, ApiError> {
    let mut upload = BatchUpload::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request_error(&format!("Invalid multipart body: {}", e)))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "name" => upload.name = Some(field_text(field).await?),
            "template_id" => upload.template_id = Some(field_text(field).await?),
            "files" | "file" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request_error(&format!("Failed to read {}: {}", filename, e)))?;
                upload.files.push(UploadedFile {
                    filename,
                    content: content.to_vec(),
                });
            }
            other => warn!(field = %other, "Ignoring unknown multipart field"),
        }
    }

    Ok(upload)
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| bad_request_error(&format!("Invalid form field: {}", e)))
}

async fn list_batches(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> ApiResult<Vec<query::BatchStatusView>> {
    query::list_batches(state.store.as_ref(), page.skip, page.limit)
        .await
        .map(Json)
        .map_err(flow_error)
}

async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<query::BatchStatusView> {
    query::get_batch_status(state.store.as_ref(), batch_id)
        .await
        .map(Json)
        .map_err(flow_error)
}

async fn get_batch_reports(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Vec<query::ReportView>> {
    query::list_batch_reports(state.store.as_ref(), batch_id)
        .await
        .map(Json)
        .map_err(flow_error)
}

async fn get_report(
    State(state): State<AppState>,
    Path(report_id): Path<Uuid>,
) -> ApiResult<query::ReportView> {
    query::get_report(state.store.as_ref(), report_id)
        .await
        .map(Json)
        .map_err(flow_error)
}
