//! HTTP/SSE facade over the pipeline, registry, and event hub.
//!
//! A thin translation layer: handlers validate, snapshot, and spawn; all
//! job mutation beyond upload/retry bookkeeping happens in the orchestrator.
//!
//! | Method | Path                    | Purpose                       |
//! |--------|-------------------------|-------------------------------|
//! | POST   | `/api/jobs`             | upload a PDF, start pipeline  |
//! | GET    | `/api/jobs/:id`         | full job snapshot             |
//! | GET    | `/api/jobs/:id/events`  | SSE progress stream           |
//! | GET    | `/api/jobs/:id/result`  | download the EPUB             |
//! | POST   | `/api/jobs/:id/retry`   | reprocess failed pages        |

use crate::events::{EventHub, EventRecord};
use crate::job::{Job, JobStatus, PageResult, PageStatus};
use crate::pipeline::orchestrator::Pipeline;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Uploads are whole scanned books; 200 MB covers even long ones at 300 DPI.
const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

/// Silence threshold before an SSE keepalive ping.
const SSE_KEEPALIVE: Duration = Duration::from_secs(30);

/// Shared handler state: the pipeline dependencies plus the event hub.
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub hub: Arc<EventHub>,
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/:job_id", get(get_job))
        .route("/api/jobs/:job_id/events", get(job_events))
        .route("/api/jobs/:job_id/result", get(download_result))
        .route("/api/jobs/:job_id/retry", post(retry_failed_pages))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

// ── Error mapping ────────────────────────────────────────────────────────

/// API-facing error kinds, mapped onto HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Gone(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (ApiError::BadRequest(detail)
        | ApiError::NotFound(detail)
        | ApiError::Conflict(detail)
        | ApiError::Gone(detail)
        | ApiError::Internal(detail)) = &self;
        (self.status(), Json(json!({ "detail": detail }))).into_response()
    }
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(e.to_string())
}

fn job_not_found() -> ApiError {
    ApiError::NotFound("Job not found".to_string())
}

// ── Upload ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateJobResponse {
    job_id: String,
    total_pages: usize,
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<CreateJobResponse>, ApiError> {
    let mut file: Option<(String, axum::body::Bytes)> = None;
    let mut language = "fa".to_string();
    let mut ocr_prompt: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload.pdf").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Could not read upload: {e}")))?;
                file = Some((filename, bytes));
            }
            "language" => {
                language = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Invalid language field: {e}")))?;
            }
            "ocr_prompt" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Invalid ocr_prompt field: {e}")))?;
                if !text.trim().is_empty() {
                    ocr_prompt = Some(text);
                }
            }
            _ => {}
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("Missing 'file' field".to_string()))?;
    if !filename.to_lowercase().ends_with(".pdf") {
        return Err(ApiError::BadRequest("File must be a PDF".to_string()));
    }
    if !bytes.starts_with(b"%PDF") {
        return Err(ApiError::BadRequest(
            "File must be a PDF (bad magic bytes)".to_string(),
        ));
    }
    if !matches!(language.as_str(), "fa" | "ar" | "en") {
        return Err(ApiError::BadRequest(
            "language must be one of: fa, ar, en".to_string(),
        ));
    }

    let registry = Arc::clone(&state.pipeline.registry);
    let job = Job::new(language, ocr_prompt, filename);
    let job_id = job.id.clone();
    registry.create(job.clone()).await.map_err(internal)?;

    let pdf_path = job.pdf_path(registry.data_dir());
    tokio::fs::write(&pdf_path, &bytes).await.map_err(internal)?;

    // Page counting opens the PDF; blocking work, off the async runtime.
    let renderer = Arc::clone(&state.pipeline.renderer);
    let count_path = pdf_path.clone();
    let counted = tokio::task::spawn_blocking(move || renderer.page_count(&count_path)).await;
    let total_pages = match counted {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            discard_job(&registry, &job).await;
            return Err(ApiError::BadRequest(format!("Could not read PDF: {e}")));
        }
        Err(join) => {
            discard_job(&registry, &job).await;
            return Err(internal(format!("Page counting failed: {join}")));
        }
    };

    registry
        .update(&job_id, |job| {
            job.total_pages = total_pages;
            for i in 0..total_pages {
                job.pages.insert(i, PageResult::pending(i));
            }
        })
        .await
        .map_err(internal)?;

    let bus = state.hub.get_or_create(&job_id);
    let run_guard = registry
        .begin_run(&job_id)
        .ok_or_else(|| ApiError::Conflict("Job is already running".to_string()))?;
    tokio::spawn(Arc::clone(&state.pipeline).run(job_id.clone(), bus, None, run_guard));

    info!("Job {job_id} created: {total_pages} pages");
    Ok(Json(CreateJobResponse { job_id, total_pages }))
}

/// Roll back a job whose upload turned out to be unusable.
async fn discard_job(registry: &crate::registry::JobRegistry, job: &Job) {
    registry.remove(&job.id);
    let _ = tokio::fs::remove_dir_all(job.job_dir(registry.data_dir())).await;
}

// ── Status ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PageView {
    status: PageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct JobView {
    id: String,
    status: JobStatus,
    total_pages: usize,
    pages_succeeded: usize,
    pages_failed: usize,
    pages_completed: usize,
    failed_pages: Vec<usize>,
    pages: BTreeMap<usize, PageView>,
    pdf_filename: String,
    language: String,
    created_at: f64,
    started_at: Option<f64>,
    completed_at: Option<f64>,
    error: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        JobView {
            pages_succeeded: job.pages_succeeded(),
            pages_failed: job.pages_failed(),
            pages_completed: job.pages_completed(),
            failed_pages: job.failed_page_numbers(),
            pages: job
                .pages
                .iter()
                .map(|(&i, p)| {
                    (
                        i,
                        PageView {
                            status: p.status,
                            error: p.error.clone(),
                        },
                    )
                })
                .collect(),
            id: job.id,
            status: job.status,
            total_pages: job.total_pages,
            pdf_filename: job.pdf_filename,
            language: job.language,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error,
        }
    }
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = state
        .pipeline
        .registry
        .snapshot(&job_id)
        .ok_or_else(job_not_found)?;
    Ok(Json(job.into()))
}

// ── SSE stream ───────────────────────────────────────────────────────────

fn sse_event(record: &EventRecord) -> Event {
    Event::default()
        .id(record.id.to_string())
        .event(record.name.clone())
        .data(record.data.to_string())
}

fn parse_last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

async fn job_events(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state
        .pipeline
        .registry
        .snapshot(&job_id)
        .ok_or_else(job_not_found)?;

    let bus = state.hub.get_or_create(&job_id);
    // A terminal job with an event-less bus has no pipeline that will ever
    // close it (typically a job restored from disk after a restart); close
    // it here so late subscribers get a clean end-of-stream instead of an
    // idle connection. The `last_id == 0` guard keeps this away from a bus
    // a finishing or retrying pipeline is still emitting on: status is
    // re-read after the bus handle is taken, and retry flips the job to
    // `processing` before swapping its bus in.
    let current = state
        .pipeline
        .registry
        .snapshot(&job_id)
        .ok_or_else(job_not_found)?;
    if current.status.is_terminal() && bus.last_id() == 0 {
        bus.close();
    }

    let (replay, mut live) = bus.subscribe(parse_last_event_id(&headers));
    let stream = async_stream::stream! {
        for record in &replay {
            yield Ok::<Event, Infallible>(sse_event(record));
        }
        loop {
            match tokio::time::timeout(SSE_KEEPALIVE, live.recv()).await {
                Ok(Some(record)) => yield Ok(sse_event(&record)),
                Ok(None) => break,
                Err(_) => yield Ok(Event::default().event("ping").data("")),
            }
        }
    };
    Ok(Sse::new(stream))
}

// ── Download ─────────────────────────────────────────────────────────────

async fn download_result(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let registry = &state.pipeline.registry;
    let job = registry.snapshot(&job_id).ok_or_else(job_not_found)?;
    if job.status != JobStatus::Completed {
        return Err(ApiError::BadRequest("Job not completed yet".to_string()));
    }

    let epub_path = job.epub_path(registry.data_dir());
    let bytes = tokio::fs::read(&epub_path)
        .await
        .map_err(|_| ApiError::NotFound("EPUB file not found".to_string()))?;

    let filename = format!("{}.epub", job.title());
    Ok((
        [
            (header::CONTENT_TYPE, "application/epub+zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

// ── Retry ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RetryResponse {
    job_id: String,
    retrying_pages: Vec<usize>,
}

async fn retry_failed_pages(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    let registry = Arc::clone(&state.pipeline.registry);
    let job = registry.snapshot(&job_id).ok_or_else(job_not_found)?;
    if !job.status.is_terminal() {
        return Err(ApiError::Conflict("Job is still processing".to_string()));
    }

    let pdf_path = job.pdf_path(registry.data_dir());
    if !tokio::fs::try_exists(&pdf_path).await.unwrap_or(false) {
        return Err(ApiError::Gone(
            "Source PDF has been cleaned up".to_string(),
        ));
    }

    let run_guard = registry
        .begin_run(&job_id)
        .ok_or_else(|| ApiError::Conflict("Job is already running".to_string()))?;

    let failed = job.failed_page_numbers();

    // The EPUB exists iff the job is completed; it is about to stop being so.
    let _ = tokio::fs::remove_file(job.epub_path(registry.data_dir())).await;

    registry
        .update(&job_id, |job| {
            for &index in &failed {
                job.pages.insert(index, PageResult::pending(index));
            }
            job.status = JobStatus::Processing;
            // completed_at is non-null iff the job is terminal; it stops
            // being terminal right here.
            job.completed_at = None;
            job.error = None;
        })
        .await
        .map_err(internal)?;

    // Fresh bus: the old one is closed and discarded; reconnecting clients
    // see only the new run's events.
    let bus = state.hub.replace(&job_id);
    let pages: BTreeSet<usize> = failed.iter().copied().collect();
    tokio::spawn(Arc::clone(&state.pipeline).run(job_id.clone(), bus, Some(pages), run_guard));

    info!("Job {job_id}: retrying {} pages", failed.len());
    Ok(Json(RetryResponse {
        job_id,
        retrying_pages: failed,
    }))
}
