//! Per-job pipeline orchestration.
//!
//! One [`Pipeline::run`] call owns a job from `processing` to a terminal
//! state. The shape is a structured task group: a blocking producer thread
//! rasterises pages into a bounded queue, `ocr_workers` async workers drain
//! it, and the coordinating task awaits them all before assembling the EPUB.
//!
//! ## Back-pressure
//!
//! The queue holds `render_queue_size` JPEGs (default 4). Rasterisation is
//! far faster than 30–60 s vision inference, so without the bound a 500-page
//! book would sit fully rendered in memory; with it, at most a handful of
//! pages are in flight while the queue stays non-empty for the workers.
//!
//! ## End-of-stream
//!
//! The producer simply drops its sender when done; workers observe the
//! closed channel and exit. Channel closure replaces explicit sentinel
//! values; every worker sees it, exactly once each.
//!
//! ## Failure containment
//!
//! A page that fails to render or OCR is marked `failed` on the job and the
//! run continues; the job itself fails only when no page can be rendered at
//! all, the EPUB cannot be written, or persistence breaks.

use crate::config::Settings;
use crate::error::{PipelineError, RenderError};
use crate::events::EventBus;
use crate::job::{now_secs, Job, JobStatus, PageResult, PageStatus};
use crate::pipeline::assemble::{assemble_epub, BookMeta};
use crate::pipeline::ocr::OcrClient;
use crate::pipeline::render::{PageRenderer, Rendered, RenderOptions};
use crate::registry::JobRegistry;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Everything a pipeline run needs; shared by all jobs.
pub struct Pipeline {
    pub settings: Arc<Settings>,
    pub registry: Arc<JobRegistry>,
    pub renderer: Arc<dyn PageRenderer>,
    pub ocr: Arc<dyn OcrClient>,
    /// Process-level shutdown signal, consulted by the OCR client between
    /// retry attempts.
    pub cancel: CancellationToken,
}

impl Pipeline {
    /// Run the conversion pipeline for one job to a terminal state.
    ///
    /// `pages_to_process` restricts the run to a subset of pages (retry);
    /// `None` processes the whole document. `_run` is the job's exclusive
    /// run-lock, held until the pipeline finishes. The event bus is closed
    /// on the way out, success or failure.
    pub async fn run(
        self: Arc<Self>,
        job_id: String,
        bus: Arc<EventBus>,
        pages_to_process: Option<BTreeSet<usize>>,
        _run: OwnedMutexGuard<()>,
    ) {
        if let Err(e) = Arc::clone(&self)
            .execute(&job_id, &bus, pages_to_process)
            .await
        {
            error!("Pipeline failed for job {job_id}: {e}");
            let message = e.to_string();
            let marked = self
                .registry
                .update(&job_id, |job| {
                    job.status = JobStatus::Failed;
                    job.error = Some(message.clone());
                    job.completed_at = Some(now_secs());
                })
                .await;
            if let Err(persist_err) = marked {
                error!("Could not mark job {job_id} failed: {persist_err}");
            }
            let _ = bus.emit("job.failed", json!({ "error": message }));
        }
        bus.close();
    }

    async fn execute(
        self: Arc<Self>,
        job_id: &str,
        bus: &Arc<EventBus>,
        pages_to_process: Option<BTreeSet<usize>>,
    ) -> Result<(), PipelineError> {
        let job = self
            .registry
            .update(job_id, |job| {
                job.status = JobStatus::Processing;
                job.started_at = Some(now_secs());
                job.completed_at = None;
                job.error = None;
            })
            .await?;

        let _ = bus.emit(
            "job.started",
            json!({
                "job_id": job.id,
                "total_pages": job.total_pages,
                "status": "processing",
            }),
        );

        let data_dir = self.registry.data_dir().to_path_buf();
        let total = job.total_pages;
        let prompt = Arc::new(
            job.ocr_prompt
                .clone()
                .unwrap_or_else(|| self.settings.default_ocr_prompt.clone()),
        );

        let indices: Vec<usize> = match &pages_to_process {
            Some(subset) => subset.iter().copied().filter(|i| *i < total).collect(),
            None => (0..total).collect(),
        };
        info!(
            "Job {}: processing {} of {} pages with {} workers",
            job.id,
            indices.len(),
            total,
            self.settings.ocr_workers
        );

        // ── Producer: blocking render thread feeding the bounded queue ──
        let (tx, rx) = mpsc::channel::<Rendered>(self.settings.render_queue_size);
        let renderer = Arc::clone(&self.renderer);
        let pdf_path = job.pdf_path(&data_dir);
        let opts = RenderOptions {
            dpi: self.settings.render_dpi,
            jpeg_quality: self.settings.jpeg_quality,
            max_dimension: self.settings.max_image_dimension,
        };
        let producer = tokio::task::spawn_blocking({
            let pdf_path = pdf_path.clone();
            move || {
                renderer.render_pages(&pdf_path, &indices, &opts, &mut |item| {
                    // blocking_send provides the back-pressure; it fails only
                    // when every worker is gone, which ends the render early.
                    tx.blocking_send(item).is_ok()
                })
            }
        });

        // ── Workers ──────────────────────────────────────────────────────
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let semaphore = Arc::new(Semaphore::new(self.settings.ocr_workers));
        let mut workers = Vec::with_capacity(self.settings.ocr_workers);
        for _ in 0..self.settings.ocr_workers {
            workers.push(tokio::spawn(Arc::clone(&self).worker_loop(
                job.clone(),
                Arc::clone(bus),
                Arc::clone(&rx),
                Arc::clone(&semaphore),
                Arc::clone(&prompt),
            )));
        }
        // Workers hold the only receiver handles now; when they exit, the
        // producer's sends fail instead of blocking forever.
        drop(rx);

        let mut first_err: Option<PipelineError> = None;
        for handle in workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = first_err.get_or_insert(e);
                }
                Err(join) => {
                    let _ = first_err
                        .get_or_insert(PipelineError::Task(format!("Worker panicked: {join}")));
                }
            }
        }
        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(RenderError::Open { path, detail })) => {
                let _ = first_err.get_or_insert(PipelineError::PdfOpen { path, detail });
            }
            Ok(Err(e)) => {
                let _ = first_err.get_or_insert(PipelineError::Task(e.to_string()));
            }
            Err(join) => {
                let _ = first_err
                    .get_or_insert(PipelineError::Task(format!("Render task panicked: {join}")));
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        // ── Assembly ─────────────────────────────────────────────────────
        let snapshot = self
            .registry
            .update(job_id, |job| {
                job.status = JobStatus::Assembling;
            })
            .await?;
        let _ = bus.emit(
            "job.assembling",
            json!({
                "pages_succeeded": snapshot.pages_succeeded(),
                "pages_failed": snapshot.pages_failed(),
            }),
        );

        let texts = self.collect_page_texts(&snapshot, &data_dir).await;
        let meta = BookMeta {
            title: snapshot.title(),
            language: snapshot.language.clone(),
            identifier: snapshot.id.clone(),
        };
        let epub_path = snapshot.epub_path(&data_dir);
        let pages_per_chapter = self.settings.pages_per_chapter;
        tokio::task::spawn_blocking({
            let epub_path = epub_path.clone();
            move || assemble_epub(&texts, &meta, pages_per_chapter, &epub_path)
        })
        .await
        .map_err(|join| PipelineError::Task(format!("Assembly task panicked: {join}")))??;

        // ── Completion ───────────────────────────────────────────────────
        let done = self
            .registry
            .update(job_id, |job| {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now_secs());
            })
            .await?;

        let duration = done.completed_at.unwrap_or_else(now_secs)
            - done.started_at.unwrap_or(done.created_at);
        let _ = bus.emit(
            "job.completed",
            json!({
                "download_url": format!("/api/jobs/{}/result", done.id),
                "duration_seconds": (duration * 10.0).round() / 10.0,
                "pages_succeeded": done.pages_succeeded(),
                "failed_pages": done.failed_page_numbers(),
            }),
        );
        info!(
            "Job {} completed: {}/{} pages in {:.1}s",
            done.id,
            done.pages_succeeded(),
            done.total_pages,
            duration
        );
        Ok(())
    }

    /// One worker: drain the render queue until it closes.
    async fn worker_loop(
        self: Arc<Self>,
        job: Job,
        bus: Arc<EventBus>,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Rendered>>>,
        semaphore: Arc<Semaphore>,
        prompt: Arc<String>,
    ) -> Result<(), PipelineError> {
        loop {
            // Hold the queue lock only for the take, not while OCRing.
            let item = { rx.lock().await.recv().await };
            let Some(item) = item else { break };

            let Ok(_permit) = semaphore.acquire().await else {
                break;
            };

            match item {
                Rendered::Page { index, jpeg } => {
                    self.registry
                        .update(&job.id, |job| {
                            job.pages.insert(
                                index,
                                PageResult {
                                    page: index,
                                    status: PageStatus::Processing,
                                    text: String::new(),
                                    error: None,
                                },
                            );
                        })
                        .await?;

                    match self.ocr.ocr_page(&jpeg, &prompt, &self.cancel).await {
                        Ok(text) => {
                            self.checkpoint_page(&job, index, &text).await?;
                            self.registry
                                .update(&job.id, |job| {
                                    job.pages.insert(
                                        index,
                                        PageResult {
                                            page: index,
                                            status: PageStatus::Success,
                                            text: text.clone(),
                                            error: None,
                                        },
                                    );
                                })
                                .await?;
                            let preview: String = text.chars().take(200).collect();
                            let _ = bus.emit(
                                "page.completed",
                                json!({
                                    "page": index,
                                    "total_pages": job.total_pages,
                                    "status": "success",
                                    "text_preview": preview,
                                }),
                            );
                        }
                        Err(e) => {
                            self.fail_page(&job, &bus, index, e.to_string()).await?;
                        }
                    }
                }
                Rendered::Failed { index, error } => {
                    self.fail_page(&job, &bus, index, error.to_string()).await?;
                }
            }
        }
        Ok(())
    }

    /// Write the recognised text to `pages/NNNNN.txt`.
    ///
    /// The checkpoint is what survives a crash and what assembly reads;
    /// losing it would silently drop a page, so failure here is a
    /// persistence error, not a page error.
    async fn checkpoint_page(
        &self,
        job: &Job,
        index: usize,
        text: &str,
    ) -> Result<(), PipelineError> {
        let path = job.page_text_path(self.registry.data_dir(), index);
        let persist_err = |source| PipelineError::Persistence {
            job_id: job.id.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
        }
        tokio::fs::write(&path, text).await.map_err(persist_err)
    }

    async fn fail_page(
        &self,
        job: &Job,
        bus: &EventBus,
        index: usize,
        error: String,
    ) -> Result<(), PipelineError> {
        tracing::warn!("Job {}: page {index} failed: {error}", job.id);
        self.registry
            .update(&job.id, |job| {
                job.pages.insert(
                    index,
                    PageResult {
                        page: index,
                        status: PageStatus::Failed,
                        text: String::new(),
                        error: Some(error.clone()),
                    },
                );
            })
            .await?;
        let _ = bus.emit(
            "page.completed",
            json!({
                "page": index,
                "total_pages": job.total_pages,
                "status": "failed",
                "error": error,
            }),
        );
        Ok(())
    }

    /// Ordered page texts for assembly: the on-disk checkpoint for
    /// successful pages, empty strings for everything else.
    async fn collect_page_texts(&self, job: &Job, data_dir: &std::path::Path) -> Vec<String> {
        let mut texts = Vec::with_capacity(job.total_pages);
        for index in 0..job.total_pages {
            let successful = job
                .pages
                .get(&index)
                .map(|p| p.status == PageStatus::Success)
                .unwrap_or(false);
            if !successful {
                texts.push(String::new());
                continue;
            }
            match tokio::fs::read_to_string(job.page_text_path(data_dir, index)).await {
                Ok(text) => texts.push(text),
                // Checkpoint missing: fall back to the in-memory copy.
                Err(_) => texts.push(job.pages[&index].text.clone()),
            }
        }
        texts
    }
}
