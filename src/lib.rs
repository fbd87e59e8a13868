//! # vision-epub
//!
//! Convert scanned (image-based) PDFs into EPUB3 e-books using a vision
//! language model for OCR.
//!
//! Classic OCR engines stumble on degraded book scans: broken ligatures,
//! skewed lines, and Arabic-script shaping come out garbled. This service
//! rasterises each page and lets a vision LLM read it as a human would,
//! then assembles the recognised text into a chaptered EPUB with
//! language-appropriate (RTL/LTR) styling.
//!
//! ## Architecture
//!
//! ```text
//! upload ──▶ orchestrator ──▶ render ──▶ bounded queue ──▶ OCR workers
//!                │                                             │
//!                │              page text checkpoints ◀────────┤
//!                │              job.json persistence  ◀────────┤
//!                │              event bus (SSE fan-out) ◀──────┘
//!                └──▶ assemble ──▶ output.epub ──▶ download
//! ```
//!
//! Each job runs its own task group: one blocking producer thread
//! rasterising pages into a bounded queue, a small pool of OCR workers
//! draining it, and a coordinating task that owns all job mutation. Clients
//! follow progress over a per-job SSE stream with `Last-Event-ID` resume,
//! and can re-process just the failed pages afterwards.
//!
//! ## Quick start
//!
//! ```bash
//! VPPE_OLLAMA_BASE_URL=http://localhost:11434 vision-epub --bind 0.0.0.0:8000
//! curl -F file=@book.pdf -F language=fa http://localhost:8000/api/jobs
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cleanup;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod pipeline;
pub mod registry;
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{Settings, DEFAULT_OCR_PROMPT};
pub use error::{AssembleError, OcrError, PipelineError, RenderError};
pub use events::{EventBus, EventHub, EventRecord};
pub use job::{Job, JobStatus, PageResult, PageStatus};
pub use pipeline::ocr::{OcrClient, OllamaClient};
pub use pipeline::orchestrator::Pipeline;
pub use pipeline::render::{PageRenderer, PdfiumRenderer, RenderOptions, Rendered};
pub use registry::JobRegistry;
pub use server::{router, AppState};
