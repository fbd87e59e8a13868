//! Error types for the vision-epub service.
//!
//! Two distinct tiers reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal for the job**: the pipeline cannot produce
//!   an EPUB at all (unreadable PDF, output write failure, persistence
//!   failure). Marks the job `failed` and emits `job.failed`.
//!
//! * Per-page failures ([`RenderError::Page`], [`OcrError`]) — **Non-fatal**:
//!   a single page failed but the rest of the book is fine. They are absorbed
//!   into the page map as a `failed` status plus an error string, and the
//!   pipeline continues. A book with one garbled page still ships.
//!
//! Per-page errors never cross the page boundary; pipeline errors never
//! cross the job boundary; cleanup errors are logged and swallowed.

use std::path::PathBuf;
use thiserror::Error;

/// A fatal, job-level pipeline failure.
///
/// Page-level failures do not use this type; they are recorded on the
/// page itself and the pipeline keeps going.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source PDF could not be opened or read at all.
    #[error("Failed to open PDF '{path}': {detail}")]
    PdfOpen { path: PathBuf, detail: String },

    /// EPUB assembly failed (container write, template expansion).
    #[error("EPUB assembly failed: {0}")]
    Assembly(#[from] AssembleError),

    /// A job snapshot or page text could not be written durably.
    #[error("Persistence failed for job {job_id}: {source}")]
    Persistence {
        job_id: String,
        #[source]
        source: std::io::Error,
    },

    /// A spawned pipeline task panicked or was aborted.
    #[error("Pipeline task failed: {0}")]
    Task(String),
}

/// Errors from the page renderer.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The document itself is unusable; fatal for the job.
    #[error("Cannot open PDF '{path}': {detail}")]
    Open { path: PathBuf, detail: String },

    /// One page failed to rasterise; fatal only for that page.
    #[error("Rasterisation failed for page {index}: {detail}")]
    Page { index: usize, detail: String },
}

/// Errors from the OCR client.
///
/// `Exhausted` carries the last underlying cause so operators can tell a
/// flaky model apart from a dead one without digging through logs.
#[derive(Debug, Error)]
pub enum OcrError {
    /// All retry attempts failed; `last` is the final underlying cause.
    #[error("OCR failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// The endpoint rejected the request in a way retrying cannot fix
    /// (4xx other than 408/429, malformed response body).
    #[error("OCR request rejected: {0}")]
    Rejected(String),

    /// The surrounding job was cancelled between attempts.
    #[error("OCR cancelled")]
    Cancelled,
}

/// Errors from the EPUB assembler.
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("Failed to write EPUB container: {0}")]
    Container(String),

    #[error("Failed to write output file '{path}': {source}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<zip::result::ZipError> for AssembleError {
    fn from(e: zip::result::ZipError) -> Self {
        AssembleError::Container(e.to_string())
    }
}
