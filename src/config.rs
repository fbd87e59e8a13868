//! Service configuration, loaded from `VPPE_*` environment variables.
//!
//! Keeping every knob in one struct makes it trivial to share the config
//! across tasks, log it at startup, and diff two deployments to understand
//! why their behaviour differs. Every field has a documented default; unset
//! or unparsable variables silently fall back to it so a misspelled value
//! degrades to known-good behaviour instead of refusing to boot.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default prompt sent to the vision model alongside each page image.
///
/// Callers can override per job via the upload form's `ocr_prompt` field.
pub const DEFAULT_OCR_PROMPT: &str = "Extract all text from this scanned book page. \
     Preserve paragraph structure. Output only the extracted text, nothing else.";

/// All runtime settings for the service.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Base URL of the Ollama-compatible vision endpoint. Default: `http://localhost:11434`.
    pub ollama_base_url: String,

    /// Vision model name. Default: `qwen2.5-vl:7b`.
    pub ollama_model: String,

    /// Per-page OCR call timeout in seconds. Default: 120.
    ///
    /// Vision inference on a full book page routinely takes 30–60 s on
    /// consumer GPUs; 120 s leaves headroom without letting a wedged model
    /// stall a worker forever.
    pub ocr_timeout_secs: u64,

    /// Maximum OCR attempts per page. Default: 3.
    pub ocr_retries: u32,

    /// Rasterisation DPI. Default: 300.
    pub render_dpi: u32,

    /// JPEG quality (1–100) for rendered pages. Default: 85.
    pub jpeg_quality: u8,

    /// Cap on the longest rendered edge in pixels. Default: 1568.
    ///
    /// Page sizes vary wildly; a large-format page at 300 DPI could produce
    /// an image big enough to exhaust memory or blow the model's input
    /// budget. The cap bounds either dimension, scaling the other
    /// proportionally.
    pub max_image_dimension: u32,

    /// Number of concurrent OCR workers per job. Default: 2.
    pub ocr_workers: usize,

    /// Bounded render queue size. Default: 4.
    ///
    /// With two OCR workers and 30–60 s inference latency, four queued JPEGs
    /// keep the workers fed while preventing the much faster renderer from
    /// buffering a 500-page book in memory.
    pub render_queue_size: usize,

    /// Pages grouped into one EPUB chapter. Default: 20.
    pub pages_per_chapter: usize,

    /// Root directory for job state, uploads, and outputs. Default: `./data`.
    pub data_dir: PathBuf,

    /// Hours after completion before a terminal job is deleted. Default: 24.
    pub job_ttl_hours: u64,

    /// Hours after completion before the source PDF is evicted. Default: 1.
    ///
    /// Uploaded PDFs dominate disk usage, so they go early; the job record
    /// and EPUB stay around for the full job TTL. Retry after eviction
    /// fails with 410 Gone.
    pub pdf_ttl_hours: u64,

    /// Ring buffer capacity of each job's event bus. Default: 200.
    pub sse_ring_buffer_size: usize,

    /// Default OCR prompt when the upload does not supply one.
    pub default_ocr_prompt: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "qwen2.5-vl:7b".to_string(),
            ocr_timeout_secs: 120,
            ocr_retries: 3,
            render_dpi: 300,
            jpeg_quality: 85,
            max_image_dimension: 1568,
            ocr_workers: 2,
            render_queue_size: 4,
            pages_per_chapter: 20,
            data_dir: PathBuf::from("./data"),
            job_ttl_hours: 24,
            pdf_ttl_hours: 1,
            sse_ring_buffer_size: 200,
            default_ocr_prompt: DEFAULT_OCR_PROMPT.to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `VPPE_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Settings::default();
        Settings {
            ollama_base_url: env_string("VPPE_OLLAMA_BASE_URL", d.ollama_base_url),
            ollama_model: env_string("VPPE_OLLAMA_MODEL", d.ollama_model),
            ocr_timeout_secs: env_parse("VPPE_OCR_TIMEOUT", d.ocr_timeout_secs),
            ocr_retries: env_parse("VPPE_OCR_RETRIES", d.ocr_retries),
            render_dpi: env_parse("VPPE_RENDER_DPI", d.render_dpi),
            jpeg_quality: env_parse("VPPE_JPEG_QUALITY", d.jpeg_quality),
            max_image_dimension: env_parse("VPPE_MAX_IMAGE_DIMENSION", d.max_image_dimension),
            ocr_workers: env_parse("VPPE_OCR_WORKERS", d.ocr_workers).max(1),
            render_queue_size: env_parse("VPPE_RENDER_QUEUE_SIZE", d.render_queue_size).max(1),
            pages_per_chapter: env_parse("VPPE_PAGES_PER_CHAPTER", d.pages_per_chapter).max(1),
            data_dir: env_string("VPPE_DATA_DIR", "./data".to_string()).into(),
            job_ttl_hours: env_parse("VPPE_JOB_TTL_HOURS", d.job_ttl_hours),
            pdf_ttl_hours: env_parse("VPPE_PDF_TTL_HOURS", d.pdf_ttl_hours),
            sse_ring_buffer_size: env_parse("VPPE_SSE_RING_BUFFER_SIZE", d.sse_ring_buffer_size)
                .max(1),
            default_ocr_prompt: env_string("VPPE_DEFAULT_OCR_PROMPT", d.default_ocr_prompt),
        }
    }

    /// OCR call timeout as a [`Duration`].
    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }
}

fn env_string(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.ollama_base_url, "http://localhost:11434");
        assert_eq!(s.ocr_timeout_secs, 120);
        assert_eq!(s.ocr_retries, 3);
        assert_eq!(s.render_dpi, 300);
        assert_eq!(s.jpeg_quality, 85);
        assert_eq!(s.ocr_workers, 2);
        assert_eq!(s.render_queue_size, 4);
        assert_eq!(s.pages_per_chapter, 20);
        assert_eq!(s.job_ttl_hours, 24);
        assert_eq!(s.pdf_ttl_hours, 1);
        assert_eq!(s.sse_ring_buffer_size, 200);
        assert!(s.default_ocr_prompt.contains("scanned book page"));
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // A variable that is never set in any environment.
        assert_eq!(env_parse::<u32>("VPPE_TEST_UNSET_VARIABLE_XYZ", 42), 42);
        std::env::set_var("VPPE_TEST_GARBAGE_VARIABLE_XYZ", "not-a-number");
        assert_eq!(env_parse::<u32>("VPPE_TEST_GARBAGE_VARIABLE_XYZ", 7), 7);
        std::env::remove_var("VPPE_TEST_GARBAGE_VARIABLE_XYZ");
    }

    #[test]
    fn from_env_honours_overrides() {
        std::env::set_var("VPPE_OCR_WORKERS", "5");
        let s = Settings::from_env();
        assert_eq!(s.ocr_workers, 5);
        std::env::remove_var("VPPE_OCR_WORKERS");
    }
}
