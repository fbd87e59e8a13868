//! Job and page data model.
//!
//! A [`Job`] is plain data: it carries the page map and timestamps, and every
//! counter the API reports (succeeded, failed, completed) is *derived* from
//! the page map on demand. Storing the counters separately would invite
//! drift between them and the pages they summarise; deriving them makes the
//! page map the single source of truth.
//!
//! Mutation discipline: while a pipeline runs, only the orchestrator task
//! mutates the job (through the registry). Everything else (the status
//! endpoint, SSE handlers, the cleanup loop) reads cloned snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lifecycle states of a job.
///
/// `pending → processing → assembling → completed | failed`; retry moves a
/// terminal job back to `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Assembling,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Per-page OCR states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

/// Outcome of one page. Exactly one exists per page from job creation on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based page index.
    pub page: usize,
    pub status: PageStatus,
    /// Extracted text; empty unless `status == Success`.
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PageResult {
    /// A fresh page awaiting processing.
    pub fn pending(page: usize) -> Self {
        Self {
            page,
            status: PageStatus::Pending,
            text: String::new(),
            error: None,
        }
    }
}

/// One user-submitted PDF and its conversion state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque short token (12 hex chars).
    pub id: String,
    pub status: JobStatus,
    pub total_pages: usize,
    /// Page index → result. BTreeMap keeps on-disk JSON and iteration in
    /// page order.
    #[serde(default)]
    pub pages: BTreeMap<usize, PageResult>,
    /// Language code: `fa`, `ar`, or `en`.
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_prompt: Option<String>,
    /// Unix-epoch seconds.
    pub created_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<f64>,
    /// Job-level error for `failed` jobs (not per-page errors).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Original upload filename; the EPUB title is derived from it.
    #[serde(default)]
    pub pdf_filename: String,
}

impl Job {
    /// Create a new pending job with a fresh 12-hex-char id.
    pub fn new(language: impl Into<String>, ocr_prompt: Option<String>, pdf_filename: impl Into<String>) -> Self {
        let id = Uuid::new_v4().simple().to_string()[..12].to_string();
        Self {
            id,
            status: JobStatus::Pending,
            total_pages: 0,
            pages: BTreeMap::new(),
            language: language.into(),
            ocr_prompt,
            created_at: now_secs(),
            started_at: None,
            completed_at: None,
            error: None,
            pdf_filename: pdf_filename.into(),
        }
    }

    // ── Derived counters ─────────────────────────────────────────────────

    pub fn pages_succeeded(&self) -> usize {
        self.pages
            .values()
            .filter(|p| p.status == PageStatus::Success)
            .count()
    }

    pub fn pages_failed(&self) -> usize {
        self.pages
            .values()
            .filter(|p| p.status == PageStatus::Failed)
            .count()
    }

    pub fn pages_completed(&self) -> usize {
        self.pages_succeeded() + self.pages_failed()
    }

    /// Failed page indices in ascending order.
    pub fn failed_page_numbers(&self) -> Vec<usize> {
        // BTreeMap iteration is already ascending by index.
        self.pages
            .values()
            .filter(|p| p.status == PageStatus::Failed)
            .map(|p| p.page)
            .collect()
    }

    // ── On-disk layout ───────────────────────────────────────────────────

    pub fn job_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join("jobs").join(&self.id)
    }

    pub fn pdf_path(&self, data_dir: &Path) -> PathBuf {
        self.job_dir(data_dir).join("input.pdf")
    }

    pub fn epub_path(&self, data_dir: &Path) -> PathBuf {
        self.job_dir(data_dir).join("output.epub")
    }

    pub fn page_text_path(&self, data_dir: &Path, page: usize) -> PathBuf {
        self.job_dir(data_dir)
            .join("pages")
            .join(format!("{page:05}.txt"))
    }

    /// EPUB title: upload filename with its extension stripped.
    pub fn title(&self) -> String {
        let name = if self.pdf_filename.is_empty() {
            "Converted Book"
        } else {
            &self.pdf_filename
        };
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => name.to_string(),
        }
    }
}

/// Current time as unix-epoch seconds.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_pages(statuses: &[PageStatus]) -> Job {
        let mut job = Job::new("fa", None, "book.pdf");
        job.total_pages = statuses.len();
        for (i, &status) in statuses.iter().enumerate() {
            job.pages.insert(
                i,
                PageResult {
                    page: i,
                    status,
                    text: String::new(),
                    error: None,
                },
            );
        }
        job
    }

    #[test]
    fn id_is_12_hex_chars() {
        let job = Job::new("en", None, "a.pdf");
        assert_eq!(job.id.len(), 12);
        assert!(job.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn counters_derive_from_page_map() {
        use PageStatus::*;
        let job = job_with_pages(&[Success, Failed, Success, Pending, Processing]);
        assert_eq!(job.pages_succeeded(), 2);
        assert_eq!(job.pages_failed(), 1);
        assert_eq!(job.pages_completed(), 3);
        assert!(job.pages_completed() <= job.total_pages);
    }

    #[test]
    fn failed_page_numbers_ascending() {
        use PageStatus::*;
        let job = job_with_pages(&[Failed, Success, Failed, Failed]);
        assert_eq!(job.failed_page_numbers(), vec![0, 2, 3]);
    }

    #[test]
    fn title_strips_extension() {
        let mut job = Job::new("fa", None, "shahnameh.scan.pdf");
        assert_eq!(job.title(), "shahnameh.scan");
        job.pdf_filename = String::new();
        assert_eq!(job.title(), "Converted Book");
    }

    #[test]
    fn page_text_path_is_zero_padded() {
        let job = Job::new("fa", None, "b.pdf");
        let p = job.page_text_path(Path::new("/data"), 7);
        assert!(p.ends_with(format!("jobs/{}/pages/00007.txt", job.id)));
    }

    #[test]
    fn serde_round_trip_is_structurally_equal() {
        use PageStatus::*;
        let mut job = job_with_pages(&[Success, Failed]);
        job.status = JobStatus::Completed;
        job.started_at = Some(1_700_000_000.0);
        job.completed_at = Some(1_700_000_100.0);
        job.pages.get_mut(&0).unwrap().text = "متن".to_string();
        job.pages.get_mut(&1).unwrap().error = Some("OCR failed".to_string());

        let json = serde_json::to_string_pretty(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.status, JobStatus::Completed);
        assert_eq!(back.pages.len(), 2);
        assert_eq!(back.pages[&0].text, "متن");
        assert_eq!(back.pages[&1].error.as_deref(), Some("OCR failed"));
        assert_eq!(back.failed_page_numbers(), vec![1]);
    }

    #[test]
    fn status_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Assembling).unwrap(),
            "\"assembling\""
        );
        assert_eq!(
            serde_json::to_string(&PageStatus::Success).unwrap(),
            "\"success\""
        );
    }
}
