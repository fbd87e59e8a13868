//! Time-based garbage collection of jobs and source PDFs.
//!
//! A single background task wakes every ten minutes and sweeps terminal
//! jobs: past `job_ttl_hours` after completion the whole job directory and
//! registry entry go; past `pdf_ttl_hours` only the uploaded PDF goes.
//! Uploads dominate disk usage, so they leave early while the job record
//! and EPUB stay downloadable for the full TTL.
//!
//! The sweep must be crash-proof: every per-job I/O error is logged and
//! swallowed so one stubborn directory cannot stall eviction for the rest.

use crate::config::Settings;
use crate::events::EventHub;
use crate::job::now_secs;
use crate::registry::JobRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Run the periodic cleanup until `shutdown` fires.
pub async fn cleanup_loop(
    settings: Arc<Settings>,
    registry: Arc<JobRegistry>,
    hub: Arc<EventHub>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await; // immediate first tick; nothing to do at startup
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Cleanup loop stopping");
                return;
            }
            _ = ticker.tick() => {
                sweep(&settings, &registry, &hub, now_secs()).await;
            }
        }
    }
}

/// One sweep over all terminal jobs at time `now` (epoch seconds).
///
/// Returns the number of jobs fully removed. Factored out of the loop so
/// tests can drive it with a synthetic clock.
pub async fn sweep(
    settings: &Settings,
    registry: &JobRegistry,
    hub: &EventHub,
    now: f64,
) -> usize {
    let job_ttl = settings.job_ttl_hours as f64 * 3600.0;
    let pdf_ttl = settings.pdf_ttl_hours as f64 * 3600.0;
    let mut removed = 0;

    for job in registry.terminal_older_than(now - job_ttl) {
        let job_dir = job.job_dir(registry.data_dir());
        if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {}: {e}", job_dir.display());
            }
        }
        registry.remove(&job.id);
        hub.remove(&job.id);
        info!("Cleaned up job {}", job.id);
        removed += 1;
    }

    // Whatever survived the sweep above but has outlived the shorter PDF
    // TTL loses only its upload.
    for job in registry.terminal_older_than(now - pdf_ttl) {
        let pdf_path = job.pdf_path(registry.data_dir());
        match tokio::fs::remove_file(&pdf_path).await {
            Ok(()) => info!("Evicted source PDF for job {}", job.id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not evict {}: {e}", pdf_path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobStatus};

    async fn terminal_job(
        registry: &JobRegistry,
        status: JobStatus,
        completed_at: f64,
    ) -> Job {
        let mut job = Job::new("fa", None, "book.pdf");
        job.status = status;
        job.completed_at = Some(completed_at);
        registry.create(job.clone()).await.unwrap();
        // Give it the on-disk artifacts cleanup cares about.
        let dir = job.job_dir(registry.data_dir());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(job.pdf_path(registry.data_dir()), b"%PDF-fake").unwrap();
        job
    }

    #[tokio::test]
    async fn expired_jobs_are_fully_removed() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let registry = JobRegistry::new(dir.path());
        let hub = EventHub::new(10);

        let now = 1_000_000.0;
        let old = terminal_job(&registry, JobStatus::Completed, now - 25.0 * 3600.0).await;
        let fresh = terminal_job(&registry, JobStatus::Failed, now - 60.0).await;

        let removed = sweep(&settings, &registry, &hub, now).await;
        assert_eq!(removed, 1);
        assert!(registry.snapshot(&old.id).is_none());
        assert!(!old.job_dir(registry.data_dir()).exists());
        assert!(registry.snapshot(&fresh.id).is_some());
        assert!(fresh.pdf_path(registry.data_dir()).exists());
    }

    #[tokio::test]
    async fn pdf_is_evicted_before_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let registry = JobRegistry::new(dir.path());
        let hub = EventHub::new(10);

        let now = 1_000_000.0;
        // Older than the 1 h PDF TTL, younger than the 24 h job TTL.
        let job = terminal_job(&registry, JobStatus::Completed, now - 2.0 * 3600.0).await;

        let removed = sweep(&settings, &registry, &hub, now).await;
        assert_eq!(removed, 0);
        assert!(!job.pdf_path(registry.data_dir()).exists());
        assert!(job.job_dir(registry.data_dir()).exists());
        assert!(registry.snapshot(&job.id).is_some());

        // A second sweep with the PDF already gone stays quiet.
        assert_eq!(sweep(&settings, &registry, &hub, now).await, 0);
    }

    #[tokio::test]
    async fn non_terminal_jobs_are_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let registry = JobRegistry::new(dir.path());
        let hub = EventHub::new(10);

        let mut job = Job::new("fa", None, "book.pdf");
        job.status = JobStatus::Processing;
        job.started_at = Some(0.0);
        registry.create(job.clone()).await.unwrap();
        std::fs::write(job.pdf_path(registry.data_dir()), b"%PDF-fake").unwrap();

        // Even an absurdly late sweep leaves a running job alone.
        assert_eq!(sweep(&settings, &registry, &hub, 1e12).await, 0);
        assert!(registry.snapshot(&job.id).is_some());
        assert!(job.pdf_path(registry.data_dir()).exists());
    }
}
