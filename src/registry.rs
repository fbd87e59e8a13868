//! Durable in-memory job registry.
//!
//! Jobs live in a process-wide map and are persisted per job to
//! `jobs/<id>/job.json` after every mutation. Persistence is atomic
//! (write-to-tempfile + rename) so a crash mid-write leaves the previous
//! snapshot intact rather than a torn file.
//!
//! Locking layout:
//! * a registry-wide `RwLock` guards only the map itself,
//! * each job has its own mutation `Mutex` held for in-memory work only
//!   (the JSON write happens on a cloned snapshot after the lock is dropped),
//! * each job has a separate async run-lock that an orchestrator holds for
//!   the duration of its pipeline, enforcing a single orchestrator per job.

use crate::error::PipelineError;
use crate::job::{now_secs, Job, JobStatus, PageStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

struct JobSlot {
    job: Mutex<Job>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
}

/// In-memory map of jobs with per-job JSON persistence.
pub struct JobRegistry {
    data_dir: PathBuf,
    jobs: RwLock<HashMap<String, Arc<JobSlot>>>,
}

impl JobRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Register a new job, create its directory, and persist it.
    pub async fn create(&self, job: Job) -> Result<(), PipelineError> {
        let id = job.id.clone();
        let snapshot = job.clone();
        self.jobs.write().expect("registry lock poisoned").insert(
            id,
            Arc::new(JobSlot {
                job: Mutex::new(job),
                run_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        );
        self.persist(&snapshot).await
    }

    /// Consistent copy of a job, or `None` for an unknown id.
    pub fn snapshot(&self, job_id: &str) -> Option<Job> {
        let slot = self
            .jobs
            .read()
            .expect("registry lock poisoned")
            .get(job_id)
            .cloned()?;
        let job = slot.job.lock().expect("job lock poisoned");
        Some(job.clone())
    }

    /// Snapshots of every registered job.
    pub fn all_snapshots(&self) -> Vec<Job> {
        let slots: Vec<Arc<JobSlot>> = self
            .jobs
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .map(|s| s.job.lock().expect("job lock poisoned").clone())
            .collect()
    }

    /// Apply `mutate` under the job's lock, then persist the result.
    ///
    /// The lock covers only the in-memory mutation; the disk write happens
    /// on the cloned snapshot afterwards, so readers are never blocked on
    /// I/O. Returns the post-mutation snapshot.
    pub async fn update<F>(&self, job_id: &str, mutate: F) -> Result<Job, PipelineError>
    where
        F: FnOnce(&mut Job),
    {
        let slot = self
            .jobs
            .read()
            .expect("registry lock poisoned")
            .get(job_id)
            .cloned()
            .ok_or_else(|| PipelineError::Task(format!("Unknown job {job_id}")))?;

        let snapshot = {
            let mut job = slot.job.lock().expect("job lock poisoned");
            mutate(&mut job);
            job.clone()
        };
        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    /// Terminal jobs whose `completed_at` lies before `deadline`
    /// (epoch seconds). The cleanup loop's selection primitive.
    pub fn terminal_older_than(&self, deadline: f64) -> Vec<Job> {
        self.all_snapshots()
            .into_iter()
            .filter(|job| {
                job.status.is_terminal()
                    && job.completed_at.map_or(false, |t| t < deadline)
            })
            .collect()
    }

    /// Remove a job from the map. Files are the cleanup loop's business.
    pub fn remove(&self, job_id: &str) {
        self.jobs
            .write()
            .expect("registry lock poisoned")
            .remove(job_id);
    }

    /// Claim the job's pipeline run-lock, or `None` if a run is in flight.
    ///
    /// The returned guard must be held until the pipeline finishes.
    pub fn begin_run(&self, job_id: &str) -> Option<OwnedMutexGuard<()>> {
        let slot = self
            .jobs
            .read()
            .expect("registry lock poisoned")
            .get(job_id)
            .cloned()?;
        slot.run_lock.clone().try_lock_owned().ok()
    }

    /// Load every persisted job from disk at startup.
    ///
    /// Jobs found in a non-terminal state were interrupted by a crash or
    /// restart: the job is marked `failed` ("interrupted by restart") and
    /// every page that had not finished is marked `failed` ("interrupted"),
    /// so a later retry targets exactly the unfinished set. Successful
    /// pages keep their status; their text is on disk.
    pub async fn load_from_disk(&self) -> usize {
        let jobs_dir = self.data_dir.join("jobs");
        let mut entries = match tokio::fs::read_dir(&jobs_dir).await {
            Ok(e) => e,
            Err(_) => return 0,
        };

        let mut loaded = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let meta_path = entry.path().join("job.json");
            let raw = match tokio::fs::read_to_string(&meta_path).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let mut job: Job = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!("Skipping unreadable job file {}: {e}", meta_path.display());
                    continue;
                }
            };

            let interrupted = !job.status.is_terminal();
            if interrupted {
                job.status = JobStatus::Failed;
                job.error = Some("interrupted by restart".to_string());
                if job.completed_at.is_none() {
                    job.completed_at = Some(now_secs());
                }
                for page in job.pages.values_mut() {
                    if matches!(page.status, PageStatus::Processing | PageStatus::Pending) {
                        page.status = PageStatus::Failed;
                        page.text.clear();
                        page.error = Some("interrupted".to_string());
                    }
                }
            }

            info!(
                "Loaded job {} from disk (status {:?}{})",
                job.id,
                job.status,
                if interrupted { ", was interrupted" } else { "" }
            );

            let snapshot = job.clone();
            self.jobs.write().expect("registry lock poisoned").insert(
                job.id.clone(),
                Arc::new(JobSlot {
                    job: Mutex::new(job),
                    run_lock: Arc::new(tokio::sync::Mutex::new(())),
                }),
            );
            if interrupted {
                if let Err(e) = self.persist(&snapshot).await {
                    warn!("Could not persist interrupted job {}: {e}", snapshot.id);
                }
            }
            loaded += 1;
        }
        loaded
    }

    /// Write the snapshot to `jobs/<id>/job.json` atomically.
    async fn persist(&self, job: &Job) -> Result<(), PipelineError> {
        let job_dir = job.job_dir(&self.data_dir);
        let persist_err = |source| PipelineError::Persistence {
            job_id: job.id.clone(),
            source,
        };

        tokio::fs::create_dir_all(&job_dir).await.map_err(persist_err)?;

        let body = serde_json::to_vec_pretty(job).map_err(|e| PipelineError::Persistence {
            job_id: job.id.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        let final_path = job_dir.join("job.json");
        let tmp_path = job_dir.join("job.json.tmp");
        tokio::fs::write(&tmp_path, &body).await.map_err(persist_err)?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(persist_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::PageResult;

    fn sample_job(pages: usize) -> Job {
        let mut job = Job::new("fa", None, "book.pdf");
        job.total_pages = pages;
        for i in 0..pages {
            job.pages.insert(i, PageResult::pending(i));
        }
        job
    }

    #[tokio::test]
    async fn create_persist_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());

        let mut job = sample_job(2);
        job.status = JobStatus::Completed;
        job.completed_at = Some(now_secs());
        job.pages.get_mut(&0).unwrap().status = PageStatus::Success;
        job.pages.get_mut(&0).unwrap().text = "hello".into();
        job.pages.get_mut(&1).unwrap().status = PageStatus::Failed;
        let id = job.id.clone();
        registry.create(job).await.unwrap();

        let fresh = JobRegistry::new(dir.path());
        assert_eq!(fresh.load_from_disk().await, 1);
        let back = fresh.snapshot(&id).unwrap();
        assert_eq!(back.status, JobStatus::Completed);
        assert_eq!(back.pages[&0].text, "hello");
        assert_eq!(back.failed_page_numbers(), vec![1]);
    }

    #[tokio::test]
    async fn update_persists_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());
        let job = sample_job(1);
        let id = job.id.clone();
        registry.create(job).await.unwrap();

        let snapshot = registry
            .update(&id, |job| {
                job.status = JobStatus::Processing;
                job.started_at = Some(now_secs());
            })
            .await
            .unwrap();
        assert_eq!(snapshot.status, JobStatus::Processing);

        // The durable copy reflects the mutation, and no temp file remains.
        let raw = std::fs::read_to_string(
            dir.path().join("jobs").join(&id).join("job.json"),
        )
        .unwrap();
        assert!(raw.contains("\"processing\""));
        assert!(!dir.path().join("jobs").join(&id).join("job.json.tmp").exists());
    }

    #[tokio::test]
    async fn interrupted_jobs_are_failed_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());

        let mut job = sample_job(5);
        job.status = JobStatus::Processing;
        job.started_at = Some(now_secs());
        for i in 0..2 {
            let page = job.pages.get_mut(&i).unwrap();
            page.status = PageStatus::Success;
            page.text = format!("text {i}");
        }
        job.pages.get_mut(&2).unwrap().status = PageStatus::Processing;
        // Pages 3 and 4 stay pending.
        let id = job.id.clone();
        registry.create(job).await.unwrap();

        let fresh = JobRegistry::new(dir.path());
        fresh.load_from_disk().await;
        let back = fresh.snapshot(&id).unwrap();

        assert_eq!(back.status, JobStatus::Failed);
        assert_eq!(back.error.as_deref(), Some("interrupted by restart"));
        assert!(back.completed_at.is_some());
        assert_eq!(back.pages[&0].status, PageStatus::Success);
        assert_eq!(back.pages[&1].status, PageStatus::Success);
        for i in 2..5 {
            assert_eq!(back.pages[&i].status, PageStatus::Failed, "page {i}");
            assert_eq!(back.pages[&i].error.as_deref(), Some("interrupted"));
        }
        assert_eq!(back.failed_page_numbers(), vec![2, 3, 4]);

        // The rewrite is durable, not just in-memory.
        let raw = std::fs::read_to_string(
            dir.path().join("jobs").join(&id).join("job.json"),
        )
        .unwrap();
        assert!(raw.contains("interrupted by restart"));
    }

    #[tokio::test]
    async fn run_lock_is_exclusive_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());
        let job = sample_job(1);
        let id = job.id.clone();
        registry.create(job).await.unwrap();

        let guard = registry.begin_run(&id).expect("first claim succeeds");
        assert!(registry.begin_run(&id).is_none(), "second claim must fail");
        drop(guard);
        assert!(registry.begin_run(&id).is_some(), "released lock reclaims");
    }

    #[tokio::test]
    async fn unknown_job_update_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());
        assert!(registry.update("nope", |_| {}).await.is_err());
    }
}
