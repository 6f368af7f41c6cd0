//! Persistence of jobs and finished reports.
//!
//! The file-backed stores keep one JSON document per record under the data
//! directory. Every write goes to a temporary sibling first and is then
//! renamed over the target, so readers never observe a half-written record.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DossierError;
use crate::state_machine::{Job, JobStatus};

/// Message recorded on jobs found mid-flight at startup.
pub const INTERRUPTED_MESSAGE: &str = "Interrupted before completion";

/// Destination of finished reports.
pub trait ReportStore {
    /// Stores a report and returns its id.
    fn create_report(&self, job_id: &str, content: &Value, metadata: &Value) -> Result<String>;
}

/// Job records, written at every phase boundary.
pub trait JobStore {
    fn save(&self, job: &Job) -> Result<()>;
    fn load(&self, id: &str) -> Result<Job>;
    /// All jobs, most recently created first.
    fn list(&self) -> Result<Vec<Job>>;
    /// Marks jobs still `Processing` as `Failed` and returns their ids.
    fn recover_interrupted(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredReport {
    pub report_id: String,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub content: Value,
    pub metadata: Value,
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

#[derive(Debug, Clone)]
pub struct FileReportStore {
    dir: PathBuf,
}

impl FileReportStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("reports"),
        }
    }

    pub fn load(&self, report_id: &str) -> Result<StoredReport> {
        let path = self.dir.join(format!("{report_id}.json"));
        let contents = fs::read_to_string(&path)
            .map_err(|_| DossierError::Storage(format!("report {report_id} not found")))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl ReportStore for FileReportStore {
    fn create_report(&self, job_id: &str, content: &Value, metadata: &Value) -> Result<String> {
        ensure_dir(&self.dir)?;
        let report = StoredReport {
            report_id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            created_at: Utc::now(),
            content: content.clone(),
            metadata: metadata.clone(),
        };
        let path = self.dir.join(format!("{}.json", report.report_id));
        write_atomic(&path, &serde_json::to_vec_pretty(&report)?)?;
        info!(report_id = %report.report_id, job_id, path = %path.display(), "report stored");
        Ok(report.report_id)
    }
}

#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("jobs"),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl JobStore for FileJobStore {
    fn save(&self, job: &Job) -> Result<()> {
        ensure_dir(&self.dir)?;
        write_atomic(&self.path(&job.id), &serde_json::to_vec_pretty(job)?)?;
        debug!(job_id = %job.id, status = %job.status, progress = job.progress, "job saved");
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Job> {
        let path = self.path(id);
        if !path.exists() {
            return Err(DossierError::JobNotFound(id.to_string()).into());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let job = serde_json::from_str(&contents)
            .with_context(|| format!("corrupt job record {}", path.display()))?;
        Ok(job)
    }

    fn list(&self) -> Result<Vec<Job>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            let job: Job = serde_json::from_str(&contents)
                .with_context(|| format!("corrupt job record {}", path.display()))?;
            jobs.push(job);
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for mut job in self.list()? {
            if job.status != JobStatus::Processing {
                continue;
            }
            job.status = JobStatus::Failed;
            job.progress = 0;
            job.message = INTERRUPTED_MESSAGE.to_string();
            job.updated_at = Utc::now();
            self.save(&job)?;
            info!(job_id = %job.id, "interrupted job marked as failed");
            recovered.push(job.id);
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_save_load_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path());

        let first = Job::new("Acme", "ops");
        let second = Job::new("Globex", "sales");
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        assert_eq!(store.load(&first.id).unwrap(), first);
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&second.id));
        // No temporary files are left behind.
        let leftovers = fs::read_dir(dir.path().join("jobs"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn loading_unknown_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileJobStore::new(dir.path()).load("missing").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DossierError>(),
            Some(DossierError::JobNotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn list_on_fresh_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileJobStore::new(dir.path()).list().unwrap().is_empty());
    }

    #[test]
    fn recovery_fails_only_processing_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path());

        let mut stuck = Job::new("Acme", "ops");
        stuck.status = JobStatus::Processing;
        stuck.progress = 40;
        let mut done = Job::new("Globex", "ops");
        done.status = JobStatus::Completed;
        store.save(&stuck).unwrap();
        store.save(&done).unwrap();

        assert_eq!(store.recover_interrupted().unwrap(), vec![stuck.id.clone()]);

        let reloaded = store.load(&stuck.id).unwrap();
        assert_eq!(reloaded.status, JobStatus::Failed);
        assert_eq!(reloaded.progress, 0);
        assert_eq!(reloaded.message, INTERRUPTED_MESSAGE);
        assert_eq!(store.load(&done.id).unwrap().status, JobStatus::Completed);
        assert!(store.recover_interrupted().unwrap().is_empty());
    }

    #[test]
    fn report_is_written_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileReportStore::new(dir.path());
        let content = serde_json::json!({"overview": {"summary": "Acme makes anvils."}});
        let metadata = serde_json::json!({"total_loops": 1});

        let id = store.create_report("job-1", &content, &metadata).unwrap();
        let stored = store.load(&id).unwrap();

        assert_eq!(stored.job_id, "job-1");
        assert_eq!(stored.content, content);
        assert_eq!(stored.metadata, metadata);
    }
}
