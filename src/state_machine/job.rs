use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::State;

/// Distinguishes infrastructure failures from content that never became usable.
/// Neither is retried at the pipeline level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Infrastructure failed (collaborator error, storage, unresolved company).
    System(String),
    /// Model output never passed validation within the allowed attempts.
    ContentQuality(String),
}

impl FailureKind {
    pub fn reason(&self) -> &str {
        match self {
            FailureKind::System(msg) | FailureKind::ContentQuality(msg) => msg,
        }
    }

    /// Terminal status a job ends in after this failure.
    pub fn status(&self) -> JobStatus {
        match self {
            FailureKind::System(_) => JobStatus::Failed,
            FailureKind::ContentQuality(_) => JobStatus::Rejected,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::System(msg) => write!(f, "System failure: {msg}"),
            FailureKind::ContentQuality(msg) => write!(f, "Content rejected: {msg}"),
        }
    }
}

/// The result of executing a pipeline phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success,
    Failure(FailureKind),
}

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Rejected,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Rejected
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Rejected => "REJECTED",
        };
        f.write_str(label)
    }
}

/// One report-generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub company: String,
    pub topic: String,
    pub status: JobStatus,
    /// 0 to 100, never decreasing except for the reset on failure.
    pub progress: u8,
    pub message: String,
    pub report_id: Option<String>,
    pub state: State,
    pub state_history: Vec<State>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(company: impl Into<String>, topic: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            company: company.into(),
            topic: topic.into(),
            status: JobStatus::Pending,
            progress: 0,
            message: "Queued".to_string(),
            report_id: None,
            state: State::Init,
            state_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Raises progress to `progress` (capped at 100). Lower values are ignored.
    pub fn set_progress(&mut self, progress: u8, message: impl Into<String>) {
        self.progress = self.progress.max(progress.min(100));
        self.message = message.into();
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Summary of a finished job, logged at the end of a run and shown by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: String,
    pub company: String,
    pub topic: String,
    pub status: JobStatus,
    pub state_transitions: Vec<State>,
    pub progress: u8,
    pub message: String,
    pub report_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    pub fn from_job(job: &Job) -> Self {
        let duration = job.updated_at - job.created_at;
        let mut transitions = job.state_history.clone();
        transitions.push(job.state);

        Self {
            job_id: job.id.clone(),
            company: job.company.clone(),
            topic: job.topic.clone(),
            status: job.status,
            state_transitions: transitions,
            progress: job.progress,
            message: job.message.clone(),
            report_id: job.report_id.clone(),
            started_at: job.created_at,
            completed_at: job.updated_at,
            duration_ms: duration.num_milliseconds(),
        }
    }
}
