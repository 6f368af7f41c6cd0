//! Per-job progress channel.
//!
//! The orchestrator is the only writer; the terminal UI and anything else
//! interested in a run subscribe to the receiving side.

use serde::Serialize;
use tokio::sync::watch;

use crate::state_machine::{Job, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub report_id: Option<String>,
}

impl From<&Job> for ProgressUpdate {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status,
            progress: job.progress,
            message: job.message.clone(),
            report_id: job.report_id.clone(),
        }
    }
}

pub type ProgressSender = watch::Sender<ProgressUpdate>;
pub type ProgressReceiver = watch::Receiver<ProgressUpdate>;

/// Opens the channel for `job`, seeded with its current state.
pub fn channel(job: &Job) -> (ProgressSender, ProgressReceiver) {
    watch::channel(ProgressUpdate::from(job))
}
