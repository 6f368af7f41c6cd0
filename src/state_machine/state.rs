use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{Job, JobOutcome, JobStatus};
use crate::error::{MAX_USER_MESSAGE_CHARS, truncate_chars};

/// The phases of a report-generation job.
///
/// Each job flows through: INIT → RETRIEVE → GENERATE → VERIFY → PERSIST → END
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Init,
    Retrieve,
    Generate,
    Verify,
    Persist,
    End,
}

impl State {
    /// Progress reached once this phase has completed.
    pub fn progress_on_exit(self) -> u8 {
        match self {
            State::Init => 10,
            State::Retrieve => 30,
            State::Generate => 65,
            State::Verify => 85,
            State::Persist | State::End => 100,
        }
    }

    fn following(self) -> State {
        match self {
            State::Init => State::Retrieve,
            State::Retrieve => State::Generate,
            State::Generate => State::Verify,
            State::Verify => State::Persist,
            State::Persist | State::End => State::End,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Init => write!(f, "INIT"),
            State::Retrieve => write!(f, "RETRIEVE"),
            State::Generate => write!(f, "GENERATE"),
            State::Verify => write!(f, "VERIFY"),
            State::Persist => write!(f, "PERSIST"),
            State::End => write!(f, "END"),
        }
    }
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the next phase.
    Next(State),
    /// The job reached a terminal status.
    Complete(JobOutcome),
}

/// Drives a `Job` through the phases.
pub struct StateMachine;

impl StateMachine {
    /// Moves a pending job to `Processing`.
    pub fn start(job: &mut Job) {
        job.status = JobStatus::Processing;
        job.message = format!("Processing {}", job.company);
        job.touch();
    }

    /// Compute and apply the next transition for `job` given the outcome of
    /// its current phase.
    ///
    /// - Success advances to the following phase; reaching `End` completes
    ///   the job at 100%.
    /// - Any failure is terminal: `System` ends in `Failed`, `ContentQuality`
    ///   in `Rejected`, and progress drops back to 0.
    /// - `End` is terminal and always returns `Complete`.
    pub fn next(job: &mut Job, outcome: JobOutcome) -> Transition {
        let transition = if job.state == State::End {
            Transition::Complete(JobOutcome::Success)
        } else {
            match outcome {
                JobOutcome::Success => Transition::Next(job.state.following()),
                failure => Transition::Complete(failure),
            }
        };

        match &transition {
            Transition::Next(next_state) => {
                job.set_progress(job.state.progress_on_exit(), format!("{} done", job.state));
                job.state_history.push(job.state);
                job.state = *next_state;
                if *next_state == State::End {
                    job.status = JobStatus::Completed;
                    job.message = "Report ready".to_string();
                }
            }
            Transition::Complete(JobOutcome::Success) => {}
            Transition::Complete(JobOutcome::Failure(kind)) => {
                job.state_history.push(job.state);
                job.state = State::End;
                job.status = kind.status();
                job.progress = 0;
                job.message = kind.to_string();
                truncate_chars(&mut job.message, MAX_USER_MESSAGE_CHARS - 1);
            }
        }
        job.touch();

        transition
    }
}
