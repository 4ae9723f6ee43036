//! Wire events carried over the bus.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobStatus};

/// Logical channel a job event is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subject {
    #[serde(rename = "job:created")]
    Created,
    #[serde(rename = "job:finished")]
    Finished,
    #[serde(rename = "job:cancelled")]
    Cancelled,
    #[serde(rename = "job:cancel-requested")]
    CancelRequested,
}

impl Subject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::Created => "job:created",
            Subject::Finished => "job:finished",
            Subject::Cancelled => "job:cancelled",
            Subject::CancelRequested => "job:cancel-requested",
        }
    }

    /// Subject announcing a job that reached `status`, if it is terminal.
    pub fn for_terminal(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Finished => Some(Subject::Finished),
            JobStatus::Cancelled => Some(Subject::Cancelled),
            _ => None,
        }
    }
}

impl core::fmt::Display for Subject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{subject, job}`: a snapshot of the job at emission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub subject: Subject,
    pub job: Job,
}

impl JobEvent {
    pub fn new(subject: Subject, job: Job) -> Self {
        Self { subject, job }
    }

    pub fn created(job: Job) -> Self {
        Self::new(Subject::Created, job)
    }

    pub fn cancel_requested(job: Job) -> Self {
        Self::new(Subject::CancelRequested, job)
    }

    /// Terminal event for a job that already carries its terminal status.
    ///
    /// Returns `None` when the job is not terminal.
    pub fn terminal(job: Job) -> Option<Self> {
        Subject::for_terminal(job.status).map(|subject| Self::new(subject, job))
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
