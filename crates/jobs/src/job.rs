//! The job record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hasty_core::{DomainError, DomainResult, JobId, ObjectId};

/// Job execution status.
///
/// `Pending`/`Processing` move to exactly one of `Finished` or `Cancelled`;
/// nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recorded, not yet picked up
    Pending,
    /// Admitted and handed to the job service
    Processing,
    /// Simulated work completed
    Finished,
    /// Cancelled before the work completed
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Pending | JobStatus::Processing, n) => n.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Finished => "finished",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "finished" => Ok(JobStatus::Finished),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Terminal outcome of one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Finished,
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Finished => JobStatus::Finished,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// One processing attempt of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub object_id: ObjectId,
    pub status: JobStatus,
    /// Admission time, second precision (epoch seconds on the wire).
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Simulated work duration in seconds, set once processing starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_time_used: Option<u32>,
}

impl Job {
    /// A freshly admitted job: new id, `processing`, admitted at `now`.
    pub fn admit(object_id: ObjectId, now: DateTime<Utc>) -> Self {
        Self {
            job_id: JobId::new(),
            object_id,
            status: JobStatus::Processing,
            timestamp: truncate_to_seconds(now),
            sleep_time_used: None,
        }
    }

    /// Re-arm an existing record for a new attempt.
    ///
    /// Fresh job id, back to `processing`, admitted at `now`.
    pub fn rearm(&mut self, now: DateTime<Utc>) {
        self.job_id = JobId::new();
        self.status = JobStatus::Processing;
        self.timestamp = truncate_to_seconds(now);
        self.sleep_time_used = None;
    }

    /// Seconds elapsed since admission (negative if the clock went backwards).
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.timestamp).num_seconds()
    }

    /// Apply a terminal outcome.
    pub fn complete(&mut self, outcome: JobOutcome, sleep_time_used: u32) -> DomainResult<()> {
        let next = outcome.status();
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(format!(
                "job {} cannot move from {} to {}",
                self.job_id, self.status, next
            )));
        }
        self.status = next;
        self.sleep_time_used = Some(sleep_time_used);
        Ok(())
    }
}

/// Drop sub-second precision so in-memory records match what storage and the
/// wire keep.
pub fn truncate_to_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}
