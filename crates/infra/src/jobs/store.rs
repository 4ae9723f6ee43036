//! Job storage abstraction and the in-memory implementation.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use hasty_core::{JobId, ObjectId};
use hasty_jobs::{AdmissionDecision, CooldownPolicy, Job, JobOutcome, JobStatus, ReadmissionMode};

/// A job record plus its storage-assigned row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    pub id: i64,
    pub job: Job,
}

/// Result of an atomic conditional admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// A job was written (created, appended, or re-armed).
    Admitted(Job),
    /// The latest job is still inside the cooldown window; nothing written.
    Rejected { latest: Job, retry_after_secs: u64 },
}

/// Result of a conditional terminal write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// The job moved to its terminal status.
    Applied(Job),
    /// The job was already terminal; the stored record is returned unchanged.
    AlreadyTerminal(Job),
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("no job with id: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid status change: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Admission parameters applied inside the store's atomic section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdmissionRules {
    pub cooldown: CooldownPolicy,
    pub readmission: ReadmissionMode,
}

/// Durable job records.
///
/// `admit` and `complete` are the race-free entry points; the field-level
/// operations exist for collaborators that already hold the job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Most recently admitted job for an object id (latest timestamp, ties by
    /// insertion order).
    async fn find_latest_by_object_id(
        &self,
        object_id: &ObjectId,
    ) -> Result<Option<Job>, JobStoreError>;

    async fn find_by_job_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn insert(&self, job: Job) -> Result<StoredJob, JobStoreError>;

    /// Set status (and `sleep_time_used` when given). Terminal records only
    /// accept their own status.
    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        sleep_time_used: Option<u32>,
    ) -> Result<Job, JobStoreError>;

    /// Lookup-evaluate-write as one atomic step per object id.
    ///
    /// Appending cancels any unfinished earlier attempt, so an object id has
    /// at most one non-terminal job.
    async fn admit(
        &self,
        object_id: ObjectId,
        rules: AdmissionRules,
        now: DateTime<Utc>,
    ) -> Result<AdmitOutcome, JobStoreError>;

    /// Terminal write, applied only while the job is not yet terminal.
    async fn complete(
        &self,
        job_id: JobId,
        outcome: JobOutcome,
        sleep_time_used: u32,
    ) -> Result<CompleteOutcome, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn find_latest_by_object_id(
        &self,
        object_id: &ObjectId,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).find_latest_by_object_id(object_id).await
    }

    async fn find_by_job_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).find_by_job_id(job_id).await
    }

    async fn insert(&self, job: Job) -> Result<StoredJob, JobStoreError> {
        (**self).insert(job).await
    }

    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        sleep_time_used: Option<u32>,
    ) -> Result<Job, JobStoreError> {
        (**self).update_status(job_id, status, sleep_time_used).await
    }

    async fn admit(
        &self,
        object_id: ObjectId,
        rules: AdmissionRules,
        now: DateTime<Utc>,
    ) -> Result<AdmitOutcome, JobStoreError> {
        (**self).admit(object_id, rules, now).await
    }

    async fn complete(
        &self,
        job_id: JobId,
        outcome: JobOutcome,
        sleep_time_used: u32,
    ) -> Result<CompleteOutcome, JobStoreError> {
        (**self).complete(job_id, outcome, sleep_time_used).await
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    rows: RwLock<Rows>,
}

#[derive(Debug, Default)]
struct Rows {
    jobs: Vec<StoredJob>,
    next_id: i64,
}

impl Rows {
    fn latest(&self, object_id: &ObjectId) -> Option<&StoredJob> {
        self.jobs
            .iter()
            .filter(|r| &r.job.object_id == object_id)
            .max_by_key(|r| (r.job.timestamp, r.id))
    }

    fn by_job_id_mut(&mut self, job_id: JobId) -> Option<&mut StoredJob> {
        self.jobs.iter_mut().find(|r| r.job.job_id == job_id)
    }

    /// Cancel every still-running attempt for the object; returns how many.
    fn supersede(&mut self, object_id: &ObjectId) -> usize {
        let mut superseded = 0;
        for row in self
            .jobs
            .iter_mut()
            .filter(|r| &r.job.object_id == object_id && !r.job.status.is_terminal())
        {
            row.job.status = JobStatus::Cancelled;
            superseded += 1;
        }
        superseded
    }

    fn push(&mut self, job: Job) -> Result<StoredJob, JobStoreError> {
        if self.jobs.iter().any(|r| r.job.job_id == job.job_id) {
            return Err(JobStoreError::AlreadyExists(job.job_id));
        }
        self.next_id += 1;
        let stored = StoredJob {
            id: self.next_id,
            job,
        };
        self.jobs.push(stored.clone());
        Ok(stored)
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Rows>, JobStoreError> {
        self.rows
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Rows>, JobStoreError> {
        self.rows
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    /// Every stored attempt for an object id, oldest first.
    pub fn history(&self, object_id: &ObjectId) -> Vec<Job> {
        self.read()
            .map(|rows| {
                rows.jobs
                    .iter()
                    .filter(|r| &r.job.object_id == object_id)
                    .map(|r| r.job.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read().map(|rows| rows.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find_latest_by_object_id(
        &self,
        object_id: &ObjectId,
    ) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.latest(object_id).map(|r| r.job.clone()))
    }

    async fn find_by_job_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self
            .read()?
            .jobs
            .iter()
            .find(|r| r.job.job_id == job_id)
            .map(|r| r.job.clone()))
    }

    async fn insert(&self, job: Job) -> Result<StoredJob, JobStoreError> {
        self.write()?.push(job)
    }

    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        sleep_time_used: Option<u32>,
    ) -> Result<Job, JobStoreError> {
        let mut rows = self.write()?;
        let row = rows
            .by_job_id_mut(job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        check_update(&row.job, status)?;
        row.job.status = status;
        if sleep_time_used.is_some() {
            row.job.sleep_time_used = sleep_time_used;
        }
        Ok(row.job.clone())
    }

    async fn admit(
        &self,
        object_id: ObjectId,
        rules: AdmissionRules,
        now: DateTime<Utc>,
    ) -> Result<AdmitOutcome, JobStoreError> {
        let mut rows = self.write()?;
        let latest = rows.latest(&object_id).cloned();

        match rules.cooldown.evaluate(latest.as_ref().map(|r| &r.job), now) {
            AdmissionDecision::Reject { retry_after_secs } => Ok(AdmitOutcome::Rejected {
                latest: latest.map(|r| r.job).ok_or_else(|| {
                    JobStoreError::Storage("rejection without a latest job".to_string())
                })?,
                retry_after_secs,
            }),
            AdmissionDecision::Create => {
                let stored = rows.push(Job::admit(object_id, now))?;
                Ok(AdmitOutcome::Admitted(stored.job))
            }
            AdmissionDecision::Readmit => match (rules.readmission, latest) {
                (ReadmissionMode::Rearm, Some(prev)) => {
                    let row = rows
                        .jobs
                        .iter_mut()
                        .find(|r| r.id == prev.id)
                        .ok_or(JobStoreError::NotFound(prev.job.job_id))?;
                    row.job.rearm(now);
                    Ok(AdmitOutcome::Admitted(row.job.clone()))
                }
                _ => {
                    let superseded = rows.supersede(&object_id);
                    if superseded > 0 {
                        debug!(object_id = %object_id, superseded, "cancelled unfinished attempts");
                    }
                    let stored = rows.push(Job::admit(object_id, now))?;
                    Ok(AdmitOutcome::Admitted(stored.job))
                }
            },
        }
    }

    async fn complete(
        &self,
        job_id: JobId,
        outcome: JobOutcome,
        sleep_time_used: u32,
    ) -> Result<CompleteOutcome, JobStoreError> {
        let mut rows = self.write()?;
        let row = rows
            .by_job_id_mut(job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        if row.job.status.is_terminal() {
            return Ok(CompleteOutcome::AlreadyTerminal(row.job.clone()));
        }
        row.job
            .complete(outcome, sleep_time_used)
            .map_err(|e| JobStoreError::InvalidTransition(e.to_string()))?;
        Ok(CompleteOutcome::Applied(row.job.clone()))
    }
}

/// Terminal records are frozen except for a same-status rewrite.
pub(crate) fn check_update(current: &Job, next: JobStatus) -> Result<(), JobStoreError> {
    if current.status.is_terminal() && current.status != next {
        return Err(JobStoreError::InvalidTransition(format!(
            "job {} is {} and cannot become {}",
            current.job_id, current.status, next
        )));
    }
    Ok(())
}
