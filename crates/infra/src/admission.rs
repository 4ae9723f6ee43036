//! Admission guard: at most one admission per object id per cooldown window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use hasty_core::{JobId, ObjectId};
use hasty_jobs::Job;

use crate::jobs::{AdmissionRules, AdmitOutcome, JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("{} not passed yet", describe_window(*window_secs))]
    CooldownActive {
        object_id: ObjectId,
        latest_job_id: JobId,
        retry_after_secs: u64,
        window_secs: u64,
    },

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

fn describe_window(secs: u64) -> String {
    match secs {
        60 => "1 minute".to_string(),
        s if s >= 60 && s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s => format!("{s} seconds"),
    }
}

/// Creates or re-admits jobs, enforcing the cooldown per object id.
#[derive(Debug)]
pub struct AdmissionGuard<S: ?Sized> {
    store: Arc<S>,
    rules: AdmissionRules,
}

impl<S: ?Sized> Clone for AdmissionGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            rules: self.rules,
        }
    }
}

impl<S> AdmissionGuard<S>
where
    S: JobStore + ?Sized,
{
    pub fn new(store: Arc<S>, rules: AdmissionRules) -> Self {
        Self { store, rules }
    }

    pub fn rules(&self) -> AdmissionRules {
        self.rules
    }

    pub async fn admit(&self, object_id: &str) -> Result<Job, AdmissionError> {
        self.admit_at(object_id, Utc::now()).await
    }

    /// Admit against an explicit clock reading.
    ///
    /// Exactly one store write on success, none on rejection.
    #[instrument(skip(self, now))]
    pub async fn admit_at(
        &self,
        object_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, AdmissionError> {
        let object_id =
            ObjectId::parse(object_id).map_err(|e| AdmissionError::InvalidObjectId(e.to_string()))?;

        match self.store.admit(object_id.clone(), self.rules, now).await? {
            AdmitOutcome::Admitted(job) => {
                info!(job_id = %job.job_id, object_id = %job.object_id, "job admitted");
                Ok(job)
            }
            AdmitOutcome::Rejected {
                latest,
                retry_after_secs,
            } => {
                info!(
                    object_id = %object_id,
                    latest_job_id = %latest.job_id,
                    retry_after_secs,
                    "admission rejected: cooldown active"
                );
                Err(AdmissionError::CooldownActive {
                    object_id,
                    latest_job_id: latest.job_id,
                    retry_after_secs,
                    window_secs: self.rules.cooldown.window().as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use hasty_jobs::{CooldownPolicy, JobStatus, ReadmissionMode};

    use crate::jobs::InMemoryJobStore;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn guard(store: Arc<InMemoryJobStore>) -> AdmissionGuard<InMemoryJobStore> {
        AdmissionGuard::new(store, AdmissionRules::default())
    }

    #[tokio::test]
    async fn second_admission_inside_cooldown_is_rejected() {
        let store = InMemoryJobStore::arc();
        let guard = guard(Arc::clone(&store));

        let job = guard.admit_at("X", at(1_000)).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        let err = guard.admit_at("X", at(1_001)).await.unwrap_err();
        assert_eq!(err.to_string(), "5 minutes not passed yet");
        assert!(matches!(
            err,
            AdmissionError::CooldownActive { retry_after_secs: 299, latest_job_id, .. }
                if latest_job_id == job.job_id
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn readmission_after_cooldown_gets_fresh_id() {
        let store = InMemoryJobStore::arc();
        let guard = guard(Arc::clone(&store));

        let first = guard.admit_at("X", at(1_000)).await.unwrap();
        let later = at(1_000) + ChronoDuration::seconds(301);
        let second = guard.admit_at("X", later).await.unwrap();

        assert_ne!(first.job_id, second.job_id);
        assert_eq!(second.status, JobStatus::Processing);
        assert_eq!(second.timestamp, later);
    }

    #[tokio::test]
    async fn different_objects_do_not_interfere() {
        let guard = guard(InMemoryJobStore::arc());
        guard.admit_at("X", at(0)).await.unwrap();
        guard.admit_at("Y", at(0)).await.unwrap();
    }

    #[tokio::test]
    async fn blank_object_id_is_invalid() {
        let store = InMemoryJobStore::arc();
        let guard = guard(Arc::clone(&store));
        assert!(matches!(
            guard.admit("   ").await,
            Err(AdmissionError::InvalidObjectId(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn concurrent_admissions_admit_exactly_one() {
        let store = InMemoryJobStore::arc();
        let guard = guard(Arc::clone(&store));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let g = guard.clone();
            tasks.push(tokio::spawn(async move { g.admit_at("X", at(50)).await }));
        }
        let mut admitted = 0;
        for t in tasks {
            if t.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn custom_window_is_described() {
        let guard = AdmissionGuard::new(
            InMemoryJobStore::arc(),
            AdmissionRules {
                cooldown: CooldownPolicy::from_secs(90),
                readmission: ReadmissionMode::Rearm,
            },
        );
        guard.admit_at("X", at(0)).await.unwrap();
        let err = guard.admit_at("X", at(10)).await.unwrap_err();
        assert_eq!(err.to_string(), "90 seconds not passed yet");
    }
}
