//! Lifecycle orchestrator: turns `job:created` deliveries into exactly one
//! terminal write and one terminal event.
//!
//! Per message:
//! 1. decode (malformed payloads are dead-lettered)
//! 2. skip work for jobs already terminal (republish the stored outcome)
//! 3. pick a sleep from `[min, max)` and record it on the job
//! 4. race the work task against the ceiling
//!    - outcome first: conditional terminal write, publish, ack
//!    - ceiling first: abort the task, leave the message unacked
//!
//! `job:cancel-requested` events trigger the in-flight job's cancellation
//! token through [`CancellationRegistry`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hasty_core::JobId;
use hasty_events::{
    DeliverPolicy, Disposition, EventBus, JobEventPublisher, ListenerHandle, Message,
    MessageHandler, PublishError, SubscriptionOptions, spawn_listener,
};
use hasty_jobs::{Job, JobEvent, JobOutcome, JobStatus, SleepPolicy, Subject};

use crate::jobs::{CompleteOutcome, JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("malformed job event: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("unexpected subject {0} on job:created")]
    UnexpectedSubject(Subject),

    #[error("persistence failure: {0}")]
    Persistence(#[from] JobStoreError),

    #[error("transport failure: {0}")]
    Transport(#[from] PublishError),

    #[error("work task failed: {0}")]
    Work(String),
}

/// How one delivery was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Work raced to an outcome; the terminal record was written and published.
    Completed(Job),
    /// The job was already terminal; its stored outcome was republished.
    Republished(Job),
    /// The job id is unknown to the store (superseded by a re-arm); nothing to do.
    Stale(JobId),
    /// The ceiling fired first; the message stays unacknowledged.
    CeilingExceeded,
}

/// In-flight jobs on this process and their cancellation tokens.
///
/// Duplicate deliveries of one job share a token; the entry lives until the
/// last of their registrations drops.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<JobId, Entry>>,
}

#[derive(Debug)]
struct Entry {
    token: CancellationToken,
    holders: usize,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job; the entry is removed when the returned guard drops.
    pub fn register(self: &Arc<Self>, job_id: JobId) -> Registration {
        let token = match self.tokens.lock() {
            Ok(mut tokens) => {
                let entry = tokens.entry(job_id).or_insert_with(|| Entry {
                    token: CancellationToken::new(),
                    holders: 0,
                });
                entry.holders += 1;
                entry.token.clone()
            }
            Err(_) => CancellationToken::new(),
        };
        Registration {
            registry: Arc::clone(self),
            job_id,
            token,
        }
    }

    /// Trigger cancellation for an in-flight job. `false` when not in flight here.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let token = self
            .tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(&job_id).map(|e| e.token.clone()));
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.tokens
            .lock()
            .map(|tokens| tokens.contains_key(&job_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, job_id: JobId) {
        let Ok(mut tokens) = self.tokens.lock() else {
            return;
        };
        if let Some(entry) = tokens.get_mut(&job_id) {
            entry.holders -= 1;
            if entry.holders == 0 {
                tokens.remove(&job_id);
            }
        }
    }
}

/// Registry entry for one in-flight job.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<CancellationRegistry>,
    job_id: JobId,
    token: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.job_id);
    }
}

/// Simulated work: sleep, resolving `Cancelled` if the token fires first.
pub async fn simulate_work(sleep_secs: u32, token: CancellationToken) -> JobOutcome {
    tokio::select! {
        biased;
        _ = token.cancelled() => JobOutcome::Cancelled,
        _ = tokio::time::sleep(Duration::from_secs(u64::from(sleep_secs))) => JobOutcome::Finished,
    }
}

type BoxedWork = Pin<Box<dyn Future<Output = JobOutcome> + Send>>;

/// The unit of work raced against the ceiling: `(sleep_secs, token) -> outcome`.
pub type WorkFn = Arc<dyn Fn(u32, CancellationToken) -> BoxedWork + Send + Sync>;

/// Wrap an async fn or closure as a [`WorkFn`].
pub fn work_fn<F, Fut>(f: F) -> WorkFn
where
    F: Fn(u32, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    Arc::new(move |sleep_secs, token| -> BoxedWork { Box::pin(f(sleep_secs, token)) })
}

pub struct LifecycleOrchestrator<S: ?Sized, B: ?Sized> {
    store: Arc<S>,
    publisher: JobEventPublisher<B>,
    sleep: SleepPolicy,
    registry: Arc<CancellationRegistry>,
    work: WorkFn,
}

impl<S: ?Sized, B: ?Sized> core::fmt::Debug for LifecycleOrchestrator<S, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LifecycleOrchestrator")
            .field("sleep", &self.sleep)
            .field("in_flight", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<S, B> LifecycleOrchestrator<S, B>
where
    S: JobStore + ?Sized,
    B: EventBus + ?Sized,
{
    pub fn new(store: Arc<S>, publisher: JobEventPublisher<B>, sleep: SleepPolicy) -> Self {
        Self {
            store,
            publisher,
            sleep,
            registry: Arc::new(CancellationRegistry::new()),
            work: work_fn(simulate_work),
        }
    }

    /// Replace the simulated work.
    pub fn with_work(mut self, work: WorkFn) -> Self {
        self.work = work;
        self
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    /// Decode a `job:created` delivery and process it.
    pub async fn process(&self, message: &Message) -> Result<ProcessOutcome, LifecycleError> {
        let event = JobEvent::decode(&message.payload)?;
        if event.subject != Subject::Created {
            return Err(LifecycleError::UnexpectedSubject(event.subject));
        }
        self.process_created(event.job).await
    }

    pub async fn process_created(&self, job: Job) -> Result<ProcessOutcome, LifecycleError> {
        let job_id = job.job_id;

        let Some(stored) = self.store.find_by_job_id(job_id).await? else {
            warn!(job_id = %job_id, object_id = %job.object_id, "job not in store; skipping");
            return Ok(ProcessOutcome::Stale(job_id));
        };
        if stored.status.is_terminal() {
            return self.republish(stored).await;
        }

        let sleep_secs = self.sleep.pick(&mut rand::thread_rng());
        match self
            .store
            .update_status(job_id, JobStatus::Processing, Some(sleep_secs))
            .await
        {
            Ok(_) => {}
            Err(JobStoreError::InvalidTransition(_)) => {
                // Finished by another delivery or superseded since the lookup.
                let stored = self
                    .store
                    .find_by_job_id(job_id)
                    .await?
                    .ok_or(JobStoreError::NotFound(job_id))?;
                return self.republish(stored).await;
            }
            Err(e) => return Err(e.into()),
        }

        let registration = self.registry.register(job_id);
        let mut work = tokio::spawn((self.work)(sleep_secs, registration.token().clone()));
        let ceiling = tokio::time::sleep(self.sleep.ceiling());

        debug!(job_id = %job_id, sleep_secs, ceiling = ?self.sleep.ceiling(), "racing work against ceiling");

        let outcome = tokio::select! {
            res = &mut work => res.map_err(|e| LifecycleError::Work(e.to_string()))?,
            _ = ceiling => {
                work.abort();
                warn!(job_id = %job_id, sleep_secs, "ceiling exceeded; leaving message unacknowledged");
                return Ok(ProcessOutcome::CeilingExceeded);
            }
        };
        drop(registration);

        let job = match self.store.complete(job_id, outcome, sleep_secs).await? {
            CompleteOutcome::Applied(job) => job,
            CompleteOutcome::AlreadyTerminal(job) => {
                debug!(job_id = %job_id, status = %job.status, "terminal status already recorded");
                job
            }
        };

        let event = JobEvent::terminal(job.clone()).ok_or_else(|| {
            LifecycleError::Persistence(JobStoreError::Storage(format!(
                "job {job_id} is {} after a terminal write",
                job.status
            )))
        })?;
        self.publisher.publish(&event).await?;

        info!(
            job_id = %job_id,
            object_id = %job.object_id,
            status = %job.status,
            sleep_time_used = sleep_secs,
            "job reached terminal status"
        );
        Ok(ProcessOutcome::Completed(job))
    }

    async fn republish(&self, stored: Job) -> Result<ProcessOutcome, LifecycleError> {
        let Some(event) = JobEvent::terminal(stored.clone()) else {
            return Err(LifecycleError::Persistence(JobStoreError::InvalidTransition(
                format!("job {} is {} and not terminal", stored.job_id, stored.status),
            )));
        };
        info!(
            job_id = %stored.job_id,
            status = %stored.status,
            "job already terminal; republishing outcome"
        );
        self.publisher.publish(&event).await?;
        Ok(ProcessOutcome::Republished(stored))
    }
}

#[async_trait]
impl<S, B> MessageHandler for LifecycleOrchestrator<S, B>
where
    S: JobStore + ?Sized + 'static,
    B: EventBus + ?Sized + 'static,
{
    async fn handle(&self, message: &Message) -> Disposition {
        match self.process(message).await {
            Ok(ProcessOutcome::CeilingExceeded) => Disposition::Retry,
            Ok(_) => Disposition::Ack,
            Err(e @ (LifecycleError::Deserialize(_) | LifecycleError::UnexpectedSubject(_))) => {
                error!(message_id = %message.id, error = %e, "unprocessable job event");
                Disposition::DeadLetter(e.to_string())
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "job processing failed; will be redelivered");
                Disposition::Retry
            }
        }
    }
}

/// Consumes `job:cancel-requested` and cancels matching in-flight jobs.
#[derive(Debug)]
pub struct CancelRequestHandler {
    registry: Arc<CancellationRegistry>,
}

impl CancelRequestHandler {
    pub fn new(registry: Arc<CancellationRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageHandler for CancelRequestHandler {
    async fn handle(&self, message: &Message) -> Disposition {
        let event = match JobEvent::decode(&message.payload) {
            Ok(event) if event.subject == Subject::CancelRequested => event,
            Ok(event) => {
                return Disposition::DeadLetter(format!(
                    "unexpected subject {} on job:cancel-requested",
                    event.subject
                ));
            }
            Err(e) => return Disposition::DeadLetter(format!("malformed job event: {e}")),
        };

        if self.registry.cancel(event.job.job_id) {
            info!(job_id = %event.job.job_id, object_id = %event.job.object_id, "cancellation triggered");
        } else {
            debug!(job_id = %event.job.job_id, "cancel request for job not in flight here");
        }
        Disposition::Ack
    }
}

/// Listener settings for a worker process.
#[derive(Debug, Clone)]
pub struct LifecycleWorkerConfig {
    /// Shared durable queue group for `job:created`
    pub created: SubscriptionOptions,
    pub max_in_flight: usize,
}

/// Running listeners of one worker process.
#[derive(Debug)]
pub struct LifecycleWorker {
    created: ListenerHandle,
    cancel: ListenerHandle,
}

impl LifecycleWorker {
    /// Subscribe and start both listeners.
    ///
    /// Every worker joins the shared `created` queue group; cancel requests
    /// use a per-worker group so each worker sees all of them.
    pub async fn start<S, B>(
        bus: Arc<B>,
        orchestrator: Arc<LifecycleOrchestrator<S, B>>,
        config: LifecycleWorkerConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, hasty_events::BusError>
    where
        S: JobStore + ?Sized + 'static,
        B: EventBus + ?Sized + 'static,
    {
        let group = config.created.queue_group.clone();
        let created_sub = bus.subscribe(config.created.clone()).await?;

        let cancel_group = format!("{}-cancel-{}", group, uuid::Uuid::now_v7());
        let cancel_sub = bus
            .subscribe(
                SubscriptionOptions::new(Subject::CancelRequested.as_str(), cancel_group)
                    .deliver(DeliverPolicy::New)
                    .ack_wait(config.created.ack_wait),
            )
            .await?;

        let cancel_handler = Arc::new(CancelRequestHandler::new(Arc::clone(
            orchestrator.registry(),
        )));

        let created = spawn_listener(
            "job-created",
            created_sub,
            orchestrator,
            config.max_in_flight,
            shutdown.child_token(),
        );
        let cancel = spawn_listener(
            "job-cancel-requested",
            cancel_sub,
            cancel_handler,
            config.max_in_flight,
            shutdown.child_token(),
        );
        info!(group = %group, max_in_flight = config.max_in_flight, "lifecycle worker started");

        Ok(Self { created, cancel })
    }

    /// Stop pulling deliveries; in-flight messages are redelivered later.
    pub async fn shutdown(self) {
        self.created.shutdown().await;
        self.cancel.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hasty_core::ObjectId;
    use hasty_events::InMemoryEventBus;
    use tokio::time::Instant;

    use crate::jobs::InMemoryJobStore;

    type Orchestrator = LifecycleOrchestrator<InMemoryJobStore, InMemoryEventBus>;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        bus: Arc<InMemoryEventBus>,
        orchestrator: Arc<Orchestrator>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryEventBus::new());
        let orchestrator = Arc::new(LifecycleOrchestrator::new(
            Arc::clone(&store),
            JobEventPublisher::new(Arc::clone(&bus)),
            SleepPolicy::default(),
        ));
        Fixture {
            store,
            bus,
            orchestrator,
        }
    }

    async fn admitted(store: &InMemoryJobStore, object_id: &str) -> Job {
        let job = Job::admit(ObjectId::parse(object_id).unwrap(), Utc::now());
        store.insert(job.clone()).await.unwrap();
        job
    }

    fn message(event: &JobEvent) -> Message {
        Message {
            id: "1".to_string(),
            subject: event.subject.as_str().to_string(),
            payload: event.encode().unwrap(),
            delivery_count: 1,
        }
    }

    fn slow_work(secs: u64) -> WorkFn {
        work_fn(move |_, _| async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            JobOutcome::Finished
        })
    }

    #[tokio::test(start_paused = true)]
    async fn created_job_finishes_within_sleep_bounds() {
        let f = fixture();
        let job = admitted(&f.store, "Y").await;
        let started = Instant::now();

        let outcome = f.orchestrator.process_created(job.clone()).await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(45));
        let ProcessOutcome::Completed(done) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(done.status, JobStatus::Finished);
        let sleep = done.sleep_time_used.unwrap();
        assert!((15..45).contains(&sleep));
        assert_eq!(u64::from(sleep), elapsed.as_secs());

        let stored = f.store.find_by_job_id(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored, done);
        let finished = f.bus.published(Subject::Finished.as_str());
        assert_eq!(finished.len(), 1);
        assert_eq!(JobEvent::decode(&finished[0]).unwrap().job, done);
        assert!(f.orchestrator.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_leaves_job_unfinished() {
        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryEventBus::new());
        let orchestrator = LifecycleOrchestrator::new(
            Arc::clone(&store),
            JobEventPublisher::new(Arc::clone(&bus)),
            SleepPolicy::default(),
        )
        .with_work(slow_work(120));
        let job = admitted(&store, "Y").await;
        let started = Instant::now();

        let outcome = orchestrator.process_created(job.clone()).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::CeilingExceeded);
        assert_eq!(started.elapsed(), Duration::from_secs(46));
        let stored = store.find_by_job_id(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert!(bus.published(Subject::Finished.as_str()).is_empty());
        assert!(orchestrator.registry().is_empty());

        let disposition = orchestrator.handle(&message(&JobEvent::created(job))).await;
        assert_eq!(disposition, Disposition::Retry);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_request_short_circuits_work() {
        let f = fixture();
        let job = admitted(&f.store, "Y").await;
        let started = Instant::now();

        let orchestrator = Arc::clone(&f.orchestrator);
        let run = tokio::spawn({
            let job = job.clone();
            async move { orchestrator.process_created(job).await }
        });
        while !f.orchestrator.registry().contains(job.job_id) {
            tokio::task::yield_now().await;
        }

        let handler = CancelRequestHandler::new(Arc::clone(f.orchestrator.registry()));
        let disposition = handler
            .handle(&message(&JobEvent::cancel_requested(job.clone())))
            .await;
        assert_eq!(disposition, Disposition::Ack);

        let ProcessOutcome::Completed(done) = run.await.unwrap().unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(done.sleep_time_used.is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(f.bus.published(Subject::Cancelled.as_str()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_of_terminal_job_republishes_without_work() {
        let f = fixture();
        let job = admitted(&f.store, "Y").await;
        f.store
            .complete(job.job_id, JobOutcome::Finished, 20)
            .await
            .unwrap();
        let started = Instant::now();

        let outcome = f
            .orchestrator
            .handle(&message(&JobEvent::created(job.clone())))
            .await;

        assert_eq!(outcome, Disposition::Ack);
        assert_eq!(started.elapsed(), Duration::ZERO);
        let stored = f.store.find_by_job_id(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.sleep_time_used, Some(20));
        assert_eq!(f.bus.published(Subject::Finished.as_str()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_duplicates_agree_on_one_terminal_write() {
        let f = fixture();
        let job = admitted(&f.store, "Y").await;

        let a = tokio::spawn({
            let (o, j) = (Arc::clone(&f.orchestrator), job.clone());
            async move { o.process_created(j).await }
        });
        let b = tokio::spawn({
            let (o, j) = (Arc::clone(&f.orchestrator), job.clone());
            async move { o.process_created(j).await }
        });

        let finished = |o: ProcessOutcome| match o {
            ProcessOutcome::Completed(j) | ProcessOutcome::Republished(j) => j,
            other => panic!("unexpected outcome {other:?}"),
        };
        let ja = finished(a.await.unwrap().unwrap());
        let jb = finished(b.await.unwrap().unwrap());

        assert_eq!(ja, jb);
        let stored = f.store.find_by_job_id(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored, ja);
        assert!(stored.status.is_terminal());
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered() {
        let f = fixture();
        let message = Message {
            id: "1".to_string(),
            subject: "job:created".to_string(),
            payload: b"{not json".to_vec(),
            delivery_count: 1,
        };
        assert!(matches!(
            f.orchestrator.handle(&message).await,
            Disposition::DeadLetter(_)
        ));
    }

    #[tokio::test]
    async fn wrong_subject_is_dead_lettered() {
        let f = fixture();
        let job = admitted(&f.store, "Y").await;
        let event = JobEvent::cancel_requested(job);
        assert!(matches!(
            f.orchestrator.handle(&message(&event)).await,
            Disposition::DeadLetter(_)
        ));
    }

    #[tokio::test]
    async fn unknown_job_is_acknowledged_as_stale() {
        let f = fixture();
        let ghost = Job::admit(ObjectId::parse("ghost").unwrap(), Utc::now());
        assert_eq!(
            f.orchestrator
                .process_created(ghost.clone())
                .await
                .unwrap(),
            ProcessOutcome::Stale(ghost.job_id)
        );
        assert_eq!(
            f.orchestrator.handle(&message(&JobEvent::created(ghost))).await,
            Disposition::Ack
        );
    }

    #[test]
    fn registry_entry_is_removed_on_drop() {
        let registry = Arc::new(CancellationRegistry::new());
        let id = JobId::new();
        let registration = registry.register(id);
        assert!(registry.contains(id));
        assert!(registry.cancel(id));
        assert!(registration.token().is_cancelled());
        drop(registration);
        assert!(!registry.contains(id));
        assert!(!registry.cancel(id));
    }

    #[test]
    fn duplicate_registrations_share_one_entry() {
        let registry = Arc::new(CancellationRegistry::new());
        let id = JobId::new();
        let first = registry.register(id);
        let second = registry.register(id);
        assert_eq!(registry.len(), 1);

        drop(first);
        assert!(registry.contains(id));
        assert!(registry.cancel(id));
        assert!(second.token().is_cancelled());

        drop(second);
        assert!(registry.is_empty());
    }
}
