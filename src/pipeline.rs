//! Middleware around the enqueue and perform stages of a job.
//!
//! [`Limiter`] holds the gate policy of each job class and runs the gates
//! around caller-supplied continuations: the submission for enqueue, the job
//! body for perform. Job classes without a policy pass straight through.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{LimiterConfig, ReleaseErrorPolicy};
use crate::decision::Decision;
use crate::error::{LimiterError, Result};
use crate::extractor::{ArgumentExtractor, ResourceExtractor};
use crate::gate::{DedupGate, ThrottleGate, ThrottlePolicy};
use crate::job::Job;
use crate::metrics::MetricsSink;
use crate::scheduler::{JobHandle, JobScheduler};
use crate::store::LockStore;

/// Gates applied to one job class.
#[derive(Debug, Clone, Default)]
pub struct JobPolicy {
    /// Collapses identical pending submissions
    pub dedup: Option<DedupGate>,
    /// Bounds execution rate per resource
    pub throttle: Option<ThrottleGate>,
}

/// What happened to a job that went through the pipeline.
#[derive(Debug)]
pub enum Gated<T> {
    /// The continuation ran and produced `T`.
    Ran(T),
    /// The job was dropped; its identity token is cleared.
    Dropped(Job),
    /// The job did not run; a copy was submitted to run after `delay`.
    Rescheduled {
        /// Delay given to the copy
        delay: Duration,
    },
}

impl<T> Gated<T> {
    /// The continuation's output, if it ran.
    pub fn ran(self) -> Option<T> {
        match self {
            Gated::Ran(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the job was dropped.
    pub fn is_dropped(&self) -> bool {
        matches!(self, Gated::Dropped(_))
    }
}

/// Runs the configured gates around job submission and execution.
pub struct Limiter {
    policies: HashMap<String, JobPolicy>,
    scheduler: Arc<dyn JobScheduler>,
    on_release_error: ReleaseErrorPolicy,
}

impl Limiter {
    /// Create a limiter with no policies that submits through `scheduler`.
    pub fn new(scheduler: Arc<dyn JobScheduler>) -> Self {
        Self {
            policies: HashMap::new(),
            scheduler,
            on_release_error: ReleaseErrorPolicy::default(),
        }
    }

    /// Build a limiter from configuration.
    ///
    /// Every throttled class reports to `metrics` and selects its resource id
    /// from the configured argument positions.
    pub fn from_config(
        config: &LimiterConfig,
        store: Arc<dyn LockStore>,
        scheduler: Arc<dyn JobScheduler>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let mut limiter =
            Self::new(scheduler.clone()).with_release_error_policy(config.on_release_error);

        for (job_class, job_config) in &config.jobs {
            let dedup = job_config.dedup.as_ref().map(|dedup| {
                DedupGate::new(store.clone(), dedup.expiration()).with_namespace(&config.namespace)
            });

            let throttle = match &job_config.throttle {
                Some(throttle) => {
                    let policy = ThrottlePolicy::new(throttle.duration())
                        .with_reschedule_multiplier(config.reschedule_multiplier)?;
                    let extractor: Arc<dyn ResourceExtractor> =
                        Arc::new(ArgumentExtractor::new(throttle.resource_arguments.clone()));
                    Some(
                        ThrottleGate::new(store.clone(), scheduler.clone(), extractor, policy)
                            .with_metrics(metrics.clone())
                            .with_namespace(&config.namespace),
                    )
                }
                None => None,
            };

            limiter.register(job_class.clone(), JobPolicy { dedup, throttle });
        }

        info!(
            job_classes = limiter.policies.len(),
            on_release_error = ?limiter.on_release_error,
            "Limiter initialized"
        );
        Ok(limiter)
    }

    /// Set how failed pre-perform releases are handled.
    pub fn with_release_error_policy(mut self, policy: ReleaseErrorPolicy) -> Self {
        self.on_release_error = policy;
        self
    }

    /// Attach gates to a job class, replacing any previous policy.
    pub fn register(&mut self, job_class: impl Into<String>, policy: JobPolicy) {
        let job_class = job_class.into();
        debug!(
            job_class = %job_class,
            dedup = policy.dedup.is_some(),
            throttle = policy.throttle.is_some(),
            "Registering job policy"
        );
        self.policies.insert(job_class, policy);
    }

    /// The policy of a job class.
    pub fn policy(&self, job_class: &str) -> Option<&JobPolicy> {
        self.policies.get(job_class)
    }

    /// Registered job classes.
    pub fn job_classes(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// Run the enqueue gates, then `proceed` with the job if they allow it.
    ///
    /// The dedup gate runs before the throttle gate. If a later step drops the
    /// job or `proceed` fails, locks taken by earlier steps are released.
    pub async fn around_enqueue<F, Fut, T>(&self, mut job: Job, proceed: F) -> Result<Gated<T>>
    where
        F: FnOnce(Job) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if job.is_dropped() {
            return Ok(Gated::Dropped(job));
        }

        let Some(policy) = self.policies.get(&job.job_class) else {
            return proceed(job).await.map(Gated::Ran);
        };

        if let Some(dedup) = &policy.dedup {
            if dedup.on_enqueue(&job).await?.is_drop() {
                job.clear_identity();
                return Ok(Gated::Dropped(job));
            }
        }

        if let Some(throttle) = &policy.throttle {
            let decision = match throttle.on_enqueue(&job).await {
                Ok(decision) => decision,
                Err(e) => {
                    self.rollback_dedup(policy, &job).await;
                    return Err(e);
                }
            };
            if decision.is_drop() {
                self.rollback_dedup(policy, &job).await;
                job.clear_identity();
                return Ok(Gated::Dropped(job));
            }
        }

        let snapshot = job.clone();
        match proceed(job).await {
            Ok(value) => {
                if let Some(throttle) = &policy.throttle {
                    throttle.commit_enqueue(&snapshot);
                }
                Ok(Gated::Ran(value))
            }
            Err(e) => {
                warn!(job_class = %snapshot.job_class, error = %e, "Submission failed, releasing enqueue locks");
                self.rollback_dedup(policy, &snapshot).await;
                if let Some(throttle) = &policy.throttle {
                    if let Err(release_err) = throttle.rollback_enqueue(&snapshot).await {
                        warn!(error = %release_err, "Failed to roll back throttle enqueue lock");
                    }
                }
                Err(e)
            }
        }
    }

    async fn rollback_dedup(&self, policy: &JobPolicy, job: &Job) {
        if let Some(dedup) = &policy.dedup {
            if let Err(e) = dedup.on_before_perform(job).await {
                warn!(error = %e, "Failed to roll back dedup lock");
            }
        }
    }

    /// Gate `job` and submit it through the scheduler.
    pub async fn enqueue(&self, job: Job, delay: Option<Duration>) -> Result<Gated<JobHandle>> {
        let scheduler = self.scheduler.clone();
        self.around_enqueue(job, |job| async move {
            let queue_name = job.queue_name.clone();
            scheduler.submit(job, delay, &queue_name).await
        })
        .await
    }

    /// Run the perform gates, then the job body if they allow it.
    ///
    /// The dedup lock is cleared first, then the throttle perform protocol
    /// runs, whether or not the dedup release succeeded. A failed release is
    /// handled per [`ReleaseErrorPolicy`] once every gate has run; when it
    /// aborts a proceeding job, the perform lock is given back.
    pub async fn around_perform<F, Fut, T>(&self, mut job: Job, proceed: F) -> Result<Gated<T>>
    where
        F: FnOnce(Job) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(policy) = self.policies.get(&job.job_class) else {
            return Ok(Gated::Ran(proceed(job).await));
        };

        let dedup_release = match &policy.dedup {
            Some(dedup) => dedup.on_before_perform(&job).await.err(),
            None => None,
        };
        if let Some(e) = &dedup_release {
            warn!(
                job_class = %job.job_class,
                job_id = %job.id_for_log(),
                error = %e,
                "Failed to release dedup lock before perform"
            );
        }

        let (decision, release_error) = match &policy.throttle {
            Some(throttle) => match throttle.on_perform(&job).await {
                Ok(decision) => (decision, dedup_release),
                Err(LimiterError::EnqueueReleaseFailed { decision, source }) => {
                    (decision, Some(LimiterError::EnqueueReleaseFailed { decision, source }))
                }
                Err(e) => return Err(e),
            },
            None => (Decision::Proceed, dedup_release),
        };

        if let Some(error) = release_error {
            match self.on_release_error {
                ReleaseErrorPolicy::Abort if decision.is_proceed() => {
                    if let Some(throttle) = &policy.throttle {
                        if let Err(e) = throttle.abort_perform(&job).await {
                            warn!(error = %e, "Failed to give back perform lock of aborted job");
                        }
                    }
                    return Err(error);
                }
                _ => {
                    warn!(
                        job_class = %job.job_class,
                        job_id = %job.id_for_log(),
                        error = %error,
                        decision = ?decision,
                        "Lock may be stuck until expiry"
                    );
                }
            }
        }

        match decision {
            Decision::Proceed => {
                if let Some(throttle) = &policy.throttle {
                    throttle.commit_perform(&job);
                }
                Ok(Gated::Ran(proceed(job).await))
            }
            Decision::Drop => {
                job.clear_identity();
                Ok(Gated::Dropped(job))
            }
            Decision::Reschedule(delay) => Ok(Gated::Rescheduled { delay }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::RecordingMetrics;
    use crate::scheduler::InMemoryScheduler;
    use crate::store::InMemoryLockStore;
    use crate::key::{enqueue_resource_id, LockKey, LockPhase};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    /// Acquires normally but cannot delete anything.
    struct StickyStore(InMemoryLockStore);

    #[async_trait]
    impl LockStore for StickyStore {
        async fn acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            self.0.acquire(key, value, ttl).await
        }

        async fn release(&self, _key: &str) -> Result<()> {
            Err(LimiterError::StoreUnavailable("delete refused".into()))
        }

        fn name(&self) -> &'static str {
            "sticky"
        }
    }

    struct Harness {
        limiter: Limiter,
        store: Arc<InMemoryLockStore>,
        scheduler: Arc<InMemoryScheduler>,
        metrics: Arc<RecordingMetrics>,
    }

    fn harness(yaml: &str) -> Harness {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryLockStore::new(clock.clone()));
        let scheduler = Arc::new(InMemoryScheduler::new(clock));
        let metrics = Arc::new(RecordingMetrics::new());
        let config = LimiterConfig::from_yaml(yaml).unwrap();
        let limiter =
            Limiter::from_config(&config, store.clone(), scheduler.clone(), metrics.clone()).unwrap();
        Harness {
            limiter,
            store,
            scheduler,
            metrics,
        }
    }

    const POLICIES: &str = r#"
jobs:
  LimitedJob:
    dedup:
      expiration_secs: 120
  ThrottledJob:
    throttle:
      duration_secs: 120
"#;

    #[tokio::test]
    async fn test_unlimited_job_passes_through() {
        let h = harness(POLICIES);

        for _ in 0..3 {
            let gated = h.limiter.enqueue(Job::new("StandardJob", vec![]), None).await;
            assert!(matches!(assert_ok!(gated), Gated::Ran(_)));
        }
        assert_eq!(h.scheduler.len(), 3);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_dedup_enqueue_drops_duplicate() {
        let h = harness(POLICIES);

        let first = h.limiter.enqueue(Job::new("LimitedJob", vec![]), None).await.unwrap();
        let second = h.limiter.enqueue(Job::new("LimitedJob", vec![]), None).await.unwrap();

        assert!(matches!(first, Gated::Ran(_)));
        match second {
            Gated::Dropped(job) => assert!(job.is_dropped()),
            other => panic!("expected drop, got {:?}", other),
        }
        assert_eq!(h.scheduler.len(), 1);
    }

    #[tokio::test]
    async fn test_dedup_perform_clears_lock_before_body() {
        let h = harness(POLICIES);
        let job = Job::new("LimitedJob", vec![]);
        h.limiter.enqueue(job.clone(), None).await.unwrap();

        let limiter = &h.limiter;
        let gated = limiter
            .around_perform(job, |_job| async move {
                // While the body runs, an identical job may be enqueued again
                limiter.enqueue(Job::new("LimitedJob", vec![]), None).await
            })
            .await
            .unwrap();

        let inner = gated.ran().unwrap().unwrap();
        assert!(matches!(inner, Gated::Ran(_)));
    }

    #[tokio::test]
    async fn test_throttle_perform_runs_body_once_per_window() {
        let h = harness(POLICIES);
        let job = Job::new("ThrottledJob", vec![json!("123")]);

        let first = h.limiter.around_perform(job.clone(), |_| async { 1 }).await.unwrap();
        let second = h.limiter.around_perform(job.clone(), |_| async { 2 }).await.unwrap();
        let third = h.limiter.around_perform(job, |_| async { 3 }).await.unwrap();

        assert_eq!(first.ran(), Some(1));
        assert!(matches!(second, Gated::Rescheduled { delay } if delay == Duration::from_secs(150)));
        assert!(third.is_dropped());
        assert_eq!(
            h.metrics.tags(),
            vec!["perform.performed", "perform.rescheduled", "perform.dropped"]
        );
        assert_eq!(h.scheduler.len(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_copy_passes_enqueue_gate() {
        let h = harness(POLICIES);

        let original = Job::new("ThrottledJob", vec![json!("123")]);
        h.limiter.enqueue(original.clone(), None).await.unwrap();

        let copy = original.reschedule_copy();
        let gated = h.limiter.enqueue(copy, Some(Duration::from_secs(150))).await.unwrap();

        assert!(matches!(gated, Gated::Ran(_)));
        assert_eq!(h.metrics.tags(), vec!["enqueue.enqueued", "enqueue.bypassed"]);
    }

    #[tokio::test]
    async fn test_failed_submission_releases_locks() {
        let h = harness(
            r#"
jobs:
  BothJob:
    dedup:
      expiration_secs: 60
    throttle:
      duration_secs: 60
"#,
        );
        let job = Job::new("BothJob", vec![json!("r1")]);

        let result = h
            .limiter
            .around_enqueue(job.clone(), |_| async {
                Err::<(), _>(LimiterError::Scheduler("queue closed".into()))
            })
            .await;

        assert_err!(result);
        assert!(h.store.is_empty());
        // Nothing was enqueued, so nothing is reported as enqueued
        assert!(h.metrics.tags().is_empty());
    }

    #[tokio::test]
    async fn test_throttle_drop_releases_dedup_lock() {
        let h = harness(
            r#"
jobs:
  BothJob:
    dedup:
      expiration_secs: 60
    throttle:
      duration_secs: 60
"#,
        );

        let a = Job::new("BothJob", vec![json!("r1"), json!(1)]);
        let b = Job::new("BothJob", vec![json!("r1"), json!(2)]);
        h.limiter.enqueue(a, None).await.unwrap();

        // Different arguments pass dedup but share the throttled resource
        let gated = h.limiter.enqueue(b.clone(), None).await.unwrap();
        assert!(gated.is_dropped());

        let dedup_key = LockKey::for_dedup("limiter", &b).unwrap();
        assert!(!h.store.contains(dedup_key.as_str()));
    }

    #[tokio::test]
    async fn test_dropped_job_is_not_submitted() {
        let h = harness(POLICIES);
        let mut job = Job::new("StandardJob", vec![]);
        job.clear_identity();

        let gated = h.limiter.enqueue(job, None).await.unwrap();
        assert!(gated.is_dropped());
        assert!(h.scheduler.is_empty());
    }

    fn sticky_limiter(policy: ReleaseErrorPolicy) -> Limiter {
        let clock = ManualClock::default();
        let store: Arc<dyn LockStore> = Arc::new(StickyStore(InMemoryLockStore::new(clock.clone())));
        let scheduler = Arc::new(InMemoryScheduler::new(clock));
        let config = LimiterConfig::from_yaml(POLICIES).unwrap();
        Limiter::from_config(&config, store, scheduler, Arc::new(RecordingMetrics::new()))
            .unwrap()
            .with_release_error_policy(policy)
    }

    #[tokio::test]
    async fn test_release_error_abort_skips_body() {
        let limiter = sticky_limiter(ReleaseErrorPolicy::Abort);

        let dedup = limiter
            .around_perform(Job::new("LimitedJob", vec![]), |_| async { "ran" })
            .await;
        assert!(matches!(dedup, Err(LimiterError::StoreUnavailable(_))));

        let throttle = limiter
            .around_perform(Job::new("ThrottledJob", vec![json!("1")]), |_| async { "ran" })
            .await;
        assert!(matches!(
            throttle,
            Err(LimiterError::EnqueueReleaseFailed {
                decision: Decision::Proceed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_release_error_proceed_runs_body() {
        let limiter = sticky_limiter(ReleaseErrorPolicy::Proceed);

        let dedup = limiter
            .around_perform(Job::new("LimitedJob", vec![]), |_| async { "ran" })
            .await
            .unwrap();
        assert_eq!(dedup.ran(), Some("ran"));

        let throttle = limiter
            .around_perform(Job::new("ThrottledJob", vec![json!("1")]), |_| async { "ran" })
            .await
            .unwrap();
        assert_eq!(throttle.ran(), Some("ran"));
    }

    /// In-memory store whose next release can be made to fail once.
    struct FlakyStore {
        inner: InMemoryLockStore,
        fail_next_release: AtomicBool,
    }

    impl FlakyStore {
        fn fail_next_release(&self) {
            self.fail_next_release.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LockStore for FlakyStore {
        async fn acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            self.inner.acquire(key, value, ttl).await
        }

        async fn release(&self, key: &str) -> Result<()> {
            if self.fail_next_release.swap(false, Ordering::SeqCst) {
                return Err(LimiterError::StoreUnavailable("connection reset".into()));
            }
            self.inner.release(key).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    struct FlakyHarness {
        limiter: Limiter,
        store: Arc<FlakyStore>,
        scheduler: Arc<InMemoryScheduler>,
        metrics: Arc<RecordingMetrics>,
    }

    fn flaky_harness() -> FlakyHarness {
        let clock = ManualClock::default();
        let store = Arc::new(FlakyStore {
            inner: InMemoryLockStore::new(clock.clone()),
            fail_next_release: AtomicBool::new(false),
        });
        let scheduler = Arc::new(InMemoryScheduler::new(clock));
        let metrics = Arc::new(RecordingMetrics::new());
        let config = LimiterConfig::from_yaml(
            r#"
jobs:
  ThrottledJob:
    throttle:
      duration_secs: 60
  BothJob:
    dedup:
      expiration_secs: 60
    throttle:
      duration_secs: 60
"#,
        )
        .unwrap();
        let limiter =
            Limiter::from_config(&config, store.clone(), scheduler.clone(), metrics.clone()).unwrap();
        FlakyHarness {
            limiter,
            store,
            scheduler,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_aborted_dedup_release_still_frees_throttle_locks() {
        let h = flaky_harness();
        let first = Job::new("BothJob", vec![json!("r1"), json!(1)]);
        h.limiter.enqueue(first.clone(), None).await.unwrap();
        h.scheduler.take_due();

        // The dedup release fails; the throttle protocol must still run
        h.store.fail_next_release();
        let result = h.limiter.around_perform(first, |_| async { "ran" }).await;
        assert!(matches!(result, Err(LimiterError::StoreUnavailable(_))));

        let enqueue_key = LockKey::for_resource(
            "limiter",
            "BothJob",
            &enqueue_resource_id("r1", "default"),
            LockPhase::Enqueue,
        );
        let perform_key = LockKey::for_resource("limiter", "BothJob", "r1", LockPhase::Perform);
        assert!(!h.store.inner.contains(enqueue_key.as_str()));
        assert!(!h.store.inner.contains(perform_key.as_str()));

        // A later request for the resource is accepted, not dropped
        let second = Job::new("BothJob", vec![json!("r1"), json!(2)]);
        let gated = h.limiter.enqueue(second, None).await.unwrap();
        assert!(matches!(gated, Gated::Ran(_)));
        assert_eq!(h.scheduler.len(), 1);
        assert_eq!(h.metrics.tags(), vec!["enqueue.enqueued", "enqueue.enqueued"]);
    }

    #[tokio::test]
    async fn test_aborted_perform_is_not_reported_and_frees_window() {
        let h = flaky_harness();
        let job = Job::new("ThrottledJob", vec![json!("r2")]);
        let counter = AtomicUsize::new(0);
        let runs = &counter;

        h.store.fail_next_release();
        let result = h
            .limiter
            .around_perform(job.clone(), |_| async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(matches!(
            result,
            Err(LimiterError::EnqueueReleaseFailed {
                decision: Decision::Proceed,
                ..
            })
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(h.metrics.tags().is_empty());

        // The window was not consumed by the aborted attempt
        let gated = h
            .limiter
            .around_perform(job, |_| async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert!(matches!(gated, Gated::Ran(())));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.metrics.tags(), vec!["perform.performed"]);
    }

    #[tokio::test]
    async fn test_rejected_submission_is_not_reported_as_enqueued() {
        let h = harness(POLICIES);

        let result = h
            .limiter
            .around_enqueue(Job::new("ThrottledJob", vec![json!("9")]), |_| async {
                Err::<(), _>(LimiterError::Scheduler("queue closed".into()))
            })
            .await;

        assert_err!(result);
        assert!(h.metrics.tags().is_empty());
        assert!(h.store.is_empty());
    }
}
