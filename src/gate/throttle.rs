//! Bounds how often a job-resource pair executes without losing requests.
//!
//! Dropping a request is only safe when an equivalent run is already
//! guaranteed. Two lock slots provide that guarantee: the `enqueue` lock (an
//! equivalent job is queued and has not started) and the `reschedule` lock
//! (a retry past the current window has been submitted). Every other request
//! either runs or registers a reschedule.
//!
//! Per resource the locks move `Idle -> EnqueueLocked -> Performing -> Idle`,
//! with `RescheduleLocked` entered on perform contention. All transitions are
//! explicit releases or TTL expiry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::decision::{Decision, GateOutcome};
use crate::error::{LimiterError, Result};
use crate::extractor::ResourceExtractor;
use crate::job::Job;
use crate::key::{enqueue_resource_id, LockKey, LockPhase, DEFAULT_NAMESPACE};
use crate::metrics::{emit, MetricsSink, NoopMetrics};
use crate::scheduler::JobScheduler;
use crate::store::LockStore;

/// Default margin applied to the throttle duration when rescheduling.
///
/// Must stay above 1.0 so the perform lock has expired at the store before
/// the retry runs, even with clock skew between this process and the store.
pub const DEFAULT_RESCHEDULE_MULTIPLIER: f64 = 1.25;

/// Timing of a throttle gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottlePolicy {
    duration: Duration,
    reschedule_multiplier: f64,
}

impl ThrottlePolicy {
    /// At most one run per `duration`, rescheduling with the default margin.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            reschedule_multiplier: DEFAULT_RESCHEDULE_MULTIPLIER,
        }
    }

    /// Override the reschedule margin. Rejects values not above 1.0.
    pub fn with_reschedule_multiplier(mut self, multiplier: f64) -> Result<Self> {
        if !(multiplier.is_finite() && multiplier > 1.0) {
            return Err(LimiterError::Config(format!(
                "reschedule multiplier must be greater than 1.0, got {}",
                multiplier
            )));
        }
        self.reschedule_multiplier = multiplier;
        Ok(self)
    }

    /// Throttle window; also the TTL of every lock slot.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The configured reschedule margin.
    pub fn reschedule_multiplier(&self) -> f64 {
        self.reschedule_multiplier
    }

    /// Delay given to a rescheduled copy: `duration * multiplier`.
    pub fn reschedule_delay(&self) -> Duration {
        self.duration.mul_f64(self.reschedule_multiplier)
    }
}

/// The three-lock throttle protocol for one job class.
#[derive(Clone)]
pub struct ThrottleGate {
    store: Arc<dyn LockStore>,
    scheduler: Arc<dyn JobScheduler>,
    extractor: Arc<dyn ResourceExtractor>,
    metrics: Arc<dyn MetricsSink>,
    namespace: String,
    policy: ThrottlePolicy,
}

impl ThrottleGate {
    /// Create a gate with a no-op metrics sink and the default namespace.
    pub fn new(
        store: Arc<dyn LockStore>,
        scheduler: Arc<dyn JobScheduler>,
        extractor: Arc<dyn ResourceExtractor>,
        policy: ThrottlePolicy,
    ) -> Self {
        Self {
            store,
            scheduler,
            extractor,
            metrics: Arc::new(NoopMetrics),
            namespace: DEFAULT_NAMESPACE.to_string(),
            policy,
        }
    }

    /// Report outcomes to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use a different key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// The gate's timing.
    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    fn key(&self, job: &Job, resource_id: &str, phase: LockPhase) -> LockKey {
        LockKey::for_resource(&self.namespace, &job.job_class, resource_id, phase)
    }

    fn enqueue_key(&self, job: &Job, resource_id: &str) -> LockKey {
        self.key(
            job,
            &enqueue_resource_id(resource_id, &job.queue_name),
            LockPhase::Enqueue,
        )
    }

    /// Enqueue phase.
    ///
    /// Reschedule copies pass unconditionally. Otherwise the job proceeds iff
    /// it takes the enqueue lock for its resource on its queue; failing that,
    /// an equivalent job is queued and not yet started, so this one drops.
    /// A proceeding job is reported by [`ThrottleGate::commit_enqueue`] once
    /// its submission succeeds.
    pub async fn on_enqueue(&self, job: &Job) -> Result<Decision> {
        if job.skip_throttle_gate {
            debug!(job_id = %job.id_for_log(), "Reschedule copy bypasses enqueue lock");
            return Ok(Decision::Proceed);
        }

        let resource_id = self.extractor.extract(job)?;
        let key = self.enqueue_key(job, &resource_id);
        let value = job.serialized_arguments()?;

        if self
            .store
            .acquire(key.as_str(), &value, self.policy.duration)
            .await?
        {
            debug!(key = %key, job_id = %job.id_for_log(), "Enqueue lock acquired");
            Ok(Decision::Proceed)
        } else {
            debug!(key = %key, job_id = %job.id_for_log(), "Equivalent job pending, dropping");
            emit(self.metrics.as_ref(), GateOutcome::EnqueueDropped, job);
            Ok(Decision::Drop)
        }
    }

    /// Report a job that passed [`ThrottleGate::on_enqueue`] and was submitted.
    pub fn commit_enqueue(&self, job: &Job) {
        let outcome = if job.skip_throttle_gate {
            GateOutcome::EnqueueBypassed
        } else {
            GateOutcome::Enqueued
        };
        emit(self.metrics.as_ref(), outcome, job);
    }

    /// Undo a successful enqueue whose submission then failed.
    ///
    /// Without this the enqueue lock would keep dropping requests for a job
    /// that was never queued.
    pub async fn rollback_enqueue(&self, job: &Job) -> Result<()> {
        if job.skip_throttle_gate {
            return Ok(());
        }
        let resource_id = self.extractor.extract(job)?;
        let key = self.enqueue_key(job, &resource_id);
        self.store.release(key.as_str()).await?;
        debug!(key = %key, job_id = %job.id_for_log(), "Enqueue lock rolled back");
        Ok(())
    }

    /// Perform phase.
    ///
    /// Releases the enqueue lock first, then tries the perform lock, then the
    /// reschedule lock. On [`Decision::Reschedule`] the copy has already been
    /// submitted. On [`Decision::Proceed`] the caller either runs the body
    /// after [`ThrottleGate::commit_perform`] or gives the perform lock back
    /// with [`ThrottleGate::abort_perform`].
    ///
    /// A failed release does not stop the attempt; it is returned afterwards
    /// as [`LimiterError::EnqueueReleaseFailed`] with the decision, or as
    /// [`LimiterError::PerformAfterReleaseFailed`] if the attempt failed too.
    pub async fn on_perform(&self, job: &Job) -> Result<Decision> {
        let resource_id = self.extractor.extract(job)?;
        let enqueue_key = self.enqueue_key(job, &resource_id);

        let released = self.store.release(enqueue_key.as_str()).await;
        if let Err(ref e) = released {
            warn!(key = %enqueue_key, error = %e, "Failed to release enqueue lock before perform");
        }

        let attempt = self.decide_perform(job, &resource_id).await;

        match (released, attempt) {
            (Ok(()), attempt) => attempt,
            (Err(release), Ok(decision)) => Err(LimiterError::EnqueueReleaseFailed {
                decision,
                source: Box::new(release),
            }),
            (Err(release), Err(source)) => Err(LimiterError::PerformAfterReleaseFailed {
                release: Box::new(release),
                source: Box::new(source),
            }),
        }
    }

    /// Report that the body of a proceeding job is about to run.
    pub fn commit_perform(&self, job: &Job) {
        emit(self.metrics.as_ref(), GateOutcome::Performed, job);
    }

    /// Give back the perform lock of a proceeding job whose body will not run.
    pub async fn abort_perform(&self, job: &Job) -> Result<()> {
        let resource_id = self.extractor.extract(job)?;
        let key = self.key(job, &resource_id, LockPhase::Perform);
        self.store.release(key.as_str()).await?;
        debug!(key = %key, job_id = %job.id_for_log(), "Perform lock given back");
        Ok(())
    }

    async fn decide_perform(&self, job: &Job, resource_id: &str) -> Result<Decision> {
        let value = job.serialized_arguments()?;
        let ttl = self.policy.duration;

        let perform_key = self.key(job, resource_id, LockPhase::Perform);
        if self.store.acquire(perform_key.as_str(), &value, ttl).await? {
            debug!(key = %perform_key, job_id = %job.id_for_log(), "Perform lock acquired");
            return Ok(Decision::Proceed);
        }

        let reschedule_key = self.key(job, resource_id, LockPhase::Reschedule);
        if !self.store.acquire(reschedule_key.as_str(), &value, ttl).await? {
            debug!(key = %reschedule_key, job_id = %job.id_for_log(), "Retry already registered, dropping");
            emit(self.metrics.as_ref(), GateOutcome::PerformDropped, job);
            return Ok(Decision::Drop);
        }

        let delay = self.policy.reschedule_delay();
        let copy = job.reschedule_copy();
        if let Err(e) = self.scheduler.submit(copy, Some(delay), &job.queue_name).await {
            // The reschedule lock promises a retry that does not exist
            if let Err(release_err) = self.store.release(reschedule_key.as_str()).await {
                warn!(key = %reschedule_key, error = %release_err, "Failed to release reschedule lock");
            }
            return Err(e);
        }

        debug!(
            key = %reschedule_key,
            job_id = %job.id_for_log(),
            delay = ?delay,
            "Perform lock held, rescheduled"
        );
        emit(self.metrics.as_ref(), GateOutcome::Rescheduled, job);
        Ok(Decision::Reschedule(delay))
    }
}

impl std::fmt::Debug for ThrottleGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleGate")
            .field("store", &self.store.name())
            .field("namespace", &self.namespace)
            .field("policy", &self.policy)
            .finish()
    }
}
