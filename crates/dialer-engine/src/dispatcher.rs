//! # Origination Dispatcher
//!
//! Turns pending [`OriginateJob`]s into provider calls. Jobs are claimed atomically, so
//! several dispatchers may poll the same store. For each job the dispatcher moves the
//! attempt to `RESERVING`, picks a route, asks the trunk's rate limiter for admission and,
//! once admitted, marks the attempt `ORIGINATING` before handing the call to the
//! [`SignalingAdapter`] on a background task.
//!
//! A denial puts the job back with `not_before = now + retry_after`. After
//! `max_rate_limit_retries` denials the attempt fails with `ORIGINATE_FAILED`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::attempt::{CallAttempt, CallEvent, CallState, CallStateMachine, TimerKind, TransitionOutcome};
use crate::config::{DispatcherConfig, TimerConfig};
use crate::database::{DialerDatabase, OriginateJob};
use crate::error::{DialerError, Result};
use crate::integration::{OriginationRequest, OutboundRoute, RouteProvider, SignalingAdapter};
use crate::monitoring::{DialerEvent, DialerEvents};
use crate::rate_limit::{Admission, TrunkRateLimiter};

/// Counts from one dispatch pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: u32,
    /// Handed to the signaling adapter
    pub dispatched: u32,
    /// Put back for a later pass
    pub requeued: u32,
    pub failed: u32,
}

/// What happened to one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobResult {
    Dispatched,
    Requeued,
    Failed,
}

pub struct OriginateDispatcher {
    db: DialerDatabase,
    machine: CallStateMachine,
    limiter: TrunkRateLimiter,
    routes: Arc<dyn RouteProvider>,
    adapter: Arc<dyn SignalingAdapter>,
    config: DispatcherConfig,
    timers: TimerConfig,
    events: DialerEvents,
    inflight: Mutex<JoinSet<()>>,
}

impl OriginateDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine: CallStateMachine,
        limiter: TrunkRateLimiter,
        routes: Arc<dyn RouteProvider>,
        adapter: Arc<dyn SignalingAdapter>,
        config: DispatcherConfig,
        timers: TimerConfig,
        events: DialerEvents,
    ) -> Self {
        Self {
            db: machine.database().clone(),
            machine,
            limiter,
            routes,
            adapter,
            config,
            timers,
            events,
            inflight: Mutex::new(JoinSet::new()),
        }
    }

    pub async fn dispatch_due(&self) -> Result<DispatchReport> {
        self.dispatch_due_at(Utc::now()).await
    }

    /// Claim and process every job due at `now`
    pub async fn dispatch_due_at(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        self.reap_finished().await;

        let jobs = self
            .db
            .claim_due_jobs(now, self.config.claim_lease(), self.config.batch_size)
            .await?;
        let mut report = DispatchReport {
            claimed: jobs.len() as u32,
            ..Default::default()
        };

        for job in jobs {
            let result = match self.dispatch_job(&job, now).await {
                Ok(result) => result,
                Err(e) => {
                    error!("Job {} for attempt {} failed: {}", job.job_id, job.attempt_id, e);
                    self.retry_or_fail(&job, now, self.config.default_retry_after_ms, &e.to_string())
                        .await
                        .unwrap_or_else(|e| {
                            error!("Job {} could not be re-queued: {}", job.job_id, e);
                            JobResult::Failed
                        })
                }
            };
            match result {
                JobResult::Dispatched => report.dispatched += 1,
                JobResult::Requeued => report.requeued += 1,
                JobResult::Failed => report.failed += 1,
            }
        }

        if report.claimed > 0 {
            debug!("Dispatch pass: {:?}", report);
        }
        Ok(report)
    }

    /// Wait for every adapter call started so far to return
    pub async fn wait_for_inflight(&self) {
        let mut inflight = self.inflight.lock().await;
        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                warn!("Origination task ended abnormally: {}", e);
            }
        }
    }

    async fn reap_finished(&self) {
        let mut inflight = self.inflight.lock().await;
        while let Some(Some(joined)) = inflight.join_next().now_or_never() {
            if let Err(e) = joined {
                warn!("Origination task ended abnormally: {}", e);
            }
        }
    }

    async fn dispatch_job(&self, job: &OriginateJob, now: DateTime<Utc>) -> Result<JobResult> {
        let attempt = self
            .db
            .get_attempt(&job.attempt_id)
            .await?
            .ok_or_else(|| DialerError::not_found(format!("call attempt {}", job.attempt_id)))?;

        if attempt.state.is_terminal() {
            debug!("Job {}: attempt {} already {}", job.job_id, attempt.attempt_id, attempt.state);
            self.db
                .fail_job(&job.job_id, &format!("attempt already {}", attempt.state))
                .await?;
            return Ok(JobResult::Failed);
        }

        if attempt.state == CallState::Queued {
            let outcome = self.machine.post_event_at(&attempt.attempt_id, CallEvent::Reserved, now).await?;
            if !outcome.is_applied() {
                return self.abandon_job(job, &attempt, outcome.state()).await;
            }
        } else if attempt.state != CallState::Reserving {
            return self.abandon_job(job, &attempt, attempt.state).await;
        }

        let campaign = self.db.get_campaign(&attempt.campaign_id).await?;
        let route = match self.routes.select_route(&attempt).await {
            Ok(route) => route,
            Err(e) => match campaign.as_ref().and_then(|c| c.dial_config.trunk_id.clone()) {
                Some(trunk_id) => {
                    debug!("Job {}: route selection failed ({}), using campaign trunk", job.job_id, e);
                    OutboundRoute {
                        trunk_id,
                        caller_id: None,
                        carrier: None,
                    }
                }
                None => {
                    let err = DialerError::signaling(format!("route selection: {:#}", e));
                    warn!("Job {}: {}", job.job_id, err);
                    return self
                        .retry_or_fail(job, now, self.config.default_retry_after_ms, &err.to_string())
                        .await;
                }
            },
        };

        let admission = self
            .limiter
            .acquire_at(&route.trunk_id, Some(&attempt.campaign_id), Some(&attempt.destination), now)
            .await?;
        if let Admission::Denied { retry_after_ms, .. } = admission {
            return self
                .retry_or_fail(job, now, retry_after_ms, &format!("trunk {} throttled", route.trunk_id))
                .await;
        }

        let sent = match self
            .machine
            .post_event_at(
                &attempt.attempt_id,
                CallEvent::OriginateSent {
                    trunk_id: Some(route.trunk_id.clone()),
                    caller_id: route.caller_id.clone(),
                },
                now,
            )
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                // Nothing was sent, so the admitted slot goes back to the trunk
                if let Err(release_err) = self.limiter.release(&route.trunk_id).await {
                    error!("Trunk {}: could not release slot: {}", route.trunk_id, release_err);
                }
                return Err(e);
            }
        };
        if !sent.is_applied() {
            // The attempt moved on (cancelled, failed) while we were admitting it
            self.limiter.release(&route.trunk_id).await?;
            return self.abandon_job(job, &attempt, sent.state()).await;
        }

        self.db.mark_job_dispatched(&job.job_id, now).await?;

        let ring_timeout = match &campaign {
            Some(c) => c.dial_config.timer_duration(TimerKind::RingTimeout, &self.timers),
            None => std::time::Duration::from_secs(self.timers.ring_timeout_secs),
        };
        let request = OriginationRequest {
            attempt_id: attempt.attempt_id.clone(),
            campaign_id: attempt.campaign_id.clone(),
            destination: attempt.destination.clone(),
            trunk_id: route.trunk_id,
            caller_id: route.caller_id,
            carrier: route.carrier,
            ring_timeout,
        };
        self.spawn_originate(request).await;

        info!("Dispatched attempt {} to {}", attempt.attempt_id, attempt.destination);
        Ok(JobResult::Dispatched)
    }

    async fn spawn_originate(&self, request: OriginationRequest) {
        let adapter = self.adapter.clone();
        let machine = self.machine.clone();
        let db = self.db.clone();

        self.inflight.lock().await.spawn(async move {
            match adapter.originate(&request).await {
                Ok(provider_call_id) => {
                    if let Err(e) = db.set_provider_call_id(&request.attempt_id, &provider_call_id).await {
                        error!(
                            "Attempt {}: failed to store provider call id {}: {}",
                            request.attempt_id, provider_call_id, e
                        );
                    }
                }
                Err(e) => {
                    let err = DialerError::signaling(format!("{:#}", e));
                    warn!("Attempt {}: origination failed: {}", request.attempt_id, err);
                    let event = CallEvent::OriginateFailed {
                        reason: err.to_string(),
                    };
                    if let Err(e) = machine.post_event(&request.attempt_id, event).await {
                        error!("Attempt {}: could not record origination failure: {}", request.attempt_id, e);
                    }
                }
            }
        });
    }

    /// Re-queue a job after `retry_after_ms`, or fail its attempt once retries run out
    async fn retry_or_fail(
        &self,
        job: &OriginateJob,
        now: DateTime<Utc>,
        retry_after_ms: u64,
        reason: &str,
    ) -> Result<JobResult> {
        if job.retry_count + 1 > self.config.max_rate_limit_retries {
            warn!(
                "Job {}: giving up after {} retries ({})",
                job.job_id, job.retry_count, reason
            );
            let outcome = self
                .machine
                .post_event_at(
                    &job.attempt_id,
                    CallEvent::OriginateFailed {
                        reason: reason.to_string(),
                    },
                    now,
                )
                .await?;
            if let TransitionOutcome::Ignored { state, .. } = outcome {
                debug!("Job {}: attempt was already {}", job.job_id, state);
            }
            self.db.fail_job(&job.job_id, reason).await?;
            self.events.publish(DialerEvent::JobFailed {
                job_id: job.job_id.clone(),
                attempt_id: job.attempt_id.clone(),
                reason: reason.to_string(),
            });
            return Ok(JobResult::Failed);
        }

        let not_before = now + chrono::Duration::milliseconds(retry_after_ms as i64);
        self.db.requeue_job(&job.job_id, not_before, reason).await?;
        debug!(
            "Job {}: re-queued for {} ({}, retry {})",
            job.job_id,
            not_before,
            reason,
            job.retry_count + 1
        );
        Ok(JobResult::Requeued)
    }

    /// Drop a job whose attempt is no longer originatable
    async fn abandon_job(&self, job: &OriginateJob, attempt: &CallAttempt, state: CallState) -> Result<JobResult> {
        let reason = format!("attempt {} is {}", attempt.attempt_id, state);
        debug!("Job {}: {}", job.job_id, reason);
        self.db.fail_job(&job.job_id, &reason).await?;
        Ok(JobResult::Failed)
    }
}
