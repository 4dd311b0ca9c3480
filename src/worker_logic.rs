// src/worker_logic.rs

use crate::backend::{QueueDelivery, QueueTier, TaskQueue};
use crate::data_model::{Document, Job, JobStatus, ProcessMessage};
use crate::error::{PipelineError, Result};
use crate::executor::{ExecutorRegistry, StageOutput};
use crate::idempotency::{derive_key, BeginOutcome, IdempotencyStore};
use crate::quota::{QuotaEnforcer, QuotaType};
use crate::review::ReviewEvaluator;
use crate::router::Router;
use crate::state::StateStore;
use crate::timeout::TimeoutEnforcer;
use crate::utils::metrics::{
    ACTIVE_RUNNING_JOBS, JOBS_COMPLETED_TOTAL, JOBS_FAILED_TOTAL, JOB_EXECUTION_DURATION_SECONDS,
    LATE_RESULTS_DISCARDED_TOTAL,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Scope string for the per-(doc, step) runner guard.
const STEP_SCOPE: &str = "step";

fn step_guard_key(msg: &ProcessMessage) -> String {
    derive_key(STEP_SCOPE, &format!("{}:{}", msg.doc_id, msg.step), None)
}

/// One stage worker: pulls process messages, claims the job, runs the stage
/// under watchdog monitoring, then hands the terminal job back to the router.
pub struct StageWorker {
    queue: Arc<dyn TaskQueue>,
    state: StateStore,
    guard: Arc<IdempotencyStore>,
    quota: Arc<QuotaEnforcer>,
    timeouts: Arc<TimeoutEnforcer>,
    review: Arc<ReviewEvaluator>,
    router: Arc<Router>,
    executors: ExecutorRegistry,
    instance_id: String,
    heartbeat_interval: Duration,
}

impl StageWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        state: StateStore,
        guard: Arc<IdempotencyStore>,
        quota: Arc<QuotaEnforcer>,
        timeouts: Arc<TimeoutEnforcer>,
        review: Arc<ReviewEvaluator>,
        router: Arc<Router>,
        executors: ExecutorRegistry,
        instance_id: String,
        heartbeat_interval: Duration,
    ) -> Self {
        StageWorker {
            queue,
            state,
            guard,
            quota,
            timeouts,
            review,
            router,
            executors,
            instance_id,
            heartbeat_interval,
        }
    }

    /// Consume loop: blocks on the queue and processes messages until the
    /// queue errors out.
    pub async fn run(&self) -> Result<()> {
        info!(instance_id = %self.instance_id, "Stage worker consuming");
        loop {
            let delivery = self.queue.dequeue().await?;
            self.handle_delivery(delivery).await;
        }
    }

    pub async fn handle_delivery(&self, delivery: QueueDelivery) {
        let msg = delivery.message.clone();
        let span = info_span!("process_job", job_id = %msg.job_id, doc_id = %msg.doc_id, step = %msg.step);
        match self.process_message(&msg).instrument(span).await {
            Ok(()) => {
                if let Err(ack_err) = self.queue.ack(delivery).await {
                    error!(error = %ack_err, "Failed to ack task message");
                }
            }
            Err(e) => {
                // Backend trouble before the job reached a terminal status:
                // the job record is still Pending, so the message must come
                // back rather than be swallowed by an ack.
                error!(job_id = %msg.job_id, error = %e, "Failed to process job message; returning it to the queue");
                if let Err(nack_err) = self.queue.nack(delivery).await {
                    error!(error = %nack_err, "Failed to nack task message");
                }
            }
        }
    }

    /// Executes one process message end to end.
    pub async fn process_message(&self, msg: &ProcessMessage) -> Result<()> {
        let job = match self.state.get_job(&msg.job_id).await? {
            Some(job) => job,
            None => {
                warn!("Process message for unknown job; dropping");
                return Ok(());
            }
        };
        if job.status != JobStatus::Pending {
            debug!(status = ?job.status, "Stale process message; job already claimed");
            return Ok(());
        }
        let document = match self.state.get_document(&msg.doc_id).await? {
            Some(doc) => doc,
            None => {
                warn!("Job references a missing document; dropping");
                return Ok(());
            }
        };

        // Instantaneous-load gate: an org at its concurrency ceiling keeps
        // its work queued, not failed.
        if !self
            .quota
            .check(&document.owner_id, QuotaType::ConcurrentJobs, 1)
            .await
        {
            debug!(org_id = %document.owner_id, "Org at its concurrent_jobs limit; deferring");
            self.requeue_later(msg).await;
            return Ok(());
        }

        // At-most-one runner per (doc, step): the conditional insert is the
        // ordering primitive, the status claim below is the second lock.
        let guard_key = step_guard_key(msg);
        match self.guard.begin(&guard_key, None).await? {
            BeginOutcome::Proceed => {}
            BeginOutcome::DuplicateInProgress => {
                // The guard holder may still be between its begin and its
                // Pending->Running claim, so the job cannot be touched here.
                // Redeliver later; if the holder finished or aborted by then,
                // the next pass settles the job.
                debug!("Another attempt for this (doc, step) is running; deferring");
                self.requeue_later(msg).await;
                return Ok(());
            }
            BeginOutcome::DuplicateCompleted(_) => {
                debug!("This (doc, step) already completed; skipping");
                self.mark_skipped(&msg.job_id, "step already completed").await;
                return Ok(());
            }
        }

        let instance = self.instance_id.clone();
        let claimed = self
            .state
            .transition_job(&msg.job_id, JobStatus::Pending, move |j| {
                j.status = JobStatus::Running;
                j.started_at = Some(Utc::now());
                j.worker_instance_id = Some(instance.clone());
            })
            .await?;
        let job = match claimed {
            Some(job) => job,
            None => {
                // Lost the claim race; release the guard for the winner's
                // commit/abort to settle.
                self.guard.abort(&guard_key).await?;
                debug!("Job claim lost; another worker owns it");
                return Ok(());
            }
        };

        self.state
            .transition_document(&job.doc_id, crate::data_model::DocumentStatus::Processing, |_| {})
            .await?;

        self.execute_claimed(job, document, &guard_key).await
    }

    async fn execute_claimed(&self, job: Job, document: Document, guard_key: &str) -> Result<()> {
        let org_id = document.owner_id.clone();

        // Instantaneous load tracking: up at start, down at end, regardless
        // of outcome.
        if let Err(e) = self.quota.increment(&org_id, QuotaType::ConcurrentJobs, 1).await {
            warn!(error = %e, "Failed to increment concurrent_jobs");
        }
        ACTIVE_RUNNING_JOBS.inc();
        let timer = JOB_EXECUTION_DURATION_SECONDS.start_timer();

        let result = self.execute_monitored(&job, &document, guard_key).await;

        timer.observe_duration();
        ACTIVE_RUNNING_JOBS.dec();
        if let Err(e) = self.quota.decrement(&org_id, QuotaType::ConcurrentJobs, 1).await {
            warn!(error = %e, "Failed to decrement concurrent_jobs");
        }
        result
    }

    async fn execute_monitored(
        &self,
        job: &Job,
        document: &Document,
        guard_key: &str,
    ) -> Result<()> {
        // Paid work is admitted only inside quota.
        if !self
            .quota
            .check(&document.owner_id, QuotaType::ProcessingMonthly, 1)
            .await
        {
            let failed = self
                .state
                .transition_job(&job.job_id, JobStatus::Running, |j| {
                    j.status = JobStatus::Failed;
                    j.completed_at = Some(Utc::now());
                    j.error_message = Some("processing_monthly quota exceeded".to_string());
                })
                .await?;
            self.guard.abort(guard_key).await?;
            if let Some(failed) = failed {
                JOBS_FAILED_TOTAL.inc();
                self.router.advance(&failed).await?;
            }
            return Ok(());
        }

        let executor = self.executors.get(job.step)?;
        let signal = self.timeouts.start(job).await;

        // Heartbeats run beside execution, never blocking it.
        let heartbeat_task = {
            let timeouts = Arc::clone(&self.timeouts);
            let job_id = job.job_id.clone();
            let instance_id = self.instance_id.clone();
            let interval = self.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // immediate first tick
                loop {
                    ticker.tick().await;
                    timeouts.heartbeat(&job_id, &instance_id).await;
                }
            })
        };

        let outcome = tokio::select! {
            fired = signal.fired() => {
                heartbeat_task.abort();
                return self.handle_timeout(job, guard_key, fired).await;
            }
            result = executor.execute(job, document) => {
                heartbeat_task.abort();
                self.timeouts.complete(&job.job_id).await;
                result
            }
        };

        match outcome {
            Ok(output) => self.handle_success(job, document, guard_key, output).await,
            Err(e) => self.handle_failure(job, guard_key, e).await,
        }
    }

    async fn handle_timeout(
        &self,
        job: &Job,
        guard_key: &str,
        fired: Option<crate::timeout::TimeoutReason>,
    ) -> Result<()> {
        // The enforcer already marked the job; re-read for the actual state.
        self.guard.abort(guard_key).await?;
        let current = self.state.get_job(&job.job_id).await?;
        match current {
            Some(current) if current.status == JobStatus::TimedOut => {
                debug!(reason = ?fired, "Handing timed-out job to the router");
                self.router.advance(&current).await
            }
            Some(current) if current.status == JobStatus::Cancelled => {
                info!("Job was cancelled by an operator; not advancing");
                Ok(())
            }
            other => {
                warn!(status = ?other.map(|j| j.status), "Timeout signal with unexpected job state");
                Ok(())
            }
        }
    }

    async fn handle_success(
        &self,
        job: &Job,
        document: &Document,
        guard_key: &str,
        output: StageOutput,
    ) -> Result<()> {
        let assessment = self
            .review
            .evaluate(&job.doc_id, &output.confidence_scores);
        let output_payload = json!({
            "data": output.output_data,
            "review": assessment,
        });

        // Check-then-set from running: if the watchdog or an operator moved
        // the status first, this late result is discarded.
        let payload = output_payload.clone();
        let completed = self
            .state
            .transition_job(&job.job_id, JobStatus::Running, move |j| {
                j.status = JobStatus::Completed;
                j.completed_at = Some(Utc::now());
                j.output_data = payload.clone();
            })
            .await?;

        let completed = match completed {
            Some(job) => job,
            None => {
                LATE_RESULTS_DISCARDED_TOTAL.inc();
                warn!("Stage finished after its attempt was terminated; discarding late result");
                self.guard.abort(guard_key).await?;
                return Ok(());
            }
        };

        let artifacts = output.artifacts.clone();
        let needs_review = assessment.needs_review;
        let review_priority = assessment.priority;
        self.state
            .transition_document(
                &job.doc_id,
                crate::data_model::DocumentStatus::Processing,
                move |d| {
                    d.artifacts.extend(artifacts.clone());
                    if needs_review {
                        d.metadata
                            .insert("needs_review".to_string(), "true".to_string());
                        d.metadata.insert(
                            "review_priority".to_string(),
                            format!("{:?}", review_priority).to_lowercase(),
                        );
                    }
                },
            )
            .await?;

        // Paid-work usage counts only after success.
        if let Err(e) = self
            .quota
            .increment(&document.owner_id, QuotaType::ProcessingMonthly, 1)
            .await
        {
            warn!(error = %e, "Failed to increment processing_monthly after success");
        }

        self.guard
            .commit(guard_key, json!({"job_id": completed.job_id}))
            .await?;
        JOBS_COMPLETED_TOTAL.inc();
        self.router.advance(&completed).await
    }

    async fn handle_failure(&self, job: &Job, guard_key: &str, error: PipelineError) -> Result<()> {
        let message = error.to_string();
        let failed = self
            .state
            .transition_job(&job.job_id, JobStatus::Running, move |j| {
                j.status = JobStatus::Failed;
                j.completed_at = Some(Utc::now());
                j.error_message = Some(message.clone());
            })
            .await?;
        self.guard.abort(guard_key).await?;
        match failed {
            Some(failed) => {
                JOBS_FAILED_TOTAL.inc();
                warn!(error = %error, "Stage execution failed");
                self.router.advance(&failed).await
            }
            None => {
                // Timed out or cancelled while failing; that path advances.
                debug!("Failure landed after the attempt was terminated");
                Ok(())
            }
        }
    }

    /// Puts the message back on its tier with a delay, leaving the job record
    /// untouched.
    async fn requeue_later(&self, msg: &ProcessMessage) {
        let tier = QueueTier::for_priority(msg.priority);
        if let Err(e) = self
            .queue
            .enqueue(tier, msg, Some(self.heartbeat_interval))
            .await
        {
            error!(job_id = %msg.job_id, error = %e, "Failed to requeue deferred message");
        }
    }

    async fn mark_skipped(&self, job_id: &str, reason: &str) {
        let reason = reason.to_string();
        let marked = self
            .state
            .transition_job(job_id, JobStatus::Pending, move |j| {
                j.status = JobStatus::Skipped;
                j.completed_at = Some(Utc::now());
                j.error_message = Some(reason.clone());
            })
            .await;
        if let Err(e) = marked {
            warn!(job_id, error = %e, "Failed to mark job skipped");
        }
    }
}
