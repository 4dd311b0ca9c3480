use crate::config::TimeoutSettings;
use crate::data_model::{Job, JobStatus};
use crate::error::Result;
use crate::state::StateStore;
use crate::utils::metrics::{HEARTBEATS_RECORDED_TOTAL, JOBS_TIMED_OUT_TOTAL};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    ExecutionTimeout,
    HeartbeatTimeout,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutReason::ExecutionTimeout => f.write_str("execution_timeout"),
            TimeoutReason::HeartbeatTimeout => f.write_str("heartbeat_timeout"),
        }
    }
}

/// Passed to the registered timeout callback when a watchdog fires.
#[derive(Debug, Clone)]
pub struct TimeoutEvent {
    pub job_id: String,
    pub doc_id: String,
    pub step: String,
    pub reason: TimeoutReason,
}

pub type TimeoutCallback = Arc<dyn Fn(&TimeoutEvent) + Send + Sync>;

/// Resolves when the watchdog for a job fires. `None` means monitoring ended
/// without a timeout (operator stop); the caller should re-read the job to
/// learn its fate.
pub struct TimeoutSignal {
    rx: oneshot::Receiver<TimeoutReason>,
}

impl TimeoutSignal {
    pub async fn fired(self) -> Option<TimeoutReason> {
        self.rx.await.ok()
    }
}

struct MonitorHandle {
    // Dropping the sender wakes the watchdog task and ends monitoring.
    _done: watch::Sender<()>,
    last_heartbeat: Arc<StdMutex<Instant>>,
}

/// Heartbeat/execution-time watchdog per running job.
///
/// Each monitored job gets one background task owning both watchers: an
/// execution deadline at the step-specific ceiling, and a heartbeat check
/// that fires when a beat is missed by more than one interval. The task exits
/// on completion, stop, or fire, so the common completion path leaks nothing.
pub struct TimeoutEnforcer {
    state: StateStore,
    settings: TimeoutSettings,
    monitors: Arc<Mutex<HashMap<String, MonitorHandle>>>,
    callback: Option<TimeoutCallback>,
}

impl TimeoutEnforcer {
    pub fn new(state: StateStore, settings: TimeoutSettings) -> Self {
        TimeoutEnforcer {
            state,
            settings,
            monitors: Arc::new(Mutex::new(HashMap::new())),
            callback: None,
        }
    }

    /// Registers a callback invoked whenever a watchdog marks a job timed out
    /// (structured alerting hook).
    pub fn with_callback(mut self, callback: TimeoutCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub async fn monitored_count(&self) -> usize {
        self.monitors.lock().await.len()
    }

    /// Starts both watchers for `job` and returns the signal the worker
    /// selects on alongside stage execution.
    pub async fn start(&self, job: &Job) -> TimeoutSignal {
        let (done_tx, mut done_rx) = watch::channel(());
        let (fired_tx, fired_rx) = oneshot::channel();
        let last_heartbeat = Arc::new(StdMutex::new(Instant::now()));

        let handle = MonitorHandle {
            _done: done_tx,
            last_heartbeat: Arc::clone(&last_heartbeat),
        };
        self.monitors.lock().await.insert(job.job_id.clone(), handle);

        let exec_timeout = self.settings.execution_timeout(job.step);
        let grace = self.settings.heartbeat_interval() * 2;
        let exec_deadline = Instant::now() + exec_timeout;

        let job_id = job.job_id.clone();
        let doc_id = job.doc_id.clone();
        let step = job.step;
        let state = self.state.clone();
        let monitors = Arc::clone(&self.monitors);
        let callback = self.callback.clone();

        tokio::spawn(async move {
            let reason = loop {
                let hb_deadline = *last_heartbeat.lock().expect("heartbeat lock") + grace;
                let next_deadline = exec_deadline.min(hb_deadline);
                tokio::select! {
                    _ = done_rx.changed() => {
                        // Sender dropped: normal completion or operator stop.
                        debug!(job_id, "Watchdog cancelled");
                        return;
                    }
                    _ = tokio::time::sleep_until(next_deadline) => {
                        let now = Instant::now();
                        if now >= exec_deadline {
                            break TimeoutReason::ExecutionTimeout;
                        }
                        let last = *last_heartbeat.lock().expect("heartbeat lock");
                        if now >= last + grace {
                            break TimeoutReason::HeartbeatTimeout;
                        }
                        // A heartbeat landed while we slept; keep watching.
                    }
                }
            };

            monitors.lock().await.remove(&job_id);

            // Check-then-set: a job that already completed or was cancelled
            // keeps its status, and the callback stays quiet.
            let marked = state
                .transition_job(&job_id, JobStatus::Running, |j| {
                    j.status = JobStatus::TimedOut;
                    j.completed_at = Some(Utc::now());
                    j.error_message = Some(format!("watchdog fired: {}", reason));
                })
                .await;

            match marked {
                Ok(Some(_)) => {
                    JOBS_TIMED_OUT_TOTAL.inc();
                    warn!(job_id, doc_id, step = %step, %reason, "Job timed out");
                    if let Some(callback) = callback {
                        callback(&TimeoutEvent {
                            job_id: job_id.clone(),
                            doc_id,
                            step: step.to_string(),
                            reason,
                        });
                    }
                }
                Ok(None) => {
                    debug!(job_id, %reason, "Watchdog fired after the job already left running");
                }
                Err(e) => {
                    warn!(job_id, error = %e, "Failed to mark job timed out");
                }
            }

            let _ = fired_tx.send(reason);
        });

        TimeoutSignal { rx: fired_rx }
    }

    /// Cancels both watchers; the expected common path on normal completion.
    pub async fn complete(&self, job_id: &str) {
        if self.monitors.lock().await.remove(job_id).is_none() {
            debug!(job_id, "complete() for a job that was not monitored");
        }
    }

    /// Refreshes the watchdog and best-effort stamps the job record.
    /// Fire-and-forget: failures are logged, never propagated to the stage.
    pub async fn heartbeat(&self, job_id: &str, worker_instance_id: &str) {
        {
            let monitors = self.monitors.lock().await;
            match monitors.get(job_id) {
                Some(handle) => {
                    *handle.last_heartbeat.lock().expect("heartbeat lock") = Instant::now();
                }
                None => {
                    debug!(job_id, "Heartbeat for unmonitored job");
                    return;
                }
            }
        }
        HEARTBEATS_RECORDED_TOTAL.inc();
        match self.state.record_heartbeat(job_id, worker_instance_id).await {
            Ok(true) => {}
            Ok(false) => debug!(job_id, "Heartbeat skipped: job no longer running"),
            Err(e) => warn!(job_id, error = %e, "Failed to persist heartbeat"),
        }
    }

    /// Operator escape hatch: force-terminates monitoring and cancels the job
    /// regardless of timeout state. Safe to race with normal completion —
    /// a completed job is never overwritten back to cancelled-from-running,
    /// and a cancelled job is never overwritten to completed.
    pub async fn stop_job(&self, job_id: &str, reason: &str) -> Result<Option<Job>> {
        self.monitors.lock().await.remove(job_id);

        // Running first, then a not-yet-claimed pending attempt.
        for expected in [JobStatus::Running, JobStatus::Pending] {
            let reason = reason.to_string();
            let cancelled = self
                .state
                .transition_job(job_id, expected, move |j| {
                    j.status = JobStatus::Cancelled;
                    j.completed_at = Some(Utc::now());
                    j.error_message = Some(format!("stopped by operator: {}", reason));
                })
                .await?;
            if let Some(job) = cancelled {
                info!(job_id, "Job cancelled by operator");
                return Ok(Some(job));
            }
        }
        debug!(job_id, "stop_job: job missing or already terminal");
        Ok(None)
    }
}
