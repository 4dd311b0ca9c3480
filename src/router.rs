use crate::backend::{ObjectStore, QueueTier, TaskQueue};
use crate::config::RetrySettings;
use crate::data_model::{
    CompletionEvent, Document, DocumentSource, DocumentStatus, Job, JobStatus, PipelineStep,
    ProcessMessage,
};
use crate::error::{PipelineError, Result};
use crate::idempotency::{derive_key, GuardOutcome, IdempotencyStore};
use crate::notify::NotificationSink;
use crate::quota::{QuotaEnforcer, QuotaType};
use crate::state::StateStore;
use crate::utils::metrics::{
    DOCUMENTS_COMPLETED_TOTAL, DOCUMENTS_FAILED_TOTAL, DOCUMENTS_INGESTED_TOTAL,
    INGESTS_SKIPPED_TOTAL, JOBS_DISPATCHED_TOTAL, JOBS_RETRIED_TOTAL,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Scope string for ingest idempotency keys.
const INGEST_SCOPE: &str = "ingest";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Externally supplied id; generated when absent.
    pub doc_id: Option<String>,
    pub owner_id: String,
    pub source: DocumentSource,
    /// Storage reference of the uploaded file, or the URL to fetch.
    pub location: String,
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub priority: bool,
}

impl IngestRequest {
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(PipelineError::Validation(
                "owner_id cannot be empty".to_string(),
            ));
        }
        if self.location.trim().is_empty() {
            return Err(PipelineError::Validation(
                "location cannot be empty".to_string(),
            ));
        }
        if self.source == DocumentSource::Url
            && !(self.location.starts_with("http://") || self.location.starts_with("https://"))
        {
            return Err(PipelineError::Validation(format!(
                "url source requires an http(s) location, got '{}'",
                self.location
            )));
        }
        if let Some(id) = &self.doc_id {
            if id.trim().is_empty() {
                return Err(PipelineError::Validation(
                    "doc_id, when supplied, cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum IngestOutcome {
    Created(Document),
    /// The request was a duplicate; no side effects were performed.
    Skipped {
        doc_id: String,
        reason: String,
    },
}

/// Turns ingest requests into a Document plus its first Job, and turns each
/// finished Job into the next Job, a retry, or pipeline completion/failure.
pub struct Router {
    state: StateStore,
    guard: Arc<IdempotencyStore>,
    queue: Arc<dyn TaskQueue>,
    objects: Arc<dyn ObjectStore>,
    quota: Arc<QuotaEnforcer>,
    sink: Arc<dyn NotificationSink>,
    retry: RetrySettings,
}

impl Router {
    pub fn new(
        state: StateStore,
        guard: Arc<IdempotencyStore>,
        queue: Arc<dyn TaskQueue>,
        objects: Arc<dyn ObjectStore>,
        quota: Arc<QuotaEnforcer>,
        sink: Arc<dyn NotificationSink>,
        retry: RetrySettings,
    ) -> Self {
        Router {
            state,
            guard,
            queue,
            objects,
            quota,
            sink,
            retry,
        }
    }

    /// Admits one document into the pipeline, exactly once per doc_id.
    #[instrument(skip(self, request), fields(owner_id = %request.owner_id))]
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome> {
        request.validate()?;
        let doc_id = request
            .doc_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let key = derive_key(INGEST_SCOPE, &doc_id, None);

        let outcome = self
            .guard
            .run(&key, None, || self.admit(&doc_id, &request))
            .await?;

        match outcome {
            GuardOutcome::Executed(document) => {
                DOCUMENTS_INGESTED_TOTAL.inc();
                info!(doc_id, "Document admitted into pipeline");
                Ok(IngestOutcome::Created(document))
            }
            GuardOutcome::DuplicateInProgress => {
                INGESTS_SKIPPED_TOTAL.inc();
                debug!(doc_id, "Duplicate ingest still in progress; skipping");
                Ok(IngestOutcome::Skipped {
                    doc_id,
                    reason: "ingest already in progress".to_string(),
                })
            }
            GuardOutcome::DuplicateCompleted(_) => {
                INGESTS_SKIPPED_TOTAL.inc();
                debug!(doc_id, "Duplicate ingest already completed; skipping");
                Ok(IngestOutcome::Skipped {
                    doc_id,
                    reason: "document already ingested".to_string(),
                })
            }
        }
    }

    /// The guarded section of ingest. Any error marks the document failed if
    /// it was already persisted; the guard then aborts so a retry can run.
    async fn admit(&self, doc_id: &str, request: &IngestRequest) -> Result<Document> {
        let result = self.admit_inner(doc_id, request).await;
        if let Err(e) = &result {
            warn!(doc_id, error = %e, "Ingest failed after admission started");
            let message = e.to_string();
            let marked = self
                .state
                .transition_document(doc_id, DocumentStatus::Failed, move |d| {
                    d.error_message = Some(message.clone());
                })
                .await;
            if let Err(mark_err) = marked {
                warn!(doc_id, error = %mark_err, "Failed to mark document failed");
            }
        }
        result
    }

    async fn admit_inner(&self, doc_id: &str, request: &IngestRequest) -> Result<Document> {
        if !self
            .quota
            .check(&request.owner_id, QuotaType::FileCountTotal, 1)
            .await
        {
            return Err(PipelineError::QuotaExceeded {
                org_id: request.owner_id.clone(),
                quota: QuotaType::FileCountTotal.to_string(),
            });
        }

        // Staging is overwrite-safe: the canonical key is deterministic, so a
        // retried ingest re-puts the same object instead of compensating.
        let staged = self
            .objects
            .copy(&request.location, &format!("canonical/{}", doc_id))
            .await?;

        // The upload size is only known once staged; an oversized file is
        // rejected before any Document or Job record exists.
        if !self
            .quota
            .check(&request.owner_id, QuotaType::StorageTotal, staged.size_bytes as i64)
            .await
        {
            return Err(PipelineError::QuotaExceeded {
                org_id: request.owner_id.clone(),
                quota: QuotaType::StorageTotal.to_string(),
            });
        }

        let now = Utc::now();
        let document = Document {
            doc_id: doc_id.to_string(),
            owner_id: request.owner_id.clone(),
            status: DocumentStatus::Pending,
            source: request.source,
            original_location: staged.uri,
            webhook_url: request.webhook_url.clone(),
            metadata: request.metadata.clone(),
            artifacts: HashMap::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.state.put_document(&document).await?;

        let job = Job::new(doc_id, PipelineStep::first(), request.priority, self.retry.default_max_retries);
        self.state.put_job(&job).await?;
        self.dispatch(&job, None).await?;

        // Usage counts only after the document is fully admitted.
        for (quota_type, amount) in [
            (QuotaType::FileCountTotal, 1),
            (QuotaType::StorageTotal, staged.size_bytes as i64),
        ] {
            if let Err(e) = self.quota.increment(&request.owner_id, quota_type, amount).await {
                warn!(doc_id, quota = %quota_type, error = %e, "Failed to record ingest usage");
            }
        }

        Ok(document)
    }

    async fn dispatch(&self, job: &Job, delay: Option<std::time::Duration>) -> Result<()> {
        let tier = QueueTier::for_priority(job.priority);
        self.queue
            .enqueue(tier, &ProcessMessage::for_job(job), delay)
            .await?;
        JOBS_DISPATCHED_TOTAL.inc();
        debug!(job_id = %job.job_id, step = %job.step, ?tier, "Dispatched process message");
        Ok(())
    }

    /// Advances the pipeline after a job reached a terminal status.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, doc_id = %job.doc_id, step = %job.step))]
    pub async fn advance(&self, job: &Job) -> Result<()> {
        match job.status {
            JobStatus::Completed => self.advance_completed(job).await,
            JobStatus::Failed | JobStatus::TimedOut => self.advance_failed(job).await,
            other => {
                warn!(status = ?other, "advance() called for a non-terminal or cancelled job; ignoring");
                Ok(())
            }
        }
    }

    async fn advance_completed(&self, job: &Job) -> Result<()> {
        match job.step.successor() {
            Some(next_step) => {
                let mut next = Job::new(&job.doc_id, next_step, job.priority, job.max_retries);
                next.input_data = job.output_data.clone();
                self.state.put_job(&next).await?;
                self.dispatch(&next, None).await?;
                info!(next_step = %next_step, "Advanced document to next stage");
                Ok(())
            }
            None => self.finish(job, DocumentStatus::Completed, None).await,
        }
    }

    async fn advance_failed(&self, job: &Job) -> Result<()> {
        if job.retry_count < job.max_retries {
            let retry = job.retry_attempt();
            let delay = self.retry.backoff_delay(job.retry_count);
            self.state.put_job(&retry).await?;
            self.dispatch(&retry, Some(delay)).await?;
            JOBS_RETRIED_TOTAL.inc();
            info!(
                attempt = retry.retry_count + 1,
                max_attempts = retry.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                "Re-enqueued failed stage for retry"
            );
            Ok(())
        } else {
            let error = job
                .error_message
                .clone()
                .unwrap_or_else(|| format!("step '{}' exhausted its retries", job.step));
            self.finish(job, DocumentStatus::Failed, Some(error)).await
        }
    }

    /// Terminal transition: marks the document and emits the completion event.
    async fn finish(
        &self,
        job: &Job,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<()> {
        let error_for_doc = error.clone();
        let moved = self
            .state
            .transition_document(&job.doc_id, status, move |d| {
                if let Some(e) = &error_for_doc {
                    // Always the final failing attempt's error, verbatim.
                    d.error_message = Some(e.clone());
                }
            })
            .await?;
        if !moved {
            warn!(doc_id = %job.doc_id, ?status, "Document refused terminal transition");
            return Ok(());
        }

        let document = self.state.get_document(&job.doc_id).await?;
        let (results, webhook_url) = match &document {
            Some(doc) if status == DocumentStatus::Completed => {
                (Some(doc.artifacts.clone()), doc.webhook_url.clone())
            }
            Some(doc) => (None, doc.webhook_url.clone()),
            None => (None, None),
        };

        match status {
            DocumentStatus::Completed => {
                DOCUMENTS_COMPLETED_TOTAL.inc();
                info!(doc_id = %job.doc_id, "Pipeline completed");
            }
            DocumentStatus::Failed => {
                DOCUMENTS_FAILED_TOTAL.inc();
                warn!(doc_id = %job.doc_id, error = ?error, "Pipeline failed");
            }
            _ => {}
        }

        let event = CompletionEvent {
            doc_id: job.doc_id.clone(),
            status,
            timestamp: Utc::now(),
            results,
            error,
        };
        if let Err(e) = self.sink.emit(&event, webhook_url.as_deref()).await {
            // Notification delivery must not fail the pipeline transition.
            warn!(doc_id = %job.doc_id, error = %e, "Failed to emit completion event");
        }
        Ok(())
    }
}
