use crate::backend::KeyValueBackend;
use crate::data_model::{Document, DocumentStatus, Job, JobStatus};
use crate::error::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

/// Document and Job records over the key-value backend.
///
/// Records are independently keyed (`doc/{id}`, `job/{id}`); Jobs carry
/// `doc_id` as a foreign attribute. Every status change goes through a
/// check-then-set loop on the serialized record, never a blind overwrite, so
/// racing writers (worker vs. timeout enforcer vs. operator cancel) cannot
/// clobber each other's terminal states.
pub struct StateStore {
    kv: Arc<dyn KeyValueBackend>,
}

fn doc_key(doc_id: &str) -> String {
    format!("doc/{}", doc_id)
}

fn job_key(job_id: &str) -> String {
    format!("job/{}", job_id)
}

impl StateStore {
    pub fn new(kv: Arc<dyn KeyValueBackend>) -> Self {
        StateStore { kv }
    }

    pub async fn put_document(&self, doc: &Document) -> Result<()> {
        self.kv.put(&doc_key(&doc.doc_id), serde_json::to_vec(doc)?).await
    }

    pub async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        match self.kv.get(&doc_key(doc_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put_job(&self, job: &Job) -> Result<()> {
        self.kv.put(&job_key(&job.job_id), serde_json::to_vec(job)?).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        match self.kv.get(&job_key(job_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Applies `mutate` to the document if the status transition is legal.
    /// Returns false (without writing) when the document is missing or the
    /// transition would regress the status.
    pub async fn transition_document(
        &self,
        doc_id: &str,
        next_status: DocumentStatus,
        mutate: impl Fn(&mut Document) + Send,
    ) -> Result<bool> {
        let key = doc_key(doc_id);
        loop {
            let old_bytes = match self.kv.get(&key).await? {
                Some(bytes) => bytes,
                None => return Ok(false),
            };
            let mut doc: Document = serde_json::from_slice(&old_bytes)?;
            if doc.status != next_status && !doc.status.can_transition_to(next_status) {
                warn!(doc_id, from = ?doc.status, to = ?next_status,
                    "Refusing illegal document status transition");
                return Ok(false);
            }
            doc.status = next_status;
            doc.updated_at = Utc::now();
            mutate(&mut doc);
            let new_bytes = serde_json::to_vec(&doc)?;
            if self.kv.compare_and_swap(&key, &old_bytes, new_bytes).await? {
                return Ok(true);
            }
            // Lost the race; re-read and re-check.
        }
    }

    /// Check-then-set job transition: applies `mutate` (which may change the
    /// status) only while the job's current status equals `expected`.
    /// Returns the updated job on success, `None` if the job is missing or its
    /// status moved away from `expected` first.
    pub async fn transition_job(
        &self,
        job_id: &str,
        expected: JobStatus,
        mutate: impl Fn(&mut Job) + Send,
    ) -> Result<Option<Job>> {
        let key = job_key(job_id);
        loop {
            let old_bytes = match self.kv.get(&key).await? {
                Some(bytes) => bytes,
                None => return Ok(None),
            };
            let mut job: Job = serde_json::from_slice(&old_bytes)?;
            if job.status != expected {
                return Ok(None);
            }
            mutate(&mut job);
            let new_bytes = serde_json::to_vec(&job)?;
            if self.kv.compare_and_swap(&key, &old_bytes, new_bytes).await? {
                return Ok(Some(job));
            }
        }
    }

    /// Best-effort heartbeat stamp; only touches jobs that are still running.
    pub async fn record_heartbeat(&self, job_id: &str, worker_instance_id: &str) -> Result<bool> {
        let worker = worker_instance_id.to_string();
        let updated = self
            .transition_job(job_id, JobStatus::Running, move |job| {
                job.last_heartbeat_at = Some(Utc::now());
                job.worker_instance_id = Some(worker.clone());
            })
            .await?;
        Ok(updated.is_some())
    }
}

impl Clone for StateStore {
    fn clone(&self) -> Self {
        StateStore {
            kv: Arc::clone(&self.kv),
        }
    }
}
