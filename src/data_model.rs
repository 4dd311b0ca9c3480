use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One ordered phase of the document pipeline.
///
/// The order of the variants is the processing order; `successor` walks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Ocr,
    Structure,
    Tagger,
    Validator,
    Exporter,
    Notifier,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 6] = [
        PipelineStep::Ocr,
        PipelineStep::Structure,
        PipelineStep::Tagger,
        PipelineStep::Validator,
        PipelineStep::Exporter,
        PipelineStep::Notifier,
    ];

    pub fn first() -> Self {
        PipelineStep::Ocr
    }

    /// Next step in the fixed total order, `None` after the final step.
    pub fn successor(&self) -> Option<Self> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Ocr => "ocr",
            PipelineStep::Structure => "structure",
            PipelineStep::Tagger => "tagger",
            PipelineStep::Validator => "validator",
            PipelineStep::Exporter => "exporter",
            PipelineStep::Notifier => "notifier",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    /// Documents only ever move forward: pending -> processing -> {completed, failed}.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed) | (Pending, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSource {
    Upload,
    Url,
}

/// One user-submitted file moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub owner_id: String,
    pub status: DocumentStatus,
    pub source: DocumentSource,
    /// Opaque storage reference to the original file.
    pub original_location: String,
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Artifact name -> storage reference, filled in by stages as they run.
    #[serde(default)]
    pub artifacts: HashMap<String, String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// One execution attempt of a stage for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub doc_id: String,
    pub step: PipelineStep,
    pub status: JobStatus,
    pub priority: bool,
    #[serde(default)]
    pub input_data: serde_json::Value,
    #[serde(default)]
    pub output_data: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub worker_instance_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(doc_id: &str, step: PipelineStep, priority: bool, max_retries: u32) -> Self {
        Job {
            job_id: uuid::Uuid::new_v4().to_string(),
            doc_id: doc_id.to_string(),
            step,
            status: JobStatus::Pending,
            priority,
            input_data: serde_json::Value::Null,
            output_data: serde_json::Value::Null,
            retry_count: 0,
            max_retries,
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
            worker_instance_id: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// New attempt for the same (doc, step) with the retry counter bumped.
    pub fn retry_attempt(&self) -> Self {
        let mut next = Job::new(&self.doc_id, self.step, self.priority, self.max_retries);
        next.retry_count = self.retry_count + 1;
        next.input_data = self.input_data.clone();
        next
    }
}

/// Queue payload that tells a stage worker to run one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMessage {
    pub job_id: String,
    pub doc_id: String,
    pub step: PipelineStep,
    pub priority: bool,
    /// 1-based attempt number, for log correlation only.
    pub attempt: u32,
}

impl ProcessMessage {
    pub fn for_job(job: &Job) -> Self {
        ProcessMessage {
            job_id: job.job_id.clone(),
            doc_id: job.doc_id.clone(),
            step: job.step,
            priority: job.priority,
            attempt: job.retry_count + 1,
        }
    }
}

/// Event emitted on terminal pipeline transitions (completed / failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub doc_id: String,
    pub status: DocumentStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_total_and_ends_at_notifier() {
        let mut step = PipelineStep::first();
        let mut seen = vec![step];
        while let Some(next) = step.successor() {
            seen.push(next);
            step = next;
        }
        assert_eq!(seen, PipelineStep::ALL.to_vec());
        assert_eq!(step, PipelineStep::Notifier);
        assert!(PipelineStep::Notifier.successor().is_none());
    }

    #[test]
    fn document_status_never_regresses() {
        use DocumentStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn retry_attempt_keeps_step_and_bumps_count() {
        let job = Job::new("d1", PipelineStep::Ocr, false, 3);
        let retry = job.retry_attempt();
        assert_eq!(retry.step, PipelineStep::Ocr);
        assert_eq!(retry.doc_id, "d1");
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.status, JobStatus::Pending);
        assert_ne!(retry.job_id, job.job_id);
    }

    #[test]
    fn step_serializes_snake_case() {
        let json = serde_json::to_string(&PipelineStep::Ocr).unwrap();
        assert_eq!(json, "\"ocr\"");
        let back: PipelineStep = serde_json::from_str("\"tagger\"").unwrap();
        assert_eq!(back, PipelineStep::Tagger);
    }
}
