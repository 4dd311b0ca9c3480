// tests/common/mod.rs

#![allow(dead_code)]

use async_trait::async_trait;
use docflow::backend::{MemoryKvStore, MemoryObjectStore, MemoryQueue, ObjectStore, TaskQueue};
use docflow::config::Settings;
use docflow::data_model::{Document, DocumentSource, Job, PipelineStep};
use docflow::error::{PipelineError, Result};
use docflow::executor::{ExecutorRegistry, StageExecutor, StageOutput};
use docflow::idempotency::IdempotencyStore;
use docflow::notify::MemorySink;
use docflow::quota::QuotaEnforcer;
use docflow::review::ReviewEvaluator;
use docflow::router::{IngestOutcome, IngestRequest, Router};
use docflow::state::StateStore;
use docflow::timeout::TimeoutEnforcer;
use docflow::worker_logic::StageWorker;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub enum StubBehavior {
    /// Succeed immediately with full confidence.
    Succeed,
    /// Succeed with the given confidence scores.
    SucceedWith(HashMap<String, f64>),
    /// Fail the first `n` attempts, then succeed.
    FailFirst(u32),
    AlwaysFail,
    /// Never return; only the watchdog can end the attempt.
    Hang,
}

pub struct StubStage {
    step: PipelineStep,
    behavior: StubBehavior,
    calls: AtomicU32,
}

impl StubStage {
    pub fn new(step: PipelineStep, behavior: StubBehavior) -> Arc<Self> {
        Arc::new(StubStage {
            step,
            behavior,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn success(&self, doc_id: &str, scores: HashMap<String, f64>) -> StageOutput {
        let mut output = StageOutput {
            output_data: json!({ "step": self.step.as_str(), "doc_id": doc_id }),
            ..Default::default()
        };
        output
            .artifacts
            .insert(self.step.to_string(), format!("mem://artifacts/{}/{}", doc_id, self.step));
        output.confidence_scores = scores;
        output
    }
}

#[async_trait]
impl StageExecutor for StubStage {
    fn step(&self) -> PipelineStep {
        self.step
    }

    async fn execute(&self, job: &Job, document: &Document) -> Result<StageOutput> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            StubBehavior::Succeed => Ok(self.success(&document.doc_id, HashMap::new())),
            StubBehavior::SucceedWith(scores) => {
                Ok(self.success(&document.doc_id, scores.clone()))
            }
            StubBehavior::FailFirst(n) if attempt < *n => Err(PipelineError::StageExecution {
                step: self.step.to_string(),
                job_id: job.job_id.clone(),
                message: format!("induced failure on attempt {}", attempt + 1),
            }),
            StubBehavior::FailFirst(_) => Ok(self.success(&document.doc_id, HashMap::new())),
            StubBehavior::AlwaysFail => Err(PipelineError::StageExecution {
                step: self.step.to_string(),
                job_id: job.job_id.clone(),
                message: "induced failure".to_string(),
            }),
            StubBehavior::Hang => futures::future::pending().await,
        }
    }
}

/// Fully wired single-process pipeline over the in-memory backends.
pub struct Harness {
    pub kv: Arc<MemoryKvStore>,
    pub queue: Arc<MemoryQueue>,
    pub objects: Arc<MemoryObjectStore>,
    pub state: StateStore,
    pub guard: Arc<IdempotencyStore>,
    pub quota: Arc<QuotaEnforcer>,
    pub sink: Arc<MemorySink>,
    pub router: Arc<Router>,
    pub worker: StageWorker,
}

impl Harness {
    /// Builds the pipeline with the given stage overrides; every step not
    /// overridden gets a plain succeeding stub.
    pub fn with_stages(settings: Settings, overrides: Vec<Arc<StubStage>>) -> Self {
        let kv = Arc::new(MemoryKvStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let sink = Arc::new(MemorySink::new());

        let state = StateStore::new(kv.clone());
        let guard = Arc::new(IdempotencyStore::new(kv.clone(), settings.idempotency.ttl()));
        let quota = Arc::new(QuotaEnforcer::new(kv.clone(), settings.quotas.clone()));
        let timeouts = Arc::new(TimeoutEnforcer::new(state.clone(), settings.timeouts.clone()));
        let review = Arc::new(ReviewEvaluator::new(settings.review.clone()));
        let router = Arc::new(Router::new(
            state.clone(),
            guard.clone(),
            queue.clone() as Arc<dyn TaskQueue>,
            objects.clone() as Arc<dyn ObjectStore>,
            quota.clone(),
            sink.clone(),
            settings.retry.clone(),
        ));

        let mut executors = ExecutorRegistry::new();
        for step in PipelineStep::ALL {
            executors.register(StubStage::new(step, StubBehavior::Succeed));
        }
        for stage in overrides {
            executors.register(stage);
        }

        let worker = StageWorker::new(
            queue.clone() as Arc<dyn TaskQueue>,
            state.clone(),
            guard.clone(),
            quota.clone(),
            timeouts,
            review,
            router.clone(),
            executors,
            "worker-test".to_string(),
            settings.timeouts.heartbeat_interval(),
        );

        Harness {
            kv,
            queue,
            objects,
            state,
            guard,
            quota,
            sink,
            router,
            worker,
        }
    }

    pub fn new(settings: Settings) -> Self {
        Self::with_stages(settings, Vec::new())
    }

    /// Settings tuned for tests: tight timeouts, negligible backoff.
    pub fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.retry.backoff_base_secs = 1;
        settings.retry.backoff_cap_secs = 1;
        settings.timeouts.heartbeat_interval_secs = 1;
        settings.timeouts.default_execution_timeout_secs = 5;
        settings
    }

    /// Stores a raw upload and submits it, returning the ingest outcome.
    pub async fn ingest_upload(&self, doc_id: &str, owner_id: &str) -> IngestOutcome {
        self.try_ingest_upload(doc_id, owner_id)
            .await
            .expect("ingest")
    }

    /// Like `ingest_upload` but surfaces admission errors to the test.
    pub async fn try_ingest_upload(&self, doc_id: &str, owner_id: &str) -> Result<IngestOutcome> {
        let location = self
            .objects
            .put(&format!("raw/{}.pdf", doc_id), b"pdf-bytes".to_vec())
            .await
            .expect("seeding the raw object");
        self.router
            .ingest(IngestRequest {
                doc_id: Some(doc_id.to_string()),
                owner_id: owner_id.to_string(),
                source: DocumentSource::Upload,
                location,
                webhook_url: None,
                metadata: HashMap::new(),
                priority: false,
            })
            .await
    }

    /// Processes queued messages until the queue is empty. Retries with
    /// backoff become visible once their delay elapses, so under a paused
    /// clock this runs the pipeline to quiescence.
    pub async fn drain(&self) {
        while !self.queue.is_empty().await {
            let delivery = self.queue.dequeue().await.expect("dequeue");
            self.worker.handle_delivery(delivery).await;
        }
    }

    pub async fn document(&self, doc_id: &str) -> Document {
        self.state
            .get_document(doc_id)
            .await
            .expect("document lookup")
            .expect("document exists")
    }

    pub async fn job(&self, job_id: &str) -> Job {
        self.state
            .get_job(job_id)
            .await
            .expect("job lookup")
            .expect("job exists")
    }
}
