use crate::data_model::{Document, Job, PipelineStep};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// What a stage hands back to the orchestrator: its output payload, any
/// artifacts it stored, and a confidence score per named area for the review
/// evaluator.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub output_data: serde_json::Value,
    pub artifacts: HashMap<String, String>,
    pub confidence_scores: HashMap<String, f64>,
}

/// One pipeline stage's business logic. The real OCR/structure/tagging/export
/// implementations are external collaborators behind this trait; the
/// orchestration core only cares about the contract.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn step(&self) -> PipelineStep;

    async fn execute(&self, job: &Job, document: &Document) -> Result<StageOutput>;
}

/// Step -> executor lookup for a worker process.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<PipelineStep, Arc<dyn StageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn StageExecutor>) {
        self.executors.insert(executor.step(), executor);
    }

    pub fn get(&self, step: PipelineStep) -> Result<Arc<dyn StageExecutor>> {
        self.executors.get(&step).cloned().ok_or_else(|| {
            PipelineError::ConfigError(format!("no executor registered for step '{}'", step))
        })
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
