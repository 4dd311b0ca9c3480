use crate::data_model::CompletionEvent;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

/// Consumer of terminal pipeline transitions. Only the event shape is part of
/// the core; delivery (webhook, pub-sub, log) is the sink's business.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, event: &CompletionEvent, webhook_url: Option<&str>) -> Result<()>;
}

/// Writes terminal events to the structured log. The default sink when no
/// webhook delivery is configured.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn emit(&self, event: &CompletionEvent, _webhook_url: Option<&str>) -> Result<()> {
        info!(doc_id = %event.doc_id, status = ?event.status, error = ?event.error,
            "Pipeline finished for document");
        Ok(())
    }
}

/// Posts the event JSON to the document's webhook, falling back to the log
/// when the document has none.
pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new() -> Self {
        WebhookSink {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn emit(&self, event: &CompletionEvent, webhook_url: Option<&str>) -> Result<()> {
        let url = match webhook_url {
            Some(url) => url,
            None => {
                info!(doc_id = %event.doc_id, status = ?event.status,
                    "No webhook configured; logging terminal event");
                return Ok(());
            }
        };
        let response = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(|e| PipelineError::Backend(format!("webhook delivery failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(PipelineError::Backend(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Records events in memory; test support.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<CompletionEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<CompletionEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn emit(&self, event: &CompletionEvent, _webhook_url: Option<&str>) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
