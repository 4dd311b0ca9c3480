use crate::backend::KeyValueBackend;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub request_fingerprint: Option<String>,
    pub response_data: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
}

/// Result of `begin`: either the caller owns the operation, or somebody else
/// got there first.
#[derive(Debug)]
pub enum BeginOutcome {
    Proceed,
    DuplicateInProgress,
    DuplicateCompleted(serde_json::Value),
}

/// Stable idempotency key over caller identity + business key + optional
/// payload fingerprint. The ingest default passes no fingerprint, so repeats
/// of the same `doc_id` dedupe regardless of payload.
pub fn derive_key(scope: &str, business_key: &str, fingerprint: Option<&str>) -> String {
    match fingerprint {
        None => format!("{}:{}", scope, business_key),
        Some(fp) => {
            let mut hasher = DefaultHasher::new();
            fp.hash(&mut hasher);
            format!("{}:{}:{:016x}", scope, business_key, hasher.finish())
        }
    }
}

/// Exactly-once execution guard over the key-value backend.
///
/// `begin` relies on the backend's conditional insert, so two racing callers
/// can never both own the same key. Failed operations `abort` (delete) so a
/// fresh attempt is possible immediately; successes are retained until TTL to
/// serve cached responses to late duplicates.
pub struct IdempotencyStore {
    kv: Arc<dyn KeyValueBackend>,
    ttl: chrono::Duration,
}

fn storage_key(key: &str) -> String {
    format!("idem/{}", key)
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn KeyValueBackend>, ttl: chrono::Duration) -> Self {
        IdempotencyStore { kv, ttl }
    }

    pub async fn begin(&self, key: &str, fingerprint: Option<&str>) -> Result<BeginOutcome> {
        // One extra pass covers the expired-record takeover.
        for _ in 0..2 {
            let record = IdempotencyRecord {
                key: key.to_string(),
                status: IdempotencyStatus::InProgress,
                request_fingerprint: fingerprint.map(str::to_string),
                response_data: None,
                expires_at: Utc::now() + self.ttl,
            };
            let inserted = self
                .kv
                .put_if_absent(&storage_key(key), serde_json::to_vec(&record)?)
                .await?;
            if inserted {
                return Ok(BeginOutcome::Proceed);
            }

            let existing = match self.kv.get(&storage_key(key)).await? {
                Some(bytes) => serde_json::from_slice::<IdempotencyRecord>(&bytes)?,
                // Deleted between the insert and the read; try again.
                None => continue,
            };

            if existing.expires_at <= Utc::now() {
                debug!(key, "Removing expired idempotency record");
                self.kv.delete(&storage_key(key)).await?;
                continue;
            }

            return Ok(match existing.status {
                IdempotencyStatus::Completed => BeginOutcome::DuplicateCompleted(
                    existing.response_data.unwrap_or(serde_json::Value::Null),
                ),
                IdempotencyStatus::InProgress => BeginOutcome::DuplicateInProgress,
            });
        }
        Ok(BeginOutcome::DuplicateInProgress)
    }

    pub async fn commit(&self, key: &str, response: serde_json::Value) -> Result<()> {
        let existing = self.kv.get(&storage_key(key)).await?;
        let mut record = match existing {
            Some(bytes) => serde_json::from_slice::<IdempotencyRecord>(&bytes)?,
            None => {
                warn!(key, "Committing idempotency key with no begin record");
                IdempotencyRecord {
                    key: key.to_string(),
                    status: IdempotencyStatus::InProgress,
                    request_fingerprint: None,
                    response_data: None,
                    expires_at: Utc::now(),
                }
            }
        };
        record.status = IdempotencyStatus::Completed;
        record.response_data = Some(response);
        record.expires_at = Utc::now() + self.ttl;
        self.kv
            .put(&storage_key(key), serde_json::to_vec(&record)?)
            .await
    }

    /// Deletes the record so a fresh attempt can run immediately. Failures
    /// must not leave an extended non-idempotent deadlock behind.
    pub async fn abort(&self, key: &str) -> Result<()> {
        self.kv.delete(&storage_key(key)).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        match self.kv.get(&storage_key(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Explicit higher-order guard: begin, run the operation, commit its
    /// serialized result, abort on any error so retries are possible.
    pub async fn run<T, F, Fut>(
        &self,
        key: &str,
        fingerprint: Option<&str>,
        op: F,
    ) -> Result<GuardOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.begin(key, fingerprint).await? {
            BeginOutcome::DuplicateInProgress => return Ok(GuardOutcome::DuplicateInProgress),
            BeginOutcome::DuplicateCompleted(cached) => {
                return Ok(GuardOutcome::DuplicateCompleted(cached))
            }
            BeginOutcome::Proceed => {}
        }

        match op().await {
            Ok(value) => {
                self.commit(key, serde_json::to_value(&value)?).await?;
                Ok(GuardOutcome::Executed(value))
            }
            Err(e) => {
                if let Err(abort_err) = self.abort(key).await {
                    warn!(key, error = %abort_err, "Failed to abort idempotency record");
                }
                Err(e)
            }
        }
    }
}

#[derive(Debug)]
pub enum GuardOutcome<T> {
    Executed(T),
    DuplicateInProgress,
    DuplicateCompleted(serde_json::Value),
}
