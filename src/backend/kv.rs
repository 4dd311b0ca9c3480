use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Key-value backend with conditional-write semantics.
///
/// Multiple workers race on the same keys, so the conditional operations must
/// be atomic in the backend (conditional-put / compare-and-swap), never
/// emulated with read-then-write in the application.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Inserts only if `key` is absent. Returns false when the key exists.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool>;

    /// Replaces the value only if the current value equals `expected`.
    /// Returns false when the value moved underneath the caller.
    async fn compare_and_swap(&self, key: &str, expected: &[u8], value: Vec<u8>) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically adds `amount` to the integer at `key` (missing counts as 0)
    /// and returns the new value.
    async fn incr(&self, key: &str, amount: i64) -> Result<i64>;
}

/// In-memory backend used by the tests and single-process deployments.
///
/// `set_unavailable` flips every operation to a backend error, which is how
/// the quota fallback tests simulate an outage.
#[derive(Default)]
pub struct MemoryKvStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::Backend(
                "key-value backend unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_available()?;
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        self.check_available()?;
        let mut data = self.data.write().await;
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_string(), value);
        Ok(true)
    }

    async fn compare_and_swap(&self, key: &str, expected: &[u8], value: Vec<u8>) -> Result<bool> {
        self.check_available()?;
        let mut data = self.data.write().await;
        match data.get(key) {
            Some(current) if current.as_slice() == expected => {
                data.insert(key.to_string(), value);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, amount: i64) -> Result<i64> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let current = match data.get(key) {
            Some(bytes) => String::from_utf8_lossy(bytes).parse::<i64>().map_err(|e| {
                PipelineError::Backend(format!("counter at '{}' is not an integer: {}", key, e))
            })?,
            None => 0,
        };
        let next = current + amount;
        data.insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_absent_rejects_existing_key() {
        let kv = MemoryKvStore::new();
        assert!(kv.put_if_absent("k", b"a".to_vec()).await.unwrap());
        assert!(!kv.put_if_absent("k", b"b".to_vec()).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().unwrap(), b"a");
    }

    #[tokio::test]
    async fn compare_and_swap_detects_moved_value() {
        let kv = MemoryKvStore::new();
        kv.put("k", b"v1".to_vec()).await.unwrap();
        assert!(kv.compare_and_swap("k", b"v1", b"v2".to_vec()).await.unwrap());
        assert!(!kv.compare_and_swap("k", b"v1", b"v3".to_vec()).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn incr_starts_from_zero_and_accumulates() {
        let kv = MemoryKvStore::new();
        assert_eq!(kv.incr("c", 2).await.unwrap(), 2);
        assert_eq!(kv.incr("c", 3).await.unwrap(), 5);
        assert_eq!(kv.incr("c", -5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_errors_every_operation() {
        let kv = MemoryKvStore::new();
        kv.set_unavailable(true);
        assert!(matches!(
            kv.get("k").await,
            Err(PipelineError::Backend(_))
        ));
        assert!(kv.incr("c", 1).await.is_err());
    }
}
