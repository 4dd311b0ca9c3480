use crate::backend::KeyValueBackend;
use crate::config::QuotaSettings;
use crate::error::Result;
use crate::utils::metrics::QUOTA_CHECKS_DENIED_TOTAL;
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    ProcessingMonthly,
    StorageTotal,
    ConcurrentJobs,
    FileCountTotal,
}

impl QuotaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaType::ProcessingMonthly => "processing_monthly",
            QuotaType::StorageTotal => "storage_total",
            QuotaType::ConcurrentJobs => "concurrent_jobs",
            QuotaType::FileCountTotal => "file_count_total",
        }
    }

    /// Monthly counters key on the current UTC month, so a new period simply
    /// starts at a fresh key. The others accumulate for the org's lifetime
    /// (or, for concurrent_jobs, track instantaneous load).
    fn period_scoped(&self) -> bool {
        matches!(self, QuotaType::ProcessingMonthly)
    }
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub current_usage: i64,
    pub limit: i64,
    pub remaining: i64,
    pub percentage_used: f64,
}

/// Per-organization usage counters and limit checks.
///
/// Counters are mutated by many workers at once, so all arithmetic happens in
/// the backend (`incr`), never as application read-modify-write. If the
/// backend is down, `check` answers permissively with a logged warning:
/// availability wins over strict enforcement.
pub struct QuotaEnforcer {
    kv: Arc<dyn KeyValueBackend>,
    settings: QuotaSettings,
}

impl QuotaEnforcer {
    pub fn new(kv: Arc<dyn KeyValueBackend>, settings: QuotaSettings) -> Self {
        QuotaEnforcer { kv, settings }
    }

    fn counter_key(&self, org_id: &str, quota_type: QuotaType) -> String {
        if quota_type.period_scoped() {
            let now = Utc::now();
            format!(
                "quota/{}/{}/{:04}-{:02}",
                org_id,
                quota_type,
                now.year(),
                now.month()
            )
        } else {
            format!("quota/{}/{}", org_id, quota_type)
        }
    }

    fn limit_for(&self, org_id: &str, quota_type: QuotaType) -> i64 {
        let limits = self.settings.limits_for(org_id);
        match quota_type {
            QuotaType::ProcessingMonthly => limits.processing_monthly,
            QuotaType::StorageTotal => limits.storage_total_bytes,
            QuotaType::ConcurrentJobs => limits.concurrent_jobs,
            QuotaType::FileCountTotal => limits.file_count_total,
        }
    }

    async fn current_usage(&self, org_id: &str, quota_type: QuotaType) -> Result<i64> {
        let key = self.counter_key(org_id, quota_type);
        match self.kv.get(&key).await? {
            Some(bytes) => Ok(String::from_utf8_lossy(&bytes).parse::<i64>().unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Would admitting `amount` more units stay within the limit?
    ///
    /// Permissive on backend failure by design.
    pub async fn check(&self, org_id: &str, quota_type: QuotaType, amount: i64) -> bool {
        let limit = self.limit_for(org_id, quota_type);
        match self.current_usage(org_id, quota_type).await {
            Ok(usage) => {
                let admitted = usage + amount <= limit;
                if !admitted {
                    QUOTA_CHECKS_DENIED_TOTAL.inc();
                    debug!(org_id, quota = %quota_type, usage, limit, amount, "Quota check denied");
                }
                admitted
            }
            Err(e) => {
                warn!(org_id, quota = %quota_type, error = %e,
                    "Quota backend unavailable; admitting permissively");
                true
            }
        }
    }

    pub async fn increment(&self, org_id: &str, quota_type: QuotaType, amount: i64) -> Result<i64> {
        let key = self.counter_key(org_id, quota_type);
        self.kv.incr(&key, amount).await
    }

    pub async fn decrement(&self, org_id: &str, quota_type: QuotaType, amount: i64) -> Result<i64> {
        self.increment(org_id, quota_type, -amount).await
    }

    pub async fn status(&self, org_id: &str, quota_type: QuotaType) -> Result<QuotaStatus> {
        let limit = self.limit_for(org_id, quota_type);
        let current_usage = self.current_usage(org_id, quota_type).await?;
        Ok(QuotaStatus {
            current_usage,
            limit,
            remaining: (limit - current_usage).max(0),
            percentage_used: if limit > 0 {
                (current_usage as f64 / limit as f64) * 100.0
            } else {
                0.0
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryKvStore;
    use crate::config::{QuotaLimits, QuotaSettings};
    use std::collections::HashMap;

    fn enforcer_with(kv: Arc<MemoryKvStore>) -> QuotaEnforcer {
        let settings = QuotaSettings {
            default_limits: QuotaLimits {
                processing_monthly: 3,
                storage_total_bytes: 100,
                concurrent_jobs: 2,
                file_count_total: 10,
            },
            overrides: HashMap::from([(
                "org-gold".to_string(),
                QuotaLimits {
                    processing_monthly: 100,
                    ..QuotaLimits::default()
                },
            )]),
        };
        QuotaEnforcer::new(kv, settings)
    }

    #[tokio::test]
    async fn check_denies_past_limit_and_honors_overrides() {
        let kv = Arc::new(MemoryKvStore::new());
        let quota = enforcer_with(kv);

        assert!(quota.check("org-1", QuotaType::ProcessingMonthly, 1).await);
        quota
            .increment("org-1", QuotaType::ProcessingMonthly, 3)
            .await
            .unwrap();
        assert!(!quota.check("org-1", QuotaType::ProcessingMonthly, 1).await);

        // a different org and the override tier are unaffected
        assert!(quota.check("org-2", QuotaType::ProcessingMonthly, 1).await);
        assert!(quota.check("org-gold", QuotaType::ProcessingMonthly, 50).await);
    }

    #[tokio::test]
    async fn concurrent_jobs_returns_to_baseline() {
        let kv = Arc::new(MemoryKvStore::new());
        let quota = enforcer_with(kv);

        quota
            .increment("org-1", QuotaType::ConcurrentJobs, 1)
            .await
            .unwrap();
        assert_eq!(
            quota
                .status("org-1", QuotaType::ConcurrentJobs)
                .await
                .unwrap()
                .current_usage,
            1
        );
        quota
            .decrement("org-1", QuotaType::ConcurrentJobs, 1)
            .await
            .unwrap();
        assert_eq!(
            quota
                .status("org-1", QuotaType::ConcurrentJobs)
                .await
                .unwrap()
                .current_usage,
            0
        );
    }

    #[tokio::test]
    async fn status_reports_remaining_and_percentage() {
        let kv = Arc::new(MemoryKvStore::new());
        let quota = enforcer_with(kv);
        quota
            .increment("org-1", QuotaType::FileCountTotal, 5)
            .await
            .unwrap();
        let status = quota.status("org-1", QuotaType::FileCountTotal).await.unwrap();
        assert_eq!(status.current_usage, 5);
        assert_eq!(status.limit, 10);
        assert_eq!(status.remaining, 5);
        assert!((status.percentage_used - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn check_is_permissive_when_backend_is_down() {
        let kv = Arc::new(MemoryKvStore::new());
        let quota = enforcer_with(kv.clone());
        kv.set_unavailable(true);
        assert!(quota.check("org-1", QuotaType::ProcessingMonthly, 1).await);
        // but increments still surface the failure to the caller
        assert!(quota
            .increment("org-1", QuotaType::ProcessingMonthly, 1)
            .await
            .is_err());
    }
}
