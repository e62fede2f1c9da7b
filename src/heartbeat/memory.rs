//! In-process heartbeat store

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::HeartbeatStore;
use crate::error::{BrokerError, Result};
use crate::models::{HeartbeatRecord, JobStatus};

/// Heartbeat records kept in a concurrent map
///
/// Like the in-memory bus it can be switched offline to exercise the
/// reaper's failure handling.
#[derive(Debug)]
pub struct InMemoryHeartbeatStore {
    records: DashMap<String, HeartbeatRecord>,
    available: AtomicBool,
}

impl InMemoryHeartbeatStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::StoreUnavailable(
                "in-memory heartbeat store is offline".into(),
            ))
        }
    }
}

impl Default for InMemoryHeartbeatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HeartbeatStore for InMemoryHeartbeatStore {
    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn active_job_ids(&self) -> Result<HashSet<String>> {
        self.ensure_available()?;
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.status.is_active())
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn get_record(&self, job_id: &str) -> Result<Option<HeartbeatRecord>> {
        self.ensure_available()?;
        Ok(self.records.get(job_id).map(|r| r.value().clone()))
    }

    async fn mark_stale(&self, job_id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        self.ensure_available()?;
        match self.records.get_mut(job_id) {
            Some(mut record) if record.status.is_active() && record.last_seen < cutoff => {
                record.status = JobStatus::Stale;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_heartbeat(&self, job_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.ensure_available()?;
        let mut record = self
            .records
            .entry(job_id.to_string())
            .or_insert_with(|| HeartbeatRecord::active(job_id, at));

        if !record.status.is_active() {
            return Ok(false);
        }
        if at > record.last_seen {
            record.last_seen = at;
        }
        Ok(true)
    }

    async fn mark_finished(&self, job_id: &str, status: JobStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(BrokerError::InvalidMessage(format!(
                "{} is not a terminal job status",
                status
            )));
        }
        self.ensure_available()?;

        let mut record = self
            .records
            .entry(job_id.to_string())
            .or_insert_with(|| HeartbeatRecord::active(job_id, Utc::now()));
        record.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_heartbeat_is_monotonic() {
        let store = InMemoryHeartbeatStore::new();
        let now = Utc::now();

        assert!(store.record_heartbeat("job-1", now).await.unwrap());
        assert!(store
            .record_heartbeat("job-1", now - Duration::seconds(30))
            .await
            .unwrap());

        let record = store.get_record("job-1").await.unwrap().unwrap();
        assert_eq!(record.last_seen, now);
        assert_eq!(record.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_mark_stale_only_transitions_active_jobs() {
        let store = InMemoryHeartbeatStore::new();
        let now = Utc::now();
        store.record_heartbeat("job-1", now).await.unwrap();
        let cutoff = now + Duration::seconds(1);

        assert!(store.mark_stale("job-1", cutoff).await.unwrap());
        assert!(!store.mark_stale("job-1", cutoff).await.unwrap());
        assert!(!store.mark_stale("missing", cutoff).await.unwrap());

        assert!(store.active_job_ids().await.unwrap().is_empty());
        // Heartbeats no longer revive a stale job
        assert!(!store.record_heartbeat("job-1", Utc::now()).await.unwrap());
        assert_eq!(
            store.get_record("job-1").await.unwrap().unwrap().status,
            JobStatus::Stale
        );
    }

    #[tokio::test]
    async fn test_finished_jobs_leave_active_set() {
        let store = InMemoryHeartbeatStore::new();
        store.record_heartbeat("job-1", Utc::now()).await.unwrap();
        store.record_heartbeat("job-2", Utc::now()).await.unwrap();

        store.mark_finished("job-1", JobStatus::Completed).await.unwrap();

        let active = store.active_job_ids().await.unwrap();
        assert_eq!(active, HashSet::from(["job-2".to_string()]));
        assert!(!store
            .mark_stale("job-1", Utc::now() + Duration::seconds(1))
            .await
            .unwrap());

        assert!(matches!(
            store.mark_finished("job-2", JobStatus::Stale).await,
            Err(BrokerError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_store_fails_every_call() {
        let store = InMemoryHeartbeatStore::new();
        store.set_available(false);

        assert!(matches!(
            store.ping().await,
            Err(BrokerError::StoreUnavailable(_))
        ));
        assert!(store.active_job_ids().await.is_err());
        assert!(store.mark_stale("job-1", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_stale_respects_fresh_heartbeat() {
        let store = InMemoryHeartbeatStore::new();
        let now = Utc::now();
        let cutoff = now - Duration::seconds(600);
        store
            .record_heartbeat("job-1", now - Duration::seconds(601))
            .await
            .unwrap();

        // Worker checks in after the caller read the old record
        store.record_heartbeat("job-1", now).await.unwrap();

        assert!(!store.mark_stale("job-1", cutoff).await.unwrap());
        assert!(!store.mark_stale("job-1", now).await.unwrap());
        assert_eq!(
            store.get_record("job-1").await.unwrap().unwrap().status,
            JobStatus::Active
        );
    }
}
