//! Heartbeat store
//!
//! Records the last heartbeat of every in-flight job. Workers write it; the
//! stale job reaper reads it and flips silent jobs to stale.

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryHeartbeatStore;
pub use redis_store::RedisHeartbeatStore;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{HeartbeatRecord, JobStatus};

/// Persistence for job liveness
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Check that the store is reachable
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Ids of every job currently ACTIVE
    async fn active_job_ids(&self) -> Result<HashSet<String>>;

    /// Load one job's record, if it exists
    async fn get_record(&self, job_id: &str) -> Result<Option<HeartbeatRecord>>;

    /// Move a job from ACTIVE to STALE if its last heartbeat is older than `cutoff`
    ///
    /// Returns false when the job was not ACTIVE (already stale, finished or
    /// unknown) or a heartbeat at or after `cutoff` has arrived since the
    /// caller read the record. The check and the update happen atomically.
    async fn mark_stale(&self, job_id: &str, cutoff: DateTime<Utc>) -> Result<bool>;

    /// Record a worker heartbeat, creating the job as ACTIVE if unknown
    ///
    /// `last_seen` never moves backwards. Heartbeats for jobs that are no
    /// longer ACTIVE are ignored and return false.
    async fn record_heartbeat(&self, job_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Move a job to COMPLETED or FAILED
    async fn mark_finished(&self, job_id: &str, status: JobStatus) -> Result<()>;
}
