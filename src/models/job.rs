use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job liveness status as tracked by the heartbeat store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Stale,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Stale => "stale",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "active" | "running" | "processing" => Some(JobStatus::Active),
            "stale" => Some(JobStatus::Stale),
            "completed" | "complete" | "done" => Some(JobStatus::Completed),
            "failed" | "error" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Whether the reaper may still act on a job in this status
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Active)
    }

    /// Completed and failed jobs never change status again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Last known liveness of a single job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub job_id: String,
    pub last_seen: DateTime<Utc>,
    pub status: JobStatus,
}

impl HeartbeatRecord {
    pub fn active(job_id: impl Into<String>, last_seen: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            last_seen,
            status: JobStatus::Active,
        }
    }

    /// Time elapsed since the last heartbeat, clamped at zero for clock skew
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        let age = now.signed_duration_since(self.last_seen);
        if age < chrono::Duration::zero() {
            chrono::Duration::zero()
        } else {
            age
        }
    }
}
