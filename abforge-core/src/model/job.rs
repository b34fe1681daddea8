use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::config::Configuration;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a [`Job`]. See spec.md §3 for the transition diagram.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Planning,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Planning => "planning",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobStatus::Pending,
            "planning" => JobStatus::Planning,
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }

    /// Non-terminal statuses are the ones `get_incomplete_jobs` returns.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Planning | JobStatus::Processing
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_incomplete()
    }
}

/// A single user request: a Configuration applied to a set of folders.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub user_id: Option<String>,
    pub config: Configuration,
    pub error: Option<String>,
}

/// Aggregate counters computed by the store with a single query
/// (spec.md §4.1 `get_job_progress`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub running: u32,
    pub pending: u32,
    pub waiting_for_user: u32,
    pub cancelled: u32,
}

impl JobProgress {
    /// True once every task has reached a terminal status, i.e. the job is
    /// ready to transition to `Completed` (spec.md §4.4).
    pub fn is_done(&self) -> bool {
        self.completed + self.failed + self.skipped + self.cancelled == self.total
            && self.running == 0
            && self.pending == 0
            && self.waiting_for_user == 0
    }
}
