use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use super::job::JobId;
use super::metadata::BookMetadata;

/// Sentinel URL value meaning "read `metadata.opf` instead of scraping"
/// (spec.md §4.5 stage 1).
pub const OPF_MARKER: &str = "OPF";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    WaitingForUser,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::WaitingForUser => "waiting_for_user",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "waiting_for_user" => TaskStatus::WaitingForUser,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "skipped" => TaskStatus::Skipped,
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        })
    }

    /// Terminal statuses imply `completed_at` is non-null (invariant in
    /// spec.md §3) and are never subsequently overwritten except by job
    /// deletion (testable property 2).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }
}

/// A prompt surfaced to an interactive caller when a worker needs input it
/// cannot resolve itself (spec.md §4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserInputRequest {
    pub input_type: String,
    pub prompt: String,
    pub options: serde_json::Value,
    pub context: serde_json::Value,
}

/// The caller's answer to a [`UserInputRequest`], applied by
/// `resume_task_from_user_input`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserInputResponse {
    pub url: Option<String>,
    pub extra: serde_json::Value,
}

/// One audiobook folder's end-to-end processing unit (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub folder_path: PathBuf,
    pub url: Option<String>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub result: Option<BookMetadata>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub user_input: Option<UserInputRequest>,
}

impl Task {
    pub fn is_opf_source(&self) -> bool {
        self.url.as_deref() == Some(OPF_MARKER)
    }
}
