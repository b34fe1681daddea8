pub mod job;
pub mod metadata;
pub mod task;

pub use job::{Job, JobId, JobProgress, JobStatus};
pub use metadata::{BookMetadata, Companions};
pub use task::{Task, TaskId, TaskStatus, UserInputRequest, UserInputResponse, OPF_MARKER};
