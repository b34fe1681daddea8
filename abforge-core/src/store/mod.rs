//! Persistent Queue Store (spec.md §4.1): durable jobs/tasks/file_locks,
//! the primary concurrency boundary between the dispatcher, workers, and
//! any external observer polling progress.
//!
//! Single shared `rusqlite::Connection` behind a `Mutex`, matching the
//! teacher's "single shared database connection is acceptable because the
//! embedded store serializes writes" note (spec.md §4.1, §5). Every
//! mutating method commits before returning.

mod schema;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::Configuration;
use crate::error::{AbForgeError, Result};
use crate::model::{BookMetadata, Job, JobId, JobProgress, JobStatus, Task, TaskId, TaskStatus, UserInputRequest, UserInputResponse};

/// Patch applied to a job row in one statement (spec.md §4.1
/// `update_job_status(id, newStatus, **fields)`).
#[derive(Default, Debug)]
pub struct JobUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total: Option<u32>,
    pub completed: Option<u32>,
    pub failed: Option<u32>,
    pub skipped: Option<u32>,
    pub error: Option<String>,
}

/// Patch applied to a task row in one statement.
#[derive(Default, Debug)]
pub struct TaskUpdate {
    pub url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub retry_count: Option<u32>,
    pub error: Option<String>,
    pub result: Option<BookMetadata>,
    pub enqueued_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct QueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore").finish_non_exhaustive()
    }
}

fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl QueueStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(schema::MIGRATIONS)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![schema::CURRENT_SCHEMA_VERSION, to_rfc3339(Utc::now())],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- jobs -----------------------------------------------------------

    pub fn create_job(&self, config: &Configuration, user_id: Option<String>) -> Result<JobId> {
        let id = JobId::new();
        let config_json = serde_json::to_string(config)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (id, created_at, status, config_json, user_id)
             VALUES (?1, ?2, 'pending', ?3, ?4)",
            params![id.0.to_string(), to_rfc3339(Utc::now()), config_json, user_id],
        )?;
        Ok(id)
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, created_at, started_at, completed_at, status, total, completed,
                    failed, skipped, user_id, config_json, error
             FROM jobs WHERE id = ?1",
            params![id.0.to_string()],
            Self::row_to_job,
        )
        .optional()
        .map_err(AbForgeError::from)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status_str: String = row.get(4)?;
        let config_json: String = row.get(10)?;
        Ok(Job {
            id: row
                .get::<_, String>(0)?
                .parse()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            created_at: parse_ts(row.get(1)?).unwrap_or_else(Utc::now),
            started_at: parse_ts(row.get(2)?),
            completed_at: parse_ts(row.get(3)?),
            status: JobStatus::parse(&status_str).ok_or(rusqlite::Error::InvalidQuery)?,
            total: row.get(5)?,
            completed: row.get(6)?,
            failed: row.get(7)?,
            skipped: row.get(8)?,
            user_id: row.get(9)?,
            config: serde_json::from_str(&config_json)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            error: row.get(11)?,
        })
    }

    pub fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        update: JobUpdate,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET status = ?1,
                started_at = COALESCE(?2, started_at),
                completed_at = COALESCE(?3, completed_at),
                total = COALESCE(?4, total),
                completed = COALESCE(?5, completed),
                failed = COALESCE(?6, failed),
                skipped = COALESCE(?7, skipped),
                error = COALESCE(?8, error)
             WHERE id = ?9",
            params![
                status.as_str(),
                update.started_at.map(to_rfc3339),
                update.completed_at.map(to_rfc3339),
                update.total,
                update.completed,
                update.failed,
                update.skipped,
                update.error,
                id.0.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn get_job_progress(&self, job_id: JobId) -> Result<JobProgress> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT
                COUNT(*) as total,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'skipped' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'waiting_for_user' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0)
             FROM tasks WHERE job_id = ?1",
        )?;
        let progress = stmt.query_row(params![job_id.0.to_string()], |row| {
            Ok(JobProgress {
                total: row.get(0)?,
                completed: row.get(1)?,
                failed: row.get(2)?,
                skipped: row.get(3)?,
                running: row.get(4)?,
                pending: row.get(5)?,
                waiting_for_user: row.get(6)?,
                cancelled: row.get(7)?,
            })
        })?;
        Ok(progress)
    }

    pub fn get_incomplete_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, started_at, completed_at, status, total, completed,
                    failed, skipped, user_id, config_json, error
             FROM jobs
             WHERE status IN ('pending','planning','processing')
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], Self::row_to_job)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(AbForgeError::from)
    }

    pub fn delete_job(&self, id: JobId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.0.to_string()])?;
        Ok(())
    }

    // ---- tasks ------------------------------------------------------------

    pub fn create_task(
        &self,
        job_id: JobId,
        folder_path: &Path,
        url: Option<&str>,
        max_retries: u32,
    ) -> Result<TaskId> {
        let id = TaskId::new();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, job_id, folder_path, url, status, max_retries, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
            params![
                id.0.to_string(),
                job_id.0.to_string(),
                folder_path.to_string_lossy(),
                url,
                max_retries,
                to_rfc3339(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    pub fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1", Self::TASK_SELECT),
            params![id.0.to_string()],
            Self::row_to_task,
        )
        .optional()
        .map_err(AbForgeError::from)
    }

    const TASK_SELECT: &'static str = "SELECT id, job_id, folder_path, url, status, retry_count,
                max_retries, error, result_json, created_at, started_at, completed_at,
                worker_id, enqueued_at, user_input_type, user_input_prompt,
                user_input_options_json, user_input_context_json
             FROM tasks";

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let status_str: String = row.get(4)?;
        let result_json: Option<String> = row.get(8)?;
        let input_type: Option<String> = row.get(14)?;
        let user_input = match input_type {
            Some(input_type) => {
                let options_json: Option<String> = row.get(16)?;
                let context_json: Option<String> = row.get(17)?;
                Some(UserInputRequest {
                    input_type,
                    prompt: row.get(15)?,
                    options: options_json
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or(serde_json::Value::Null),
                    context: context_json
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or(serde_json::Value::Null),
                })
            }
            None => None,
        };
        Ok(Task {
            id: row
                .get::<_, String>(0)?
                .parse()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            job_id: row
                .get::<_, String>(1)?
                .parse()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            folder_path: PathBuf::from(row.get::<_, String>(2)?),
            url: row.get(3)?,
            status: TaskStatus::parse(&status_str).ok_or(rusqlite::Error::InvalidQuery)?,
            retry_count: row.get(5)?,
            max_retries: row.get(6)?,
            error: row.get(7)?,
            result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_ts(row.get(9)?).unwrap_or_else(Utc::now),
            started_at: parse_ts(row.get(10)?),
            completed_at: parse_ts(row.get(11)?),
            worker_id: row.get(12)?,
            enqueued_at: parse_ts(row.get(13)?),
            user_input,
        })
    }

    pub fn get_pending_tasks(&self, job_id: JobId) -> Result<Vec<Task>> {
        self.get_tasks_for_job(job_id, Some(TaskStatus::Pending))
    }

    pub fn get_tasks_for_job(
        &self,
        job_id: JobId,
        status_filter: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let rows = match status_filter {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE job_id = ?1 AND status = ?2",
                    Self::TASK_SELECT
                ))?;
                let result = stmt
                    .query_map(
                        params![job_id.0.to_string(), status.as_str()],
                        Self::row_to_task,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("{} WHERE job_id = ?1", Self::TASK_SELECT))?;
                let result = stmt
                    .query_map(params![job_id.0.to_string()], Self::row_to_task)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
        };
        Ok(rows)
    }

    pub fn get_tasks_waiting_for_user(&self, job_id: JobId) -> Result<Vec<Task>> {
        self.get_tasks_for_job(job_id, Some(TaskStatus::WaitingForUser))
    }

    /// Tasks that are `pending` and have never been enqueued, used by
    /// `enqueue_all_tasks` (spec.md §4.4).
    pub fn get_unenqueued_pending_tasks(&self, job_id: JobId) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE job_id = ?1 AND status = 'pending' AND enqueued_at IS NULL",
            Self::TASK_SELECT
        ))?;
        let rows = stmt
            .query_map(params![job_id.0.to_string()], Self::row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update_task_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<()> {
        let result_json = match &update.result {
            Some(metadata) => Some(serde_json::to_string(metadata)?),
            None => None,
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET status = ?1,
                url = COALESCE(?2, url),
                started_at = COALESCE(?3, started_at),
                completed_at = COALESCE(?4, completed_at),
                worker_id = COALESCE(?5, worker_id),
                retry_count = COALESCE(?6, retry_count),
                error = COALESCE(?7, error),
                result_json = COALESCE(?8, result_json),
                enqueued_at = COALESCE(?9, enqueued_at)
             WHERE id = ?10",
            params![
                status.as_str(),
                update.url,
                update.started_at.map(to_rfc3339),
                update.completed_at.map(to_rfc3339),
                update.worker_id,
                update.retry_count,
                update.error,
                result_json,
                update.enqueued_at.map(to_rfc3339),
                id.0.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Stamps `enqueued_at` for the given tasks (one statement per id, all
    /// within the caller's dispatch loop) so a later `enqueue_all_tasks`
    /// call never re-dispatches them (testable property 6).
    pub fn mark_enqueued(&self, id: TaskId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET enqueued_at = ?1 WHERE id = ?2 AND enqueued_at IS NULL",
            params![to_rfc3339(Utc::now()), id.0.to_string()],
        )?;
        Ok(())
    }

    /// Resets every `running` task of a job back to `pending` (worker
    /// presumed dead), leaving `enqueued_at` untouched so a subsequent
    /// `enqueue_all_tasks` picks them up again. Used on resume
    /// (spec.md §4.4 "Processing" phase, testable property 5).
    pub fn reset_running_tasks_to_pending(&self, job_id: JobId) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE tasks SET status = 'pending', enqueued_at = NULL, worker_id = NULL
             WHERE job_id = ?1 AND status = 'running'",
            params![job_id.0.to_string()],
        )?;
        Ok(count as u32)
    }

    pub fn set_task_waiting_for_user(
        &self,
        task_id: TaskId,
        request: &UserInputRequest,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET status = 'waiting_for_user',
                user_input_type = ?1,
                user_input_prompt = ?2,
                user_input_options_json = ?3,
                user_input_context_json = ?4
             WHERE id = ?5",
            params![
                request.input_type,
                request.prompt,
                serde_json::to_string(&request.options)?,
                serde_json::to_string(&request.context)?,
                task_id.0.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn resume_task_from_user_input(
        &self,
        task_id: TaskId,
        response: &UserInputResponse,
        clear_input_fields: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if clear_input_fields {
            conn.execute(
                "UPDATE tasks SET status = 'pending', url = COALESCE(?1, url),
                    enqueued_at = NULL,
                    user_input_type = NULL, user_input_prompt = NULL,
                    user_input_options_json = NULL, user_input_context_json = NULL
                 WHERE id = ?2",
                params![response.url, task_id.0.to_string()],
            )?;
        } else {
            conn.execute(
                "UPDATE tasks SET status = 'pending', url = COALESCE(?1, url), enqueued_at = NULL
                 WHERE id = ?2",
                params![response.url, task_id.0.to_string()],
            )?;
        }
        Ok(())
    }

    // ---- file locks (database lock mode, spec.md §4.2) --------------------

    /// Attempts to insert a lock row; returns `true` on success, `false`
    /// on a primary-key conflict (another task already holds this path).
    pub fn try_acquire_file_lock(&self, lock_path: &str, task_id: TaskId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        match conn.execute(
            "INSERT INTO file_locks (lock_path, locked_by_task, acquired_at) VALUES (?1, ?2, ?3)",
            params![lock_path, task_id.0.to_string(), to_rfc3339(Utc::now())],
        ) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(AbForgeError::from(e)),
        }
    }

    pub fn release_file_lock(&self, lock_path: &str, task_id: TaskId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM file_locks WHERE lock_path = ?1 AND locked_by_task = ?2",
            params![lock_path, task_id.0.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn store() -> QueueStore {
        QueueStore::open_in_memory().unwrap()
    }

    #[test]
    fn create_and_fetch_job() {
        let store = store();
        let config = Configuration {
            folders: vec![PathBuf::from("/tmp/book")],
            ..Default::default()
        };
        let id = store.create_job(&config, None).unwrap();
        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.config.folders, config.folders);
    }

    #[test]
    fn progress_counts_all_statuses() {
        let store = store();
        let config = Configuration::default();
        let job_id = store.create_job(&config, None).unwrap();
        let t1 = store.create_task(job_id, Path::new("/a"), None, 2).unwrap();
        let t2 = store.create_task(job_id, Path::new("/b"), None, 2).unwrap();
        store
            .update_task_status(t1, TaskStatus::Completed, TaskUpdate {
                completed_at: Some(Utc::now()),
                ..Default::default()
            })
            .unwrap();
        let progress = store.get_job_progress(job_id).unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.pending, 1);
        let _ = t2;
    }

    #[test]
    fn delete_job_cascades_to_tasks_and_locks() {
        let store = store();
        let config = Configuration::default();
        let job_id = store.create_job(&config, None).unwrap();
        let task_id = store.create_task(job_id, Path::new("/a"), None, 2).unwrap();
        assert!(store.try_acquire_file_lock("/a/author", task_id).unwrap());
        store.delete_job(job_id).unwrap();
        assert!(store.get_task(task_id).unwrap().is_none());
        // re-acquiring the same path must succeed now that the lock row is gone
        let job2 = store.create_job(&config, None).unwrap();
        let task2 = store.create_task(job2, Path::new("/a"), None, 2).unwrap();
        assert!(store.try_acquire_file_lock("/a/author", task2).unwrap());
    }

    #[test]
    fn file_lock_exclusion() {
        let store = store();
        let config = Configuration::default();
        let job_id = store.create_job(&config, None).unwrap();
        let t1 = store.create_task(job_id, Path::new("/a"), None, 2).unwrap();
        let t2 = store.create_task(job_id, Path::new("/b"), None, 2).unwrap();
        assert!(store.try_acquire_file_lock("/shared", t1).unwrap());
        assert!(!store.try_acquire_file_lock("/shared", t2).unwrap());
        store.release_file_lock("/shared", t1).unwrap();
        assert!(store.try_acquire_file_lock("/shared", t2).unwrap());
    }

    #[test]
    fn mark_enqueued_is_idempotent_for_unenqueued_query() {
        let store = store();
        let config = Configuration::default();
        let job_id = store.create_job(&config, None).unwrap();
        let task_id = store.create_task(job_id, Path::new("/a"), None, 2).unwrap();
        let unenqueued = store.get_unenqueued_pending_tasks(job_id).unwrap();
        assert_eq!(unenqueued.len(), 1);
        store.mark_enqueued(task_id).unwrap();
        let unenqueued = store.get_unenqueued_pending_tasks(job_id).unwrap();
        assert!(unenqueued.is_empty());
    }

    #[test]
    fn resume_resets_running_to_pending() {
        let store = store();
        let config = Configuration::default();
        let job_id = store.create_job(&config, None).unwrap();
        let task_id = store.create_task(job_id, Path::new("/a"), None, 2).unwrap();
        store
            .update_task_status(task_id, TaskStatus::Running, TaskUpdate {
                started_at: Some(Utc::now()),
                worker_id: Some("worker-0".into()),
                ..Default::default()
            })
            .unwrap();
        let reset = store.reset_running_tasks_to_pending(job_id).unwrap();
        assert_eq!(reset, 1);
        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
