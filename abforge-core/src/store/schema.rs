//! Embedded schema DDL, applied once at store open and tracked in
//! `schema_version` (spec.md §4.1). `rusqlite` has no bundled migrator the
//! way the teacher's `sqlx::migrate!` does, and a handful of `CREATE TABLE
//! IF NOT EXISTS` statements don't warrant pulling in `rusqlite_migration`
//! (see DESIGN.md).

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

pub const MIGRATIONS: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    status          TEXT NOT NULL CHECK (status IN
                        ('pending','planning','processing','completed','failed','cancelled')),
    total           INTEGER NOT NULL DEFAULT 0,
    completed       INTEGER NOT NULL DEFAULT 0,
    failed          INTEGER NOT NULL DEFAULT 0,
    skipped         INTEGER NOT NULL DEFAULT 0,
    user_id         TEXT,
    config_json     TEXT NOT NULL,
    error           TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC);

CREATE TABLE IF NOT EXISTS tasks (
    id                      TEXT PRIMARY KEY,
    job_id                  TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    folder_path             TEXT NOT NULL,
    url                     TEXT,
    status                  TEXT NOT NULL CHECK (status IN
                                ('pending','running','waiting_for_user','completed','failed','skipped','cancelled')),
    retry_count             INTEGER NOT NULL DEFAULT 0,
    max_retries             INTEGER NOT NULL DEFAULT 2,
    error                   TEXT,
    result_json             TEXT,
    created_at              TEXT NOT NULL,
    started_at              TEXT,
    completed_at             TEXT,
    worker_id               TEXT,
    enqueued_at             TEXT,
    user_input_type         TEXT,
    user_input_prompt       TEXT,
    user_input_options_json TEXT,
    user_input_context_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_job_id ON tasks(job_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS file_locks (
    lock_path       TEXT PRIMARY KEY,
    locked_by_task  TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    acquired_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_locks_task ON file_locks(locked_by_task);
"#;
