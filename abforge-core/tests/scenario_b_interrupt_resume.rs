//! Scenario B (spec.md §8, §4.4 "Processing" phase): a job interrupted
//! mid-run is preserved rather than marked `completed`, and a fresh
//! dispatch against the same store (`prepare_resume` +
//! `enqueue_all_tasks`, the CLI's resume path) drains it to completion.

mod support;

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use abforge_core::config::Configuration;
use abforge_core::dispatcher::prepare_resume;
use abforge_core::model::{JobStatus, TaskStatus};
use abforge_core::store::{QueueStore, TaskUpdate};

#[test]
fn interrupted_job_is_preserved_and_resume_drains_it() {
    let dir = tempfile::tempdir().unwrap();
    let a = support::book_folder(dir.path(), "book-a", "Warbreaker", "Brandon Sanderson");
    let b = support::book_folder(dir.path(), "book-b", "Mistborn", "Brandon Sanderson");
    let c = support::book_folder(dir.path(), "book-c", "Elantris", "Brandon Sanderson");

    let store = QueueStore::open_in_memory().unwrap();
    let config = Configuration {
        from_opf: true,
        ..Configuration::default()
    };
    let job_id = support::identify(&store, &config, &[a, b, c]);
    let mut tasks = store.get_tasks_for_job(job_id, None).unwrap();
    tasks.sort_by(|x, y| x.folder_path.cmp(&y.folder_path));
    assert_eq!(tasks.len(), 3);

    // Simulate a process killed mid-run: one task finished before the
    // interrupt, one was actively being worked (`running`, a worker_id
    // assigned) when the process died, and the third was never even
    // dispatched.
    store
        .update_task_status(
            tasks[0].id,
            TaskStatus::Completed,
            TaskUpdate {
                completed_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .unwrap();
    store.mark_enqueued(tasks[1].id).unwrap();
    store
        .update_task_status(
            tasks[1].id,
            TaskStatus::Running,
            TaskUpdate {
                started_at: Some(chrono::Utc::now()),
                worker_id: Some("worker-0".into()),
                ..Default::default()
            },
        )
        .unwrap();

    // The job is not done: one task is still `running`.
    let progress = store.get_job_progress(job_id).unwrap();
    assert!(!progress.is_done());
    let job = store.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);

    // Resume, as the CLI does: reset orphaned `running` tasks, then a
    // brand new `Dispatcher` (fresh process, empty channel) re-enqueues
    // and drains everything outstanding.
    let reset = prepare_resume(&store, job_id).unwrap();
    assert_eq!(reset, 1);
    let resumed_task = store.get_task(tasks[1].id).unwrap().unwrap();
    assert_eq!(resumed_task.status, TaskStatus::Pending);

    let dispatcher = support::dispatcher_for(&store);
    let enqueued = dispatcher.enqueue_all_tasks(job_id).unwrap();
    assert_eq!(enqueued, 2); // the reset task plus the never-dispatched one

    let interrupted = AtomicBool::new(false);
    dispatcher
        .run_until_done(job_id, 2, Duration::from_millis(5), &interrupted)
        .unwrap();

    let job = store.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let progress = store.get_job_progress(job_id).unwrap();
    assert_eq!(progress.completed, 3);
    assert_eq!(progress.total, 3);
}
