//! Task Dispatcher & Worker Pool (spec.md §4.4): moves tasks from
//! `pending` through the pipeline to a terminal state using a bounded
//! number of worker threads.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::genre::GenreNormalizer;
use crate::locks::FileLockManager;
use crate::model::{Job, JobId, JobStatus, TaskId, TaskStatus, UserInputResponse};
use crate::pipeline::{self, PipelineContext};
use crate::rate_limiter::DomainRateLimiter;
use crate::scrapers::ScraperRegistry;
use crate::store::{JobUpdate, QueueStore, TaskUpdate};

const CHANNEL_CAPACITY: usize = 256;

enum WorkItem {
    Process(TaskId),
    Shutdown,
}

/// Shared collaborators injected into every worker thread
/// (spec.md §4.4 "Build the pipeline's processors").
#[derive(Clone)]
pub struct Dispatcher {
    store: QueueStore,
    locks: FileLockManager,
    rate_limiter: DomainRateLimiter,
    genre_normalizer: Arc<GenreNormalizer>,
    scrapers: Arc<ScraperRegistry>,
    http: reqwest::blocking::Client,
    sender: Sender<WorkItem>,
    receiver: Receiver<WorkItem>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: QueueStore,
        locks: FileLockManager,
        rate_limiter: DomainRateLimiter,
        genre_normalizer: Arc<GenreNormalizer>,
        scrapers: Arc<ScraperRegistry>,
        http: reqwest::blocking::Client,
    ) -> Self {
        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        Self {
            store,
            locks,
            rate_limiter,
            genre_normalizer,
            scrapers,
            http,
            sender,
            receiver,
        }
    }

    /// Scans tasks where `status='pending' AND enqueued_at IS NULL`, stamps
    /// `enqueued_at`, and pushes each to the channel. Safe to call
    /// repeatedly for late-arriving tasks without re-dispatching the same
    /// task twice (spec.md §4.4 "Enqueue protocol", testable property 6).
    pub fn enqueue_all_tasks(&self, job_id: JobId) -> Result<usize> {
        let tasks = self.store.get_unenqueued_pending_tasks(job_id)?;
        let count = tasks.len();
        for task in tasks {
            self.store.mark_enqueued(task.id)?;
            let _ = self.sender.send(WorkItem::Process(task.id));
        }
        Ok(count)
    }

    /// Re-enqueues a task that was parked `waiting_for_user`
    /// (spec.md §4.7).
    pub fn resume_task(&self, task_id: TaskId, response: &UserInputResponse) -> Result<()> {
        self.store.resume_task_from_user_input(task_id, response, true)?;
        self.store.mark_enqueued(task_id)?;
        let _ = self.sender.send(WorkItem::Process(task_id));
        Ok(())
    }

    /// Runs `worker_count` worker threads against `job_id` until the
    /// channel is drained and every task has reached a terminal (or
    /// `waiting_for_user`) status, then transitions the job to `completed`.
    ///
    /// Blocks the calling thread for the duration of the run
    /// (spec.md §4.4 "Scheduling model").
    ///
    /// `interrupted` is polled alongside job status; when it flips to
    /// `true` (a caller's Ctrl-C handler, spec.md §4.4 "Processing" phase)
    /// the loop stops dispatching and returns without marking the job
    /// `completed`, leaving it resumable.
    pub fn run_until_done(
        &self,
        job_id: JobId,
        worker_count: usize,
        poll_interval: Duration,
        interrupted: &std::sync::atomic::AtomicBool,
    ) -> Result<()> {
        use std::sync::atomic::Ordering;
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..worker_count)
                .map(|i| {
                    let name = format!("worker-{i}");
                    scope.spawn(move || self.worker_loop(&name, job_id))
                })
                .collect();

            loop {
                std::thread::sleep(poll_interval);
                if interrupted.load(Ordering::SeqCst) {
                    break;
                }
                match self.store.get_job(job_id) {
                    Ok(Some(job)) if job.status.is_terminal() => break,
                    Ok(Some(job)) => {
                        let progress = self.store.get_job_progress(job_id);
                        if let Ok(progress) = progress {
                            if progress.is_done() && job.status == JobStatus::Processing {
                                let _ = self.store.update_job_status(
                                    job_id,
                                    JobStatus::Completed,
                                    JobUpdate {
                                        completed_at: Some(Utc::now()),
                                        ..Default::default()
                                    },
                                );
                                break;
                            }
                        }
                    }
                    _ => break,
                }
            }

            for _ in 0..worker_count {
                let _ = self.sender.send(WorkItem::Shutdown);
            }
            for handle in handles {
                let _ = handle.join();
            }
        });

        Ok(())
    }

    fn worker_loop(&self, worker_name: &str, job_id: JobId) {
        while let Ok(item) = self.receiver.recv() {
            match item {
                WorkItem::Shutdown => break,
                WorkItem::Process(task_id) => {
                    if self.job_cancelled(job_id) {
                        continue;
                    }
                    if let Err(e) = self.process_task(worker_name, job_id, task_id) {
                        error!(worker = worker_name, task = %task_id, error = %e, "worker loop error");
                    }
                }
            }
        }
    }

    fn job_cancelled(&self, job_id: JobId) -> bool {
        matches!(
            self.store.get_job(job_id),
            Ok(Some(Job { status: JobStatus::Cancelled, .. }))
        )
    }

    fn process_task(&self, worker_name: &str, job_id: JobId, task_id: TaskId) -> Result<()> {
        self.store.update_task_status(
            task_id,
            TaskStatus::Running,
            TaskUpdate {
                started_at: Some(Utc::now()),
                worker_id: Some(worker_name.to_string()),
                ..Default::default()
            },
        )?;

        let task = match self.store.get_task(task_id)? {
            Some(t) => t,
            None => return Ok(()),
        };
        let job = match self.store.get_job(job_id)? {
            Some(j) => j,
            None => return Ok(()),
        };

        let cancelled_flag = || self.job_cancelled(job_id);
        let ctx = PipelineContext {
            config: &job.config,
            locks: &self.locks,
            rate_limiter: &self.rate_limiter,
            genre_normalizer: &self.genre_normalizer,
            scrapers: &self.scrapers,
            http: &self.http,
            task_id,
            is_cancelled: &cancelled_flag,
        };

        info!(worker = worker_name, task = %task_id, "running pipeline");
        match pipeline::run(&ctx, &task) {
            Ok(outcome) => {
                self.store.update_task_status(
                    task_id,
                    TaskStatus::Completed,
                    TaskUpdate {
                        completed_at: Some(Utc::now()),
                        result: Some(outcome.metadata),
                        ..Default::default()
                    },
                )?;
            }
            Err(crate::error::AbForgeError::SkippedByUser) => {
                self.store.update_task_status(
                    task_id,
                    TaskStatus::Skipped,
                    TaskUpdate {
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )?;
            }
            Err(crate::error::AbForgeError::Cancelled) => {
                self.store.update_task_status(
                    task_id,
                    TaskStatus::Cancelled,
                    TaskUpdate {
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )?;
            }
            Err(e) => {
                if e.is_retriable() && task.retry_count < task.max_retries {
                    warn!(worker = worker_name, task = %task_id, error = %e, retry = task.retry_count + 1, "retrying task");
                    self.store.update_task_status(
                        task_id,
                        TaskStatus::Pending,
                        TaskUpdate {
                            retry_count: Some(task.retry_count + 1),
                            error: Some(e.to_string()),
                            enqueued_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )?;
                    let _ = self.sender.send(WorkItem::Process(task_id));
                    return Ok(());
                }
                self.store.update_task_status(
                    task_id,
                    TaskStatus::Failed,
                    TaskUpdate {
                        completed_at: Some(Utc::now()),
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                )?;
            }
        }

        self.maybe_complete_job(job_id)
    }

    fn maybe_complete_job(&self, job_id: JobId) -> Result<()> {
        let job = match self.store.get_job(job_id)? {
            Some(j) => j,
            None => return Ok(()),
        };
        if job.status != JobStatus::Processing {
            return Ok(());
        }
        let progress = self.store.get_job_progress(job_id)?;
        if progress.is_done() {
            self.store.update_job_status(
                job_id,
                JobStatus::Completed,
                JobUpdate {
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }
}

/// On resume (spec.md §4.4 "Processing" phase): resets any `running` tasks
/// left behind by a dead worker back to `pending`, so a fresh
/// `enqueue_all_tasks` call picks them up (testable property 5).
pub fn prepare_resume(store: &QueueStore, job_id: JobId) -> Result<u32> {
    store.reset_running_tasks_to_pending(job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::genre::NoopAdvisor;
    use crate::scrapers::test_support::fake_scraper;
    use std::path::Path;

    fn dispatcher_fixture(scrapers: ScraperRegistry) -> (Dispatcher, QueueStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open_in_memory().unwrap();
        let locks = FileLockManager::os_file();
        let limiter = DomainRateLimiter::new(Duration::from_millis(1));
        let genres = Arc::new(
            GenreNormalizer::new(dir.path().join("genres.json"), Box::new(NoopAdvisor), false).unwrap(),
        );
        let http = reqwest::blocking::Client::new();
        let dispatcher = Dispatcher::new(
            store.clone(),
            locks,
            limiter,
            genres,
            Arc::new(scrapers),
            http,
        );
        (dispatcher, store, dir)
    }

    #[test]
    fn successful_task_completes_job() {
        let mut metadata = crate::model::BookMetadata::new();
        metadata.title = Some("Elantris".into());
        let scrapers = ScraperRegistry::new(vec![Box::new(fake_scraper("fake", metadata))]);
        let (dispatcher, store, dir) = dispatcher_fixture(scrapers);

        let mut config = Configuration::default();
        config.opf = false;
        let job_id = store.create_job(&config, None).unwrap();
        store.update_job_status(job_id, JobStatus::Processing, JobUpdate::default()).unwrap();
        let folder = dir.path().join("book");
        std::fs::create_dir_all(&folder).unwrap();
        let task_id = store
            .create_task(job_id, &folder, Some("https://fake.example/book/1"), 2)
            .unwrap();
        let _ = task_id;

        dispatcher.enqueue_all_tasks(job_id).unwrap();
        let never_interrupted = std::sync::atomic::AtomicBool::new(false);
        dispatcher.run_until_done(job_id, 2, Duration::from_millis(5), &never_interrupted).unwrap();

        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn failing_scraper_fails_task_without_retry() {
        let scrapers = ScraperRegistry::new(vec![Box::new({
            let mut s = fake_scraper("fake", crate::model::BookMetadata::new());
            s.fail = true;
            s
        })]);
        let (dispatcher, store, dir) = dispatcher_fixture(scrapers);

        let config = Configuration::default();
        let job_id = store.create_job(&config, None).unwrap();
        store.update_job_status(job_id, JobStatus::Processing, JobUpdate::default()).unwrap();
        let folder = dir.path().join("book");
        std::fs::create_dir_all(&folder).unwrap();
        let task_id = store
            .create_task(job_id, &folder, Some("https://fake.example/book/1"), 2)
            .unwrap();

        dispatcher.enqueue_all_tasks(job_id).unwrap();
        let never_interrupted = std::sync::atomic::AtomicBool::new(false);
        dispatcher.run_until_done(job_id, 1, Duration::from_millis(5), &never_interrupted).unwrap();

        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        // ParseError from a scraper failure isn't in the retriable set.
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn unresolvable_url_fails_isolated_task_without_blocking_job() {
        let (dispatcher, store, dir) = dispatcher_fixture(ScraperRegistry::empty());

        let config = Configuration::default();
        let job_id = store.create_job(&config, None).unwrap();
        store.update_job_status(job_id, JobStatus::Processing, JobUpdate::default()).unwrap();
        let good_folder = dir.path().join("good");
        std::fs::create_dir_all(&good_folder).unwrap();
        let bad_folder = dir.path().join("bad");
        std::fs::create_dir_all(&bad_folder).unwrap();

        let bad_task = store
            .create_task(job_id, &bad_folder, Some("https://unsupported.example/x"), 2)
            .unwrap();

        dispatcher.enqueue_all_tasks(job_id).unwrap();
        let never_interrupted = std::sync::atomic::AtomicBool::new(false);
        dispatcher.run_until_done(job_id, 1, Duration::from_millis(5), &never_interrupted).unwrap();

        let task = store.get_task(bad_task).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let _ = Path::new(&good_folder);
    }
}
