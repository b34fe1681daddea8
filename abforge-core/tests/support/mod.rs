//! Shared fixtures for the integration suite: constructing a job/task
//! tree from OPF-only folders (no scraper or network access needed) and
//! wiring up a `Dispatcher` against an in-memory store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use abforge_core::config::Configuration;
use abforge_core::genre::{GenreNormalizer, NoopAdvisor};
use abforge_core::locks::FileLockManager;
use abforge_core::model::{BookMetadata, JobId, JobStatus, OPF_MARKER};
use abforge_core::opf;
use abforge_core::rate_limiter::DomainRateLimiter;
use abforge_core::scrapers::ScraperRegistry;
use abforge_core::store::{JobUpdate, QueueStore};
use abforge_core::Dispatcher;

/// A folder with a `track.mp3` and a `metadata.opf` carrying no
/// `dc:source`, so the pipeline resolves it straight from disk.
pub fn book_folder(root: &Path, name: &str, title: &str, author: &str) -> PathBuf {
    let folder = root.join(name);
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("track.mp3"), b"audio").unwrap();
    let mut metadata = BookMetadata::new();
    metadata.title = Some(title.to_string());
    metadata.author = Some(author.to_string());
    opf::write(&folder.join("metadata.opf"), opf::DEFAULT_TEMPLATE, &metadata).unwrap();
    folder
}

/// Stands in for the CLI's identification phase (spec.md §4.4): create a
/// job, one task per folder, then flip it to `processing`.
pub fn identify(store: &QueueStore, config: &Configuration, folders: &[PathBuf]) -> JobId {
    let job_id = store.create_job(config, None).unwrap();
    for folder in folders {
        store
            .create_task(job_id, folder, Some(OPF_MARKER), config.max_retries)
            .unwrap();
    }
    store
        .update_job_status(
            job_id,
            JobStatus::Processing,
            JobUpdate {
                started_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .unwrap();
    job_id
}

pub fn dispatcher_for(store: &QueueStore) -> Dispatcher {
    let dir = tempfile::tempdir().unwrap();
    let locks = FileLockManager::os_file();
    let limiter = DomainRateLimiter::new(Duration::from_millis(1));
    let genres = Arc::new(
        GenreNormalizer::new(dir.path().join("genres.json"), Box::new(NoopAdvisor), false).unwrap(),
    );
    Dispatcher::new(
        store.clone(),
        locks,
        limiter,
        genres,
        Arc::new(ScraperRegistry::empty()),
        reqwest::blocking::Client::new(),
    )
}
