//! CLI entry point: wires a `Configuration` parsed from argv to a running
//! `Dispatcher` and reports progress, per SPEC_FULL.md §1 ("thin: argument
//! parsing, logging init, a poll loop over `get_job_progress`, and a
//! prompt loop for `waiting_for_user` tasks").

use std::io::{self, BufRead, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use abforge_core::config::Configuration;
use abforge_core::genre::{GenreNormalizer, HttpAdvisor, NoopAdvisor};
use abforge_core::locks::FileLockManager;
use abforge_core::model::{JobId, JobStatus, UserInputResponse};
use abforge_core::rate_limiter::DomainRateLimiter;
use abforge_core::scrapers::ScraperRegistry;
use abforge_core::store::QueueStore;
use abforge_core::Dispatcher;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Organizes raw audiobook folders into a tagged, metadata-enriched
/// library (spec.md §1).
#[derive(Parser, Debug)]
#[command(name = "abforge")]
#[command(about = "Audiobook folder metadata organizing engine")]
struct Args {
    /// Path to the persistent queue database.
    #[arg(long, env = "ABFORGE_DB", default_value = "abforge.db")]
    db_path: PathBuf,

    /// Audiobook folder to process. May be repeated.
    #[arg(long = "folder")]
    folders: Vec<PathBuf>,

    /// Parent directory whose immediate children are each treated as a
    /// folder to process.
    #[arg(long)]
    book_root: Option<PathBuf>,

    /// Destination root for `--copy`/`--move`.
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    copy: bool,
    #[arg(long = "move")]
    move_files: bool,
    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    flatten: bool,
    #[arg(long)]
    rename: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    opf: bool,
    #[arg(long)]
    infotxt: bool,
    #[arg(long)]
    cover: bool,
    #[arg(long)]
    id3_tag: bool,

    /// Organize under an author/series/title hierarchy instead of
    /// author/title.
    #[arg(long)]
    series: bool,

    /// Read metadata from each folder's `metadata.opf` instead of
    /// scraping a URL.
    #[arg(long)]
    from_opf: bool,
    /// Re-scrape `dc:source` even when the OPF already has metadata.
    #[arg(long)]
    force_refresh: bool,

    /// Restrict the scraper registry to one site name, or "all".
    #[arg(long)]
    site: Option<String>,

    #[arg(long)]
    auto_search: bool,
    #[arg(long)]
    llm_select: bool,
    #[arg(long, default_value_t = 5)]
    search_limit: u32,
    #[arg(long, default_value_t = 1)]
    download_limit: u32,
    #[arg(long, default_value_t = 500)]
    search_delay_ms: u64,

    /// Number of worker threads.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Resume the most recent incomplete job instead of starting a new one.
    #[arg(long)]
    resume: bool,
    /// Never resume; always start a new job.
    #[arg(long)]
    no_resume: bool,

    /// Skip confirmation prompts.
    #[arg(long)]
    yolo: bool,
    /// Verbose, per-stage tracing.
    #[arg(long)]
    debug: bool,

    #[arg(long, default_value_t = 1000)]
    min_request_delay_ms: u64,
    #[arg(long, default_value_t = 30)]
    lock_timeout_secs: u64,
    #[arg(long, default_value_t = 100)]
    lock_poll_interval_ms: u64,
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    #[arg(long)]
    genre_mapping_path: Option<PathBuf>,
    #[arg(long)]
    llm_genre_advisor: bool,
    #[arg(long, default_value_t = 0.85)]
    llm_confidence_threshold: f32,
    #[arg(long)]
    llm_endpoint: Option<String>,
    #[arg(long, default_value = "gpt-4o-mini")]
    llm_model: String,

    #[arg(long)]
    opf_template_path: Option<PathBuf>,
}

impl From<Args> for Configuration {
    fn from(args: Args) -> Self {
        Configuration {
            folders: args.folders,
            output: args.output,
            book_root: args.book_root,
            copy: args.copy,
            r#move: args.move_files,
            dry_run: args.dry_run,
            flatten: args.flatten,
            rename: args.rename,
            opf: args.opf,
            infotxt: args.infotxt,
            cover: args.cover,
            id3_tag: args.id3_tag,
            series: args.series,
            from_opf: args.from_opf,
            force_refresh: args.force_refresh,
            site: args.site,
            auto_search: args.auto_search,
            llm_select: args.llm_select,
            search_limit: args.search_limit,
            download_limit: args.download_limit,
            search_delay_ms: args.search_delay_ms,
            workers: args.workers,
            resume: args.resume,
            no_resume: args.no_resume,
            yolo: args.yolo,
            debug: args.debug,
            min_request_delay_ms: args.min_request_delay_ms,
            lock_timeout_secs: args.lock_timeout_secs,
            lock_poll_interval_ms: args.lock_poll_interval_ms,
            max_retries: args.max_retries,
            genre_mapping_path: args.genre_mapping_path,
            llm_genre_advisor: args.llm_genre_advisor,
            llm_confidence_threshold: args.llm_confidence_threshold,
            llm_endpoint: args.llm_endpoint,
            llm_model: args.llm_model,
            opf_template_path: args.opf_template_path,
        }
    }
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let db_path = args.db_path.clone();
    let config: Configuration = args.into();
    if let Err(e) = config.validate() {
        eprintln!("configuration invalid: {e}");
        std::process::exit(1);
    }

    let store = QueueStore::open(&db_path)?;
    let locks = FileLockManager::os_file();
    let rate_limiter = DomainRateLimiter::new(Duration::from_millis(config.min_request_delay_ms));
    let advisor: Box<dyn abforge_core::genre::GenreAdvisor> = if config.llm_genre_advisor {
        let endpoint = config
            .llm_endpoint
            .clone()
            .expect("validate() requires llm_endpoint when llm_genre_advisor is set");
        let api_key = std::env::var("ABFORGE_LLM_API_KEY").ok();
        Box::new(HttpAdvisor::new(endpoint, api_key, config.llm_model.clone()))
    } else {
        Box::new(NoopAdvisor)
    };
    let genre_path = config
        .genre_mapping_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("genres.json"));
    let genre_normalizer = Arc::new(GenreNormalizer::new(
        genre_path,
        advisor,
        config.llm_genre_advisor,
    )?);
    let scrapers = Arc::new(ScraperRegistry::empty());
    let http = reqwest::blocking::Client::new();

    let dispatcher = Dispatcher::new(
        store.clone(),
        locks,
        rate_limiter,
        genre_normalizer,
        scrapers,
        http,
    );

    // One process-wide handler: the two-phase Ctrl-C semantics (delete
    // during identification, preserve during processing, spec.md §4.4)
    // are expressed by what each phase *does* with the shared flag, not
    // by separate handlers — `ctrlc::set_handler` errors on a second
    // registration.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received");
            interrupted.store(true, Ordering::SeqCst);
        })?;
    }

    let job_id = if config.no_resume {
        identify(&store, &config, &interrupted)?
    } else {
        match store.get_incomplete_jobs()?.into_iter().next() {
            Some(job) if config.resume || job.status == JobStatus::Processing => {
                info!(job = %job.id, "resuming existing job");
                let reset = abforge_core::dispatcher::prepare_resume(&store, job.id)?;
                info!(reset_tasks = reset, "reset running tasks to pending");
                job.id
            }
            _ => identify(&store, &config, &interrupted)?,
        }
    };

    dispatcher.enqueue_all_tasks(job_id)?;
    dispatcher.run_until_done(job_id, config.workers, Duration::from_millis(250), &interrupted)?;

    if interrupted.load(Ordering::SeqCst) {
        println!("interrupted; job {job_id} preserved, re-run with --resume to continue");
        return Ok(());
    }

    prompt_for_user_input(&store, &dispatcher, job_id, &interrupted)?;

    let progress = store.get_job_progress(job_id)?;
    println!(
        "job {job_id}: {} completed, {} failed, {} skipped (of {})",
        progress.completed, progress.failed, progress.skipped, progress.total
    );

    if progress.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Identification phase (spec.md §4.4): discover folders, create one task
/// per folder without a URL. Ctrl-C here deletes the job rather than
/// preserving it (the opposite of the processing phase's handling of the
/// same shared `interrupted` flag).
fn identify(store: &QueueStore, config: &Configuration, interrupted: &AtomicBool) -> anyhow::Result<JobId> {
    let job_id = store.create_job(config, None)?;

    let folders = config.resolve_folders()?;
    for folder in folders {
        if interrupted.load(Ordering::SeqCst) {
            warn!(job = %job_id, "interrupted during identification, deleting job");
            store.delete_job(job_id)?;
            std::process::exit(130);
        }
        let url = if config.from_opf {
            Some(abforge_core::model::OPF_MARKER.to_string())
        } else {
            None
        };
        store.create_task(job_id, &folder, url.as_deref(), config.max_retries)?;
    }

    store.update_job_status(
        job_id,
        JobStatus::Processing,
        abforge_core::store::JobUpdate {
            started_at: Some(chrono::Utc::now()),
            ..Default::default()
        },
    )?;
    Ok(job_id)
}

/// Prompt loop for tasks parked `waiting_for_user` (spec.md §4.7). Runs
/// after the worker pool drains, resuming each task with an operator-typed
/// URL and re-draining until none remain or the run is interrupted.
fn prompt_for_user_input(
    store: &QueueStore,
    dispatcher: &Dispatcher,
    job_id: JobId,
    interrupted: &AtomicBool,
) -> anyhow::Result<()> {
    let stdin = io::stdin();
    loop {
        if interrupted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let waiting = store.get_tasks_waiting_for_user(job_id)?;
        if waiting.is_empty() {
            return Ok(());
        }

        for task in &waiting {
            if let Some(request) = &task.user_input {
                println!("task {} needs input: {}", task.id, request.prompt);
                if request.options != serde_json::Value::Null {
                    println!("  options: {}", request.options);
                }
            }
            print!("url> ");
            io::stdout().flush()?;
            let mut line = String::new();
            stdin.lock().read_line(&mut line)?;
            let url = line.trim().to_string();
            if url.is_empty() {
                continue;
            }
            dispatcher.resume_task(
                task.id,
                &UserInputResponse {
                    url: Some(url),
                    extra: serde_json::Value::Null,
                },
            )?;
        }

        dispatcher.run_until_done(job_id, 1, Duration::from_millis(250), interrupted)?;
    }
}
