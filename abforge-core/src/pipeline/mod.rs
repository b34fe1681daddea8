//! Processing Pipeline (spec.md §4.5): the per-task state machine run by
//! each worker. Stages are pure-ish: each takes and returns `BookMetadata`
//! plus a `PipelineContext` carrying the lock manager, rate limiter,
//! genre normalizer, scraper registry, and a cancellation check
//! (spec.md §9 "Callback-style task pipeline").

mod organize;
mod sidecars;
mod source;
mod tags;

use std::time::Duration;

use tracing::{info_span, warn};

use crate::config::Configuration;
use crate::error::{AbForgeError, Result};
use crate::genre::GenreNormalizer;
use crate::locks::FileLockManager;
use crate::model::{BookMetadata, Task, TaskId};
use crate::rate_limiter::DomainRateLimiter;
use crate::scrapers::ScraperRegistry;

pub struct PipelineContext<'a> {
    pub config: &'a Configuration,
    pub locks: &'a FileLockManager,
    pub rate_limiter: &'a DomainRateLimiter,
    pub genre_normalizer: &'a GenreNormalizer,
    pub scrapers: &'a ScraperRegistry,
    pub http: &'a reqwest::blocking::Client,
    pub task_id: TaskId,
    /// Polled at each stage boundary; returning `true` makes the pipeline
    /// stop with `AbForgeError::Cancelled` (spec.md §4.4 "Cancellation").
    pub is_cancelled: &'a (dyn Fn() -> bool + Sync),
}

impl PipelineContext<'_> {
    fn check_cancelled(&self) -> Result<()> {
        if (self.is_cancelled)() {
            return Err(AbForgeError::Cancelled);
        }
        Ok(())
    }
}

/// Result of a successful pipeline run: `metadata.skip` distinguishes a
/// scraper-requested skip from a normal completion (spec.md §4.5 stage 3).
pub struct PipelineOutcome {
    pub metadata: BookMetadata,
}

/// Runs the full pipeline for `task`, short-circuiting on the first
/// failing or skipping stage (spec.md §4.5).
pub fn run(ctx: &PipelineContext, task: &Task) -> Result<PipelineOutcome> {
    let _span = info_span!("pipeline", task_id = %task.id).entered();

    ctx.check_cancelled()?;
    let mut metadata = source::resolve(ctx, task)?;
    metadata.task_id = Some(task.id);

    if metadata.skip {
        return Err(AbForgeError::SkippedByUser);
    }

    ctx.check_cancelled()?;
    if !metadata.genres.is_empty() {
        metadata.genres = ctx.genre_normalizer.normalize(&metadata.genres)?;
    }

    ctx.check_cancelled()?;
    if ctx.config.copy || ctx.config.r#move {
        metadata = organize::organize(ctx, &metadata)?;
    }

    ctx.check_cancelled()?;
    if ctx.config.flatten {
        if let Some(target) = metadata.final_output_path.clone() {
            organize::flatten(ctx, &target, &metadata)?;
        }
    }

    ctx.check_cancelled()?;
    if ctx.config.rename {
        if let Some(target) = metadata.final_output_path.clone() {
            organize::rename_tracks(ctx, &target, &metadata)?;
        }
    }

    ctx.check_cancelled()?;
    if let Some(target) = metadata.final_output_path.clone() {
        sidecars::write_all(ctx, &target, &metadata)?;
    }

    ctx.check_cancelled()?;
    if ctx.config.id3_tag {
        if let Some(target) = metadata.final_output_path.clone() {
            tags::embed_tags(ctx, &target, &metadata)?;
        }
    }

    Ok(PipelineOutcome { metadata })
}

/// Exponential backoff with the cap and jitter described in spec.md §4.5
/// stage 2 and SPEC_FULL.md's original-source supplement.
pub(crate) fn backoff_delay(attempt: u32, jitter: bool) -> Duration {
    let base_secs = 2.0_f64 * 1.5_f64.powi(attempt as i32 - 1);
    let capped = base_secs.min(10.0);
    let jittered = if jitter {
        capped * (0.85 + rand::random::<f64>() * 0.3)
    } else {
        capped
    };
    Duration::from_secs_f64(jittered.max(0.0))
}

pub(crate) fn log_retry(attempt: u32, max: u32, error: &AbForgeError) {
    warn!(attempt, max, error = %error, "HTTP request failed, retrying");
}
