//! Stages 1-4 (spec.md §4.5): resolve the source (existing OPF or a
//! scraper URL), fetch over HTTP with retry, and scrape, with the
//! OPF-supplement merge/overwrite behavior.

use tracing::{debug, info_span};

use crate::error::{AbForgeError, Result};
use crate::model::{BookMetadata, Task};
use crate::opf;
use crate::scrapers::{Scraper, ScraperResponse};

use super::{backoff_delay, log_retry, PipelineContext};

const MAX_HTTP_ATTEMPTS: u32 = 5;

pub fn resolve(ctx: &PipelineContext, task: &Task) -> Result<BookMetadata> {
    if task.is_opf_source() {
        resolve_from_opf(ctx, task)
    } else {
        resolve_from_url(ctx, task)
    }
}

fn resolve_from_opf(ctx: &PipelineContext, task: &Task) -> Result<BookMetadata> {
    let _span = info_span!("resolve_source", mode = "opf").entered();
    let opf_path = task.folder_path.join("metadata.opf");
    let mut base = opf::read(&opf_path)?;
    base.folder = Some(task.folder_path.clone());

    let source_url = base.url.clone();

    if ctx.config.force_refresh {
        let url = source_url.ok_or_else(|| {
            AbForgeError::SourceNotFound(
                "force_refresh set but existing OPF has no dc:source".into(),
            )
        })?;
        let mut scraped = scrape_url(ctx, &url, &base)?;
        // force_refresh overwrites: scraped values win, OPF only fills gaps.
        scraped.merge_missing_from(&base);
        scraped.folder = Some(task.folder_path.clone());
        scraped.url = Some(url);
        return Ok(scraped);
    }

    if let Some(url) = source_url {
        let scraped = scrape_url(ctx, &url, &base)?;
        // normal mode: OPF values win, scraped only fills gaps (OPF precedence).
        base.merge_missing_from(&scraped);
    }

    Ok(base)
}

fn resolve_from_url(ctx: &PipelineContext, task: &Task) -> Result<BookMetadata> {
    let _span = info_span!("resolve_source", mode = "scrape").entered();
    let url = task
        .url
        .clone()
        .ok_or_else(|| AbForgeError::SourceNotFound("task has no URL and no OPF marker".into()))?;
    let mut seed = BookMetadata::new();
    seed.url = Some(url.clone());
    let mut metadata = scrape_url(ctx, &url, &seed)?;
    metadata.folder = Some(task.folder_path.clone());
    metadata.url = Some(url);
    Ok(metadata)
}

fn scrape_url(ctx: &PipelineContext, url: &str, seed: &BookMetadata) -> Result<BookMetadata> {
    let scraper = ctx.scrapers.resolve(url, ctx.config.site.as_deref())?;
    let mut seed = scraper.preprocess(seed);
    seed.url = Some(url.to_string());
    let response = fetch_with_retry(ctx, scraper, &seed)?;
    scraper.scrape(&seed, &response)
}

/// HTTP fetch wrapped by the domain rate limiter, retried up to
/// [`MAX_HTTP_ATTEMPTS`] with exponential backoff capped at ~10s
/// (spec.md §4.5 stage 2).
fn fetch_with_retry(
    ctx: &PipelineContext,
    scraper: &dyn Scraper,
    metadata: &BookMetadata,
) -> Result<ScraperResponse> {
    let request_url = scraper.request_url(metadata)?;
    let mut last_error: Option<AbForgeError> = None;

    for attempt in 1..=MAX_HTTP_ATTEMPTS {
        ctx.check_cancelled()?;
        let guard = ctx.rate_limiter.acquire(&request_url)?;
        let outcome = ctx.http.get(&request_url).send();
        guard.release();

        match outcome {
            Ok(response) => {
                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    let body = response
                        .text()
                        .map_err(|e| AbForgeError::ParseError(format!("failed to read body: {e}")))?;
                    debug!(attempt, status, "fetch succeeded");
                    return Ok(ScraperResponse { status, body });
                }
                last_error = Some(AbForgeError::ParseError(format!(
                    "non-2xx response: {status}"
                )));
            }
            Err(e) => {
                last_error = Some(AbForgeError::HttpTransient(e));
            }
        }

        if let Some(err) = &last_error {
            log_retry(attempt, MAX_HTTP_ATTEMPTS, err);
        }
        if attempt < MAX_HTTP_ATTEMPTS {
            std::thread::sleep(backoff_delay(attempt, true));
        }
    }

    Err(AbForgeError::HttpExhausted {
        attempts: MAX_HTTP_ATTEMPTS,
        last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}
