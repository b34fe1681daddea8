//! Cover art download: the same rate-limited, retried fetch as stage 2,
//! reused here because covers come from the same catalog hosts.

use std::path::Path;

use crate::error::Result;

use super::super::{backoff_delay, log_retry, PipelineContext};

const MAX_ATTEMPTS: u32 = 5;

pub fn download(ctx: &PipelineContext, url: &str, dest: &Path) -> Result<()> {
    let mut last_error = None;

    for attempt in 1..=MAX_ATTEMPTS {
        ctx.check_cancelled()?;
        let guard = ctx.rate_limiter.acquire(url)?;
        let outcome = ctx.http.get(url).send().and_then(|r| r.bytes());
        guard.release();

        match outcome {
            Ok(bytes) => {
                std::fs::write(dest, &bytes)?;
                return Ok(());
            }
            Err(e) => {
                last_error = Some(crate::error::AbForgeError::HttpTransient(e));
            }
        }

        if let Some(err) = &last_error {
            log_retry(attempt, MAX_ATTEMPTS, err);
        }
        if attempt < MAX_ATTEMPTS {
            std::thread::sleep(backoff_delay(attempt, true));
        }
    }

    Err(crate::error::AbForgeError::HttpExhausted {
        attempts: MAX_ATTEMPTS,
        last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}
