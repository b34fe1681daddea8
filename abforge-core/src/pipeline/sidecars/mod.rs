//! Stage 8 (spec.md §4.5, §6.2): OPF, `info.txt`, and cover art.

mod cover;
mod infotxt;

use std::path::Path;

use crate::error::Result;
use crate::model::BookMetadata;
use crate::opf;

use super::PipelineContext;

/// Writes every sidecar enabled in the job's configuration into `target`.
/// Order follows the file layout in spec.md §6.2.
pub fn write_all(ctx: &PipelineContext, target: &Path, metadata: &BookMetadata) -> Result<()> {
    if ctx.config.dry_run {
        return Ok(());
    }

    std::fs::create_dir_all(target)?;

    if ctx.config.opf {
        let template = match &ctx.config.opf_template_path {
            Some(path) => std::fs::read_to_string(path)?,
            None => opf::DEFAULT_TEMPLATE.to_string(),
        };
        opf::write(&target.join("metadata.opf"), &template, metadata)?;
    }

    if ctx.config.infotxt {
        infotxt::write(&target.join("info.txt"), metadata)?;
    }

    if ctx.config.cover {
        if let Some(url) = &metadata.cover_url {
            cover::download(ctx, url, &target.join("cover.jpg"))?;
        }
    }

    Ok(())
}
