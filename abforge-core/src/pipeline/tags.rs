//! Stage 9 (spec.md §4.5, §6.5): embeds ID3 tags into MP3 files. Other
//! recognized audio extensions are skipped silently — only `.mp3` has
//! tag-writing implemented.

use std::path::Path;

use id3::{Tag, TagLike, Version};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{AbForgeError, Result};
use crate::model::BookMetadata;

use super::organize::is_audio_file;
use super::PipelineContext;

pub fn embed_tags(ctx: &PipelineContext, target: &Path, metadata: &BookMetadata) -> Result<()> {
    if ctx.config.dry_run {
        return Ok(());
    }

    let comment = format!(
        "ASIN: {} | ISBN: {} | {}",
        metadata.asin.as_deref().unwrap_or(""),
        metadata.isbn.as_deref().unwrap_or(""),
        metadata.summary.as_deref().unwrap_or(""),
    );

    for entry in WalkDir::new(target).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !is_audio_file(path) {
            continue;
        }
        let is_mp3 = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("mp3"))
            .unwrap_or(false);
        if !is_mp3 {
            continue;
        }

        tag_one(path, metadata, &comment).map_err(|e| AbForgeError::TagError {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;
    }

    debug!(?target, "embedded tags");
    Ok(())
}

fn tag_one(path: &Path, metadata: &BookMetadata, comment: &str) -> std::result::Result<(), id3::Error> {
    let mut tag = Tag::read_from_path(path).unwrap_or_default();

    if let Some(title) = &metadata.title {
        tag.set_title(title);
    }
    if let Some(author) = &metadata.author {
        tag.set_artist(author);
    }
    let album = metadata.series_name.clone().or_else(|| metadata.title.clone());
    if let Some(album) = album {
        tag.set_album(album);
    }
    if !metadata.genres.is_empty() {
        tag.set_genre(metadata.genres.join(", "));
    }
    if let Some(date) = metadata.display_date() {
        if let Ok(year) = date[..4.min(date.len())].parse::<i32>() {
            tag.set_year(year);
        }
    }
    if let Some(language) = &metadata.language {
        tag.set_text("TLAN", language.clone());
    }
    tag.add_comment(id3::frame::Comment {
        lang: "eng".to_string(),
        description: String::new(),
        text: comment.to_string(),
    });

    tag.write_to_path(path, Version::Id3v24)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_mp3_files_are_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("book");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("track.flac"), b"not real flac data").unwrap();

        let config = crate::config::Configuration::default();
        let locks = crate::locks::FileLockManager::os_file();
        let limiter = crate::rate_limiter::DomainRateLimiter::new(std::time::Duration::from_millis(1));
        let genres = crate::genre::GenreNormalizer::new(
            dir.path().join("genres.json"),
            Box::new(crate::genre::NoopAdvisor),
            false,
        )
        .unwrap();
        let scrapers = crate::scrapers::ScraperRegistry::empty();
        let http = reqwest::blocking::Client::new();
        let ctx = PipelineContext {
            config: &config,
            locks: &locks,
            rate_limiter: &limiter,
            genre_normalizer: &genres,
            scrapers: &scrapers,
            http: &http,
            task_id: crate::model::TaskId::new(),
            is_cancelled: &|| false,
        };

        let metadata = BookMetadata::new();
        embed_tags(&ctx, &target, &metadata).unwrap();
        let body = std::fs::read(target.join("track.flac")).unwrap();
        assert_eq!(body, b"not real flac data");
    }
}
