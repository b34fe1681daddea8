//! Stages 5-7 (spec.md §4.5): placing a book on disk and the optional
//! flatten/rename transforms that follow.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{AbForgeError, Result};
use crate::model::BookMetadata;
use crate::sanitize::{normalize_volume_number, sanitize_path_component};

use super::PipelineContext;

/// Extensions recognized as audio tracks (spec.md §6.5), matched
/// case-insensitively.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "m4b", "wma", "flac", "ogg"];

pub(crate) fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// The sanitized book title used as every track's filename stem
/// (spec.md §4.5 stage 7; original's `get_safe_title()` /
/// `clean_filename`).
fn safe_title(metadata: &BookMetadata) -> String {
    sanitize_path_component(metadata.title.as_deref().unwrap_or("Untitled"))
}

/// Stage 5: computes the sanitized target directory, locks the author (and
/// series, if enabled) directory, then copies or moves the source folder
/// into place.
pub fn organize(ctx: &PipelineContext, metadata: &BookMetadata) -> Result<BookMetadata> {
    let source = metadata
        .folder
        .clone()
        .ok_or_else(|| AbForgeError::Internal("organize called without a source folder".into()))?;
    let output_root = ctx
        .config
        .output
        .clone()
        .ok_or_else(|| AbForgeError::ConfigurationInvalid("`output` is required to organize".into()))?;

    let author = sanitize_path_component(metadata.author.as_deref().unwrap_or("Unknown Author"));
    let title = sanitize_path_component(metadata.title.as_deref().unwrap_or("Untitled"));
    let leaf = match metadata.volume_number.as_deref() {
        Some(raw) if !raw.trim().is_empty() => {
            format!("{} - {}", normalize_volume_number(raw), title)
        }
        _ => title,
    };

    let author_dir = output_root.join(&author);
    let series_dir = if ctx.config.series {
        metadata
            .series_name
            .as_deref()
            .map(|s| author_dir.join(sanitize_path_component(s)))
    } else {
        None
    };
    let target = series_dir.clone().unwrap_or_else(|| author_dir.clone()).join(&leaf);

    let timeout = Duration::from_secs(ctx.config.lock_timeout_secs);
    let poll = Duration::from_millis(ctx.config.lock_poll_interval_ms);

    // Fixed lock order (author before series) prevents deadlocks between
    // workers racing to create the same two directories (spec.md §4.2).
    let _author_guard = ctx.locks.lock_directory(&author_dir, ctx.task_id, timeout, poll)?;
    let _series_guard = match &series_dir {
        Some(dir) => Some(ctx.locks.lock_directory(dir, ctx.task_id, timeout, poll)?),
        None => None,
    };

    if !ctx.config.dry_run {
        std::fs::create_dir_all(&target)?;
        if ctx.config.r#move {
            move_tree(&source, &target)?;
        } else {
            copy_tree(&source, &target)?;
        }
    }

    let mut result = metadata.clone();
    result.final_output_path = Some(target);
    Ok(result)
}

/// Moves `source`'s contents into `target`: a plain rename when both paths
/// share a filesystem, otherwise falls back to copy-then-delete
/// (spec.md §4.5 stage 5).
fn move_tree(source: &Path, target: &Path) -> Result<()> {
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let dest = target.join(entry.file_name());
        match std::fs::rename(entry.path(), &dest) {
            Ok(()) => {}
            Err(_) => {
                copy_entry(&entry.path(), &dest)?;
                if entry.file_type()?.is_dir() {
                    std::fs::remove_dir_all(entry.path())?;
                } else {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let dest = target.join(entry.file_name());
        copy_entry(&entry.path(), &dest)?;
    }
    Ok(())
}

fn copy_entry(source: &Path, dest: &Path) -> Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_entry(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(source, dest)?;
    }
    Ok(())
}

/// Stage 6: recursively collects audio files anywhere under `target`,
/// moves them to `target`'s root with a zero-padded numeric prefix built
/// from the book title, then removes directories left empty.
pub fn flatten(ctx: &PipelineContext, target: &Path, metadata: &BookMetadata) -> Result<()> {
    if ctx.config.dry_run {
        return Ok(());
    }

    let mut files: Vec<PathBuf> = WalkDir::new(target)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_audio_file(e.path()))
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let title = safe_title(metadata);
    let width = digit_width(files.len());
    for (index, path) in files.iter().enumerate() {
        if path.parent() == Some(target) {
            continue;
        }
        let ext = path.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_default();
        let new_name = format!("{:0width$} - {}.{}", index + 1, title, ext, width = width);
        let dest = target.join(new_name);
        std::fs::rename(path, &dest)?;
    }

    remove_empty_subdirs(target)?;
    Ok(())
}

fn remove_empty_subdirs(root: &Path) -> Result<()> {
    let mut subdirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    // deepest first, so a parent becomes empty only after its children are
    // already removed.
    subdirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in subdirs {
        if std::fs::read_dir(&dir)?.next().is_none() {
            std::fs::remove_dir(&dir)?;
            debug!(?dir, "removed emptied subdirectory");
        }
    }
    Ok(())
}

fn digit_width(count: usize) -> usize {
    if count < 100 {
        2
    } else if count < 1000 {
        3
    } else {
        4
    }
}

/// Stage 7: renames every audio file directly under `target` to
/// `NN - {sanitized book title}.ext`, padding width derived from the
/// track count (spec.md §4.5 stage 7; original's `file_operations.py`
/// uses `get_safe_title()` for every track, not the source filename).
pub fn rename_tracks(ctx: &PipelineContext, target: &Path, metadata: &BookMetadata) -> Result<()> {
    if ctx.config.dry_run {
        return Ok(());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(target)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_audio_file(p))
        .collect();
    files.sort();

    let title = safe_title(metadata);
    let width = digit_width(files.len());
    for (index, path) in files.iter().enumerate() {
        let ext = path.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_default();
        let new_name = format!("{:0width$} - {}.{}", index + 1, title, ext, width = width);
        let dest = target.join(new_name);
        if &dest != path {
            std::fs::rename(path, &dest)?;
        }
    }
    info!(count = files.len(), ?target, "renamed tracks");
    Ok(())
}
