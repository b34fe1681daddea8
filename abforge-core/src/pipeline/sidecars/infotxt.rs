//! `info.txt` sidecar: a plain-text human-readable summary, the simplest
//! of the three sidecars (spec.md §6.2).

use std::path::Path;

use crate::error::Result;
use crate::model::BookMetadata;

pub fn write(path: &Path, metadata: &BookMetadata) -> Result<()> {
    let mut body = String::new();
    if let Some(title) = &metadata.title {
        body.push_str(&format!("Title: {title}\n"));
    }
    if let Some(subtitle) = &metadata.subtitle {
        body.push_str(&format!("Subtitle: {subtitle}\n"));
    }
    if let Some(author) = &metadata.author {
        body.push_str(&format!("Author: {author}\n"));
    }
    if let Some(narrator) = &metadata.narrator {
        body.push_str(&format!("Narrator: {narrator}\n"));
    }
    if let Some(series) = &metadata.series_name {
        let volume = metadata.volume_number.as_deref().unwrap_or("");
        body.push_str(&format!("Series: {series} {volume}\n"));
    }
    if let Some(publisher) = &metadata.publisher {
        body.push_str(&format!("Publisher: {publisher}\n"));
    }
    if let Some(date) = metadata.display_date() {
        body.push_str(&format!("Published: {date}\n"));
    }
    if !metadata.genres.is_empty() {
        body.push_str(&format!("Genres: {}\n", metadata.genres.join(", ")));
    }
    if let Some(isbn) = &metadata.isbn {
        body.push_str(&format!("ISBN: {isbn}\n"));
    }
    if let Some(asin) = &metadata.asin {
        body.push_str(&format!("ASIN: {asin}\n"));
    }
    if let Some(summary) = &metadata.summary {
        body.push_str(&format!("\n{summary}\n"));
    }
    std::fs::write(path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_title_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.txt");
        let mut metadata = BookMetadata::new();
        metadata.title = Some("Warbreaker".into());
        metadata.summary = Some("Two sisters, one throne.".into());
        write(&path, &metadata).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("Title: Warbreaker"));
        assert!(body.contains("Two sisters, one throne."));
    }
}
