use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::task::TaskId;

/// Additional (non-primary) authors/narrators/series a book may have.
/// Reifies the source's ad-hoc multi-value fields (spec.md §9 "Dynamic
/// metadata bag") as a plain struct instead of an open extension map.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Companions {
    pub additional_authors: Vec<String>,
    pub additional_narrators: Vec<String>,
    pub additional_series: Vec<String>,
}

/// The value carried through the pipeline (spec.md §3).
///
/// Mutable by value: each stage takes a `BookMetadata` and returns an
/// updated one rather than mutating through a shared reference, per
/// SPEC_FULL.md's "carry through the pipeline by value" design note.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BookMetadata {
    // Identification
    pub folder: Option<PathBuf>,
    pub url: Option<String>,
    pub asin: Option<String>,
    pub isbn: Option<String>,

    // Descriptive
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub author: Option<String>,
    pub narrator: Option<String>,
    pub publisher: Option<String>,
    pub publish_year: Option<String>,
    pub full_date: Option<String>,
    pub language: Option<String>,
    pub summary: Option<String>,

    // Classification
    pub genres: Vec<String>,

    // Series
    pub series_name: Option<String>,
    pub volume_number: Option<String>,

    pub companions: Companions,

    // Media
    pub cover_url: Option<String>,

    // Output
    pub final_output_path: Option<PathBuf>,

    // Status flags
    pub failed: bool,
    pub failed_exception: Option<String>,
    pub skip: bool,
    pub task_id: Option<TaskId>,
}

impl BookMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// The date string OPF's `__PUBLISHYEAR__` placeholder should use:
    /// full date takes precedence over the bare year (spec.md §6.3).
    pub fn display_date(&self) -> Option<&str> {
        self.full_date
            .as_deref()
            .or(self.publish_year.as_deref())
    }

    /// Merge `other`'s fields into `self` wherever `self`'s is empty.
    /// Used for OPF-precedence merging in pipeline stage 4 (spec.md §4.5).
    pub fn merge_missing_from(&mut self, other: &BookMetadata) {
        macro_rules! fill {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = other.$field.clone();
                }
            };
        }
        fill!(asin);
        fill!(isbn);
        fill!(title);
        fill!(subtitle);
        fill!(author);
        fill!(narrator);
        fill!(publisher);
        fill!(publish_year);
        fill!(full_date);
        fill!(language);
        fill!(summary);
        fill!(series_name);
        fill!(volume_number);
        fill!(cover_url);
        if self.genres.is_empty() {
            self.genres = other.genres.clone();
        }
    }
}
