//! Job configuration: the serialized blob referenced throughout spec.md §3
//! as `jobs.config_json`, and enumerated in spec.md §6.6.
//!
//! Mirrors the teacher's (`ferrex-config`) split between a plain data
//! struct and a separate validation pass that returns warnings distinct
//! from hard errors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AbForgeError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub folders: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub book_root: Option<PathBuf>,

    pub copy: bool,
    pub r#move: bool,
    pub dry_run: bool,

    pub flatten: bool,
    pub rename: bool,

    pub opf: bool,
    pub infotxt: bool,
    pub cover: bool,
    pub id3_tag: bool,

    pub series: bool,

    pub from_opf: bool,
    pub force_refresh: bool,

    pub site: Option<String>,

    pub auto_search: bool,
    pub llm_select: bool,
    pub search_limit: u32,
    pub download_limit: u32,
    pub search_delay_ms: u64,

    pub workers: usize,

    pub resume: bool,
    pub no_resume: bool,

    pub yolo: bool,
    pub debug: bool,

    pub min_request_delay_ms: u64,
    pub lock_timeout_secs: u64,
    pub lock_poll_interval_ms: u64,
    pub max_retries: u32,

    pub genre_mapping_path: Option<PathBuf>,
    pub llm_genre_advisor: bool,
    pub llm_confidence_threshold: f32,
    /// Chat-completion endpoint for `genre::HttpAdvisor`. The API key is
    /// never stored here (it would otherwise be persisted in
    /// `jobs.config_json`); callers read it from the environment.
    pub llm_endpoint: Option<String>,
    pub llm_model: String,

    /// Path to the OPF substitution template (spec.md §6.3). Falls back to
    /// the built-in default template when unset.
    pub opf_template_path: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
            output: None,
            book_root: None,
            copy: false,
            r#move: false,
            dry_run: false,
            flatten: false,
            rename: false,
            opf: true,
            infotxt: false,
            cover: false,
            id3_tag: false,
            series: false,
            from_opf: false,
            force_refresh: false,
            site: None,
            auto_search: false,
            llm_select: false,
            search_limit: 5,
            download_limit: 1,
            search_delay_ms: 500,
            workers: 4,
            resume: false,
            no_resume: false,
            yolo: false,
            debug: false,
            min_request_delay_ms: 1000,
            lock_timeout_secs: 30,
            lock_poll_interval_ms: 100,
            max_retries: 2,
            genre_mapping_path: None,
            llm_genre_advisor: false,
            llm_confidence_threshold: 0.85,
            llm_endpoint: None,
            llm_model: "gpt-4o-mini".to_string(),
            opf_template_path: None,
        }
    }
}

impl Configuration {
    /// Validates mutually-exclusive flags and required fields. A
    /// configuration that fails validation never leaves the `pending`
    /// job status (`ConfigurationInvalid`, spec.md §7).
    pub fn validate(&self) -> Result<()> {
        if self.copy && self.r#move {
            return Err(AbForgeError::ConfigurationInvalid(
                "`copy` and `move` are mutually exclusive".into(),
            ));
        }
        if self.resume && self.no_resume {
            return Err(AbForgeError::ConfigurationInvalid(
                "`resume` and `no_resume` are mutually exclusive".into(),
            ));
        }
        if self.workers == 0 {
            return Err(AbForgeError::ConfigurationInvalid(
                "`workers` must be at least 1".into(),
            ));
        }
        if self.folders.is_empty() && self.book_root.is_none() {
            return Err(AbForgeError::ConfigurationInvalid(
                "at least one of `folders` or `book_root` must be set".into(),
            ));
        }
        if (self.copy || self.r#move) && self.output.is_none() {
            return Err(AbForgeError::ConfigurationInvalid(
                "`output` is required when `copy` or `move` is set".into(),
            ));
        }
        if self.llm_genre_advisor && self.llm_endpoint.is_none() {
            return Err(AbForgeError::ConfigurationInvalid(
                "`llm_genre_advisor` requires `llm_endpoint`".into(),
            ));
        }
        if self.force_refresh && !self.from_opf {
            return Err(AbForgeError::ConfigurationInvalid(
                "`force_refresh` requires `from_opf`".into(),
            ));
        }
        Ok(())
    }

    /// Expands `book_root` into one folder per immediate child directory,
    /// and appends any explicitly listed `folders` (spec.md §6.6).
    pub fn resolve_folders(&self) -> Result<Vec<PathBuf>> {
        let mut folders = self.folders.clone();
        if let Some(root) = &self.book_root {
            let entries = std::fs::read_dir(root)?;
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    folders.push(entry.path());
                }
            }
        }
        folders.sort();
        folders.dedup();
        Ok(folders)
    }
}
