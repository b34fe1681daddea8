//! Genre Normalizer (spec.md §4.6): maps incoming free-form genre lists to
//! a consistent, deduplicated canonical form, growing a persisted mapping
//! as new genres are encountered.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{AbForgeError, Result};

/// On-disk JSON dictionary: canonical (lowercase) -> alternatives
/// (lowercase), spec.md §6.1. `BTreeMap` gives the "stable key ordering on
/// write" the interface contract requires for free.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenreMapping(BTreeMap<String, Vec<String>>);

impl GenreMapping {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Atomic-replace write: temp file in the same directory, then
    /// rename, per spec.md §4.6 step 5.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let body = serde_json::to_string_pretty(&self.0)?;
        tmp.write_all(body.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| AbForgeError::FileSystem(e.error))?;
        Ok(())
    }

    fn resolve(&self, genre_lower: &str) -> Option<String> {
        if self.0.contains_key(genre_lower) {
            return Some(genre_lower.to_string());
        }
        self.0.iter().find_map(|(canonical, alts)| {
            alts.iter()
                .any(|a| a == genre_lower)
                .then(|| canonical.clone())
        })
    }

    fn add_canonical(&mut self, genre_lower: &str) {
        self.0.entry(genre_lower.to_string()).or_default();
    }

    fn add_alternative(&mut self, canonical: &str, alternative: &str) {
        let alts = self.0.entry(canonical.to_string()).or_default();
        if !alts.iter().any(|a| a == alternative) {
            alts.push(alternative.to_string());
        }
    }

    pub fn canonicals(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len() + self.0.values().map(|v| v.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single `NO_FIT`-or-canonical classification decision for an unmapped
/// genre, abstracted per spec.md §9 "LLM as a side-effect" so tests can
/// inject deterministic behavior instead of calling out to a real model.
pub trait GenreAdvisor: Send + Sync {
    /// Pings the backend to surface misconfiguration early (spec.md §4.6
    /// "initial ping ... at construction").
    fn ping(&self) -> Result<()>;

    /// Classifies `genre` against the existing canonical/alternative
    /// enumeration. Must return either one of `canonicals` or the literal
    /// sentinel `"NO_FIT"`; any other answer is an `LLMError`.
    fn classify(&self, genre: &str, canonicals: &BTreeMap<String, Vec<String>>) -> Result<String>;
}

/// LLM-disabled mode: every unmapped genre becomes its own new canonical.
#[derive(Debug, Default)]
pub struct NoopAdvisor;

impl GenreAdvisor for NoopAdvisor {
    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn classify(&self, _genre: &str, _canonicals: &BTreeMap<String, Vec<String>>) -> Result<String> {
        Ok("NO_FIT".to_string())
    }
}

pub const NO_FIT: &str = "NO_FIT";

/// LLM-enabled mode: classifies unmapped genres via an OpenAI-compatible
/// chat completion endpoint (original_source supplement, SPEC_FULL.md
/// §4.6). `reqwest::blocking` matches the pipeline's blocking-thread model.
pub struct HttpAdvisor {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    http: reqwest::blocking::Client,
}

impl HttpAdvisor {
    pub fn new(endpoint: String, api_key: Option<String>, model: String) -> Self {
        Self {
            endpoint,
            api_key,
            model,
            http: reqwest::blocking::Client::new(),
        }
    }

    fn prompt(&self, genre: &str, canonicals: &BTreeMap<String, Vec<String>>) -> String {
        let list = canonicals.keys().cloned().collect::<Vec<_>>().join(", ");
        format!(
            "Classify the genre \"{genre}\" as one of [{list}], or answer {NO_FIT} \
             if none fit. Answer with only the chosen word."
        )
    }
}

impl GenreAdvisor for HttpAdvisor {
    fn ping(&self) -> Result<()> {
        let mut request = self.http.get(&self.endpoint);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
            .send()
            .map_err(AbForgeError::HttpTransient)?;
        Ok(())
    }

    fn classify(&self, genre: &str, canonicals: &BTreeMap<String, Vec<String>>) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": self.prompt(genre, canonicals)}],
        });
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().map_err(AbForgeError::HttpTransient)?;
        let payload: serde_json::Value = response.json().map_err(AbForgeError::HttpTransient)?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| AbForgeError::Llm("advisor response missing message content".into()))
    }
}

/// Genre Normalizer: serializes reads/writes of the shared mapping behind
/// a single in-process mutex (spec.md §5 "a single in-process mutex
/// serializes reads and writes of the mapping").
pub struct GenreNormalizer {
    mapping_path: PathBuf,
    mapping: Mutex<GenreMapping>,
    advisor: Box<dyn GenreAdvisor>,
    llm_enabled: bool,
}

impl std::fmt::Debug for GenreNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenreNormalizer")
            .field("mapping_path", &self.mapping_path)
            .field("llm_enabled", &self.llm_enabled)
            .finish()
    }
}

impl GenreNormalizer {
    pub fn new(
        mapping_path: PathBuf,
        advisor: Box<dyn GenreAdvisor>,
        llm_enabled: bool,
    ) -> Result<Self> {
        if llm_enabled {
            advisor.ping()?;
        }
        let mapping = GenreMapping::load(&mapping_path)?;
        Ok(Self {
            mapping_path,
            mapping: Mutex::new(mapping),
            advisor,
            llm_enabled,
        })
    }

    /// Resolves `genres` to their canonical forms, growing the mapping for
    /// any unmapped input (spec.md §4.6 algorithm).
    pub fn normalize(&self, genres: &[String]) -> Result<Vec<String>> {
        let mut mapping = self.mapping.lock().unwrap();
        let mut out = Vec::new();
        let mut dirty = false;

        for raw in genres {
            let lower = raw.trim().to_lowercase();
            if lower.is_empty() {
                continue;
            }
            let canonical = match mapping.resolve(&lower) {
                Some(existing) => existing,
                None if !self.llm_enabled => {
                    mapping.add_canonical(&lower);
                    dirty = true;
                    lower.clone()
                }
                None => {
                    let answer = self.advisor.classify(&lower, &mapping.0)?;
                    if answer == NO_FIT {
                        mapping.add_canonical(&lower);
                        dirty = true;
                        lower.clone()
                    } else if mapping.0.contains_key(&answer) {
                        mapping.add_alternative(&answer, &lower);
                        dirty = true;
                        answer
                    } else {
                        return Err(AbForgeError::Llm(format!(
                            "advisor returned unknown canonical {answer:?} for genre {lower:?}"
                        )));
                    }
                }
            };
            if !out.contains(&canonical) {
                out.push(canonical);
            }
        }

        if dirty {
            mapping.persist(&self.mapping_path)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn seeded_mapping() -> GenreMapping {
        let mut m = Map::new();
        m.insert(
            "science fiction".to_string(),
            vec!["sci-fi".to_string(), "sf".to_string()],
        );
        m.insert("fantasy".to_string(), vec!["fantastyka".to_string()]);
        GenreMapping(m)
    }

    fn normalizer_with(mapping: GenreMapping, path: &Path) -> GenreNormalizer {
        mapping.persist(path).unwrap();
        GenreNormalizer::new(path.to_path_buf(), Box::new(NoopAdvisor), false).unwrap()
    }

    /// Scenario E (spec.md §8).
    #[test]
    fn aliases_resolve_and_new_canonicals_are_added() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genres.json");
        let normalizer = normalizer_with(seeded_mapping(), &path);

        let result = normalizer
            .normalize(&[
                "Sci-Fi".to_string(),
                "FANTASY".to_string(),
                "fantastyka".to_string(),
                "horror".to_string(),
            ])
            .unwrap();

        assert_eq!(result, vec!["science fiction", "fantasy", "horror"]);

        let persisted = GenreMapping::load(&path).unwrap();
        assert!(persisted.0.contains_key("horror"));
        assert!(persisted.0["horror"].is_empty());
    }

    /// Testable property 7: idempotence, dedup, growth, determinism.
    #[test]
    fn normalize_is_idempotent_and_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genres.json");
        let normalizer = normalizer_with(GenreMapping::default(), &path);

        let input = vec![
            "Horror".to_string(),
            "horror".to_string(),
            "Thriller".to_string(),
        ];
        let first = normalizer.normalize(&input).unwrap();
        assert_eq!(first, vec!["horror", "thriller"]);
        let size_after_first = normalizer.mapping.lock().unwrap().len();

        let second = normalizer.normalize(&first).unwrap();
        assert_eq!(second, first);
        let size_after_second = normalizer.mapping.lock().unwrap().len();
        assert_eq!(size_after_first, size_after_second);
    }

    #[test]
    fn order_preserving_first_seen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genres.json");
        let normalizer = normalizer_with(GenreMapping::default(), &path);
        let result = normalizer
            .normalize(&["Mystery".to_string(), "Adventure".to_string(), "mystery".to_string()])
            .unwrap();
        assert_eq!(result, vec!["mystery", "adventure"]);
    }

    struct FixedAdvisor(&'static str);
    impl GenreAdvisor for FixedAdvisor {
        fn ping(&self) -> Result<()> {
            Ok(())
        }
        fn classify(&self, _genre: &str, _canonicals: &BTreeMap<String, Vec<String>>) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn llm_classification_adds_alternative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genres.json");
        seeded_mapping().persist(&path).unwrap();
        let normalizer =
            GenreNormalizer::new(path.clone(), Box::new(FixedAdvisor("fantasy")), true).unwrap();
        let result = normalizer.normalize(&["swords and sorcery".to_string()]).unwrap();
        assert_eq!(result, vec!["fantasy"]);
        let persisted = GenreMapping::load(&path).unwrap();
        assert!(persisted.0["fantasy"].contains(&"swords and sorcery".to_string()));
    }

    #[test]
    fn llm_invalid_answer_raises_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genres.json");
        seeded_mapping().persist(&path).unwrap();
        let normalizer =
            GenreNormalizer::new(path.clone(), Box::new(FixedAdvisor("not_a_real_genre")), true)
                .unwrap();
        let err = normalizer.normalize(&["steampunk".to_string()]).unwrap_err();
        assert!(matches!(err, AbForgeError::Llm(_)));
    }
}
