//! Scraper registry (spec.md §6.4): a static table keyed by site name.
//!
//! HTML/JSON parsing of any specific catalog is an external collaborator
//! per spec.md §1 ("each scraper is a black-box function `(URL,HTTP) →
//! Metadata`") — this module defines the interface the pipeline drives and
//! the URL-classification table, not any particular site's parser.

use regex::Regex;

use crate::error::{AbForgeError, Result};
use crate::model::BookMetadata;

/// The raw HTTP response handed to a scraper's `scrape` step.
#[derive(Clone, Debug)]
pub struct ScraperResponse {
    pub status: u16,
    pub body: String,
}

impl ScraperResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One catalog site adapter (spec.md §6.4 table entry):
/// `{domain, url_pattern, search_url_builder, http_request, scrape,
/// url_preprocess}`.
pub trait Scraper: Send + Sync + std::fmt::Debug {
    fn site_name(&self) -> &str;
    fn domain(&self) -> &str;
    fn url_pattern(&self) -> &Regex;

    /// Builds a search URL for `term`, used by the (external) auto-search
    /// surface; not exercised by the core pipeline directly.
    fn build_search_url(&self, term: &str) -> String;

    /// Normalizes a raw URL before it's fetched (e.g. stripping tracking
    /// query params).
    fn preprocess(&self, metadata: &BookMetadata) -> BookMetadata {
        metadata.clone()
    }

    /// Builds the outbound request target for this site from `metadata`.
    /// Most scrapers simply request `metadata.url`; API-backed scrapers
    /// (spec.md §4.5 stage 2) may rewrite it into an API endpoint.
    fn request_url(&self, metadata: &BookMetadata) -> Result<String> {
        metadata
            .url
            .clone()
            .ok_or_else(|| AbForgeError::Internal("scraper called without a URL".into()))
    }

    /// Extracts `BookMetadata` from a fetched response. May set
    /// `metadata.skip = true` to signal "valid response but unusable"
    /// (spec.md §4.5 stage 3).
    fn scrape(&self, metadata: &BookMetadata, response: &ScraperResponse) -> Result<BookMetadata>;
}

/// The table of registered scrapers, resolved by URL or by explicit site
/// name (`Configuration::site`, spec.md §6.6).
pub struct ScraperRegistry {
    scrapers: Vec<Box<dyn Scraper>>,
}

impl std::fmt::Debug for ScraperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScraperRegistry")
            .field(
                "sites",
                &self.scrapers.iter().map(|s| s.site_name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ScraperRegistry {
    pub fn new(scrapers: Vec<Box<dyn Scraper>>) -> Self {
        Self { scrapers }
    }

    pub fn empty() -> Self {
        Self { scrapers: Vec::new() }
    }

    /// Classifies a URL by matching against each registered scraper's
    /// `url_pattern`, restricted to `site_filter` when set
    /// (`Configuration::site`, "restrict the scraper registry to one
    /// entry, or `all`").
    pub fn resolve(&self, url: &str, site_filter: Option<&str>) -> Result<&dyn Scraper> {
        let candidates = self.scrapers.iter().filter(|s| {
            site_filter
                .map(|f| f == "all" || f.eq_ignore_ascii_case(s.site_name()))
                .unwrap_or(true)
        });
        for scraper in candidates {
            if scraper.url_pattern().is_match(url) {
                return Ok(scraper.as_ref());
            }
        }
        Err(AbForgeError::UnsupportedUrl(url.to_string()))
    }

    pub fn by_site(&self, name: &str) -> Option<&dyn Scraper> {
        self.scrapers
            .iter()
            .find(|s| s.site_name().eq_ignore_ascii_case(name))
            .map(|s| s.as_ref())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::fake_scraper;
    use super::*;

    #[test]
    fn resolve_matches_by_url_pattern() {
        let registry = ScraperRegistry::new(vec![Box::new(fake_scraper(
            "fake",
            BookMetadata::default(),
        ))]);
        let scraper = registry
            .resolve("https://fake.example/book/1", None)
            .unwrap();
        assert_eq!(scraper.site_name(), "fake");
    }

    #[test]
    fn resolve_rejects_unknown_url() {
        let registry = ScraperRegistry::empty();
        let err = registry.resolve("https://unknown.example/book/1", None).unwrap_err();
        assert!(matches!(err, AbForgeError::UnsupportedUrl(_)));
    }

    #[test]
    fn site_filter_excludes_non_matching_scrapers() {
        let registry = ScraperRegistry::new(vec![Box::new(fake_scraper(
            "fake",
            BookMetadata::default(),
        ))]);
        let err = registry
            .resolve("https://fake.example/book/1", Some("other-site"))
            .unwrap_err();
        assert!(matches!(err, AbForgeError::UnsupportedUrl(_)));
    }
}
