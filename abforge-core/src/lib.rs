//! Job/task orchestration engine for audiobook metadata enrichment: a
//! crash-safe persistent queue, a bounded worker pool, a per-host rate
//! limiter, and the multi-stage processing pipeline that turns a raw
//! audiobook folder plus a catalog URL into an organized, tagged folder
//! with sidecar metadata.
//!
//! `abforge-cli` (or any other caller) drives this crate through
//! [`QueueStore`] to create jobs/tasks and [`Dispatcher`] to run them.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod genre;
pub mod locks;
pub mod model;
pub mod opf;
pub mod pipeline;
pub mod rate_limiter;
pub mod sanitize;
pub mod scrapers;
pub mod store;

pub use config::Configuration;
pub use dispatcher::Dispatcher;
pub use error::{AbForgeError, Result};
pub use genre::GenreNormalizer;
pub use locks::FileLockManager;
pub use rate_limiter::DomainRateLimiter;
pub use scrapers::ScraperRegistry;
pub use store::QueueStore;
