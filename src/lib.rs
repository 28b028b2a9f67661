//! # citemap
//!
//! Checkpointed citation-affiliation enrichment pipeline for Google Scholar.
//!
//! Given the citing-author list produced by the upstream citation crawler,
//! the engine enriches each author with an affiliation, checkpointing after
//! every item so that blocks, rate limits, and interruptions never cost more
//! than the single in-flight author.
//!
//! ## Modules
//!
//! - [`engine`] - incremental batch-enrichment engine with resume and bounded retries
//! - [`checkpoint`] - durable progress snapshots and the final artifact
//! - [`enrich`] - per-item enrichment client with pacing and failure isolation
//! - [`scholar`] - Google Scholar author-profile transport
//! - [`report`] - affiliation grouping and CSV reports
//! - [`model`] - core record types
//! - [`error`] - custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use citemap::checkpoint::CheckpointStore;
//! use citemap::engine::EnrichmentEngine;
//! use citemap::enrich::{EnrichmentClient, Strategy};
//! use citemap::scholar::ScholarClient;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = CheckpointStore::new(Path::new("cache"), "HNw5OdcAAAAJ");
//!     let items = store.load_work_list()?;
//!     let client = EnrichmentClient::new(Arc::new(ScholarClient::new(None)?), Strategy::Aggressive);
//!     let outcome = EnrichmentEngine::new(client, store, 3).run(&items).await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod model;
pub mod report;
pub mod scholar;

pub use error::{CitemapError, Result};
