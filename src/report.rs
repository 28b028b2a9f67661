//! Affiliation reports over the final result set.
//!
//! Pure grouping and aggregation plus CSV writers. Nothing here touches the
//! network or the checkpoint store; the input is the deduplicated record set
//! the engine committed.

use crate::error::Result;
use crate::model::{AffiliationRecord, NO_AUTHOR_FOUND};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

/// One affiliation with its unique citing authors.
#[derive(Debug, Clone, Serialize)]
pub struct AffiliationSummary {
    pub affiliation: String,
    pub author_count: usize,
    /// Unique author names, sorted, "; "-joined
    pub authors: String,
}

/// One citation row for a keyword-filtered detail report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CitationDetail {
    pub affiliation: String,
    pub author: String,
    pub citing_paper: String,
    pub cited_paper: String,
}

/// Group records by affiliation and count unique authors, sorted by count
/// descending. Sentinel records carry no author and are skipped.
pub fn summarize_by_affiliation(records: &[AffiliationRecord]) -> Vec<AffiliationSummary> {
    let mut authors_by_affiliation: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for record in records {
        if record.author_name == NO_AUTHOR_FOUND {
            continue;
        }
        authors_by_affiliation
            .entry(record.affiliation.as_str())
            .or_default()
            .insert(record.author_name.as_str());
    }

    let mut summaries: Vec<AffiliationSummary> = authors_by_affiliation
        .into_iter()
        .map(|(affiliation, authors)| AffiliationSummary {
            affiliation: affiliation.to_string(),
            author_count: authors.len(),
            authors: authors.into_iter().collect::<Vec<_>>().join("; "),
        })
        .collect();

    // Count descending, then affiliation for a stable order.
    summaries.sort_by(|a, b| {
        b.author_count
            .cmp(&a.author_count)
            .then_with(|| a.affiliation.cmp(&b.affiliation))
    });
    summaries
}

/// Per-citation detail rows for affiliations matching a keyword,
/// case-insensitive, sorted by (affiliation, author).
pub fn filter_by_keyword(records: &[AffiliationRecord], keyword: &str) -> Vec<CitationDetail> {
    let needle = keyword.to_lowercase();
    let mut details: Vec<CitationDetail> = records
        .iter()
        .filter(|record| record.author_name != NO_AUTHOR_FOUND)
        .filter(|record| record.affiliation.to_lowercase().contains(&needle))
        .map(|record| CitationDetail {
            affiliation: record.affiliation.clone(),
            author: record.author_name.clone(),
            citing_paper: record.citing_paper.clone(),
            cited_paper: record.cited_paper.clone(),
        })
        .collect();

    details.sort_by(|a, b| {
        a.affiliation
            .cmp(&b.affiliation)
            .then_with(|| a.author.cmp(&b.author))
    });
    details
}

/// Save serializable rows to a CSV file with headers
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut wtr = csv::WriterBuilder::new().has_headers(true).from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;

    info!(rows = rows.len(), path = ?path, "Saved CSV report");
    Ok(())
}
