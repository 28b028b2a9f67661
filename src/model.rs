//! Core record types for the enrichment pipeline.
//!
//! Work items come from the upstream citation crawler; affiliation records
//! are what the engine accumulates. Record equality is structural over all
//! fields because the result set is deduplicated by exact equality.

use serde::{Deserialize, Serialize};

/// Sentinel author id meaning no author profile exists for this citation.
pub const NO_AUTHOR_FOUND: &str = "No_author_found";

/// One unit of enrichment work: a citing author plus the paper pairing
/// that ties the citation back to the source data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Google Scholar author id, or [`NO_AUTHOR_FOUND`]
    pub author_id: String,
    /// Title of the citing paper
    pub citing_paper: String,
    /// Title of the cited paper
    pub cited_paper: String,
}

impl WorkItem {
    pub fn new(
        author_id: impl Into<String>,
        citing_paper: impl Into<String>,
        cited_paper: impl Into<String>,
    ) -> Self {
        Self {
            author_id: author_id.into(),
            citing_paper: citing_paper.into(),
            cited_paper: cited_paper.into(),
        }
    }

    /// Whether this item carries the no-author sentinel and needs no lookup.
    pub fn is_sentinel(&self) -> bool {
        self.author_id == NO_AUTHOR_FOUND
    }

    /// Matching key: items sharing a citing/cited pairing are siblings,
    /// and one sibling's success satisfies all of them.
    pub fn key(&self) -> PaperKey {
        PaperKey {
            citing_paper: self.citing_paper.clone(),
            cited_paper: self.cited_paper.clone(),
        }
    }
}

/// Identity of a citing/cited paper pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaperKey {
    pub citing_paper: String,
    pub cited_paper: String,
}

/// A single enriched affiliation record.
///
/// Equality and hashing are structural over all four fields; the accumulated
/// result set never stores two structurally identical records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffiliationRecord {
    pub author_name: String,
    pub citing_paper: String,
    pub cited_paper: String,
    pub affiliation: String,
}

impl AffiliationRecord {
    /// Canonical record for a work item with no resolvable author.
    pub fn sentinel(item: &WorkItem) -> Self {
        Self {
            author_name: NO_AUTHOR_FOUND.to_string(),
            citing_paper: item.citing_paper.clone(),
            cited_paper: item.cited_paper.clone(),
            affiliation: NO_AUTHOR_FOUND.to_string(),
        }
    }
}
