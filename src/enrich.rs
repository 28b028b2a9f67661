//! Enrichment client: one pacing-delayed affiliation lookup per work item.
//!
//! This is the failure-isolation boundary of the pipeline. Transport and
//! service errors are caught here and classified; the engine only ever sees
//! [`Lookup`] outcomes, never raw errors.

use crate::model::{AffiliationRecord, WorkItem};
use crate::scholar::{AuthorProfile, AuthorSource};
use rand::Rng;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Which profile field backs the affiliation attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Self-reported affiliation line. Broader coverage, unverified.
    Aggressive,
    /// Verified organization only, canonicalized.
    Conservative,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Aggressive => "aggressive",
            Strategy::Conservative => "conservative",
        }
    }
}

/// Outcome of a single enrichment attempt.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// A usable affiliation record
    Hit(AffiliationRecord),
    /// Profile fetched but it lacks the field the strategy needs
    NoData,
    /// Transport or service error, absorbed at this boundary
    Failed(String),
}

/// Per-item lookup with randomized pacing.
///
/// The pacing delay defends against Scholar's automated-use detection and
/// must stay randomized; only the bounds are configurable (tests set them
/// to zero).
pub struct EnrichmentClient {
    source: Arc<dyn AuthorSource>,
    strategy: Strategy,
    pace_min: Duration,
    pace_max: Duration,
}

impl EnrichmentClient {
    /// Create a client with the default 1-5s pacing window
    pub fn new(source: Arc<dyn AuthorSource>, strategy: Strategy) -> Self {
        Self {
            source,
            strategy,
            pace_min: Duration::from_secs(1),
            pace_max: Duration::from_secs(5),
        }
    }

    /// Override the pacing window
    pub fn with_pacing(mut self, min: Duration, max: Duration) -> Self {
        self.pace_min = min;
        self.pace_max = max.max(min);
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Look up the affiliation for one work item.
    ///
    /// Sentinel items resolve immediately to the canonical sentinel record
    /// without pacing or a source call.
    pub async fn lookup(&self, item: &WorkItem) -> Lookup {
        if item.is_sentinel() {
            return Lookup::Hit(AffiliationRecord::sentinel(item));
        }

        self.pace().await;

        match self.source.fetch_author(&item.author_id).await {
            Ok(Some(profile)) => self.classify(item, profile),
            Ok(None) => {
                debug!(author = %item.author_id, "No profile found");
                Lookup::NoData
            }
            Err(e) => {
                warn!(author = %item.author_id, error = %e, "Lookup failed");
                Lookup::Failed(e.to_string())
            }
        }
    }

    /// Sleep a uniformly random interval within the pacing window
    async fn pace(&self) {
        let span = self.pace_max.saturating_sub(self.pace_min).as_millis() as u64;
        let jitter = if span == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=span))
        };
        let wait = self.pace_min + jitter;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn classify(&self, item: &WorkItem, profile: AuthorProfile) -> Lookup {
        let affiliation = match self.strategy {
            Strategy::Aggressive => profile.affiliation,
            Strategy::Conservative => profile
                .organization
                .map(|org| canonicalize_organization(&org)),
        };

        match affiliation.filter(|a| !a.trim().is_empty()) {
            Some(affiliation) => Lookup::Hit(AffiliationRecord {
                author_name: profile.name,
                citing_paper: item.citing_paper.clone(),
                cited_paper: item.cited_paper.clone(),
                affiliation,
            }),
            None => {
                debug!(
                    author = %item.author_id,
                    strategy = self.strategy.name(),
                    "Profile lacks the needed field"
                );
                Lookup::NoData
            }
        }
    }
}

/// Common organization-name abbreviations and their reference forms
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("Univ.", "University"),
    ("Inst.", "Institute"),
    ("Tech.", "Technology"),
    ("Dept.", "Department"),
    ("Lab.", "Laboratory"),
    ("Natl.", "National"),
];

/// Reduce a verified organization name to a reference form by dropping
/// parenthetical qualifiers and expanding common abbreviations.
pub fn canonicalize_organization(name: &str) -> String {
    let stripped = match Regex::new(r"\([^)]*\)") {
        Ok(re) => re.replace_all(name, " ").to_string(),
        Err(_) => name.to_string(),
    };

    let mut expanded = stripped;
    for (abbr, full) in ABBREVIATIONS {
        expanded = expanded.replace(abbr, full);
    }

    expanded.split_whitespace().collect::<Vec<_>>().join(" ")
}
