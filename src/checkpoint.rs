//! Durable checkpoint storage for the enrichment engine.
//!
//! All pipeline state for one scholar lives in a single cache directory:
//! the work list written by the upstream crawler, the resumable
//! `progress.json` snapshot, and the terminal `affiliations.json` artifact.
//! Saves are crash-atomic (write a temp sibling, then rename), so a reader
//! never observes a half-written snapshot.

use crate::error::{CitemapError, Result};
use crate::model::{AffiliationRecord, WorkItem};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Work list produced by the citation crawler, read once at engine start.
pub const WORK_LIST_FILE: &str = "citing_authors.json";

/// Resumable mid-run snapshot.
const PROGRESS_FILE: &str = "progress.json";

/// Terminal deduplicated artifact: a bare array of affiliation records.
const FINAL_FILE: &str = "affiliations.json";

/// Default cache root: `~/.citemap/cache`
pub fn default_cache_root() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join(".citemap").join("cache"))
        .ok_or_else(|| CitemapError::Config("Cannot determine home directory".to_string()))
}

/// Mid-run snapshot of the engine's state, persisted after every item.
///
/// `satisfied` holds item indices rather than paper keys; a success marks
/// every index sharing the paper key, so the sibling rule survives the
/// index-based layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressState {
    /// Affiliation records collected so far
    pub records: Vec<AffiliationRecord>,
    /// Indices satisfied by their own or a sibling's success
    pub satisfied: HashSet<usize>,
    /// Items with no record yet, paired with their original indices
    pub outstanding: Vec<(usize, WorkItem)>,
    /// Next index to process in the initial scan
    pub cursor: usize,
    /// Retry passes started so far, 0 while the initial scan runs
    #[serde(default)]
    pub pass: u32,
}

/// Directory-scoped store for one scholar's pipeline state.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Create a store under `cache_root/scholar_id/`
    pub fn new(cache_root: &Path, scholar_id: &str) -> Self {
        Self {
            dir: cache_root.join(scholar_id),
        }
    }

    /// Create a store over an explicit directory
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Directory holding this scholar's state
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the work list left by the citation crawler
    pub fn load_work_list(&self) -> Result<Vec<WorkItem>> {
        let path = self.dir.join(WORK_LIST_FILE);
        if !path.exists() {
            return Err(CitemapError::Config(format!(
                "Work list not found at {:?}. Run the citation crawler first.",
                path
            )));
        }
        let content = fs::read_to_string(&path)?;
        let items: Vec<WorkItem> = serde_json::from_str(&content)?;
        info!(count = items.len(), path = ?path, "Loaded work list");
        Ok(items)
    }

    /// Load the resumable progress snapshot, if one exists
    pub fn load(&self) -> Result<Option<ProgressState>> {
        let path = self.dir.join(PROGRESS_FILE);
        if !path.exists() {
            debug!(path = ?path, "No progress snapshot");
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let state: ProgressState = serde_json::from_str(&content)?;
        info!(
            cursor = state.cursor,
            records = state.records.len(),
            outstanding = state.outstanding.len(),
            "Loaded progress snapshot"
        );
        Ok(Some(state))
    }

    /// Persist the progress snapshot atomically
    pub fn save(&self, state: &ProgressState) -> Result<()> {
        let content = serde_json::to_string(state)?;
        self.write_atomic(&self.dir.join(PROGRESS_FILE), &content)
    }

    /// Load the terminal artifact, if a prior run committed one
    pub fn load_final(&self) -> Result<Option<Vec<AffiliationRecord>>> {
        let path = self.dir.join(FINAL_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let records: Vec<AffiliationRecord> = serde_json::from_str(&content)?;
        info!(count = records.len(), path = ?path, "Loaded final affiliation set");
        Ok(Some(records))
    }

    /// Commit the terminal artifact atomically
    pub fn commit_final(&self, records: &[AffiliationRecord]) -> Result<()> {
        let content = serde_json::to_string_pretty(records)?;
        self.write_atomic(&self.dir.join(FINAL_FILE), &content)?;
        info!(count = records.len(), dir = ?self.dir, "Committed final affiliation set");
        Ok(())
    }

    /// Remove the progress snapshot; the work list and final artifact stay
    pub fn clear_progress(&self) -> Result<()> {
        let path = self.dir.join(PROGRESS_FILE);
        if path.exists() {
            fs::remove_file(&path)?;
            info!(path = ?path, "Removed progress snapshot");
        }
        Ok(())
    }

    /// Write via temp-then-rename so a crash never leaves a torn file
    fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = CheckpointStore::with_dir(dir.path().join("scholar"));
        (dir, store)
    }

    fn record(author: &str) -> AffiliationRecord {
        AffiliationRecord {
            author_name: author.to_string(),
            citing_paper: "p1".to_string(),
            cited_paper: "c1".to_string(),
            affiliation: "MIT".to_string(),
        }
    }

    #[test]
    fn test_load_when_empty() -> Result<()> {
        let (_tmp, store) = store();
        assert!(store.load()?.is_none());
        assert!(store.load_final()?.is_none());
        Ok(())
    }

    #[test]
    fn test_progress_roundtrip() -> Result<()> {
        let (_tmp, store) = store();
        let mut state = ProgressState::default();
        state.records.push(record("Alice"));
        state.satisfied.insert(0);
        state
            .outstanding
            .push((1, WorkItem::new("a2", "p2", "c1")));
        state.cursor = 2;
        state.pass = 1;

        store.save(&state)?;
        let loaded = store.load()?.expect("progress snapshot");
        assert_eq!(loaded.records, state.records);
        assert_eq!(loaded.satisfied, state.satisfied);
        assert_eq!(loaded.outstanding, state.outstanding);
        assert_eq!(loaded.cursor, 2);
        assert_eq!(loaded.pass, 1);
        Ok(())
    }

    #[test]
    fn test_save_leaves_no_temp_file() -> Result<()> {
        let (_tmp, store) = store();
        store.save(&ProgressState::default())?;
        let leftovers: Vec<_> = fs::read_dir(store.dir())?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn test_final_roundtrip() -> Result<()> {
        let (_tmp, store) = store();
        let records = vec![record("Alice"), record("Bob")];
        store.commit_final(&records)?;
        let loaded = store.load_final()?.expect("final artifact");
        assert_eq!(loaded, records);
        Ok(())
    }

    #[test]
    fn test_final_is_bare_array() -> Result<()> {
        // Downstream consumers deserialize the artifact as a plain sequence.
        let (_tmp, store) = store();
        store.commit_final(&[record("Alice")])?;
        let content = fs::read_to_string(store.dir().join(FINAL_FILE))?;
        let parsed: serde_json::Value = serde_json::from_str(&content)?;
        assert!(parsed.is_array());
        Ok(())
    }

    #[test]
    fn test_clear_progress_keeps_final() -> Result<()> {
        let (_tmp, store) = store();
        store.save(&ProgressState::default())?;
        store.commit_final(&[record("Alice")])?;
        store.clear_progress()?;
        assert!(store.load()?.is_none());
        assert!(store.load_final()?.is_some());
        // Clearing twice is fine.
        store.clear_progress()?;
        Ok(())
    }

    #[test]
    fn test_work_list_missing() {
        let (_tmp, store) = store();
        assert!(store.load_work_list().is_err());
    }

    #[test]
    fn test_work_list_roundtrip() -> Result<()> {
        let (_tmp, store) = store();
        let items = vec![
            WorkItem::new("a1", "p1", "c1"),
            WorkItem::new("a2", "p1", "c1"),
        ];
        fs::create_dir_all(store.dir())?;
        fs::write(
            store.dir().join(WORK_LIST_FILE),
            serde_json::to_string(&items)?,
        )?;
        assert_eq!(store.load_work_list()?, items);
        Ok(())
    }
}
