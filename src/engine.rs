//! Incremental checkpointed batch-enrichment engine.
//!
//! Drives the work list against the enrichment client one item at a time,
//! persisting progress after every item so an interruption loses at most the
//! single in-flight item. A restart resumes at the saved cursor without
//! re-querying completed items, a reconciliation step recovers items that
//! never produced a record under any matching key, and a bounded number of
//! retry passes re-attempts the outstanding set before the run converges to
//! a deduplicated final artifact plus a permanently-failed remainder.

use crate::checkpoint::{CheckpointStore, ProgressState};
use crate::enrich::{EnrichmentClient, Lookup};
use crate::error::Result;
use crate::model::{AffiliationRecord, PaperKey, WorkItem};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag.
///
/// The caller (the Ctrl-C handler) sets it; the engine checks it between
/// items, always after the current item's checkpoint write. Cancellation
/// mid-item has no effect until that write completes.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Result of a run that reached the terminal state.
#[derive(Debug)]
pub struct RunReport {
    /// Deduplicated affiliation records
    pub records: Vec<AffiliationRecord>,
    /// Items still failing after all retry passes, with original indices
    pub permanently_failed: Vec<(usize, WorkItem)>,
}

/// Outcome of one engine invocation.
#[derive(Debug)]
pub enum RunOutcome {
    Complete(RunReport),
    /// Interrupted between items; progress is on disk and the next
    /// invocation resumes from here
    Suspended { cursor: usize, pass: u32 },
}

/// Orchestrates enrichment passes over the work list.
///
/// One logical worker, strictly sequential lookups: the pacing delay and
/// Scholar's anti-automation defenses make fan-out counterproductive, so the
/// engine never issues concurrent calls. Two engine instances over one store
/// are unsupported.
pub struct EnrichmentEngine {
    client: EnrichmentClient,
    store: CheckpointStore,
    max_retry_passes: u32,
    save_interval: usize,
    cancel: CancellationToken,
}

impl EnrichmentEngine {
    pub fn new(client: EnrichmentClient, store: CheckpointStore, max_retry_passes: u32) -> Self {
        Self {
            client,
            store,
            max_retry_passes,
            save_interval: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Honor an external cancellation signal between items.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Checkpoint every `interval` items during the initial scan instead of
    /// every item. Widens the loss window on a crash to `interval` items;
    /// interruption still checkpoints before suspending.
    pub fn with_save_interval(mut self, interval: usize) -> Self {
        self.save_interval = interval.max(1);
        self
    }

    /// Run the pipeline over the work list.
    ///
    /// Re-invoking after a committed run short-circuits to the stored
    /// artifact without any lookups. Checkpoint write failures abort the
    /// run; the last persisted snapshot stays authoritative for the next
    /// invocation.
    pub async fn run(&self, items: &[WorkItem]) -> Result<RunOutcome> {
        if let Some(records) = self.store.load_final()? {
            info!(
                count = records.len(),
                "Final affiliation set already committed, skipping enrichment"
            );
            return Ok(RunOutcome::Complete(RunReport {
                records,
                permanently_failed: Vec::new(),
            }));
        }

        let key_map = sibling_index_map(items);

        let mut state = match self.store.load()? {
            Some(state) => {
                info!(
                    cursor = state.cursor,
                    total = items.len(),
                    records = state.records.len(),
                    outstanding = state.outstanding.len(),
                    "Resuming from saved progress"
                );
                state
            }
            None => ProgressState::default(),
        };

        if state.pass == 0 && state.cursor < items.len() {
            info!(
                strategy = self.client.strategy().name(),
                start = state.cursor,
                total = items.len(),
                "Starting initial scan"
            );
            if !self.scan(items, &key_map, &mut state).await? {
                return Ok(RunOutcome::Suspended {
                    cursor: state.cursor,
                    pass: state.pass,
                });
            }
        }

        self.reconcile(items, &mut state)?;

        if !self.retry(&key_map, &mut state).await? {
            return Ok(RunOutcome::Suspended {
                cursor: state.cursor,
                pass: state.pass,
            });
        }

        self.finalize(state)
    }

    /// Pass 1: one lookup per unprocessed index, checkpoint after every item.
    async fn scan(
        &self,
        items: &[WorkItem],
        key_map: &HashMap<PaperKey, Vec<usize>>,
        state: &mut ProgressState,
    ) -> Result<bool> {
        while state.cursor < items.len() {
            let index = state.cursor;
            let item = &items[index];

            match self.client.lookup(item).await {
                Lookup::Hit(record) => {
                    debug!(index, author = %item.author_id, "Enriched");
                    record_success(state, key_map, item, record);
                }
                Lookup::NoData => {
                    debug!(index, author = %item.author_id, "No affiliation data");
                    state.outstanding.push((index, item.clone()));
                }
                Lookup::Failed(reason) => {
                    debug!(index, author = %item.author_id, reason = %reason, "Attempt failed");
                    state.outstanding.push((index, item.clone()));
                }
            }

            state.cursor += 1;
            let cancelled = self.cancel.is_cancelled();
            if cancelled
                || state.cursor % self.save_interval == 0
                || state.cursor == items.len()
            {
                self.store.save(state)?;
            }

            if state.cursor % 10 == 0 {
                info!(
                    processed = state.cursor,
                    total = items.len(),
                    outstanding = state.outstanding.len(),
                    "Scan progress"
                );
            }

            if cancelled {
                info!(cursor = state.cursor, "Interrupted, progress saved");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Repair the outstanding set before retrying.
    ///
    /// Entries satisfied by a sibling's later success are dropped, and items
    /// tracked by neither set are re-queued. The recovery half repairs
    /// earlier partial runs and is not expected to fire in steady state.
    fn reconcile(&self, items: &[WorkItem], state: &mut ProgressState) -> Result<()> {
        let satisfied = &state.satisfied;
        let before = state.outstanding.len();
        state.outstanding.retain(|(index, _)| !satisfied.contains(index));
        let dropped = before - state.outstanding.len();

        let tracked: HashSet<usize> = state.outstanding.iter().map(|(index, _)| *index).collect();
        let mut recovered = 0usize;
        for (index, item) in items.iter().enumerate() {
            if !state.satisfied.contains(&index) && !tracked.contains(&index) {
                state.outstanding.push((index, item.clone()));
                recovered += 1;
            }
        }
        if dropped > 0 || recovered > 0 {
            info!(dropped, recovered, "Reconciled outstanding set");
        }

        let before = state.records.len();
        state.records = dedup_records(std::mem::take(&mut state.records));
        let duplicates = before - state.records.len();
        if duplicates > 0 {
            info!(duplicates, "Removed duplicate records");
        }

        self.store.save(state)?;
        Ok(())
    }

    /// Bounded retry passes over the outstanding set.
    async fn retry(
        &self,
        key_map: &HashMap<PaperKey, Vec<usize>>,
        state: &mut ProgressState,
    ) -> Result<bool> {
        while !state.outstanding.is_empty() && state.pass < self.max_retry_passes {
            state.pass += 1;
            let mut batch = std::mem::take(&mut state.outstanding);
            batch.sort_by_key(|(index, _)| *index);
            let attempted = batch.len();
            info!(
                pass = state.pass,
                max_passes = self.max_retry_passes,
                retrying = attempted,
                "Starting retry pass"
            );

            for (index, item) in batch {
                match self.client.lookup(&item).await {
                    Lookup::Hit(record) => {
                        debug!(index, author = %item.author_id, "Recovered on retry");
                        record_success(state, key_map, &item, record);
                    }
                    Lookup::NoData | Lookup::Failed(_) => {
                        state.outstanding.push((index, item));
                    }
                }

                self.store.save(state)?;

                if self.cancel.is_cancelled() {
                    info!(pass = state.pass, "Interrupted, progress saved");
                    return Ok(false);
                }
            }

            info!(
                pass = state.pass,
                recovered = attempted - state.outstanding.len(),
                still_failing = state.outstanding.len(),
                "Retry pass complete"
            );
        }
        Ok(true)
    }

    /// Commit the deduplicated artifact and retire the progress snapshot.
    fn finalize(&self, mut state: ProgressState) -> Result<RunOutcome> {
        let records = dedup_records(std::mem::take(&mut state.records));
        self.store.commit_final(&records)?;
        self.store.clear_progress()?;

        let mut permanently_failed = std::mem::take(&mut state.outstanding);
        permanently_failed.sort_by_key(|(index, _)| *index);

        if !permanently_failed.is_empty() {
            warn!(
                count = permanently_failed.len(),
                passes = self.max_retry_passes,
                "Items still failing after all retry passes"
            );
            for (index, item) in permanently_failed.iter().take(10) {
                warn!(index = *index, author = %item.author_id, "Permanently failed");
            }
            if permanently_failed.len() > 10 {
                warn!(more = permanently_failed.len() - 10, "Further failures omitted");
            }
        }

        info!(
            records = records.len(),
            failed = permanently_failed.len(),
            "Enrichment run complete"
        );
        Ok(RunOutcome::Complete(RunReport {
            records,
            permanently_failed,
        }))
    }
}

/// Map each paper key to every index that shares it.
fn sibling_index_map(items: &[WorkItem]) -> HashMap<PaperKey, Vec<usize>> {
    let mut map: HashMap<PaperKey, Vec<usize>> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        map.entry(item.key()).or_default().push(index);
    }
    map
}

/// Append a novel record and mark every sibling index satisfied.
///
/// Satisfied indices leave the outstanding set immediately, so one author's
/// success retires a co-author's earlier failure.
fn record_success(
    state: &mut ProgressState,
    key_map: &HashMap<PaperKey, Vec<usize>>,
    item: &WorkItem,
    record: AffiliationRecord,
) {
    if !state.records.contains(&record) {
        state.records.push(record);
    }
    if let Some(indices) = key_map.get(&item.key()) {
        for &index in indices {
            state.satisfied.insert(index);
        }
    }
    let satisfied = &state.satisfied;
    state.outstanding.retain(|(index, _)| !satisfied.contains(index));
}

/// Structural dedup preserving first-seen order.
fn dedup_records(records: Vec<AffiliationRecord>) -> Vec<AffiliationRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::Strategy;
    use crate::error::CitemapError;
    use crate::model::NO_AUTHOR_FOUND;
    use crate::scholar::{AuthorProfile, AuthorSource};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone)]
    enum Reply {
        /// `Ok(Some(profile))` with an affiliation line
        Affiliation(&'static str, &'static str),
        /// `Ok(Some(profile))` lacking the affiliation field
        NoAffiliation(&'static str),
        /// Transport error
        Error,
    }

    /// Scripted author source with per-author call counting.
    struct StubSource {
        replies: HashMap<String, Reply>,
        calls: Mutex<HashMap<String, usize>>,
        cancel_after: Option<(String, CancellationToken)>,
    }

    impl StubSource {
        fn new(replies: &[(&str, Reply)]) -> Self {
            Self {
                replies: replies
                    .iter()
                    .map(|(id, reply)| (id.to_string(), reply.clone()))
                    .collect(),
                calls: Mutex::new(HashMap::new()),
                cancel_after: None,
            }
        }

        /// Trip the token right after serving the given author id.
        fn cancel_after(mut self, author_id: &str, token: CancellationToken) -> Self {
            self.cancel_after = Some((author_id.to_string(), token));
            self
        }

        fn calls(&self, author_id: &str) -> usize {
            self.calls
                .lock()
                .expect("calls lock")
                .get(author_id)
                .copied()
                .unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().expect("calls lock").values().sum()
        }
    }

    #[async_trait]
    impl AuthorSource for StubSource {
        async fn fetch_author(&self, author_id: &str) -> crate::error::Result<Option<AuthorProfile>> {
            {
                let mut calls = self.calls.lock().expect("calls lock");
                *calls.entry(author_id.to_string()).or_insert(0) += 1;
            }
            if let Some((trigger, token)) = &self.cancel_after {
                if trigger == author_id {
                    token.cancel();
                }
            }
            match self.replies.get(author_id) {
                Some(Reply::Affiliation(name, affiliation)) => Ok(Some(AuthorProfile {
                    name: name.to_string(),
                    affiliation: Some(affiliation.to_string()),
                    organization: None,
                })),
                Some(Reply::NoAffiliation(name)) => Ok(Some(AuthorProfile {
                    name: name.to_string(),
                    affiliation: None,
                    organization: None,
                })),
                Some(Reply::Error) => Err(CitemapError::RateLimited(60)),
                None => Ok(None),
            }
        }
    }

    fn engine(source: &Arc<StubSource>, dir: &Path, max_retry_passes: u32) -> EnrichmentEngine {
        let client = EnrichmentClient::new(source.clone(), Strategy::Aggressive)
            .with_pacing(Duration::ZERO, Duration::ZERO);
        EnrichmentEngine::new(
            client,
            CheckpointStore::with_dir(dir.to_path_buf()),
            max_retry_passes,
        )
    }

    fn complete(outcome: RunOutcome) -> RunReport {
        match outcome {
            RunOutcome::Complete(report) => report,
            RunOutcome::Suspended { cursor, pass } => {
                panic!("expected complete run, suspended at cursor={} pass={}", cursor, pass)
            }
        }
    }

    #[tokio::test]
    async fn test_concrete_scenario() {
        // A and B are co-citing authors on the same paper pairing; B's
        // missing data is covered by A's success.
        let items = vec![
            WorkItem::new("a", "p1", "c1"),
            WorkItem::new("b", "p1", "c1"),
            WorkItem::new("c", "p2", "c1"),
        ];
        let source = Arc::new(StubSource::new(&[
            ("a", Reply::Affiliation("Alice", "MIT")),
            ("b", Reply::NoAffiliation("Bob")),
            ("c", Reply::Affiliation("Carl", "MIT")),
        ]));
        let tmp = TempDir::new().expect("temp dir");

        let report = complete(
            engine(&source, tmp.path(), 3)
                .run(&items)
                .await
                .expect("run"),
        );

        let expected: HashSet<AffiliationRecord> = [
            AffiliationRecord {
                author_name: "Alice".to_string(),
                citing_paper: "p1".to_string(),
                cited_paper: "c1".to_string(),
                affiliation: "MIT".to_string(),
            },
            AffiliationRecord {
                author_name: "Carl".to_string(),
                citing_paper: "p2".to_string(),
                cited_paper: "c1".to_string(),
                affiliation: "MIT".to_string(),
            },
        ]
        .into_iter()
        .collect();
        let got: HashSet<AffiliationRecord> = report.records.into_iter().collect();
        assert_eq!(got, expected);
        assert!(report.permanently_failed.is_empty());
        // B was queried once in pass 1 and never retried.
        assert_eq!(source.calls("b"), 1);
    }

    #[tokio::test]
    async fn test_sibling_propagation_retires_earlier_failure() {
        // The failing sibling comes first, so it is already outstanding when
        // the success lands.
        let items = vec![
            WorkItem::new("bad", "p1", "c1"),
            WorkItem::new("good", "p1", "c1"),
        ];
        let source = Arc::new(StubSource::new(&[
            ("bad", Reply::NoAffiliation("Bob")),
            ("good", Reply::Affiliation("Alice", "MIT")),
        ]));
        let tmp = TempDir::new().expect("temp dir");

        let report = complete(
            engine(&source, tmp.path(), 3)
                .run(&items)
                .await
                .expect("run"),
        );

        assert_eq!(report.records.len(), 1);
        assert!(report.permanently_failed.is_empty());
        assert_eq!(source.calls("bad"), 1);
    }

    #[tokio::test]
    async fn test_deduplication() {
        // Two different work items resolve to the same structural record.
        let items = vec![
            WorkItem::new("a1", "p1", "c1"),
            WorkItem::new("a2", "p1", "c1"),
        ];
        let source = Arc::new(StubSource::new(&[
            ("a1", Reply::Affiliation("Alice", "MIT")),
            ("a2", Reply::Affiliation("Alice", "MIT")),
        ]));
        let tmp = TempDir::new().expect("temp dir");

        let report = complete(
            engine(&source, tmp.path(), 3)
                .run(&items)
                .await
                .expect("run"),
        );

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].author_name, "Alice");
    }

    #[tokio::test]
    async fn test_bounded_retries() {
        let items = vec![
            WorkItem::new("f1", "p1", "c1"),
            WorkItem::new("f2", "p2", "c2"),
        ];
        let source = Arc::new(StubSource::new(&[
            ("f1", Reply::Error),
            ("f2", Reply::Error),
        ]));
        let tmp = TempDir::new().expect("temp dir");

        let report = complete(
            engine(&source, tmp.path(), 2)
                .run(&items)
                .await
                .expect("run"),
        );

        assert!(report.records.is_empty());
        assert_eq!(
            report.permanently_failed,
            vec![(0, items[0].clone()), (1, items[1].clone())]
        );
        // One scan attempt plus two retry passes each.
        assert_eq!(source.calls("f1"), 3);
        assert_eq!(source.calls("f2"), 3);
    }

    #[tokio::test]
    async fn test_sentinel_item_never_hits_source() {
        let items = vec![WorkItem::new(NO_AUTHOR_FOUND, "p1", "c1")];
        let source = Arc::new(StubSource::new(&[]));
        let tmp = TempDir::new().expect("temp dir");

        let report = complete(
            engine(&source, tmp.path(), 3)
                .run(&items)
                .await
                .expect("run"),
        );

        assert_eq!(report.records, vec![AffiliationRecord::sentinel(&items[0])]);
        assert_eq!(source.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_resume_never_requeries_completed_items() {
        let items = vec![
            WorkItem::new("a0", "p0", "c0"),
            WorkItem::new("a1", "p1", "c1"),
            WorkItem::new("a2", "p2", "c2"),
            WorkItem::new("a3", "p3", "c3"),
        ];
        let replies = [
            ("a0", Reply::Affiliation("N0", "Org0")),
            ("a1", Reply::Affiliation("N1", "Org1")),
            ("a2", Reply::Affiliation("N2", "Org2")),
            ("a3", Reply::Affiliation("N3", "Org3")),
        ];
        let tmp = TempDir::new().expect("temp dir");

        // First invocation: interrupted right after item 1's checkpoint.
        let cancel = CancellationToken::new();
        let source = Arc::new(StubSource::new(&replies).cancel_after("a1", cancel.clone()));
        let outcome = engine(&source, tmp.path(), 3)
            .with_cancellation(cancel)
            .run(&items)
            .await
            .expect("run");
        match outcome {
            RunOutcome::Suspended { cursor, .. } => assert_eq!(cursor, 2),
            RunOutcome::Complete(_) => panic!("expected suspension"),
        }
        assert_eq!(source.calls("a0"), 1);
        assert_eq!(source.calls("a1"), 1);
        assert_eq!(source.calls("a2"), 0);

        // Second invocation resumes and finishes without re-querying 0..=1.
        let report = complete(
            engine(&source, tmp.path(), 3)
                .run(&items)
                .await
                .expect("resumed run"),
        );
        assert_eq!(report.records.len(), 4);
        assert!(report.permanently_failed.is_empty());
        for id in ["a0", "a1", "a2", "a3"] {
            assert_eq!(source.calls(id), 1, "author {} queried more than once", id);
        }
    }

    #[tokio::test]
    async fn test_idempotent_finalize() {
        let items = vec![WorkItem::new("a1", "p1", "c1")];
        let source = Arc::new(StubSource::new(&[(
            "a1",
            Reply::Affiliation("Alice", "MIT"),
        )]));
        let tmp = TempDir::new().expect("temp dir");

        let first = complete(
            engine(&source, tmp.path(), 3)
                .run(&items)
                .await
                .expect("run"),
        );
        let calls_after_first = source.total_calls();

        let second = complete(
            engine(&source, tmp.path(), 3)
                .run(&items)
                .await
                .expect("re-run"),
        );

        assert_eq!(second.records, first.records);
        assert_eq!(source.total_calls(), calls_after_first);
    }

    #[tokio::test]
    async fn test_reconcile_recovers_dropped_item() {
        // A prior partial run satisfied item 0 but lost item 1 from both the
        // satisfied and outstanding sets.
        let items = vec![
            WorkItem::new("a0", "p0", "c0"),
            WorkItem::new("a1", "p1", "c1"),
        ];
        let source = Arc::new(StubSource::new(&[(
            "a1",
            Reply::Affiliation("N1", "Org1"),
        )]));
        let tmp = TempDir::new().expect("temp dir");

        let store = CheckpointStore::with_dir(tmp.path().to_path_buf());
        let mut stale = ProgressState::default();
        stale.records.push(AffiliationRecord {
            author_name: "N0".to_string(),
            citing_paper: "p0".to_string(),
            cited_paper: "c0".to_string(),
            affiliation: "Org0".to_string(),
        });
        stale.satisfied.insert(0);
        stale.cursor = items.len();
        store.save(&stale).expect("seed progress");

        let report = complete(
            engine(&source, tmp.path(), 3)
                .run(&items)
                .await
                .expect("run"),
        );

        assert_eq!(report.records.len(), 2);
        assert!(report.permanently_failed.is_empty());
        assert_eq!(source.calls("a0"), 0);
        assert_eq!(source.calls("a1"), 1);
    }

    #[tokio::test]
    async fn test_batched_checkpointing_saves_on_interrupt() {
        // With a wide save interval the scan rarely checkpoints, but an
        // interruption still persists the cursor before suspending.
        let items = vec![
            WorkItem::new("a0", "p0", "c0"),
            WorkItem::new("a1", "p1", "c1"),
            WorkItem::new("a2", "p2", "c2"),
        ];
        let replies = [
            ("a0", Reply::Affiliation("N0", "Org0")),
            ("a1", Reply::Affiliation("N1", "Org1")),
            ("a2", Reply::Affiliation("N2", "Org2")),
        ];
        let tmp = TempDir::new().expect("temp dir");

        let cancel = CancellationToken::new();
        let source = Arc::new(StubSource::new(&replies).cancel_after("a1", cancel.clone()));
        let outcome = engine(&source, tmp.path(), 3)
            .with_save_interval(100)
            .with_cancellation(cancel)
            .run(&items)
            .await
            .expect("run");
        assert!(matches!(outcome, RunOutcome::Suspended { cursor: 2, .. }));

        let report = complete(
            engine(&source, tmp.path(), 3)
                .with_save_interval(100)
                .run(&items)
                .await
                .expect("resumed run"),
        );
        assert_eq!(report.records.len(), 3);
        for id in ["a0", "a1", "a2"] {
            assert_eq!(source.calls(id), 1, "author {} queried more than once", id);
        }
    }

    #[tokio::test]
    async fn test_empty_work_list() {
        let source = Arc::new(StubSource::new(&[]));
        let tmp = TempDir::new().expect("temp dir");

        let report = complete(
            engine(&source, tmp.path(), 3)
                .run(&[])
                .await
                .expect("run"),
        );

        assert!(report.records.is_empty());
        assert!(report.permanently_failed.is_empty());
        assert_eq!(source.total_calls(), 0);
    }
}
