use super::*;

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use regwatch_shared::{
    AiInsight, BusinessImpact, CandidateRecord, FirmSize, InsightType, InteractionEvent,
    RecordId, RetryConfig, SourceKind, UrgencyLevel,
};
use regwatch_storage::{FileStore, LibsqlStore};
use tokio::sync::{Notify, mpsc};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StaticAdapter {
    records: Mutex<Vec<CandidateRecord>>,
    calls: Mutex<Vec<Instant>>,
    fail_first: AtomicUsize,
    error: Option<String>,
}

impl StaticAdapter {
    fn with(records: Vec<CandidateRecord>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            ..Default::default()
        })
    }

    fn broken(message: &str) -> Arc<Self> {
        Arc::new(Self {
            error: Some(message.to_string()),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    async fn fetch(&self, source: &SourceConfig, _limits: &SourceLimits) -> AdapterOutput {
        self.calls.lock().unwrap().push(Instant::now());
        if let Some(message) = &self.error {
            return AdapterOutput::failed(RegwatchError::adapter(&source.code, message.clone()));
        }
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return AdapterOutput::failed(RegwatchError::timeout("source too slow"));
        }
        AdapterOutput::ok(self.records.lock().unwrap().clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Blocks the `at`-th analyze call until released.
struct Gate {
    at: usize,
    reached: mpsc::UnboundedSender<()>,
    release: Arc<Notify>,
}

#[derive(Default)]
struct CountingEnricher {
    calls: Mutex<HashMap<String, u32>>,
    gate: Option<Gate>,
    fail: bool,
}

impl CountingEnricher {
    fn gated(at: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<()>, Arc<Notify>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let enricher = Arc::new(Self {
            gate: Some(Gate {
                at,
                reached: tx,
                release: release.clone(),
            }),
            ..Default::default()
        });
        (enricher, rx, release)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    fn calls_per_identity(&self) -> HashMap<String, u32> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnrichmentService for CountingEnricher {
    async fn analyze(&self, record: &NormalizedRecord) -> Result<Option<AiInsight>> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            *calls.entry(record.identity.clone()).or_default() += 1;
            calls.values().sum::<u32>() as usize
        };
        if let Some(gate) = &self.gate {
            if n == gate.at {
                let _ = gate.reached.send(());
                gate.release.notified().await;
            }
        }
        if self.fail {
            return Err(RegwatchError::Enrichment("model overloaded".into()));
        }
        Ok(Some(insight()))
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// File store whose n-th insert fails like a full disk.
struct FlakyStore {
    inner: FileStore,
    inserts: AtomicUsize,
    fail_on: AtomicUsize,
}

#[async_trait]
impl RecordStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }
    async fn get_update(&self, identity: &str) -> Result<Option<StoredUpdate>> {
        self.inner.get_update(identity).await
    }
    async fn get_update_by_id(&self, id: RecordId) -> Result<Option<StoredUpdate>> {
        self.inner.get_update_by_id(id).await
    }
    async fn insert_update(&self, update: &StoredUpdate) -> Result<()> {
        let n = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on.load(Ordering::SeqCst) {
            return Err(RegwatchError::Storage("disk full".into()));
        }
        self.inner.insert_update(update).await
    }
    async fn replace_update(&self, update: &StoredUpdate) -> Result<()> {
        self.inner.replace_update(update).await
    }
    async fn list_updates(&self) -> Result<Vec<StoredUpdate>> {
        self.inner.list_updates().await
    }
    async fn count_updates(&self) -> Result<u64> {
        self.inner.count_updates().await
    }
    async fn set_enrichment(&self, id: RecordId, insight: Option<&AiInsight>) -> Result<()> {
        self.inner.set_enrichment(id, insight).await
    }
    async fn set_relevance(&self, id: RecordId, profile_id: &str, score: f64) -> Result<()> {
        self.inner.set_relevance(id, profile_id, score).await
    }
    async fn invalidate_profile_scores(&self, profile_id: &str) -> Result<u64> {
        self.inner.invalidate_profile_scores(profile_id).await
    }
    async fn apply_feedback(&self, adjustments: &[FeedbackAdjustment]) -> Result<()> {
        self.inner.apply_feedback(adjustments).await
    }
    async fn feedback_for(&self, profile_id: &str) -> Result<Vec<FeedbackAdjustment>> {
        self.inner.feedback_for(profile_id).await
    }
    async fn record_interaction(&self, event: &InteractionEvent) -> Result<u64> {
        self.inner.record_interaction(event).await
    }
    async fn interactions_after(&self, after: Option<u64>) -> Result<Vec<(u64, InteractionEvent)>> {
        self.inner.interactions_after(after).await
    }
    async fn get_watermark(&self, name: &str) -> Result<Option<u64>> {
        self.inner.get_watermark(name).await
    }
    async fn set_watermark(&self, name: &str, seq: u64) -> Result<()> {
        self.inner.set_watermark(name, seq).await
    }
    async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        self.inner.save_run(run).await
    }
    async fn get_run(&self, run_id: RunId) -> Result<Option<PipelineRun>> {
        self.inner.get_run(run_id).await
    }
    async fn list_runs(&self) -> Result<Vec<PipelineRun>> {
        self.inner.list_runs().await
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn insight() -> AiInsight {
    AiInsight {
        insight_type: InsightType::Summary,
        confidence_score: 0.8,
        relevance_score: 0.6,
        urgency_level: UrgencyLevel::Medium,
        business_impact: BusinessImpact::default(),
        valid_until: None,
        summary: Some("Firms must review their disclosures.".into()),
    }
}

fn config(codes: &[&str]) -> AppConfig {
    let mut config = AppConfig::default();
    config.defaults.politeness_delay_ms = 0;
    config.retry = RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
    };
    config.sources = codes
        .iter()
        .map(|code| {
            SourceConfig::new(
                *code,
                SourceKind::Feed,
                vec![format!("https://{}.test/feed", code.to_ascii_lowercase())],
            )
        })
        .collect();
    config.profiles = vec![
        FirmProfile::new("acme", ["banking"], FirmSize::Medium),
        FirmProfile::new("globex", ["insurance"], FirmSize::Large),
    ];
    config
}

fn candidate(i: usize) -> CandidateRecord {
    CandidateRecord::new(
        format!("Notice {i}"),
        format!("https://a.test/notices/{i}"),
        "A",
        None,
    )
    .with_field("sectors", "banking")
}

fn file_store(dir: &tempfile::TempDir, name: &str) -> Arc<dyn RecordStore> {
    Arc::new(FileStore::open(&dir.path().join(name)).unwrap())
}

fn coordinator(
    config: AppConfig,
    store: Arc<dyn RecordStore>,
    adapters: Vec<(&str, Arc<StaticAdapter>)>,
    enricher: Option<Arc<CountingEnricher>>,
) -> IngestionCoordinator {
    let mut registry = AdapterRegistry::empty();
    for (code, adapter) in adapters {
        registry.register_source(code, adapter);
    }
    let mut builder = IngestionCoordinator::builder(config, store, registry);
    if let Some(enricher) = enricher {
        builder = builder.enrichment(enricher);
    }
    builder.build()
}

async fn finish(coord: &IngestionCoordinator, run_id: RunId) -> PipelineRun {
    tokio::time::timeout(Duration::from_secs(10), coord.wait(run_id))
        .await
        .expect("run stopped in time")
        .unwrap()
}

async fn identities(store: &Arc<dyn RecordStore>) -> BTreeSet<String> {
    store
        .list_updates()
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.record.identity)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mixed_batch_reports_counts_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn RecordStore> =
        Arc::new(LibsqlStore::open(&dir.path().join("regwatch.db")).await.unwrap());
    let cfg = config(&["A"]);

    let same = candidate(1);
    let original = candidate(2);
    let seed = DedupStore::new(store.clone());
    for c in [&same, &original] {
        seed.upsert(normalize(c, &cfg.sources[0]).unwrap()).await.unwrap();
    }

    let mut changed = original.clone();
    changed.headline = "Notice 2 (amended)".into();
    let mut invalid = candidate(9);
    invalid.url = String::new();

    let adapter = StaticAdapter::with(vec![candidate(3), same, changed, candidate(4), invalid]);
    let coord = coordinator(cfg, store.clone(), vec![("A", adapter)], None);

    let run = coord.run(RunKind::Incremental).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.stage_cursor, Stage::Done);
    assert!(run.finished_at.is_some());
    assert_eq!(
        run.per_source_counts["A"],
        SourceCounts {
            fetched: 5,
            new: 2,
            updated: 1,
            unchanged: 1,
            errors: 1,
            enrichment_failures: 0,
        }
    );
    assert_eq!(store.count_updates().await.unwrap(), 4);

    let amended = store.get_update("https://a.test/notices/2").await.unwrap().unwrap();
    assert_eq!(amended.record.headline, "Notice 2 (amended)");
    assert!(amended.relevance_cache.contains_key("acme"));
    let recorded = store.get_run(run.run_id).await.unwrap().unwrap();
    assert_eq!(recorded.status, RunStatus::Completed);
    assert_eq!(recorded.per_source_counts, run.per_source_counts);
}

#[tokio::test]
async fn pause_and_resume_process_each_item_once() {
    let dir = tempfile::tempdir().unwrap();
    let items: Vec<_> = (0..8).map(candidate).collect();

    let store = file_store(&dir, "paused.json");
    let (enricher, mut reached, release) = CountingEnricher::gated(3);
    let coord = coordinator(
        config(&["A"]),
        store.clone(),
        vec![("A", StaticAdapter::with(items.clone()))],
        Some(enricher.clone()),
    );

    let run_id = coord.start(RunKind::Incremental).await.unwrap();
    reached.recv().await.unwrap();
    let paused = coord.pause(Some(run_id)).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    release.notify_one();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(enricher.total_calls(), 3);
    assert_eq!(store.count_updates().await.unwrap(), 3);
    let report = coord.status(Some(run_id)).await.unwrap();
    assert_eq!(report.run.status, RunStatus::Paused);
    assert_eq!(report.items.done, 3);

    coord.resume(Some(run_id)).await.unwrap();
    let run = finish(&coord, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.per_source_counts["A"].fetched, 8);
    assert_eq!(run.per_source_counts["A"].new, 8);
    assert!(enricher.calls_per_identity().values().all(|n| *n == 1));
    assert_eq!(enricher.total_calls(), 8);

    // Same final set as an uninterrupted run.
    let baseline_store = file_store(&dir, "baseline.json");
    let baseline = coordinator(
        config(&["A"]),
        baseline_store.clone(),
        vec![("A", StaticAdapter::with(items))],
        Some(Arc::new(CountingEnricher::default())),
    );
    baseline.run(RunKind::Incremental).await.unwrap();
    assert_eq!(identities(&store).await, identities(&baseline_store).await);
}

#[tokio::test]
async fn cancel_stops_between_items_and_keeps_persisted_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir, "cancel.json");
    let (enricher, mut reached, release) = CountingEnricher::gated(2);
    let coord = coordinator(
        config(&["A"]),
        store.clone(),
        vec![("A", StaticAdapter::with((0..5).map(candidate).collect()))],
        Some(enricher),
    );

    let run_id = coord.start(RunKind::Incremental).await.unwrap();
    reached.recv().await.unwrap();
    coord.cancel(None).await.unwrap();
    release.notify_one();

    let run = finish(&coord, run_id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.finished_at.is_some());
    assert_eq!(store.count_updates().await.unwrap(), 2);

    let err = coord.resume(Some(run_id)).await.unwrap_err();
    assert!(matches!(err, RegwatchError::InvalidTransition { .. }));
}

#[tokio::test]
async fn failed_run_resumes_without_redoing_finished_items() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyStore {
        inner: FileStore::open(&dir.path().join("flaky.json")).unwrap(),
        inserts: AtomicUsize::new(0),
        fail_on: AtomicUsize::new(3),
    });
    let store: Arc<dyn RecordStore> = flaky.clone();
    let coord = coordinator(
        config(&["A"]),
        store.clone(),
        vec![("A", StaticAdapter::with((0..4).map(candidate).collect()))],
        None,
    );

    let failed = coord.run(RunKind::Incremental).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.last_error.as_deref().unwrap_or_default().contains("disk full"));
    assert_eq!(failed.per_source_counts["A"].new, 2);
    assert_eq!(store.count_updates().await.unwrap(), 2);

    flaky.fail_on.store(usize::MAX, Ordering::SeqCst);
    coord.resume(Some(failed.run_id)).await.unwrap();
    let run = finish(&coord, failed.run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.per_source_counts["A"].fetched, 4);
    assert_eq!(run.per_source_counts["A"].new, 4);
    assert_eq!(store.count_updates().await.unwrap(), 4);
    // Two first-run inserts, the failed one, its retry, and the last item.
    assert_eq!(flaky.inserts.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn resumed_run_tolerates_a_shifted_source_listing() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyStore {
        inner: FileStore::open(&dir.path().join("shifted.json")).unwrap(),
        inserts: AtomicUsize::new(0),
        fail_on: AtomicUsize::new(3),
    });
    let store: Arc<dyn RecordStore> = flaky.clone();
    let adapter = StaticAdapter::with((0..4).map(candidate).collect());
    let coord = coordinator(config(&["A"]), store.clone(), vec![("A", adapter.clone())], None);

    let failed = coord.run(RunKind::Incremental).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    let report = coord.status(Some(failed.run_id)).await.unwrap();
    assert_eq!(report.items.done, 2);
    assert_eq!(report.items.failed, 1);
    let issue = &report.items.issues[0];
    assert_eq!(issue.item, "A:https://a.test/notices/2");
    assert_eq!(issue.state, ItemState::Failed);
    assert!(issue.error.as_deref().unwrap_or_default().contains("disk full"));

    // A new announcement lands at the top of the feed before the resume.
    adapter.records.lock().unwrap().insert(0, candidate(10));
    flaky.fail_on.store(usize::MAX, Ordering::SeqCst);
    coord.resume(Some(failed.run_id)).await.unwrap();
    let run = finish(&coord, failed.run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    let counts = run.per_source_counts["A"];
    assert_eq!(counts.fetched, 5);
    assert_eq!(counts.new, 5);
    assert_eq!(counts.unchanged, 0);
    assert_eq!(counts.errors, 0);
    assert_eq!(store.count_updates().await.unwrap(), 5);
    // Two first-run inserts, the failed one, then items 10, 2 and 3.
    assert_eq!(flaky.inserts.load(Ordering::SeqCst), 6);

    let report = coord.status(Some(run.run_id)).await.unwrap();
    assert_eq!(report.items.done, 5);
    assert!(report.items.issues.is_empty());
}

#[tokio::test]
async fn run_resumed_by_a_new_coordinator_restarts_its_counts() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyStore {
        inner: FileStore::open(&dir.path().join("restart.json")).unwrap(),
        inserts: AtomicUsize::new(0),
        fail_on: AtomicUsize::new(3),
    });
    let store: Arc<dyn RecordStore> = flaky.clone();
    let items: Vec<_> = (0..4).map(candidate).collect();

    let first = coordinator(
        config(&["A"]),
        store.clone(),
        vec![("A", StaticAdapter::with(items.clone()))],
        None,
    );
    let failed = first.run(RunKind::Incremental).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    drop(first);

    flaky.fail_on.store(usize::MAX, Ordering::SeqCst);
    let second = coordinator(
        config(&["A"]),
        store.clone(),
        vec![("A", StaticAdapter::with(items))],
        None,
    );
    second.resume(Some(failed.run_id)).await.unwrap();
    let run = finish(&second, failed.run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    let counts = run.per_source_counts["A"];
    assert_eq!(counts.fetched, 4);
    assert_eq!(counts.new, 2);
    assert_eq!(counts.unchanged, 2);
    assert_eq!(store.count_updates().await.unwrap(), 4);
}

#[tokio::test]
async fn store_write_failure_mid_run_is_resumed_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("real.json");
    let store = file_store(&dir, "real.json");
    let (enricher, mut reached, release) = CountingEnricher::gated(2);
    let coord = coordinator(
        config(&["A"]),
        store.clone(),
        vec![("A", StaticAdapter::with((0..3).map(candidate).collect()))],
        Some(enricher.clone()),
    );

    let run_id = coord.start(RunKind::Incremental).await.unwrap();
    reached.recv().await.unwrap();
    // Item 1 is stored and being analyzed; its insight write will hit a
    // directory where the snapshot's temp file goes.
    let blocker = dir.path().join("real.json.tmp");
    std::fs::create_dir(&blocker).unwrap();
    release.notify_one();

    let failed = finish(&coord, run_id).await;
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.per_source_counts["A"].new, 2);
    let stalled = store.get_update("https://a.test/notices/1").await.unwrap().unwrap();
    assert!(stalled.enrichment.is_none());

    std::fs::remove_dir(&blocker).unwrap();
    coord.resume(Some(run_id)).await.unwrap();
    let run = finish(&coord, run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    let counts = run.per_source_counts["A"];
    assert_eq!(counts.fetched, 3);
    assert_eq!(counts.new, 3);
    assert_eq!(counts.errors, 0);

    let calls = enricher.calls_per_identity();
    assert_eq!(calls["https://a.test/notices/0"], 1);
    assert_eq!(calls["https://a.test/notices/1"], 2);
    assert_eq!(calls["https://a.test/notices/2"], 1);

    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let updates = on_disk["updates"].as_object().unwrap();
    assert_eq!(updates.len(), 3);
    for update in updates.values() {
        assert!(!update["enrichment"].is_null(), "{update}");
        assert_eq!(update["relevance_cache"].as_object().unwrap().len(), 2);
    }
}

#[tokio::test]
async fn enrichment_failure_leaves_record_persisted_and_scored() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir, "enrich.json");
    let enricher = Arc::new(CountingEnricher {
        fail: true,
        ..Default::default()
    });
    let coord = coordinator(
        config(&["A"]),
        store.clone(),
        vec![("A", StaticAdapter::with(vec![candidate(1), candidate(2)]))],
        Some(enricher.clone()),
    );

    let run = coord.run(RunKind::Incremental).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.per_source_counts["A"].enrichment_failures, 2);
    assert_eq!(run.per_source_counts["A"].errors, 0);
    // Retried up to the cap.
    assert!(enricher.calls_per_identity().values().all(|n| *n == 3));

    for update in store.list_updates().await.unwrap() {
        assert!(update.enrichment.is_none());
        assert_eq!(update.relevance_cache.len(), 2);
    }
}

#[tokio::test]
async fn source_failures_are_counted_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir, "sources.json");
    let coord = coordinator(
        config(&["A", "B"]),
        store.clone(),
        vec![
            ("A", StaticAdapter::with(vec![candidate(1), candidate(2)])),
            ("B", StaticAdapter::broken("HTTP 404")),
        ],
        None,
    );

    let run = coord.run(RunKind::Full).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.per_source_counts["A"].new, 2);
    assert_eq!(run.per_source_counts["B"].errors, 1);
    assert_eq!(run.per_source_counts["B"].fetched, 0);
}

#[tokio::test]
async fn transient_source_failure_is_retried_politely() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&["A"]);
    cfg.sources[0].politeness_delay_ms = Some(40);
    let adapter = Arc::new(StaticAdapter {
        records: Mutex::new(vec![candidate(1)]),
        fail_first: AtomicUsize::new(1),
        ..Default::default()
    });
    let coord = coordinator(cfg, file_store(&dir, "polite.json"), vec![("A", adapter.clone())], None);

    let run = coord.run(RunKind::Incremental).await.unwrap();
    assert_eq!(run.per_source_counts["A"].new, 1);
    assert_eq!(run.per_source_counts["A"].errors, 0);

    let calls = adapter.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert!(calls[1] - calls[0] >= Duration::from_millis(40));
}

#[tokio::test]
async fn only_one_active_run() {
    let dir = tempfile::tempdir().unwrap();
    let (enricher, mut reached, release) = CountingEnricher::gated(1);
    let coord = coordinator(
        config(&["A"]),
        file_store(&dir, "single.json"),
        vec![("A", StaticAdapter::with(vec![candidate(1)]))],
        Some(enricher),
    );

    let run_id = coord.start(RunKind::Incremental).await.unwrap();
    reached.recv().await.unwrap();
    let err = coord.start(RunKind::Full).await.unwrap_err();
    assert!(matches!(err, RegwatchError::InvalidTransition { .. }));
    assert_eq!(coord.current(), Some(run_id));

    release.notify_one();
    assert_eq!(finish(&coord, run_id).await.status, RunStatus::Completed);
    assert!(coord.start(RunKind::Incremental).await.is_ok());
}

#[tokio::test]
async fn backfill_rejects_stages_that_need_source_data() {
    let dir = tempfile::tempdir().unwrap();
    let coord = coordinator(config(&["A"]), file_store(&dir, "reject.json"), vec![], None);

    for stage in [Stage::Fetch, Stage::Normalize, Stage::Dedup] {
        let err = coord.backfill(stage, false).await.unwrap_err();
        assert!(matches!(err, RegwatchError::Validation { .. }), "{stage}");
    }
    // Enrichment is not configured.
    let err = coord.backfill(Stage::Enrich, false).await.unwrap_err();
    assert!(matches!(err, RegwatchError::Config { .. }));
}

#[tokio::test]
async fn enrich_backfill_can_skip_enriched_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir, "backfill.json");
    let cfg = config(&["A"]);
    let seed = DedupStore::new(store.clone());
    let mut ids = Vec::new();
    for i in 0..3 {
        let (_, update) = seed
            .upsert(normalize(&candidate(i), &cfg.sources[0]).unwrap())
            .await
            .unwrap();
        ids.push(update.id);
    }
    store.set_enrichment(ids[0], Some(&insight())).await.unwrap();

    let enricher = Arc::new(CountingEnricher::default());
    let coord = coordinator(cfg, store.clone(), vec![], Some(enricher.clone()));

    let run_id = coord.backfill(Stage::Enrich, true).await.unwrap();
    let run = finish(&coord, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(enricher.total_calls(), 2);
    assert_eq!(run.per_source_counts["A"].updated, 2);
    assert_eq!(run.per_source_counts["A"].unchanged, 1);
    assert_eq!(run.per_source_counts["A"].fetched, 0);

    for update in store.list_updates().await.unwrap() {
        assert!(update.enrichment.is_some());
    }
}

#[tokio::test]
async fn score_backfill_fills_every_profile_cache() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir, "score.json");
    let cfg = config(&["A"]);
    let seed = DedupStore::new(store.clone());
    for i in 0..2 {
        seed.upsert(normalize(&candidate(i), &cfg.sources[0]).unwrap())
            .await
            .unwrap();
    }

    let coord = coordinator(cfg, store.clone(), vec![], None);
    let run_id = coord.backfill(Stage::Score, false).await.unwrap();
    let run = finish(&coord, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.stage_cursor, Stage::Done);

    for update in store.list_updates().await.unwrap() {
        let acme = update.relevance_cache["acme"];
        let globex = update.relevance_cache["globex"];
        assert!((0.0..=1.0).contains(&acme));
        assert!(acme > globex, "banking record should favour the banking profile");
    }
}

#[tokio::test]
async fn status_jobs_and_stats() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir, "stats.json");
    let coord = coordinator(
        config(&["A"]),
        store,
        vec![("A", StaticAdapter::with(vec![candidate(1), candidate(2)]))],
        None,
    );

    assert!(matches!(
        coord.status(None).await.unwrap_err(),
        RegwatchError::NotFound { .. }
    ));

    let first = coord.run(RunKind::Incremental).await.unwrap();
    let second = coord.run(RunKind::Incremental).await.unwrap();
    assert_eq!(second.per_source_counts["A"].unchanged, 2);

    let report = coord.status(None).await.unwrap();
    assert_eq!(report.run.run_id, second.run_id);
    assert_eq!(report.totals.unchanged, 2);
    assert!(report.elapsed_secs >= 0.0);

    let jobs = coord.jobs().await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().any(|j| j.run_id == first.run_id));

    let stats = coord.stats().await.unwrap();
    assert_eq!(stats.total_runs, 2);
    assert_eq!(stats.runs_by_status.get("completed"), Some(&2));
    assert_eq!(stats.totals.new, 2);
    assert_eq!(stats.totals.unchanged, 2);
    assert_eq!(stats.stored_updates, 2);
    assert_eq!(stats.backend, "file");

    let missing = coord.status(Some(RunId::new())).await.unwrap_err();
    assert!(matches!(missing, RegwatchError::NotFound { .. }));
}
