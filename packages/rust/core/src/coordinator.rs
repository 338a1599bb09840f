//! Ingestion coordinator.
//!
//! Drives the source adapters through the stage pipeline:
//! discover → fetch → normalize → dedup → persist → enrich → score → done.
//!
//! Each run is an explicit [`PipelineRun`] with its own status and control
//! channel, so several runs (one active at a time) can be inspected side by
//! side. Sources run in parallel on a bounded worker pool; calls to the same
//! source are serialized with a politeness delay. Within a source, items are
//! processed in discovery order, and pause/cancel are honored between items.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use regwatch_shared::{
    AppConfig, FeedbackAdjustment, FirmProfile, NormalizedRecord, PipelineRun, RegwatchError,
    Result, RunId, RunKind, RunStatus, SourceConfig, SourceCounts, SourceLimits, Stage,
    StoredUpdate, TransientKind, UpsertOutcome,
};
use regwatch_sources::{AdapterOutput, AdapterRegistry, SourceAdapter, run_adapter};
use regwatch_storage::{DedupStore, RecordStore, open_store};

use crate::enrichment::{EnrichmentService, HttpEnrichmentService};
use crate::normalize::normalize;
use crate::progress::{ProgressReporter, SilentProgress};
use crate::retry::RetryPolicy;
use crate::scoring::RelevanceScorer;
use crate::state::{ItemState, ItemTracker, check_run_transition};
use crate::urgency::apply_heuristic;

/// Feedback adjustments per profile id, loaded once per run.
type FeedbackByProfile = HashMap<String, Vec<FeedbackAdjustment>>;

// ---------------------------------------------------------------------------
// Run handles
// ---------------------------------------------------------------------------

/// What workers should do at the next item boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
    /// A worker hit a run-level error; the others stop too.
    Abort,
}

/// How an item enters processing.
enum Admission {
    /// First sight in this run.
    Fresh,
    /// Seen before and left mid-pipeline; continue from this state.
    Resumed(ItemState),
    /// Out of retries.
    Died,
    /// Already `done` or `dead`.
    Skip,
}

/// Item counts by state for one run, plus the items that went wrong.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ItemSummary {
    pub done: u64,
    pub dead: u64,
    pub failed: u64,
    pub in_flight: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ItemIssue>,
}

/// A `failed` or `dead` item and the error that put it there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemIssue {
    pub item: String,
    pub state: ItemState,
    pub retries: u32,
    pub error: Option<String>,
}

struct RunHandle {
    run: std::sync::Mutex<PipelineRun>,
    items: std::sync::Mutex<HashMap<String, ItemTracker>>,
    control: watch::Sender<Control>,
    /// `Some(status)` once the executing task has stopped.
    outcome: watch::Sender<Option<RunStatus>>,
}

impl RunHandle {
    fn new(run: PipelineRun) -> Self {
        Self {
            run: std::sync::Mutex::new(run),
            items: std::sync::Mutex::new(HashMap::new()),
            control: watch::Sender::new(Control::Run),
            outcome: watch::Sender::new(None),
        }
    }

    fn with_run<R>(&self, f: impl FnOnce(&mut PipelineRun) -> R) -> R {
        let mut run = self.run.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut run)
    }

    fn with_items<R>(&self, f: impl FnOnce(&mut HashMap<String, ItemTracker>) -> R) -> R {
        let mut items = self.items.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut items)
    }

    fn run_id(&self) -> RunId {
        self.with_run(|r| r.run_id)
    }

    fn snapshot(&self) -> PipelineRun {
        self.with_run(|r| r.clone())
    }

    fn status(&self) -> RunStatus {
        self.with_run(|r| r.status)
    }

    fn count(&self, source: &str, f: impl FnOnce(&mut SourceCounts)) {
        self.with_run(|r| f(r.counts_mut(source)));
    }

    /// Apply a lifecycle transition through the run table.
    fn transition(&self, to: RunStatus) -> Result<RunStatus> {
        self.with_run(|r| {
            let from = r.status;
            check_run_transition(from, to)?;
            r.status = to;
            match to {
                RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed => {
                    r.finished_at = Some(Utc::now());
                }
                RunStatus::Running => r.finished_at = None,
                _ => {}
            }
            Ok(from)
        })
    }

    /// The cursor only moves forward.
    fn advance_cursor(&self, stage: Stage) {
        self.with_run(|r| r.stage_cursor = r.stage_cursor.max(stage));
    }

    fn admit(&self, key: &str, start: ItemState, max_retries: u32) -> Result<Admission> {
        self.with_items(|items| match items.get_mut(key) {
            None => {
                let tracker = if start <= ItemState::Fetched {
                    let mut t = ItemTracker::new(max_retries);
                    t.advance(ItemState::Fetched)?;
                    t
                } else {
                    ItemTracker::starting_at(start, max_retries)
                };
                items.insert(key.to_string(), tracker);
                Ok(Admission::Fresh)
            }
            Some(t) if t.state().is_terminal() => Ok(Admission::Skip),
            Some(t) if t.state() == ItemState::Failed => match t.retry()? {
                ItemState::Dead => Ok(Admission::Died),
                state => Ok(Admission::Resumed(state)),
            },
            Some(t) => Ok(Admission::Resumed(t.state())),
        })
    }

    fn advance_item(&self, key: &str, next: ItemState) -> Result<()> {
        self.with_items(|items| match items.get_mut(key) {
            Some(t) => t.advance(next),
            None => Err(RegwatchError::not_found(format!("item {key}"))),
        })
    }

    fn fail_item(&self, key: &str, reason: &RegwatchError) {
        self.with_items(|items| {
            if let Some(t) = items.get_mut(key) {
                if let Err(e) = t.fail(reason.to_string()) {
                    debug!(item = key, error = %e, "item could not be marked failed");
                }
            }
        });
    }

    fn kill_item(&self, key: &str, reason: &RegwatchError) {
        self.with_items(|items| {
            if let Some(t) = items.get_mut(key) {
                if let Err(e) = t.kill(reason.to_string()) {
                    debug!(item = key, error = %e, "item could not be marked dead");
                }
            }
        });
    }

    fn item_summary(&self) -> ItemSummary {
        self.with_items(|items| {
            let mut summary = ItemSummary::default();
            for (key, t) in items.iter() {
                match t.state() {
                    ItemState::Done => summary.done += 1,
                    ItemState::Dead => summary.dead += 1,
                    ItemState::Failed => summary.failed += 1,
                    _ => summary.in_flight += 1,
                }
                if matches!(t.state(), ItemState::Dead | ItemState::Failed) {
                    summary.issues.push(ItemIssue {
                        item: key.clone(),
                        state: t.state(),
                        retries: t.retries(),
                        error: t.last_error().map(str::to_string),
                    });
                }
            }
            summary.issues.sort_by(|a, b| a.item.cmp(&b.item));
            summary
        })
    }
}

/// Block while paused. `false` means stop: the run was cancelled or aborted.
async fn checkpoint(control: &mut watch::Receiver<Control>) -> bool {
    loop {
        let current = *control.borrow_and_update();
        match current {
            Control::Run => return true,
            Control::Cancel | Control::Abort => return false,
            Control::Pause => {
                if control.changed().await.is_err() {
                    return false;
                }
            }
        }
    }
}

/// At most one run may be pending, running or paused.
fn no_active_run(runs: &HashMap<RunId, Arc<RunHandle>>, except: Option<RunId>) -> Result<()> {
    for (id, handle) in runs {
        if Some(*id) == except {
            continue;
        }
        let status = handle.status();
        if status.is_active() {
            return Err(RegwatchError::invalid_transition(
                format!("run {id} ({status})"),
                "a second active run",
            ));
        }
    }
    Ok(())
}

/// Errors that mean storage itself is gone, not just one bad record.
fn is_run_level(err: &RegwatchError) -> bool {
    matches!(
        err,
        RegwatchError::Storage(_)
            | RegwatchError::Io { .. }
            | RegwatchError::Transient {
                kind: TransientKind::StorageUnavailable,
                ..
            }
    )
}

// ---------------------------------------------------------------------------
// Politeness
// ---------------------------------------------------------------------------

/// Serializes calls per source with a minimum gap between them.
#[derive(Default)]
struct Pacer {
    slots: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Instant>>>>>,
}

impl Pacer {
    async fn call(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        source: &SourceConfig,
        limits: SourceLimits,
    ) -> AdapterOutput {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.entry(source.code.clone()).or_default().clone()
        };
        let mut last = slot.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + limits.politeness_delay).await;
        }
        let output = run_adapter(adapter, source, limits).await;
        *last = Some(Instant::now());
        output
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// `status(run_id)` payload.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(flatten)]
    pub run: PipelineRun,
    pub totals: SourceCounts,
    pub elapsed_secs: f64,
    pub items: ItemSummary,
}

/// `stats()` payload: historical aggregates over every recorded run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub backend: String,
    pub stored_updates: u64,
    pub total_runs: u64,
    pub runs_by_status: BTreeMap<String, u64>,
    pub totals: SourceCounts,
    pub per_source: BTreeMap<String, SourceCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Inner {
    config: AppConfig,
    store: Arc<dyn RecordStore>,
    dedup: DedupStore,
    registry: AdapterRegistry,
    enricher: Option<Arc<dyn EnrichmentService>>,
    scorer: RelevanceScorer,
    profiles: Vec<FirmProfile>,
    retry: RetryPolicy,
    progress: Arc<dyn ProgressReporter>,
    pacer: Pacer,
    runs: std::sync::Mutex<HashMap<RunId, Arc<RunHandle>>>,
    current: std::sync::Mutex<Option<RunId>>,
}

/// Cheap to clone; all clones drive the same runs.
#[derive(Clone)]
pub struct IngestionCoordinator {
    inner: Arc<Inner>,
}

pub struct CoordinatorBuilder {
    config: AppConfig,
    store: Arc<dyn RecordStore>,
    registry: AdapterRegistry,
    enricher: Option<Arc<dyn EnrichmentService>>,
    progress: Arc<dyn ProgressReporter>,
}

impl CoordinatorBuilder {
    pub fn enrichment(mut self, service: Arc<dyn EnrichmentService>) -> Self {
        self.enricher = Some(service);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn build(self) -> IngestionCoordinator {
        let profiles = self.config.normalized_profiles();
        let inner = Inner {
            scorer: RelevanceScorer::new(self.config.scoring.clone()),
            retry: RetryPolicy::from(&self.config.retry),
            dedup: DedupStore::new(self.store.clone()),
            store: self.store,
            registry: self.registry,
            enricher: self.enricher,
            progress: self.progress,
            profiles,
            pacer: Pacer::default(),
            runs: std::sync::Mutex::new(HashMap::new()),
            current: std::sync::Mutex::new(None),
            config: self.config,
        };
        IngestionCoordinator {
            inner: Arc::new(inner),
        }
    }
}

impl IngestionCoordinator {
    pub fn builder(
        config: AppConfig,
        store: Arc<dyn RecordStore>,
        registry: AdapterRegistry,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            store,
            registry,
            enricher: None,
            progress: Arc::new(SilentProgress),
        }
    }

    /// Wire up the configured store, the built-in adapters and, when an
    /// endpoint is configured, the HTTP enrichment service.
    pub async fn from_config(config: AppConfig) -> Result<CoordinatorBuilder> {
        config.validate()?;
        let store = open_store(&config.storage).await?;
        let registry = AdapterRegistry::new()?;
        let enricher = HttpEnrichmentService::from_config(&config.enrichment)?;
        let mut builder = Self::builder(config, store, registry);
        if let Some(service) = enricher {
            builder = builder.enrichment(Arc::new(service));
        }
        Ok(builder)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    // -- lifecycle ------------------------------------------------------------

    /// Start a run in the background and return its id.
    pub async fn start(&self, kind: RunKind) -> Result<RunId> {
        let handle = self.admit_run(kind).await?;
        let run_id = handle.run_id();
        let this = self.clone();
        tokio::spawn(async move { this.execute(handle).await });
        Ok(run_id)
    }

    /// Run to the end on the current task.
    pub async fn run(&self, kind: RunKind) -> Result<PipelineRun> {
        let handle = self.admit_run(kind).await?;
        self.execute(handle.clone()).await;
        Ok(handle.snapshot())
    }

    /// Start a single-stage replay over stored records.
    ///
    /// Only `enrich` and `score` can be replayed; earlier stages need fresh
    /// source data, which a full run provides.
    pub async fn backfill(&self, stage: Stage, missing_only: bool) -> Result<RunId> {
        self.start(RunKind::Backfill {
            stage,
            missing_only,
        })
        .await
    }

    /// Wait for a run's executing task to stop, then return the run.
    pub async fn wait(&self, run_id: RunId) -> Result<PipelineRun> {
        let handle = self.handle(Some(run_id))?;
        let mut outcome = handle.outcome.subscribe();
        outcome
            .wait_for(|o| o.is_some())
            .await
            .map_err(|_| RegwatchError::not_found(format!("run {run_id}")))?;
        Ok(handle.snapshot())
    }

    /// Freeze the run between items. In-flight items finish first.
    pub async fn pause(&self, run_id: Option<RunId>) -> Result<PipelineRun> {
        let handle = self.handle(run_id)?;
        handle.transition(RunStatus::Paused)?;
        handle.control.send_replace(Control::Pause);
        info!(run_id = %handle.run_id(), "run paused");
        self.persist_run(&handle).await;
        Ok(handle.snapshot())
    }

    /// Continue a paused run, or restart a failed one from its durable state.
    pub async fn resume(&self, run_id: Option<RunId>) -> Result<PipelineRun> {
        let handle = match self.handle(run_id) {
            Ok(handle) => handle,
            Err(e) => match run_id {
                Some(id) => self.rehydrate(id).await?,
                None => return Err(e),
            },
        };
        match handle.status() {
            RunStatus::Paused => {
                handle.transition(RunStatus::Running)?;
                handle.control.send_replace(Control::Run);
                info!(run_id = %handle.run_id(), "run resumed");
                self.persist_run(&handle).await;
            }
            RunStatus::Failed => {
                self.ensure_no_active_run(Some(handle.run_id()))?;
                handle.outcome.send_replace(None);
                self.set_current(handle.run_id());
                info!(run_id = %handle.run_id(), "resuming failed run");
                let this = self.clone();
                let task_handle = handle.clone();
                tokio::spawn(async move { this.execute(task_handle).await });
            }
            other => return Err(RegwatchError::invalid_transition(other, RunStatus::Running)),
        }
        Ok(handle.snapshot())
    }

    /// Stop the run between items. Persisted records stay persisted.
    pub async fn cancel(&self, run_id: Option<RunId>) -> Result<PipelineRun> {
        let handle = self.handle(run_id)?;
        let from = handle.transition(RunStatus::Cancelled)?;
        handle.control.send_replace(Control::Cancel);
        if from == RunStatus::Failed {
            // No task is executing it.
            handle.outcome.send_replace(Some(RunStatus::Cancelled));
        }
        info!(run_id = %handle.run_id(), "run cancelled");
        self.persist_run(&handle).await;
        Ok(handle.snapshot())
    }

    // -- queries --------------------------------------------------------------

    pub fn current(&self) -> Option<RunId> {
        *self.inner.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cursor, counts and elapsed time for a run (the current or latest one by default).
    pub async fn status(&self, run_id: Option<RunId>) -> Result<RunReport> {
        let (run, items) = match self.handle(run_id) {
            Ok(handle) => (handle.snapshot(), handle.item_summary()),
            Err(_) => {
                let run = match run_id {
                    Some(id) => self.inner.store.get_run(id).await?,
                    None => self.inner.store.list_runs().await?.into_iter().next(),
                };
                let run = run.ok_or_else(|| match run_id {
                    Some(id) => RegwatchError::not_found(format!("run {id}")),
                    None => RegwatchError::not_found("runs: none recorded yet"),
                })?;
                (run, ItemSummary::default())
            }
        };
        let elapsed = run.elapsed(Utc::now());
        Ok(RunReport {
            totals: run.totals(),
            elapsed_secs: elapsed.num_milliseconds() as f64 / 1000.0,
            items,
            run,
        })
    }

    /// Every recorded run, newest first, with live runs at their latest state.
    pub async fn jobs(&self) -> Result<Vec<PipelineRun>> {
        let mut runs = self.inner.store.list_runs().await?;
        let live: HashMap<RunId, PipelineRun> = {
            let handles = self.inner.runs.lock().unwrap_or_else(|p| p.into_inner());
            handles.iter().map(|(id, h)| (*id, h.snapshot())).collect()
        };
        for run in &mut runs {
            if let Some(fresh) = live.get(&run.run_id) {
                *run = fresh.clone();
            }
        }
        Ok(runs)
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        let runs = self.jobs().await?;
        let mut runs_by_status = BTreeMap::new();
        let mut per_source: BTreeMap<String, SourceCounts> = BTreeMap::new();
        for run in &runs {
            *runs_by_status.entry(run.status.to_string()).or_insert(0) += 1;
            for (source, counts) in &run.per_source_counts {
                per_source.entry(source.clone()).or_default().add(counts);
            }
        }
        let mut totals = SourceCounts::default();
        for counts in per_source.values() {
            totals.add(counts);
        }
        Ok(PipelineStats {
            backend: self.inner.store.backend().to_string(),
            stored_updates: self.inner.store.count_updates().await?,
            total_runs: runs.len() as u64,
            runs_by_status,
            totals,
            per_source,
            last_run_at: runs.first().map(|r| r.started_at),
        })
    }

    // -- bookkeeping ----------------------------------------------------------

    fn handle(&self, run_id: Option<RunId>) -> Result<Arc<RunHandle>> {
        let id = match run_id.or_else(|| self.current()) {
            Some(id) => id,
            None => return Err(RegwatchError::not_found("active run")),
        };
        let runs = self.inner.runs.lock().unwrap_or_else(|p| p.into_inner());
        runs.get(&id)
            .cloned()
            .ok_or_else(|| RegwatchError::not_found(format!("run {id}")))
    }

    fn set_current(&self, run_id: RunId) {
        *self.inner.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(run_id);
    }

    fn ensure_no_active_run(&self, except: Option<RunId>) -> Result<()> {
        let runs = self.inner.runs.lock().unwrap_or_else(|p| p.into_inner());
        no_active_run(&runs, except)
    }

    async fn admit_run(&self, kind: RunKind) -> Result<Arc<RunHandle>> {
        if let RunKind::Backfill { stage, .. } = kind {
            if !stage.is_backfillable() {
                return Err(RegwatchError::validation(format!(
                    "stage '{stage}' cannot be backfilled; use a full run"
                )));
            }
            if stage == Stage::Enrich && self.inner.enricher.is_none() {
                return Err(RegwatchError::config(
                    "enrichment backfill needs [enrichment].endpoint",
                ));
            }
        }
        let run = PipelineRun::new(kind);
        let run_id = run.run_id;
        let handle = Arc::new(RunHandle::new(run));
        {
            let mut runs = self.inner.runs.lock().unwrap_or_else(|p| p.into_inner());
            no_active_run(&runs, None)?;
            runs.insert(run_id, handle.clone());
        }
        self.set_current(run_id);
        self.inner.store.save_run(&handle.snapshot()).await?;
        Ok(handle)
    }

    /// Bring a failed run recorded by an earlier process back into memory.
    ///
    /// Item trackers live only in memory, so the resumed run starts with no
    /// item history and its counts restart with it. Items the earlier process
    /// stored come back as `unchanged`.
    async fn rehydrate(&self, run_id: RunId) -> Result<Arc<RunHandle>> {
        let mut run = self
            .inner
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| RegwatchError::not_found(format!("run {run_id}")))?;
        if run.status != RunStatus::Failed {
            return Err(RegwatchError::invalid_transition(run.status, RunStatus::Running));
        }
        info!(%run_id, "resuming run from an earlier process; item counts restart");
        run.per_source_counts.clear();
        let handle = Arc::new(RunHandle::new(run));
        let mut runs = self.inner.runs.lock().unwrap_or_else(|p| p.into_inner());
        Ok(runs.entry(run_id).or_insert(handle).clone())
    }

    async fn persist_run(&self, handle: &RunHandle) {
        let snapshot = handle.snapshot();
        if let Err(e) = self.inner.store.save_run(&snapshot).await {
            warn!(run_id = %snapshot.run_id, error = %e, "failed to persist run record");
        }
    }

    async fn load_feedback(&self) -> Result<FeedbackByProfile> {
        let mut by_profile = HashMap::new();
        for profile in &self.inner.profiles {
            let rows = self.inner.store.feedback_for(&profile.id).await?;
            by_profile.insert(profile.id.clone(), rows);
        }
        Ok(by_profile)
    }

    // -- execution ------------------------------------------------------------

    #[instrument(skip_all, fields(run_id = %handle.run_id()))]
    async fn execute(&self, handle: Arc<RunHandle>) {
        if let Err(e) = handle.transition(RunStatus::Running) {
            debug!(error = %e, "run no longer startable");
            handle.outcome.send_replace(Some(handle.status()));
            return;
        }
        handle.control.send_replace(Control::Run);
        self.persist_run(&handle).await;

        let kind = handle.with_run(|r| r.kind);
        info!(?kind, "run started");

        let result = match kind {
            RunKind::Incremental => self.ingest(&handle, false).await,
            RunKind::Full => self.ingest(&handle, true).await,
            RunKind::Backfill {
                stage,
                missing_only,
            } => self.replay(&handle, stage, missing_only).await,
        };

        let mut control = handle.control.subscribe();
        let status = loop {
            if handle.status() == RunStatus::Cancelled {
                break RunStatus::Cancelled;
            }
            if let Err(e) = &result {
                error!(error = %e, "run aborted");
                handle.with_run(|r| r.last_error = Some(e.to_string()));
                if let Err(te) = handle.transition(RunStatus::Failed) {
                    warn!(error = %te, "could not mark run failed");
                }
                break handle.status();
            }
            // Work ran out while paused: hold until resumed or cancelled.
            if !checkpoint(&mut control).await {
                break handle.status();
            }
            if handle.transition(RunStatus::Completed).is_ok() {
                handle.advance_cursor(Stage::Done);
                break RunStatus::Completed;
            }
            // Paused between the checkpoint and the transition.
            tokio::task::yield_now().await;
        };

        self.persist_run(&handle).await;
        let snapshot = handle.snapshot();
        let totals = snapshot.totals();
        info!(
            %status,
            fetched = totals.fetched,
            new = totals.new,
            updated = totals.updated,
            unchanged = totals.unchanged,
            errors = totals.errors,
            "run finished"
        );
        self.inner.progress.done(&snapshot);
        handle.outcome.send_replace(Some(status));
    }

    /// Incremental or full ingestion over every configured source.
    async fn ingest(&self, handle: &Arc<RunHandle>, full: bool) -> Result<()> {
        handle.advance_cursor(Stage::Discover);
        self.inner.progress.phase(Stage::Discover);
        let feedback = Arc::new(self.load_feedback().await?);

        let pool = Arc::new(Semaphore::new(self.inner.config.defaults.concurrency.max(1)));
        let mut workers = JoinSet::new();
        for source in self.inner.config.sources.iter().cloned() {
            let this = self.clone();
            let handle = handle.clone();
            let pool = pool.clone();
            let feedback = feedback.clone();
            workers.spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|_| RegwatchError::Storage("worker pool closed".into()))?;
                this.ingest_source(&handle, &source, full, &feedback).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.unwrap_or_else(|join_err| {
                Err(RegwatchError::Storage(format!("source worker crashed: {join_err}")))
            });
            if let Err(e) = outcome {
                if first_error.is_none() {
                    handle.control.send_replace(Control::Abort);
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Call the adapter through the pacer, retrying empty transient failures.
    async fn fetch_source(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        source: &SourceConfig,
        limits: SourceLimits,
    ) -> AdapterOutput {
        let policy = self.inner.retry;
        let mut attempt = 1;
        loop {
            let output = self.inner.pacer.call(adapter.clone(), source, limits).await;
            if output.is_retryable() && attempt < policy.max_attempts {
                let delay = policy.delay_for(attempt);
                debug!(source = %source.code, attempt, ?delay, "transient source failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return output;
        }
    }

    #[instrument(skip_all, fields(source = %source.code))]
    async fn ingest_source(
        &self,
        handle: &RunHandle,
        source: &SourceConfig,
        full: bool,
        feedback: &FeedbackByProfile,
    ) -> Result<()> {
        let mut control = handle.control.subscribe();
        if !checkpoint(&mut control).await {
            return Ok(());
        }

        let Some(adapter) = self.inner.registry.resolve(source) else {
            warn!(kind = source.kind.as_str(), "no adapter registered for source");
            handle.count(&source.code, |c| c.errors += 1);
            return Ok(());
        };

        let mut limits = source.limits(&self.inner.config.defaults);
        if full {
            limits.max_age_days = None;
        }

        handle.advance_cursor(Stage::Fetch);
        self.inner.progress.phase(Stage::Fetch);
        let output = self.fetch_source(adapter, source, limits).await;
        if let Some(err) = &output.error {
            warn!(error = %err, partial = output.records.len(), "source reported an error");
            handle.count(&source.code, |c| c.errors += 1);
        }
        let total = output.records.len();
        info!(items = total, "source fetched");
        self.inner.progress.source_fetched(&source.code, total);

        let max_retries = self.inner.retry.max_attempts;
        for (index, candidate) in output.records.into_iter().enumerate() {
            if !checkpoint(&mut control).await {
                debug!(index, "stopping between items");
                break;
            }
            handle.advance_cursor(Stage::Normalize);
            let normalized = normalize(&candidate, source);
            let key = match &normalized {
                Ok(record) => format!("{}:{}", source.code, record.identity),
                Err(_) => format!(
                    "{}!{}|{}",
                    source.code,
                    candidate.url.trim(),
                    candidate.headline.trim()
                ),
            };
            let from = match handle.admit(&key, ItemState::Fetched, max_retries)? {
                Admission::Fresh => {
                    handle.count(&source.code, |c| c.fetched += 1);
                    ItemState::Fetched
                }
                Admission::Resumed(state) => state,
                Admission::Died => {
                    handle.count(&source.code, |c| c.errors += 1);
                    continue;
                }
                Admission::Skip => continue,
            };

            match normalized {
                Ok(record) => {
                    self.process_record(handle, source, &key, record, from, feedback)
                        .await?
                }
                Err(e) => {
                    debug!(item = %key, error = %e, "candidate failed validation");
                    handle.kill_item(&key, &e);
                    handle.count(&source.code, |c| c.errors += 1);
                }
            }
            self.inner.progress.item_done(&source.code, index + 1, total);
        }

        self.persist_run(handle).await;
        Ok(())
    }

    /// Record an item-level failure. Storage-level failures abort the run.
    fn item_failed(&self, handle: &RunHandle, key: &str, source: &str, err: RegwatchError) -> Result<()> {
        if is_run_level(&err) {
            handle.fail_item(key, &err);
            return Err(err);
        }
        warn!(item = key, error = %err, "item dropped");
        handle.kill_item(key, &err);
        handle.count(source, |c| c.errors += 1);
        Ok(())
    }

    /// Dedup/persist → enrich → score one normalized record.
    async fn process_record(
        &self,
        handle: &RunHandle,
        source: &SourceConfig,
        key: &str,
        record: NormalizedRecord,
        from: ItemState,
        feedback: &FeedbackByProfile,
    ) -> Result<()> {
        let code = source.code.as_str();

        if from < ItemState::Normalized {
            handle.advance_item(key, ItemState::Normalized)?;
        }

        let (update, needs_enrichment) = if from < ItemState::Persisted {
            handle.advance_cursor(Stage::Dedup);
            let dedup = &self.inner.dedup;
            let upserted = self
                .inner
                .retry
                .run("upsert", move || dedup.upsert(record.clone()))
                .await;
            let (outcome, update) = match upserted {
                Ok(v) => v,
                Err(e) => return self.item_failed(handle, key, code, e),
            };
            handle.advance_item(key, ItemState::Deduped)?;
            handle.advance_cursor(Stage::Persist);
            handle.advance_item(key, ItemState::Persisted)?;
            match outcome {
                UpsertOutcome::Created => handle.count(code, |c| c.new += 1),
                UpsertOutcome::Updated => handle.count(code, |c| c.updated += 1),
                UpsertOutcome::Unchanged => {
                    handle.count(code, |c| c.unchanged += 1);
                    handle.advance_item(key, ItemState::Done)?;
                    return Ok(());
                }
            }
            (update, true)
        } else {
            let store = &self.inner.store;
            let identity = record.identity.as_str();
            let found = self
                .inner
                .retry
                .run("get_update", move || store.get_update(identity))
                .await;
            match found {
                Ok(Some(update)) => {
                    let needs = from == ItemState::Persisted && update.enrichment.is_none();
                    (update, needs)
                }
                Ok(None) => {
                    let err = RegwatchError::not_found(format!("stored update {identity}"));
                    return self.item_failed(handle, key, code, err);
                }
                Err(e) => return self.item_failed(handle, key, code, e),
            }
        };

        let mut update = update;
        let mut state = from.max(ItemState::Persisted);
        if needs_enrichment {
            match self.enrich(&update, code, handle).await {
                Ok(Some(enriched)) => {
                    update = enriched;
                    handle.advance_item(key, ItemState::Enriched)?;
                    state = ItemState::Enriched;
                }
                Ok(None) => {}
                Err(e) => return self.item_failed(handle, key, code, e),
            }
        }

        if state < ItemState::Scored {
            handle.advance_cursor(Stage::Score);
            if let Err(e) = self.score_update(&update, feedback).await {
                return self.item_failed(handle, key, code, e);
            }
            handle.advance_item(key, ItemState::Scored)?;
        }
        handle.advance_item(key, ItemState::Done)?;
        Ok(())
    }

    /// Analyze and store an insight. `Ok(None)` when enrichment is off, the
    /// service had nothing to say, or it failed (counted, never fatal).
    /// `Err` only for storage failures while saving the insight.
    async fn enrich(
        &self,
        update: &StoredUpdate,
        source: &str,
        handle: &RunHandle,
    ) -> Result<Option<StoredUpdate>> {
        let Some(enricher) = self.inner.enricher.as_deref() else {
            return Ok(None);
        };
        handle.advance_cursor(Stage::Enrich);

        let record = &update.record;
        let analyzed = self
            .inner
            .retry
            .run("enrich", move || enricher.analyze(record))
            .await;
        let insight = match analyzed {
            Ok(Some(insight)) => insight,
            Ok(None) => {
                debug!(identity = %update.identity(), "no insight");
                return Ok(None);
            }
            Err(e) => {
                warn!(identity = %update.identity(), error = %e, "enrichment failed; record stays unenriched");
                handle.count(source, |c| c.enrichment_failures += 1);
                return Ok(None);
            }
        };

        let insight = apply_heuristic(record, insight, &self.inner.config.scoring.urgency, Utc::now());
        let store = &self.inner.store;
        let id = update.id;
        let saved = &insight;
        self.inner
            .retry
            .run("set_enrichment", move || store.set_enrichment(id, Some(saved)))
            .await?;

        let mut enriched = update.clone();
        enriched.enrichment = Some(insight);
        enriched.relevance_cache.clear();
        Ok(Some(enriched))
    }

    /// Compute and cache the score for every profile.
    async fn score_update(&self, update: &StoredUpdate, feedback: &FeedbackByProfile) -> Result<()> {
        let now = Utc::now();
        let store = &self.inner.store;
        for profile in &self.inner.profiles {
            let adjustments = feedback.get(&profile.id).map(Vec::as_slice).unwrap_or_default();
            let score = self.inner.scorer.score(update, profile, adjustments, now);
            let id = update.id;
            let profile_id = profile.id.as_str();
            self.inner
                .retry
                .run("set_relevance", move || store.set_relevance(id, profile_id, score))
                .await?;
        }
        Ok(())
    }

    /// Replay `enrich` or `score` over stored records without refetching.
    async fn replay(&self, handle: &RunHandle, stage: Stage, missing_only: bool) -> Result<()> {
        handle.advance_cursor(stage);
        self.inner.progress.phase(stage);

        let store = &self.inner.store;
        let updates = self.inner.retry.run("list_updates", move || store.list_updates()).await?;
        let feedback = match stage {
            Stage::Score => self.load_feedback().await?,
            _ => FeedbackByProfile::new(),
        };

        let mut control = handle.control.subscribe();
        let total = updates.len();
        let max_retries = self.inner.retry.max_attempts;
        let now = Utc::now();

        for (index, update) in updates.into_iter().enumerate() {
            if !checkpoint(&mut control).await {
                debug!(index, "stopping between items");
                break;
            }
            let key = update.id.to_string();
            let authority = update.record.authority.clone();
            match handle.admit(&key, ItemState::Persisted, max_retries)? {
                Admission::Fresh | Admission::Resumed(_) => {}
                Admission::Died => {
                    handle.count(&authority, |c| c.errors += 1);
                    continue;
                }
                Admission::Skip => continue,
            }

            match stage {
                Stage::Enrich => {
                    if missing_only && update.valid_insight(now).is_some() {
                        handle.count(&authority, |c| c.unchanged += 1);
                        handle.advance_item(&key, ItemState::Done)?;
                        continue;
                    }
                    match self.enrich(&update, &authority, handle).await {
                        Ok(Some(_)) => {
                            handle.advance_item(&key, ItemState::Enriched)?;
                            handle.count(&authority, |c| c.updated += 1);
                        }
                        Ok(None) => handle.count(&authority, |c| c.unchanged += 1),
                        Err(e) => {
                            self.item_failed(handle, &key, &authority, e)?;
                            continue;
                        }
                    }
                }
                _ => {
                    if let Err(e) = self.score_update(&update, &feedback).await {
                        self.item_failed(handle, &key, &authority, e)?;
                        continue;
                    }
                    handle.advance_item(&key, ItemState::Scored)?;
                    handle.count(&authority, |c| c.updated += 1);
                }
            }
            handle.advance_item(&key, ItemState::Done)?;
            self.inner.progress.item_done(&authority, index + 1, total);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
