//! Single-writer JSON file store, used when the database is unavailable.
//!
//! The whole state lives in one JSON snapshot. An exclusive advisory lock on
//! `<file>.lock` is held for the store's lifetime, so a second process cannot
//! open the same snapshot. Every mutation is applied to a copy of the
//! snapshot, written atomically (temp file + rename), and only then becomes
//! the in-memory state. A failed write leaves memory and disk unchanged.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use regwatch_shared::{
    AiInsight, FeedbackAdjustment, InteractionEvent, PipelineRun, RecordId, RegwatchError, Result,
    RunId, StoredUpdate,
};

use crate::store::RecordStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggedInteraction {
    seq: u64,
    event: InteractionEvent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    updates: BTreeMap<String, StoredUpdate>,
    #[serde(default)]
    feedback: Vec<FeedbackAdjustment>,
    #[serde(default)]
    interactions: Vec<LoggedInteraction>,
    #[serde(default)]
    watermarks: BTreeMap<String, u64>,
    #[serde(default)]
    runs: BTreeMap<String, PipelineRun>,
}

/// Exclusive lock on `<path>.lock`, released on drop.
struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    fn acquire(data_path: &Path) -> Result<Self> {
        let mut lock_name = data_path.as_os_str().to_owned();
        lock_name.push(".lock");
        let path = PathBuf::from(lock_name);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| RegwatchError::io(&path, e))?;

        if file.try_lock_exclusive().is_err() {
            return Err(RegwatchError::Storage(format!(
                "fallback store {} is locked by another writer",
                data_path.display()
            )));
        }

        // Holder pid for diagnostics; the OS lock is what matters.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { file, path })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(path = %self.path.display(), "released fallback store lock");
    }
}

/// File-backed [`RecordStore`] accepting exactly one writer process.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<Snapshot>,
    _lock: WriterLock,
}

impl FileStore {
    /// Open (or create) the snapshot at `path`, taking the writer lock.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| RegwatchError::io(parent, e))?;
        }
        let lock = WriterLock::acquire(path)?;

        let snapshot = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| RegwatchError::io(path, e))?;
            if content.trim().is_empty() {
                Snapshot::default()
            } else {
                serde_json::from_str(&content).map_err(|e| {
                    RegwatchError::Storage(format!("corrupt snapshot {}: {e}", path.display()))
                })?
            }
        } else {
            Snapshot::default()
        };

        tracing::info!(path = %path.display(), updates = snapshot.updates.len(), "opened file store");
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(snapshot),
            _lock: lock,
        })
    }

    /// Write the snapshot to a sibling temp file, then rename over the original.
    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| RegwatchError::Storage(e.to_string()))?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp).map_err(|e| RegwatchError::io(&tmp, e))?;
        file.write_all(&json).map_err(|e| RegwatchError::io(&tmp, e))?;
        file.sync_all().map_err(|e| RegwatchError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| RegwatchError::io(&self.path, e))
    }

    /// Apply `change` to a copy of the snapshot, persist the copy, then swap it in.
    async fn commit<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut Snapshot) -> Result<T> + Send,
        T: Send,
    {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    fn find_by_id(snapshot: &mut Snapshot, id: RecordId) -> Result<&mut StoredUpdate> {
        snapshot
            .updates
            .values_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| RegwatchError::not_found(format!("update {id}")))
    }
}

#[async_trait]
impl RecordStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn get_update(&self, identity: &str) -> Result<Option<StoredUpdate>> {
        Ok(self.state.lock().await.updates.get(identity).cloned())
    }

    async fn get_update_by_id(&self, id: RecordId) -> Result<Option<StoredUpdate>> {
        let state = self.state.lock().await;
        Ok(state.updates.values().find(|u| u.id == id).cloned())
    }

    async fn insert_update(&self, update: &StoredUpdate) -> Result<()> {
        self.commit(|state| {
            if state.updates.contains_key(update.identity()) {
                return Err(RegwatchError::Conflict {
                    identity: update.identity().to_string(),
                });
            }
            state.updates.insert(update.identity().to_string(), update.clone());
            Ok(())
        })
        .await
    }

    async fn replace_update(&self, update: &StoredUpdate) -> Result<()> {
        self.commit(|state| match state.updates.get_mut(update.identity()) {
            Some(slot) => {
                *slot = update.clone();
                Ok(())
            }
            None => Err(RegwatchError::not_found(format!("update {}", update.identity()))),
        })
        .await
    }

    async fn list_updates(&self) -> Result<Vec<StoredUpdate>> {
        let state = self.state.lock().await;
        let mut updates: Vec<StoredUpdate> = state.updates.values().cloned().collect();
        updates.sort_by(|a, b| a.first_seen_at.cmp(&b.first_seen_at).then(a.id.cmp(&b.id)));
        Ok(updates)
    }

    async fn count_updates(&self) -> Result<u64> {
        Ok(self.state.lock().await.updates.len() as u64)
    }

    async fn set_enrichment(&self, id: RecordId, insight: Option<&AiInsight>) -> Result<()> {
        self.commit(|state| {
            let update = Self::find_by_id(state, id)?;
            update.enrichment = insight.cloned();
            update.relevance_cache.clear();
            Ok(())
        })
        .await
    }

    async fn set_relevance(&self, id: RecordId, profile_id: &str, score: f64) -> Result<()> {
        self.commit(|state| {
            let update = Self::find_by_id(state, id)?;
            update.relevance_cache.insert(profile_id.to_string(), score);
            Ok(())
        })
        .await
    }

    async fn invalidate_profile_scores(&self, profile_id: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let mut dropped = 0;
        for update in next.updates.values_mut() {
            if update.relevance_cache.remove(profile_id).is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.persist(&next)?;
            *state = next;
        }
        Ok(dropped)
    }

    async fn apply_feedback(&self, adjustments: &[FeedbackAdjustment]) -> Result<()> {
        if adjustments.is_empty() {
            return Ok(());
        }
        self.commit(|state| {
            for adj in adjustments {
                let existing = state.feedback.iter_mut().find(|row| {
                    row.profile_id == adj.profile_id
                        && row.entity_type == adj.entity_type
                        && row.entity_id == adj.entity_id
                });
                match existing {
                    Some(row) => row.absorb(adj),
                    None => state.feedback.push(adj.clone()),
                }
            }
            Ok(())
        })
        .await
    }

    async fn feedback_for(&self, profile_id: &str) -> Result<Vec<FeedbackAdjustment>> {
        let state = self.state.lock().await;
        let mut rows: Vec<FeedbackAdjustment> = state
            .feedback
            .iter()
            .filter(|row| row.profile_id == profile_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.entity_type
                .as_str()
                .cmp(b.entity_type.as_str())
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        Ok(rows)
    }

    async fn record_interaction(&self, event: &InteractionEvent) -> Result<u64> {
        self.commit(|state| {
            let seq = state.interactions.last().map_or(1, |logged| logged.seq + 1);
            state.interactions.push(LoggedInteraction {
                seq,
                event: event.clone(),
            });
            Ok(seq)
        })
        .await
    }

    async fn interactions_after(&self, after: Option<u64>) -> Result<Vec<(u64, InteractionEvent)>> {
        let state = self.state.lock().await;
        Ok(state
            .interactions
            .iter()
            .filter(|logged| after.is_none_or(|a| logged.seq > a))
            .map(|logged| (logged.seq, logged.event.clone()))
            .collect())
    }

    async fn get_watermark(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.state.lock().await.watermarks.get(name).copied())
    }

    async fn set_watermark(&self, name: &str, seq: u64) -> Result<()> {
        self.commit(|state| {
            state.watermarks.insert(name.to_string(), seq);
            Ok(())
        })
        .await
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        self.commit(|state| {
            state.runs.insert(run.run_id.to_string(), run.clone());
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<PipelineRun>> {
        Ok(self.state.lock().await.runs.get(&run_id.to_string()).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<PipelineRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<PipelineRun> = state.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.run_id.cmp(&a.run_id)));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_writer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.json");

        let first = FileStore::open(&path).expect("first writer");
        let err = match FileStore::open(&path) {
            Ok(_) => panic!("second writer must be refused"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("locked"));

        drop(first);
        FileStore::open(&path).expect("lock released on drop");
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.json");

        let run = PipelineRun::new(regwatch_shared::RunKind::Full);
        {
            let store = FileStore::open(&path).unwrap();
            store.save_run(&run).await.unwrap();
            store.set_watermark("feedback", 7).await.unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get_run(run.run_id).await.unwrap(), Some(run));
        assert_eq!(store.get_watermark("feedback").await.unwrap(), Some(7));
        assert!(!path.with_extension("json.tmp").exists());
    }

    fn record(url: &str) -> regwatch_shared::NormalizedRecord {
        regwatch_shared::NormalizedRecord {
            identity: url.into(),
            headline: "Headline".into(),
            url: url.into(),
            authority: "FCA".into(),
            published_date: None,
            summary: None,
            country: None,
            sectors: vec![],
            priority: Default::default(),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_no_phantom_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fb.json");
        let store = std::sync::Arc::new(FileStore::open(&path).unwrap());
        let dedup = crate::DedupStore::new(store.clone());

        // A directory where the temp file goes makes every write fail.
        let tmp = dir.path().join("fb.json.tmp");
        std::fs::create_dir(&tmp).unwrap();

        let err = dedup.upsert(record("https://fca.org.uk/n/1")).await.unwrap_err();
        assert!(matches!(err, RegwatchError::Io { .. }), "{err}");
        assert!(store.get_update("https://fca.org.uk/n/1").await.unwrap().is_none());
        assert_eq!(store.count_updates().await.unwrap(), 0);
        let pin = InteractionEvent::new("acme", regwatch_shared::InteractionKind::Pin, chrono::Utc::now());
        assert!(store.record_interaction(&pin).await.is_err());
        assert!(store.interactions_after(None).await.unwrap().is_empty());

        std::fs::remove_dir(&tmp).unwrap();
        let (outcome, _) = dedup.upsert(record("https://fca.org.uk/n/1")).await.unwrap();
        assert_eq!(outcome, regwatch_shared::UpsertOutcome::Created);

        drop(dedup);
        drop(store);
        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.count_updates().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn interaction_seq_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        let event = || {
            InteractionEvent::new("acme", regwatch_shared::InteractionKind::Pin, chrono::Utc::now())
        };
        {
            let store = FileStore::open(&path).unwrap();
            assert_eq!(store.record_interaction(&event()).await.unwrap(), 1);
            assert_eq!(store.record_interaction(&event()).await.unwrap(), 2);
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.record_interaction(&event()).await.unwrap(), 3);
        let after: Vec<u64> = store
            .interactions_after(Some(1))
            .await
            .unwrap()
            .into_iter()
            .map(|(seq, _)| seq)
            .collect();
        assert_eq!(after, vec![2, 3]);
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(FileStore::open(&path).is_err());
    }
}
