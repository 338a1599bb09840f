//! Deduplicating upsert over any [`RecordStore`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use regwatch_shared::{
    NormalizedRecord, RecordId, Result, StoredUpdate, UpsertOutcome, identity::fingerprint,
};

use crate::store::RecordStore;

type IdentityLock = Arc<tokio::sync::Mutex<()>>;

/// Decides insert vs. update vs. no-op for normalized records.
///
/// Upserts of different identities run in parallel; upserts of the same
/// identity are serialized through a per-identity lock.
pub struct DedupStore {
    store: Arc<dyn RecordStore>,
    locks: std::sync::Mutex<HashMap<String, IdentityLock>>,
}

impl DedupStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    fn lock_for(&self, identity: &str) -> IdentityLock {
        let mut table = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        table.entry(identity.to_string()).or_default().clone()
    }

    /// Drop the table entry once nobody else holds or waits on it.
    fn release(&self, identity: &str, lock: IdentityLock) {
        let mut table = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        drop(lock);
        if table.get(identity).is_some_and(|l| Arc::strong_count(l) == 1) {
            table.remove(identity);
        }
    }

    /// Insert, update or skip `record` by its identity.
    ///
    /// `unchanged` touches nothing: `last_updated_at` and cached scores stay as they were.
    /// `updated` bumps `last_updated_at` and drops every cached score for the record.
    pub async fn upsert(&self, record: NormalizedRecord) -> Result<(UpsertOutcome, StoredUpdate)> {
        let identity = record.identity.clone();
        let lock = self.lock_for(&identity);
        let result = {
            let _guard = lock.lock().await;
            self.upsert_locked(record).await
        };
        self.release(&identity, lock);
        result
    }

    async fn upsert_locked(&self, record: NormalizedRecord) -> Result<(UpsertOutcome, StoredUpdate)> {
        let fp = fingerprint(&record.headline, record.summary.as_deref(), record.published_date);
        let now = Utc::now();

        match self.store.get_update(&record.identity).await? {
            None => {
                let update = StoredUpdate {
                    id: RecordId::new(),
                    record,
                    fingerprint: fp,
                    first_seen_at: now,
                    last_updated_at: now,
                    enrichment: None,
                    relevance_cache: Default::default(),
                };
                self.store.insert_update(&update).await?;
                debug!(identity = %update.identity(), id = %update.id, "created");
                Ok((UpsertOutcome::Created, update))
            }
            Some(existing) if existing.fingerprint == fp => {
                debug!(identity = %existing.identity(), "unchanged");
                Ok((UpsertOutcome::Unchanged, existing))
            }
            Some(existing) => {
                let update = StoredUpdate {
                    record,
                    fingerprint: fp,
                    last_updated_at: now,
                    relevance_cache: Default::default(),
                    ..existing
                };
                self.store.replace_update(&update).await?;
                debug!(identity = %update.identity(), id = %update.id, "updated");
                Ok((UpsertOutcome::Updated, update))
            }
        }
    }

    #[cfg(test)]
    fn lock_table_len(&self) -> usize {
        self.locks.lock().map(|t| t.len()).unwrap_or(0)
    }
}
