//! libSQL-backed [`RecordStore`] (embedded, offline mode).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, Row, params};
use tokio::sync::Mutex;

use regwatch_shared::{
    AiInsight, EntityType, FeedbackAdjustment, InteractionEvent, NormalizedRecord, PipelineRun,
    Priority, RecordId, RegwatchError, Result, RunId, RunKind, Stage, StoredUpdate,
};

use crate::migrations;
use crate::store::{RecordStore, parse_ts, ts};

const UPDATE_COLUMNS: &str = "id, identity, headline, url, authority, published_date, summary, \
     country, sectors_json, priority, deadline, fingerprint, first_seen_at, last_updated_at, \
     enrichment_json";

const RUN_COLUMNS: &str =
    "run_id, kind_json, started_at, finished_at, status, stage_cursor, counts_json, last_error";

fn storage_err(e: impl std::fmt::Display) -> RegwatchError {
    RegwatchError::Storage(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(storage_err)
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(storage_err)
}

fn parse_id<T: std::str::FromStr>(s: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    s.parse::<T>().map_err(|e| RegwatchError::Storage(format!("bad id '{s}': {e}")))
}

/// Primary storage handle wrapping a libSQL database.
pub struct LibsqlStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    /// Serializes multi-statement writes on the shared connection.
    write_lock: Mutex<()>,
}

impl LibsqlStore {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| RegwatchError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| RegwatchError::storage_unavailable(e.to_string()))?;
        let conn = db
            .connect()
            .map_err(|e| RegwatchError::storage_unavailable(e.to_string()))?;

        let store = Self {
            db,
            conn,
            write_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    RegwatchError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    fn row_to_update(row: &Row) -> Result<StoredUpdate> {
        let id: String = row.get(0).map_err(storage_err)?;
        let published: Option<String> = row.get(5).map_err(storage_err)?;
        let deadline: Option<String> = row.get(10).map_err(storage_err)?;
        let sectors_json: String = row.get(8).map_err(storage_err)?;
        let priority: String = row.get(9).map_err(storage_err)?;
        let enrichment: Option<String> = row.get(14).map_err(storage_err)?;
        let first_seen: String = row.get(12).map_err(storage_err)?;
        let last_updated: String = row.get(13).map_err(storage_err)?;

        Ok(StoredUpdate {
            id: parse_id(&id)?,
            record: NormalizedRecord {
                identity: row.get(1).map_err(storage_err)?,
                headline: row.get(2).map_err(storage_err)?,
                url: row.get(3).map_err(storage_err)?,
                authority: row.get(4).map_err(storage_err)?,
                published_date: published.as_deref().map(parse_ts).transpose()?,
                summary: row.get(6).map_err(storage_err)?,
                country: row.get(7).map_err(storage_err)?,
                sectors: from_json(&sectors_json)?,
                priority: from_json::<Priority>(&format!("\"{priority}\""))?,
                deadline: deadline.as_deref().map(parse_ts).transpose()?,
            },
            fingerprint: row.get(11).map_err(storage_err)?,
            first_seen_at: parse_ts(&first_seen)?,
            last_updated_at: parse_ts(&last_updated)?,
            enrichment: enrichment.as_deref().map(from_json::<AiInsight>).transpose()?,
            relevance_cache: BTreeMap::new(),
        })
    }

    fn row_to_run(row: &Row) -> Result<PipelineRun> {
        let run_id: String = row.get(0).map_err(storage_err)?;
        let kind: String = row.get(1).map_err(storage_err)?;
        let started: String = row.get(2).map_err(storage_err)?;
        let finished: Option<String> = row.get(3).map_err(storage_err)?;
        let status: String = row.get(4).map_err(storage_err)?;
        let cursor: String = row.get(5).map_err(storage_err)?;
        let counts: String = row.get(6).map_err(storage_err)?;

        Ok(PipelineRun {
            run_id: parse_id(&run_id)?,
            kind: from_json::<RunKind>(&kind)?,
            started_at: parse_ts(&started)?,
            finished_at: finished.as_deref().map(parse_ts).transpose()?,
            status: status.parse()?,
            stage_cursor: cursor.parse::<Stage>()?,
            per_source_counts: from_json(&counts)?,
            last_error: row.get(7).map_err(storage_err)?,
        })
    }

    async fn relevance_for(&self, id: RecordId) -> Result<BTreeMap<String, f64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT profile_id, score FROM relevance_cache WHERE update_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut cache = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            cache.insert(row.get::<String>(0).map_err(storage_err)?, row.get::<f64>(1).map_err(storage_err)?);
        }
        Ok(cache)
    }

    async fn query_one_update(&self, sql: &str, key: String) -> Result<Option<StoredUpdate>> {
        let mut rows = self.conn.query(sql, params![key]).await.map_err(storage_err)?;
        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };
        let mut update = Self::row_to_update(&row)?;
        update.relevance_cache = self.relevance_for(update.id).await?;
        Ok(Some(update))
    }

    async fn write_update_row(&self, conn: &Connection, sql: &str, u: &StoredUpdate) -> Result<()> {
        let r = &u.record;
        conn.execute(
            sql,
            params![
                u.id.to_string(),
                r.identity.as_str(),
                r.headline.as_str(),
                r.url.as_str(),
                r.authority.as_str(),
                r.published_date.map(ts),
                r.summary.clone(),
                r.country.clone(),
                to_json(&r.sectors)?,
                to_json(&r.priority)?.trim_matches('"').to_string(),
                r.deadline.map(ts),
                u.fingerprint.as_str(),
                ts(u.first_seen_at),
                ts(u.last_updated_at),
                u.enrichment.as_ref().map(to_json).transpose()?
            ],
        )
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for LibsqlStore {
    fn backend(&self) -> &'static str {
        "libsql"
    }

    async fn get_update(&self, identity: &str) -> Result<Option<StoredUpdate>> {
        let sql = format!("SELECT {UPDATE_COLUMNS} FROM updates WHERE identity = ?1");
        self.query_one_update(&sql, identity.to_string()).await
    }

    async fn get_update_by_id(&self, id: RecordId) -> Result<Option<StoredUpdate>> {
        let sql = format!("SELECT {UPDATE_COLUMNS} FROM updates WHERE id = ?1");
        self.query_one_update(&sql, id.to_string()).await
    }

    async fn insert_update(&self, update: &StoredUpdate) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let sql = format!(
            "INSERT INTO updates ({UPDATE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        );
        self.write_update_row(&self.conn, &sql, update).await.map_err(|e| match e {
            RegwatchError::Storage(msg) if msg.contains("UNIQUE") => RegwatchError::Conflict {
                identity: update.record.identity.clone(),
            },
            other => other,
        })
    }

    async fn replace_update(&self, update: &StoredUpdate) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        let sql = "UPDATE updates SET id = ?1, headline = ?3, url = ?4, authority = ?5,
                   published_date = ?6, summary = ?7, country = ?8, sectors_json = ?9,
                   priority = ?10, deadline = ?11, fingerprint = ?12, first_seen_at = ?13,
                   last_updated_at = ?14, enrichment_json = ?15
                   WHERE identity = ?2";
        self.write_update_row(&tx, sql, update).await?;

        let id = update.id.to_string();
        tx.execute("DELETE FROM relevance_cache WHERE update_id = ?1", params![id.as_str()])
            .await
            .map_err(storage_err)?;
        let now = ts(Utc::now());
        for (profile, score) in &update.relevance_cache {
            tx.execute(
                "INSERT INTO relevance_cache (update_id, profile_id, score, computed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), profile.as_str(), *score, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)
    }

    async fn list_updates(&self) -> Result<Vec<StoredUpdate>> {
        let mut cache: HashMap<String, BTreeMap<String, f64>> = HashMap::new();
        let mut rows = self
            .conn
            .query("SELECT update_id, profile_id, score FROM relevance_cache", params![])
            .await
            .map_err(storage_err)?;
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            cache
                .entry(row.get::<String>(0).map_err(storage_err)?)
                .or_default()
                .insert(row.get::<String>(1).map_err(storage_err)?, row.get::<f64>(2).map_err(storage_err)?);
        }

        let sql = format!("SELECT {UPDATE_COLUMNS} FROM updates ORDER BY first_seen_at, id");
        let mut rows = self.conn.query(&sql, params![]).await.map_err(storage_err)?;
        let mut updates = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let mut update = Self::row_to_update(&row)?;
            if let Some(scores) = cache.remove(&update.id.to_string()) {
                update.relevance_cache = scores;
            }
            updates.push(update);
        }
        Ok(updates)
    }

    async fn count_updates(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM updates", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u64),
            None => Ok(0),
        }
    }

    async fn set_enrichment(&self, id: RecordId, insight: Option<&AiInsight>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let id = id.to_string();
        let changed = tx
            .execute(
                "UPDATE updates SET enrichment_json = ?2 WHERE id = ?1",
                params![id.as_str(), insight.map(to_json).transpose()?],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(RegwatchError::not_found(format!("update {id}")));
        }
        tx.execute("DELETE FROM relevance_cache WHERE update_id = ?1", params![id.as_str()])
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)
    }

    async fn set_relevance(&self, id: RecordId, profile_id: &str, score: f64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO relevance_cache (update_id, profile_id, score, computed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(update_id, profile_id) DO UPDATE SET
                    score = excluded.score, computed_at = excluded.computed_at",
                params![id.to_string(), profile_id, score, ts(Utc::now())],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn invalidate_profile_scores(&self, profile_id: &str) -> Result<u64> {
        self.conn
            .execute("DELETE FROM relevance_cache WHERE profile_id = ?1", params![profile_id])
            .await
            .map_err(storage_err)
    }

    async fn apply_feedback(&self, adjustments: &[FeedbackAdjustment]) -> Result<()> {
        if adjustments.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        for adj in adjustments {
            tx.execute(
                "INSERT INTO feedback_adjustments
                    (profile_id, entity_type, entity_id, weight_delta, occurrences, last_event_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(profile_id, entity_type, entity_id) DO UPDATE SET
                    weight_delta = weight_delta + excluded.weight_delta,
                    occurrences = occurrences + excluded.occurrences,
                    last_event_at = MAX(last_event_at, excluded.last_event_at)",
                params![
                    adj.profile_id.as_str(),
                    adj.entity_type.as_str(),
                    adj.entity_id.as_str(),
                    adj.weight_delta,
                    adj.occurrences as i64,
                    ts(adj.last_event_at)
                ],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)
    }

    async fn feedback_for(&self, profile_id: &str) -> Result<Vec<FeedbackAdjustment>> {
        let mut rows = self
            .conn
            .query(
                "SELECT profile_id, entity_type, entity_id, weight_delta, occurrences, last_event_at
                 FROM feedback_adjustments WHERE profile_id = ?1
                 ORDER BY entity_type, entity_id",
                params![profile_id],
            )
            .await
            .map_err(storage_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let entity_type: String = row.get(1).map_err(storage_err)?;
            let last: String = row.get(5).map_err(storage_err)?;
            out.push(FeedbackAdjustment {
                profile_id: row.get(0).map_err(storage_err)?,
                entity_type: entity_type.parse::<EntityType>()?,
                entity_id: row.get(2).map_err(storage_err)?,
                weight_delta: row.get(3).map_err(storage_err)?,
                occurrences: row.get::<i64>(4).map_err(storage_err)?.max(0) as u64,
                last_event_at: parse_ts(&last)?,
            });
        }
        Ok(out)
    }

    async fn record_interaction(&self, event: &InteractionEvent) -> Result<u64> {
        let kind = to_json(&event.kind)?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO interactions (profile_id, kind, occurred_at, event_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.profile_id.as_str(),
                    kind.trim_matches('"'),
                    ts(event.occurred_at),
                    to_json(event)?
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(self.conn.last_insert_rowid().max(0) as u64)
    }

    async fn interactions_after(&self, after: Option<u64>) -> Result<Vec<(u64, InteractionEvent)>> {
        let after = after.map_or(0, |seq| i64::try_from(seq).unwrap_or(i64::MAX));
        let mut rows = self
            .conn
            .query(
                "SELECT seq, event_json FROM interactions WHERE seq > ?1 ORDER BY seq",
                params![after],
            )
            .await
            .map_err(storage_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let seq: i64 = row.get(0).map_err(storage_err)?;
            let event = from_json(&row.get::<String>(1).map_err(storage_err)?)?;
            out.push((seq.max(0) as u64, event));
        }
        Ok(out)
    }

    async fn get_watermark(&self, name: &str) -> Result<Option<u64>> {
        let mut rows = self
            .conn
            .query("SELECT seq FROM log_cursors WHERE name = ?1", params![name])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row.get::<i64>(0).map_err(storage_err)?.max(0) as u64)),
            None => Ok(None),
        }
    }

    async fn set_watermark(&self, name: &str, seq: u64) -> Result<()> {
        let seq = i64::try_from(seq)
            .map_err(|_| RegwatchError::Storage(format!("watermark {seq} out of range")))?;
        self.conn
            .execute(
                "INSERT INTO log_cursors (name, seq) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET seq = excluded.seq",
                params![name, seq],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO pipeline_runs
                    (run_id, kind_json, started_at, finished_at, status, stage_cursor, counts_json, last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(run_id) DO UPDATE SET
                    finished_at = excluded.finished_at,
                    status = excluded.status,
                    stage_cursor = excluded.stage_cursor,
                    counts_json = excluded.counts_json,
                    last_error = excluded.last_error",
                params![
                    run.run_id.to_string(),
                    to_json(&run.kind)?,
                    ts(run.started_at),
                    run.finished_at.map(ts),
                    run.status.as_str(),
                    run.stage_cursor.as_str(),
                    to_json(&run.per_source_counts)?,
                    run.last_error.clone()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<PipelineRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE run_id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![run_id.to_string()])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(Self::row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_runs(&self) -> Result<Vec<PipelineRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs ORDER BY started_at DESC, run_id DESC");
        let mut rows = self.conn.query(&sql, params![]).await.map_err(storage_err)?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            runs.push(Self::row_to_run(&row)?);
        }
        Ok(runs)
    }
}
