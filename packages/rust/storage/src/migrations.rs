//! SQL migration definitions for the regwatch database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: updates, relevance_cache, pipeline_runs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Deduplicated announcements, keyed by canonical identity
CREATE TABLE IF NOT EXISTS updates (
    id              TEXT PRIMARY KEY,
    identity        TEXT NOT NULL UNIQUE,
    headline        TEXT NOT NULL,
    url             TEXT NOT NULL,
    authority       TEXT NOT NULL,
    published_date  TEXT,
    summary         TEXT,
    country         TEXT,
    sectors_json    TEXT NOT NULL DEFAULT '[]',
    priority        TEXT NOT NULL DEFAULT 'normal',
    deadline        TEXT,
    fingerprint     TEXT NOT NULL,
    first_seen_at   TEXT NOT NULL,
    last_updated_at TEXT NOT NULL,
    enrichment_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_updates_authority ON updates(authority);
CREATE INDEX IF NOT EXISTS idx_updates_first_seen ON updates(first_seen_at);

-- Last computed relevance per (update, profile)
CREATE TABLE IF NOT EXISTS relevance_cache (
    update_id   TEXT NOT NULL REFERENCES updates(id) ON DELETE CASCADE,
    profile_id  TEXT NOT NULL,
    score       REAL NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (update_id, profile_id)
);

CREATE INDEX IF NOT EXISTS idx_relevance_profile ON relevance_cache(profile_id);

-- Run history
CREATE TABLE IF NOT EXISTS pipeline_runs (
    run_id       TEXT PRIMARY KEY,
    kind_json    TEXT NOT NULL,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    status       TEXT NOT NULL,
    stage_cursor TEXT NOT NULL,
    counts_json  TEXT NOT NULL DEFAULT '{}',
    last_error   TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_started ON pipeline_runs(started_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Feedback: adjustments, interaction log, watermarks",
            sql: r#"
-- Summed weight corrections per (profile, entity)
CREATE TABLE IF NOT EXISTS feedback_adjustments (
    profile_id    TEXT NOT NULL,
    entity_type   TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    weight_delta  REAL NOT NULL,
    occurrences   INTEGER NOT NULL,
    last_event_at TEXT NOT NULL,
    PRIMARY KEY (profile_id, entity_type, entity_id)
);

-- Raw interaction events, the aggregator's input
CREATE TABLE IF NOT EXISTS interactions (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    profile_id  TEXT NOT NULL,
    kind        TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    event_json  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_interactions_time ON interactions(occurred_at);

-- Named forward-moving watermarks
CREATE TABLE IF NOT EXISTS watermarks (
    name  TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "Watermarks track interaction seq instead of occurred_at",
            sql: r#"
CREATE TABLE IF NOT EXISTS log_cursors (
    name TEXT PRIMARY KEY,
    seq  INTEGER NOT NULL
);

-- Carry existing timestamp watermarks over to the last seq they covered
INSERT OR IGNORE INTO log_cursors (name, seq)
SELECT w.name, COALESCE((SELECT MAX(i.seq) FROM interactions i WHERE i.occurred_at <= w.value), 0)
FROM watermarks w;

DROP TABLE IF EXISTS watermarks;

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}
