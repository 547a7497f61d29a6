//! SQLite schema for the reasoning ledger.
//!
//! Tables:
//! - `runs`: immutable run contexts
//! - `move_events`: the ordered, revisable move ledger (append + complete)
//! - `tool_invocations`: one row per actual tool/model execution
//! - `tool_requests`: queued evidence intentions, one terminal outcome each
//! - `retrieval_frames`: versioned plans under the single-current invariant
//! - `evidence_links`: move/evidence junction, append-only
//! - `audit_events`: append-only actor actions, trigger-protected
//! - `run_log_version`: per-run write counter driving cache invalidation

use anyhow::Context;
use rusqlite::Connection;
use std::collections::HashSet;

/// DDL for the ledger tables.
///
/// Schema version: 3
pub const LEDGER_SCHEMA: &str = r#"
-- Run contexts (immutable after insert)
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    profile      TEXT NOT NULL,
    stage        TEXT,
    created_at   TEXT NOT NULL
);

-- Move ledger. (run_id, seq) is the grammar ordering invariant: assigned by
-- atomic increment, never reused, never mutated.
CREATE TABLE IF NOT EXISTS move_events (
    id                     TEXT PRIMARY KEY,
    run_id                 TEXT NOT NULL REFERENCES runs(id),
    move_type              TEXT NOT NULL,
    seq                    INTEGER NOT NULL,
    status                 TEXT NOT NULL,
    started_at             TEXT NOT NULL,
    ended_at               TEXT,
    backtrack_from         TEXT REFERENCES move_events(id),
    backtrack_reason       TEXT,
    confidence             REAL,
    uncertainty_note       TEXT,
    inputs                 TEXT NOT NULL DEFAULT 'null',
    outputs                TEXT NOT NULL DEFAULT 'null',
    evidence_considered    TEXT NOT NULL DEFAULT '[]',
    assumptions            TEXT NOT NULL DEFAULT '[]',
    uncertainty_remaining  TEXT NOT NULL DEFAULT '[]',
    invocations            TEXT NOT NULL DEFAULT '[]',
    UNIQUE(run_id, seq)
);

-- Invocation log (immutable after terminal status)
CREATE TABLE IF NOT EXISTS tool_invocations (
    id                TEXT PRIMARY KEY,
    run_id            TEXT REFERENCES runs(id),
    tool_name         TEXT NOT NULL,
    inputs            TEXT NOT NULL DEFAULT 'null',
    outputs           TEXT NOT NULL DEFAULT 'null',
    status            TEXT NOT NULL,
    started_at        TEXT NOT NULL,
    ended_at          TEXT,
    confidence        REAL,
    uncertainty_note  TEXT
);

-- Request queue. Exactly one terminal outcome per request: completed rows
-- carry an invocation reference, error rows carry only error text.
CREATE TABLE IF NOT EXISTS tool_requests (
    id             TEXT PRIMARY KEY,
    run_id         TEXT NOT NULL REFERENCES runs(id),
    move_event_id  TEXT NOT NULL REFERENCES move_events(id),
    move_type      TEXT NOT NULL,
    tool_name      TEXT NOT NULL,
    purpose        TEXT NOT NULL,
    inputs         TEXT NOT NULL DEFAULT 'null',
    blocking       INTEGER NOT NULL DEFAULT 0,
    status         TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    resolved_at    TEXT,
    invocation_id  TEXT REFERENCES tool_invocations(id),
    evidence       TEXT NOT NULL DEFAULT '[]',
    error          TEXT
);

-- Versioned retrieval plans, immutable history chain via superseded_by
CREATE TABLE IF NOT EXISTS retrieval_frames (
    id               TEXT PRIMARY KEY,
    run_id           TEXT NOT NULL REFERENCES runs(id),
    move_type        TEXT NOT NULL,
    version          INTEGER NOT NULL,
    current          INTEGER NOT NULL DEFAULT 0,
    superseded_by    TEXT REFERENCES retrieval_frames(id),
    from_invocation  TEXT REFERENCES tool_invocations(id),
    content          TEXT NOT NULL DEFAULT 'null',
    created_at       TEXT NOT NULL,
    UNIQUE(run_id, move_type, version)
);

-- The core invariant of the versioning primitive, enforced at the storage
-- layer: at most one current frame per (run, move type).
CREATE UNIQUE INDEX IF NOT EXISTS idx_frames_one_current
    ON retrieval_frames(run_id, move_type) WHERE current = 1;

-- Move/evidence junction (append-only); the triple is the idempotency key
CREATE TABLE IF NOT EXISTS evidence_links (
    run_id         TEXT NOT NULL REFERENCES runs(id),
    move_event_id  TEXT NOT NULL REFERENCES move_events(id),
    evidence_ref   TEXT NOT NULL,
    role           TEXT NOT NULL,
    note           TEXT,
    created_at     TEXT NOT NULL,
    UNIQUE(move_event_id, evidence_ref, role)
);

-- Audit log (append-only, immutable)
CREATE TABLE IF NOT EXISTS audit_events (
    id             TEXT PRIMARY KEY,
    at             TEXT NOT NULL,
    event_type     TEXT NOT NULL,
    actor_kind     TEXT NOT NULL,
    actor_id       TEXT NOT NULL,
    run_id         TEXT,
    stage          TEXT,
    scenario       TEXT,
    invocation_id  TEXT,
    corrects       TEXT REFERENCES audit_events(id),
    payload        TEXT NOT NULL DEFAULT '{}'
);

CREATE TRIGGER IF NOT EXISTS audit_events_no_update
BEFORE UPDATE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_events_no_delete
BEFORE DELETE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit events are append-only');
END;

-- Per-run write counter, bumped in every write transaction
CREATE TABLE IF NOT EXISTS run_log_version (
    run_id   TEXT PRIMARY KEY REFERENCES runs(id),
    version  INTEGER NOT NULL DEFAULT 0
);

-- Indexes for the run-level slice reads
CREATE INDEX IF NOT EXISTS idx_move_events_run
    ON move_events(run_id, seq);
CREATE INDEX IF NOT EXISTS idx_tool_requests_move
    ON tool_requests(move_event_id);
CREATE INDEX IF NOT EXISTS idx_tool_invocations_run
    ON tool_invocations(run_id);
CREATE INDEX IF NOT EXISTS idx_evidence_links_run
    ON evidence_links(run_id);
CREATE INDEX IF NOT EXISTS idx_audit_events_run
    ON audit_events(run_id);
"#;

/// Additive migration for databases created before schema version 3, which
/// lacked the per-record confidence/uncertainty columns.
pub(crate) fn migrate_v3(conn: &Connection) -> anyhow::Result<()> {
    let cols = get_columns(conn, "move_events")?;
    add_column_if_missing(conn, &cols, "move_events", "confidence", "REAL")?;
    add_column_if_missing(conn, &cols, "move_events", "uncertainty_note", "TEXT")?;
    let cols = get_columns(conn, "tool_invocations")?;
    add_column_if_missing(conn, &cols, "tool_invocations", "confidence", "REAL")?;
    add_column_if_missing(conn, &cols, "tool_invocations", "uncertainty_note", "TEXT")?;
    Ok(())
}

pub(crate) fn get_columns(conn: &Connection, table: &str) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .context("prepare pragma table_info")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = HashSet::new();
    for r in rows {
        out.insert(r?);
    }
    Ok(out)
}

pub(crate) fn add_column_if_missing(
    conn: &Connection,
    cols: &HashSet<String>,
    table: &str,
    col: &str,
    ty: &str,
) -> anyhow::Result<()> {
    if !cols.contains(col) {
        let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, col, ty);
        conn.execute(&sql, []).context("alter table add column")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_is_valid_sql() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEDGER_SCHEMA).unwrap();
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEDGER_SCHEMA).unwrap();
        conn.execute_batch(LEDGER_SCHEMA).unwrap();
    }

    #[test]
    fn test_migrate_v3_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEDGER_SCHEMA).unwrap();
        migrate_v3(&conn).unwrap();
        migrate_v3(&conn).unwrap();
    }

    #[test]
    fn test_one_current_frame_index_rejects_duplicates() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEDGER_SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO runs (id, profile, created_at) VALUES ('run_1', 'p', 't')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO retrieval_frames (id, run_id, move_type, version, current, created_at)
             VALUES ('frm_1', 'run_1', 'evidence', 1, 1, 't')",
            [],
        )
        .unwrap();
        let err = conn
            .execute(
                "INSERT INTO retrieval_frames (id, run_id, move_type, version, current, created_at)
                 VALUES ('frm_2', 'run_1', 'evidence', 2, 1, 't')",
                [],
            )
            .unwrap_err();
        assert!(err.to_string().contains("UNIQUE constraint failed"));
    }

    #[test]
    fn test_audit_triggers_block_update_and_delete() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEDGER_SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO audit_events (id, at, event_type, actor_kind, actor_id, payload)
             VALUES ('aud_1', 't', 'x', 'human', 'u', '{}')",
            [],
        )
        .unwrap();

        let update = conn.execute("UPDATE audit_events SET event_type = 'y'", []);
        assert!(update
            .unwrap_err()
            .to_string()
            .contains("append-only"));

        let delete = conn.execute("DELETE FROM audit_events", []);
        assert!(delete.unwrap_err().to_string().contains("append-only"));
    }
}
