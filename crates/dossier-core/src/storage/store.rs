//! SQLite-backed ledger store.
//!
//! One `Store` wraps one connection behind a mutex; several stores may point
//! at the same file-backed database from different threads or processes, and
//! the schema's constraints (unique sequences, the partial current-frame
//! index, audit triggers) hold across connections. Every write runs inside a
//! `BEGIN IMMEDIATE` transaction and bumps the run's log version counter in
//! the same transaction.

use crate::audit::{insert_audit, AuditSpec};
use crate::errors::{LedgerError, Result};
use crate::storage::rows::{
    AuditEventRow, EvidenceLinkRow, MoveEventRow, RunRow, ToolInvocationRow, ToolRequestRow,
};
use crate::storage::schema::{migrate_v3, LEDGER_SCHEMA};
use chrono::Utc;
use dossier_common::{Actor, Run, RunId};
use dossier_trace::RunSlice;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// SQLite-backed ledger store.
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// Open a file-backed store with an explicit busy timeout.
    pub fn open_with_timeout(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn, busy_timeout_ms)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (tests, dry runs).
    pub fn memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn, DEFAULT_BUSY_TIMEOUT_MS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a store from an existing connection (multi-connection tests).
    pub fn from_connection(conn: Connection) -> Result<Self> {
        Self::init_connection(&conn, DEFAULT_BUSY_TIMEOUT_MS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
        conn.execute_batch(&format!("PRAGMA busy_timeout = {busy_timeout_ms}"))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        // WAL mode for file-backed DBs (no-op for in-memory)
        let _ = conn.execute("PRAGMA journal_mode = WAL", []);
        conn.execute_batch(LEDGER_SCHEMA)?;
        migrate_v3(conn).map_err(|e| LedgerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` write transaction.
    pub(crate) fn with_write_txn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = f(&conn);
        match &result {
            Ok(_) => {
                conn.execute("COMMIT", [])?;
            }
            Err(_) => {
                let _ = conn.execute("ROLLBACK", []);
            }
        }
        result
    }

    /// Read helper: no transaction, shared lock on the connection only.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Create a run. Immutable once created.
    pub fn create_run(
        &self,
        profile: &str,
        stage: Option<&str>,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<Run> {
        if profile.trim().is_empty() {
            return Err(LedgerError::Validation("run profile must not be empty".into()));
        }
        let run = Run {
            id: RunId::new(),
            profile: profile.to_string(),
            stage: stage.map(str::to_string),
            created_at: Utc::now(),
        };
        self.with_write_txn(|conn| {
            conn.execute(
                "INSERT INTO runs (id, profile, stage, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    run.id.as_str(),
                    run.profile,
                    run.stage,
                    run.created_at.to_rfc3339()
                ],
            )?;
            conn.execute(
                "INSERT INTO run_log_version (run_id, version) VALUES (?1, 0)",
                [run.id.as_str()],
            )?;
            Self::bump_log_version(conn, &run.id)?;
            insert_audit(conn, actor, audit, Some(&run.id))?;
            Ok(())
        })?;
        tracing::info!(run = %run.id, profile = %run.profile, "run created");
        Ok(run)
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<Run> {
        self.read(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, profile, stage, created_at FROM runs WHERE id = ?1",
                    [run_id.as_str()],
                    |row| {
                        Ok(RunRow {
                            id: row.get(0)?,
                            profile: row.get(1)?,
                            stage: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            row.ok_or_else(|| LedgerError::NotFound {
                kind: "run",
                id: run_id.to_string(),
            })?
            .into_model()
        })
    }

    /// Current per-run write counter. Bumped on every write transaction for
    /// the run; trace projections are cached against it.
    pub fn log_version(&self, run_id: &RunId) -> Result<i64> {
        self.read(|conn| Self::log_version_in(conn, run_id))
    }

    pub(crate) fn log_version_in(conn: &Connection, run_id: &RunId) -> Result<i64> {
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM run_log_version WHERE run_id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        version.ok_or_else(|| LedgerError::NotFound {
            kind: "run",
            id: run_id.to_string(),
        })
    }

    pub(crate) fn bump_log_version(conn: &Connection, run_id: &RunId) -> Result<()> {
        let changed = conn.execute(
            "UPDATE run_log_version SET version = version + 1 WHERE run_id = ?1",
            [run_id.as_str()],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound {
                kind: "run",
                id: run_id.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn require_run(conn: &Connection, run_id: &RunId) -> Result<()> {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM runs WHERE id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(LedgerError::NotFound {
                kind: "run",
                id: run_id.to_string(),
            });
        }
        Ok(())
    }

    /// Select the full run-level slice for projection, in the projector's
    /// documented ordering.
    pub fn run_slice(&self, run_id: &RunId) -> Result<RunSlice> {
        self.read(|conn| {
            Self::require_run(conn, run_id)?;
            let log_version = Self::log_version_in(conn, run_id)?;

            let mut stmt = conn.prepare(
                "SELECT id, run_id, move_type, seq, status, started_at, ended_at,
                        backtrack_from, backtrack_reason, confidence, uncertainty_note,
                        inputs, outputs, evidence_considered, assumptions,
                        uncertainty_remaining, invocations
                 FROM move_events WHERE run_id = ?1 ORDER BY seq ASC",
            )?;
            let moves = stmt
                .query_map([run_id.as_str()], |row| {
                    Ok(MoveEventRow {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        move_type: row.get(2)?,
                        seq: row.get(3)?,
                        status: row.get(4)?,
                        started_at: row.get(5)?,
                        ended_at: row.get(6)?,
                        backtrack_from: row.get(7)?,
                        backtrack_reason: row.get(8)?,
                        confidence: row.get(9)?,
                        uncertainty_note: row.get(10)?,
                        inputs: row.get(11)?,
                        outputs: row.get(12)?,
                        evidence_considered: row.get(13)?,
                        assumptions: row.get(14)?,
                        uncertainty_remaining: row.get(15)?,
                        invocations: row.get(16)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .map(MoveEventRow::into_model)
                .collect::<Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(
                "SELECT id, run_id, tool_name, inputs, outputs, status, started_at,
                        ended_at, confidence, uncertainty_note
                 FROM tool_invocations WHERE run_id = ?1 ORDER BY started_at ASC, id ASC",
            )?;
            let invocations = stmt
                .query_map([run_id.as_str()], |row| {
                    Ok(ToolInvocationRow {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        tool_name: row.get(2)?,
                        inputs: row.get(3)?,
                        outputs: row.get(4)?,
                        status: row.get(5)?,
                        started_at: row.get(6)?,
                        ended_at: row.get(7)?,
                        confidence: row.get(8)?,
                        uncertainty_note: row.get(9)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .map(ToolInvocationRow::into_model)
                .collect::<Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(
                "SELECT id, run_id, move_event_id, move_type, tool_name, purpose, inputs,
                        blocking, status, created_at, resolved_at, invocation_id, evidence, error
                 FROM tool_requests WHERE run_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let requests = stmt
                .query_map([run_id.as_str()], |row| {
                    Ok(ToolRequestRow {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        move_event_id: row.get(2)?,
                        move_type: row.get(3)?,
                        tool_name: row.get(4)?,
                        purpose: row.get(5)?,
                        inputs: row.get(6)?,
                        blocking: row.get(7)?,
                        status: row.get(8)?,
                        created_at: row.get(9)?,
                        resolved_at: row.get(10)?,
                        invocation_id: row.get(11)?,
                        evidence: row.get(12)?,
                        error: row.get(13)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .map(ToolRequestRow::into_model)
                .collect::<Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(
                "SELECT run_id, move_event_id, evidence_ref, role, note, created_at
                 FROM evidence_links WHERE run_id = ?1
                 ORDER BY created_at ASC, evidence_ref ASC, role ASC",
            )?;
            let links = stmt
                .query_map([run_id.as_str()], |row| {
                    Ok(EvidenceLinkRow {
                        run_id: row.get(0)?,
                        move_event_id: row.get(1)?,
                        evidence_ref: row.get(2)?,
                        role: row.get(3)?,
                        note: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .map(EvidenceLinkRow::into_model)
                .collect::<Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(
                "SELECT id, at, event_type, actor_kind, actor_id, run_id, stage, scenario,
                        invocation_id, corrects, payload
                 FROM audit_events WHERE run_id = ?1 ORDER BY at ASC, id ASC",
            )?;
            let audits = stmt
                .query_map([run_id.as_str()], |row| {
                    Ok(AuditEventRow {
                        id: row.get(0)?,
                        at: row.get(1)?,
                        event_type: row.get(2)?,
                        actor_kind: row.get(3)?,
                        actor_id: row.get(4)?,
                        run_id: row.get(5)?,
                        stage: row.get(6)?,
                        scenario: row.get(7)?,
                        invocation_id: row.get(8)?,
                        corrects: row.get(9)?,
                        payload: row.get(10)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .map(AuditEventRow::into_model)
                .collect::<Result<Vec<_>>>()?;

            Ok(RunSlice {
                run_id: run_id.clone(),
                log_version,
                moves,
                invocations,
                requests,
                links,
                audits,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::audit_types;

    fn spec() -> AuditSpec {
        AuditSpec::new(audit_types::RUN_CREATED, serde_json::json!({"via": "test"}))
    }

    #[test]
    fn test_store_bootstraps_schema() {
        let store = Store::memory().unwrap();
        let conn = store.conn.lock().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"runs".to_string()));
        assert!(tables.contains(&"move_events".to_string()));
        assert!(tables.contains(&"retrieval_frames".to_string()));
        assert!(tables.contains(&"audit_events".to_string()));
        assert!(tables.contains(&"run_log_version".to_string()));
    }

    #[test]
    fn test_store_sets_foreign_keys() {
        let store = Store::memory().unwrap();
        let conn = store.conn.lock().unwrap();
        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_create_and_get_run() {
        let store = Store::memory().unwrap();
        let actor = Actor::human("officer-1");
        let run = store
            .create_run("local-plan-2026", Some("site:riverside"), &actor, spec())
            .unwrap();

        let got = store.get_run(&run.id).unwrap();
        assert_eq!(got.profile, "local-plan-2026");
        assert_eq!(got.stage.as_deref(), Some("site:riverside"));
    }

    #[test]
    fn test_empty_profile_is_rejected_before_any_write() {
        let store = Store::memory().unwrap();
        let err = store
            .create_run("  ", None, &Actor::human("u"), spec())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_create_run_bumps_log_version_and_audits() {
        let store = Store::memory().unwrap();
        let run = store
            .create_run("p", None, &Actor::agent("bot"), spec())
            .unwrap();
        assert_eq!(store.log_version(&run.id).unwrap(), 1);

        let slice = store.run_slice(&run.id).unwrap();
        assert_eq!(slice.audits.len(), 1);
        assert_eq!(slice.audits[0].event_type, audit_types::RUN_CREATED);
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let store = Store::memory().unwrap();
        let err = store.get_run(&RunId::from("run_missing")).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { kind: "run", .. }));
    }
}
