//! Audit log: explicit actor actions, strictly append-only.
//!
//! Nothing is ever inferred into this log. Every state-changing store
//! operation takes an [`AuditSpec`] and writes it inside the same
//! transaction as the change itself, so a mutation without an audit record
//! is not expressible through the API. Corrections are new events that
//! reference the event being corrected; UPDATE and DELETE are rejected by
//! triggers at the SQLite layer.

use crate::errors::{LedgerError, Result};
use crate::storage::rows::AuditEventRow;
use crate::storage::Store;
use chrono::Utc;
use dossier_common::{Actor, AuditEvent, AuditEventId, AuditRefs, RunId};
use rusqlite::{params, Connection};

/// Audit event type constants.
pub mod audit_types {
    pub const RUN_CREATED: &str = "ledger.run.created";
    pub const MOVE_APPENDED: &str = "ledger.move.appended";
    pub const MOVE_COMPLETED: &str = "ledger.move.completed";
    pub const REQUEST_QUEUED: &str = "ledger.request.queued";
    pub const REQUEST_STARTED: &str = "ledger.request.started";
    pub const REQUEST_RESOLVED: &str = "ledger.request.resolved";
    pub const REQUEST_CANCELLED: &str = "ledger.request.cancelled";
    pub const INVOCATION_STARTED: &str = "ledger.invocation.started";
    pub const INVOCATION_FINISHED: &str = "ledger.invocation.finished";
    pub const INVOCATION_CANCELLED: &str = "ledger.invocation.cancelled";
    pub const FRAME_PUBLISHED: &str = "ledger.frame.published";
    pub const EVIDENCE_LINKED: &str = "ledger.evidence.linked";
}

/// The audit record a state-changing caller must supply.
#[derive(Debug, Clone)]
pub struct AuditSpec {
    pub event_type: String,
    /// Structured payload; must be a JSON object.
    pub payload: serde_json::Value,
    pub refs: AuditRefs,
}

impl AuditSpec {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            refs: AuditRefs::default(),
        }
    }

    pub fn with_refs(mut self, refs: AuditRefs) -> Self {
        self.refs = refs;
        self
    }
}

/// Insert an audit row inside an open transaction. `default_run` fills the
/// run reference when `spec.refs` does not carry one.
pub(crate) fn insert_audit(
    conn: &Connection,
    actor: &Actor,
    spec: AuditSpec,
    default_run: Option<&RunId>,
) -> Result<AuditEventId> {
    if !spec.payload.is_object() {
        return Err(LedgerError::Validation(
            "audit payload must be a JSON object".into(),
        ));
    }
    if spec.event_type.trim().is_empty() {
        return Err(LedgerError::Validation(
            "audit event type must not be empty".into(),
        ));
    }
    let id = AuditEventId::new();
    let run_ref = spec
        .refs
        .run_id
        .clone()
        .or_else(|| default_run.cloned());
    conn.execute(
        "INSERT INTO audit_events (id, at, event_type, actor_kind, actor_id, run_id,
                                   stage, scenario, invocation_id, corrects, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id.as_str(),
            Utc::now().to_rfc3339(),
            spec.event_type,
            actor.kind.code(),
            actor.id,
            run_ref.as_ref().map(|r| r.as_str()),
            spec.refs.stage,
            spec.refs.scenario,
            spec.refs.invocation_id.as_ref().map(|i| i.as_str()),
            spec.refs.corrects.as_ref().map(|c| c.as_str()),
            serde_json::to_string(&spec.payload)
                .map_err(|e| LedgerError::Validation(format!("unserializable payload: {e}")))?,
        ],
    )?;
    Ok(id)
}

impl Store {
    /// Record a standalone audit event (e.g. a sign-off or a correction that
    /// is not tied to another ledger write). Pure insert; fails only on
    /// structural validation.
    pub fn record_audit(&self, actor: &Actor, spec: AuditSpec) -> Result<AuditEventId> {
        let run_ref = spec.refs.run_id.clone();
        self.with_write_txn(|conn| {
            if let Some(run) = &run_ref {
                Self::require_run(conn, run)?;
            }
            let id = insert_audit(conn, actor, spec, None)?;
            if let Some(run) = &run_ref {
                Self::bump_log_version(conn, run)?;
            }
            Ok(id)
        })
    }

    /// All audit events for a run, oldest first.
    pub fn audit_events(&self, run_id: &RunId) -> Result<Vec<AuditEvent>> {
        self.read(|conn| {
            Self::require_run(conn, run_id)?;
            let mut stmt = conn.prepare(
                "SELECT id, at, event_type, actor_kind, actor_id, run_id, stage, scenario,
                        invocation_id, corrects, payload
                 FROM audit_events WHERE run_id = ?1 ORDER BY at ASC, id ASC",
            )?;
            let rows = stmt
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
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(AuditEventRow::into_model).collect()
        })
    }
}
