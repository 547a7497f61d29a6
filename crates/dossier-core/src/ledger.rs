//! The move ledger: ordered, revisable reasoning steps.
//!
//! The ledger enforces mechanics only: gapless per-run sequence numbers,
//! valid back-references, and the blocking-request gate on completion.
//! Which grammar transitions are sensible is a policy question for callers;
//! the canonical order is advisory.

use crate::audit::{insert_audit, AuditSpec};
use crate::errors::{LedgerError, Result};
use crate::storage::rows::MoveEventRow;
use crate::storage::Store;
use chrono::Utc;
use dossier_common::{
    Actor, EvidenceRef, MoveEvent, MoveEventId, MoveStatus, MoveType, RunId, MOVE_TYPES,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Cross-connection sequence races are absorbed here, not surfaced.
const APPEND_ATTEMPTS: u32 = 3;

/// Parameters for [`Store::append_move`].
#[derive(Debug, Clone)]
pub struct AppendMove {
    pub run_id: RunId,
    pub move_type: MoveType,
    /// Earlier move this one revisits. Must belong to the same run.
    pub backtrack_from: Option<MoveEventId>,
    pub backtrack_reason: Option<String>,
    pub inputs: serde_json::Value,
}

impl AppendMove {
    pub fn new(run_id: RunId, move_type: MoveType) -> Self {
        Self {
            run_id,
            move_type,
            backtrack_from: None,
            backtrack_reason: None,
            inputs: serde_json::Value::Null,
        }
    }

    pub fn backtracking_from(mut self, from: MoveEventId, reason: impl Into<String>) -> Self {
        self.backtrack_from = Some(from);
        self.backtrack_reason = Some(reason.into());
        self
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }
}

/// Parameters for [`Store::complete_move`].
#[derive(Debug, Clone, Default)]
pub struct CompleteMove {
    pub outputs: serde_json::Value,
    pub evidence_considered: Vec<EvidenceRef>,
    pub assumptions: Vec<String>,
    pub uncertainty_remaining: Vec<String>,
    pub confidence: Option<f64>,
    pub uncertainty_note: Option<String>,
}

/// Per-move-type status derived from the full event sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveStateView {
    by_position: [MoveStatus; 8],
}

impl MoveStateView {
    pub fn status(&self, move_type: MoveType) -> MoveStatus {
        self.by_position[move_type.position() as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (MoveType, MoveStatus)> + '_ {
        MOVE_TYPES
            .iter()
            .map(|mt| (*mt, self.by_position[mt.position() as usize]))
    }
}

impl Serialize for MoveStateView {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(8))?;
        for (mt, status) in self.iter() {
            map.serialize_entry(mt.code(), status.code())?;
        }
        map.end()
    }
}

/// Derive per-type statuses by replaying `(move_type, status)` pairs in seq
/// order: each event sets its own type's status and resets every type at a
/// strictly later grammar position back to pending. After a backtrack the
/// view reflects the new event, never the old one.
pub(crate) fn derive_state(
    events: impl IntoIterator<Item = (MoveType, MoveStatus)>,
) -> MoveStateView {
    let mut by_position = [MoveStatus::Pending; 8];
    for (move_type, status) in events {
        let pos = move_type.position() as usize;
        for later in by_position.iter_mut().skip(pos + 1) {
            *later = MoveStatus::Pending;
        }
        by_position[pos] = status;
    }
    MoveStateView { by_position }
}

impl Store {
    /// Append a move event to a run's ledger. The sequence number is the
    /// next per-run value, assigned inside the write transaction; the new
    /// event starts in progress.
    pub fn append_move(
        &self,
        req: &AppendMove,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<MoveEvent> {
        if req.backtrack_from.is_none() && req.backtrack_reason.is_some() {
            return Err(LedgerError::Validation(
                "backtrack reason given without a backtrack target".into(),
            ));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.try_append_move(req, actor, audit.clone());
            match result {
                Err(e) if e.is_retryable() && attempt < APPEND_ATTEMPTS => {
                    tracing::debug!(
                        run = %req.run_id,
                        attempt,
                        error = %e,
                        "sequence contention on append, retrying"
                    );
                    continue;
                }
                other => return other,
            }
        }
    }

    fn try_append_move(
        &self,
        req: &AppendMove,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<MoveEvent> {
        let event = self.with_write_txn(|conn| {
            Self::require_run(conn, &req.run_id)?;

            if let Some(from) = &req.backtrack_from {
                let owner: Option<String> = conn
                    .query_row(
                        "SELECT run_id FROM move_events WHERE id = ?1",
                        [from.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                match owner {
                    None => {
                        return Err(LedgerError::NotFound {
                            kind: "move event",
                            id: from.to_string(),
                        })
                    }
                    Some(owner) if owner != req.run_id.as_str() => {
                        return Err(LedgerError::Validation(format!(
                            "backtrack target {from} belongs to a different run"
                        )))
                    }
                    Some(_) => {}
                }
            }

            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM move_events WHERE run_id = ?1",
                [req.run_id.as_str()],
                |row| row.get(0),
            )?;

            let event = MoveEvent {
                id: MoveEventId::new(),
                run_id: req.run_id.clone(),
                move_type: req.move_type,
                seq,
                status: MoveStatus::InProgress,
                started_at: Utc::now(),
                ended_at: None,
                backtrack_from: req.backtrack_from.clone(),
                backtrack_reason: req.backtrack_reason.clone(),
                confidence: None,
                uncertainty_note: None,
                inputs: req.inputs.clone(),
                outputs: serde_json::Value::Null,
                evidence_considered: vec![],
                assumptions: vec![],
                uncertainty_remaining: vec![],
                invocations: vec![],
            };

            conn.execute(
                "INSERT INTO move_events (id, run_id, move_type, seq, status, started_at,
                                          backtrack_from, backtrack_reason, inputs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.id.as_str(),
                    event.run_id.as_str(),
                    event.move_type.code(),
                    event.seq,
                    event.status.code(),
                    event.started_at.to_rfc3339(),
                    event.backtrack_from.as_ref().map(|f| f.as_str()),
                    event.backtrack_reason,
                    serde_json::to_string(&event.inputs)
                        .map_err(|e| LedgerError::Validation(format!("bad inputs: {e}")))?,
                ],
            )?;
            Self::bump_log_version(conn, &req.run_id)?;
            insert_audit(conn, actor, audit, Some(&req.run_id))?;
            Ok(event)
        })?;

        tracing::debug!(
            run = %event.run_id,
            seq = event.seq,
            move_type = %event.move_type,
            backtrack = event.backtrack_from.is_some(),
            "move appended"
        );
        Ok(event)
    }

    /// Complete a move. Fails fast with [`LedgerError::PendingDependency`]
    /// while any blocking request for the move is unresolved; the check runs
    /// inside the write transaction, so there is no stale read. A blocking
    /// request that resolved with an error does not block — a recorded
    /// failure is an acceptable, traceable outcome.
    pub fn complete_move(
        &self,
        move_event_id: &MoveEventId,
        done: &CompleteMove,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<MoveEvent> {
        let event = self.with_write_txn(|conn| {
            let current = get_move_in(conn, move_event_id)?;
            if current.status == MoveStatus::Complete {
                return Err(LedgerError::InvalidTransition {
                    kind: "move",
                    id: move_event_id.to_string(),
                    from: current.status.code().to_string(),
                    to: MoveStatus::Complete.code().to_string(),
                });
            }

            let pending: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tool_requests
                 WHERE move_event_id = ?1 AND blocking = 1
                   AND status IN ('pending', 'started')",
                [move_event_id.as_str()],
                |row| row.get(0),
            )?;
            if pending > 0 {
                return Err(LedgerError::PendingDependency {
                    move_event_id: move_event_id.to_string(),
                    pending: pending as usize,
                });
            }

            // Invocations referenced through resolved requests are folded
            // into the event so the move carries its own tool lineage.
            let mut stmt = conn.prepare(
                "SELECT invocation_id FROM tool_requests
                 WHERE move_event_id = ?1 AND invocation_id IS NOT NULL
                 ORDER BY created_at ASC, id ASC",
            )?;
            let mut invocations: Vec<String> = current
                .invocations
                .iter()
                .map(|i| i.to_string())
                .collect();
            for inv in stmt.query_map([move_event_id.as_str()], |row| row.get::<_, String>(0))? {
                let inv = inv?;
                if !invocations.contains(&inv) {
                    invocations.push(inv);
                }
            }

            let ended_at = Utc::now();
            conn.execute(
                "UPDATE move_events
                 SET status = 'complete', ended_at = ?2, outputs = ?3,
                     evidence_considered = ?4, assumptions = ?5,
                     uncertainty_remaining = ?6, confidence = ?7,
                     uncertainty_note = ?8, invocations = ?9
                 WHERE id = ?1",
                params![
                    move_event_id.as_str(),
                    ended_at.to_rfc3339(),
                    serde_json::to_string(&done.outputs)
                        .map_err(|e| LedgerError::Validation(format!("bad outputs: {e}")))?,
                    serde_json::to_string(
                        &done
                            .evidence_considered
                            .iter()
                            .map(|e| e.as_str())
                            .collect::<Vec<_>>()
                    )
                    .expect("string list always serializes"),
                    serde_json::to_string(&done.assumptions)
                        .expect("string list always serializes"),
                    serde_json::to_string(&done.uncertainty_remaining)
                        .expect("string list always serializes"),
                    done.confidence,
                    done.uncertainty_note,
                    serde_json::to_string(&invocations).expect("string list always serializes"),
                ],
            )?;
            Self::bump_log_version(conn, &current.run_id)?;
            insert_audit(conn, actor, audit, Some(&current.run_id))?;
            get_move_in(conn, move_event_id)
        })?;

        tracing::debug!(
            run = %event.run_id,
            seq = event.seq,
            move_type = %event.move_type,
            "move completed"
        );
        Ok(event)
    }

    pub fn get_move(&self, move_event_id: &MoveEventId) -> Result<MoveEvent> {
        self.read(|conn| get_move_in(conn, move_event_id))
    }

    /// Per-move-type status for a run, derived from the full sequence.
    pub fn move_state(&self, run_id: &RunId) -> Result<MoveStateView> {
        self.read(|conn| {
            Self::require_run(conn, run_id)?;
            let mut stmt = conn.prepare(
                "SELECT move_type, status, seq FROM move_events
                 WHERE run_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map([run_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut events = Vec::new();
            for row in rows {
                let (type_code, status_code) = row?;
                let move_type: MoveType = type_code
                    .parse()
                    .map_err(|e| LedgerError::Database(format!("{e}")))?;
                let status = match status_code.as_str() {
                    "pending" => MoveStatus::Pending,
                    "in_progress" => MoveStatus::InProgress,
                    "complete" => MoveStatus::Complete,
                    other => {
                        return Err(LedgerError::Database(format!(
                            "unknown move status: {other}"
                        )))
                    }
                };
                events.push((move_type, status));
            }
            Ok(derive_state(events))
        })
    }
}

pub(crate) fn get_move_in(conn: &Connection, id: &MoveEventId) -> Result<MoveEvent> {
    let row = conn
        .query_row(
            "SELECT id, run_id, move_type, seq, status, started_at, ended_at,
                    backtrack_from, backtrack_reason, confidence, uncertainty_note,
                    inputs, outputs, evidence_considered, assumptions,
                    uncertainty_remaining, invocations
             FROM move_events WHERE id = ?1",
            [id.as_str()],
            |row| {
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
            },
        )
        .optional()?;
    row.ok_or_else(|| LedgerError::NotFound {
        kind: "move event",
        id: id.to_string(),
    })?
    .into_model()
}
