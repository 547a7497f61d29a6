//! Tool request queue and invocation log.
//!
//! A request is a move's declared intention to obtain evidence; it resolves
//! into zero-or-one invocations and has exactly one terminal outcome. The
//! engine records failures, it does not retry them: a retry is a new request
//! issued by the caller. No lock is held across a tool's actual execution —
//! only the terminal state transition is serialized.

use crate::audit::{insert_audit, AuditSpec};
use crate::errors::{LedgerError, Result};
use crate::ledger::get_move_in;
use crate::storage::rows::{ToolInvocationRow, ToolRequestRow};
use crate::storage::Store;
use chrono::Utc;
use dossier_common::{
    Actor, EvidenceRef, InvocationId, InvocationStatus, RequestId, RequestStatus, RunId,
    ToolInvocation, ToolRequest,
};
use rusqlite::{params, Connection, OptionalExtension};

/// Parameters for [`Store::queue_request`].
#[derive(Debug, Clone)]
pub struct QueueRequest {
    pub run_id: RunId,
    pub move_event_id: dossier_common::MoveEventId,
    pub tool_name: String,
    pub purpose: String,
    pub inputs: serde_json::Value,
    pub blocking: bool,
}

/// Terminal outcome of a request: all-or-nothing. A completed request
/// carries its invocation and any produced evidence; an errored request
/// carries only the error text.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Completed {
        invocation_id: InvocationId,
        evidence: Vec<EvidenceRef>,
    },
    Error {
        message: String,
    },
}

impl Store {
    /// Queue a request in status pending. The move type is taken from the
    /// originating move, which must belong to the given run.
    pub fn queue_request(
        &self,
        req: &QueueRequest,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolRequest> {
        if req.tool_name.trim().is_empty() {
            return Err(LedgerError::Validation("tool name must not be empty".into()));
        }
        let request = self.with_write_txn(|conn| {
            let origin = get_move_in(conn, &req.move_event_id)?;
            if origin.run_id != req.run_id {
                return Err(LedgerError::Validation(format!(
                    "move {} belongs to a different run",
                    req.move_event_id
                )));
            }
            let request = ToolRequest {
                id: RequestId::new(),
                run_id: req.run_id.clone(),
                move_event_id: req.move_event_id.clone(),
                move_type: origin.move_type,
                tool_name: req.tool_name.clone(),
                purpose: req.purpose.clone(),
                inputs: req.inputs.clone(),
                blocking: req.blocking,
                status: RequestStatus::Pending,
                created_at: Utc::now(),
                resolved_at: None,
                invocation_id: None,
                evidence: vec![],
                error: None,
            };
            conn.execute(
                "INSERT INTO tool_requests (id, run_id, move_event_id, move_type, tool_name,
                                            purpose, inputs, blocking, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    request.id.as_str(),
                    request.run_id.as_str(),
                    request.move_event_id.as_str(),
                    request.move_type.code(),
                    request.tool_name,
                    request.purpose,
                    serde_json::to_string(&request.inputs)
                        .map_err(|e| LedgerError::Validation(format!("bad inputs: {e}")))?,
                    request.blocking,
                    request.status.code(),
                    request.created_at.to_rfc3339(),
                ],
            )?;
            Self::bump_log_version(conn, &req.run_id)?;
            insert_audit(conn, actor, audit, Some(&req.run_id))?;
            Ok(request)
        })?;
        tracing::debug!(
            run = %request.run_id,
            request = %request.id,
            tool = %request.tool_name,
            blocking = request.blocking,
            "tool request queued"
        );
        Ok(request)
    }

    /// Pending → started. Any other source state is an invalid transition.
    pub fn start_request(
        &self,
        request_id: &RequestId,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolRequest> {
        self.with_write_txn(|conn| {
            let request = get_request_in(conn, request_id)?;
            if request.status != RequestStatus::Pending {
                return Err(LedgerError::InvalidTransition {
                    kind: "tool request",
                    id: request_id.to_string(),
                    from: request.status.code().to_string(),
                    to: RequestStatus::Started.code().to_string(),
                });
            }
            conn.execute(
                "UPDATE tool_requests SET status = 'started' WHERE id = ?1",
                [request_id.as_str()],
            )?;
            Self::bump_log_version(conn, &request.run_id)?;
            insert_audit(conn, actor, audit, Some(&request.run_id))?;
            get_request_in(conn, request_id)
        })
    }

    /// Started → completed | error. The terminal transition is the only
    /// serialized step; the tool's actual execution happened outside any
    /// lock. A completed outcome must name an existing invocation.
    pub fn resolve_request(
        &self,
        request_id: &RequestId,
        outcome: &RequestOutcome,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolRequest> {
        let request = self.with_write_txn(|conn| {
            let request = get_request_in(conn, request_id)?;
            let to = match outcome {
                RequestOutcome::Completed { .. } => RequestStatus::Completed,
                RequestOutcome::Error { .. } => RequestStatus::Error,
            };
            if request.status != RequestStatus::Started {
                return Err(LedgerError::InvalidTransition {
                    kind: "tool request",
                    id: request_id.to_string(),
                    from: request.status.code().to_string(),
                    to: to.code().to_string(),
                });
            }
            let resolved_at = Utc::now().to_rfc3339();
            match outcome {
                RequestOutcome::Completed {
                    invocation_id,
                    evidence,
                } => {
                    // The invocation must exist; a dangling reference would
                    // break the provenance chain.
                    get_invocation_in(conn, invocation_id)?;
                    conn.execute(
                        "UPDATE tool_requests
                         SET status = 'completed', resolved_at = ?2, invocation_id = ?3,
                             evidence = ?4, error = NULL
                         WHERE id = ?1",
                        params![
                            request_id.as_str(),
                            resolved_at,
                            invocation_id.as_str(),
                            serde_json::to_string(
                                &evidence.iter().map(|e| e.as_str()).collect::<Vec<_>>()
                            )
                            .expect("string list always serializes"),
                        ],
                    )?;
                }
                RequestOutcome::Error { message } => {
                    if message.trim().is_empty() {
                        return Err(LedgerError::Validation(
                            "error outcome requires a message".into(),
                        ));
                    }
                    conn.execute(
                        "UPDATE tool_requests
                         SET status = 'error', resolved_at = ?2, error = ?3,
                             invocation_id = NULL, evidence = '[]'
                         WHERE id = ?1",
                        params![request_id.as_str(), resolved_at, message],
                    )?;
                }
            }
            Self::bump_log_version(conn, &request.run_id)?;
            insert_audit(conn, actor, audit, Some(&request.run_id))?;
            get_request_in(conn, request_id)
        })?;
        tracing::debug!(
            run = %request.run_id,
            request = %request.id,
            status = request.status.code(),
            "tool request resolved"
        );
        Ok(request)
    }

    /// Caller-driven cancellation. The request resolves as an error;
    /// everything already in the ledger stays.
    pub fn cancel_request(
        &self,
        request_id: &RequestId,
        reason: &str,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolRequest> {
        self.with_write_txn(|conn| {
            let request = get_request_in(conn, request_id)?;
            if request.status.is_terminal() {
                return Err(LedgerError::InvalidTransition {
                    kind: "tool request",
                    id: request_id.to_string(),
                    from: request.status.code().to_string(),
                    to: RequestStatus::Error.code().to_string(),
                });
            }
            conn.execute(
                "UPDATE tool_requests
                 SET status = 'error', resolved_at = ?2, error = ?3
                 WHERE id = ?1",
                params![
                    request_id.as_str(),
                    Utc::now().to_rfc3339(),
                    format!("cancelled: {reason}"),
                ],
            )?;
            Self::bump_log_version(conn, &request.run_id)?;
            insert_audit(conn, actor, audit, Some(&request.run_id))?;
            get_request_in(conn, request_id)
        })
    }

    /// Record the start of an actual tool execution.
    pub fn begin_invocation(
        &self,
        run_id: Option<&RunId>,
        tool_name: &str,
        inputs: serde_json::Value,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolInvocation> {
        if tool_name.trim().is_empty() {
            return Err(LedgerError::Validation("tool name must not be empty".into()));
        }
        self.with_write_txn(|conn| {
            if let Some(run) = run_id {
                Self::require_run(conn, run)?;
            }
            let invocation = ToolInvocation {
                id: InvocationId::new(),
                run_id: run_id.cloned(),
                tool_name: tool_name.to_string(),
                inputs,
                outputs: serde_json::Value::Null,
                status: InvocationStatus::Running,
                started_at: Utc::now(),
                ended_at: None,
                confidence: None,
                uncertainty_note: None,
            };
            conn.execute(
                "INSERT INTO tool_invocations (id, run_id, tool_name, inputs, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    invocation.id.as_str(),
                    invocation.run_id.as_ref().map(|r| r.as_str()),
                    invocation.tool_name,
                    serde_json::to_string(&invocation.inputs)
                        .map_err(|e| LedgerError::Validation(format!("bad inputs: {e}")))?,
                    invocation.status.code(),
                    invocation.started_at.to_rfc3339(),
                ],
            )?;
            if let Some(run) = run_id {
                Self::bump_log_version(conn, run)?;
            }
            insert_audit(conn, actor, audit, run_id)?;
            Ok(invocation)
        })
    }

    /// Running → complete | failed. Terminal invocations are immutable.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_invocation(
        &self,
        invocation_id: &InvocationId,
        status: InvocationStatus,
        outputs: serde_json::Value,
        confidence: Option<f64>,
        uncertainty_note: Option<&str>,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolInvocation> {
        if !status.is_terminal() {
            return Err(LedgerError::Validation(
                "finish_invocation requires a terminal status".into(),
            ));
        }
        self.with_write_txn(|conn| {
            let invocation = get_invocation_in(conn, invocation_id)?;
            if invocation.status.is_terminal() {
                return Err(LedgerError::InvalidTransition {
                    kind: "tool invocation",
                    id: invocation_id.to_string(),
                    from: invocation.status.code().to_string(),
                    to: status.code().to_string(),
                });
            }
            conn.execute(
                "UPDATE tool_invocations
                 SET status = ?2, outputs = ?3, ended_at = ?4, confidence = ?5,
                     uncertainty_note = ?6
                 WHERE id = ?1",
                params![
                    invocation_id.as_str(),
                    status.code(),
                    serde_json::to_string(&outputs)
                        .map_err(|e| LedgerError::Validation(format!("bad outputs: {e}")))?,
                    Utc::now().to_rfc3339(),
                    confidence,
                    uncertainty_note,
                ],
            )?;
            if let Some(run) = &invocation.run_id {
                Self::bump_log_version(conn, run)?;
            }
            insert_audit(conn, actor, audit, invocation.run_id.as_ref())?;
            get_invocation_in(conn, invocation_id)
        })
    }

    /// Cancel a still-running invocation: Running → Failed, with the reason
    /// recorded as the uncertainty note. Terminal invocations are immutable,
    /// so cancelling one is an invalid transition.
    pub fn cancel_invocation(
        &self,
        invocation_id: &InvocationId,
        reason: &str,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolInvocation> {
        self.with_write_txn(|conn| {
            let invocation = get_invocation_in(conn, invocation_id)?;
            if invocation.status.is_terminal() {
                return Err(LedgerError::InvalidTransition {
                    kind: "tool invocation",
                    id: invocation_id.to_string(),
                    from: invocation.status.code().to_string(),
                    to: InvocationStatus::Failed.code().to_string(),
                });
            }
            conn.execute(
                "UPDATE tool_invocations
                 SET status = 'failed', ended_at = ?2, uncertainty_note = ?3
                 WHERE id = ?1",
                params![
                    invocation_id.as_str(),
                    Utc::now().to_rfc3339(),
                    format!("cancelled: {reason}"),
                ],
            )?;
            if let Some(run) = &invocation.run_id {
                Self::bump_log_version(conn, run)?;
            }
            insert_audit(conn, actor, audit, invocation.run_id.as_ref())?;
            get_invocation_in(conn, invocation_id)
        })
    }

    pub fn get_request(&self, request_id: &RequestId) -> Result<ToolRequest> {
        self.read(|conn| get_request_in(conn, request_id))
    }

    pub fn get_invocation(&self, invocation_id: &InvocationId) -> Result<ToolInvocation> {
        self.read(|conn| get_invocation_in(conn, invocation_id))
    }

    /// All requests for a move, oldest first.
    pub fn requests_for_move(
        &self,
        move_event_id: &dossier_common::MoveEventId,
    ) -> Result<Vec<ToolRequest>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, move_event_id, move_type, tool_name, purpose, inputs,
                        blocking, status, created_at, resolved_at, invocation_id, evidence, error
                 FROM tool_requests WHERE move_event_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([move_event_id.as_str()], request_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(ToolRequestRow::into_model).collect()
        })
    }
}

fn request_row(row: &rusqlite::Row<'_>) -> std::result::Result<ToolRequestRow, rusqlite::Error> {
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
}

pub(crate) fn get_request_in(conn: &Connection, id: &RequestId) -> Result<ToolRequest> {
    let row = conn
        .query_row(
            "SELECT id, run_id, move_event_id, move_type, tool_name, purpose, inputs,
                    blocking, status, created_at, resolved_at, invocation_id, evidence, error
             FROM tool_requests WHERE id = ?1",
            [id.as_str()],
            request_row,
        )
        .optional()?;
    row.ok_or_else(|| LedgerError::NotFound {
        kind: "tool request",
        id: id.to_string(),
    })?
    .into_model()
}

pub(crate) fn get_invocation_in(conn: &Connection, id: &InvocationId) -> Result<ToolInvocation> {
    let row = conn
        .query_row(
            "SELECT id, run_id, tool_name, inputs, outputs, status, started_at, ended_at,
                    confidence, uncertainty_note
             FROM tool_invocations WHERE id = ?1",
            [id.as_str()],
            |row| {
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
            },
        )
        .optional()?;
    row.ok_or_else(|| LedgerError::NotFound {
        kind: "tool invocation",
        id: id.to_string(),
    })?
    .into_model()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::audit_types;
    use crate::ledger::AppendMove;
    use dossier_common::{MoveEventId, MoveType};

    fn spec(t: &str) -> AuditSpec {
        AuditSpec::new(t, serde_json::json!({}))
    }

    fn fixture() -> (Store, RunId, MoveEventId, Actor) {
        let store = Store::memory().unwrap();
        let actor = Actor::agent("planner");
        let run = store
            .create_run("p", None, &actor, spec(audit_types::RUN_CREATED))
            .unwrap()
            .id;
        let mv = store
            .append_move(
                &AppendMove::new(run.clone(), MoveType::Evidence),
                &actor,
                spec(audit_types::MOVE_APPENDED),
            )
            .unwrap()
            .id;
        (store, run, mv, actor)
    }

    fn queue(store: &Store, run: &RunId, mv: &MoveEventId, actor: &Actor, blocking: bool) -> ToolRequest {
        store
            .queue_request(
                &QueueRequest {
                    run_id: run.clone(),
                    move_event_id: mv.clone(),
                    tool_name: "policy_search".into(),
                    purpose: "find flood policies".into(),
                    inputs: serde_json::json!({"q": "flood"}),
                    blocking,
                },
                actor,
                spec(audit_types::REQUEST_QUEUED),
            )
            .unwrap()
    }

    #[test]
    fn queued_request_inherits_move_type() {
        let (store, run, mv, actor) = fixture();
        let request = queue(&store, &run, &mv, &actor, true);
        assert_eq!(request.move_type, MoveType::Evidence);
        assert_eq!(request.status, RequestStatus::Pending);
    }

    #[test]
    fn resolve_requires_started() {
        let (store, run, mv, actor) = fixture();
        let request = queue(&store, &run, &mv, &actor, false);
        let err = store
            .resolve_request(
                &request.id,
                &RequestOutcome::Error {
                    message: "timeout".into(),
                },
                &actor,
                spec(audit_types::REQUEST_RESOLVED),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn completed_outcome_carries_invocation_and_evidence() {
        let (store, run, mv, actor) = fixture();
        let request = queue(&store, &run, &mv, &actor, true);
        store
            .start_request(&request.id, &actor, spec(audit_types::REQUEST_STARTED))
            .unwrap();

        let invocation = store
            .begin_invocation(
                Some(&run),
                "policy_search",
                serde_json::json!({"q": "flood"}),
                &actor,
                spec(audit_types::INVOCATION_STARTED),
            )
            .unwrap();
        store
            .finish_invocation(
                &invocation.id,
                InvocationStatus::Complete,
                serde_json::json!({"hits": 2}),
                Some(0.9),
                None,
                &actor,
                spec(audit_types::INVOCATION_FINISHED),
            )
            .unwrap();

        let resolved = store
            .resolve_request(
                &request.id,
                &RequestOutcome::Completed {
                    invocation_id: invocation.id.clone(),
                    evidence: vec![EvidenceRef::from("ev:pol-12")],
                },
                &actor,
                spec(audit_types::REQUEST_RESOLVED),
            )
            .unwrap();
        assert_eq!(resolved.status, RequestStatus::Completed);
        assert_eq!(resolved.invocation_id, Some(invocation.id));
        assert_eq!(resolved.evidence, vec![EvidenceRef::from("ev:pol-12")]);
        assert!(resolved.error.is_none());
    }

    #[test]
    fn completed_outcome_rejects_unknown_invocation() {
        let (store, run, mv, actor) = fixture();
        let request = queue(&store, &run, &mv, &actor, true);
        store
            .start_request(&request.id, &actor, spec(audit_types::REQUEST_STARTED))
            .unwrap();
        let err = store
            .resolve_request(
                &request.id,
                &RequestOutcome::Completed {
                    invocation_id: InvocationId::from("inv_ghost"),
                    evidence: vec![],
                },
                &actor,
                spec(audit_types::REQUEST_RESOLVED),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { kind: "tool invocation", .. }));
        // Rollback: the request is still started.
        let request = store.get_request(&request.id).unwrap();
        assert_eq!(request.status, RequestStatus::Started);
    }

    #[test]
    fn error_outcome_carries_only_error_text() {
        let (store, run, mv, actor) = fixture();
        let request = queue(&store, &run, &mv, &actor, true);
        store
            .start_request(&request.id, &actor, spec(audit_types::REQUEST_STARTED))
            .unwrap();
        let resolved = store
            .resolve_request(
                &request.id,
                &RequestOutcome::Error {
                    message: "gazetteer unreachable".into(),
                },
                &actor,
                spec(audit_types::REQUEST_RESOLVED),
            )
            .unwrap();
        assert_eq!(resolved.status, RequestStatus::Error);
        assert!(resolved.invocation_id.is_none());
        assert!(resolved.evidence.is_empty());
        assert_eq!(resolved.error.as_deref(), Some("gazetteer unreachable"));
    }

    #[test]
    fn terminal_request_cannot_be_resolved_again() {
        let (store, run, mv, actor) = fixture();
        let request = queue(&store, &run, &mv, &actor, true);
        store
            .start_request(&request.id, &actor, spec(audit_types::REQUEST_STARTED))
            .unwrap();
        store
            .resolve_request(
                &request.id,
                &RequestOutcome::Error {
                    message: "timeout".into(),
                },
                &actor,
                spec(audit_types::REQUEST_RESOLVED),
            )
            .unwrap();
        let err = store
            .resolve_request(
                &request.id,
                &RequestOutcome::Error {
                    message: "again".into(),
                },
                &actor,
                spec(audit_types::REQUEST_RESOLVED),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn cancellation_resolves_as_error() {
        let (store, run, mv, actor) = fixture();
        let request = queue(&store, &run, &mv, &actor, true);
        store
            .start_request(&request.id, &actor, spec(audit_types::REQUEST_STARTED))
            .unwrap();
        let cancelled = store
            .cancel_request(
                &request.id,
                "operator abort",
                &actor,
                spec(audit_types::REQUEST_CANCELLED),
            )
            .unwrap();
        assert_eq!(cancelled.status, RequestStatus::Error);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled: operator abort"));
    }

    #[test]
    fn finished_invocation_is_immutable() {
        let (store, run, _, actor) = fixture();
        let invocation = store
            .begin_invocation(
                Some(&run),
                "site_model",
                serde_json::Value::Null,
                &actor,
                spec(audit_types::INVOCATION_STARTED),
            )
            .unwrap();
        store
            .finish_invocation(
                &invocation.id,
                InvocationStatus::Failed,
                serde_json::Value::Null,
                None,
                Some("model crashed"),
                &actor,
                spec(audit_types::INVOCATION_FINISHED),
            )
            .unwrap();
        let err = store
            .finish_invocation(
                &invocation.id,
                InvocationStatus::Complete,
                serde_json::Value::Null,
                None,
                None,
                &actor,
                spec(audit_types::INVOCATION_FINISHED),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn cancelled_invocation_fails_with_reason() {
        let (store, run, _, actor) = fixture();
        let invocation = store
            .begin_invocation(
                Some(&run),
                "site_model",
                serde_json::Value::Null,
                &actor,
                spec(audit_types::INVOCATION_STARTED),
            )
            .unwrap();
        let cancelled = store
            .cancel_invocation(
                &invocation.id,
                "operator abort",
                &actor,
                spec(audit_types::INVOCATION_CANCELLED),
            )
            .unwrap();
        assert_eq!(cancelled.status, InvocationStatus::Failed);
        assert_eq!(
            cancelled.uncertainty_note.as_deref(),
            Some("cancelled: operator abort")
        );
        let err = store
            .cancel_invocation(
                &invocation.id,
                "again",
                &actor,
                spec(audit_types::INVOCATION_CANCELLED),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn batch_invocation_without_run_is_allowed() {
        let (store, _, _, actor) = fixture();
        let invocation = store
            .begin_invocation(
                None,
                "bulk_ingest",
                serde_json::Value::Null,
                &actor,
                spec(audit_types::INVOCATION_STARTED),
            )
            .unwrap();
        assert!(invocation.run_id.is_none());
    }
}
