//! Record types persisted by the ledger.
//!
//! Each record set is append-mostly; references between records are by
//! opaque identifier only. Structured inputs/outputs/payloads are carried as
//! `serde_json::Value` and persisted as JSON text.

use crate::grammar::MoveType;
use crate::ids::{
    AuditEventId, EvidenceRef, FrameId, InvocationId, MoveEventId, RequestId, RunId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who performed an explicit action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Human,
    Agent,
}

impl ActorKind {
    pub fn code(self) -> &'static str {
        match self {
            ActorKind::Human => "human",
            ActorKind::Agent => "agent",
        }
    }
}

/// An acting identity, human or agent. Every state-changing engine call
/// names one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
}

impl Actor {
    pub fn human(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Human,
            id: id.into(),
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Agent,
            id: id.into(),
        }
    }
}

/// Top-level execution context. Immutable once created; owns all other
/// entities by reference, not containment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// Profile/configuration tag chosen by the caller (e.g. a policy suite).
    pub profile: String,
    /// Optional anchor into an external staging concept (site, scenario).
    #[serde(default)]
    pub stage: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveStatus {
    Pending,
    InProgress,
    Complete,
}

impl MoveStatus {
    pub fn code(self) -> &'static str {
        match self {
            MoveStatus::Pending => "pending",
            MoveStatus::InProgress => "in_progress",
            MoveStatus::Complete => "complete",
        }
    }
}

/// One reasoning step in a run's ledger.
///
/// `(run_id, seq)` is unique; sequence numbers are assigned by a per-run
/// atomic increment and never reused or mutated. A backtrack appends a new
/// event whose `backtrack_from` points at the revisited move; the earlier
/// event is never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveEvent {
    pub id: MoveEventId,
    pub run_id: RunId,
    pub move_type: MoveType,
    pub seq: i64,
    pub status: MoveStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Earlier move this event revisits, if any.
    #[serde(default)]
    pub backtrack_from: Option<MoveEventId>,
    #[serde(default)]
    pub backtrack_reason: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub uncertainty_note: Option<String>,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub outputs: serde_json::Value,
    #[serde(default)]
    pub evidence_considered: Vec<EvidenceRef>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub uncertainty_remaining: Vec<String>,
    /// Tool invocations this move relied on.
    #[serde(default)]
    pub invocations: Vec<InvocationId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    Complete,
    Failed,
}

impl InvocationStatus {
    pub fn code(self) -> &'static str {
        match self {
            InvocationStatus::Running => "running",
            InvocationStatus::Complete => "complete",
            InvocationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, InvocationStatus::Running)
    }
}

/// One actual execution of an external tool or model. Created once per
/// execution; immutable after the terminal status and end timestamp land.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: InvocationId,
    #[serde(default)]
    pub run_id: Option<RunId>,
    pub tool_name: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub outputs: serde_json::Value,
    pub status: InvocationStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub uncertainty_note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Started,
    Completed,
    Error,
}

impl RequestStatus {
    pub fn code(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Started => "started",
            RequestStatus::Completed => "completed",
            RequestStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Error)
    }
}

/// A move's declared intention to obtain evidence via a tool. Resolves into
/// zero-or-one `ToolInvocation`s; every request has exactly one terminal
/// outcome (completed or error), never a partial success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: RequestId,
    pub run_id: RunId,
    pub move_event_id: MoveEventId,
    pub move_type: MoveType,
    pub tool_name: String,
    pub purpose: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    /// A blocking request must be terminal before the originating move may
    /// complete.
    pub blocking: bool,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invocation_id: Option<InvocationId>,
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Versioned "what will we look for" plan for a (run, move type) pair.
///
/// At most one frame is current per logical key; publishing a new frame
/// atomically supersedes the prior one and links the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFrame {
    pub id: FrameId,
    pub run_id: RunId,
    pub move_type: MoveType,
    pub version: i64,
    pub current: bool,
    #[serde(default)]
    pub superseded_by: Option<FrameId>,
    #[serde(default)]
    pub from_invocation: Option<InvocationId>,
    #[serde(default)]
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Junction between a move and an evidence reference, with the role the
/// evidence played. Append-only; the (move, evidence, role) triple is the
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceLink {
    pub run_id: RunId,
    pub move_event_id: MoveEventId,
    pub evidence: EvidenceRef,
    /// e.g. "relied_upon", "rejected", "background".
    pub role: String,
    #[serde(default)]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Optional entity references carried by an audit event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditRefs {
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub invocation_id: Option<InvocationId>,
    /// Audit event this one corrects, if any. Corrections are new rows; the
    /// original is never touched.
    #[serde(default)]
    pub corrects: Option<AuditEventId>,
}

/// One explicit actor action. Strictly append-only: no update, no delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: AuditEventId,
    pub at: DateTime<Utc>,
    pub event_type: String,
    pub actor: Actor,
    #[serde(default)]
    pub refs: AuditRefs,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_event_optional_fields_default() {
        let json = serde_json::json!({
            "id": "mv_x",
            "run_id": "run_x",
            "move_type": "framing",
            "seq": 1,
            "status": "in_progress",
            "started_at": "2026-01-01T00:00:00Z",
        });
        let ev: MoveEvent = serde_json::from_value(json).unwrap();
        assert!(ev.backtrack_from.is_none());
        assert!(ev.evidence_considered.is_empty());
        assert_eq!(ev.inputs, serde_json::Value::Null);
    }

    #[test]
    fn request_terminal_states() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Started.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Error.is_terminal());
    }

    #[test]
    fn actor_constructors() {
        let a = Actor::human("case-officer-7");
        assert_eq!(a.kind, ActorKind::Human);
        let b = Actor::agent("planner-v2");
        assert_eq!(b.kind.code(), "agent");
    }
}
