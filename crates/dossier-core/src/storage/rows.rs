//! Raw row structs and their conversions into the domain model.
//!
//! Rows hold the column values exactly as stored (TEXT timestamps, JSON
//! text); `into_model` parses them and surfaces corruption as a database
//! error rather than panicking.

use crate::errors::{LedgerError, Result};
use crate::storage::{parse_json, parse_ts};
use dossier_common::{
    Actor, ActorKind, AuditEvent, AuditRefs, EvidenceLink, EvidenceRef, InvocationStatus,
    MoveEvent, MoveStatus, MoveType, RequestStatus, RetrievalFrame, Run, ToolInvocation,
    ToolRequest,
};

fn parse_move_type(code: &str) -> Result<MoveType> {
    code.parse()
        .map_err(|e| LedgerError::Database(format!("{e}")))
}

fn parse_string_list(text: &str) -> Result<Vec<String>> {
    serde_json::from_str(text)
        .map_err(|e| LedgerError::Database(format!("invalid stored list: {e}")))
}

fn parse_evidence_list(text: &str) -> Result<Vec<EvidenceRef>> {
    Ok(parse_string_list(text)?
        .into_iter()
        .map(EvidenceRef::from)
        .collect())
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: String,
    pub profile: String,
    pub stage: Option<String>,
    pub created_at: String,
}

impl RunRow {
    pub fn into_model(self) -> Result<Run> {
        Ok(Run {
            id: self.id.into(),
            profile: self.profile,
            stage: self.stage,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MoveEventRow {
    pub id: String,
    pub run_id: String,
    pub move_type: String,
    pub seq: i64,
    pub status: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub backtrack_from: Option<String>,
    pub backtrack_reason: Option<String>,
    pub confidence: Option<f64>,
    pub uncertainty_note: Option<String>,
    pub inputs: String,
    pub outputs: String,
    pub evidence_considered: String,
    pub assumptions: String,
    pub uncertainty_remaining: String,
    pub invocations: String,
}

impl MoveEventRow {
    pub fn into_model(self) -> Result<MoveEvent> {
        let status = match self.status.as_str() {
            "pending" => MoveStatus::Pending,
            "in_progress" => MoveStatus::InProgress,
            "complete" => MoveStatus::Complete,
            other => {
                return Err(LedgerError::Database(format!(
                    "unknown move status: {other}"
                )))
            }
        };
        Ok(MoveEvent {
            id: self.id.into(),
            run_id: self.run_id.into(),
            move_type: parse_move_type(&self.move_type)?,
            seq: self.seq,
            status,
            started_at: parse_ts(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            backtrack_from: self.backtrack_from.map(Into::into),
            backtrack_reason: self.backtrack_reason,
            confidence: self.confidence,
            uncertainty_note: self.uncertainty_note,
            inputs: parse_json(&self.inputs)?,
            outputs: parse_json(&self.outputs)?,
            evidence_considered: parse_evidence_list(&self.evidence_considered)?,
            assumptions: parse_string_list(&self.assumptions)?,
            uncertainty_remaining: parse_string_list(&self.uncertainty_remaining)?,
            invocations: parse_string_list(&self.invocations)?
                .into_iter()
                .map(Into::into)
                .collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ToolInvocationRow {
    pub id: String,
    pub run_id: Option<String>,
    pub tool_name: String,
    pub inputs: String,
    pub outputs: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub confidence: Option<f64>,
    pub uncertainty_note: Option<String>,
}

impl ToolInvocationRow {
    pub fn into_model(self) -> Result<ToolInvocation> {
        let status = match self.status.as_str() {
            "running" => InvocationStatus::Running,
            "complete" => InvocationStatus::Complete,
            "failed" => InvocationStatus::Failed,
            other => {
                return Err(LedgerError::Database(format!(
                    "unknown invocation status: {other}"
                )))
            }
        };
        Ok(ToolInvocation {
            id: self.id.into(),
            run_id: self.run_id.map(Into::into),
            tool_name: self.tool_name,
            inputs: parse_json(&self.inputs)?,
            outputs: parse_json(&self.outputs)?,
            status,
            started_at: parse_ts(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            confidence: self.confidence,
            uncertainty_note: self.uncertainty_note,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ToolRequestRow {
    pub id: String,
    pub run_id: String,
    pub move_event_id: String,
    pub move_type: String,
    pub tool_name: String,
    pub purpose: String,
    pub inputs: String,
    pub blocking: bool,
    pub status: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
    pub invocation_id: Option<String>,
    pub evidence: String,
    pub error: Option<String>,
}

impl ToolRequestRow {
    pub fn into_model(self) -> Result<ToolRequest> {
        let status = match self.status.as_str() {
            "pending" => RequestStatus::Pending,
            "started" => RequestStatus::Started,
            "completed" => RequestStatus::Completed,
            "error" => RequestStatus::Error,
            other => {
                return Err(LedgerError::Database(format!(
                    "unknown request status: {other}"
                )))
            }
        };
        Ok(ToolRequest {
            id: self.id.into(),
            run_id: self.run_id.into(),
            move_event_id: self.move_event_id.into(),
            move_type: parse_move_type(&self.move_type)?,
            tool_name: self.tool_name,
            purpose: self.purpose,
            inputs: parse_json(&self.inputs)?,
            blocking: self.blocking,
            status,
            created_at: parse_ts(&self.created_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_ts).transpose()?,
            invocation_id: self.invocation_id.map(Into::into),
            evidence: parse_evidence_list(&self.evidence)?,
            error: self.error,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalFrameRow {
    pub id: String,
    pub run_id: String,
    pub move_type: String,
    pub version: i64,
    pub current: bool,
    pub superseded_by: Option<String>,
    pub from_invocation: Option<String>,
    pub content: String,
    pub created_at: String,
}

impl RetrievalFrameRow {
    pub fn into_model(self) -> Result<RetrievalFrame> {
        Ok(RetrievalFrame {
            id: self.id.into(),
            run_id: self.run_id.into(),
            move_type: parse_move_type(&self.move_type)?,
            version: self.version,
            current: self.current,
            superseded_by: self.superseded_by.map(Into::into),
            from_invocation: self.from_invocation.map(Into::into),
            content: parse_json(&self.content)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvidenceLinkRow {
    pub run_id: String,
    pub move_event_id: String,
    pub evidence_ref: String,
    pub role: String,
    pub note: Option<String>,
    pub created_at: String,
}

impl EvidenceLinkRow {
    pub fn into_model(self) -> Result<EvidenceLink> {
        Ok(EvidenceLink {
            run_id: self.run_id.into(),
            move_event_id: self.move_event_id.into(),
            evidence: EvidenceRef::from(self.evidence_ref),
            role: self.role,
            note: self.note,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AuditEventRow {
    pub id: String,
    pub at: String,
    pub event_type: String,
    pub actor_kind: String,
    pub actor_id: String,
    pub run_id: Option<String>,
    pub stage: Option<String>,
    pub scenario: Option<String>,
    pub invocation_id: Option<String>,
    pub corrects: Option<String>,
    pub payload: String,
}

impl AuditEventRow {
    pub fn into_model(self) -> Result<AuditEvent> {
        let kind = match self.actor_kind.as_str() {
            "human" => ActorKind::Human,
            "agent" => ActorKind::Agent,
            other => {
                return Err(LedgerError::Database(format!(
                    "unknown actor kind: {other}"
                )))
            }
        };
        Ok(AuditEvent {
            id: self.id.into(),
            at: parse_ts(&self.at)?,
            event_type: self.event_type,
            actor: Actor {
                kind,
                id: self.actor_id,
            },
            refs: AuditRefs {
                run_id: self.run_id.map(Into::into),
                stage: self.stage,
                scenario: self.scenario,
                invocation_id: self.invocation_id.map(Into::into),
                corrects: self.corrects.map(Into::into),
            },
            payload: parse_json(&self.payload)?,
        })
    }
}
