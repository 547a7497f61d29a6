//! Graph value objects.
//!
//! Node and edge kinds are closed unions so the projector and its consumers
//! can match exhaustively. The graph itself is derived, never authoritative:
//! consumers regenerate it on demand and must not mutate it.

use chrono::{DateTime, Utc};
use dossier_common::RunId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How verbose the projected graph is. Detail mode controls node/edge
/// verbosity, never which underlying entities exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailMode {
    /// Repeated tool/evidence nodes of the same kind collapse into counts.
    Summary,
    /// Per-node input/output bodies are included.
    Inspect,
    /// Additionally includes all audit events and raw timestamps.
    Forensic,
}

impl DetailMode {
    pub fn code(self) -> &'static str {
        match self {
            DetailMode::Summary => "summary",
            DetailMode::Inspect => "inspect",
            DetailMode::Forensic => "forensic",
        }
    }
}

impl fmt::Display for DetailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DetailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(DetailMode::Summary),
            "inspect" => Ok(DetailMode::Inspect),
            "forensic" => Ok(DetailMode::Forensic),
            other => Err(format!("unknown detail mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Move,
    Tool,
    Evidence,
    Audit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Move invoked tool.
    Invoked,
    /// Tool produced evidence.
    Produced,
    /// Backtrack: the new move revises the backtracked-from move.
    Revises,
    /// Move cites evidence via an explicit evidence link.
    Cites,
}

impl EdgeKind {
    pub fn code(self) -> &'static str {
        match self {
            EdgeKind::Invoked => "invoked",
            EdgeKind::Produced => "produced",
            EdgeKind::Revises => "revises",
            EdgeKind::Cites => "cites",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    /// Identifier of the underlying record, where one exists.
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    /// Mode-dependent body (inputs/outputs, timestamps). Absent in summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEdge {
    pub id: String,
    pub src_id: String,
    pub dst_id: String,
    pub kind: EdgeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// The projected graph. A value object: recomputable from the logs at any
/// time and never persisted as a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceGraph {
    pub id: String,
    pub run_id: RunId,
    pub mode: DetailMode,
    /// True when an element scope matched nothing and the projector fell
    /// back to the full run-level slice.
    pub fallback: bool,
    pub nodes: Vec<TraceNode>,
    pub edges: Vec<TraceEdge>,
    pub created_at: DateTime<Utc>,
}
