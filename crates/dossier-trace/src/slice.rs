//! Run-level input slice for the projector.

use dossier_common::{AuditEvent, EvidenceLink, MoveEvent, RunId, ToolInvocation, ToolRequest};
use serde::{Deserialize, Serialize};

/// Everything the projector needs for one run, selected by the store.
///
/// Ordering contract: `moves` ascending by `seq`, `invocations` and `audits`
/// ascending by start/occurrence time then id, `links` ascending by creation
/// time then evidence ref. The store upholds this; the projector relies on it
/// for deterministic output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSlice {
    pub run_id: RunId,
    /// Monotonic per-run write counter at the time the slice was read.
    /// Cache keys include it so any append invalidates prior projections.
    pub log_version: i64,
    pub moves: Vec<MoveEvent>,
    pub invocations: Vec<ToolInvocation>,
    pub requests: Vec<ToolRequest>,
    pub links: Vec<EvidenceLink>,
    pub audits: Vec<AuditEvent>,
}

impl RunSlice {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
            && self.invocations.is_empty()
            && self.requests.is_empty()
            && self.links.is_empty()
            && self.audits.is_empty()
    }
}
