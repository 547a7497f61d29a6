//! Shared domain model for the Dossier reasoning ledger.
//!
//! This crate holds the types that cross the write/read boundary: opaque
//! identifiers, the eight-move reasoning grammar, and the serde record
//! structs persisted by `dossier-core` and projected by `dossier-trace`.
//! No storage or projection logic lives here.

pub mod grammar;
pub mod ids;
pub mod model;

pub use grammar::{GrammarError, MoveType, MOVE_TYPES};
pub use ids::{AuditEventId, EvidenceRef, FrameId, InvocationId, MoveEventId, RequestId, RunId};
pub use model::{
    Actor, ActorKind, AuditEvent, AuditRefs, EvidenceLink, InvocationStatus, MoveEvent,
    MoveStatus, RequestStatus, RetrievalFrame, Run, ToolInvocation, ToolRequest,
};
