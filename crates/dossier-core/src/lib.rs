//! Dossier core: the reasoning move ledger and provenance trace engine.
//!
//! The write side is an append-mostly SQLite log store with strict
//! invariants: per-run gapless move sequencing, a single current retrieval
//! frame per (run, move type), exactly one terminal outcome per tool
//! request, and an audit event for every state-changing call. The read side
//! derives everything (per-move-type state, trace graphs) from the full
//! event history rather than caching it in stored fields.
//!
//! External code reads engine state only through [`Engine::get_trace`],
//! [`Engine::get_move_state`] and [`Engine::get_current_frame`].

pub mod audit;
pub mod config;
pub mod engine;
pub mod errors;
pub mod evidence;
pub mod frames;
pub mod ledger;
pub mod requests;
pub mod storage;

pub use audit::{audit_types, AuditSpec};
pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::{LedgerError, Result};
pub use evidence::LinkEvidence;
pub use frames::{FrameViolation, PublishFrame};
pub use ledger::{AppendMove, CompleteMove, MoveStateView};
pub use requests::{QueueRequest, RequestOutcome};
pub use storage::Store;
