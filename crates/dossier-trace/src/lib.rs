//! Trace graph projection for the Dossier reasoning ledger.
//!
//! The projector is the read side of the engine: a pure function from a
//! run-level slice of the logs to a navigable graph. It never writes, never
//! caches, and never owns ground truth; identical inputs yield byte-identical
//! output. Write-side callers live in `dossier-core`.

pub mod graph;
pub mod project;
pub mod slice;

pub use graph::{DetailMode, EdgeKind, NodeKind, TraceEdge, TraceGraph, TraceNode};
pub use project::project;
pub use slice::RunSlice;
