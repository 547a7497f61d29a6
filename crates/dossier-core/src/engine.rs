//! Engine facade.
//!
//! Wraps a [`Store`] with the derived read side: trace projection with a
//! version-keyed cache, per-move-type state, and the current frame lookup.
//! Write operations go straight through to the store; any committed write
//! bumps the run's log version, which changes the cache key and makes stale
//! graphs unreachable without explicit invalidation.

use crate::audit::AuditSpec;
use crate::config::EngineConfig;
use crate::errors::Result;
use crate::evidence::LinkEvidence;
use crate::frames::PublishFrame;
use crate::ledger::{AppendMove, CompleteMove};
use crate::requests::{QueueRequest, RequestOutcome};
use crate::storage::Store;
use dossier_common::{
    Actor, AuditEventId, InvocationId, InvocationStatus, MoveEvent, MoveEventId, MoveType,
    RequestId, RetrievalFrame, Run, RunId, ToolInvocation, ToolRequest,
};
use dossier_trace::{project, DetailMode, TraceGraph};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TraceKey {
    run_id: RunId,
    mode: DetailMode,
    scope: Option<String>,
    log_version: i64,
}

/// Bounded projection cache. Insertion-order eviction is enough here: a
/// write to the run changes the key, so entries for old versions simply
/// age out.
struct TraceCache {
    capacity: usize,
    entries: HashMap<TraceKey, TraceGraph>,
    order: VecDeque<TraceKey>,
}

impl TraceCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &TraceKey) -> Option<TraceGraph> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: TraceKey, graph: TraceGraph) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(key.clone(), graph).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(evict) => {
                    self.entries.remove(&evict);
                }
                None => break,
            }
        }
    }
}

/// The engine: one store plus the derived read side.
pub struct Engine {
    store: Store,
    cache: Mutex<TraceCache>,
}

impl Engine {
    /// Open an engine from configuration. A config without a database path
    /// gets an in-memory store.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let store = match &config.db_path {
            Some(path) => Store::open_with_timeout(path, config.busy_timeout_ms)?,
            None => Store::memory()?,
        };
        Ok(Self::with_store(store, config.cache_capacity))
    }

    /// In-memory engine with default cache sizing (tests, dry runs).
    pub fn memory() -> Result<Self> {
        let config = EngineConfig::default();
        Ok(Self::with_store(Store::memory()?, config.cache_capacity))
    }

    pub fn with_store(store: Store, cache_capacity: usize) -> Self {
        Self {
            store,
            cache: Mutex::new(TraceCache::new(cache_capacity)),
        }
    }

    /// The underlying store. All write operations (appending moves,
    /// coordinating requests, publishing frames, linking evidence, auditing)
    /// live there.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Project the trace graph for a run. `scope` narrows the graph to the
    /// entities tied to one element reference; a scope that matches nothing
    /// yields the full run-level graph with `fallback` set.
    ///
    /// Projections are cached per `(run, mode, scope, log_version)`, so two
    /// calls with no intervening write return the identical graph.
    pub fn get_trace(
        &self,
        run_id: &RunId,
        mode: DetailMode,
        scope: Option<&str>,
    ) -> Result<TraceGraph> {
        let log_version = self.store.log_version(run_id)?;
        let key = TraceKey {
            run_id: run_id.clone(),
            mode,
            scope: scope.map(str::to_string),
            log_version,
        };
        if let Some(graph) = self.cache.lock().unwrap().get(&key) {
            tracing::debug!(run = %run_id, mode = %mode, log_version, "trace cache hit");
            return Ok(graph);
        }
        let slice = self.store.run_slice(run_id)?;
        let graph = project(&slice, mode, scope);
        tracing::debug!(
            run = %run_id,
            mode = %mode,
            log_version,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            fallback = graph.fallback,
            "trace projected"
        );
        self.cache.lock().unwrap().insert(key, graph.clone());
        Ok(graph)
    }

    /// Derived status per grammar position, replayed from the move log.
    pub fn get_move_state(&self, run_id: &RunId) -> Result<crate::ledger::MoveStateView> {
        self.store.move_state(run_id)
    }

    /// The single current retrieval frame for `(run, move_type)`, if any.
    pub fn get_current_frame(
        &self,
        run_id: &RunId,
        move_type: MoveType,
    ) -> Result<Option<RetrievalFrame>> {
        self.store.current_frame(run_id, move_type)
    }

    // Write operations delegate to the store. Each takes the acting identity
    // and an audit record; the store writes both in the same transaction as
    // the change, and the log version bump retires any cached projection.

    pub fn create_run(
        &self,
        profile: &str,
        stage: Option<&str>,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<Run> {
        self.store.create_run(profile, stage, actor, audit)
    }

    pub fn append_move(
        &self,
        req: &AppendMove,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<MoveEvent> {
        self.store.append_move(req, actor, audit)
    }

    pub fn complete_move(
        &self,
        move_event_id: &MoveEventId,
        done: &CompleteMove,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<MoveEvent> {
        self.store.complete_move(move_event_id, done, actor, audit)
    }

    pub fn queue_request(
        &self,
        req: &QueueRequest,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolRequest> {
        self.store.queue_request(req, actor, audit)
    }

    pub fn start_request(
        &self,
        request_id: &RequestId,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolRequest> {
        self.store.start_request(request_id, actor, audit)
    }

    pub fn resolve_request(
        &self,
        request_id: &RequestId,
        outcome: &RequestOutcome,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolRequest> {
        self.store.resolve_request(request_id, outcome, actor, audit)
    }

    pub fn cancel_request(
        &self,
        request_id: &RequestId,
        reason: &str,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolRequest> {
        self.store.cancel_request(request_id, reason, actor, audit)
    }

    pub fn begin_invocation(
        &self,
        run_id: Option<&RunId>,
        tool_name: &str,
        inputs: serde_json::Value,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolInvocation> {
        self.store
            .begin_invocation(run_id, tool_name, inputs, actor, audit)
    }

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
        self.store.finish_invocation(
            invocation_id,
            status,
            outputs,
            confidence,
            uncertainty_note,
            actor,
            audit,
        )
    }

    pub fn cancel_invocation(
        &self,
        invocation_id: &InvocationId,
        reason: &str,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<ToolInvocation> {
        self.store
            .cancel_invocation(invocation_id, reason, actor, audit)
    }

    pub fn publish_frame(
        &self,
        publish: &PublishFrame,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<RetrievalFrame> {
        self.store.publish_frame(publish, actor, audit)
    }

    pub fn link_evidence(
        &self,
        link: &LinkEvidence,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<bool> {
        self.store.link_evidence(link, actor, audit)
    }

    pub fn record_audit(&self, actor: &Actor, spec: AuditSpec) -> Result<AuditEventId> {
        self.store.record_audit(actor, spec)
    }
}
