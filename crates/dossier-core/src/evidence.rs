//! Evidence linkage.
//!
//! Links connect a move to an evidence reference with a role (cited,
//! considered, rejected, ...). The engine stores opaque references; it never
//! resolves or fetches the underlying documents. Linking is idempotent per
//! `(move, evidence, role)`.

use crate::audit::{insert_audit, AuditSpec};
use crate::errors::{LedgerError, Result};
use crate::ledger::get_move_in;
use crate::storage::rows::EvidenceLinkRow;
use crate::storage::Store;
use chrono::Utc;
use dossier_common::{Actor, EvidenceLink, EvidenceRef, MoveEventId, RunId};
use rusqlite::params;

/// Parameters for [`Store::link_evidence`].
#[derive(Debug, Clone)]
pub struct LinkEvidence {
    pub run_id: RunId,
    pub move_event_id: MoveEventId,
    pub evidence: EvidenceRef,
    pub role: String,
    pub note: Option<String>,
}

impl Store {
    /// Link evidence to a move. Returns `true` if a new link was recorded,
    /// `false` if the same `(move, evidence, role)` link already existed.
    /// Duplicates are not an error and leave the log version untouched.
    pub fn link_evidence(
        &self,
        link: &LinkEvidence,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<bool> {
        if link.role.trim().is_empty() {
            return Err(LedgerError::Validation("link role must not be empty".into()));
        }
        if link.evidence.as_str().trim().is_empty() {
            return Err(LedgerError::Validation(
                "evidence reference must not be empty".into(),
            ));
        }
        self.with_write_txn(|conn| {
            let origin = get_move_in(conn, &link.move_event_id)?;
            if origin.run_id != link.run_id {
                return Err(LedgerError::Validation(format!(
                    "move {} belongs to a different run",
                    link.move_event_id
                )));
            }
            let inserted = conn.execute(
                "INSERT INTO evidence_links (run_id, move_event_id, evidence_ref, role, note,
                                             created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (move_event_id, evidence_ref, role) DO NOTHING",
                params![
                    link.run_id.as_str(),
                    link.move_event_id.as_str(),
                    link.evidence.as_str(),
                    link.role,
                    link.note,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            if inserted == 1 {
                Self::bump_log_version(conn, &link.run_id)?;
                insert_audit(conn, actor, audit, Some(&link.run_id))?;
            }
            Ok(inserted == 1)
        })
    }

    /// Links for one move, oldest first.
    pub fn links_for_move(&self, move_event_id: &MoveEventId) -> Result<Vec<EvidenceLink>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, move_event_id, evidence_ref, role, note, created_at
                 FROM evidence_links WHERE move_event_id = ?1
                 ORDER BY created_at ASC, evidence_ref ASC",
            )?;
            let rows = stmt
                .query_map([move_event_id.as_str()], link_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(EvidenceLinkRow::into_model).collect()
        })
    }

    /// All links in a run, oldest first.
    pub fn links_for_run(&self, run_id: &RunId) -> Result<Vec<EvidenceLink>> {
        self.read(|conn| {
            Self::require_run(conn, run_id)?;
            let mut stmt = conn.prepare(
                "SELECT run_id, move_event_id, evidence_ref, role, note, created_at
                 FROM evidence_links WHERE run_id = ?1
                 ORDER BY created_at ASC, evidence_ref ASC",
            )?;
            let rows = stmt
                .query_map([run_id.as_str()], link_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(EvidenceLinkRow::into_model).collect()
        })
    }
}

fn link_row(row: &rusqlite::Row<'_>) -> std::result::Result<EvidenceLinkRow, rusqlite::Error> {
    Ok(EvidenceLinkRow {
        run_id: row.get(0)?,
        move_event_id: row.get(1)?,
        evidence_ref: row.get(2)?,
        role: row.get(3)?,
        note: row.get(4)?,
        created_at: row.get(5)?,
    })
}
