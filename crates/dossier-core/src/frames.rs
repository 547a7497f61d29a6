//! Versioned retrieval frames.
//!
//! A frame is the retrieval context a run holds for one move type. Frames
//! are never edited in place: publishing supersedes the current version and
//! inserts the next one inside a single transaction, and a partial unique
//! index on `(run_id, move_type) WHERE current = 1` makes two concurrent
//! publishers impossible to both win.

use crate::audit::{insert_audit, AuditSpec};
use crate::errors::{LedgerError, Result};
use crate::requests::get_invocation_in;
use crate::storage::rows::RetrievalFrameRow;
use crate::storage::Store;
use chrono::Utc;
use dossier_common::{Actor, FrameId, InvocationId, MoveType, RetrievalFrame, RunId};
use rusqlite::{params, Connection};

/// Parameters for [`Store::publish_frame`].
#[derive(Debug, Clone)]
pub struct PublishFrame {
    pub run_id: RunId,
    pub move_type: MoveType,
    pub content: serde_json::Value,
    /// Invocation that produced this frame, when retrieval-driven.
    pub from_invocation: Option<InvocationId>,
}

/// A `(run, move_type)` pair holding more than one current frame. Only
/// reachable if the partial unique index was bypassed out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameViolation {
    pub run_id: RunId,
    pub move_type: MoveType,
    pub current_count: i64,
}

impl Store {
    /// Publish the next frame version for `(run, move_type)`. The prior
    /// current frame, if any, is flipped to superseded and pointed at the
    /// new version; the new frame becomes the single current one.
    pub fn publish_frame(
        &self,
        publish: &PublishFrame,
        actor: &Actor,
        audit: AuditSpec,
    ) -> Result<RetrievalFrame> {
        if publish.content.is_null() {
            return Err(LedgerError::Validation(
                "frame content must not be null".into(),
            ));
        }
        let frame = self.with_write_txn(|conn| {
            Self::require_run(conn, &publish.run_id)?;
            if let Some(inv) = &publish.from_invocation {
                get_invocation_in(conn, inv)?;
            }
            let prior = current_frame_in(conn, &publish.run_id, publish.move_type)?;
            let id = FrameId::new();
            let version = prior.as_ref().map_or(1, |f| f.version + 1);
            // Flip before insert so the partial unique index never sees two
            // current rows; the back-pointer lands after the insert because
            // superseded_by is FK-checked against an existing frame row.
            if let Some(prior) = &prior {
                let flipped = conn.execute(
                    "UPDATE retrieval_frames SET current = 0 WHERE id = ?1 AND current = 1",
                    [prior.id.as_str()],
                )?;
                if flipped != 1 {
                    return Err(LedgerError::InvariantViolation(format!(
                        "frame {} was superseded mid-transaction",
                        prior.id
                    )));
                }
            }
            let frame = RetrievalFrame {
                id,
                run_id: publish.run_id.clone(),
                move_type: publish.move_type,
                version,
                current: true,
                superseded_by: None,
                from_invocation: publish.from_invocation.clone(),
                content: publish.content.clone(),
                created_at: Utc::now(),
            };
            conn.execute(
                "INSERT INTO retrieval_frames (id, run_id, move_type, version, current,
                                               from_invocation, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7)",
                params![
                    frame.id.as_str(),
                    frame.run_id.as_str(),
                    frame.move_type.code(),
                    frame.version,
                    frame.from_invocation.as_ref().map(|i| i.as_str()),
                    serde_json::to_string(&frame.content)
                        .map_err(|e| LedgerError::Validation(format!("bad content: {e}")))?,
                    frame.created_at.to_rfc3339(),
                ],
            )?;
            if let Some(prior) = &prior {
                conn.execute(
                    "UPDATE retrieval_frames SET superseded_by = ?2 WHERE id = ?1",
                    params![prior.id.as_str(), frame.id.as_str()],
                )?;
            }
            Self::bump_log_version(conn, &publish.run_id)?;
            insert_audit(conn, actor, audit, Some(&publish.run_id))?;
            Ok(frame)
        })?;
        tracing::debug!(
            run = %frame.run_id,
            move_type = frame.move_type.code(),
            version = frame.version,
            "retrieval frame published"
        );
        Ok(frame)
    }

    /// The single current frame for `(run, move_type)`, if one exists.
    pub fn current_frame(
        &self,
        run_id: &RunId,
        move_type: MoveType,
    ) -> Result<Option<RetrievalFrame>> {
        self.read(|conn| {
            Self::require_run(conn, run_id)?;
            current_frame_in(conn, run_id, move_type)
        })
    }

    /// All frame versions for `(run, move_type)`, newest first.
    pub fn frame_history(
        &self,
        run_id: &RunId,
        move_type: MoveType,
    ) -> Result<Vec<RetrievalFrame>> {
        self.read(|conn| {
            Self::require_run(conn, run_id)?;
            let mut stmt = conn.prepare(
                "SELECT id, run_id, move_type, version, current, superseded_by,
                        from_invocation, content, created_at
                 FROM retrieval_frames
                 WHERE run_id = ?1 AND move_type = ?2
                 ORDER BY version DESC",
            )?;
            let rows = stmt
                .query_map(params![run_id.as_str(), move_type.code()], frame_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(RetrievalFrameRow::into_model).collect()
        })
    }

    /// Scan for `(run, move_type)` pairs with more than one current frame.
    /// Healthy stores always return an empty list.
    pub fn check_frame_consistency(&self) -> Result<Vec<FrameViolation>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, move_type, SUM(current) AS currents
                 FROM retrieval_frames
                 GROUP BY run_id, move_type
                 HAVING currents > 1",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(run, mt, count)| {
                    Ok(FrameViolation {
                        run_id: run.into(),
                        move_type: mt
                            .parse()
                            .map_err(|e| LedgerError::Database(format!("{e}")))?,
                        current_count: count,
                    })
                })
                .collect()
        })
    }
}

fn frame_row(row: &rusqlite::Row<'_>) -> std::result::Result<RetrievalFrameRow, rusqlite::Error> {
    Ok(RetrievalFrameRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        move_type: row.get(2)?,
        version: row.get(3)?,
        current: row.get(4)?,
        superseded_by: row.get(5)?,
        from_invocation: row.get(6)?,
        content: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn current_frame_in(
    conn: &Connection,
    run_id: &RunId,
    move_type: MoveType,
) -> Result<Option<RetrievalFrame>> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, move_type, version, current, superseded_by,
                from_invocation, content, created_at
         FROM retrieval_frames
         WHERE run_id = ?1 AND move_type = ?2 AND current = 1",
    )?;
    let rows = stmt
        .query_map(params![run_id.as_str(), move_type.code()], frame_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if rows.len() > 1 {
        tracing::error!(
            run = %run_id,
            move_type = move_type.code(),
            count = rows.len(),
            "multiple current frames"
        );
        return Err(LedgerError::InvariantViolation(format!(
            "run {} has {} current frames for {}",
            run_id,
            rows.len(),
            move_type.code()
        )));
    }
    rows.into_iter().next().map(RetrievalFrameRow::into_model).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::audit_types;

    fn spec() -> AuditSpec {
        AuditSpec::new(audit_types::FRAME_PUBLISHED, serde_json::json!({}))
    }

    fn fixture() -> (Store, RunId, Actor) {
        let store = Store::memory().unwrap();
        let actor = Actor::agent("retriever");
        let run = store
            .create_run(
                "p",
                None,
                &actor,
                AuditSpec::new(audit_types::RUN_CREATED, serde_json::json!({})),
            )
            .unwrap()
            .id;
        (store, run, actor)
    }

    fn publish(store: &Store, run: &RunId, actor: &Actor, body: &str) -> RetrievalFrame {
        store
            .publish_frame(
                &PublishFrame {
                    run_id: run.clone(),
                    move_type: MoveType::Evidence,
                    content: serde_json::json!({"body": body}),
                    from_invocation: None,
                },
                actor,
                spec(),
            )
            .unwrap()
    }

    #[test]
    fn first_frame_is_version_one_and_current() {
        let (store, run, actor) = fixture();
        let frame = publish(&store, &run, &actor, "a");
        assert_eq!(frame.version, 1);
        assert!(frame.current);

        let current = store.current_frame(&run, MoveType::Evidence).unwrap();
        assert_eq!(current.map(|f| f.id), Some(frame.id));
    }

    #[test]
    fn publishing_supersedes_the_prior_version() {
        let (store, run, actor) = fixture();
        let v1 = publish(&store, &run, &actor, "a");
        let v2 = publish(&store, &run, &actor, "b");
        assert_eq!(v2.version, 2);

        let history = store.frame_history(&run, MoveType::Evidence).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, v2.id);
        assert!(history[0].current);
        assert!(!history[1].current);
        assert_eq!(history[1].superseded_by.as_ref(), Some(&v2.id));
        assert_eq!(history[1].id, v1.id);
    }

    #[test]
    fn supersession_chain_holds_under_foreign_keys() {
        // Foreign keys are ON for every connection; each republish must
        // land its back-pointer against an already-inserted successor.
        let (store, run, actor) = fixture();
        let v1 = publish(&store, &run, &actor, "a");
        let v2 = publish(&store, &run, &actor, "b");
        let v3 = publish(&store, &run, &actor, "c");

        let history = store.frame_history(&run, MoveType::Evidence).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, v3.id);
        assert!(history[0].current);
        assert!(history[0].superseded_by.is_none());
        assert_eq!(history[1].superseded_by.as_ref(), Some(&v3.id));
        assert_eq!(history[2].superseded_by.as_ref(), Some(&v2.id));
        assert_eq!(history[2].id, v1.id);
    }

    #[test]
    fn move_types_hold_independent_chains() {
        let (store, run, actor) = fixture();
        publish(&store, &run, &actor, "evidence frame");
        let framing = store
            .publish_frame(
                &PublishFrame {
                    run_id: run.clone(),
                    move_type: MoveType::Framing,
                    content: serde_json::json!({"body": "framing frame"}),
                    from_invocation: None,
                },
                &actor,
                spec(),
            )
            .unwrap();
        assert_eq!(framing.version, 1);
        assert!(store
            .current_frame(&run, MoveType::Evidence)
            .unwrap()
            .is_some());
    }

    #[test]
    fn null_content_is_rejected() {
        let (store, run, actor) = fixture();
        let err = store
            .publish_frame(
                &PublishFrame {
                    run_id: run,
                    move_type: MoveType::Evidence,
                    content: serde_json::Value::Null,
                    from_invocation: None,
                },
                &actor,
                spec(),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn unknown_invocation_is_rejected() {
        let (store, run, actor) = fixture();
        let err = store
            .publish_frame(
                &PublishFrame {
                    run_id: run,
                    move_type: MoveType::Evidence,
                    content: serde_json::json!({}),
                    from_invocation: Some(InvocationId::from("inv_ghost")),
                },
                &actor,
                spec(),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[test]
    fn consistency_scan_is_empty_on_a_healthy_store() {
        let (store, run, actor) = fixture();
        publish(&store, &run, &actor, "a");
        publish(&store, &run, &actor, "b");
        assert!(store.check_frame_consistency().unwrap().is_empty());
    }
}
