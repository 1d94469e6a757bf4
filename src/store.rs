//! Graph store adapter over the `relationship_edges` table.
//!
//! Edges are never mirrored here. Callers that want a reverse edge write it
//! themselves (see `requests::decide`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::AccessControl;
use crate::db::Db;
use crate::error::{is_unique_violation, KingraphError, Result};
use crate::identity::require_profile;
use crate::vocab::{RelationshipKind, Role};

/// Upper bound on bound parameters per statement (SQLite's historic default is 999).
pub const MAX_SQL_PARAMS: usize = 900;

const EDGE_COLUMNS: &str = "edge_id, subject_id, object_id, kind, role, created_at";

/// Directed edge: the object fills the `kind` role relative to the subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub edge_id: String,
    pub subject_id: String,
    pub object_id: String,
    pub kind: RelationshipKind,
    /// Access granted to the object over the subject's content.
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl RelationshipEdge {
    /// The endpoint opposite `profile_id`, if the edge touches it.
    pub fn other_end(&self, profile_id: &str) -> Option<&str> {
        if self.subject_id == profile_id {
            Some(&self.object_id)
        } else if self.object_id == profile_id {
            Some(&self.subject_id)
        } else {
            None
        }
    }
}

pub(crate) fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<RelationshipEdge> {
    Ok(RelationshipEdge {
        edge_id: row.get(0)?,
        subject_id: row.get(1)?,
        object_id: row.get(2)?,
        kind: row.get(3)?,
        role: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Whether an edge with this exact (subject, object, kind) exists.
pub fn edge_exists(conn: &Connection, subject_id: &str, object_id: &str, kind: RelationshipKind) -> Result<bool> {
    let mut stmt = conn.prepare(
        "SELECT 1 FROM relationship_edges WHERE subject_id = ?1 AND object_id = ?2 AND kind = ?3",
    )?;
    Ok(stmt.exists(params![subject_id, object_id, kind])?)
}

/// Insert one edge. Both endpoints must exist; a duplicate (subject, object, kind) is a Conflict.
pub fn insert_edge(
    conn: &Connection,
    subject_id: &str,
    object_id: &str,
    kind: RelationshipKind,
    role: Role,
) -> Result<RelationshipEdge> {
    if subject_id == object_id {
        return Err(KingraphError::InvalidInput(
            "a profile cannot be related to itself".to_string(),
        ));
    }
    require_profile(conn, subject_id)?;
    require_profile(conn, object_id)?;

    let edge = RelationshipEdge {
        edge_id: Uuid::new_v4().to_string(),
        subject_id: subject_id.to_string(),
        object_id: object_id.to_string(),
        kind,
        role,
        created_at: Utc::now(),
    };
    conn.execute(
        "INSERT INTO relationship_edges (edge_id, subject_id, object_id, kind, role, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![edge.edge_id, edge.subject_id, edge.object_id, edge.kind, edge.role, edge.created_at],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            KingraphError::Conflict(format!(
                "{} is already recorded as {}'s {}",
                object_id, subject_id, kind
            ))
        } else {
            KingraphError::Database(e)
        }
    })?;

    log::debug!("Created edge {} ({} -{}-> {})", edge.edge_id, subject_id, kind, object_id);
    Ok(edge)
}

/// Fetch an edge by id.
pub fn find_edge(conn: &Connection, edge_id: &str) -> Result<Option<RelationshipEdge>> {
    let sql = format!("SELECT {} FROM relationship_edges WHERE edge_id = ?1", EDGE_COLUMNS);
    Ok(conn.query_row(&sql, [edge_id], edge_from_row).optional()?)
}

fn query_edges(conn: &Connection, sql: &str, profile_id: &str) -> Result<Vec<RelationshipEdge>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([profile_id], edge_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Every edge with either endpoint in `frontier`, in one pass over the table
/// per chunk of ids.
pub fn edges_touching(conn: &Connection, frontier: &[String]) -> Result<Vec<RelationshipEdge>> {
    let mut out = Vec::new();
    // Each id is bound twice (subject and object), so halve the chunk.
    for chunk in frontier.chunks(MAX_SQL_PARAMS / 2) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!(
            "SELECT {} FROM relationship_edges WHERE subject_id IN ({}) OR object_id IN ({}) \
             ORDER BY created_at, edge_id",
            EDGE_COLUMNS, placeholders, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(chunk.iter().chain(chunk.iter())),
            edge_from_row,
        )?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

/// Create a directed edge (subject, object, kind) carrying `role`.
pub async fn create_edge(
    db: &Db,
    subject_id: &str,
    object_id: &str,
    kind: RelationshipKind,
    role: Role,
) -> Result<RelationshipEdge> {
    let subject_id = subject_id.to_string();
    let object_id = object_id.to_string();
    db.with_transaction(move |tx| insert_edge(tx, &subject_id, &object_id, kind, role))
        .await
}

/// Edges whose subject is `subject_id`.
pub async fn list_outgoing(db: &Db, subject_id: &str) -> Result<Vec<RelationshipEdge>> {
    let subject_id = subject_id.to_string();
    db.with_connection(move |conn| {
        let sql = format!(
            "SELECT {} FROM relationship_edges WHERE subject_id = ?1 ORDER BY created_at, edge_id",
            EDGE_COLUMNS
        );
        query_edges(conn, &sql, &subject_id)
    })
    .await
}

/// Edges whose object is `object_id`.
pub async fn list_incoming(db: &Db, object_id: &str) -> Result<Vec<RelationshipEdge>> {
    let object_id = object_id.to_string();
    db.with_connection(move |conn| {
        let sql = format!(
            "SELECT {} FROM relationship_edges WHERE object_id = ?1 ORDER BY created_at, edge_id",
            EDGE_COLUMNS
        );
        query_edges(conn, &sql, &object_id)
    })
    .await
}

/// Fetch an edge by id, failing NotFound when absent.
pub async fn get_edge(db: &Db, edge_id: &str) -> Result<RelationshipEdge> {
    let edge_id = edge_id.to_string();
    db.with_connection(move |conn| {
        find_edge(conn, &edge_id)?.ok_or_else(|| KingraphError::not_found("Edge", edge_id.clone()))
    })
    .await
}

fn require_manageable_edge(
    conn: &Connection,
    access: &dyn AccessControl,
    caller_id: &str,
    edge_id: &str,
) -> Result<RelationshipEdge> {
    let edge = find_edge(conn, edge_id)?.ok_or_else(|| KingraphError::not_found("Edge", edge_id))?;
    if !access.can_manage(conn, caller_id, &edge.subject_id)? {
        return Err(KingraphError::Forbidden(format!(
            "{} may not manage relationships of {}",
            caller_id, edge.subject_id
        )));
    }
    Ok(edge)
}

/// Change the role on an edge. The caller must be allowed to manage the
/// subject's relationships.
pub async fn update_role(
    db: &Db,
    access: Arc<dyn AccessControl>,
    caller_id: &str,
    edge_id: &str,
    new_role: Role,
) -> Result<RelationshipEdge> {
    let caller_id = caller_id.to_string();
    let edge_id = edge_id.to_string();
    db.with_transaction(move |tx| {
        let mut edge = require_manageable_edge(tx, access.as_ref(), &caller_id, &edge_id)?;
        tx.execute(
            "UPDATE relationship_edges SET role = ?1 WHERE edge_id = ?2",
            params![new_role, edge_id],
        )?;
        log::info!("Edge {} role {} -> {} by {}", edge_id, edge.role, new_role, caller_id);
        edge.role = new_role;
        Ok(edge)
    })
    .await
}

/// Remove an edge. Guarded by the same access check as [`update_role`].
///
/// Removing one side of a mirrored pair leaves the other side in place.
pub async fn delete_edge(
    db: &Db,
    access: Arc<dyn AccessControl>,
    caller_id: &str,
    edge_id: &str,
) -> Result<RelationshipEdge> {
    let caller_id = caller_id.to_string();
    let edge_id = edge_id.to_string();
    db.with_transaction(move |tx| {
        let edge = require_manageable_edge(tx, access.as_ref(), &caller_id, &edge_id)?;
        tx.execute("DELETE FROM relationship_edges WHERE edge_id = ?1", [&edge_id])?;
        log::info!("Edge {} deleted by {}", edge_id, caller_id);
        Ok(edge)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::RoleBasedAccess;
    use crate::config::IdentityConfig;
    use crate::db::test_support::setup_test_db;
    use crate::identity::register_account;

    async fn people(db: &Db, names: &[&str]) -> Vec<String> {
        let config = IdentityConfig::default();
        let mut ids = Vec::new();
        for name in names {
            let email = format!("{}@example.com", name.to_lowercase());
            ids.push(register_account(db, &config, &email, name).await.unwrap().profile_id);
        }
        ids
    }

    #[tokio::test]
    async fn test_create_edge_and_list() {
        let (db, _temp) = setup_test_db().await;
        let ids = people(&db, &["Me", "Dad"]).await;

        let edge = create_edge(&db, &ids[0], &ids[1], RelationshipKind::Parent, Role::Viewer)
            .await
            .unwrap();
        assert_eq!(edge.kind, RelationshipKind::Parent);

        let outgoing = list_outgoing(&db, &ids[0]).await.unwrap();
        assert_eq!(outgoing, vec![edge.clone()]);
        assert!(list_outgoing(&db, &ids[1]).await.unwrap().is_empty());

        let incoming = list_incoming(&db, &ids[1]).await.unwrap();
        assert_eq!(incoming, vec![edge.clone()]);
        assert_eq!(get_edge(&db, &edge.edge_id).await.unwrap(), edge);
    }

    #[tokio::test]
    async fn test_create_edge_twice_conflicts() {
        let (db, _temp) = setup_test_db().await;
        let ids = people(&db, &["Me", "Dad"]).await;

        create_edge(&db, &ids[0], &ids[1], RelationshipKind::Parent, Role::Viewer).await.unwrap();
        let err = create_edge(&db, &ids[0], &ids[1], RelationshipKind::Parent, Role::Contributor)
            .await
            .unwrap_err();
        assert!(matches!(err, KingraphError::Conflict(_)));

        // A different kind between the same pair is a separate edge
        create_edge(&db, &ids[0], &ids[1], RelationshipKind::Spouse, Role::Viewer).await.unwrap();
        assert_eq!(list_outgoing(&db, &ids[0]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_edge_unknown_endpoint() {
        let (db, _temp) = setup_test_db().await;
        let ids = people(&db, &["Me"]).await;
        let err = create_edge(&db, &ids[0], "ghost", RelationshipKind::Sibling, Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, KingraphError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_self_edge_rejected() {
        let (db, _temp) = setup_test_db().await;
        let ids = people(&db, &["Me"]).await;
        let err = create_edge(&db, &ids[0], &ids[0], RelationshipKind::Sibling, Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, KingraphError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_update_role_requires_manager() {
        let (db, _temp) = setup_test_db().await;
        let ids = people(&db, &["Me", "Dad", "Stranger"]).await;
        let access: Arc<dyn AccessControl> = Arc::new(RoleBasedAccess);
        let edge = create_edge(&db, &ids[0], &ids[1], RelationshipKind::Parent, Role::Viewer)
            .await
            .unwrap();

        let err = update_role(&db, access.clone(), &ids[2], &edge.edge_id, Role::Contributor)
            .await
            .unwrap_err();
        assert!(matches!(err, KingraphError::Forbidden(_)));
        // The object of an edge does not manage its subject by default
        let err = update_role(&db, access.clone(), &ids[1], &edge.edge_id, Role::Contributor)
            .await
            .unwrap_err();
        assert!(matches!(err, KingraphError::Forbidden(_)));

        let updated = update_role(&db, access.clone(), &ids[0], &edge.edge_id, Role::Contributor)
            .await
            .unwrap();
        assert_eq!(updated.role, Role::Contributor);
        assert_eq!(get_edge(&db, &edge.edge_id).await.unwrap().role, Role::Contributor);
    }

    #[tokio::test]
    async fn test_update_role_unknown_edge() {
        let (db, _temp) = setup_test_db().await;
        let ids = people(&db, &["Me"]).await;
        let err = update_role(&db, Arc::new(RoleBasedAccess), &ids[0], "nope", Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, KingraphError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_edge() {
        let (db, _temp) = setup_test_db().await;
        let ids = people(&db, &["Me", "Sis"]).await;
        let access: Arc<dyn AccessControl> = Arc::new(RoleBasedAccess);
        let edge = create_edge(&db, &ids[0], &ids[1], RelationshipKind::Sibling, Role::Viewer)
            .await
            .unwrap();

        let err = delete_edge(&db, access.clone(), &ids[1], &edge.edge_id).await.unwrap_err();
        assert!(matches!(err, KingraphError::Forbidden(_)));

        delete_edge(&db, access.clone(), &ids[0], &edge.edge_id).await.unwrap();
        assert!(list_outgoing(&db, &ids[0]).await.unwrap().is_empty());
        // Recreating after deletion is allowed
        create_edge(&db, &ids[0], &ids[1], RelationshipKind::Sibling, Role::Viewer).await.unwrap();
    }

    #[tokio::test]
    async fn test_edges_touching_batches_both_directions() {
        let (db, _temp) = setup_test_db().await;
        let ids = people(&db, &["A", "B", "C", "D"]).await;
        create_edge(&db, &ids[0], &ids[1], RelationshipKind::Sibling, Role::Viewer).await.unwrap();
        create_edge(&db, &ids[2], &ids[0], RelationshipKind::Child, Role::Viewer).await.unwrap();
        create_edge(&db, &ids[2], &ids[3], RelationshipKind::Spouse, Role::Viewer).await.unwrap();

        let frontier = vec![ids[0].clone()];
        let edges = db
            .with_connection(move |conn| edges_touching(conn, &frontier))
            .await
            .unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.other_end(&ids[0]).is_some()));
    }
}
