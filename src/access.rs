//! Access-control collaborator: who may manage a profile's relationships.

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::vocab::Role;

/// Answers "can this caller manage profile X's relationships".
///
/// Checks run on the connection of the surrounding unit of work so they see
/// the same snapshot as the mutation they guard.
pub trait AccessControl: Send + Sync {
    fn can_manage(&self, conn: &Connection, caller_id: &str, subject_id: &str) -> Result<bool>;
}

/// Ownership/role check: a profile manages itself, and anyone the profile has
/// granted LEGACY_KEEPER on one of its edges manages it too.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleBasedAccess;

impl RoleBasedAccess {
    /// Role `caller_id` holds over `target_id`'s content, or `None` when the
    /// target has granted the caller nothing.
    pub fn role_of(conn: &Connection, caller_id: &str, target_id: &str) -> Result<Option<Role>> {
        if caller_id == target_id {
            return Ok(Some(Role::LegacyKeeper));
        }
        let mut stmt = conn.prepare(
            "SELECT role FROM relationship_edges WHERE subject_id = ?1 AND object_id = ?2",
        )?;
        let roles = stmt
            .query_map(params![target_id, caller_id], |row| row.get::<_, Role>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        // Several kinds may link the same pair; the strongest grant wins.
        Ok(roles.into_iter().max_by_key(|r| match r {
            Role::Viewer => 0,
            Role::Contributor => 1,
            Role::LegacyKeeper => 2,
        }))
    }
}

impl AccessControl for RoleBasedAccess {
    fn can_manage(&self, conn: &Connection, caller_id: &str, subject_id: &str) -> Result<bool> {
        Ok(Self::role_of(conn, caller_id, subject_id)?.is_some_and(|role| role.can_manage()))
    }
}
