//! Relationship vocabulary: the closed set of kinship kinds and access roles.
//!
//! An edge reads "object is the subject's `kind`", so subject=me, object=dad,
//! kind=PARENT means dad is my parent.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::KingraphError;

/// Kind of family relationship carried by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipKind {
    Parent,
    Child,
    Sibling,
    Spouse,
    Grandparent,
    Grandchild,
    AuntUncle,
    NieceNephew,
    Cousin,
}

impl RelationshipKind {
    pub const ALL: [RelationshipKind; 9] = [
        RelationshipKind::Parent,
        RelationshipKind::Child,
        RelationshipKind::Sibling,
        RelationshipKind::Spouse,
        RelationshipKind::Grandparent,
        RelationshipKind::Grandchild,
        RelationshipKind::AuntUncle,
        RelationshipKind::NieceNephew,
        RelationshipKind::Cousin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Parent => "PARENT",
            RelationshipKind::Child => "CHILD",
            RelationshipKind::Sibling => "SIBLING",
            RelationshipKind::Spouse => "SPOUSE",
            RelationshipKind::Grandparent => "GRANDPARENT",
            RelationshipKind::Grandchild => "GRANDCHILD",
            RelationshipKind::AuntUncle => "AUNT_UNCLE",
            RelationshipKind::NieceNephew => "NIECE_NEPHEW",
            RelationshipKind::Cousin => "COUSIN",
        }
    }

    /// Explicit counterpart for the asymmetric pairs; `None` means "do not
    /// derive a reverse edge from this kind".
    pub fn inverse(&self) -> Option<RelationshipKind> {
        match self {
            RelationshipKind::Parent => Some(RelationshipKind::Child),
            RelationshipKind::Child => Some(RelationshipKind::Parent),
            RelationshipKind::Grandparent => Some(RelationshipKind::Grandchild),
            RelationshipKind::Grandchild => Some(RelationshipKind::Grandparent),
            RelationshipKind::AuntUncle => Some(RelationshipKind::NieceNephew),
            RelationshipKind::NieceNephew => Some(RelationshipKind::AuntUncle),
            RelationshipKind::Sibling | RelationshipKind::Spouse | RelationshipKind::Cousin => None,
        }
    }

    pub fn is_symmetric(&self) -> bool {
        matches!(
            self,
            RelationshipKind::Sibling | RelationshipKind::Spouse | RelationshipKind::Cousin
        )
    }

    /// Kind written on the mirrored edge when a relationship is confirmed:
    /// the inverse for asymmetric kinds, the kind itself for symmetric ones.
    pub fn mirrored(&self) -> Option<RelationshipKind> {
        if self.is_symmetric() {
            Some(*self)
        } else {
            self.inverse()
        }
    }

    /// The object is an elder of the subject; display flips these edges so
    /// the elder renders as the source.
    pub fn is_ascending(&self) -> bool {
        matches!(
            self,
            RelationshipKind::Parent | RelationshipKind::Grandparent | RelationshipKind::AuntUncle
        )
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipKind {
    type Err = KingraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        RelationshipKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| KingraphError::InvalidInput(format!("unknown relationship kind: {}", s)))
    }
}

impl ToSql for RelationshipKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RelationshipKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e: KingraphError| FromSqlError::Other(Box::new(e)))
    }
}

/// Access granted to an edge's object over the subject's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    Viewer,
    Contributor,
    /// Owner-equivalent: may manage the subject's relationships.
    LegacyKeeper,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "VIEWER",
            Role::Contributor => "CONTRIBUTOR",
            Role::LegacyKeeper => "LEGACY_KEEPER",
        }
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Contributor | Role::LegacyKeeper)
    }

    pub fn can_manage(&self) -> bool {
        matches!(self, Role::LegacyKeeper)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = KingraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VIEWER" => Ok(Role::Viewer),
            "CONTRIBUTOR" => Ok(Role::Contributor),
            "LEGACY_KEEPER" | "OWNER" => Ok(Role::LegacyKeeper),
            _ => Err(KingraphError::InvalidInput(format!("unknown role: {}", s))),
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e: KingraphError| FromSqlError::Other(Box::new(e)))
    }
}
