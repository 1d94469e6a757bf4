//! Connection request workflow: PENDING -> APPROVED | DECLINED.
//!
//! Approval writes the forward edge and its mirror in the same transaction as
//! the status change, so a request is never APPROVED with a partial edge set.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::IdentityConfig;
use crate::db::Db;
use crate::error::{is_unique_violation, KingraphError, Result};
use crate::identity::{normalize_email, profile_for_email, require_profile, Profile, ProfileRef};
use crate::store::{edge_exists, insert_edge, RelationshipEdge};
use crate::vocab::{RelationshipKind, Role};

const MAX_MESSAGE_CHARS: usize = 2000;

const REQUEST_COLUMNS: &str =
    "request_id, sender_id, receiver_id, kind, message, status, created_at, decided_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Approved,
    Declined,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Approved => "APPROVED",
            RequestStatus::Declined => "DECLINED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = KingraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(RequestStatus::Pending),
            "APPROVED" => Ok(RequestStatus::Approved),
            "DECLINED" => Ok(RequestStatus::Declined),
            _ => Err(KingraphError::InvalidInput(format!("unknown request status: {}", s))),
        }
    }
}

impl ToSql for RequestStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RequestStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: KingraphError| FromSqlError::Other(Box::new(e)))
    }
}

/// The receiver's answer to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Declined,
}

impl Decision {
    fn status(&self) -> RequestStatus {
        match self {
            Decision::Approved => RequestStatus::Approved,
            Decision::Declined => RequestStatus::Declined,
        }
    }
}

impl FromStr for Decision {
    type Err = KingraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPROVE" | "APPROVED" => Ok(Decision::Approved),
            "DECLINE" | "DECLINED" => Ok(Decision::Declined),
            _ => Err(KingraphError::InvalidInput(format!("unknown decision: {}", s))),
        }
    }
}

/// Proposal that the receiver is the sender's `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub request_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub kind: RelationshipKind,
    pub message: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// A decided request plus the edges its approval wrote.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub request: ConnectionRequest,
    pub edges: Vec<RelationshipEdge>,
}

/// Requests a profile has sent and received.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestLists {
    pub sent: Vec<ConnectionRequest>,
    pub received: Vec<ConnectionRequest>,
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<ConnectionRequest> {
    Ok(ConnectionRequest {
        request_id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        kind: row.get(3)?,
        message: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        decided_at: row.get(7)?,
    })
}

fn find_request(conn: &Connection, request_id: &str) -> Result<Option<ConnectionRequest>> {
    let sql = format!("SELECT {} FROM connection_requests WHERE request_id = ?1", REQUEST_COLUMNS);
    Ok(conn.query_row(&sql, [request_id], request_from_row).optional()?)
}

fn pending_exists(conn: &Connection, sender_id: &str, receiver_id: &str, kind: RelationshipKind) -> Result<bool> {
    let mut stmt = conn.prepare(
        "SELECT 1 FROM connection_requests \
         WHERE sender_id = ?1 AND receiver_id = ?2 AND kind = ?3 AND status = 'PENDING'",
    )?;
    Ok(stmt.exists(params![sender_id, receiver_id, kind])?)
}

fn reachable(profile: Profile) -> Result<Profile> {
    if profile.is_placeholder {
        let id = profile.invited_email.unwrap_or(profile.profile_id);
        return Err(KingraphError::needs_signup(id));
    }
    Ok(profile)
}

/// Receiver of a proposal: a registered profile, never a placeholder.
fn resolve_receiver(conn: &Connection, config: &IdentityConfig, reference: &ProfileRef) -> Result<Profile> {
    match reference {
        ProfileRef::Existing(profile_id) => reachable(require_profile(conn, profile_id)?),
        ProfileRef::Email { email, display_name } => {
            let email = normalize_email(email)?;
            match profile_for_email(conn, &email, display_name.as_deref(), config)? {
                Some(found) => reachable(require_profile(conn, &found.profile_id)?),
                None => Err(KingraphError::needs_signup(email)),
            }
        }
        ProfileRef::Name(_) => Err(KingraphError::InvalidInput(
            "connection requests need a registered profile or an email address".to_string(),
        )),
    }
}

fn clean_message(message: Option<String>) -> Result<Option<String>> {
    let message = message.map(|m| m.trim().to_string()).filter(|m| !m.is_empty());
    if let Some(m) = &message {
        if m.chars().count() > MAX_MESSAGE_CHARS {
            return Err(KingraphError::InvalidInput(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
    }
    Ok(message)
}

/// Store a PENDING request within an open transaction.
pub fn propose_in(
    conn: &Connection,
    config: &IdentityConfig,
    sender_id: &str,
    receiver: &ProfileRef,
    kind: RelationshipKind,
    message: Option<String>,
) -> Result<ConnectionRequest> {
    require_profile(conn, sender_id)?;
    let receiver = resolve_receiver(conn, config, receiver)?;
    let message = clean_message(message)?;

    if receiver.profile_id == sender_id {
        return Err(KingraphError::InvalidInput(
            "a profile cannot send a connection request to itself".to_string(),
        ));
    }
    if edge_exists(conn, sender_id, &receiver.profile_id, kind)? {
        return Err(KingraphError::Conflict(format!(
            "{} is already recorded as {}'s {}",
            receiver.profile_id, sender_id, kind
        )));
    }
    if pending_exists(conn, sender_id, &receiver.profile_id, kind)? {
        return Err(KingraphError::Conflict("an identical request is already pending".to_string()));
    }

    let request = ConnectionRequest {
        request_id: Uuid::new_v4().to_string(),
        sender_id: sender_id.to_string(),
        receiver_id: receiver.profile_id,
        kind,
        message,
        status: RequestStatus::Pending,
        created_at: Utc::now(),
        decided_at: None,
    };
    conn.execute(
        "INSERT INTO connection_requests (request_id, sender_id, receiver_id, kind, message, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            request.request_id,
            request.sender_id,
            request.receiver_id,
            request.kind,
            request.message,
            request.status,
            request.created_at,
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            KingraphError::Conflict("an identical request is already pending".to_string())
        } else {
            KingraphError::Database(e)
        }
    })?;

    log::info!(
        "Request {}: {} proposes {} as {}",
        request.request_id, request.sender_id, request.receiver_id, request.kind
    );
    Ok(request)
}

/// Apply the receiver's decision within an open transaction.
pub fn decide_in(
    conn: &Connection,
    request_id: &str,
    receiver_id: &str,
    decision: Decision,
) -> Result<DecisionOutcome> {
    let mut request = find_request(conn, request_id)?
        .ok_or_else(|| KingraphError::not_found("Connection request", request_id))?;

    if request.receiver_id != receiver_id {
        return Err(KingraphError::Forbidden(format!(
            "only the receiver may decide request {}",
            request_id
        )));
    }
    if request.status.is_terminal() {
        return Err(KingraphError::Conflict(format!(
            "request {} is already {}",
            request_id, request.status
        )));
    }

    let mut edges = Vec::with_capacity(2);
    if decision == Decision::Approved {
        edges.push(insert_edge(
            conn,
            &request.sender_id,
            &request.receiver_id,
            request.kind,
            Role::Viewer,
        )?);
        if let Some(mirror) = request.kind.mirrored() {
            edges.push(insert_edge(conn, &request.receiver_id, &request.sender_id, mirror, Role::Viewer)?);
        }
    }

    let decided_at = Utc::now();
    let updated = conn.execute(
        "UPDATE connection_requests SET status = ?1, decided_at = ?2 \
         WHERE request_id = ?3 AND status = 'PENDING'",
        params![decision.status(), decided_at, request_id],
    )?;
    if updated != 1 {
        return Err(KingraphError::Conflict(format!("request {} was decided concurrently", request_id)));
    }

    request.status = decision.status();
    request.decided_at = Some(decided_at);
    log::info!("Request {} {} ({} edges written)", request_id, request.status, edges.len());
    Ok(DecisionOutcome { request, edges })
}

/// Propose that `receiver` is `sender_id`'s `kind`.
pub async fn propose(
    db: &Db,
    config: &IdentityConfig,
    sender_id: &str,
    receiver: ProfileRef,
    kind: RelationshipKind,
    message: Option<String>,
) -> Result<ConnectionRequest> {
    let config = config.clone();
    let sender_id = sender_id.to_string();
    db.with_transaction(move |tx| propose_in(tx, &config, &sender_id, &receiver, kind, message))
        .await
}

/// Approve or decline a pending request as its receiver.
pub async fn decide(db: &Db, request_id: &str, receiver_id: &str, decision: Decision) -> Result<DecisionOutcome> {
    let request_id = request_id.to_string();
    let receiver_id = receiver_id.to_string();
    db.with_transaction(move |tx| decide_in(tx, &request_id, &receiver_id, decision))
        .await
}

/// Fetch a request by id.
pub async fn get_request(db: &Db, request_id: &str) -> Result<ConnectionRequest> {
    let request_id = request_id.to_string();
    db.with_connection(move |conn| {
        find_request(conn, &request_id)?
            .ok_or_else(|| KingraphError::not_found("Connection request", request_id.clone()))
    })
    .await
}

/// Requests sent and received by a profile, oldest first.
pub async fn list_for_profile(db: &Db, profile_id: &str) -> Result<RequestLists> {
    let profile_id = profile_id.to_string();
    db.with_connection(move |conn| {
        let mut lists = RequestLists::default();
        for (column, out) in [("sender_id", &mut lists.sent), ("receiver_id", &mut lists.received)] {
            let sql = format!(
                "SELECT {} FROM connection_requests WHERE {} = ?1 ORDER BY created_at, request_id",
                REQUEST_COLUMNS, column
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([&profile_id], request_from_row)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(lists)
    })
    .await
}
