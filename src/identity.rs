//! Identity resolution: turn a loose reference to a person into a profile id,
//! creating placeholder profiles for relatives who have no account.
//!
//! Every profile is backed by exactly one account row. Placeholders get a
//! synthetic account email on the reserved placeholder domain and carry an
//! explicit `is_placeholder` flag; the real address they were created for is
//! kept in `invited_email`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::IdentityConfig;
use crate::db::Db;
use crate::error::{is_unique_violation, KingraphError, Result};

/// Attempts before a resolution that keeps losing creation races gives up.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

const PROFILE_SELECT: &str = "SELECT p.profile_id, p.account_id, p.display_name, p.portrait_url, \
     a.email, p.is_placeholder, p.invited_email, p.created_at \
     FROM profiles p JOIN accounts a ON a.account_id = p.account_id";

/// A person node in the family graph, registered or placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub profile_id: String,
    pub account_id: String,
    pub display_name: String,
    pub portrait_url: Option<String>,
    /// Account email; synthetic for placeholders.
    pub email: String,
    pub is_placeholder: bool,
    pub invited_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Loose reference to a person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileRef {
    Existing(String),
    Email {
        email: String,
        display_name: Option<String>,
    },
    Name(String),
}

/// Outcome of resolving a [`ProfileRef`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub profile_id: String,
    /// A profile row was written during this resolution.
    pub created: bool,
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        profile_id: row.get(0)?,
        account_id: row.get(1)?,
        display_name: row.get(2)?,
        portrait_url: row.get(3)?,
        email: row.get(4)?,
        is_placeholder: row.get(5)?,
        invited_email: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Trim and lowercase an email, rejecting anything without a local part and a domain.
pub fn normalize_email(email: &str) -> Result<String> {
    let normalized = email.trim().to_lowercase();
    match normalized.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(normalized)
        }
        _ => Err(KingraphError::InvalidInput(format!("not an email address: {:?}", email))),
    }
}

/// Deterministic synthetic account email for a placeholder created from `email`.
///
/// Two resolutions of the same address produce the same synthetic email, so
/// the accounts UNIQUE constraint admits only one placeholder per address.
pub fn placeholder_email_for(email: &str, domain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("placeholder+{}@{}", &digest[..16], domain)
}

/// Legacy derivation of placeholder-ness from the account email.
///
/// Rows written by this crate carry an explicit flag; this only exists for
/// data whose flag is unknown. A real address on the reserved domain would be
/// misclassified.
pub fn is_placeholder_email(email: &str, domain: &str) -> bool {
    email
        .rsplit_once('@')
        .map(|(_, d)| d.eq_ignore_ascii_case(domain))
        .unwrap_or(false)
}

fn display_name_for(name: Option<&str>, email: Option<&str>, config: &IdentityConfig) -> String {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .or_else(|| email.and_then(|e| e.split('@').next()).filter(|l| !l.is_empty()))
        .unwrap_or(&config.default_display_name)
        .to_string()
}

fn insert_account(conn: &Connection, email: &str) -> Result<String> {
    let account_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO accounts (account_id, email, created_at) VALUES (?1, ?2, ?3)",
        params![account_id, email, Utc::now()],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            KingraphError::Conflict(format!("account already exists for {}", email))
        } else {
            KingraphError::Database(e)
        }
    })?;
    Ok(account_id)
}

fn insert_profile(
    conn: &Connection,
    account_id: &str,
    display_name: &str,
    is_placeholder: bool,
    invited_email: Option<&str>,
) -> Result<String> {
    let profile_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO profiles (profile_id, account_id, display_name, is_placeholder, invited_email, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![profile_id, account_id, display_name, is_placeholder, invited_email, Utc::now()],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            KingraphError::Conflict(format!("account {} already has a profile", account_id))
        } else {
            KingraphError::Database(e)
        }
    })?;
    Ok(profile_id)
}

/// Fetch a profile by id.
pub fn find_profile(conn: &Connection, profile_id: &str) -> Result<Option<Profile>> {
    let sql = format!("{} WHERE p.profile_id = ?1", PROFILE_SELECT);
    Ok(conn.query_row(&sql, [profile_id], profile_from_row).optional()?)
}

/// Fetch a profile by id, failing NotFound when absent.
pub fn require_profile(conn: &Connection, profile_id: &str) -> Result<Profile> {
    find_profile(conn, profile_id)?.ok_or_else(|| KingraphError::not_found("Profile", profile_id))
}

/// Profile behind the account registered with `email`, healing an account
/// that has lost its profile. `None` when no account uses the address.
pub fn profile_for_email(
    conn: &Connection,
    email: &str,
    display_name: Option<&str>,
    config: &IdentityConfig,
) -> Result<Option<Resolution>> {
    let account: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT a.account_id, p.profile_id FROM accounts a \
             LEFT JOIN profiles p ON p.account_id = a.account_id WHERE a.email = ?1",
            [email],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match account {
        None => Ok(None),
        Some((_, Some(profile_id))) => Ok(Some(Resolution { profile_id, created: false })),
        Some((account_id, None)) => {
            log::warn!("Account {} has no profile, creating one", account_id);
            let name = display_name_for(display_name, Some(email), config);
            let placeholder = is_placeholder_email(email, &config.placeholder_domain);
            let profile_id = insert_profile(conn, &account_id, &name, placeholder, None)?;
            Ok(Some(Resolution { profile_id, created: true }))
        }
    }
}

/// Whether `profile_id` exists, without loading the row.
pub fn profile_exists(conn: &Connection, profile_id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM profiles WHERE profile_id = ?1", [profile_id], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Resolve a reference within an open transaction.
pub fn resolve_in(conn: &Connection, config: &IdentityConfig, reference: &ProfileRef) -> Result<Resolution> {
    match reference {
        ProfileRef::Existing(profile_id) => {
            require_profile(conn, profile_id)?;
            Ok(Resolution { profile_id: profile_id.clone(), created: false })
        }
        ProfileRef::Email { email, display_name } => {
            let email = normalize_email(email)?;
            if let Some(found) = profile_for_email(conn, &email, display_name.as_deref(), config)? {
                return Ok(found);
            }

            let synthetic = placeholder_email_for(&email, &config.placeholder_domain);
            if let Some(found) = profile_for_email(conn, &synthetic, display_name.as_deref(), config)? {
                return Ok(found);
            }

            let name = display_name_for(display_name.as_deref(), Some(&email), config);
            let account_id = insert_account(conn, &synthetic)?;
            let profile_id = insert_profile(conn, &account_id, &name, true, Some(&email))?;
            log::info!("Created placeholder profile {} for {}", profile_id, email);
            Ok(Resolution { profile_id, created: true })
        }
        ProfileRef::Name(name) => {
            let name = name.trim();
            if name.is_empty() {
                return Err(KingraphError::InvalidInput(
                    "a profile id, email or display name is required".to_string(),
                ));
            }
            let synthetic = format!("manual+{}@{}", Uuid::new_v4().simple(), config.placeholder_domain);
            let account_id = insert_account(conn, &synthetic)?;
            let profile_id = insert_profile(conn, &account_id, name, true, None)?;
            log::info!("Created placeholder profile {} for {:?}", profile_id, name);
            Ok(Resolution { profile_id, created: true })
        }
    }
}

/// Resolve a reference to a stable profile id, creating a placeholder when needed.
///
/// A resolution that loses a creation race to a concurrent one retries and
/// picks up the winner's profile instead of failing.
pub async fn resolve(db: &Db, config: &IdentityConfig, reference: ProfileRef) -> Result<Resolution> {
    let (resolution, ()) = resolve_then(db, config, reference, |_, _| Ok(())).await?;
    Ok(resolution)
}

/// Resolve a reference and run `then` on the result in the same transaction.
///
/// A failure in `then` rolls back any placeholder the resolution created.
/// Only a lost creation race is retried; a conflict raised by `then` is
/// returned as is.
pub async fn resolve_then<T, F>(
    db: &Db,
    config: &IdentityConfig,
    reference: ProfileRef,
    then: F,
) -> Result<(Resolution, T)>
where
    F: Fn(&Connection, &Resolution) -> Result<T> + Clone + Send + 'static,
    T: Send + 'static,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let config = config.clone();
        let reference = reference.clone();
        let then = then.clone();
        let lost_race = Arc::new(AtomicBool::new(false));
        let flag = lost_race.clone();
        let outcome = db
            .with_transaction(move |tx| {
                let resolution = resolve_in(tx, &config, &reference).map_err(|e| {
                    if matches!(e, KingraphError::Conflict(_)) {
                        flag.store(true, Ordering::SeqCst);
                    }
                    e
                })?;
                let value = then(tx, &resolution)?;
                Ok((resolution, value))
            })
            .await;
        match outcome {
            Err(KingraphError::Conflict(msg))
                if lost_race.load(Ordering::SeqCst) && attempt < MAX_RESOLVE_ATTEMPTS =>
            {
                log::debug!("Identity resolution lost a race ({}), retrying", msg);
            }
            other => return other,
        }
    }
}

/// Register a new account and its profile.
pub async fn register_account(
    db: &Db,
    config: &IdentityConfig,
    email: &str,
    display_name: &str,
) -> Result<Profile> {
    let email = normalize_email(email)?;
    if is_placeholder_email(&email, &config.placeholder_domain) {
        return Err(KingraphError::InvalidInput(format!(
            "{} is reserved for placeholder profiles",
            config.placeholder_domain
        )));
    }
    let name = display_name_for(Some(display_name), Some(&email), config);

    db.with_transaction(move |tx| {
        let account_id = insert_account(tx, &email)?;
        let profile_id = insert_profile(tx, &account_id, &name, false, None)?;
        log::info!("Registered account {} with profile {}", account_id, profile_id);
        require_profile(tx, &profile_id)
    })
    .await
}

/// Fetch a profile by id.
pub async fn get_profile(db: &Db, profile_id: &str) -> Result<Profile> {
    let profile_id = profile_id.to_string();
    db.with_connection(move |conn| require_profile(conn, &profile_id)).await
}

/// Profile owned by an authenticated account.
pub async fn profile_for_account(db: &Db, account_id: &str) -> Result<Profile> {
    let account_id = account_id.to_string();
    db.with_connection(move |conn| {
        let sql = format!("{} WHERE p.account_id = ?1", PROFILE_SELECT);
        conn.query_row(&sql, [&account_id], profile_from_row)
            .optional()?
            .ok_or_else(|| KingraphError::not_found("Profile for account", account_id.clone()))
    })
    .await
}

/// Batch fetch of profiles; unknown ids are skipped.
pub fn load_profiles_in(conn: &Connection, profile_ids: &[String]) -> Result<Vec<Profile>> {
    let mut profiles = Vec::with_capacity(profile_ids.len());
    for chunk in profile_ids.chunks(crate::store::MAX_SQL_PARAMS) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!("{} WHERE p.profile_id IN ({})", PROFILE_SELECT, placeholders);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), profile_from_row)?;
        for row in rows {
            profiles.push(row?);
        }
    }
    Ok(profiles)
}

/// Async wrapper around [`load_profiles_in`].
pub async fn load_profiles(db: &Db, profile_ids: Vec<String>) -> Result<Vec<Profile>> {
    db.with_connection(move |conn| load_profiles_in(conn, &profile_ids)).await
}
