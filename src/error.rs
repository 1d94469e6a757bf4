use thiserror::Error;

/// Main error type for Kingraph
#[derive(Error, Debug)]
pub enum KingraphError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization errors
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A migration script was rejected by SQLite; `source` keeps its error code.
    #[error("Migration {name} failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Referenced profile, account, edge or request does not exist.
    ///
    /// `needs_signup` is set when the reference was an email address with no
    /// registered account behind it, so callers can offer an invitation.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: &'static str,
        id: String,
        needs_signup: bool,
    },

    /// Duplicate edge, duplicate pending request, or request already decided
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller lacks authority over the target
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Persistence layer failure not covered by rusqlite itself
    #[error("Upstream unavailable: {0}")]
    Upstream(String),
}

/// Error classes surfaced to the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Forbidden,
    InvalidInput,
    UpstreamUnavailable,
}

impl KingraphError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        KingraphError::NotFound {
            entity,
            id: id.into(),
            needs_signup: false,
        }
    }

    /// NotFound for an email reference whose owner has not registered yet.
    pub fn needs_signup(email: impl Into<String>) -> Self {
        KingraphError::NotFound {
            entity: "Account",
            id: email.into(),
            needs_signup: true,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            KingraphError::NotFound { .. } => ErrorKind::NotFound,
            KingraphError::Conflict(_) => ErrorKind::Conflict,
            KingraphError::Forbidden(_) => ErrorKind::Forbidden,
            KingraphError::InvalidInput(_) | KingraphError::Config(_) => ErrorKind::InvalidInput,
            KingraphError::Database(_)
            | KingraphError::Migration { .. }
            | KingraphError::Io(_)
            | KingraphError::Json(_)
            | KingraphError::Upstream(_) => ErrorKind::UpstreamUnavailable,
        }
    }

    /// Whether the caller should be offered "invite them to sign up first".
    pub fn is_signup_needed(&self) -> bool {
        matches!(self, KingraphError::NotFound { needs_signup: true, .. })
    }
}

/// True when `err` is SQLite rejecting a row over a UNIQUE constraint.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Convenient Result type using KingraphError
pub type Result<T> = std::result::Result<T, KingraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KingraphError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: KingraphError = rusqlite_err.into();
        assert!(matches!(err, KingraphError::Database(_)));
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[test]
    fn test_needs_signup_signal() {
        let err = KingraphError::needs_signup("b@example.com");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_signup_needed());

        let plain = KingraphError::not_found("Profile", "p1");
        assert_eq!(plain.kind(), ErrorKind::NotFound);
        assert!(!plain.is_signup_needed());
    }

    #[test]
    fn test_unique_violation_detection() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (email TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err();
        assert!(is_unique_violation(&err));
        assert!(!is_unique_violation(&rusqlite::Error::InvalidQuery));
    }
}
