use thiserror::Error;

/// Failures of a sync cycle, grouped by how the caller should react.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Credentials missing, malformed, rejected or expired.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Spreadsheet or tab does not exist (or is not shared with the service account).
    #[error("not found: {0}")]
    NotFound(String),

    /// Network-level failure; worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// The API answered with something we could not make sense of.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Short label used in logs and in the `sync_runs` table.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Auth(_) => "auth",
            SyncError::NotFound(_) => "not_found",
            SyncError::Transient(_) => "transient",
            SyncError::Db(_) => "db",
            SyncError::InvalidResponse(_) => "invalid_response",
            SyncError::Config(_) => "config",
        }
    }
}
