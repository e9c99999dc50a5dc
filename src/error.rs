// ABOUTME: Error taxonomy for the sync engine
// ABOUTME: Separates table-fatal failures from isolated per-record failures

use thiserror::Error;

/// Result alias used by the engine layers (auth, fetch, merge, storage).
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised while syncing a table.
///
/// Every variant aborts the current table's attempt and is written into its
/// cursor. Per-record failures in a page merge are counted in the merge
/// outcome instead and never become an error.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Login or token refresh failed, or a refreshed token was rejected again.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The remote API answered with an unexpected flow or shape.
    #[error("Contract violation from {endpoint}: {message} (response keys: {keys:?})")]
    ContractViolation {
        endpoint: String,
        message: String,
        keys: Vec<String>,
    },

    /// A record could not be written inside an all-or-nothing replace, so
    /// the whole replace was rolled back.
    #[error("Record error in {table} ({key}): {message}")]
    Record {
        table: String,
        key: String,
        message: String,
    },

    /// The replace lock for a table is held by another session.
    #[error("Replace lock {lock_id} for {table} is held by another session")]
    LockContention { table: String, lock_id: i64 },

    /// Unknown table, missing primary-key metadata or an unusable request.
    #[error("Structural error: {0}")]
    Structural(String),

    /// Transport failure, timeout or a non-success status other than 401.
    #[error("HTTP error calling {url}: {message}")]
    Http {
        url: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Statement or connection failure in the local store.
    #[error("Storage error during {operation}: {source}")]
    Storage {
        operation: String,
        #[source]
        source: tokio_postgres::Error,
    },
}

impl SyncError {
    pub fn storage(operation: impl Into<String>, source: tokio_postgres::Error) -> Self {
        SyncError::Storage {
            operation: operation.into(),
            source,
        }
    }

    pub fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        let message = if source.is_timeout() {
            "request timed out".to_string()
        } else {
            source.to_string()
        };
        SyncError::Http {
            url: url.into(),
            message,
            source: Some(source),
        }
    }

    pub fn contract(
        endpoint: impl Into<String>,
        message: impl Into<String>,
        body: &serde_json::Value,
    ) -> Self {
        let keys = match body {
            serde_json::Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        };
        SyncError::ContractViolation {
            endpoint: endpoint.into(),
            message: message.into(),
            keys,
        }
    }

    /// Short machine-friendly name for logs and cursor rows.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Auth(_) => "auth",
            SyncError::ContractViolation { .. } => "contract_violation",
            SyncError::Record { .. } => "record",
            SyncError::LockContention { .. } => "lock_contention",
            SyncError::Structural(_) => "structural",
            SyncError::Http { .. } => "http",
            SyncError::Storage { .. } => "storage",
        }
    }
}
