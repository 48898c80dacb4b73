//! Store error taxonomy.
//!
//! Raw `sqlx::Error`s are classified once, at the store boundary, into the
//! three cases callers actually react to: contention (retried inside the
//! store), loss of the database (fatal for the pipeline until it returns),
//! and everything else.

/// SQLite primary result codes this crate reacts to.
mod sqlite_code {
    pub const BUSY: i32 = 5;
    pub const LOCKED: i32 = 6;
    pub const IOERR: i32 = 10;
    pub const CANTOPEN: i32 = 14;
    pub const NOTADB: i32 = 26;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Busy/locked database or exhausted pool. Transient.
    #[error("Store contention: {0}")]
    Contention(String),

    /// The database cannot be reached at all.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(sqlx::Error),

    /// A stored value could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => StoreError::Contention(err.to_string()),
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::Database(db_err) => {
                // Extended result codes carry the primary code in the low byte.
                let primary = db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);
                match primary {
                    Some(sqlite_code::BUSY | sqlite_code::LOCKED) => {
                        StoreError::Contention(err.to_string())
                    }
                    Some(sqlite_code::IOERR | sqlite_code::CANTOPEN | sqlite_code::NOTADB) => {
                        StoreError::Unavailable(err.to_string())
                    }
                    _ => StoreError::Query(err),
                }
            }
            _ => StoreError::Query(err),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_contention() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_contention());
    }

    #[test]
    fn closed_pool_is_unavailable() {
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_unavailable());
    }

    #[test]
    fn missing_row_is_plain_query_error() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Query(_)));
        assert!(!err.is_contention());
        assert!(!err.is_unavailable());
    }
}
