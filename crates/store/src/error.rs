use thiserror::Error;

use crate::asn::AsnParseError;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} does not exist")]
    NotFound(&'static str),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Validation(String),

    #[error("No IPs available in {0}.")]
    NoUnusedIps(String),

    #[error("No ports available in {0}.")]
    NoUnusedPorts(String),

    #[error(transparent)]
    Asn(#[from] AsnParseError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Folds a unique-constraint violation into `AlreadyExists`, so callers
    /// can map it to the matching RPC status.
    pub(crate) fn on_insert(err: sqlx::Error, what: &str) -> StoreError {
        if let sqlx::Error::Database(ref db) = err {
            if db.is_unique_violation() {
                return StoreError::AlreadyExists(format!("{what} already exists"));
            }
        }

        StoreError::Database(err)
    }
}
