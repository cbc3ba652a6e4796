use carebill_core::BillingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("A {entity} named '{name}' already exists")]
    DuplicateName { entity: &'static str, name: String },
    #[error("A timesheet with image hash {0} was already uploaded")]
    DuplicateTimesheet(String),
    #[error("Clinical record number {0} is already assigned to another patient")]
    DuplicateRecordNumber(String),
    #[error("Billing code '{0}' not found")]
    UnknownCode(String),
    #[error("{clinician} already has a payment for period {period}")]
    DuplicatePayment { clinician: String, period: i64 },
    #[error("{claimed} of {wanted} timesheets could be claimed; another invoice holds the rest")]
    ClaimConflict { wanted: usize, claimed: u64 },
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Whether `err` is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}
