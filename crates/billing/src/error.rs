use carebill_core::BillingError;
use carebill_storage::StorageError;
use thiserror::Error;

use crate::render::DeliveryError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("Invoice delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

impl ServiceError {
    /// True when the caller referenced something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::Storage(StorageError::NotFound { .. }))
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
