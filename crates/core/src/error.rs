use thiserror::Error;

/// Rejections raised by the domain state machines and validators.
///
/// Every variant leaves the object it was raised for unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("Invoice is {status}. Deleting non-draft invoices requires explicit confirmation")]
    DeleteRequiresForce { status: String },
    #[error("Cannot delete a {status} payroll payment")]
    PaymentNotDeletable { status: String },
    #[error("Adjustments are not allowed on a paid payroll payment")]
    AdjustmentAfterPaid,
    #[error("Clinical record number {0} is already assigned to another patient")]
    DuplicateRecordNumber(String),
    #[error("Invalid billing cycle: {0}")]
    InvalidCycle(String),
}
