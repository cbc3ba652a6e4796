pub mod entity;
pub mod error;
pub mod invoice;
pub mod money;
pub mod payroll;
pub mod period;
pub mod rate;
pub mod settings;
pub mod visit;

pub use entity::{
    name_key, Agency, AgencyId, Clinician, ClinicianId, NewAgency, NewClinician, NewPatient, Patient,
    PatientId, RateCard,
};
pub use error::BillingError;
pub use invoice::{Invoice, InvoiceId, InvoiceStatus, LineItem};
pub use money::Money;
pub use payroll::{
    Adjustment, AdjustmentKind, AdjustmentPolicy, PaymentBase, PaymentId, PaymentMethod, PaymentStatus,
    PayrollPayment,
};
pub use period::{BillingPeriod, CycleConfig, CycleLength, DateRange, PeriodId, PeriodStatus};
pub use rate::{resolve_rate, BillingCode};
pub use settings::BillingSettings;
pub use visit::{Timesheet, TimesheetId, TimesheetStatus, VisitRecord};
