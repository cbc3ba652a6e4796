//! Billing workflows on top of the registries and the database: timesheet
//! intake, per-agency invoicing, hourly payroll and the scheduled cycle.

pub mod cycle;
pub mod engine;
pub mod error;
pub mod hash;
pub mod intake;
pub mod invoices;
pub mod payroll;
pub mod render;
pub mod service;

pub use cycle::CycleReport;
pub use engine::{build_invoice_drafts, compute_payroll, payroll_totals, InvoiceDraft, PayrollRow, PayrollTotals};
pub use error::{Result, ServiceError};
pub use intake::{AttachedTimesheet, ExtractedTimesheet, Intake};
pub use invoices::{AgencyFailure, GenerationReport, SkipReason};
pub use payroll::{ClinicianFailure, PaymentReport, PayrollSummary};
pub use render::{DeliveryError, InvoiceDocument, InvoiceMailer, InvoiceRenderer, JsonArtifactRenderer, NoArtifacts};
pub use service::Billing;
