pub mod cache;
pub mod codes;
pub mod db;
pub mod error;
pub mod invoices;
pub mod payroll;
pub mod periods;
pub mod registry;
pub mod settings;
pub mod timesheets;

pub use cache::FilterOptionsCache;
pub use codes::{deactivate_billing_code, list_billing_codes, set_billing_code};
pub use db::{create_db, DbPool};
pub use error::{Result, StorageError};
pub use invoices::{
    count_invoices_for_period, delete_invoice, get_invoice, insert_invoice_claiming, invoice_summary,
    list_invoices, mark_overdue_invoices, require_invoice, save_invoice, DeletedInvoice, InvoiceFilter,
    InvoiceSummary, NewInvoice, StatusTotals,
};
pub use payroll::{
    add_payment_adjustment, delete_payment, find_payment_for, get_payment, insert_payment, list_payments,
    mark_payment_paid, require_payment, PaymentFilter,
};
pub use periods::{
    current_open_period, ended_open_periods, get_period, list_periods, mark_period_invoiced, open_period,
    periods_overlapping, roll_period,
};
pub use registry::{
    backfill_patient, deactivate_agency, deactivate_clinician, deactivate_patient, get_agency, get_clinician,
    get_patient, insert_agency, insert_clinician, insert_patient, list_agencies, list_clinicians, list_patients,
    require_agency, require_clinician, require_patient, update_agency, update_clinician, update_patient,
    AgencyRegistry, ClinicianRegistry, PatientRegistry,
};
pub use settings::{all_settings, get_setting, load_settings, set_setting};
pub use timesheets::{
    find_timesheet_by_hash, get_timesheet, insert_timesheet, list_timesheets, set_timesheet_refs,
    set_timesheet_status, timesheet_filter_options, FilterOptions, NewTimesheet,
};
