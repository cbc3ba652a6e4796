use anyhow::{bail, Context};
use carebill_billing::{Billing, ExtractedTimesheet, Intake};
use carebill_core::{
    Adjustment, AgencyId, ClinicianId, DateRange, InvoiceId, Money, NewAgency, NewClinician, PaymentBase, PaymentId,
    PeriodId, TimesheetId,
};
use carebill_storage as storage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{AgencyCommand, ClinicianCommand, CodeCommand, Command, InvoiceCommand, PaymentCommand};

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Settings values are JSON; bare words are taken as strings.
fn setting_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub async fn run(billing: &Billing, command: Command, now: DateTime<Utc>) -> anyhow::Result<()> {
    let pool = billing.pool();
    let today = now.date_naive();

    match command {
        Command::Init => {
            let settings = storage::load_settings(pool).await?;
            let period = storage::current_open_period(pool, &settings, today).await?;
            print_json(&period)
        }
        Command::Setting { key: None, .. } => {
            let all: serde_json::Map<String, Value> = storage::all_settings(pool).await?.into_iter().collect();
            print_json(&all)
        }
        Command::Setting { key: Some(key), value: None } => {
            print_json(&storage::get_setting(pool, &key).await?.unwrap_or(Value::Null))
        }
        Command::Setting { key: Some(key), value: Some(raw) } => {
            let value = setting_value(&raw);
            storage::set_setting(pool, &key, &value).await?;
            tracing::info!(key = %key, %value, "Setting updated");
            print_json(&storage::load_settings(pool).await?)
        }
        Command::Agency(cmd) => agency(billing, cmd).await,
        Command::Clinician(cmd) => clinician(billing, cmd).await,
        Command::Code(CodeCommand::List { all }) => print_json(&storage::list_billing_codes(pool, all).await?),
        Command::Code(CodeCommand::Set { code, description, rate }) => {
            print_json(&storage::set_billing_code(pool, &code, &description, Money::from_decimal(rate)).await?)
        }
        Command::Code(CodeCommand::Remove { code }) => {
            storage::deactivate_billing_code(pool, &code).await?;
            print_json(&json!({ "removed": code }))
        }
        Command::Intake { file, image } => {
            let content = std::fs::read_to_string(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let mut extracted: ExtractedTimesheet =
                serde_json::from_str(&content).with_context(|| format!("Invalid timesheet in {}", file.display()))?;
            if let Some(path) = image {
                extracted.image = Some(std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?);
            }
            match billing.attach_timesheet(extracted, today).await? {
                Intake::Attached(attached) => print_json(&json!({
                    "timesheet": attached.timesheet,
                    "agency": attached.agency.as_ref().map(|r| &r.entity().name),
                    "clinician": attached.clinician.as_ref().map(|r| &r.entity().name),
                    "patient": attached.patient.as_ref().map(|r| &r.entity().name),
                    "flag_reason": attached.flag_reason,
                })),
                Intake::Duplicate(id) => print_json(&json!({ "duplicate_of": id })),
            }
        }
        Command::Review { timesheet } => print_json(&billing.review_timesheet(TimesheetId(timesheet)).await?),
        Command::Periods => print_json(&storage::list_periods(pool).await?),
        Command::Preview { period } => print_json(&billing.preview_invoices(PeriodId(period), today).await?),
        Command::Generate { period } => print_json(&billing.generate_invoices(PeriodId(period), now).await?),
        Command::Invoice(cmd) => invoice(billing, cmd, now).await,
        Command::Invoices { period, status } => {
            let filter = storage::InvoiceFilter { period_id: period.map(PeriodId), agency_id: None, status };
            print_json(&storage::list_invoices(pool, filter).await?)
        }
        Command::Summary => print_json(&storage::invoice_summary(pool).await?),
        Command::Payroll { period: Some(period), record, .. } => {
            let period = PeriodId(period);
            if record {
                print_json(&billing.generate_payroll_payments(period).await?)
            } else {
                print_json(&billing.payroll_summary(period).await?)
            }
        }
        Command::Payroll { from: Some(from), to: Some(to), .. } => {
            if to < from {
                bail!("--to must not be before --from");
            }
            print_json(&billing.payroll_between(DateRange::new(from, to)).await?)
        }
        Command::Payroll { .. } => {
            let settings = storage::load_settings(pool).await?;
            let period = storage::current_open_period(pool, &settings, today).await?;
            print_json(&billing.payroll_summary(period.id).await?)
        }
        Command::Payment(cmd) => payment(billing, cmd, today).await,
        Command::Cycle => print_json(&billing.run_cycle(now).await?),
        Command::Filters => print_json(&billing.filter_options().await?),
    }
}

async fn agency(billing: &Billing, cmd: AgencyCommand) -> anyhow::Result<()> {
    let pool = billing.pool();
    match cmd {
        AgencyCommand::Add { name, rates, default_rate, terms, email } => {
            let mut new = NewAgency::named(&name);
            new.rates = rates.into_iter().map(|(code, rate)| (code, Money::from_decimal(rate))).collect();
            new.default_rate = default_rate.map(Money::from_decimal);
            new.payment_terms_days = terms;
            new.contact_email = email;
            print_json(&storage::insert_agency(pool, &new).await?)
        }
        AgencyCommand::List { all } => print_json(&storage::list_agencies(pool, all).await?),
        AgencyCommand::Deactivate { id } => {
            storage::deactivate_agency(pool, AgencyId(id)).await?;
            print_json(&storage::require_agency(pool, AgencyId(id)).await?)
        }
    }
}

async fn clinician(billing: &Billing, cmd: ClinicianCommand) -> anyhow::Result<()> {
    let pool = billing.pool();
    match cmd {
        ClinicianCommand::Add { name, title, pay_rate, agencies } => {
            let mut new = NewClinician::named(&name);
            new.title = title;
            new.pay_rate = Money::from_decimal(pay_rate);
            new.agencies = agencies.into_iter().map(AgencyId).collect();
            print_json(&storage::insert_clinician(pool, &new).await?)
        }
        ClinicianCommand::List { all } => print_json(&storage::list_clinicians(pool, all).await?),
        ClinicianCommand::Deactivate { id } => {
            storage::deactivate_clinician(pool, ClinicianId(id)).await?;
            print_json(&storage::require_clinician(pool, ClinicianId(id)).await?)
        }
    }
}

async fn invoice(billing: &Billing, cmd: InvoiceCommand, now: DateTime<Utc>) -> anyhow::Result<()> {
    match cmd {
        InvoiceCommand::Send { id } => print_json(&billing.send_invoice(InvoiceId(id), now).await?),
        InvoiceCommand::MarkSent { id } => print_json(&billing.mark_invoice_sent(InvoiceId(id), now).await?),
        InvoiceCommand::Paid { id, amount, notes } => print_json(
            &billing
                .mark_invoice_paid(InvoiceId(id), now, amount.map(Money::from_decimal), notes)
                .await?,
        ),
        InvoiceCommand::Void { id } => print_json(&billing.void_invoice(InvoiceId(id)).await?),
        InvoiceCommand::Adjust { id, amount, note } => {
            print_json(&billing.adjust_invoice(InvoiceId(id), Money::from_decimal(amount), note).await?)
        }
        InvoiceCommand::Delete { id, force } => print_json(&billing.delete_invoice(InvoiceId(id), force).await?),
    }
}

async fn payment(billing: &Billing, cmd: PaymentCommand, today: chrono::NaiveDate) -> anyhow::Result<()> {
    match cmd {
        PaymentCommand::Add { clinician, name, amount, period, hours, notes } => {
            let pool = billing.pool();
            let registered = match clinician {
                Some(id) => Some(storage::require_clinician(pool, ClinicianId(id)).await?),
                None => None,
            };
            let period_label = match period {
                Some(id) => storage::get_period(pool, PeriodId(id))
                    .await?
                    .map(|p| p.label)
                    .with_context(|| format!("No billing period {id}"))?,
                None => String::new(),
            };
            let base = PaymentBase {
                clinician_id: registered.as_ref().map(|c| c.id),
                clinician_name: registered
                    .as_ref()
                    .map(|c| c.name.clone())
                    .or(name)
                    .context("A clinician id or name is required")?,
                clinician_title: registered.as_ref().and_then(|c| c.title.clone()),
                period_id: period.map(PeriodId),
                period_label,
                amount: Money::from_decimal(amount),
                hours,
                visits: 0,
                pay_rate: registered.as_ref().map(|c| c.pay_rate).unwrap_or_else(Money::zero),
            };
            print_json(&billing.record_payment(base, &notes).await?)
        }
        PaymentCommand::Pay { id, method, date } => {
            print_json(&billing.pay(PaymentId(id), date.unwrap_or(today), method).await?)
        }
        PaymentCommand::Adjust { id, kind, amount, reason } => print_json(
            &billing
                .adjust_payment(PaymentId(id), Adjustment::new(kind, Money::from_decimal(amount), reason))
                .await?,
        ),
        PaymentCommand::Delete { id } => {
            storage::delete_payment(billing.pool(), PaymentId(id)).await?;
            print_json(&json!({ "deleted": id }))
        }
    }
}
