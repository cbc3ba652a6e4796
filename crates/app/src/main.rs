use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use carebill_billing::{Billing, JsonArtifactRenderer};
use carebill_core::{AdjustmentKind, InvoiceStatus, PaymentMethod};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "carebill", version)]
#[command(about = "Billing periods, agency invoices and clinician payroll for home-health visits")]
struct Cli {
    /// Config file (default: carebill.toml in the platform config directory)
    #[arg(long, env = "CAREBILL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the database and open the current billing period
    Init,
    /// Show all business settings, one setting, or change one
    Setting {
        key: Option<String>,
        /// JSON value; anything that is not valid JSON is stored as a string
        value: Option<String>,
    },
    #[command(subcommand)]
    Agency(AgencyCommand),
    #[command(subcommand)]
    Clinician(ClinicianCommand),
    /// Visit-code catalog
    #[command(subcommand)]
    Code(CodeCommand),
    /// Attach an extracted timesheet (JSON) to the open period
    Intake {
        file: PathBuf,
        /// Original scan, used to reject duplicates
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Clear a review hold on a timesheet
    Review { timesheet: i64 },
    /// List billing periods, newest first
    Periods,
    /// Show the invoices generation would create, without saving
    Preview {
        #[arg(long)]
        period: i64,
    },
    /// Create draft invoices for a period
    Generate {
        #[arg(long)]
        period: i64,
    },
    #[command(subcommand)]
    Invoice(InvoiceCommand),
    /// List invoices
    Invoices {
        #[arg(long)]
        period: Option<i64>,
        #[arg(long)]
        status: Option<InvoiceStatus>,
    },
    /// Invoice totals by status
    Summary,
    /// Clinician payroll for a period or a date range
    Payroll {
        #[arg(long, conflicts_with_all = ["from", "to"])]
        period: Option<i64>,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        /// Record a pending payment for every clinician without one
        #[arg(long, requires = "period")]
        record: bool,
    },
    #[command(subcommand)]
    Payment(PaymentCommand),
    /// Roll ended periods, auto-invoice and mark overdue invoices
    Cycle,
    /// Distinct clinician names and visit codes
    Filters,
}

#[derive(Subcommand, Debug)]
pub enum AgencyCommand {
    Add {
        name: String,
        /// Rate card entry, e.g. `P=85` (repeatable)
        #[arg(long = "rate", value_parser = parse_rate)]
        rates: Vec<(String, Decimal)>,
        #[arg(long)]
        default_rate: Option<Decimal>,
        #[arg(long, default_value_t = 30)]
        terms: u32,
        #[arg(long)]
        email: Option<String>,
    },
    List {
        /// Include deactivated agencies
        #[arg(long)]
        all: bool,
    },
    Deactivate { id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum ClinicianCommand {
    Add {
        name: String,
        #[arg(long)]
        title: Option<String>,
        /// Dollars per hour
        #[arg(long, default_value = "0")]
        pay_rate: Decimal,
        #[arg(long = "agency")]
        agencies: Vec<i64>,
    },
    List {
        #[arg(long)]
        all: bool,
    },
    Deactivate { id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum CodeCommand {
    List {
        #[arg(long)]
        all: bool,
    },
    /// Add a code or change its description and suggested rate
    Set {
        code: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "0")]
        rate: Decimal,
    },
    Remove { code: String },
}

#[derive(Subcommand, Debug)]
pub enum InvoiceCommand {
    /// Deliver through the configured mailer and mark sent
    Send { id: i64 },
    /// Mark sent without delivering
    MarkSent { id: i64 },
    Paid {
        id: i64,
        /// Defaults to the invoice total
        #[arg(long)]
        amount: Option<Decimal>,
        #[arg(long)]
        notes: Option<String>,
    },
    Void { id: i64 },
    /// Add a signed adjustment, e.g. `-15.00`
    Adjust {
        id: i64,
        #[arg(allow_hyphen_values = true)]
        amount: Decimal,
        #[arg(long)]
        note: Option<String>,
    },
    Delete {
        id: i64,
        /// Required for anything past draft
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum PaymentCommand {
    /// Record a one-off payment, optionally against a period
    Add {
        /// Registered clinician id
        #[arg(long, conflicts_with = "name")]
        clinician: Option<i64>,
        /// Payee name when the clinician is not registered
        #[arg(long, required_unless_present = "clinician")]
        name: Option<String>,
        amount: Decimal,
        #[arg(long)]
        period: Option<i64>,
        #[arg(long, default_value = "0")]
        hours: Decimal,
        #[arg(long, default_value = "")]
        notes: String,
    },
    Pay {
        id: i64,
        #[arg(long, default_value = "check")]
        method: PaymentMethod,
        /// Defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    Adjust {
        id: i64,
        #[arg(long)]
        kind: AdjustmentKind,
        #[arg(allow_hyphen_values = true)]
        amount: Decimal,
        #[arg(long, default_value = "")]
        reason: String,
    },
    Delete { id: i64 },
}

fn parse_rate(raw: &str) -> Result<(String, Decimal), String> {
    let (code, amount) = raw
        .split_once('=')
        .ok_or_else(|| format!("Expected CODE=AMOUNT, got '{raw}'"))?;
    let amount = amount
        .trim()
        .parse::<Decimal>()
        .map_err(|e| format!("Invalid rate '{amount}': {e}"))?;
    Ok((code.trim().to_string(), amount))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)))
        .with_writer(std::io::stderr)
        .init();

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create data directory")?;
    }
    let pool = carebill_storage::create_db(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    tracing::debug!(database = %config.database_path.display(), "Database ready");

    let mut billing = Billing::new(pool);
    if let Some(dir) = &config.artifacts_dir {
        billing = billing.with_renderer(Arc::new(JsonArtifactRenderer::new(dir)));
    }

    commands::run(&billing, cli.command, chrono::Utc::now()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_arguments_parse() {
        assert_eq!(parse_rate("WC = 110.50").unwrap(), ("WC".to_string(), Decimal::new(11050, 2)));
        assert!(parse_rate("P85").is_err());
        assert!(parse_rate("P=abc").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn negative_adjustments_parse() {
        let cli = Cli::try_parse_from(["carebill", "invoice", "adjust", "4", "-15.00", "--note", "credit"]).unwrap();
        match cli.command {
            Command::Invoice(InvoiceCommand::Adjust { id, amount, note }) => {
                assert_eq!(id, 4);
                assert_eq!(amount, Decimal::new(-1500, 2));
                assert_eq!(note.as_deref(), Some("credit"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn payment_add_needs_a_payee() {
        assert!(Cli::try_parse_from(["carebill", "payment", "add", "120"]).is_err());
        let cli = Cli::try_parse_from(["carebill", "payment", "add", "--name", "Maria Lopez", "120.50"]).unwrap();
        match cli.command {
            Command::Payment(PaymentCommand::Add { clinician, name, amount, period, .. }) => {
                assert_eq!(clinician, None);
                assert_eq!(name.as_deref(), Some("Maria Lopez"));
                assert_eq!(amount, Decimal::new(12050, 2));
                assert_eq!(period, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
