use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::BillingError;
use super::money::Money;
use super::payroll::AdjustmentPolicy;
use super::period::{most_recent_weekday, CycleConfig, CycleLength};

pub const KEY_DEFAULT_BILLING_RATE: &str = "default_billing_rate";
pub const KEY_BILLING_CYCLE_START: &str = "billing_cycle_start";
pub const KEY_BILLING_CYCLE_LENGTH_DAYS: &str = "billing_cycle_length_days";
pub const KEY_BILLING_CYCLE_MONTHLY: &str = "billing_cycle_monthly";
pub const KEY_BILLING_CYCLE_START_DAY: &str = "billing_cycle_start_day";
pub const KEY_AUTO_GENERATE_INVOICES: &str = "auto_generate_invoices";
pub const KEY_AUTO_GENERATE_PERIODS: &str = "auto_generate_periods";
pub const KEY_ALLOW_ADJUSTMENT_AFTER_PAID: &str = "allow_adjustment_after_paid";
pub const KEY_BILLER_NAME: &str = "biller_name";

/// Business settings read from the settings store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSettings {
    pub default_billing_rate: Money,
    pub billing_cycle_start: Option<NaiveDate>,
    pub cycle_length: CycleLength,
    pub cycle_start_day: Weekday,
    pub auto_generate_invoices: bool,
    pub auto_generate_periods: bool,
    pub allow_adjustment_after_paid: bool,
    pub biller_name: String,
}

impl Default for BillingSettings {
    fn default() -> Self {
        BillingSettings {
            default_billing_rate: Money::from_dollars(75),
            billing_cycle_start: None,
            cycle_length: CycleLength::Days(14),
            cycle_start_day: Weekday::Mon,
            auto_generate_invoices: false,
            auto_generate_periods: true,
            allow_adjustment_after_paid: true,
            biller_name: String::new(),
        }
    }
}

fn as_money(value: &Value) -> Option<Money> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(Money::from_dollars)
            .or_else(|| n.as_f64().and_then(|f| rust_decimal::Decimal::try_from(f).ok()).map(Money::from_decimal)),
        Value::String(s) => s.trim().parse().ok().map(Money::from_decimal),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_date(value: &Value) -> Option<NaiveDate> {
    let s = value.as_str()?;
    // Accept a full ISO timestamp as well as a bare date.
    let day = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

impl BillingSettings {
    /// Builds settings from stored key/value pairs; unknown keys are ignored and
    /// malformed values fall back to their defaults.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut settings = BillingSettings::default();
        let mut length_days = None;
        let mut monthly = false;
        for (key, value) in pairs {
            match key {
                KEY_DEFAULT_BILLING_RATE => {
                    if let Some(rate) = as_money(value).filter(|r| !r.is_zero()) {
                        settings.default_billing_rate = rate;
                    }
                }
                KEY_BILLING_CYCLE_START => settings.billing_cycle_start = as_date(value),
                KEY_BILLING_CYCLE_LENGTH_DAYS => {
                    length_days = value.as_u64().and_then(|d| u32::try_from(d).ok()).filter(|d| *d > 0);
                }
                KEY_BILLING_CYCLE_MONTHLY => monthly = as_bool(value).unwrap_or(false),
                KEY_BILLING_CYCLE_START_DAY => {
                    if let Some(day) = value.as_str().and_then(|s| s.parse::<Weekday>().ok()) {
                        settings.cycle_start_day = day;
                    }
                }
                KEY_AUTO_GENERATE_INVOICES => {
                    settings.auto_generate_invoices = as_bool(value).unwrap_or(false);
                }
                KEY_AUTO_GENERATE_PERIODS => {
                    settings.auto_generate_periods = as_bool(value).unwrap_or(true);
                }
                KEY_ALLOW_ADJUSTMENT_AFTER_PAID => {
                    settings.allow_adjustment_after_paid = as_bool(value).unwrap_or(true);
                }
                KEY_BILLER_NAME => {
                    if let Some(name) = value.as_str() {
                        settings.biller_name = name.to_string();
                    }
                }
                _ => {}
            }
        }
        settings.cycle_length = if monthly {
            CycleLength::CalendarMonth
        } else {
            CycleLength::Days(length_days.unwrap_or(14))
        };
        settings
    }

    /// Cycle rules in force on `today`. Without a configured cycle start the
    /// anchor is the most recent `cycle_start_day` on or before `today`.
    pub fn cycle_config(&self, today: NaiveDate) -> Result<CycleConfig, BillingError> {
        let anchor = self
            .billing_cycle_start
            .unwrap_or_else(|| most_recent_weekday(today, self.cycle_start_day));
        CycleConfig::new(anchor, self.cycle_length, self.cycle_start_day)
    }

    pub fn adjustment_policy(&self) -> AdjustmentPolicy {
        AdjustmentPolicy {
            allow_adjustment_after_paid: self.allow_adjustment_after_paid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load(pairs: &[(&'static str, Value)]) -> BillingSettings {
        BillingSettings::from_pairs(pairs.iter().map(|(k, v)| (*k, v)))
    }

    #[test]
    fn defaults_when_empty() {
        let s = load(&[]);
        assert_eq!(s.default_billing_rate, Money::from_dollars(75));
        assert_eq!(s.cycle_length, CycleLength::Days(14));
        assert!(!s.auto_generate_invoices);
        assert!(s.allow_adjustment_after_paid);
    }

    #[test]
    fn reads_stored_values() {
        let s = load(&[
            (KEY_DEFAULT_BILLING_RATE, json!(82.5)),
            (KEY_BILLING_CYCLE_START, json!("2024-12-22T00:00:00.000Z")),
            (KEY_AUTO_GENERATE_INVOICES, json!(true)),
            (KEY_BILLER_NAME, json!("Tampa Bay OT LLC")),
            (KEY_BILLING_CYCLE_START_DAY, json!("sunday")),
        ]);
        assert_eq!(s.default_billing_rate, Money::from_cents(8_250));
        assert_eq!(s.billing_cycle_start, NaiveDate::from_ymd_opt(2024, 12, 22));
        assert!(s.auto_generate_invoices);
        assert_eq!(s.biller_name, "Tampa Bay OT LLC");
        assert_eq!(s.cycle_start_day, Weekday::Sun);
    }

    #[test]
    fn zero_default_rate_is_ignored() {
        let s = load(&[(KEY_DEFAULT_BILLING_RATE, json!(0))]);
        assert_eq!(s.default_billing_rate, Money::from_dollars(75));
    }

    #[test]
    fn monthly_overrides_length() {
        let s = load(&[
            (KEY_BILLING_CYCLE_LENGTH_DAYS, json!(7)),
            (KEY_BILLING_CYCLE_MONTHLY, json!(true)),
        ]);
        assert_eq!(s.cycle_length, CycleLength::CalendarMonth);
    }

    #[test]
    fn cycle_config_uses_anchor_or_weekday() {
        let today = NaiveDate::from_ymd_opt(2025, 2, 5).unwrap();
        let s = BillingSettings::default();
        assert_eq!(s.cycle_config(today).unwrap().anchor, NaiveDate::from_ymd_opt(2025, 2, 3).unwrap());

        let s = BillingSettings {
            billing_cycle_start: NaiveDate::from_ymd_opt(2024, 12, 22),
            ..BillingSettings::default()
        };
        let period = s.cycle_config(today).unwrap().period_for(today);
        assert_eq!(period.start, NaiveDate::from_ymd_opt(2025, 2, 2).unwrap());
    }
}
