use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::entity::ClinicianId;
use super::error::BillingError;
use super::money::Money;
use super::period::PeriodId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PaymentId(pub i64);

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdjustmentKind {
    Bonus,
    Deduction,
    RateCorrection,
}

impl fmt::Display for AdjustmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustmentKind::Bonus => write!(f, "bonus"),
            AdjustmentKind::Deduction => write!(f, "deduction"),
            AdjustmentKind::RateCorrection => write!(f, "rate-correction"),
        }
    }
}

impl std::str::FromStr for AdjustmentKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bonus" => Ok(AdjustmentKind::Bonus),
            "deduction" => Ok(AdjustmentKind::Deduction),
            "rate-correction" => Ok(AdjustmentKind::RateCorrection),
            other => Err(format!("Unknown adjustment type: '{other}'")),
        }
    }
}

/// A signed correction to a payment. Deductions carry negative amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub kind: AdjustmentKind,
    pub amount: Money,
    pub reason: String,
}

impl Adjustment {
    pub fn new(kind: AdjustmentKind, amount: Money, reason: impl Into<String>) -> Self {
        Adjustment {
            kind,
            amount: Money::from_decimal(amount.as_decimal()),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Paid => write!(f, "paid"),
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            other => Err(format!("Unknown payment status: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentMethod {
    #[default]
    Check,
    DirectDeposit,
    Cash,
    Zelle,
    Other,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentMethod::Check => write!(f, "check"),
            PaymentMethod::DirectDeposit => write!(f, "direct-deposit"),
            PaymentMethod::Cash => write!(f, "cash"),
            PaymentMethod::Zelle => write!(f, "zelle"),
            PaymentMethod::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check" => Ok(PaymentMethod::Check),
            "direct-deposit" => Ok(PaymentMethod::DirectDeposit),
            "cash" => Ok(PaymentMethod::Cash),
            "zelle" => Ok(PaymentMethod::Zelle),
            "other" => Ok(PaymentMethod::Other),
            other => Err(format!("Unknown payment method: '{other}'")),
        }
    }
}

/// Whether adjustments may still be appended once a payment is paid.
///
/// Permissive by default: a late adjustment silently changes the total even
/// though the paid amount has already gone out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentPolicy {
    pub allow_adjustment_after_paid: bool,
}

impl Default for AdjustmentPolicy {
    fn default() -> Self {
        AdjustmentPolicy {
            allow_adjustment_after_paid: true,
        }
    }
}

/// What a payment is worth before adjustments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentBase {
    pub clinician_id: Option<ClinicianId>,
    pub clinician_name: String,
    pub clinician_title: Option<String>,
    pub period_id: Option<PeriodId>,
    pub period_label: String,
    pub amount: Money,
    pub hours: Decimal,
    pub visits: u32,
    pub pay_rate: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollPayment {
    pub id: PaymentId,
    pub base: PaymentBase,
    adjustments: Vec<Adjustment>,
    total_amount: Money,
    pub status: PaymentStatus,
    pub paid_date: Option<NaiveDate>,
    pub payment_method: PaymentMethod,
    pub notes: String,
}

impl PayrollPayment {
    pub fn new(id: PaymentId, base: PaymentBase) -> Self {
        let total_amount = base.amount;
        PayrollPayment {
            id,
            base,
            adjustments: Vec::new(),
            total_amount,
            status: PaymentStatus::Pending,
            paid_date: None,
            payment_method: PaymentMethod::default(),
            notes: String::new(),
        }
    }

    /// Restores persisted adjustments in their original order.
    pub fn with_adjustments(mut self, adjustments: Vec<Adjustment>) -> Self {
        self.adjustments = adjustments;
        self.recompute();
        self
    }

    pub fn adjustments(&self) -> &[Adjustment] {
        &self.adjustments
    }

    /// Always `base + Σ adjustments`.
    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    fn recompute(&mut self) {
        self.total_amount = self.base.amount + self.adjustments.iter().map(|a| a.amount).sum::<Money>();
    }

    pub fn add_adjustment(
        &mut self,
        adjustment: Adjustment,
        policy: AdjustmentPolicy,
    ) -> Result<(), BillingError> {
        if self.status == PaymentStatus::Paid && !policy.allow_adjustment_after_paid {
            return Err(BillingError::AdjustmentAfterPaid);
        }
        self.adjustments.push(adjustment);
        self.recompute();
        Ok(())
    }

    /// pending → paid; there is no way back.
    pub fn mark_paid(&mut self, date: NaiveDate, method: PaymentMethod) -> Result<(), BillingError> {
        if self.status == PaymentStatus::Paid {
            return Err(BillingError::InvalidTransition {
                entity: "payroll payment",
                from: PaymentStatus::Paid.to_string(),
                to: PaymentStatus::Paid.to_string(),
            });
        }
        self.status = PaymentStatus::Paid;
        self.paid_date = Some(date);
        self.payment_method = method;
        Ok(())
    }

    pub fn check_delete(&self) -> Result<(), BillingError> {
        match self.status {
            PaymentStatus::Pending => Ok(()),
            PaymentStatus::Paid => Err(BillingError::PaymentNotDeletable {
                status: self.status.to_string(),
            }),
        }
    }
}
