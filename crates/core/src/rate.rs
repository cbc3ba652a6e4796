use serde::{Deserialize, Serialize};

use super::entity::Agency;
use super::money::Money;

/// Billing code assumed for rate-card lookup when a visit carries none.
/// Existing rate cards are keyed on this convention.
pub const DEFAULT_VISIT_CODE: &str = "P";

/// Code used to look a visit up in a rate card.
pub fn rate_lookup_code(visit_code: Option<&str>) -> &str {
    match visit_code.map(str::trim) {
        Some(code) if !code.is_empty() => code,
        _ => DEFAULT_VISIT_CODE,
    }
}

/// Dollar rate for one visit.
///
/// Priority: the agency's rate card entry for the code, then the agency's
/// non-zero default rate, then the system default. Always terminates.
pub fn resolve_rate(agency: Option<&Agency>, visit_code: Option<&str>, system_default: Money) -> Money {
    let code = rate_lookup_code(visit_code);
    let Some(agency) = agency else {
        return Money::from_decimal(system_default.as_decimal());
    };

    if let Some(rate) = agency.rates.rate_for(code) {
        return rate;
    }
    match agency.default_rate {
        Some(rate) if !rate.is_zero() => Money::from_decimal(rate.as_decimal()),
        _ => Money::from_decimal(system_default.as_decimal()),
    }
}

/// Catalog entry describing a visit code. Pricing still comes from agency
/// rate cards; `default_rate` is the suggested card value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingCode {
    pub code: String,
    pub description: String,
    pub default_rate: Money,
    pub active: bool,
}

/// Codes a new catalog starts with: (code, description, suggested dollars).
pub const STANDARD_CODES: [(&str, &str, i64); 9] = [
    ("P", "Patient Visit (PT, OT, SN, etc.)", 85),
    ("X", "Psych RN Visit", 95),
    ("HT", "High Tech Infusion", 120),
    ("S/U", "Sign Up Visit", 75),
    ("WC", "Wound Care", 110),
    ("SV", "Supervisory Visit", 60),
    ("Hmk", "Homemaker", 45),
    ("EVAL", "Evaluation", 150),
    ("RE-EVAL", "Re-evaluation", 120),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{AgencyId, RateCard};

    fn agency(rates: RateCard, default_rate: Option<Money>) -> Agency {
        Agency {
            id: AgencyId(1),
            name: "Acme Home Health".to_string(),
            address: None,
            contact_name: None,
            contact_email: None,
            contact_phone: None,
            default_rate,
            rates,
            payment_terms_days: 30,
            active: true,
            notes: None,
        }
    }

    fn card(entries: &[(&str, i64)]) -> RateCard {
        entries
            .iter()
            .map(|(code, dollars)| (*code, Money::from_dollars(*dollars)))
            .collect()
    }

    #[test]
    fn rate_card_entry_wins() {
        let a = agency(card(&[("P", 90)]), None);
        assert_eq!(resolve_rate(Some(&a), Some("P"), Money::from_dollars(75)), Money::from_dollars(90));
    }

    #[test]
    fn empty_code_looks_up_p() {
        let a = agency(card(&[("P", 90)]), None);
        assert_eq!(resolve_rate(Some(&a), Some(""), Money::from_dollars(75)), Money::from_dollars(90));
        assert_eq!(resolve_rate(Some(&a), None, Money::from_dollars(75)), Money::from_dollars(90));
        assert_eq!(resolve_rate(Some(&a), Some("  "), Money::from_dollars(75)), Money::from_dollars(90));
    }

    #[test]
    fn unknown_code_falls_to_system_default() {
        let a = agency(card(&[("P", 90)]), None);
        assert_eq!(resolve_rate(Some(&a), Some("ZZZ"), Money::from_dollars(75)), Money::from_dollars(75));
    }

    #[test]
    fn agency_default_beats_system_default() {
        let a = agency(card(&[("P", 90)]), Some(Money::from_dollars(80)));
        assert_eq!(resolve_rate(Some(&a), Some("ZZZ"), Money::from_dollars(75)), Money::from_dollars(80));
    }

    #[test]
    fn zero_agency_default_is_unset() {
        let a = agency(RateCard::new(), Some(Money::zero()));
        assert_eq!(resolve_rate(Some(&a), Some("WC"), Money::from_dollars(75)), Money::from_dollars(75));
    }

    #[test]
    fn missing_agency_uses_system_default() {
        assert_eq!(resolve_rate(None, Some("P"), Money::from_cents(7_550)), Money::from_cents(7_550));
    }

    #[test]
    fn lookup_code_keeps_real_codes() {
        assert_eq!(rate_lookup_code(Some("WC")), "WC");
        assert_eq!(rate_lookup_code(Some("")), DEFAULT_VISIT_CODE);
    }
}
