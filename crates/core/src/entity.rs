use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::money::Money;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(AgencyId);
id_type!(ClinicianId);
id_type!(PatientId);

/// Canonical key used for case-insensitive name comparison and the
/// uniqueness constraint on registry names.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Per-agency mapping from billing code to a flat dollar rate per visit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateCard(BTreeMap<String, Money>);

impl RateCard {
    pub fn new() -> Self {
        RateCard(BTreeMap::new())
    }

    pub fn rate_for(&self, code: &str) -> Option<Money> {
        self.0.get(code).copied()
    }

    pub fn set(&mut self, code: impl Into<String>, rate: Money) {
        self.0.insert(code.into(), Money::from_decimal(rate.as_decimal()));
    }

    pub fn remove(&mut self, code: &str) -> Option<Money> {
        self.0.remove(code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Money)> {
        self.0.iter().map(|(code, rate)| (code.as_str(), *rate))
    }
}

impl<S: Into<String>> FromIterator<(S, Money)> for RateCard {
    fn from_iter<I: IntoIterator<Item = (S, Money)>>(iter: I) -> Self {
        let mut card = RateCard::new();
        for (code, rate) in iter {
            card.set(code, rate);
        }
        card
    }
}

pub const DEFAULT_PAYMENT_TERMS_DAYS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agency {
    pub id: AgencyId,
    pub name: String,
    pub address: Option<String>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    /// Legacy flat rate; zero is treated as unset.
    pub default_rate: Option<Money>,
    pub rates: RateCard,
    /// 0 means due on receipt.
    pub payment_terms_days: u32,
    pub active: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAgency {
    pub name: String,
    pub address: Option<String>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub default_rate: Option<Money>,
    pub rates: RateCard,
    pub payment_terms_days: u32,
    pub notes: Option<String>,
}

impl NewAgency {
    pub fn named(name: &str) -> Self {
        NewAgency {
            name: name.trim().to_string(),
            address: None,
            contact_name: None,
            contact_email: None,
            contact_phone: None,
            default_rate: None,
            rates: RateCard::new(),
            payment_terms_days: DEFAULT_PAYMENT_TERMS_DAYS,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clinician {
    pub id: ClinicianId,
    pub name: String,
    /// Credential code: PTA, RN, OT, PT, ...
    pub title: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Dollars per hour.
    pub pay_rate: Money,
    pub agencies: Vec<AgencyId>,
    pub active: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewClinician {
    pub name: String,
    pub title: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub pay_rate: Money,
    pub agencies: Vec<AgencyId>,
    pub notes: Option<String>,
}

impl NewClinician {
    pub fn named(name: &str) -> Self {
        NewClinician {
            name: name.trim().to_string(),
            title: None,
            email: None,
            phone: None,
            pay_rate: Money::zero(),
            agencies: Vec::new(),
            notes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    pub name: String,
    pub agency_id: Option<AgencyId>,
    /// Unique across active and inactive patients when present.
    pub clinical_record_number: Option<String>,
    pub address: Option<String>,
    pub active: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPatient {
    pub name: String,
    pub agency_id: Option<AgencyId>,
    pub clinical_record_number: Option<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
}

impl NewPatient {
    pub fn named(name: &str) -> Self {
        NewPatient {
            name: name.trim().to_string(),
            agency_id: None,
            clinical_record_number: None,
            address: None,
            notes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_key_trims_and_lowercases() {
        assert_eq!(name_key("  Sunshine Home Health "), "sunshine home health");
    }

    #[test]
    fn rate_card_lookup_is_exact() {
        let card: RateCard = [("P", Money::from_dollars(85)), ("WC", Money::from_dollars(110))]
            .into_iter()
            .collect();
        assert_eq!(card.rate_for("WC"), Some(Money::from_dollars(110)));
        assert_eq!(card.rate_for("wc"), None);
        assert_eq!(card.rate_for("X"), None);
    }

    #[test]
    fn rate_card_iterates_in_code_order() {
        let card: RateCard = [("X", Money::from_dollars(95)), ("HT", Money::from_dollars(120))]
            .into_iter()
            .collect();
        let codes: Vec<&str> = card.iter().map(|(c, _)| c).collect();
        assert_eq!(codes, vec!["HT", "X"]);
    }

    #[test]
    fn rate_card_serializes_as_plain_map() {
        let card: RateCard = [("P", Money::from_cents(8_500))].into_iter().collect();
        let json = serde_json::to_string(&card).unwrap();
        assert_eq!(json, r#"{"P":"85.00"}"#);
    }

    #[test]
    fn new_agency_defaults_to_net_30() {
        let agency = NewAgency::named(" Acme Home Health ");
        assert_eq!(agency.name, "Acme Home Health");
        assert_eq!(agency.payment_terms_days, DEFAULT_PAYMENT_TERMS_DAYS);
        assert!(agency.rates.is_empty());
    }
}
