//! Outbound seams: invoice documents and invoice delivery.
//!
//! Layout and transport live outside this crate. Generation only needs an
//! opaque artifact reference back, and sending only needs a yes or no.

use std::path::{Path, PathBuf};

use carebill_core::{Agency, BillingPeriod, Invoice};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Artifact encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

/// Everything a document needs to describe one invoice.
#[derive(Debug, Clone, Copy)]
pub struct InvoiceDocument<'a> {
    pub invoice: &'a Invoice,
    pub agency: &'a Agency,
    pub period: &'a BillingPeriod,
    pub biller_name: &'a str,
}

/// Produces a stored document for an invoice.
pub trait InvoiceRenderer: Send + Sync {
    /// Returns an artifact reference to keep on the invoice, or `None` when
    /// nothing was produced.
    fn render(&self, document: InvoiceDocument<'_>) -> Result<Option<String>, DeliveryError>;

    /// Removes a previously produced artifact. Missing artifacts are not an error.
    fn discard(&self, artifact: &str) -> Result<(), DeliveryError> {
        match std::fs::remove_file(artifact) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Delivers an invoice to its agency.
pub trait InvoiceMailer: Send + Sync {
    fn deliver(&self, document: InvoiceDocument<'_>, artifact: Option<&str>) -> Result<(), DeliveryError>;
}

// ── No-op renderer ────────────────────────────────────────────────────────────

/// Produces nothing; invoices keep no artifact.
pub struct NoArtifacts;

impl InvoiceRenderer for NoArtifacts {
    fn render(&self, _document: InvoiceDocument<'_>) -> Result<Option<String>, DeliveryError> {
        Ok(None)
    }
}

// ── JSON renderer ─────────────────────────────────────────────────────────────

/// Writes a machine-readable copy of each invoice under a directory.
/// Layout: `<dir>/<year>/<invoice number>.json`
pub struct JsonArtifactRenderer {
    dir: PathBuf,
}

#[derive(Serialize)]
struct JsonInvoice<'a> {
    biller: &'a str,
    agency: &'a str,
    agency_email: Option<&'a str>,
    period: &'a str,
    #[serde(flatten)]
    invoice: &'a Invoice,
}

impl JsonArtifactRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, invoice: &Invoice) -> PathBuf {
        self.dir
            .join(invoice.created_at.format("%Y").to_string())
            .join(format!("{}.json", invoice.number))
    }
}

impl InvoiceRenderer for JsonArtifactRenderer {
    fn render(&self, document: InvoiceDocument<'_>) -> Result<Option<String>, DeliveryError> {
        let path = self.path_for(document.invoice);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = JsonInvoice {
            biller: document.biller_name,
            agency: &document.agency.name,
            agency_email: document.agency.contact_email.as_deref(),
            period: &document.period.label,
            invoice: document.invoice,
        };
        std::fs::write(&path, serde_json::to_vec_pretty(&body)?)?;
        Ok(Some(path.to_string_lossy().into_owned()))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records delivered invoice numbers; can be told to refuse.
    #[derive(Default)]
    pub struct RecordingMailer {
        pub delivered: Mutex<Vec<String>>,
        pub refuse: bool,
    }

    impl InvoiceMailer for RecordingMailer {
        fn deliver(&self, document: InvoiceDocument<'_>, _artifact: Option<&str>) -> Result<(), DeliveryError> {
            if self.refuse {
                return Err(DeliveryError::Rejected("mailbox unavailable".into()));
            }
            self.delivered.lock().unwrap().push(document.invoice.number.clone());
            Ok(())
        }
    }
}
