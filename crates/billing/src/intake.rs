//! Attaching extracted timesheets to the registries and the open period.

use carebill_core::{
    Agency, BillingError, Clinician, Patient, Timesheet, TimesheetId, TimesheetStatus, VisitRecord,
};
use carebill_matching::{resolve_or_create, Registry, Resolvable, Resolved};
use carebill_storage as storage;
use carebill_storage::{AgencyRegistry, ClinicianRegistry, NewTimesheet, PatientRegistry, StorageError};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::Result;
use crate::hash::image_fingerprint;
use crate::service::Billing;

/// Extraction confidence below which a timesheet is held for review.
pub const LOW_CONFIDENCE: f64 = 0.80;

/// Timesheet fields as read off a scanned sheet, names still unresolved.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedTimesheet {
    pub company_name: Option<String>,
    pub employee_name: Option<String>,
    pub employee_title: Option<String>,
    pub patient_name: Option<String>,
    pub clinical_record_number: Option<String>,
    #[serde(default)]
    pub visits: Vec<VisitRecord>,
    /// 0.0 to 1.0.
    pub confidence: f64,
    /// Original scan, used only for duplicate detection.
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct AttachedTimesheet {
    pub timesheet: Timesheet,
    pub agency: Option<Resolved<Agency>>,
    pub clinician: Option<Resolved<Clinician>>,
    pub patient: Option<Resolved<Patient>>,
    pub flag_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Intake {
    Attached(Box<AttachedTimesheet>),
    /// The same scan was already stored under this id.
    Duplicate(TimesheetId),
}

pub fn low_confidence_reason(confidence: f64) -> Option<String> {
    (confidence < LOW_CONFIDENCE).then(|| format!("Low OCR confidence: {}%", (confidence * 100.0).round() as i64))
}

/// A lookup failure only loses that one reference.
async fn resolve_logged<R: Registry>(registry: &R, kind: &str, name: Option<&str>) -> Option<Resolved<R::Entity>> {
    let name = name?;
    match resolve_or_create(registry, name).await {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::warn!(kind, name, error = %e, "Could not resolve name");
            None
        }
    }
}

impl Billing {
    /// Stores an extracted timesheet in the current open period with its
    /// agency, clinician and patient resolved (or created).
    pub async fn attach_timesheet(&self, extracted: ExtractedTimesheet, today: NaiveDate) -> Result<Intake> {
        let image_hash = extracted.image.as_deref().map(image_fingerprint);
        if let Some(hash) = &image_hash {
            if let Some(existing) = storage::find_timesheet_by_hash(&self.pool, hash).await? {
                tracing::info!(timesheet = existing.0, "Duplicate scan ignored");
                return Ok(Intake::Duplicate(existing));
            }
        }

        let settings = storage::load_settings(&self.pool).await?;
        let period = storage::current_open_period(&self.pool, &settings, today).await?;

        let agency = resolve_logged(
            &AgencyRegistry { pool: &self.pool },
            "agency",
            extracted.company_name.as_deref(),
        )
        .await;
        let clinician = resolve_logged(
            &ClinicianRegistry { pool: &self.pool, title: extracted.employee_title.clone() },
            "clinician",
            extracted.employee_name.as_deref(),
        )
        .await;
        let agency_id = agency.as_ref().map(|a| a.entity().id());
        let patient = resolve_logged(
            &PatientRegistry {
                pool: &self.pool,
                agency_id,
                clinical_record_number: extracted.clinical_record_number.clone(),
            },
            "patient",
            extracted.patient_name.as_deref(),
        )
        .await;

        if let Some(found) = patient.as_ref().filter(|p| p.is_match()) {
            if let Err(e) = storage::backfill_patient(
                &self.pool,
                found.entity().id(),
                agency_id,
                extracted.clinical_record_number.as_deref(),
            )
            .await
            {
                tracing::warn!(patient = %found.entity().name, error = %e, "Patient details not backfilled");
            }
        }

        let flag_reason = low_confidence_reason(extracted.confidence);
        let new = NewTimesheet {
            period_id: Some(period.id),
            status: if flag_reason.is_some() { TimesheetStatus::Flagged } else { TimesheetStatus::Processed },
            company_name: extracted.company_name,
            employee_name: extracted.employee_name,
            employee_title: extracted.employee_title,
            patient_name: extracted.patient_name,
            clinical_record_number: extracted.clinical_record_number,
            agency_id,
            clinician_id: clinician.as_ref().map(|c| c.entity().id()),
            patient_id: patient.as_ref().map(|p| p.entity().id()),
            image_hash,
            ocr_confidence: Some(extracted.confidence),
            flag_reason: flag_reason.clone(),
            visits: extracted.visits,
        };
        let timesheet = match storage::insert_timesheet(&self.pool, &new).await {
            Ok(timesheet) => timesheet,
            Err(StorageError::DuplicateTimesheet(hash)) => {
                let existing = storage::find_timesheet_by_hash(&self.pool, &hash)
                    .await?
                    .ok_or(StorageError::DuplicateTimesheet(hash))?;
                return Ok(Intake::Duplicate(existing));
            }
            Err(e) => return Err(e.into()),
        };

        self.filter_options.invalidate().await;
        tracing::info!(
            timesheet = timesheet.id.0,
            period = %period.label,
            visits = timesheet.visits.len(),
            flagged = flag_reason.is_some(),
            "Attached timesheet"
        );
        Ok(Intake::Attached(Box::new(AttachedTimesheet { timesheet, agency, clinician, patient, flag_reason })))
    }

    /// Clears a review hold: flagged or processed → reviewed.
    pub async fn review_timesheet(&self, id: TimesheetId) -> Result<Timesheet> {
        let mut timesheet = storage::get_timesheet(&self.pool, id)
            .await?
            .ok_or(StorageError::NotFound { entity: "timesheet", id: id.0 })?;
        if !matches!(timesheet.status, TimesheetStatus::Flagged | TimesheetStatus::Processed) {
            return Err(BillingError::InvalidTransition {
                entity: "timesheet",
                from: timesheet.status.to_string(),
                to: TimesheetStatus::Reviewed.to_string(),
            }
            .into());
        }
        storage::set_timesheet_status(&self.pool, id, TimesheetStatus::Reviewed, None).await?;
        timesheet.status = TimesheetStatus::Reviewed;
        Ok(timesheet)
    }
}
