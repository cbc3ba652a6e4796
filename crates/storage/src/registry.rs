use carebill_core::entity::name_key;
use carebill_core::{
    Agency, AgencyId, Clinician, ClinicianId, Money, NewAgency, NewClinician, NewPatient, Patient, PatientId,
    RateCard,
};
use carebill_matching::Registry;

use crate::db::{to_u32, DbPool};
use crate::error::{is_unique_violation, Result, StorageError};

// ── Agencies ────────────────────────────────────────────────────────────────

type AgencyRow = (
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    String,
    i64,
    bool,
    Option<String>,
);

const AGENCY_COLUMNS: &str = "id, name, address, contact_name, contact_email, contact_phone, \
     default_rate_cents, rates, payment_terms_days, active, notes";

fn agency_from_row(r: AgencyRow) -> Result<Agency> {
    let rates: RateCard = serde_json::from_str(&r.7)?;
    Ok(Agency {
        id: AgencyId(r.0),
        name: r.1,
        address: r.2,
        contact_name: r.3,
        contact_email: r.4,
        contact_phone: r.5,
        default_rate: r.6.map(Money::from_cents),
        rates,
        payment_terms_days: to_u32(r.8, "payment_terms_days")?,
        active: r.9,
        notes: r.10,
    })
}

pub async fn insert_agency(pool: &DbPool, new: &NewAgency) -> Result<Agency> {
    let rates = serde_json::to_string(&new.rates)?;
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO agencies (name, name_key, address, contact_name, contact_email, contact_phone, \
         default_rate_cents, rates, payment_terms_days, notes) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(new.name.trim())
    .bind(name_key(&new.name))
    .bind(&new.address)
    .bind(&new.contact_name)
    .bind(&new.contact_email)
    .bind(&new.contact_phone)
    .bind(new.default_rate.map(Money::to_cents))
    .bind(rates)
    .bind(i64::from(new.payment_terms_days))
    .bind(&new.notes)
    .fetch_one(pool)
    .await;

    match inserted {
        Ok(id) => require_agency(pool, AgencyId(id)).await,
        Err(e) if is_unique_violation(&e) => Err(StorageError::DuplicateName {
            entity: "agency",
            name: new.name.trim().to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

pub async fn update_agency(pool: &DbPool, agency: &Agency) -> Result<()> {
    let rates = serde_json::to_string(&agency.rates)?;
    let result = sqlx::query(
        "UPDATE agencies SET name = ?, name_key = ?, address = ?, contact_name = ?, contact_email = ?, \
         contact_phone = ?, default_rate_cents = ?, rates = ?, payment_terms_days = ?, active = ?, notes = ? \
         WHERE id = ?",
    )
    .bind(agency.name.trim())
    .bind(name_key(&agency.name))
    .bind(&agency.address)
    .bind(&agency.contact_name)
    .bind(&agency.contact_email)
    .bind(&agency.contact_phone)
    .bind(agency.default_rate.map(Money::to_cents))
    .bind(rates)
    .bind(i64::from(agency.payment_terms_days))
    .bind(agency.active)
    .bind(&agency.notes)
    .bind(agency.id.0)
    .execute(pool)
    .await;

    match result {
        Ok(done) if done.rows_affected() == 0 => Err(StorageError::NotFound {
            entity: "agency",
            id: agency.id.0,
        }),
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(StorageError::DuplicateName {
            entity: "agency",
            name: agency.name.clone(),
        }),
        Err(e) => Err(e.into()),
    }
}

pub async fn get_agency(pool: &DbPool, id: AgencyId) -> Result<Option<Agency>> {
    let row = sqlx::query_as::<_, AgencyRow>(&format!("SELECT {AGENCY_COLUMNS} FROM agencies WHERE id = ?"))
        .bind(id.0)
        .fetch_optional(pool)
        .await?;
    row.map(agency_from_row).transpose()
}

pub async fn require_agency(pool: &DbPool, id: AgencyId) -> Result<Agency> {
    get_agency(pool, id)
        .await?
        .ok_or(StorageError::NotFound { entity: "agency", id: id.0 })
}

/// Ordered by name.
pub async fn list_agencies(pool: &DbPool, include_inactive: bool) -> Result<Vec<Agency>> {
    let rows = sqlx::query_as::<_, AgencyRow>(&format!(
        "SELECT {AGENCY_COLUMNS} FROM agencies WHERE active = 1 OR ? ORDER BY name_key, id"
    ))
    .bind(include_inactive)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(agency_from_row).collect()
}

/// Soft delete: agencies are never removed.
pub async fn deactivate_agency(pool: &DbPool, id: AgencyId) -> Result<()> {
    let done = sqlx::query("UPDATE agencies SET active = 0 WHERE id = ?")
        .bind(id.0)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(StorageError::NotFound { entity: "agency", id: id.0 });
    }
    Ok(())
}

// ── Clinicians ──────────────────────────────────────────────────────────────

type ClinicianRow = (i64, String, Option<String>, Option<String>, Option<String>, i64, bool, Option<String>);

const CLINICIAN_COLUMNS: &str = "id, name, title, email, phone, pay_rate_cents, active, notes";

async fn clinician_from_row(pool: &DbPool, r: ClinicianRow) -> Result<Clinician> {
    let agencies = sqlx::query_scalar::<_, i64>(
        "SELECT agency_id FROM clinician_agencies WHERE clinician_id = ? ORDER BY agency_id",
    )
    .bind(r.0)
    .fetch_all(pool)
    .await?;
    Ok(Clinician {
        id: ClinicianId(r.0),
        name: r.1,
        title: r.2,
        email: r.3,
        phone: r.4,
        pay_rate: Money::from_cents(r.5),
        agencies: agencies.into_iter().map(AgencyId).collect(),
        active: r.6,
        notes: r.7,
    })
}

pub async fn insert_clinician(pool: &DbPool, new: &NewClinician) -> Result<Clinician> {
    let mut tx = pool.begin().await?;
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO clinicians (name, name_key, title, email, phone, pay_rate_cents, notes) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(new.name.trim())
    .bind(name_key(&new.name))
    .bind(&new.title)
    .bind(&new.email)
    .bind(&new.phone)
    .bind(new.pay_rate.to_cents())
    .bind(&new.notes)
    .fetch_one(&mut *tx)
    .await;

    let id = match inserted {
        Ok(id) => id,
        Err(e) if is_unique_violation(&e) => {
            return Err(StorageError::DuplicateName {
                entity: "clinician",
                name: new.name.trim().to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    for agency in &new.agencies {
        sqlx::query("INSERT OR IGNORE INTO clinician_agencies (clinician_id, agency_id) VALUES (?, ?)")
            .bind(id)
            .bind(agency.0)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    require_clinician(pool, ClinicianId(id)).await
}

pub async fn update_clinician(pool: &DbPool, clinician: &Clinician) -> Result<()> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query(
        "UPDATE clinicians SET name = ?, name_key = ?, title = ?, email = ?, phone = ?, pay_rate_cents = ?, \
         active = ?, notes = ? WHERE id = ?",
    )
    .bind(clinician.name.trim())
    .bind(name_key(&clinician.name))
    .bind(&clinician.title)
    .bind(&clinician.email)
    .bind(&clinician.phone)
    .bind(clinician.pay_rate.to_cents())
    .bind(clinician.active)
    .bind(&clinician.notes)
    .bind(clinician.id.0)
    .execute(&mut *tx)
    .await;

    match result {
        Ok(done) if done.rows_affected() == 0 => {
            return Err(StorageError::NotFound {
                entity: "clinician",
                id: clinician.id.0,
            })
        }
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(StorageError::DuplicateName {
                entity: "clinician",
                name: clinician.name.clone(),
            })
        }
        Err(e) => return Err(e.into()),
    }

    sqlx::query("DELETE FROM clinician_agencies WHERE clinician_id = ?")
        .bind(clinician.id.0)
        .execute(&mut *tx)
        .await?;
    for agency in &clinician.agencies {
        sqlx::query("INSERT OR IGNORE INTO clinician_agencies (clinician_id, agency_id) VALUES (?, ?)")
            .bind(clinician.id.0)
            .bind(agency.0)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn get_clinician(pool: &DbPool, id: ClinicianId) -> Result<Option<Clinician>> {
    let row = sqlx::query_as::<_, ClinicianRow>(&format!(
        "SELECT {CLINICIAN_COLUMNS} FROM clinicians WHERE id = ?"
    ))
    .bind(id.0)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(r) => Ok(Some(clinician_from_row(pool, r).await?)),
        None => Ok(None),
    }
}

pub async fn require_clinician(pool: &DbPool, id: ClinicianId) -> Result<Clinician> {
    get_clinician(pool, id).await?.ok_or(StorageError::NotFound {
        entity: "clinician",
        id: id.0,
    })
}

pub async fn list_clinicians(pool: &DbPool, include_inactive: bool) -> Result<Vec<Clinician>> {
    let rows = sqlx::query_as::<_, ClinicianRow>(&format!(
        "SELECT {CLINICIAN_COLUMNS} FROM clinicians WHERE active = 1 OR ? ORDER BY name_key, id"
    ))
    .bind(include_inactive)
    .fetch_all(pool)
    .await?;
    let mut clinicians = Vec::with_capacity(rows.len());
    for r in rows {
        clinicians.push(clinician_from_row(pool, r).await?);
    }
    Ok(clinicians)
}

pub async fn deactivate_clinician(pool: &DbPool, id: ClinicianId) -> Result<()> {
    let done = sqlx::query("UPDATE clinicians SET active = 0 WHERE id = ?")
        .bind(id.0)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(StorageError::NotFound {
            entity: "clinician",
            id: id.0,
        });
    }
    Ok(())
}

// ── Patients ────────────────────────────────────────────────────────────────

type PatientRow = (i64, String, Option<i64>, Option<String>, Option<String>, bool, Option<String>);

const PATIENT_COLUMNS: &str = "id, name, agency_id, clinical_record_number, address, active, notes";

fn patient_from_row(r: PatientRow) -> Patient {
    Patient {
        id: PatientId(r.0),
        name: r.1,
        agency_id: r.2.map(AgencyId),
        clinical_record_number: r.3,
        address: r.4,
        active: r.5,
        notes: r.6,
    }
}

fn blank_to_none(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Maps a UNIQUE failure to the offending field, read from the column SQLite
/// names in the message. Record numbers are unique when present; a name only
/// collides with another patient that has no record number.
fn patient_write_error(e: sqlx::Error, crn: Option<&str>, name: &str) -> StorageError {
    if !is_unique_violation(&e) {
        return e.into();
    }
    let message = e.to_string();
    match crn {
        Some(crn) if message.contains("clinical_record_number") => StorageError::DuplicateRecordNumber(crn.to_string()),
        _ => StorageError::DuplicateName {
            entity: "patient",
            name: name.to_string(),
        },
    }
}

pub async fn insert_patient(pool: &DbPool, new: &NewPatient) -> Result<Patient> {
    let crn = blank_to_none(new.clinical_record_number.as_deref());
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO patients (name, name_key, agency_id, clinical_record_number, address, notes) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(new.name.trim())
    .bind(name_key(&new.name))
    .bind(new.agency_id.map(|a| a.0))
    .bind(crn)
    .bind(&new.address)
    .bind(&new.notes)
    .fetch_one(pool)
    .await
    .map_err(|e| patient_write_error(e, crn, new.name.trim()))?;
    require_patient(pool, PatientId(id)).await
}

pub async fn update_patient(pool: &DbPool, patient: &Patient) -> Result<()> {
    let crn = blank_to_none(patient.clinical_record_number.as_deref());
    let done = sqlx::query(
        "UPDATE patients SET name = ?, name_key = ?, agency_id = ?, clinical_record_number = ?, address = ?, \
         active = ?, notes = ? WHERE id = ?",
    )
    .bind(patient.name.trim())
    .bind(name_key(&patient.name))
    .bind(patient.agency_id.map(|a| a.0))
    .bind(crn)
    .bind(&patient.address)
    .bind(patient.active)
    .bind(&patient.notes)
    .bind(patient.id.0)
    .execute(pool)
    .await
    .map_err(|e| patient_write_error(e, crn, patient.name.trim()))?;
    if done.rows_affected() == 0 {
        return Err(StorageError::NotFound {
            entity: "patient",
            id: patient.id.0,
        });
    }
    Ok(())
}

pub async fn get_patient(pool: &DbPool, id: PatientId) -> Result<Option<Patient>> {
    let row = sqlx::query_as::<_, PatientRow>(&format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE id = ?"))
        .bind(id.0)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(patient_from_row))
}

pub async fn require_patient(pool: &DbPool, id: PatientId) -> Result<Patient> {
    get_patient(pool, id).await?.ok_or(StorageError::NotFound {
        entity: "patient",
        id: id.0,
    })
}

pub async fn list_patients(pool: &DbPool, include_inactive: bool) -> Result<Vec<Patient>> {
    let rows = sqlx::query_as::<_, PatientRow>(&format!(
        "SELECT {PATIENT_COLUMNS} FROM patients WHERE active = 1 OR ? ORDER BY name_key, id"
    ))
    .bind(include_inactive)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(patient_from_row).collect())
}

pub async fn deactivate_patient(pool: &DbPool, id: PatientId) -> Result<()> {
    let done = sqlx::query("UPDATE patients SET active = 0 WHERE id = ?")
        .bind(id.0)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(StorageError::NotFound {
            entity: "patient",
            id: id.0,
        });
    }
    Ok(())
}

/// Fills in the agency link and record number only where they are still
/// empty. Populated fields are never overwritten.
pub async fn backfill_patient(
    pool: &DbPool,
    id: PatientId,
    agency_id: Option<AgencyId>,
    clinical_record_number: Option<&str>,
) -> Result<Patient> {
    let crn = blank_to_none(clinical_record_number);
    let done = sqlx::query(
        "UPDATE patients SET agency_id = COALESCE(agency_id, ?), \
         clinical_record_number = COALESCE(clinical_record_number, ?) WHERE id = ?",
    )
    .bind(agency_id.map(|a| a.0))
    .bind(crn)
    .bind(id.0)
    .execute(pool)
    .await
    .map_err(|e| patient_write_error(e, crn, ""))?;
    if done.rows_affected() == 0 {
        return Err(StorageError::NotFound {
            entity: "patient",
            id: id.0,
        });
    }
    require_patient(pool, id).await
}

// ── Create-or-fetch registries ──────────────────────────────────────────────

/// Agencies as a resolve-or-create registry.
pub struct AgencyRegistry<'a> {
    pub pool: &'a DbPool,
}

impl Registry for AgencyRegistry<'_> {
    type Entity = Agency;
    type Error = StorageError;

    async fn candidates(&self) -> Result<Vec<Agency>> {
        list_agencies(self.pool, true).await
    }

    async fn create_or_fetch(&self, name: &str) -> Result<Agency> {
        sqlx::query("INSERT INTO agencies (name, name_key) VALUES (?, ?) ON CONFLICT(name_key) DO NOTHING")
            .bind(name.trim())
            .bind(name_key(name))
            .execute(self.pool)
            .await?;
        let row = sqlx::query_as::<_, AgencyRow>(&format!(
            "SELECT {AGENCY_COLUMNS} FROM agencies WHERE name_key = ?"
        ))
        .bind(name_key(name))
        .fetch_one(self.pool)
        .await?;
        agency_from_row(row)
    }
}

/// Clinicians as a resolve-or-create registry; new rows get `title`.
pub struct ClinicianRegistry<'a> {
    pub pool: &'a DbPool,
    pub title: Option<String>,
}

impl Registry for ClinicianRegistry<'_> {
    type Entity = Clinician;
    type Error = StorageError;

    async fn candidates(&self) -> Result<Vec<Clinician>> {
        list_clinicians(self.pool, true).await
    }

    async fn create_or_fetch(&self, name: &str) -> Result<Clinician> {
        sqlx::query(
            "INSERT INTO clinicians (name, name_key, title) VALUES (?, ?, ?) ON CONFLICT(name_key) DO NOTHING",
        )
        .bind(name.trim())
        .bind(name_key(name))
        .bind(blank_to_none(self.title.as_deref()))
        .execute(self.pool)
        .await?;
        let row = sqlx::query_as::<_, ClinicianRow>(&format!(
            "SELECT {CLINICIAN_COLUMNS} FROM clinicians WHERE name_key = ?"
        ))
        .bind(name_key(name))
        .fetch_one(self.pool)
        .await?;
        clinician_from_row(self.pool, row).await
    }
}

/// Patients as a resolve-or-create registry; new rows get the agency link and
/// record number.
///
/// With a record number, patients carrying a different one are never
/// candidates and the record number is the create-or-fetch key. Without one,
/// the key is the name among unnumbered patients.
pub struct PatientRegistry<'a> {
    pub pool: &'a DbPool,
    pub agency_id: Option<AgencyId>,
    pub clinical_record_number: Option<String>,
}

impl PatientRegistry<'_> {
    fn record_number(&self) -> Option<&str> {
        blank_to_none(self.clinical_record_number.as_deref())
    }
}

impl Registry for PatientRegistry<'_> {
    type Entity = Patient;
    type Error = StorageError;

    async fn candidates(&self) -> Result<Vec<Patient>> {
        let mut patients = list_patients(self.pool, true).await?;
        if let Some(crn) = self.record_number() {
            patients.retain(|p| p.clinical_record_number.as_deref().map_or(true, |own| own == crn));
        }
        Ok(patients)
    }

    async fn create_or_fetch(&self, name: &str) -> Result<Patient> {
        let crn = self.record_number();
        sqlx::query(
            "INSERT INTO patients (name, name_key, agency_id, clinical_record_number) VALUES (?, ?, ?, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(name.trim())
        .bind(name_key(name))
        .bind(self.agency_id.map(|a| a.0))
        .bind(crn)
        .execute(self.pool)
        .await
        .map_err(|e| patient_write_error(e, crn, name.trim()))?;

        let row = match crn {
            Some(crn) => {
                sqlx::query_as::<_, PatientRow>(&format!(
                    "SELECT {PATIENT_COLUMNS} FROM patients WHERE clinical_record_number = ?"
                ))
                .bind(crn)
                .fetch_one(self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PatientRow>(&format!(
                    "SELECT {PATIENT_COLUMNS} FROM patients \
                     WHERE name_key = ? AND clinical_record_number IS NULL"
                ))
                .bind(name_key(name))
                .fetch_one(self.pool)
                .await?
            }
        };
        Ok(patient_from_row(row))
    }
}
