use carebill_core::{
    AgencyId, ClinicianId, InvoiceId, PatientId, PeriodId, Timesheet, TimesheetId, TimesheetStatus, VisitRecord,
};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::db::{parse_status, to_u32, DbPool};
use crate::error::{is_unique_violation, Result, StorageError};

/// A timesheet as handed over by extraction, before it gets an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTimesheet {
    pub period_id: Option<PeriodId>,
    pub status: TimesheetStatus,
    pub company_name: Option<String>,
    pub employee_name: Option<String>,
    pub employee_title: Option<String>,
    pub patient_name: Option<String>,
    pub clinical_record_number: Option<String>,
    pub agency_id: Option<AgencyId>,
    pub clinician_id: Option<ClinicianId>,
    pub patient_id: Option<PatientId>,
    /// Hex SHA-256 of the uploaded image.
    pub image_hash: Option<String>,
    pub ocr_confidence: Option<f64>,
    pub flag_reason: Option<String>,
    pub visits: Vec<VisitRecord>,
}

type TimesheetRow = (i64, Option<i64>, String, Option<String>, Option<i64>, Option<i64>, Option<i64>, Option<i64>);

const TIMESHEET_COLUMNS: &str = "id, period_id, status, company_name, agency_id, clinician_id, patient_id, invoice_id";

type VisitRow = (
    NaiveDate,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
    String,
    String,
    Option<String>,
);

async fn load_visits(conn: &mut SqliteConnection, id: i64) -> Result<Vec<VisitRecord>> {
    let rows = sqlx::query_as::<_, VisitRow>(
        "SELECT date, time_in, time_out, duration_minutes, visit_code, patient_name, clinician_name, clinician_title \
         FROM visits WHERE timesheet_id = ? ORDER BY position",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(VisitRecord {
                date: r.0,
                time_in: r.1,
                time_out: r.2,
                duration_minutes: r.3.map(|m| to_u32(m, "duration_minutes")).transpose()?,
                visit_code: r.4,
                patient_name: r.5,
                clinician_name: r.6,
                clinician_title: r.7,
            })
        })
        .collect()
}

async fn timesheet_from_row(conn: &mut SqliteConnection, r: TimesheetRow) -> Result<Timesheet> {
    let visits = load_visits(conn, r.0).await?;
    Ok(Timesheet {
        id: TimesheetId(r.0),
        period_id: r.1.map(PeriodId),
        status: parse_status(&r.2)?,
        company_name: r.3,
        agency_id: r.4.map(AgencyId),
        clinician_id: r.5.map(ClinicianId),
        patient_id: r.6.map(PatientId),
        invoice_id: r.7.map(InvoiceId),
        visits,
    })
}

pub async fn insert_timesheet(pool: &DbPool, new: &NewTimesheet) -> Result<Timesheet> {
    let mut tx = pool.begin().await?;
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO timesheets (period_id, status, company_name, employee_name, employee_title, patient_name, \
         clinical_record_number, agency_id, clinician_id, patient_id, image_hash, ocr_confidence, flag_reason) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(new.period_id.map(|p| p.0))
    .bind(new.status.to_string())
    .bind(&new.company_name)
    .bind(&new.employee_name)
    .bind(&new.employee_title)
    .bind(&new.patient_name)
    .bind(&new.clinical_record_number)
    .bind(new.agency_id.map(|a| a.0))
    .bind(new.clinician_id.map(|c| c.0))
    .bind(new.patient_id.map(|p| p.0))
    .bind(&new.image_hash)
    .bind(new.ocr_confidence)
    .bind(&new.flag_reason)
    .fetch_one(&mut *tx)
    .await;

    let id = match inserted {
        Ok(id) => id,
        Err(e) if is_unique_violation(&e) => {
            return Err(StorageError::DuplicateTimesheet(new.image_hash.clone().unwrap_or_default()))
        }
        Err(e) => return Err(e.into()),
    };

    for (position, visit) in new.visits.iter().enumerate() {
        sqlx::query(
            "INSERT INTO visits (timesheet_id, position, date, time_in, time_out, duration_minutes, visit_code, \
             patient_name, clinician_name, clinician_title) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(position as i64)
        .bind(visit.date)
        .bind(&visit.time_in)
        .bind(&visit.time_out)
        .bind(visit.duration_minutes.map(i64::from))
        .bind(&visit.visit_code)
        .bind(&visit.patient_name)
        .bind(&visit.clinician_name)
        .bind(&visit.clinician_title)
        .execute(&mut *tx)
        .await?;
    }

    let row = sqlx::query_as::<_, TimesheetRow>(&format!(
        "SELECT {TIMESHEET_COLUMNS} FROM timesheets WHERE id = ?"
    ))
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;
    let timesheet = timesheet_from_row(&mut tx, row).await?;
    tx.commit().await?;
    Ok(timesheet)
}

pub async fn find_timesheet_by_hash(pool: &DbPool, image_hash: &str) -> Result<Option<TimesheetId>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM timesheets WHERE image_hash = ?")
        .bind(image_hash)
        .fetch_optional(pool)
        .await?;
    Ok(id.map(TimesheetId))
}

pub async fn get_timesheet(pool: &DbPool, id: TimesheetId) -> Result<Option<Timesheet>> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query_as::<_, TimesheetRow>(&format!(
        "SELECT {TIMESHEET_COLUMNS} FROM timesheets WHERE id = ?"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(r) => Ok(Some(timesheet_from_row(&mut conn, r).await?)),
        None => Ok(None),
    }
}

/// Timesheets in `period` whose status is one of `statuses`, oldest first.
pub async fn list_timesheets(
    pool: &DbPool,
    period: PeriodId,
    statuses: &[TimesheetStatus],
) -> Result<Vec<Timesheet>> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }
    let mut conn = pool.acquire().await?;
    let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT ");
    query
        .push(TIMESHEET_COLUMNS)
        .push(" FROM timesheets WHERE period_id = ")
        .push_bind(period.0)
        .push(" AND status IN (");
    let mut separated = query.separated(", ");
    for status in statuses {
        separated.push_bind(status.to_string());
    }
    separated.push_unseparated(") ORDER BY created_at, id");

    let rows = query.build_query_as::<TimesheetRow>().fetch_all(&mut *conn).await?;
    let mut timesheets = Vec::with_capacity(rows.len());
    for r in rows {
        timesheets.push(timesheet_from_row(&mut conn, r).await?);
    }
    Ok(timesheets)
}

pub async fn set_timesheet_status(
    pool: &DbPool,
    id: TimesheetId,
    status: TimesheetStatus,
    flag_reason: Option<&str>,
) -> Result<()> {
    let done = sqlx::query("UPDATE timesheets SET status = ?, flag_reason = ? WHERE id = ?")
        .bind(status.to_string())
        .bind(flag_reason)
        .bind(id.0)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(StorageError::NotFound { entity: "timesheet", id: id.0 });
    }
    Ok(())
}

/// Records resolved entity references; `None` leaves a reference as it is.
pub async fn set_timesheet_refs(
    pool: &DbPool,
    id: TimesheetId,
    agency: Option<AgencyId>,
    clinician: Option<ClinicianId>,
    patient: Option<PatientId>,
) -> Result<()> {
    let done = sqlx::query(
        "UPDATE timesheets SET agency_id = COALESCE(?, agency_id), clinician_id = COALESCE(?, clinician_id), \
         patient_id = COALESCE(?, patient_id) WHERE id = ?",
    )
    .bind(agency.map(|a| a.0))
    .bind(clinician.map(|c| c.0))
    .bind(patient.map(|p| p.0))
    .bind(id.0)
    .execute(pool)
    .await?;
    if done.rows_affected() == 0 {
        return Err(StorageError::NotFound { entity: "timesheet", id: id.0 });
    }
    Ok(())
}

/// Marks every timesheet in `ids` as claimed by `invoice`, but only those not
/// already claimed. Returns how many rows were taken.
pub(crate) async fn claim_timesheets(
    conn: &mut SqliteConnection,
    invoice: InvoiceId,
    ids: &[TimesheetId],
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE timesheets SET status = 'invoiced', invoice_id = ");
    query.push_bind(invoice.0).push(" WHERE invoice_id IS NULL AND id IN (");
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(id.0);
    }
    separated.push_unseparated(")");
    let done = query.build().execute(&mut *conn).await?;
    Ok(done.rows_affected())
}

/// Returns the timesheets held by `invoice` to `processed` and clears the claim.
pub(crate) async fn release_timesheets(conn: &mut SqliteConnection, invoice: InvoiceId) -> Result<Vec<TimesheetId>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "UPDATE timesheets SET status = 'processed', invoice_id = NULL WHERE invoice_id = ? RETURNING id",
    )
    .bind(invoice.0)
    .fetch_all(&mut *conn)
    .await?;
    let mut ids: Vec<TimesheetId> = ids.into_iter().map(TimesheetId).collect();
    ids.sort();
    Ok(ids)
}

pub(crate) async fn claimed_by(conn: &mut SqliteConnection, invoice: InvoiceId) -> Result<Vec<TimesheetId>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM timesheets WHERE invoice_id = ? ORDER BY id")
        .bind(invoice.0)
        .fetch_all(&mut *conn)
        .await?;
    Ok(ids.into_iter().map(TimesheetId).collect())
}

/// Distinct values offered as timesheet list filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterOptions {
    pub clinician_names: Vec<String>,
    pub visit_codes: Vec<String>,
}

pub async fn timesheet_filter_options(pool: &DbPool) -> Result<FilterOptions> {
    let clinician_names = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT employee_name FROM timesheets \
         WHERE employee_name IS NOT NULL AND TRIM(employee_name) <> '' ORDER BY employee_name",
    )
    .fetch_all(pool)
    .await?;
    let visit_codes = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT TRIM(visit_code) FROM visits \
         WHERE visit_code IS NOT NULL AND TRIM(visit_code) <> '' ORDER BY 1",
    )
    .fetch_all(pool)
    .await?;
    Ok(FilterOptions {
        clinician_names,
        visit_codes,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn visit(date: NaiveDate, code: Option<&str>, minutes: u32, patient: &str, clinician: &str) -> VisitRecord {
        VisitRecord {
            date,
            time_in: None,
            time_out: None,
            duration_minutes: Some(minutes),
            visit_code: code.map(str::to_string),
            patient_name: patient.to_string(),
            clinician_name: clinician.to_string(),
            clinician_title: Some("PTA".to_string()),
        }
    }

    pub fn processed(period: PeriodId, agency: Option<AgencyId>, visits: Vec<VisitRecord>) -> NewTimesheet {
        NewTimesheet {
            period_id: Some(period),
            status: TimesheetStatus::Processed,
            company_name: None,
            employee_name: visits.first().map(|v| v.clinician_name.clone()),
            employee_title: Some("PTA".to_string()),
            patient_name: visits.first().map(|v| v.patient_name.clone()),
            clinical_record_number: None,
            agency_id: agency,
            clinician_id: None,
            patient_id: None,
            image_hash: None,
            ocr_confidence: Some(0.95),
            flag_reason: None,
            visits,
        }
    }
}
