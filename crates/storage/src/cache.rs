use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::db::DbPool;
use crate::error::Result;
use crate::timesheets::{timesheet_filter_options, FilterOptions};

pub const FILTER_OPTIONS_TTL: Duration = Duration::from_secs(5 * 60);

/// Caches the distinct filter values for the timesheet list. Owned by
/// whoever serves the list; nothing global.
pub struct FilterOptionsCache {
    ttl: Duration,
    slot: Mutex<Option<(Instant, FilterOptions)>>,
}

impl Default for FilterOptionsCache {
    fn default() -> Self {
        Self::new(FILTER_OPTIONS_TTL)
    }
}

impl FilterOptionsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub async fn get(&self, pool: &DbPool) -> Result<FilterOptions> {
        let mut slot = self.slot.lock().await;
        if let Some((loaded_at, options)) = slot.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(options.clone());
            }
        }
        let fresh = timesheet_filter_options(pool).await?;
        *slot = Some((Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    /// Drops the cached value; call after uploads that add names or codes.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::fresh_db;
    use crate::periods::current_open_period;
    use crate::timesheets::insert_timesheet;
    use crate::timesheets::test_support::{processed, visit};
    use carebill_core::BillingSettings;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn serves_cached_until_invalidated() {
        let (_dir, pool) = fresh_db().await;
        let day = NaiveDate::from_ymd_opt(2025, 2, 3).unwrap();
        let period = current_open_period(&pool, &BillingSettings::default(), day).await.unwrap();
        let cache = FilterOptionsCache::default();
        assert!(cache.get(&pool).await.unwrap().clinician_names.is_empty());

        let new = processed(period.id, None, vec![visit(day, Some("P"), 60, "Pat", "Jane Doe")]);
        insert_timesheet(&pool, &new).await.unwrap();
        assert!(cache.get(&pool).await.unwrap().clinician_names.is_empty());

        cache.invalidate().await;
        assert_eq!(cache.get(&pool).await.unwrap().clinician_names, vec!["Jane Doe".to_string()]);
    }

    #[tokio::test]
    async fn zero_ttl_always_reloads() {
        let (_dir, pool) = fresh_db().await;
        let day = NaiveDate::from_ymd_opt(2025, 2, 3).unwrap();
        let period = current_open_period(&pool, &BillingSettings::default(), day).await.unwrap();
        let cache = FilterOptionsCache::new(Duration::ZERO);
        cache.get(&pool).await.unwrap();
        let new = processed(period.id, None, vec![visit(day, Some("WC"), 60, "Pat", "Jane Doe")]);
        insert_timesheet(&pool, &new).await.unwrap();
        assert_eq!(cache.get(&pool).await.unwrap().visit_codes, vec!["WC".to_string()]);
    }
}
