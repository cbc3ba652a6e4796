use std::collections::HashMap;
use std::sync::Arc;

use carebill_core::PeriodId;
use carebill_storage::{DbPool, FilterOptions, FilterOptionsCache};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::render::{InvoiceMailer, InvoiceRenderer, NoArtifacts};

/// Entry point for the billing workflows: intake, invoice generation and
/// lifecycle, payroll, and the periodic cycle.
///
/// Cheap to share behind an `Arc`; all state lives in the database apart from
/// the per-period generation locks.
pub struct Billing {
    pub(crate) pool: DbPool,
    pub(crate) renderer: Arc<dyn InvoiceRenderer>,
    pub(crate) mailer: Option<Arc<dyn InvoiceMailer>>,
    period_locks: Mutex<HashMap<PeriodId, Arc<Mutex<()>>>>,
    pub(crate) filter_options: FilterOptionsCache,
}

impl Billing {
    /// No artifacts and no mailer: sending only records the status change.
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            renderer: Arc::new(NoArtifacts),
            mailer: None,
            period_locks: Mutex::new(HashMap::new()),
            filter_options: FilterOptionsCache::default(),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn InvoiceRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn InvoiceMailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Distinct clinician names and visit codes for the timesheet list.
    pub async fn filter_options(&self) -> crate::error::Result<FilterOptions> {
        Ok(self.filter_options.get(&self.pool).await?)
    }

    /// Serializes invoice generation per period. Different periods proceed
    /// independently.
    pub(crate) async fn lock_period(&self, period: PeriodId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.period_locks.lock().await;
            locks.entry(period).or_default().clone()
        };
        lock.lock_owned().await
    }
}
