//! Calendar source for quota accounting

use chrono::{DateTime, Days, NaiveDate, Utc};
use parking_lot::RwLock;

use common::utils::local_today;

/// Supplies the current date and time to the registry
pub trait Clock: Send + Sync {
    /// Calendar date quotas are charged against
    fn today(&self) -> NaiveDate;

    /// Current instant, used for `last_used_at`
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock on the local calendar
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        local_today()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock whose date only changes when told to
#[derive(Debug)]
pub struct ManualClock {
    today: RwLock<NaiveDate>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: RwLock::new(today),
        }
    }

    pub fn set_today(&self, today: NaiveDate) {
        *self.today.write() = today;
    }

    /// Moves the date forward by `days`
    pub fn advance_days(&self, days: u64) {
        let mut today = self.today.write();
        if let Some(next) = today.checked_add_days(Days::new(days)) {
            *today = next;
        }
    }
}

impl Clock for ManualClock {
    fn today(&self) -> NaiveDate {
        *self.today.read()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
