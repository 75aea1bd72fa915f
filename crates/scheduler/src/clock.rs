//! Wall clock abstraction.

use chrono::{Local, NaiveDateTime};

/// Source of local wall-clock time. Schedules are expressed in local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}
