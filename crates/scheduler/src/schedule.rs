//! Schedule kinds and occurrence computation.

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// How far in the past a "once" start may lie and still run immediately.
pub const ONCE_GRACE_SECS: i64 = 60;

/// Set of weekdays, stored as a bitmask with Monday in bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Weekday>", into = "Vec<Weekday>")]
pub struct DayMask(u8);

impl DayMask {
    pub const WEEKDAYS: DayMask = DayMask(0b001_1111);
    pub const ALL: DayMask = DayMask(0b111_1111);

    pub fn from_days(days: &[Weekday]) -> Self {
        Self(
            days.iter()
                .fold(0, |mask, day| mask | 1 << day.num_days_from_monday()),
        )
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn days(self) -> Vec<Weekday> {
        (0u8..7)
            .filter(|bit| self.0 & (1 << *bit) != 0)
            .filter_map(|bit| Weekday::try_from(bit).ok())
            .collect()
    }
}

impl From<Vec<Weekday>> for DayMask {
    fn from(days: Vec<Weekday>) -> Self {
        Self::from_days(&days)
    }
}

impl From<DayMask> for Vec<Weekday> {
    fn from(mask: DayMask) -> Self {
        mask.days()
    }
}

/// Daily time range a timer is allowed to fire in. A range whose end is
/// before its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: NaiveTime,
    pub to: NaiveTime,
}

impl TimeWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.from <= self.to {
            time >= self.from && time <= self.to
        } else {
            time >= self.from || time <= self.to
        }
    }

    /// `at` itself when inside the window, otherwise the next window start.
    pub fn next_start(&self, at: NaiveDateTime) -> NaiveDateTime {
        if self.contains(at.time()) {
            return at;
        }
        let date = if at.time() < self.from {
            at.date()
        } else {
            next_day(at.date())
        };
        date.and_time(self.from)
    }
}

/// When cycles run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Only when asked.
    #[default]
    Manually,
    /// Once, as soon as the schedule is applied.
    Immediately,
    Once {
        at: NaiveDateTime,
    },
    Daily {
        time: NaiveTime,
    },
    Weekly {
        time: NaiveTime,
        days: DayMask,
    },
    /// Every `interval_minutes` after the previous cycle finished.
    Timer {
        interval_minutes: u32,
        #[serde(default)]
        window: Option<TimeWindow>,
    },
}

impl Schedule {
    /// Checks the schedule without computing anything time dependent.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Schedule::Weekly { days, .. } if days.is_empty() => Err(ScheduleError::NoDays),
            Schedule::Timer {
                interval_minutes: 0,
                ..
            } => Err(ScheduleError::ZeroInterval),
            _ => Ok(()),
        }
    }

    /// First start at or after `now`. `None` means the schedule never fires
    /// on its own.
    pub fn first_occurrence(
        &self,
        now: NaiveDateTime,
    ) -> Result<Option<NaiveDateTime>, ScheduleError> {
        self.validate()?;
        let at = match self {
            Schedule::Manually => return Ok(None),
            Schedule::Immediately => now,
            Schedule::Once { at } if *at >= now => *at,
            Schedule::Once { at } if now - *at <= TimeDelta::seconds(ONCE_GRACE_SECS) => now,
            Schedule::Once { at } => return Err(ScheduleError::InPast(*at)),
            Schedule::Daily { time } => next_time_of_day(now, *time, true),
            Schedule::Weekly { time, days } => next_weekday(now, *time, *days, true),
            Schedule::Timer { window, .. } => window.map_or(now, |w| w.next_start(now)),
        };
        Ok(Some(at))
    }

    /// Next start once a cycle finished at `finished`. `None` for kinds that
    /// do not recur.
    pub fn next_after_completion(&self, finished: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Schedule::Manually | Schedule::Immediately | Schedule::Once { .. } => None,
            Schedule::Daily { time } => Some(next_time_of_day(finished, *time, false)),
            Schedule::Weekly { days, .. } if days.is_empty() => None,
            Schedule::Weekly { time, days } => Some(next_weekday(finished, *time, *days, false)),
            Schedule::Timer {
                interval_minutes,
                window,
            } => {
                let next = finished + TimeDelta::minutes(i64::from(*interval_minutes));
                Some(window.map_or(next, |w| w.next_start(next)))
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Manually => write!(f, "manually"),
            Schedule::Immediately => write!(f, "immediately"),
            Schedule::Once { at } => write!(f, "once at {at}"),
            Schedule::Daily { time } => write!(f, "daily at {time}"),
            Schedule::Weekly { time, days } => {
                let names: Vec<String> = days.days().iter().map(|d| d.to_string()).collect();
                write!(f, "weekly on {} at {time}", names.join(","))
            }
            Schedule::Timer {
                interval_minutes,
                window: None,
            } => write!(f, "every {interval_minutes} min"),
            Schedule::Timer {
                interval_minutes,
                window: Some(w),
            } => write!(
                f,
                "every {interval_minutes} min between {} and {}",
                w.from, w.to
            ),
        }
    }
}

fn next_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}

fn is_due(candidate: NaiveDateTime, from: NaiveDateTime, inclusive: bool) -> bool {
    if inclusive {
        candidate >= from
    } else {
        candidate > from
    }
}

fn next_time_of_day(from: NaiveDateTime, time: NaiveTime, inclusive: bool) -> NaiveDateTime {
    let today = from.date().and_time(time);
    if is_due(today, from, inclusive) {
        today
    } else {
        next_day(from.date()).and_time(time)
    }
}

/// Caller guarantees `days` is not empty.
fn next_weekday(
    from: NaiveDateTime,
    time: NaiveTime,
    days: DayMask,
    inclusive: bool,
) -> NaiveDateTime {
    let mut date = from.date();
    // Eight days covers today with the time already passed.
    for _ in 0..8 {
        let candidate = date.and_time(time);
        if days.contains(date.weekday()) && is_due(candidate, from, inclusive) {
            return candidate;
        }
        date = next_day(date);
    }
    date.and_time(time)
}
