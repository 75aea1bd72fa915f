//! Scheduler error types.

use chrono::NaiveDateTime;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("start time {0} has already passed")]
    InPast(NaiveDateTime),

    #[error("weekly schedule has no days selected")]
    NoDays,

    #[error("timer interval must be at least one minute")]
    ZeroInterval,
}
