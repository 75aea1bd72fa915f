//! Cycle scheduling.
//!
//! A [`Schedule`] says when cycles run; the [`Scheduler`] arms the next
//! occurrence, runs it through a [`CycleRunner`] and re-arms recurring
//! kinds once the cycle finished.

pub mod clock;
pub mod error;
pub mod runner;
pub mod schedule;
pub mod scheduler;

pub use clock::{Clock, SystemClock};
pub use error::ScheduleError;
pub use runner::{CycleRunner, PipelineRunner, RunFuture};
pub use schedule::{DayMask, ONCE_GRACE_SECS, Schedule, TimeWindow};
pub use scheduler::{ScheduledTask, Scheduler, SchedulerState};
