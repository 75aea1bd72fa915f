//! Scheduler state machine.
//!
//! `Idle → Armed(start) → Running → {Idle | Armed(next)}`. A single driver
//! task owns the armed occurrence; replacing the schedule cancels that task,
//! which shuts down a running cycle before it exits.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDateTime;
use mydata_pipeline::{CycleSummary, PipelineError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

use crate::clock::{Clock, SystemClock};
use crate::error::ScheduleError;
use crate::runner::CycleRunner;
use crate::schedule::Schedule;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed { at: NaiveDateTime },
    Running,
}

/// The occurrence currently armed or running.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub description: String,
    pub start: NaiveDateTime,
    pub schedule: Schedule,
    cancel: CancellationToken,
}

impl ScheduledTask {
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct Shared {
    runner: Arc<dyn CycleRunner>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<SchedulerState>,
    task: Mutex<Option<ScheduledTask>>,
    last_summary: Mutex<Option<CycleSummary>>,
}

impl Shared {
    fn arm(&self, schedule: &Schedule, at: NaiveDateTime, cancel: &CancellationToken) {
        *lock(&self.task) = Some(ScheduledTask {
            description: schedule.to_string(),
            start: at,
            schedule: schedule.clone(),
            cancel: cancel.clone(),
        });
        self.state.send_replace(SchedulerState::Armed { at });
        info!(at = %at, schedule = %schedule, "cycle armed");
    }

    fn disarm(&self) {
        lock(&self.task).take();
        self.state.send_replace(SchedulerState::Idle);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Control {
    schedule: Schedule,
    driver: Option<Driver>,
}

/// Decides when cycles start. At most one occurrence is armed or running.
pub struct Scheduler {
    shared: Arc<Shared>,
    control: tokio::sync::Mutex<Control>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn CycleRunner>) -> Self {
        Self::with_clock(runner, Arc::new(SystemClock))
    }

    pub fn with_clock(runner: Arc<dyn CycleRunner>, clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            shared: Arc::new(Shared {
                runner,
                clock,
                state,
                task: Mutex::new(None),
                last_summary: Mutex::new(None),
            }),
            control: tokio::sync::Mutex::new(Control {
                schedule: Schedule::Manually,
                driver: None,
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.shared.state.subscribe()
    }

    pub fn current_task(&self) -> Option<ScheduledTask> {
        lock(&self.shared.task).clone()
    }

    /// Summary of the most recent cycle that ran to completion.
    pub fn last_summary(&self) -> Option<CycleSummary> {
        lock(&self.shared.last_summary).clone()
    }

    pub async fn schedule(&self) -> Schedule {
        self.control.lock().await.schedule.clone()
    }

    /// Replaces the active schedule and returns its first start.
    ///
    /// An invalid schedule is rejected before anything changes. A running
    /// cycle is shut down, and the new schedule is armed only once it is
    /// gone.
    pub async fn apply(&self, schedule: Schedule) -> Result<Option<NaiveDateTime>, ScheduleError> {
        let first = schedule.first_occurrence(self.shared.clock.now())?;
        let mut control = self.control.lock().await;
        self.preempt(&mut control).await;
        info!(schedule = %schedule, "schedule applied");
        if let Some(at) = first {
            control.driver = Some(self.spawn(schedule.clone(), at));
        }
        control.schedule = schedule;
        Ok(first)
    }

    /// Starts a cycle now, replacing the armed occurrence. Recurring
    /// schedules continue from the end of that cycle.
    pub async fn run_now(&self) {
        let mut control = self.control.lock().await;
        self.preempt(&mut control).await;
        let now = self.shared.clock.now();
        control.driver = Some(self.spawn(control.schedule.clone(), now));
    }

    /// Disarms the schedule, shutting down a running cycle.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        self.preempt(&mut control).await;
        control.schedule = Schedule::Manually;
        info!("scheduler stopped");
    }

    async fn preempt(&self, control: &mut Control) {
        let Some(driver) = control.driver.take() else {
            return;
        };
        driver.cancel.cancel();
        if let Err(e) = driver.handle.await {
            if e.is_panic() {
                error!(error = %e, "scheduler task panicked");
            }
            self.shared.disarm();
        }
    }

    fn spawn(&self, schedule: Schedule, at: NaiveDateTime) -> Driver {
        let cancel = CancellationToken::new();
        self.shared.arm(&schedule, at, &cancel);
        let handle = tokio::spawn(
            drive(Arc::clone(&self.shared), schedule, at, cancel.clone())
                .instrument(info_span!("scheduler")),
        );
        Driver { cancel, handle }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(driver) = &self.control.get_mut().driver {
            driver.cancel.cancel();
        }
    }
}

async fn drive(
    shared: Arc<Shared>,
    schedule: Schedule,
    mut at: NaiveDateTime,
    cancel: CancellationToken,
) {
    loop {
        let wait = (at - shared.clock.now()).to_std().unwrap_or_default();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        shared.state.send_replace(SchedulerState::Running);
        match run(shared.runner.as_ref(), &cancel).await {
            Ok(summary) => *lock(&shared.last_summary) = Some(summary),
            Err(e) => error!(error = %e, "cycle failed"),
        }
        if cancel.is_cancelled() {
            debug!("schedule replaced");
            break;
        }

        match schedule.next_after_completion(shared.clock.now()) {
            Some(next) => {
                at = next;
                shared.arm(&schedule, at, &cancel);
            }
            None => break,
        }
    }
    shared.disarm();
}

/// Runs one cycle. Cancellation shuts the cycle down and waits for it to
/// finish rather than dropping it.
async fn run(
    runner: &dyn CycleRunner,
    cancel: &CancellationToken,
) -> Result<CycleSummary, PipelineError> {
    let mut cycle = runner.run_cycle();
    tokio::select! {
        biased;
        result = &mut cycle => result,
        _ = cancel.cancelled() => {
            info!("shutting down running cycle");
            let (result, ()) = tokio::join!(&mut cycle, runner.shutdown());
            result
        }
    }
}
