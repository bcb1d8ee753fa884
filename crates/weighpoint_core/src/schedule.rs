//! Deep-Sleep Scheduler
//!
//! The station spends most of its life asleep. This module computes the one
//! deadline worth waking for: the minimum `next_due_at` across all recurring
//! actions. The control loop arms a single relative-delay timer for that
//! deadline, sleeps, and on wake calls [`Scheduler::fire_due`] to enqueue
//! the actions that came due.
//!
//! Time is split across two notions:
//!
//! - [`Clock::now`] is monotonic and drives the wake timer;
//! - [`Clock::minute_of_day`] is wall-clock and anchors the two daily
//!   transmission times.
//!
//! Fired actions are always rescheduled strictly later than the firing
//! instant, so a wake can never re-arm an already-elapsed deadline.

use crate::config::ScheduleConfig;
use crate::error::ScheduleError;
use crate::queue::EventQueue;
use crate::types::{Event, EventKind, MinuteOfDay, TxSchedule};
use chrono::Timelike;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source for the scheduler and the sensing loop.
pub trait Clock: Send + Sync {
    /// Monotonic now, for arming wake timers.
    fn now(&self) -> Instant;

    /// Wall-clock minute of day, 0-1439 UTC.
    fn minute_of_day(&self) -> u16;
}

/// The real clocks: `std::time::Instant` and the chrono UTC wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn minute_of_day(&self) -> u16 {
        let now = chrono::Utc::now();
        (now.hour() * 60 + now.minute()) as u16
    }
}

/// A hand-cranked clock for tests.
///
/// Starts at a chosen minute of day; [`advance`](ManualClock::advance) moves
/// both notions of time forward together.
pub struct ManualClock {
    epoch: Instant,
    offset: Mutex<Duration>,
    minute: AtomicU16,
}

impl ManualClock {
    /// Create a clock reading the given minute of day.
    pub fn at_minute(minute: u16) -> Self {
        Self {
            epoch: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            minute: AtomicU16::new(minute % crate::types::MINUTES_PER_DAY),
        }
    }

    /// Move both clocks forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut offset = self
            .offset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *offset += by;
        let minutes = (by.as_secs() / 60) as u16;
        if minutes > 0 {
            let current = self.minute.load(Ordering::SeqCst);
            self.minute.store(
                (current + minutes) % crate::types::MINUTES_PER_DAY,
                Ordering::SeqCst,
            );
        }
    }

    /// Jump the wall clock to a specific minute of day.
    pub fn set_minute(&self, minute: u16) {
        self.minute
            .store(minute % crate::types::MINUTES_PER_DAY, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self
            .offset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.epoch + *offset
    }

    fn minute_of_day(&self) -> u16 {
        self.minute.load(Ordering::SeqCst)
    }
}

/// The recurring actions the station wakes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecurringKind {
    /// Daily device status check.
    StatusCheck,
    /// First daily data transmission.
    MorningTx,
    /// Second daily data transmission.
    EveningTx,
    /// Daily clock synchronization against the time server.
    ClockSync,
}

impl RecurringKind {
    /// The event this action enqueues when it fires.
    pub fn event_kind(&self) -> EventKind {
        match self {
            RecurringKind::StatusCheck => EventKind::CheckStatus,
            RecurringKind::MorningTx | RecurringKind::EveningTx => EventKind::SendData,
            RecurringKind::ClockSync => EventKind::CalibrateClock,
        }
    }

    /// Human-readable name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            RecurringKind::StatusCheck => "status-check",
            RecurringKind::MorningTx => "morning-tx",
            RecurringKind::EveningTx => "evening-tx",
            RecurringKind::ClockSync => "clock-sync",
        }
    }
}

impl std::fmt::Display for RecurringKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One recurring action and its next deadline.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledAction {
    /// Which recurring action this is.
    pub kind: RecurringKind,
    /// When it next comes due.
    pub next_due_at: Instant,
}

/// Computes wake deadlines for the recurring actions.
///
/// Rebuilt at every boot: deadlines live in memory only, derived from the
/// configured periods and the persisted transmission times. Firing an
/// action enqueues its event at routine priority and recomputes the deadline
/// strictly later than the firing instant.
pub struct Scheduler {
    actions: Vec<ScheduledAction>,
    tx: TxSchedule,
    status_check_period: Duration,
    clock_sync_period: Duration,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    /// Build the scheduler with every recurring action armed from now.
    pub fn new(config: &ScheduleConfig, tx: TxSchedule, clock: Arc<dyn Clock>) -> Self {
        let mut scheduler = Self {
            actions: Vec::new(),
            tx,
            status_check_period: config.status_check_period,
            clock_sync_period: config.clock_sync_period,
            clock,
        };
        scheduler.rebuild();
        scheduler
    }

    /// Recompute every deadline from the current time.
    pub fn rebuild(&mut self) {
        let kinds = [
            RecurringKind::StatusCheck,
            RecurringKind::MorningTx,
            RecurringKind::EveningTx,
            RecurringKind::ClockSync,
        ];
        let now = self.clock.now();
        self.actions = kinds
            .iter()
            .map(|&kind| ScheduledAction {
                kind,
                next_due_at: now + self.delay_for(kind),
            })
            .collect();
        log::debug!("scheduler rebuilt with {} actions", self.actions.len());
    }

    /// Delay from now until `kind` next comes due. Never zero.
    fn delay_for(&self, kind: RecurringKind) -> Duration {
        match kind {
            RecurringKind::StatusCheck => self.status_check_period,
            RecurringKind::ClockSync => self.clock_sync_period,
            RecurringKind::MorningTx => self.delay_until(self.tx.morning),
            RecurringKind::EveningTx => self.delay_until(self.tx.evening),
        }
    }

    fn delay_until(&self, target: MinuteOfDay) -> Duration {
        let now_minute =
            MinuteOfDay::new(self.clock.minute_of_day()).unwrap_or(MinuteOfDay::MIDNIGHT);
        Duration::from_secs(target.minutes_until(now_minute) as u64 * 60)
    }

    /// The earliest deadline across all actions.
    pub fn next_deadline(&self) -> Result<Instant, ScheduleError> {
        self.actions
            .iter()
            .map(|a| a.next_due_at)
            .min()
            .ok_or(ScheduleError::NoScheduledWork)
    }

    /// Relative delay to arm the wake timer with.
    ///
    /// Zero when a deadline already passed; the caller fires immediately.
    pub fn next_delay(&self) -> Result<Duration, ScheduleError> {
        let deadline = self.next_deadline()?;
        Ok(deadline.saturating_duration_since(self.clock.now()))
    }

    /// Enqueue every due action and reschedule it. Returns how many fired.
    ///
    /// A full queue drops the event with a warning; the deadline still
    /// advances, otherwise the loop would spin on the same due action.
    pub fn fire_due(&mut self, queue: &EventQueue) -> usize {
        let now = self.clock.now();
        let mut fired = 0;

        // Collect first: rescheduling needs `&self` for the tx times.
        let due: Vec<RecurringKind> = self
            .actions
            .iter()
            .filter(|a| a.next_due_at <= now)
            .map(|a| a.kind)
            .collect();

        for kind in due {
            let event = Event::routine(kind.event_kind());
            match queue.enqueue(event) {
                Ok(()) => {
                    fired += 1;
                    log::debug!("{} fired, enqueued {}", kind, event);
                }
                Err(e) => {
                    log::warn!("{} fired but {} was dropped: {}", kind, event, e);
                }
            }
            let next = now + self.delay_for(kind);
            if let Some(action) = self.actions.iter_mut().find(|a| a.kind == kind) {
                action.next_due_at = next;
            }
        }
        fired
    }

    /// Adopt newly assigned transmission times and recompute their deadlines.
    pub fn reschedule_tx_times(&mut self, tx: TxSchedule) {
        self.tx = tx;
        let now = self.clock.now();
        let morning = now + self.delay_for(RecurringKind::MorningTx);
        let evening = now + self.delay_for(RecurringKind::EveningTx);
        for action in &mut self.actions {
            match action.kind {
                RecurringKind::MorningTx => action.next_due_at = morning,
                RecurringKind::EveningTx => action.next_due_at = evening,
                _ => {}
            }
        }
        log::info!("transmission times rescheduled to {}", tx);
    }

    /// The transmission times currently in effect.
    pub fn tx_schedule(&self) -> TxSchedule {
        self.tx
    }

    /// The registered actions, in registration order.
    pub fn actions(&self) -> &[ScheduledAction] {
        &self.actions
    }

    /// Deadline of one action, if registered.
    pub fn due_at(&self, kind: RecurringKind) -> Option<Instant> {
        self.actions
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.next_due_at)
    }
}
