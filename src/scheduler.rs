//! Daily trigger and the Idle/Running state machine around a sync cycle
//!
//! The tick source decides *when* a cycle is due; the scheduler decides
//! *whether* a due tick may start one. A tick that comes due while a cycle is
//! still running is skipped, never queued.

use anyhow::{bail, Result};
use chrono::{Local, NaiveDateTime, NaiveTime};
use std::cell::Cell;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::utils::format_countdown;

/// A fixed local time of day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    /// Parse "HH:MM" or "HH:MM:SS"
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        for format in ["%H:%M:%S", "%H:%M"] {
            if let Ok(at) = NaiveTime::parse_from_str(s, format) {
                return Ok(Self { at });
            }
        }
        bail!("expected HH:MM or HH:MM:SS, got '{}'", s)
    }

    pub fn at(&self) -> NaiveTime {
        self.at
    }

    /// First occurrence strictly after `now`
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.at);
        if today > now {
            today
        } else {
            // Dates this close to the calendar's end never occur in practice
            now.date().succ_opt().unwrap_or(now.date()).and_time(self.at)
        }
    }
}

/// Source of local wall-clock time
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Yields the due time of each trigger, blocking until it is due.
/// `None` means no more ticks (shutdown).
pub trait TickSource {
    fn next_tick(&mut self) -> Option<NaiveDateTime>;
}

/// Ticks once per day at the configured time until the shutdown flag is set
pub struct DailyTicks<C: Clock> {
    schedule: DailySchedule,
    clock: C,
    next_due: NaiveDateTime,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl<C: Clock> DailyTicks<C> {
    pub fn new(schedule: DailySchedule, clock: C, shutdown: Arc<AtomicBool>) -> Self {
        let next_due = schedule.next_after(clock.now());
        Self {
            schedule,
            clock,
            next_due,
            shutdown,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn next_due(&self) -> NaiveDateTime {
        self.next_due
    }
}

impl<C: Clock> TickSource for DailyTicks<C> {
    fn next_tick(&mut self) -> Option<NaiveDateTime> {
        let mut announced = false;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }

            let now = self.clock.now();
            if now >= self.next_due {
                let fired_at = self.next_due;
                self.next_due = self.schedule.next_after(fired_at);
                return Some(fired_at);
            }

            let remaining = (self.next_due - now).to_std().unwrap_or(Duration::ZERO);
            if !announced {
                info!(
                    "Next sync at {} (in {})",
                    self.next_due.format("%Y-%m-%d %H:%M:%S"),
                    format_countdown(remaining)
                );
                announced = true;
            }
            thread::sleep(remaining.min(self.poll_interval));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running { since: NaiveDateTime },
}

#[derive(Debug)]
pub enum TickOutcome<T, E> {
    Completed(T),
    Failed(E),
    Skipped,
}

impl<T, E> TickOutcome<T, E> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped)
    }
}

/// Runs at most one cycle at a time
pub struct Scheduler<C: Clock> {
    clock: C,
    state: Cell<SchedulerState>,
    last_finished: Cell<Option<NaiveDateTime>>,
}

/// Puts the scheduler back to Idle when the cycle ends, even by unwinding
struct RunningGuard<'a, C: Clock> {
    scheduler: &'a Scheduler<C>,
}

impl<C: Clock> Drop for RunningGuard<'_, C> {
    fn drop(&mut self) {
        self.scheduler.state.set(SchedulerState::Idle);
        self.scheduler
            .last_finished
            .set(Some(self.scheduler.clock.now()));
    }
}

impl<C: Clock> Scheduler<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            state: Cell::new(SchedulerState::Idle),
            last_finished: Cell::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state.get()
    }

    pub fn last_finished(&self) -> Option<NaiveDateTime> {
        self.last_finished.get()
    }

    /// Handle one trigger that came due at `fired_at`.
    ///
    /// The trigger is skipped if a cycle is running right now, or if it came
    /// due before the previous cycle finished.
    pub fn on_tick<T, E, F>(&self, fired_at: NaiveDateTime, job: F) -> TickOutcome<T, E>
    where
        E: Display,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        if let SchedulerState::Running { since } = self.state() {
            warn!(
                "Skipping trigger due {}: cycle running since {}",
                fired_at.format("%Y-%m-%d %H:%M:%S"),
                since.format("%Y-%m-%d %H:%M:%S")
            );
            return TickOutcome::Skipped;
        }
        if let Some(finished) = self.last_finished() {
            if fired_at < finished {
                warn!(
                    "Skipping trigger due {}: it came due while the previous cycle was running (finished {})",
                    fired_at.format("%Y-%m-%d %H:%M:%S"),
                    finished.format("%Y-%m-%d %H:%M:%S")
                );
                return TickOutcome::Skipped;
            }
        }

        let since = self.clock.now();
        self.state.set(SchedulerState::Running { since });
        let _guard = RunningGuard { scheduler: self };
        info!("Starting sync cycle at {}", since.format("%Y-%m-%d %H:%M:%S"));

        match job() {
            Ok(value) => TickOutcome::Completed(value),
            Err(e) => {
                error!("Sync cycle failed: {}", e);
                TickOutcome::Failed(e)
            }
        }
    }

    /// Drive `ticks` until it runs out, running `job` on every accepted tick.
    /// Returns the number of skipped triggers.
    pub fn run<T, E, S, F>(&self, ticks: &mut S, mut job: F) -> usize
    where
        E: Display,
        S: TickSource,
        F: FnMut() -> std::result::Result<T, E>,
    {
        let mut skipped = 0;
        while let Some(fired_at) = ticks.next_tick() {
            if self.on_tick(fired_at, &mut job).is_skipped() {
                skipped += 1;
            }
        }
        info!("Scheduler stopped ({} triggers skipped)", skipped);
        skipped
    }

    /// Like [`Scheduler::run`], optionally running `job` once right away.
    ///
    /// `ticks` must be created before calling this, so a daily trigger that
    /// comes due during a long startup cycle is skipped like any other.
    pub fn serve<T, E, S, F>(&self, ticks: &mut S, run_on_start: bool, mut job: F) -> usize
    where
        E: Display,
        S: TickSource,
        F: FnMut() -> std::result::Result<T, E>,
    {
        if run_on_start {
            self.on_tick(self.clock.now(), &mut job);
        }
        self.run(ticks, job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    /// Clock whose time only moves when a test says so
    #[derive(Clone)]
    struct ManualClock(Rc<Cell<NaiveDateTime>>);

    impl ManualClock {
        fn new(start: NaiveDateTime) -> Self {
            Self(Rc::new(Cell::new(start)))
        }

        fn set(&self, t: NaiveDateTime) {
            self.0.set(t);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> NaiveDateTime {
            self.0.get()
        }
    }

    struct ScriptedTicks(VecDeque<NaiveDateTime>);

    impl TickSource for ScriptedTicks {
        fn next_tick(&mut self) -> Option<NaiveDateTime> {
            self.0.pop_front()
        }
    }

    #[test]
    fn test_parse_schedule() {
        assert_eq!(
            DailySchedule::parse("03:30").unwrap().at(),
            NaiveTime::from_hms_opt(3, 30, 0).unwrap()
        );
        assert_eq!(
            DailySchedule::parse(" 23:59:59 ").unwrap().at(),
            NaiveTime::from_hms_opt(23, 59, 59).unwrap()
        );
        assert!(DailySchedule::parse("24:00").is_err());
        assert!(DailySchedule::parse("midnight").is_err());
    }

    #[test]
    fn test_next_after_is_strictly_later() {
        let schedule = DailySchedule::parse("00:00").unwrap();
        assert_eq!(schedule.next_after(at(1, 12, 0)), at(2, 0, 0));
        // Exactly on the boundary moves to the next day
        assert_eq!(schedule.next_after(at(2, 0, 0)), at(3, 0, 0));

        let schedule = DailySchedule::parse("06:15").unwrap();
        assert_eq!(schedule.next_after(at(1, 6, 0)), at(1, 6, 15));
        assert_eq!(schedule.next_after(at(1, 7, 0)), at(2, 6, 15));
    }

    #[test]
    fn test_idle_running_idle() {
        let clock = ManualClock::new(at(1, 0, 0));
        let scheduler = Scheduler::new(clock.clone());
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let outcome: TickOutcome<u32, String> = scheduler.on_tick(at(1, 0, 0), || {
            assert_eq!(
                scheduler.state(),
                SchedulerState::Running { since: at(1, 0, 0) }
            );
            clock.set(at(1, 0, 5));
            Ok(7)
        });

        assert!(matches!(outcome, TickOutcome::Completed(7)));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.last_finished(), Some(at(1, 0, 5)));
    }

    #[test]
    fn test_failure_returns_to_idle() {
        let clock = ManualClock::new(at(1, 0, 0));
        let scheduler = Scheduler::new(clock);

        let outcome: TickOutcome<(), String> =
            scheduler.on_tick(at(1, 0, 0), || Err("auth expired".to_string()));

        assert!(matches!(outcome, TickOutcome::Failed(ref e) if e == "auth expired"));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_trigger_while_running_is_skipped() {
        let clock = ManualClock::new(at(1, 0, 0));
        let scheduler = Scheduler::new(clock.clone());
        let runs = Cell::new(0);

        let outcome: TickOutcome<(), String> = scheduler.on_tick(at(1, 0, 0), || {
            runs.set(runs.get() + 1);
            clock.set(at(2, 0, 0));
            // Two more triggers arrive while this cycle is still running
            for _ in 0..2 {
                let nested: TickOutcome<(), String> = scheduler.on_tick(at(2, 0, 0), || {
                    runs.set(runs.get() + 1);
                    Ok(())
                });
                assert!(nested.is_skipped());
            }
            Ok(())
        });

        assert!(matches!(outcome, TickOutcome::Completed(())));
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_overrun_skips_ticks_that_came_due_during_the_cycle() {
        let clock = ManualClock::new(at(1, 0, 0));
        let scheduler = Scheduler::new(clock.clone());
        // The first cycle takes more than two days
        let mut ticks = ScriptedTicks(VecDeque::from(vec![
            at(1, 0, 0),
            at(2, 0, 0),
            at(3, 0, 0),
            at(4, 0, 0),
        ]));
        let started = RefCell::new(Vec::new());

        scheduler.run(&mut ticks, || -> std::result::Result<(), String> {
            let now = clock.now();
            started.borrow_mut().push(now);
            if now == at(1, 0, 0) {
                clock.set(at(3, 1, 0));
            } else {
                clock.set(now + chrono::Duration::minutes(1));
            }
            Ok(())
        });

        // Day 2 and day 3 ticks came due while day 1's cycle was running
        assert_eq!(started.into_inner(), vec![at(1, 0, 0), at(3, 1, 0)]);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_panicking_job_still_returns_to_idle() {
        let clock = ManualClock::new(at(1, 0, 0));
        let scheduler = Scheduler::new(clock);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: TickOutcome<(), String> =
                scheduler.on_tick(at(1, 0, 0), || panic!("boom"));
        }));

        assert!(result.is_err());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_daily_ticks_yields_overdue_ticks_immediately() {
        let clock = ManualClock::new(at(1, 12, 0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut ticks = DailyTicks::new(
            DailySchedule::parse("00:00").unwrap(),
            clock.clone(),
            shutdown,
        );
        assert_eq!(ticks.next_due(), at(2, 0, 0));

        clock.set(at(4, 8, 0));
        assert_eq!(ticks.next_tick(), Some(at(2, 0, 0)));
        assert_eq!(ticks.next_tick(), Some(at(3, 0, 0)));
        assert_eq!(ticks.next_tick(), Some(at(4, 0, 0)));
        assert_eq!(ticks.next_due(), at(5, 0, 0));
    }

    #[test]
    fn test_daily_ticks_stop_on_shutdown() {
        let clock = ManualClock::new(at(1, 12, 0));
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut ticks = DailyTicks::new(DailySchedule::parse("00:00").unwrap(), clock, shutdown);
        assert_eq!(ticks.next_tick(), None);
    }

    /// Stops after `left` ticks of the wrapped source
    struct Limited<S> {
        inner: S,
        left: usize,
    }

    impl<S: TickSource> TickSource for Limited<S> {
        fn next_tick(&mut self) -> Option<NaiveDateTime> {
            if self.left == 0 {
                return None;
            }
            self.left -= 1;
            self.inner.next_tick()
        }
    }

    #[test]
    fn test_long_startup_run_skips_the_first_daily_tick() {
        let clock = ManualClock::new(at(1, 23, 59));
        let mut ticks = Limited {
            inner: DailyTicks::new(
                DailySchedule::parse("00:00").unwrap(),
                clock.clone(),
                Arc::new(AtomicBool::new(false)),
            ),
            left: 1,
        };
        let scheduler = Scheduler::new(clock.clone());
        let started = RefCell::new(Vec::new());

        let skipped = scheduler.serve(&mut ticks, true, || -> std::result::Result<(), String> {
            started.borrow_mut().push(clock.now());
            // Still running when midnight comes due
            clock.set(at(2, 0, 30));
            Ok(())
        });

        assert_eq!(started.into_inner(), vec![at(1, 23, 59)]);
        assert_eq!(skipped, 1);
        assert_eq!(scheduler.last_finished(), Some(at(2, 0, 30)));
    }

    #[test]
    fn test_serve_without_startup_run_waits_for_the_tick() {
        let clock = ManualClock::new(at(1, 23, 59));
        let mut ticks = Limited {
            inner: DailyTicks::new(
                DailySchedule::parse("00:00").unwrap(),
                clock.clone(),
                Arc::new(AtomicBool::new(false)),
            ),
            left: 1,
        };
        let scheduler = Scheduler::new(clock.clone());
        let started = RefCell::new(Vec::new());
        clock.set(at(2, 0, 0));

        let skipped = scheduler.serve(&mut ticks, false, || -> std::result::Result<(), String> {
            started.borrow_mut().push(clock.now());
            Ok(())
        });

        assert_eq!(started.into_inner(), vec![at(2, 0, 0)]);
        assert_eq!(skipped, 0);
    }
}
