use std::time::Duration;

use crate::config::ScheduleConfig;

/// Periodic jobs, listed in the order they run when due together
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    /// Exchange reconciliation (`check_position`)
    Reconcile,
    /// Stale order cleanup (`cancel_abnormal_orders`)
    OrderCleanup,
    /// High-water ratchet
    PriceTick,
    /// Analyzer pass (`check_signal`)
    SignalCheck,
    /// Portfolio summary
    Report,
}

#[derive(Debug, Clone)]
struct Timer {
    kind: TaskKind,
    period: Duration,
    remaining: Duration,
}

/// Named timers advanced by elapsed time.
///
/// Pure bookkeeping with no clock of its own, so cadences can be tested by
/// feeding it simulated time. Missed periods collapse into one firing.
#[derive(Debug, Clone)]
pub struct Scheduler {
    timers: Vec<Timer>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { timers: Vec::new() }
    }

    /// Standard timer set. Everything but the report fires on the first
    /// advance so the engine reconciles and evaluates right after startup.
    pub fn from_config(schedule: &ScheduleConfig) -> Self {
        Self::new()
            .with_timer(TaskKind::Reconcile, Duration::from_secs(schedule.reconcile_secs), true)
            .with_timer(TaskKind::OrderCleanup, Duration::from_secs(schedule.order_cleanup_secs), true)
            .with_timer(TaskKind::PriceTick, Duration::from_secs(schedule.price_tick_secs), true)
            .with_timer(TaskKind::SignalCheck, Duration::from_secs(schedule.signal_check_secs), true)
            .with_timer(TaskKind::Report, Duration::from_secs(schedule.reconcile_secs), false)
    }

    pub fn with_timer(mut self, kind: TaskKind, period: Duration, fire_immediately: bool) -> Self {
        let period = period.max(Duration::from_millis(1));
        self.timers.retain(|t| t.kind != kind);
        self.timers.push(Timer {
            kind,
            period,
            remaining: if fire_immediately { Duration::ZERO } else { period },
        });
        self.timers.sort_by_key(|t| t.kind);
        self
    }

    pub fn period(&self, kind: TaskKind) -> Option<Duration> {
        self.timers.iter().find(|t| t.kind == kind).map(|t| t.period)
    }

    /// Time until the next timer fires
    pub fn until_next(&self) -> Duration {
        self.timers
            .iter()
            .map(|t| t.remaining)
            .min()
            .unwrap_or(Duration::MAX)
    }

    /// Move time forward and return the timers that fired, in run order
    pub fn advance(&mut self, elapsed: Duration) -> Vec<TaskKind> {
        let mut due = Vec::new();
        for timer in &mut self.timers {
            if elapsed >= timer.remaining {
                let overshoot = elapsed - timer.remaining;
                let into_period = Duration::from_nanos(
                    (overshoot.as_nanos() % timer.period.as_nanos()) as u64,
                );
                timer.remaining = timer.period - into_period;
                due.push(timer.kind);
            } else {
                timer.remaining -= elapsed;
            }
        }
        due
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
