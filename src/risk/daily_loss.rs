use chrono::NaiveDate;

/// Running total of realized losses since local midnight
#[derive(Debug, Clone)]
pub struct DailyLossTracker {
    day: NaiveDate,
    realized_loss: f64,
    limit_notified: bool,
}

impl DailyLossTracker {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            day: today,
            realized_loss: 0.0,
            limit_notified: false,
        }
    }

    /// Reset the accumulator when the local date moved on
    fn roll(&mut self, today: NaiveDate) {
        if today > self.day {
            tracing::info!(
                "Daily stats reset ({} -> {}), previous realized loss {:.0}",
                self.day,
                today,
                self.realized_loss
            );
            self.day = today;
            self.realized_loss = 0.0;
            self.limit_notified = false;
        }
    }

    /// Realized loss so far today
    pub fn realized_loss(&mut self, today: NaiveDate) -> f64 {
        self.roll(today);
        self.realized_loss
    }

    /// Record the P&L of a closed trade. Gains do not offset losses.
    pub fn record(&mut self, realized_pnl: f64, today: NaiveDate) {
        self.roll(today);
        if realized_pnl < 0.0 {
            self.realized_loss += -realized_pnl;
        }
    }

    /// True the first time it is called on a given day
    pub fn take_limit_notification(&mut self, today: NaiveDate) -> bool {
        self.roll(today);
        !std::mem::replace(&mut self.limit_notified, true)
    }
}
