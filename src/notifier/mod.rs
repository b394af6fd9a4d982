// Operator notifications with quiet-hours suppression
pub mod telegram;

pub use telegram::TelegramNotifier;

use async_trait::async_trait;
use chrono::{Local, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alert severity. Ordered: `Critical` is the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Daily window during which non-critical alerts are held back.
///
/// `start > end` wraps past midnight (22:00-08:00). `start == end` is an
/// empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse `HH:MM` bounds
    pub fn parse(start: &str, end: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self {
            start: NaiveTime::parse_from_str(start, "%H:%M")?,
            end: NaiveTime::parse_from_str(end, "%H:%M")?,
        })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    /// Critical alerts always pass
    pub fn suppresses(&self, severity: Severity, time: NaiveTime) -> bool {
        severity < Severity::Critical && self.contains(time)
    }
}

/// Delivers human-readable alerts.
///
/// Delivery is best effort: implementations log failures and never hand
/// them back to trading code.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, severity: Severity);
}

/// Writes alerts to the log only. Used when no transport is configured.
pub struct LogNotifier {
    prefix: String,
    quiet_hours: Option<QuietHours>,
}

impl LogNotifier {
    pub fn new(prefix: &str, quiet_hours: Option<QuietHours>) -> Self {
        Self {
            prefix: prefix.to_string(),
            quiet_hours,
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, severity: Severity) {
        if let Some(quiet) = &self.quiet_hours {
            if quiet.suppresses(severity, Local::now().time()) {
                tracing::debug!("🔕 Quiet hours, suppressed [{}] {}", severity, message);
                return;
            }
        }
        match severity {
            Severity::Info => tracing::info!("📣 [{}] {}", self.prefix, message),
            Severity::Warning => tracing::warn!("📣 [{}] {}", self.prefix, message),
            Severity::Error | Severity::Critical => {
                tracing::error!("📣 [{}] {} ({})", self.prefix, message, severity)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_quiet_hours_wrap_midnight() {
        let quiet = QuietHours::parse("22:00", "08:00").unwrap();

        assert!(quiet.contains(t(22, 0)));
        assert!(quiet.contains(t(23, 59)));
        assert!(quiet.contains(t(0, 0)));
        assert!(quiet.contains(t(7, 59)));
        assert!(!quiet.contains(t(8, 0)));
        assert!(!quiet.contains(t(12, 0)));
        assert!(!quiet.contains(t(21, 59)));
    }

    #[test]
    fn test_quiet_hours_same_day() {
        let quiet = QuietHours::parse("01:00", "05:30").unwrap();
        assert!(quiet.contains(t(3, 0)));
        assert!(!quiet.contains(t(5, 30)));
        assert!(!quiet.contains(t(0, 59)));
    }

    #[test]
    fn test_empty_window() {
        let quiet = QuietHours::new(t(9, 0), t(9, 0));
        assert!(!quiet.contains(t(9, 0)));
    }

    #[test]
    fn test_critical_bypasses_quiet_hours() {
        let quiet = QuietHours::parse("22:00", "08:00").unwrap();
        assert!(quiet.suppresses(Severity::Error, t(23, 0)));
        assert!(!quiet.suppresses(Severity::Critical, t(23, 0)));
        assert!(!quiet.suppresses(Severity::Info, t(12, 0)));
    }

    #[test]
    fn test_bad_time_rejected() {
        assert!(QuietHours::parse("25:00", "08:00").is_err());
        assert!(QuietHours::parse("22h", "08:00").is_err());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Error < Severity::Critical);
        assert_eq!(Severity::Critical.to_string(), "CRITICAL");
    }
}
