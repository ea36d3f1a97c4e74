//! Schedule parsing and next occurrence calculation.
//!
//! Supports standard 5-field cron, 6-field cron with seconds, shortcuts
//! (@daily, @hourly, etc.), and fixed intervals (@every 5m). Occurrences are
//! computed in the schedule's timezone and returned in UTC.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// A recurrence rule for job execution.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// The original expression string, kept for display and comparison.
    expression: String,
    timezone: String,
    tz: Tz,
    kind: ScheduleKind,
}

#[derive(Debug, Clone)]
enum ScheduleKind {
    Cron(Box<CronSchedule>),
    Every(Duration),
}

/// Two schedules are the same rule if their expressions and timezones match.
impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.timezone == other.timezone
    }
}
impl Eq for Schedule {}

impl Schedule {
    /// Parse an expression in UTC.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`
    /// - Intervals: `@every 5m`, `@every 1h30m`
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Parse an expression evaluated in a specific timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone = timezone.into();

        let tz: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.clone()))?;
        let kind = Self::parse_expression(&expression)?;

        Ok(Self {
            expression,
            timezone,
            tz,
            kind,
        })
    }

    fn parse_expression(expression: &str) -> Result<ScheduleKind, ScheduleError> {
        let trimmed = expression.trim();
        if trimmed.starts_with('@') {
            return Self::parse_shortcut(trimmed);
        }
        Self::parse_cron(trimmed)
    }

    fn parse_shortcut(expression: &str) -> Result<ScheduleKind, ScheduleError> {
        match expression.to_lowercase().as_str() {
            "@yearly" | "@annually" => Self::parse_cron("0 0 1 1 *"),
            "@monthly" => Self::parse_cron("0 0 1 * *"),
            "@weekly" => Self::parse_cron("0 0 * * SUN"),
            "@daily" | "@midnight" => Self::parse_cron("0 0 * * *"),
            "@hourly" => Self::parse_cron("0 * * * *"),
            s if s.starts_with("@every ") => {
                Ok(ScheduleKind::Every(Self::parse_duration(s[7..].trim())?))
            }
            _ => Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            ))),
        }
    }

    /// Parse a duration string like "5m", "1h", "1h30m", "30s".
    fn parse_duration(s: &str) -> Result<Duration, ScheduleError> {
        let mut total_secs: u64 = 0;
        let mut current_num = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                current_num.push(c);
            } else {
                let num: u64 = current_num
                    .parse()
                    .map_err(|_| ScheduleError::InvalidInterval(s.to_string()))?;
                current_num.clear();

                match c {
                    's' => total_secs += num,
                    'm' => total_secs += num * 60,
                    'h' => total_secs += num * 3600,
                    'd' => total_secs += num * 86400,
                    _ => return Err(ScheduleError::InvalidInterval(s.to_string())),
                }
            }
        }

        if total_secs == 0 || !current_num.is_empty() {
            return Err(ScheduleError::InvalidInterval(s.to_string()));
        }

        Ok(Duration::from_secs(total_secs))
    }

    fn parse_cron(expression: &str) -> Result<ScheduleKind, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();

        let cron_expr = match fields.len() {
            // The cron crate always wants a seconds field.
            5 => format!("0 {}", expression),
            6 => expression.to_string(),
            _ => {
                return Err(ScheduleError::InvalidCron(format!(
                    "expected 5 or 6 fields, got {}",
                    fields.len()
                )));
            }
        };

        let schedule = CronSchedule::from_str(&cron_expr)
            .map_err(|e| ScheduleError::InvalidCron(e.to_string()))?;

        Ok(ScheduleKind::Cron(Box::new(schedule)))
    }

    /// Next occurrence strictly after the given instant.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.kind {
            ScheduleKind::Cron(schedule) => {
                let local_time = after.with_timezone(&self.tz);
                schedule
                    .after(&local_time)
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok_or(ScheduleError::NoMoreOccurrences)
            }
            ScheduleKind::Every(duration) => {
                let step = chrono::Duration::from_std(*duration)
                    .map_err(|_| ScheduleError::InvalidInterval(self.expression.clone()))?;
                Ok(after + step)
            }
        }
    }

    /// Next occurrence from now.
    pub fn next(&self) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after(Utc::now())
    }

    /// The original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The timezone name this schedule evaluates in.
    pub fn timezone(&self) -> &str {
        &self.timezone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_parse_standard_5_field_cron() {
        let schedule = Schedule::new("0 * * * *").unwrap();
        assert_eq!(schedule.expression(), "0 * * * *");
        assert!(schedule.next().is_ok());
    }

    #[test]
    fn test_parse_extended_6_field_cron() {
        let schedule = Schedule::new("15 * * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let next = schedule.next_after(base).unwrap();
        assert_eq!(next.second(), 15);
    }

    #[test]
    fn test_parse_daily_shortcut() {
        let schedule = Schedule::new("@daily").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let next = schedule.next_after(base).unwrap();
        assert_eq!(next.hour(), 0);
        assert_eq!(next.minute(), 0);
        assert!(next > base);
    }

    #[test]
    fn test_parse_every_interval() {
        let schedule = Schedule::new("@every 5m").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let next = schedule.next_after(base).unwrap();
        assert_eq!((next - base).num_minutes(), 5);

        let schedule = Schedule::new("@every 1h30m").unwrap();
        let next = schedule.next_after(base).unwrap();
        assert_eq!((next - base).num_minutes(), 90);
    }

    #[test]
    fn test_timezone_aware_scheduling() {
        let schedule = Schedule::with_timezone("0 9 * * *", "America/New_York").unwrap();
        assert_eq!(schedule.timezone(), "America/New_York");

        // Mid-January, EST is UTC-5, so 9 AM local is 14:00 UTC.
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let next = schedule.next_after(base).unwrap();
        assert_eq!(next.hour(), 14);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            Schedule::new("not a cron"),
            Err(ScheduleError::InvalidCron(_))
        ));
        assert!(matches!(
            Schedule::new("@every nonsense"),
            Err(ScheduleError::InvalidInterval(_))
        ));
        assert!(matches!(
            Schedule::with_timezone("0 * * * *", "Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_equality_by_expression_and_timezone() {
        let a = Schedule::new("@hourly").unwrap();
        let b = Schedule::new("@hourly").unwrap();
        let c = Schedule::with_timezone("@hourly", "America/New_York").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
