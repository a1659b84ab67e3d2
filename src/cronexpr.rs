use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

/// A standard 5-field cron expression (minute hour day-of-month month
/// day-of-week) or one of the `@yearly`/`@monthly`/... macros, evaluated in
/// UTC.
#[derive(Clone, Debug)]
pub struct CronExpr {
    expression: String,
    schedule: Schedule,
}

#[derive(Debug, Error)]
#[error("invalid cron expression {expression:?}: {source}")]
pub struct ParseError {
    expression: String,
    #[source]
    source: cron::error::Error,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, ParseError> {
        let trimmed = expression.trim();
        // The underlying parser expects a seconds field; 5-field input fires
        // on whole minutes.
        let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
            format!("0 {}", trimmed)
        } else {
            trimmed.to_string()
        };
        let schedule = Schedule::from_str(&normalized).map_err(|source| ParseError {
            expression: expression.to_string(),
            source,
        })?;
        Ok(Self {
            expression: normalized,
            schedule,
        })
    }

    /// Smallest fire instant strictly greater than `since`, if any.
    pub fn next_after(&self, since: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&since).find(|at| *at > since)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronExpr {}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::CronExpr;

    #[test]
    fn next_is_strictly_after() {
        let cron = CronExpr::parse("* * * * *").unwrap();
        let since = Utc.with_ymd_and_hms(2023, 4, 10, 12, 0, 0).unwrap();
        assert_eq!(
            cron.next_after(since),
            Some(Utc.with_ymd_and_hms(2023, 4, 10, 12, 1, 0).unwrap())
        );
    }

    #[test]
    fn step_expression() {
        let cron = CronExpr::parse("0/3 * * * *").unwrap();
        let since = Utc.with_ymd_and_hms(2023, 4, 10, 12, 0, 0).unwrap();
        assert_eq!(
            cron.next_after(since),
            Some(Utc.with_ymd_and_hms(2023, 4, 10, 12, 3, 0).unwrap())
        );
    }

    #[test]
    fn macros_are_supported() {
        let cron = CronExpr::parse("@daily").unwrap();
        let since = Utc.with_ymd_and_hms(2023, 4, 10, 12, 0, 0).unwrap();
        assert_eq!(
            cron.next_after(since),
            Some(Utc.with_ymd_and_hms(2023, 4, 11, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn month_rollover() {
        let cron = CronExpr::parse("0 0 1 * *").unwrap();
        let since = Utc.with_ymd_and_hms(2023, 4, 30, 23, 59, 0).unwrap();
        assert_eq!(
            cron.next_after(since),
            Some(Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn malformed_expression_is_rejected() {
        assert!(CronExpr::parse("not a cron").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
    }
}
