//! Lightweight cron expression matcher.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Per field: *, */N, N, A-B, A-B/N and comma-separated lists of those.
//! Example: "0 8 * * 1-5" = weekdays at 8:00
//!
//! As in standard cron, when both DOM and DOW are restricted (neither starts
//! with `*`) a day matches if either field does.
//!
//! Only used to decide whether a job is due; it is not a full cron grammar.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parse an expression, returning a human-readable reason on failure.
    pub fn parse(expression: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(format!(
                "invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            ));
        }

        let field = |spec: &str, min: u32, max: u32, label: &str| {
            parse_field(spec, min, max)
                .ok_or_else(|| format!("invalid {label} field '{spec}' in '{expression}'"))
        };

        let mut days_of_week = field(parts[4], 0, 7, "day-of-week")?;
        // 7 is an alias for Sunday.
        for d in days_of_week.iter_mut() {
            if *d == 7 {
                *d = 0;
            }
        }
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            minutes: field(parts[0], 0, 59, "minute")?,
            hours: field(parts[1], 0, 23, "hour")?,
            days_of_month: field(parts[2], 1, 31, "day-of-month")?,
            months: field(parts[3], 1, 12, "month")?,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    /// Whether the minute containing `at` is selected by this expression.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes.contains(&at.minute())
            && self.hours.contains(&at.hour())
            && self.months.contains(&at.month())
            && self.day_matches(at)
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(&at.day());
        let dow = self
            .days_of_week
            .contains(&at.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First matching minute strictly after `after`, searching up to a year ahead.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = truncate_to_minute(after) + Duration::minutes(1);
        for _ in 0..(366 * 24 * 60) {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

/// Whether `expression` selects the minute containing `at`.
/// Unparseable expressions are never due.
pub fn is_due(expression: &str, at: DateTime<Utc>) -> bool {
    match CronExpr::parse(expression) {
        Ok(expr) => expr.matches(at),
        Err(reason) => {
            tracing::warn!("⚠️ {reason}");
            false
        }
    }
}

/// Stable key for the minute containing `at`, e.g. "2026-02-22T10:30".
pub fn minute_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M").to_string()
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

/// Parse a cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        values.extend(parse_part(part.trim(), min, max)?);
    }
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}

fn parse_part(part: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let n: u32 = step.parse().ok()?;
            if n == 0 {
                return None;
            }
            (range, n)
        }
        None => (part, 1),
    };

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (a.parse().ok()?, b.parse().ok()?)
    } else {
        let n: u32 = range.parse().ok()?;
        // "N/step" means from N to the end of the field.
        if step > 1 { (n, max) } else { (n, n) }
    };

    if lo < min || hi > max || lo > hi {
        return None;
    }
    Some((lo..=hi).step_by(step as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_every_five_minutes() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 2, 22, 10, 15, 42).unwrap();
        assert!(expr.matches(at));
        let at = Utc.with_ymd_and_hms(2026, 2, 22, 10, 16, 0).unwrap();
        assert!(!expr.matches(at));
    }

    #[test]
    fn test_specific_time() {
        let expr = CronExpr::parse("0 8 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 7, 0, 0).unwrap();
        let next = expr.next_after(after).unwrap();
        assert_eq!(next.hour(), 8);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_weekday_range() {
        // 2026-02-22 is a Sunday.
        let expr = CronExpr::parse("0 9 * * 1-5").unwrap();
        let sunday = Utc.with_ymd_and_hms(2026, 2, 22, 9, 0, 0).unwrap();
        assert!(!expr.matches(sunday));
        let next = expr.next_after(sunday).unwrap();
        assert_eq!(next.day(), 23);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn test_sunday_alias() {
        let expr = CronExpr::parse("0 0 * * 7").unwrap();
        let sunday = Utc.with_ymd_and_hms(2026, 2, 22, 0, 0, 0).unwrap();
        assert!(expr.matches(sunday));
    }

    #[test]
    fn test_lists_and_steps() {
        let expr = CronExpr::parse("0,30 9-17/4 1 1 *").unwrap();
        assert!(expr.matches(Utc.with_ymd_and_hms(2026, 1, 1, 13, 30, 0).unwrap()));
        assert!(!expr.matches(Utc.with_ymd_and_hms(2026, 1, 1, 14, 30, 0).unwrap()));
        assert!(!expr.matches(Utc.with_ymd_and_hms(2026, 1, 2, 13, 30, 0).unwrap()));
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // The 13th, or any Friday.
        let expr = CronExpr::parse("0 0 13 * 5").unwrap();
        let friday_13th = Utc.with_ymd_and_hms(2026, 2, 13, 0, 0, 0).unwrap();
        let friday = Utc.with_ymd_and_hms(2026, 2, 20, 0, 0, 0).unwrap();
        let monday_13th = Utc.with_ymd_and_hms(2026, 4, 13, 0, 0, 0).unwrap();
        let thursday = Utc.with_ymd_and_hms(2026, 2, 19, 0, 0, 0).unwrap();
        assert!(expr.matches(friday_13th));
        assert!(expr.matches(friday));
        assert!(expr.matches(monday_13th));
        assert!(!expr.matches(thursday));

        // An unrestricted day-of-month leaves day-of-week in charge.
        let fridays = CronExpr::parse("0 0 * * 5").unwrap();
        assert!(fridays.matches(friday));
        assert!(!fridays.matches(monday_13th));
    }

    #[test]
    fn test_invalid_expression() {
        assert!(CronExpr::parse("bad").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
        assert!(!is_due("bad", Utc::now()));
    }

    #[test]
    fn test_minute_key() {
        let at = Utc.with_ymd_and_hms(2026, 2, 22, 10, 30, 59).unwrap();
        assert_eq!(minute_key(at), "2026-02-22T10:30");
    }
}
