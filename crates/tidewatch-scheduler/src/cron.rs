//! Five-field cron evaluator: "MIN HOUR DOM MON DOW" (no seconds, UTC).
//!
//! Each field accepts `*`, `N`, `A-B`, `*/S`, `A-B/S`, `A/S` and comma lists
//! of those. Months and weekdays also accept three-letter names
//! (`JAN`..`DEC`, `SUN`..`SAT`); weekday `7` is Sunday. As in classic cron,
//! when both day-of-month and day-of-week are restricted a day matching
//! either one fires.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use tidewatch_core::error::{Result, TidewatchError};

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// How far ahead the evaluator searches before declaring an expression dead.
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// A validated cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parse and validate. Fails with `ScheduleConfig` on any syntax or range
    /// error, and on expressions that can never fire (e.g. `0 0 30 2 *`).
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(config_err(
                expression,
                "need 5 fields: MIN HOUR DOM MON DOW",
            ));
        }

        let minutes = parse_field(parts[0], 0, 59, None).map_err(|e| config_err(expression, &e))?;
        let hours = parse_field(parts[1], 0, 23, None).map_err(|e| config_err(expression, &e))?;
        let days_of_month =
            parse_field(parts[2], 1, 31, None).map_err(|e| config_err(expression, &e))?;
        let months = parse_field(parts[3], 1, 12, Some((&MONTH_NAMES, 1)))
            .map_err(|e| config_err(expression, &e))?;
        let mut days_of_week = parse_field(parts[4], 0, 7, Some((&WEEKDAY_NAMES, 0)))
            .map_err(|e| config_err(expression, &e))?;
        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        let expr = Self {
            source: expression.trim().to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        };

        let sample = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single();
        if let Some(sample) = sample
            && expr.next_after(sample).is_none()
        {
            return Err(config_err(expression, "expression never fires"));
        }
        Ok(expr)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Earliest minute boundary `>= after` matching every field.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = ceil_to_minute(after)?;
        let limit = after + Duration::days(SEARCH_HORIZON_DAYS);

        while candidate <= limit {
            if !bit(self.months, candidate.month()) {
                candidate = start_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate) {
                candidate = start_of_next_day(candidate)?;
                continue;
            }
            if !bit(self.hours, candidate.hour()) {
                candidate = start_of_next_hour(candidate)?;
                continue;
            }
            if !bit(self.minutes, candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        let dom = bit(self.days_of_month, at.day());
        let dow = bit(self.days_of_week, at.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

/// Compute the next run time for an expression (parse + evaluate).
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let expr = CronExpr::parse(expression)?;
    expr.next_after(after)
        .ok_or_else(|| config_err(expression, "no upcoming run time"))
}

/// Parse one cron field into a bitmask of matching values.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> std::result::Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(format!("empty list element in '{field}'"));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in '{field}'"))?;
                if step == 0 {
                    return Err(format!("step must be > 0 in '{field}'"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names)?, parse_value(b, names)?)
        } else {
            let v = parse_value(range, names)?;
            // "A/S" means "from A to the end, every S".
            if step.is_some() { (v, max) } else { (v, v) }
        };

        if start < min || end > max || start > end {
            return Err(format!(
                "'{part}' out of range {min}-{max}"
            ));
        }

        let step = step.unwrap_or(1) as usize;
        for v in (start..=end).step_by(step) {
            mask |= 1 << v;
        }
    }
    Ok(mask)
}

fn parse_value(token: &str, names: Option<(&[&str], u32)>) -> std::result::Result<u32, String> {
    let token = token.trim();
    if let Ok(n) = token.parse::<u32>() {
        return Ok(n);
    }
    if let Some((names, offset)) = names {
        let upper = token.to_ascii_uppercase();
        if let Some(idx) = names.iter().position(|n| *n == upper) {
            return Ok(idx as u32 + offset);
        }
    }
    Err(format!("invalid value '{token}'"))
}

fn config_err(expression: &str, reason: &str) -> TidewatchError {
    TidewatchError::ScheduleConfig(format!("invalid cron expression '{expression}': {reason}"))
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1 << value) != 0
}

fn ceil_to_minute(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let ms = at.timestamp_millis();
    let floored = ms - ms.rem_euclid(60_000);
    let ceiled = if floored < ms { floored + 60_000 } else { floored };
    DateTime::<Utc>::from_timestamp_millis(ceiled)
}

fn start_of_next_hour(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let ms = at.timestamp_millis();
    DateTime::<Utc>::from_timestamp_millis(ms - ms.rem_euclid(3_600_000) + 3_600_000)
}

fn start_of_next_day(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = at.date_naive().succ_opt()?;
    Some(Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_every_hour() {
        let next = next_run_from_cron("0 * * * *", at(2026, 2, 22, 10, 30, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 11, 0, 0));
    }

    #[test]
    fn test_specific_time() {
        let next = next_run_from_cron("0 8 * * *", at(2026, 2, 22, 7, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 8, 0, 0));
    }

    #[test]
    fn test_every_15_minutes() {
        let next = next_run_from_cron("*/15 * * * *", at(2026, 2, 22, 10, 2, 0)).unwrap();
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn test_matching_instant_is_returned() {
        // next_after is ">=": an exact boundary match returns itself.
        let exact = at(2026, 2, 22, 8, 0, 0);
        assert_eq!(next_run_from_cron("0 8 * * *", exact).unwrap(), exact);
        // A few seconds in rounds up to the following match.
        let later = at(2026, 2, 22, 8, 0, 5);
        assert_eq!(
            next_run_from_cron("0 8 * * *", later).unwrap(),
            at(2026, 2, 23, 8, 0, 0)
        );
    }

    #[test]
    fn test_day_of_week_names_and_ranges() {
        // 2026-02-22 is a Sunday.
        let next = next_run_from_cron("30 9 * * MON-FRI", at(2026, 2, 22, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 23, 9, 30, 0));
        let sunday = next_run_from_cron("0 0 * * 7", at(2026, 2, 23, 0, 0, 0)).unwrap();
        assert_eq!(sunday, at(2026, 3, 1, 0, 0, 0));
    }

    #[test]
    fn test_month_and_day_of_month() {
        let next = next_run_from_cron("0 6 1 JAN,jul *", at(2026, 2, 22, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 7, 1, 6, 0, 0));
        let leap = next_run_from_cron("0 0 29 2 *", at(2026, 3, 1, 0, 0, 0)).unwrap();
        assert_eq!(leap, at(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn test_dom_or_dow_when_both_restricted() {
        // 13th of the month OR any Friday. 2026-02-22 is a Sunday; next Friday is the 27th,
        // but March 13th is also a Friday; first match is Feb 27.
        let next = next_run_from_cron("0 0 13 * 5", at(2026, 2, 22, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 27, 0, 0, 0));
    }

    #[test]
    fn test_invalid_expression() {
        assert!(matches!(
            CronExpr::parse("bad"),
            Err(TidewatchError::ScheduleConfig(_))
        ));
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("0 0 * FOO *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
        assert!(CronExpr::parse("0 0 30 2 *").is_err());
    }
}
