//! Cron expression parser and evaluator.
//! Supports: "MIN HOUR DOM MON DOW" (5-field) and "SEC MIN HOUR DOM MON DOW" (6-field).
//! Per field: *, N, A-B, */S, A-B/S, N/S and comma lists.
//! Example: "0 8 * * 1-5" = weekdays at 08:00 UTC
//!
//! Names (JAN, MON), L, W, # and ? are not supported.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use tradeflow_core::{Result, TradeflowError};

/// How far ahead `next_after` searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// A parsed cron expression. Evaluated in UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a 5- or 6-field cron expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        let (sec, rest) = match parts.len() {
            5 => ("0", &parts[..]),
            6 => (parts[0], &parts[1..]),
            n => {
                return Err(TradeflowError::Schedule(format!(
                    "invalid cron expression '{expression}': expected 5 or 6 fields, got {n}"
                )));
            }
        };

        let field = |spec: &str, name: &str, min: u32, max: u32| {
            parse_field(spec, min, max).map_err(|reason| {
                TradeflowError::Schedule(format!(
                    "invalid cron expression '{expression}': {name} field '{spec}': {reason}"
                ))
            })
        };

        let mut days_of_week = field(rest[4], "day-of-week", 0, 7)?;
        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: expression.trim().to_string(),
            seconds: field(sec, "second", 0, 59)?,
            minutes: field(rest[0], "minute", 0, 59)?,
            hours: field(rest[1], "hour", 0, 23)?,
            days_of_month: field(rest[2], "day-of-month", 1, 31)?,
            months: field(rest[3], "month", 1, 12)?,
            days_of_week,
            dom_restricted: !rest[2].starts_with('*'),
            dow_restricted: !rest[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_nanosecond(0)? + Duration::seconds(1);
        let horizon = start + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t = start;

        while t <= horizon {
            if !has(self.months, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }
            if !has(self.seconds, t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(Utc.from_utc_datetime(&t));
        }
        None
    }

    /// Upcoming fire times after `after`, at most `count` of them.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Parse a cron expression and compute the next run time.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule.next_after(after),
        Err(e) => {
            tracing::warn!("{e}");
            None
        }
    }
}

fn has(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// Parse a cron field into a bitmask of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> std::result::Result<u64, String> {
    let mut mask = 0u64;

    for part in field.split(',') {
        if part.is_empty() {
            return Err("empty list element".into());
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| format!("bad step '{step}'"))?;
                if step == 0 {
                    return Err("step must be greater than zero".into());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a = parse_value(a, min, max)?;
            let b = parse_value(b, min, max)?;
            if a > b {
                return Err(format!("range {a}-{b} is reversed"));
            }
            (a, b)
        } else {
            let n = parse_value(range, min, max)?;
            // "N/S" means "from N to the end, every S".
            if step.is_some() { (n, max) } else { (n, n) }
        };

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            mask |= 1u64 << v;
        }
    }

    Ok(mask)
}

fn parse_value(s: &str, min: u32, max: u32) -> std::result::Result<u32, String> {
    let n: u32 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if n < min || n > max {
        return Err(format!("{n} is outside {min}-{max}"));
    }
    Ok(n)
}
