//! Cron expression parsing and evaluation.
//!
//! Supports the standard 5-field format `minute hour day month weekday`
//! plus descriptor aliases (`@hourly`, `@daily`, ...). The evaluator is
//! pure: parsing produces a [`CronSchedule`] and [`CronSchedule::next_after`]
//! computes fire times from it without any shared state.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use thiserror::Error;

/// Scan horizon for `next_after`, in minutes. A little over four years so
/// that schedules landing only on Feb 29 still resolve.
const SCAN_LIMIT_MINUTES: i64 = 4 * 366 * 24 * 60;

/// Parse failure with the position of the offending field (1-based).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("cron expression must have 5 fields, found {0}")]
    FieldCount(usize),

    #[error("unknown cron descriptor {0:?}")]
    UnknownDescriptor(String),

    #[error("invalid {name} field (position {position}): {token:?}")]
    Syntax {
        position: usize,
        name: &'static str,
        token: String,
    },

    #[error("{name} field (position {position}): value {value} out of range {min}-{max}")]
    OutOfRange {
        position: usize,
        name: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// A single parsed field of a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    /// `*` — matches every value.
    Any,
    /// Explicit set of allowed values.
    Set(BTreeSet<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Set(values) => values.contains(&value),
        }
    }

    /// Whether the field constrains anything (`*` does not).
    fn is_restricted(&self) -> bool {
        !matches!(self, Self::Any)
    }
}

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

/// Field metadata: 1-based position, display name, allowed range.
struct FieldSpec {
    position: usize,
    name: &'static str,
    min: u32,
    max: u32,
}

impl CronSchedule {
    /// Parse a cron expression or descriptor alias.
    pub fn parse(expr: &str) -> Result<CronSchedule, ScheduleError> {
        let expr = expr.trim();
        let expr = if let Some(descriptor) = expr.strip_prefix('@') {
            match descriptor {
                "hourly" => "0 * * * *",
                "daily" | "midnight" => "0 0 * * *",
                "weekly" => "0 0 * * 0",
                "monthly" => "0 0 1 * *",
                "yearly" | "annually" => "0 0 1 1 *",
                _ => return Err(ScheduleError::UnknownDescriptor(format!("@{descriptor}"))),
            }
        } else {
            expr
        };

        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ScheduleError::FieldCount(parts.len()));
        }

        Ok(CronSchedule {
            minute: parse_field(
                parts[0],
                &FieldSpec { position: 1, name: "minute", min: 0, max: 59 },
            )?,
            hour: parse_field(
                parts[1],
                &FieldSpec { position: 2, name: "hour", min: 0, max: 23 },
            )?,
            day: parse_field(
                parts[2],
                &FieldSpec { position: 3, name: "day-of-month", min: 1, max: 31 },
            )?,
            month: parse_field(
                parts[3],
                &FieldSpec { position: 4, name: "month", min: 1, max: 12 },
            )?,
            weekday: parse_weekday(parts[4])?,
        })
    }

    /// Check whether the schedule matches the given minute-aligned instant.
    fn matches(&self, time: &DateTime<Utc>) -> bool {
        self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.month.matches(time.month())
            && self.day_matches(time)
    }

    /// Standard cron day rule: when both day-of-month and day-of-week are
    /// restricted, the day matches if either does.
    fn day_matches(&self, time: &DateTime<Utc>) -> bool {
        let dom = self.day.matches(time.day());
        let dow = self
            .weekday
            .matches(time.weekday().num_days_from_sunday());
        if self.day.is_restricted() && self.weekday.is_restricted() {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Return the first instant strictly after `after` matching the schedule,
    /// or `None` when no instant exists within the scan horizon (impossible
    /// dates such as `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut current = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?
            + Duration::minutes(1);
        for _ in 0..SCAN_LIMIT_MINUTES {
            if self.matches(&current) {
                return Some(current);
            }
            current += Duration::minutes(1);
        }
        None
    }
}

/// Parse the weekday field, normalising `7` to Sunday.
fn parse_weekday(field: &str) -> Result<CronField, ScheduleError> {
    let spec = FieldSpec { position: 5, name: "day-of-week", min: 0, max: 7 };
    let parsed = parse_field(field, &spec)?;
    Ok(match parsed {
        CronField::Any => CronField::Any,
        CronField::Set(values) => {
            CronField::Set(values.into_iter().map(|v| v % 7).collect())
        }
    })
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<CronField, ScheduleError> {
    if field == "*" {
        return Ok(CronField::Any);
    }

    let mut values = BTreeSet::new();
    for part in field.split(',') {
        parse_part(part, spec, &mut values)?;
    }
    Ok(CronField::Set(values))
}

/// Parse one comma-separated part: `*`, `*/n`, `a`, `a-b`, `a-b/n`, `a/n`.
fn parse_part(
    part: &str,
    spec: &FieldSpec,
    values: &mut BTreeSet<u32>,
) -> Result<(), ScheduleError> {
    let syntax = || ScheduleError::Syntax {
        position: spec.position,
        name: spec.name,
        token: part.to_string(),
    };

    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step.parse().map_err(|_| syntax())?;
            if step == 0 {
                return Err(syntax());
            }
            (range, step)
        }
        None => (part, 1),
    };

    let (start, end) = if range == "*" {
        (spec.min, spec.max)
    } else if let Some((lo, hi)) = range.split_once('-') {
        let lo: u32 = lo.parse().map_err(|_| syntax())?;
        let hi: u32 = hi.parse().map_err(|_| syntax())?;
        if lo > hi {
            return Err(syntax());
        }
        (lo, hi)
    } else {
        let value: u32 = range.parse().map_err(|_| syntax())?;
        // `a/n` means `a-max/n`, a bare value means just that value.
        if part.contains('/') {
            (value, spec.max)
        } else {
            (value, value)
        }
    };

    for bound in [start, end] {
        if bound < spec.min || bound > spec.max {
            return Err(ScheduleError::OutOfRange {
                position: spec.position,
                name: spec.name,
                value: bound,
                min: spec.min,
                max: spec.max,
            });
        }
    }

    values.extend((start..=end).step_by(step as usize));
    Ok(())
}
