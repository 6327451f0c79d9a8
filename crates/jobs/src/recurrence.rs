//! Timer definitions and the recurrence calculator.
//!
//! A timer is one of:
//!
//! - an absolute date (`2024-05-01T08:00:00Z`), fired once;
//! - an ISO-8601 duration (`PT15M`), fired once after the duration;
//! - a cycle `R[n]/[start/]<duration>[/end]`, fired `n` times (or forever when
//!   `n` is omitted), one Timer record per fire.
//!
//! All computations are pure functions of their inputs: computing the next due
//! time twice from the same state yields the same instant.

use chrono::{DateTime, Months, TimeDelta, Utc};

use crate::calendar::parse_instant;
use crate::error::ConfigError;
use crate::types::Job;

/// Iteration budget of a cycle without an explicit repetition count.
pub const UNBOUNDED: u32 = u32::MAX;

/// An ISO-8601 duration (`PnYnMnWnDTnHnMnS`).
///
/// Years and months are applied with calendar arithmetic, everything else as
/// a fixed span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub millis: u32,
}

impl IsoDuration {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidDuration(text.to_string());

        let rest = text.trim().strip_prefix('P').ok_or_else(invalid)?;
        let (date_part, time_part) = match rest.split_once('T') {
            Some((_, "")) => return Err(invalid()),
            Some((date, time)) => (date, Some(time)),
            None => (rest, None),
        };
        if date_part.is_empty() && time_part.is_none() {
            return Err(invalid());
        }

        let mut duration = IsoDuration::default();

        for (number, unit) in components(date_part, "YMWD").ok_or_else(invalid)? {
            let value: u32 = number.parse().map_err(|_| invalid())?;
            match unit {
                'Y' => duration.years = value,
                'M' => duration.months = value,
                'W' => duration.weeks = value,
                _ => duration.days = value,
            }
        }

        if let Some(time) = time_part {
            for (number, unit) in components(time, "HMS").ok_or_else(invalid)? {
                match unit {
                    'H' => duration.hours = number.parse().map_err(|_| invalid())?,
                    'M' => duration.minutes = number.parse().map_err(|_| invalid())?,
                    _ => {
                        let (seconds, millis) = parse_seconds(number).ok_or_else(invalid)?;
                        duration.seconds = seconds;
                        duration.millis = millis;
                    }
                }
            }
        }

        Ok(duration)
    }

    pub fn is_zero(&self) -> bool {
        *self == IsoDuration::default()
    }

    /// Contains a year or month component.
    pub fn has_calendar_part(&self) -> bool {
        self.years > 0 || self.months > 0
    }

    /// The weeks-and-smaller part as a fixed span.
    pub fn fixed_part(&self) -> Option<TimeDelta> {
        let days = i64::from(self.weeks) * 7 + i64::from(self.days);
        TimeDelta::try_days(days)?
            .checked_add(&TimeDelta::try_hours(i64::from(self.hours))?)?
            .checked_add(&TimeDelta::try_minutes(i64::from(self.minutes))?)?
            .checked_add(&TimeDelta::try_seconds(i64::from(self.seconds))?)?
            .checked_add(&TimeDelta::try_milliseconds(i64::from(self.millis))?)
    }

    pub fn add_to(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
        self.add_times(at, 1)
    }

    /// `at + times * self`. The month part is applied as a single calendar
    /// step, so repeated month-end clamping does not drift the day.
    pub fn add_times(&self, at: DateTime<Utc>, times: u32) -> Result<DateTime<Utc>, ConfigError> {
        let overflow = || ConfigError::InvalidDuration(self.to_string());

        let mut result = at;
        if self.has_calendar_part() {
            let months = self
                .years
                .checked_mul(12)
                .and_then(|m| m.checked_add(self.months))
                .and_then(|m| m.checked_mul(times))
                .ok_or_else(overflow)?;
            result = result
                .checked_add_months(Months::new(months))
                .ok_or_else(overflow)?;
        }
        let fixed = i32::try_from(times)
            .ok()
            .and_then(|times| self.fixed_part()?.checked_mul(times))
            .ok_or_else(overflow)?;
        result.checked_add_signed(fixed).ok_or_else(overflow)
    }
}

impl std::fmt::Display for IsoDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P")?;
        for (value, unit) in [
            (self.years, 'Y'),
            (self.months, 'M'),
            (self.weeks, 'W'),
            (self.days, 'D'),
        ] {
            if value > 0 {
                write!(f, "{value}{unit}")?;
            }
        }
        if self.hours > 0 || self.minutes > 0 || self.seconds > 0 || self.millis > 0 {
            write!(f, "T")?;
            if self.hours > 0 {
                write!(f, "{}H", self.hours)?;
            }
            if self.minutes > 0 {
                write!(f, "{}M", self.minutes)?;
            }
            if self.millis > 0 {
                write!(f, "{}.{:03}S", self.seconds, self.millis)?;
            } else if self.seconds > 0 {
                write!(f, "{}S", self.seconds)?;
            }
        } else if self.is_zero() {
            write!(f, "T0S")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for IsoDuration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IsoDuration::parse(s)
    }
}

/// Split `3Y2M` into `[("3", 'Y'), ("2", 'M')]`, enforcing `order`.
fn components<'a>(part: &'a str, order: &str) -> Option<Vec<(&'a str, char)>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut last_rank: Option<usize> = None;

    for (idx, ch) in part.char_indices() {
        if ch.is_ascii_digit() || ch == '.' || ch == ',' {
            continue;
        }
        let rank = order.find(ch)?;
        if last_rank.is_some_and(|last| rank <= last) {
            return None;
        }
        let number = &part[start..idx];
        if number.is_empty() {
            return None;
        }
        // Only seconds may carry a fraction.
        if ch != 'S' && number.contains(['.', ',']) {
            return None;
        }
        out.push((number, ch));
        last_rank = Some(rank);
        start = idx + ch.len_utf8();
    }

    if start != part.len() {
        return None;
    }
    Some(out)
}

fn parse_seconds(number: &str) -> Option<(u32, u32)> {
    let normalized = number.replace(',', ".");
    match normalized.split_once('.') {
        None => Some((normalized.parse().ok()?, 0)),
        Some((whole, fraction)) => {
            if whole.is_empty() || fraction.is_empty() || !fraction.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let mut millis = String::from(&fraction[..fraction.len().min(3)]);
            while millis.len() < 3 {
                millis.push('0');
            }
            Some((whole.parse().ok()?, millis.parse().ok()?))
        }
    }
}

/// A parsed timer definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerSpec {
    Date(DateTime<Utc>),
    Duration(IsoDuration),
    Cycle(Recurrence),
}

impl TimerSpec {
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let expression = expression.trim();
        if expression.starts_with('R') {
            Ok(TimerSpec::Cycle(Recurrence::parse(expression)?))
        } else if expression.starts_with('P') {
            Ok(TimerSpec::Duration(IsoDuration::parse(expression)?))
        } else {
            Ok(TimerSpec::Date(parse_instant(expression)?))
        }
    }

    /// First instant at which a timer created at `now` fires.
    pub fn first_due_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
        match self {
            TimerSpec::Date(at) => Ok(*at),
            TimerSpec::Duration(duration) => duration.add_to(now),
            TimerSpec::Cycle(recurrence) => recurrence.first_due_time(now),
        }
    }
}

/// A repeating interval: `R[n]/[start/]<duration>[/end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recurrence {
    expression: String,
    max_iterations: u32,
    start: Option<DateTime<Utc>>,
    period: IsoDuration,
    end: Option<DateTime<Utc>>,
}

impl Recurrence {
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let expression = expression.trim();
        let parts: Vec<&str> = expression.split('/').collect();

        let count = parts[0]
            .strip_prefix('R')
            .ok_or_else(|| ConfigError::repeat(expression, "must start with 'R'"))?;
        let repetitions = if count.is_empty() {
            None
        } else {
            let n: u32 = count
                .parse()
                .map_err(|_| ConfigError::repeat(expression, "repetition count is not a number"))?;
            if n == 0 {
                return Err(ConfigError::repeat(expression, "repetition count must be at least 1"));
            }
            Some(n)
        };

        let (start, period, end) = match &parts[1..] {
            [period] => (None, IsoDuration::parse(period)?, None),
            [first, second] if first.starts_with('P') => {
                (None, IsoDuration::parse(first)?, Some(parse_instant(second)?))
            }
            [first, second] => (Some(parse_instant(first)?), IsoDuration::parse(second)?, None),
            [] => return Err(ConfigError::repeat(expression, "missing interval")),
            _ => return Err(ConfigError::repeat(expression, "too many segments")),
        };

        if period.is_zero() {
            return Err(ConfigError::repeat(expression, "interval must be positive"));
        }

        Ok(Self {
            expression: expression.to_string(),
            max_iterations: max_iterations_for(repetitions),
            start,
            period,
            end,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Total fires of the cycle, [`UNBOUNDED`] when no count was given.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn period(&self) -> IsoDuration {
        self.period
    }

    /// End instant embedded in the expression, if any.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn first_due_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
        match self.start {
            Some(start) if start > now => Ok(start),
            Some(start) => self.next_due_time(start, now),
            None => self.period.add_to(now),
        }
    }

    /// Smallest `last_fire + k * period` (k >= 1) strictly after `now`.
    ///
    /// Fires missed while no node was running are skipped rather than
    /// replayed, and do not consume iterations.
    pub fn next_due_time(
        &self,
        last_fire: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ConfigError> {
        let next = self.period.add_to(last_fire)?;
        if next > now {
            return Ok(next);
        }

        if !self.period.has_calendar_part() {
            let overflow = || ConfigError::InvalidDuration(self.period.to_string());
            let step_ms = self.period.fixed_part().ok_or_else(overflow)?.num_milliseconds();
            let behind_ms = (now - next).num_milliseconds();
            let steps = behind_ms / step_ms + 1;
            let jump = steps
                .checked_mul(step_ms)
                .and_then(TimeDelta::try_milliseconds)
                .ok_or_else(overflow)?;
            return next.checked_add_signed(jump).ok_or_else(overflow);
        }

        // `last_fire + k * period` grows with k: find a k past `now` by
        // doubling, then bisect down to the smallest one.
        let overflow = || ConfigError::InvalidDuration(self.period.to_string());
        let (mut behind, mut ahead) = (1u32, 2u32);
        while self.period.add_times(last_fire, ahead)? <= now {
            behind = ahead;
            ahead = ahead.checked_mul(2).ok_or_else(overflow)?;
        }
        while ahead - behind > 1 {
            let mid = behind + (ahead - behind) / 2;
            if self.period.add_times(last_fire, mid)? > now {
                ahead = mid;
            } else {
                behind = mid;
            }
        }
        self.period.add_times(last_fire, ahead)
    }
}

/// Iteration budget for an optional repetition count.
pub fn max_iterations_for(repetitions: Option<u32>) -> u32 {
    repetitions.unwrap_or(UNBOUNDED)
}

/// Fires left after the current one.
pub fn remaining_iterations(max_iterations: u32) -> u32 {
    if max_iterations == UNBOUNDED {
        UNBOUNDED
    } else {
        max_iterations.saturating_sub(1)
    }
}

/// A fire at or after the end date must not happen.
pub fn is_expired(candidate: DateTime<Utc>, end_date: Option<DateTime<Utc>>) -> bool {
    end_date.is_some_and(|end| candidate >= end)
}

/// `nextDueTime(lastFireTime, intervalExpr)` for callers holding only the expression.
pub fn next_due_time(
    last_fire: DateTime<Utc>,
    interval_expression: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ConfigError> {
    Recurrence::parse(interval_expression)?.next_due_time(last_fire, now)
}

/// Where the next Timer record of a recurring job lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextCycle {
    pub due: DateTime<Utc>,
    pub max_iterations: u32,
}

/// Decide whether a recurring job that just fired gets another cycle.
///
/// Returns `None` for non-recurring jobs, exhausted budgets and cycles whose
/// next fire would be at or after the end date.
pub fn next_cycle(job: &Job, now: DateTime<Utc>) -> Result<Option<NextCycle>, ConfigError> {
    let Some(expression) = job.repeat.as_deref() else {
        return Ok(None);
    };
    let recurrence = Recurrence::parse(expression)?;

    let current = job.max_iterations.unwrap_or(recurrence.max_iterations());
    let remaining = remaining_iterations(current);
    if remaining == 0 {
        return Ok(None);
    }

    let last_fire = job.due_time.unwrap_or(now);
    let due = recurrence.next_due_time(last_fire, now)?;
    if is_expired(due, job.end_date.or(recurrence.end())) {
        return Ok(None);
    }

    Ok(Some(NextCycle {
        due,
        max_iterations: remaining,
    }))
}
