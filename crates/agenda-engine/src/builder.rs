//! Simple repeat parameters -> canonical recurrence rule.
//!
//! Clients describe repetition with a frequency, an optional count, optional
//! weekdays and an interval. [`build_rule`] turns that into a
//! [`RecurrenceRule`] anchored on the event's date.

use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{AgendaError, Result};
use crate::rule::{Frequency, RecurrenceRule, RuleEnd};

/// Day numbers at or below this exist in every month.
const ALWAYS_PRESENT_DAY: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatFrequency {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for RepeatFrequency {
    type Err = AgendaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "nenhuma" => Ok(Self::None),
            "daily" | "diario" => Ok(Self::Daily),
            "weekly" | "semanal" => Ok(Self::Weekly),
            "monthly" | "mensal" => Ok(Self::Monthly),
            other => Err(AgendaError::validation(format!(
                "unknown frequency '{other}' (expected none, daily, weekly or monthly)"
            ))),
        }
    }
}

/// The repeat block of a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatSpec {
    #[serde(default)]
    pub frequency: RepeatFrequency,
    /// Total number of occurrences, including the first.
    #[serde(default)]
    pub count: Option<u32>,
    /// 0 = Monday .. 6 = Sunday. Weekly only.
    #[serde(default)]
    pub weekdays: Vec<u8>,
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Inclusive last date. Ignored when `count` is set.
    #[serde(default)]
    pub until: Option<NaiveDate>,
}

fn default_interval() -> u32 {
    1
}

impl RepeatSpec {
    pub fn new(frequency: RepeatFrequency) -> Self {
        Self {
            frequency,
            count: None,
            weekdays: Vec::new(),
            interval: 1,
            until: None,
        }
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn weekdays(mut self, weekdays: impl IntoIterator<Item = u8>) -> Self {
        self.weekdays = weekdays.into_iter().collect();
        self
    }

    pub fn interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn until(mut self, until: NaiveDate) -> Self {
        self.until = Some(until);
        self
    }
}

fn weekday_from_index(index: u8) -> Result<Weekday> {
    match index {
        0 => Ok(Weekday::Mon),
        1 => Ok(Weekday::Tue),
        2 => Ok(Weekday::Wed),
        3 => Ok(Weekday::Thu),
        4 => Ok(Weekday::Fri),
        5 => Ok(Weekday::Sat),
        6 => Ok(Weekday::Sun),
        other => Err(AgendaError::validation(format!(
            "weekday {other} out of range (0 = Monday .. 6 = Sunday)"
        ))),
    }
}

/// Build the rule for a series starting on `start`.
///
/// Returns `Ok(None)` for [`RepeatFrequency::None`]: the event is standalone.
///
/// - `count` wins over `until` when both are given.
/// - Weekly without weekdays repeats on `start`'s weekday.
/// - Monthly anchored on day 29-31 falls back to the month's last day in
///   shorter months (`BYMONTHDAY=28..d;BYSETPOS=-1`).
///
/// # Errors
/// Returns `AgendaError::Validation` for a zero interval or count, weekdays
/// on a non-weekly frequency, an out-of-range weekday, or `until` before
/// `start`.
pub fn build_rule(spec: &RepeatSpec, start: NaiveDate) -> Result<Option<RecurrenceRule>> {
    let frequency = match spec.frequency {
        RepeatFrequency::None => return Ok(None),
        RepeatFrequency::Daily => Frequency::Daily,
        RepeatFrequency::Weekly => Frequency::Weekly,
        RepeatFrequency::Monthly => Frequency::Monthly,
    };

    if spec.interval == 0 {
        return Err(AgendaError::validation("interval must be at least 1"));
    }
    if spec.count == Some(0) {
        return Err(AgendaError::validation("count must be at least 1"));
    }
    if !spec.weekdays.is_empty() && frequency != Frequency::Weekly {
        return Err(AgendaError::validation(
            "weekdays are only allowed on weekly repetition",
        ));
    }

    let mut rule = RecurrenceRule::new(frequency);
    rule.interval = spec.interval;

    let mut days = spec
        .weekdays
        .iter()
        .map(|&i| weekday_from_index(i))
        .collect::<Result<Vec<_>>>()?;
    days.sort_by_key(|d| d.num_days_from_monday());
    days.dedup();
    rule.by_day = days;

    if frequency == Frequency::Monthly && start.day() > ALWAYS_PRESENT_DAY {
        rule.by_month_day = (ALWAYS_PRESENT_DAY..=start.day()).collect();
    }

    rule.end = match (spec.count, spec.until) {
        (Some(n), _) => RuleEnd::Count(n),
        (None, Some(until)) if until < start => {
            return Err(AgendaError::validation(format!(
                "until {until} is before the start date {start}"
            )));
        }
        (None, Some(until)) => RuleEnd::Until(until),
        (None, None) => RuleEnd::Never,
    };

    Ok(Some(rule))
}

/// [`build_rule`] rendered as a rule string.
pub fn build_rule_string(spec: &RepeatSpec, start: NaiveDate) -> Result<Option<String>> {
    Ok(build_rule(spec, start)?.map(|rule| rule.to_string()))
}
