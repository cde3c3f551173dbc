//! Recurrence rule strings: parsing, canonical formatting and truncation.
//!
//! The engine's own grammar is a subset of RFC 5545 RRULE:
//!
//! ```text
//! FREQ=DAILY|WEEKLY|MONTHLY[;INTERVAL=n][;BYDAY=MO,..][;BYMONTHDAY=d,..;BYSETPOS=-1][;COUNT=n|;UNTIL=YYYYMMDD]
//! ```
//!
//! `BYDAY` is only canonical on weekly rules and `BYMONTHDAY` only on monthly
//! rules together with `BYSETPOS=-1` ("the last listed day that exists in
//! the month"). Anything else that is still a well-formed RRULE is kept as an
//! [`ExtendedRule`] and expanded by the `rrule` crate.

use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate, Weekday};

use crate::error::{AgendaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
        }
    }
}

/// How a series ends. `COUNT` and `UNTIL` never coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleEnd {
    Never,
    Count(u32),
    /// Inclusive last date.
    Until(NaiveDate),
}

/// A rule in the canonical subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    /// Weekly only. Sorted Monday-first, no duplicates. Empty means "the
    /// anchor's weekday".
    pub by_day: Vec<Weekday>,
    /// Monthly only. Sorted ascending; implies `BYSETPOS=-1`.
    pub by_month_day: Vec<u32>,
    pub end: RuleEnd,
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            by_day: Vec::new(),
            by_month_day: Vec::new(),
            end: RuleEnd::Never,
        }
    }

    pub fn is_bounded(&self) -> bool {
        !matches!(self.end, RuleEnd::Never)
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FREQ={}", self.frequency.as_str())?;
        if self.interval > 1 {
            write!(f, ";INTERVAL={}", self.interval)?;
        }
        if !self.by_day.is_empty() {
            let days: Vec<&str> = self.by_day.iter().map(|d| weekday_code(*d)).collect();
            write!(f, ";BYDAY={}", days.join(","))?;
        }
        if !self.by_month_day.is_empty() {
            let days: Vec<String> = self.by_month_day.iter().map(u32::to_string).collect();
            write!(f, ";BYMONTHDAY={};BYSETPOS=-1", days.join(","))?;
        }
        match self.end {
            RuleEnd::Never => Ok(()),
            RuleEnd::Count(n) => write!(f, ";COUNT={n}"),
            RuleEnd::Until(date) => write!(f, ";UNTIL={}", date.format("%Y%m%d")),
        }
    }
}

/// A well-formed RRULE outside the canonical subset.
///
/// `UNTIL` is lifted out of the term list and applied by the engine as an
/// inclusive date bound; every other term is handed to the `rrule` crate
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRule {
    pub terms: Vec<(String, String)>,
    pub until: Option<NaiveDate>,
}

impl ExtendedRule {
    pub fn count(&self) -> Option<u32> {
        self.terms
            .iter()
            .find(|(k, _)| k == "COUNT")
            .and_then(|(_, v)| v.parse().ok())
    }

    /// The `RRULE` body without `UNTIL`.
    pub fn rrule_body(&self) -> String {
        self.terms
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl fmt::Display for ExtendedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rrule_body())?;
        if let Some(until) = self.until {
            write!(f, ";UNTIL={}", until.format("%Y%m%d"))?;
        }
        Ok(())
    }
}

/// A parsed rule string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    Canonical(RecurrenceRule),
    Extended(ExtendedRule),
}

impl Recurrence {
    /// Last date the rule may produce, if it has an `UNTIL`.
    pub fn until(&self) -> Option<NaiveDate> {
        match self {
            Self::Canonical(rule) => match rule.end {
                RuleEnd::Until(date) => Some(date),
                _ => None,
            },
            Self::Extended(rule) => rule.until,
        }
    }

    pub fn count(&self) -> Option<u32> {
        match self {
            Self::Canonical(rule) => match rule.end {
                RuleEnd::Count(n) => Some(n),
                _ => None,
            },
            Self::Extended(rule) => rule.count(),
        }
    }

    /// End the series on the day before `date`. Any `COUNT` is replaced by
    /// the date bound; an earlier existing `UNTIL` is kept.
    pub fn truncated_before(&self, date: NaiveDate) -> Result<Self> {
        let last = date
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| AgendaError::validation(format!("cannot truncate before {date}")))?;
        let last = self.until().map_or(last, |until| until.min(last));

        Ok(match self {
            Self::Canonical(rule) => Self::Canonical(RecurrenceRule {
                end: RuleEnd::Until(last),
                ..rule.clone()
            }),
            Self::Extended(rule) => Self::Extended(ExtendedRule {
                terms: rule.terms.iter().filter(|(k, _)| k != "COUNT").cloned().collect(),
                until: Some(last),
            }),
        })
    }

    /// Same cadence with a new ending: the original `UNTIL` survives, a
    /// `COUNT` is replaced by `remaining`.
    pub fn continued(&self, remaining: Option<u32>) -> Self {
        match self {
            Self::Canonical(rule) => {
                let end = match (rule.end, remaining) {
                    (RuleEnd::Count(_), Some(n)) => RuleEnd::Count(n),
                    (end, _) => end,
                };
                Self::Canonical(RecurrenceRule {
                    end,
                    ..rule.clone()
                })
            }
            Self::Extended(rule) => {
                let terms = rule
                    .terms
                    .iter()
                    .map(|(k, v)| match (k.as_str(), remaining) {
                        ("COUNT", Some(n)) => (k.clone(), n.to_string()),
                        _ => (k.clone(), v.clone()),
                    })
                    .collect();
                Self::Extended(ExtendedRule {
                    terms,
                    until: rule.until,
                })
            }
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canonical(rule) => fmt::Display::fmt(rule, f),
            Self::Extended(rule) => fmt::Display::fmt(rule, f),
        }
    }
}

impl FromStr for Recurrence {
    type Err = AgendaError;

    fn from_str(s: &str) -> Result<Self> {
        let terms = split_terms(s)?;
        match canonical_from_terms(&terms)? {
            Some(rule) => Ok(Self::Canonical(rule)),
            None => extended_from_terms(terms).map(Self::Extended),
        }
    }
}

impl FromStr for RecurrenceRule {
    type Err = AgendaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.parse::<Recurrence>()? {
            Recurrence::Canonical(rule) => Ok(rule),
            Recurrence::Extended(_) => Err(AgendaError::InvalidRule(format!(
                "'{s}' is outside the supported subset"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Term parsing
// ---------------------------------------------------------------------------

fn invalid(msg: impl Into<String>) -> AgendaError {
    AgendaError::InvalidRule(msg.into())
}

fn split_terms(raw: &str) -> Result<Vec<(String, String)>> {
    let body = raw.trim();
    let body = body
        .strip_prefix("RRULE:")
        .or_else(|| body.strip_prefix("rrule:"))
        .unwrap_or(body);
    if body.is_empty() {
        return Err(invalid("empty RRULE string"));
    }

    let mut terms: Vec<(String, String)> = Vec::new();
    for part in body.split(';').filter(|p| !p.trim().is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| invalid(format!("term '{part}' is not KEY=VALUE")))?;
        let key = key.trim().to_uppercase();
        let value = value.trim().to_uppercase();
        if key.is_empty() || value.is_empty() {
            return Err(invalid(format!("term '{part}' is not KEY=VALUE")));
        }
        if terms.iter().any(|(k, _)| *k == key) {
            return Err(invalid(format!("duplicate {key} term")));
        }
        terms.push((key, value));
    }

    if !terms.iter().any(|(k, _)| k == "FREQ") {
        return Err(invalid("missing FREQ"));
    }
    let has_count = terms.iter().any(|(k, _)| k == "COUNT");
    let has_until = terms.iter().any(|(k, _)| k == "UNTIL");
    if has_count && has_until {
        return Err(invalid("COUNT and UNTIL are mutually exclusive"));
    }
    Ok(terms)
}

fn term<'a>(terms: &'a [(String, String)], key: &str) -> Option<&'a str> {
    terms
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Returns `Ok(None)` when the terms are valid but not canonical.
fn canonical_from_terms(terms: &[(String, String)]) -> Result<Option<RecurrenceRule>> {
    const KNOWN: [&str; 7] = [
        "FREQ",
        "INTERVAL",
        "BYDAY",
        "BYMONTHDAY",
        "BYSETPOS",
        "COUNT",
        "UNTIL",
    ];
    if terms.iter().any(|(k, _)| !KNOWN.contains(&k.as_str())) {
        return Ok(None);
    }

    let frequency = match term(terms, "FREQ") {
        Some("DAILY") => Frequency::Daily,
        Some("WEEKLY") => Frequency::Weekly,
        Some("MONTHLY") => Frequency::Monthly,
        _ => return Ok(None),
    };

    let mut rule = RecurrenceRule::new(frequency);

    if let Some(raw) = term(terms, "INTERVAL") {
        rule.interval = parse_positive(raw, "INTERVAL")?;
    }

    if let Some(raw) = term(terms, "BYDAY") {
        if frequency != Frequency::Weekly {
            return Ok(None);
        }
        let mut days = Vec::new();
        for code in raw.split(',') {
            match parse_weekday(code.trim()) {
                Some(day) => days.push(day),
                // Ordinal forms like "1MO" or "-1FR".
                None if code.trim().len() > 2 => return Ok(None),
                None => return Err(invalid(format!("unknown weekday '{code}'"))),
            }
        }
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        rule.by_day = days;
    }

    match (term(terms, "BYMONTHDAY"), term(terms, "BYSETPOS")) {
        (None, None) => {}
        (Some(raw), Some("-1")) if frequency == Frequency::Monthly => {
            let mut days = Vec::new();
            for part in raw.split(',') {
                match part.trim().parse::<u32>() {
                    Ok(day) if (1..=31).contains(&day) => days.push(day),
                    _ => return Ok(None),
                }
            }
            days.sort_unstable();
            days.dedup();
            rule.by_month_day = days;
        }
        _ => return Ok(None),
    }

    if let Some(raw) = term(terms, "COUNT") {
        rule.end = RuleEnd::Count(parse_positive(raw, "COUNT")?);
    }
    if let Some(raw) = term(terms, "UNTIL") {
        rule.end = RuleEnd::Until(parse_until(raw)?);
    }

    Ok(Some(rule))
}

fn extended_from_terms(terms: Vec<(String, String)>) -> Result<ExtendedRule> {
    // Occurrences are identified by date, so sub-daily rules cannot be addressed.
    match term(&terms, "FREQ") {
        Some("DAILY" | "WEEKLY" | "MONTHLY" | "YEARLY") => {}
        Some(other) => return Err(invalid(format!("unsupported FREQ '{other}'"))),
        None => return Err(invalid("missing FREQ")),
    }

    let mut until = None;
    let mut kept = Vec::with_capacity(terms.len());
    for (key, value) in terms {
        match key.as_str() {
            "UNTIL" => until = Some(parse_until(&value)?),
            "COUNT" | "INTERVAL" => {
                parse_positive(&value, &key)?;
                kept.push((key, value));
            }
            _ => kept.push((key, value)),
        }
    }
    Ok(ExtendedRule { terms: kept, until })
}

fn parse_positive(raw: &str, key: &str) -> Result<u32> {
    match raw.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(format!("{key} must be a positive integer, got '{raw}'"))),
    }
}

/// `YYYYMMDD`, optionally followed by `THHMMSS[Z]`; only the date is kept.
fn parse_until(raw: &str) -> Result<NaiveDate> {
    let date_part = raw.split('T').next().unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y%m%d")
        .map_err(|_| invalid(format!("UNTIL '{raw}' is not YYYYMMDD")))
}

pub(crate) fn parse_weekday(code: &str) -> Option<Weekday> {
    match code {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

pub(crate) fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}
