//! Series expansion -- turns a master event's rule into concrete occurrences
//! inside a caller-supplied date window.
//!
//! Canonical rules are generated arithmetically: the generator seeks straight
//! to the first period (day, ISO week or month) touching the window and
//! derives the occurrence index needed for `COUNT` without walking the
//! series from its anchor. Extended rules are handed to the `rrule` crate.
//!
//! Expansion is pure. The same master, exceptions and window always yield
//! the same occurrences, so `[a, c]` equals the union of `[a, b]` and
//! `[b, c]`.

use std::collections::HashMap;

use chrono::{
    Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Weekday,
};
use chrono_tz::Tz;
use rrule::RRuleSet;
use serde::Serialize;

use crate::error::{AgendaError, Result};
use crate::model::{overlay, EventFields, EventId, Exception, MasterEvent, PatientId, TenantId};
use crate::reference::EventRef;
use crate::rule::{ExtendedRule, Frequency, Recurrence, RecurrenceRule, RuleEnd};

/// An inclusive `[start, end]` window of dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// # Errors
    /// Returns `AgendaError::Validation` if `end` is before `start`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(AgendaError::validation(format!(
                "range end {end} is before range start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse two ISO `YYYY-MM-DD` bounds. Both are required.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self> {
        let (Some(start), Some(end)) = (start, end) else {
            return Err(AgendaError::validation(
                "both start and end are required (YYYY-MM-DD)",
            ));
        };
        Self::new(parse_iso_date(start)?, parse_iso_date(end)?)
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Number of days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

pub fn parse_iso_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AgendaError::validation(format!("invalid date '{raw}', use YYYY-MM-DD")))
}

/// One resolved occurrence, either a standalone event or an expanded
/// member of a series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Occurrence {
    pub id: EventRef,
    /// The series this occurrence belongs to, if any.
    pub master_id: Option<EventId>,
    pub tenant: TenantId,
    pub patient: Option<PatientId>,
    #[serde(flatten)]
    pub fields: EventFields,
    pub rule: Option<String>,
    pub is_recurrence: bool,
}

impl Occurrence {
    pub fn standalone(event: &MasterEvent) -> Self {
        Self {
            id: EventRef::Real(event.id),
            master_id: None,
            tenant: event.tenant,
            patient: event.patient,
            fields: event.fields.clone(),
            rule: None,
            is_recurrence: false,
        }
    }

    /// Ordering used for merged listings: date, start time, then identity.
    pub fn sort_key(&self) -> (NaiveDate, NaiveTime, EventRef) {
        (self.fields.date, self.fields.start_time, self.id)
    }
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Expand a master event over `range`, applying exclusions and exception
/// overlays.
///
/// Candidates are selected by the date the rule generates; an exception
/// that moves its occurrence keeps it in the window of its generated date.
/// Standalone events (no rule) produce nothing here.
///
/// # Errors
/// Returns `AgendaError::InvalidRule` if the stored rule cannot be parsed or
/// expanded.
pub fn expand(
    master: &MasterEvent,
    exceptions: &[Exception],
    range: DateRange,
    tz: Tz,
) -> Result<Vec<Occurrence>> {
    let Some(raw) = master.rule.as_deref() else {
        return Ok(Vec::new());
    };
    let rule: Recurrence = raw.parse()?;

    let overrides: HashMap<NaiveDate, &Exception> = exceptions
        .iter()
        .filter(|ex| ex.master_id == master.id)
        .map(|ex| (ex.recurrence_id, ex))
        .collect();

    let dates = occurrence_dates(
        &rule,
        master.fields.date,
        master.fields.start_time,
        range,
        tz,
    )?;

    let occurrences: Vec<Occurrence> = dates
        .into_iter()
        .filter(|date| !master.is_excluded(*date))
        .map(|date| {
            let base = EventFields {
                date,
                ..master.fields.clone()
            };
            let fields = match overrides.get(&date) {
                Some(ex) => overlay(&base, &ex.patch),
                None => base,
            };
            Occurrence {
                id: EventRef::virtual_occurrence(master.id, date),
                master_id: Some(master.id),
                tenant: master.tenant,
                patient: master.patient,
                fields,
                rule: Some(raw.to_string()),
                is_recurrence: true,
            }
        })
        .collect();

    tracing::debug!(
        master = %master.id,
        start = %range.start,
        end = %range.end,
        count = occurrences.len(),
        "expanded series"
    );

    Ok(occurrences)
}

/// Dates the rule generates inside `range`, ascending, before exclusions.
///
/// `start_time` only matters for extended rules, which the `rrule` crate
/// evaluates as local date-times in `tz`.
pub fn occurrence_dates(
    rule: &Recurrence,
    anchor: NaiveDate,
    start_time: NaiveTime,
    range: DateRange,
    tz: Tz,
) -> Result<Vec<NaiveDate>> {
    match rule {
        Recurrence::Canonical(rule) => Ok(CanonicalSeries::new(rule, anchor).dates_in(range)),
        Recurrence::Extended(rule) => extended_dates(rule, anchor, start_time, range, tz),
    }
}

/// Whether the rule generates `date` (exclusions are not consulted).
pub fn occurs_on(
    rule: &Recurrence,
    anchor: NaiveDate,
    start_time: NaiveTime,
    date: NaiveDate,
    tz: Tz,
) -> Result<bool> {
    Ok(occurrence_dates(rule, anchor, start_time, DateRange::single(date), tz)?.contains(&date))
}

/// How many occurrences the rule generates strictly before `date`.
pub fn count_before(
    rule: &Recurrence,
    anchor: NaiveDate,
    start_time: NaiveTime,
    date: NaiveDate,
    tz: Tz,
) -> Result<u64> {
    if date <= anchor {
        return Ok(0);
    }
    match rule {
        Recurrence::Canonical(rule) => Ok(CanonicalSeries::new(rule, anchor).count_before(date)),
        Recurrence::Extended(rule) => {
            let last = date.pred_opt().unwrap_or(date);
            let range = DateRange::new(anchor, last)?;
            Ok(extended_dates(rule, anchor, start_time, range, tz)?.len() as u64)
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical generator
// ---------------------------------------------------------------------------

/// A canonical rule bound to its anchor date. Period `k` is the `k`-th
/// interval step: a day, an ISO week (Monday first) or a month.
struct CanonicalSeries<'a> {
    rule: &'a RecurrenceRule,
    anchor: NaiveDate,
    interval: u64,
}

impl<'a> CanonicalSeries<'a> {
    fn new(rule: &'a RecurrenceRule, anchor: NaiveDate) -> Self {
        Self {
            rule,
            anchor,
            interval: u64::from(rule.interval.max(1)),
        }
    }

    fn weekdays(&self) -> Vec<Weekday> {
        if self.rule.by_day.is_empty() {
            vec![self.anchor.weekday()]
        } else {
            self.rule.by_day.clone()
        }
    }

    fn anchor_week(&self) -> NaiveDate {
        self.anchor - Days::new(u64::from(self.anchor.weekday().num_days_from_monday()))
    }

    /// First day of period `k`; every date of the period is on or after it.
    fn period_start(&self, k: u64) -> Option<NaiveDate> {
        let step = k.checked_mul(self.interval)?;
        match self.rule.frequency {
            Frequency::Daily => self.anchor.checked_add_days(Days::new(step)),
            Frequency::Weekly => self
                .anchor_week()
                .checked_add_days(Days::new(step.checked_mul(7)?)),
            Frequency::Monthly => self
                .anchor
                .with_day(1)?
                .checked_add_months(Months::new(u32::try_from(step).ok()?)),
        }
    }

    /// Dates generated in period `k`, ascending, never before the anchor.
    fn period_dates(&self, k: u64) -> Vec<NaiveDate> {
        let Some(start) = self.period_start(k) else {
            return Vec::new();
        };
        let mut dates = match self.rule.frequency {
            Frequency::Daily => vec![start],
            Frequency::Weekly => self
                .weekdays()
                .into_iter()
                .filter_map(|d| {
                    start.checked_add_days(Days::new(u64::from(d.num_days_from_monday())))
                })
                .collect(),
            Frequency::Monthly => self.month_date(start).into_iter().collect(),
        };
        dates.retain(|d| *d >= self.anchor);
        dates
    }

    /// The single date a monthly rule produces in the month starting at
    /// `first`, if any.
    fn month_date(&self, first: NaiveDate) -> Option<NaiveDate> {
        if self.rule.by_month_day.is_empty() {
            // RFC 5545: months without the anchor's day are skipped.
            return first.with_day(self.anchor.day());
        }
        let last_day = days_in_month(first);
        let day = self
            .rule
            .by_month_day
            .iter()
            .rev()
            .find(|d| **d <= last_day)?;
        first.with_day(*day)
    }

    /// Smallest period whose dates may reach `date`. Every later period
    /// starts after `date`.
    fn first_period_touching(&self, date: NaiveDate) -> u64 {
        if date <= self.anchor {
            return 0;
        }
        let elapsed = match self.rule.frequency {
            Frequency::Daily => (date - self.anchor).num_days(),
            Frequency::Weekly => (date - self.anchor_week()).num_days() / 7,
            Frequency::Monthly => month_index(date) - month_index(self.anchor),
        };
        elapsed.unsigned_abs() / self.interval
    }

    /// Occurrences generated in periods `0..k`.
    fn occurrences_before_period(&self, k: u64) -> u64 {
        if k == 0 {
            return 0;
        }
        match self.rule.frequency {
            Frequency::Daily => k,
            Frequency::Weekly => {
                let first = self.period_dates(0).len() as u64;
                let per_week = self.weekdays().len() as u64;
                first + (k - 1) * per_week
            }
            Frequency::Monthly if self.every_month_produces() => {
                let first = self.period_dates(0).len() as u64;
                first + (k - 1)
            }
            Frequency::Monthly => self.sparse_months_before(k),
        }
    }

    /// Periods in `0..k` that produce a date when some months lack the
    /// anchor's day. Month lengths repeat every 400 years, so whole cycles
    /// are counted once.
    fn sparse_months_before(&self, k: u64) -> u64 {
        let cycle = GREGORIAN_CYCLE_MONTHS / gcd(self.interval, GREGORIAN_CYCLE_MONTHS);
        let produced = |n: u64| (0..n).filter(|j| self.month_produces(*j)).count() as u64;
        let whole = k / cycle;
        let rest = produced(k % cycle);
        if whole == 0 {
            rest
        } else {
            whole * produced(cycle) + rest
        }
    }

    fn month_produces(&self, k: u64) -> bool {
        !self.period_dates(k).is_empty()
    }

    /// True when every month after the first yields exactly one date.
    fn every_month_produces(&self) -> bool {
        match self.rule.by_month_day.first() {
            Some(smallest) => *smallest <= 28,
            None => self.anchor.day() <= 28,
        }
    }

    fn count_before(&self, date: NaiveDate) -> u64 {
        let Some(last) = date.pred_opt() else {
            return 0;
        };
        let last = match self.rule.end {
            RuleEnd::Until(until) => last.min(until),
            _ => last,
        };
        let generated = self.count_through(last);
        match self.rule.end {
            RuleEnd::Count(n) => generated.min(u64::from(n)),
            _ => generated,
        }
    }

    /// Occurrences on or before `date`, ignoring the rule's end.
    fn count_through(&self, date: NaiveDate) -> u64 {
        let k = self.first_period_touching(date);
        let in_period = self
            .period_dates(k)
            .into_iter()
            .filter(|d| *d <= date)
            .count() as u64;
        self.occurrences_before_period(k) + in_period
    }

    fn dates_in(&self, range: DateRange) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut k = self.first_period_touching(range.start);
        // The running index only matters for COUNT.
        let mut index = match self.rule.end {
            RuleEnd::Count(_) => self.occurrences_before_period(k),
            _ => 0,
        };

        while let Some(period_start) = self.period_start(k) {
            if period_start > range.end {
                break;
            }
            if let RuleEnd::Until(until) = self.rule.end {
                if period_start > until {
                    break;
                }
            }
            for date in self.period_dates(k) {
                let exhausted = match self.rule.end {
                    RuleEnd::Count(n) => index >= u64::from(n),
                    RuleEnd::Until(until) => date > until,
                    RuleEnd::Never => false,
                };
                if exhausted || date > range.end {
                    return out;
                }
                if date >= range.start {
                    out.push(date);
                }
                index += 1;
            }
            k += 1;
        }
        out
    }
}

/// Months in the 400-year Gregorian cycle.
const GREGORIAN_CYCLE_MONTHS: u64 = 4800;

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn days_in_month(first: NaiveDate) -> u32 {
    first
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .map_or(31, |last| last.day())
}

// ---------------------------------------------------------------------------
// Extended rules (rrule crate)
// ---------------------------------------------------------------------------

fn ical_local(dt: NaiveDateTime) -> String {
    dt.format("%Y%m%dT%H%M%S").to_string()
}

fn extended_dates(
    rule: &ExtendedRule,
    anchor: NaiveDate,
    start_time: NaiveTime,
    range: DateRange,
    tz: Tz,
) -> Result<Vec<NaiveDate>> {
    let until = rule.until.map_or(range.end, |u| u.min(range.end));
    if until < range.start || until < anchor {
        return Ok(Vec::new());
    }

    let text = format!(
        "DTSTART;TZID={}:{}\nRRULE:{}",
        tz.name(),
        ical_local(anchor.and_time(start_time)),
        rule.rrule_body()
    );
    let set: RRuleSet = text
        .parse()
        .map_err(|e| AgendaError::InvalidRule(format!("{e}")))?;

    // Widen by a day on each side; the date filter below is authoritative.
    let rtz = set.get_dt_start().timezone();
    let lo = range.start.pred_opt().unwrap_or(range.start).and_time(NaiveTime::MIN);
    let hi = until.succ_opt().unwrap_or(until).and_time(NaiveTime::MIN);
    let (Some(lo), Some(hi)) = (
        rtz.from_local_datetime(&lo).earliest(),
        rtz.from_local_datetime(&hi).latest(),
    ) else {
        return Err(AgendaError::Expansion(format!(
            "window {}..{} does not exist in {}",
            range.start, until, tz
        )));
    };

    let result = set.after(lo).before(hi).all(u16::MAX);
    if result.limited {
        tracing::warn!(rule = %rule, "extended rule hit the expansion limit");
    }

    let mut dates: Vec<NaiveDate> = result
        .dates
        .into_iter()
        .map(|dt| dt.date_naive())
        .filter(|d| range.start <= *d && *d <= until)
        .collect();
    dates.dedup();
    Ok(dates)
}
