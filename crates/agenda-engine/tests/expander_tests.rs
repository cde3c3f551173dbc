//! Tests for series expansion over date windows.

use std::collections::BTreeSet;

use agenda_engine::error::AgendaError;
use agenda_engine::expander::{count_before, expand, occurs_on, DateRange};
use agenda_engine::model::{
    EventFields, EventId, EventPatch, EventStatus, Exception, MasterEvent, PatientId, TenantId,
};
use agenda_engine::reference::EventRef;
use agenda_engine::rule::Recurrence;
use chrono::{Datelike, NaiveDate, NaiveTime};
use chrono_tz::Tz;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
}

fn range(start: NaiveDate, end: NaiveDate) -> DateRange {
    DateRange::new(start, end).expect("valid range")
}

fn master(rule: Option<&str>, anchor: NaiveDate) -> MasterEvent {
    MasterEvent {
        id: EventId(1),
        tenant: TenantId(10),
        patient: Some(PatientId(100)),
        fields: EventFields {
            kind: "session".to_string(),
            status: EventStatus::Confirmed,
            date: anchor,
            start_time: time(9, 0),
            end_time: time(10, 0),
            responsible: "Dr. Lima".to_string(),
        },
        rule: rule.map(str::to_string),
        exclusions: BTreeSet::new(),
        version: 1,
    }
}

fn dates_of(master: &MasterEvent, window: DateRange) -> Vec<NaiveDate> {
    expand(master, &[], window, Tz::UTC)
        .expect("should expand")
        .into_iter()
        .map(|o| o.fields.date)
        .collect()
}

// ---------------------------------------------------------------------------
// Weekly series with exclusion and exception
// ---------------------------------------------------------------------------

#[test]
fn weekly_count_four_from_monday() {
    let series = master(Some("FREQ=WEEKLY;COUNT=4"), date(2025, 1, 6));
    assert_eq!(
        dates_of(&series, range(date(2025, 1, 1), date(2025, 2, 28))),
        vec![
            date(2025, 1, 6),
            date(2025, 1, 13),
            date(2025, 1, 20),
            date(2025, 1, 27)
        ]
    );
}

#[test]
fn exclusion_and_exception_resolve_independently() {
    let mut series = master(Some("FREQ=WEEKLY;COUNT=4"), date(2025, 1, 6));
    series.exclusions.insert(date(2025, 1, 13));
    let exceptions = vec![Exception {
        master_id: series.id,
        recurrence_id: date(2025, 1, 20),
        patch: EventPatch {
            responsible: Some("Dr. Souza".to_string()),
            ..Default::default()
        },
    }];

    let occurrences = expand(
        &series,
        &exceptions,
        range(date(2025, 1, 1), date(2025, 2, 28)),
        Tz::UTC,
    )
    .expect("should expand");

    let dates: Vec<NaiveDate> = occurrences.iter().map(|o| o.fields.date).collect();
    assert_eq!(
        dates,
        vec![date(2025, 1, 6), date(2025, 1, 20), date(2025, 1, 27)]
    );

    for occ in &occurrences {
        let expected = if occ.fields.date == date(2025, 1, 20) {
            "Dr. Souza"
        } else {
            "Dr. Lima"
        };
        assert_eq!(occ.fields.responsible, expected);
        assert_eq!(occ.fields.kind, series.fields.kind);
        assert_eq!(occ.fields.start_time, series.fields.start_time);
        assert!(occ.is_recurrence);
        assert_eq!(occ.master_id, Some(series.id));
        assert_eq!(occ.patient, series.patient);
    }
    assert_eq!(occurrences[1].id.to_string(), "virt-1-2025-01-20");
}

#[test]
fn moved_exception_stays_in_window_of_generated_date() {
    let series = master(Some("FREQ=WEEKLY"), date(2025, 1, 6));
    let exceptions = vec![Exception {
        master_id: series.id,
        recurrence_id: date(2025, 1, 13),
        patch: EventPatch {
            date: Some(date(2025, 1, 14)),
            ..Default::default()
        },
    }];

    let occurrences = expand(
        &series,
        &exceptions,
        DateRange::single(date(2025, 1, 13)),
        Tz::UTC,
    )
    .expect("should expand");

    assert_eq!(occurrences.len(), 1);
    assert_eq!(occurrences[0].fields.date, date(2025, 1, 14));
    assert_eq!(
        occurrences[0].id,
        EventRef::virtual_occurrence(series.id, date(2025, 1, 13))
    );
}

#[test]
fn exceptions_of_other_masters_are_ignored() {
    let series = master(Some("FREQ=DAILY;COUNT=2"), date(2025, 1, 6));
    let foreign = Exception {
        master_id: EventId(99),
        recurrence_id: date(2025, 1, 6),
        patch: EventPatch {
            kind: Some("other".to_string()),
            ..Default::default()
        },
    };
    let occurrences = expand(
        &series,
        &[foreign],
        range(date(2025, 1, 6), date(2025, 1, 7)),
        Tz::UTC,
    )
    .expect("should expand");
    assert!(occurrences.iter().all(|o| o.fields.kind == "session"));
}

// ---------------------------------------------------------------------------
// Windows that start mid-series
// ---------------------------------------------------------------------------

#[test]
fn daily_interval_aligns_to_anchor() {
    let series = master(Some("FREQ=DAILY;INTERVAL=2"), date(2025, 1, 1));
    assert_eq!(
        dates_of(&series, range(date(2025, 1, 10), date(2025, 1, 15))),
        vec![date(2025, 1, 11), date(2025, 1, 13), date(2025, 1, 15)]
    );
}

#[test]
fn count_is_honored_when_window_starts_late() {
    let series = master(Some("FREQ=DAILY;COUNT=10"), date(2025, 1, 1));
    assert_eq!(
        dates_of(&series, range(date(2025, 1, 8), date(2025, 1, 20))),
        vec![date(2025, 1, 8), date(2025, 1, 9), date(2025, 1, 10)]
    );
}

#[test]
fn until_is_inclusive() {
    let series = master(Some("FREQ=WEEKLY;UNTIL=20250120"), date(2025, 1, 6));
    assert_eq!(
        dates_of(&series, range(date(2025, 1, 1), date(2025, 3, 1))),
        vec![date(2025, 1, 6), date(2025, 1, 13), date(2025, 1, 20)]
    );
}

#[test]
fn biweekly_with_two_weekdays_anchored_midweek() {
    let series = master(
        Some("FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,TH;COUNT=4"),
        date(2025, 1, 9),
    );
    assert_eq!(
        dates_of(&series, range(date(2025, 1, 1), date(2025, 2, 28))),
        vec![
            date(2025, 1, 9),
            date(2025, 1, 20),
            date(2025, 1, 23),
            date(2025, 2, 3)
        ]
    );
    assert_eq!(
        dates_of(&series, range(date(2025, 1, 22), date(2025, 2, 28))),
        vec![date(2025, 1, 23), date(2025, 2, 3)]
    );
}

#[test]
fn window_before_anchor_is_empty() {
    let series = master(Some("FREQ=DAILY"), date(2025, 6, 1));
    assert!(dates_of(&series, range(date(2025, 1, 1), date(2025, 5, 31))).is_empty());
}

#[test]
fn unbounded_series_far_in_the_future() {
    let series = master(Some("FREQ=WEEKLY;BYDAY=MO"), date(2025, 1, 6));
    assert_eq!(
        dates_of(&series, range(date(2125, 1, 1), date(2125, 1, 14))),
        vec![date(2125, 1, 1), date(2125, 1, 8)]
    );
}

// ---------------------------------------------------------------------------
// Month ends
// ---------------------------------------------------------------------------

#[test]
fn clamped_monthly_falls_back_to_last_day() {
    let series = master(
        Some("FREQ=MONTHLY;BYMONTHDAY=28,29,30,31;BYSETPOS=-1;COUNT=4"),
        date(2025, 1, 31),
    );
    assert_eq!(
        dates_of(&series, range(date(2025, 1, 1), date(2025, 12, 31))),
        vec![
            date(2025, 1, 31),
            date(2025, 2, 28),
            date(2025, 3, 31),
            date(2025, 4, 30)
        ]
    );
}

#[test]
fn clamped_monthly_uses_leap_day() {
    let series = master(
        Some("FREQ=MONTHLY;BYMONTHDAY=28,29,30;BYSETPOS=-1"),
        date(2024, 1, 30),
    );
    assert_eq!(
        dates_of(&series, range(date(2024, 2, 1), date(2024, 3, 31))),
        vec![date(2024, 2, 29), date(2024, 3, 30)]
    );
}

#[test]
fn plain_monthly_skips_short_months() {
    let series = master(Some("FREQ=MONTHLY;COUNT=4"), date(2025, 1, 31));
    assert_eq!(
        dates_of(&series, range(date(2025, 1, 1), date(2025, 12, 31))),
        vec![
            date(2025, 1, 31),
            date(2025, 3, 31),
            date(2025, 5, 31),
            date(2025, 7, 31)
        ]
    );
    assert_eq!(
        dates_of(&series, range(date(2025, 6, 1), date(2025, 12, 31))),
        vec![date(2025, 7, 31)]
    );
}

#[test]
fn plain_monthly_far_ahead_without_count() {
    let series = master(Some("FREQ=MONTHLY"), date(2025, 1, 31));
    let found = dates_of(&series, range(date(200_000, 1, 1), date(200_000, 12, 31)));
    let months: Vec<u32> = found.iter().map(|d| d.month()).collect();
    assert_eq!(months, vec![1, 3, 5, 7, 8, 10, 12]);
    assert!(found.iter().all(|d| d.day() == 31));
}

#[test]
fn plain_monthly_counts_across_gregorian_cycles() {
    let start = time(9, 0);
    let rule: Recurrence = "FREQ=MONTHLY".parse().expect("rule");

    // Seven 31-day months a year.
    let anchor = date(2000, 1, 31);
    for (until, expected) in [(date(2400, 1, 31), 2800), (date(2800, 1, 31), 5600)] {
        assert_eq!(
            count_before(&rule, anchor, start, until, Tz::UTC).expect("count"),
            expected,
            "before {until}"
        );
    }

    // Eleven months a year reach day 29, plus February in the 97 leap years.
    let anchor = date(2000, 1, 29);
    assert_eq!(
        count_before(&rule, anchor, start, date(2400, 1, 29), Tz::UTC).expect("count"),
        11 * 400 + 97
    );
}

#[test]
fn sparse_monthly_count_matches_a_full_walk() {
    let anchor = date(2024, 1, 31);
    let start = time(9, 0);
    let open = master(Some("FREQ=MONTHLY;INTERVAL=5"), anchor);
    let walked = dates_of(&open, range(anchor, date(2900, 12, 31)));

    let rule: Recurrence = "FREQ=MONTHLY;INTERVAL=5".parse().expect("rule");
    for cutoff in [date(2100, 3, 1), date(2424, 1, 31), date(2824, 2, 1), date(2900, 12, 31)] {
        let expected = walked.iter().filter(|d| **d < cutoff).count() as u64;
        assert_eq!(
            count_before(&rule, anchor, start, cutoff, Tz::UTC).expect("count"),
            expected,
            "before {cutoff}"
        );
    }

    let count = walked.len();
    let bounded = master(
        Some(&format!("FREQ=MONTHLY;INTERVAL=5;COUNT={count}")),
        anchor,
    );
    let tail = range(date(2880, 1, 1), date(2950, 12, 31));
    let expected: Vec<NaiveDate> = walked
        .iter()
        .copied()
        .filter(|d| *d >= tail.start)
        .collect();
    assert!(!expected.is_empty());
    assert_eq!(dates_of(&bounded, tail), expected);
}

// ---------------------------------------------------------------------------
// Extended rules
// ---------------------------------------------------------------------------

#[test]
fn yearly_rule_goes_through_rrule() {
    let series = master(
        Some("FREQ=YEARLY;BYMONTH=3;BYMONTHDAY=10"),
        date(2025, 3, 10),
    );
    assert_eq!(
        dates_of(&series, range(date(2025, 1, 1), date(2027, 12, 31))),
        vec![date(2025, 3, 10), date(2026, 3, 10), date(2027, 3, 10)]
    );
}

#[test]
fn extended_until_is_applied_by_date() {
    let series = master(Some("FREQ=YEARLY;UNTIL=20260401"), date(2025, 3, 10));
    assert_eq!(
        dates_of(&series, range(date(2025, 1, 1), date(2030, 12, 31))),
        vec![date(2025, 3, 10), date(2026, 3, 10)]
    );
}

#[test]
fn extended_rule_uses_local_dates() {
    let mut series = master(Some("FREQ=DAILY;BYMONTH=1"), date(2025, 1, 30));
    series.fields.start_time = time(23, 30);
    series.fields.end_time = time(23, 59);
    let tz: Tz = "America/Sao_Paulo".parse().expect("zone");
    let dates: Vec<NaiveDate> = expand(
        &series,
        &[],
        range(date(2025, 1, 29), date(2025, 2, 2)),
        tz,
    )
    .expect("should expand")
    .into_iter()
    .map(|o| o.fields.date)
    .collect();
    assert_eq!(dates, vec![date(2025, 1, 30), date(2025, 1, 31)]);
}

// ---------------------------------------------------------------------------
// Standalone, invalid, helpers
// ---------------------------------------------------------------------------

#[test]
fn standalone_master_expands_to_nothing() {
    let event = master(None, date(2025, 1, 6));
    assert!(dates_of(&event, range(date(2025, 1, 1), date(2025, 1, 31))).is_empty());
}

#[test]
fn stored_garbage_rule_is_an_error() {
    let series = master(Some("FREQ=SOMETIMES"), date(2025, 1, 6));
    let err = expand(
        &series,
        &[],
        range(date(2025, 1, 1), date(2025, 1, 31)),
        Tz::UTC,
    )
    .unwrap_err();
    assert!(matches!(err, AgendaError::InvalidRule(_)));
}

#[test]
fn occurs_on_and_count_before() {
    let rule: Recurrence = "FREQ=WEEKLY;COUNT=3".parse().expect("rule");
    let anchor = date(2025, 1, 6);
    let start = time(9, 0);

    assert!(occurs_on(&rule, anchor, start, date(2025, 1, 13), Tz::UTC).expect("occurs"));
    assert!(!occurs_on(&rule, anchor, start, date(2025, 1, 14), Tz::UTC).expect("occurs"));
    assert!(!occurs_on(&rule, anchor, start, date(2025, 1, 27), Tz::UTC).expect("occurs"));

    assert_eq!(
        count_before(&rule, anchor, start, anchor, Tz::UTC).expect("count"),
        0
    );
    assert_eq!(
        count_before(&rule, anchor, start, date(2025, 1, 20), Tz::UTC).expect("count"),
        2
    );
    assert_eq!(
        count_before(&rule, anchor, start, date(2026, 1, 1), Tz::UTC).expect("count"),
        3
    );
}

#[test]
fn date_range_requires_both_bounds_in_order() {
    assert!(DateRange::parse(Some("2025-01-01"), None).is_err());
    assert!(DateRange::parse(None, Some("2025-01-01")).is_err());
    assert!(DateRange::parse(Some("2025-01-31"), Some("2025-01-01")).is_err());
    assert!(DateRange::parse(Some("01/01/2025"), Some("2025-01-31")).is_err());

    let parsed = DateRange::parse(Some("2025-01-01"), Some("2025-01-31")).expect("parse");
    assert_eq!(parsed.days(), 31);
    assert!(parsed.contains(date(2025, 1, 31)));
    assert!(!parsed.contains(date(2025, 2, 1)));
}
