use std::collections::BTreeSet;
use std::hint::black_box;
use std::sync::Arc;

use agenda_engine::expander::{expand, DateRange};
use agenda_engine::model::{EventFields, EventId, EventStatus, MasterEvent, TenantId};
use agenda_engine::service::{CreateEvent, EventQueryService};
use agenda_engine::{EngineConfig, InMemoryEventStore};
use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn fields(anchor: NaiveDate) -> EventFields {
    EventFields {
        kind: "session".to_string(),
        status: EventStatus::Confirmed,
        date: anchor,
        start_time: NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
        end_time: NaiveTime::from_hms_opt(10, 0, 0).expect("valid time"),
        responsible: "Dr. Lima".to_string(),
    }
}

fn master(rule: &str) -> MasterEvent {
    MasterEvent {
        id: EventId(1),
        tenant: TenantId(1),
        patient: None,
        fields: fields(date(2000, 1, 3)),
        rule: Some(rule.to_string()),
        exclusions: BTreeSet::new(),
        version: 1,
    }
}

/// A one-month window decades after the anchor: cost should not grow with
/// the distance.
fn bench_far_window(c: &mut Criterion) {
    let window = DateRange::new(date(2090, 3, 1), date(2090, 3, 31)).expect("range");
    let mut group = c.benchmark_group("far_window");
    for rule in [
        "FREQ=DAILY",
        "FREQ=WEEKLY;BYDAY=MO,WE,FR",
        "FREQ=MONTHLY;BYMONTHDAY=28,29,30,31;BYSETPOS=-1",
        "FREQ=WEEKLY;BYDAY=TU;COUNT=5000",
    ] {
        let series = master(rule);
        group.bench_with_input(BenchmarkId::from_parameter(rule), &series, |b, series| {
            b.iter(|| expand(black_box(series), &[], window, Tz::UTC));
        });
    }
    group.finish();
}

fn bench_extended_rule(c: &mut Criterion) {
    let window = DateRange::new(date(2030, 1, 1), date(2030, 12, 31)).expect("range");
    let series = master("FREQ=MONTHLY;BYDAY=-1FR");
    c.bench_function("extended_year", |b| {
        b.iter(|| expand(black_box(&series), &[], window, Tz::UTC));
    });
}

fn bench_listing(c: &mut Criterion) {
    let store = Arc::new(InMemoryEventStore::new());
    let service = EventQueryService::new(store, EngineConfig::default()).expect("service");
    for n in 0..200u32 {
        let anchor = date(2024, 1, 1) + chrono::Days::new(u64::from(n % 28));
        service
            .create(CreateEvent {
                tenant: TenantId(1),
                patient: None,
                fields: fields(anchor),
                repeat: None,
                rule: Some(if n % 2 == 0 {
                    "FREQ=WEEKLY".to_string()
                } else {
                    "FREQ=DAILY;INTERVAL=3".to_string()
                }),
            })
            .expect("create");
    }
    let window = DateRange::new(date(2025, 6, 1), date(2025, 6, 30)).expect("range");
    c.bench_function("list_200_series_month", |b| {
        b.iter(|| service.list(TenantId(1), None, black_box(window)));
    });
}

criterion_group!(benches, bench_far_window, bench_extended_rule, bench_listing);
criterion_main!(benches);
