//! Property-based tests for scoped edits: a single edit touches one date, a
//! future edit leaves everything before its date alone and never moves back
//! into it.

use std::collections::BTreeMap;

use agenda_engine::error::AgendaError;
use agenda_engine::expander::{expand, DateRange};
use agenda_engine::model::{EventFields, EventPatch, EventStatus, NewEvent, TenantId};
use agenda_engine::reference::EventRef;
use agenda_engine::scope::{Mutation, Scope, ScopeResolver};
use agenda_engine::store::{EventFilter, EventStore, InMemoryEventStore};
use chrono::{Datelike, Days, Duration, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use proptest::prelude::*;

const TENANT: TenantId = TenantId(1);
const WEEKDAY_CODES: [&str; 7] = ["MO", "TU", "WE", "TH", "FR", "SA", "SU"];

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn base() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date")
}

fn window() -> DateRange {
    DateRange::new(base(), NaiveDate::from_ymd_opt(2027, 12, 31).expect("valid date"))
        .expect("ordered")
}

/// A bounded canonical series inside `window()`.
fn arb_series() -> impl Strategy<Value = (NaiveDate, String)> {
    (
        (0u64..730).prop_map(|d| base() + Days::new(d)),
        0usize..3,
        1u32..=3,
        prop::collection::btree_set(0usize..7, 0..=2),
        2u32..=30,
    )
        .prop_map(|(anchor, freq, interval, days, count)| {
            let mut rule = match freq {
                0 => "FREQ=DAILY".to_string(),
                1 => "FREQ=WEEKLY".to_string(),
                _ => "FREQ=MONTHLY".to_string(),
            };
            if interval > 1 {
                rule.push_str(&format!(";INTERVAL={interval}"));
            }
            if freq == 1 && !days.is_empty() {
                let codes: Vec<&str> = days.iter().map(|d| WEEKDAY_CODES[*d]).collect();
                rule.push_str(&format!(";BYDAY={}", codes.join(",")));
            }
            if freq == 2 && anchor.day() > 28 {
                let days: Vec<String> = (28..=anchor.day()).map(|d| d.to_string()).collect();
                rule.push_str(&format!(";BYMONTHDAY={};BYSETPOS=-1", days.join(",")));
            }
            rule.push_str(&format!(";COUNT={count}"));
            (anchor, rule)
        })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn seed(anchor: NaiveDate, rule: &str) -> InMemoryEventStore {
    let store = InMemoryEventStore::new();
    store
        .insert(NewEvent {
            tenant: TENANT,
            patient: None,
            fields: EventFields {
                kind: "session".to_string(),
                status: EventStatus::Confirmed,
                date: anchor,
                start_time: NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
                end_time: NaiveTime::from_hms_opt(10, 0, 0).expect("valid time"),
                responsible: "Dr. Lima".to_string(),
            },
            rule: Some(rule.to_string()),
        })
        .expect("insert");
    store
}

/// Resolved fields keyed by generated date. Two masters never share a date.
fn snapshot(store: &InMemoryEventStore) -> BTreeMap<NaiveDate, EventFields> {
    let masters = store
        .recurring(&EventFilter::tenant(TENANT), window().end)
        .expect("recurring");
    let ids: Vec<_> = masters.iter().map(|m| m.id).collect();
    let exceptions = store.exceptions(&ids).expect("exceptions");
    let mut out = BTreeMap::new();
    for occurrence in masters
        .iter()
        .flat_map(|m| expand(m, &exceptions, window(), Tz::UTC).expect("expand"))
    {
        let generated = match occurrence.id {
            EventRef::Virtual(occ) => occ.date,
            EventRef::Real(_) => occurrence.fields.date,
        };
        assert!(
            out.insert(generated, occurrence.fields).is_none(),
            "{generated} listed twice"
        );
    }
    out
}

/// Patch the responsible at `date`, moving the date by `shift` days when non-zero.
fn edit_target(
    store: &InMemoryEventStore,
    date: NaiveDate,
    scope: Scope,
    shift: i64,
) -> agenda_engine::Result<()> {
    let master = store
        .recurring(&EventFilter::tenant(TENANT), window().end)
        .expect("recurring")
        .into_iter()
        .next()
        .expect("one master");
    let patch = EventPatch {
        responsible: Some("Dr. Souza".to_string()),
        date: (shift != 0).then(|| date + Duration::days(shift)),
        ..Default::default()
    };
    ScopeResolver::new(store, Tz::UTC)
        .apply(
            TENANT,
            EventRef::virtual_occurrence(master.id, date),
            scope,
            &Mutation::Edit(patch),
        )
        .map(|_| ())
}

fn config() -> ProptestConfig {
    ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Property 1: A single edit changes one date and nothing else
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(config())]

    #[test]
    fn single_edit_is_isolated(
        (anchor, rule) in arb_series(),
        pick in any::<prop::sample::Index>(),
    ) {
        let store = seed(anchor, &rule);
        let before = snapshot(&store);
        prop_assume!(!before.is_empty());
        let target = *before.keys().nth(pick.index(before.len())).expect("in range");

        edit_target(&store, target, Scope::Single, 0).expect("apply");
        let after = snapshot(&store);

        prop_assert_eq!(before.len(), after.len());
        for (date, fields) in &after {
            if *date == target {
                prop_assert_eq!(fields.responsible.as_str(), "Dr. Souza");
            } else {
                prop_assert_eq!(Some(fields), before.get(date));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Property 2: A future edit keeps the past and rewrites the rest
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(config())]

    #[test]
    fn future_edit_respects_its_boundary(
        (anchor, rule) in arb_series(),
        pick in any::<prop::sample::Index>(),
        shift in -3i64..=3,
    ) {
        let store = seed(anchor, &rule);
        let before = snapshot(&store);
        prop_assume!(!before.is_empty());
        let target = *before.keys().nth(pick.index(before.len())).expect("in range");

        let result = edit_target(&store, target, Scope::Future, shift);
        let after = snapshot(&store);

        if shift < 0 {
            prop_assert!(matches!(result, Err(AgendaError::Validation(_))), "{:?}", result);
            prop_assert_eq!(before, after);
            return Ok(());
        }
        prop_assert!(result.is_ok(), "{:?}", result);

        if shift == 0 {
            prop_assert_eq!(
                before.keys().collect::<Vec<_>>(),
                after.keys().collect::<Vec<_>>(),
                "rule {} anchored {} split at {}", rule, anchor, target
            );
        }
        let moved_to = target + Duration::days(shift);
        for (date, fields) in &after {
            if *date < target {
                prop_assert_eq!(Some(fields), before.get(date));
            } else {
                prop_assert!(*date >= moved_to, "{} precedes the new start {}", date, moved_to);
                prop_assert_eq!(fields.responsible.as_str(), "Dr. Souza");
            }
        }
    }
}
