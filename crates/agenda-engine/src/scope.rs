//! Scoped mutations over a series: one occurrence, this-and-future, or the
//! whole series.
//!
//! | scope    | edit                               | delete                    |
//! |----------|------------------------------------|---------------------------|
//! | `single` | upsert the exception for the date  | add the date to exclusions |
//! | `future` | split: truncate + continuation     | truncate only             |
//! | `all`    | patch the master                   | delete master + exceptions |
//!
//! Standalone events ignore the scope: edits patch the row, deletes remove it.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{AgendaError, Result};
use crate::expander::{count_before, occurs_on};
use crate::model::{
    overlay, EventFields, EventId, EventPatch, EventStatus, Exception, MasterEvent, NewEvent,
    TenantId,
};
use crate::reference::{EventRef, OccurrenceRef};
use crate::rule::Recurrence;
use crate::store::{Continuation, EventStore, SeriesSplit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Only the addressed occurrence.
    #[default]
    #[serde(alias = "unico")]
    Single,
    /// The addressed occurrence and every later one.
    #[serde(alias = "futuros")]
    Future,
    /// Every occurrence of the series.
    #[serde(alias = "todos")]
    All,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Future => "future",
            Self::All => "all",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = AgendaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "single" | "unico" => Ok(Self::Single),
            "future" | "futuros" => Ok(Self::Future),
            "all" | "todos" => Ok(Self::All),
            other => Err(AgendaError::validation(format!(
                "unknown scope '{other}' (expected single, future or all)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Edit(EventPatch),
    Delete,
}

/// What a mutation wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "event", rename_all = "snake_case")]
pub enum MutationOutcome {
    /// A standalone event or a series master was patched.
    Updated(MasterEvent),
    /// A single occurrence now carries this exception.
    ExceptionUpserted(Exception),
    /// A single occurrence was removed from its series.
    Excluded(MasterEvent),
    /// The series was cut before the addressed date. `truncated` is gone
    /// from the store when no occurrence preceded that date.
    Split {
        truncated: EventId,
        continuation: Option<MasterEvent>,
    },
    /// The row and everything hanging off it were removed.
    Deleted(EventId),
}

/// A change in the resolved status of whatever a mutation addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub target: EventRef,
    pub previous: Option<EventStatus>,
    pub current: EventStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Applied {
    #[serde(flatten)]
    pub outcome: MutationOutcome,
    pub status_change: Option<StatusChange>,
}

/// Applies scoped mutations against an [`EventStore`].
///
/// Every check that can reject a request (scope/target compatibility,
/// occurrence existence, field validity) runs before the first write.
pub struct ScopeResolver<'a, S: EventStore + ?Sized> {
    store: &'a S,
    tz: Tz,
}

impl<'a, S: EventStore + ?Sized> ScopeResolver<'a, S> {
    pub fn new(store: &'a S, tz: Tz) -> Self {
        Self { store, tz }
    }

    /// Apply `mutation` to `target` with the given scope.
    ///
    /// A real id of a recurring master addresses the occurrence on the
    /// master's own date.
    ///
    /// # Errors
    /// - `Validation` for an empty patch, a virtual reference to a
    ///   standalone event, or a patch producing invalid fields.
    /// - `NotFound` for an unknown row or a date the series does not
    ///   generate (or has already excluded, for edits).
    /// - `Conflict` if the master changed under a "future" split.
    pub fn apply(
        &self,
        tenant: TenantId,
        target: EventRef,
        scope: Scope,
        mutation: &Mutation,
    ) -> Result<Applied> {
        if let Mutation::Edit(patch) = mutation {
            if patch.is_empty() {
                return Err(AgendaError::validation("patch sets no fields"));
            }
        }

        let master = self
            .store
            .get(tenant, target.row_id())?
            .ok_or_else(|| AgendaError::not_found(format!("event {}", target.row_id())))?;

        let Some(raw_rule) = master.rule.as_deref() else {
            if let EventRef::Virtual(occ) = target {
                return Err(AgendaError::validation(format!(
                    "event {} is not recurring, '{}' cannot address it",
                    occ.master_id, target
                )));
            }
            return self.apply_standalone(&master, mutation);
        };
        let rule: Recurrence = raw_rule.parse()?;

        let date = match target {
            EventRef::Virtual(occ) => occ.date,
            EventRef::Real(_) => master.fields.date,
        };
        let occurrence = OccurrenceRef::new(master.id, date);

        if scope != Scope::All && !self.occurs_on(&rule, &master, date)? {
            return Err(AgendaError::not_found(format!(
                "event {} has no occurrence on {date}",
                master.id
            )));
        }

        match (scope, mutation) {
            (Scope::Single, Mutation::Edit(patch)) => self.edit_single(&master, occurrence, patch),
            (Scope::Single, Mutation::Delete) => {
                let updated = self.store.add_exclusion(tenant, master.id, date)?;
                Ok(Applied {
                    outcome: MutationOutcome::Excluded(updated),
                    status_change: None,
                })
            }
            (Scope::Future, Mutation::Edit(patch)) => self.split(&master, &rule, date, Some(patch)),
            (Scope::Future, Mutation::Delete) => self.split(&master, &rule, date, None),
            (Scope::All, Mutation::Edit(patch)) => {
                let updated = self.store.update_fields(tenant, master.id, patch)?;
                let status_change = status_change(
                    EventRef::Real(master.id),
                    master.fields.status,
                    updated.fields.status,
                );
                Ok(Applied {
                    outcome: MutationOutcome::Updated(updated),
                    status_change,
                })
            }
            (Scope::All, Mutation::Delete) => self.delete_row(&master),
        }
    }

    fn occurs_on(&self, rule: &Recurrence, master: &MasterEvent, date: NaiveDate) -> Result<bool> {
        occurs_on(
            rule,
            master.fields.date,
            master.fields.start_time,
            date,
            self.tz,
        )
    }

    fn apply_standalone(&self, event: &MasterEvent, mutation: &Mutation) -> Result<Applied> {
        match mutation {
            Mutation::Edit(patch) => {
                overlay(&event.fields, patch).validate()?;
                let updated = self.store.update_fields(event.tenant, event.id, patch)?;
                let status_change = status_change(
                    EventRef::Real(event.id),
                    event.fields.status,
                    updated.fields.status,
                );
                Ok(Applied {
                    outcome: MutationOutcome::Updated(updated),
                    status_change,
                })
            }
            Mutation::Delete => self.delete_row(event),
        }
    }

    fn delete_row(&self, event: &MasterEvent) -> Result<Applied> {
        if !self.store.delete(event.tenant, event.id)? {
            return Err(AgendaError::not_found(format!("event {}", event.id)));
        }
        Ok(Applied {
            outcome: MutationOutcome::Deleted(event.id),
            status_change: None,
        })
    }

    fn edit_single(
        &self,
        master: &MasterEvent,
        occurrence: OccurrenceRef,
        patch: &EventPatch,
    ) -> Result<Applied> {
        if master.is_excluded(occurrence.date) {
            return Err(AgendaError::not_found(format!(
                "occurrence {} was deleted",
                EventRef::Virtual(occurrence)
            )));
        }

        let existing = self
            .store
            .exceptions(&[master.id])?
            .into_iter()
            .find(|ex| ex.recurrence_id == occurrence.date)
            .map(|ex| ex.patch)
            .unwrap_or_default();

        let base = EventFields {
            date: occurrence.date,
            ..master.fields.clone()
        };
        let before = overlay(&base, &existing);
        let mut merged = existing;
        merged.merge(patch);
        let after = overlay(&base, &merged);
        after.validate()?;

        let exception =
            self.store
                .upsert_exception(master.tenant, master.id, occurrence.date, patch)?;
        Ok(Applied {
            outcome: MutationOutcome::ExceptionUpserted(exception),
            status_change: status_change(
                EventRef::Virtual(occurrence),
                before.status,
                after.status,
            ),
        })
    }

    /// Cut the series before `date`; with a patch, continue it from there.
    fn split(
        &self,
        master: &MasterEvent,
        rule: &Recurrence,
        date: NaiveDate,
        patch: Option<&EventPatch>,
    ) -> Result<Applied> {
        // The truncated series keeps every date before `date`, so the
        // continuation may not start among them.
        if let Some(moved) = patch.and_then(|p| p.date).filter(|moved| *moved < date) {
            return Err(AgendaError::validation(format!(
                "a future edit at {date} cannot move the series back to {moved}"
            )));
        }

        let before = count_before(
            rule,
            master.fields.date,
            master.fields.start_time,
            date,
            self.tz,
        )?;
        let truncated_rule = if before == 0 {
            None
        } else {
            Some(rule.truncated_before(date)?.to_string())
        };

        let continuation = match patch {
            Some(patch) => {
                let base = EventFields {
                    date,
                    ..master.fields.clone()
                };
                let fields = overlay(&base, patch);
                fields.validate()?;

                let preceding = u32::try_from(before).unwrap_or(u32::MAX);
                let remaining = rule.count().map(|n| n.saturating_sub(preceding));
                // A moved anchor shifts the cadence, so old exclusions no
                // longer line up with generated dates.
                let exclusions = if fields.date == date {
                    master
                        .exclusions
                        .iter()
                        .copied()
                        .filter(|d| *d >= date)
                        .collect()
                } else {
                    Default::default()
                };
                Some(Continuation {
                    event: NewEvent {
                        tenant: master.tenant,
                        patient: master.patient,
                        fields,
                        rule: Some(rule.continued(remaining).to_string()),
                    },
                    exclusions,
                })
            }
            None => None,
        };

        let continued = self.store.split_series(SeriesSplit {
            tenant: master.tenant,
            master_id: master.id,
            expected_version: master.version,
            at: date,
            truncated_rule,
            continuation,
        })?;

        let status_change = continued.as_ref().and_then(|next| {
            status_change(
                EventRef::Real(next.id),
                master.fields.status,
                next.fields.status,
            )
        });
        Ok(Applied {
            outcome: MutationOutcome::Split {
                truncated: master.id,
                continuation: continued,
            },
            status_change,
        })
    }
}

fn status_change(
    target: EventRef,
    previous: EventStatus,
    current: EventStatus,
) -> Option<StatusChange> {
    (previous != current).then_some(StatusChange {
        target,
        previous: Some(previous),
        current,
    })
}
