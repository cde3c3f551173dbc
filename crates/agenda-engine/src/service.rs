//! Request-level facade: merged range listings and id-addressed mutations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::builder::{build_rule, RepeatSpec};
use crate::config::EngineConfig;
use crate::error::{AgendaError, Result};
use crate::expander::{expand, occurrence_dates, DateRange, Occurrence};
use crate::model::{
    EventFields, EventId, EventPatch, EventStatus, Exception, MasterEvent, NewEvent, PatientId,
    TenantId,
};
use crate::notify::{DomainEvent, EventSink, NullSink};
use crate::reference::EventRef;
use crate::rule::Recurrence;
use crate::scope::{Applied, Mutation, Scope, ScopeResolver, StatusChange};
use crate::store::{EventFilter, EventStore};

/// A create request: event fields plus either simple repeat parameters or
/// a raw rule string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEvent {
    pub tenant: TenantId,
    #[serde(default)]
    pub patient: Option<PatientId>,
    #[serde(flatten)]
    pub fields: EventFields,
    #[serde(default)]
    pub repeat: Option<RepeatSpec>,
    #[serde(default)]
    pub rule: Option<String>,
}

pub struct EventQueryService {
    store: Arc<dyn EventStore>,
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
    tz: Tz,
}

impl EventQueryService {
    /// # Errors
    /// Returns an error if `config` names an unknown timezone or a zero
    /// range limit.
    pub fn new(store: Arc<dyn EventStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let tz = config.tz()?;
        Ok(Self {
            store,
            sink: Arc::new(NullSink),
            config,
            tz,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Standalone events and expanded series occurrences inside `range`,
    /// sorted by date, start time and id.
    ///
    /// # Errors
    /// Returns `AgendaError::Validation` if the range is wider than
    /// `max_range_days`.
    pub fn list(
        &self,
        tenant: TenantId,
        patient: Option<PatientId>,
        range: DateRange,
    ) -> Result<Vec<Occurrence>> {
        if range.days() > i64::from(self.config.max_range_days) {
            tracing::warn!(
                %tenant,
                days = range.days(),
                max = self.config.max_range_days,
                "range too wide"
            );
            return Err(AgendaError::validation(format!(
                "range covers {} days, at most {} allowed",
                range.days(),
                self.config.max_range_days
            )));
        }

        let mut filter = EventFilter::tenant(tenant);
        if let Some(patient) = patient {
            filter = filter.with_patient(patient);
        }

        let mut occurrences: Vec<Occurrence> = self
            .store
            .standalone_in_range(&filter, range)?
            .iter()
            .map(Occurrence::standalone)
            .collect();

        let masters = self.store.recurring(&filter, range.end)?;
        let ids: Vec<EventId> = masters.iter().map(|m| m.id).collect();
        let mut by_master: HashMap<EventId, Vec<Exception>> = HashMap::new();
        if !ids.is_empty() {
            for ex in self.store.exceptions(&ids)? {
                by_master.entry(ex.master_id).or_default().push(ex);
            }
        }
        for master in &masters {
            let own = by_master.get(&master.id).map_or(&[][..], Vec::as_slice);
            occurrences.extend(expand(master, own, range, self.tz)?);
        }

        occurrences.sort_by_key(Occurrence::sort_key);
        tracing::debug!(
            %tenant,
            start = %range.start,
            end = %range.end,
            masters = masters.len(),
            count = occurrences.len(),
            "listed occurrences"
        );
        Ok(occurrences)
    }

    /// [`list`](Self::list) with raw `YYYY-MM-DD` bounds; both are required.
    pub fn query(
        &self,
        tenant: TenantId,
        patient: Option<PatientId>,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<Occurrence>> {
        let range = DateRange::parse(start, end).inspect_err(|e| {
            tracing::warn!(%tenant, error = %e, "rejected query");
        })?;
        self.list(tenant, patient, range)
    }

    /// Persist a standalone event or a series master.
    ///
    /// # Errors
    /// Returns `AgendaError::Validation` if both `repeat` and `rule` are
    /// given or the repeat parameters are inconsistent, and
    /// `AgendaError::InvalidRule` for an unparseable rule string.
    pub fn create(&self, request: CreateEvent) -> Result<MasterEvent> {
        let rule = self.resolve_rule(&request).inspect_err(|e| {
            tracing::warn!(tenant = %request.tenant, error = %e, "rejected create");
        })?;
        request.fields.validate()?;

        let created = self.store.insert(NewEvent {
            tenant: request.tenant,
            patient: request.patient,
            fields: request.fields,
            rule,
        })?;
        tracing::info!(
            tenant = %created.tenant,
            id = %created.id,
            rule = created.rule.as_deref().unwrap_or("-"),
            "event created"
        );

        if created.fields.status == EventStatus::Realized {
            self.publish(
                created.tenant,
                StatusChange {
                    target: EventRef::Real(created.id),
                    previous: None,
                    current: created.fields.status,
                },
            );
        }
        Ok(created)
    }

    fn resolve_rule(&self, request: &CreateEvent) -> Result<Option<String>> {
        match (&request.repeat, &request.rule) {
            (Some(_), Some(_)) => Err(AgendaError::validation(
                "give either repeat parameters or a rule, not both",
            )),
            (Some(spec), None) => {
                Ok(build_rule(spec, request.fields.date)?.map(|rule| rule.to_string()))
            }
            (None, Some(raw)) => {
                let rule: Recurrence = raw.parse()?;
                if let Recurrence::Extended(_) = rule {
                    // Surface terms the rrule crate rejects now, not on the first read.
                    let anchor = request.fields.date;
                    occurrence_dates(
                        &rule,
                        anchor,
                        request.fields.start_time,
                        DateRange::single(anchor),
                        self.tz,
                    )?;
                }
                Ok(Some(rule.to_string()))
            }
            (None, None) => Ok(None),
        }
    }

    /// Edit the event or occurrence `id` (a row id or a virtual id).
    /// `scope` falls back to the configured default.
    pub fn update_occurrence(
        &self,
        tenant: TenantId,
        id: &str,
        scope: Option<Scope>,
        patch: EventPatch,
    ) -> Result<Applied> {
        self.mutate(tenant, id, scope, Mutation::Edit(patch))
    }

    /// Delete the event or occurrence `id` (a row id or a virtual id).
    pub fn delete_occurrence(
        &self,
        tenant: TenantId,
        id: &str,
        scope: Option<Scope>,
    ) -> Result<Applied> {
        self.mutate(tenant, id, scope, Mutation::Delete)
    }

    fn mutate(
        &self,
        tenant: TenantId,
        id: &str,
        scope: Option<Scope>,
        mutation: Mutation,
    ) -> Result<Applied> {
        let scope = scope.unwrap_or(self.config.default_scope);
        let applied = id.parse::<EventRef>().and_then(|target| {
            ScopeResolver::new(self.store.as_ref(), self.tz).apply(tenant, target, scope, &mutation)
        });

        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                tracing::warn!(
                    %tenant,
                    id,
                    %scope,
                    retryable = e.is_retryable(),
                    error = %e,
                    "rejected mutation"
                );
                return Err(e);
            }
        };

        tracing::info!(%tenant, id, %scope, outcome = ?applied.outcome, "mutation committed");
        if let Some(change) = applied.status_change {
            self.publish(tenant, change);
        }
        Ok(applied)
    }

    fn publish(&self, tenant: TenantId, change: StatusChange) {
        let event = DomainEvent::StatusChanged {
            tenant,
            target: change.target,
            previous: change.previous,
            current: change.current,
        };
        if let Err(e) = self.sink.publish(&event) {
            tracing::warn!(%tenant, target = %change.target, error = %e, "notification dropped");
        }
    }
}
