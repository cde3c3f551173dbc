use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::NaiveDate;

use super::{EventFilter, EventStore, SeriesSplit};
use crate::error::{AgendaError, Result};
use crate::expander::DateRange;
use crate::model::{EventId, EventPatch, Exception, MasterEvent, NewEvent, TenantId};

#[derive(Debug, Default)]
struct State {
    last_id: i64,
    events: BTreeMap<EventId, MasterEvent>,
    exceptions: BTreeMap<(EventId, NaiveDate), Exception>,
}

impl State {
    fn insert(&mut self, event: NewEvent, exclusions: BTreeSet<NaiveDate>) -> MasterEvent {
        self.last_id += 1;
        let stored = MasterEvent {
            id: EventId(self.last_id),
            tenant: event.tenant,
            patient: event.patient,
            fields: event.fields,
            rule: event.rule,
            exclusions,
            version: 1,
        };
        self.events.insert(stored.id, stored.clone());
        stored
    }

    fn owned_mut(&mut self, tenant: TenantId, id: EventId) -> Result<&mut MasterEvent> {
        self.events
            .get_mut(&id)
            .filter(|e| e.tenant == tenant)
            .ok_or_else(|| AgendaError::not_found(format!("event {id}")))
    }
}

/// In-memory event store.
///
/// Intended for tests/dev. One lock guards all maps, so every write,
/// including a series split, is atomic.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: RwLock<State>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| AgendaError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| AgendaError::Storage("lock poisoned".to_string()))
    }
}

impl EventStore for InMemoryEventStore {
    fn insert(&self, event: NewEvent) -> Result<MasterEvent> {
        event.fields.validate()?;
        Ok(self.write()?.insert(event, BTreeSet::new()))
    }

    fn get(&self, tenant: TenantId, id: EventId) -> Result<Option<MasterEvent>> {
        Ok(self
            .read()?
            .events
            .get(&id)
            .filter(|e| e.tenant == tenant)
            .cloned())
    }

    fn standalone_in_range(
        &self,
        filter: &EventFilter,
        range: DateRange,
    ) -> Result<Vec<MasterEvent>> {
        Ok(self
            .read()?
            .events
            .values()
            .filter(|e| !e.is_recurring() && filter.matches(e) && range.contains(e.fields.date))
            .cloned()
            .collect())
    }

    fn recurring(&self, filter: &EventFilter, through: NaiveDate) -> Result<Vec<MasterEvent>> {
        Ok(self
            .read()?
            .events
            .values()
            .filter(|e| e.is_recurring() && filter.matches(e) && e.fields.date <= through)
            .cloned()
            .collect())
    }

    fn exceptions(&self, master_ids: &[EventId]) -> Result<Vec<Exception>> {
        let wanted: BTreeSet<EventId> = master_ids.iter().copied().collect();
        Ok(self
            .read()?
            .exceptions
            .values()
            .filter(|ex| wanted.contains(&ex.master_id))
            .cloned()
            .collect())
    }

    fn update_fields(
        &self,
        tenant: TenantId,
        id: EventId,
        patch: &EventPatch,
    ) -> Result<MasterEvent> {
        let mut state = self.write()?;
        let event = state.owned_mut(tenant, id)?;
        let mut fields = event.fields.clone();
        patch.apply_to(&mut fields);
        fields.validate()?;
        event.fields = fields;
        event.version += 1;
        Ok(event.clone())
    }

    fn add_exclusion(&self, tenant: TenantId, id: EventId, date: NaiveDate) -> Result<MasterEvent> {
        let mut state = self.write()?;
        let event = state.owned_mut(tenant, id)?;
        if event.exclusions.insert(date) {
            event.version += 1;
        }
        Ok(event.clone())
    }

    fn upsert_exception(
        &self,
        tenant: TenantId,
        master_id: EventId,
        recurrence_id: NaiveDate,
        patch: &EventPatch,
    ) -> Result<Exception> {
        let mut state = self.write()?;
        state.owned_mut(tenant, master_id)?;
        let entry = state
            .exceptions
            .entry((master_id, recurrence_id))
            .or_insert_with(|| Exception {
                master_id,
                recurrence_id,
                patch: EventPatch::default(),
            });
        entry.patch.merge(patch);
        Ok(entry.clone())
    }

    fn split_series(&self, split: SeriesSplit) -> Result<Option<MasterEvent>> {
        if let Some(continuation) = &split.continuation {
            continuation.event.fields.validate()?;
        }

        let mut state = self.write()?;
        let master = state.owned_mut(split.tenant, split.master_id)?;
        if master.version != split.expected_version {
            return Err(AgendaError::conflict(format!(
                "event {} is at version {}, expected {}",
                split.master_id, master.version, split.expected_version
            )));
        }

        match split.truncated_rule {
            Some(rule) => {
                master.rule = Some(rule);
                master.exclusions.retain(|d| *d < split.at);
                master.version += 1;
                state
                    .exceptions
                    .retain(|(id, date), _| *id != split.master_id || *date < split.at);
            }
            None => {
                state.events.remove(&split.master_id);
                state.exceptions.retain(|(id, _), _| *id != split.master_id);
            }
        }

        Ok(split
            .continuation
            .map(|c| state.insert(c.event, c.exclusions)))
    }

    fn delete(&self, tenant: TenantId, id: EventId) -> Result<bool> {
        let mut state = self.write()?;
        if state.owned_mut(tenant, id).is_err() {
            return Ok(false);
        }
        state.events.remove(&id);
        state.exceptions.retain(|(master, _), _| *master != id);
        Ok(true)
    }
}
