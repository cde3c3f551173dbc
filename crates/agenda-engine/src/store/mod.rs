//! Persistence for master events, exclusion sets and per-date exceptions.
//!
//! Every call is scoped by tenant: rows of another tenant behave as if they
//! did not exist. Writes that must land together (see [`SeriesSplit`]) are a
//! single atomic operation in every backend.

mod memory;
mod sqlite;

use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::error::Result;
use crate::expander::DateRange;
use crate::model::{EventId, EventPatch, Exception, MasterEvent, NewEvent, PatientId, TenantId};

pub use memory::InMemoryEventStore;
pub use sqlite::SqliteEventStore;

/// Which rows a listing may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    pub tenant: TenantId,
    pub patient: Option<PatientId>,
}

impl EventFilter {
    pub fn tenant(tenant: TenantId) -> Self {
        Self {
            tenant,
            patient: None,
        }
    }

    pub fn with_patient(mut self, patient: PatientId) -> Self {
        self.patient = Some(patient);
        self
    }

    pub fn matches(&self, event: &MasterEvent) -> bool {
        event.tenant == self.tenant && self.patient.is_none_or(|p| event.patient == Some(p))
    }
}

/// The continuation master created by a "future" edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub event: NewEvent,
    /// Exclusions carried over from the truncated tail.
    pub exclusions: BTreeSet<NaiveDate>,
}

/// End a series before `at` and optionally start its replacement.
///
/// Applied atomically: the master's rule is replaced by `truncated_rule`, its
/// exclusions and exceptions on or after `at` are dropped, and the
/// continuation (if any) is inserted. A `truncated_rule` of `None` means no
/// occurrence precedes `at`, and the master is deleted instead. The whole
/// split fails with `AgendaError::Conflict` if the master's version is no
/// longer `expected_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesSplit {
    pub tenant: TenantId,
    pub master_id: EventId,
    pub expected_version: u64,
    pub at: NaiveDate,
    pub truncated_rule: Option<String>,
    pub continuation: Option<Continuation>,
}

pub trait EventStore: Send + Sync {
    fn insert(&self, event: NewEvent) -> Result<MasterEvent>;

    fn get(&self, tenant: TenantId, id: EventId) -> Result<Option<MasterEvent>>;

    /// Events without a rule whose date falls inside `range`.
    fn standalone_in_range(&self, filter: &EventFilter, range: DateRange)
        -> Result<Vec<MasterEvent>>;

    /// Recurring masters anchored on or before `through`. Later anchors
    /// cannot produce occurrences up to that date.
    fn recurring(&self, filter: &EventFilter, through: NaiveDate) -> Result<Vec<MasterEvent>>;

    /// Exceptions of the given masters.
    fn exceptions(&self, master_ids: &[EventId]) -> Result<Vec<Exception>>;

    /// Apply a field patch to one row.
    fn update_fields(&self, tenant: TenantId, id: EventId, patch: &EventPatch)
        -> Result<MasterEvent>;

    /// Add `date` to the master's exclusion set. Adding twice is a no-op.
    fn add_exclusion(&self, tenant: TenantId, id: EventId, date: NaiveDate) -> Result<MasterEvent>;

    /// Create or merge the exception for `(master_id, recurrence_id)`. Fields
    /// set in `patch` overwrite, fields already stored are kept.
    fn upsert_exception(
        &self,
        tenant: TenantId,
        master_id: EventId,
        recurrence_id: NaiveDate,
        patch: &EventPatch,
    ) -> Result<Exception>;

    /// Returns the continuation master, if one was requested.
    fn split_series(&self, split: SeriesSplit) -> Result<Option<MasterEvent>>;

    /// Delete a row together with its exclusions and exceptions. Returns
    /// `false` if nothing matched.
    fn delete(&self, tenant: TenantId, id: EventId) -> Result<bool>;
}
