//! Persisted data model: master events, per-date exceptions and field patches.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{AgendaError, Result};

/// Row id of a master or standalone event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

/// Organization owning the event. Resolved by an external identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

/// Opaque patient foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Confirmed,
    Realized,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Realized => "realized",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = AgendaError;

    /// Accepts the canonical names plus the Portuguese labels older clients send.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" | "pendente" => Ok(Self::Pending),
            "confirmed" | "confirmado" => Ok(Self::Confirmed),
            "realized" | "realizado" => Ok(Self::Realized),
            "cancelled" | "canceled" | "cancelado" => Ok(Self::Cancelled),
            other => Err(AgendaError::validation(format!(
                "unknown status '{other}' (expected pending, confirmed, realized or cancelled)"
            ))),
        }
    }
}

/// The fields an exception may override. This is also the resolved view of
/// one occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFields {
    pub kind: String,
    pub status: EventStatus,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub responsible: String,
}

impl EventFields {
    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(AgendaError::validation("kind must not be empty"));
        }
        if self.end_time < self.start_time {
            return Err(AgendaError::validation(format!(
                "end time {} is before start time {}",
                self.end_time, self.start_time
            )));
        }
        Ok(())
    }
}

/// A partial update. Unset fields leave the target untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsible: Option<String>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold `newer` into `self`; fields set in `newer` win, the rest are kept.
    pub fn merge(&mut self, newer: &EventPatch) {
        if let Some(kind) = &newer.kind {
            self.kind = Some(kind.clone());
        }
        if let Some(status) = newer.status {
            self.status = Some(status);
        }
        if let Some(date) = newer.date {
            self.date = Some(date);
        }
        if let Some(start) = newer.start_time {
            self.start_time = Some(start);
        }
        if let Some(end) = newer.end_time {
            self.end_time = Some(end);
        }
        if let Some(responsible) = &newer.responsible {
            self.responsible = Some(responsible.clone());
        }
    }

    pub fn apply_to(&self, fields: &mut EventFields) {
        if let Some(kind) = &self.kind {
            fields.kind = kind.clone();
        }
        if let Some(status) = self.status {
            fields.status = status;
        }
        if let Some(date) = self.date {
            fields.date = date;
        }
        if let Some(start) = self.start_time {
            fields.start_time = start;
        }
        if let Some(end) = self.end_time {
            fields.end_time = end;
        }
        if let Some(responsible) = &self.responsible {
            fields.responsible = responsible.clone();
        }
    }
}

/// Resolve an occurrence: master fields as the base, patch fields on top.
pub fn overlay(base: &EventFields, patch: &EventPatch) -> EventFields {
    let mut resolved = base.clone();
    patch.apply_to(&mut resolved);
    resolved
}

/// Input for creating a master or standalone event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub tenant: TenantId,
    pub patient: Option<PatientId>,
    #[serde(flatten)]
    pub fields: EventFields,
    pub rule: Option<String>,
}

/// A persisted event row. With a rule it anchors a series; without one it
/// is a standalone occurrence and `exclusions` is always empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterEvent {
    pub id: EventId,
    pub tenant: TenantId,
    pub patient: Option<PatientId>,
    #[serde(flatten)]
    pub fields: EventFields,
    pub rule: Option<String>,
    pub exclusions: BTreeSet<NaiveDate>,
    /// Bumped on every committed write; used for optimistic concurrency.
    pub version: u64,
}

impl MasterEvent {
    pub fn is_recurring(&self) -> bool {
        self.rule.is_some()
    }

    pub fn is_excluded(&self, date: NaiveDate) -> bool {
        self.exclusions.contains(&date)
    }
}

/// Per-date override of one occurrence. At most one exists per
/// `(master_id, recurrence_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    pub master_id: EventId,
    /// The date the rule generated, independent of any date override.
    pub recurrence_id: NaiveDate,
    pub patch: EventPatch,
}
