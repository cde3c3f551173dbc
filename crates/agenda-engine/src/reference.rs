//! Typed event references, decoded once at the API boundary.
//!
//! A client addresses either a persisted row (`"42"`) or a virtual
//! occurrence of a series (`"virt-7-2025-03-10"`: prefix, master id, ISO
//! date). Nothing below the boundary parses id strings.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AgendaError, Result};
use crate::model::EventId;

/// Reserved prefix of virtual occurrence ids on the wire.
pub const VIRTUAL_PREFIX: &str = "virt-";

/// One occurrence of a series, identified by master and generated date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OccurrenceRef {
    pub master_id: EventId,
    pub date: NaiveDate,
}

impl OccurrenceRef {
    pub fn new(master_id: EventId, date: NaiveDate) -> Self {
        Self { master_id, date }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventRef {
    /// A persisted row: a standalone event or a series master.
    Real(EventId),
    /// A non-persisted occurrence produced by expansion.
    Virtual(OccurrenceRef),
}

impl EventRef {
    pub fn virtual_occurrence(master_id: EventId, date: NaiveDate) -> Self {
        Self::Virtual(OccurrenceRef::new(master_id, date))
    }

    /// The persisted row this reference resolves against.
    pub fn row_id(&self) -> EventId {
        match self {
            Self::Real(id) => *id,
            Self::Virtual(occ) => occ.master_id,
        }
    }
}

fn parse_row_id(raw: &str, whole: &str) -> Result<EventId> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 && id.to_string() == raw => Ok(EventId(id)),
        _ => Err(AgendaError::validation(format!("malformed event id '{whole}'"))),
    }
}

impl FromStr for EventRef {
    type Err = AgendaError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let Some(rest) = s.strip_prefix(VIRTUAL_PREFIX) else {
            return parse_row_id(s, s).map(Self::Real);
        };

        let (master, date) = rest
            .split_once('-')
            .ok_or_else(|| AgendaError::validation(format!("malformed virtual id '{s}'")))?;
        let master_id = parse_row_id(master, s)?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| AgendaError::validation(format!("malformed virtual id '{s}'")))?;

        // Only the canonical spelling names an occurrence: no unpadded or zero-led fields.
        let parsed = Self::virtual_occurrence(master_id, date);
        if parsed.to_string() != s {
            return Err(AgendaError::validation(format!("malformed virtual id '{s}'")));
        }
        Ok(parsed)
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real(id) => write!(f, "{id}"),
            Self::Virtual(occ) => write!(
                f,
                "{VIRTUAL_PREFIX}{}-{}",
                occ.master_id,
                occ.date.format("%Y-%m-%d")
            ),
        }
    }
}

impl Serialize for EventRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
