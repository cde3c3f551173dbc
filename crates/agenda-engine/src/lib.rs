//! # agenda-engine
//!
//! Recurring appointment storage and expansion without materializing future
//! rows.
//!
//! A series is one master event plus a recurrence rule, a set of excluded
//! dates and sparse per-date exceptions. Reads expand the series over a
//! bounded date window; writes are scoped to one occurrence, to an
//! occurrence and everything after it, or to the whole series.
//!
//! ## Modules
//!
//! - [`model`]: master events, exceptions, field patches
//! - [`reference`]: real and virtual (`virt-<id>-<date>`) event ids
//! - [`rule`]: parsing, canonical form and truncation of rule strings
//! - [`builder`]: simple repeat parameters → canonical rule
//! - [`expander`]: rule + exclusions + exceptions → occurrences in a window
//! - [`store`]: persistence trait, in-memory and SQLite backends
//! - [`scope`]: single / future / all mutations
//! - [`service`]: merged listings and id-addressed mutations
//! - [`notify`]: status-change notifications for downstream consumers
//! - [`config`]: engine configuration
//! - [`error`]: Error types

pub mod builder;
pub mod config;
pub mod error;
pub mod expander;
pub mod model;
pub mod notify;
pub mod reference;
pub mod rule;
pub mod scope;
pub mod service;
pub mod store;

pub use builder::{build_rule, build_rule_string, RepeatFrequency, RepeatSpec};
pub use config::EngineConfig;
pub use error::{AgendaError, Result};
pub use expander::{expand, DateRange, Occurrence};
pub use model::{
    EventFields, EventId, EventPatch, EventStatus, Exception, MasterEvent, NewEvent, PatientId,
    TenantId,
};
pub use notify::{ChannelSink, DomainEvent, EventSink, NullSink, TracingSink};
pub use reference::{EventRef, OccurrenceRef};
pub use rule::{Recurrence, RecurrenceRule};
pub use scope::{Applied, Mutation, MutationOutcome, Scope, ScopeResolver};
pub use service::{CreateEvent, EventQueryService};
pub use store::{EventStore, InMemoryEventStore, SqliteEventStore};
