use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, NaiveTime};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};

use super::{EventFilter, EventStore, SeriesSplit};
use crate::error::{AgendaError, Result};
use crate::expander::DateRange;
use crate::model::{
    EventFields, EventId, EventPatch, EventStatus, Exception, MasterEvent, NewEvent, PatientId,
    TenantId,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS master_event (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id   INTEGER NOT NULL,
    patient_id  INTEGER,
    kind        TEXT NOT NULL,
    status      TEXT NOT NULL,
    date        TEXT NOT NULL,
    start_time  TEXT NOT NULL,
    end_time    TEXT NOT NULL,
    responsible TEXT NOT NULL,
    rule        TEXT,
    version     INTEGER NOT NULL DEFAULT 1,
    CHECK (end_time >= start_time)
);
CREATE INDEX IF NOT EXISTS master_event_tenant_date ON master_event (tenant_id, date);

CREATE TABLE IF NOT EXISTS event_exclusion (
    master_id INTEGER NOT NULL REFERENCES master_event (id) ON DELETE CASCADE,
    date      TEXT NOT NULL,
    PRIMARY KEY (master_id, date)
);

CREATE TABLE IF NOT EXISTS event_exception (
    master_id     INTEGER NOT NULL REFERENCES master_event (id) ON DELETE CASCADE,
    recurrence_id TEXT NOT NULL,
    kind          TEXT,
    status        TEXT,
    date          TEXT,
    start_time    TEXT,
    end_time      TEXT,
    responsible   TEXT,
    PRIMARY KEY (master_id, recurrence_id)
);
";

/// Ids bound into one `IN (...)` list, below SQLite's variable limit.
const MAX_BOUND_IDS: usize = 500;

const MASTER_COLUMNS: &str = "id, tenant_id, patient_id, kind, status, date, start_time, \
                              end_time, responsible, rule, version";

impl ToSql for EventStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EventStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: AgendaError| FromSqlError::Other(Box::new(e)))
    }
}

/// SQLite-backed event store.
///
/// Exclusions and exceptions live in child tables with `ON DELETE CASCADE`;
/// a series split runs in one transaction.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AgendaError::Storage("connection lock poisoned".to_string()))
    }
}

fn version_from_row(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or_default()
}

fn master_from_row(row: &Row<'_>) -> rusqlite::Result<MasterEvent> {
    Ok(MasterEvent {
        id: EventId(row.get(0)?),
        tenant: TenantId(row.get(1)?),
        patient: row.get::<_, Option<i64>>(2)?.map(PatientId),
        fields: EventFields {
            kind: row.get(3)?,
            status: row.get(4)?,
            date: row.get(5)?,
            start_time: row.get(6)?,
            end_time: row.get(7)?,
            responsible: row.get(8)?,
        },
        rule: row.get(9)?,
        exclusions: BTreeSet::new(),
        version: version_from_row(row.get(10)?),
    })
}

fn exception_from_row(row: &Row<'_>) -> rusqlite::Result<Exception> {
    Ok(Exception {
        master_id: EventId(row.get(0)?),
        recurrence_id: row.get(1)?,
        patch: EventPatch {
            kind: row.get(2)?,
            status: row.get(3)?,
            date: row.get(4)?,
            start_time: row.get::<_, Option<NaiveTime>>(5)?,
            end_time: row.get::<_, Option<NaiveTime>>(6)?,
            responsible: row.get(7)?,
        },
    })
}

fn load_exclusions(conn: &Connection, event: &mut MasterEvent) -> rusqlite::Result<()> {
    let mut stmt =
        conn.prepare_cached("SELECT date FROM event_exclusion WHERE master_id = ?1")?;
    event.exclusions = stmt
        .query_map([event.id.0], |row| row.get::<_, NaiveDate>(0))?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;
    Ok(())
}

fn fetch_master(conn: &Connection, tenant: TenantId, id: EventId) -> Result<Option<MasterEvent>> {
    let sql = format!("SELECT {MASTER_COLUMNS} FROM master_event WHERE id = ?1 AND tenant_id = ?2");
    let Some(mut event) = conn
        .query_row(&sql, params![id.0, tenant.0], master_from_row)
        .optional()?
    else {
        return Ok(None);
    };
    load_exclusions(conn, &mut event)?;
    Ok(Some(event))
}

fn require_master(conn: &Connection, tenant: TenantId, id: EventId) -> Result<MasterEvent> {
    fetch_master(conn, tenant, id)?.ok_or_else(|| AgendaError::not_found(format!("event {id}")))
}

fn insert_row(conn: &Connection, event: &NewEvent) -> Result<EventId> {
    let f = &event.fields;
    conn.execute(
        "INSERT INTO master_event
             (tenant_id, patient_id, kind, status, date, start_time, end_time, responsible, rule)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.tenant.0,
            event.patient.map(|p| p.0),
            f.kind,
            f.status,
            f.date,
            f.start_time,
            f.end_time,
            f.responsible,
            event.rule,
        ],
    )?;
    Ok(EventId(conn.last_insert_rowid()))
}

fn query_masters(
    conn: &Connection,
    condition: &str,
    filter: &EventFilter,
    from: Option<NaiveDate>,
    through: NaiveDate,
) -> Result<Vec<MasterEvent>> {
    let sql = format!(
        "SELECT {MASTER_COLUMNS} FROM master_event
         WHERE tenant_id = ?1
           AND (?2 IS NULL OR patient_id = ?2)
           AND (?3 IS NULL OR date >= ?3)
           AND date <= ?4
           AND {condition}
         ORDER BY date, start_time, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut events = stmt
        .query_map(
            params![filter.tenant.0, filter.patient.map(|p| p.0), from, through],
            master_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for event in &mut events {
        load_exclusions(conn, event)?;
    }
    Ok(events)
}

impl EventStore for SqliteEventStore {
    fn insert(&self, event: NewEvent) -> Result<MasterEvent> {
        event.fields.validate()?;
        let conn = self.conn()?;
        let id = insert_row(&conn, &event)?;
        require_master(&conn, event.tenant, id)
    }

    fn get(&self, tenant: TenantId, id: EventId) -> Result<Option<MasterEvent>> {
        fetch_master(&*self.conn()?, tenant, id)
    }

    fn standalone_in_range(
        &self,
        filter: &EventFilter,
        range: DateRange,
    ) -> Result<Vec<MasterEvent>> {
        query_masters(
            &*self.conn()?,
            "rule IS NULL",
            filter,
            Some(range.start),
            range.end,
        )
    }

    fn recurring(&self, filter: &EventFilter, through: NaiveDate) -> Result<Vec<MasterEvent>> {
        query_masters(&*self.conn()?, "rule IS NOT NULL", filter, None, through)
    }

    fn exceptions(&self, master_ids: &[EventId]) -> Result<Vec<Exception>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        for chunk in master_ids.chunks(MAX_BOUND_IDS) {
            let marks = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT master_id, recurrence_id, kind, status, date, start_time, end_time, responsible
                 FROM event_exception WHERE master_id IN ({marks})
                 ORDER BY master_id, recurrence_id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.0)),
                exception_from_row,
            )?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    fn update_fields(
        &self,
        tenant: TenantId,
        id: EventId,
        patch: &EventPatch,
    ) -> Result<MasterEvent> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current = require_master(&tx, tenant, id)?;
        let mut fields = current.fields.clone();
        patch.apply_to(&mut fields);
        fields.validate()?;

        tx.execute(
            "UPDATE master_event
             SET kind = ?1, status = ?2, date = ?3, start_time = ?4, end_time = ?5,
                 responsible = ?6, version = version + 1
             WHERE id = ?7",
            params![
                fields.kind,
                fields.status,
                fields.date,
                fields.start_time,
                fields.end_time,
                fields.responsible,
                id.0,
            ],
        )?;
        let updated = require_master(&tx, tenant, id)?;
        tx.commit()?;
        Ok(updated)
    }

    fn add_exclusion(&self, tenant: TenantId, id: EventId, date: NaiveDate) -> Result<MasterEvent> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        require_master(&tx, tenant, id)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO event_exclusion (master_id, date) VALUES (?1, ?2)",
            params![id.0, date],
        )?;
        if inserted > 0 {
            tx.execute(
                "UPDATE master_event SET version = version + 1 WHERE id = ?1",
                [id.0],
            )?;
        }
        let updated = require_master(&tx, tenant, id)?;
        tx.commit()?;
        Ok(updated)
    }

    fn upsert_exception(
        &self,
        tenant: TenantId,
        master_id: EventId,
        recurrence_id: NaiveDate,
        patch: &EventPatch,
    ) -> Result<Exception> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        require_master(&tx, tenant, master_id)?;
        // Merge in SQL so concurrent single edits never clobber each other.
        tx.execute(
            "INSERT INTO event_exception
                 (master_id, recurrence_id, kind, status, date, start_time, end_time, responsible)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (master_id, recurrence_id) DO UPDATE SET
                 kind        = COALESCE(excluded.kind, kind),
                 status      = COALESCE(excluded.status, status),
                 date        = COALESCE(excluded.date, date),
                 start_time  = COALESCE(excluded.start_time, start_time),
                 end_time    = COALESCE(excluded.end_time, end_time),
                 responsible = COALESCE(excluded.responsible, responsible)",
            params![
                master_id.0,
                recurrence_id,
                patch.kind,
                patch.status,
                patch.date,
                patch.start_time,
                patch.end_time,
                patch.responsible,
            ],
        )?;
        let stored = tx.query_row(
            "SELECT master_id, recurrence_id, kind, status, date, start_time, end_time, responsible
             FROM event_exception WHERE master_id = ?1 AND recurrence_id = ?2",
            params![master_id.0, recurrence_id],
            exception_from_row,
        )?;
        tx.commit()?;
        Ok(stored)
    }

    fn split_series(&self, split: SeriesSplit) -> Result<Option<MasterEvent>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let expected = i64::try_from(split.expected_version)
            .map_err(|_| AgendaError::validation("version out of range"))?;
        let changed = match &split.truncated_rule {
            Some(rule) => tx.execute(
                "UPDATE master_event SET rule = ?1, version = version + 1
                 WHERE id = ?2 AND tenant_id = ?3 AND version = ?4",
                params![rule, split.master_id.0, split.tenant.0, expected],
            )?,
            None => tx.execute(
                "DELETE FROM master_event WHERE id = ?1 AND tenant_id = ?2 AND version = ?3",
                params![split.master_id.0, split.tenant.0, expected],
            )?,
        };
        if changed == 0 {
            // Dropping `tx` rolls back.
            return match fetch_master(&tx, split.tenant, split.master_id)? {
                Some(current) => Err(AgendaError::conflict(format!(
                    "event {} is at version {}, expected {}",
                    split.master_id, current.version, split.expected_version
                ))),
                None => Err(AgendaError::not_found(format!("event {}", split.master_id))),
            };
        }

        // Cascades already removed the children of a deleted master.
        tx.execute(
            "DELETE FROM event_exclusion WHERE master_id = ?1 AND date >= ?2",
            params![split.master_id.0, split.at],
        )?;
        tx.execute(
            "DELETE FROM event_exception WHERE master_id = ?1 AND recurrence_id >= ?2",
            params![split.master_id.0, split.at],
        )?;

        let continuation = match &split.continuation {
            Some(c) => {
                let id = insert_row(&tx, &c.event)?;
                for date in &c.exclusions {
                    tx.execute(
                        "INSERT INTO event_exclusion (master_id, date) VALUES (?1, ?2)",
                        params![id.0, date],
                    )?;
                }
                Some(require_master(&tx, c.event.tenant, id)?)
            }
            None => None,
        };

        tx.commit()?;
        Ok(continuation)
    }

    fn delete(&self, tenant: TenantId, id: EventId) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM master_event WHERE id = ?1 AND tenant_id = ?2",
            params![id.0, tenant.0],
        )?;
        Ok(deleted > 0)
    }
}
