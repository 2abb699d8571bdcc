//! Phase tracker operations
//!
//! A phase flag is only ever flipped false → true, by `mark_phase_complete`
//! inside the award coordinator's write transaction. The table trigger
//! rejects any update that would clear a flag or shrink the bonus total.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;

use super::map_sqlite_error;
use super::models::{current_timestamp, Phase, PhaseEventRow, PhaseRecordRow, PhaseState};
use crate::error::LedgerError;

fn phase_state(row: &Row, phase: Phase) -> Result<PhaseState, rusqlite::Error> {
    let p = phase.as_str();
    Ok(PhaseState {
        completed: row.get::<_, i64>(format!("{}_completed", p).as_str())? != 0,
        completed_at: row.get(format!("{}_completed_at", p).as_str())?,
        completed_by: row.get(format!("{}_completed_by", p).as_str())?,
        bonus_awarded: row.get(format!("{}_bonus", p).as_str())?,
    })
}

impl PhaseRecordRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            preparation: phase_state(row, Phase::Preparation)?,
            reflection: phase_state(row, Phase::Reflection)?,
            demonstration: phase_state(row, Phase::Demonstration)?,
            reflection_text: row.get("reflection_text")?,
            evidence_ref: row.get("evidence_ref")?,
            bonus_total: row.get("bonus_total")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl PhaseEventRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let phase: String = row.get("phase")?;
        let phase = phase.parse::<Phase>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
            )
        })?;

        Ok(Self {
            seq: row.get("seq")?,
            record_id: row.get("record_id")?,
            phase,
            actor_id: row.get("actor_id")?,
            note: row.get("note")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// What gets written when a phase completes
#[derive(Debug, Clone)]
pub struct PhaseCompletion<'a> {
    pub phase: Phase,
    pub actor_id: &'a str,
    pub bonus: i64,
    pub reflection_text: Option<&'a str>,
    pub evidence_ref: Option<&'a str>,
}

/// Get a phase record by ID
pub fn get_record(conn: &Connection, id: &str) -> Result<Option<PhaseRecordRow>, LedgerError> {
    conn.query_row(
        "SELECT * FROM phase_records WHERE id = ?",
        params![id],
        PhaseRecordRow::from_row,
    )
    .optional()
    .map_err(|e| map_sqlite_error("load phase record", e))
}

/// List a user's phase records, newest first
pub fn list_for_owner(conn: &Connection, owner_id: &str) -> Result<Vec<PhaseRecordRow>, LedgerError> {
    let mut stmt = conn
        .prepare("SELECT * FROM phase_records WHERE owner_id = ? ORDER BY created_at DESC, id")
        .map_err(|e| map_sqlite_error("prepare phase record list", e))?;

    let rows = stmt
        .query_map(params![owner_id], PhaseRecordRow::from_row)
        .map_err(|e| map_sqlite_error("list phase records", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlite_error("read phase record", e))?;

    Ok(rows)
}

/// Create a not-started phase record
pub fn create_record(tx: &Transaction<'_>, id: &str, owner_id: &str) -> Result<PhaseRecordRow, LedgerError> {
    if id.trim().is_empty() || owner_id.trim().is_empty() {
        return Err(LedgerError::InvalidInput("Record id and owner id are required".into()));
    }
    if get_record(tx, id)?.is_some() {
        return Err(LedgerError::InvalidInput(format!("Phase record {} already exists", id)));
    }

    let now = current_timestamp();
    tx.execute(
        "INSERT INTO phase_records (id, owner_id, created_at, updated_at) VALUES (?, ?, ?, ?)",
        params![id, owner_id, now, now],
    )
    .map_err(|e| map_sqlite_error("insert phase record", e))?;

    debug!(record_id = %id, owner_id = %owner_id, "Created phase record");

    get_record(tx, id)?
        .ok_or_else(|| LedgerError::Persistence(format!("Phase record {} missing after insert", id)))
}

/// Flip one phase flag to completed and add its bonus to the running total.
///
/// Only matches a row whose flag is still clear; the caller must have
/// re-checked the flag under the write lock.
pub fn mark_phase_complete(
    tx: &Transaction<'_>,
    record_id: &str,
    completion: &PhaseCompletion<'_>,
) -> Result<PhaseRecordRow, LedgerError> {
    let p = completion.phase.as_str();
    let sql = format!(
        r#"
        UPDATE phase_records
        SET {p}_completed = 1,
            {p}_completed_at = ?1,
            {p}_completed_by = ?2,
            {p}_bonus = ?3,
            bonus_total = bonus_total + ?3,
            reflection_text = COALESCE(?4, reflection_text),
            evidence_ref = COALESCE(?5, evidence_ref),
            updated_at = ?1
        WHERE id = ?6 AND {p}_completed = 0
        "#,
        p = p
    );

    let changed = tx
        .execute(
            &sql,
            params![
                current_timestamp(),
                completion.actor_id,
                completion.bonus,
                completion.reflection_text,
                completion.evidence_ref,
                record_id,
            ],
        )
        .map_err(|e| map_sqlite_error("mark phase complete", e))?;

    if changed != 1 {
        return Err(LedgerError::Persistence(format!(
            "Phase {} of record {} was not open for completion",
            p, record_id
        )));
    }

    let record = get_record(tx, record_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("Phase record {}", record_id)))?;
    record.check_invariants()?;
    Ok(record)
}

/// Append a phase completion to the audit trail
pub fn append_phase_event(
    tx: &Transaction<'_>,
    record_id: &str,
    phase: Phase,
    actor_id: &str,
    note: Option<&str>,
) -> Result<PhaseEventRow, LedgerError> {
    let created_at = current_timestamp();
    tx.execute(
        "INSERT INTO phase_events (record_id, phase, actor_id, note, created_at) VALUES (?, ?, ?, ?, ?)",
        params![record_id, phase.as_str(), actor_id, note, created_at],
    )
    .map_err(|e| map_sqlite_error("append phase event", e))?;

    Ok(PhaseEventRow {
        seq: tx.last_insert_rowid(),
        record_id: record_id.to_string(),
        phase,
        actor_id: actor_id.to_string(),
        note: note.map(str::to_string),
        created_at,
    })
}

/// Audit trail for a record in insertion order
pub fn list_phase_events(conn: &Connection, record_id: &str) -> Result<Vec<PhaseEventRow>, LedgerError> {
    let mut stmt = conn
        .prepare("SELECT * FROM phase_events WHERE record_id = ? ORDER BY seq ASC")
        .map_err(|e| map_sqlite_error("prepare phase event list", e))?;

    let rows = stmt
        .query_map(params![record_id], PhaseEventRow::from_row)
        .map_err(|e| map_sqlite_error("list phase events", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlite_error("read phase event", e))?;

    Ok(rows)
}
