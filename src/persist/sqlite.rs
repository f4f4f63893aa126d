//! SQLite-backed append-only ledger journal.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::{
    op::{LedgerEvent, StoredEvent, StoredEventEnvelope},
    types::{ClinicId, EventSeq, PatientId, SessionId, now_ms},
};

use super::{JournalError, JournalResult, JournalSession, JournalSink, SessionOutcome};

/// SQLite implementation of [`crate::persist::JournalSink`].
pub struct SqliteJournal {
    conn: Connection,
}

impl SqliteJournal {
    /// Opens or creates a journal at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory journal.
    pub fn open_in_memory() -> JournalResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> JournalResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Sessions that were opened and never closed, oldest first.
    pub fn load_open_sessions(&self) -> JournalResult<Vec<JournalSession>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, clinic_id, patient_id, opened_ms FROM sessions WHERE closed_ms IS NULL ORDER BY opened_ms ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let clinic_id: String = row.get(1)?;
            let patient_id: String = row.get(2)?;
            let opened_ms: i64 = row.get(3)?;
            Ok((id, clinic_id, patient_id, opened_ms))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, clinic_id, patient_id, opened_ms) = row?;
            let id = Uuid::parse_str(&id).map_err(|e| JournalError::Message(format!("bad session id {id}: {e}")))?;
            out.push(JournalSession {
                id: SessionId(id),
                clinic_id: ClinicId(clinic_id),
                patient_id: PatientId(patient_id),
                opened_ms: opened_ms as u64,
            });
        }
        Ok(out)
    }

    /// Events of `session` in sequence order.
    pub fn load_events(&self, session: SessionId) -> JournalResult<Vec<StoredEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, ts_ms, payload FROM events WHERE session_id = ?1 ORDER BY seq ASC")?;

        let rows = stmt.query_map(params![session.to_string()], |row| {
            let seq: i64 = row.get(0)?;
            let ts_ms: i64 = row.get(1)?;
            let payload: Vec<u8> = row.get(2)?;
            let mut stored = decode_event_payload(&payload).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    payload.len(),
                    rusqlite::types::Type::Blob,
                    Box::new(std::io::Error::other(err)),
                )
            })?;
            stored.seq = seq as EventSeq;
            stored.ts_ms = ts_ms as u64;
            Ok(stored)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Latest sequence persisted for `session`.
    pub fn latest_seq(&self, session: SessionId) -> JournalResult<EventSeq> {
        let seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(seq) FROM events WHERE session_id = ?1",
                params![session.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(seq.unwrap_or(0) as EventSeq)
    }

    /// Outcome recorded for `session`, if closed.
    pub fn session_outcome(&self, session: SessionId) -> JournalResult<Option<String>> {
        let outcome: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT outcome FROM sessions WHERE id = ?1",
                params![session.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(outcome.flatten())
    }

    /// Deletes events of closed sessions, returning the number removed.
    pub fn compact_closed(&mut self) -> JournalResult<usize> {
        let count = self.conn.execute(
            "DELETE FROM events WHERE session_id IN (SELECT id FROM sessions WHERE closed_ms IS NOT NULL)",
            [],
        )?;
        Ok(count)
    }
}

impl JournalSink for SqliteJournal {
    fn open_session(&mut self, session: &JournalSession) -> JournalResult<()> {
        self.conn.execute(
            "INSERT INTO sessions(id, clinic_id, patient_id, opened_ms) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.id.to_string(),
                session.clinic_id.0,
                session.patient_id.0,
                session.opened_ms as i64,
            ],
        )?;
        Ok(())
    }

    fn append_events(&mut self, session: SessionId, events: &[StoredEvent]) -> JournalResult<EventSeq> {
        if events.is_empty() {
            return self.latest_seq(session);
        }

        let session_key = session.to_string();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO events(session_id, seq, ts_ms, kind, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for stored in events {
                let payload = serde_json::to_vec(&StoredEventEnvelope::new(stored.clone()))?;
                stmt.execute(params![
                    session_key,
                    stored.seq as i64,
                    stored.ts_ms as i64,
                    event_kind(&stored.event),
                    payload,
                ])?;
            }
        }
        tx.commit()?;

        Ok(events.last().map(|e| e.seq).unwrap_or(0))
    }

    fn close_session(&mut self, session: SessionId, outcome: SessionOutcome) -> JournalResult<()> {
        let updated = self.conn.execute(
            "UPDATE sessions SET closed_ms = ?2, outcome = ?3 WHERE id = ?1 AND closed_ms IS NULL",
            params![session.to_string(), now_ms() as i64, outcome.as_str()],
        )?;
        if updated == 0 {
            return Err(JournalError::Message(format!("session {session} is not open")));
        }
        Ok(())
    }

    fn flush(&mut self) -> JournalResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}

fn event_kind(event: &LedgerEvent) -> i64 {
    match event {
        LedgerEvent::Recorded { .. } => 1,
        LedgerEvent::Cancelled { .. } => 2,
        LedgerEvent::RecordRestored { .. } => 3,
        LedgerEvent::Uploaded { .. } => 4,
        LedgerEvent::Committed { .. } => 5,
        LedgerEvent::RolledBack { .. } => 6,
    }
}

fn decode_event_payload(payload: &[u8]) -> Result<StoredEvent, String> {
    let envelope = serde_json::from_slice::<StoredEventEnvelope>(payload)
        .map_err(|e| format!("event payload decode failed: {e}"))?;
    if envelope.format_version != crate::op::EVENT_FORMAT_VERSION {
        return Err(format!(
            "unsupported event format version: {}",
            envelope.format_version
        ));
    }
    Ok(envelope.stored)
}
