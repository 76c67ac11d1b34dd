//! Outbox for alert notifications.
//!
//! Every committed batch writes one row per anomaly event and per changed
//! cluster, inside the same transaction as the data itself. The external
//! notification subsystem drains rows it has delivered, so a crash between
//! commit and delivery never loses an alert.

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::error;

use crate::alert::Notification;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct SpoolEntry {
    pub id: i64,
    pub kind: String,
    pub ref_id: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// Queue a notification on `conn` (normally an open transaction).
pub fn enqueue(conn: &Connection, note: &Notification) -> Result<()> {
    let payload = serde_json::to_string(note)?;
    conn.execute(
        "INSERT INTO alert_spool (kind, ref_id, payload_json) VALUES (?1, ?2, ?3)",
        params![note.kind(), note.ref_id().to_string(), payload],
    )?;
    Ok(())
}

/// Undispatched entries, oldest first.
pub fn pending(conn: &Connection, limit: usize) -> Result<Vec<SpoolEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, ref_id, payload_json, created_at FROM alert_spool
         WHERE dispatched = 0 ORDER BY id LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut entries = Vec::new();
    for r in rows {
        let (id, kind, ref_id, json, created_at) = r?;
        match serde_json::from_str(&json) {
            Ok(payload) => entries.push(SpoolEntry {
                id,
                kind,
                ref_id,
                payload,
                created_at,
            }),
            Err(e) => error!(id, error = %e, "unreadable alert spool entry"),
        }
    }
    Ok(entries)
}

/// Take up to `limit` undispatched entries and mark them dispatched.
pub fn drain(conn: &mut Connection, limit: usize) -> Result<Vec<SpoolEntry>> {
    let tx = conn.transaction()?;
    let entries = pending(&tx, limit)?;
    {
        let mut mark = tx.prepare("UPDATE alert_spool SET dispatched = 1 WHERE id = ?1")?;
        for e in &entries {
            mark.execute(params![e.id])?;
        }
    }
    tx.commit()?;
    Ok(entries)
}
