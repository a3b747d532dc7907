use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use xpchat_shared::types::{CallId, CallKind, UserId};

use crate::database::{conversion_error, parse_opt_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{CallRecord, CallStatus};

const CALL_COLUMNS: &str =
    "id, caller_id, receiver_id, call_type, status, start_time, end_time, duration";

impl Database {
    pub fn insert_call(&self, call: &CallRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO calls (id, caller_id, receiver_id, call_type, status,
                                start_time, end_time, duration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                call.id.0.to_string(),
                call.caller_id.as_str(),
                call.receiver_id.as_str(),
                call.call_type.as_str(),
                call.status.as_str(),
                call.start_time.to_rfc3339(),
                call.end_time.map(|t| t.to_rfc3339()),
                call.duration,
            ],
        )?;
        Ok(())
    }

    /// Move a call to `status`. When `ended_at` is given the end time is
    /// stamped and the duration (whole seconds since `start_time`) computed.
    pub fn update_call_status(
        &self,
        id: CallId,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<CallRecord> {
        let mut call = self.get_call(id)?.ok_or(StoreError::NotFound)?;

        call.status = status;
        if let Some(end) = ended_at {
            call.end_time = Some(end);
            call.duration = Some((end - call.start_time).num_seconds().max(0));
        }

        self.conn().execute(
            "UPDATE calls SET status = ?1, end_time = ?2, duration = ?3 WHERE id = ?4",
            params![
                call.status.as_str(),
                call.end_time.map(|t| t.to_rfc3339()),
                call.duration,
                id.0.to_string(),
            ],
        )?;
        Ok(call)
    }

    pub fn get_call(&self, id: CallId) -> Result<Option<CallRecord>> {
        let call = self
            .conn()
            .query_row(
                &format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?1"),
                params![id.0.to_string()],
                row_to_call,
            )
            .optional()?;
        Ok(call)
    }

    /// Calls where `user` was either side, newest first.
    pub fn call_history(&self, user: &UserId, limit: u32) -> Result<Vec<CallRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CALL_COLUMNS} FROM calls
             WHERE caller_id = ?1 OR receiver_id = ?1
             ORDER BY start_time DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user.as_str(), limit], row_to_call)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallRecord> {
    let id_str: String = row.get(0)?;
    let caller: String = row.get(1)?;
    let receiver: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let start: String = row.get(5)?;
    let end: Option<String> = row.get(6)?;

    let id = CallId::parse(&id_str).map_err(|e| conversion_error(0, e.to_string()))?;
    let call_type = CallKind::parse(&kind_str)
        .ok_or_else(|| conversion_error(3, format!("unknown call type '{kind_str}'")))?;
    let status = CallStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(4, format!("unknown call status '{status_str}'")))?;

    Ok(CallRecord {
        id,
        caller_id: UserId(caller),
        receiver_id: UserId(receiver),
        call_type,
        status,
        start_time: parse_ts(5, &start)?,
        end_time: parse_opt_ts(6, end)?,
        duration: row.get(7)?,
    })
}
