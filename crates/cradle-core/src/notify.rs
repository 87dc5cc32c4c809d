//! Persisted notifications and the edit event log.
//!
//! Delivery (mail, push) belongs to the host; this module only records.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::errors::CradleResult;
use crate::graph::aliases::alias_group;
use crate::models::{ContentRef, Entry, Relation};
use crate::store::records::{content_members, get_entry, get_user};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    AccessGranted {
        user: i64,
        entity: i64,
    },
    AccessRequest {
        user: i64,
        requesting_user: i64,
        entity: i64,
    },
    NewUser {
        user: i64,
        new_user: i64,
    },
    ReportRendered {
        user: i64,
        report_id: i64,
    },
    ReportProcessingError {
        user: i64,
        report_id: i64,
        error: String,
    },
}

impl Notification {
    pub fn recipient(&self) -> i64 {
        match self {
            Notification::AccessGranted { user, .. }
            | Notification::AccessRequest { user, .. }
            | Notification::NewUser { user, .. }
            | Notification::ReportRendered { user, .. }
            | Notification::ReportProcessingError { user, .. } => *user,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::AccessGranted { .. } => "access_granted",
            Notification::AccessRequest { .. } => "access_request",
            Notification::NewUser { .. } => "new_user",
            Notification::ReportRendered { .. } => "report_rendered",
            Notification::ReportProcessingError { .. } => "report_processing_error",
        }
    }

    /// Human-readable message, with names resolved at record time.
    pub fn render(&self, conn: &Connection) -> CradleResult<String> {
        Ok(match self {
            Notification::AccessGranted { entity, .. } => {
                let entity = get_entry(conn, *entity)?;
                format!("You have been granted access to entity {}", entity.name)
            }
            Notification::AccessRequest {
                requesting_user,
                entity,
                ..
            } => {
                let requester = get_user(conn, *requesting_user)?;
                let entity = get_entry(conn, *entity)?;
                format!(
                    "User {} has requested access for entity {}",
                    requester.username, entity.name
                )
            }
            Notification::NewUser { new_user, .. } => {
                let new_user = get_user(conn, *new_user)?;
                format!("New user {} has registered", new_user.username)
            }
            Notification::ReportRendered { report_id, .. } => {
                format!("Report {report_id} is ready")
            }
            Notification::ReportProcessingError {
                report_id, error, ..
            } => format!("Report {report_id} could not be processed: {error}"),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub user_id: i64,
    pub message: String,
    pub is_unread: bool,
    pub notification: Notification,
}

/// Persist `notification` for its recipient and return the row id.
pub fn record(conn: &Connection, notification: &Notification) -> CradleResult<i64> {
    let message = notification.render(conn)?;
    conn.execute(
        "INSERT INTO notifications(user_id, kind, message, payload_json) VALUES (?1, ?2, ?3, ?4);",
        params![
            notification.recipient(),
            notification.kind(),
            message,
            serde_json::to_string(notification)?
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn notifications_for(conn: &Connection, user_id: i64) -> CradleResult<Vec<NotificationRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, message, is_unread, payload_json FROM notifications \
         WHERE user_id = ?1 ORDER BY id DESC;",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(id, message, is_unread, payload)| {
            Ok(NotificationRecord {
                id,
                user_id,
                message,
                is_unread,
                notification: serde_json::from_str(&payload)?,
            })
        })
        .collect()
}

pub fn count_notifications(conn: &Connection, kind: &str) -> CradleResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE kind = ?1;",
        params![kind],
        |row| row.get(0),
    )?)
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct LogRef {
    pub kind: String,
    pub id: i64,
}

impl LogRef {
    fn entry(id: i64) -> Self {
        Self {
            kind: "entry".to_string(),
            id,
        }
    }
}

/// Something whose edits are logged and echoed onto its neighbours.
pub trait Loggable {
    fn log_ref(&self) -> LogRef;

    /// Objects that receive a propagated copy of this object's events.
    fn linked_loggables(&self, conn: &Connection) -> CradleResult<Vec<LogRef>>;
}

impl Loggable for Entry {
    fn log_ref(&self) -> LogRef {
        LogRef::entry(self.id)
    }

    fn linked_loggables(&self, conn: &Connection) -> CradleResult<Vec<LogRef>> {
        Ok(alias_group(conn, self.id)?
            .into_iter()
            .filter(|id| *id != self.id)
            .map(LogRef::entry)
            .collect())
    }
}

impl Loggable for ContentRef {
    fn log_ref(&self) -> LogRef {
        LogRef {
            kind: self.kind().to_string(),
            id: self.id(),
        }
    }

    fn linked_loggables(&self, conn: &Connection) -> CradleResult<Vec<LogRef>> {
        Ok(content_members(conn, self)?
            .into_iter()
            .map(LogRef::entry)
            .collect())
    }
}

impl Loggable for Relation {
    fn log_ref(&self) -> LogRef {
        LogRef {
            kind: "relation".to_string(),
            id: self.id,
        }
    }

    fn linked_loggables(&self, _conn: &Connection) -> CradleResult<Vec<LogRef>> {
        let mut linked = vec![LogRef::entry(self.e1)];
        if self.e2 != self.e1 {
            linked.push(LogRef::entry(self.e2));
        }
        Ok(linked)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub user_id: i64,
    pub event_type: String,
    pub object: LogRef,
    pub src_log_id: Option<i64>,
    pub details: Option<String>,
}

fn insert_event(
    conn: &Connection,
    user_id: i64,
    event_type: &str,
    object: &LogRef,
    src_log_id: Option<i64>,
    details: Option<&str>,
) -> CradleResult<i64> {
    conn.execute(
        "INSERT INTO event_logs(user_id, event_type, object_kind, object_id, src_log_id, details) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        params![user_id, event_type, object.kind, object.id, src_log_id, details],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Log an edit of `object` by `user_id`, plus one propagated event per linked
/// loggable pointing back at the original. Returns the original event id.
pub fn log_edit(
    conn: &Connection,
    user_id: i64,
    object: &dyn Loggable,
    details: Option<&str>,
) -> CradleResult<i64> {
    let tx = conn.unchecked_transaction()?;
    let origin = insert_event(&tx, user_id, "edit", &object.log_ref(), None, details)?;
    for linked in object.linked_loggables(&tx)? {
        insert_event(&tx, user_id, "edit", &linked, Some(origin), details)?;
    }
    tx.commit()?;
    Ok(origin)
}

pub fn events_for(conn: &Connection, object: &LogRef) -> CradleResult<Vec<EventRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, event_type, src_log_id, details FROM event_logs \
         WHERE object_kind = ?1 AND object_id = ?2 ORDER BY id;",
    )?;
    let events = stmt
        .query_map(params![object.kind, object.id], |row| {
            Ok(EventRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                event_type: row.get(2)?,
                object: object.clone(),
                src_log_id: row.get(3)?,
                details: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}
