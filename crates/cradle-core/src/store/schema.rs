//! SQLite schema DDL, connection setup and migration framework.

use std::sync::Arc;

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::errors::CradleResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 4;

/// Core DDL statements: 15 CREATE TABLE + 14 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (15) ─────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        is_admin INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE TABLE IF NOT EXISTS entry_classes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subtype TEXT NOT NULL UNIQUE,
        type TEXT NOT NULL CHECK (type IN ('entity', 'artifact')),
        format TEXT CHECK (format IS NULL OR format IN ('regex', 'options')),
        rule TEXT
    );",
    "CREATE TABLE IF NOT EXISTS entry_class_children (
        parent_id INTEGER NOT NULL REFERENCES entry_classes(id) ON DELETE CASCADE,
        child_id INTEGER NOT NULL REFERENCES entry_classes(id) ON DELETE CASCADE,
        PRIMARY KEY(parent_id, child_id)
    );",
    "CREATE TABLE IF NOT EXISTS entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        class_id INTEGER NOT NULL REFERENCES entry_classes(id) ON DELETE CASCADE,
        description TEXT,
        acvec_offset INTEGER NOT NULL DEFAULT 0 CHECK (acvec_offset >= 0),
        degree INTEGER NOT NULL DEFAULT 0,
        last_seen TEXT DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(class_id, name)
    );",
    "CREATE TABLE IF NOT EXISTS entry_aliases (
        entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        alias_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        PRIMARY KEY(entry_id, alias_id)
    );",
    "CREATE TABLE IF NOT EXISTS content_objects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        access_vector BLOB,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS content_entries (
        content_id INTEGER NOT NULL REFERENCES content_objects(id) ON DELETE CASCADE,
        entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        PRIMARY KEY(content_id, entry_id)
    );",
    "CREATE TABLE IF NOT EXISTS relations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        e1 INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        e2 INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        reason TEXT NOT NULL,
        inherit_av INTEGER NOT NULL DEFAULT 0,
        access_vector BLOB,
        content_id INTEGER REFERENCES content_objects(id) ON DELETE CASCADE,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(e1, e2, reason, content_id)
    );",
    "CREATE TABLE IF NOT EXISTS access (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        entity_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        access_type TEXT NOT NULL CHECK (access_type IN ('none', 'read', 'read-write')),
        PRIMARY KEY(user_id, entity_id)
    );",
    "CREATE TABLE IF NOT EXISTS notifications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        message TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        is_unread INTEGER NOT NULL DEFAULT 1,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS event_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        event_type TEXT NOT NULL,
        object_kind TEXT NOT NULL,
        object_id INTEGER NOT NULL,
        src_log_id INTEGER REFERENCES event_logs(id) ON DELETE SET NULL,
        details TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        dedup_key TEXT NOT NULL,
        queue TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 5,
        status TEXT NOT NULL DEFAULT 'queued',
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        next_attempt_at INTEGER NOT NULL DEFAULT 0,
        claimed_until INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS leases (
        key TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );",
    // ── indexes (14) ────────────────────────────────────────────────────
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_acvec_offset \
         ON entries(acvec_offset) WHERE acvec_offset != 0;",
    "CREATE INDEX IF NOT EXISTS idx_entries_name ON entries(name);",
    "CREATE INDEX IF NOT EXISTS idx_entries_class ON entries(class_id);",
    "CREATE INDEX IF NOT EXISTS idx_entries_last_seen ON entries(last_seen DESC);",
    "CREATE INDEX IF NOT EXISTS idx_entry_aliases_alias ON entry_aliases(alias_id);",
    "CREATE INDEX IF NOT EXISTS idx_content_entries_entry ON content_entries(entry_id);",
    "CREATE INDEX IF NOT EXISTS idx_relations_e1 ON relations(e1, inherit_av);",
    "CREATE INDEX IF NOT EXISTS idx_relations_e2 ON relations(e2, inherit_av);",
    "CREATE INDEX IF NOT EXISTS idx_relations_content ON relations(content_id, reason);",
    "CREATE INDEX IF NOT EXISTS idx_access_entity ON access(entity_id, access_type);",
    "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_event_logs_object ON event_logs(object_kind, object_id);",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_due ON jobs(status, next_attempt_at, priority);",
    "CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON jobs(dedup_key, status);",
];

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Enable foreign keys and register the scalar functions compiled
/// predicates call: `regexp(pattern, text)` for `iregex` and
/// `casefold(text)`, a Unicode lowercase for the other case-insensitive
/// lookups (SQLite's `LOWER` folds ASCII only).
pub fn prepare_connection(conn: &Connection) -> CradleResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let re: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                    .map(|text| re.is_match(text))
                    .unwrap_or(false),
                _ => false,
            };
            Ok(matched)
        },
    )?;
    conn.create_scalar_function(
        "casefold",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            Ok(match ctx.get_raw(0) {
                ValueRef::Text(bytes) => {
                    Some(String::from_utf8_lossy(bytes).to_lowercase())
                }
                _ => None,
            })
        },
    )?;
    Ok(())
}

/// Create every table and index, then run pending migrations.
pub fn init_schema(conn: &Connection) -> CradleResult<()> {
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    migrate_schema(conn)
}

/// Open a fully initialised in-memory store. Used by tests and benchmarks.
pub fn open_in_memory() -> CradleResult<Connection> {
    let conn = Connection::open_in_memory()?;
    prepare_connection(&conn)?;
    init_schema(&conn)?;
    Ok(conn)
}

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations from the current stored version up to
/// [`SCHEMA_VERSION`]. Each step is wrapped in a SAVEPOINT so a failure
/// rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> CradleResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT cradle_migrate_step;")?;

        let step_result = (|| -> CradleResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                2 => migrate_to_v2(conn)?,
                3 => migrate_to_v3(conn)?,
                4 => migrate_to_v4(conn)?,
                _ => {}
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT cradle_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT cradle_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT cradle_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                tracing::error!("schema migration to v{next_version} failed: {e}");
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Read the current schema version from `store_meta`.
/// Returns 0 when the key is absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> CradleResult<()> {
    conn.execute(
        "INSERT INTO store_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> CradleResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline, no-op.
fn migrate_to_v1(_conn: &Connection) -> CradleResult<()> {
    Ok(())
}

/// v1 -> v2: relations and notes written before vectors were cached get the
/// default vector.
fn migrate_to_v2(conn: &Connection) -> CradleResult<()> {
    conn.execute_batch(
        "UPDATE relations SET access_vector = X'01' WHERE access_vector IS NULL;
         UPDATE content_objects SET access_vector = X'01' \
             WHERE access_vector IS NULL AND kind IN ('note', 'digest');",
    )?;
    Ok(())
}

/// v2 -> v3: dedup lookups on the job outbox.
fn migrate_to_v3(conn: &Connection) -> CradleResult<()> {
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON jobs(dedup_key, status);")?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> CradleResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2;",
        rusqlite::params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// v3 -> v4: claim expiry on jobs, and one owner-less relation per
/// `(e1, e2, reason)`. NULL owners are distinct under the table's UNIQUE
/// constraint, so the identity index folds them to 0.
fn migrate_to_v4(conn: &Connection) -> CradleResult<()> {
    if !column_exists(conn, "jobs", "claimed_until")? {
        conn.execute_batch(
            "ALTER TABLE jobs ADD COLUMN claimed_until INTEGER NOT NULL DEFAULT 0;",
        )?;
    }
    conn.execute_batch(
        "DELETE FROM relations WHERE content_id IS NULL AND id NOT IN ( \
             SELECT MIN(id) FROM relations WHERE content_id IS NULL \
             GROUP BY e1, e2, reason);
         CREATE UNIQUE INDEX IF NOT EXISTS idx_relations_identity \
             ON relations(e1, e2, reason, IFNULL(content_id, 0));",
    )?;
    Ok(())
}
