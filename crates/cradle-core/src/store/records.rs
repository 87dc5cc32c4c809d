//! Row-level helpers shared by the access, graph and job layers.
//!
//! Every function takes a borrowed connection and leaves transaction control
//! to the caller.

use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::access::vector::AccessVector;
use crate::errors::{CradleError, CradleResult};
use crate::models::{
    AccessRecord, AccessType, ClassFormat, ContentRef, Entry, EntryClass, EntryType, Relation,
    RelationReason, UserRecord,
};

/// Shared projection for [`Entry`] rows. `e` and `c` are the aliases the
/// predicate compiler emits.
pub const ENTRY_SELECT: &str = "SELECT e.id, e.name, e.class_id, c.subtype, c.type, \
     e.description, e.acvec_offset, e.degree \
     FROM entries e JOIN entry_classes c ON c.id = e.class_id";

const RELATION_SELECT: &str = "SELECT r.id, r.e1, r.e2, r.reason, r.inherit_av, \
     r.access_vector, r.content_id, o.kind, r.created_at \
     FROM relations r LEFT JOIN content_objects o ON o.id = r.content_id";

/// `?, ?, ?` for an `IN (…)` clause of `n` values.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let type_str: String = row.get(4)?;
    Ok(Entry {
        id: row.get(0)?,
        name: row.get(1)?,
        class_id: row.get(2)?,
        subtype: row.get(3)?,
        entry_type: if type_str == "artifact" {
            EntryType::Artifact
        } else {
            EntryType::Entity
        },
        description: row.get(5)?,
        acvec_offset: row.get(6)?,
        degree: row.get(7)?,
    })
}

fn row_to_relation(row: &Row<'_>) -> rusqlite::Result<Relation> {
    let reason: String = row.get(3)?;
    let content_id: Option<i64> = row.get(6)?;
    let kind: Option<String> = row.get(7)?;
    let owner = match (content_id, kind) {
        (Some(id), Some(kind)) => Some(ContentRef::from_parts(&kind, id)),
        _ => None,
    };
    Ok(Relation {
        id: row.get(0)?,
        e1: row.get(1)?,
        e2: row.get(2)?,
        reason: RelationReason::parse(&reason).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
        })?,
        inherit_av: row.get(4)?,
        access_vector: row.get(5)?,
        owner,
        created_at: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

pub fn create_user(conn: &Connection, username: &str, is_admin: bool) -> CradleResult<UserRecord> {
    conn.execute(
        "INSERT INTO users(username, is_admin) VALUES (?1, ?2);",
        params![username, is_admin],
    )?;
    Ok(UserRecord {
        id: conn.last_insert_rowid(),
        username: username.to_string(),
        is_admin,
    })
}

pub fn get_user(conn: &Connection, user_id: i64) -> CradleResult<UserRecord> {
    conn.query_row(
        "SELECT id, username, is_admin FROM users WHERE id = ?1;",
        params![user_id],
        |row| {
            Ok(UserRecord {
                id: row.get(0)?,
                username: row.get(1)?,
                is_admin: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| CradleError::NotFound(format!("user {user_id}")))
}

pub fn admin_ids(conn: &Connection) -> CradleResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM users WHERE is_admin = 1 ORDER BY id;")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Entry classes
// ---------------------------------------------------------------------------

fn format_columns(format: Option<&ClassFormat>) -> (Option<&'static str>, Option<String>) {
    match format {
        Some(ClassFormat::Regex(pattern)) => (Some("regex"), Some(pattern.clone())),
        Some(ClassFormat::Options(options)) => (Some("options"), Some(options.join("\n"))),
        None => (None, None),
    }
}

fn row_to_class(row: &Row<'_>) -> rusqlite::Result<EntryClass> {
    let type_str: String = row.get(2)?;
    let format: Option<String> = row.get(3)?;
    let rule: Option<String> = row.get(4)?;
    let format = match (format.as_deref(), rule) {
        (Some("regex"), Some(rule)) => Some(ClassFormat::Regex(rule)),
        (Some("options"), Some(rule)) => Some(ClassFormat::Options(
            rule.lines()
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        _ => None,
    };
    Ok(EntryClass {
        id: row.get(0)?,
        subtype: row.get(1)?,
        entry_type: if type_str == "artifact" {
            EntryType::Artifact
        } else {
            EntryType::Entity
        },
        format,
    })
}

pub fn create_entry_class(
    conn: &Connection,
    subtype: &str,
    entry_type: EntryType,
    format: Option<&ClassFormat>,
) -> CradleResult<EntryClass> {
    if let Some(ClassFormat::Regex(pattern)) = format {
        regex::Regex::new(pattern)?;
    }
    let (format_name, rule) = format_columns(format);
    conn.execute(
        "INSERT INTO entry_classes(subtype, type, format, rule) VALUES (?1, ?2, ?3, ?4);",
        params![subtype, entry_type.as_str(), format_name, rule],
    )?;
    Ok(EntryClass {
        id: conn.last_insert_rowid(),
        subtype: subtype.to_string(),
        entry_type,
        format: format.cloned(),
    })
}

pub fn get_entry_class(conn: &Connection, class_id: i64) -> CradleResult<EntryClass> {
    conn.query_row(
        "SELECT id, subtype, type, format, rule FROM entry_classes WHERE id = ?1;",
        params![class_id],
        row_to_class,
    )
    .optional()?
    .ok_or_else(|| CradleError::NotFound(format!("entry class {class_id}")))
}

pub fn class_by_subtype(conn: &Connection, subtype: &str) -> CradleResult<EntryClass> {
    conn.query_row(
        "SELECT id, subtype, type, format, rule FROM entry_classes WHERE subtype = ?1;",
        params![subtype],
        row_to_class,
    )
    .optional()?
    .ok_or_else(|| CradleError::NotFound(format!("entry class {subtype:?}")))
}

pub fn add_class_child(conn: &Connection, parent_id: i64, child_id: i64) -> CradleResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO entry_class_children(parent_id, child_id) VALUES (?1, ?2);",
        params![parent_id, child_id],
    )?;
    Ok(())
}

pub fn class_children(conn: &Connection, class_id: i64) -> CradleResult<Vec<EntryClass>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.subtype, c.type, c.format, c.rule \
         FROM entry_class_children cc JOIN entry_classes c ON c.id = cc.child_id \
         WHERE cc.parent_id = ?1 ORDER BY c.id;",
    )?;
    let classes = stmt
        .query_map(params![class_id], row_to_class)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(classes)
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

pub fn create_entry(
    conn: &Connection,
    class_id: i64,
    name: &str,
    description: Option<&str>,
) -> CradleResult<Entry> {
    conn.execute(
        "INSERT INTO entries(name, class_id, description) VALUES (?1, ?2, ?3);",
        params![name, class_id, description],
    )?;
    get_entry(conn, conn.last_insert_rowid())
}

pub fn get_entry(conn: &Connection, entry_id: i64) -> CradleResult<Entry> {
    conn.query_row(
        &format!("{ENTRY_SELECT} WHERE e.id = ?1;"),
        params![entry_id],
        row_to_entry,
    )
    .optional()?
    .ok_or_else(|| CradleError::NotFound(format!("entry {entry_id}")))
}

/// Fetch several entries at once. Missing ids are skipped.
pub fn get_entries(conn: &Connection, entry_ids: &[i64]) -> CradleResult<Vec<Entry>> {
    if entry_ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "{ENTRY_SELECT} WHERE e.id IN ({}) ORDER BY e.id;",
        placeholders(entry_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params_from_iter(entry_ids.iter()), row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Look up `(class, name)`, inserting the entry when absent. The flag is true
/// when the entry was created by this call.
pub fn get_or_create_entry(conn: &Connection, class_id: i64, name: &str) -> CradleResult<(Entry, bool)> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO entries(name, class_id) VALUES (?1, ?2);",
        params![name, class_id],
    )?;
    let entry = conn
        .query_row(
            &format!("{ENTRY_SELECT} WHERE e.class_id = ?1 AND e.name = ?2;"),
            params![class_id, name],
            row_to_entry,
        )
        .optional()?
        .ok_or_else(|| CradleError::NotFound(format!("entry {name:?} in class {class_id}")))?;
    Ok((entry, inserted > 0))
}

/// Direct inherit parents: the `e2` side of `entry_id`'s outgoing
/// `inherit_av` relations.
pub fn inherit_parents(conn: &Connection, entry_id: i64) -> CradleResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT e2 FROM relations WHERE e1 = ?1 AND inherit_av = 1 AND e2 != e1;",
    )?;
    let ids = stmt
        .query_map(params![entry_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Direct inherit children: the `e1` side of inherit relations pointing at
/// `entry_id`.
pub fn inherit_children(conn: &Connection, entry_id: i64) -> CradleResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT e1 FROM relations WHERE e2 = ?1 AND inherit_av = 1 AND e2 != e1;",
    )?;
    let ids = stmt
        .query_map(params![entry_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Content objects
// ---------------------------------------------------------------------------

/// Register a content object of the given kind and return its reference.
pub fn create_content(conn: &Connection, kind: &str) -> CradleResult<ContentRef> {
    let initial = match kind {
        "note" | "digest" => Some(AccessVector::default_vector()),
        _ => None,
    };
    conn.execute(
        "INSERT INTO content_objects(kind, access_vector) VALUES (?1, ?2);",
        params![kind, initial],
    )?;
    Ok(ContentRef::from_parts(kind, conn.last_insert_rowid()))
}

pub fn get_content(conn: &Connection, content_id: i64) -> CradleResult<ContentRef> {
    conn.query_row(
        "SELECT kind FROM content_objects WHERE id = ?1;",
        params![content_id],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|kind| ContentRef::from_parts(&kind, content_id))
    .ok_or_else(|| CradleError::NotFound(format!("content {content_id}")))
}

/// Delete a content object; its member rows and owned relations cascade.
pub fn delete_content(conn: &Connection, content: &ContentRef) -> CradleResult<()> {
    let deleted = conn.execute(
        "DELETE FROM content_objects WHERE id = ?1;",
        params![content.id()],
    )?;
    if deleted == 0 {
        return Err(CradleError::NotFound(format!("content {content}")));
    }
    Ok(())
}

pub fn add_content_entry(conn: &Connection, content: &ContentRef, entry_id: i64) -> CradleResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO content_entries(content_id, entry_id) VALUES (?1, ?2);",
        params![content.id(), entry_id],
    )?;
    Ok(())
}

pub fn content_members(conn: &Connection, content: &ContentRef) -> CradleResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT entry_id FROM content_entries WHERE content_id = ?1 ORDER BY entry_id;",
    )?;
    let ids = stmt
        .query_map(params![content.id()], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Stored vector of a content object. Contents without one read as the
/// default vector.
pub fn content_vector(conn: &Connection, content: &ContentRef) -> CradleResult<AccessVector> {
    conn.query_row(
        "SELECT access_vector FROM content_objects WHERE id = ?1;",
        params![content.id()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| CradleError::NotFound(format!("content {content}")))
}

pub fn set_content_vector(
    conn: &Connection,
    content: &ContentRef,
    vector: &AccessVector,
) -> CradleResult<()> {
    conn.execute(
        "UPDATE content_objects SET access_vector = ?1 WHERE id = ?2;",
        params![vector, content.id()],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

/// Fields of a relation to be inserted.
#[derive(Clone, Debug)]
pub struct NewRelation {
    pub e1: i64,
    pub e2: i64,
    pub reason: RelationReason,
    pub inherit_av: bool,
    pub access_vector: AccessVector,
    pub owner: Option<ContentRef>,
}

/// Insert a relation. An identical `(e1, e2, reason, owner)` row is reused
/// instead of duplicated, owner-less rows included; the flag is true when a
/// row was inserted.
pub fn create_relation(conn: &Connection, new: &NewRelation) -> CradleResult<(Relation, bool)> {
    let owner_id = new.owner.as_ref().map(ContentRef::id);
    // Conflicts land on idx_relations_identity, which folds a NULL owner to 0.
    let inserted = conn.execute(
        "INSERT INTO relations(e1, e2, reason, inherit_av, access_vector, content_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT DO NOTHING;",
        params![
            new.e1,
            new.e2,
            new.reason.as_str(),
            new.inherit_av,
            new.access_vector,
            owner_id
        ],
    )?;
    let relation_id = if inserted > 0 {
        conn.last_insert_rowid()
    } else {
        conn.query_row(
            "SELECT id FROM relations WHERE e1 = ?1 AND e2 = ?2 AND reason = ?3 \
             AND content_id IS ?4;",
            params![new.e1, new.e2, new.reason.as_str(), owner_id],
            |row| row.get(0),
        )?
    };
    Ok((get_relation(conn, relation_id)?, inserted > 0))
}

pub fn get_relation(conn: &Connection, relation_id: i64) -> CradleResult<Relation> {
    conn.query_row(
        &format!("{RELATION_SELECT} WHERE r.id = ?1;"),
        params![relation_id],
        row_to_relation,
    )
    .optional()?
    .ok_or_else(|| CradleError::NotFound(format!("relation {relation_id}")))
}

/// Every relation with either endpoint in `entry_ids`.
pub fn relations_touching(conn: &Connection, entry_ids: &[i64]) -> CradleResult<Vec<Relation>> {
    if entry_ids.is_empty() {
        return Ok(Vec::new());
    }
    let marks = placeholders(entry_ids.len());
    let sql = format!(
        "{RELATION_SELECT} WHERE r.e1 IN ({marks}) OR r.e2 IN ({marks}) ORDER BY r.id;"
    );
    let mut stmt = conn.prepare(&sql)?;
    let relations = stmt
        .query_map(
            params_from_iter(entry_ids.iter().chain(entry_ids.iter())),
            row_to_relation,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(relations)
}

pub fn relations_owned_by(conn: &Connection, content: &ContentRef) -> CradleResult<Vec<Relation>> {
    let mut stmt = conn.prepare(&format!(
        "{RELATION_SELECT} WHERE r.content_id = ?1 ORDER BY r.id;"
    ))?;
    let relations = stmt
        .query_map(params![content.id()], row_to_relation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(relations)
}

pub fn delete_relations_owned_by(
    conn: &Connection,
    content: &ContentRef,
    reason: RelationReason,
) -> CradleResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM relations WHERE content_id = ?1 AND reason = ?2;",
        params![content.id(), reason.as_str()],
    )?;
    Ok(deleted)
}

pub fn set_relation_vector(conn: &Connection, relation_id: i64, vector: &AccessVector) -> CradleResult<()> {
    conn.execute(
        "UPDATE relations SET access_vector = ?1 WHERE id = ?2;",
        params![vector, relation_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Access rows
// ---------------------------------------------------------------------------

/// Upsert the single access row for `(user, entity)`.
pub fn set_access(
    conn: &Connection,
    user_id: i64,
    entity_id: i64,
    access_type: AccessType,
) -> CradleResult<()> {
    conn.execute(
        "INSERT INTO access(user_id, entity_id, access_type) VALUES (?1, ?2, ?3) \
         ON CONFLICT(user_id, entity_id) DO UPDATE SET access_type = excluded.access_type;",
        params![user_id, entity_id, access_type.as_str()],
    )?;
    Ok(())
}

pub fn get_access(conn: &Connection, user_id: i64, entity_id: i64) -> CradleResult<Option<AccessType>> {
    let level: Option<String> = conn
        .query_row(
            "SELECT access_type FROM access WHERE user_id = ?1 AND entity_id = ?2;",
            params![user_id, entity_id],
            |row| row.get(0),
        )
        .optional()?;
    level.as_deref().map(AccessType::parse).transpose()
}

pub fn access_rows_for_user(conn: &Connection, user_id: i64) -> CradleResult<Vec<AccessRecord>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, access_type FROM access WHERE user_id = ?1 ORDER BY entity_id;",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(entity_id, level)| {
            Ok(AccessRecord {
                user_id,
                entity_id,
                access_type: AccessType::parse(&level)?,
            })
        })
        .collect()
}

/// Users holding exactly `access_type` on `entity_id`.
pub fn access_holders(
    conn: &Connection,
    entity_id: i64,
    access_type: AccessType,
) -> CradleResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM access WHERE entity_id = ?1 AND access_type = ?2 ORDER BY user_id;",
    )?;
    let ids = stmt
        .query_map(params![entity_id, access_type.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}
