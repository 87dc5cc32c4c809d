//! Periodic graph upkeep: cached degrees and orphaned artifacts.

use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection};
use tracing::info;

use crate::errors::CradleResult;

/// Entries of this subtype never count towards the graph.
pub const VIRTUAL_SUBTYPE: &str = "virtual";

/// Recompute every entry's cached degree: the number of distinct entries it
/// shares a relation with. Returns how many degrees changed.
pub fn refresh_degrees(conn: &Connection) -> CradleResult<usize> {
    let mut neighbours: HashMap<i64, HashSet<i64>> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT e1, e2 FROM relations WHERE e1 != e2;")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let (e1, e2): (i64, i64) = (row.get(0)?, row.get(1)?);
            neighbours.entry(e1).or_default().insert(e2);
            neighbours.entry(e2).or_default().insert(e1);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT e.id, c.subtype, e.degree FROM entries e \
         JOIN entry_classes c ON c.id = e.class_id;",
    )?;
    let current = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let updates: Vec<(i64, i64)> = current
        .into_iter()
        .filter_map(|(id, subtype, degree)| {
            let fresh = if subtype == VIRTUAL_SUBTYPE {
                0
            } else {
                neighbours.get(&id).map_or(0, |n| n.len() as i64)
            };
            (fresh != degree).then_some((id, fresh))
        })
        .collect();

    let tx = conn.unchecked_transaction()?;
    {
        let mut update = tx.prepare("UPDATE entries SET degree = ?1 WHERE id = ?2;")?;
        for (id, degree) in &updates {
            update.execute(params![degree, id])?;
        }
    }
    tx.commit()?;
    info!("refreshed degrees, {} entries changed", updates.len());
    Ok(updates.len())
}

/// Delete ARTIFACT entries that no content references and no relation
/// touches. Returns the number removed.
pub fn delete_hanging_artifacts(conn: &Connection) -> CradleResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM entries \
         WHERE class_id IN (SELECT id FROM entry_classes WHERE type = 'artifact') \
           AND NOT EXISTS (SELECT 1 FROM content_entries ce WHERE ce.entry_id = entries.id) \
           AND NOT EXISTS (SELECT 1 FROM relations r \
                           WHERE r.e1 = entries.id OR r.e2 = entries.id);",
        [],
    )?;
    if deleted > 0 {
        info!("deleted {deleted} hanging artifacts");
    }
    Ok(deleted)
}
