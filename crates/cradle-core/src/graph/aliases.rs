//! Alias groups: symmetric, transitive equivalence between entries.

use std::collections::{BTreeSet, VecDeque};

use rusqlite::{params, params_from_iter, Connection};
use tracing::info;

use crate::errors::{CradleError, CradleResult};
use crate::jobs::policy::JobKind;
use crate::jobs::queue::JobQueue;
use crate::models::{ContentRef, Entry, Relation};
use crate::store::records::{self, get_entry, placeholders};

/// Entries linked to `entry_id` by a single alias row, in either direction.
pub fn direct_aliases(conn: &Connection, entry_id: i64) -> CradleResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT alias_id FROM entry_aliases WHERE entry_id = ?1 \
         UNION SELECT entry_id FROM entry_aliases WHERE alias_id = ?1;",
    )?;
    let ids = stmt
        .query_map(params![entry_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Every entry reachable through alias links, `entry_id` included, ascending.
pub fn alias_group(conn: &Connection, entry_id: i64) -> CradleResult<Vec<i64>> {
    let mut group: BTreeSet<i64> = BTreeSet::new();
    let mut queue: VecDeque<i64> = VecDeque::from([entry_id]);
    while let Some(current) = queue.pop_front() {
        if !group.insert(current) {
            continue;
        }
        for next in direct_aliases(conn, current)? {
            if !group.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    Ok(group.into_iter().collect())
}

/// Lowest-id member of the entry's alias group.
pub fn canonical_entry(conn: &Connection, entry_id: i64) -> CradleResult<Entry> {
    let group = alias_group(conn, entry_id)?;
    let canonical = group.first().copied().unwrap_or(entry_id);
    get_entry(conn, canonical)
}

/// Link `a` and `b` as aliases and schedule propagation for both sides.
/// Neither entry is deleted; the canonical member of the merged group is
/// returned.
pub fn merge_aliases(
    conn: &Connection,
    queue: &dyn JobQueue,
    a: i64,
    b: i64,
) -> CradleResult<Entry> {
    if a == b {
        return Err(CradleError::Consistency(format!(
            "entry {a} cannot be its own alias"
        )));
    }
    let left = get_entry(conn, a)?;
    let right = get_entry(conn, b)?;
    if left.entry_type != right.entry_type {
        return Err(CradleError::Consistency(format!(
            "cannot alias {} entry {a} to {} entry {b}",
            left.entry_type.as_str(),
            right.entry_type.as_str()
        )));
    }

    let (low, high) = if a < b { (a, b) } else { (b, a) };
    let already_linked = alias_group(conn, low)?.contains(&high);
    if !already_linked {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO entry_aliases(entry_id, alias_id) VALUES (?1, ?2);",
            params![low, high],
        )?;
        queue.submit(JobKind::UpdateAccesses { entry_id: a })?;
        queue.submit(JobKind::UpdateAccesses { entry_id: b })?;
        tx.commit()?;
        info!("merged alias group of entries {a} and {b}");
    }
    canonical_entry(conn, a)
}

/// Relations touching any member of the entry's alias group.
pub fn group_relations(conn: &Connection, entry_id: i64) -> CradleResult<Vec<Relation>> {
    let group = alias_group(conn, entry_id)?;
    records::relations_touching(conn, &group)
}

/// Content objects having any member of the entry's alias group as a member.
pub fn group_contents(conn: &Connection, entry_id: i64) -> CradleResult<Vec<ContentRef>> {
    let group = alias_group(conn, entry_id)?;
    let sql = format!(
        "SELECT DISTINCT o.id, o.kind FROM content_entries ce \
         JOIN content_objects o ON o.id = ce.content_id \
         WHERE ce.entry_id IN ({}) ORDER BY o.id;",
        placeholders(group.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let contents = stmt
        .query_map(params_from_iter(group.iter()), |row| {
            Ok(ContentRef::from_parts(&row.get::<_, String>(1)?, row.get(0)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::policy::SchedulingPolicy;
    use crate::jobs::queue::{MemoryJobQueue, SqliteJobQueue};
    use crate::models::EntryType;
    use crate::store::records::{
        add_content_entry, create_content, create_entry, create_entry_class,
    };
    use crate::store::schema::open_in_memory;

    #[test]
    fn test_alias_chain_and_cycle_resolve_to_lowest_id() {
        let conn = open_in_memory().unwrap();
        let queue = MemoryJobQueue::default();
        let class = create_entry_class(&conn, "actor", EntryType::Entity, None).unwrap();
        let a = create_entry(&conn, class.id, "apt1", None).unwrap();
        let b = create_entry(&conn, class.id, "comment crew", None).unwrap();
        let c = create_entry(&conn, class.id, "byzantine candor", None).unwrap();

        merge_aliases(&conn, &queue, c.id, b.id).unwrap();
        merge_aliases(&conn, &queue, b.id, a.id).unwrap();
        // closing the cycle is a no-op
        let canonical = merge_aliases(&conn, &queue, c.id, a.id).unwrap();

        assert_eq!(canonical.id, a.id);
        for member in [a.id, b.id, c.id] {
            assert_eq!(alias_group(&conn, member).unwrap(), vec![a.id, b.id, c.id]);
        }
        assert_eq!(queue.pending_count().unwrap(), 3);
    }

    #[test]
    fn test_merge_rejects_self_and_mixed_types() {
        let conn = open_in_memory().unwrap();
        let queue = MemoryJobQueue::default();
        let entity = create_entry_class(&conn, "actor", EntryType::Entity, None).unwrap();
        let artifact = create_entry_class(&conn, "domain", EntryType::Artifact, None).unwrap();
        let a = create_entry(&conn, entity.id, "a", None).unwrap();
        let d = create_entry(&conn, artifact.id, "a.example", None).unwrap();

        assert!(matches!(
            merge_aliases(&conn, &queue, a.id, a.id),
            Err(CradleError::Consistency(_))
        ));
        assert!(matches!(
            merge_aliases(&conn, &queue, a.id, d.id),
            Err(CradleError::Consistency(_))
        ));
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_failed_submit_leaves_no_alias_link() {
        let conn = open_in_memory().unwrap();
        let policy = SchedulingPolicy::default();
        let queue = SqliteJobQueue::new(&conn, &policy);
        let class = create_entry_class(&conn, "actor", EntryType::Entity, None).unwrap();
        let a = create_entry(&conn, class.id, "a", None).unwrap();
        let b = create_entry(&conn, class.id, "b", None).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER refuse_jobs BEFORE INSERT ON jobs \
             BEGIN SELECT RAISE(ABORT, 'outbox offline'); END;",
        )
        .unwrap();

        assert!(merge_aliases(&conn, &queue, a.id, b.id).is_err());
        assert_eq!(alias_group(&conn, a.id).unwrap(), vec![a.id]);
    }

    #[test]
    fn test_group_contents_resolve_through_any_member() {
        let conn = open_in_memory().unwrap();
        let queue = MemoryJobQueue::default();
        let class = create_entry_class(&conn, "actor", EntryType::Entity, None).unwrap();
        let a = create_entry(&conn, class.id, "a", None).unwrap();
        let b = create_entry(&conn, class.id, "b", None).unwrap();
        let note = create_content(&conn, "note").unwrap();
        add_content_entry(&conn, &note, b.id).unwrap();

        assert!(group_contents(&conn, a.id).unwrap().is_empty());
        merge_aliases(&conn, &queue, a.id, b.id).unwrap();
        assert_eq!(group_contents(&conn, a.id).unwrap(), vec![note]);
    }
}
