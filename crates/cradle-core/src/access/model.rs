//! Access vector model: offset allocation, vector derivation and
//! propagation along inherit-flagged relations.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::time::Instant;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::access::vector::AccessVector;
use crate::errors::{CradleError, CradleResult};
use crate::graph::aliases::direct_aliases;
use crate::models::{AccessType, ContentRef, Relation, UserIdentity};
use crate::store::records::{
    self, content_members, content_vector, get_entries, get_entry, inherit_children,
    inherit_parents, placeholders, relations_owned_by,
};

const MAX_ALLOCATION_ATTEMPTS: usize = 8;

// ---------------------------------------------------------------------------
// Offsets
// ---------------------------------------------------------------------------

/// Return the entry's non-zero offset, allocating `max + 1` on first use.
///
/// The write is guarded on the row still holding offset 0, so concurrent
/// allocators either lose the race (and read back the winner's offset) or
/// collide on the partial unique index and retry with a fresh maximum.
pub fn allocate_vector(conn: &Connection, entry_id: i64) -> CradleResult<i64> {
    allocate_with(conn, entry_id, next_free_offset)
}

fn next_free_offset(conn: &Connection) -> CradleResult<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(acvec_offset), 0) + 1 FROM entries;",
        [],
        |row| row.get(0),
    )?)
}

/// Allocation loop with the candidate read factored out; another allocator
/// may claim the candidate between the read and the guarded write.
fn allocate_with(
    conn: &Connection,
    entry_id: i64,
    mut candidate_for: impl FnMut(&Connection) -> CradleResult<i64>,
) -> CradleResult<i64> {
    for attempt in 0..MAX_ALLOCATION_ATTEMPTS {
        let current = get_entry(conn, entry_id)?.acvec_offset;
        if current != 0 {
            return Ok(current);
        }
        let candidate = candidate_for(conn)?;
        match conn.execute(
            "UPDATE entries SET acvec_offset = ?1 WHERE id = ?2 AND acvec_offset = 0;",
            params![candidate, entry_id],
        ) {
            Ok(_) => continue,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                debug!("offset {candidate} taken while allocating entry {entry_id}, attempt {attempt}");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(CradleError::Consistency(format!(
        "could not allocate an access vector offset for entry {entry_id}"
    )))
}

/// Persist an explicit offset. Overwriting a different non-zero offset is
/// rejected.
pub fn assign_offset(conn: &Connection, entry_id: i64, offset: i64) -> CradleResult<()> {
    let current = get_entry(conn, entry_id)?.acvec_offset;
    if current == offset {
        return Ok(());
    }
    if current != 0 {
        return Err(CradleError::Consistency(format!(
            "entry {entry_id} already owns offset {current}, refusing to assign {offset}"
        )));
    }
    match conn.execute(
        "UPDATE entries SET acvec_offset = ?1 WHERE id = ?2 AND acvec_offset = 0;",
        params![offset, entry_id],
    ) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            Err(CradleError::Consistency(format!(
                "offset {offset} is already owned by another entry"
            )))
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Vector derivation
// ---------------------------------------------------------------------------

/// Closure of an ENTITY's own bit with the bits of every entity it inherits
/// from or is aliased to. ARTIFACT entries contribute nothing.
pub fn entry_vector(conn: &Connection, entry_id: i64) -> CradleResult<AccessVector> {
    let mut vector = AccessVector::new();
    let mut visited: HashSet<i64> = HashSet::new();
    let mut queue: VecDeque<i64> = VecDeque::from([entry_id]);

    while let Some(current) = queue.pop_front() {
        if !visited.insert(current) {
            continue;
        }
        let entry = get_entry(conn, current)?;
        if !entry.is_entity() {
            continue;
        }
        vector.union_with(&AccessVector::for_offset(entry.acvec_offset));
        for next in inherit_parents(conn, current)?
            .into_iter()
            .chain(direct_aliases(conn, current)?)
        {
            if !visited.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    Ok(vector)
}

/// Union of the vectors of the ENTITY entries among `entry_ids`, or the
/// default vector when none are entities.
pub fn compute_vector(conn: &Connection, entry_ids: &[i64]) -> CradleResult<AccessVector> {
    let mut vector = AccessVector::new();
    for entry in get_entries(conn, entry_ids)? {
        if entry.is_entity() {
            vector.union_with(&entry_vector(conn, entry.id)?);
        }
    }
    if vector.is_empty() {
        return Ok(AccessVector::default_vector());
    }
    Ok(vector)
}

/// Entries a content object references: its members plus both endpoints of
/// the inherit relations it owns.
pub fn content_entries(conn: &Connection, content: &ContentRef) -> CradleResult<Vec<i64>> {
    let mut ids: BTreeSet<i64> = content_members(conn, content)?.into_iter().collect();
    for relation in relations_owned_by(conn, content)? {
        if relation.inherit_av {
            ids.insert(relation.e1);
            ids.insert(relation.e2);
        }
    }
    Ok(ids.into_iter().collect())
}

/// Vector a relation caches: its owner's, or its endpoints' when the owner
/// carries none.
fn relation_vector(
    conn: &Connection,
    relation: &Relation,
    content_vectors: &BTreeMap<ContentRef, AccessVector>,
) -> CradleResult<AccessVector> {
    match &relation.owner {
        Some(owner) if owner.carries_vector() => match content_vectors.get(owner) {
            Some(vector) => Ok(vector.clone()),
            None => content_vector(conn, owner),
        },
        _ => compute_vector(conn, &[relation.e1, relation.e2]),
    }
}

// ---------------------------------------------------------------------------
// Propagation
// ---------------------------------------------------------------------------

/// Limits applied to one propagation pass.
#[derive(Clone, Copy, Debug)]
pub struct PropagationLimits {
    pub deadline: Option<Instant>,
    pub max_visited: usize,
}

impl Default for PropagationLimits {
    fn default() -> Self {
        Self {
            deadline: None,
            max_visited: 50_000,
        }
    }
}

impl PropagationLimits {
    fn check(&self, origin: &str) -> CradleResult<()> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CradleError::Timeout(format!("propagation from {origin}")));
        }
        Ok(())
    }
}

/// Outcome of a propagation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    pub visited_entries: Vec<i64>,
    /// Content objects whose stored vector changed.
    pub affected: Vec<ContentRef>,
    pub relations_updated: usize,
}

/// Recompute everything whose vector depends on `entry_id`.
///
/// Walks alias links and inherit children breadth-first, collects contents
/// referencing any visited entry, recomputes their vectors and the cached
/// vectors of inherit relations, then writes the changed rows in a single
/// transaction. Relations without `inherit_av` keep the vector they were
/// created with.
pub fn propagate(
    conn: &Connection,
    entry_id: i64,
    limits: &PropagationLimits,
) -> CradleResult<PropagationReport> {
    let origin = format!("entry {entry_id}");
    get_entry(conn, entry_id)?;

    let mut visited: BTreeSet<i64> = BTreeSet::new();
    let mut queue: VecDeque<i64> = VecDeque::from([entry_id]);
    while let Some(current) = queue.pop_front() {
        if !visited.insert(current) {
            continue;
        }
        if visited.len() > limits.max_visited {
            return Err(CradleError::Consistency(format!(
                "propagation from {origin} exceeded {} visited entries",
                limits.max_visited
            )));
        }
        limits.check(&origin)?;
        for next in direct_aliases(conn, current)?
            .into_iter()
            .chain(inherit_children(conn, current)?)
        {
            if !visited.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    let visited: Vec<i64> = visited.into_iter().collect();

    let mut contents = affected_contents(conn, &visited)?;
    // Contents of other kinds hold no vector of their own.
    contents.retain(ContentRef::carries_vector);

    let mut content_vectors: BTreeMap<ContentRef, AccessVector> = BTreeMap::new();
    let mut changed_contents: Vec<(ContentRef, AccessVector)> = Vec::new();
    for content in &contents {
        limits.check(&origin)?;
        let fresh = compute_vector(conn, &content_entries(conn, content)?)?;
        if content_vector(conn, content)? != fresh {
            changed_contents.push((content.clone(), fresh.clone()));
        }
        content_vectors.insert(content.clone(), fresh);
    }

    let mut relations: BTreeMap<i64, Relation> = BTreeMap::new();
    for relation in records::relations_touching(conn, &visited)? {
        if relation.inherit_av {
            relations.insert(relation.id, relation);
        }
    }
    for content in &contents {
        for relation in relations_owned_by(conn, content)? {
            if relation.inherit_av {
                relations.insert(relation.id, relation);
            }
        }
    }
    let mut changed_relations: Vec<(i64, AccessVector)> = Vec::new();
    for relation in relations.values() {
        limits.check(&origin)?;
        let fresh = relation_vector(conn, relation, &content_vectors)?;
        if relation.access_vector != fresh {
            changed_relations.push((relation.id, fresh));
        }
    }

    limits.check(&origin)?;
    let tx = conn.unchecked_transaction()?;
    for (content, vector) in &changed_contents {
        records::set_content_vector(&tx, content, vector)?;
    }
    for (relation_id, vector) in &changed_relations {
        records::set_relation_vector(&tx, *relation_id, vector)?;
    }
    tx.commit()?;

    let report = PropagationReport {
        visited_entries: visited,
        affected: changed_contents.into_iter().map(|(c, _)| c).collect(),
        relations_updated: changed_relations.len(),
    };
    info!(
        "propagated {origin}: {} entries visited, {} contents and {} relations updated",
        report.visited_entries.len(),
        report.affected.len(),
        report.relations_updated
    );
    Ok(report)
}

/// Contents that reference any of `entry_ids` by membership or through an
/// owned inherit relation.
fn affected_contents(conn: &Connection, entry_ids: &[i64]) -> CradleResult<Vec<ContentRef>> {
    if entry_ids.is_empty() {
        return Ok(Vec::new());
    }
    let marks = placeholders(entry_ids.len());
    let sql = format!(
        "SELECT o.id, o.kind FROM content_objects o WHERE o.id IN ( \
             SELECT content_id FROM content_entries WHERE entry_id IN ({marks}) \
             UNION \
             SELECT content_id FROM relations \
             WHERE content_id IS NOT NULL AND inherit_av = 1 \
               AND (e1 IN ({marks}) OR e2 IN ({marks})) \
         ) ORDER BY o.id;"
    );
    let mut stmt = conn.prepare(&sql)?;
    let bound = entry_ids.iter().chain(entry_ids).chain(entry_ids);
    let contents = stmt
        .query_map(rusqlite::params_from_iter(bound), |row| {
            Ok(ContentRef::from_parts(&row.get::<_, String>(1)?, row.get(0)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(contents)
}

/// Recompute one content object's vector and the inherit relations it owns.
/// Returns whether the content vector changed.
pub fn propagate_content(conn: &Connection, content: &ContentRef) -> CradleResult<bool> {
    if !content.carries_vector() {
        let mut updated = 0usize;
        for relation in relations_owned_by(conn, content)? {
            if !relation.inherit_av {
                continue;
            }
            let fresh = compute_vector(conn, &[relation.e1, relation.e2])?;
            if relation.access_vector != fresh {
                records::set_relation_vector(conn, relation.id, &fresh)?;
                updated += 1;
            }
        }
        debug!("content {content} carries no vector, {updated} relations refreshed");
        return Ok(false);
    }

    let fresh = compute_vector(conn, &content_entries(conn, content)?)?;
    let changed = content_vector(conn, content)? != fresh;

    let tx = conn.unchecked_transaction()?;
    if changed {
        records::set_content_vector(&tx, content, &fresh)?;
    }
    for relation in relations_owned_by(&tx, content)? {
        if relation.inherit_av && relation.access_vector != fresh {
            records::set_relation_vector(&tx, relation.id, &fresh)?;
        }
    }
    tx.commit()?;
    Ok(changed)
}

// ---------------------------------------------------------------------------
// User side
// ---------------------------------------------------------------------------

/// Bits a user can read: the default bit plus the offsets of every entity
/// held at READ or better. `None` for admins, who see everything.
pub fn user_vector(conn: &Connection, user: &UserIdentity) -> CradleResult<Option<AccessVector>> {
    if user.is_admin {
        return Ok(None);
    }
    let mut stmt = conn.prepare(
        "SELECT e.acvec_offset FROM access a JOIN entries e ON e.id = a.entity_id \
         WHERE a.user_id = ?1 AND a.access_type IN (?2, ?3);",
    )?;
    let mut vector = AccessVector::default_vector();
    let offsets = stmt
        .query_map(
            params![
                user.id,
                AccessType::Read.as_str(),
                AccessType::ReadWrite.as_str()
            ],
            |row| row.get::<_, i64>(0),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for offset in offsets {
        if offset == 0 {
            warn!("user {} holds access on an entity without an offset", user.id);
        }
        vector.union_with(&AccessVector::for_offset(offset));
    }
    Ok(Some(vector))
}

/// Whether the content's stored vector is covered by the user's vector.
pub fn can_read_content(
    conn: &Connection,
    user: &UserIdentity,
    content: &ContentRef,
) -> CradleResult<bool> {
    let Some(user_bits) = user_vector(conn, user)? else {
        return Ok(true);
    };
    let exists: Option<i64> = conn
        .query_row(
            "SELECT id FROM content_objects WHERE id = ?1;",
            params![content.id()],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(CradleError::NotFound(format!("content {content}")));
    }
    let vector = if content.carries_vector() {
        content_vector(conn, content)?
    } else {
        compute_vector(conn, &content_entries(conn, content)?)?
    };
    Ok(vector.is_subset_of(&user_bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryType, RelationReason};
    use crate::store::records::{
        add_content_entry, create_content, create_entry, create_entry_class, create_relation,
        create_user, set_access, NewRelation,
    };
    use crate::store::schema::open_in_memory;

    struct Fixture {
        conn: Connection,
        entity_class: i64,
        artifact_class: i64,
    }

    fn fixture() -> Fixture {
        let conn = open_in_memory().unwrap();
        let entity_class = create_entry_class(&conn, "case", EntryType::Entity, None)
            .unwrap()
            .id;
        let artifact_class = create_entry_class(&conn, "ip", EntryType::Artifact, None)
            .unwrap()
            .id;
        Fixture {
            conn,
            entity_class,
            artifact_class,
        }
    }

    fn relation(e1: i64, e2: i64, inherit_av: bool, owner: &ContentRef) -> NewRelation {
        NewRelation {
            e1,
            e2,
            reason: RelationReason::Contains,
            inherit_av,
            access_vector: AccessVector::default_vector(),
            owner: Some(owner.clone()),
        }
    }

    #[test]
    fn test_allocate_vector_is_idempotent_and_unique() {
        let f = fixture();
        let a = create_entry(&f.conn, f.entity_class, "a", None).unwrap();
        let b = create_entry(&f.conn, f.entity_class, "b", None).unwrap();
        let first = allocate_vector(&f.conn, a.id).unwrap();
        let again = allocate_vector(&f.conn, a.id).unwrap();
        let other = allocate_vector(&f.conn, b.id).unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert!(first > 0 && other > 0);
    }

    #[test]
    fn test_allocation_retries_when_a_rival_takes_the_candidate() {
        let f = fixture();
        let mine = create_entry(&f.conn, f.entity_class, "mine", None).unwrap();
        let rival = create_entry(&f.conn, f.entity_class, "rival", None).unwrap();
        allocate_vector(&f.conn, create_entry(&f.conn, f.entity_class, "seed", None).unwrap().id)
            .unwrap();

        let mut reads = 0;
        let offset = allocate_with(&f.conn, mine.id, |conn| {
            reads += 1;
            let candidate = next_free_offset(conn)?;
            if reads == 1 {
                // A concurrent allocator lands between our read and write.
                conn.execute(
                    "UPDATE entries SET acvec_offset = ?1 WHERE id = ?2;",
                    params![candidate, rival.id],
                )?;
            }
            Ok(candidate)
        })
        .unwrap();

        let rival_offset = get_entry(&f.conn, rival.id).unwrap().acvec_offset;
        assert_eq!(reads, 2);
        assert_eq!(rival_offset, 2);
        assert_eq!(offset, 3);
        assert_eq!(get_entry(&f.conn, mine.id).unwrap().acvec_offset, 3);
    }

    #[test]
    fn test_allocation_gives_up_when_every_candidate_is_taken() {
        let f = fixture();
        let mine = create_entry(&f.conn, f.entity_class, "mine", None).unwrap();
        let taken = create_entry(&f.conn, f.entity_class, "taken", None).unwrap();
        let taken_offset = allocate_vector(&f.conn, taken.id).unwrap();

        let result = allocate_with(&f.conn, mine.id, |_| Ok(taken_offset));
        assert!(matches!(result, Err(CradleError::Consistency(_))));
        assert_eq!(get_entry(&f.conn, mine.id).unwrap().acvec_offset, 0);
    }

    #[test]
    fn test_assign_offset_rejects_second_offset() {
        let f = fixture();
        let a = create_entry(&f.conn, f.entity_class, "a", None).unwrap();
        let b = create_entry(&f.conn, f.entity_class, "b", None).unwrap();
        let offset = allocate_vector(&f.conn, a.id).unwrap();
        assert!(matches!(
            assign_offset(&f.conn, a.id, offset + 10),
            Err(CradleError::Consistency(_))
        ));
        assert!(matches!(
            assign_offset(&f.conn, b.id, offset),
            Err(CradleError::Consistency(_))
        ));
        assign_offset(&f.conn, a.id, offset).unwrap();
    }

    #[test]
    fn test_compute_vector_ignores_artifacts() {
        let f = fixture();
        let entity = create_entry(&f.conn, f.entity_class, "entity", None).unwrap();
        let artifact = create_entry(&f.conn, f.artifact_class, "1.2.3.4", None).unwrap();
        let offset = allocate_vector(&f.conn, entity.id).unwrap() as usize;

        let with_artifact = compute_vector(&f.conn, &[entity.id, artifact.id]).unwrap();
        let without = compute_vector(&f.conn, &[entity.id]).unwrap();
        assert_eq!(with_artifact, without);
        assert_eq!(with_artifact.bits().collect::<Vec<_>>(), vec![offset]);
        assert_eq!(
            compute_vector(&f.conn, &[artifact.id]).unwrap(),
            AccessVector::default_vector()
        );
        assert_eq!(compute_vector(&f.conn, &[]).unwrap(), AccessVector::default_vector());
    }

    #[test]
    fn test_entry_vector_terminates_on_inherit_cycles() {
        let f = fixture();
        let a = create_entry(&f.conn, f.entity_class, "a", None).unwrap();
        let b = create_entry(&f.conn, f.entity_class, "b", None).unwrap();
        let oa = allocate_vector(&f.conn, a.id).unwrap() as usize;
        let ob = allocate_vector(&f.conn, b.id).unwrap() as usize;
        let note = create_content(&f.conn, "note").unwrap();
        create_relation(&f.conn, &relation(a.id, b.id, true, &note)).unwrap();
        create_relation(&f.conn, &relation(b.id, a.id, true, &note)).unwrap();

        let vector = entry_vector(&f.conn, a.id).unwrap();
        assert!(vector.contains(oa) && vector.contains(ob));
    }

    #[test]
    fn test_propagation_stops_at_non_inheriting_relation() {
        let f = fixture();
        let x = create_entry(&f.conn, f.entity_class, "x", None).unwrap();
        let peer = create_entry(&f.conn, f.entity_class, "peer", None).unwrap();
        let n1 = create_content(&f.conn, "note").unwrap();
        let n2 = create_content(&f.conn, "note").unwrap();
        let (r1, _) = create_relation(&f.conn, &relation(x.id, peer.id, true, &n1)).unwrap();
        let (r2, _) = create_relation(&f.conn, &relation(x.id, peer.id, false, &n2)).unwrap();
        let limits = PropagationLimits::default();
        propagate(&f.conn, x.id, &limits).unwrap();
        let n2_before = content_vector(&f.conn, &n2).unwrap();

        let offset = allocate_vector(&f.conn, x.id).unwrap() as usize;
        let report = propagate(&f.conn, x.id, &limits).unwrap();

        assert_eq!(report.affected, vec![n1.clone()]);
        assert!(content_vector(&f.conn, &n1).unwrap().contains(offset));
        assert_eq!(content_vector(&f.conn, &n2).unwrap(), n2_before);
        let r1 = records::get_relation(&f.conn, r1.id).unwrap();
        let r2 = records::get_relation(&f.conn, r2.id).unwrap();
        assert!(r1.access_vector.contains(offset));
        assert_eq!(r2.access_vector, AccessVector::default_vector());
    }

    #[test]
    fn test_propagate_twice_changes_nothing_the_second_time() {
        let f = fixture();
        let parent = create_entry(&f.conn, f.entity_class, "parent", None).unwrap();
        let child = create_entry(&f.conn, f.entity_class, "child", None).unwrap();
        let note = create_content(&f.conn, "note").unwrap();
        add_content_entry(&f.conn, &note, child.id).unwrap();
        create_relation(&f.conn, &relation(child.id, parent.id, true, &note)).unwrap();
        allocate_vector(&f.conn, parent.id).unwrap();

        let limits = PropagationLimits::default();
        let first = propagate(&f.conn, parent.id, &limits).unwrap();
        let vector_after_first = content_vector(&f.conn, &note).unwrap();
        let second = propagate(&f.conn, parent.id, &limits).unwrap();

        assert_eq!(first.affected, vec![note.clone()]);
        assert!(second.affected.is_empty());
        assert_eq!(second.relations_updated, 0);
        assert_eq!(content_vector(&f.conn, &note).unwrap(), vector_after_first);
    }

    #[test]
    fn test_propagate_reaches_inherit_children_members() {
        let f = fixture();
        let parent = create_entry(&f.conn, f.entity_class, "parent", None).unwrap();
        let child = create_entry(&f.conn, f.entity_class, "child", None).unwrap();
        let scan = create_content(&f.conn, "digest").unwrap();
        create_relation(&f.conn, &relation(child.id, parent.id, true, &scan)).unwrap();
        let note = create_content(&f.conn, "note").unwrap();
        add_content_entry(&f.conn, &note, child.id).unwrap();

        let offset = allocate_vector(&f.conn, parent.id).unwrap() as usize;
        let report = propagate(&f.conn, parent.id, &PropagationLimits::default()).unwrap();

        assert!(report.visited_entries.contains(&child.id));
        assert!(content_vector(&f.conn, &note).unwrap().contains(offset));
    }

    #[test]
    fn test_expired_deadline_aborts_before_writing() {
        let f = fixture();
        let x = create_entry(&f.conn, f.entity_class, "x", None).unwrap();
        let note = create_content(&f.conn, "note").unwrap();
        add_content_entry(&f.conn, &note, x.id).unwrap();
        allocate_vector(&f.conn, x.id).unwrap();
        let before = content_vector(&f.conn, &note).unwrap();

        let limits = PropagationLimits {
            deadline: Some(Instant::now()),
            max_visited: 10,
        };
        assert!(matches!(
            propagate(&f.conn, x.id, &limits),
            Err(CradleError::Timeout(_))
        ));
        assert_eq!(content_vector(&f.conn, &note).unwrap(), before);
    }

    #[test]
    fn test_user_vector_and_content_visibility() {
        let f = fixture();
        let reader = create_user(&f.conn, "reader", false).unwrap();
        let blocked = create_user(&f.conn, "blocked", false).unwrap();
        let entity = create_entry(&f.conn, f.entity_class, "entity", None).unwrap();
        let offset = allocate_vector(&f.conn, entity.id).unwrap() as usize;
        set_access(&f.conn, reader.id, entity.id, AccessType::Read).unwrap();
        set_access(&f.conn, blocked.id, entity.id, AccessType::None).unwrap();

        let note = create_content(&f.conn, "note").unwrap();
        add_content_entry(&f.conn, &note, entity.id).unwrap();
        propagate_content(&f.conn, &note).unwrap();

        let reader_bits = user_vector(&f.conn, &reader.identity()).unwrap().unwrap();
        assert!(reader_bits.contains(0) && reader_bits.contains(offset));
        assert!(can_read_content(&f.conn, &reader.identity(), &note).unwrap());
        assert!(!can_read_content(&f.conn, &blocked.identity(), &note).unwrap());
        assert!(user_vector(&f.conn, &UserIdentity::new(99, true))
            .unwrap()
            .is_none());
    }
}
