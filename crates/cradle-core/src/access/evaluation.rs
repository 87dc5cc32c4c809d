//! Per-request access checks, queryable-set filtering, grants and access
//! requests.

use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::access::model::allocate_vector;
use crate::errors::{CradleError, CradleResult};
use crate::jobs::policy::JobKind;
use crate::jobs::queue::JobQueue;
use crate::models::{AccessType, Entry, EntryType, UserIdentity};
use crate::notify::{self, Notification};
use crate::query::predicate::{Field, Lookup, Predicate};
use crate::store::records::{
    access_holders, access_rows_for_user, admin_ids, get_access, get_entries, get_entry, get_user,
    set_access,
};

/// Entity ids a user may read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "ids", rename_all = "lowercase")]
pub enum AccessibleSet {
    All,
    Ids(BTreeSet<i64>),
}

impl AccessibleSet {
    pub fn contains(&self, entity_id: i64) -> bool {
        match self {
            AccessibleSet::All => true,
            AccessibleSet::Ids(ids) => ids.contains(&entity_id),
        }
    }
}

/// Load `entry_ids`, failing with `NotFound` if any of them is missing.
fn load_all(conn: &Connection, entry_ids: &[i64]) -> CradleResult<Vec<Entry>> {
    let unique: BTreeSet<i64> = entry_ids.iter().copied().collect();
    let ids: Vec<i64> = unique.iter().copied().collect();
    let entries = get_entries(conn, &ids)?;
    if entries.len() != ids.len() {
        let found: BTreeSet<i64> = entries.iter().map(|e| e.id).collect();
        let missing: Vec<i64> = unique.difference(&found).copied().collect();
        return Err(CradleError::NotFound(format!("entries {missing:?}")));
    }
    Ok(entries)
}

/// Entities among `entry_ids` the user does not hold `required` on.
pub fn inaccessible_entities(
    conn: &Connection,
    user: &UserIdentity,
    entry_ids: &[i64],
    required: &[AccessType],
) -> CradleResult<Vec<i64>> {
    let entries = load_all(conn, entry_ids)?;
    if user.is_admin {
        return Ok(Vec::new());
    }
    let mut denied = Vec::new();
    for entry in entries.iter().filter(|e| e.is_entity()) {
        let held = get_access(conn, user.id, entry.id)?;
        if !held.is_some_and(|level| level.satisfies(required)) {
            denied.push(entry.id);
        }
    }
    Ok(denied)
}

/// Whether the user holds one of `required` on every ENTITY in `entry_ids`.
/// ARTIFACT entries need no access rows. Unknown ids are `NotFound`, for
/// admins too.
pub fn has_access(
    conn: &Connection,
    user: &UserIdentity,
    entry_ids: &[i64],
    required: &[AccessType],
) -> CradleResult<bool> {
    Ok(inaccessible_entities(conn, user, entry_ids, required)?.is_empty())
}

/// `has_access` as a guard: `AccessDenied` listing the offending entities.
pub fn require_access(
    conn: &Connection,
    user: &UserIdentity,
    entry_ids: &[i64],
    required: &[AccessType],
) -> CradleResult<()> {
    let denied = inaccessible_entities(conn, user, entry_ids, required)?;
    if denied.is_empty() {
        Ok(())
    } else {
        debug!("user {} denied on {denied:?}", user.id);
        Err(CradleError::AccessDenied(denied))
    }
}

pub fn accessible_entity_ids(conn: &Connection, user: &UserIdentity) -> CradleResult<AccessibleSet> {
    if user.is_admin {
        return Ok(AccessibleSet::All);
    }
    let ids = access_rows_for_user(conn, user.id)?
        .into_iter()
        .filter(|row| row.access_type.satisfies(&[AccessType::Read]))
        .map(|row| row.entity_id)
        .collect();
    Ok(AccessibleSet::Ids(ids))
}

/// Keep the candidates the user may see: accessible entities, plus every
/// artifact when `artifacts_visible`.
pub fn filter_queryable(
    conn: &Connection,
    user: &UserIdentity,
    candidates: Vec<Entry>,
    artifacts_visible: bool,
) -> CradleResult<Vec<Entry>> {
    let accessible = accessible_entity_ids(conn, user)?;
    if accessible == AccessibleSet::All {
        return Ok(candidates);
    }
    Ok(candidates
        .into_iter()
        .filter(|entry| match entry.entry_type {
            EntryType::Entity => accessible.contains(entry.id),
            EntryType::Artifact => artifacts_visible,
        })
        .collect())
}

/// The `filter_queryable` rule as a predicate for SQL composition.
pub fn visibility_predicate(
    conn: &Connection,
    user: &UserIdentity,
    artifacts_visible: bool,
) -> CradleResult<Predicate> {
    let ids = match accessible_entity_ids(conn, user)? {
        AccessibleSet::All => return Ok(Predicate::All),
        AccessibleSet::Ids(ids) => ids,
    };
    let entities = Predicate::entry_type(EntryType::Entity)
        .and(Predicate::leaf(Field::Id, Lookup::In(ids.into_iter().collect())));
    let artifacts = if artifacts_visible {
        Predicate::entry_type(EntryType::Artifact)
    } else {
        Predicate::Nothing
    };
    Ok(entities.or(artifacts))
}

// ---------------------------------------------------------------------------
// Grants and requests
// ---------------------------------------------------------------------------

/// Set `user_id`'s level on `entity_id`.
///
/// The granter must be an admin or hold READ_WRITE on the entity. A non-NONE
/// grant allocates the entity's vector offset, notifies the grantee and
/// schedules propagation from the entity.
pub fn grant_access(
    conn: &Connection,
    queue: &dyn JobQueue,
    granter: &UserIdentity,
    user_id: i64,
    entity_id: i64,
    level: AccessType,
) -> CradleResult<()> {
    let entity = get_entry(conn, entity_id)?;
    if !entity.is_entity() {
        return Err(CradleError::Consistency(format!(
            "access rows apply to entities only, entry {entity_id} is an artifact"
        )));
    }
    if !granter.is_admin && get_access(conn, granter.id, entity_id)? != Some(AccessType::ReadWrite) {
        return Err(CradleError::AccessDenied(vec![entity_id]));
    }
    get_user(conn, user_id)?;

    let tx = conn.unchecked_transaction()?;
    set_access(&tx, user_id, entity_id, level)?;
    if level != AccessType::None {
        let offset = allocate_vector(&tx, entity_id)?;
        notify::record(
            &tx,
            &Notification::AccessGranted {
                user: user_id,
                entity: entity_id,
            },
        )?;
        queue.submit(JobKind::UpdateAccesses { entry_id: entity_id })?;
        debug!("entity {entity_id} uses offset {offset}");
    }
    tx.commit()?;
    info!(
        "user {} set {} access for user {user_id} on entity {entity_id}",
        granter.id,
        level.as_str()
    );
    Ok(())
}

/// Ask for access to `entity_id`. Notifies every admin and every READ_WRITE
/// holder except the requester; returns the number of notifications.
/// Admins and READ_WRITE holders asking again is a no-op.
pub fn request_access(
    conn: &Connection,
    requester: &UserIdentity,
    entity_id: i64,
) -> CradleResult<usize> {
    get_entry(conn, entity_id)?;
    if requester.is_admin || get_access(conn, requester.id, entity_id)? == Some(AccessType::ReadWrite) {
        return Ok(0);
    }

    let mut recipients: BTreeSet<i64> = admin_ids(conn)?.into_iter().collect();
    recipients.extend(access_holders(conn, entity_id, AccessType::ReadWrite)?);
    recipients.remove(&requester.id);

    let tx = conn.unchecked_transaction()?;
    for recipient in &recipients {
        notify::record(
            &tx,
            &Notification::AccessRequest {
                user: *recipient,
                requesting_user: requester.id,
                entity: entity_id,
            },
        )?;
    }
    tx.commit()?;
    info!(
        "user {} requested access to entity {entity_id}, {} notified",
        requester.id,
        recipients.len()
    );
    Ok(recipients.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::MemoryJobQueue;
    use crate::models::UserRecord;
    use crate::notify::{count_notifications, notifications_for};
    use crate::store::records::{create_entry, create_entry_class, create_user};
    use crate::store::schema::open_in_memory;

    struct Fixture {
        conn: Connection,
        admin: UserRecord,
        writer: UserRecord,
        reader: UserRecord,
        outsider: UserRecord,
        entity: Entry,
        artifact: Entry,
    }

    fn fixture() -> Fixture {
        let conn = open_in_memory().unwrap();
        let admin = create_user(&conn, "admin", true).unwrap();
        let writer = create_user(&conn, "writer", false).unwrap();
        let reader = create_user(&conn, "reader", false).unwrap();
        let outsider = create_user(&conn, "user0", false).unwrap();
        let case = create_entry_class(&conn, "case", EntryType::Entity, None).unwrap();
        let ip = create_entry_class(&conn, "ip", EntryType::Artifact, None).unwrap();
        let entity = create_entry(&conn, case.id, "entity", None).unwrap();
        let artifact = create_entry(&conn, ip.id, "10.0.0.1", None).unwrap();
        set_access(&conn, writer.id, entity.id, AccessType::ReadWrite).unwrap();
        set_access(&conn, reader.id, entity.id, AccessType::Read).unwrap();
        set_access(&conn, outsider.id, entity.id, AccessType::None).unwrap();
        Fixture {
            conn,
            admin,
            writer,
            reader,
            outsider,
            entity,
            artifact,
        }
    }

    #[test]
    fn test_has_access_follows_levels() {
        let f = fixture();
        let ids = [f.entity.id];
        let read = [AccessType::Read];
        assert!(has_access(&f.conn, &f.writer.identity(), &ids, &read).unwrap());
        assert!(has_access(&f.conn, &f.reader.identity(), &ids, &read).unwrap());
        assert!(!has_access(&f.conn, &f.outsider.identity(), &ids, &read).unwrap());
        assert!(!has_access(&f.conn, &f.reader.identity(), &ids, &[AccessType::ReadWrite]).unwrap());
        assert!(has_access(&f.conn, &f.admin.identity(), &ids, &[AccessType::ReadWrite]).unwrap());
    }

    #[test]
    fn test_artifacts_need_no_rows_and_missing_ids_are_not_found() {
        let f = fixture();
        let stranger = UserIdentity::new(999, false);
        assert!(has_access(&f.conn, &stranger, &[f.artifact.id], &[AccessType::ReadWrite]).unwrap());
        assert!(matches!(
            has_access(&f.conn, &stranger, &[f.artifact.id, 12345], &[AccessType::Read]),
            Err(CradleError::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_ids_are_not_found_for_admins_too() {
        let f = fixture();
        let read = [AccessType::Read];
        assert!(has_access(&f.conn, &f.admin.identity(), &[f.entity.id], &read).unwrap());
        assert!(matches!(
            has_access(&f.conn, &f.admin.identity(), &[f.entity.id, 9_999], &read),
            Err(CradleError::NotFound(_))
        ));
    }

    #[test]
    fn test_require_access_lists_denied_entities() {
        let f = fixture();
        let err = require_access(
            &f.conn,
            &f.outsider.identity(),
            &[f.entity.id, f.artifact.id],
            &[AccessType::Read],
        )
        .unwrap_err();
        assert!(matches!(err, CradleError::AccessDenied(ids) if ids == vec![f.entity.id]));
    }

    #[test]
    fn test_filter_queryable_keeps_artifacts_and_accessible_entities() {
        let f = fixture();
        let candidates = vec![f.entity.clone(), f.artifact.clone()];

        let visible =
            filter_queryable(&f.conn, &f.outsider.identity(), candidates.clone(), true).unwrap();
        assert_eq!(visible, vec![f.artifact.clone()]);

        let visible =
            filter_queryable(&f.conn, &f.reader.identity(), candidates.clone(), false).unwrap();
        assert_eq!(visible, vec![f.entity.clone()]);

        let visible = filter_queryable(&f.conn, &f.admin.identity(), candidates.clone(), false).unwrap();
        assert_eq!(visible.len(), 2);
    }

    #[test]
    fn test_visibility_predicate_agrees_with_filter() {
        let f = fixture();
        let predicate = visibility_predicate(&f.conn, &f.outsider.identity(), true).unwrap();
        assert!(!predicate.matches(&f.entity));
        assert!(predicate.matches(&f.artifact));

        let predicate = visibility_predicate(&f.conn, &f.reader.identity(), true).unwrap();
        assert!(predicate.matches(&f.entity));

        assert_eq!(
            visibility_predicate(&f.conn, &f.admin.identity(), false).unwrap(),
            Predicate::All
        );
    }

    #[test]
    fn test_grant_allocates_offset_notifies_and_schedules() {
        let f = fixture();
        let queue = MemoryJobQueue::default();
        grant_access(
            &f.conn,
            &queue,
            &f.writer.identity(),
            f.outsider.id,
            f.entity.id,
            AccessType::Read,
        )
        .unwrap();

        assert_eq!(get_access(&f.conn, f.outsider.id, f.entity.id).unwrap(), Some(AccessType::Read));
        assert_ne!(get_entry(&f.conn, f.entity.id).unwrap().acvec_offset, 0);
        assert_eq!(notifications_for(&f.conn, f.outsider.id).unwrap().len(), 1);
        assert_eq!(
            queue.pending_jobs(),
            vec![JobKind::UpdateAccesses { entry_id: f.entity.id }]
        );
    }

    #[test]
    fn test_grant_requires_read_write_or_admin() {
        let f = fixture();
        let queue = MemoryJobQueue::default();
        let err = grant_access(
            &f.conn,
            &queue,
            &f.reader.identity(),
            f.outsider.id,
            f.entity.id,
            AccessType::Read,
        )
        .unwrap_err();
        assert!(matches!(err, CradleError::AccessDenied(_)));
        assert!(queue.pending_jobs().is_empty());

        let err = grant_access(
            &f.conn,
            &queue,
            &f.admin.identity(),
            f.outsider.id,
            f.artifact.id,
            AccessType::Read,
        )
        .unwrap_err();
        assert!(matches!(err, CradleError::Consistency(_)));
    }

    #[test]
    fn test_request_access_notifies_admins_and_writers() {
        let f = fixture();
        let sent = request_access(&f.conn, &f.outsider.identity(), f.entity.id).unwrap();
        assert_eq!(sent, 2);
        assert_eq!(count_notifications(&f.conn, "access_request").unwrap(), 2);

        let to_admin = notifications_for(&f.conn, f.admin.id).unwrap();
        assert_eq!(
            to_admin[0].message,
            "User user0 has requested access for entity entity"
        );
        assert_eq!(notifications_for(&f.conn, f.writer.id).unwrap().len(), 1);
        assert!(notifications_for(&f.conn, f.reader.id).unwrap().is_empty());
    }

    #[test]
    fn test_request_access_is_noop_for_privileged_users() {
        let f = fixture();
        assert_eq!(request_access(&f.conn, &f.admin.identity(), f.entity.id).unwrap(), 0);
        assert_eq!(request_access(&f.conn, &f.writer.identity(), f.entity.id).unwrap(), 0);
        assert_eq!(count_notifications(&f.conn, "access_request").unwrap(), 0);
        assert!(matches!(
            request_access(&f.conn, &f.reader.identity(), 4242),
            Err(CradleError::NotFound(_))
        ));
    }
}
