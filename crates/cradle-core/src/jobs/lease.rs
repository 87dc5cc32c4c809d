//! Expiring per-key leases stored next to the data they guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::CradleResult;

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// A token unique to this process and call.
pub fn new_holder_token() -> String {
    let seq = HOLDER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{seq}", std::process::id())
}

pub struct LeaseTable<'a> {
    conn: &'a Connection,
}

impl<'a> LeaseTable<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Take `key` for `holder` until `now + ttl`. Succeeds when the key is
    /// free, expired, or already held by `holder`.
    pub fn acquire(&self, key: &str, holder: &str, ttl: Duration, now: i64) -> CradleResult<bool> {
        let expires_at = now + ttl.as_secs().max(1) as i64;
        let changed = self.conn.execute(
            "INSERT INTO leases(key, holder, expires_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, \
                 expires_at = excluded.expires_at \
             WHERE leases.expires_at <= ?4 OR leases.holder = excluded.holder;",
            params![key, holder, expires_at, now],
        )?;
        Ok(changed > 0)
    }

    /// Drop the lease if `holder` still owns it.
    pub fn release(&self, key: &str, holder: &str) -> CradleResult<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM leases WHERE key = ?1 AND holder = ?2;",
            params![key, holder],
        )?;
        Ok(deleted > 0)
    }

    pub fn holder(&self, key: &str, now: i64) -> CradleResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT holder FROM leases WHERE key = ?1 AND expires_at > ?2;",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::open_in_memory;

    #[test]
    fn test_lease_excludes_other_holders_until_expiry() {
        let conn = open_in_memory().unwrap();
        let leases = LeaseTable::new(&conn);
        let ttl = Duration::from_secs(60);
        assert!(leases.acquire("acvec:1", "a", ttl, 0).unwrap());
        assert!(!leases.acquire("acvec:1", "b", ttl, 30).unwrap());
        assert!(leases.acquire("acvec:1", "a", ttl, 30).unwrap());
        // a renewed until 90
        assert!(!leases.acquire("acvec:1", "b", ttl, 60).unwrap());
        assert!(leases.acquire("acvec:1", "b", ttl, 90).unwrap());
        assert_eq!(leases.holder("acvec:1", 91).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_release_only_by_owner() {
        let conn = open_in_memory().unwrap();
        let leases = LeaseTable::new(&conn);
        leases
            .acquire("acvec:2", "a", Duration::from_secs(60), 0)
            .unwrap();
        assert!(!leases.release("acvec:2", "b").unwrap());
        assert!(leases.release("acvec:2", "a").unwrap());
        assert!(leases.holder("acvec:2", 0).unwrap().is_none());
    }

    #[test]
    fn test_holder_tokens_are_distinct() {
        assert_ne!(new_holder_token(), new_holder_token());
    }
}
