//! SQLite-backed store exposed to Python.
//!
//! Each public method opens its own connection, so the caller never manages
//! connection lifetime. Writes that change access vectors enqueue jobs on
//! the persistent outbox; the host's worker drains it with `run_jobs`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use pyo3::prelude::*;
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::access::evaluation::{
    accessible_entity_ids, grant_access, has_access, request_access, require_access,
};
use crate::access::model::{can_read_content, compute_vector};
use crate::config::Settings;
use crate::errors::{CradleError, CradleResult};
use crate::graph::aliases::{alias_group, group_relations, merge_aliases};
use crate::graph::children::resolve_children;
use crate::jobs::policy::{JobKind, Queue};
use crate::jobs::queue::{unix_now, JobQueue, JobStatus, SqliteJobQueue};
use crate::jobs::runner::JobRunner;
use crate::models::{
    AccessType, ClassFormat, ContentRef, EntryType, Relation, RelationReason, UserIdentity,
};
use crate::notify::{self, notifications_for, LogRef};
use crate::query::cache::QueryCache;
use crate::store::records::{self, NewRelation};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

/// Serialize through JSON into native Python objects.
fn to_py<T: Serialize>(py: Python<'_>, value: &T) -> PyResult<PyObject> {
    let json_str = serde_json::to_string(value).map_err(CradleError::from)?;
    let json_module = py.import("json")?;
    json_module
        .call_method1("loads", (json_str,))
        .map(|o| o.into())
}

fn parse_levels(required: &[String]) -> CradleResult<Vec<AccessType>> {
    required.iter().map(|r| AccessType::parse(r)).collect()
}

fn class_format(regex: Option<String>, options: Option<Vec<String>>) -> CradleResult<Option<ClassFormat>> {
    match (regex, options) {
        (Some(_), Some(_)) => Err(CradleError::Consistency(
            "an entry class takes a regex or options, not both".to_string(),
        )),
        (Some(pattern), None) => Ok(Some(ClassFormat::Regex(pattern))),
        (None, Some(options)) => Ok(Some(ClassFormat::Options(options))),
        (None, None) => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[pyclass]
pub struct Database {
    db_path: PathBuf,
    settings: Settings,
    cache: QueryCache,
}

impl Database {
    /// Open a connection with foreign keys and `regexp()` enabled.
    fn connect(&self) -> CradleResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        schema::prepare_connection(&conn)?;
        Ok(conn)
    }

    /// Public alias for internal connect, used by query functions.
    pub fn connect_internal(&self) -> CradleResult<Connection> {
        self.connect()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn open_with(db_path: PathBuf, settings: Settings) -> CradleResult<Self> {
        let resolved = if db_path.is_absolute() {
            db_path
        } else {
            std::env::current_dir()?.join(db_path)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            cache: QueryCache::from_settings(&settings),
            db_path: resolved,
            settings,
        })
    }

    /// Run `f` with a connection and the outbox bound to it.
    fn with_outbox<T>(
        &self,
        f: impl FnOnce(&Connection, &SqliteJobQueue<'_>) -> CradleResult<T>,
    ) -> CradleResult<T> {
        let conn = self.connect()?;
        let queue = SqliteJobQueue::new(&conn, &self.settings.scheduling);
        f(&conn, &queue)
    }

    fn create_content_impl(
        &self,
        kind: &str,
        entry_ids: &[i64],
        scan_children: bool,
    ) -> CradleResult<ContentRef> {
        self.with_outbox(|conn, queue| {
            let tx = conn.unchecked_transaction()?;
            let content = records::create_content(&tx, kind)?;
            for entry_id in entry_ids {
                records::add_content_entry(&tx, &content, *entry_id)?;
            }
            queue.submit(JobKind::PropagateContent {
                content: content.clone(),
            })?;
            if scan_children && !entry_ids.is_empty() {
                queue.submit(JobKind::ScanChildren {
                    entry_ids: entry_ids.to_vec(),
                    content: content.clone(),
                })?;
            }
            tx.commit()?;
            Ok(content)
        })
    }

    /// Delete a content object. Its members, and the children of the inherit
    /// relations it owned, are queued for recomputation in the same
    /// transaction.
    fn delete_content_impl(&self, content_id: i64) -> CradleResult<()> {
        self.with_outbox(|conn, queue| {
            let tx = conn.unchecked_transaction()?;
            let content = records::get_content(&tx, content_id)?;
            let mut stale: BTreeSet<i64> = records::content_members(&tx, &content)?
                .into_iter()
                .collect();
            stale.extend(
                records::relations_owned_by(&tx, &content)?
                    .into_iter()
                    .filter(|r| r.inherit_av)
                    .map(|r| r.e1),
            );
            records::delete_content(&tx, &content)?;
            for entry_id in stale {
                queue.submit(JobKind::UpdateAccesses { entry_id })?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn create_relation_impl(
        &self,
        e1: i64,
        e2: i64,
        reason: RelationReason,
        inherit_av: bool,
        owner: Option<ContentRef>,
    ) -> CradleResult<Relation> {
        self.with_outbox(|conn, queue| {
            let access_vector = match &owner {
                Some(content) if content.carries_vector() => records::content_vector(conn, content)?,
                _ => compute_vector(conn, &[e1, e2])?,
            };
            let tx = conn.unchecked_transaction()?;
            let (relation, inserted) = records::create_relation(
                &tx,
                &NewRelation {
                    e1,
                    e2,
                    reason,
                    inherit_av,
                    access_vector,
                    owner,
                },
            )?;
            if inserted && inherit_av {
                queue.submit(JobKind::UpdateAccesses { entry_id: e1 })?;
            }
            tx.commit()?;
            Ok(relation)
        })
    }
}

#[pymethods]
impl Database {
    // -----------------------------------------------------------------------
    // Constructor / schema
    // -----------------------------------------------------------------------

    /// Create a new `Database`. The path is expanded and parent directories
    /// are created if missing. Settings come from `CRADLE_*` variables.
    #[new]
    pub fn new(db_path: PathBuf) -> PyResult<Self> {
        let expanded = expand_tilde(&db_path.to_string_lossy());
        Ok(Self::open_with(expanded, Settings::from_env())?)
    }

    #[getter]
    fn db_path(&self) -> String {
        self.db_path.to_string_lossy().into_owned()
    }

    /// Create all tables and indexes in WAL mode, then run migrations.
    pub fn init_schema(&self) -> PyResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(CradleError::from)?;
        schema::init_schema(&conn)?;
        Ok(())
    }

    fn schema_version(&self) -> PyResult<i32> {
        let conn = self.connect()?;
        Ok(schema::get_schema_version(&conn))
    }

    // -----------------------------------------------------------------------
    // Users, classes, entries
    // -----------------------------------------------------------------------

    #[pyo3(signature = (username, is_admin=false))]
    fn create_user(&self, username: &str, is_admin: bool) -> PyResult<UserIdentity> {
        let conn = self.connect()?;
        let user = records::create_user(&conn, username, is_admin)?;
        if !is_admin {
            for admin in records::admin_ids(&conn)? {
                notify::record(
                    &conn,
                    &notify::Notification::NewUser {
                        user: admin,
                        new_user: user.id,
                    },
                )?;
            }
        }
        Ok(user.identity())
    }

    #[pyo3(signature = (subtype, entry_type, regex=None, options=None))]
    fn create_entry_class(
        &self,
        py: Python<'_>,
        subtype: &str,
        entry_type: &str,
        regex: Option<String>,
        options: Option<Vec<String>>,
    ) -> PyResult<PyObject> {
        let conn = self.connect()?;
        let format = class_format(regex, options)?;
        let class = records::create_entry_class(
            &conn,
            subtype,
            EntryType::parse(entry_type)?,
            format.as_ref(),
        )?;
        to_py(py, &class)
    }

    fn add_class_child(&self, parent_id: i64, child_id: i64) -> PyResult<()> {
        let conn = self.connect()?;
        records::add_class_child(&conn, parent_id, child_id)?;
        Ok(())
    }

    /// Whether `text` is a valid name for entries of `subtype`.
    fn validate_entry_name(&self, subtype: &str, text: &str) -> PyResult<bool> {
        let conn = self.connect()?;
        let class = records::class_by_subtype(&conn, subtype)?;
        Ok(class.validate_text(text)?)
    }

    #[pyo3(signature = (subtype, name, description=None))]
    fn create_entry(
        &self,
        py: Python<'_>,
        subtype: &str,
        name: &str,
        description: Option<&str>,
    ) -> PyResult<PyObject> {
        let conn = self.connect()?;
        let class = records::class_by_subtype(&conn, subtype)?;
        if !class.validate_text(name)? {
            return Err(CradleError::Syntax(format!(
                "{name:?} is not a valid {subtype} name"
            ))
            .into());
        }
        let entry = records::create_entry(&conn, class.id, name, description)?;
        to_py(py, &entry)
    }

    /// Fetch an entry the user may read; anything else is `LookupError`.
    fn get_entry(&self, py: Python<'_>, user: &UserIdentity, entry_id: i64) -> PyResult<PyObject> {
        let conn = self.connect()?;
        require_access(&conn, user, &[entry_id], &[AccessType::Read])?;
        to_py(py, &records::get_entry(&conn, entry_id)?)
    }

    // -----------------------------------------------------------------------
    // Content objects and relations
    // -----------------------------------------------------------------------

    /// Register a content object referencing `entry_ids`. Schedules its
    /// vector computation and, unless disabled, a child scan.
    #[pyo3(signature = (kind, entry_ids, scan_children=true))]
    fn create_content(
        &self,
        py: Python<'_>,
        kind: &str,
        entry_ids: Vec<i64>,
        scan_children: bool,
    ) -> PyResult<PyObject> {
        let content = self.create_content_impl(kind, &entry_ids, scan_children)?;
        to_py(py, &content)
    }

    fn delete_content(&self, content_id: i64) -> PyResult<()> {
        Ok(self.delete_content_impl(content_id)?)
    }

    fn can_read_content(&self, user: &UserIdentity, content_id: i64) -> PyResult<bool> {
        let conn = self.connect()?;
        let content = records::get_content(&conn, content_id)?;
        Ok(can_read_content(&conn, user, &content)?)
    }

    #[pyo3(signature = (e1, e2, reason, inherit_av=false, owner_id=None))]
    fn create_relation(
        &self,
        py: Python<'_>,
        e1: i64,
        e2: i64,
        reason: &str,
        inherit_av: bool,
        owner_id: Option<i64>,
    ) -> PyResult<PyObject> {
        let owner = match owner_id {
            Some(id) => Some(records::get_content(&self.connect()?, id)?),
            None => None,
        };
        let relation =
            self.create_relation_impl(e1, e2, RelationReason::parse(reason)?, inherit_av, owner)?;
        to_py(py, &relation)
    }

    /// Relations touching any member of the entry's alias group.
    fn relations(&self, py: Python<'_>, user: &UserIdentity, entry_id: i64) -> PyResult<PyObject> {
        let conn = self.connect()?;
        require_access(&conn, user, &[entry_id], &[AccessType::Read])?;
        to_py(py, &group_relations(&conn, entry_id)?)
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    #[pyo3(signature = (user, entry_ids, required=vec!["read".to_string()]))]
    fn has_access(&self, user: &UserIdentity, entry_ids: Vec<i64>, required: Vec<String>) -> PyResult<bool> {
        let conn = self.connect()?;
        Ok(has_access(&conn, user, &entry_ids, &parse_levels(&required)?)?)
    }

    fn accessible_entities(&self, py: Python<'_>, user: &UserIdentity) -> PyResult<PyObject> {
        let conn = self.connect()?;
        to_py(py, &accessible_entity_ids(&conn, user)?)
    }

    fn grant_access(
        &self,
        granter: &UserIdentity,
        user_id: i64,
        entity_id: i64,
        level: &str,
    ) -> PyResult<()> {
        let level = AccessType::parse(level)?;
        self.with_outbox(|conn, queue| grant_access(conn, queue, granter, user_id, entity_id, level))?;
        Ok(())
    }

    fn request_access(&self, user: &UserIdentity, entity_id: i64) -> PyResult<usize> {
        let conn = self.connect()?;
        Ok(request_access(&conn, user, entity_id)?)
    }

    // -----------------------------------------------------------------------
    // Graph
    // -----------------------------------------------------------------------

    fn merge_aliases(&self, py: Python<'_>, a: i64, b: i64) -> PyResult<PyObject> {
        let canonical = self.with_outbox(|conn, queue| merge_aliases(conn, queue, a, b))?;
        to_py(py, &canonical)
    }

    fn alias_group(&self, entry_id: i64) -> PyResult<Vec<i64>> {
        let conn = self.connect()?;
        Ok(alias_group(&conn, entry_id)?)
    }

    fn resolve_children(&self, py: Python<'_>, entry_id: i64) -> PyResult<PyObject> {
        let conn = self.connect()?;
        to_py(py, &resolve_children(&conn, entry_id)?)
    }

    /// Enqueue the periodic degree refresh and artifact cleanup.
    fn schedule_maintenance(&self) -> PyResult<Vec<i64>> {
        let ids = self.with_outbox(|_, queue| {
            Ok(vec![
                queue.submit(JobKind::RefreshDegrees)?,
                queue.submit(JobKind::DeleteHangingArtifacts)?,
            ])
        })?;
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Claim and run up to `limit` due jobs, optionally from one queue.
    #[pyo3(signature = (queue=None, limit=100))]
    fn run_jobs(&self, py: Python<'_>, queue: Option<&str>, limit: usize) -> PyResult<PyObject> {
        let only = match queue {
            Some(name) => Some(Queue::parse(name).ok_or_else(|| {
                CradleError::NotFound(format!("queue {name:?}"))
            })?),
            None => None,
        };
        let runner = JobRunner::new(self.settings.clone());
        let outcomes = self.with_outbox(|conn, outbox| {
            let outcomes = runner.run_pending(conn, outbox, only, limit, unix_now())?;
            info!("ran {} jobs", outcomes.len());
            Ok(outcomes)
        })?;
        to_py(py, &outcomes)
    }

    fn pending_job_count(&self) -> PyResult<usize> {
        Ok(self.with_outbox(|_, queue| queue.pending_count())?)
    }

    #[pyo3(signature = (limit=100))]
    fn dead_jobs(&self, py: Python<'_>, limit: i64) -> PyResult<PyObject> {
        let jobs = self.with_outbox(|_, queue| queue.jobs_with_status(JobStatus::Dead, limit))?;
        to_py(py, &jobs)
    }

    // -----------------------------------------------------------------------
    // Notifications and event log
    // -----------------------------------------------------------------------

    fn notifications(&self, py: Python<'_>, user_id: i64) -> PyResult<PyObject> {
        let conn = self.connect()?;
        to_py(py, &notifications_for(&conn, user_id)?)
    }

    /// Record an edit of an entry by `user_id`, echoed to its aliases.
    #[pyo3(signature = (user_id, entry_id, details=None))]
    fn log_entry_edit(&self, user_id: i64, entry_id: i64, details: Option<&str>) -> PyResult<i64> {
        let conn = self.connect()?;
        let entry = records::get_entry(&conn, entry_id)?;
        Ok(notify::log_edit(&conn, user_id, &entry, details)?)
    }

    /// Record an edit of a content object, echoed to its member entries.
    #[pyo3(signature = (user_id, content_id, details=None))]
    fn log_content_edit(&self, user_id: i64, content_id: i64, details: Option<&str>) -> PyResult<i64> {
        let conn = self.connect()?;
        let content = records::get_content(&conn, content_id)?;
        Ok(notify::log_edit(&conn, user_id, &content, details)?)
    }

    fn events(&self, py: Python<'_>, kind: &str, object_id: i64) -> PyResult<PyObject> {
        let conn = self.connect()?;
        let object = LogRef {
            kind: kind.to_string(),
            id: object_id,
        };
        to_py(py, &notify::events_for(&conn, &object)?)
    }
}
