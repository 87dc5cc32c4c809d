//! Entry search: compile a query, restrict it to what the user may see and
//! page through the matches, most recently seen first.

use pyo3::prelude::*;
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection};
use serde::Serialize;

use crate::access::evaluation::visibility_predicate;
use crate::errors::{CradleError, CradleResult};
use crate::graph::maintenance::VIRTUAL_SUBTYPE;
use crate::models::{Entry, UserIdentity};
use crate::query::compiler::compile_with_options;
use crate::query::guards::{clamp_page, clamp_page_size};
use crate::query::predicate::{Field, Lookup, Predicate};
use crate::store::records::{row_to_entry, ENTRY_SELECT};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchPage {
    pub entries: Vec<Entry>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub has_next: bool,
}

/// Run an already compiled `predicate` for `user`.
pub fn search_compiled(
    conn: &Connection,
    user: &UserIdentity,
    predicate: &Predicate,
    page: i64,
    page_size: i64,
    artifacts_visible: bool,
) -> CradleResult<SearchPage> {
    let page = clamp_page(page);
    let page_size = clamp_page_size(page_size);

    let scoped = predicate
        .clone()
        .and(visibility_predicate(conn, user, artifacts_visible)?)
        .and(Predicate::leaf(Field::Subtype, Lookup::Exact(VIRTUAL_SUBTYPE.to_string())).not());
    let (filter, mut params) = scoped.to_sql();

    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM entries e JOIN entry_classes c ON c.id = e.class_id \
             WHERE {filter};"
        ),
        params_from_iter(params.iter()),
        |row| row.get(0),
    )?;

    params.push(SqlValue::Integer(page_size));
    params.push(SqlValue::Integer((page - 1).saturating_mul(page_size)));
    let mut stmt = conn.prepare(&format!(
        "{ENTRY_SELECT} WHERE {filter} ORDER BY e.last_seen DESC, e.id DESC LIMIT ? OFFSET ?;"
    ))?;
    let entries = stmt
        .query_map(params_from_iter(params.iter()), row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(SearchPage {
        has_next: page.saturating_mul(page_size) < total,
        entries,
        page,
        page_size,
        total,
    })
}

/// Compile `query` (wrapped as `*query*` when `wildcard`) and search.
pub fn search_entries_impl(
    conn: &Connection,
    user: &UserIdentity,
    query: &str,
    wildcard: bool,
    page: i64,
    page_size: i64,
    artifacts_visible: bool,
) -> CradleResult<SearchPage> {
    let predicate = compile_with_options(query, wildcard)?;
    search_compiled(conn, user, &predicate, page, page_size, artifacts_visible)
}

#[pyfunction]
#[pyo3(signature = (db, user, query, wildcard=false, page=1, page_size=25))]
pub fn search_entries(
    py: Python<'_>,
    db: &crate::store::database::Database,
    user: &UserIdentity,
    query: &str,
    wildcard: bool,
    page: i64,
    page_size: i64,
) -> PyResult<PyObject> {
    let conn = db.connect_internal()?;
    let (predicate, _) = db.query_cache().get_or_compile(query, wildcard)?;
    let result = search_compiled(
        &conn,
        user,
        &predicate,
        page,
        page_size,
        db.settings().artifacts_visible,
    )?;
    let json_str = serde_json::to_string(&result).map_err(CradleError::from)?;
    let json_module = py.import("json")?;
    json_module
        .call_method1("loads", (json_str,))
        .map(|o| o.into())
}
