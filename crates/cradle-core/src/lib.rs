//! Cradle core library — Rust backend for the Cradle investigation graph.
//!
//! This crate provides the query string compiler, the access vector model,
//! access evaluation, the entry/relation graph accessors and the background
//! job outbox. It is compiled as a Python extension module (`_cradle_core`)
//! via PyO3; the host web application owns HTTP, authentication and
//! delivery of notifications.

pub mod access;
pub mod config;
pub mod errors;
pub mod graph;
pub mod jobs;
pub mod models;
pub mod notify;
pub mod query;
pub mod store;

use pyo3::prelude::*;
use pyo3::wrap_pyfunction;

// ---------------------------------------------------------------------------
// Top-level Python module: _cradle_core
// ---------------------------------------------------------------------------

#[pymodule]
fn _cradle_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // -- Models -------------------------------------------------------------
    m.add_class::<models::UserIdentity>()?;

    // -- Store layer --------------------------------------------------------
    m.add_class::<store::database::Database>()?;
    m.add("SCHEMA_VERSION", store::schema::SCHEMA_VERSION)?;

    // -- Query: guards (constants + clamping functions) ----------------------
    m.add("MAX_QUERY_LENGTH", query::guards::MAX_QUERY_LENGTH)?;
    m.add("DEFAULT_PAGE_SIZE", query::guards::DEFAULT_PAGE_SIZE)?;
    m.add("MAX_PAGE_SIZE", query::guards::MAX_PAGE_SIZE)?;
    m.add("MAX_PAGE", query::guards::MAX_PAGE)?;

    m.add_function(wrap_pyfunction!(query::guards::clamp_int, m)?)?;
    m.add_function(wrap_pyfunction!(query::guards::clamp_page, m)?)?;
    m.add_function(wrap_pyfunction!(query::guards::clamp_page_size, m)?)?;
    m.add_function(wrap_pyfunction!(query::guards::truncate_query, m)?)?;

    // -- Query: compiler and search -----------------------------------------
    m.add_function(wrap_pyfunction!(query::compiler::py_compile_query, m)?)?;
    m.add_function(wrap_pyfunction!(query::compiler::py_process_pattern, m)?)?;
    m.add_function(wrap_pyfunction!(query::search::search_entries, m)?)?;

    // -- Query: compiled-predicate cache --------------------------------------
    m.add_class::<query::cache::QueryCache>()?;

    Ok(())
}
