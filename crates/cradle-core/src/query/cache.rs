//! Compiled-predicate cache with LRU eviction and a TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use pyo3::prelude::*;

use crate::config::Settings;
use crate::errors::{CradleError, CradleResult};
use crate::query::compiler::compile_with_options;
use crate::query::predicate::Predicate;

type CacheKey = (String, bool);

struct CacheEntry {
    predicate: Predicate,
    expires_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    Hit,
    Miss,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Hit => "cache_hit",
            CacheMode::Miss => "cache_miss",
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
}

#[pyclass]
pub struct QueryCache {
    max_entries: usize,
    ttl: Duration,
    cache: Mutex<IndexMap<CacheKey, CacheEntry>>,
    counters: Mutex<Counters>,
}

impl QueryCache {
    pub fn with_limits(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl: ttl.max(Duration::from_millis(100)),
            cache: Mutex::new(IndexMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::with_limits(settings.query_cache_entries, settings.query_cache_ttl)
    }

    /// Compiled predicate for `(query, wildcard)`, compiling on a miss.
    /// Syntax errors are not cached.
    pub fn get_or_compile(&self, query: &str, wildcard: bool) -> CradleResult<(Predicate, CacheMode)> {
        self.get_or_compile_at(query, wildcard, Instant::now())
    }

    fn get_or_compile_at(
        &self,
        query: &str,
        wildcard: bool,
        now: Instant,
    ) -> CradleResult<(Predicate, CacheMode)> {
        let key = (query.to_string(), wildcard);
        {
            let mut cache = self.cache.lock();
            cache.retain(|_, entry| entry.expires_at > now);
            if let Some(entry) = cache.shift_remove(&key) {
                let predicate = entry.predicate.clone();
                cache.insert(key, entry);
                self.counters.lock().hits += 1;
                return Ok((predicate, CacheMode::Hit));
            }
        }

        let predicate = compile_with_options(query, wildcard)?;
        self.counters.lock().misses += 1;

        let mut cache = self.cache.lock();
        cache.insert(
            key,
            CacheEntry {
                predicate: predicate.clone(),
                expires_at: now + self.ttl,
            },
        );
        while cache.len() > self.max_entries {
            cache.shift_remove_index(0);
        }
        Ok((predicate, CacheMode::Miss))
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[pymethods]
impl QueryCache {
    #[new]
    #[pyo3(signature = (max_entries=512, ttl_seconds=15.0))]
    fn new(max_entries: i64, ttl_seconds: f64) -> Self {
        Self::with_limits(
            max_entries.max(1) as usize,
            Duration::from_secs_f64(ttl_seconds.max(0.1)),
        )
    }

    /// `(predicate, mode)` where `predicate` is the tagged JSON tree and
    /// `mode` is `"cache_hit"` or `"cache_miss"`.
    #[pyo3(name = "compile", signature = (query, wildcard=false))]
    fn py_compile(&self, py: Python<'_>, query: &str, wildcard: bool) -> PyResult<(PyObject, String)> {
        let (predicate, mode) = self.get_or_compile(query, wildcard)?;
        let json_str = serde_json::to_string(&predicate).map_err(CradleError::from)?;
        let json_module = py.import("json")?;
        let value = json_module.call_method1("loads", (json_str,))?;
        Ok((value.into(), mode.as_str().to_string()))
    }

    fn clear(&self) {
        self.cache.lock().clear();
    }

    fn stats(&self) -> HashMap<String, i64> {
        let entries = self.cache.lock().len();
        let counters = self.counters.lock();
        let mut result = HashMap::new();
        result.insert("entries".to_string(), entries as i64);
        result.insert("max_entries".to_string(), self.max_entries as i64);
        result.insert("hits".to_string(), counters.hits as i64);
        result.insert("misses".to_string(), counters.misses as i64);
        result
    }

    fn __len__(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lookup_hits() {
        let cache = QueryCache::with_limits(8, Duration::from_secs(60));
        let (first, mode) = cache.get_or_compile("ip:10.*", false).unwrap();
        assert_eq!(mode, CacheMode::Miss);
        let (second, mode) = cache.get_or_compile("ip:10.*", false).unwrap();
        assert_eq!(mode, CacheMode::Hit);
        assert_eq!(first, second);

        let (_, mode) = cache.get_or_compile("ip:10.*", true).unwrap();
        assert_eq!(mode, CacheMode::Miss);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let cache = QueryCache::with_limits(2, Duration::from_secs(60));
        cache.get_or_compile("a", false).unwrap();
        cache.get_or_compile("b", false).unwrap();
        cache.get_or_compile("a", false).unwrap();
        cache.get_or_compile("c", false).unwrap();

        assert_eq!(cache.get_or_compile("a", false).unwrap().1, CacheMode::Hit);
        assert_eq!(cache.get_or_compile("b", false).unwrap().1, CacheMode::Miss);
    }

    #[test]
    fn test_entries_expire() {
        let cache = QueryCache::with_limits(8, Duration::from_secs(1));
        let start = Instant::now();
        cache.get_or_compile_at("a", false, start).unwrap();
        let later = start + Duration::from_secs(2);
        assert_eq!(
            cache.get_or_compile_at("a", false, later).unwrap().1,
            CacheMode::Miss
        );
    }

    #[test]
    fn test_syntax_errors_are_not_cached() {
        let cache = QueryCache::with_limits(8, Duration::from_secs(60));
        assert!(cache.get_or_compile("\"a\"b:c", false).is_err());
        assert!(cache.is_empty());
    }
}
