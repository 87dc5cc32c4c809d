//! Runtime settings with `CRADLE_*` environment overrides.

use std::time::Duration;

use tracing::warn;

use crate::jobs::policy::SchedulingPolicy;

/// Knobs shared by the access engine, the job runner and the query cache.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Deadline for a single propagation pass.
    pub propagation_deadline: Duration,
    /// How long a per-entry lease stays valid if its holder never releases it.
    pub lease_timeout: Duration,
    /// Upper bound on entries visited by one propagation pass.
    pub max_propagation_visited: usize,
    pub query_cache_entries: usize,
    pub query_cache_ttl: Duration,
    /// Whether non-admin users may see every ARTIFACT entry.
    pub artifacts_visible: bool,
    pub scheduling: SchedulingPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            propagation_deadline: Duration::from_secs(15 * 60),
            lease_timeout: Duration::from_secs(3600),
            max_propagation_visited: 50_000,
            query_cache_entries: 512,
            query_cache_ttl: Duration::from_secs(15),
            artifacts_visible: true,
            scheduling: SchedulingPolicy::default(),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => {
            let v = val.trim().to_lowercase();
            if default {
                !matches!(v.as_str(), "0" | "false" | "no" | "off")
            } else {
                matches!(v.as_str(), "1" | "true" | "yes" | "on")
            }
        }
        Err(_) => default,
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable {name}={raw:?}");
            None
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(secs) = env_number::<u64>("CRADLE_PROPAGATION_DEADLINE_SECS") {
            settings.propagation_deadline = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_number::<u64>("CRADLE_LEASE_TIMEOUT_SECS") {
            settings.lease_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = env_number::<usize>("CRADLE_MAX_PROPAGATION_VISITED") {
            settings.max_propagation_visited = n.max(1);
        }
        if let Some(n) = env_number::<usize>("CRADLE_QUERY_CACHE_ENTRIES") {
            settings.query_cache_entries = n.max(1);
        }
        if let Some(secs) = env_number::<f64>("CRADLE_QUERY_CACHE_TTL_SECS") {
            settings.query_cache_ttl = Duration::from_secs_f64(secs.max(0.1));
        }
        settings.artifacts_visible = env_flag("CRADLE_ARTIFACTS_VISIBLE", true);

        if let Some(retries) = env_number::<u32>("CRADLE_JOB_MAX_RETRIES") {
            settings.scheduling.set_max_retries(retries);
        }
        if let Some(secs) = env_number::<u64>("CRADLE_JOB_RETRY_DELAY_SECS") {
            settings.scheduling.set_retry_delay(Duration::from_secs(secs));
        }

        settings
    }
}
