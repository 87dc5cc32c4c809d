//! Job types and the scheduling-policy table that routes them.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::CradleResult;
use crate::models::ContentRef;

/// Background work the core hands to the outbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobKind {
    /// Recompute every vector depending on one entry.
    UpdateAccesses { entry_id: i64 },
    /// Recompute one content object and the inherit relations it owns.
    PropagateContent { content: ContentRef },
    /// Match child classes in the entries' names and link them to `content`.
    ScanChildren {
        entry_ids: Vec<i64>,
        content: ContentRef,
    },
    RefreshDegrees,
    DeleteHangingArtifacts,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::UpdateAccesses { .. } => "update_accesses",
            JobKind::PropagateContent { .. } => "propagate_content",
            JobKind::ScanChildren { .. } => "scan_children",
            JobKind::RefreshDegrees => "refresh_degrees",
            JobKind::DeleteHangingArtifacts => "delete_hanging_artifacts",
        }
    }

    /// Lease key serialising passes over the same entry.
    pub fn lease_key(&self) -> Option<String> {
        match self {
            JobKind::UpdateAccesses { entry_id } => Some(format!("acvec:{entry_id}")),
            _ => None,
        }
    }

    pub fn payload_json(&self) -> CradleResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> CradleResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Hex SHA-256 of the payload; identical pending jobs share it.
    pub fn dedup_key(&self) -> CradleResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.payload_json()?.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Worker queues, one per concern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Queue {
    Access,
    Enrich,
    Graph,
    Cleanup,
}

impl Queue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Access => "access",
            Queue::Enrich => "enrich",
            Queue::Graph => "graph",
            Queue::Cleanup => "cleanup",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "access" => Some(Queue::Access),
            "enrich" => Some(Queue::Enrich),
            "graph" => Some(Queue::Graph),
            "cleanup" => Some(Queue::Cleanup),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobPolicy {
    pub queue: Queue,
    pub priority: u8,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Hard limit after which a running job is abandoned.
    pub time_limit: Duration,
    /// Deadline handed to the job body.
    pub soft_time_limit: Duration,
}

impl JobPolicy {
    fn on(queue: Queue) -> Self {
        Self {
            queue,
            priority: 5,
            max_retries: 3,
            retry_delay: Duration::from_secs(180),
            time_limit: Duration::from_secs(30 * 60),
            soft_time_limit: Duration::from_secs(15 * 60),
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from `retry_delay` and
    /// capped at the hard time limit.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_delay
            .checked_mul(factor)
            .unwrap_or(self.time_limit)
            .min(self.time_limit.max(self.retry_delay))
    }
}

/// Job type -> routing/retry policy.
#[derive(Clone, Debug)]
pub struct SchedulingPolicy {
    table: IndexMap<&'static str, JobPolicy>,
    fallback: JobPolicy,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        let mut table = IndexMap::new();
        table.insert("update_accesses", JobPolicy::on(Queue::Access));
        table.insert("propagate_content", JobPolicy::on(Queue::Access));
        table.insert("scan_children", JobPolicy::on(Queue::Enrich));
        table.insert("refresh_degrees", JobPolicy::on(Queue::Graph));
        table.insert("delete_hanging_artifacts", JobPolicy::on(Queue::Cleanup));
        Self {
            table,
            fallback: JobPolicy::on(Queue::Access),
        }
    }
}

impl SchedulingPolicy {
    pub fn policy_for(&self, job: &JobKind) -> &JobPolicy {
        self.table.get(job.name()).unwrap_or(&self.fallback)
    }

    pub fn set(&mut self, job_name: &'static str, policy: JobPolicy) {
        self.table.insert(job_name, policy);
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        for policy in self.table.values_mut() {
            policy.max_retries = max_retries;
        }
        self.fallback.max_retries = max_retries;
    }

    pub fn set_retry_delay(&mut self, delay: Duration) {
        for policy in self.table.values_mut() {
            policy.retry_delay = delay;
        }
        self.fallback.retry_delay = delay;
    }

    pub fn set_soft_time_limit(&mut self, limit: Duration) {
        for policy in self.table.values_mut() {
            policy.soft_time_limit = limit;
        }
        self.fallback.soft_time_limit = limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routing() {
        let policy = SchedulingPolicy::default();
        let access = policy.policy_for(&JobKind::UpdateAccesses { entry_id: 1 });
        assert_eq!(access.queue, Queue::Access);
        assert_eq!(access.priority, 5);
        assert_eq!(access.max_retries, 3);
        assert_eq!(access.retry_delay, Duration::from_secs(180));
        assert_eq!(
            policy
                .policy_for(&JobKind::ScanChildren {
                    entry_ids: vec![],
                    content: ContentRef::Note { id: 1 }
                })
                .queue,
            Queue::Enrich
        );
        assert_eq!(
            policy.policy_for(&JobKind::DeleteHangingArtifacts).queue,
            Queue::Cleanup
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = JobPolicy::on(Queue::Access);
        assert_eq!(policy.backoff(1), Duration::from_secs(180));
        assert_eq!(policy.backoff(2), Duration::from_secs(360));
        assert_eq!(policy.backoff(3), Duration::from_secs(720));
        assert_eq!(policy.backoff(30), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_dedup_key_tracks_payload() {
        let a = JobKind::UpdateAccesses { entry_id: 7 };
        let b = JobKind::UpdateAccesses { entry_id: 8 };
        assert_eq!(a.dedup_key().unwrap(), a.clone().dedup_key().unwrap());
        assert_ne!(a.dedup_key().unwrap(), b.dedup_key().unwrap());
        assert_eq!(a.dedup_key().unwrap().len(), 64);
    }

    #[test]
    fn test_payload_round_trip() {
        let job = JobKind::ScanChildren {
            entry_ids: vec![1, 2],
            content: ContentRef::Digest { id: 9 },
        };
        assert_eq!(JobKind::from_payload(&job.payload_json().unwrap()).unwrap(), job);
        assert_eq!(job.lease_key(), None);
        assert_eq!(
            JobKind::UpdateAccesses { entry_id: 3 }.lease_key().as_deref(),
            Some("acvec:3")
        );
    }
}
