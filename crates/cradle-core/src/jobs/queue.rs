//! Job outbox: a persistent SQLite implementation and an in-process one.
//!
//! Timestamps are unix seconds supplied by the caller so retry schedules
//! stay deterministic.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::errors::{CradleError, CradleResult};
use crate::jobs::policy::{JobKind, Queue, SchedulingPolicy};

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Retry,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Retry => "retry",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => JobStatus::Running,
            "done" => JobStatus::Done,
            "retry" => JobStatus::Retry,
            "dead" => JobStatus::Dead,
            _ => JobStatus::Queued,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retry)
    }
}

/// A claimed or listed outbox row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueuedJob {
    pub id: i64,
    pub job: JobKind,
    pub queue: Queue,
    pub priority: u8,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub next_attempt_at: i64,
    /// While `running`: when the claim lapses and the job may be reclaimed.
    pub claimed_until: i64,
    pub last_error: Option<String>,
}

/// Error recorded on a job whose worker never reported back.
const ABANDONED: &str = "abandoned after its time limit";

pub trait JobQueue {
    /// Enqueue `job`, or return the id of an identical pending job.
    fn submit(&self, job: JobKind) -> CradleResult<i64>;

    /// Take the next due job, highest priority first. Running jobs whose
    /// claim has lapsed are failed as abandoned first, so they retry or die
    /// under the usual budget.
    fn claim(&self, queue: Option<Queue>, now: i64) -> CradleResult<Option<QueuedJob>>;

    fn complete(&self, job_id: i64) -> CradleResult<()>;

    /// Record a failure. Retryable failures within budget are rescheduled
    /// with backoff, the rest are marked dead.
    fn fail(&self, job_id: i64, error: &str, retryable: bool, now: i64) -> CradleResult<JobStatus>;

    /// Put a claimed job back without consuming an attempt.
    fn defer(&self, job_id: i64, not_before: i64) -> CradleResult<()>;

    fn pending_count(&self) -> CradleResult<usize>;
}

fn next_status(
    policy: &SchedulingPolicy,
    job: &JobKind,
    attempt_count: u32,
    max_retries: u32,
    retryable: bool,
    now: i64,
) -> (JobStatus, i64) {
    if retryable && attempt_count <= max_retries {
        let delay = policy.policy_for(job).backoff(attempt_count);
        (JobStatus::Retry, now + delay.as_secs() as i64)
    } else {
        (JobStatus::Dead, now)
    }
}

// ---------------------------------------------------------------------------
// SQLite outbox
// ---------------------------------------------------------------------------

pub struct SqliteJobQueue<'a> {
    conn: &'a Connection,
    policy: &'a SchedulingPolicy,
}

const JOB_SELECT: &str = "SELECT id, payload_json, queue, priority, status, attempt_count, \
     max_retries, next_attempt_at, claimed_until, last_error FROM jobs";

fn queue_from_str(value: &str) -> Queue {
    Queue::parse(value).unwrap_or(Queue::Access)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, QueuedJobParts)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        QueuedJobParts {
            queue: row.get(2)?,
            priority: row.get(3)?,
            status: row.get(4)?,
            attempt_count: row.get(5)?,
            max_retries: row.get(6)?,
            next_attempt_at: row.get(7)?,
            claimed_until: row.get(8)?,
            last_error: row.get(9)?,
        },
    ))
}

struct QueuedJobParts {
    queue: String,
    priority: u8,
    status: String,
    attempt_count: u32,
    max_retries: u32,
    next_attempt_at: i64,
    claimed_until: i64,
    last_error: Option<String>,
}

impl<'a> SqliteJobQueue<'a> {
    pub fn new(conn: &'a Connection, policy: &'a SchedulingPolicy) -> Self {
        Self { conn, policy }
    }

    fn assemble(id: i64, payload: &str, parts: QueuedJobParts) -> CradleResult<QueuedJob> {
        Ok(QueuedJob {
            id,
            job: JobKind::from_payload(payload)?,
            queue: queue_from_str(&parts.queue),
            priority: parts.priority,
            status: JobStatus::parse(&parts.status),
            attempt_count: parts.attempt_count,
            max_retries: parts.max_retries,
            next_attempt_at: parts.next_attempt_at,
            claimed_until: parts.claimed_until,
            last_error: parts.last_error,
        })
    }

    pub fn get(&self, job_id: i64) -> CradleResult<QueuedJob> {
        let (id, payload, parts) = self
            .conn
            .query_row(
                &format!("{JOB_SELECT} WHERE id = ?1;"),
                params![job_id],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| CradleError::NotFound(format!("job {job_id}")))?;
        Self::assemble(id, &payload, parts)
    }

    fn reap_abandoned(&self, now: i64) -> CradleResult<usize> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM jobs WHERE status = 'running' AND claimed_until <= ?1 ORDER BY id;",
        )?;
        let lapsed = stmt
            .query_map(params![now], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        for job_id in &lapsed {
            self.fail(*job_id, ABANDONED, true, now)?;
        }
        Ok(lapsed.len())
    }

    /// Outbox rows in `status`, oldest first.
    pub fn jobs_with_status(&self, status: JobStatus, limit: i64) -> CradleResult<Vec<QueuedJob>> {
        let mut stmt = self.conn.prepare(&format!(
            "{JOB_SELECT} WHERE status = ?1 ORDER BY id ASC LIMIT ?2;"
        ))?;
        let rows = stmt
            .query_map(params![status.as_str(), limit.max(1)], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(id, payload, parts)| Self::assemble(id, &payload, parts))
            .collect()
    }
}

impl JobQueue for SqliteJobQueue<'_> {
    fn submit(&self, job: JobKind) -> CradleResult<i64> {
        let dedup_key = job.dedup_key()?;
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM jobs WHERE dedup_key = ?1 AND status IN ('queued', 'retry') \
                 ORDER BY id LIMIT 1;",
                params![dedup_key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(job_id) = existing {
            debug!("{} already pending as job {job_id}", job.name());
            return Ok(job_id);
        }

        let policy = self.policy.policy_for(&job);
        self.conn.execute(
            "INSERT INTO jobs(kind, payload_json, dedup_key, queue, priority, status, max_retries) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6);",
            params![
                job.name(),
                job.payload_json()?,
                dedup_key,
                policy.queue.as_str(),
                policy.priority,
                policy.max_retries
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn claim(&self, queue: Option<Queue>, now: i64) -> CradleResult<Option<QueuedJob>> {
        self.reap_abandoned(now)?;
        // Another worker may take the candidate between select and update.
        for _ in 0..8 {
            let candidate: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM jobs \
                     WHERE status IN ('queued', 'retry') AND next_attempt_at <= ?1 \
                       AND (?2 IS NULL OR queue = ?2) \
                     ORDER BY priority DESC, id ASC LIMIT 1;",
                    params![now, queue.map(|q| q.as_str())],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(job_id) = candidate else {
                return Ok(None);
            };
            let payload: String = self.conn.query_row(
                "SELECT payload_json FROM jobs WHERE id = ?1;",
                params![job_id],
                |row| row.get(0),
            )?;
            let time_limit = self.policy.policy_for(&JobKind::from_payload(&payload)?).time_limit;
            let taken = self.conn.execute(
                "UPDATE jobs SET status = 'running', attempt_count = attempt_count + 1, \
                     claimed_until = ?2, updated_at = CURRENT_TIMESTAMP \
                 WHERE id = ?1 AND status IN ('queued', 'retry');",
                params![job_id, now.saturating_add(time_limit.as_secs() as i64)],
            )?;
            if taken > 0 {
                return self.get(job_id).map(Some);
            }
        }
        Ok(None)
    }

    fn complete(&self, job_id: i64) -> CradleResult<()> {
        self.conn.execute(
            "UPDATE jobs SET status = 'done', last_error = NULL, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?1;",
            params![job_id],
        )?;
        Ok(())
    }

    fn fail(&self, job_id: i64, error_msg: &str, retryable: bool, now: i64) -> CradleResult<JobStatus> {
        let current = self.get(job_id)?;
        let (status, next_attempt_at) = next_status(
            self.policy,
            &current.job,
            current.attempt_count,
            current.max_retries,
            retryable,
            now,
        );
        self.conn.execute(
            "UPDATE jobs SET status = ?1, next_attempt_at = ?2, last_error = ?3, \
                 updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?4;",
            params![status.as_str(), next_attempt_at, error_msg, job_id],
        )?;
        match status {
            JobStatus::Dead => error!(
                "job {job_id} ({}) is dead after {} attempts: {error_msg}",
                current.job.name(),
                current.attempt_count
            ),
            _ => warn!(
                "job {job_id} ({}) failed, retrying at {next_attempt_at}: {error_msg}",
                current.job.name()
            ),
        }
        Ok(status)
    }

    fn defer(&self, job_id: i64, not_before: i64) -> CradleResult<()> {
        self.conn.execute(
            "UPDATE jobs SET status = 'queued', next_attempt_at = ?1, \
                 attempt_count = MAX(attempt_count - 1, 0), updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?2;",
            params![not_before, job_id],
        )?;
        Ok(())
    }

    fn pending_count(&self) -> CradleResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('queued', 'retry');",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

// ---------------------------------------------------------------------------
// In-process queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    jobs: BTreeMap<i64, QueuedJob>,
}

/// Outbox held in memory; same semantics as the SQLite one.
pub struct MemoryJobQueue {
    policy: SchedulingPolicy,
    state: Mutex<MemoryState>,
}

impl MemoryJobQueue {
    pub fn new(policy: SchedulingPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Snapshot of every job ever submitted, by id.
    pub fn jobs(&self) -> Vec<QueuedJob> {
        self.state.lock().jobs.values().cloned().collect()
    }

    pub fn pending_jobs(&self) -> Vec<JobKind> {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|j| j.status.is_pending())
            .map(|j| j.job.clone())
            .collect()
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(SchedulingPolicy::default())
    }
}

impl JobQueue for MemoryJobQueue {
    fn submit(&self, job: JobKind) -> CradleResult<i64> {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .jobs
            .values()
            .find(|j| j.status.is_pending() && j.job == job)
        {
            return Ok(existing.id);
        }
        state.next_id += 1;
        let id = state.next_id;
        let policy = self.policy.policy_for(&job);
        state.jobs.insert(
            id,
            QueuedJob {
                id,
                queue: policy.queue,
                priority: policy.priority,
                status: JobStatus::Queued,
                attempt_count: 0,
                max_retries: policy.max_retries,
                next_attempt_at: 0,
                claimed_until: 0,
                last_error: None,
                job,
            },
        );
        Ok(id)
    }

    fn claim(&self, queue: Option<Queue>, now: i64) -> CradleResult<Option<QueuedJob>> {
        let lapsed: Vec<i64> = self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.claimed_until <= now)
            .map(|j| j.id)
            .collect();
        for job_id in lapsed {
            self.fail(job_id, ABANDONED, true, now)?;
        }

        let mut state = self.state.lock();
        let picked = state
            .jobs
            .values()
            .filter(|j| j.status.is_pending() && j.next_attempt_at <= now)
            .filter(|j| queue.map_or(true, |q| j.queue == q))
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)))
            .map(|j| j.id);
        let Some(job_id) = picked else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.attempt_count += 1;
        let time_limit = self.policy.policy_for(&job.job).time_limit;
        job.claimed_until = now.saturating_add(time_limit.as_secs() as i64);
        Ok(Some(job.clone()))
    }

    fn complete(&self, job_id: i64) -> CradleResult<()> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CradleError::NotFound(format!("job {job_id}")))?;
        job.status = JobStatus::Done;
        job.last_error = None;
        Ok(())
    }

    fn fail(&self, job_id: i64, error_msg: &str, retryable: bool, now: i64) -> CradleResult<JobStatus> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CradleError::NotFound(format!("job {job_id}")))?;
        let (status, next_attempt_at) = next_status(
            &self.policy,
            &job.job,
            job.attempt_count,
            job.max_retries,
            retryable,
            now,
        );
        job.status = status;
        job.next_attempt_at = next_attempt_at;
        job.last_error = Some(error_msg.to_string());
        if status == JobStatus::Dead {
            error!("job {job_id} ({}) is dead: {error_msg}", job.job.name());
        }
        Ok(status)
    }

    fn defer(&self, job_id: i64, not_before: i64) -> CradleResult<()> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CradleError::NotFound(format!("job {job_id}")))?;
        job.status = JobStatus::Queued;
        job.next_attempt_at = not_before;
        job.attempt_count = job.attempt_count.saturating_sub(1);
        Ok(())
    }

    fn pending_count(&self) -> CradleResult<usize> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| j.status.is_pending())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::open_in_memory;

    #[test]
    fn test_sqlite_submit_dedups_pending_jobs() {
        let conn = open_in_memory().unwrap();
        let policy = SchedulingPolicy::default();
        let queue = SqliteJobQueue::new(&conn, &policy);
        let first = queue.submit(JobKind::UpdateAccesses { entry_id: 1 }).unwrap();
        let again = queue.submit(JobKind::UpdateAccesses { entry_id: 1 }).unwrap();
        let other = queue.submit(JobKind::UpdateAccesses { entry_id: 2 }).unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(queue.pending_count().unwrap(), 2);

        // A running job no longer absorbs new submissions.
        let claimed = queue.claim(None, 0).unwrap().unwrap();
        assert_eq!(claimed.id, first);
        let resubmitted = queue.submit(JobKind::UpdateAccesses { entry_id: 1 }).unwrap();
        assert_ne!(resubmitted, first);
    }

    #[test]
    fn test_sqlite_job_goes_dead_after_retry_budget() {
        let conn = open_in_memory().unwrap();
        let policy = SchedulingPolicy::default();
        let queue = SqliteJobQueue::new(&conn, &policy);
        let id = queue.submit(JobKind::UpdateAccesses { entry_id: 1 }).unwrap();

        let mut now = 0;
        let mut statuses = Vec::new();
        for _ in 0..4 {
            let job = queue.claim(Some(Queue::Access), now).unwrap().unwrap();
            assert_eq!(job.id, id);
            let status = queue.fail(id, "boom", true, now).unwrap();
            statuses.push(status);
            now = queue.get(id).unwrap().next_attempt_at;
        }
        assert_eq!(
            statuses,
            vec![JobStatus::Retry, JobStatus::Retry, JobStatus::Retry, JobStatus::Dead]
        );
        assert!(queue.claim(None, i64::MAX).unwrap().is_none());
        assert_eq!(queue.jobs_with_status(JobStatus::Dead, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_sqlite_retry_waits_for_backoff() {
        let conn = open_in_memory().unwrap();
        let policy = SchedulingPolicy::default();
        let queue = SqliteJobQueue::new(&conn, &policy);
        queue.submit(JobKind::RefreshDegrees).unwrap();
        let job = queue.claim(None, 100).unwrap().unwrap();
        queue.fail(job.id, "busy", true, 100).unwrap();
        assert!(queue.claim(None, 100).unwrap().is_none());
        assert!(queue.claim(None, 100 + 180).unwrap().is_some());
    }

    #[test]
    fn test_sqlite_reclaims_jobs_abandoned_past_their_time_limit() {
        let conn = open_in_memory().unwrap();
        let policy = SchedulingPolicy::default();
        let queue = SqliteJobQueue::new(&conn, &policy);
        let id = queue.submit(JobKind::UpdateAccesses { entry_id: 1 }).unwrap();
        let claimed = queue.claim(None, 1_000).unwrap().unwrap();
        let limit = policy.policy_for(&claimed.job).time_limit.as_secs() as i64;
        assert_eq!(claimed.claimed_until, 1_000 + limit);

        // The worker never reports back; still inside the limit nothing moves.
        assert!(queue.claim(None, 1_000 + limit - 1).unwrap().is_none());

        let later = 1_000 + 10 * 24 * 3600;
        assert!(queue.claim(None, later).unwrap().is_none());
        let lapsed = queue.get(id).unwrap();
        assert_eq!(lapsed.status, JobStatus::Retry);
        assert_eq!(lapsed.last_error.as_deref(), Some(ABANDONED));
        assert_eq!(queue.pending_count().unwrap(), 1);

        let reclaimed = queue.claim(None, lapsed.next_attempt_at).unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.status, JobStatus::Running);
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[test]
    fn test_abandoned_jobs_die_once_the_budget_is_spent() {
        let queue = MemoryJobQueue::default();
        let id = queue.submit(JobKind::RefreshDegrees).unwrap();
        let mut now = 0;
        for attempt in 1..=4 {
            let job = queue.claim(None, now).unwrap().unwrap();
            assert_eq!((job.id, job.attempt_count), (id, attempt));
            now = job.claimed_until;
            assert!(queue.claim(None, now).unwrap().is_none());
            now += 24 * 3600;
        }
        let job = &queue.jobs()[0];
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.attempt_count, job.max_retries + 1);
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_non_retryable_failure_is_dead_immediately() {
        let queue = MemoryJobQueue::default();
        let id = queue.submit(JobKind::DeleteHangingArtifacts).unwrap();
        queue.claim(None, 0).unwrap();
        assert_eq!(queue.fail(id, "bad data", false, 0).unwrap(), JobStatus::Dead);
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_memory_queue_orders_by_priority_then_age() {
        let mut policy = SchedulingPolicy::default();
        let mut urgent = policy.policy_for(&JobKind::RefreshDegrees).clone();
        urgent.priority = 9;
        policy.set("refresh_degrees", urgent);
        let queue = MemoryJobQueue::new(policy);
        let first = queue.submit(JobKind::UpdateAccesses { entry_id: 1 }).unwrap();
        queue.submit(JobKind::UpdateAccesses { entry_id: 2 }).unwrap();
        let refresh = queue.submit(JobKind::RefreshDegrees).unwrap();

        assert_eq!(queue.claim(None, 0).unwrap().unwrap().id, refresh);
        assert_eq!(queue.claim(None, 0).unwrap().unwrap().id, first);
    }

    #[test]
    fn test_defer_does_not_consume_an_attempt() {
        let queue = MemoryJobQueue::default();
        let id = queue.submit(JobKind::UpdateAccesses { entry_id: 5 }).unwrap();
        queue.claim(None, 0).unwrap();
        queue.defer(id, 30).unwrap();
        assert!(queue.claim(None, 10).unwrap().is_none());
        let job = queue.claim(None, 30).unwrap().unwrap();
        assert_eq!(job.attempt_count, 1);
    }
}
