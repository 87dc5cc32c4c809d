//! Executes claimed outbox jobs against the store.

use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::access::model::{propagate, propagate_content, PropagationLimits};
use crate::config::Settings;
use crate::errors::CradleResult;
use crate::graph::children::scan_for_children;
use crate::graph::maintenance::{delete_hanging_artifacts, refresh_degrees};
use crate::jobs::lease::{new_holder_token, LeaseTable};
use crate::jobs::policy::{JobKind, Queue};
use crate::jobs::queue::{JobQueue, JobStatus, QueuedJob};

/// Seconds a job waits before retrying a busy lease.
const LEASE_RETRY_SECS: i64 = 30;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { job_id: i64, follow_ups: Vec<JobKind> },
    /// The entry lease is held elsewhere; the job is back in the queue.
    Deferred { job_id: i64, until: i64 },
    Failed { job_id: i64, status: JobStatus, error: String },
}

pub struct JobRunner {
    settings: Settings,
    holder: String,
}

impl JobRunner {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            holder: new_holder_token(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn deadline_for(&self, job: &JobKind) -> Duration {
        let policy = self.settings.scheduling.policy_for(job);
        policy.soft_time_limit.min(self.settings.propagation_deadline)
    }

    /// Run the body of `job` and return the jobs it schedules next. Bodies
    /// that must enqueue atomically with their writes submit to `queue`.
    pub fn run_body(
        &self,
        conn: &Connection,
        queue: &dyn JobQueue,
        job: &JobKind,
    ) -> CradleResult<Vec<JobKind>> {
        let limits = PropagationLimits {
            deadline: Some(Instant::now() + self.deadline_for(job)),
            max_visited: self.settings.max_propagation_visited,
        };
        match job {
            JobKind::UpdateAccesses { entry_id } => {
                let report = propagate(conn, *entry_id, &limits)?;
                debug!(
                    "entry {entry_id}: {} contents changed",
                    report.affected.len()
                );
                Ok(Vec::new())
            }
            JobKind::PropagateContent { content } => {
                propagate_content(conn, content)?;
                Ok(Vec::new())
            }
            JobKind::ScanChildren { entry_ids, content } => {
                let report = scan_for_children(conn, queue, entry_ids, content)?;
                let mut follow_ups = Vec::new();
                if report.relations_created > 0 || report.relations_removed > 0 {
                    follow_ups.push(JobKind::PropagateContent {
                        content: content.clone(),
                    });
                }
                if report.created_any() {
                    follow_ups.push(JobKind::RefreshDegrees);
                }
                Ok(follow_ups)
            }
            JobKind::RefreshDegrees => {
                let changed = refresh_degrees(conn)?;
                debug!("refreshed {changed} degrees");
                Ok(Vec::new())
            }
            JobKind::DeleteHangingArtifacts => {
                delete_hanging_artifacts(conn)?;
                Ok(Vec::new())
            }
        }
    }

    /// Run one claimed job: take its lease if it has one, run the body,
    /// then complete, defer or fail it on `queue`.
    pub fn execute(
        &self,
        conn: &Connection,
        queue: &dyn JobQueue,
        claimed: &QueuedJob,
        now: i64,
    ) -> CradleResult<JobOutcome> {
        let leases = LeaseTable::new(conn);
        let lease_key = claimed.job.lease_key();
        if let Some(key) = &lease_key {
            if !leases.acquire(key, &self.holder, self.settings.lease_timeout, now)? {
                let until = now + LEASE_RETRY_SECS;
                queue.defer(claimed.id, until)?;
                debug!("job {} deferred, {key} is busy", claimed.id);
                return Ok(JobOutcome::Deferred {
                    job_id: claimed.id,
                    until,
                });
            }
        }

        let started = Instant::now();
        let mut result = self.run_body(conn, queue, &claimed.job);
        if let Some(key) = &lease_key {
            // An unreleased lease lapses on its own; the job is still failed.
            if let Err(err) = leases.release(key, &self.holder) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        match result {
            Ok(follow_ups) => {
                for job in &follow_ups {
                    queue.submit(job.clone())?;
                }
                queue.complete(claimed.id)?;
                info!(
                    "job {} ({}) done in {:.3}s",
                    claimed.id,
                    claimed.job.name(),
                    started.elapsed().as_secs_f64()
                );
                Ok(JobOutcome::Completed {
                    job_id: claimed.id,
                    follow_ups,
                })
            }
            Err(err) => {
                let message = err.to_string();
                warn!("job {} ({}) failed: {message}", claimed.id, claimed.job.name());
                let status = queue.fail(claimed.id, &message, err.is_retryable(), now)?;
                Ok(JobOutcome::Failed {
                    job_id: claimed.id,
                    status,
                    error: message,
                })
            }
        }
    }

    /// Claim and execute up to `limit` due jobs.
    pub fn run_pending(
        &self,
        conn: &Connection,
        queue: &dyn JobQueue,
        only: Option<Queue>,
        limit: usize,
        now: i64,
    ) -> CradleResult<Vec<JobOutcome>> {
        let mut outcomes = Vec::new();
        while outcomes.len() < limit {
            let Some(claimed) = queue.claim(only, now)? else {
                break;
            };
            outcomes.push(self.execute(conn, queue, &claimed, now)?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::model::allocate_vector;
    use crate::jobs::queue::SqliteJobQueue;
    use crate::models::{ClassFormat, EntryType};
    use crate::store::records::{
        add_class_child, add_content_entry, create_content, create_entry, create_entry_class,
        get_entry, relations_owned_by,
    };
    use crate::store::schema::open_in_memory;

    #[test]
    fn test_update_accesses_completes_and_releases_lease() {
        let conn = open_in_memory().unwrap();
        let settings = Settings::default();
        let queue = SqliteJobQueue::new(&conn, &settings.scheduling);
        let class = create_entry_class(&conn, "case", EntryType::Entity, None).unwrap();
        let entity = create_entry(&conn, class.id, "entity", None).unwrap();
        allocate_vector(&conn, entity.id).unwrap();
        queue.submit(JobKind::UpdateAccesses { entry_id: entity.id }).unwrap();

        let runner = JobRunner::new(settings.clone());
        let outcomes = runner.run_pending(&conn, &queue, None, 10, 1_000).unwrap();

        assert!(matches!(outcomes.as_slice(), [JobOutcome::Completed { .. }]));
        assert_eq!(queue.pending_count().unwrap(), 0);
        let key = format!("acvec:{}", entity.id);
        assert_eq!(LeaseTable::new(&conn).holder(&key, 1_000).unwrap(), None);
    }

    #[test]
    fn test_busy_lease_defers_without_consuming_an_attempt() {
        let conn = open_in_memory().unwrap();
        let settings = Settings::default();
        let queue = SqliteJobQueue::new(&conn, &settings.scheduling);
        let class = create_entry_class(&conn, "case", EntryType::Entity, None).unwrap();
        let entity = create_entry(&conn, class.id, "entity", None).unwrap();
        let job_id = queue.submit(JobKind::UpdateAccesses { entry_id: entity.id }).unwrap();

        let key = format!("acvec:{}", entity.id);
        LeaseTable::new(&conn)
            .acquire(&key, "someone-else", Duration::from_secs(600), 1_000)
            .unwrap();

        let runner = JobRunner::new(settings.clone());
        let outcomes = runner.run_pending(&conn, &queue, None, 1, 1_000).unwrap();
        assert_eq!(
            outcomes,
            vec![JobOutcome::Deferred {
                job_id,
                until: 1_000 + LEASE_RETRY_SECS
            }]
        );
        let job = queue.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);
    }

    #[test]
    fn test_failed_lease_release_fails_the_job() {
        let conn = open_in_memory().unwrap();
        let settings = Settings::default();
        let queue = SqliteJobQueue::new(&conn, &settings.scheduling);
        let class = create_entry_class(&conn, "case", EntryType::Entity, None).unwrap();
        let entity = create_entry(&conn, class.id, "entity", None).unwrap();
        let job_id = queue.submit(JobKind::UpdateAccesses { entry_id: entity.id }).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER pin_leases BEFORE DELETE ON leases \
             BEGIN SELECT RAISE(ABORT, 'leases are pinned'); END;",
        )
        .unwrap();

        let runner = JobRunner::new(settings.clone());
        let outcomes = runner.run_pending(&conn, &queue, None, 1, 1_000).unwrap();
        assert!(matches!(
            outcomes.as_slice(),
            [JobOutcome::Failed { status: JobStatus::Retry, .. }]
        ));
        assert_eq!(queue.get(job_id).unwrap().status, JobStatus::Retry);
    }

    #[test]
    fn test_missing_entry_fails_permanently() {
        let conn = open_in_memory().unwrap();
        let settings = Settings::default();
        let queue = SqliteJobQueue::new(&conn, &settings.scheduling);
        let job_id = queue.submit(JobKind::UpdateAccesses { entry_id: 404 }).unwrap();

        let runner = JobRunner::new(settings.clone());
        let outcomes = runner.run_pending(&conn, &queue, None, 1, 1_000).unwrap();
        assert!(matches!(
            outcomes.as_slice(),
            [JobOutcome::Failed { status: JobStatus::Dead, .. }]
        ));
        assert_eq!(queue.get(job_id).unwrap().status, JobStatus::Dead);
    }

    #[test]
    fn test_scan_children_schedules_propagation_and_degree_refresh() {
        let conn = open_in_memory().unwrap();
        let settings = Settings::default();
        let queue = SqliteJobQueue::new(&conn, &settings.scheduling);
        let case = create_entry_class(&conn, "case", EntryType::Entity, None).unwrap();
        let ip = create_entry_class(
            &conn,
            "ip",
            EntryType::Artifact,
            Some(&ClassFormat::Regex(r"\d+\.\d+\.\d+\.\d+".into())),
        )
        .unwrap();
        add_class_child(&conn, case.id, ip.id).unwrap();
        let parent = create_entry(&conn, case.id, "beacon to 10.1.2.3", None).unwrap();
        let note = create_content(&conn, "note").unwrap();
        add_content_entry(&conn, &note, parent.id).unwrap();

        queue
            .submit(JobKind::ScanChildren {
                entry_ids: vec![parent.id],
                content: note.clone(),
            })
            .unwrap();
        let runner = JobRunner::new(settings.clone());
        let first = runner.run_pending(&conn, &queue, None, 1, 1_000).unwrap();
        assert_eq!(
            first,
            vec![JobOutcome::Completed {
                job_id: 1,
                follow_ups: vec![
                    JobKind::PropagateContent { content: note.clone() },
                    JobKind::RefreshDegrees
                ],
            }]
        );

        let child = relations_owned_by(&conn, &note).unwrap()[0].e1;
        assert_eq!(
            queue.jobs_with_status(JobStatus::Queued, 10).unwrap()[0].job,
            JobKind::UpdateAccesses { entry_id: child }
        );

        let rest = runner.run_pending(&conn, &queue, None, 10, 1_000).unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(relations_owned_by(&conn, &note).unwrap().len(), 1);
        assert_eq!(get_entry(&conn, parent.id).unwrap().degree, 1);
    }
}
