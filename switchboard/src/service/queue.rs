//! The per-node job queue and its claim/ack protocol.
//!
//! Jobs move `pending -> in_progress -> {done, failed}` and never back.
//! [`JobQueue::claim`] is the only way out of `pending`; [`JobQueue::ack`]
//! and [`JobQueue::fail_stuck`] are the only ways out of `in_progress`.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use corral_rs::api::admin::jobs::JobView;
use corral_rs::api::agent::poll::ClaimedJob;
use corral_rs::job::{JobId, JobOutcome, JobSpec, JobStatus};
use corral_rs::util::text::truncate_utf8;
use sqlx::PgPool;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use super::effects;
use crate::sql;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no such job")]
    NoSuchJob,
    #[error("job was never claimed")]
    NotClaimed,
    #[error("job is not in progress")]
    NotInProgress,
    #[error("job {0} has unknown status {1:?}")]
    UnknownStatus(JobId, String),
}

/// What an acknowledgement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The job moved to its terminal status.
    Finalized,
    /// The job was already terminal; nothing changed.
    AlreadyFinal,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        node_id: Uuid,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<JobId, QueueError>;

    /// Hand the oldest pending job of `node_id` to exactly one caller.
    async fn claim(&self, node_id: Uuid) -> Result<Option<ClaimedJob>, QueueError>;

    async fn ack(
        &self,
        node_id: Uuid,
        job_id: JobId,
        outcome: &JobOutcome,
    ) -> Result<AckOutcome, QueueError>;

    async fn get(&self, job_id: JobId) -> Result<Option<JobView>, QueueError>;

    /// `in_progress` jobs that were claimed more than `older_than` ago.
    async fn list_stale(&self, older_than: TimeDelta) -> Result<Vec<JobView>, QueueError>;

    /// Give up on an `in_progress` job. With `requeue`, a fresh copy with the same kind and
    /// payload is enqueued and its id returned.
    async fn fail_stuck(
        &self,
        job_id: JobId,
        note: &str,
        requeue: bool,
    ) -> Result<Option<JobId>, QueueError>;
}

fn operator_log(note: &str) -> String {
    format!("failed by operator: {note}")
}

pub struct PgJobQueue {
    pool: PgPool,
    log_max_bytes: usize,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, log_max_bytes: usize) -> Self {
        PgJobQueue {
            pool,
            log_max_bytes,
        }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    #[instrument(skip(self, payload))]
    async fn enqueue(
        &self,
        node_id: Uuid,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<JobId, QueueError> {
        let job_id = sql::job::insert(node_id, kind, &payload, &self.pool).await?;
        tracing::info!(%job_id, "enqueued job");
        Ok(job_id)
    }

    #[instrument(skip(self))]
    async fn claim(&self, node_id: Uuid) -> Result<Option<ClaimedJob>, QueueError> {
        let claimed = sql::job::claim(node_id, &self.pool).await?;
        if let Some(job) = &claimed {
            tracing::info!(job_id = job.id, kind = %job.kind, "job claimed");
        }
        Ok(claimed.map(sql::job::SqlJob::claimed))
    }

    #[instrument(skip(self, outcome), fields(status = ?outcome.status))]
    async fn ack(
        &self,
        node_id: Uuid,
        job_id: JobId,
        outcome: &JobOutcome,
    ) -> Result<AckOutcome, QueueError> {
        let mut tx = self.pool.begin().await?;
        let job = sql::job::lock_for_ack(job_id, node_id, &mut tx)
            .await?
            .ok_or(QueueError::NoSuchJob)?;
        match job.status() {
            Some(JobStatus::InProgress) => {}
            Some(JobStatus::Pending) => return Err(QueueError::NotClaimed),
            Some(JobStatus::Done | JobStatus::Failed) => {
                tracing::info!("job already final, ignoring repeated ack");
                return Ok(AckOutcome::AlreadyFinal);
            }
            None => return Err(QueueError::UnknownStatus(job_id, job.status)),
        }

        let log = truncate_utf8(&outcome.log, self.log_max_bytes);
        sql::job::finish(job_id, outcome.status.into(), log, tx.as_mut()).await?;

        match JobSpec::from_wire(&job.kind, job.payload) {
            Ok(spec) => {
                let planned = effects::plan(&spec, outcome);
                effects::apply(node_id, &planned, &mut tx).await?;
            }
            Err(e) => tracing::warn!("not updating domain state for unreadable job: {e}"),
        }

        tx.commit().await?;
        tracing::info!("job finalized");
        Ok(AckOutcome::Finalized)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobView>, QueueError> {
        let Some(job) = sql::job::fetch(job_id, &self.pool).await? else {
            return Ok(None);
        };
        let status = job.status.clone();
        job.into_view()
            .map(Some)
            .ok_or(QueueError::UnknownStatus(job_id, status))
    }

    async fn list_stale(&self, older_than: TimeDelta) -> Result<Vec<JobView>, QueueError> {
        let jobs = sql::job::list_stale(Utc::now() - older_than, &self.pool).await?;
        Ok(jobs.into_iter().filter_map(sql::job::SqlJob::into_view).collect())
    }

    #[instrument(skip(self))]
    async fn fail_stuck(
        &self,
        job_id: JobId,
        note: &str,
        requeue: bool,
    ) -> Result<Option<JobId>, QueueError> {
        let mut tx = self.pool.begin().await?;
        let job = sql::job::fetch(job_id, tx.as_mut())
            .await?
            .ok_or(QueueError::NoSuchJob)?;
        let log = operator_log(note);
        let log = truncate_utf8(&log, self.log_max_bytes);
        if !sql::job::finish(job_id, JobStatus::Failed, log, tx.as_mut()).await? {
            return Err(QueueError::NotInProgress);
        }
        let requeued = if requeue {
            Some(sql::job::insert(job.node_id, &job.kind, &job.payload, tx.as_mut()).await?)
        } else {
            None
        };
        tx.commit().await?;
        tracing::warn!(?requeued, "operator failed stuck job");
        Ok(requeued)
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod memory {
    //! A process-local queue with the same claim/ack rules, used in tests.

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    pub struct MemoryJobQueue {
        jobs: Mutex<BTreeMap<JobId, JobView>>,
        log_max_bytes: usize,
    }

    impl Default for MemoryJobQueue {
        fn default() -> Self {
            MemoryJobQueue::with_log_max_bytes(64 * 1024)
        }
    }

    impl MemoryJobQueue {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_log_max_bytes(log_max_bytes: usize) -> Self {
            MemoryJobQueue {
                jobs: Mutex::new(BTreeMap::new()),
                log_max_bytes,
            }
        }

        fn jobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<JobId, JobView>> {
            self.jobs.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[async_trait]
    impl JobQueue for MemoryJobQueue {
        async fn enqueue(
            &self,
            node_id: Uuid,
            kind: &str,
            payload: serde_json::Value,
        ) -> Result<JobId, QueueError> {
            let mut jobs = self.jobs();
            let job_id = JobId(jobs.keys().next_back().map_or(1, |id| id.0 + 1));
            jobs.insert(
                job_id,
                JobView {
                    id: job_id,
                    node_id,
                    kind: kind.to_string(),
                    payload,
                    status: JobStatus::Pending,
                    created_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                    log: None,
                },
            );
            Ok(job_id)
        }

        async fn claim(&self, node_id: Uuid) -> Result<Option<ClaimedJob>, QueueError> {
            let mut jobs = self.jobs();
            // Ids are handed out in creation order, so the first pending one is the oldest.
            let Some(job) = jobs
                .values_mut()
                .find(|job| job.node_id == node_id && job.status == JobStatus::Pending)
            else {
                return Ok(None);
            };
            job.status = JobStatus::InProgress;
            job.started_at = Some(Utc::now());
            Ok(Some(ClaimedJob {
                id: job.id,
                kind: job.kind.clone(),
                payload: job.payload.clone(),
            }))
        }

        async fn ack(
            &self,
            node_id: Uuid,
            job_id: JobId,
            outcome: &JobOutcome,
        ) -> Result<AckOutcome, QueueError> {
            let mut jobs = self.jobs();
            let job = jobs
                .get_mut(&job_id)
                .filter(|job| job.node_id == node_id)
                .ok_or(QueueError::NoSuchJob)?;
            match job.status {
                JobStatus::Pending => Err(QueueError::NotClaimed),
                JobStatus::Done | JobStatus::Failed => Ok(AckOutcome::AlreadyFinal),
                JobStatus::InProgress => {
                    job.status = outcome.status.into();
                    job.log = Some(truncate_utf8(&outcome.log, self.log_max_bytes).to_string());
                    job.finished_at = Some(Utc::now());
                    Ok(AckOutcome::Finalized)
                }
            }
        }

        async fn get(&self, job_id: JobId) -> Result<Option<JobView>, QueueError> {
            Ok(self.jobs().get(&job_id).cloned())
        }

        async fn list_stale(&self, older_than: TimeDelta) -> Result<Vec<JobView>, QueueError> {
            let cutoff = Utc::now() - older_than;
            Ok(self
                .jobs()
                .values()
                .filter(|job| {
                    job.status == JobStatus::InProgress
                        && job.started_at.is_some_and(|started| started < cutoff)
                })
                .cloned()
                .collect())
        }

        async fn fail_stuck(
            &self,
            job_id: JobId,
            note: &str,
            requeue: bool,
        ) -> Result<Option<JobId>, QueueError> {
            let (node_id, kind, payload) = {
                let mut jobs = self.jobs();
                let job = jobs.get_mut(&job_id).ok_or(QueueError::NoSuchJob)?;
                if job.status != JobStatus::InProgress {
                    return Err(QueueError::NotInProgress);
                }
                job.status = JobStatus::Failed;
                job.log = Some(truncate_utf8(&operator_log(note), self.log_max_bytes).to_string());
                job.finished_at = Some(Utc::now());
                (job.node_id, job.kind.clone(), job.payload.clone())
            };
            if requeue {
                Ok(Some(self.enqueue(node_id, &kind, payload).await?))
            } else {
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::memory::MemoryJobQueue;
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn claims_oldest_pending_per_node() {
        let queue = MemoryJobQueue::new();
        let node_a = Uuid::new_v4();
        let node_b = Uuid::new_v4();
        let first = queue.enqueue(node_a, "START", serde_json::json!({"name": "a"})).await.unwrap();
        let other = queue.enqueue(node_b, "START", serde_json::json!({"name": "b"})).await.unwrap();
        let second = queue.enqueue(node_a, "STOP", serde_json::json!({"name": "a"})).await.unwrap();

        assert_eq!(queue.claim(node_a).await.unwrap().unwrap().id, first);
        assert_eq!(queue.claim(node_a).await.unwrap().unwrap().id, second);
        assert!(queue.claim(node_a).await.unwrap().is_none());
        assert_eq!(queue.claim(node_b).await.unwrap().unwrap().id, other);
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_each_job_once() {
        let queue = Arc::new(MemoryJobQueue::new());
        let node_id = Uuid::new_v4();
        for i in 0..5 {
            queue
                .enqueue(node_id, "REBOOT", serde_json::json!({"name": format!("vm{i}")}))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let queue = Arc::clone(&queue);
            tasks.push(tokio::spawn(async move { queue.claim(node_id).await.unwrap() }));
        }
        let mut claimed = Vec::new();
        for task in tasks {
            if let Some(job) = task.await.unwrap() {
                claimed.push(job.id);
            }
        }

        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 5);
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn ack_is_idempotent_and_never_reverts() {
        let queue = MemoryJobQueue::new();
        let node_id = Uuid::new_v4();
        let job_id = queue.enqueue(node_id, "START", serde_json::json!({})).await.unwrap();

        assert!(matches!(
            queue.ack(node_id, job_id, &JobOutcome::done("early")).await,
            Err(QueueError::NotClaimed)
        ));

        queue.claim(node_id).await.unwrap();
        assert_eq!(
            queue.ack(node_id, job_id, &JobOutcome::done("first")).await.unwrap(),
            AckOutcome::Finalized
        );
        assert_eq!(
            queue.ack(node_id, job_id, &JobOutcome::failed("second")).await.unwrap(),
            AckOutcome::AlreadyFinal
        );

        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.log.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn ack_from_another_node_is_unknown() {
        let queue = MemoryJobQueue::new();
        let node_id = Uuid::new_v4();
        let job_id = queue.enqueue(node_id, "START", serde_json::json!({})).await.unwrap();
        queue.claim(node_id).await.unwrap();
        assert!(matches!(
            queue.ack(Uuid::new_v4(), job_id, &JobOutcome::done("")).await,
            Err(QueueError::NoSuchJob)
        ));
    }

    #[tokio::test]
    async fn stale_jobs_can_be_failed_and_requeued() {
        let queue = MemoryJobQueue::new();
        let node_id = Uuid::new_v4();
        let payload = serde_json::json!({"name": "vm1"});
        let job_id = queue.enqueue(node_id, "STOP", payload.clone()).await.unwrap();

        assert!(matches!(
            queue.fail_stuck(job_id, "hung", false).await,
            Err(QueueError::NotInProgress)
        ));

        queue.claim(node_id).await.unwrap();
        let stale = queue.list_stale(TimeDelta::seconds(-1)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert!(queue.list_stale(TimeDelta::hours(1)).await.unwrap().is_empty());

        let requeued = queue.fail_stuck(job_id, "virsh hung", true).await.unwrap().unwrap();
        let failed = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.log.as_deref(), Some("failed by operator: virsh hung"));

        let copy = queue.get(requeued).await.unwrap().unwrap();
        assert_eq!(copy.status, JobStatus::Pending);
        assert_eq!(copy.kind, "STOP");
        assert_eq!(copy.payload, payload);
    }

    #[tokio::test]
    async fn stored_logs_are_capped() {
        let queue = MemoryJobQueue::with_log_max_bytes(8);
        let node_id = Uuid::new_v4();
        let job_id = queue.enqueue(node_id, "START", serde_json::json!({})).await.unwrap();
        queue.claim(node_id).await.unwrap();
        queue
            .ack(node_id, job_id, &JobOutcome::failed("héllo wörld, a long diagnostic"))
            .await
            .unwrap();
        let job = queue.get(job_id).await.unwrap().unwrap();
        // "héllo w" is 8 bytes; the cut never splits a character.
        assert_eq!(job.log.as_deref(), Some("héllo w"));
    }
}
