use chrono::{DateTime, Utc};
use corral_rs::api::admin::jobs::JobView;
use corral_rs::api::agent::poll::ClaimedJob;
use corral_rs::job::{JobId, JobStatus};
use sqlx::{PgExecutor, Postgres, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqlJob {
    pub id: i64,
    pub node_id: Uuid,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::InProgress => "in_progress",
        JobStatus::Done => "done",
        JobStatus::Failed => "failed",
    }
}

pub fn parse_status(raw: &str) -> Option<JobStatus> {
    Some(match raw {
        "pending" => JobStatus::Pending,
        "in_progress" => JobStatus::InProgress,
        "done" => JobStatus::Done,
        "failed" => JobStatus::Failed,
        _ => return None,
    })
}

impl SqlJob {
    pub fn job_id(&self) -> JobId {
        JobId(self.id)
    }

    /// The stored status. The column is constrained to the four known values.
    pub fn status(&self) -> Option<JobStatus> {
        parse_status(&self.status)
    }

    pub fn claimed(self) -> ClaimedJob {
        ClaimedJob {
            id: JobId(self.id),
            kind: self.kind,
            payload: self.payload,
        }
    }

    pub fn into_view(self) -> Option<JobView> {
        Some(JobView {
            id: JobId(self.id),
            node_id: self.node_id,
            status: parse_status(&self.status)?,
            kind: self.kind,
            payload: self.payload,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            log: self.log,
        })
    }
}

pub async fn insert(
    node_id: Uuid,
    kind: &str,
    payload: &serde_json::Value,
    conn: impl PgExecutor<'_>,
) -> Result<JobId, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into corral.jobs (node_id, type, payload, status)
        values ($1, $2, $3, 'pending')
        returning id
        "#,
    )
    .bind(node_id)
    .bind(kind)
    .bind(payload)
    .fetch_one(conn)
    .await?;
    Ok(JobId(id))
}

/// Move the oldest pending job of `node_id` to `in_progress` and return it.
///
/// `skip locked` lets concurrent claimers pass over a row another transaction is already
/// claiming, and the outer `status = 'pending'` guard makes the transition conditional, so a
/// job is handed out at most once.
pub async fn claim(node_id: Uuid, conn: impl PgExecutor<'_>) -> Result<Option<SqlJob>, sqlx::Error> {
    sqlx::query_as(
        r#"
        update corral.jobs
        set status = 'in_progress', started_at = now()
        where id = (select id
                    from corral.jobs
                    where node_id = $1 and status = 'pending'
                    order by created_at, id
                    for update skip locked
                    limit 1)
          and status = 'pending'
        returning id, node_id, type, payload, status, log, created_at, started_at, finished_at
        "#,
    )
    .bind(node_id)
    .fetch_optional(conn)
    .await
}

pub async fn fetch(job_id: JobId, conn: impl PgExecutor<'_>) -> Result<Option<SqlJob>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select id, node_id, type, payload, status, log, created_at, started_at, finished_at
        from corral.jobs
        where id = $1
        "#,
    )
    .bind(job_id.0)
    .fetch_optional(conn)
    .await
}

/// Lock a job of `node_id` for finalization.
pub async fn lock_for_ack(
    job_id: JobId,
    node_id: Uuid,
    conn: &mut Transaction<'_, Postgres>,
) -> Result<Option<SqlJob>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select id, node_id, type, payload, status, log, created_at, started_at, finished_at
        from corral.jobs
        where id = $1 and node_id = $2
        for update
        "#,
    )
    .bind(job_id.0)
    .bind(node_id)
    .fetch_optional(conn.as_mut())
    .await
}

/// Finalize an `in_progress` job. Returns whether a row changed.
pub async fn finish(
    job_id: JobId,
    status: JobStatus,
    log: &str,
    conn: impl PgExecutor<'_>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        update corral.jobs
        set status = $2, log = $3, finished_at = now()
        where id = $1 and status = 'in_progress'
        "#,
    )
    .bind(job_id.0)
    .bind(status_str(status))
    .bind(log)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn list_stale(
    started_before: DateTime<Utc>,
    conn: impl PgExecutor<'_>,
) -> Result<Vec<SqlJob>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select id, node_id, type, payload, status, log, created_at, started_at, finished_at
        from corral.jobs
        where status = 'in_progress' and started_at < $1
        order by started_at, id
        "#,
    )
    .bind(started_before)
    .fetch_all(conn)
    .await
}
