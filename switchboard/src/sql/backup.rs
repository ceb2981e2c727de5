use chrono::{DateTime, Utc};
use corral_rs::api::admin::backups::BackupPolicy;
use corral_rs::backup::{BackupArtifact, BackupCreated, RetentionEntry, RetentionPolicy, StorageTier};
use sqlx::PgExecutor;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqlBackup {
    pub id: i64,
    pub vm_uuid: Uuid,
    pub kind: String,
    pub path: Option<String>,
    pub object_key: Option<String>,
    pub size_bytes: i64,
    pub checksum: String,
    pub tier: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl SqlBackup {
    pub fn retention_entry(&self) -> RetentionEntry {
        RetentionEntry {
            id: self.id,
            created_at: self.created_at,
            size_bytes: u64::try_from(self.size_bytes).unwrap_or(0),
        }
    }

    pub fn artifact(&self) -> BackupArtifact {
        BackupArtifact {
            id: self.id,
            path: self.path.as_ref().map(PathBuf::from),
            object_key: self.object_key.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

pub async fn list_ready(
    vm_uuid: Uuid,
    conn: impl PgExecutor<'_>,
) -> Result<Vec<SqlBackup>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select id, vm_uuid, kind, path, object_key, size_bytes, checksum, tier, status, created_at
        from corral.backups
        where vm_uuid = $1 and status = 'ready'
        order by created_at desc, id desc
        "#,
    )
    .bind(vm_uuid)
    .fetch_all(conn)
    .await
}

pub async fn fetch(
    vm_uuid: Uuid,
    backup_id: i64,
    conn: impl PgExecutor<'_>,
) -> Result<Option<SqlBackup>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select id, vm_uuid, kind, path, object_key, size_bytes, checksum, tier, status, created_at
        from corral.backups
        where vm_uuid = $1 and id = $2
        "#,
    )
    .bind(vm_uuid)
    .bind(backup_id)
    .fetch_optional(conn)
    .await
}

pub async fn insert(
    vm_uuid: Uuid,
    created: &BackupCreated,
    conn: impl PgExecutor<'_>,
) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into corral.backups
            (vm_uuid, kind, path, object_key, size_bytes, checksum, tier, status, created_at)
        values ($1, $2, $3, $4, $5, $6, $7, 'ready', $8)
        returning id
        "#,
    )
    .bind(vm_uuid)
    .bind(created.kind.as_str())
    // An s3-tier backup no longer has a local file.
    .bind(
        created
            .tier
            .has_local_copy()
            .then(|| created.path.display().to_string()),
    )
    .bind(&created.object_key)
    .bind(i64::try_from(created.size_bytes).unwrap_or(i64::MAX))
    .bind(&created.checksum)
    .bind(created.tier.as_str())
    .bind(created.created_at)
    .fetch_one(conn)
    .await?;
    Ok(id)
}

pub async fn mark_deleted(
    vm_uuid: Uuid,
    ids: &[i64],
    conn: impl PgExecutor<'_>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        update corral.backups
        set status = 'deleted'
        where vm_uuid = $1 and id = any($2) and status = 'ready'
        "#,
    )
    .bind(vm_uuid)
    .bind(ids)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// The VM's own retention policy, if one was configured.
pub async fn policy_for(
    vm_uuid: Uuid,
    conn: impl PgExecutor<'_>,
) -> Result<Option<RetentionPolicy>, sqlx::Error> {
    let row: Option<(i32, i32, i32, i64, i32)> = sqlx::query_as(
        r#"
        select keep_daily, keep_weekly, keep_monthly, max_total_gb, max_age_days
        from corral.backup_policies
        where vm_uuid = $1
        "#,
    )
    .bind(vm_uuid)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(
        |(keep_daily, keep_weekly, keep_monthly, max_total_gb, max_age_days)| RetentionPolicy {
            keep_daily: u32::try_from(keep_daily).unwrap_or(0),
            keep_weekly: u32::try_from(keep_weekly).unwrap_or(0),
            keep_monthly: u32::try_from(keep_monthly).unwrap_or(0),
            max_total_gb: u64::try_from(max_total_gb).unwrap_or(0),
            max_age_days: u32::try_from(max_age_days).unwrap_or(0),
        },
    ))
}

pub fn parse_tier(raw: &str) -> Option<StorageTier> {
    match raw {
        "local" => Some(StorageTier::Local),
        "s3" => Some(StorageTier::S3),
        "hybrid" => Some(StorageTier::Hybrid),
        _ => None,
    }
}

/// Insert or replace the VM's policy.
pub async fn upsert_policy(
    vm_uuid: Uuid,
    policy: &BackupPolicy,
    conn: impl PgExecutor<'_>,
) -> Result<(), sqlx::Error> {
    let retention = &policy.retention;
    sqlx::query(
        r#"
        insert into corral.backup_policies
            (vm_uuid, keep_daily, keep_weekly, keep_monthly, max_total_gb, max_age_days,
             backup_every_hours, backup_tier)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        on conflict (vm_uuid) do update
        set keep_daily = excluded.keep_daily,
            keep_weekly = excluded.keep_weekly,
            keep_monthly = excluded.keep_monthly,
            max_total_gb = excluded.max_total_gb,
            max_age_days = excluded.max_age_days,
            backup_every_hours = excluded.backup_every_hours,
            backup_tier = excluded.backup_tier
        "#,
    )
    .bind(vm_uuid)
    .bind(i32::try_from(retention.keep_daily).unwrap_or(i32::MAX))
    .bind(i32::try_from(retention.keep_weekly).unwrap_or(i32::MAX))
    .bind(i32::try_from(retention.keep_monthly).unwrap_or(i32::MAX))
    .bind(i64::try_from(retention.max_total_gb).unwrap_or(i64::MAX))
    .bind(i32::try_from(retention.max_age_days).unwrap_or(i32::MAX))
    .bind(policy.backup_every_hours.map(|h| i32::try_from(h).unwrap_or(i32::MAX)))
    .bind(policy.tier.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

/// One policy row as the scheduler sees it, with the facts it decides on.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqlScheduledPolicy {
    pub vm_uuid: Uuid,
    pub vm_deleted: bool,
    pub backup_every_hours: Option<i32>,
    pub backup_tier: String,
    /// Newest `ready` backup.
    pub last_backup_at: Option<DateTime<Utc>>,
    /// Newest `BACKUP_CREATE` job, whatever its outcome.
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub backup_in_flight: bool,
    pub delete_in_flight: bool,
}

pub async fn scheduled_policies(
    conn: impl PgExecutor<'_>,
) -> Result<Vec<SqlScheduledPolicy>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select p.vm_uuid,
               v.deleted_at is not null as vm_deleted,
               p.backup_every_hours,
               p.backup_tier,
               (select max(b.created_at) from corral.backups b
                 where b.vm_uuid = p.vm_uuid and b.status = 'ready') as last_backup_at,
               (select max(j.created_at) from corral.jobs j
                 where j.type = 'BACKUP_CREATE' and j.payload ->> 'vm_uuid' = p.vm_uuid::text)
                   as last_attempt_at,
               exists(select 1 from corral.jobs j
                       where j.type = 'BACKUP_CREATE' and j.status in ('pending', 'in_progress')
                         and j.payload ->> 'vm_uuid' = p.vm_uuid::text) as backup_in_flight,
               exists(select 1 from corral.jobs j
                       where j.type = 'BACKUP_DELETE' and j.status in ('pending', 'in_progress')
                         and j.payload ->> 'vm_uuid' = p.vm_uuid::text) as delete_in_flight
        from corral.backup_policies p
        join corral.vms v on v.vm_uuid = p.vm_uuid
        order by p.vm_uuid
        "#,
    )
    .fetch_all(conn)
    .await
}
