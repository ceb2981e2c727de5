//! Periodic backups and pruning driven by `backup_policies`.
//!
//! Every pass looks at each policy once. A live VM whose policy has a backup interval gets a
//! `BACKUP_CREATE` when both its newest backup and its newest backup attempt are at least that
//! old, so a failing backup is retried once per interval rather than on every pass. Every VM
//! with a policy, live or deleted, is then pruned unless a deletion for it is still queued.

use super::{Service, ServiceError};
use crate::sql;
use crate::sql::backup::SqlScheduledPolicy;
use chrono::{DateTime, TimeDelta, Utc};
use corral_rs::backup::StorageTier;
use corral_rs::job::JobId;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;

/// What one scheduler pass decided for one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub vm_uuid: Uuid,
    /// Tier of the backup to enqueue, if one is due.
    pub backup: Option<StorageTier>,
    pub prune: bool,
}

pub fn decide(policy: &SqlScheduledPolicy, now: DateTime<Utc>) -> Decision {
    let backup = match policy.backup_every_hours {
        Some(hours) if hours > 0 && !policy.vm_deleted && !policy.backup_in_flight => {
            let every = TimeDelta::hours(i64::from(hours));
            let newest = policy.last_backup_at.max(policy.last_attempt_at);
            let due = newest.map_or(true, |at| now - at >= every);
            match sql::backup::parse_tier(&policy.backup_tier) {
                Some(tier) if due => Some(tier),
                Some(_) => None,
                None => {
                    tracing::warn!(vm_uuid = %policy.vm_uuid, tier = %policy.backup_tier, "policy has unknown backup tier");
                    None
                }
            }
        }
        _ => None,
    };
    Decision {
        vm_uuid: policy.vm_uuid,
        backup,
        prune: !policy.delete_in_flight,
    }
}

/// Jobs one pass enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub backups: Vec<JobId>,
    pub prunes: Vec<JobId>,
    /// VMs whose backup or prune failed to enqueue; the next pass tries again.
    pub failures: usize,
}

impl Service {
    /// One pass over every backup policy. A failure for one VM is logged and does not stop
    /// the others.
    #[instrument(skip(self))]
    pub async fn run_schedule(&self, now: DateTime<Utc>) -> Result<ScheduleReport, ServiceError> {
        let policies = sql::backup::scheduled_policies(&self.pool).await?;
        let mut report = ScheduleReport::default();

        for decision in policies.iter().map(|policy| decide(policy, now)) {
            let vm_uuid = decision.vm_uuid;
            if let Some(tier) = decision.backup {
                match self.create_backup(vm_uuid, tier).await {
                    Ok(job_id) => report.backups.push(job_id),
                    Err(e) => {
                        tracing::error!(%vm_uuid, "failed to enqueue scheduled backup: {e}");
                        report.failures += 1;
                    }
                }
            }
            if decision.prune {
                match self.prune_backups(vm_uuid, None).await {
                    Ok((_, Some(job_id))) => report.prunes.push(job_id),
                    Ok((_, None)) => {}
                    Err(e) => {
                        tracing::error!(%vm_uuid, "failed to prune backups: {e}");
                        report.failures += 1;
                    }
                }
            }
        }

        tracing::info!(
            policies = policies.len(),
            backups = report.backups.len(),
            prunes = report.prunes.len(),
            failures = report.failures,
            "scheduler pass finished"
        );
        Ok(report)
    }
}

/// Run [`Service::run_schedule`] every `interval` until the task is aborted.
pub fn spawn(service: Arc<Service>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // A pass slower than the interval should not be followed by a burst of catch-up passes.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = service.run_schedule(Utc::now()).await {
                tracing::error!("scheduler pass failed: {e}");
            }
        }
    })
}
