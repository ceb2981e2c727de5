//! Backup records and the multi-tier retention algorithm.

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Ready,
    Deleted,
}

/// Where a backup's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    /// Only on the node's backup directory.
    #[default]
    Local,
    /// Only in object storage; the local copy is removed after upload.
    S3,
    /// Both on the node and in object storage.
    Hybrid,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Local => "local",
            StorageTier::S3 => "s3",
            StorageTier::Hybrid => "hybrid",
        }
    }

    pub fn has_local_copy(&self) -> bool {
        !matches!(self, StorageTier::S3)
    }

    pub fn has_remote_copy(&self) -> bool {
        !matches!(self, StorageTier::Local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Full disk image converted with `qemu-img convert`.
    Qcow2,
    /// A `zfs send` stream of a zvol snapshot.
    ZfsSend,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Qcow2 => "qcow2",
            BackupKind::ZfsSend => "zfs_send",
        }
    }
}

/// Structured result reported by the agent after `BACKUP_CREATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCreated {
    pub kind: BackupKind,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Lower-case hex SHA-256 of the backup file.
    pub checksum: String,
    pub tier: StorageTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A backup to remove, as sent in `BACKUP_DELETE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub id: i64,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub object_key: Option<String>,
}

/// Structured result reported by the agent after `BACKUP_DELETE`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackupsDeleted {
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    /// Cap on the kept set's total size; 0 disables the cap.
    pub max_total_gb: u64,
    /// Backups older than this are dropped; 0 disables the cap.
    pub max_age_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 12,
            max_total_gb: 200,
            max_age_days: 0,
        }
    }
}

/// The inputs retention needs from one `ready` backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionEntry {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetentionPlan {
    /// Kept backup ids, newest first.
    pub keep: Vec<i64>,
    /// Backup ids to delete, oldest first.
    pub drop: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Bucket {
    Day(NaiveDate),
    Week(i32, u32),
    Month(i32, u32),
}

fn day(t: &DateTime<Utc>) -> Bucket {
    Bucket::Day(t.date_naive())
}

fn week(t: &DateTime<Utc>) -> Bucket {
    let iso = t.iso_week();
    Bucket::Week(iso.year(), iso.week())
}

fn month(t: &DateTime<Utc>) -> Bucket {
    Bucket::Month(t.year(), t.month())
}

/// Partition `backups` into keep and drop sets under `policy`.
///
/// Only the backup list, the policy and `now` feed into the result, so the
/// plan can be recomputed at any time.
pub fn plan_retention(
    backups: &[RetentionEntry],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> RetentionPlan {
    let mut newest_first: Vec<&RetentionEntry> = backups.iter().collect();
    newest_first.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

    let mut keep = BTreeSet::new();
    let tiers: [(u32, fn(&DateTime<Utc>) -> Bucket); 3] = [
        (policy.keep_daily, day),
        (policy.keep_weekly, week),
        (policy.keep_monthly, month),
    ];
    for (count, bucket_of) in tiers {
        // The first backup seen in a bucket is its newest; buckets show up in
        // recency order.
        let mut seen = Vec::new();
        for entry in &newest_first {
            let bucket = bucket_of(&entry.created_at);
            if seen.contains(&bucket) {
                continue;
            }
            if seen.len() == count as usize {
                break;
            }
            seen.push(bucket);
            keep.insert(entry.id);
        }
    }

    if policy.max_age_days > 0 {
        let cutoff = now - TimeDelta::days(i64::from(policy.max_age_days));
        for entry in &newest_first {
            if entry.created_at < cutoff {
                keep.remove(&entry.id);
            }
        }
    }

    if policy.max_total_gb > 0 {
        let cap = policy.max_total_gb.saturating_mul(GIB);
        let mut total: u64 = newest_first
            .iter()
            .filter(|e| keep.contains(&e.id))
            .map(|e| e.size_bytes)
            .sum();
        for entry in newest_first.iter().rev() {
            if total <= cap {
                break;
            }
            if keep.remove(&entry.id) {
                total -= entry.size_bytes;
            }
        }
    }

    let mut plan = RetentionPlan::default();
    for entry in &newest_first {
        if keep.contains(&entry.id) {
            plan.keep.push(entry.id);
        }
    }
    for entry in newest_first.iter().rev() {
        if !keep.contains(&entry.id) {
            plan.drop.push(entry.id);
        }
    }
    plan
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn aged(id: i64, days: i64, size_bytes: u64) -> RetentionEntry {
        RetentionEntry {
            id,
            created_at: now() - TimeDelta::days(days),
            size_bytes,
        }
    }

    #[test]
    fn tiered_keep_with_age_cap() {
        let ages = [0, 1, 2, 8, 9, 40, 400];
        let backups: Vec<_> = ages.iter().map(|&d| aged(d, d, GIB)).collect();
        let policy = RetentionPolicy {
            keep_daily: 2,
            keep_weekly: 1,
            keep_monthly: 1,
            max_total_gb: 0,
            max_age_days: 365,
        };
        let plan = plan_retention(&backups, &policy, now());
        assert!(plan.keep.contains(&0));
        assert!(plan.keep.contains(&1));
        assert!(plan.drop.contains(&400));
        assert!(!plan.keep.contains(&400));
        assert_eq!(plan.keep.len() + plan.drop.len(), ages.len());
    }

    #[test]
    fn age_cap_overrides_bucket_membership() {
        // A lone backup would be kept as the newest of its month.
        let backups = vec![aged(1, 400, GIB)];
        let policy = RetentionPolicy {
            keep_daily: 0,
            keep_weekly: 0,
            keep_monthly: 12,
            max_total_gb: 0,
            max_age_days: 365,
        };
        let plan = plan_retention(&backups, &policy, now());
        assert!(plan.keep.is_empty());
        assert_eq!(plan.drop, vec![1]);
    }

    #[test]
    fn newest_per_day_bucket() {
        let morning = RetentionEntry {
            id: 1,
            created_at: Utc.with_ymd_and_hms(2024, 6, 15, 1, 0, 0).unwrap(),
            size_bytes: 1,
        };
        let evening = RetentionEntry {
            id: 2,
            created_at: Utc.with_ymd_and_hms(2024, 6, 15, 11, 0, 0).unwrap(),
            size_bytes: 1,
        };
        let policy = RetentionPolicy {
            keep_daily: 1,
            keep_weekly: 0,
            keep_monthly: 0,
            max_total_gb: 0,
            max_age_days: 0,
        };
        let plan = plan_retention(&[morning, evening], &policy, now());
        assert_eq!(plan.keep, vec![2]);
        assert_eq!(plan.drop, vec![1]);
    }

    #[test]
    fn size_cap_drops_oldest_kept_first() {
        let backups: Vec<_> = (0..5).map(|d| aged(d, d, 10 * GIB)).collect();
        let policy = RetentionPolicy {
            keep_daily: 5,
            keep_weekly: 0,
            keep_monthly: 0,
            max_total_gb: 25,
            max_age_days: 0,
        };
        let plan = plan_retention(&backups, &policy, now());
        assert_eq!(plan.keep, vec![0, 1]);
        assert_eq!(plan.drop, vec![4, 3, 2]);
    }

    #[test]
    fn deterministic() {
        let backups: Vec<_> = [3, 0, 17, 33, 2, 95].iter().map(|&d| aged(d, d, GIB)).collect();
        let policy = RetentionPolicy::default();
        let mut shuffled = backups.clone();
        shuffled.reverse();
        assert_eq!(
            plan_retention(&backups, &policy, now()),
            plan_retention(&shuffled, &policy, now())
        );
    }

    #[test]
    fn empty_input_yields_empty_plan() {
        let plan = plan_retention(&[], &RetentionPolicy::default(), now());
        assert_eq!(plan, RetentionPlan::default());
    }
}
