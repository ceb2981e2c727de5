//! Domain-state updates that follow a job's first finalization.
//!
//! [`plan`] is pure: it looks at the job's kind, payload and reported outcome
//! and lists what has to change. [`apply`] then performs those changes inside
//! the transaction that finalized the job, so the job row and the domain
//! state never disagree.

use corral_rs::backup::{BackupCreated, BackupsDeleted};
use corral_rs::instance::{InstanceRef, InstanceSpec};
use corral_rs::job::{JobOutcome, JobSpec};
use corral_rs::lifecycle::VmAction;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::sql;

/// How a job payload names its instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmKey {
    pub vm_uuid: Option<Uuid>,
    pub name: String,
}

impl From<&InstanceRef> for VmKey {
    fn from(instance: &InstanceRef) -> Self {
        VmKey {
            vm_uuid: instance.vm_uuid,
            name: instance.name.clone(),
        }
    }
}

impl From<&InstanceSpec> for VmKey {
    fn from(instance: &InstanceSpec) -> Self {
        VmKey {
            vm_uuid: instance.vm_uuid,
            name: instance.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Record the status the lifecycle state machine yields for this outcome.
    VmTransition {
        vm: VmKey,
        action: VmAction,
        succeeded: bool,
    },
    DiskResized {
        vm: VmKey,
        disk_gb: u64,
    },
    BackupRecorded {
        vm: VmKey,
        created: BackupCreated,
    },
    BackupsDeleted {
        vm_uuid: Uuid,
        ids: Vec<i64>,
    },
    /// Soft-delete the VM row and return its addresses to their ranges.
    VmRetired {
        vm: VmKey,
    },
}

pub fn plan(spec: &JobSpec, outcome: &JobOutcome) -> Vec<Effect> {
    let succeeded = outcome.succeeded();
    let transition = |vm: VmKey, action: VmAction| Effect::VmTransition {
        vm,
        action,
        succeeded,
    };

    match spec {
        JobSpec::Create(instance) => vec![transition(instance.into(), VmAction::Create)],
        JobSpec::BackupRestoreAsNew(restore) => {
            vec![transition((&restore.instance).into(), VmAction::Create)]
        }
        JobSpec::Start(instance) => vec![transition(instance.into(), VmAction::Start)],
        JobSpec::Stop(instance) => vec![transition(instance.into(), VmAction::Stop)],
        JobSpec::Reboot(instance) => vec![transition(instance.into(), VmAction::Reboot)],
        JobSpec::Reinstall(reinstall) => {
            vec![transition((&reinstall.instance).into(), VmAction::Reinstall)]
        }
        JobSpec::Delete(delete) => {
            let vm = VmKey::from(&delete.instance);
            let mut effects = vec![transition(vm.clone(), VmAction::Delete)];
            if succeeded {
                effects.push(Effect::VmRetired { vm });
            }
            effects
        }
        JobSpec::DiskResize(resize) if succeeded => vec![Effect::DiskResized {
            vm: (&resize.instance).into(),
            disk_gb: resize.disk_gb,
        }],
        JobSpec::BackupCreate(create) if succeeded => {
            match result_as::<BackupCreated>(outcome) {
                Some(created) => vec![Effect::BackupRecorded {
                    vm: (&create.instance).into(),
                    created,
                }],
                None => vec![],
            }
        }
        // A partially failed delete still reports the backups it did remove.
        JobSpec::BackupDelete(delete) => {
            let Some(deleted) = result_as::<BackupsDeleted>(outcome) else {
                return vec![];
            };
            let ids: Vec<i64> = deleted
                .ids
                .into_iter()
                .filter(|id| delete.backups.iter().any(|b| b.id == *id))
                .collect();
            if ids.is_empty() {
                vec![]
            } else {
                vec![Effect::BackupsDeleted {
                    vm_uuid: delete.vm_uuid,
                    ids,
                }]
            }
        }
        JobSpec::DiskResize(_)
        | JobSpec::BackupCreate(_)
        | JobSpec::NetSetup(_)
        | JobSpec::NetAntispoof(_)
        | JobSpec::FwSync(_)
        | JobSpec::RaSetup(_)
        | JobSpec::SnapshotCreate(_) => vec![],
    }
}

fn result_as<T: serde::de::DeserializeOwned>(outcome: &JobOutcome) -> Option<T> {
    let result = outcome.result.as_ref()?;
    match serde_json::from_value(result.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!("ignoring unreadable job result: {e}");
            None
        }
    }
}

/// Apply `effects` for a job that ran on `node_id`.
///
/// A VM that no longer exists (deleted concurrently, or never recorded because the job was
/// enqueued raw) is skipped with a warning.
pub async fn apply(
    node_id: Uuid,
    effects: &[Effect],
    conn: &mut Transaction<'_, Postgres>,
) -> Result<(), sqlx::Error> {
    for effect in effects {
        match effect {
            Effect::VmTransition {
                vm,
                action,
                succeeded,
            } => {
                let Some(row) = lock_vm(node_id, vm, conn).await? else {
                    continue;
                };
                let Some(current) = row.status() else {
                    tracing::warn!(vm_uuid = %row.vm_uuid, "VM has unknown status {:?}", row.status);
                    continue;
                };
                let next = current.after(*action, *succeeded);
                if next != current {
                    tracing::info!(vm_uuid = %row.vm_uuid, %action, from = %current, to = %next, "VM status changed");
                    sql::vm::set_status(row.vm_uuid, next, conn.as_mut()).await?;
                }
            }
            Effect::DiskResized { vm, disk_gb } => {
                if let Some(row) = lock_vm(node_id, vm, conn).await? {
                    sql::vm::set_disk_gb(row.vm_uuid, *disk_gb, conn.as_mut()).await?;
                }
            }
            Effect::BackupRecorded { vm, created } => {
                if let Some(row) = lock_vm(node_id, vm, conn).await? {
                    let id = sql::backup::insert(row.vm_uuid, created, conn.as_mut()).await?;
                    tracing::info!(vm_uuid = %row.vm_uuid, backup_id = id, "recorded backup");
                }
            }
            Effect::BackupsDeleted { vm_uuid, ids } => {
                let marked = sql::backup::mark_deleted(*vm_uuid, ids, conn.as_mut()).await?;
                tracing::info!(%vm_uuid, marked, "marked backups deleted");
            }
            Effect::VmRetired { vm } => {
                let Some(row) = lock_vm(node_id, vm, conn).await? else {
                    continue;
                };
                sql::vm::soft_delete(row.vm_uuid, conn.as_mut()).await?;
                let released = sql::ipam::release_for_vm(row.vm_uuid, conn.as_mut()).await?;
                tracing::info!(vm_uuid = %row.vm_uuid, released, "retired VM");
            }
        }
    }
    Ok(())
}

async fn lock_vm(
    node_id: Uuid,
    vm: &VmKey,
    conn: &mut Transaction<'_, Postgres>,
) -> Result<Option<sql::vm::SqlVm>, sqlx::Error> {
    let Some(vm_uuid) = sql::vm::resolve(node_id, vm.vm_uuid, &vm.name, conn.as_mut()).await?
    else {
        tracing::warn!(%node_id, name = %vm.name, "job refers to a VM that is not recorded");
        return Ok(None);
    };
    sql::vm::lock_live(vm_uuid, conn).await
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use corral_rs::backup::{BackupArtifact, BackupKind, StorageTier};
    use corral_rs::instance::InstanceType;
    use corral_rs::job::{BackupCreate, BackupDelete, Delete, FirewallSync};
    use std::path::PathBuf;

    fn instance() -> InstanceRef {
        InstanceRef {
            vm_uuid: Some(Uuid::from_u128(7)),
            name: "vm1".to_string(),
            instance_type: InstanceType::Kvm,
        }
    }

    #[test]
    fn lifecycle_jobs_transition_on_both_outcomes() {
        let spec = JobSpec::Stop(instance());
        for outcome in [JobOutcome::done("ok"), JobOutcome::failed("nope")] {
            let succeeded = outcome.succeeded();
            assert_eq!(
                plan(&spec, &outcome),
                vec![Effect::VmTransition {
                    vm: (&instance()).into(),
                    action: VmAction::Stop,
                    succeeded,
                }]
            );
        }
    }

    #[test]
    fn delete_retires_only_on_success() {
        let spec = JobSpec::Delete(Delete {
            instance: instance(),
            storage: None,
        });
        assert_eq!(plan(&spec, &JobOutcome::done("gone")).len(), 2);
        assert!(matches!(
            plan(&spec, &JobOutcome::done("gone"))[1],
            Effect::VmRetired { .. }
        ));
        assert_eq!(plan(&spec, &JobOutcome::failed("busy")).len(), 1);
    }

    #[test]
    fn backup_create_needs_a_readable_result() {
        let spec = JobSpec::BackupCreate(BackupCreate {
            instance: instance(),
            storage: None,
            tier: StorageTier::Local,
        });
        let created = BackupCreated {
            kind: BackupKind::Qcow2,
            path: PathBuf::from("/var/lib/corral/backups/vm1.qcow2"),
            size_bytes: 1024,
            checksum: "ab".repeat(32),
            tier: StorageTier::Local,
            object_key: None,
            created_at: Utc::now(),
        };

        let with_result = JobOutcome::done("ok").with_result(serde_json::to_value(&created).unwrap());
        assert_eq!(
            plan(&spec, &with_result),
            vec![Effect::BackupRecorded {
                vm: (&instance()).into(),
                created,
            }]
        );

        let garbled = JobOutcome::done("ok").with_result(serde_json::json!({"path": 3}));
        assert!(plan(&spec, &garbled).is_empty());
        assert!(plan(&spec, &JobOutcome::done("ok")).is_empty());
    }

    #[test]
    fn backup_delete_reports_partial_progress() {
        let vm_uuid = Uuid::from_u128(7);
        let artifact = |id| BackupArtifact {
            id,
            path: None,
            object_key: None,
        };
        let spec = JobSpec::BackupDelete(BackupDelete {
            vm_uuid,
            backups: vec![artifact(1), artifact(2)],
        });
        // Id 9 was never part of this job and must not be marked.
        let outcome = JobOutcome::failed("one failed")
            .with_result(serde_json::to_value(BackupsDeleted { ids: vec![1, 9] }).unwrap());
        assert_eq!(
            plan(&spec, &outcome),
            vec![Effect::BackupsDeleted {
                vm_uuid,
                ids: vec![1],
            }]
        );
    }

    #[test]
    fn network_jobs_have_no_effects() {
        let spec = JobSpec::FwSync(FirewallSync {
            vm_uuid: Uuid::from_u128(7),
            name: "vm1".to_string(),
            instance_type: InstanceType::Kvm,
        });
        assert!(plan(&spec, &JobOutcome::done("synced")).is_empty());
    }
}
