use super::{enqueue_in, ipam, Service, ServiceError};
use crate::sql;
use crate::sql::vm::{NewVm, SqlVm};
use chrono::Utc;
use corral_rs::api::admin::backups::BackupPolicy;
use corral_rs::api::admin::firewall::AddRuleRequest;
use corral_rs::api::admin::vms::{ActionRequest, ProvisionRequest};
use corral_rs::backup::{plan_retention, BackupKind, RetentionPlan, RetentionPolicy, StorageTier};
use corral_rs::firewall::{FirewallMode, DEFAULT_PRIORITY};
use corral_rs::instance::{validate_name, InstanceRef, InstanceSpec, InstanceType};
use corral_rs::job::{
    Antispoof, BackupCreate, BackupDelete, Delete, DiskResize, FirewallSync, JobId, JobSpec,
    Reinstall, RestoreAsNew, SnapshotCreate,
};
use corral_rs::lifecycle::VmAction;
use corral_rs::net::{mac_from_uuid, MacAddress};
use corral_rs::storage::StoragePoolSpec;
use sqlx::PgExecutor;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::instrument;
use uuid::Uuid;

/// A VM row written in `provisioning`, and the job that will bring it up.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub vm_uuid: Uuid,
    pub mac: MacAddress,
    pub ip_address: Option<IpAddr>,
    pub job_id: JobId,
}

async fn load_storage(
    node_id: Uuid,
    pool_id: Option<i64>,
    conn: impl PgExecutor<'_>,
) -> Result<Option<StoragePoolSpec>, ServiceError> {
    let Some(pool_id) = pool_id else {
        return Ok(None);
    };
    let pool = sql::storage_pool::fetch(pool_id, conn)
        .await?
        .ok_or(ServiceError::NotFound("storage pool"))?;
    if !pool.usable_on(node_id) {
        return Err(ServiceError::Invalid(format!(
            "storage pool {:?} belongs to another node",
            pool.name
        )));
    }
    pool.spec()
        .map(Some)
        .map_err(|e| ServiceError::Invalid(format!("storage pool {:?}: {e}", pool.name)))
}

fn firewall_sync(vm: &SqlVm) -> JobSpec {
    JobSpec::FwSync(FirewallSync {
        vm_uuid: vm.vm_uuid,
        name: vm.name.clone(),
        instance_type: vm.instance_type(),
    })
}

fn not_found_if_deleted(vm: Option<SqlVm>) -> Result<SqlVm, ServiceError> {
    vm.filter(|vm| !vm.is_deleted())
        .ok_or(ServiceError::NotFound("vm"))
}

// -------------------------------------------------------------------------------------------------
// === GROUPING: PROVISIONING
// -------------------------------------------------------------------------------------------------

impl Service {
    /// Record a new VM and enqueue its creation.
    ///
    /// Everything happens in one transaction: the VM row, its address, and the `CREATE`
    /// job (plus `NET_ANTISPOOF` for KVM and `FW_SYNC` when a firewall mode is set) are
    /// written together or not at all.
    #[instrument(skip(self, request), fields(node_id = %request.node_id, name = %request.name))]
    pub async fn provision(&self, request: ProvisionRequest) -> Result<Provisioned, ServiceError> {
        let mut spec = InstanceSpec {
            vm_uuid: None,
            name: request.name,
            instance_type: request.instance_type,
            vcpus: request.vcpus,
            memory_mb: request.memory_mb,
            disk_gb: request.disk_gb,
            bridge: request.bridge,
            vlan_tag: request.vlan_tag,
            mac: None,
            ip_address: None,
            image: request.image,
            storage: None,
        };
        spec.validate()
            .map_err(|e| ServiceError::Invalid(e.to_string()))?;

        let mut tx = self.pool.begin().await?;
        let node = sql::node::fetch(request.node_id, tx.as_mut())
            .await?
            .ok_or(ServiceError::NotFound("node"))?;
        if sql::vm::name_taken(node.id, &spec.name, tx.as_mut()).await? {
            return Err(ServiceError::Conflict(format!(
                "an instance named {:?} already exists on this node",
                spec.name
            )));
        }
        spec.storage = load_storage(node.id, request.storage_pool_id, tx.as_mut()).await?;

        let vm_uuid = Uuid::new_v4();
        spec.ip_address = match (request.ip_address, request.ip_range) {
            (Some(ip), Some(range)) => {
                ipam::reserve_in(range, ip, Some(vm_uuid), &mut tx).await?;
                Some(ip)
            }
            (None, Some(range)) => Some(ipam::allocate_in(range, Some(vm_uuid), &mut tx).await?),
            (ip, None) => ip,
        };
        let mac = mac_from_uuid(&vm_uuid);
        spec.vm_uuid = Some(vm_uuid);
        spec.mac = Some(mac);
        if spec.bridge.is_none() {
            spec.bridge = Some(node.bridge.clone());
        }

        sql::vm::insert(
            &NewVm {
                vm_uuid,
                node_id: node.id,
                spec: &spec,
                mac,
                storage_pool_id: request.storage_pool_id,
                firewall_mode: request.firewall_mode,
            },
            tx.as_mut(),
        )
        .await?;

        let ip_address = spec.ip_address;
        let instance_type = spec.instance_type;
        let name = spec.name.clone();
        let instance = InstanceRef {
            vm_uuid: Some(vm_uuid),
            name: name.clone(),
            instance_type,
        };
        let job_id = enqueue_in(node.id, &JobSpec::Create(spec), tx.as_mut()).await?;
        if instance_type == InstanceType::Kvm {
            let antispoof = JobSpec::NetAntispoof(Antispoof {
                instance,
                mac,
                ip: ip_address,
            });
            enqueue_in(node.id, &antispoof, tx.as_mut()).await?;
        }
        if request.firewall_mode != FirewallMode::Disabled {
            let sync = JobSpec::FwSync(FirewallSync {
                vm_uuid,
                name,
                instance_type,
            });
            enqueue_in(node.id, &sync, tx.as_mut()).await?;
        }
        tx.commit().await?;

        tracing::info!(%vm_uuid, %mac, ?ip_address, "provisioning VM");
        Ok(Provisioned {
            vm_uuid,
            mac,
            ip_address,
            job_id,
        })
    }
}

// -------------------------------------------------------------------------------------------------
// === GROUPING: LIFECYCLE ACTIONS
// -------------------------------------------------------------------------------------------------

impl Service {
    /// Enqueue a lifecycle action if the VM's current status accepts it.
    #[instrument(skip(self, request))]
    pub async fn vm_action(
        &self,
        vm_uuid: Uuid,
        action: VmAction,
        request: ActionRequest,
    ) -> Result<JobId, ServiceError> {
        let create_rejected =
            || ServiceError::Invalid("instances are created with POST /vms".to_string());
        if action == VmAction::Create {
            return Err(create_rejected());
        }

        let mut tx = self.pool.begin().await?;
        let vm = sql::vm::lock_live(vm_uuid, &mut tx)
            .await?
            .ok_or(ServiceError::NotFound("vm"))?;
        let status = vm.status().ok_or_else(|| {
            ServiceError::Conflict(format!("VM has unknown status {:?}", vm.status))
        })?;
        if !status.accepts(action) {
            return Err(ServiceError::Conflict(format!(
                "cannot {action} a VM that is {status}"
            )));
        }

        let spec = match action {
            VmAction::Create => return Err(create_rejected()),
            VmAction::Start => JobSpec::Start(vm.instance_ref()),
            VmAction::Stop => JobSpec::Stop(vm.instance_ref()),
            VmAction::Reboot => JobSpec::Reboot(vm.instance_ref()),
            VmAction::Delete => JobSpec::Delete(Delete {
                instance: vm.instance_ref(),
                storage: load_storage(vm.node_id, vm.storage_pool_id, tx.as_mut()).await?,
            }),
            VmAction::Reinstall => {
                let iso = request.iso.ok_or_else(|| {
                    ServiceError::Invalid("reinstall needs an `iso` path".to_string())
                })?;
                let storage = load_storage(vm.node_id, vm.storage_pool_id, tx.as_mut()).await?;
                JobSpec::Reinstall(Reinstall {
                    instance: vm.instance_spec(storage),
                    iso,
                })
            }
        };

        let next = status.on_enqueue(action);
        if next != status {
            sql::vm::set_status(vm_uuid, next, tx.as_mut()).await?;
        }
        let job_id = enqueue_in(vm.node_id, &spec, tx.as_mut()).await?;
        tx.commit().await?;
        Ok(job_id)
    }

    /// Grow a VM's disk. Shrinking is refused; the stored size changes once the job succeeds.
    #[instrument(skip(self))]
    pub async fn resize_disk(&self, vm_uuid: Uuid, disk_gb: u64) -> Result<JobId, ServiceError> {
        let vm = not_found_if_deleted(sql::vm::fetch(vm_uuid, &self.pool).await?)?;
        let current = u64::try_from(vm.disk_gb).unwrap_or(0);
        if disk_gb <= current {
            return Err(ServiceError::Invalid(format!(
                "disks can only grow: currently {current} GB, requested {disk_gb} GB"
            )));
        }
        let storage = load_storage(vm.node_id, vm.storage_pool_id, &self.pool).await?;
        let spec = JobSpec::DiskResize(DiskResize {
            instance: vm.instance_ref(),
            disk_gb,
            storage,
        });
        enqueue_in(vm.node_id, &spec, &self.pool).await
    }

    /// Snapshot a VM's disk in place. Snapshots are not tracked; the job log names where the
    /// snapshot was taken.
    #[instrument(skip(self))]
    pub async fn create_snapshot(
        &self,
        vm_uuid: Uuid,
        name: Option<String>,
    ) -> Result<JobId, ServiceError> {
        let snapshot =
            name.unwrap_or_else(|| format!("snap-{}", Utc::now().format("%Y%m%d-%H%M%S")));
        validate_name(&snapshot)
            .map_err(|e| ServiceError::Invalid(format!("snapshot name: {e}")))?;
        let vm = not_found_if_deleted(sql::vm::fetch(vm_uuid, &self.pool).await?)?;
        let storage = load_storage(vm.node_id, vm.storage_pool_id, &self.pool).await?;
        let spec = JobSpec::SnapshotCreate(SnapshotCreate {
            instance: vm.instance_ref(),
            storage,
            snapshot,
        });
        enqueue_in(vm.node_id, &spec, &self.pool).await
    }
}

// -------------------------------------------------------------------------------------------------
// === GROUPING: FIREWALL
// -------------------------------------------------------------------------------------------------

impl Service {
    #[instrument(skip(self))]
    pub async fn set_firewall_mode(
        &self,
        vm_uuid: Uuid,
        mode: FirewallMode,
    ) -> Result<JobId, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let vm = sql::vm::lock_live(vm_uuid, &mut tx)
            .await?
            .ok_or(ServiceError::NotFound("vm"))?;
        sql::vm::set_firewall_mode(vm_uuid, mode, tx.as_mut()).await?;
        let job_id = enqueue_in(vm.node_id, &firewall_sync(&vm), tx.as_mut()).await?;
        tx.commit().await?;
        Ok(job_id)
    }

    /// Store a rule and resync the VM's chain. The rule's fields are kept verbatim.
    #[instrument(skip(self, request))]
    pub async fn add_firewall_rule(
        &self,
        vm_uuid: Uuid,
        request: AddRuleRequest,
    ) -> Result<(i64, JobId), ServiceError> {
        let mut tx = self.pool.begin().await?;
        let vm = sql::vm::lock_live(vm_uuid, &mut tx)
            .await?
            .ok_or(ServiceError::NotFound("vm"))?;
        let source_cidr = request.source_cidr.unwrap_or_else(|| "any".to_string());
        let dest_ports = request.dest_ports.unwrap_or_else(|| "any".to_string());
        let rule = sql::firewall::NewRule {
            protocol: request.protocol,
            source_cidr: &source_cidr,
            dest_ports: &dest_ports,
            action: request.action,
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
            enabled: request.enabled.unwrap_or(true),
        };
        let rule_id = sql::firewall::insert(vm_uuid, &rule, tx.as_mut()).await?;
        let job_id = enqueue_in(vm.node_id, &firewall_sync(&vm), tx.as_mut()).await?;
        tx.commit().await?;
        Ok((rule_id, job_id))
    }

    #[instrument(skip(self))]
    pub async fn delete_firewall_rule(
        &self,
        vm_uuid: Uuid,
        rule_id: i64,
    ) -> Result<JobId, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let vm = sql::vm::lock_live(vm_uuid, &mut tx)
            .await?
            .ok_or(ServiceError::NotFound("vm"))?;
        if !sql::firewall::delete(vm_uuid, rule_id, tx.as_mut()).await? {
            return Err(ServiceError::NotFound("firewall rule"));
        }
        let job_id = enqueue_in(vm.node_id, &firewall_sync(&vm), tx.as_mut()).await?;
        tx.commit().await?;
        Ok(job_id)
    }
}

// -------------------------------------------------------------------------------------------------
// === GROUPING: BACKUPS
// -------------------------------------------------------------------------------------------------

impl Service {
    #[instrument(skip(self))]
    pub async fn create_backup(
        &self,
        vm_uuid: Uuid,
        tier: StorageTier,
    ) -> Result<JobId, ServiceError> {
        let vm = not_found_if_deleted(sql::vm::fetch(vm_uuid, &self.pool).await?)?;
        let storage = load_storage(vm.node_id, vm.storage_pool_id, &self.pool).await?;
        let spec = JobSpec::BackupCreate(BackupCreate {
            instance: vm.instance_ref(),
            storage,
            tier,
        });
        enqueue_in(vm.node_id, &spec, &self.pool).await
    }

    /// Store the VM's retention policy and backup schedule, replacing any previous one.
    #[instrument(skip(self))]
    pub async fn set_backup_policy(
        &self,
        vm_uuid: Uuid,
        policy: BackupPolicy,
    ) -> Result<BackupPolicy, ServiceError> {
        if policy.backup_every_hours == Some(0) {
            return Err(ServiceError::Invalid(
                "backup_every_hours must be positive".to_string(),
            ));
        }
        let retention = &policy.retention;
        if retention.keep_daily == 0 && retention.keep_weekly == 0 && retention.keep_monthly == 0 {
            return Err(ServiceError::Invalid(
                "a policy that keeps no daily, weekly or monthly backup would drop them all"
                    .to_string(),
            ));
        }
        not_found_if_deleted(sql::vm::fetch(vm_uuid, &self.pool).await?)?;
        sql::backup::upsert_policy(vm_uuid, &policy, &self.pool).await?;
        tracing::info!(every_hours = ?policy.backup_every_hours, tier = policy.tier.as_str(), "stored backup policy");
        Ok(policy)
    }

    /// Plan retention over the VM's ready backups and enqueue deletion of the dropped ones.
    ///
    /// The policy is, in order: the one passed in, the VM's stored policy, the default.
    /// Backups of a deleted VM can still be pruned.
    #[instrument(skip(self))]
    pub async fn prune_backups(
        &self,
        vm_uuid: Uuid,
        policy: Option<RetentionPolicy>,
    ) -> Result<(RetentionPlan, Option<JobId>), ServiceError> {
        let vm = sql::vm::fetch(vm_uuid, &self.pool)
            .await?
            .ok_or(ServiceError::NotFound("vm"))?;
        let policy = match policy {
            Some(policy) => policy,
            None => sql::backup::policy_for(vm_uuid, &self.pool)
                .await?
                .unwrap_or_default(),
        };

        let ready = sql::backup::list_ready(vm_uuid, &self.pool).await?;
        let entries: Vec<_> = ready.iter().map(sql::backup::SqlBackup::retention_entry).collect();
        let plan = plan_retention(&entries, &policy, Utc::now());
        if plan.drop.is_empty() {
            tracing::info!(kept = plan.keep.len(), "nothing to prune");
            return Ok((plan, None));
        }

        let backups = ready
            .iter()
            .filter(|backup| plan.drop.contains(&backup.id))
            .map(sql::backup::SqlBackup::artifact)
            .collect();
        let spec = JobSpec::BackupDelete(BackupDelete { vm_uuid, backups });
        let job_id = enqueue_in(vm.node_id, &spec, &self.pool).await?;
        tracing::info!(kept = plan.keep.len(), dropped = plan.drop.len(), %job_id, "pruning backups");
        Ok((plan, Some(job_id)))
    }

    /// Create a new KVM instance on the source VM's node whose disk is a copy of a backup.
    #[instrument(skip(self))]
    pub async fn restore_backup(
        &self,
        vm_uuid: Uuid,
        backup_id: i64,
        new_name: String,
    ) -> Result<Provisioned, ServiceError> {
        validate_name(&new_name).map_err(|e| ServiceError::Invalid(e.to_string()))?;

        let mut tx = self.pool.begin().await?;
        let source = sql::vm::fetch(vm_uuid, tx.as_mut())
            .await?
            .ok_or(ServiceError::NotFound("vm"))?;
        let backup = sql::backup::fetch(vm_uuid, backup_id, tx.as_mut())
            .await?
            .ok_or(ServiceError::NotFound("backup"))?;
        if !backup.is_ready() {
            return Err(ServiceError::Conflict(format!(
                "backup {backup_id} has been deleted"
            )));
        }
        if backup.kind == BackupKind::ZfsSend.as_str() {
            return Err(ServiceError::Conflict(
                "zfs send streams cannot be restored as new instances".to_string(),
            ));
        }
        let Some(path) = backup.path.as_deref() else {
            return Err(ServiceError::Conflict(format!(
                "backup {backup_id} has no local copy"
            )));
        };
        if source.instance_type() == InstanceType::Lxc {
            return Err(ServiceError::Invalid(
                "only KVM instances can be restored as new instances".to_string(),
            ));
        }
        if sql::vm::name_taken(source.node_id, &new_name, tx.as_mut()).await? {
            return Err(ServiceError::Conflict(format!(
                "an instance named {new_name:?} already exists on this node"
            )));
        }

        let storage = load_storage(source.node_id, source.storage_pool_id, tx.as_mut()).await?;
        let new_uuid = Uuid::new_v4();
        let mac = mac_from_uuid(&new_uuid);
        let mut instance = source.instance_spec(storage);
        instance.vm_uuid = Some(new_uuid);
        instance.name = new_name;
        instance.mac = Some(mac);
        instance.ip_address = None;

        sql::vm::insert(
            &NewVm {
                vm_uuid: new_uuid,
                node_id: source.node_id,
                spec: &instance,
                mac,
                storage_pool_id: source.storage_pool_id,
                firewall_mode: FirewallMode::Disabled,
            },
            tx.as_mut(),
        )
        .await?;
        let spec = JobSpec::BackupRestoreAsNew(RestoreAsNew {
            source: PathBuf::from(path),
            instance,
        });
        let job_id = enqueue_in(source.node_id, &spec, tx.as_mut()).await?;
        tx.commit().await?;

        tracing::info!(%new_uuid, "restoring backup as a new instance");
        Ok(Provisioned {
            vm_uuid: new_uuid,
            mac,
            ip_address: None,
            job_id,
        })
    }
}
