use chrono::{DateTime, Utc};
use corral_rs::firewall::FirewallMode;
use corral_rs::instance::{InstanceRef, InstanceSpec, InstanceType};
use corral_rs::lifecycle::VmStatus;
use corral_rs::net::MacAddress;
use corral_rs::storage::StoragePoolSpec;
use ipnetwork::IpNetwork;
use sqlx::{PgExecutor, Postgres, Transaction};
use std::net::IpAddr;
use std::path::PathBuf;
use uuid::Uuid;

const ALL_STATUSES: [VmStatus; 6] = [
    VmStatus::Provisioning,
    VmStatus::Running,
    VmStatus::Stopped,
    VmStatus::Reinstalling,
    VmStatus::Error,
    VmStatus::Deleted,
];

pub fn parse_status(raw: &str) -> Option<VmStatus> {
    ALL_STATUSES.into_iter().find(|s| s.as_str() == raw)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqlVm {
    pub vm_uuid: Uuid,
    pub node_id: Uuid,
    pub name: String,
    pub instance_type: String,
    pub vcpus: i32,
    pub memory_mb: i64,
    pub disk_gb: i64,
    pub bridge: Option<String>,
    pub vlan_tag: Option<i32>,
    pub mac: String,
    pub ip_address: Option<IpNetwork>,
    pub image: Option<String>,
    pub storage_pool_id: Option<i64>,
    pub status: String,
    pub firewall_mode: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SqlVm {
    pub fn instance_type(&self) -> InstanceType {
        match self.instance_type.as_str() {
            "lxc" => InstanceType::Lxc,
            _ => InstanceType::Kvm,
        }
    }

    pub fn status(&self) -> Option<VmStatus> {
        parse_status(&self.status)
    }

    /// Unknown stored modes read as `disabled`, which is also the column default.
    pub fn firewall_mode(&self) -> FirewallMode {
        self.firewall_mode.parse().unwrap_or_default()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip_address.map(|net| net.ip())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn instance_ref(&self) -> InstanceRef {
        InstanceRef {
            vm_uuid: Some(self.vm_uuid),
            name: self.name.clone(),
            instance_type: self.instance_type(),
        }
    }

    pub fn instance_spec(&self, storage: Option<StoragePoolSpec>) -> InstanceSpec {
        InstanceSpec {
            vm_uuid: Some(self.vm_uuid),
            name: self.name.clone(),
            instance_type: self.instance_type(),
            vcpus: u32::try_from(self.vcpus).unwrap_or(0),
            memory_mb: u64::try_from(self.memory_mb).unwrap_or(0),
            disk_gb: u64::try_from(self.disk_gb).unwrap_or(0),
            bridge: self.bridge.clone(),
            vlan_tag: self.vlan_tag.and_then(|t| u16::try_from(t).ok()),
            mac: self.mac.parse().ok(),
            ip_address: self.ip(),
            image: self.image.as_ref().map(PathBuf::from),
            storage,
        }
    }
}

/// A VM row about to be inserted in `provisioning`.
#[derive(Debug, Clone)]
pub struct NewVm<'a> {
    pub vm_uuid: Uuid,
    pub node_id: Uuid,
    pub spec: &'a InstanceSpec,
    pub mac: MacAddress,
    pub storage_pool_id: Option<i64>,
    pub firewall_mode: FirewallMode,
}

pub async fn insert(vm: &NewVm<'_>, conn: impl PgExecutor<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into corral.vms (vm_uuid, node_id, name, instance_type, vcpus, memory_mb, disk_gb,
                                bridge, vlan_tag, mac, ip_address, image, storage_pool_id, status,
                                firewall_mode)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(vm.vm_uuid)
    .bind(vm.node_id)
    .bind(&vm.spec.name)
    .bind(vm.spec.instance_type.as_str())
    .bind(i32::try_from(vm.spec.vcpus).unwrap_or(i32::MAX))
    .bind(i64::try_from(vm.spec.memory_mb).unwrap_or(i64::MAX))
    .bind(i64::try_from(vm.spec.disk_gb).unwrap_or(i64::MAX))
    .bind(&vm.spec.bridge)
    .bind(vm.spec.vlan_tag.map(i32::from))
    .bind(vm.mac.to_string())
    .bind(vm.spec.ip_address.map(super::host_network))
    .bind(vm.spec.image.as_ref().map(|p| p.display().to_string()))
    .bind(vm.storage_pool_id)
    .bind(VmStatus::Provisioning.as_str())
    .bind(vm.firewall_mode.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

/// Fetch a VM, including soft-deleted ones.
pub async fn fetch(vm_uuid: Uuid, conn: impl PgExecutor<'_>) -> Result<Option<SqlVm>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select vm_uuid, node_id, name, instance_type, vcpus, memory_mb, disk_gb, bridge, vlan_tag,
               mac, ip_address, image, storage_pool_id, status, firewall_mode, deleted_at
        from corral.vms
        where vm_uuid = $1
        "#,
    )
    .bind(vm_uuid)
    .fetch_optional(conn)
    .await
}

/// Lock a live VM row for a status change.
pub async fn lock_live(
    vm_uuid: Uuid,
    conn: &mut Transaction<'_, Postgres>,
) -> Result<Option<SqlVm>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select vm_uuid, node_id, name, instance_type, vcpus, memory_mb, disk_gb, bridge, vlan_tag,
               mac, ip_address, image, storage_pool_id, status, firewall_mode, deleted_at
        from corral.vms
        where vm_uuid = $1 and deleted_at is null
        for update
        "#,
    )
    .bind(vm_uuid)
    .fetch_optional(conn.as_mut())
    .await
}

/// Find the live VM a job payload refers to: by uuid when the payload carries one, otherwise
/// by name on the job's node.
pub async fn resolve(
    node_id: Uuid,
    vm_uuid: Option<Uuid>,
    name: &str,
    conn: impl PgExecutor<'_>,
) -> Result<Option<Uuid>, sqlx::Error> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        select vm_uuid
        from corral.vms
        where node_id = $1
          and deleted_at is null
          and (vm_uuid = $2 or ($2 is null and name = $3))
        "#,
    )
    .bind(node_id)
    .bind(vm_uuid)
    .bind(name)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|(uuid,)| uuid))
}

pub async fn name_taken(
    node_id: Uuid,
    name: &str,
    conn: impl PgExecutor<'_>,
) -> Result<bool, sqlx::Error> {
    let row: Option<(i32,)> = sqlx::query_as(
        "select 1 from corral.vms where node_id = $1 and name = $2 and deleted_at is null",
    )
    .bind(node_id)
    .bind(name)
    .fetch_optional(conn)
    .await?;
    Ok(row.is_some())
}

pub async fn set_status(
    vm_uuid: Uuid,
    status: VmStatus,
    conn: impl PgExecutor<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query("update corral.vms set status = $2 where vm_uuid = $1")
        .bind(vm_uuid)
        .bind(status.as_str())
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn set_firewall_mode(
    vm_uuid: Uuid,
    mode: FirewallMode,
    conn: impl PgExecutor<'_>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "update corral.vms set firewall_mode = $2 where vm_uuid = $1 and deleted_at is null",
    )
    .bind(vm_uuid)
    .bind(mode.as_str())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_disk_gb(
    vm_uuid: Uuid,
    disk_gb: u64,
    conn: impl PgExecutor<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query("update corral.vms set disk_gb = $2 where vm_uuid = $1")
        .bind(vm_uuid)
        .bind(i64::try_from(disk_gb).unwrap_or(i64::MAX))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn soft_delete(vm_uuid: Uuid, conn: impl PgExecutor<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        "update corral.vms set deleted_at = now(), status = 'deleted' where vm_uuid = $1 and deleted_at is null",
    )
    .bind(vm_uuid)
    .execute(conn)
    .await?;
    Ok(())
}

/// Firewall mode of a live VM hosted on `node_id`.
pub async fn firewall_mode_on_node(
    vm_uuid: Uuid,
    node_id: Uuid,
    conn: impl PgExecutor<'_>,
) -> Result<Option<FirewallMode>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        select firewall_mode
        from corral.vms
        where vm_uuid = $1 and node_id = $2 and deleted_at is null
        "#,
    )
    .bind(vm_uuid)
    .bind(node_id)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|(mode,)| mode.parse().unwrap_or_default()))
}
