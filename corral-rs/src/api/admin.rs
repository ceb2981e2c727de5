//! Administrative endpoints under `/api/v1`.
//!
//! All of them require `Authorization: Bearer <admin token>`. Most of them
//! end in a job being enqueued, and answer with [`JobResponse`].

use crate::job::JobId;
use corral_switchboard_macros::HttpStatusCode;
use serde::{Deserialize, Serialize};

/// Answer to any request whose effect is one enqueued job.
#[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobResponse {
    #[http(status = 202)]
    Ok { job_id: JobId },
    /// The request was rejected before anything was written.
    #[http(status = 400)]
    Invalid { reason: String },
    #[http(status = 401)]
    Unauthorized,
    #[http(status = 404)]
    NotFound,
    /// The target's current state does not allow the request.
    #[http(status = 409)]
    Conflict { reason: String },
    #[http(status = 500)]
    Internal,
}

/// Addresses are allocated from either a pool or a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpRangeRef {
    Pool(i64),
    Subnet(i64),
}

pub mod jobs {
    use crate::job::{JobId, JobStatus};
    use chrono::{DateTime, Utc};
    use corral_switchboard_macros::HttpStatusCode;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// `POST /jobs`: enqueue a raw `(type, payload)` pair for a node.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EnqueueRequest {
        pub node_id: Uuid,
        #[serde(rename = "type")]
        pub kind: String,
        #[serde(default)]
        pub payload: serde_json::Value,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct JobView {
        pub id: JobId,
        pub node_id: Uuid,
        #[serde(rename = "type")]
        pub kind: String,
        pub payload: serde_json::Value,
        pub status: JobStatus,
        pub created_at: DateTime<Utc>,
        pub started_at: Option<DateTime<Utc>>,
        pub finished_at: Option<DateTime<Utc>>,
        pub log: Option<String>,
    }

    /// `GET /jobs/:id`.
    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum StatusResponse {
        #[http(status = 200)]
        Ok { job: JobView },
        #[http(status = 401)]
        Unauthorized,
        #[http(status = 404)]
        NotFound,
        #[http(status = 500)]
        Internal,
    }

    /// `GET /jobs/stale?older_than=<duration>`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StaleQuery {
        /// Human duration such as `30m`; the configured default when absent.
        pub older_than: Option<String>,
    }

    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum StaleResponse {
        #[http(status = 200)]
        Ok { jobs: Vec<JobView> },
        #[http(status = 400)]
        Invalid { reason: String },
        #[http(status = 401)]
        Unauthorized,
        #[http(status = 500)]
        Internal,
    }

    /// `POST /jobs/:id/fail`: give up on a job stuck in `in_progress`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FailRequest {
        pub note: String,
        /// Enqueue a fresh copy of the job after failing it.
        #[serde(default)]
        pub requeue: bool,
    }

    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum FailResponse {
        #[http(status = 200)]
        Ok { requeued_as: Option<JobId> },
        #[http(status = 401)]
        Unauthorized,
        #[http(status = 404)]
        NotFound,
        #[http(status = 409)]
        NotInProgress,
        #[http(status = 500)]
        Internal,
    }
}

pub mod vms {
    use super::IpRangeRef;
    use crate::firewall::FirewallMode;
    use crate::instance::InstanceType;
    use crate::job::JobId;
    use crate::net::MacAddress;
    use corral_switchboard_macros::HttpStatusCode;
    use serde::{Deserialize, Serialize};
    use std::net::IpAddr;
    use std::path::PathBuf;
    use uuid::Uuid;

    /// `POST /vms`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ProvisionRequest {
        pub node_id: Uuid,
        pub name: String,
        #[serde(default, alias = "type")]
        pub instance_type: InstanceType,
        pub vcpus: u32,
        pub memory_mb: u64,
        pub disk_gb: u64,
        #[serde(default)]
        pub bridge: Option<String>,
        #[serde(default)]
        pub vlan_tag: Option<u16>,
        #[serde(default)]
        pub image: Option<PathBuf>,
        #[serde(default)]
        pub storage_pool_id: Option<i64>,
        /// Fixed address; reserved in `ip_range` when both are given.
        #[serde(default)]
        pub ip_address: Option<IpAddr>,
        /// Range to allocate the next free address from.
        #[serde(default)]
        pub ip_range: Option<IpRangeRef>,
        #[serde(default)]
        pub firewall_mode: FirewallMode,
    }

    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum ProvisionResponse {
        #[http(status = 202)]
        Ok {
            vm_uuid: Uuid,
            mac: MacAddress,
            ip_address: Option<IpAddr>,
            job_id: JobId,
        },
        #[http(status = 400)]
        Invalid { reason: String },
        #[http(status = 401)]
        Unauthorized,
        /// Node, storage pool, address range or backup not found.
        #[http(status = 404)]
        NotFound,
        /// An instance with this name already exists on the node.
        #[http(status = 409)]
        Conflict { reason: String },
        /// No free address left in the requested range.
        #[http(status = 507)]
        Exhausted,
        #[http(status = 500)]
        Internal,
    }

    /// Body of `POST /vms/:uuid/actions/:action`; only `reinstall` reads it.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ActionRequest {
        #[serde(default)]
        pub iso: Option<PathBuf>,
    }

    /// `POST /vms/:uuid/disk`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ResizeRequest {
        pub disk_gb: u64,
    }

    /// `POST /vms/:uuid/snapshots`. The name defaults to `snap-<timestamp>`.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct SnapshotRequest {
        #[serde(default)]
        pub name: Option<String>,
    }
}

pub mod firewall {
    use crate::firewall::{FirewallMode, Protocol, RuleAction};
    use crate::job::JobId;
    use corral_switchboard_macros::HttpStatusCode;
    use serde::{Deserialize, Serialize};

    /// `PUT /vms/:uuid/firewall`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModeRequest {
        pub mode: FirewallMode,
    }

    /// `POST /vms/:uuid/firewall/rules`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AddRuleRequest {
        pub protocol: Protocol,
        #[serde(default)]
        pub source_cidr: Option<String>,
        #[serde(default)]
        pub dest_ports: Option<String>,
        pub action: RuleAction,
        #[serde(default)]
        pub priority: Option<i32>,
        #[serde(default)]
        pub enabled: Option<bool>,
    }

    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum AddRuleResponse {
        #[http(status = 202)]
        Ok { rule_id: i64, job_id: JobId },
        #[http(status = 401)]
        Unauthorized,
        #[http(status = 404)]
        NotFound,
        #[http(status = 500)]
        Internal,
    }
}

pub mod backups {
    use crate::backup::{RetentionPolicy, StorageTier};
    use crate::job::JobId;
    use corral_switchboard_macros::HttpStatusCode;
    use serde::{Deserialize, Serialize};

    /// `POST /vms/:uuid/backups`.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct CreateRequest {
        #[serde(default)]
        pub tier: StorageTier,
    }

    /// `POST /vms/:uuid/backups/prune`.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct PruneRequest {
        /// Policy override; the default policy when absent.
        #[serde(default)]
        pub policy: Option<RetentionPolicy>,
    }

    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum PruneResponse {
        /// `job_id` is absent when nothing needed pruning.
        #[http(status = 200)]
        Ok {
            keep: Vec<i64>,
            drop: Vec<i64>,
            job_id: Option<JobId>,
        },
        #[http(status = 401)]
        Unauthorized,
        #[http(status = 404)]
        NotFound,
        #[http(status = 500)]
        Internal,
    }

    /// `POST /vms/:uuid/backups/:id/restore`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RestoreRequest {
        pub new_name: String,
    }

    /// `PUT /vms/:uuid/backups/policy`: retention plus an optional backup
    /// schedule. Without `backup_every_hours` the scheduler only prunes.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BackupPolicy {
        #[serde(flatten)]
        pub retention: RetentionPolicy,
        #[serde(default)]
        pub backup_every_hours: Option<u32>,
        #[serde(default)]
        pub tier: StorageTier,
    }

    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum PolicyResponse {
        #[http(status = 200)]
        Ok { policy: BackupPolicy },
        #[http(status = 400)]
        Invalid { reason: String },
        #[http(status = 401)]
        Unauthorized,
        #[http(status = 404)]
        NotFound,
        #[http(status = 500)]
        Internal,
    }
}

pub mod nodes {
    use crate::net::NetMode;
    use corral_switchboard_macros::HttpStatusCode;
    use serde::{Deserialize, Serialize};
    use std::net::Ipv6Addr;
    use uuid::Uuid;

    /// `POST /nodes`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CreateRequest {
        pub name: String,
        #[serde(default)]
        pub management_url: Option<String>,
        #[serde(default = "default_bridge")]
        pub bridge: String,
    }

    fn default_bridge() -> String {
        "br0".to_string()
    }

    /// Answer to node creation and token rotation. The plaintext token is
    /// only ever returned here.
    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum TokenResponse {
        #[http(status = 200)]
        Ok { node_id: Uuid, token: String },
        #[http(status = 401)]
        Unauthorized,
        #[http(status = 404)]
        NotFound,
        #[http(status = 409)]
        Conflict { reason: String },
        #[http(status = 500)]
        Internal,
    }

    /// `POST /nodes/:id/network`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct NetworkRequest {
        pub mode: NetMode,
        #[serde(default)]
        pub bridge: Option<String>,
        pub wan_iface: String,
    }

    /// `POST /nodes/:id/ra`. `prefix` is validated by the switchboard so a
    /// non-/64 answers `invalid` instead of failing deserialization.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RaRequest {
        #[serde(default)]
        pub bridge: Option<String>,
        pub prefix: String,
        #[serde(default)]
        pub dns_servers: Vec<Ipv6Addr>,
    }
}

pub mod ipam {
    use super::IpRangeRef;
    use corral_switchboard_macros::HttpStatusCode;
    use serde::{Deserialize, Serialize};
    use std::net::IpAddr;
    use uuid::Uuid;

    /// `POST /ipam/allocate`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AllocateRequest {
        pub range: IpRangeRef,
        #[serde(default)]
        pub vm_uuid: Option<Uuid>,
    }

    /// `POST /ipam/reserve`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ReserveRequest {
        pub range: IpRangeRef,
        pub ip: IpAddr,
        #[serde(default)]
        pub vm_uuid: Option<Uuid>,
    }

    /// `POST /ipam/release`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ReleaseRequest {
        pub range: IpRangeRef,
        pub ip: IpAddr,
    }

    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Response {
        #[http(status = 200)]
        Ok { ip: IpAddr },
        /// Address outside the range, or the range's network/broadcast/gateway.
        #[http(status = 400)]
        Invalid { reason: String },
        #[http(status = 401)]
        Unauthorized,
        #[http(status = 404)]
        NotFound,
        #[http(status = 409)]
        AlreadyAllocated,
        #[http(status = 507)]
        Exhausted,
        #[http(status = 500)]
        Internal,
    }
}
