//! Jobs: identifiers, statuses, kinds and per-kind payload schemas.
//!
//! On the wire and in the database a job is a `(type, payload)` pair where
//! `type` is a string like `"FW_SYNC"` and `payload` an opaque JSON
//! document. [`JobSpec`] is the typed view of that pair; the agent parses
//! every claimed job into one before dispatching it, so a job kind without
//! an executor is a compile error rather than a runtime fall-through.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::backup::{BackupArtifact, StorageTier};
use crate::instance::{InstanceError, InstanceRef, InstanceSpec, InstanceType};
use crate::net::{Ipv6Prefix64, MacAddress, NetMode};
use crate::storage::StoragePoolSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// Final status an agent reports for a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Done,
    Failed,
}

impl From<AckStatus> for JobStatus {
    fn from(status: AckStatus) -> Self {
        match status {
            AckStatus::Done => JobStatus::Done,
            AckStatus::Failed => JobStatus::Failed,
        }
    }
}

/// What an executor reports back for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: AckStatus,
    /// Human-readable log; the single source of truth for diagnosing failures.
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl JobOutcome {
    pub fn done(log: impl Into<String>) -> Self {
        JobOutcome {
            status: AckStatus::Done,
            log: log.into(),
            result: None,
        }
    }

    pub fn failed(log: impl Into<String>) -> Self {
        JobOutcome {
            status: AckStatus::Failed,
            log: log.into(),
            result: None,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == AckStatus::Done
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unknown job type: {0}")]
    UnknownKind(String),
    #[error("invalid {kind} payload: {source}")]
    Malformed {
        kind: JobKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {kind} payload: {source}")]
    Invalid {
        kind: JobKind,
        #[source]
        source: InstanceError,
    },
}

// -- payloads

/// `REINSTALL`: boot the instance from `iso` on its existing disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reinstall {
    #[serde(flatten)]
    pub instance: InstanceSpec,
    pub iso: PathBuf,
}

/// `DELETE`: tear down the instance and its disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    #[serde(flatten)]
    pub instance: InstanceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StoragePoolSpec>,
}

/// `DISK_RESIZE`: grow the instance's disk to `disk_gb`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskResize {
    #[serde(flatten)]
    pub instance: InstanceRef,
    pub disk_gb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StoragePoolSpec>,
}

/// `NET_SETUP`: bridge plus NAT or routed forwarding towards `wan_iface`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSetup {
    pub mode: NetMode,
    pub bridge: String,
    pub wan_iface: String,
}

/// `NET_ANTISPOOF`: pin the instance interface to its MAC and address.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Antispoof {
    #[serde(flatten)]
    pub instance: InstanceRef,
    pub mac: MacAddress,
    #[serde(default, alias = "ip4")]
    pub ip: Option<IpAddr>,
}

/// `FW_SYNC`: rebuild the instance's firewall chain. Rules are fetched from
/// the switchboard at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSync {
    #[serde(alias = "uuid")]
    pub vm_uuid: Uuid,
    pub name: String,
    #[serde(default, alias = "type")]
    pub instance_type: InstanceType,
}

/// `RA_SETUP`: router advertisements for one bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaSetup {
    pub bridge: String,
    pub prefix: Ipv6Prefix64,
    #[serde(default)]
    pub dns_servers: Vec<Ipv6Addr>,
}

/// `BACKUP_CREATE`: snapshot the instance disk into the node's backup dir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupCreate {
    #[serde(flatten)]
    pub instance: InstanceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StoragePoolSpec>,
    #[serde(default)]
    pub tier: StorageTier,
}

/// `BACKUP_DELETE`: remove backup files and objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDelete {
    pub vm_uuid: Uuid,
    pub backups: Vec<BackupArtifact>,
}

/// `BACKUP_RESTORE_AS_NEW`: create a new instance whose disk is a copy of
/// the backup at `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreAsNew {
    pub source: PathBuf,
    #[serde(flatten)]
    pub instance: InstanceSpec,
}

/// `SNAPSHOT_CREATE`: take a point-in-time snapshot of the instance disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCreate {
    #[serde(flatten)]
    pub instance: InstanceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StoragePoolSpec>,
    pub snapshot: String,
}

// -- the tagged union

macro_rules! job_kinds {
    ($($variant:ident($payload:ty) => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum JobKind {
            $(#[serde(rename = $name)] $variant),*
        }

        impl JobKind {
            pub const ALL: &'static [JobKind] = &[$(JobKind::$variant),*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(JobKind::$variant => $name),*
                }
            }

            fn from_canonical(s: &str) -> Option<JobKind> {
                match s {
                    $($name => Some(JobKind::$variant),)*
                    _ => None,
                }
            }
        }

        /// A job's kind together with its typed payload.
        #[derive(Debug, Clone, PartialEq)]
        pub enum JobSpec {
            $($variant($payload)),*
        }

        impl JobSpec {
            pub fn kind(&self) -> JobKind {
                match self {
                    $(JobSpec::$variant(_) => JobKind::$variant),*
                }
            }

            fn parse_payload(kind: JobKind, payload: serde_json::Value) -> Result<JobSpec, PayloadError> {
                let malformed = |source| PayloadError::Malformed { kind, source };
                Ok(match kind {
                    $(JobKind::$variant => JobSpec::$variant(
                        serde_json::from_value(payload).map_err(malformed)?
                    )),*
                })
            }

            /// Payload document as stored in the job row.
            pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
                match self {
                    $(JobSpec::$variant(p) => serde_json::to_value(p)),*
                }
            }
        }
    };
}

job_kinds! {
    Create(InstanceSpec) => "CREATE",
    Start(InstanceRef) => "START",
    Stop(InstanceRef) => "STOP",
    Reboot(InstanceRef) => "REBOOT",
    Delete(Delete) => "DELETE",
    Reinstall(Reinstall) => "REINSTALL",
    DiskResize(DiskResize) => "DISK_RESIZE",
    NetSetup(NetSetup) => "NET_SETUP",
    NetAntispoof(Antispoof) => "NET_ANTISPOOF",
    FwSync(FirewallSync) => "FW_SYNC",
    RaSetup(RaSetup) => "RA_SETUP",
    BackupCreate(BackupCreate) => "BACKUP_CREATE",
    BackupDelete(BackupDelete) => "BACKUP_DELETE",
    BackupRestoreAsNew(RestoreAsNew) => "BACKUP_RESTORE_AS_NEW",
    SnapshotCreate(SnapshotCreate) => "SNAPSHOT_CREATE",
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "KVM_CREATE" | "LXC_CREATE" => Ok(JobKind::Create),
            other => {
                JobKind::from_canonical(other).ok_or_else(|| PayloadError::UnknownKind(s.to_string()))
            }
        }
    }
}

impl JobSpec {
    /// Parse a stored `(type, payload)` pair.
    ///
    /// The legacy `KVM_CREATE`/`LXC_CREATE` names map onto `CREATE` with
    /// the instance type filled in unless the payload already names one.
    /// Payloads that identify an instance are validated here, before any
    /// executor sees them.
    pub fn from_wire(kind: &str, mut payload: serde_json::Value) -> Result<JobSpec, PayloadError> {
        let parsed_kind = JobKind::from_str(kind)?;
        let legacy_type = match kind {
            "KVM_CREATE" => Some(InstanceType::Kvm),
            "LXC_CREATE" => Some(InstanceType::Lxc),
            _ => None,
        };
        if let (Some(instance_type), Some(obj)) = (legacy_type, payload.as_object_mut()) {
            if !obj.contains_key("instance_type") && !obj.contains_key("type") {
                obj.insert(
                    "instance_type".to_string(),
                    serde_json::Value::String(instance_type.as_str().to_string()),
                );
            }
        }

        let spec = JobSpec::parse_payload(parsed_kind, payload)?;
        spec.validate()
            .map_err(|source| PayloadError::Invalid { kind: parsed_kind, source })?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), InstanceError> {
        match self {
            JobSpec::Create(spec) => spec.validate(),
            JobSpec::Start(r) | JobSpec::Stop(r) | JobSpec::Reboot(r) => r.validate(),
            JobSpec::Delete(d) => d.instance.validate(),
            JobSpec::Reinstall(r) => r.instance.validate(),
            JobSpec::DiskResize(r) => {
                r.instance.validate()?;
                if r.disk_gb == 0 {
                    return Err(InstanceError::Zero("disk_gb"));
                }
                Ok(())
            }
            JobSpec::NetAntispoof(a) => a.instance.validate(),
            JobSpec::FwSync(f) => crate::instance::validate_name(&f.name),
            JobSpec::BackupCreate(b) => b.instance.validate(),
            JobSpec::BackupRestoreAsNew(r) => r.instance.validate(),
            JobSpec::SnapshotCreate(s) => {
                s.instance.validate()?;
                crate::instance::validate_name(&s.snapshot)
            }
            JobSpec::NetSetup(_) | JobSpec::RaSetup(_) | JobSpec::BackupDelete(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_names() {
        assert_eq!(JobKind::FwSync.as_str(), "FW_SYNC");
        assert_eq!(JobKind::BackupRestoreAsNew.to_string(), "BACKUP_RESTORE_AS_NEW");
        assert_eq!(
            serde_json::to_value(JobKind::NetAntispoof).unwrap(),
            json!("NET_ANTISPOOF")
        );
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn unknown_kind() {
        let err = JobSpec::from_wire("FORMAT_DISK", json!({})).unwrap_err();
        assert_eq!(err.to_string(), "unknown job type: FORMAT_DISK");
    }

    #[test]
    fn legacy_create_names() {
        let spec = JobSpec::from_wire(
            "LXC_CREATE",
            json!({"name": "ct1", "vcpus": 1, "memory_mb": 256, "disk_gb": 2}),
        )
        .unwrap();
        let JobSpec::Create(instance) = spec else {
            panic!("expected CREATE");
        };
        assert_eq!(instance.instance_type, InstanceType::Lxc);
    }

    #[test]
    fn missing_required_field_is_input_error() {
        let err = JobSpec::from_wire("CREATE", json!({"vcpus": 2})).unwrap_err();
        assert!(matches!(err, PayloadError::Malformed { kind: JobKind::Create, .. }));

        let err = JobSpec::from_wire("DELETE", json!({"name": ""})).unwrap_err();
        assert!(matches!(err, PayloadError::Invalid { kind: JobKind::Delete, .. }));
    }

    #[test]
    fn ra_prefix_checked_at_parse() {
        assert!(JobSpec::from_wire(
            "RA_SETUP",
            json!({"bridge": "br0", "prefix": "2001:db8::/48"})
        )
        .is_err());
        assert!(JobSpec::from_wire(
            "RA_SETUP",
            json!({"bridge": "br0", "prefix": "2001:db8::1/64", "dns_servers": ["2001:4860:4860::8888"]})
        )
        .is_ok());
    }

    #[test]
    fn snapshot_name_is_validated() {
        let spec = JobSpec::from_wire(
            "SNAPSHOT_CREATE",
            json!({"name": "vm1", "snapshot": "auto-20240309-140507"}),
        )
        .unwrap();
        let JobSpec::SnapshotCreate(snapshot) = spec else {
            panic!("expected SNAPSHOT_CREATE");
        };
        assert_eq!(snapshot.snapshot, "auto-20240309-140507");
        assert!(snapshot.storage.is_none());

        let err = JobSpec::from_wire("SNAPSHOT_CREATE", json!({"name": "vm1", "snapshot": "a;rm -rf /"}))
            .unwrap_err();
        assert!(matches!(err, PayloadError::Invalid { kind: JobKind::SnapshotCreate, .. }));
    }

    #[test]
    fn payload_round_trips_through_wire() {
        let spec = JobSpec::FwSync(FirewallSync {
            vm_uuid: Uuid::new_v4(),
            name: "vm1".into(),
            instance_type: InstanceType::Kvm,
        });
        let payload = spec.payload().unwrap();
        assert_eq!(JobSpec::from_wire(spec.kind().as_str(), payload).unwrap(), spec);
    }
}
