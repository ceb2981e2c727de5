//! Storage pool descriptions.
//!
//! A pool is stored and transmitted as a driver name plus a driver-specific
//! config document. Parsing is strict: an unknown driver name is an error,
//! never a fallback to one of the known backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageSpecError {
    #[error("unknown storage driver: {0:?}")]
    UnknownDriver(String),
    #[error("invalid {driver} pool config: {source}")]
    InvalidConfig {
        driver: StorageDriverKind,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriverKind {
    Qcow2,
    Lvmthin,
    Zfs,
}

impl StorageDriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageDriverKind::Qcow2 => "qcow2",
            StorageDriverKind::Lvmthin => "lvmthin",
            StorageDriverKind::Zfs => "zfs",
        }
    }
}

impl fmt::Display for StorageDriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageDriverKind {
    type Err = StorageSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qcow2" => Ok(StorageDriverKind::Qcow2),
            "lvmthin" => Ok(StorageDriverKind::Lvmthin),
            "zfs" => Ok(StorageDriverKind::Zfs),
            other => Err(StorageSpecError::UnknownDriver(other.to_string())),
        }
    }
}

/// File-backed copy-on-write images in a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Qcow2Pool {
    /// Image directory; the agent's configured images directory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Thin logical volumes carved out of `vg/thinpool`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LvmThinPool {
    pub vg: String,
    pub thinpool: String,
}

/// Zvols created below `pool/dataset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZfsPool {
    pub pool: String,
    #[serde(default = "default_zfs_dataset")]
    pub dataset: String,
}

fn default_zfs_dataset() -> String {
    "corral".to_string()
}

impl ZfsPool {
    /// Full dataset path of a VM's zvol.
    pub fn volume(&self, name: &str) -> String {
        format!("{}/{}/{}", self.pool, self.dataset, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStoragePool", into = "RawStoragePool")]
pub enum StoragePoolSpec {
    Qcow2(Qcow2Pool),
    Lvmthin(LvmThinPool),
    Zfs(ZfsPool),
}

impl Default for StoragePoolSpec {
    fn default() -> Self {
        StoragePoolSpec::Qcow2(Qcow2Pool::default())
    }
}

impl StoragePoolSpec {
    pub fn kind(&self) -> StorageDriverKind {
        match self {
            StoragePoolSpec::Qcow2(_) => StorageDriverKind::Qcow2,
            StoragePoolSpec::Lvmthin(_) => StorageDriverKind::Lvmthin,
            StoragePoolSpec::Zfs(_) => StorageDriverKind::Zfs,
        }
    }

    /// Build a pool description from the persisted `(driver, config)` pair.
    pub fn from_parts(
        driver: &str,
        config: serde_json::Value,
    ) -> Result<StoragePoolSpec, StorageSpecError> {
        let kind = StorageDriverKind::from_str(driver)?;
        // A pool row without config is the same as an empty document.
        let config = match config {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        let invalid = |source| StorageSpecError::InvalidConfig {
            driver: kind,
            source,
        };
        Ok(match kind {
            StorageDriverKind::Qcow2 => {
                StoragePoolSpec::Qcow2(serde_json::from_value(config).map_err(invalid)?)
            }
            StorageDriverKind::Lvmthin => {
                StoragePoolSpec::Lvmthin(serde_json::from_value(config).map_err(invalid)?)
            }
            StorageDriverKind::Zfs => {
                StoragePoolSpec::Zfs(serde_json::from_value(config).map_err(invalid)?)
            }
        })
    }

    pub fn config_value(&self) -> serde_json::Value {
        let value = match self {
            StoragePoolSpec::Qcow2(c) => serde_json::to_value(c),
            StoragePoolSpec::Lvmthin(c) => serde_json::to_value(c),
            StoragePoolSpec::Zfs(c) => serde_json::to_value(c),
        };
        // Plain structs of strings and paths always serialize.
        value.unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStoragePool {
    driver: String,
    #[serde(default)]
    config: serde_json::Value,
}

impl TryFrom<RawStoragePool> for StoragePoolSpec {
    type Error = StorageSpecError;

    fn try_from(raw: RawStoragePool) -> Result<Self, Self::Error> {
        StoragePoolSpec::from_parts(&raw.driver, raw.config)
    }
}

impl From<StoragePoolSpec> for RawStoragePool {
    fn from(spec: StoragePoolSpec) -> Self {
        RawStoragePool {
            driver: spec.kind().as_str().to_string(),
            config: spec.config_value(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_each_driver() {
        let spec: StoragePoolSpec =
            serde_json::from_value(json!({"driver": "lvmthin", "config": {"vg": "vg0", "thinpool": "tp"}}))
                .unwrap();
        assert_eq!(
            spec,
            StoragePoolSpec::Lvmthin(LvmThinPool {
                vg: "vg0".into(),
                thinpool: "tp".into()
            })
        );

        let spec: StoragePoolSpec =
            serde_json::from_value(json!({"driver": "zfs", "config": {"pool": "tank"}})).unwrap();
        let StoragePoolSpec::Zfs(zfs) = spec else {
            panic!("expected zfs pool");
        };
        assert_eq!(zfs.volume("vm1"), "tank/corral/vm1");

        let spec: StoragePoolSpec = serde_json::from_value(json!({"driver": "qcow2"})).unwrap();
        assert_eq!(spec, StoragePoolSpec::default());
    }

    #[test]
    fn unknown_driver_fails_closed() {
        let err = StoragePoolSpec::from_parts("ceph", json!({})).unwrap_err();
        assert!(matches!(err, StorageSpecError::UnknownDriver(d) if d == "ceph"));
        assert!(serde_json::from_value::<StoragePoolSpec>(json!({"driver": "QCOW2"})).is_err());
    }

    #[test]
    fn missing_lvm_fields_rejected() {
        assert!(StoragePoolSpec::from_parts("lvmthin", json!({"vg": "vg0"})).is_err());
    }

    #[test]
    fn serializes_back_to_parts() {
        let spec = StoragePoolSpec::Zfs(ZfsPool {
            pool: "tank".into(),
            dataset: "vms".into(),
        });
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value, json!({"driver": "zfs", "config": {"pool": "tank", "dataset": "vms"}}));
    }
}
