//! Instance descriptions carried in lifecycle job payloads.

use crate::net::MacAddress;
use crate::storage::StoragePoolSpec;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Longest instance name accepted; names become LV, zvol and file names.
pub const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstanceError {
    #[error("instance name is required")]
    MissingName,
    #[error("invalid instance name {0:?}: use letters, digits, '-', '_' or '.', starting with a letter or digit (max {MAX_NAME_LEN})")]
    InvalidName(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Check that `name` is usable as a domain, container, volume and file name.
pub fn validate_name(name: &str) -> Result<(), InstanceError> {
    if name.is_empty() {
        return Err(InstanceError::MissingName);
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !first_ok || !rest_ok || name.len() > MAX_NAME_LEN {
        return Err(InstanceError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    #[default]
    Kvm,
    Lxc,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Kvm => "kvm",
            InstanceType::Lxc => "lxc",
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to build a domain definition or container config.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    #[serde(default, alias = "uuid")]
    pub vm_uuid: Option<Uuid>,
    pub name: String,
    #[serde(default, alias = "type")]
    pub instance_type: InstanceType,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    /// Bridge to attach to; the node's default bridge when absent.
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    /// Explicit MAC; derived from `vm_uuid` when absent.
    #[serde(default)]
    pub mac: Option<MacAddress>,
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    /// Base image for copy-on-write disks.
    #[serde(default, alias = "image_path")]
    pub image: Option<PathBuf>,
    #[serde(default)]
    pub storage: Option<StoragePoolSpec>,
}

impl InstanceSpec {
    pub fn validate(&self) -> Result<(), InstanceError> {
        validate_name(&self.name)?;
        if self.vcpus == 0 {
            return Err(InstanceError::Zero("vcpus"));
        }
        if self.memory_mb == 0 {
            return Err(InstanceError::Zero("memory_mb"));
        }
        if self.disk_gb == 0 {
            return Err(InstanceError::Zero("disk_gb"));
        }
        Ok(())
    }
}

/// Names an existing instance for action jobs (start, stop, reboot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    #[serde(default, alias = "uuid", skip_serializing_if = "Option::is_none")]
    pub vm_uuid: Option<Uuid>,
    pub name: String,
    #[serde(default, alias = "type")]
    pub instance_type: InstanceType,
}

impl InstanceRef {
    pub fn validate(&self) -> Result<(), InstanceError> {
        validate_name(&self.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn name_rules() {
        assert_eq!(validate_name(""), Err(InstanceError::MissingName));
        assert!(validate_name("vm1").is_ok());
        assert!(validate_name("web-01.example_a").is_ok());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("semi;colon").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn spec_defaults_and_aliases() {
        let spec: InstanceSpec = serde_json::from_value(json!({
            "name": "vm1", "vcpus": 2, "memory_mb": 2048, "disk_gb": 20, "bridge": "br0"
        }))
        .unwrap();
        assert_eq!(spec.instance_type, InstanceType::Kvm);
        assert_eq!(spec.bridge.as_deref(), Some("br0"));
        assert!(spec.validate().is_ok());

        let spec: InstanceSpec = serde_json::from_value(json!({
            "name": "ct1", "type": "lxc", "vcpus": 1, "memory_mb": 512, "disk_gb": 4
        }))
        .unwrap();
        assert_eq!(spec.instance_type, InstanceType::Lxc);
    }

    #[test]
    fn zero_resources_rejected() {
        let spec: InstanceSpec = serde_json::from_value(json!({
            "name": "vm1", "vcpus": 0, "memory_mb": 2048, "disk_gb": 20
        }))
        .unwrap();
        assert_eq!(spec.validate(), Err(InstanceError::Zero("vcpus")));
    }
}
