//! Instance lifecycle: KVM domains through `virsh`, containers through the
//! `lxc-*` tools.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{event, Level};

use corral_rs::instance::{InstanceSpec, InstanceType};
use corral_rs::storage::StoragePoolSpec;

use crate::exec::ExecError;
use crate::storage::StorageError;

pub mod kvm;
pub mod lxc;

pub use kvm::Kvm;
pub use lxc::Lxc;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{instance_type} instance {name:?} not found")]
    NotFound {
        instance_type: InstanceType,
        name: String,
    },
    #[error("{instance_type} instance {name:?} already exists")]
    AlreadyExists {
        instance_type: InstanceType,
        name: String,
    },
    #[error("{instance_type} instance {name:?} has no network interface (is it running?)")]
    NoInterface {
        instance_type: InstanceType,
        name: String,
    },
    #[error("{0} is not supported for this instance type")]
    Unsupported(&'static str),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Command(#[from] ExecError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One driver per instance type.
///
/// Every successful call returns a short human-readable summary for the job
/// log; failures carry the failing tool's own diagnostic.
#[async_trait]
pub trait InstanceManager: Send + Sync {
    fn instance_type(&self) -> InstanceType;

    async fn create(&self, spec: &InstanceSpec) -> Result<String, LifecycleError>;

    async fn start(&self, name: &str) -> Result<String, LifecycleError>;

    /// Graceful stop, forced after the configured timeout.
    async fn stop(&self, name: &str) -> Result<String, LifecycleError>;

    async fn reboot(&self, name: &str) -> Result<String, LifecycleError>;

    /// Force-stop, undefine and destroy storage. Each step is attempted
    /// regardless of earlier failures.
    async fn delete(&self, name: &str, storage: &StoragePoolSpec) -> StepReport;

    async fn reinstall(&self, spec: &InstanceSpec, iso: &Path) -> Result<String, LifecycleError>;

    async fn resize_disk(
        &self,
        name: &str,
        disk_gb: u64,
        storage: &StoragePoolSpec,
    ) -> Result<String, LifecycleError>;

    /// Point-in-time snapshot of the instance's disk.
    async fn snapshot(
        &self,
        name: &str,
        snapshot: &str,
        storage: &StoragePoolSpec,
    ) -> Result<String, LifecycleError>;

    /// Host-side network interface currently attached to the instance.
    async fn interface(&self, name: &str) -> Result<String, LifecycleError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: &'static str,
    pub result: Result<(), String>,
}

/// Results of a multi-step teardown. Every step's failure is logged, but
/// only the last step decides the overall outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    steps: Vec<Step>,
}

impl StepReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record<E: fmt::Display>(&mut self, name: &'static str, result: Result<(), E>) {
        let result = result.map_err(|e| e.to_string());
        if let Err(e) = &result {
            event!(Level::WARN, step = name, error = %e, "Cleanup step failed, continuing");
        }
        self.steps.push(Step { name, result });
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// The terminal step's result. An empty report succeeded.
    pub fn outcome(&self) -> Result<(), String> {
        match self.steps.last() {
            Some(step) => step.result.clone(),
            None => Ok(()),
        }
    }

    pub fn log(&self) -> String {
        self.steps
            .iter()
            .map(|step| match &step.result {
                Ok(()) => format!("{}: ok", step.name),
                Err(e) => format!("{}: failed: {}", step.name, e),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
