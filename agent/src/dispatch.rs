//! Turns claimed jobs into lifecycle, network and backup operations.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, instrument, Level};

use corral_rs::api::agent::poll::ClaimedJob;
use corral_rs::connector::{ConnectorError, JobExecutor, SwitchboardConnector};
use corral_rs::instance::InstanceType;
use corral_rs::job::{Delete, JobOutcome, JobSpec};

use crate::backup::{BackupEngine, BackupError};
use crate::config::AgentConfig;
use crate::exec::CommandRunner;
use crate::lifecycle::{InstanceManager, Kvm, LifecycleError, Lxc};
use crate::network::{Network, NetworkError};
use crate::object_store::{AwsCliStore, ObjectStore};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("failed to fetch firewall rules: {0}")]
    Connector(#[from] ConnectorError),
    #[error("failed to encode job result: {0}")]
    Result(#[from] serde_json::Error),
}

/// The executor for everything a node can be asked to do.
pub struct NodeExecutor {
    connector: Arc<dyn SwitchboardConnector>,
    kvm: Kvm,
    lxc: Lxc,
    network: Network,
    backups: BackupEngine,
}

impl NodeExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: &AgentConfig,
        connector: Arc<dyn SwitchboardConnector>,
    ) -> Self {
        let store = config.object_store.clone().map(|store_config| {
            Arc::new(AwsCliStore::new(runner.clone(), store_config)) as Arc<dyn ObjectStore>
        });
        NodeExecutor {
            connector,
            kvm: Kvm::new(runner.clone(), config),
            lxc: Lxc::new(runner.clone(), config),
            network: Network::new(runner.clone(), config),
            backups: BackupEngine::new(runner, config.paths.clone(), store),
        }
    }

    fn manager(&self, instance_type: InstanceType) -> &dyn InstanceManager {
        match instance_type {
            InstanceType::Kvm => &self.kvm,
            InstanceType::Lxc => &self.lxc,
        }
    }

    async fn run(&self, spec: JobSpec) -> Result<JobOutcome, DispatchError> {
        let log = match spec {
            JobSpec::Create(spec) => self.manager(spec.instance_type).create(&spec).await?,
            JobSpec::Start(r) => self.manager(r.instance_type).start(&r.name).await?,
            JobSpec::Stop(r) => self.manager(r.instance_type).stop(&r.name).await?,
            JobSpec::Reboot(r) => self.manager(r.instance_type).reboot(&r.name).await?,
            JobSpec::Delete(delete) => return Ok(self.delete(&delete).await),
            JobSpec::Reinstall(r) => {
                self.manager(r.instance.instance_type)
                    .reinstall(&r.instance, &r.iso)
                    .await?
            }
            JobSpec::DiskResize(r) => {
                let storage = r.storage.unwrap_or_default();
                self.manager(r.instance.instance_type)
                    .resize_disk(&r.instance.name, r.disk_gb, &storage)
                    .await?
            }
            JobSpec::NetSetup(n) => {
                let mut lines = self.network.ensure_bridge(&n.bridge).await?;
                lines.push(
                    self.network
                        .setup_forwarding(n.mode, &n.bridge, &n.wan_iface)
                        .await?,
                );
                lines.join("\n")
            }
            JobSpec::NetAntispoof(a) => {
                let iface = self
                    .manager(a.instance.instance_type)
                    .interface(&a.instance.name)
                    .await?;
                self.network.apply_antispoof(&iface, a.mac, a.ip).await?
            }
            JobSpec::FwSync(f) => {
                let state = self.connector.firewall(f.vm_uuid).await?;
                let iface = self.manager(f.instance_type).interface(&f.name).await?;
                self.network.sync_firewall(&f.name, &iface, &state).await?
            }
            JobSpec::RaSetup(r) => {
                self.network
                    .configure_ra(&r.bridge, &r.prefix, &r.dns_servers)
                    .await?
            }
            JobSpec::BackupCreate(b) => {
                let created = self.backups.create(&b, Utc::now()).await?;
                let log = format!(
                    "backup {} ({} bytes, sha256 {}, tier {})",
                    created.path.display(),
                    created.size_bytes,
                    created.checksum,
                    created.tier.as_str()
                );
                return Ok(JobOutcome::done(log).with_result(serde_json::to_value(&created)?));
            }
            JobSpec::BackupDelete(d) => {
                let (deleted, errors) = self.backups.delete(&d.backups).await;
                let result = serde_json::to_value(&deleted)?;
                let mut log = format!("deleted {} of {} backup(s)", deleted.ids.len(), d.backups.len());
                for error in &errors {
                    log.push('\n');
                    log.push_str(error);
                }
                let outcome = if errors.is_empty() {
                    JobOutcome::done(log)
                } else {
                    JobOutcome::failed(log)
                };
                return Ok(outcome.with_result(result));
            }
            JobSpec::BackupRestoreAsNew(r) => self.backups.restore_as_new(&self.kvm, &r).await?,
            JobSpec::SnapshotCreate(s) => {
                let storage = s.storage.unwrap_or_default();
                self.manager(s.instance.instance_type)
                    .snapshot(&s.instance.name, &s.snapshot, &storage)
                    .await?
            }
        };
        Ok(JobOutcome::done(log))
    }

    /// Tear down the instance's nftables chains, then the instance itself.
    /// Network cleanup is best effort and does not decide the outcome.
    async fn delete(&self, delete: &Delete) -> JobOutcome {
        let instance = &delete.instance;
        let manager = self.manager(instance.instance_type);
        let mut log = Vec::new();

        match manager.interface(&instance.name).await {
            Ok(iface) => {
                for (what, result) in [
                    ("firewall cleanup", self.network.remove_firewall(&instance.name, &iface).await),
                    ("antispoof cleanup", self.network.remove_antispoof(&iface).await),
                ] {
                    match result {
                        Ok(()) => log.push(format!("{what}: ok")),
                        Err(e) => {
                            event!(Level::WARN, %iface, error = %e, "{what} failed");
                            log.push(format!("{what}: failed: {e}"));
                        }
                    }
                }
            }
            Err(e) => {
                event!(Level::DEBUG, name = %instance.name, error = %e, "No interface to clean up");
                log.push(format!("network cleanup: skipped: {e}"));
            }
        }

        let storage = delete.storage.clone().unwrap_or_default();
        let report = manager.delete(&instance.name, &storage).await;
        log.push(report.log());
        let log = log.join("\n");
        match report.outcome() {
            Ok(()) => JobOutcome::done(log),
            Err(_) => JobOutcome::failed(log),
        }
    }
}

#[async_trait]
impl JobExecutor for NodeExecutor {
    #[instrument(skip(self, job), fields(id = job.id.0, kind = %job.kind))]
    async fn execute(&self, job: &ClaimedJob) -> JobOutcome {
        let spec = match JobSpec::from_wire(&job.kind, job.payload.clone()) {
            Ok(spec) => spec,
            Err(e) => {
                event!(Level::WARN, error = %e, "Rejecting job");
                return JobOutcome::failed(e.to_string());
            }
        };

        match self.run(spec).await {
            Ok(outcome) => {
                event!(Level::INFO, succeeded = outcome.succeeded(), "Job finished");
                outcome
            }
            Err(e) => {
                event!(Level::WARN, error = %e, "Job failed");
                JobOutcome::failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PathsConfig;
    use crate::connector::memory::MemoryConnector;
    use crate::exec::fake::FakeRunner;
    use crate::exec::CommandOutput;
    use corral_rs::job::{AckStatus, JobId};
    use serde_json::json;

    fn executor(root: &std::path::Path, runner: Arc<FakeRunner>) -> NodeExecutor {
        let mut config: AgentConfig = toml::from_str(
            "[controller]\nurl = \"http://localhost\"\ntoken = \"t\"\n",
        )
        .unwrap();
        config.paths = PathsConfig::under(root);
        NodeExecutor::new(runner, &config, Arc::new(MemoryConnector::new()))
    }

    fn job(kind: &str, payload: serde_json::Value) -> ClaimedJob {
        ClaimedJob {
            id: JobId(7),
            kind: kind.to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn unknown_kind_fails_without_commands() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let outcome = executor(dir.path(), runner.clone())
            .execute(&job("FROBNICATE", json!({})))
            .await;
        assert_eq!(outcome.status, AckStatus::Failed);
        assert_eq!(outcome.log, "unknown job type: FROBNICATE");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_name_is_rejected_before_execution() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let outcome = executor(dir.path(), runner.clone())
            .execute(&job("START", json!({ "name": "vm1; reboot" })))
            .await;
        assert_eq!(outcome.status, AckStatus::Failed);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn lxc_start_goes_to_lxc_tools() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["lxc-info"], CommandOutput::ok("State:          STOPPED\n"));
        let outcome = executor(dir.path(), runner.clone())
            .execute(&job("START", json!({ "name": "ct1", "instance_type": "lxc" })))
            .await;
        assert!(outcome.succeeded(), "{}", outcome.log);
        assert!(runner.lines().iter().any(|l| l.starts_with("lxc-start ")));
        assert!(!runner.ran("virsh"));
    }

    #[tokio::test]
    async fn backup_delete_reports_ids_even_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let outcome = executor(dir.path(), runner)
            .execute(&job(
                "BACKUP_DELETE",
                json!({
                    "vm_uuid": "3c1b2a9e-6f2d-4b8a-9c3e-7d6e5f4a3b2c",
                    "backups": [
                        { "id": 1, "path": dir.path().join("backups/gone.qcow2") },
                        { "id": 2, "object_key": "x/y.qcow2" }
                    ]
                }),
            ))
            .await;
        assert_eq!(outcome.status, AckStatus::Failed);
        assert_eq!(outcome.result, Some(json!({ "ids": [1] })));
    }

    #[tokio::test]
    async fn zfs_snapshot_of_existing_domain() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["virsh", "domstate"], CommandOutput::ok("running\n"));
        let outcome = executor(dir.path(), runner.clone())
            .execute(&job(
                "SNAPSHOT_CREATE",
                json!({
                    "name": "vm1",
                    "snapshot": "auto-20240309-140507",
                    "storage": { "driver": "zfs", "config": { "pool": "tank", "dataset": "vms" } }
                }),
            ))
            .await;
        assert!(outcome.succeeded(), "{}", outcome.log);
        assert_eq!(
            runner.lines(),
            vec!["virsh domstate vm1", "zfs snapshot tank/vms/vm1@auto-20240309-140507"]
        );
    }

    #[tokio::test]
    async fn snapshot_of_missing_domain_fails_before_storage() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["virsh", "domstate"],
            CommandOutput::failed(1, "error: failed to get domain 'vm1'"),
        );
        let outcome = executor(dir.path(), runner.clone())
            .execute(&job("SNAPSHOT_CREATE", json!({ "name": "vm1", "snapshot": "s1" })))
            .await;
        assert_eq!(outcome.status, AckStatus::Failed);
        assert!(!runner.ran("virsh snapshot-create-as"));
    }
}
