//! System containers managed with the `lxc-*` tools.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{event, instrument, Level};

use corral_rs::instance::{InstanceSpec, InstanceType};
use corral_rs::net::{mac_from_uuid, MacAddress};
use corral_rs::storage::StoragePoolSpec;

use super::{InstanceManager, LifecycleError, StepReport};
use crate::config::{positive, AgentConfig, LifecycleConfig, NetworkConfig, PathsConfig};
use crate::exec::{CommandOutput, CommandRunner, ExecError, Invocation};

/// CFS period used for `cpu.max`; the quota is `vcpus` periods.
const CPU_PERIOD_US: u64 = 100_000;

fn is_missing_container(diagnostic: &str) -> bool {
    diagnostic.contains("doesn't exist") || diagnostic.contains("does not exist")
}

/// Value of the `State:` line of `lxc-info` output.
pub fn parse_state(output: &str) -> Option<&str> {
    info_field(output, "State:")
}

/// Host side of the container's veth pair, from the `Link:` line of
/// `lxc-info` output.
pub fn parse_link(output: &str) -> Option<&str> {
    info_field(output, "Link:")
}

fn info_field<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(key))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Directives appended to a freshly created container's config.
pub fn container_config(
    spec: &InstanceSpec,
    bridge: &str,
    mac: Option<MacAddress>,
    cap_drop: &[String],
) -> String {
    let mut config = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(config, "\n# corral");
    let _ = writeln!(
        config,
        "lxc.cgroup2.cpu.max = {} {}",
        u64::from(spec.vcpus) * CPU_PERIOD_US,
        CPU_PERIOD_US
    );
    let _ = writeln!(config, "lxc.cgroup2.memory.max = {}M", spec.memory_mb);
    let _ = writeln!(config, "lxc.net.0.type = veth");
    let _ = writeln!(config, "lxc.net.0.link = {bridge}");
    let _ = writeln!(config, "lxc.net.0.flags = up");
    if let Some(mac) = mac {
        let _ = writeln!(config, "lxc.net.0.hwaddr = {mac}");
    }
    if let Some(tag) = spec.vlan_tag {
        let _ = writeln!(config, "lxc.net.0.veth.vlan.id = {tag}");
    }
    let _ = writeln!(config, "lxc.apparmor.profile = generated");
    if !cap_drop.is_empty() {
        let _ = writeln!(config, "lxc.cap.drop = {}", cap_drop.join(" "));
    }
    config
}

pub struct Lxc {
    runner: Arc<dyn CommandRunner>,
    paths: PathsConfig,
    network: NetworkConfig,
    lifecycle: LifecycleConfig,
}

impl Lxc {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &AgentConfig) -> Self {
        Lxc {
            runner,
            paths: config.paths.clone(),
            network: config.network.clone(),
            lifecycle: config.lifecycle.clone(),
        }
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.paths.lxc_path.join(name).join("config")
    }

    fn invocation(&self, program: &str, name: &str, args: &[&str]) -> Invocation {
        let lxc_path = self.paths.lxc_path.to_string_lossy().into_owned();
        let mut all = vec![
            "-P".to_string(),
            lxc_path,
            "-n".to_string(),
            name.to_string(),
        ];
        all.extend(args.iter().map(|a| a.to_string()));
        Invocation::new(program, all)
    }

    async fn lxc(&self, invocation: Invocation, name: &str) -> Result<CommandOutput, LifecycleError> {
        let command = invocation.to_string();
        let output = self.runner.run(invocation).await;
        if output.success() {
            return Ok(output);
        }
        if is_missing_container(output.diagnostic()) {
            return Err(LifecycleError::NotFound {
                instance_type: InstanceType::Lxc,
                name: name.to_string(),
            });
        }
        Err(ExecError::CommandFailed {
            command,
            code: output.code,
            diagnostic: output.diagnostic().to_string(),
        }
        .into())
    }

    /// `RUNNING`, `STOPPED`, ...
    pub async fn state(&self, name: &str) -> Result<String, LifecycleError> {
        let output = self
            .lxc(self.invocation("lxc-info", name, &["-s"]), name)
            .await?;
        Ok(parse_state(&output.stdout).unwrap_or("UNKNOWN").to_string())
    }

    async fn exists(&self, name: &str) -> Result<bool, LifecycleError> {
        match self.state(name).await {
            Ok(_) => Ok(true),
            Err(LifecycleError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn backing_args(pool: &StoragePoolSpec, disk_gb: u64) -> Vec<String> {
        match pool {
            StoragePoolSpec::Qcow2(_) => vec!["-B".into(), "dir".into()],
            StoragePoolSpec::Lvmthin(lvm) => vec![
                "-B".into(),
                "lvm".into(),
                "--vgname".into(),
                lvm.vg.clone(),
                "--thinpool".into(),
                lvm.thinpool.clone(),
                "--fssize".into(),
                format!("{disk_gb}G"),
            ],
            StoragePoolSpec::Zfs(zfs) => vec![
                "-B".into(),
                "zfs".into(),
                "--zfsroot".into(),
                format!("{}/{}", zfs.pool, zfs.dataset),
            ],
        }
    }

    async fn append_config(&self, name: &str, directives: &str) -> Result<(), LifecycleError> {
        let path = self.config_path(name);
        let io_err = |source| LifecycleError::Io {
            path: path.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.write_all(directives.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl InstanceManager for Lxc {
    fn instance_type(&self) -> InstanceType {
        InstanceType::Lxc
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create(&self, spec: &InstanceSpec) -> Result<String, LifecycleError> {
        if self.exists(&spec.name).await? {
            return Err(LifecycleError::AlreadyExists {
                instance_type: InstanceType::Lxc,
                name: spec.name.clone(),
            });
        }

        let pool = spec.storage.clone().unwrap_or_default();
        let mut args: Vec<String> = vec!["-t".into(), "download".into()];
        args.extend(Self::backing_args(&pool, spec.disk_gb));
        args.extend([
            "--".to_string(),
            "-d".to_string(),
            self.lifecycle.lxc_dist.clone(),
            "-r".to_string(),
            self.lifecycle.lxc_release.clone(),
            "-a".to_string(),
            self.lifecycle.lxc_arch.clone(),
        ]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.lxc(self.invocation("lxc-create", &spec.name, &args), &spec.name)
            .await?;

        if let StoragePoolSpec::Zfs(zfs) = &pool {
            self.runner
                .checked(Invocation::new(
                    "zfs",
                    [
                        "set".to_string(),
                        format!("refquota={}G", spec.disk_gb),
                        zfs.volume(&spec.name),
                    ],
                ))
                .await?;
        }

        let bridge = spec
            .bridge
            .as_deref()
            .unwrap_or(&self.network.default_bridge);
        let mac = spec.mac.or_else(|| spec.vm_uuid.as_ref().map(mac_from_uuid));
        let directives = container_config(spec, bridge, mac, &self.lifecycle.lxc_cap_drop);
        self.append_config(&spec.name, &directives).await?;

        self.lxc(self.invocation("lxc-start", &spec.name, &["-d"]), &spec.name)
            .await?;

        event!(Level::INFO, name = %spec.name, "Created container");
        Ok(format!(
            "created container {} ({} {} on {} storage)",
            spec.name,
            self.lifecycle.lxc_dist,
            self.lifecycle.lxc_release,
            pool.kind()
        ))
    }

    async fn start(&self, name: &str) -> Result<String, LifecycleError> {
        if self.state(name).await? == "RUNNING" {
            return Ok(format!("container {name} is already running"));
        }
        self.lxc(self.invocation("lxc-start", name, &["-d"]), name)
            .await?;
        Ok(format!("started container {name}"))
    }

    #[instrument(skip(self))]
    async fn stop(&self, name: &str) -> Result<String, LifecycleError> {
        if self.state(name).await? == "STOPPED" {
            return Ok(format!("container {name} is already stopped"));
        }

        let timeout = positive(self.lifecycle.stop_timeout).unwrap_or_default();
        let secs = timeout.as_secs().to_string();
        let graceful = self
            .invocation("lxc-stop", name, &["-t", &secs])
            .timeout(timeout + Duration::from_secs(10));
        let output = self.runner.run(graceful).await;
        if output.success() {
            return Ok(format!("container {name} shut down gracefully"));
        }

        event!(
            Level::WARN,
            container = name,
            error = output.diagnostic(),
            "Graceful stop failed, killing"
        );
        self.lxc(self.invocation("lxc-stop", name, &["-k"]), name)
            .await?;
        Ok(format!("container {name} killed"))
    }

    async fn reboot(&self, name: &str) -> Result<String, LifecycleError> {
        self.lxc(self.invocation("lxc-stop", name, &["-r"]), name)
            .await?;
        Ok(format!("rebooted container {name}"))
    }

    #[instrument(skip(self, _storage))]
    async fn delete(&self, name: &str, _storage: &StoragePoolSpec) -> StepReport {
        let mut report = StepReport::new();

        let stopped = self
            .lxc(self.invocation("lxc-stop", name, &["-k"]), name)
            .await
            .map(|_| ());
        report.record("force stop", stopped);

        // lxc-destroy removes the rootfs along with its volume or dataset.
        let destroyed = self
            .lxc(self.invocation("lxc-destroy", name, &[]), name)
            .await
            .map(|_| ());
        report.record("destroy", destroyed);
        report
    }

    async fn reinstall(&self, _spec: &InstanceSpec, _iso: &Path) -> Result<String, LifecycleError> {
        Err(LifecycleError::Unsupported("REINSTALL"))
    }

    async fn resize_disk(
        &self,
        _name: &str,
        _disk_gb: u64,
        _storage: &StoragePoolSpec,
    ) -> Result<String, LifecycleError> {
        Err(LifecycleError::Unsupported("DISK_RESIZE"))
    }

    /// `lxc-snapshot` picks the mechanism matching the container's backing store.
    async fn snapshot(
        &self,
        name: &str,
        snapshot: &str,
        _storage: &StoragePoolSpec,
    ) -> Result<String, LifecycleError> {
        self.lxc(self.invocation("lxc-snapshot", name, &["-N", snapshot]), name)
            .await?;
        Ok(format!("snapshot of container {name}: {snapshot}"))
    }

    async fn interface(&self, name: &str) -> Result<String, LifecycleError> {
        let output = self
            .lxc(self.invocation("lxc-info", name, &[]), name)
            .await?;
        parse_link(&output.stdout)
            .map(str::to_string)
            .ok_or_else(|| LifecycleError::NoInterface {
                instance_type: InstanceType::Lxc,
                name: name.to_string(),
            })
    }
}
