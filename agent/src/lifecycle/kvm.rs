//! KVM domains managed through libvirt's `virsh`.
//!
//! Domain definitions are generated from the instance description, written
//! to `state_dir/domains/<name>.xml` and loaded with `virsh define`. The
//! generator is deterministic: the same instance always yields the same
//! document, so redefining a domain never changes its MAC or device layout.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use corral_rs::instance::{InstanceSpec, InstanceType};
use corral_rs::net::{mac_from_uuid, MacAddress};
use corral_rs::storage::StoragePoolSpec;

use super::{InstanceManager, LifecycleError, StepReport};
use crate::config::{positive, AgentConfig, LifecycleConfig, NetworkConfig, PathsConfig};
use crate::exec::{CommandOutput, CommandRunner, ExecError};
use crate::storage::{driver_for, DiskKind, DiskSpec, StorageDriver};

const STATE_RUNNING: &str = "running";
const STATE_SHUT_OFF: &str = "shut off";

/// Escape text for use in XML character data and attribute values.
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Inputs of one libvirt domain document.
#[derive(Debug, Clone)]
pub struct DomainDefinition<'a> {
    pub name: &'a str,
    pub uuid: Option<Uuid>,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub machine: &'a str,
    pub disk: &'a DiskSpec,
    /// Installation medium; when present the domain boots from it first.
    pub cdrom: Option<&'a Path>,
    pub bridge: &'a str,
    pub vlan_tag: Option<u16>,
    pub mac: Option<MacAddress>,
}

impl<'a> DomainDefinition<'a> {
    pub fn for_instance(
        spec: &'a InstanceSpec,
        disk: &'a DiskSpec,
        cdrom: Option<&'a Path>,
        machine: &'a str,
        default_bridge: &'a str,
    ) -> Self {
        DomainDefinition {
            name: &spec.name,
            uuid: spec.vm_uuid,
            vcpus: spec.vcpus,
            memory_mb: spec.memory_mb,
            machine,
            disk,
            cdrom,
            bridge: spec.bridge.as_deref().unwrap_or(default_bridge),
            vlan_tag: spec.vlan_tag,
            mac: spec.mac.or_else(|| spec.vm_uuid.as_ref().map(mac_from_uuid)),
        }
    }
}

impl fmt::Display for DomainDefinition<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<domain type='kvm'>")?;
        writeln!(f, "  <name>{}</name>", xml_escape(self.name))?;
        if let Some(uuid) = self.uuid {
            writeln!(f, "  <uuid>{uuid}</uuid>")?;
        }
        writeln!(f, "  <memory unit='MiB'>{}</memory>", self.memory_mb)?;
        writeln!(f, "  <currentMemory unit='MiB'>{}</currentMemory>", self.memory_mb)?;
        writeln!(f, "  <vcpu placement='static'>{}</vcpu>", self.vcpus)?;

        writeln!(f, "  <os>")?;
        writeln!(
            f,
            "    <type arch='x86_64' machine='{}'>hvm</type>",
            xml_escape(self.machine)
        )?;
        if self.cdrom.is_some() {
            writeln!(f, "    <boot dev='cdrom'/>")?;
        }
        writeln!(f, "    <boot dev='hd'/>")?;
        writeln!(f, "  </os>")?;
        writeln!(f, "  <features>")?;
        writeln!(f, "    <acpi/>")?;
        writeln!(f, "    <apic/>")?;
        writeln!(f, "  </features>")?;
        writeln!(f, "  <cpu mode='host-passthrough'/>")?;
        writeln!(f, "  <on_poweroff>destroy</on_poweroff>")?;
        writeln!(f, "  <on_reboot>restart</on_reboot>")?;
        writeln!(f, "  <on_crash>restart</on_crash>")?;

        writeln!(f, "  <devices>")?;
        let disk_path = xml_escape(&self.disk.path.to_string_lossy());
        match self.disk.kind {
            DiskKind::File => {
                writeln!(f, "    <disk type='file' device='disk'>")?;
                writeln!(
                    f,
                    "      <driver name='qemu' type='{}' cache='none'/>",
                    self.disk.format
                )?;
                writeln!(f, "      <source file='{disk_path}'/>")?;
            }
            DiskKind::Block => {
                writeln!(f, "    <disk type='block' device='disk'>")?;
                writeln!(
                    f,
                    "      <driver name='qemu' type='{}' cache='none' io='native'/>",
                    self.disk.format
                )?;
                writeln!(f, "      <source dev='{disk_path}'/>")?;
            }
        }
        writeln!(f, "      <target dev='vda' bus='virtio'/>")?;
        writeln!(f, "    </disk>")?;

        if let Some(iso) = self.cdrom {
            writeln!(f, "    <disk type='file' device='cdrom'>")?;
            writeln!(f, "      <driver name='qemu' type='raw'/>")?;
            writeln!(
                f,
                "      <source file='{}'/>",
                xml_escape(&iso.to_string_lossy())
            )?;
            writeln!(f, "      <target dev='sda' bus='sata'/>")?;
            writeln!(f, "      <readonly/>")?;
            writeln!(f, "    </disk>")?;
        }

        writeln!(f, "    <interface type='bridge'>")?;
        if let Some(mac) = self.mac {
            writeln!(f, "      <mac address='{mac}'/>")?;
        }
        writeln!(f, "      <source bridge='{}'/>", xml_escape(self.bridge))?;
        if let Some(tag) = self.vlan_tag {
            writeln!(f, "      <vlan>")?;
            writeln!(f, "        <tag id='{tag}'/>")?;
            writeln!(f, "      </vlan>")?;
        }
        writeln!(f, "      <model type='virtio'/>")?;
        writeln!(f, "    </interface>")?;

        writeln!(f, "    <serial type='pty'>")?;
        writeln!(f, "      <target port='0'/>")?;
        writeln!(f, "    </serial>")?;
        writeln!(f, "    <console type='pty'>")?;
        writeln!(f, "      <target type='serial' port='0'/>")?;
        writeln!(f, "    </console>")?;
        writeln!(
            f,
            "    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'/>"
        )?;
        writeln!(f, "    <video>")?;
        writeln!(f, "      <model type='virtio'/>")?;
        writeln!(f, "    </video>")?;
        writeln!(f, "    <memballoon model='virtio'/>")?;
        writeln!(f, "  </devices>")?;
        writeln!(f, "</domain>")
    }
}

fn is_missing_domain(diagnostic: &str) -> bool {
    diagnostic.contains("failed to get domain") || diagnostic.contains("Domain not found")
}

/// Parse `virsh domiflist` output: the first interface's target name.
///
/// Shut-off domains list `-` as their interface.
pub fn parse_domiflist(output: &str) -> Option<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .find(|iface| *iface != "-")
        .map(str::to_string)
}

pub struct Kvm {
    runner: Arc<dyn CommandRunner>,
    paths: PathsConfig,
    network: NetworkConfig,
    lifecycle: LifecycleConfig,
}

impl Kvm {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &AgentConfig) -> Self {
        Kvm {
            runner,
            paths: config.paths.clone(),
            network: config.network.clone(),
            lifecycle: config.lifecycle.clone(),
        }
    }

    fn storage(&self, pool: &StoragePoolSpec) -> Box<dyn StorageDriver> {
        driver_for(pool, self.runner.clone(), &self.paths.images_dir)
    }

    pub fn definition_path(&self, name: &str) -> PathBuf {
        self.paths.domains_dir().join(format!("{name}.xml"))
    }

    /// Run `virsh`, mapping "no such domain" onto [`LifecycleError::NotFound`].
    async fn virsh(&self, name: &str, args: &[&str]) -> Result<CommandOutput, LifecycleError> {
        let output = self.runner.exec("virsh", args).await;
        if output.success() {
            return Ok(output);
        }
        if is_missing_domain(output.diagnostic()) {
            return Err(LifecycleError::NotFound {
                instance_type: InstanceType::Kvm,
                name: name.to_string(),
            });
        }
        Err(ExecError::CommandFailed {
            command: format!("virsh {}", args.join(" ")),
            code: output.code,
            diagnostic: output.diagnostic().to_string(),
        }
        .into())
    }

    /// Current domain state as reported by `virsh domstate` (`running`,
    /// `shut off`, `paused`, ...).
    pub async fn domstate(&self, name: &str) -> Result<String, LifecycleError> {
        let output = self.virsh(name, &["domstate", name]).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn exists(&self, name: &str) -> Result<bool, LifecycleError> {
        match self.domstate(name).await {
            Ok(_) => Ok(true),
            Err(LifecycleError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn write_definition(
        &self,
        definition: &DomainDefinition<'_>,
    ) -> Result<PathBuf, LifecycleError> {
        let dir = self.paths.domains_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| LifecycleError::Io {
                path: dir.clone(),
                source,
            })?;
        let path = self.definition_path(definition.name);
        tokio::fs::write(&path, definition.to_string())
            .await
            .map_err(|source| LifecycleError::Io {
                path: path.clone(),
                source,
            })?;
        event!(Level::DEBUG, ?path, "Wrote domain definition");
        Ok(path)
    }

    async fn define(
        &self,
        spec: &InstanceSpec,
        disk: &DiskSpec,
        cdrom: Option<&Path>,
    ) -> Result<(), LifecycleError> {
        let definition = DomainDefinition::for_instance(
            spec,
            disk,
            cdrom,
            &self.lifecycle.machine_type,
            &self.network.default_bridge,
        );
        let path = self.write_definition(&definition).await?;
        let path = path.to_string_lossy();
        self.virsh(&spec.name, &["define", &path]).await?;
        Ok(())
    }

    /// Define a domain on an already prepared disk and boot it.
    pub async fn define_and_start(
        &self,
        spec: &InstanceSpec,
        disk: &DiskSpec,
    ) -> Result<(), LifecycleError> {
        self.define(spec, disk, None).await?;
        self.virsh(&spec.name, &["start", &spec.name]).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceManager for Kvm {
    fn instance_type(&self) -> InstanceType {
        InstanceType::Kvm
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create(&self, spec: &InstanceSpec) -> Result<String, LifecycleError> {
        if self.exists(&spec.name).await? {
            return Err(LifecycleError::AlreadyExists {
                instance_type: InstanceType::Kvm,
                name: spec.name.clone(),
            });
        }

        let pool = spec.storage.clone().unwrap_or_default();
        let disk = self
            .storage(&pool)
            .create(&spec.name, spec.disk_gb, spec.image.as_deref())
            .await?;
        self.define_and_start(spec, &disk).await?;

        event!(Level::INFO, name = %spec.name, disk = ?disk.path, "Created domain");
        Ok(format!(
            "created domain {} ({} vCPU, {} MiB, {} GiB {} disk at {})",
            spec.name,
            spec.vcpus,
            spec.memory_mb,
            spec.disk_gb,
            pool.kind(),
            disk.path.display()
        ))
    }

    async fn start(&self, name: &str) -> Result<String, LifecycleError> {
        if self.domstate(name).await? == STATE_RUNNING {
            return Ok(format!("domain {name} is already running"));
        }
        self.virsh(name, &["start", name]).await?;
        Ok(format!("started domain {name}"))
    }

    #[instrument(skip(self))]
    async fn stop(&self, name: &str) -> Result<String, LifecycleError> {
        if self.domstate(name).await? == STATE_SHUT_OFF {
            return Ok(format!("domain {name} is already shut off"));
        }

        let shutdown = self.runner.exec("virsh", &["shutdown", name]).await;
        if shutdown.success() {
            let timeout = positive(self.lifecycle.stop_timeout).unwrap_or_default();
            let interval = positive(self.lifecycle.stop_poll_interval).unwrap_or_default();
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if self.domstate(name).await? == STATE_SHUT_OFF {
                    return Ok(format!("domain {name} shut down gracefully"));
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
            event!(Level::WARN, domain = name, ?timeout, "Graceful shutdown timed out, destroying");
        } else {
            event!(
                Level::WARN,
                domain = name,
                error = shutdown.diagnostic(),
                "virsh shutdown failed, destroying"
            );
        }

        self.virsh(name, &["destroy", name]).await?;
        Ok(format!("domain {name} forced off"))
    }

    async fn reboot(&self, name: &str) -> Result<String, LifecycleError> {
        self.domstate(name).await?;
        self.virsh(name, &["reboot", name]).await?;
        Ok(format!("rebooted domain {name}"))
    }

    #[instrument(skip(self, storage))]
    async fn delete(&self, name: &str, storage: &StoragePoolSpec) -> StepReport {
        let mut report = StepReport::new();

        let destroyed = self.virsh(name, &["destroy", name]).await.map(|_| ());
        report.record("force stop", destroyed);

        let undefined = self.virsh(name, &["undefine", name]).await.map(|_| ());
        report.record("undefine", undefined);

        let path = self.definition_path(name);
        let removed = match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(LifecycleError::Io {
                path,
                source: e,
            }),
            _ => Ok(()),
        };
        report.record("remove definition", removed);

        let destroyed = self.storage(storage).destroy(name).await;
        report.record("destroy storage", destroyed);
        report
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn reinstall(&self, spec: &InstanceSpec, iso: &Path) -> Result<String, LifecycleError> {
        self.domstate(&spec.name).await?;
        if !tokio::fs::try_exists(iso).await.unwrap_or(false) {
            return Err(LifecycleError::Io {
                path: iso.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let pool = spec.storage.clone().unwrap_or_default();
        let disk = self.storage(&pool).locate(&spec.name);
        self.define(spec, &disk, Some(iso)).await?;

        // The new definition only applies after a cold boot.
        let destroyed = self.runner.exec("virsh", &["destroy", &spec.name]).await;
        if !destroyed.success() {
            event!(Level::DEBUG, name = %spec.name, error = destroyed.diagnostic(), "Domain was not running");
        }
        self.virsh(&spec.name, &["start", &spec.name]).await?;
        Ok(format!(
            "domain {} restarted from {}",
            spec.name,
            iso.display()
        ))
    }

    #[instrument(skip(self, storage))]
    async fn resize_disk(
        &self,
        name: &str,
        disk_gb: u64,
        storage: &StoragePoolSpec,
    ) -> Result<String, LifecycleError> {
        let running = self.domstate(name).await? == STATE_RUNNING;
        let driver = self.storage(storage);
        let size = format!("{disk_gb}G");

        // qemu holds a write lock on a running qcow2 image, so the
        // hypervisor resizes it; other backends grow underneath first.
        let disk = if running && driver.locate(name).kind == DiskKind::File {
            driver.locate(name)
        } else {
            driver.resize(name, disk_gb).await?
        };

        if running {
            let path = disk.path.to_string_lossy();
            self.virsh(name, &["blockresize", name, &path, &size]).await?;
            Ok(format!("resized disk of {name} to {size} (live)"))
        } else {
            Ok(format!("resized disk of {name} to {size}"))
        }
    }

    #[instrument(skip(self, storage))]
    async fn snapshot(
        &self,
        name: &str,
        snapshot: &str,
        storage: &StoragePoolSpec,
    ) -> Result<String, LifecycleError> {
        // Fails with NotFound before any storage tool runs.
        self.domstate(name).await?;
        let taken = self.storage(storage).snapshot(name, snapshot).await?;
        Ok(format!("snapshot of {name}: {taken}"))
    }

    async fn interface(&self, name: &str) -> Result<String, LifecycleError> {
        let output = self.virsh(name, &["domiflist", name]).await?;
        parse_domiflist(&output.stdout).ok_or_else(|| LifecycleError::NoInterface {
            instance_type: InstanceType::Kvm,
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::AgentConfig;
    use crate::exec::fake::FakeRunner;
    use chrono::TimeDelta;
    use serde_json::json;

    fn config(root: &Path) -> AgentConfig {
        let mut config: AgentConfig = toml::from_str(
            r#"
            [controller]
            url = "http://localhost"
            token = "t"
            "#,
        )
        .unwrap();
        config.paths = PathsConfig::under(root);
        config.lifecycle.stop_timeout = TimeDelta::zero();
        config.lifecycle.stop_poll_interval = TimeDelta::zero();
        config
    }

    fn spec() -> InstanceSpec {
        serde_json::from_value(json!({
            "vm_uuid": "6f0e4a6c-9d7e-4d6b-a1c3-2f6f1d1e5b10",
            "name": "vm1",
            "vcpus": 2,
            "memory_mb": 2048,
            "disk_gb": 20,
            "bridge": "br0",
            "vlan_tag": 42
        }))
        .unwrap()
    }

    fn missing(runner: &FakeRunner, name: &str) {
        runner.respond(
            &["virsh", "domstate", name],
            CommandOutput::failed(1, format!("error: failed to get domain '{name}'")),
        );
    }

    #[test]
    fn definition_is_deterministic() {
        let spec = spec();
        let disk = DiskSpec {
            kind: DiskKind::File,
            path: PathBuf::from("/var/lib/corral/images/vm1.qcow2"),
            format: "qcow2",
        };
        let a = DomainDefinition::for_instance(&spec, &disk, None, "q35", "br9").to_string();
        let b = DomainDefinition::for_instance(&spec, &disk, None, "q35", "br9").to_string();
        assert_eq!(a, b);

        let mac = mac_from_uuid(&spec.vm_uuid.unwrap());
        assert!(a.contains(&format!("<mac address='{mac}'/>")));
        assert!(a.contains("<source bridge='br0'/>"));
        assert!(a.contains("<tag id='42'/>"));
        assert!(a.contains("<memory unit='MiB'>2048</memory>"));
        assert!(a.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(a.contains("<serial type='pty'>"));
        assert!(a.contains("<graphics type='vnc'"));
        assert!(!a.contains("device='cdrom'"));
    }

    #[test]
    fn cdrom_boots_first() {
        let spec = spec();
        let disk = DiskSpec {
            kind: DiskKind::Block,
            path: PathBuf::from("/dev/vg0/vm1"),
            format: "raw",
        };
        let iso = PathBuf::from("/srv/iso/debian & friends.iso");
        let xml =
            DomainDefinition::for_instance(&spec, &disk, Some(&iso), "q35", "br0").to_string();
        let cdrom_boot = xml.find("<boot dev='cdrom'/>").unwrap();
        let hd_boot = xml.find("<boot dev='hd'/>").unwrap();
        assert!(cdrom_boot < hd_boot);
        assert!(xml.contains("<source file='/srv/iso/debian &amp; friends.iso'/>"));
        assert!(xml.contains("<source dev='/dev/vg0/vm1'/>"));
        assert!(xml.contains("<readonly/>"));
    }

    #[test]
    fn domiflist_parsing() {
        let output = " Interface   Type     Source   Model    MAC\n\
                      -------------------------------------------------------------\n \
                      vnet3       bridge   br0      virtio   02:aa:bb:cc:dd:ee\n";
        assert_eq!(parse_domiflist(output).as_deref(), Some("vnet3"));

        let output = " Interface   Type     Source   Model    MAC\n\
                      ----------------------------------------------\n \
                      -           bridge   br0      virtio   02:aa:bb:cc:dd:ee\n";
        assert_eq!(parse_domiflist(output), None);
    }

    #[tokio::test]
    async fn create_defines_and_starts() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        missing(&runner, "vm1");
        let kvm = Kvm::new(runner.clone(), &config(dir.path()));

        let log = kvm.create(&spec()).await.unwrap();
        assert!(log.contains("created domain vm1"));

        let xml_path = dir.path().join("state/domains/vm1.xml");
        assert!(xml_path.exists());
        let lines = runner.lines();
        assert_eq!(lines[0], "virsh domstate vm1");
        assert!(lines[1].starts_with("qemu-img create -f qcow2"));
        assert_eq!(lines[2], format!("virsh define {}", xml_path.display()));
        assert_eq!(lines[3], "virsh start vm1");
    }

    #[tokio::test]
    async fn create_refuses_existing_domain() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["virsh", "domstate"], CommandOutput::ok("running\n"));
        let kvm = Kvm::new(runner.clone(), &config(dir.path()));

        let err = kvm.create(&spec()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyExists { .. }));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn action_on_missing_domain_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        missing(&runner, "ghost");
        let kvm = Kvm::new(runner.clone(), &config(dir.path()));

        let err = kvm.start("ghost").await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound { .. }));
        assert!(!runner.ran("virsh start"));
    }

    #[tokio::test]
    async fn stop_forces_off_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["virsh", "domstate"], CommandOutput::ok("running\n"));
        let kvm = Kvm::new(runner.clone(), &config(dir.path()));

        let log = kvm.stop("vm1").await.unwrap();
        assert_eq!(log, "domain vm1 forced off");
        assert!(runner.ran("virsh shutdown vm1"));
        assert!(runner.ran("virsh destroy vm1"));
    }

    #[tokio::test]
    async fn stop_waits_for_graceful_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond_seq(
            &["virsh", "domstate"],
            vec![
                CommandOutput::ok("running\n"),
                CommandOutput::ok("running\n"),
                CommandOutput::ok("shut off\n"),
            ],
        );
        let mut config = config(dir.path());
        config.lifecycle.stop_timeout = TimeDelta::seconds(30);
        config.lifecycle.stop_poll_interval = TimeDelta::milliseconds(1);
        let kvm = Kvm::new(runner.clone(), &config);

        let log = kvm.stop("vm1").await.unwrap();
        assert_eq!(log, "domain vm1 shut down gracefully");
        assert!(!runner.ran("virsh destroy"));
    }

    #[tokio::test]
    async fn delete_continues_past_failed_stop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["virsh", "destroy"],
            CommandOutput::failed(1, "error: Requested operation is not valid: domain is not running"),
        );
        let kvm = Kvm::new(runner.clone(), &config(dir.path()));

        let report = kvm.delete("vm1", &StoragePoolSpec::default()).await;
        assert_eq!(report.outcome(), Ok(()));
        assert!(report.log().contains("force stop: failed"));
        assert!(runner.ran("virsh undefine vm1"));
    }

    #[tokio::test]
    async fn live_resize_of_qcow2_goes_through_libvirt() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["virsh", "domstate"], CommandOutput::ok("running\n"));
        let kvm = Kvm::new(runner.clone(), &config(dir.path()));

        kvm.resize_disk("vm1", 40, &StoragePoolSpec::default())
            .await
            .unwrap();
        assert!(!runner.ran("qemu-img resize"));
        assert!(runner.ran(&format!(
            "virsh blockresize vm1 {} 40G",
            dir.path().join("images/vm1.qcow2").display()
        )));
    }
}
