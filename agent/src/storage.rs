//! Storage drivers: a VM disk on a qcow2 file, an LVM thin volume or a ZFS
//! zvol, behind one [`StorageDriver`] contract.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, instrument, Level};

use corral_rs::storage::{LvmThinPool, StorageDriverKind, StoragePoolSpec, ZfsPool};

use crate::exec::{CommandRunner, ExecError, Invocation};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("disk {0:?} already exists")]
    AlreadyExists(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot determine the image format of {path:?}: {reason}")]
    UnknownFormat { path: PathBuf, reason: String },
    #[error(transparent)]
    Command(#[from] ExecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    /// A regular file, attached as `<disk type='file'>`.
    File,
    /// A block device node, attached as `<disk type='block'>`.
    Block,
}

/// Where a VM's disk lives and how to attach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub kind: DiskKind,
    pub path: PathBuf,
    /// Image format as understood by qemu (`qcow2` or `raw`).
    pub format: &'static str,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn kind(&self) -> StorageDriverKind;

    /// The disk an instance called `name` has (or would have) on this pool.
    fn locate(&self, name: &str) -> DiskSpec;

    /// Create the disk, as a copy-on-write child or copy of `base` if given.
    async fn create(
        &self,
        name: &str,
        size_gb: u64,
        base: Option<&Path>,
    ) -> Result<DiskSpec, StorageError>;

    /// Grow the disk to `size_gb`. Does not notify a running guest.
    async fn resize(&self, name: &str, size_gb: u64) -> Result<DiskSpec, StorageError>;

    async fn destroy(&self, name: &str) -> Result<(), StorageError>;

    /// Take a point-in-time snapshot called `snapshot` of the disk and
    /// return a description of where it lives.
    async fn snapshot(&self, name: &str, snapshot: &str) -> Result<String, StorageError>;
}

/// Pick the driver for a pool description.
pub fn driver_for(
    spec: &StoragePoolSpec,
    runner: Arc<dyn CommandRunner>,
    images_dir: &Path,
) -> Box<dyn StorageDriver> {
    match spec {
        StoragePoolSpec::Qcow2(pool) => Box::new(Qcow2Driver {
            runner,
            dir: pool.dir.clone().unwrap_or_else(|| images_dir.to_path_buf()),
        }),
        StoragePoolSpec::Lvmthin(pool) => Box::new(LvmThinDriver {
            runner,
            pool: pool.clone(),
        }),
        StoragePoolSpec::Zfs(pool) => Box::new(ZfsDriver {
            runner,
            pool: pool.clone(),
        }),
    }
}

fn gigabytes(size_gb: u64) -> String {
    format!("{size_gb}G")
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[derive(Deserialize)]
struct ImageInfo {
    format: String,
}

/// On-disk format of an image, as reported by `qemu-img info`.
async fn image_format(runner: &dyn CommandRunner, image: &Path) -> Result<String, StorageError> {
    let output = runner
        .checked(Invocation::new(
            "qemu-img",
            [
                "info".to_string(),
                "-U".to_string(),
                "--output=json".to_string(),
                path_arg(image),
            ],
        ))
        .await?;
    let unknown = |reason: String| StorageError::UnknownFormat {
        path: image.to_path_buf(),
        reason,
    };
    let info: ImageInfo = serde_json::from_str(&output.stdout).map_err(|e| unknown(e.to_string()))?;
    if info.format.is_empty() || !info.format.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(unknown(format!("unexpected format {:?}", info.format)));
    }
    Ok(info.format)
}

/// Copy `base` onto an existing raw device.
async fn write_base_image(
    runner: &dyn CommandRunner,
    base: &Path,
    device: &Path,
) -> Result<(), ExecError> {
    runner
        .checked(Invocation::new(
            "qemu-img",
            [
                "convert".to_string(),
                "-n".to_string(),
                "-O".to_string(),
                "raw".to_string(),
                path_arg(base),
                path_arg(device),
            ],
        ))
        .await?;
    Ok(())
}

pub struct Qcow2Driver {
    runner: Arc<dyn CommandRunner>,
    dir: PathBuf,
}

#[async_trait]
impl StorageDriver for Qcow2Driver {
    fn kind(&self) -> StorageDriverKind {
        StorageDriverKind::Qcow2
    }

    fn locate(&self, name: &str) -> DiskSpec {
        DiskSpec {
            kind: DiskKind::File,
            path: self.dir.join(format!("{name}.qcow2")),
            format: "qcow2",
        }
    }

    #[instrument(skip(self))]
    async fn create(
        &self,
        name: &str,
        size_gb: u64,
        base: Option<&Path>,
    ) -> Result<DiskSpec, StorageError> {
        let disk = self.locate(name);
        if tokio::fs::try_exists(&disk.path).await.unwrap_or(false) {
            return Err(StorageError::AlreadyExists(disk.path));
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StorageError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let mut args = vec!["create".to_string(), "-f".to_string(), "qcow2".to_string()];
        if let Some(base) = base {
            let base_format = image_format(self.runner.as_ref(), base).await?;
            args.extend([
                "-F".to_string(),
                base_format,
                "-b".to_string(),
                path_arg(base),
            ]);
        }
        args.push(path_arg(&disk.path));
        args.push(gigabytes(size_gb));

        event!(Level::DEBUG, path = ?disk.path, ?base, "Creating qcow2 disk");
        self.runner.checked(Invocation::new("qemu-img", args)).await?;
        Ok(disk)
    }

    async fn resize(&self, name: &str, size_gb: u64) -> Result<DiskSpec, StorageError> {
        let disk = self.locate(name);
        self.runner
            .checked(Invocation::new(
                "qemu-img",
                ["resize".to_string(), path_arg(&disk.path), gigabytes(size_gb)],
            ))
            .await?;
        Ok(disk)
    }

    async fn destroy(&self, name: &str) -> Result<(), StorageError> {
        let disk = self.locate(name);
        match tokio::fs::remove_file(&disk.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                event!(Level::DEBUG, path = ?disk.path, "Disk already absent");
                Ok(())
            }
            Err(source) => Err(StorageError::Io {
                path: disk.path,
                source,
            }),
        }
    }

    /// Internal qcow2 snapshot through libvirt, which also works while the
    /// domain holds the image open.
    async fn snapshot(&self, name: &str, snapshot: &str) -> Result<String, StorageError> {
        self.runner
            .checked(Invocation::new(
                "virsh",
                [
                    "snapshot-create-as".to_string(),
                    "--domain".to_string(),
                    name.to_string(),
                    "--name".to_string(),
                    snapshot.to_string(),
                    "--atomic".to_string(),
                ],
            ))
            .await?;
        Ok(format!("{} snapshot {snapshot}", self.locate(name).path.display()))
    }
}

pub struct LvmThinDriver {
    runner: Arc<dyn CommandRunner>,
    pool: LvmThinPool,
}

impl LvmThinDriver {
    fn lv(&self, name: &str) -> String {
        format!("{}/{}", self.pool.vg, name)
    }
}

#[async_trait]
impl StorageDriver for LvmThinDriver {
    fn kind(&self) -> StorageDriverKind {
        StorageDriverKind::Lvmthin
    }

    fn locate(&self, name: &str) -> DiskSpec {
        DiskSpec {
            kind: DiskKind::Block,
            path: PathBuf::from(format!("/dev/{}/{}", self.pool.vg, name)),
            format: "raw",
        }
    }

    #[instrument(skip(self))]
    async fn create(
        &self,
        name: &str,
        size_gb: u64,
        base: Option<&Path>,
    ) -> Result<DiskSpec, StorageError> {
        let thinpool = format!("{}/{}", self.pool.vg, self.pool.thinpool);
        self.runner
            .checked(Invocation::new(
                "lvcreate",
                [
                    "-y".to_string(),
                    "-T".to_string(),
                    thinpool,
                    "-V".to_string(),
                    gigabytes(size_gb),
                    "-n".to_string(),
                    name.to_string(),
                ],
            ))
            .await?;

        let disk = self.locate(name);
        if let Some(base) = base {
            write_base_image(self.runner.as_ref(), base, &disk.path).await?;
        }
        Ok(disk)
    }

    async fn resize(&self, name: &str, size_gb: u64) -> Result<DiskSpec, StorageError> {
        self.runner
            .checked(Invocation::new(
                "lvextend",
                ["-L".to_string(), gigabytes(size_gb), self.lv(name)],
            ))
            .await?;
        Ok(self.locate(name))
    }

    async fn destroy(&self, name: &str) -> Result<(), StorageError> {
        self.runner
            .checked(Invocation::new("lvremove", ["-y".to_string(), self.lv(name)]))
            .await?;
        Ok(())
    }

    async fn snapshot(&self, name: &str, snapshot: &str) -> Result<String, StorageError> {
        let snapshot_lv = format!("{name}-{snapshot}");
        self.runner
            .checked(Invocation::new(
                "lvcreate",
                [
                    "-s".to_string(),
                    "-n".to_string(),
                    snapshot_lv.clone(),
                    self.lv(name),
                ],
            ))
            .await?;
        Ok(self.lv(&snapshot_lv))
    }
}

pub struct ZfsDriver {
    runner: Arc<dyn CommandRunner>,
    pool: ZfsPool,
}

#[async_trait]
impl StorageDriver for ZfsDriver {
    fn kind(&self) -> StorageDriverKind {
        StorageDriverKind::Zfs
    }

    fn locate(&self, name: &str) -> DiskSpec {
        DiskSpec {
            kind: DiskKind::Block,
            path: PathBuf::from(format!("/dev/zvol/{}", self.pool.volume(name))),
            format: "raw",
        }
    }

    #[instrument(skip(self))]
    async fn create(
        &self,
        name: &str,
        size_gb: u64,
        base: Option<&Path>,
    ) -> Result<DiskSpec, StorageError> {
        self.runner
            .checked(Invocation::new(
                "zfs",
                [
                    "create".to_string(),
                    "-p".to_string(),
                    "-V".to_string(),
                    gigabytes(size_gb),
                    self.pool.volume(name),
                ],
            ))
            .await?;

        let disk = self.locate(name);
        if let Some(base) = base {
            write_base_image(self.runner.as_ref(), base, &disk.path).await?;
        }
        Ok(disk)
    }

    async fn resize(&self, name: &str, size_gb: u64) -> Result<DiskSpec, StorageError> {
        self.runner
            .checked(Invocation::new(
                "zfs",
                [
                    "set".to_string(),
                    format!("volsize={}", gigabytes(size_gb)),
                    self.pool.volume(name),
                ],
            ))
            .await?;
        Ok(self.locate(name))
    }

    async fn destroy(&self, name: &str) -> Result<(), StorageError> {
        // -R takes the backup snapshots (and their clones) with it.
        self.runner
            .checked(Invocation::new(
                "zfs",
                ["destroy".to_string(), "-R".to_string(), self.pool.volume(name)],
            ))
            .await?;
        Ok(())
    }

    async fn snapshot(&self, name: &str, snapshot: &str) -> Result<String, StorageError> {
        let target = format!("{}@{snapshot}", self.pool.volume(name));
        self.runner
            .checked(Invocation::new("zfs", ["snapshot".to_string(), target.clone()]))
            .await?;
        Ok(target)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::exec::CommandOutput;
    use corral_rs::storage::Qcow2Pool;

    fn zfs() -> StoragePoolSpec {
        StoragePoolSpec::Zfs(ZfsPool {
            pool: "tank".into(),
            dataset: "vms".into(),
        })
    }

    fn lvm() -> StoragePoolSpec {
        StoragePoolSpec::Lvmthin(LvmThinPool {
            vg: "vg0".into(),
            thinpool: "thin".into(),
        })
    }

    #[tokio::test]
    async fn qcow2_overlay_on_base_image() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["qemu-img", "info"],
            CommandOutput::ok(r#"{"virtual-size": 2147483648, "filename": "/srv/images/debian.qcow2", "format": "qcow2"}"#),
        );
        let driver = driver_for(&StoragePoolSpec::default(), runner.clone(), dir.path());

        let disk = driver
            .create("vm1", 20, Some(Path::new("/srv/images/debian.qcow2")))
            .await
            .unwrap();
        assert_eq!(disk.kind, DiskKind::File);
        assert_eq!(disk.path, dir.path().join("vm1.qcow2"));
        assert_eq!(
            runner.lines(),
            vec![
                "qemu-img info -U --output=json /srv/images/debian.qcow2".to_string(),
                format!(
                    "qemu-img create -f qcow2 -F qcow2 -b /srv/images/debian.qcow2 {} 20G",
                    dir.path().join("vm1.qcow2").display()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn qcow2_overlay_on_raw_base_image() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["qemu-img", "info"],
            CommandOutput::ok(r#"{"virtual-size": 10737418240, "format": "raw"}"#),
        );
        let driver = driver_for(&StoragePoolSpec::default(), runner.clone(), dir.path());

        driver
            .create("vm1", 20, Some(Path::new("/srv/images/debian.img")))
            .await
            .unwrap();
        assert!(runner.ran("qemu-img create -f qcow2 -F raw -b /srv/images/debian.img "));
    }

    #[tokio::test]
    async fn unreadable_base_image_is_not_guessed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let driver = driver_for(&StoragePoolSpec::default(), runner.clone(), dir.path());

        // An empty `qemu-img info` answer carries no format.
        let err = driver
            .create("vm1", 20, Some(Path::new("/srv/images/mystery")))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownFormat { .. }));
        assert!(!runner.ran("qemu-img create"));
    }

    #[tokio::test]
    async fn snapshots_per_driver() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let qcow2 = driver_for(&StoragePoolSpec::default(), runner.clone(), dir.path());
        let lvm = driver_for(&lvm(), runner.clone(), Path::new("/unused"));
        let zfs = driver_for(&zfs(), runner.clone(), Path::new("/unused"));

        let taken = qcow2.snapshot("vm1", "before-upgrade").await.unwrap();
        assert!(taken.ends_with("vm1.qcow2 snapshot before-upgrade"));
        assert_eq!(lvm.snapshot("vm1", "s1").await.unwrap(), "vg0/vm1-s1");
        assert_eq!(zfs.snapshot("vm1", "s1").await.unwrap(), "tank/vms/vm1@s1");

        assert_eq!(
            runner.lines(),
            vec![
                "virsh snapshot-create-as --domain vm1 --name before-upgrade --atomic",
                "lvcreate -s -n vm1-s1 vg0/vm1",
                "zfs snapshot tank/vms/vm1@s1",
            ]
        );
    }

    #[tokio::test]
    async fn qcow2_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vm1.qcow2"), b"").unwrap();
        let runner = Arc::new(FakeRunner::new());
        let driver = driver_for(&StoragePoolSpec::default(), runner.clone(), dir.path());

        let err = driver.create("vm1", 10, None).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn qcow2_destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StoragePoolSpec::Qcow2(Qcow2Pool {
            dir: Some(dir.path().to_path_buf()),
        });
        let runner = Arc::new(FakeRunner::new());
        let driver = driver_for(&pool, runner, Path::new("/unused"));

        std::fs::write(dir.path().join("vm1.qcow2"), b"disk").unwrap();
        driver.destroy("vm1").await.unwrap();
        assert!(!dir.path().join("vm1.qcow2").exists());
        driver.destroy("vm1").await.unwrap();
    }

    #[tokio::test]
    async fn lvmthin_commands() {
        let runner = Arc::new(FakeRunner::new());
        let driver = driver_for(&lvm(), runner.clone(), Path::new("/unused"));

        let disk = driver
            .create("vm1", 20, Some(Path::new("/srv/base.qcow2")))
            .await
            .unwrap();
        assert_eq!(disk.path, PathBuf::from("/dev/vg0/vm1"));
        assert_eq!(disk.kind, DiskKind::Block);
        driver.resize("vm1", 40).await.unwrap();
        driver.destroy("vm1").await.unwrap();

        assert_eq!(
            runner.lines(),
            vec![
                "lvcreate -y -T vg0/thin -V 20G -n vm1",
                "qemu-img convert -n -O raw /srv/base.qcow2 /dev/vg0/vm1",
                "lvextend -L 40G vg0/vm1",
                "lvremove -y vg0/vm1",
            ]
        );
    }

    #[tokio::test]
    async fn zfs_commands() {
        let runner = Arc::new(FakeRunner::new());
        let driver = driver_for(&zfs(), runner.clone(), Path::new("/unused"));

        let disk = driver.create("vm1", 8, None).await.unwrap();
        assert_eq!(disk.path, PathBuf::from("/dev/zvol/tank/vms/vm1"));
        driver.resize("vm1", 16).await.unwrap();
        driver.destroy("vm1").await.unwrap();

        assert_eq!(
            runner.lines(),
            vec![
                "zfs create -p -V 8G tank/vms/vm1",
                "zfs set volsize=16G tank/vms/vm1",
                "zfs destroy -R tank/vms/vm1",
            ]
        );
    }

    #[tokio::test]
    async fn tool_failure_is_surfaced() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["lvcreate"],
            CommandOutput::failed(5, "  Volume group \"vg0\" has insufficient free space"),
        );
        let driver = driver_for(&lvm(), runner, Path::new("/unused"));
        let err = driver.create("vm1", 20, None).await.unwrap_err();
        assert!(err.to_string().contains("insufficient free space"));
    }
}
