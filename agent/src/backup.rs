//! Backup creation, deletion and restore.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{event, instrument, Level};

use corral_rs::backup::{BackupArtifact, BackupCreated, BackupKind, BackupsDeleted};
use corral_rs::instance::InstanceType;
use corral_rs::job::{BackupCreate, RestoreAsNew};
use corral_rs::storage::StoragePoolSpec;
use corral_rs::util::hex_slice::HexSlice;

use crate::config::PathsConfig;
use crate::exec::{CommandRunner, ExecError, Invocation};
use crate::lifecycle::{Kvm, LifecycleError};
use crate::object_store::{backup_key, ObjectStore, ObjectStoreError};
use crate::storage::{driver_for, StorageError};

const ZFS_STREAM_EXTENSION: &str = "zfs";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup of {0:?} needs the instance's vm_uuid")]
    MissingUuid(String),
    #[error("storage tier {0} requested but no object store is configured")]
    NoObjectStore(&'static str),
    #[error("{0} is not supported")]
    Unsupported(&'static str),
    #[error("backup source {0:?} does not exist")]
    SourceMissing(PathBuf),
    #[error("target disk {0:?} already exists")]
    AlreadyExists(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Command(#[from] ExecError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

pub fn backup_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d-%H%M%S").to_string()
}

/// Lower-case hex SHA-256 and size of a file, read in chunks.
pub async fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let digest = hasher.finalize();
    Ok((format!("{}", HexSlice(&digest[..])), size))
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Whether `path` names a file strictly below `dir`. Any `..`, `.` or root component after the
/// prefix disqualifies it, since `starts_with` compares components lexically.
fn is_below(path: &Path, dir: &Path) -> bool {
    match path.strip_prefix(dir) {
        Ok(rest) => {
            let mut components = rest.components().peekable();
            components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
        }
        Err(_) => false,
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub struct BackupEngine {
    runner: Arc<dyn CommandRunner>,
    paths: PathsConfig,
    store: Option<Arc<dyn ObjectStore>>,
}

impl BackupEngine {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        paths: PathsConfig,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        BackupEngine {
            runner,
            paths,
            store,
        }
    }

    /// Convert (or stream) the instance's disk into the backup directory,
    /// checksum it and ship it to the requested tier.
    #[instrument(skip(self, request), fields(name = %request.instance.name))]
    pub async fn create(
        &self,
        request: &BackupCreate,
        now: DateTime<Utc>,
    ) -> Result<BackupCreated, BackupError> {
        let instance = &request.instance;
        let vm_uuid = instance
            .vm_uuid
            .ok_or_else(|| BackupError::MissingUuid(instance.name.clone()))?;
        let store = match (request.tier.has_remote_copy(), &self.store) {
            (true, None) => return Err(BackupError::NoObjectStore(request.tier.as_str())),
            (true, Some(store)) => Some(store),
            (false, _) => None,
        };

        let pool = request.storage.clone().unwrap_or_default();
        let stamp = backup_stamp(now);
        let dir = self.paths.backup_dir.join(vm_uuid.to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        let (kind, path) = match &pool {
            StoragePoolSpec::Zfs(zfs) => {
                let path = dir.join(format!("{}-{stamp}.{ZFS_STREAM_EXTENSION}", instance.name));
                let snapshot = format!("{}@backup-{stamp}", zfs.volume(&instance.name));
                self.zfs_send(&snapshot, &path).await?;
                (BackupKind::ZfsSend, path)
            }
            StoragePoolSpec::Qcow2(_) if instance.instance_type == InstanceType::Lxc => {
                return Err(BackupError::Unsupported("backing up directory-backed containers"));
            }
            StoragePoolSpec::Qcow2(_) | StoragePoolSpec::Lvmthin(_) => {
                let path = dir.join(format!("{}-{stamp}.qcow2", instance.name));
                let disk = driver_for(&pool, self.runner.clone(), &self.paths.images_dir)
                    .locate(&instance.name);
                let mut args = vec!["convert".to_string()];
                if disk.format == "qcow2" {
                    // Read while the guest holds its write lock.
                    args.push("-U".to_string());
                } else {
                    args.extend(["-f".to_string(), disk.format.to_string()]);
                }
                args.extend([
                    "-O".to_string(),
                    "qcow2".to_string(),
                    path_arg(&disk.path),
                    path_arg(&path),
                ]);
                if let Err(e) = self.runner.checked(Invocation::new("qemu-img", args)).await {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(e.into());
                }
                (BackupKind::Qcow2, path)
            }
        };

        let (checksum, size_bytes) = sha256_file(&path).await.map_err(io_error(&path))?;

        let object_key = match store {
            Some(store) => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let key = backup_key(&vm_uuid, &file_name);
                store.put(&path, &key).await?;
                if !request.tier.has_local_copy() {
                    tokio::fs::remove_file(&path).await.map_err(io_error(&path))?;
                }
                Some(key)
            }
            None => None,
        };

        event!(Level::INFO, ?path, size_bytes, tier = request.tier.as_str(), "Backup created");
        Ok(BackupCreated {
            kind,
            path,
            size_bytes,
            checksum,
            tier: request.tier,
            object_key,
            created_at: now,
        })
    }

    async fn zfs_send(&self, snapshot: &str, path: &Path) -> Result<(), BackupError> {
        self.runner
            .checked(Invocation::new("zfs", ["snapshot", snapshot]))
            .await?;
        let sent = self
            .runner
            .checked(Invocation::new("zfs", ["send", snapshot]).stdout_to(path))
            .await;

        let destroyed = self.runner.exec("zfs", &["destroy", snapshot]).await;
        if !destroyed.success() {
            event!(Level::WARN, snapshot, error = destroyed.diagnostic(), "Failed to destroy backup snapshot");
        }

        if let Err(e) = sent {
            let _ = tokio::fs::remove_file(path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove backup files and objects. Returns the ids that are fully gone
    /// and one message per failure; one failure does not stop the others.
    #[instrument(skip(self, artifacts), fields(count = artifacts.len()))]
    pub async fn delete(&self, artifacts: &[BackupArtifact]) -> (BackupsDeleted, Vec<String>) {
        let mut deleted = BackupsDeleted::default();
        let mut errors = Vec::new();

        for artifact in artifacts {
            let mut ok = true;

            if let Some(path) = &artifact.path {
                if !is_below(path, &self.paths.backup_dir) {
                    errors.push(format!(
                        "backup {}: refusing to delete {} outside {}",
                        artifact.id,
                        path.display(),
                        self.paths.backup_dir.display()
                    ));
                    ok = false;
                } else {
                    match tokio::fs::remove_file(path).await {
                        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                            errors.push(format!("backup {}: {}: {e}", artifact.id, path.display()));
                            ok = false;
                        }
                        _ => {}
                    }
                }
            }

            if let Some(key) = &artifact.object_key {
                match &self.store {
                    Some(store) => {
                        if let Err(e) = store.delete(key).await {
                            errors.push(format!("backup {}: {e}", artifact.id));
                            ok = false;
                        }
                    }
                    None => {
                        errors.push(format!(
                            "backup {}: object {key} cannot be deleted without an object store",
                            artifact.id
                        ));
                        ok = false;
                    }
                }
            }

            if ok {
                deleted.ids.push(artifact.id);
            }
        }

        for error in &errors {
            event!(Level::WARN, %error, "Backup deletion failed");
        }
        (deleted, errors)
    }

    /// Copy a qcow2 backup onto a new disk and boot a new domain from it.
    #[instrument(skip(self, kvm, request), fields(name = %request.instance.name))]
    pub async fn restore_as_new(&self, kvm: &Kvm, request: &RestoreAsNew) -> Result<String, BackupError> {
        let instance = &request.instance;
        if instance.instance_type == InstanceType::Lxc {
            return Err(BackupError::Unsupported("restoring backups as containers"));
        }
        if request
            .source
            .extension()
            .is_some_and(|ext| ext == ZFS_STREAM_EXTENSION)
        {
            return Err(BackupError::Unsupported("restoring zfs send streams as new instances"));
        }
        if !tokio::fs::try_exists(&request.source).await.unwrap_or(false) {
            return Err(BackupError::SourceMissing(request.source.clone()));
        }

        let pool = instance.storage.clone().unwrap_or_default();
        let driver = driver_for(&pool, self.runner.clone(), &self.paths.images_dir);
        let disk = match &pool {
            StoragePoolSpec::Qcow2(_) => {
                // A full copy, not an overlay: the backup may be pruned later.
                let disk = driver.locate(&instance.name);
                if tokio::fs::try_exists(&disk.path).await.unwrap_or(false) {
                    return Err(BackupError::AlreadyExists(disk.path));
                }
                if let Some(parent) = disk.path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io_error(parent))?;
                }
                self.runner
                    .checked(Invocation::new(
                        "qemu-img",
                        [
                            "convert".to_string(),
                            "-O".to_string(),
                            "qcow2".to_string(),
                            path_arg(&request.source),
                            path_arg(&disk.path),
                        ],
                    ))
                    .await?;
                disk
            }
            StoragePoolSpec::Lvmthin(_) | StoragePoolSpec::Zfs(_) => {
                driver
                    .create(&instance.name, instance.disk_gb, Some(&request.source))
                    .await?
            }
        };

        kvm.define_and_start(instance, &disk).await?;
        Ok(format!(
            "restored {} as new domain {} on {}",
            request.source.display(),
            instance.name,
            disk.path.display()
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::exec::CommandOutput;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use corral_rs::backup::StorageTier;
    use corral_rs::instance::InstanceRef;
    use corral_rs::storage::ZfsPool;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct MemoryStore {
        puts: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(&self, _local: &Path, key: &str) -> Result<(), ObjectStoreError> {
            self.puts.lock().unwrap().push(key.to_string());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
            self.deletes.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    fn request(tier: StorageTier, storage: Option<StoragePoolSpec>) -> BackupCreate {
        BackupCreate {
            instance: InstanceRef {
                vm_uuid: Some(Uuid::parse_str("3c1b2a9e-6f2d-4b8a-9c3e-7d6e5f4a3b2c").unwrap()),
                name: "vm1".into(),
                instance_type: InstanceType::Kvm,
            },
            storage,
            tier,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[tokio::test]
    async fn checksum_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let (sum, size) = sha256_file(&path).await.unwrap();
        assert_eq!(sum, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(size, 3);
    }

    #[tokio::test]
    async fn qcow2_backup_to_s3_removes_local_copy() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig::under(dir.path());
        let runner = Arc::new(FakeRunner::new());
        // Stand in for qemu-img writing the destination.
        let expected = paths
            .backup_dir
            .join("3c1b2a9e-6f2d-4b8a-9c3e-7d6e5f4a3b2c/vm1-20240309-140507.qcow2");
        std::fs::create_dir_all(expected.parent().unwrap()).unwrap();
        std::fs::write(&expected, b"image").unwrap();

        let store = Arc::new(MemoryStore::default());
        let engine = BackupEngine::new(runner.clone(), paths.clone(), Some(store.clone()));
        let created = engine
            .create(&request(StorageTier::S3, None), now())
            .await
            .unwrap();

        assert_eq!(created.kind, BackupKind::Qcow2);
        assert_eq!(created.path, expected);
        assert_eq!(created.size_bytes, 5);
        assert_eq!(
            created.object_key.as_deref(),
            Some("3c1b2a9e-6f2d-4b8a-9c3e-7d6e5f4a3b2c/vm1-20240309-140507.qcow2")
        );
        assert!(!expected.exists());
        assert!(runner.lines()[0].starts_with("qemu-img convert -U -O qcow2 "));
        assert_eq!(store.puts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remote_tier_without_store_fails_first() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let engine = BackupEngine::new(runner.clone(), PathsConfig::under(dir.path()), None);
        let err = engine
            .create(&request(StorageTier::Hybrid, None), now())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NoObjectStore("hybrid")));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn zfs_backup_streams_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["zfs", "send"], CommandOutput::ok("stream-bytes"));
        let engine = BackupEngine::new(runner.clone(), PathsConfig::under(dir.path()), None);
        let pool = StoragePoolSpec::Zfs(ZfsPool {
            pool: "tank".into(),
            dataset: "vms".into(),
        });

        let created = engine
            .create(&request(StorageTier::Local, Some(pool)), now())
            .await
            .unwrap();
        assert_eq!(created.kind, BackupKind::ZfsSend);
        assert_eq!(created.size_bytes, "stream-bytes".len() as u64);
        assert_eq!(
            runner.lines(),
            vec![
                "zfs snapshot tank/vms/vm1@backup-20240309-140507",
                "zfs send tank/vms/vm1@backup-20240309-140507",
                "zfs destroy tank/vms/vm1@backup-20240309-140507",
            ]
        );
        assert_eq!(runner.calls()[1].stdout_file.as_ref(), Some(&created.path));
    }

    #[tokio::test]
    async fn delete_reports_partial_success() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig::under(dir.path());
        std::fs::create_dir_all(&paths.backup_dir).unwrap();
        let present = paths.backup_dir.join("a.qcow2");
        std::fs::write(&present, b"x").unwrap();

        let store = Arc::new(MemoryStore::default());
        let engine = BackupEngine::new(Arc::new(FakeRunner::new()), paths.clone(), Some(store.clone()));
        let (deleted, errors) = engine
            .delete(&[
                BackupArtifact {
                    id: 1,
                    path: Some(present.clone()),
                    object_key: Some("k1".into()),
                },
                BackupArtifact {
                    id: 2,
                    path: Some(paths.backup_dir.join("already-gone.qcow2")),
                    object_key: None,
                },
                BackupArtifact {
                    id: 3,
                    path: Some(PathBuf::from("/etc/passwd")),
                    object_key: None,
                },
            ])
            .await;

        assert_eq!(deleted.ids, vec![1, 2]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("backup 3: refusing"));
        assert!(!present.exists());
        assert_eq!(*store.deletes.lock().unwrap(), vec!["k1".to_string()]);
    }

    #[tokio::test]
    async fn delete_refuses_to_escape_backup_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig::under(dir.path());
        std::fs::create_dir_all(&paths.backup_dir).unwrap();
        let outside = dir.path().join("outside.qcow2");
        std::fs::write(&outside, b"keep me").unwrap();
        let escaping = paths.backup_dir.join("..").join("outside.qcow2");
        assert!(escaping.starts_with(&paths.backup_dir));

        let engine = BackupEngine::new(Arc::new(FakeRunner::new()), paths.clone(), None);
        let (deleted, errors) = engine
            .delete(&[
                BackupArtifact {
                    id: 1,
                    path: Some(escaping),
                    object_key: None,
                },
                BackupArtifact {
                    id: 2,
                    path: Some(paths.backup_dir.clone()),
                    object_key: None,
                },
            ])
            .await;

        assert!(deleted.ids.is_empty());
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("backup 1: refusing"));
        assert!(outside.exists());
    }

    #[test]
    fn below_requires_normal_components() {
        let dir = Path::new("/var/backups/corral");
        assert!(is_below(Path::new("/var/backups/corral/u/vm1.qcow2"), dir));
        assert!(!is_below(Path::new("/var/backups/corral"), dir));
        assert!(!is_below(Path::new("/var/backups/corral/../etc/passwd"), dir));
        assert!(!is_below(Path::new("/var/backups/corral/u/./../../x"), dir));
        assert!(!is_below(Path::new("/var/backups/corral2/x"), dir));
    }

    #[tokio::test]
    async fn zfs_streams_cannot_be_restored_as_new() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let mut config: crate::config::AgentConfig = toml::from_str(
            "[controller]\nurl = \"http://localhost\"\ntoken = \"t\"\n",
        )
        .unwrap();
        config.paths = PathsConfig::under(dir.path());
        let kvm = Kvm::new(runner.clone(), &config);
        let engine = BackupEngine::new(runner.clone(), config.paths.clone(), None);

        let request: RestoreAsNew = serde_json::from_value(serde_json::json!({
            "source": "/var/backups/corral/x/vm1-20240101-000000.zfs",
            "name": "vm2", "vcpus": 1, "memory_mb": 512, "disk_gb": 10
        }))
        .unwrap();
        let err = engine.restore_as_new(&kvm, &request).await.unwrap_err();
        assert!(matches!(err, BackupError::Unsupported(_)));
        assert!(runner.calls().is_empty());
    }
}
