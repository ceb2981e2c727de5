//! Remote copies of backups.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ObjectStoreConfig;
use crate::exec::{CommandRunner, ExecError, Invocation};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object upload failed: {0}")]
    Upload(#[source] ExecError),
    #[error("object delete failed: {0}")]
    Delete(#[source] ExecError),
}

/// Object key of a backup file: `<vm_uuid>/<file name>`, relative to the
/// store's prefix.
pub fn backup_key(vm_uuid: &Uuid, file_name: &str) -> String {
    format!("{vm_uuid}/{file_name}")
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, local: &Path, key: &str) -> Result<(), ObjectStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

/// S3-compatible storage through the `aws` CLI.
pub struct AwsCliStore {
    runner: Arc<dyn CommandRunner>,
    config: ObjectStoreConfig,
}

impl AwsCliStore {
    pub fn new(runner: Arc<dyn CommandRunner>, config: ObjectStoreConfig) -> Self {
        AwsCliStore { runner, config }
    }

    pub fn url(&self, key: &str) -> String {
        format!("s3://{}/{}{}", self.config.bucket, self.config.prefix, key)
    }

    fn invocation(&self, mut args: Vec<String>) -> Invocation {
        if let Some(endpoint) = &self.config.endpoint {
            args.push("--endpoint-url".to_string());
            args.push(endpoint.clone());
        }
        args.push("--only-show-errors".to_string());
        Invocation::new("aws", args)
    }
}

#[async_trait]
impl ObjectStore for AwsCliStore {
    async fn put(&self, local: &Path, key: &str) -> Result<(), ObjectStoreError> {
        let invocation = self.invocation(vec![
            "s3".to_string(),
            "cp".to_string(),
            local.to_string_lossy().into_owned(),
            self.url(key),
        ]);
        self.runner
            .checked(invocation)
            .await
            .map_err(ObjectStoreError::Upload)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let invocation = self.invocation(vec!["s3".to_string(), "rm".to_string(), self.url(key)]);
        self.runner
            .checked(invocation)
            .await
            .map_err(ObjectStoreError::Delete)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::fake::FakeRunner;

    #[tokio::test]
    async fn cli_arguments() {
        let runner = Arc::new(FakeRunner::new());
        let store = AwsCliStore::new(
            runner.clone(),
            ObjectStoreConfig {
                bucket: "backups".into(),
                endpoint: Some("https://s3.example.net".into()),
                prefix: "node1/".into(),
            },
        );
        let vm = Uuid::nil();
        let key = backup_key(&vm, "vm1-20240101-000000.qcow2");
        store.put(Path::new("/var/backups/x.qcow2"), &key).await.unwrap();
        store.delete(&key).await.unwrap();

        assert_eq!(
            runner.lines(),
            vec![
                format!("aws s3 cp /var/backups/x.qcow2 s3://backups/node1/{vm}/vm1-20240101-000000.qcow2 --endpoint-url https://s3.example.net --only-show-errors"),
                format!("aws s3 rm s3://backups/node1/{vm}/vm1-20240101-000000.qcow2 --endpoint-url https://s3.example.net --only-show-errors"),
            ]
        );
    }
}
