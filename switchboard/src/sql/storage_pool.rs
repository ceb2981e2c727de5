use corral_rs::storage::{StoragePoolSpec, StorageSpecError};
use sqlx::PgExecutor;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqlStoragePool {
    pub id: i64,
    pub node_id: Option<Uuid>,
    pub name: String,
    pub driver: String,
    pub config: serde_json::Value,
}

impl SqlStoragePool {
    pub fn spec(&self) -> Result<StoragePoolSpec, StorageSpecError> {
        StoragePoolSpec::from_parts(&self.driver, self.config.clone())
    }

    /// Pools without a node are usable on every node.
    pub fn usable_on(&self, node_id: Uuid) -> bool {
        self.node_id.map_or(true, |owner| owner == node_id)
    }
}

pub async fn fetch(
    pool_id: i64,
    conn: impl PgExecutor<'_>,
) -> Result<Option<SqlStoragePool>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select id, node_id, name, driver, config
        from corral.storage_pools
        where id = $1
        "#,
    )
    .bind(pool_id)
    .fetch_optional(conn)
    .await
}
