use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

/// Token material of one node, as needed to verify a presented token.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeCredentials {
    pub id: Uuid,
    pub token: Option<String>,
    pub token_hash: Option<String>,
    pub token_old_hash: Option<String>,
    pub token_rotated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqlNode {
    pub id: Uuid,
    pub name: String,
    pub management_url: Option<String>,
    pub bridge: String,
    pub last_seen: Option<DateTime<Utc>>,
}

pub async fn fetch_credentials(
    conn: impl PgExecutor<'_>,
) -> Result<Vec<NodeCredentials>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select id, token, token_hash, token_old_hash, token_rotated_at
        from corral.nodes
        where token is not null or token_hash is not null or token_old_hash is not null
        order by id
        "#,
    )
    .fetch_all(conn)
    .await
}

pub async fn fetch(node_id: Uuid, conn: impl PgExecutor<'_>) -> Result<Option<SqlNode>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select id, name, management_url, bridge, last_seen
        from corral.nodes
        where id = $1
        "#,
    )
    .bind(node_id)
    .fetch_optional(conn)
    .await
}

/// Insert a node with a hashed token. Returns `false` if the name is taken.
pub async fn insert(
    node_id: Uuid,
    name: &str,
    management_url: Option<&str>,
    bridge: &str,
    token_hash: &str,
    conn: impl PgExecutor<'_>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        insert into corral.nodes (id, name, management_url, bridge, token_hash)
        values ($1, $2, $3, $4, $5)
        on conflict (name) do nothing
        "#,
    )
    .bind(node_id)
    .bind(name)
    .bind(management_url)
    .bind(bridge)
    .bind(token_hash)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn upgrade_legacy_token(
    node_id: Uuid,
    token_hash: &str,
    conn: impl PgExecutor<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        update corral.nodes
        set token_hash = $2, token = null
        where id = $1 and token is not null
        "#,
    )
    .bind(node_id)
    .bind(token_hash)
    .execute(conn)
    .await?;
    Ok(())
}

/// Install `token_hash` as the current hash, keeping the previous one for the grace window.
/// Returns `false` if the node does not exist.
pub async fn rotate_token(
    node_id: Uuid,
    token_hash: &str,
    rotated_at: DateTime<Utc>,
    conn: impl PgExecutor<'_>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        update corral.nodes
        set token_old_hash = token_hash, token_hash = $2, token_rotated_at = $3, token = null
        where id = $1
        "#,
    )
    .bind(node_id)
    .bind(token_hash)
    .bind(rotated_at)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn touch(node_id: Uuid, conn: impl PgExecutor<'_>) -> Result<(), sqlx::Error> {
    sqlx::query("update corral.nodes set last_seen = now() where id = $1")
        .bind(node_id)
        .execute(conn)
        .await?;
    Ok(())
}
