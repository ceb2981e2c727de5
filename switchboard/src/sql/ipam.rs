use corral_rs::api::admin::IpRangeRef;
use ipnetwork::IpNetwork;
use sqlx::{PgExecutor, Postgres, Transaction};
use std::net::IpAddr;
use uuid::Uuid;

use super::host_network;

/// Table holding the range definition, and the `ip_allocations` column pointing at it.
fn range_table(range: IpRangeRef) -> (&'static str, &'static str, i64) {
    match range {
        IpRangeRef::Pool(id) => ("corral.ip_pools", "pool_id", id),
        IpRangeRef::Subnet(id) => ("corral.subnets", "subnet_id", id),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqlRange {
    pub cidr: IpNetwork,
    pub gateway: Option<IpNetwork>,
}

/// Lock a pool or subnet row so scans of the same range serialize behind each other.
pub async fn lock_range(
    range: IpRangeRef,
    conn: &mut Transaction<'_, Postgres>,
) -> Result<Option<SqlRange>, sqlx::Error> {
    let (table, _, id) = range_table(range);
    sqlx::query_as(&format!(
        "select cidr, gateway from {table} where id = $1 for update"
    ))
    .bind(id)
    .fetch_optional(conn.as_mut())
    .await
}

pub async fn allocated(
    range: IpRangeRef,
    conn: impl PgExecutor<'_>,
) -> Result<Vec<IpAddr>, sqlx::Error> {
    let (_, column, id) = range_table(range);
    let rows: Vec<(IpNetwork,)> = sqlx::query_as(&format!(
        "select ip from corral.ip_allocations where {column} = $1 and allocated"
    ))
    .bind(id)
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(|(net,)| net.ip()).collect())
}

/// Mark `ip` allocated, reusing a released row if there is one. Returns `false` when the
/// address is already allocated.
pub async fn mark_allocated(
    range: IpRangeRef,
    ip: IpAddr,
    vm_uuid: Option<Uuid>,
    conn: impl PgExecutor<'_>,
) -> Result<bool, sqlx::Error> {
    let (_, column, id) = range_table(range);
    let row: Option<(i64,)> = sqlx::query_as(&format!(
        r#"
        insert into corral.ip_allocations ({column}, ip, allocated, vm_uuid)
        values ($1, $2, true, $3)
        on conflict ({column}, ip) do update
            set allocated = true, vm_uuid = excluded.vm_uuid, allocated_at = now()
            where not corral.ip_allocations.allocated
        returning id
        "#
    ))
    .bind(id)
    .bind(host_network(ip))
    .bind(vm_uuid)
    .fetch_optional(conn)
    .await?;
    Ok(row.is_some())
}

/// Returns `false` when `ip` was not allocated in the range.
pub async fn release(
    range: IpRangeRef,
    ip: IpAddr,
    conn: impl PgExecutor<'_>,
) -> Result<bool, sqlx::Error> {
    let (_, column, id) = range_table(range);
    let result = sqlx::query(&format!(
        r#"
        update corral.ip_allocations
        set allocated = false, vm_uuid = null
        where {column} = $1 and ip = $2 and allocated
        "#
    ))
    .bind(id)
    .bind(host_network(ip))
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Release every address held by `vm_uuid`, in any range.
pub async fn release_for_vm(vm_uuid: Uuid, conn: impl PgExecutor<'_>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        update corral.ip_allocations
        set allocated = false, vm_uuid = null
        where vm_uuid = $1 and allocated
        "#,
    )
    .bind(vm_uuid)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}
