use corral_rs::firewall::{FirewallRule, Protocol, RuleAction};
use sqlx::PgExecutor;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqlFirewallRule {
    pub id: i64,
    pub protocol: String,
    pub source_cidr: String,
    pub dest_ports: String,
    pub action: String,
    pub priority: i32,
    pub enabled: bool,
}

impl SqlFirewallRule {
    /// `None` when the stored protocol or action is not one we know.
    pub fn into_rule(self) -> Option<FirewallRule> {
        Some(FirewallRule {
            id: self.id,
            protocol: self.protocol.parse().ok()?,
            source_cidr: self.source_cidr,
            dest_ports: self.dest_ports,
            action: self.action.parse().ok()?,
            priority: self.priority,
            enabled: self.enabled,
        })
    }
}

/// A rule about to be inserted; fields are already defaulted.
#[derive(Debug, Clone)]
pub struct NewRule<'a> {
    pub protocol: Protocol,
    pub source_cidr: &'a str,
    pub dest_ports: &'a str,
    pub action: RuleAction,
    pub priority: i32,
    pub enabled: bool,
}

pub async fn list(
    vm_uuid: Uuid,
    conn: impl PgExecutor<'_>,
) -> Result<Vec<SqlFirewallRule>, sqlx::Error> {
    sqlx::query_as(
        r#"
        select id, protocol, source_cidr, dest_ports, action, priority, enabled
        from corral.firewall_rules
        where vm_uuid = $1
        order by priority, id
        "#,
    )
    .bind(vm_uuid)
    .fetch_all(conn)
    .await
}

pub async fn insert(
    vm_uuid: Uuid,
    rule: &NewRule<'_>,
    conn: impl PgExecutor<'_>,
) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into corral.firewall_rules
            (vm_uuid, protocol, source_cidr, dest_ports, action, priority, enabled)
        values ($1, $2, $3, $4, $5, $6, $7)
        returning id
        "#,
    )
    .bind(vm_uuid)
    .bind(rule.protocol.as_str())
    .bind(rule.source_cidr)
    .bind(rule.dest_ports)
    .bind(rule.action.as_str())
    .bind(rule.priority)
    .bind(rule.enabled)
    .fetch_one(conn)
    .await?;
    Ok(id)
}

pub async fn delete(
    vm_uuid: Uuid,
    rule_id: i64,
    conn: impl PgExecutor<'_>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("delete from corral.firewall_rules where vm_uuid = $1 and id = $2")
        .bind(vm_uuid)
        .bind(rule_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() == 1)
}
