use crate::auth::{AuthError, NodeAuthenticator};
use crate::config::ServiceConfig;
use crate::service::ipam::{IpamError, PgAllocator};
use crate::service::queue::{JobQueue, PgJobQueue, QueueError};
use crate::sql;
use chrono::TimeDelta;
use corral_rs::api::admin::jobs::EnqueueRequest;
use corral_rs::api::admin::nodes::{CreateRequest, NetworkRequest, RaRequest};
use corral_rs::api::agent::poll::ClaimedJob;
use corral_rs::firewall::{FirewallMode, FirewallRule};
use corral_rs::job::{JobId, JobSpec, NetSetup, RaSetup};
use corral_rs::net::Ipv6Prefix64;
use sqlx::{PgExecutor, PgPool};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

pub mod effects;
pub mod ipam;
pub mod queue;
pub mod schedule;
mod vms;

pub use vms::Provisioned;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),
    #[error("Failed to encode job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Invalid request: {0}")]
    Invalid(String),
    #[error("No such {0}")]
    NotFound(&'static str),
    #[error("Conflict: {0}")]
    Conflict(String),
}

pub struct Service {
    pool: PgPool,
    queue: PgJobQueue,
    nodes: NodeAuthenticator,
    ipam: PgAllocator,
    service_config: ServiceConfig,
}

/// Insert `spec` as a pending job on whatever executor the caller is in, typically the
/// transaction that also wrote the domain state the job acts on.
async fn enqueue_in(
    node_id: Uuid,
    spec: &JobSpec,
    conn: impl PgExecutor<'_>,
) -> Result<JobId, ServiceError> {
    let payload = spec.payload()?;
    let job_id = sql::job::insert(node_id, spec.kind().as_str(), &payload, conn).await?;
    tracing::info!(%node_id, %job_id, kind = %spec.kind(), "enqueued job");
    Ok(job_id)
}

// -------------------------------------------------------------------------------------------------
// === GROUPING: CONSTRUCTION / ACCESSORS
// -------------------------------------------------------------------------------------------------

impl Service {
    #[instrument(skip(pool, service_config))]
    pub fn new(pool: PgPool, service_config: ServiceConfig) -> Arc<Self> {
        Arc::new(Self {
            queue: PgJobQueue::new(pool.clone(), service_config.log_max_bytes),
            nodes: NodeAuthenticator::new(
                pool.clone(),
                service_config.token_grace_period,
                service_config.auth_cache_ttl,
            ),
            ipam: PgAllocator::new(pool.clone()),
            pool,
            service_config,
        })
    }

    pub fn queue(&self) -> &PgJobQueue {
        &self.queue
    }

    pub fn nodes(&self) -> &NodeAuthenticator {
        &self.nodes
    }

    pub fn ipam(&self) -> &PgAllocator {
        &self.ipam
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.service_config
    }
}

// -------------------------------------------------------------------------------------------------
// === GROUPING: AGENT SURFACE
// -------------------------------------------------------------------------------------------------

impl Service {
    /// Record the node's heartbeat, then claim its oldest pending job.
    #[instrument(skip(self))]
    pub async fn poll(&self, node_id: Uuid) -> Result<Option<ClaimedJob>, ServiceError> {
        sql::node::touch(node_id, &self.pool).await?;
        Ok(self.queue.claim(node_id).await?)
    }

    /// Firewall state of a VM hosted on `node_id`, rules in evaluation order. Rows with a
    /// protocol or action this build does not know are left out.
    #[instrument(skip(self))]
    pub async fn firewall_state(
        &self,
        node_id: Uuid,
        vm_uuid: Uuid,
    ) -> Result<(FirewallMode, Vec<FirewallRule>), ServiceError> {
        let mode = sql::vm::firewall_mode_on_node(vm_uuid, node_id, &self.pool)
            .await?
            .ok_or(ServiceError::NotFound("vm"))?;
        let rows = sql::firewall::list(vm_uuid, &self.pool).await?;
        let total = rows.len();
        let rules: Vec<FirewallRule> = rows
            .into_iter()
            .filter_map(sql::firewall::SqlFirewallRule::into_rule)
            .collect();
        if rules.len() != total {
            tracing::warn!(
                %vm_uuid,
                skipped = total - rules.len(),
                "skipping unreadable firewall rules"
            );
        }
        Ok((mode, rules))
    }
}

// -------------------------------------------------------------------------------------------------
// === GROUPING: JOB ADMINISTRATION
// -------------------------------------------------------------------------------------------------

impl Service {
    /// Enqueue a raw `(type, payload)` pair after checking it parses as a known job. The
    /// canonical type name and the normalized payload are stored.
    #[instrument(skip(self, request), fields(node_id = %request.node_id, kind = %request.kind))]
    pub async fn enqueue_raw(&self, request: EnqueueRequest) -> Result<JobId, ServiceError> {
        let spec = JobSpec::from_wire(&request.kind, request.payload)
            .map_err(|e| ServiceError::Invalid(e.to_string()))?;
        if sql::node::fetch(request.node_id, &self.pool).await?.is_none() {
            return Err(ServiceError::NotFound("node"));
        }
        Ok(self
            .queue
            .enqueue(request.node_id, spec.kind().as_str(), spec.payload()?)
            .await?)
    }

    /// Parse a human duration such as `30m`, falling back to the configured default.
    pub fn stale_threshold(&self, older_than: Option<&str>) -> Result<TimeDelta, ServiceError> {
        match older_than {
            None => Ok(self.service_config.stale_job_after),
            Some(raw) => corral_rs::util::chrono::duration::parse(raw)
                .map_err(|e| ServiceError::Invalid(format!("invalid duration {raw:?}: {e}"))),
        }
    }
}

// -------------------------------------------------------------------------------------------------
// === GROUPING: NODES
// -------------------------------------------------------------------------------------------------

impl Service {
    /// Register a node and return its id and first token.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_node(&self, request: CreateRequest) -> Result<(Uuid, String), ServiceError> {
        let token = crate::auth::token::generate();
        let presented = token.clone();
        let hashed = tokio::task::spawn_blocking(move || crate::auth::token::hash(&presented))
            .await
            .map_err(|e| AuthError::Hash(e.to_string()))??;

        let node_id = Uuid::new_v4();
        let inserted = sql::node::insert(
            node_id,
            &request.name,
            request.management_url.as_deref(),
            &request.bridge,
            &hashed,
            &self.pool,
        )
        .await?;
        if !inserted {
            return Err(ServiceError::Conflict(format!(
                "a node named {:?} already exists",
                request.name
            )));
        }
        tracing::info!(%node_id, "registered node");
        Ok((node_id, token))
    }

    async fn node(&self, node_id: Uuid) -> Result<sql::node::SqlNode, ServiceError> {
        sql::node::fetch(node_id, &self.pool)
            .await?
            .ok_or(ServiceError::NotFound("node"))
    }

    #[instrument(skip(self, request))]
    pub async fn setup_network(
        &self,
        node_id: Uuid,
        request: NetworkRequest,
    ) -> Result<JobId, ServiceError> {
        let node = self.node(node_id).await?;
        let spec = JobSpec::NetSetup(NetSetup {
            mode: request.mode,
            bridge: request.bridge.unwrap_or(node.bridge),
            wan_iface: request.wan_iface,
        });
        enqueue_in(node_id, &spec, &self.pool).await
    }

    /// Enqueue router advertisements for a bridge. Anything but a /64 is rejected here.
    #[instrument(skip(self, request))]
    pub async fn setup_ra(&self, node_id: Uuid, request: RaRequest) -> Result<JobId, ServiceError> {
        let prefix: Ipv6Prefix64 = request
            .prefix
            .parse()
            .map_err(|e: corral_rs::net::NetError| ServiceError::Invalid(e.to_string()))?;
        let node = self.node(node_id).await?;
        let spec = JobSpec::RaSetup(RaSetup {
            bridge: request.bridge.unwrap_or(node.bridge),
            prefix,
            dns_servers: request.dns_servers,
        });
        enqueue_in(node_id, &spec, &self.pool).await
    }

    pub async fn rotate_token(&self, node_id: Uuid) -> Result<String, ServiceError> {
        Ok(self.nodes.rotate(node_id).await?)
    }
}
