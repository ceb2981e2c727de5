//! Agent-side interface to the switchboard.
//!
//! The agent's poll loop only talks to the switchboard through
//! [`SwitchboardConnector`], and only runs jobs through [`JobExecutor`]. The
//! production implementations are an HTTP client and the node's executor
//! registry; tests plug in in-memory versions of either side.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::api::agent::poll::ClaimedJob;
use crate::firewall::{FirewallMode, FirewallRule};
use crate::job::{JobId, JobOutcome};

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The request never got a well-formed answer (connection refused,
    /// timeout, undecodable body). Worth retrying.
    #[error("transport error: {0}")]
    Transport(String),
    /// The switchboard is up but failed internally (database down, ...).
    #[error("switchboard unavailable: {0}")]
    Unavailable(String),
    /// The switchboard rejected the node token.
    #[error("node token rejected")]
    Unauthorized,
    /// The switchboard answered with a non-success body.
    #[error("switchboard rejected request: {0}")]
    Rejected(String),
}

impl ConnectorError {
    /// Whether repeating the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::Transport(_) | ConnectorError::Unavailable(_)
        )
    }
}

/// Firewall state of one VM as currently stored by the switchboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallState {
    pub mode: FirewallMode,
    pub rules: Vec<FirewallRule>,
}

#[async_trait]
pub trait SwitchboardConnector: Send + Sync + 'static {
    /// Claim the oldest pending job for this node, refreshing its heartbeat.
    async fn poll(&self) -> Result<Option<ClaimedJob>, ConnectorError>;

    /// Report the final outcome of a claimed job.
    ///
    /// Acking an already finalized job succeeds without changing it, so this
    /// may be retried after a transport error.
    async fn ack(&self, job_id: JobId, outcome: &JobOutcome) -> Result<(), ConnectorError>;

    /// Fetch the current firewall mode and rules of a VM hosted on this node.
    async fn firewall(&self, vm_uuid: Uuid) -> Result<FirewallState, ConnectorError>;
}

/// Runs one claimed job to completion.
///
/// Implementations never fail: every error, including an unknown job type
/// or a malformed payload, becomes a `failed` outcome with a descriptive
/// log.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, job: &ClaimedJob) -> JobOutcome;
}
