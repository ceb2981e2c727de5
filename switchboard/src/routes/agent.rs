//! Routes called by node agents. The node is identified by the token in the request body.

use crate::impl_from_auth_err;
use crate::routes::proxy::{proxy_err, proxy_val, Proxied};
use crate::serve::AppState;
use crate::service::queue::{AckOutcome, JobQueue, QueueError};
use crate::service::ServiceError;
use axum::extract::State;
use axum::Json;
use corral_rs::api::agent::{
    ack::{Request as AckRequest, Response as AckResponse},
    firewall::{Request as FirewallRequest, Response as FirewallResponse},
    poll::{Request as PollRequest, Response as PollResponse},
};
use corral_rs::job::JobOutcome;

// -- poll

impl_from_auth_err!(PollResponse, Internal => Internal, Unauthorized => Unauthorized);
#[tracing::instrument(skip(state, request))]
pub async fn poll(
    State(state): State<AppState>,
    Json(request): Json<PollRequest>,
) -> Proxied<PollResponse> {
    let node_id = state
        .service()
        .nodes()
        .authenticate(&request.token)
        .await
        .map_err(proxy_err)?;
    let job = state
        .service()
        .poll(node_id)
        .await
        .map_err(|e| {
            tracing::error!(%node_id, "poll failed: {e}");
            PollResponse::Internal
        })
        .map_err(proxy_err)?;
    if let Some(job) = &job {
        tracing::info!(%node_id, job_id = %job.id, kind = %job.kind, "handed out job");
    }
    proxy_val(PollResponse::Ok { job })
}

// -- ack

impl_from_auth_err!(AckResponse, Internal => Internal, Unauthorized => Unauthorized);
#[tracing::instrument(skip(state, request), fields(job_id = %request.id))]
pub async fn ack(
    State(state): State<AppState>,
    Json(request): Json<AckRequest>,
) -> Proxied<AckResponse> {
    let node_id = state
        .service()
        .nodes()
        .authenticate(&request.token)
        .await
        .map_err(proxy_err)?;
    let outcome = JobOutcome {
        status: request.status,
        log: request.log,
        result: request.result,
    };
    let acked = state
        .service()
        .queue()
        .ack(node_id, request.id, &outcome)
        .await
        .map_err(|e| match e {
            QueueError::NoSuchJob => AckResponse::NoSuchJob,
            QueueError::NotClaimed => AckResponse::NotClaimed,
            e => {
                tracing::error!(%node_id, "ack failed: {e}");
                AckResponse::Internal
            }
        })
        .map_err(proxy_err)?;
    if acked == AckOutcome::AlreadyFinal {
        tracing::info!(%node_id, "duplicate ack for a finished job");
    }
    proxy_val(AckResponse::Ok { ok: true })
}

// -- firewall

impl_from_auth_err!(FirewallResponse, Internal => Internal, Unauthorized => Unauthorized);
#[tracing::instrument(skip(state, request), fields(vm_uuid = %request.vm_uuid))]
pub async fn firewall(
    State(state): State<AppState>,
    Json(request): Json<FirewallRequest>,
) -> Proxied<FirewallResponse> {
    let node_id = state
        .service()
        .nodes()
        .authenticate(&request.token)
        .await
        .map_err(proxy_err)?;
    let (mode, rules) = state
        .service()
        .firewall_state(node_id, request.vm_uuid)
        .await
        .map_err(|e| match e {
            ServiceError::NotFound(_) => FirewallResponse::NoSuchVm,
            e => {
                tracing::error!(%node_id, "failed to read firewall state: {e}");
                FirewallResponse::Internal
            }
        })
        .map_err(proxy_err)?;
    proxy_val(FirewallResponse::Ok { mode, rules })
}
