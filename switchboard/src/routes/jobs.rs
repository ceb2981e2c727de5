use crate::auth::AuthError;
use crate::routes::proxy::{proxy_err, proxy_val, Proxied};
use crate::serve::AppState;
use crate::service::ipam::IpamError;
use crate::service::queue::{JobQueue, QueueError};
use crate::service::ServiceError;
use axum::extract::{Path, Query, State};
use axum::Json;
use corral_rs::api::admin::jobs::{
    EnqueueRequest, FailRequest, FailResponse, StaleQuery, StaleResponse, StatusResponse,
};
use corral_rs::api::admin::JobResponse;
use corral_rs::job::JobId;

// Shared by every admin route that answers with one enqueued job.
impl From<ServiceError> for JobResponse {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::Invalid(reason) => JobResponse::Invalid { reason },
            ServiceError::NotFound(_) | ServiceError::Auth(AuthError::NoSuchNode) => {
                JobResponse::NotFound
            }
            ServiceError::Conflict(reason) => JobResponse::Conflict { reason },
            ServiceError::Ipam(IpamError::NotFound | IpamError::NotAllocated(_)) => {
                JobResponse::NotFound
            }
            ServiceError::Ipam(e @ (IpamError::OutOfRange(_) | IpamError::Reserved(_))) => {
                JobResponse::Invalid {
                    reason: e.to_string(),
                }
            }
            ServiceError::Ipam(e @ (IpamError::AlreadyAllocated(_) | IpamError::Exhausted)) => {
                JobResponse::Conflict {
                    reason: e.to_string(),
                }
            }
            e => {
                tracing::error!("request failed: {e}");
                JobResponse::Internal
            }
        }
    }
}

// -- enqueue

#[tracing::instrument(skip(state, request))]
pub async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Proxied<JobResponse> {
    let job_id = state
        .service()
        .enqueue_raw(request)
        .await
        .map_err(proxy_err)?;
    proxy_val(JobResponse::Ok { job_id })
}

// -- status

#[tracing::instrument(skip(state))]
pub async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Proxied<StatusResponse> {
    let job = state
        .service()
        .queue()
        .get(JobId(job_id))
        .await
        .map_err(|e| {
            tracing::error!("failed to read job {job_id}: {e}");
            StatusResponse::Internal
        })
        .map_err(proxy_err)?
        .ok_or(StatusResponse::NotFound)
        .map_err(proxy_err)?;
    proxy_val(StatusResponse::Ok { job })
}

// -- stale

#[tracing::instrument(skip(state))]
pub async fn stale(
    State(state): State<AppState>,
    Query(query): Query<StaleQuery>,
) -> Proxied<StaleResponse> {
    let older_than = state
        .service()
        .stale_threshold(query.older_than.as_deref())
        .map_err(|e| StaleResponse::Invalid {
            reason: e.to_string(),
        })
        .map_err(proxy_err)?;
    let jobs = state
        .service()
        .queue()
        .list_stale(older_than)
        .await
        .map_err(|e| {
            tracing::error!("failed to list stale jobs: {e}");
            StaleResponse::Internal
        })
        .map_err(proxy_err)?;
    proxy_val(StaleResponse::Ok { jobs })
}

// -- fail

#[tracing::instrument(skip(state, request))]
pub async fn fail(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
    Json(request): Json<FailRequest>,
) -> Proxied<FailResponse> {
    let requeued_as = state
        .service()
        .queue()
        .fail_stuck(JobId(job_id), &request.note, request.requeue)
        .await
        .map_err(|e| match e {
            QueueError::NoSuchJob => FailResponse::NotFound,
            QueueError::NotInProgress => FailResponse::NotInProgress,
            e => {
                tracing::error!("failed to fail job {job_id}: {e}");
                FailResponse::Internal
            }
        })
        .map_err(proxy_err)?;
    tracing::info!(job_id, ?requeued_as, "job failed by operator");
    proxy_val(FailResponse::Ok { requeued_as })
}
