use crate::routes::proxy::{proxy_err, proxy_val, Proxied};
use crate::serve::AppState;
use crate::service::ipam::IpamError;
use crate::service::{Provisioned, ServiceError};
use axum::extract::{Path, State};
use axum::Json;
use corral_rs::api::admin::vms::{
    ActionRequest, ProvisionRequest, ProvisionResponse, ResizeRequest, SnapshotRequest,
};
use corral_rs::api::admin::JobResponse;
use corral_rs::lifecycle::VmAction;
use uuid::Uuid;

impl From<ServiceError> for ProvisionResponse {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::Invalid(reason) => ProvisionResponse::Invalid { reason },
            ServiceError::NotFound(_) => ProvisionResponse::NotFound,
            ServiceError::Conflict(reason) => ProvisionResponse::Conflict { reason },
            ServiceError::Ipam(IpamError::Exhausted) => ProvisionResponse::Exhausted,
            ServiceError::Ipam(IpamError::NotFound | IpamError::NotAllocated(_)) => {
                ProvisionResponse::NotFound
            }
            ServiceError::Ipam(e @ IpamError::AlreadyAllocated(_)) => ProvisionResponse::Conflict {
                reason: e.to_string(),
            },
            ServiceError::Ipam(e @ (IpamError::OutOfRange(_) | IpamError::Reserved(_))) => {
                ProvisionResponse::Invalid {
                    reason: e.to_string(),
                }
            }
            e => {
                tracing::error!("provisioning failed: {e}");
                ProvisionResponse::Internal
            }
        }
    }
}

impl From<Provisioned> for ProvisionResponse {
    fn from(value: Provisioned) -> Self {
        ProvisionResponse::Ok {
            vm_uuid: value.vm_uuid,
            mac: value.mac,
            ip_address: value.ip_address,
            job_id: value.job_id,
        }
    }
}

// -- provision

#[tracing::instrument(skip(state, request))]
pub async fn provision(
    State(state): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> Proxied<ProvisionResponse> {
    let provisioned = state
        .service()
        .provision(request)
        .await
        .map_err(proxy_err)?;
    proxy_val(provisioned.into())
}

// -- action

#[tracing::instrument(skip(state, request))]
pub async fn action(
    State(state): State<AppState>,
    Path((vm_uuid, action)): Path<(Uuid, String)>,
    request: Option<Json<ActionRequest>>,
) -> Proxied<JobResponse> {
    let action: VmAction = action
        .parse()
        .map_err(|reason| JobResponse::Invalid { reason })
        .map_err(proxy_err)?;
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let job_id = state
        .service()
        .vm_action(vm_uuid, action, request)
        .await
        .map_err(proxy_err)?;
    proxy_val(JobResponse::Ok { job_id })
}

// -- resize

#[tracing::instrument(skip(state))]
pub async fn resize(
    State(state): State<AppState>,
    Path(vm_uuid): Path<Uuid>,
    Json(request): Json<ResizeRequest>,
) -> Proxied<JobResponse> {
    let job_id = state
        .service()
        .resize_disk(vm_uuid, request.disk_gb)
        .await
        .map_err(proxy_err)?;
    proxy_val(JobResponse::Ok { job_id })
}

// -- snapshot

#[tracing::instrument(skip(state, request))]
pub async fn snapshot(
    State(state): State<AppState>,
    Path(vm_uuid): Path<Uuid>,
    request: Option<Json<SnapshotRequest>>,
) -> Proxied<JobResponse> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let job_id = state
        .service()
        .create_snapshot(vm_uuid, request.name)
        .await
        .map_err(proxy_err)?;
    proxy_val(JobResponse::Ok { job_id })
}
