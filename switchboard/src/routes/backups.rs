use crate::routes::proxy::{proxy_err, proxy_val, Proxied};
use crate::serve::AppState;
use crate::service::ServiceError;
use axum::extract::{Path, State};
use axum::Json;
use corral_rs::api::admin::backups::{
    BackupPolicy, CreateRequest, PolicyResponse, PruneRequest, PruneResponse, RestoreRequest,
};
use corral_rs::api::admin::vms::ProvisionResponse;
use corral_rs::api::admin::JobResponse;
use uuid::Uuid;

impl From<ServiceError> for PruneResponse {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::NotFound(_) => PruneResponse::NotFound,
            e => {
                tracing::error!("failed to prune backups: {e}");
                PruneResponse::Internal
            }
        }
    }
}

impl From<ServiceError> for PolicyResponse {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::Invalid(reason) => PolicyResponse::Invalid { reason },
            ServiceError::NotFound(_) => PolicyResponse::NotFound,
            e => {
                tracing::error!("failed to store backup policy: {e}");
                PolicyResponse::Internal
            }
        }
    }
}

// -- create

#[tracing::instrument(skip(state, request))]
pub async fn create(
    State(state): State<AppState>,
    Path(vm_uuid): Path<Uuid>,
    request: Option<Json<CreateRequest>>,
) -> Proxied<JobResponse> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let job_id = state
        .service()
        .create_backup(vm_uuid, request.tier)
        .await
        .map_err(proxy_err)?;
    proxy_val(JobResponse::Ok { job_id })
}

// -- prune

#[tracing::instrument(skip(state, request))]
pub async fn prune(
    State(state): State<AppState>,
    Path(vm_uuid): Path<Uuid>,
    request: Option<Json<PruneRequest>>,
) -> Proxied<PruneResponse> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let (plan, job_id) = state
        .service()
        .prune_backups(vm_uuid, request.policy)
        .await
        .map_err(proxy_err)?;
    proxy_val(PruneResponse::Ok {
        keep: plan.keep,
        drop: plan.drop,
        job_id,
    })
}

// -- policy

#[tracing::instrument(skip(state))]
pub async fn set_policy(
    State(state): State<AppState>,
    Path(vm_uuid): Path<Uuid>,
    Json(policy): Json<BackupPolicy>,
) -> Proxied<PolicyResponse> {
    let policy = state
        .service()
        .set_backup_policy(vm_uuid, policy)
        .await
        .map_err(proxy_err)?;
    proxy_val(PolicyResponse::Ok { policy })
}

// -- restore

#[tracing::instrument(skip(state))]
pub async fn restore(
    State(state): State<AppState>,
    Path((vm_uuid, backup_id)): Path<(Uuid, i64)>,
    Json(request): Json<RestoreRequest>,
) -> Proxied<ProvisionResponse> {
    let provisioned = state
        .service()
        .restore_backup(vm_uuid, backup_id, request.new_name)
        .await
        .map_err(proxy_err)?;
    proxy_val(provisioned.into())
}
