use crate::routes::proxy::{proxy_err, proxy_val, Proxied};
use crate::serve::AppState;
use crate::service::ServiceError;
use axum::extract::{Path, State};
use axum::Json;
use corral_rs::api::admin::firewall::{AddRuleRequest, AddRuleResponse, ModeRequest};
use corral_rs::api::admin::JobResponse;
use uuid::Uuid;

impl From<ServiceError> for AddRuleResponse {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::NotFound(_) => AddRuleResponse::NotFound,
            e => {
                tracing::error!("failed to add firewall rule: {e}");
                AddRuleResponse::Internal
            }
        }
    }
}

#[tracing::instrument(skip(state))]
pub async fn set_mode(
    State(state): State<AppState>,
    Path(vm_uuid): Path<Uuid>,
    Json(request): Json<ModeRequest>,
) -> Proxied<JobResponse> {
    let job_id = state
        .service()
        .set_firewall_mode(vm_uuid, request.mode)
        .await
        .map_err(proxy_err)?;
    proxy_val(JobResponse::Ok { job_id })
}

#[tracing::instrument(skip(state))]
pub async fn add_rule(
    State(state): State<AppState>,
    Path(vm_uuid): Path<Uuid>,
    Json(request): Json<AddRuleRequest>,
) -> Proxied<AddRuleResponse> {
    let (rule_id, job_id) = state
        .service()
        .add_firewall_rule(vm_uuid, request)
        .await
        .map_err(proxy_err)?;
    proxy_val(AddRuleResponse::Ok { rule_id, job_id })
}

#[tracing::instrument(skip(state))]
pub async fn delete_rule(
    State(state): State<AppState>,
    Path((vm_uuid, rule_id)): Path<(Uuid, i64)>,
) -> Proxied<JobResponse> {
    let job_id = state
        .service()
        .delete_firewall_rule(vm_uuid, rule_id)
        .await
        .map_err(proxy_err)?;
    proxy_val(JobResponse::Ok { job_id })
}
