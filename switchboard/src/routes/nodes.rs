use crate::auth::AuthError;
use crate::routes::proxy::{proxy_err, proxy_val, Proxied};
use crate::serve::AppState;
use crate::service::ServiceError;
use axum::extract::{Path, State};
use axum::Json;
use corral_rs::api::admin::nodes::{CreateRequest, NetworkRequest, RaRequest, TokenResponse};
use corral_rs::api::admin::JobResponse;
use uuid::Uuid;

impl From<ServiceError> for TokenResponse {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::NotFound(_) | ServiceError::Auth(AuthError::NoSuchNode) => {
                TokenResponse::NotFound
            }
            ServiceError::Conflict(reason) => TokenResponse::Conflict { reason },
            e => {
                tracing::error!("failed to issue node token: {e}");
                TokenResponse::Internal
            }
        }
    }
}

// -- create

#[tracing::instrument(skip(state, request))]
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> Proxied<TokenResponse> {
    let (node_id, token) = state
        .service()
        .create_node(request)
        .await
        .map_err(proxy_err)?;
    proxy_val(TokenResponse::Ok { node_id, token })
}

// -- network

#[tracing::instrument(skip(state))]
pub async fn network(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
    Json(request): Json<NetworkRequest>,
) -> Proxied<JobResponse> {
    let job_id = state
        .service()
        .setup_network(node_id, request)
        .await
        .map_err(proxy_err)?;
    proxy_val(JobResponse::Ok { job_id })
}

// -- ra

#[tracing::instrument(skip(state))]
pub async fn ra(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
    Json(request): Json<RaRequest>,
) -> Proxied<JobResponse> {
    let job_id = state
        .service()
        .setup_ra(node_id, request)
        .await
        .map_err(proxy_err)?;
    proxy_val(JobResponse::Ok { job_id })
}

// -- token rotation

#[tracing::instrument(skip(state))]
pub async fn rotate_token(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
) -> Proxied<TokenResponse> {
    let token = state
        .service()
        .rotate_token(node_id)
        .await
        .map_err(proxy_err)?;
    tracing::info!(%node_id, "rotated node token");
    proxy_val(TokenResponse::Ok { node_id, token })
}
