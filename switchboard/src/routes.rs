mod agent;
mod backups;
mod firewall;
mod ipam;
mod jobs;
mod nodes;
mod proxy;
mod vms;

use crate::auth::extract::AdminAuth;
use crate::routes::proxy::{proxy_val, Proxied};
use crate::serve::AppState;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use corral_rs::api::Health;
use http::header::AUTHORIZATION;
use http::StatusCode;
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router<()> {
    Router::new()
        .route("/healthz", get(health))
        // node agents, authenticated by the token in the body
        .route("/agent/poll", post(agent::poll))
        .route("/agent/ack", post(agent::ack))
        .route("/agent/firewall", post(agent::firewall))
        .nest("/api/v1", api_router(state.clone()))
        // utility
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(SetSensitiveRequestHeadersLayer::new([AUTHORIZATION]))
}

fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        // job management group
        //  POST /jobs
        .route("/jobs", post(jobs::enqueue))
        //  GET /jobs/stale?older_than=<duration>
        .route("/jobs/stale", get(jobs::stale))
        //  GET /jobs/:id
        .route("/jobs/:id", get(jobs::status))
        //  POST /jobs/:id/fail
        .route("/jobs/:id/fail", post(jobs::fail))
        // VM group
        //  POST /vms
        .route("/vms", post(vms::provision))
        //  POST /vms/:uuid/actions/:action
        .route("/vms/:uuid/actions/:action", post(vms::action))
        //  POST /vms/:uuid/disk
        .route("/vms/:uuid/disk", post(vms::resize))
        //  POST /vms/:uuid/snapshots
        .route("/vms/:uuid/snapshots", post(vms::snapshot))
        // firewall group
        //  PUT /vms/:uuid/firewall
        .route("/vms/:uuid/firewall", put(firewall::set_mode))
        //  POST /vms/:uuid/firewall/rules
        .route("/vms/:uuid/firewall/rules", post(firewall::add_rule))
        //  DELETE /vms/:uuid/firewall/rules/:id
        .route("/vms/:uuid/firewall/rules/:id", delete(firewall::delete_rule))
        // backup group
        //  POST /vms/:uuid/backups
        .route("/vms/:uuid/backups", post(backups::create))
        //  POST /vms/:uuid/backups/prune
        .route("/vms/:uuid/backups/prune", post(backups::prune))
        //  PUT /vms/:uuid/backups/policy
        .route("/vms/:uuid/backups/policy", put(backups::set_policy))
        //  POST /vms/:uuid/backups/:id/restore
        .route("/vms/:uuid/backups/:id/restore", post(backups::restore))
        // node group
        //  POST /nodes
        .route("/nodes", post(nodes::create))
        //  POST /nodes/:id/network
        .route("/nodes/:id/network", post(nodes::network))
        //  POST /nodes/:id/ra
        .route("/nodes/:id/ra", post(nodes::ra))
        //  POST /nodes/:id/token/rotate
        .route("/nodes/:id/token/rotate", post(nodes::rotate_token))
        // address management group
        .route("/ipam/allocate", post(ipam::allocate))
        .route("/ipam/reserve", post(ipam::reserve))
        .route("/ipam/release", post(ipam::release))
        // Every route above requires `Authorization: Bearer <admin token>`.
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

async fn require_admin(_admin: AdminAuth, request: Request, next: Next) -> Response {
    next.run(request).await
}

async fn health() -> Proxied<Health> {
    proxy_val(Health {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "no such route")
}
