use crate::routes::proxy::{proxy_err, proxy_val, Proxied};
use crate::serve::AppState;
use crate::service::ipam::{AddressAllocator, IpamError};
use axum::extract::State;
use axum::Json;
use corral_rs::api::admin::ipam::{AllocateRequest, ReleaseRequest, ReserveRequest, Response};

impl From<IpamError> for Response {
    fn from(value: IpamError) -> Self {
        match value {
            IpamError::NotFound | IpamError::NotAllocated(_) => Response::NotFound,
            e @ (IpamError::OutOfRange(_) | IpamError::Reserved(_)) => Response::Invalid {
                reason: e.to_string(),
            },
            IpamError::AlreadyAllocated(_) => Response::AlreadyAllocated,
            IpamError::Exhausted => Response::Exhausted,
            IpamError::Database(e) => {
                tracing::error!("address management failed: {e}");
                Response::Internal
            }
        }
    }
}

#[tracing::instrument(skip(state))]
pub async fn allocate(
    State(state): State<AppState>,
    Json(request): Json<AllocateRequest>,
) -> Proxied<Response> {
    let ip = state
        .service()
        .ipam()
        .allocate(request.range, request.vm_uuid)
        .await
        .map_err(proxy_err)?;
    proxy_val(Response::Ok { ip })
}

#[tracing::instrument(skip(state))]
pub async fn reserve(
    State(state): State<AppState>,
    Json(request): Json<ReserveRequest>,
) -> Proxied<Response> {
    state
        .service()
        .ipam()
        .reserve(request.range, request.ip, request.vm_uuid)
        .await
        .map_err(proxy_err)?;
    proxy_val(Response::Ok { ip: request.ip })
}

#[tracing::instrument(skip(state))]
pub async fn release(
    State(state): State<AppState>,
    Json(request): Json<ReleaseRequest>,
) -> Proxied<Response> {
    state
        .service()
        .ipam()
        .release(request.range, request.ip)
        .await
        .map_err(proxy_err)?;
    proxy_val(Response::Ok { ip: request.ip })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn ipam_errors_map_to_responses() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert!(matches!(Response::from(IpamError::Exhausted), Response::Exhausted));
        assert!(matches!(
            Response::from(IpamError::AlreadyAllocated(ip)),
            Response::AlreadyAllocated
        ));
        assert!(matches!(
            Response::from(IpamError::Reserved(ip)),
            Response::Invalid { reason } if reason.contains("10.0.0.1")
        ));
        assert!(matches!(
            Response::from(IpamError::NotAllocated(ip)),
            Response::NotFound
        ));
    }
}
