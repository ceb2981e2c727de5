use crate::serve::AppState;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use axum::RequestPartsExt;
use axum_extra::typed_header::TypedHeaderRejectionReason;
use axum_extra::TypedHeader;
use headers::authorization::Bearer;
use headers::Authorization;
use http::request::Parts;
use http::StatusCode;
use subtle::ConstantTimeEq;

/// Marker extractor: the request carried `Authorization: Bearer <admin token>`.
#[derive(Debug)]
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let bearer = match parts.extract::<TypedHeader<Authorization<Bearer>>>().await {
            Ok(x) => x.0 .0,
            Err(rejection) => {
                match rejection.reason() {
                    TypedHeaderRejectionReason::Missing => {
                        tracing::warn!("no token present for request");
                    }
                    reason => {
                        tracing::warn!("failed to extract Authorization<Bearer>: {reason:?}");
                    }
                }
                return Err(StatusCode::UNAUTHORIZED.into_response());
            }
        };

        let expected = state.config().service.admin_token.as_bytes();
        // An empty configured token would otherwise accept an empty bearer.
        let matches = !expected.is_empty() && bool::from(bearer.token().as_bytes().ct_eq(expected));
        if matches {
            Ok(AdminAuth)
        } else {
            tracing::warn!("rejected admin request: wrong bearer token");
            Err(StatusCode::UNAUTHORIZED.into_response())
        }
    }
}
