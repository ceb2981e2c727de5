//! Handler return type for response enums that carry their own status code.

use axum::response::{IntoResponse, Response};
use axum::Json;
use corral_switchboard_traits::JsonProxiedStatus;

/// Serializes the wrapped body as JSON under the status the body reports.
#[derive(Debug)]
pub struct StatusJson<T>(T);

impl<T: JsonProxiedStatus> IntoResponse for StatusJson<T> {
    fn into_response(self) -> Response {
        (self.0.status_code(), Json(self.0)).into_response()
    }
}

/// Both arms render the same way; `Err` lets handlers use `?` with a `From` conversion.
pub type Proxied<T> = Result<StatusJson<T>, StatusJson<T>>;

pub fn proxy_val<T: JsonProxiedStatus>(val: T) -> Proxied<T> {
    Ok(StatusJson(val))
}

pub fn proxy_err<E, T: JsonProxiedStatus + From<E>>(err: E) -> StatusJson<T> {
    StatusJson(T::from(err))
}
