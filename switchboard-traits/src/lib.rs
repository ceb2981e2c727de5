//! Traits shared between the switchboard, its clients and the derive macros.

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// A JSON response body that carries its own HTTP status code.
///
/// Implemented through `#[derive(HttpStatusCode)]`. The switchboard uses the
/// status when building the response; clients use it to tell a successful
/// body apart from an error body without inspecting every variant.
pub trait JsonProxiedStatus: Serialize + for<'de> Deserialize<'de> {
    fn status_code(&self) -> StatusCode;

    fn is_success(&self) -> bool {
        self.status_code().is_success()
    }
}
