//! HTTP wire types.
//!
//! Every response type derives `HttpStatusCode`, so the switchboard picks
//! the status from the body and clients can deserialize error bodies with
//! the same type they use for success.

pub mod admin;
pub mod agent;

use serde::{Deserialize, Serialize};
use corral_switchboard_macros::HttpStatusCode;

/// `GET /healthz`.
#[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
#[http(status = 200)]
pub struct Health {
    pub ok: bool,
    pub version: String,
}
