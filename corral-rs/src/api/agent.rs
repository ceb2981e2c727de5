//! Agent-facing endpoints: `/agent/poll`, `/agent/ack`, `/agent/firewall`.
//!
//! Agents authenticate with their node token in the request body.

pub mod poll {
    use crate::job::JobId;
    use serde::{Deserialize, Serialize};
    use corral_switchboard_macros::HttpStatusCode;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Request {
        pub token: String,
    }

    /// A claimed job as handed to the agent. `type` and `payload` are
    /// passed through verbatim from the job row.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ClaimedJob {
        pub id: JobId,
        #[serde(rename = "type")]
        pub kind: String,
        pub payload: serde_json::Value,
    }

    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Response {
        /// `job` is `null` when nothing is pending for this node.
        #[http(status = 200)]
        Ok { job: Option<ClaimedJob> },
        #[http(status = 401)]
        Unauthorized,
        #[http(status = 500)]
        Internal,
    }
}

pub mod ack {
    use crate::job::{AckStatus, JobId};
    use serde::{Deserialize, Serialize};
    use corral_switchboard_macros::HttpStatusCode;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Request {
        pub token: String,
        pub id: JobId,
        pub status: AckStatus,
        #[serde(default)]
        pub log: String,
        /// Optional structured outcome, interpreted per job kind.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub result: Option<serde_json::Value>,
    }

    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Response {
        #[http(status = 200)]
        Ok { ok: bool },
        #[http(status = 401)]
        Unauthorized,
        /// No job with this id belongs to the calling node.
        #[http(status = 404)]
        NoSuchJob,
        /// The job was never claimed.
        #[http(status = 409)]
        NotClaimed,
        #[http(status = 500)]
        Internal,
    }
}

pub mod firewall {
    use crate::firewall::{FirewallMode, FirewallRule};
    use serde::{Deserialize, Serialize};
    use corral_switchboard_macros::HttpStatusCode;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Request {
        pub token: String,
        pub vm_uuid: Uuid,
    }

    #[derive(Debug, Clone, HttpStatusCode, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Response {
        #[http(status = 200)]
        Ok {
            mode: FirewallMode,
            rules: Vec<FirewallRule>,
        },
        #[http(status = 401)]
        Unauthorized,
        /// The VM does not exist or is not hosted on the calling node.
        #[http(status = 404)]
        NoSuchVm,
        #[http(status = 500)]
        Internal,
    }
}
