use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use corral_rs::api::agent::{ack, firewall, poll};
use corral_rs::connector::{ConnectorError, FirewallState, SwitchboardConnector};
use corral_rs::job::{JobId, JobOutcome};

use crate::config::{positive, ControllerConfig, ConfigError};

/// Talks to the switchboard's `/agent/*` endpoints over HTTP.
pub struct HttpConnector {
    http_client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpConnector {
    pub fn new(config: &ControllerConfig) -> Result<Self, ConnectorSetupError> {
        let token = config.load_token()?;
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = positive(config.request_timeout) {
            builder = builder.timeout(timeout);
        }
        Ok(HttpConnector {
            http_client: builder.build()?,
            base_url: config.url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// POST `body` and decode the proxied response enum, whatever the status
    /// code: error variants carry their meaning in the body's `type` tag.
    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ConnectorError> {
        let response = self
            .http_client
            .post(format!("{}/{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        match serde_json::from_slice(&bytes) {
            Ok(decoded) => Ok(decoded),
            Err(e) if status.is_server_error() => {
                Err(ConnectorError::Unavailable(format!("{status}: {e}")))
            }
            Err(e) => Err(ConnectorError::Transport(format!(
                "undecodable {status} response from {path}: {e}"
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorSetupError {
    #[error(transparent)]
    Token(#[from] ConfigError),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[async_trait]
impl SwitchboardConnector for HttpConnector {
    async fn poll(&self) -> Result<Option<poll::ClaimedJob>, ConnectorError> {
        let request = poll::Request {
            token: self.token.clone(),
        };
        match self.post("agent/poll", &request).await? {
            poll::Response::Ok { job } => Ok(job),
            poll::Response::Unauthorized => Err(ConnectorError::Unauthorized),
            poll::Response::Internal => Err(ConnectorError::Unavailable("poll".to_string())),
        }
    }

    #[instrument(skip(self, outcome), fields(status = ?outcome.status))]
    async fn ack(&self, job_id: JobId, outcome: &JobOutcome) -> Result<(), ConnectorError> {
        let request = ack::Request {
            token: self.token.clone(),
            id: job_id,
            status: outcome.status,
            log: outcome.log.clone(),
            result: outcome.result.clone(),
        };
        match self.post("agent/ack", &request).await? {
            ack::Response::Ok { .. } => Ok(()),
            ack::Response::Unauthorized => Err(ConnectorError::Unauthorized),
            ack::Response::NoSuchJob => Err(ConnectorError::Rejected(format!(
                "job {} does not belong to this node",
                job_id.0
            ))),
            ack::Response::NotClaimed => Err(ConnectorError::Rejected(format!(
                "job {} was never claimed",
                job_id.0
            ))),
            ack::Response::Internal => Err(ConnectorError::Unavailable("ack".to_string())),
        }
    }

    async fn firewall(&self, vm_uuid: Uuid) -> Result<FirewallState, ConnectorError> {
        let request = firewall::Request {
            token: self.token.clone(),
            vm_uuid,
        };
        match self.post("agent/firewall", &request).await? {
            firewall::Response::Ok { mode, rules } => {
                event!(Level::DEBUG, %vm_uuid, %mode, rules = rules.len(), "Fetched firewall rules");
                Ok(FirewallState { mode, rules })
            }
            firewall::Response::Unauthorized => Err(ConnectorError::Unauthorized),
            firewall::Response::NoSuchVm => Err(ConnectorError::Rejected(format!(
                "vm {vm_uuid} is not hosted on this node"
            ))),
            firewall::Response::Internal => {
                Err(ConnectorError::Unavailable("firewall".to_string()))
            }
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod memory {
    //! An in-process switchboard for exercising the poll loop and the job
    //! executor without a network.

    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use uuid::Uuid;

    use corral_rs::api::agent::poll::ClaimedJob;
    use corral_rs::connector::{ConnectorError, FirewallState, SwitchboardConnector};
    use corral_rs::job::{JobId, JobOutcome};

    #[derive(Default)]
    pub struct MemoryConnector {
        pending: Mutex<VecDeque<ClaimedJob>>,
        acks: Mutex<Vec<(JobId, JobOutcome)>>,
        firewalls: Mutex<HashMap<Uuid, FirewallState>>,
        poll_failures: Mutex<u32>,
        ack_failures: Mutex<u32>,
        polls: Mutex<u32>,
    }

    impl MemoryConnector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_job(&self, job: ClaimedJob) {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).push_back(job);
        }

        pub fn set_firewall(&self, vm_uuid: Uuid, state: FirewallState) {
            self.firewalls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(vm_uuid, state);
        }

        /// Make the next `n` polls fail with a transport error.
        pub fn fail_polls(&self, n: u32) {
            *self.poll_failures.lock().unwrap_or_else(|e| e.into_inner()) = n;
        }

        /// Make the next `n` acks fail with a transport error.
        pub fn fail_acks(&self, n: u32) {
            *self.ack_failures.lock().unwrap_or_else(|e| e.into_inner()) = n;
        }

        pub fn acks(&self) -> Vec<(JobId, JobOutcome)> {
            self.acks.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub fn polls(&self) -> u32 {
            *self.polls.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn take_failure(counter: &Mutex<u32>) -> bool {
            let mut remaining = counter.lock().unwrap_or_else(|e| e.into_inner());
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        }
    }

    #[async_trait]
    impl SwitchboardConnector for MemoryConnector {
        async fn poll(&self) -> Result<Option<ClaimedJob>, ConnectorError> {
            *self.polls.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            if Self::take_failure(&self.poll_failures) {
                return Err(ConnectorError::Transport("connection refused".to_string()));
            }
            Ok(self.pending.lock().unwrap_or_else(|e| e.into_inner()).pop_front())
        }

        async fn ack(&self, job_id: JobId, outcome: &JobOutcome) -> Result<(), ConnectorError> {
            if Self::take_failure(&self.ack_failures) {
                return Err(ConnectorError::Transport("connection reset".to_string()));
            }
            self.acks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((job_id, outcome.clone()));
            Ok(())
        }

        async fn firewall(&self, vm_uuid: Uuid) -> Result<FirewallState, ConnectorError> {
            self.firewalls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&vm_uuid)
                .cloned()
                .ok_or_else(|| ConnectorError::Rejected(format!("vm {vm_uuid} is not hosted on this node")))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeDelta;

    fn controller(url: &str) -> ControllerConfig {
        ControllerConfig {
            url: url.to_string(),
            token: Some("node-token".into()),
            token_file: None,
            request_timeout: TimeDelta::seconds(2),
        }
    }

    #[test]
    fn trailing_slash_is_dropped() {
        let connector = HttpConnector::new(&controller("http://localhost:8080/")).unwrap();
        assert_eq!(connector.base_url, "http://localhost:8080");
    }

    #[test]
    fn missing_token_fails_setup() {
        let mut config = controller("http://localhost:8080");
        config.token = None;
        assert!(matches!(
            HttpConnector::new(&config),
            Err(ConnectorSetupError::Token(ConfigError::MissingToken))
        ));
    }

    #[tokio::test]
    async fn unreachable_switchboard_is_transient() {
        // Port 9 (discard) on localhost is closed in test environments.
        let connector = HttpConnector::new(&controller("http://127.0.0.1:9")).unwrap();
        let err = connector.poll().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Transport(_)));
        assert!(err.is_transient());
    }
}
