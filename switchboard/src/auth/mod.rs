//! Per-request authentication.
//!
//! Two kinds of callers talk to the switchboard:
//!   - administrators, who present the configured admin token as a bearer token on every
//!     `/api/v1` request (see [`extract::AdminAuth`]);
//!   - agents, who put their node token in the request body. [`NodeAuthenticator`] turns such a
//!     token into the id of the node it belongs to.

use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::sql;
use token::CredentialMatch;

pub mod extract;
pub mod token;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token does not belong to any node")]
    InvalidToken,
    #[error("no such node")]
    NoSuchNode,
    #[error("failed to look up node credentials: {0}")]
    Database(#[from] sqlx::Error),
    #[error("token hashing failed: {0}")]
    Hash(String),
}

struct CachedNode {
    node_id: Uuid,
    expires_at: Instant,
}

/// Verifies node tokens against the `nodes` table.
///
/// A presented token is checked against every node's current hash, its previous hash while the
/// rotation grace window is open, and finally its legacy plaintext token. Successful
/// verifications are cached for a short while, keyed by the token's SHA-256, so a polling agent
/// does not pay for an argon2 verification on every request.
pub struct NodeAuthenticator {
    pool: PgPool,
    grace_period: TimeDelta,
    cache_ttl: Duration,
    cache: DashMap<[u8; 32], CachedNode>,
}

impl NodeAuthenticator {
    pub fn new(pool: PgPool, grace_period: TimeDelta, cache_ttl: TimeDelta) -> Self {
        NodeAuthenticator {
            pool,
            grace_period,
            cache_ttl: cache_ttl.to_std().unwrap_or(Duration::ZERO),
            cache: DashMap::new(),
        }
    }

    fn cached(&self, key: &[u8; 32]) -> Option<Uuid> {
        let entry = self.cache.get(key)?;
        if entry.expires_at > Instant::now() {
            Some(entry.node_id)
        } else {
            drop(entry);
            self.cache.remove(key);
            None
        }
    }

    /// Resolve `token` to the node it belongs to.
    #[instrument(skip_all)]
    pub async fn authenticate(&self, token: &str) -> Result<Uuid, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        let key = token::cache_key(token);
        if let Some(node_id) = self.cached(&key) {
            return Ok(node_id);
        }

        let candidates = sql::node::fetch_credentials(&self.pool).await?;
        let presented = token.to_string();
        let grace_period = self.grace_period;
        // argon2 verification is deliberately slow; keep it off the async workers.
        let matched = tokio::task::spawn_blocking(move || {
            token::find_node(&candidates, &presented, Utc::now(), grace_period)
        })
        .await
        .map_err(|e| AuthError::Hash(e.to_string()))?;

        let Some((node_id, how)) = matched else {
            tracing::warn!("rejected unknown node token");
            return Err(AuthError::InvalidToken);
        };

        match how {
            CredentialMatch::Current => {}
            CredentialMatch::Previous => {
                tracing::info!(%node_id, "node authenticated with its pre-rotation token");
            }
            CredentialMatch::Legacy => self.upgrade_legacy(node_id, token).await,
        }

        if !self.cache_ttl.is_zero() {
            self.cache.insert(
                key,
                CachedNode {
                    node_id,
                    expires_at: Instant::now() + self.cache_ttl,
                },
            );
        }
        Ok(node_id)
    }

    /// Replace a legacy plaintext token with its hash. Failure only means the upgrade is
    /// retried on the next uncached authentication.
    async fn upgrade_legacy(&self, node_id: Uuid, token: &str) {
        let presented = token.to_string();
        let hashed = match tokio::task::spawn_blocking(move || token::hash(&presented)).await {
            Ok(Ok(hashed)) => hashed,
            Ok(Err(e)) => {
                tracing::error!(%node_id, "failed to hash legacy token: {e}");
                return;
            }
            Err(e) => {
                tracing::error!(%node_id, "legacy token hashing task failed: {e}");
                return;
            }
        };
        match sql::node::upgrade_legacy_token(node_id, &hashed, &self.pool).await {
            Ok(()) => tracing::info!(%node_id, "upgraded legacy plaintext token to argon2id"),
            Err(e) => tracing::error!(%node_id, "failed to store upgraded token: {e}"),
        }
    }

    /// Issue a new token for `node_id`. The current hash stays valid for the grace period.
    #[instrument(skip(self))]
    pub async fn rotate(&self, node_id: Uuid) -> Result<String, AuthError> {
        let new_token = token::generate();
        let presented = new_token.clone();
        let hashed = tokio::task::spawn_blocking(move || token::hash(&presented))
            .await
            .map_err(|e| AuthError::Hash(e.to_string()))??;
        if !sql::node::rotate_token(node_id, &hashed, Utc::now(), &self.pool).await? {
            return Err(AuthError::NoSuchNode);
        }
        self.evict(node_id);
        Ok(new_token)
    }

    /// Drop every cached verification for `node_id`.
    pub fn evict(&self, node_id: Uuid) {
        self.cache.retain(|_, cached| cached.node_id != node_id);
    }
}

/// Helper macro for adding a [`From`] impl for [`AuthError`] to a given response type.
///
/// Syntax:
/// ```rs
/// impl_from_auth_err!(MyResponseTy, Internal => Internal, Unauthorized => Unauthorized);
/// ```
#[macro_export]
macro_rules! impl_from_auth_err {
    ($t:ident, Internal => $internal:ident, Unauthorized => $unauth:ident) => {
        impl ::core::convert::From<$crate::auth::AuthError> for $t {
            fn from(value: $crate::auth::AuthError) -> Self {
                match value {
                    $crate::auth::AuthError::InvalidToken | $crate::auth::AuthError::NoSuchNode => {
                        $t::$unauth
                    }
                    $crate::auth::AuthError::Database(_) | $crate::auth::AuthError::Hash(_) => {
                        $t::$internal
                    }
                }
            }
        }
    };
}
pub use impl_from_auth_err;

#[cfg(test)]
mod test {
    use super::*;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

    fn authenticator() -> NodeAuthenticator {
        let pool = PgPoolOptions::new().connect_lazy_with(PgConnectOptions::new());
        NodeAuthenticator::new(pool, TimeDelta::hours(1), TimeDelta::seconds(60))
    }

    #[tokio::test]
    async fn cache_hit_and_eviction() {
        let auth = authenticator();
        let node_a = Uuid::new_v4();
        let node_b = Uuid::new_v4();
        for (token, node_id) in [("a1", node_a), ("a2", node_a), ("b1", node_b)] {
            auth.cache.insert(
                token::cache_key(token),
                CachedNode {
                    node_id,
                    expires_at: Instant::now() + Duration::from_secs(60),
                },
            );
        }

        // Served from the cache without touching the (unreachable) database.
        assert_eq!(auth.authenticate("a1").await.unwrap(), node_a);

        auth.evict(node_a);
        assert!(auth.cached(&token::cache_key("a1")).is_none());
        assert!(auth.cached(&token::cache_key("a2")).is_none());
        assert_eq!(auth.cached(&token::cache_key("b1")), Some(node_b));
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let auth = authenticator();
        let key = token::cache_key("stale");
        auth.cache.insert(
            key,
            CachedNode {
                node_id: Uuid::new_v4(),
                expires_at: Instant::now() - Duration::from_secs(1),
            },
        );
        assert!(auth.cached(&key).is_none());
        assert!(auth.cache.is_empty());
    }

    #[tokio::test]
    async fn empty_token_is_rejected_up_front() {
        assert!(matches!(
            authenticator().authenticate("").await,
            Err(AuthError::InvalidToken)
        ));
    }
}
