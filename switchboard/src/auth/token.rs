//! Node tokens: generation, argon2id hashing and credential matching.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, TimeDelta, Utc};
use corral_rs::util::hex_slice::HexSlice;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::AuthError;
use crate::sql::node::NodeCredentials;

/// Generate a fresh node token: 32 random bytes, hex encoded.
pub fn generate() -> String {
    let bytes: [u8; 32] = rand::random();
    HexSlice(&bytes).to_string()
}

/// Key under which a verified token is cached. The plaintext is never kept.
pub fn cache_key(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

fn argon2() -> Result<Argon2<'static>, AuthError> {
    let params = Params::new(19456, 2, 1, None).map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash `token` into a PHC string for storage.
pub fn hash(token: &str) -> Result<String, AuthError> {
    let salt_bytes: [u8; 16] = rand::random();
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| AuthError::Hash(e.to_string()))?;
    let hash = argon2()?
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(hash.to_string())
}

/// Whether `token` matches the stored PHC string. A mismatch is `Ok(false)`;
/// only an unreadable stored hash is an error.
pub fn verify(token: &str, stored: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(stored).map_err(|e| AuthError::Hash(e.to_string()))?;
    match argon2()?.verify_password(token.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(AuthError::Hash(e.to_string())),
    }
}

/// Which stored credential a presented token matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMatch {
    Current,
    /// The pre-rotation hash, still inside its grace window.
    Previous,
    /// Legacy plaintext; the row should be upgraded to a hash.
    Legacy,
}

/// Verify against one stored hash of `credentials`. A stored value that is not a usable PHC
/// string never matches; it must not stop other nodes from authenticating.
fn stored_matches(credentials: &NodeCredentials, which: &'static str, token: &str, stored: &str) -> bool {
    match verify(token, stored) {
        Ok(matched) => matched,
        Err(e) => {
            tracing::warn!(node_id = %credentials.id, which, "ignoring unreadable token hash: {e}");
            false
        }
    }
}

/// Check `token` against one node's stored credentials in order: current
/// hash, previous hash while `now` is inside the grace window, then legacy
/// plaintext.
pub fn match_credentials(
    credentials: &NodeCredentials,
    token: &str,
    now: DateTime<Utc>,
    grace_period: TimeDelta,
) -> Option<CredentialMatch> {
    if let Some(current) = &credentials.token_hash {
        if stored_matches(credentials, "current", token, current) {
            return Some(CredentialMatch::Current);
        }
    }

    if let (Some(previous), Some(rotated_at)) =
        (&credentials.token_old_hash, credentials.token_rotated_at)
    {
        if now < rotated_at + grace_period && stored_matches(credentials, "previous", token, previous) {
            return Some(CredentialMatch::Previous);
        }
    }

    if let Some(legacy) = &credentials.token {
        if !legacy.is_empty() && bool::from(legacy.as_bytes().ct_eq(token.as_bytes())) {
            return Some(CredentialMatch::Legacy);
        }
    }

    None
}

/// Scan every node's credentials for the one `token` belongs to.
pub fn find_node(
    candidates: &[NodeCredentials],
    token: &str,
    now: DateTime<Utc>,
    grace_period: TimeDelta,
) -> Option<(Uuid, CredentialMatch)> {
    candidates.iter().find_map(|credentials| {
        match_credentials(credentials, token, now, grace_period).map(|m| (credentials.id, m))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn credentials() -> NodeCredentials {
        NodeCredentials {
            id: Uuid::new_v4(),
            token: None,
            token_hash: None,
            token_old_hash: None,
            token_rotated_at: None,
        }
    }

    #[test]
    fn generated_tokens_are_hex_and_distinct() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn hash_then_verify() {
        let stored = hash("s3cret").unwrap();
        assert!(stored.starts_with("$argon2id$"));
        assert!(verify("s3cret", &stored).unwrap());
        assert!(!verify("s3cret!", &stored).unwrap());
        assert!(verify("s3cret", "not a phc string").is_err());
    }

    #[test]
    fn current_hash_matches() {
        let mut creds = credentials();
        creds.token_hash = Some(hash("tok").unwrap());
        let m = match_credentials(&creds, "tok", Utc::now(), TimeDelta::hours(1));
        assert_eq!(m, Some(CredentialMatch::Current));
        let m = match_credentials(&creds, "other", Utc::now(), TimeDelta::hours(1));
        assert_eq!(m, None);
    }

    #[test]
    fn previous_hash_only_within_grace() {
        let rotated_at = Utc::now();
        let mut creds = credentials();
        creds.token_hash = Some(hash("new").unwrap());
        creds.token_old_hash = Some(hash("old").unwrap());
        creds.token_rotated_at = Some(rotated_at);

        let inside = rotated_at + TimeDelta::minutes(59);
        let outside = rotated_at + TimeDelta::minutes(61);
        assert_eq!(
            match_credentials(&creds, "old", inside, TimeDelta::hours(1)),
            Some(CredentialMatch::Previous)
        );
        assert_eq!(
            match_credentials(&creds, "old", outside, TimeDelta::hours(1)),
            None
        );
        assert_eq!(
            match_credentials(&creds, "new", outside, TimeDelta::hours(1)),
            Some(CredentialMatch::Current)
        );
    }

    #[test]
    fn legacy_plaintext_matches_exactly() {
        let mut creds = credentials();
        creds.token = Some("plain-token".into());
        let now = Utc::now();
        assert_eq!(
            match_credentials(&creds, "plain-token", now, TimeDelta::hours(1)),
            Some(CredentialMatch::Legacy)
        );
        assert_eq!(
            match_credentials(&creds, "plain-toke", now, TimeDelta::hours(1)),
            None
        );
    }

    #[test]
    fn unreadable_hash_is_not_a_match() {
        let now = Utc::now();
        let mut broken = credentials();
        broken.token_hash = Some(String::new());
        broken.token_old_hash = Some("$argon2id$v=19$truncated".into());
        broken.token_rotated_at = Some(now);
        assert_eq!(
            match_credentials(&broken, "some-other-nodes-token", now, TimeDelta::hours(1)),
            None
        );

        let mut healthy = credentials();
        healthy.token_hash = Some(hash("healthy-token").unwrap());
        let candidates = [broken, healthy.clone()];
        assert_eq!(
            find_node(&candidates, "healthy-token", now, TimeDelta::hours(1)),
            Some((healthy.id, CredentialMatch::Current))
        );
        assert_eq!(find_node(&candidates, "nobody", now, TimeDelta::hours(1)), None);
    }

    #[test]
    fn expired_previous_hash_falls_through_to_other_nodes() {
        let rotated_at = Utc::now() - TimeDelta::hours(2);
        let mut rotated = credentials();
        rotated.token_hash = Some(hash("rotated-new").unwrap());
        rotated.token_old_hash = Some(hash("rotated-old").unwrap());
        rotated.token_rotated_at = Some(rotated_at);

        let mut legacy = credentials();
        legacy.token = Some("legacy-plain".into());

        let candidates = [rotated.clone(), legacy.clone()];
        let now = Utc::now();
        assert_eq!(find_node(&candidates, "rotated-old", now, TimeDelta::hours(1)), None);
        assert_eq!(
            find_node(&candidates, "rotated-new", now, TimeDelta::hours(1)),
            Some((rotated.id, CredentialMatch::Current))
        );
        assert_eq!(
            find_node(&candidates, "legacy-plain", now, TimeDelta::hours(1)),
            Some((legacy.id, CredentialMatch::Legacy))
        );
    }

    #[test]
    fn empty_legacy_token_never_matches() {
        let mut creds = credentials();
        creds.token = Some(String::new());
        assert_eq!(match_credentials(&creds, "", Utc::now(), TimeDelta::hours(1)), None);
    }
}
