//! Password verifiers and bearer tokens.
//!
//! Passwords are stored as bcrypt hashes (adaptive cost, salted, and
//! verified in constant time by the library). Tokens are opaque and rotate
//! on every login; both travel with the user record through gossip so any
//! metadata node can authenticate the client.

use anyhow::Result;
use axum::http::HeaderMap;
use bcrypt::DEFAULT_COST;

use crate::model::UserRecord;
use crate::state::AppState;

pub fn hash_password(password: &str) -> Result<String> {
    Ok(bcrypt::hash(password, DEFAULT_COST)?)
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    bcrypt::verify(password, stored).unwrap_or(false)
}

pub fn generate_token() -> String {
    format!("rc-{}", uuid::Uuid::new_v4().simple())
}

/// Resolve the bearer token in `Authorization` to a user record.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<UserRecord, crate::api::ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(crate::api::ApiError::Unauthorized)?;

    state
        .store
        .user_by_token(token)
        .map_err(crate::api::ApiError::internal)?
        .ok_or(crate::api::ApiError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_verification_roundtrip() {
        let stored = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
    }

    #[test]
    fn same_password_hashes_differently_per_user() {
        // bcrypt salts every hash
        assert_ne!(
            hash_password("hunter2").unwrap(),
            hash_password("hunter2").unwrap()
        );
    }

    #[test]
    fn malformed_verifier_never_matches() {
        assert!(!verify_password("anything", "not-a-bcrypt-hash"));
        assert!(!verify_password("anything", ""));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }
}
