use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::oidc::AuthorizationRequest;
use crate::store::TokenStore;

const SIGNIN_PREFIX: &str = "kapi-client.signin:";
const USER_PREFIX: &str = "kapi-client.user:";

/// Values kept between an authorization request and its callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct SigninState {
    pub(super) state: String,
    pub(super) nonce: Option<String>,
    pub(super) redirect_uri: String,
    pub(super) created_at: i64,
}

impl SigninState {
    pub(super) fn new(request: &AuthorizationRequest, redirect_uri: &url::Url) -> Self {
        Self {
            state: request.state.clone(),
            nonce: request.nonce.clone(),
            redirect_uri: redirect_uri.to_string(),
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    fn is_stale(&self, ttl: Duration) -> bool {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        OffsetDateTime::now_utc().unix_timestamp() - self.created_at > ttl
    }
}

/// Persist the pending state for the authorization request.
pub(super) fn save<S: TokenStore>(store: &S, signin: &SigninState) -> Result<(), Error> {
    let value = serde_json::to_string(signin)?;
    store
        .set(&format!("{SIGNIN_PREFIX}{}", signin.state), &value)
        .map_err(|e| Error::Store(e.to_string()))
}

/// Remove and return the pending state for `state`.
///
/// Each state is usable once; stale entries are discarded and reported as missing.
pub(super) fn take<S: TokenStore>(
    store: &S,
    state: &str,
    ttl: Duration,
) -> Result<Option<SigninState>, Error> {
    let key = format!("{SIGNIN_PREFIX}{state}");
    let Some(value) = store.get(&key).map_err(|e| Error::Store(e.to_string()))? else {
        return Ok(None);
    };
    store.remove(&key).map_err(|e| Error::Store(e.to_string()))?;

    let signin: SigninState = serde_json::from_str(&value)?;
    if signin.is_stale(ttl) {
        tracing::debug!(state = %state, "Discarding stale sign-in state");
        return Ok(None);
    }
    Ok(Some(signin))
}

/// Store key of the signed-in user for this issuer and client.
pub(super) fn user_key(config: &ClientConfig) -> String {
    format!("{USER_PREFIX}{}:{}", config.issuer(), config.client_id())
}
