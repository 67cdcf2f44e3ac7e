use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;

use crate::api::Credential;
use crate::error::Error;

/// The signed-in user as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Session {
    pub issuer: String,
    pub client_id: String,
    pub access_token: String,
    pub token_type: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// Raw ID token, kept as `id_token_hint` for sign-out.
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub session_state: Option<String>,
    /// ID token claims merged with userinfo claims.
    #[serde(default)]
    pub profile: Map<String, JsonValue>,
}

impl Session {
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        token_type: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            access_token: access_token.into(),
            token_type: token_type.into(),
            expires_at: None,
            id_token: None,
            scope: None,
            session_state: None,
            profile: Map::new(),
        }
    }

    #[must_use]
    pub fn with_expires_in(mut self, seconds: u64) -> Self {
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        self.expires_at =
            OffsetDateTime::now_utc().checked_add(time::Duration::seconds(seconds));
        self
    }

    #[must_use]
    pub fn with_profile(mut self, profile: Map<String, JsonValue>) -> Self {
        self.profile = profile;
        self
    }

    /// Expired once `expires_at` has passed; sessions without expiry never expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at <= OffsetDateTime::now_utc())
    }

    /// Time left until expiry, zero once expired.
    #[must_use]
    pub fn expires_in(&self) -> Option<std::time::Duration> {
        self.expires_at.map(|at| {
            let left = at - OffsetDateTime::now_utc();
            std::time::Duration::try_from(left).unwrap_or_default()
        })
    }

    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.profile.get("sub").and_then(JsonValue::as_str)
    }

    #[must_use]
    pub fn credential(&self) -> Credential {
        Credential::new(self.token_type.clone(), self.access_token.clone())
    }
}

/// Lifecycle state as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unauthenticated,
    Authenticating,
    Authenticated,
    RenewalPending,
    RenewalFailed,
}

/// State and session, replaced together on every transition.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub state: SessionState,
    pub session: Option<Arc<Session>>,
}

impl Snapshot {
    /// Credential for API calls, derived from this snapshot's session.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        self.session.as_ref().map(|s| s.credential())
    }
}

/// Why a silent renewal failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewError {
    pub reason: String,
    /// The provider requires user interaction; retrying is pointless.
    pub interaction_required: bool,
}

impl From<&Error> for RenewError {
    fn from(error: &Error) -> Self {
        let reason = match error {
            Error::Provider { error, .. } => error.clone(),
            Error::RenewalInteractionRequired => "interaction_required".into(),
            other => other.to_string(),
        };
        Self {
            reason,
            interaction_required: error.is_interaction_required(),
        }
    }
}

/// Notifications from the token engine, delivered in emission order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    AccessTokenExpiring,
    AccessTokenExpired,
    UserLoaded(Arc<Session>),
    UserUnloaded,
    SilentRenewError(RenewError),
    UserSignedOut,
}

/// Result of a `prompt=none` session check.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SessionStatus {
    pub sub: Option<String>,
    pub sid: Option<String>,
    pub session_state: Option<String>,
}
