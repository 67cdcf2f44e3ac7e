use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier attached to every dispatched API request for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From, Into)]
pub struct RequestId(pub Ulid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-assigned change subscription identifier.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

/// Server-assigned push webhook identifier.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct WebhookId(pub String);

/// Key under which a request's result is kept, derived from the endpoint path.
///
/// `/me/calendar/events?$top=10` becomes `calendar/events`; `/users` becomes `users`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct ResultKey(pub String);

impl ResultKey {
    #[must_use]
    pub fn from_endpoint(endpoint: &str) -> Self {
        let path = endpoint.split(['?', '#']).next().unwrap_or_default();
        let path = path.strip_prefix("/me/").unwrap_or(path);
        Self(path.trim_start_matches('/').to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
