#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Interactive sign-in was rejected or the callback was malformed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    /// Silent renewal needs user interaction; never retried.
    #[error("Silent renewal requires user interaction")]
    RenewalInteractionRequired,
    /// Silent renewal failed for a transient reason.
    #[error("Silent renewal failed: {0}")]
    RenewalFailed(String),
    /// The provider answered the authorization request with an error.
    #[error("Provider error: {error}")]
    Provider {
        error: String,
        description: Option<String>,
    },
    /// API response was not `application/json`.
    #[error("Unexpected content type: {}", .0.as_deref().unwrap_or("none"))]
    UnexpectedContentType(Option<String>),
    /// Network-level failure; no HTTP status was received.
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("API error: HTTP {status}")]
    Api { status: u16, detail: String },
    #[error("OIDC {operation} failed{}: {detail}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Oidc {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ID token error: {0}")]
    IdToken(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Token store error: {0}")]
    Store(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the provider refused a `prompt=none` request because the user must interact.
    #[must_use]
    pub fn is_interaction_required(&self) -> bool {
        match self {
            Self::RenewalInteractionRequired => true,
            Self::Provider { error, .. } => matches!(
                error.as_str(),
                "interaction_required"
                    | "login_required"
                    | "consent_required"
                    | "account_selection_required"
            ),
            _ => false,
        }
    }
}
