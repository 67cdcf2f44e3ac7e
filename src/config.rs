use std::time::Duration;

use url::Url;

use crate::error::Error;

/// Governs automatic background renewal and what happens when it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct RenewalPolicy {
    pub enabled: bool,
    pub retry_delay: Duration,
    pub expiring_notification_lead: Duration,
    /// Consecutive failed renewals tolerated before the session is dropped.
    /// `None` retries for as long as the session stays valid.
    pub max_retries: Option<u32>,
    /// Double the delay after every consecutive failure.
    pub exponential_backoff: bool,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_delay: Duration::from_millis(5000),
            expiring_notification_lead: Duration::from_secs(60),
            max_retries: None,
            exponential_backoff: false,
        }
    }
}

impl RenewalPolicy {
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_expiring_notification_lead(mut self, lead: Duration) -> Self {
        self.expiring_notification_lead = lead;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max: Option<u32>) -> Self {
        self.max_retries = max;
        self
    }

    #[must_use]
    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential_backoff || attempt <= 1 {
            return self.retry_delay;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }

    /// Whether another retry is allowed after `failures` consecutive failures.
    #[must_use]
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_retries.is_none_or(|max| failures <= max)
    }
}

/// OIDC client configuration.
///
/// Required fields are constructor parameters; everything else has a default
/// and can be overridden with the `with_*` methods.
///
/// ```rust,ignore
/// use kapi_client::ClientConfig;
///
/// let config = ClientConfig::new(
///     "https://idp.example".parse()?,
///     "kapi-client",
///     "https://app.example/#callback".parse()?,
/// )
/// .with_scopes(vec!["openid".into(), "profile".into()]);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) issuer: Url,
    pub(crate) client_id: String,
    pub(crate) redirect_uri: Url,
    pub(crate) silent_redirect_uri: Option<Url>,
    pub(crate) post_logout_redirect_uri: Option<Url>,
    pub(crate) scopes: Vec<String>,
    pub(crate) response_type: String,
    pub(crate) load_user_info: bool,
    pub(crate) renewal: RenewalPolicy,
    pub(crate) signin_state_ttl: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(issuer: Url, client_id: impl Into<String>, redirect_uri: Url) -> Self {
        Self {
            issuer,
            client_id: client_id.into(),
            redirect_uri,
            silent_redirect_uri: None,
            post_logout_redirect_uri: None,
            scopes: vec!["openid".into(), "profile".into(), "email".into()],
            response_type: "id_token token".into(),
            load_user_info: true,
            renewal: RenewalPolicy::default(),
            signin_state_ttl: Duration::from_secs(5 * 60),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `KAPI_ISS`: issuer URL
    /// - `KAPI_CLIENT_ID`: client ID registered with the issuer
    /// - `KAPI_REDIRECT_URI`: interactive sign-in callback URI
    ///
    /// # Optional env vars
    /// - `KAPI_SCOPES`: comma-separated scopes
    /// - `KAPI_SILENT_REDIRECT_URI`: callback for silent renewal
    /// - `KAPI_POST_LOGOUT_REDIRECT_URI`: target after provider sign-out
    /// - `KAPI_LOAD_USER_INFO`: `"0"` or `"false"` skips the userinfo request
    /// - `KAPI_SILENT_RENEW`: `"0"` or `"false"` disables automatic renewal
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required env vars are missing or URLs are invalid.
    pub fn from_env() -> Result<Self, Error> {
        let issuer = required_url("KAPI_ISS")?;
        let client_id = std::env::var("KAPI_CLIENT_ID")
            .map_err(|_| Error::Config("KAPI_CLIENT_ID is required".into()))?;
        let redirect_uri = required_url("KAPI_REDIRECT_URI")?;

        let mut config = Self::new(issuer, client_id, redirect_uri);

        if let Ok(scopes) = std::env::var("KAPI_SCOPES") {
            config =
                config.with_scopes(scopes.split(',').map(|s| s.trim().to_string()).collect());
        }
        if let Some(url) = optional_url("KAPI_SILENT_REDIRECT_URI")? {
            config = config.with_silent_redirect_uri(url);
        }
        if let Some(url) = optional_url("KAPI_POST_LOGOUT_REDIRECT_URI")? {
            config = config.with_post_logout_redirect_uri(url);
        }
        if is_disabled("KAPI_LOAD_USER_INFO") {
            config = config.with_load_user_info(false);
        }
        if is_disabled("KAPI_SILENT_RENEW") {
            let renewal = config.renewal.clone().with_enabled(false);
            config = config.with_renewal(renewal);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_silent_redirect_uri(mut self, url: Url) -> Self {
        self.silent_redirect_uri = Some(url);
        self
    }

    #[must_use]
    pub fn with_post_logout_redirect_uri(mut self, url: Url) -> Self {
        self.post_logout_redirect_uri = Some(url);
        self
    }

    /// Override the requested scopes (default: `["openid", "profile", "email"]`).
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Override the response type (default: `"id_token token"`).
    #[must_use]
    pub fn with_response_type(mut self, response_type: impl Into<String>) -> Self {
        self.response_type = response_type.into();
        self
    }

    #[must_use]
    pub fn with_load_user_info(mut self, load: bool) -> Self {
        self.load_user_info = load;
        self
    }

    #[must_use]
    pub fn with_renewal(mut self, renewal: RenewalPolicy) -> Self {
        self.renewal = renewal;
        self
    }

    #[must_use]
    pub fn with_signin_state_ttl(mut self, ttl: Duration) -> Self {
        self.signin_state_ttl = ttl;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &Url {
        &self.issuer
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Silent renewal callback; falls back to the interactive redirect URI.
    #[must_use]
    pub fn silent_redirect_uri(&self) -> &Url {
        self.silent_redirect_uri.as_ref().unwrap_or(&self.redirect_uri)
    }

    #[must_use]
    pub fn post_logout_redirect_uri(&self) -> Option<&Url> {
        self.post_logout_redirect_uri.as_ref()
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    #[must_use]
    pub fn response_type(&self) -> &str {
        &self.response_type
    }

    #[must_use]
    pub fn load_user_info(&self) -> bool {
        self.load_user_info
    }

    #[must_use]
    pub fn renewal(&self) -> &RenewalPolicy {
        &self.renewal
    }

    #[must_use]
    pub fn signin_state_ttl(&self) -> Duration {
        self.signin_state_ttl
    }
}

/// Groupware API endpoint layout.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ApiConfig {
    pub(crate) base_url: Url,
    pub(crate) gc_prefix: String,
    pub(crate) pubs_prefix: String,
}

impl ApiConfig {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            gc_prefix: "/api/gc/v1".into(),
            pubs_prefix: "/api/pubs/v1".into(),
        }
    }

    /// Create config from `KAPI_API_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the variable is missing or not a URL.
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self::new(required_url("KAPI_API_URL")?))
    }

    #[must_use]
    pub fn with_gc_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.gc_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_pubs_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.pubs_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn gc_prefix(&self) -> &str {
        &self.gc_prefix
    }

    #[must_use]
    pub fn pubs_prefix(&self) -> &str {
        &self.pubs_prefix
    }

    /// Resolve a GC API endpoint. Absolute URLs pass through unchanged.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed endpoints.
    pub fn gc_url(&self, endpoint: &str) -> Result<Url, url::ParseError> {
        resolve(&self.base_url, &self.gc_prefix, endpoint)
    }

    /// Resolve a link returned by the server (e.g. `@odata.nextLink`).
    ///
    /// Links are absolute or path-absolute and already carry the API prefix,
    /// so they are joined onto the base URL as is.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed links.
    pub fn link_url(&self, link: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(link)
    }

    /// Resolve a push-notification service endpoint.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed endpoints.
    pub fn pubs_url(&self, endpoint: &str) -> Result<Url, url::ParseError> {
        resolve(&self.base_url, &self.pubs_prefix, endpoint)
    }
}

fn resolve(base: &Url, prefix: &str, endpoint: &str) -> Result<Url, url::ParseError> {
    if let Ok(absolute) = Url::parse(endpoint) {
        return Ok(absolute);
    }
    let prefix = prefix.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    base.join(&format!("{prefix}/{endpoint}"))
}

fn required_url(name: &str) -> Result<Url, Error> {
    let value =
        std::env::var(name).map_err(|_| Error::Config(format!("{name} is required")))?;
    value
        .parse()
        .map_err(|e| Error::Config(format!("{name}: {e}")))
}

fn optional_url(name: &str) -> Result<Option<Url>, Error> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn is_disabled(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("0") | Ok("false"))
}
