use serde_json::{Map, Value as JsonValue};
use tokio::sync::OnceCell;
use url::Url;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::nonce;
use crate::well_known::{self, ProviderMetadata};

/// OpenID Connect implicit-flow client.
///
/// Holds the configuration and lazily fetches the provider metadata on first use.
pub struct OidcClient {
    config: ClientConfig,
    http: reqwest::Client,
    metadata: OnceCell<ProviderMetadata>,
}

/// Authorization URL with the values that must be kept until the callback.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: String,
    pub nonce: Option<String>,
}

/// Parameters the provider returned to a redirect URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct SigninResponse {
    pub state: Option<String>,
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
    pub session_state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl SigninResponse {
    /// Whether `location` is a provider response addressed to `redirect_uri`.
    ///
    /// Scheme, host, port and path must match exactly. A redirect URI with a
    /// fragment (e.g. `#callback`) also requires that marker to lead the
    /// location's fragment.
    #[must_use]
    pub fn is_callback(location: &Url, redirect_uri: &Url) -> bool {
        let same_target = location.scheme() == redirect_uri.scheme()
            && location.host_str() == redirect_uri.host_str()
            && location.port_or_known_default() == redirect_uri.port_or_known_default()
            && location.path() == redirect_uri.path();
        let marked = match redirect_uri.fragment() {
            Some(marker) => location.fragment().is_some_and(|f| {
                f.strip_prefix(marker)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('&'))
            }),
            None => true,
        };
        same_target
            && marked
            && Self::from_callback(location, redirect_uri)
                .is_ok_and(|r| r.state.is_some() || r.error.is_some())
    }

    /// Parse response parameters from the fragment (implicit flow), falling back to the query.
    ///
    /// A fragment that `redirect_uri` itself carries (e.g. `#callback`) is not a parameter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if `expires_in` is not a number.
    pub fn from_callback(location: &Url, redirect_uri: &Url) -> Result<Self, Error> {
        let own_fragment = redirect_uri.fragment().unwrap_or_default();
        let params = location
            .fragment()
            .map(|f| f.strip_prefix(own_fragment).unwrap_or(f))
            .filter(|f| f.contains('='))
            .or(location.query())
            .unwrap_or_default();

        let mut response = Self::default();
        for (key, value) in url::form_urlencoded::parse(params.as_bytes()) {
            let value = value.into_owned();
            match key.as_ref() {
                "state" => response.state = Some(value),
                "id_token" => response.id_token = Some(value),
                "access_token" => response.access_token = Some(value),
                "token_type" => response.token_type = Some(value),
                "expires_in" => {
                    let secs = value.parse().map_err(|_| {
                        Error::AuthenticationFailed(format!("invalid expires_in: {value}"))
                    })?;
                    response.expires_in = Some(secs);
                }
                "scope" => response.scope = Some(value),
                "session_state" => response.session_state = Some(value),
                "error" => response.error = Some(value),
                "error_description" => response.error_description = Some(value),
                _ => {}
            }
        }
        Ok(response)
    }

    /// The provider's error, if it answered with one.
    #[must_use]
    pub fn provider_error(&self) -> Option<Error> {
        self.error.as_ref().map(|error| Error::Provider {
            error: error.clone(),
            description: self.error_description.clone(),
        })
    }
}

/// Location with query and fragment removed, so callback parameters do not stay in history.
#[must_use]
pub fn scrub_callback(location: &Url) -> Url {
    let mut clean = location.clone();
    clean.set_query(None);
    clean.set_fragment(None);
    clean
}

impl OidcClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            metadata: OnceCell::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Provider metadata, fetched once from the discovery endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, [`Error::Oidc`] if the
    /// endpoint fails or the document names a different issuer.
    pub async fn metadata(&self) -> Result<&ProviderMetadata, Error> {
        self.metadata
            .get_or_try_init(|| async {
                let url = well_known::discovery_url(&self.config.issuer).map_err(|e| {
                    Error::Config(format!("issuer cannot be joined: {e}"))
                })?;
                tracing::debug!(url = %url, "Fetching OIDC discovery document");

                let response = self.http.get(url).send().await?;
                let response = Self::ensure_success(response, "discovery").await?;
                let metadata = response.json::<ProviderMetadata>().await?;

                if !metadata.matches_issuer(self.config.issuer.as_str()) {
                    return Err(Error::Oidc {
                        operation: "discovery",
                        status: None,
                        detail: format!("issuer mismatch: {}", metadata.issuer),
                    });
                }
                Ok(metadata)
            })
            .await
    }

    /// Build an authorization URL for the configured client.
    ///
    /// `prompt` is `Some("none")` for silent requests.
    ///
    /// # Errors
    ///
    /// Returns the discovery error if provider metadata is unavailable.
    pub async fn authorization_url(
        &self,
        redirect_uri: &Url,
        response_type: &str,
        prompt: Option<&str>,
    ) -> Result<AuthorizationRequest, Error> {
        let metadata = self.metadata().await?;

        let state = nonce::generate_state();
        let nonce = response_type
            .split_whitespace()
            .any(|t| t == "id_token")
            .then(nonce::generate_nonce);
        let scope = self.config.scopes.join(" ");

        let mut url = metadata.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", redirect_uri.as_str())
                .append_pair("response_type", response_type)
                .append_pair("scope", &scope)
                .append_pair("state", &state);
            if let Some(nonce) = &nonce {
                query.append_pair("nonce", nonce);
            }
            if let Some(prompt) = prompt {
                query.append_pair("prompt", prompt);
            }
        }

        Ok(AuthorizationRequest { url, state, nonce })
    }

    /// Fetch userinfo claims using an access token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Oidc`] if the provider has no userinfo endpoint or the
    /// request fails, [`Error::Http`] on network failure.
    pub async fn get_user_info(&self, access_token: &str) -> Result<Map<String, JsonValue>, Error> {
        let metadata = self.metadata().await?;
        let endpoint = metadata.userinfo_endpoint.clone().ok_or(Error::Oidc {
            operation: "userinfo request",
            status: None,
            detail: "provider has no userinfo endpoint".into(),
        })?;

        let response = self.http.get(endpoint).bearer_auth(access_token).send().await?;
        let response = Self::ensure_success(response, "userinfo request").await?;
        response
            .json::<Map<String, JsonValue>>()
            .await
            .map_err(Into::into)
    }

    /// Provider sign-out URL, if the provider supports RP-initiated logout.
    ///
    /// # Errors
    ///
    /// Returns the discovery error if provider metadata is unavailable.
    pub async fn end_session_url(&self, id_token_hint: Option<&str>) -> Result<Option<Url>, Error> {
        let metadata = self.metadata().await?;
        let Some(mut url) = metadata.end_session_endpoint.clone() else {
            return Ok(None);
        };
        {
            let mut query = url.query_pairs_mut();
            if let Some(hint) = id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
            if let Some(target) = &self.config.post_logout_redirect_uri {
                query.append_pair("post_logout_redirect_uri", target.as_str());
            }
            query.append_pair("state", &nonce::generate_state());
        }
        Ok(Some(url))
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Oidc {
            operation,
            status: Some(status),
            detail: body,
        })
    }
}
