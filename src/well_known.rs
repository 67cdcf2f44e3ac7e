use serde::{Deserialize, Serialize};
use url::Url;

/// Path of the OIDC discovery document, relative to the issuer.
pub const OPENID_CONFIGURATION_PATH: &str = ".well-known/openid-configuration";

/// OpenID Provider metadata (`/.well-known/openid-configuration`).
///
/// Only the endpoints the implicit flow uses are modelled; unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: Url,
    #[serde(default)]
    pub userinfo_endpoint: Option<Url>,
    #[serde(default)]
    pub end_session_endpoint: Option<Url>,
    #[serde(default)]
    pub check_session_iframe: Option<Url>,
    #[serde(default)]
    pub jwks_uri: Option<Url>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Whether `issuer` names the same provider, ignoring a trailing slash.
    #[must_use]
    pub fn matches_issuer(&self, issuer: &str) -> bool {
        self.issuer.trim_end_matches('/') == issuer.trim_end_matches('/')
    }
}

/// Discovery document URL for an issuer.
///
/// # Errors
///
/// Returns the parse error if the joined URL is invalid.
pub fn discovery_url(issuer: &Url) -> Result<Url, url::ParseError> {
    let mut base = issuer.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(OPENID_CONFIGURATION_PATH)
}
