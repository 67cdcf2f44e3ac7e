use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;

use crate::error::Error;
use crate::nonce;

/// Allowed clock difference when checking `exp`.
const CLOCK_SKEW_SECONDS: i64 = 300;

/// Claims decoded from an ID token.
///
/// Signature verification is the provider library's concern; these claims are
/// checked for issuer, audience, nonce, expiry and `at_hash` only.
#[derive(Debug, Clone)]
pub struct IdTokenClaims {
    inner: Map<String, JsonValue>,
}

impl IdTokenClaims {
    /// Gets a claim value by key.
    #[must_use]
    pub fn get_claim(&self, key: &str) -> Option<&JsonValue> {
        self.inner.get(key)
    }

    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.inner.get("sub").and_then(JsonValue::as_str)
    }

    #[must_use]
    pub fn into_map(self) -> Map<String, JsonValue> {
        self.inner
    }
}

/// Expected values an ID token must carry.
pub struct Expectations<'a> {
    pub issuer: &'a str,
    pub client_id: &'a str,
    pub nonce: Option<&'a str>,
    pub access_token: Option<&'a str>,
}

/// Decodes the payload of a compact JWS without verifying its signature.
///
/// # Errors
///
/// Returns `Error::IdToken` if the token is not three dot-separated parts or
/// the payload is not a base64url-encoded JSON object.
pub fn decode_claims(token: &str) -> Result<IdTokenClaims, Error> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(Error::IdToken("invalid token format".into()));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|_| Error::IdToken("invalid payload encoding".into()))?;

    match serde_json::from_slice::<JsonValue>(&payload) {
        Ok(JsonValue::Object(inner)) => Ok(IdTokenClaims { inner }),
        _ => Err(Error::IdToken("invalid payload".into())),
    }
}

/// Decodes an ID token and checks it against the authorization request.
///
/// # Errors
///
/// Returns `Error::IdToken` on a malformed token or any claim mismatch.
pub fn validate(token: &str, expected: &Expectations<'_>) -> Result<IdTokenClaims, Error> {
    let claims = decode_claims(token)?;

    let actual_issuer = claims
        .get_claim("iss")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| Error::IdToken("missing claim: iss".into()))?;
    if actual_issuer.trim_end_matches('/') != expected.issuer.trim_end_matches('/') {
        return Err(Error::IdToken(format!(
            "iss: expected '{}', got '{actual_issuer}'",
            expected.issuer
        )));
    }

    // `aud` is either a single string or an array of strings.
    let audience_ok = match claims.get_claim("aud") {
        Some(JsonValue::String(aud)) => aud == expected.client_id,
        Some(JsonValue::Array(auds)) => auds
            .iter()
            .any(|a| a.as_str() == Some(expected.client_id)),
        _ => return Err(Error::IdToken("missing claim: aud".into())),
    };
    if !audience_ok {
        return Err(Error::IdToken(format!(
            "aud: expected '{}'",
            expected.client_id
        )));
    }

    if claims.subject().is_none() {
        return Err(Error::IdToken("missing claim: sub".into()));
    }

    if let Some(expected_nonce) = expected.nonce {
        let actual = claims.get_claim("nonce").and_then(JsonValue::as_str);
        if actual != Some(expected_nonce) {
            return Err(Error::IdToken("nonce mismatch".into()));
        }
    }

    let exp = claims
        .get_claim("exp")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| Error::IdToken("missing claim: exp".into()))?;
    if exp + CLOCK_SKEW_SECONDS < OffsetDateTime::now_utc().unix_timestamp() {
        return Err(Error::IdToken("token expired".into()));
    }

    if let (Some(access_token), Some(at_hash)) = (
        expected.access_token,
        claims.get_claim("at_hash").and_then(JsonValue::as_str),
    ) {
        if nonce::compute_at_hash(access_token) != at_hash {
            return Err(Error::IdToken("at_hash mismatch".into()));
        }
    }

    Ok(claims)
}

#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &JsonValue) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}
