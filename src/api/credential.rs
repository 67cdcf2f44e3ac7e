use std::fmt;

/// Authorization credential passed explicitly into every API call.
///
/// Derived from a [`Session`](crate::session::Session); there is no
/// process-wide default header.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token_type: String,
    access_token: String,
}

impl Credential {
    /// An empty `token_type` falls back to `Bearer`.
    #[must_use]
    pub fn new(token_type: impl Into<String>, access_token: impl Into<String>) -> Self {
        let token_type = token_type.into();
        Self {
            token_type: if token_type.is_empty() {
                "Bearer".into()
            } else {
                token_type
            },
            access_token: access_token.into(),
        }
    }

    #[must_use]
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self::new("Bearer", access_token)
    }

    #[must_use]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Value for the `Authorization` header.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

// Keep tokens out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token_type", &self.token_type)
            .field("access_token", &"<redacted>")
            .finish()
    }
}
