use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use time::OffsetDateTime;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::browser::Browser;
use crate::config::ClientConfig;
use crate::id_token;
use crate::nonce;

pub(crate) const SUBJECT: &str = "user-1";

/// Provider with a discovery document; endpoints live on the same server.
pub(crate) async fn mock_provider() -> MockServer {
    let server = MockServer::start().await;
    let uri = server.uri();
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": uri,
            "authorization_endpoint": format!("{uri}/authorize"),
            "userinfo_endpoint": format!("{uri}/userinfo"),
            "end_session_endpoint": format!("{uri}/endsession"),
        })))
        .mount(&server)
        .await;
    server
}

pub(crate) async fn mock_userinfo(server: &MockServer, sub: &str) {
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": sub,
            "email": format!("{sub}@example.com"),
        })))
        .mount(server)
        .await;
}

pub(crate) fn test_config(issuer: &str) -> ClientConfig {
    ClientConfig::new(
        issuer.parse().expect("valid issuer"),
        "c1",
        "https://app.example/#callback".parse().expect("valid redirect"),
    )
    .with_silent_redirect_uri("https://app.example/silent".parse().expect("valid redirect"))
    .with_load_user_info(false)
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SilentOutcome {
    Grant(u64),
    ProviderError(&'static str),
    FrameFailure,
}

/// Browser that plays the provider's part: it answers authorization URLs itself.
pub(crate) struct FakeBrowser {
    issuer: String,
    location: Mutex<Url>,
    navigations: Mutex<Vec<Url>>,
    replaced: Mutex<Vec<Url>>,
    outcomes: Mutex<VecDeque<SilentOutcome>>,
    silent_calls: AtomicUsize,
    issued: AtomicUsize,
}

impl FakeBrowser {
    pub(crate) fn new(issuer: &str, location: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            location: Mutex::new(location.parse().expect("valid location")),
            navigations: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            outcomes: Mutex::new(VecDeque::new()),
            silent_calls: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_location(&self, url: Url) {
        *self.location.lock().unwrap() = url;
    }

    pub(crate) fn navigations(&self) -> Vec<Url> {
        self.navigations.lock().unwrap().clone()
    }

    pub(crate) fn replaced(&self) -> Vec<Url> {
        self.replaced.lock().unwrap().clone()
    }

    /// Queue the answer for the next silent request; the default is a one-hour grant.
    pub(crate) fn push_outcome(&self, outcome: SilentOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub(crate) fn silent_calls(&self) -> usize {
        self.silent_calls.load(Ordering::SeqCst)
    }

    /// Answer the last interactive navigation with tokens and move there.
    pub(crate) fn grant_last_navigation(&self, expires_in: u64) -> Url {
        let request = self.navigations().pop().expect("no navigation");
        let callback = self.respond(&request, SilentOutcome::Grant(expires_in));
        self.set_location(callback.clone());
        callback
    }

    /// Answer the last interactive navigation with an error and move there.
    pub(crate) fn deny_last_navigation(&self, error: &'static str) -> Url {
        let request = self.navigations().pop().expect("no navigation");
        let callback = self.respond(&request, SilentOutcome::ProviderError(error));
        self.set_location(callback.clone());
        callback
    }

    fn respond(&self, request: &Url, outcome: SilentOutcome) -> Url {
        let param = |name: &str| {
            request
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };
        let redirect_uri = param("redirect_uri");
        let response_type = param("response_type");
        let wants = |kind: &str| response_type.split_whitespace().any(|t| t == kind);

        let mut params = url::form_urlencoded::Serializer::new(String::new());
        match outcome {
            SilentOutcome::Grant(expires_in) => {
                let n = self.issued.fetch_add(1, Ordering::SeqCst);
                let access_token = format!("at-{n}");
                if wants("token") {
                    params
                        .append_pair("access_token", &access_token)
                        .append_pair("token_type", "Bearer")
                        .append_pair("expires_in", &expires_in.to_string());
                }
                if wants("id_token") {
                    let claims = json!({
                        "iss": self.issuer,
                        "aud": param("client_id"),
                        "sub": SUBJECT,
                        "sid": "sid-1",
                        "nonce": param("nonce"),
                        "exp": OffsetDateTime::now_utc().unix_timestamp() + 3600,
                        "at_hash": nonce::compute_at_hash(&access_token),
                    });
                    params.append_pair("id_token", &id_token::encode_unsigned(&claims));
                }
                params
                    .append_pair("scope", &param("scope"))
                    .append_pair("session_state", "ss-1");
            }
            SilentOutcome::ProviderError(error) => {
                params.append_pair("error", error);
            }
            SilentOutcome::FrameFailure => unreachable!("frame failures have no response"),
        }
        params.append_pair("state", &param("state"));

        let params = params.finish();
        let separator = if redirect_uri.contains('#') { '&' } else { '#' };
        format!("{redirect_uri}{separator}{params}")
            .parse()
            .expect("valid callback")
    }
}

impl Browser for FakeBrowser {
    fn location(&self) -> Url {
        self.location.lock().unwrap().clone()
    }

    fn navigate(&self, url: &Url) {
        self.navigations.lock().unwrap().push(url.clone());
    }

    fn replace_location(&self, url: &Url) {
        self.replaced.lock().unwrap().push(url.clone());
        self.set_location(url.clone());
    }

    async fn silent_signin(
        &self,
        url: Url,
    ) -> Result<Url, Box<dyn std::error::Error + Send + Sync>> {
        self.silent_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SilentOutcome::Grant(3600));
        match outcome {
            SilentOutcome::FrameFailure => Err("hidden frame timed out".into()),
            outcome => Ok(self.respond(&url, outcome)),
        }
    }
}
