use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap};
use serde_json::Value as JsonValue;
use url::Url;

use super::Credential;
use crate::config::ApiConfig;
use crate::error::Error;
use crate::types::{RequestId, ResultKey};

const ODATA_CONTEXT: &str = "@odata.context";
const ODATA_NEXT_LINK: &str = "@odata.nextLink";

/// Response body as received.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(JsonValue),
    /// Non-JSON or unparsable body, kept for diagnostics.
    Text(String),
    Empty,
}

/// Outcome of a dispatched request. Failures are reported here, never raised.
#[derive(Debug)]
#[non_exhaustive]
pub struct ApiResponse {
    pub request_id: RequestId,
    pub success: bool,
    /// HTTP status, `0` when no response was received.
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// From call start to settlement.
    pub duration: Duration,
    pub failure: Option<Error>,
}

impl ApiResponse {
    fn transport_failure(request_id: RequestId, started: Instant, error: Error) -> Self {
        Self {
            request_id,
            success: false,
            status: 0,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            duration: started.elapsed(),
            failure: Some(error),
        }
    }

    #[must_use]
    pub fn json(&self) -> Option<&JsonValue> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }
}

/// The last issued request and its pagination state.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub endpoint: String,
    /// `None` when the result was not kept.
    pub result_key: Option<ResultKey>,
    pub next_link: Option<String>,
    pub last_result: Option<JsonValue>,
}

#[derive(Debug, Default)]
struct DispatchState {
    context: Option<RequestContext>,
    current_context: Option<String>,
    results: HashMap<ResultKey, JsonValue>,
}

/// Token-authenticated requests against the groupware API.
///
/// The credential is passed into every call; the dispatcher holds none.
#[derive(Debug)]
pub struct Dispatcher {
    config: ApiConfig,
    http: reqwest::Client,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: ApiConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            state: Mutex::new(DispatchState::default()),
        }
    }

    /// Use a custom HTTP client (e.g., with a proxy or custom TLS configuration).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Authenticated GET. A successful response updates the current context.
    pub async fn get(&self, credential: &Credential, endpoint: &str) -> ApiResponse {
        self.get_url(credential, endpoint, self.config.gc_url(endpoint))
            .await
    }

    async fn get_url(
        &self,
        credential: &Credential,
        endpoint: &str,
        url: Result<Url, url::ParseError>,
    ) -> ApiResponse {
        let response = self
            .execute(Method::GET, credential, endpoint, url, None)
            .await;

        if response.success {
            let context = response
                .json()
                .and_then(|body| body.get(ODATA_CONTEXT))
                .and_then(JsonValue::as_str)
                .map(|context| context_path(context, self.config.gc_prefix()));
            if let Some(context) = context {
                tracing::debug!(context = %context, "Current context updated");
                self.lock().current_context = Some(context);
            }
        }
        response
    }

    /// Authenticated POST with a JSON payload.
    pub async fn post(
        &self,
        credential: &Credential,
        endpoint: &str,
        body: &JsonValue,
    ) -> ApiResponse {
        let url = self.config.gc_url(endpoint);
        self.execute(Method::POST, credential, endpoint, url, Some(body))
            .await
    }

    /// GET `endpoint` and keep the result under a key derived from its path.
    ///
    /// With `discard_result` the response is returned but not kept. Empty
    /// endpoints are ignored.
    pub async fn run_request(
        &self,
        credential: &Credential,
        endpoint: &str,
        discard_result: bool,
    ) -> Option<JsonValue> {
        if endpoint.is_empty() {
            return None;
        }
        let result_key = (!discard_result).then(|| ResultKey::from_endpoint(endpoint));
        let url = self.config.gc_url(endpoint);
        self.fetch(credential, endpoint, url, result_key).await
    }

    /// Re-issue the last request's `@odata.nextLink` under the same result key.
    ///
    /// The link is resolved against the API base URL only; it already carries
    /// the API prefix. `None` if the last response had no next link.
    pub async fn follow_next_link(&self, credential: &Credential) -> Option<JsonValue> {
        let (next_link, result_key) = {
            let state = self.lock();
            let context = state.context.as_ref()?;
            (context.next_link.clone()?, context.result_key.clone())
        };
        tracing::debug!(next_link = %next_link, "Following next link");
        let url = self.config.link_url(&next_link);
        self.fetch(credential, &next_link, url, result_key).await
    }

    #[must_use]
    pub fn context(&self) -> Option<RequestContext> {
        self.lock().context.clone()
    }

    /// Resource path of the data last viewed, e.g. `me/calendar/events`.
    #[must_use]
    pub fn current_context(&self) -> Option<String> {
        self.lock().current_context.clone()
    }

    #[must_use]
    pub fn result(&self, key: &ResultKey) -> Option<JsonValue> {
        self.lock().results.get(key).cloned()
    }

    async fn fetch(
        &self,
        credential: &Credential,
        endpoint: &str,
        url: Result<Url, url::ParseError>,
        result_key: Option<ResultKey>,
    ) -> Option<JsonValue> {
        let response = self.get_url(credential, endpoint, url).await;
        let value = match response {
            ApiResponse {
                success: true,
                body: ResponseBody::Json(value),
                ..
            } => Some(value),
            ApiResponse {
                request_id,
                status,
                failure,
                ..
            } => {
                tracing::warn!(
                    %request_id,
                    status,
                    error = ?failure,
                    endpoint = %endpoint,
                    "API request failed"
                );
                None
            }
        };
        let next_link = value
            .as_ref()
            .and_then(|v| v.get(ODATA_NEXT_LINK))
            .and_then(JsonValue::as_str)
            .map(str::to_string);

        let mut state = self.lock();
        if let (Some(key), Some(value)) = (&result_key, &value) {
            state.results.insert(key.clone(), value.clone());
        }
        state.context = Some(RequestContext {
            endpoint: endpoint.to_string(),
            result_key,
            next_link,
            last_result: value.clone(),
        });
        value
    }

    async fn execute(
        &self,
        method: Method,
        credential: &Credential,
        endpoint: &str,
        url: Result<Url, url::ParseError>,
        body: Option<&JsonValue>,
    ) -> ApiResponse {
        let request_id = RequestId::new();
        let started = Instant::now();

        let url = match url {
            Ok(url) => url,
            Err(e) => {
                return ApiResponse::transport_failure(
                    request_id,
                    started,
                    Error::Transport(format!("invalid endpoint {endpoint}: {e}")),
                );
            }
        };
        tracing::debug!(%request_id, %method, url = %url, "Dispatching API request");

        let mut request = self
            .http
            .request(method, url)
            .header(AUTHORIZATION, credential.header_value())
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(%request_id, error = %e, "API request did not complete");
                return ApiResponse::transport_failure(
                    request_id,
                    started,
                    Error::Transport(e.to_string()),
                );
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                let mut failed = ApiResponse::transport_failure(
                    request_id,
                    started,
                    Error::Transport(e.to_string()),
                );
                failed.status = status.as_u16();
                failed.headers = headers;
                return failed;
            }
        };
        let duration = started.elapsed();

        let (body, failure) = if !content_type.as_deref().is_some_and(is_json) {
            (text_body(text), Some(Error::UnexpectedContentType(content_type)))
        } else if text.is_empty() {
            (ResponseBody::Empty, None)
        } else {
            match serde_json::from_str(&text) {
                Ok(value) => (ResponseBody::Json(value), None),
                Err(e) => (ResponseBody::Text(text), Some(Error::Json(e))),
            }
        };
        let failure = failure.or_else(|| {
            (!status.is_success()).then(|| Error::Api {
                status: status.as_u16(),
                detail: api_error_detail(&body),
            })
        });

        tracing::debug!(
            %request_id,
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            "API request settled"
        );

        ApiResponse {
            request_id,
            success: failure.is_none(),
            status: status.as_u16(),
            headers,
            body,
            duration,
            failure,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json"))
}

fn text_body(text: String) -> ResponseBody {
    if text.is_empty() {
        ResponseBody::Empty
    } else {
        ResponseBody::Text(text)
    }
}

/// Graph-style `{"error": {"message": ...}}`, else the raw body.
fn api_error_detail(body: &ResponseBody) -> String {
    match body {
        ResponseBody::Json(value) => value
            .pointer("/error/message")
            .and_then(JsonValue::as_str)
            .map_or_else(|| value.to_string(), str::to_string),
        ResponseBody::Text(text) => text.clone(),
        ResponseBody::Empty => String::new(),
    }
}

/// Strip everything up to and including the API prefix, and a leading `/`.
fn context_path(context: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rest = match context.find(prefix) {
        Some(at) => &context[at + prefix.len()..],
        None => context,
    };
    rest.trim_start_matches('/').to_string()
}
