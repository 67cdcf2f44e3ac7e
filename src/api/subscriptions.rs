use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::dispatcher::{ApiResponse, Dispatcher};
use super::push::PushTransport;
use super::Credential;
use crate::nonce;
use crate::types::{SubscriptionId, WebhookId};

/// Push endpoint registered with the notification service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: WebhookId,
    pub topic: String,
    /// Where the API server posts notifications; may be relative to the API base.
    pub pub_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        })
    }
}

/// A change subscription on one resource. Never renewed automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Subscription {
    pub id: SubscriptionId,
    pub resource: String,
    pub change_types: BTreeSet<ChangeType>,
    pub expires_at: Option<OffsetDateTime>,
    pub client_state: String,
    pub notification_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionResponse {
    id: SubscriptionId,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    expiration_date_time: Option<String>,
}

/// Registers the push webhook and creates change subscriptions through a [`Dispatcher`].
///
/// Registration is best-effort: failures are logged and reported as `None`.
pub struct Registrar {
    dispatcher: Arc<Dispatcher>,
    webhook: Mutex<Option<Webhook>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl Registrar {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            webhook: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Register the push webhook once; later calls return the cached one.
    pub async fn register_webhook(&self, credential: &Credential) -> Option<Webhook> {
        if let Some(webhook) = self.cached_webhook() {
            return Some(webhook);
        }

        let url = match self.dispatcher.config().pubs_url("/webhook") {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid webhook registration URL");
                return None;
            }
        };
        let response = self
            .dispatcher
            .post(credential, url.as_str(), &json!({}))
            .await;
        let webhook: Webhook = parse_body(response, "webhook registration")?;

        tracing::info!(id = %webhook.id, topic = %webhook.topic, "Webhook registered");
        *self
            .webhook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(webhook.clone());
        Some(webhook)
    }

    /// Subscribe to `change_types` on `resource`, replacing any earlier
    /// subscription for the same resource.
    pub async fn create_subscription(
        &self,
        credential: &Credential,
        resource: &str,
        change_types: &[ChangeType],
    ) -> Option<Subscription> {
        let change_types: BTreeSet<ChangeType> = change_types.iter().copied().collect();
        if change_types.is_empty() {
            tracing::warn!(resource = %resource, "No change types to subscribe to");
            return None;
        }

        let webhook = self.register_webhook(credential).await?;
        let notification_url = match self.dispatcher.config().base_url().join(&webhook.pub_url) {
            Ok(url) => url.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, pub_url = %webhook.pub_url, "Invalid webhook URL");
                return None;
            }
        };
        let client_state = nonce::generate_client_state();
        let change_type = change_types
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .dispatcher
            .post(
                credential,
                "/subscriptions",
                &json!({
                    "changeType": change_type,
                    "notificationUrl": notification_url,
                    "resource": resource,
                    "clientState": client_state,
                }),
            )
            .await;
        let created: SubscriptionResponse = parse_body(response, "subscription")?;

        let subscription = Subscription {
            id: created.id,
            resource: created.resource.unwrap_or_else(|| resource.to_string()),
            change_types,
            expires_at: created
                .expiration_date_time
                .and_then(|at| OffsetDateTime::parse(&at, &Rfc3339).ok()),
            client_state,
            notification_url,
        };

        let replaced = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.to_string(), subscription.clone());
        tracing::info!(
            id = %subscription.id,
            resource = %resource,
            replaced = replaced.is_some(),
            "Subscription created"
        );
        Some(subscription)
    }

    /// Subscribe to the resource the dispatcher last returned data for.
    pub async fn create_subscription_for_current_context(
        &self,
        credential: &Credential,
        change_types: &[ChangeType],
    ) -> Option<Subscription> {
        let Some(resource) = self.dispatcher.current_context() else {
            tracing::warn!("No current context to subscribe to");
            return None;
        };
        self.create_subscription(credential, &resource, change_types)
            .await
    }

    /// Connect `transport` and subscribe it to the webhook topic.
    pub async fn listen<T: PushTransport>(&self, credential: &Credential, transport: &T) -> bool {
        let Some(webhook) = self.register_webhook(credential).await else {
            return false;
        };
        if let Err(e) = transport.connect().await {
            tracing::warn!(error = %e, "Push transport failed to connect");
            return false;
        }
        match transport.sub(vec![webhook.topic.clone()]).await {
            Ok(()) => {
                tracing::debug!(topic = %webhook.topic, "Listening for change notifications");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, topic = %webhook.topic, "Push topic subscription failed");
                false
            }
        }
    }

    #[must_use]
    pub fn webhook(&self) -> Option<Webhook> {
        self.cached_webhook()
    }

    #[must_use]
    pub fn subscription(&self, resource: &str) -> Option<Subscription> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .cloned()
    }

    #[must_use]
    pub fn subscriptions(&self) -> HashMap<String, Subscription> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cached_webhook(&self) -> Option<Webhook> {
        self.webhook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(response: ApiResponse, what: &str) -> Option<T> {
    if !response.success {
        tracing::warn!(
            request_id = %response.request_id,
            status = response.status,
            error = ?response.failure,
            "{what} request failed"
        );
        return None;
    }
    let value = response.json()?.clone();
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!(error = %e, "Malformed {what} response");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value as JsonValue;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::ApiConfig;

    async fn mock_webhook(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/pubs/v1/webhook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "wh1",
                "topic": "topic-1",
                "pubUrl": "/api/pubs/v1/webhook/wh1/pub",
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn mock_subscription(server: &MockServer, id: &str) {
        Mock::given(method("POST"))
            .and(path("/api/gc/v1/subscriptions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": id,
                "resource": "me/calendar/events",
                "changeType": "created,updated",
                "expirationDateTime": "2030-01-01T00:00:00Z",
            })))
            .up_to_n_times(1)
            .mount(server)
            .await;
    }

    fn registrar(server: &MockServer) -> Registrar {
        let config = ApiConfig::new(server.uri().parse().unwrap());
        Registrar::new(Arc::new(Dispatcher::new(config)))
    }

    #[tokio::test]
    async fn resubscribing_overwrites_previous_subscription() {
        let server = MockServer::start().await;
        mock_webhook(&server).await;
        mock_subscription(&server, "s1").await;
        mock_subscription(&server, "s2").await;

        let registrar = registrar(&server);
        let credential = Credential::bearer("at");
        let kinds = [ChangeType::Created, ChangeType::Updated];

        let first = registrar
            .create_subscription(&credential, "me/calendar/events", &kinds)
            .await
            .unwrap();
        let second = registrar
            .create_subscription(&credential, "me/calendar/events", &kinds)
            .await
            .unwrap();

        assert_eq!(first.id, SubscriptionId("s1".into()));
        assert_eq!(second.id, SubscriptionId("s2".into()));
        assert_ne!(first.client_state, second.client_state);
        assert_eq!(registrar.subscriptions().len(), 1);
        assert_eq!(
            registrar.subscription("me/calendar/events").unwrap().id,
            SubscriptionId("s2".into())
        );
        assert!(second.expires_at.is_some());
    }

    #[tokio::test]
    async fn subscription_request_references_webhook() {
        let server = MockServer::start().await;
        mock_webhook(&server).await;
        mock_subscription(&server, "s1").await;

        let registrar = registrar(&server);
        let subscription = registrar
            .create_subscription(
                &Credential::bearer("at"),
                "me/calendar/events",
                &[ChangeType::Updated, ChangeType::Created, ChangeType::Updated],
            )
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: JsonValue = serde_json::from_slice(&requests.last().unwrap().body).unwrap();
        let notification_url = format!("{}/api/pubs/v1/webhook/wh1/pub", server.uri());
        assert_eq!(body["changeType"], "created,updated");
        assert_eq!(body["resource"], "me/calendar/events");
        assert_eq!(body["notificationUrl"], notification_url.as_str());
        assert_eq!(body["clientState"], subscription.client_state.as_str());
        assert_eq!(subscription.notification_url, notification_url);
    }

    #[tokio::test]
    async fn webhook_failure_yields_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/pubs/v1/webhook"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("oops", "text/plain"))
            .mount(&server)
            .await;

        let registrar = registrar(&server);
        let credential = Credential::bearer("at");
        assert!(registrar.register_webhook(&credential).await.is_none());
        assert!(registrar.webhook().is_none());
        assert!(
            registrar
                .create_subscription(&credential, "me/contacts", &[ChangeType::Created])
                .await
                .is_none()
        );
        assert!(registrar.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn current_context_is_subscribable() {
        let server = MockServer::start().await;
        mock_webhook(&server).await;
        mock_subscription(&server, "s1").await;
        Mock::given(method("GET"))
            .and(path("/api/gc/v1/me/calendar/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "@odata.context": "/api/gc/v1/me/calendar/events",
                "value": [],
            })))
            .mount(&server)
            .await;

        let registrar = registrar(&server);
        let credential = Credential::bearer("at");
        assert!(
            registrar
                .create_subscription_for_current_context(&credential, &[ChangeType::Created])
                .await
                .is_none()
        );

        registrar
            .dispatcher()
            .run_request(&credential, "/me/calendar/events", false)
            .await
            .unwrap();
        let subscription = registrar
            .create_subscription_for_current_context(&credential, &[ChangeType::Created])
            .await
            .unwrap();
        assert_eq!(subscription.resource, "me/calendar/events");
    }

    #[derive(Default)]
    struct RecordingTransport {
        connects: AtomicUsize,
        topics: Mutex<Vec<String>>,
    }

    impl PushTransport for RecordingTransport {
        async fn connect(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn sub(
            &self,
            topics: Vec<String>,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.topics.lock().unwrap().extend(topics);
            Ok(())
        }
    }

    #[tokio::test]
    async fn listen_subscribes_to_webhook_topic() {
        let server = MockServer::start().await;
        mock_webhook(&server).await;

        let registrar = registrar(&server);
        let transport = RecordingTransport::default();
        assert!(registrar.listen(&Credential::bearer("at"), &transport).await);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(*transport.topics.lock().unwrap(), vec!["topic-1".to_string()]);
    }
}
