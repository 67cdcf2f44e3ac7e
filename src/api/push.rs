//! Push-notification transport seam and its wire envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Consumer-provided connection to the push-notification service.
///
/// Change notifications for created subscriptions arrive through the
/// transport's own stream callback; this crate only connects and subscribes.
pub trait PushTransport: Send + Sync {
    /// Open the stream connection.
    fn connect(
        &self,
    ) -> impl std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;

    /// Subscribe the open stream to `topics`.
    fn sub(
        &self,
        topics: Vec<String>,
    ) -> impl std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;
}

/// Kinds of [`StreamEnvelope`] exchanged on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeType {
    Sub,
    Unsub,
    CloseTopic,
    Pub,
    Hello,
    Ack,
    Event,
}

/// Message framing used by the push-notification stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
}

impl StreamEnvelope {
    /// A `sub` request for `topics`, correlated by `reference`.
    #[must_use]
    pub fn subscribe(reference: impl Into<String>, topics: Vec<String>) -> Self {
        let definition = TopicDefinition {
            reference: reference.into(),
            topics,
        };
        Self {
            kind: EnvelopeType::Sub,
            data: serde_json::to_value(definition).ok(),
            info: None,
            state: String::new(),
        }
    }

    /// Topic definition carried by `sub`/`unsub` envelopes.
    #[must_use]
    pub fn topics(&self) -> Option<TopicDefinition> {
        match self.kind {
            EnvelopeType::Sub | EnvelopeType::Unsub => {
                serde_json::from_value(self.data.clone()?).ok()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDefinition {
    #[serde(rename = "ref", default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
}
