//! Token-authenticated access to the groupware API.
//!
//! ```rust,ignore
//! use kapi_client::api::{ChangeType, Dispatcher, Registrar};
//!
//! let dispatcher = Arc::new(Dispatcher::new(ApiConfig::from_env()?));
//! let credential = sessions.credential().ok_or("not signed in")?;
//!
//! let events = dispatcher.run_request(&credential, "/me/calendar/events", false).await;
//! let registrar = Registrar::new(dispatcher.clone());
//! registrar
//!     .create_subscription_for_current_context(&credential, &[ChangeType::Created, ChangeType::Updated])
//!     .await;
//! ```

mod credential;
mod dispatcher;
#[cfg(feature = "subscriptions")]
mod push;
#[cfg(feature = "subscriptions")]
mod subscriptions;

pub use credential::Credential;
pub use dispatcher::{ApiResponse, Dispatcher, RequestContext, ResponseBody};
#[cfg(feature = "subscriptions")]
pub use push::{EnvelopeType, PushTransport, StreamEnvelope, TopicDefinition};
#[cfg(feature = "subscriptions")]
pub use subscriptions::{ChangeType, Registrar, Subscription, Webhook};
