#![doc = include_str!("../README.md")]

pub mod api;
pub mod config;
pub mod error;
pub mod id_token;
pub mod nonce;
pub mod oidc;
pub mod session;
pub mod store;
pub mod types;
pub mod well_known;

// Re-exports for convenient access
pub use api::{ApiResponse, Credential, Dispatcher, ResponseBody};
#[cfg(feature = "subscriptions")]
pub use api::{ChangeType, PushTransport, Registrar, Subscription, Webhook};
pub use config::{ApiConfig, ClientConfig, RenewalPolicy};
pub use error::Error;
pub use oidc::{AuthorizationRequest, OidcClient, SigninResponse};
pub use session::{
    Browser, Session, SessionEvent, SessionManager, SessionState, SessionStatus, Snapshot,
    UserManager,
};
pub use store::{FileStore, LastUsed, MemoryStore, TokenStore};
pub use types::{RequestId, ResultKey, SubscriptionId, WebhookId};
pub use well_known::ProviderMetadata;
