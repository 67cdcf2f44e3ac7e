//! Client-side OIDC session lifecycle.
//!
//! [`UserManager`] is the token engine: it talks to the provider, keeps the
//! signed-in user in the [`TokenStore`](crate::store::TokenStore), arms the
//! expiry timers and renews silently. [`SessionManager`] sits on top and
//! turns the engine's events into a [`SessionState`] plus the current
//! [`Session`], retrying failed renewals.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use kapi_client::{ClientConfig, SessionManager, store::FileStore};
//!
//! // 1. Implement Browser for your user agent
//! // 2. Configure from environment
//! let config = ClientConfig::from_env()?;
//!
//! // 3. Finish a pending sign-in, or restore the stored user
//! let (sessions, user) = SessionManager::initialize(config, browser, FileStore::open(path)?).await;
//! if user.or_else(|| sessions.get_user()).is_none() {
//!     sessions.start_authentication().await?;
//! }
//! ```

mod browser;
mod manager;
mod signin_state;
#[cfg(test)]
pub(crate) mod test_support;
mod types;
mod user_manager;

pub use browser::Browser;
pub use manager::SessionManager;
pub use types::{RenewError, Session, SessionEvent, SessionState, SessionStatus, Snapshot};
pub use user_manager::UserManager;
