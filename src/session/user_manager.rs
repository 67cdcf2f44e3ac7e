use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use serde_json::{Map, Value as JsonValue};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use url::Url;

use super::browser::Browser;
use super::manager::Shared;
use super::signin_state::{self, SigninState};
use super::types::{RenewError, Session, SessionEvent, SessionStatus};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::id_token::{self, Expectations};
use crate::oidc::{OidcClient, SigninResponse};
use crate::store::TokenStore;

const EVENT_CAPACITY: usize = 64;

/// Token engine: owns the stored user, expiry timers and silent renewal.
///
/// Lifecycle transitions are published as [`SessionEvent`]s; the
/// [`SessionManager`](super::SessionManager) turns them into state.
pub struct UserManager<B, S> {
    client: OidcClient,
    browser: Arc<B>,
    store: Arc<S>,
    events: broadcast::Sender<SessionEvent>,
    silent_renew: AtomicBool,
    renewing: AtomicBool,
    timers: Mutex<Option<JoinHandle<()>>>,
    /// Session state shared by every `SessionManager` over this engine.
    pub(super) observer: OnceLock<Arc<Shared>>,
}

impl<B: Browser, S: TokenStore> UserManager<B, S> {
    /// Must be called within a Tokio runtime; the silent renew service is spawned here.
    #[must_use]
    pub fn new(config: ClientConfig, browser: Arc<B>, store: Arc<S>) -> Arc<Self> {
        Self::with_client(OidcClient::new(config), browser, store)
    }

    /// Use a preconfigured client (custom HTTP client, for instance).
    #[must_use]
    pub fn with_client(client: OidcClient, browser: Arc<B>, store: Arc<S>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let enabled = client.config().renewal().enabled;

        let manager = Arc::new(Self {
            client,
            browser,
            store,
            events,
            silent_renew: AtomicBool::new(enabled),
            renewing: AtomicBool::new(false),
            timers: Mutex::new(None),
            observer: OnceLock::new(),
        });

        let receiver = manager.events.subscribe();
        tokio::spawn(run_silent_renew_service(Arc::downgrade(&manager), receiver));

        manager
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.client.config()
    }

    #[must_use]
    pub fn browser(&self) -> &B {
        &self.browser
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.events.send(event);
    }

    pub fn start_silent_renew(&self) {
        tracing::debug!("Silent renew enabled");
        self.silent_renew.store(true, Ordering::Release);
    }

    /// Only future renewals are affected; one already running completes.
    pub fn stop_silent_renew(&self) {
        tracing::debug!("Silent renew disabled");
        self.silent_renew.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_silent_renew_enabled(&self) -> bool {
        self.silent_renew.load(Ordering::Acquire)
    }

    /// Start an interactive sign-in by navigating the browser to the provider.
    ///
    /// # Errors
    ///
    /// Returns the discovery error, or [`Error::Store`] if the pending state
    /// cannot be saved.
    pub async fn signin_redirect(&self) -> Result<(), Error> {
        let config = self.client.config();
        let request = self
            .client
            .authorization_url(config.redirect_uri(), config.response_type(), None)
            .await?;
        signin_state::save(&*self.store, &SigninState::new(&request, config.redirect_uri()))?;

        tracing::info!(issuer = %config.issuer(), "Redirecting to provider for sign-in");
        self.browser.navigate(&request.url);
        Ok(())
    }

    /// Exchange the callback parameters at `location` for a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if the provider rejected the
    /// request or the parameters do not match a pending sign-in.
    pub async fn signin_redirect_callback(&self, location: &Url) -> Result<Arc<Session>, Error> {
        let config = self.client.config();
        let session = self
            .process_response(
                location,
                config.redirect_uri(),
                config.response_type(),
                config.load_user_info(),
            )
            .await
            .map_err(|e| match e {
                Error::AuthenticationFailed(_) => e,
                other => Error::AuthenticationFailed(other.to_string()),
            })?;

        tracing::info!(
            sub = session.subject().unwrap_or_default(),
            "Sign-in completed"
        );
        self.load_user(session)
    }

    /// Renew the session with a `prompt=none` request in a hidden frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RenewalInteractionRequired`] if the provider needs the
    /// user, [`Error::RenewalFailed`] for everything else.
    pub async fn signin_silent(&self) -> Result<Arc<Session>, Error> {
        let config = self.client.config();
        let redirect_uri = config.silent_redirect_uri();

        let request = self
            .client
            .authorization_url(redirect_uri, config.response_type(), Some("none"))
            .await
            .map_err(renewal_error)?;
        signin_state::save(&*self.store, &SigninState::new(&request, redirect_uri))?;

        tracing::debug!("Starting silent renew");
        let location = self
            .browser
            .silent_signin(request.url)
            .await
            .map_err(|e| Error::RenewalFailed(e.to_string()))?;

        let session = self
            .process_response(
                &location,
                redirect_uri,
                config.response_type(),
                config.load_user_info(),
            )
            .await
            .map_err(renewal_error)?;

        tracing::info!("Silent renew succeeded");
        self.load_user(session)
    }

    /// Ask the provider whether its session is still alive.
    ///
    /// Emits [`SessionEvent::UserSignedOut`] and returns `None` when the provider
    /// session has ended, or when it now belongs to a different user.
    ///
    /// # Errors
    ///
    /// Returns discovery, transport and validation errors.
    pub async fn query_session_status(&self) -> Result<Option<SessionStatus>, Error> {
        let config = self.client.config();
        let redirect_uri = config.silent_redirect_uri();

        let request = self
            .client
            .authorization_url(redirect_uri, "id_token", Some("none"))
            .await?;
        signin_state::save(&*self.store, &SigninState::new(&request, redirect_uri))?;

        let location = self
            .browser
            .silent_signin(request.url)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let probe = match self
            .process_response(&location, redirect_uri, "id_token", false)
            .await
        {
            Ok(probe) => probe,
            Err(e) if e.is_interaction_required() => {
                tracing::info!("Provider session has ended");
                self.emit(SessionEvent::UserSignedOut);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let status = SessionStatus {
            sub: probe.subject().map(str::to_string),
            sid: probe
                .profile
                .get("sid")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            session_state: probe.session_state.clone(),
        };

        if let Some(current) = self.stored_user()? {
            if current.subject().is_some() && current.subject() != status.sub.as_deref() {
                tracing::info!("Provider session belongs to a different user");
                self.emit(SessionEvent::UserSignedOut);
                return Ok(None);
            }
        }

        Ok(Some(status))
    }

    /// Remove the user and send the browser to the provider's end-session endpoint.
    ///
    /// # Errors
    ///
    /// Returns the discovery error, or the store error from removing the user.
    pub async fn signout_redirect(&self) -> Result<(), Error> {
        let hint = self
            .stored_user()
            .ok()
            .flatten()
            .and_then(|s| s.id_token);
        let url = self.client.end_session_url(hint.as_deref()).await;

        self.remove_user()?;

        match url? {
            Some(url) => {
                tracing::info!("Redirecting to provider for sign-out");
                self.browser.navigate(&url);
            }
            None => tracing::debug!("Provider has no end_session_endpoint"),
        }
        Ok(())
    }

    /// The stored user, if present and not expired.
    ///
    /// Expired users are removed from the store. Loading a user arms its
    /// expiry timers if they are not running yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] or [`Error::Json`] if the stored user cannot be read.
    pub fn get_user(&self) -> Result<Option<Arc<Session>>, Error> {
        let Some(session) = self.stored_user()? else {
            return Ok(None);
        };

        if session.is_expired() {
            tracing::debug!("Stored user has expired");
            self.cancel_timers();
            self.store
                .remove(&signin_state::user_key(self.config()))
                .map_err(|e| Error::Store(e.to_string()))?;
            return Ok(None);
        }

        if !self.timers_armed() {
            self.arm_timers(&session);
        }
        Ok(Some(Arc::new(session)))
    }

    /// Clear the stored user and emit [`SessionEvent::UserUnloaded`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the store fails; the event is emitted anyway.
    pub fn remove_user(&self) -> Result<(), Error> {
        self.cancel_timers();
        let removed = self
            .store
            .remove(&signin_state::user_key(self.config()))
            .map_err(|e| Error::Store(e.to_string()));

        tracing::info!("User removed");
        self.emit(SessionEvent::UserUnloaded);
        removed
    }

    /// Re-arm the expiry timers for `session`.
    ///
    /// If the session is already inside the expiring window,
    /// [`SessionEvent::AccessTokenExpiring`] fires right away.
    pub fn restart_timers(&self, session: &Session) {
        self.arm_timers(session);
    }

    fn stored_user(&self) -> Result<Option<Session>, Error> {
        let value = self
            .store
            .get(&signin_state::user_key(self.config()))
            .map_err(|e| Error::Store(e.to_string()))?;
        match value {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    fn load_user(&self, session: Session) -> Result<Arc<Session>, Error> {
        let value = serde_json::to_string(&session)?;
        self.store
            .set(&signin_state::user_key(self.config()), &value)
            .map_err(|e| Error::Store(e.to_string()))?;

        self.arm_timers(&session);
        let session = Arc::new(session);
        self.emit(SessionEvent::UserLoaded(Arc::clone(&session)));
        Ok(session)
    }

    fn arm_timers(&self, session: &Session) {
        self.cancel_timers();
        let Some(remaining) = session.expires_in() else {
            return;
        };

        let lead = self.config().renewal().expiring_notification_lead;
        let until_expiring = remaining.saturating_sub(lead);
        let events = self.events.clone();
        tracing::debug!(expires_in = remaining.as_secs(), "Arming access token timers");

        let handle = tokio::spawn(async move {
            tokio::time::sleep(until_expiring).await;
            tracing::debug!("Access token expiring");
            let _ = events.send(SessionEvent::AccessTokenExpiring);

            tokio::time::sleep(remaining - until_expiring).await;
            tracing::debug!("Access token expired");
            let _ = events.send(SessionEvent::AccessTokenExpired);
        });

        *self.timers.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn cancel_timers(&self) {
        if let Some(handle) = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    fn timers_armed(&self) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Run a silent renew in its own task unless one is already in flight.
    fn spawn_silent_renew(self: &Arc<Self>) {
        if self.renewing.swap(true, Ordering::AcqRel) {
            tracing::debug!("Silent renew already in flight");
            return;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.signin_silent().await;
            manager.renewing.store(false, Ordering::Release);
            if let Err(e) = result {
                tracing::warn!(error = %e, "Silent renew failed");
                manager.emit(SessionEvent::SilentRenewError(RenewError::from(&e)));
            }
        });
    }

    async fn process_response(
        &self,
        location: &Url,
        redirect_uri: &Url,
        response_type: &str,
        load_user_info: bool,
    ) -> Result<Session, Error> {
        let config = self.client.config();
        let response = SigninResponse::from_callback(location, redirect_uri)?;

        let state = response
            .state
            .as_deref()
            .ok_or_else(|| Error::AuthenticationFailed("missing state".into()))?;
        let signin = signin_state::take(&*self.store, state, config.signin_state_ttl())?
            .ok_or_else(|| Error::AuthenticationFailed("state mismatch".into()))?;
        if signin.redirect_uri != redirect_uri.as_str() {
            return Err(Error::AuthenticationFailed("redirect_uri mismatch".into()));
        }

        if let Some(error) = response.provider_error() {
            tracing::warn!(error = %error, "Provider rejected authorization request");
            return Err(error);
        }

        let wants = |kind: &str| response_type.split_whitespace().any(|t| t == kind);
        if wants("token") && response.access_token.is_none() {
            return Err(Error::AuthenticationFailed("missing access_token".into()));
        }

        let mut profile = Map::new();
        if wants("id_token") {
            let token = response
                .id_token
                .as_deref()
                .ok_or_else(|| Error::AuthenticationFailed("missing id_token".into()))?;
            let claims = id_token::validate(
                token,
                &Expectations {
                    issuer: config.issuer().as_str(),
                    client_id: config.client_id(),
                    nonce: signin.nonce.as_deref(),
                    access_token: response.access_token.as_deref(),
                },
            )?;
            profile = claims.into_map();
        }

        let userinfo_token = response.access_token.as_deref().filter(|_| load_user_info);
        if let Some(access_token) = userinfo_token {
            let info = self.client.get_user_info(access_token).await?;
            let expected = profile.get("sub").and_then(JsonValue::as_str);
            let actual = info.get("sub").and_then(JsonValue::as_str);
            if expected.is_some() && actual.is_some() && expected != actual {
                return Err(Error::Oidc {
                    operation: "userinfo request",
                    status: None,
                    detail: "sub does not match the ID token".into(),
                });
            }
            profile.extend(info);
        }

        let mut session = Session::new(
            config.issuer().as_str(),
            config.client_id(),
            response.token_type.clone().unwrap_or_else(|| "Bearer".into()),
            response.access_token.clone().unwrap_or_default(),
        )
        .with_profile(profile);
        if let Some(seconds) = response.expires_in {
            session = session.with_expires_in(seconds);
        }
        session.id_token = response.id_token;
        session.scope = response.scope;
        session.session_state = response.session_state;

        Ok(session)
    }
}

impl<B, S> Drop for UserManager<B, S> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .timers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn renewal_error(error: Error) -> Error {
    if error.is_interaction_required() {
        return Error::RenewalInteractionRequired;
    }
    match error {
        Error::RenewalFailed(_) => error,
        other => Error::RenewalFailed(other.to_string()),
    }
}

/// Start a silent renew whenever the access token is about to expire.
async fn run_silent_renew_service<B: Browser, S: TokenStore>(
    manager: Weak<UserManager<B, S>>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::AccessTokenExpiring) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.is_silent_renew_enabled() {
                    manager.spawn_silent_renew();
                } else {
                    tracing::debug!("Silent renew disabled; not renewing expiring token");
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Silent renew service lagged behind events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
