use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

use super::browser::Browser;
use super::types::{Session, SessionEvent, SessionState, SessionStatus, Snapshot};
use super::user_manager::UserManager;
use crate::api::Credential;
use crate::config::{ClientConfig, RenewalPolicy};
use crate::error::Error;
use crate::oidc::{self, SigninResponse};
use crate::store::TokenStore;

/// Owns the authenticated-user lifecycle.
///
/// Cheap to clone; all clones, and every manager built over the same
/// engine, share one session and one event loop. State and session are
/// published together through a [`watch`] channel, so the credential a caller
/// reads always belongs to the current session.
///
/// ```rust,ignore
/// let (sessions, user) = SessionManager::initialize(config, browser, store).await;
/// let user = match user.or(sessions.get_user()) {
///     Some(user) => user,
///     None => {
///         sessions.start_authentication().await?;
///         return Ok(());
///     }
/// };
/// let events = dispatcher.get(&user.credential(), "/me/calendar/events").await;
/// ```
pub struct SessionManager<B, S> {
    engine: Arc<UserManager<B, S>>,
    shared: Arc<Shared>,
}

pub(super) struct Shared {
    snapshot: watch::Sender<Snapshot>,
    policy: RenewalPolicy,
    failures: AtomicU32,
}

// Manual Clone: avoid derive adding `B: Clone, S: Clone` bounds.
impl<B, S> Clone for SessionManager<B, S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Shared {
    fn set(&self, state: SessionState, session: Option<Arc<Session>>) {
        self.snapshot.send_replace(Snapshot { state, session });
    }

    fn set_state(&self, state: SessionState) {
        self.snapshot.send_if_modified(|snapshot| {
            let changed = snapshot.state != state;
            snapshot.state = state;
            changed
        });
    }

    fn has_session(&self) -> bool {
        self.snapshot.borrow().session.is_some()
    }
}

impl<B: Browser, S: TokenStore> SessionManager<B, S> {
    /// Set up the token engine and finish a pending sign-in.
    ///
    /// If the browser is at the redirect URI with callback parameters, they
    /// are exchanged for a session and then scrubbed from the location,
    /// whether or not the exchange succeeded. Otherwise no session is
    /// returned; call [`get_user`](Self::get_user) to restore a stored one.
    pub async fn initialize(config: ClientConfig, browser: B, store: S) -> (Self, Option<Arc<Session>>) {
        let engine = UserManager::new(config, Arc::new(browser), Arc::new(store));
        Self::with_engine(engine).await
    }

    /// Like [`initialize`](Self::initialize), with a preconfigured engine.
    ///
    /// Managers built over an engine that already has one attach to its
    /// existing state instead of observing its events a second time.
    pub async fn with_engine(engine: Arc<UserManager<B, S>>) -> (Self, Option<Arc<Session>>) {
        let mut created = false;
        let shared = engine
            .observer
            .get_or_init(|| {
                created = true;
                let (snapshot, _) = watch::channel(Snapshot::default());
                Arc::new(Shared {
                    snapshot,
                    policy: engine.config().renewal().clone(),
                    failures: AtomicU32::new(0),
                })
            })
            .clone();

        if created {
            tokio::spawn(run_event_loop(
                Arc::downgrade(&engine),
                Arc::clone(&shared),
                engine.subscribe(),
            ));
        }

        let manager = Self { engine, shared };

        let location = manager.engine.browser().location();
        if !SigninResponse::is_callback(&location, manager.engine.config().redirect_uri()) {
            tracing::debug!("No sign-in callback at current location");
            return (manager, None);
        }

        let result = manager.complete_authentication().await;
        manager
            .engine
            .browser()
            .replace_location(&oidc::scrub_callback(&location));

        match result {
            Ok(session) => (manager, Some(session)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to complete authentication");
                (manager, None)
            }
        }
    }

    /// Redirect the browser to the provider for an interactive sign-in.
    ///
    /// # Errors
    ///
    /// Returns the discovery or store error; the state falls back to
    /// `Unauthenticated` unless a session is still held.
    pub async fn start_authentication(&self) -> Result<(), Error> {
        self.shared.set_state(SessionState::Authenticating);
        if let Err(e) = self.engine.signin_redirect().await {
            tracing::warn!(error = %e, "Failed to start authentication");
            let fallback = if self.shared.has_session() {
                SessionState::Authenticated
            } else {
                SessionState::Unauthenticated
            };
            self.shared.set_state(fallback);
            return Err(e);
        }
        Ok(())
    }

    /// Exchange the callback parameters at the browser's location for a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if the exchange is rejected or
    /// the parameters are malformed.
    pub async fn complete_authentication(&self) -> Result<Arc<Session>, Error> {
        let location = self.engine.browser().location();
        self.shared.set_state(SessionState::Authenticating);

        match self.engine.signin_redirect_callback(&location).await {
            Ok(session) => {
                self.shared.failures.store(0, Ordering::Release);
                self.shared
                    .set(SessionState::Authenticated, Some(Arc::clone(&session)));
                Ok(session)
            }
            Err(e) => {
                self.shared.set(SessionState::Unauthenticated, None);
                Err(e)
            }
        }
    }

    /// The stored session if present and unexpired; `None` otherwise.
    ///
    /// A session that cannot be read is cleared.
    pub fn get_user(&self) -> Option<Arc<Session>> {
        match self.engine.get_user() {
            Ok(Some(session)) => {
                self.shared.snapshot.send_modify(|snapshot| {
                    if snapshot.session.as_deref() != Some(&*session) {
                        snapshot.session = Some(Arc::clone(&session));
                    }
                    if matches!(
                        snapshot.state,
                        SessionState::Unauthenticated | SessionState::Authenticating
                    ) {
                        snapshot.state = SessionState::Authenticated;
                    }
                });
                Some(session)
            }
            Ok(None) => {
                if self.shared.has_session() {
                    self.shared.set(SessionState::Unauthenticated, None);
                }
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to get user");
                if let Err(e) = self.engine.remove_user() {
                    tracing::warn!(error = %e, "Failed to clear unreadable user");
                }
                self.shared.set(SessionState::Unauthenticated, None);
                None
            }
        }
    }

    /// Sign out locally: the session and its credential are gone afterwards.
    pub fn remove_user(&self) {
        if let Err(e) = self.engine.remove_user() {
            tracing::warn!(error = %e, "Failed to remove stored user");
        }
        self.shared.set(SessionState::Unauthenticated, None);
    }

    /// Sign out locally and at the provider, if it supports RP-initiated logout.
    ///
    /// # Errors
    ///
    /// Returns the discovery error; the local session is removed regardless.
    pub async fn sign_out(&self) -> Result<(), Error> {
        let result = self.engine.signout_redirect().await;
        self.shared.set(SessionState::Unauthenticated, None);
        result
    }

    /// Check the provider session without user interaction.
    ///
    /// `None` when the provider session has ended or the check failed.
    pub async fn query_session_status(&self) -> Option<SessionStatus> {
        match self.engine.query_session_status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "Session status query failed");
                None
            }
        }
    }

    pub fn start_silent_renew(&self) {
        self.engine.start_silent_renew();
    }

    /// Suppresses future renewals and pending retries; an in-flight renewal completes.
    pub fn stop_silent_renew(&self) {
        self.engine.stop_silent_renew();
    }

    #[must_use]
    pub fn is_silent_renew_enabled(&self) -> bool {
        self.engine.is_silent_renew_enabled()
    }
}

impl<B, S> SessionManager<B, S> {
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.snapshot.borrow().state
    }

    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.shared.snapshot.borrow().session.clone()
    }

    /// Credential for API calls, `None` when signed out.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        self.shared.snapshot.borrow().credential()
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.shared
            .snapshot
            .borrow()
            .session
            .as_ref()
            .is_some_and(|s| !s.is_expired())
    }

    /// Observe every state/session transition.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Raw lifecycle events from the token engine.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent>
    where
        B: Browser,
        S: TokenStore,
    {
        self.engine.subscribe()
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<UserManager<B, S>> {
        &self.engine
    }
}

async fn run_event_loop<B: Browser, S: TokenStore>(
    engine: Weak<UserManager<B, S>>,
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Session event loop lagged behind events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(engine) = engine.upgrade() else {
            break;
        };
        handle_event(&engine, &shared, event);
    }
}

fn handle_event<B: Browser, S: TokenStore>(
    engine: &Arc<UserManager<B, S>>,
    shared: &Arc<Shared>,
    event: SessionEvent,
) {
    match event {
        SessionEvent::UserLoaded(session) => {
            tracing::debug!("User loaded");
            shared.failures.store(0, Ordering::Release);
            shared.set(SessionState::Authenticated, Some(session));
        }
        SessionEvent::UserUnloaded => {
            tracing::debug!("User unloaded");
            shared.set(SessionState::Unauthenticated, None);
        }
        SessionEvent::AccessTokenExpiring => {
            tracing::debug!("Access token expiring");
            if engine.is_silent_renew_enabled() && shared.has_session() {
                shared.set_state(SessionState::RenewalPending);
            }
        }
        SessionEvent::AccessTokenExpired => {
            tracing::info!("Access token expired; removing user");
            drop_session(engine, shared);
        }
        SessionEvent::SilentRenewError(error) if error.interaction_required => {
            tracing::warn!(reason = %error.reason, "Silent renew needs user interaction");
            drop_session(engine, shared);
        }
        SessionEvent::SilentRenewError(error) => {
            let failures = shared.failures.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::warn!(reason = %error.reason, failures, "Silent renew error");
            shared.set_state(SessionState::RenewalFailed);

            if !shared.policy.allows_retry(failures) {
                tracing::warn!(failures, "Giving up on silent renew");
                drop_session(engine, shared);
                return;
            }
            schedule_retry(
                Arc::downgrade(engine),
                Arc::clone(shared),
                shared.policy.delay_for(failures),
            );
        }
        SessionEvent::UserSignedOut => {
            tracing::info!("User signed out at the provider");
        }
    }
}

fn drop_session<B: Browser, S: TokenStore>(engine: &UserManager<B, S>, shared: &Shared) {
    if let Err(e) = engine.remove_user() {
        tracing::warn!(error = %e, "Failed to remove stored user");
    }
    shared.set(SessionState::Unauthenticated, None);
}

/// Retry a failed renewal after `delay`, unless renewal was stopped meanwhile.
fn schedule_retry<B: Browser, S: TokenStore>(
    engine: Weak<UserManager<B, S>>,
    shared: Arc<Shared>,
    delay: std::time::Duration,
) {
    tracing::debug!(delay_ms = delay.as_millis() as u64, "Scheduling silent renew retry");
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        let Some(engine) = engine.upgrade() else {
            return;
        };
        if !engine.is_silent_renew_enabled() {
            tracing::debug!("Silent renew stopped; not retrying");
            return;
        }

        match engine.get_user() {
            Ok(Some(session)) => {
                tracing::debug!("Retrying silent renew");
                shared.set_state(SessionState::RenewalPending);
                engine.restart_timers(&session);
            }
            Ok(None) => {
                tracing::info!("Session gone or expired; not retrying silent renew");
                drop_session(&engine, &shared);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to re-check session before retry");
                drop_session(&engine, &shared);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use super::*;
    use crate::session::test_support::{FakeBrowser, SilentOutcome, mock_provider, test_config};
    use crate::store::MemoryStore;

    type Manager = SessionManager<Arc<FakeBrowser>, Arc<MemoryStore>>;

    async fn wait_until(sessions: &Manager, predicate: impl FnMut(&Snapshot) -> bool) -> Snapshot {
        let mut rx = sessions.watch();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for session state")
            .expect("session manager dropped")
            .clone()
    }

    /// Signs in with a token valid for `expires_in` seconds.
    async fn signed_in(
        browser: &Arc<FakeBrowser>,
        config: ClientConfig,
        expires_in: u64,
    ) -> (Manager, Arc<Session>) {
        let (sessions, user) =
            SessionManager::initialize(config, browser.clone(), Arc::new(MemoryStore::new())).await;
        assert!(user.is_none());
        sessions.start_authentication().await.unwrap();
        assert_eq!(sessions.state(), SessionState::Authenticating);
        browser.grant_last_navigation(expires_in);
        let session = sessions.complete_authentication().await.unwrap();
        (sessions, session)
    }

    #[tokio::test]
    async fn initialize_without_callback_is_unauthenticated() {
        let browser = FakeBrowser::new("https://idp.example", "https://app.example/home");
        let (sessions, user) = SessionManager::initialize(
            test_config("https://idp.example"),
            browser,
            MemoryStore::new(),
        )
        .await;

        assert!(user.is_none());
        assert_eq!(sessions.state(), SessionState::Unauthenticated);
        assert!(sessions.credential().is_none());
        assert!(sessions.get_user().is_none());
    }

    #[tokio::test]
    async fn initialize_completes_callback_and_scrubs_location() {
        let provider = mock_provider().await;
        let browser = Arc::new(FakeBrowser::new(&provider.uri(), "https://app.example/"));
        let store = Arc::new(MemoryStore::new());

        let (first, _) =
            SessionManager::initialize(test_config(&provider.uri()), browser.clone(), store.clone())
                .await;
        first.start_authentication().await.unwrap();
        browser.grant_last_navigation(3600);

        // A fresh page load lands on the callback.
        let (sessions, user) =
            SessionManager::initialize(test_config(&provider.uri()), browser.clone(), store).await;
        let user = user.expect("callback should produce a session");

        assert_eq!(user.subject(), Some("user-1"));
        assert_eq!(sessions.state(), SessionState::Authenticated);
        assert_eq!(
            sessions.credential().unwrap().header_value(),
            format!("Bearer {}", user.access_token)
        );
        assert_eq!(
            browser.replaced().last().map(Url::as_str),
            Some("https://app.example/")
        );
        assert!(sessions.is_logged_in());
    }

    #[tokio::test]
    async fn failed_callback_is_scrubbed_and_unauthenticated() {
        let provider = mock_provider().await;
        let browser = Arc::new(FakeBrowser::new(
            &provider.uri(),
            "https://app.example/#callback&state=bogus&access_token=x",
        ));
        let (sessions, user) = SessionManager::initialize(
            test_config(&provider.uri()),
            browser.clone(),
            MemoryStore::new(),
        )
        .await;

        assert!(user.is_none());
        assert_eq!(sessions.state(), SessionState::Unauthenticated);
        assert_eq!(browser.replaced().len(), 1);
        assert!(browser.location().fragment().is_none());
    }

    #[tokio::test]
    async fn loaded_and_unloaded_events_drive_state() {
        let browser = FakeBrowser::new("https://idp.example", "https://app.example/");
        let (sessions, _) = SessionManager::initialize(
            test_config("https://idp.example"),
            Arc::new(browser),
            Arc::new(MemoryStore::new()),
        )
        .await;

        for token in ["at-a", "at-b"] {
            let session = Arc::new(Session::new("https://idp.example/", "c1", "Bearer", token));
            sessions
                .engine()
                .emit(SessionEvent::UserLoaded(Arc::clone(&session)));
            let snapshot = wait_until(&sessions, |s| s.session.is_some()).await;
            assert_eq!(snapshot.state, SessionState::Authenticated);
            assert_eq!(snapshot.credential().unwrap().access_token(), token);

            sessions.engine().emit(SessionEvent::UserUnloaded);
            let snapshot = wait_until(&sessions, |s| s.session.is_none()).await;
            assert_eq!(snapshot.state, SessionState::Unauthenticated);
        }
    }

    #[tokio::test]
    async fn remove_user_always_signs_out() {
        let provider = mock_provider().await;
        let browser = Arc::new(FakeBrowser::new(&provider.uri(), "https://app.example/"));
        let (sessions, _) = signed_in(&browser, test_config(&provider.uri()), 3600).await;
        assert_eq!(sessions.state(), SessionState::Authenticated);

        sessions.remove_user();
        assert_eq!(sessions.state(), SessionState::Unauthenticated);
        assert!(sessions.credential().is_none());
        assert!(sessions.get_user().is_none());

        // Already signed out: still a no-op success.
        sessions.remove_user();
        assert_eq!(sessions.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn get_user_restores_stored_session() {
        let provider = mock_provider().await;
        let browser = Arc::new(FakeBrowser::new(&provider.uri(), "https://app.example/"));
        let store = Arc::new(MemoryStore::new());

        let (first, _) =
            SessionManager::initialize(test_config(&provider.uri()), browser.clone(), store.clone())
                .await;
        first.start_authentication().await.unwrap();
        browser.grant_last_navigation(3600);
        let original = first.complete_authentication().await.unwrap();

        browser.set_location("https://app.example/other".parse().unwrap());
        let (second, user) =
            SessionManager::initialize(test_config(&provider.uri()), browser, store).await;
        assert!(user.is_none());
        assert_eq!(second.state(), SessionState::Unauthenticated);

        let restored = second.get_user().unwrap();
        assert_eq!(restored.access_token, original.access_token);
        assert_eq!(second.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn failed_renewal_is_retried() {
        let provider = mock_provider().await;
        let browser = Arc::new(FakeBrowser::new(&provider.uri(), "https://app.example/"));
        browser.push_outcome(SilentOutcome::ProviderError("temporarily_unavailable"));

        let (sessions, first) = signed_in(&browser, test_config(&provider.uri()), 30).await;
        tokio::time::pause();

        let snapshot = wait_until(&sessions, |s| {
            s.session
                .as_ref()
                .is_some_and(|session| session.access_token != first.access_token)
        })
        .await;

        assert_eq!(snapshot.state, SessionState::Authenticated);
        assert_eq!(browser.silent_calls(), 2);
        assert!(snapshot.session.unwrap().expires_in().unwrap() > Duration::from_secs(3000));
    }

    #[tokio::test]
    async fn managers_over_one_engine_retry_once() {
        let provider = mock_provider().await;
        let browser = Arc::new(FakeBrowser::new(&provider.uri(), "https://app.example/"));
        browser.push_outcome(SilentOutcome::ProviderError("temporarily_unavailable"));
        let engine = UserManager::new(
            test_config(&provider.uri()),
            Arc::new(browser.clone()),
            Arc::new(Arc::new(MemoryStore::new())),
        );

        let (first, _): (Manager, _) = SessionManager::with_engine(engine.clone()).await;
        let (second, _): (Manager, _) = SessionManager::with_engine(engine).await;
        first.start_authentication().await.unwrap();
        browser.grant_last_navigation(30);
        let initial = first.complete_authentication().await.unwrap();
        assert_eq!(
            second.session().map(|s| s.access_token.clone()),
            Some(initial.access_token.clone())
        );
        tokio::time::pause();

        let snapshot = wait_until(&second, |s| {
            s.session
                .as_ref()
                .is_some_and(|session| session.access_token != initial.access_token)
        })
        .await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(browser.silent_calls(), 2);
        assert_eq!(first.state(), SessionState::Authenticated);
        assert_eq!(
            first.session().map(|s| s.access_token.clone()),
            snapshot.session.map(|s| s.access_token.clone())
        );
    }

    #[tokio::test]
    async fn initialize_on_other_page_with_state_param_is_not_a_callback() {
        let browser = Arc::new(FakeBrowser::new(
            "https://idp.example",
            "https://app.example/reports?state=open",
        ));
        let config = ClientConfig::new(
            "https://idp.example".parse().unwrap(),
            "c1",
            "https://app.example/".parse().unwrap(),
        );
        let (sessions, user) =
            SessionManager::initialize(config, browser.clone(), MemoryStore::new()).await;

        assert!(user.is_none());
        assert_eq!(sessions.state(), SessionState::Unauthenticated);
        assert!(browser.replaced().is_empty());
    }

    #[tokio::test]
    async fn stopped_renewal_is_not_retried() {
        let provider = mock_provider().await;
        let browser = Arc::new(FakeBrowser::new(&provider.uri(), "https://app.example/"));
        browser.push_outcome(SilentOutcome::FrameFailure);

        let (sessions, _) = signed_in(&browser, test_config(&provider.uri()), 30).await;
        tokio::time::pause();

        wait_until(&sessions, |s| s.state == SessionState::RenewalFailed).await;
        sessions.stop_silent_renew();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(browser.silent_calls(), 1);
        assert_eq!(sessions.state(), SessionState::RenewalFailed);
        assert!(sessions.session().is_some());
    }

    #[tokio::test]
    async fn interaction_required_signs_out_without_retry() {
        let provider = mock_provider().await;
        let browser = Arc::new(FakeBrowser::new(&provider.uri(), "https://app.example/"));
        browser.push_outcome(SilentOutcome::ProviderError("login_required"));

        let (sessions, _) = signed_in(&browser, test_config(&provider.uri()), 30).await;
        tokio::time::pause();

        let snapshot = wait_until(&sessions, |s| s.session.is_none()).await;
        assert_eq!(snapshot.state, SessionState::Unauthenticated);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(browser.silent_calls(), 1);
        assert!(sessions.is_silent_renew_enabled());
    }

    #[tokio::test]
    async fn bounded_retries_give_up() {
        let provider = mock_provider().await;
        let browser = Arc::new(FakeBrowser::new(&provider.uri(), "https://app.example/"));
        browser.push_outcome(SilentOutcome::FrameFailure);
        browser.push_outcome(SilentOutcome::FrameFailure);
        let config = test_config(&provider.uri())
            .with_renewal(RenewalPolicy::default().with_max_retries(Some(1)));

        let (sessions, _) = signed_in(&browser, config, 30).await;
        tokio::time::pause();

        let snapshot = wait_until(&sessions, |s| s.session.is_none()).await;
        assert_eq!(snapshot.state, SessionState::Unauthenticated);
        assert_eq!(browser.silent_calls(), 2);
    }
}
