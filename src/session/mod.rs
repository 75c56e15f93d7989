//! Session store: the local view of the identity provider's session.
//!
//! DESIGN
//! ======
//! State lives in a `tokio::sync::watch` channel, so subscribers only ever
//! see the latest [`SessionState`]. Nothing is queued behind a slow reader.
//!
//! Lifecycle: `Uninitialized -> Loading -> {Authenticated, Anonymous}`.
//! Loading happens once, during [`SessionStore::bootstrap`]. Pushed backend
//! events move straight between `Authenticated` and `Anonymous`.
//!
//! ORDERING
//! ========
//! Every pushed event bumps [`SessionState::revision`]. Bootstrap records the
//! revision before it fetches and drops its result if the revision moved in
//! the meantime, so an event always beats a slower bootstrap fetch regardless
//! of which future settles last.
//!
//! A retired store ([`SessionStore::shutdown`]) applies nothing further.
//! In-flight fetches run to completion and their results are discarded.

pub mod types;

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::AbortHandle;

pub use types::{
    Address, MIN_PASSWORD_LEN, Role, Session, SignUpError, SignUpOutcome, SignUpRequest, UserMetadata, UserProfile,
    WireUser, normalize_email,
};

use crate::backend::{AuthChange, BackendError, IdentityBackend};
use crate::cache::{CacheError, CacheKey, PersistentCache};
use crate::config::PortalFeatures;
use crate::liveness::Liveness;

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Loading,
    Authenticated,
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub session: Option<Session>,
    /// Set when the last fetch failed. The phase is then `Anonymous`.
    pub error: Option<BackendError>,
    /// Bumped on every applied change.
    pub revision: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self { phase: SessionPhase::Uninitialized, session: None, error: None, revision: 0 }
    }
}

impl SessionState {
    /// True until the first resolution pass has completed.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self.phase, SessionPhase::Uninitialized | SessionPhase::Loading)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    fn settle(&mut self, session: Option<Session>, error: Option<BackendError>) {
        self.phase = if session.is_some() { SessionPhase::Authenticated } else { SessionPhase::Anonymous };
        self.session = session;
        self.error = error;
        self.revision += 1;
    }
}

/// Change feed for one consumer. Dropping it unsubscribes.
pub struct SessionSubscription {
    rx: watch::Receiver<SessionState>,
}

impl SessionSubscription {
    /// Wait for the next change and return the latest state.
    /// Returns `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<SessionState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    #[must_use]
    pub fn latest(&self) -> SessionState {
        self.rx.borrow().clone()
    }

    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    pub fn unsubscribe(self) {}
}

// =============================================================================
// STORE
// =============================================================================

struct SessionInner {
    backend: Arc<dyn IdentityBackend>,
    cache: PersistentCache,
    state: watch::Sender<SessionState>,
    alive: Liveness,
    listener: Mutex<Option<AbortHandle>>,
    role_selection: bool,
}

impl SessionInner {
    fn apply_change(&self, change: AuthChange) {
        tracing::debug!(event = ?change.event, signed_in = change.session.is_some(), "session change");
        self.state.send_modify(|state| state.settle(change.session, None));
    }
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn IdentityBackend>, cache: PersistentCache, features: &PortalFeatures) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            inner: Arc::new(SessionInner {
                backend,
                cache,
                state,
                alive: Liveness::new(),
                listener: Mutex::new(None),
                role_selection: features.role_selection,
            }),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> SessionSubscription {
        SessionSubscription { rx: self.inner.state.subscribe() }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.is_alive()
    }

    /// Run the initial session fetch. Only the first call does any work.
    pub async fn bootstrap(&self) {
        let mut baseline = None;
        self.inner.state.send_if_modified(|state| {
            if state.phase != SessionPhase::Uninitialized {
                return false;
            }
            state.phase = SessionPhase::Loading;
            baseline = Some(state.revision);
            true
        });
        let Some(baseline) = baseline else { return };

        let result = self.inner.backend.get_session().await;

        if !self.inner.alive.is_alive() {
            tracing::debug!("session store retired; dropping bootstrap result");
            return;
        }
        self.inner.state.send_if_modified(|state| {
            if state.revision != baseline {
                tracing::debug!("bootstrap result superseded by a pushed session change");
                return false;
            }
            match result {
                Ok(session) => {
                    tracing::info!(signed_in = session.is_some(), "session bootstrapped");
                    state.settle(session, None);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "session fetch failed; continuing signed out");
                    state.settle(None, Some(e));
                }
            }
            true
        });
    }

    /// Bootstrap if needed, then wait until the first pass has completed.
    /// Returns early with the current state once the store is retired.
    pub async fn ready(&self) -> SessionState {
        let mut rx = self.inner.state.subscribe();
        self.bootstrap().await;
        let alive = self.inner.alive.clone();
        match rx.wait_for(|state| !state.is_loading() || !alive.is_alive()).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Start applying backend-pushed session changes, in arrival order.
    /// Must be called from within a Tokio runtime.
    pub fn listen(&self) {
        let mut listener = self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() || !self.inner.alive.is_alive() {
            return;
        }
        let mut events = self.inner.backend.subscribe();
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(change) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if !inner.alive.is_alive() {
                            break;
                        }
                        inner.apply_change(change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "session listener lagged; skipping to newer events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *listener = Some(task.abort_handle());
    }

    /// Sign in with email and password and make the session current.
    ///
    /// # Errors
    ///
    /// Returns the backend error, typically [`BackendError::InvalidCredentials`].
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let email = normalize_email(email);
        let session = self.inner.backend.sign_in_with_password(&email, password).await?;
        if self.inner.alive.is_alive() {
            self.inner.state.send_modify(|state| state.settle(Some(session.clone()), None));
        }
        self.write_display_hints(&session);
        tracing::info!(user_id = %session.user_id, "signed in");
        Ok(session)
    }

    /// Register a new account from the sign-up form.
    ///
    /// # Errors
    ///
    /// Returns [`SignUpError`] for a form that fails validation or a backend
    /// that rejects the account.
    pub async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpOutcome, SignUpError> {
        request.validate()?;
        let email = normalize_email(&request.email);
        let metadata = request.metadata();
        let outcome = self.inner.backend.sign_up(&email, &request.password, &metadata).await?;

        let hints = [
            (CacheKey::InstitutionName, metadata.institution_name.as_deref()),
            (CacheKey::FullName, metadata.full_name.as_deref()),
            (CacheKey::Email, Some(email.as_str())),
            (CacheKey::InstituteId, metadata.institute_id.as_deref()),
        ];
        for (key, value) in hints {
            if let Some(value) = value {
                self.write_hint(key, value);
            }
        }
        tracing::info!(
            user_id = %outcome.user_id,
            confirmation = outcome.email_confirmation_required,
            "account registered"
        );
        Ok(outcome)
    }

    /// End the session and clear every cached entry. Already being signed out
    /// counts as success.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the provider could not be told. Local
    /// state is cleared regardless.
    pub async fn sign_out(&self) -> Result<(), BackendError> {
        let error = match self.inner.backend.sign_out().await {
            Ok(()) | Err(BackendError::NotSignedIn) => None,
            Err(e) => {
                tracing::warn!(error = %e, "backend sign-out failed; clearing local session anyway");
                Some(e)
            }
        };
        if let Err(e) = self.inner.cache.clear_namespace() {
            tracing::warn!(error = %e, "failed to clear cache on sign-out");
        }
        self.inner.state.send_modify(|state| state.settle(None, error.clone()));
        error.map_or(Ok(()), Err)
    }

    /// Display view of the current user. Never used for authorization.
    #[must_use]
    pub fn profile(&self) -> Option<UserProfile> {
        let state = self.snapshot();
        let session = state.session.as_ref()?;
        let role = if self.inner.role_selection {
            self.inner.cache.get(CacheKey::RoleHint).as_deref().and_then(Role::parse)
        } else {
            None
        };
        Some(UserProfile::from_session(session, role))
    }

    /// Remember the role picked at login. Ignored unless role selection is on.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the hint could not be written.
    pub fn set_role_hint(&self, role: Role) -> Result<(), CacheError> {
        if !self.inner.role_selection {
            tracing::debug!(role = role.as_str(), "role selection disabled; ignoring role hint");
            return Ok(());
        }
        self.inner.cache.set(CacheKey::RoleHint, role.as_str())
    }

    /// # Errors
    ///
    /// Returns [`CacheError`] if the hint could not be removed.
    pub fn clear_role_hint(&self) -> Result<(), CacheError> {
        self.inner.cache.remove(CacheKey::RoleHint)
    }

    /// Retire the store: stop the listener and drop any late results.
    pub fn shutdown(&self) {
        self.inner.alive.retire();
        if let Some(handle) = self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        // wake ready() waiters
        self.inner.state.send_modify(|_| {});
    }

    fn write_display_hints(&self, session: &Session) {
        self.write_hint(CacheKey::FullName, &session.display_name);
        self.write_hint(CacheKey::Email, &session.email);
        if let Some(name) = session.metadata.institution_name.as_deref() {
            self.write_hint(CacheKey::InstitutionName, name);
        }
    }

    fn write_hint(&self, key: CacheKey, value: &str) {
        if let Err(e) = self.inner.cache.set(key, value) {
            tracing::warn!(key = key.suffix(), error = %e, "failed to write display hint");
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
