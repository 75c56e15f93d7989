//! In-process identity backend.
//!
//! Keeps accounts, the current session and the institute table in memory.
//! Counts every session and institute fetch, can be switched offline, and can
//! hold the next session or institute fetch open so callers can interleave
//! events, sign-outs and tenant changes with an in-flight request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use time::OffsetDateTime;
use tokio::sync::{Notify, broadcast};
use uuid::Uuid;

use super::{AUTH_EVENT_CAPACITY, AuthChange, AuthEvent, BackendError, IdentityBackend};
use crate::institute::InstituteRecord;
use crate::session::{Session, SignUpOutcome, UserMetadata, normalize_email};

struct Account {
    user_id: Uuid,
    password: String,
    metadata: UserMetadata,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    current: Option<Session>,
    institutes: HashMap<String, InstituteRecord>,
}

pub struct MemoryIdentityBackend {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<AuthChange>,
    offline: AtomicBool,
    session_gate: Mutex<Option<Arc<Notify>>>,
    institute_gate: Mutex<Option<Arc<Notify>>>,
    session_fetches: AtomicUsize,
    institute_fetches: AtomicUsize,
}

impl Default for MemoryIdentityBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityBackend {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            offline: AtomicBool::new(false),
            session_gate: Mutex::new(None),
            institute_gate: Mutex::new(None),
            session_fetches: AtomicUsize::new(0),
            institute_fetches: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn with_institute(self, record: InstituteRecord) -> Self {
        self.insert_institute(record);
        self
    }

    pub fn insert_institute(&self, record: InstituteRecord) {
        self.state().institutes.insert(record.institute_id.clone(), record);
    }

    pub fn remove_institute(&self, institute_id: &str) {
        self.state().institutes.remove(institute_id);
    }

    /// Register an account directly, bypassing sign-up.
    pub fn register(&self, email: &str, password: &str, metadata: UserMetadata) -> Uuid {
        let user_id = Uuid::new_v4();
        self.state()
            .accounts
            .insert(normalize_email(email), Account { user_id, password: password.to_owned(), metadata });
        user_id
    }

    /// Build a fresh session for a registered account without signing in.
    #[must_use]
    pub fn session_for(&self, email: &str) -> Option<Session> {
        let email = normalize_email(email);
        let state = self.state();
        let account = state.accounts.get(&email)?;
        Some(Session::new(account.user_id, &email, account.metadata.clone(), OffsetDateTime::now_utc()))
    }

    /// Make the provider hold `session` and push the transition to subscribers.
    pub fn emit(&self, event: AuthEvent, session: Option<Session>) {
        self.state().current.clone_from(&session);
        let _ = self.events.send(AuthChange { event, session });
    }

    /// Make every call fail with a network error until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Hold the next session fetch until the returned handle is notified.
    /// The fetch answers with the session held when it started.
    #[must_use]
    pub fn hold_session_fetch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.session_gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(gate.clone());
        gate
    }

    /// Hold the next institute fetch until the returned handle is notified.
    /// The fetch answers with the table as it is when released.
    #[must_use]
    pub fn hold_institute_fetch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.institute_gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(gate.clone());
        gate
    }

    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.state().current.clone()
    }

    #[must_use]
    pub fn session_fetches(&self) -> usize {
        self.session_fetches.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn institute_fetches(&self) -> usize {
        self.institute_fetches.load(Ordering::Acquire)
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(BackendError::Network("backend unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl IdentityBackend for MemoryIdentityBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        self.session_fetches.fetch_add(1, Ordering::AcqRel);
        let answer = self.state().current.clone();
        let gate = self.session_gate.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.check_online()?;
        Ok(answer)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        self.check_online()?;
        let email = normalize_email(email);
        let session = {
            let mut state = self.state();
            let account = state.accounts.get(&email).ok_or(BackendError::InvalidCredentials)?;
            if account.password != password {
                return Err(BackendError::InvalidCredentials);
            }
            let session = Session::new(account.user_id, &email, account.metadata.clone(), OffsetDateTime::now_utc());
            state.current = Some(session.clone());
            session
        };
        let _ = self.events.send(AuthChange { event: AuthEvent::SignedIn, session: Some(session.clone()) });
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &UserMetadata,
    ) -> Result<SignUpOutcome, BackendError> {
        self.check_online()?;
        let email = normalize_email(email);
        let mut state = self.state();
        if state.accounts.contains_key(&email) {
            return Err(BackendError::Rejected { status: 422, message: "user already registered".into() });
        }
        let user_id = Uuid::new_v4();
        state
            .accounts
            .insert(email, Account { user_id, password: password.to_owned(), metadata: metadata.clone() });
        Ok(SignUpOutcome { user_id, email_confirmation_required: false })
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.check_online()?;
        if self.state().current.take().is_none() {
            return Err(BackendError::NotSignedIn);
        }
        let _ = self.events.send(AuthChange { event: AuthEvent::SignedOut, session: None });
        Ok(())
    }

    async fn fetch_institute(&self, institute_id: &str) -> Result<Option<InstituteRecord>, BackendError> {
        self.institute_fetches.fetch_add(1, Ordering::AcqRel);
        let gate = self.institute_gate.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.check_online()?;
        Ok(self.state().institutes.get(institute_id).cloned())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
