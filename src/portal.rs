//! Portal: runs session and institute resolution per navigation and applies
//! the guard.
//!
//! SYSTEM CONTEXT
//! ==============
//! Each navigation runs the session store's first pass and an institute
//! resolution concurrently (`tokio::join!`). Only after both settle is a
//! [`GuardSnapshot`] taken and [`decide`] consulted. Redirects go to the
//! injected [`Navigator`] through a [`RedirectLatch`], so re-evaluating an
//! unchanged state never issues the same redirect twice. Every fresh
//! navigation re-arms the latch: asking for a protected route again is a new
//! event and redirects again.
//!
//! Results from a navigation that has since been superseded by a newer one,
//! by [`Portal::logout`] or [`Portal::change_institute`], or that finish
//! after [`Portal::detach`], are dropped.

use std::sync::Arc;

use tokio::sync::watch;

use crate::backend::{BackendError, IdentityBackend};
use crate::cache::PersistentCache;
use crate::config::{DEFAULT_SUPPORT_EMAIL, PortalFeatures};
use crate::guard::{GuardDecision, GuardSnapshot, RedirectLatch, decide};
use crate::institute::{
    InstituteContext, InstituteResolver, InstituteState, ResolutionError, support_mailto,
};
use crate::liveness::{Generation, Liveness};
use crate::route::{Location, Navigator, Route, RouteError, href};
use crate::session::SessionStore;

/// What a navigation ended in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationOutcome {
    pub location: Location,
    pub decision: GuardDecision,
    /// The href handed to the navigator, if a redirect was issued.
    pub redirect: Option<String>,
    /// Resolution failure to show the user.
    pub notice: Option<ResolutionError>,
    /// Support contact for notices the user cannot fix by retrying.
    pub support_link: Option<String>,
    /// A newer navigation (or detach) made this one irrelevant.
    pub superseded: bool,
}

impl NavigationOutcome {
    fn superseded(location: Location) -> Self {
        Self {
            location,
            decision: GuardDecision::Loading,
            redirect: None,
            notice: None,
            support_link: None,
            superseded: true,
        }
    }
}

pub struct Portal {
    session: SessionStore,
    resolver: InstituteResolver,
    navigator: Arc<dyn Navigator>,
    features: PortalFeatures,
    support_email: String,
    institute: watch::Sender<InstituteState>,
    latch: RedirectLatch,
    generation: Generation,
    alive: Liveness,
}

impl Portal {
    /// Wire the portal and start listening for session changes.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        backend: Arc<dyn IdentityBackend>,
        cache: PersistentCache,
        navigator: Arc<dyn Navigator>,
        features: PortalFeatures,
    ) -> Self {
        let session = SessionStore::new(backend.clone(), cache.clone(), &features);
        session.listen();
        let (institute, _) = watch::channel(InstituteState::Pending);
        Self {
            session,
            resolver: InstituteResolver::new(backend, cache),
            navigator,
            features,
            support_email: DEFAULT_SUPPORT_EMAIL.to_owned(),
            institute,
            latch: RedirectLatch::new(),
            generation: Generation::new(),
            alive: Liveness::new(),
        }
    }

    #[must_use]
    pub fn with_support_email(mut self, email: impl Into<String>) -> Self {
        self.support_email = email.into();
        self
    }

    #[must_use]
    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    #[must_use]
    pub fn resolver(&self) -> &InstituteResolver {
        &self.resolver
    }

    #[must_use]
    pub fn features(&self) -> &PortalFeatures {
        &self.features
    }

    #[must_use]
    pub fn institute_state(&self) -> InstituteState {
        self.institute.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_institute(&self) -> watch::Receiver<InstituteState> {
        self.institute.subscribe()
    }

    /// Current guard input, read from both sides at once.
    #[must_use]
    pub fn snapshot(&self) -> GuardSnapshot {
        GuardSnapshot::capture(&self.session.snapshot(), &self.institute.borrow())
    }

    /// Decision for `route` against the current state. No side effects.
    #[must_use]
    pub fn evaluate(&self, route: Route) -> GuardDecision {
        decide(route, self.snapshot())
    }

    /// Parse and navigate to a raw location.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] if the location names no enabled route.
    pub async fn navigate(&self, raw: &str) -> Result<NavigationOutcome, RouteError> {
        let location = Location::parse(raw, &self.features)?;
        Ok(self.navigate_to(location).await)
    }

    pub async fn navigate_to(&self, location: Location) -> NavigationOutcome {
        let ticket = self.generation.advance();
        let (_, resolution) =
            tokio::join!(self.session.ready(), self.resolver.resolve(location.institute.as_deref()));

        if !self.alive.is_alive() || !self.generation.is_current(ticket) {
            tracing::debug!(route = location.route.path(), "navigation superseded; dropping results");
            return NavigationOutcome::superseded(location);
        }
        let institute = InstituteState::from_result(resolution);
        self.institute.send_replace(institute);
        self.latch.reset();
        self.settle(location)
    }

    /// Re-run the guard for `location` without resolving again.
    pub fn reevaluate(&self, location: Location) -> NavigationOutcome {
        self.settle(location)
    }

    /// Resolve the institute again from the cache (or backend), e.g. after a
    /// transient failure, and publish the new state.
    pub async fn reload_institute(&self) -> InstituteState {
        let state = InstituteState::from_result(self.resolver.resolve(None).await);
        if self.alive.is_alive() {
            self.institute.send_replace(state.clone());
        }
        state
    }

    /// Access-gateway "verify": check a typed institute id and make it current.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError`] if the id is unknown, inactive, or could not
    /// be looked up.
    pub async fn select_institute(&self, institute_id: &str) -> Result<InstituteContext, ResolutionError> {
        match self.resolver.select(institute_id).await {
            Ok(ctx) => {
                self.publish(InstituteState::Resolved(ctx.clone()));
                Ok(ctx)
            }
            Err(e) => {
                let replaces_current =
                    self.institute.borrow().context().is_some_and(|ctx| ctx.institute_id == e.institute_id());
                if replaces_current {
                    self.publish(InstituteState::Failed(e.clone()));
                }
                Err(e)
            }
        }
    }

    /// Access-gateway "continue": go to login carrying the verified id.
    pub fn continue_to_login(&self, ctx: &InstituteContext) -> String {
        let target = href(Route::LOGIN, Some(&ctx.institute_id));
        self.navigator.push(&target);
        target
    }

    /// Forget the current institute and go to the tenant gate.
    pub fn change_institute(&self) -> String {
        self.generation.advance();
        self.resolver.clear();
        self.publish(InstituteState::Missing);
        self.latch.reset();
        let target = href(Route::TENANT_GATE, None);
        self.navigator.push(&target);
        target
    }

    /// Sign out, clear every cached entry, and go to login.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the provider could not be told. Local
    /// state is cleared and the redirect issued regardless.
    pub async fn logout(&self) -> Result<(), BackendError> {
        self.generation.advance();
        self.resolver.clear();
        let result = self.session.sign_out().await;
        self.publish(InstituteState::Missing);
        self.latch.reset();
        if self.alive.is_alive() {
            self.navigator.replace(&href(Route::LOGIN, None));
        }
        result
    }

    /// Stop observing: later results from in-flight work are dropped.
    pub fn detach(&self) {
        self.alive.retire();
        self.session.shutdown();
    }

    #[must_use]
    pub fn support_link(&self, error: &ResolutionError) -> Option<String> {
        match error {
            ResolutionError::Network { .. } => None,
            ResolutionError::NotFound { id } | ResolutionError::Inactive { id } => {
                Some(support_mailto(&self.support_email, id))
            }
        }
    }

    fn publish(&self, state: InstituteState) {
        if self.alive.is_alive() {
            self.institute.send_replace(state);
        }
    }

    fn settle(&self, location: Location) -> NavigationOutcome {
        let institute = self.institute.borrow().clone();
        let snapshot = GuardSnapshot::capture(&self.session.snapshot(), &institute);
        let decision = decide(location.route, snapshot);
        let notice = institute.failure().cloned();
        let support_link = notice.as_ref().and_then(|e| self.support_link(e));

        let redirect = decision.target().and_then(|target| {
            if !self.alive.is_alive() {
                return None;
            }
            if !self.latch.admit(snapshot, location.route, target) {
                tracing::debug!(from = location.route.path(), to = target.path(), "redirect suppressed; state unchanged");
                return None;
            }
            let prefill = match (target, notice.as_ref()) {
                (Route::TENANT_GATE, Some(e)) => Some(e.institute_id()),
                _ => None,
            };
            let target_href = href(target, prefill);
            tracing::info!(from = location.route.path(), to = %target_href, "redirecting");
            self.navigator.replace(&target_href);
            Some(target_href)
        });

        NavigationOutcome { location, decision, redirect, notice, support_link, superseded: false }
    }
}

#[cfg(test)]
#[path = "portal_test.rs"]
mod tests;
