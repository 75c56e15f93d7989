//! Route guard: the navigation decision table.
//!
//! DESIGN
//! ======
//! [`decide`] is a pure function of the requested route and a
//! [`GuardSnapshot`] taken from the session and institute states together.
//! It never fails: resolution errors arrive as "institute not resolved" and
//! are reported to the user separately.
//!
//! Protected routes:
//!
//! | loading | session | institute | decision             |
//! |---------|---------|-----------|----------------------|
//! | yes     | any     | any       | Loading              |
//! | no      | no      | any       | RedirectToLogin      |
//! | no      | yes     | no        | RedirectToTenantGate |
//! | no      | yes     | yes       | Allow                |
//!
//! "Loading" covers either side still on its first pass, so a half-read
//! state never redirects. Public routes always allow. Auth-entry routes
//! redirect to the protected home once everything has resolved.
//!
//! TRADE-OFFS
//! ==========
//! Redirect de-duplication lives in [`RedirectLatch`], outside the pure
//! table, keyed by the exact snapshot that produced the redirect. A new state
//! transition re-arms it without any explicit reset. A new navigation resets
//! it, so only re-evaluation of an unchanged state is suppressed.

use std::sync::{Mutex, PoisonError};

use crate::institute::InstituteState;
use crate::route::{Route, RouteClass};
use crate::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::struct_excessive_bools)]
pub struct GuardSnapshot {
    pub session_loading: bool,
    pub session_present: bool,
    pub institute_loading: bool,
    pub institute_resolved: bool,
}

impl GuardSnapshot {
    /// Read both sides together.
    #[must_use]
    pub fn capture(session: &SessionState, institute: &InstituteState) -> Self {
        Self {
            session_loading: session.is_loading(),
            session_present: session.is_authenticated(),
            institute_loading: institute.is_pending(),
            institute_resolved: institute.satisfies_guard(),
        }
    }

    #[must_use]
    pub const fn is_loading(self) -> bool {
        self.session_loading || self.institute_loading
    }

    #[must_use]
    pub const fn is_fully_resolved(self) -> bool {
        !self.is_loading() && self.session_present && self.institute_resolved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardDecision {
    Loading,
    Allow,
    RedirectToLogin,
    RedirectToTenantGate,
    RedirectToProtectedHome,
}

impl GuardDecision {
    #[must_use]
    pub const fn target(self) -> Option<Route> {
        match self {
            GuardDecision::Loading | GuardDecision::Allow => None,
            GuardDecision::RedirectToLogin => Some(Route::LOGIN),
            GuardDecision::RedirectToTenantGate => Some(Route::TENANT_GATE),
            GuardDecision::RedirectToProtectedHome => Some(Route::PROTECTED_HOME),
        }
    }

    #[must_use]
    pub const fn is_redirect(self) -> bool {
        self.target().is_some()
    }
}

#[must_use]
pub const fn decide(route: Route, snapshot: GuardSnapshot) -> GuardDecision {
    match route.class() {
        RouteClass::Public => GuardDecision::Allow,
        RouteClass::AuthEntry => {
            if snapshot.is_fully_resolved() {
                GuardDecision::RedirectToProtectedHome
            } else {
                GuardDecision::Allow
            }
        }
        RouteClass::Protected => {
            if snapshot.is_loading() {
                GuardDecision::Loading
            } else if !snapshot.session_present {
                GuardDecision::RedirectToLogin
            } else if !snapshot.institute_resolved {
                GuardDecision::RedirectToTenantGate
            } else {
                GuardDecision::Allow
            }
        }
    }
}

// =============================================================================
// REDIRECT LATCH
// =============================================================================

/// Lets a given redirect through once per (snapshot, route, target).
#[derive(Debug, Default)]
pub struct RedirectLatch {
    last: Mutex<Option<(GuardSnapshot, Route, Route)>>,
}

impl RedirectLatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if this exact redirect was the last one admitted.
    pub fn admit(&self, snapshot: GuardSnapshot, from: Route, target: Route) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (snapshot, from, target);
        if *last == Some(key) {
            return false;
        }
        *last = Some(key);
        true
    }

    pub fn reset(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod tests;
