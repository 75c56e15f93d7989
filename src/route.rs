//! Route table, location parsing, and the navigator seam.

use crate::config::PortalFeatures;

/// Placeholder origin for parsing relative and hash-routed locations.
const PARSE_BASE: &str = "http://portal.invalid/";

pub const INSTITUTE_PARAM: &str = "institute";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// Always allowed.
    Public,
    /// Login and registration. Redirects away once fully resolved.
    AuthEntry,
    /// Reachable only with a session and an active institute.
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Access,
    Platform,
    SignUp,
    VerifyEmail,
    DemoDesign,
    Dashboard,
    Students,
    Attendance,
    Results,
    Settings,
}

impl Route {
    pub const ALL: [Route; 10] = [
        Route::Access,
        Route::Platform,
        Route::SignUp,
        Route::VerifyEmail,
        Route::DemoDesign,
        Route::Dashboard,
        Route::Students,
        Route::Attendance,
        Route::Results,
        Route::Settings,
    ];

    pub const TENANT_GATE: Route = Route::Access;
    pub const LOGIN: Route = Route::Platform;
    pub const PROTECTED_HOME: Route = Route::Dashboard;

    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Route::Access => "/access",
            Route::Platform => "/platform",
            Route::SignUp => "/signup",
            Route::VerifyEmail => "/verify-email",
            Route::DemoDesign => "/demo-design",
            Route::Dashboard => "/dashboard",
            Route::Students => "/students",
            Route::Attendance => "/attendance",
            Route::Results => "/results",
            Route::Settings => "/settings",
        }
    }

    #[must_use]
    pub const fn class(self) -> RouteClass {
        match self {
            Route::Access | Route::VerifyEmail | Route::DemoDesign => RouteClass::Public,
            Route::Platform | Route::SignUp => RouteClass::AuthEntry,
            Route::Dashboard | Route::Students | Route::Attendance | Route::Results | Route::Settings => {
                RouteClass::Protected
            }
        }
    }

    /// Match a path. The root path is the login screen.
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let trimmed = path.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Some(Route::LOGIN);
        }
        Self::ALL.into_iter().find(|route| route.path().eq_ignore_ascii_case(trimmed))
    }

    #[must_use]
    pub const fn is_enabled(self, features: &PortalFeatures) -> bool {
        match self {
            Route::SignUp => features.signup,
            Route::VerifyEmail => features.email_verification,
            Route::DemoDesign => features.design_demo,
            _ => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no route for {0}")]
    UnknownRoute(String),
    #[error("route {0} is disabled")]
    Disabled(&'static str),
    #[error("invalid location '{location}': {message}")]
    InvalidLocation { location: String, message: String },
}

// =============================================================================
// LOCATION
// =============================================================================

/// A requested route plus the institute id carried in its query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub route: Route,
    pub institute: Option<String>,
}

impl Location {
    #[must_use]
    pub const fn new(route: Route) -> Self {
        Self { route, institute: None }
    }

    #[must_use]
    pub fn with_institute(mut self, institute_id: &str) -> Self {
        self.institute = Some(institute_id.to_owned());
        self
    }

    /// Parse a path (`/dashboard?institute=X`), a hash-routed location
    /// (`/#/dashboard?institute=X`), or an absolute URL of either form.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] when the location does not parse, names no
    /// route, or names a route switched off in `features`.
    pub fn parse(raw: &str, features: &PortalFeatures) -> Result<Self, RouteError> {
        let base = reqwest::Url::parse(PARSE_BASE).map_err(|e| RouteError::InvalidLocation {
            location: raw.to_owned(),
            message: e.to_string(),
        })?;
        let join = |input: &str| {
            base.join(input).map_err(|e| RouteError::InvalidLocation {
                location: raw.to_owned(),
                message: e.to_string(),
            })
        };

        let mut url = join(raw.trim())?;
        if let Some(fragment) = url.fragment().filter(|f| f.starts_with('/')).map(str::to_owned) {
            url = join(&fragment)?;
        }

        let route = Route::from_path(url.path()).ok_or_else(|| RouteError::UnknownRoute(url.path().to_owned()))?;
        if !route.is_enabled(features) {
            return Err(RouteError::Disabled(route.path()));
        }
        let institute = url
            .query_pairs()
            .find(|(key, _)| key == INSTITUTE_PARAM)
            .map(|(_, value)| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        Ok(Self { route, institute })
    }

    #[must_use]
    pub fn href(&self) -> String {
        href(self.route, self.institute.as_deref())
    }
}

/// Path for `route`, with the institute query parameter when given.
#[must_use]
pub fn href(route: Route, institute: Option<&str>) -> String {
    match institute.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => format!("{}?{INSTITUTE_PARAM}={}", route.path(), urlencoding::encode(id)),
        None => route.path().to_owned(),
    }
}

// =============================================================================
// NAVIGATOR
// =============================================================================

/// Receives the navigations the portal decides on.
pub trait Navigator: Send + Sync {
    /// Replace the current location (guard redirects).
    fn replace(&self, href: &str);

    /// Move forward to a new location (user-initiated steps).
    fn push(&self, href: &str) {
        self.replace(href);
    }
}

impl<F> Navigator for F
where
    F: Fn(&str) + Send + Sync,
{
    fn replace(&self, href: &str) {
        self(href);
    }
}

#[cfg(test)]
#[path = "route_test.rs"]
mod tests;
