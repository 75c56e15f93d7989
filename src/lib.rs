//! Session, institute-context, and route-guard core for the Nexora portal.
//!
//! SYSTEM CONTEXT
//! ==============
//! The portal's views are thin. What this crate owns is deciding, on every
//! navigation, whether the user may proceed, must sign in, must pick an
//! institute, or must wait:
//!
//! - [`cache::PersistentCache`]: namespaced key/value store shared by both resolvers
//! - [`backend::IdentityBackend`]: remote auth provider plus the institutes table
//! - [`session::SessionStore`]: the local session view and its change feed
//! - [`institute::InstituteResolver`]: URL parameter > cache > remote resolution
//! - [`guard::decide`]: the pure navigation decision table
//! - [`portal::Portal`]: runs the above per navigation and drives a [`route::Navigator`]

pub mod backend;
pub mod cache;
pub mod config;
pub mod guard;
pub mod institute;
pub mod liveness;
pub mod portal;
pub mod route;
pub mod session;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use backend::{BackendError, IdentityBackend};
pub use cache::PersistentCache;
pub use config::{PortalConfig, PortalFeatures};
pub use guard::{GuardDecision, GuardSnapshot};
pub use institute::{InstituteContext, InstituteResolver, InstituteState, ResolutionError};
pub use portal::{NavigationOutcome, Portal};
pub use route::{Location, Navigator, Route};
pub use session::{SessionState, SessionStore};
