//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex, PoisonError};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::backend::memory::MemoryIdentityBackend;
use crate::cache::PersistentCache;
use crate::config::PortalFeatures;
use crate::institute::{InstituteRecord, InstituteStatus};
use crate::portal::Portal;
use crate::route::Navigator;
use crate::session::{Session, SessionPhase, SessionState, UserMetadata};

pub const ADA_EMAIL: &str = "ada@sit.edu";
pub const ADA_PASSWORD: &str = "secret123";

/// The institute from the access-gateway walkthrough.
#[must_use]
pub fn sit_record() -> InstituteRecord {
    InstituteRecord {
        institute_id: "SIT-2026".into(),
        institute_name: "Spring Institute of Technology".into(),
        institution_type: "university".into(),
        status: InstituteStatus::Active,
    }
}

#[must_use]
pub fn institute_record(id: &str, status: InstituteStatus) -> InstituteRecord {
    InstituteRecord {
        institute_id: id.into(),
        institute_name: format!("{id} Institute"),
        institution_type: "college".into(),
        status,
    }
}

#[must_use]
pub fn ada_metadata() -> UserMetadata {
    UserMetadata {
        full_name: Some("Ada Lovelace".into()),
        institution_name: Some("Spring Institute of Technology".into()),
        institute_id: Some("SIT-2026".into()),
        ..UserMetadata::default()
    }
}

/// Backend with SIT-2026 and a registered (signed-out) Ada account.
#[must_use]
pub fn seeded_backend() -> Arc<MemoryIdentityBackend> {
    let backend = MemoryIdentityBackend::new().with_institute(sit_record());
    backend.register(ADA_EMAIL, ADA_PASSWORD, ada_metadata());
    Arc::new(backend)
}

/// A settled, authenticated session state.
#[must_use]
pub fn stub_session() -> SessionState {
    let session = Session::new(Uuid::new_v4(), ADA_EMAIL, ada_metadata(), OffsetDateTime::UNIX_EPOCH);
    SessionState { phase: SessionPhase::Authenticated, session: Some(session), error: None, revision: 1 }
}

/// Navigator that records every href it is given.
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    hrefs: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    #[must_use]
    pub fn hrefs(&self) -> Vec<String> {
        self.hrefs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Navigator for RecordingNavigator {
    fn replace(&self, href: &str) {
        self.hrefs.lock().unwrap_or_else(PoisonError::into_inner).push(href.to_owned());
    }
}

pub struct PortalFixture {
    pub portal: Portal,
    pub backend: Arc<MemoryIdentityBackend>,
    pub cache: PersistentCache,
    pub navigator: Arc<RecordingNavigator>,
}

/// Portal over [`seeded_backend`], an empty in-memory cache and default
/// features.
#[must_use]
pub fn portal_fixture() -> PortalFixture {
    portal_fixture_with(seeded_backend(), PersistentCache::in_memory(), PortalFeatures::default())
}

#[must_use]
pub fn portal_fixture_with(
    backend: Arc<MemoryIdentityBackend>,
    cache: PersistentCache,
    features: PortalFeatures,
) -> PortalFixture {
    let navigator = Arc::new(RecordingNavigator::default());
    let portal = Portal::new(backend.clone(), cache.clone(), navigator.clone(), features);
    PortalFixture { portal, backend, cache, navigator }
}
