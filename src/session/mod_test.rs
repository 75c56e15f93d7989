use super::*;
use crate::backend::AuthEvent;
use crate::backend::memory::MemoryIdentityBackend;
use crate::test_helpers::{ADA_EMAIL, ADA_PASSWORD, seeded_backend};

fn store_with(backend: &Arc<MemoryIdentityBackend>, features: &PortalFeatures) -> (SessionStore, PersistentCache) {
    let cache = PersistentCache::in_memory();
    (SessionStore::new(backend.clone(), cache.clone(), features), cache)
}

fn store(backend: &Arc<MemoryIdentityBackend>) -> (SessionStore, PersistentCache) {
    store_with(backend, &PortalFeatures::default())
}

async fn wait_for_fetch(backend: &MemoryIdentityBackend) {
    while backend.session_fetches() == 0 {
        tokio::task::yield_now().await;
    }
}

fn sign_up_form() -> SignUpRequest {
    SignUpRequest {
        institute_id: "sit-2026".into(),
        institution_name: "Spring Institute of Technology".into(),
        institution_type: "university".into(),
        email: " Grace@SIT.edu ".into(),
        phone: "555-0100".into(),
        full_name: "Grace Hopper".into(),
        password: "cobol1959".into(),
        password_confirm: "cobol1959".into(),
        address: Address::default(),
    }
}

// =============================================================================
// Bootstrap
// =============================================================================

#[tokio::test]
async fn starts_uninitialized_and_loading() {
    let (store, _) = store(&seeded_backend());
    let state = store.snapshot();
    assert_eq!(state.phase, SessionPhase::Uninitialized);
    assert!(state.is_loading());
}

#[tokio::test]
async fn bootstrap_anonymous() {
    let backend = seeded_backend();
    let (store, _) = store(&backend);
    let state = store.ready().await;
    assert_eq!(state.phase, SessionPhase::Anonymous);
    assert!(!state.is_authenticated());
    assert!(state.error.is_none());
}

#[tokio::test]
async fn bootstrap_picks_up_existing_session() {
    let backend = seeded_backend();
    backend.emit(AuthEvent::SignedIn, backend.session_for(ADA_EMAIL));
    let (store, _) = store(&backend);

    let state = store.ready().await;
    assert_eq!(state.phase, SessionPhase::Authenticated);
    assert_eq!(state.session.unwrap().display_name, "Ada Lovelace");
}

#[tokio::test]
async fn bootstrap_runs_once() {
    let backend = seeded_backend();
    let (store, _) = store(&backend);
    store.ready().await;
    store.ready().await;
    store.bootstrap().await;
    assert_eq!(backend.session_fetches(), 1);
}

#[tokio::test]
async fn network_error_is_anonymous_with_annotation() {
    let backend = seeded_backend();
    backend.set_offline(true);
    let (store, _) = store(&backend);

    let state = store.ready().await;
    assert_eq!(state.phase, SessionPhase::Anonymous);
    assert!(matches!(state.error, Some(BackendError::Network(_))));
}

// =============================================================================
// Ordering and liveness
// =============================================================================

#[tokio::test]
async fn pushed_event_beats_late_bootstrap() {
    let backend = seeded_backend();
    let (store, _) = store(&backend);
    store.listen();
    let gate = backend.hold_session_fetch();
    let mut changes = store.subscribe();

    let bootstrap = tokio::spawn({
        let store = store.clone();
        async move { store.bootstrap().await }
    });
    wait_for_fetch(&backend).await;

    backend.emit(AuthEvent::SignedIn, backend.session_for(ADA_EMAIL));
    loop {
        let state = changes.changed().await.unwrap();
        if state.is_authenticated() {
            break;
        }
    }

    // the held fetch answers "signed out", captured before the event
    gate.notify_one();
    bootstrap.await.unwrap();

    let state = store.snapshot();
    assert_eq!(state.phase, SessionPhase::Authenticated);
    assert_eq!(state.session.unwrap().email, ADA_EMAIL);
}

#[tokio::test]
async fn retired_store_drops_late_bootstrap_result() {
    let backend = seeded_backend();
    backend.emit(AuthEvent::SignedIn, backend.session_for(ADA_EMAIL));
    let (store, _) = store(&backend);
    let gate = backend.hold_session_fetch();

    let bootstrap = tokio::spawn({
        let store = store.clone();
        async move { store.bootstrap().await }
    });
    wait_for_fetch(&backend).await;
    store.shutdown();
    gate.notify_one();
    bootstrap.await.unwrap();

    assert_eq!(store.snapshot().phase, SessionPhase::Loading);
    assert!(!store.is_alive());
    // ready() does not hang on a retired store
    assert_eq!(store.ready().await.phase, SessionPhase::Loading);
}

#[tokio::test]
async fn events_apply_in_arrival_order() {
    let backend = seeded_backend();
    let (store, _) = store(&backend);
    store.listen();
    store.ready().await;
    let mut changes = store.subscribe();

    backend.emit(AuthEvent::SignedIn, backend.session_for(ADA_EMAIL));
    backend.emit(AuthEvent::SignedOut, None);

    loop {
        let state = changes.changed().await.unwrap();
        if state.revision >= 3 {
            assert_eq!(state.phase, SessionPhase::Anonymous);
            break;
        }
    }
}

#[tokio::test]
async fn subscriber_sees_only_latest_state() {
    let backend = seeded_backend();
    let (store, _) = store(&backend);
    let mut changes = store.subscribe();
    let ada = backend.session_for(ADA_EMAIL);

    store.inner.apply_change(AuthChange { event: AuthEvent::SignedIn, session: ada.clone() });
    store.inner.apply_change(AuthChange { event: AuthEvent::SignedOut, session: None });
    store.inner.apply_change(AuthChange { event: AuthEvent::TokenRefreshed, session: ada });

    assert!(changes.has_changed());
    let state = changes.changed().await.unwrap();
    assert_eq!(state.revision, 3);
    assert_eq!(state.phase, SessionPhase::Authenticated);
    assert!(!changes.has_changed());
    assert_eq!(changes.latest(), state);
    changes.unsubscribe();
}

#[tokio::test]
async fn shutdown_stops_listener() {
    let backend = seeded_backend();
    let (store, _) = store(&backend);
    store.listen();
    store.ready().await;
    store.shutdown();

    backend.emit(AuthEvent::SignedIn, backend.session_for(ADA_EMAIL));
    tokio::task::yield_now().await;
    assert!(!store.snapshot().is_authenticated());
}

// =============================================================================
// Sign-in / sign-out
// =============================================================================

#[tokio::test]
async fn sign_in_applies_session_and_writes_hints() {
    let backend = seeded_backend();
    let (store, cache) = store(&backend);
    store.ready().await;

    let session = store.sign_in(" ADA@sit.edu ", ADA_PASSWORD).await.unwrap();
    assert_eq!(session.email, ADA_EMAIL);
    assert_eq!(store.snapshot().phase, SessionPhase::Authenticated);
    assert_eq!(cache.get(CacheKey::FullName).as_deref(), Some("Ada Lovelace"));
    assert_eq!(cache.get(CacheKey::Email).as_deref(), Some(ADA_EMAIL));
    assert_eq!(cache.get(CacheKey::InstitutionName).as_deref(), Some("Spring Institute of Technology"));
}

#[tokio::test]
async fn sign_in_bad_password_leaves_state() {
    let backend = seeded_backend();
    let (store, _) = store(&backend);
    store.ready().await;
    let err = store.sign_in(ADA_EMAIL, "wrong").await.unwrap_err();
    assert_eq!(err, BackendError::InvalidCredentials);
    assert!(!store.snapshot().is_authenticated());
}

#[tokio::test]
async fn sign_out_clears_session_and_cache() {
    let backend = seeded_backend();
    let (store, cache) = store(&backend);
    store.sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();
    cache.set(CacheKey::InstituteId, "SIT-2026").unwrap();

    store.sign_out().await.unwrap();
    assert_eq!(store.snapshot().phase, SessionPhase::Anonymous);
    for key in CacheKey::ALL {
        assert_eq!(cache.get(key), None, "{key:?} survived sign-out");
    }
}

#[tokio::test]
async fn sign_out_is_idempotent() {
    let backend = seeded_backend();
    let (store, _) = store(&backend);
    store.ready().await;
    store.sign_out().await.unwrap();
    store.sign_out().await.unwrap();
    assert!(!store.snapshot().is_authenticated());
}

#[tokio::test]
async fn sign_out_network_failure_still_clears_locally() {
    let backend = seeded_backend();
    let (store, cache) = store(&backend);
    store.sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();
    backend.set_offline(true);

    let err = store.sign_out().await.unwrap_err();
    assert!(err.is_transient());
    let state = store.snapshot();
    assert!(!state.is_authenticated());
    assert_eq!(state.error, Some(err));
    assert_eq!(cache.get(CacheKey::Email), None);
}

#[tokio::test]
async fn pushed_sign_out_keeps_cache() {
    let backend = seeded_backend();
    let (store, cache) = store(&backend);
    store.listen();
    store.sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();
    let revision = store.snapshot().revision;
    let mut changes = store.subscribe();

    backend.emit(AuthEvent::SignedOut, None);
    loop {
        let state = changes.changed().await.unwrap();
        if state.revision > revision && !state.is_authenticated() {
            break;
        }
    }
    assert_eq!(cache.get(CacheKey::Email).as_deref(), Some(ADA_EMAIL));
}

// =============================================================================
// Sign-up
// =============================================================================

#[tokio::test]
async fn sign_up_writes_hints_and_uppercased_institute() {
    let backend = seeded_backend();
    let (store, cache) = store(&backend);

    let outcome = store.sign_up(&sign_up_form()).await.unwrap();
    assert!(!outcome.email_confirmation_required);
    assert_eq!(cache.get(CacheKey::InstituteId).as_deref(), Some("SIT-2026"));
    assert_eq!(cache.get(CacheKey::Email).as_deref(), Some("grace@sit.edu"));
    assert_eq!(cache.get(CacheKey::FullName).as_deref(), Some("Grace Hopper"));

    let session = store.sign_in("grace@sit.edu", "cobol1959").await.unwrap();
    assert_eq!(session.tenant_id_hint.as_deref(), Some("SIT-2026"));
    assert_eq!(session.metadata.phone.as_deref(), Some("555-0100"));
}

#[tokio::test]
async fn sign_up_invalid_form_never_reaches_backend() {
    let backend = seeded_backend();
    let (store, cache) = store(&backend);
    let mut form = sign_up_form();
    form.password_confirm = "different".into();

    let err = store.sign_up(&form).await.unwrap_err();
    assert!(matches!(err, SignUpError::PasswordMismatch));
    assert!(backend.session_for("grace@sit.edu").is_none());
    assert_eq!(cache.get(CacheKey::InstituteId), None);
}

#[tokio::test]
async fn sign_up_duplicate_email_surfaces_backend_error() {
    let backend = seeded_backend();
    let (store, _) = store(&backend);
    let mut form = sign_up_form();
    form.email = ADA_EMAIL.into();

    let err = store.sign_up(&form).await.unwrap_err();
    assert!(matches!(err, SignUpError::Backend(BackendError::Rejected { status: 422, .. })));
}

// =============================================================================
// Profile and role hint
// =============================================================================

#[tokio::test]
async fn profile_defaults_to_admin() {
    let backend = seeded_backend();
    let (store, _) = store(&backend);
    assert!(store.profile().is_none());

    store.sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();
    store.set_role_hint(Role::Teacher).unwrap();
    let profile = store.profile().unwrap();
    assert_eq!(profile.role, Role::Admin);
    assert_eq!(profile.institute_id, "SIT-2026");
}

#[tokio::test]
async fn role_hint_used_when_role_selection_enabled() {
    let backend = seeded_backend();
    let features = PortalFeatures { role_selection: true, ..PortalFeatures::default() };
    let (store, cache) = store_with(&backend, &features);
    store.sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();

    store.set_role_hint(Role::Teacher).unwrap();
    assert_eq!(cache.get(CacheKey::RoleHint).as_deref(), Some("teacher"));
    assert_eq!(store.profile().unwrap().role, Role::Teacher);

    store.clear_role_hint().unwrap();
    assert_eq!(store.profile().unwrap().role, Role::Admin);
}
