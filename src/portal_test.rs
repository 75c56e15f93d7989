use super::*;
use crate::backend::AuthEvent;
use crate::cache::CacheKey;
use crate::institute::{InstituteStatus, ResolvedFrom};
use crate::session::SessionPhase;
use crate::test_helpers::{
    ADA_EMAIL, ADA_PASSWORD, PortalFixture, institute_record, portal_fixture, portal_fixture_with, seeded_backend,
};

async fn wait_for_fetch(fx: &PortalFixture) {
    while fx.backend.session_fetches() == 0 {
        tokio::task::yield_now().await;
    }
}

async fn wait_for_institute_fetch(fx: &PortalFixture) {
    while fx.backend.institute_fetches() == 0 {
        tokio::task::yield_now().await;
    }
}

fn sign_in_at_backend(fx: &PortalFixture) {
    fx.backend.emit(AuthEvent::SignedIn, fx.backend.session_for(ADA_EMAIL));
}

// =============================================================================
// Guard redirects
// =============================================================================

#[tokio::test]
async fn protected_route_without_session_redirects_to_login() {
    let fx = portal_fixture();
    let outcome = fx.portal.navigate("/dashboard").await.unwrap();
    assert_eq!(outcome.decision, GuardDecision::RedirectToLogin);
    assert_eq!(outcome.redirect.as_deref(), Some("/platform"));
    assert_eq!(fx.navigator.hrefs(), vec!["/platform".to_owned()]);
}

#[tokio::test]
async fn revisiting_protected_route_redirects_again() {
    let fx = portal_fixture();
    let first = fx.portal.navigate("/dashboard").await.unwrap();
    assert_eq!(first.redirect.as_deref(), Some("/platform"));

    let login = fx.portal.navigate("/platform").await.unwrap();
    assert_eq!(login.decision, GuardDecision::Allow);

    let second = fx.portal.navigate("/dashboard").await.unwrap();
    assert_eq!(second.decision, GuardDecision::RedirectToLogin);
    assert_eq!(second.redirect.as_deref(), Some("/platform"));
    assert_eq!(fx.navigator.hrefs(), vec!["/platform".to_owned(), "/platform".to_owned()]);

    let unchanged = fx.portal.reevaluate(Location::new(Route::Dashboard));
    assert_eq!(unchanged.redirect, None);
}

#[tokio::test]
async fn signed_in_without_institute_goes_to_tenant_gate_once() {
    let fx = portal_fixture();
    sign_in_at_backend(&fx);

    let outcome = fx.portal.navigate("/#/students").await.unwrap();
    assert_eq!(outcome.decision, GuardDecision::RedirectToTenantGate);
    assert_eq!(outcome.redirect.as_deref(), Some("/access"));
    assert_eq!(fx.portal.institute_state(), InstituteState::Missing);

    let again = fx.portal.reevaluate(Location::new(Route::Students));
    assert_eq!(again.decision, GuardDecision::RedirectToTenantGate);
    assert_eq!(again.redirect, None);

    let gate = fx.portal.navigate("/access").await.unwrap();
    assert_eq!(gate.decision, GuardDecision::Allow);
    assert_eq!(fx.navigator.hrefs(), vec!["/access".to_owned()]);
}

#[tokio::test]
async fn unknown_institute_prefills_tenant_gate() {
    let fx = portal_fixture();
    sign_in_at_backend(&fx);

    let outcome = fx.portal.navigate("/dashboard?institute=NOPE-1").await.unwrap();
    assert_eq!(outcome.decision, GuardDecision::RedirectToTenantGate);
    assert_eq!(outcome.redirect.as_deref(), Some("/access?institute=NOPE-1"));
    assert_eq!(outcome.notice, Some(ResolutionError::NotFound { id: "NOPE-1".into() }));
    assert!(outcome.support_link.unwrap().contains("NOPE-1"));
}

#[tokio::test]
async fn inactive_institute_offers_support_contact() {
    let fx = portal_fixture();
    fx.backend.insert_institute(institute_record("OLD-1", InstituteStatus::Inactive));
    sign_in_at_backend(&fx);

    let fx = PortalFixture { portal: fx.portal.with_support_email("help@sit.edu"), ..fx };
    let outcome = fx.portal.navigate("/results?institute=OLD-1").await.unwrap();
    assert_eq!(outcome.notice, Some(ResolutionError::Inactive { id: "OLD-1".into() }));
    assert!(outcome.support_link.unwrap().starts_with("mailto:help@sit.edu?"));
}

#[tokio::test]
async fn network_failure_notice_is_retryable_without_support_link() {
    let fx = portal_fixture();
    fx.cache.set(CacheKey::InstituteId, "SIT-2026").unwrap();
    fx.backend.set_offline(true);

    let outcome = fx.portal.navigate("/dashboard").await.unwrap();
    let notice = outcome.notice.unwrap();
    assert!(notice.is_retryable());
    assert_eq!(outcome.support_link, None);

    fx.backend.set_offline(false);
    assert!(fx.portal.reload_institute().await.satisfies_guard());
}

#[tokio::test]
async fn unknown_route_is_an_error() {
    let fx = portal_fixture();
    assert!(matches!(fx.portal.navigate("/grades").await, Err(RouteError::UnknownRoute(_))));
    assert!(fx.navigator.hrefs().is_empty());
}

// =============================================================================
// Full flow
// =============================================================================

#[tokio::test]
async fn gateway_login_dashboard_flow() {
    let fx = portal_fixture();

    let ctx = fx.portal.select_institute("sit-2026").await.unwrap();
    assert_eq!(ctx.resolved_from, ResolvedFrom::Query);
    assert_eq!(fx.portal.continue_to_login(&ctx), "/platform?institute=SIT-2026");

    let login = fx.portal.navigate("/platform?institute=SIT-2026").await.unwrap();
    assert_eq!(login.decision, GuardDecision::Allow);
    assert_eq!(fx.backend.institute_fetches(), 2);

    fx.portal.session().sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();
    let home = fx.portal.reevaluate(Location::new(Route::Platform));
    assert_eq!(home.decision, GuardDecision::RedirectToProtectedHome);
    assert_eq!(home.redirect.as_deref(), Some("/dashboard"));

    let repeat = fx.portal.reevaluate(Location::new(Route::Platform));
    assert_eq!(repeat.redirect, None);

    let dashboard = fx.portal.navigate("/dashboard").await.unwrap();
    assert_eq!(dashboard.decision, GuardDecision::Allow);
    assert_eq!(dashboard.redirect, None);
    assert_eq!(fx.backend.institute_fetches(), 2);
    assert_eq!(fx.portal.institute_state().context().unwrap().resolved_from, ResolvedFrom::Cache);

    assert_eq!(fx.navigator.hrefs(), vec!["/platform?institute=SIT-2026".to_owned(), "/dashboard".to_owned()]);
}

#[tokio::test]
async fn logout_clears_state() {
    let fx = portal_fixture();
    fx.portal.session().sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();
    let allowed = fx.portal.navigate("/dashboard?institute=SIT-2026").await.unwrap();
    assert_eq!(allowed.decision, GuardDecision::Allow);

    fx.portal.logout().await.unwrap();
    assert_eq!(fx.portal.evaluate(Route::Dashboard), GuardDecision::RedirectToLogin);
    for key in CacheKey::ALL {
        assert_eq!(fx.cache.get(key), None, "{key:?} survived logout");
    }
    assert_eq!(fx.navigator.hrefs().last().map(String::as_str), Some("/platform"));

    let after = fx.portal.navigate("/dashboard").await.unwrap();
    assert_eq!(after.decision, GuardDecision::RedirectToLogin);
}

#[tokio::test]
async fn logout_during_resolution_leaves_nothing_cached() {
    let fx = portal_fixture();
    fx.portal.session().sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();
    let gate = fx.backend.hold_institute_fetch();

    let (outcome, ()) = tokio::join!(fx.portal.navigate("/dashboard?institute=SIT-2026"), async {
        wait_for_institute_fetch(&fx).await;
        fx.portal.logout().await.unwrap();
        gate.notify_one();
    });

    assert!(outcome.unwrap().superseded);
    for key in CacheKey::ALL {
        assert_eq!(fx.cache.get(key), None, "{key:?} written after logout");
    }
    assert_eq!(fx.portal.institute_state(), InstituteState::Missing);
    assert_eq!(fx.portal.evaluate(Route::Dashboard), GuardDecision::RedirectToLogin);

    fx.portal.session().sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();
    assert_eq!(fx.portal.evaluate(Route::Dashboard), GuardDecision::RedirectToTenantGate);
}

#[tokio::test]
async fn change_institute_during_resolution_wins() {
    let fx = portal_fixture();
    fx.portal.session().sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();
    let gate = fx.backend.hold_institute_fetch();

    let (outcome, ()) = tokio::join!(fx.portal.navigate("/dashboard?institute=SIT-2026"), async {
        wait_for_institute_fetch(&fx).await;
        fx.portal.change_institute();
        gate.notify_one();
    });

    assert!(outcome.unwrap().superseded);
    assert_eq!(fx.cache.get(CacheKey::InstituteId), None);
    assert_eq!(fx.cache.get(CacheKey::InstituteProfile), None);
    assert_eq!(fx.portal.institute_state(), InstituteState::Missing);
    assert_eq!(fx.navigator.hrefs(), vec!["/access".to_owned()]);
}

#[tokio::test]
async fn change_institute_forgets_context() {
    let fx = portal_fixture();
    fx.portal.session().sign_in(ADA_EMAIL, ADA_PASSWORD).await.unwrap();
    fx.portal.navigate("/dashboard?institute=SIT-2026").await.unwrap();

    assert_eq!(fx.portal.change_institute(), "/access");
    assert_eq!(fx.portal.institute_state(), InstituteState::Missing);
    assert_eq!(fx.cache.get(CacheKey::InstituteId), None);
    assert_eq!(fx.portal.evaluate(Route::Dashboard), GuardDecision::RedirectToTenantGate);
    assert!(fx.portal.session().snapshot().is_authenticated());
}

#[tokio::test]
async fn failed_select_of_current_institute_is_published() {
    let fx = portal_fixture();
    fx.portal.select_institute("SIT-2026").await.unwrap();
    fx.backend.remove_institute("SIT-2026");

    let err = fx.portal.select_institute("SIT-2026").await.unwrap_err();
    assert_eq!(fx.portal.institute_state(), InstituteState::Failed(err));
    assert_eq!(fx.cache.get(CacheKey::InstituteId), None);
}

#[tokio::test]
async fn institute_subscribers_see_resolution() {
    let fx = portal_fixture();
    let mut rx = fx.portal.subscribe_institute();
    assert!(rx.borrow().is_pending());

    fx.portal.navigate("/access?institute=SIT-2026").await.unwrap();
    rx.changed().await.unwrap();
    assert!(rx.borrow().satisfies_guard());
}

// =============================================================================
// Supersession and detach
// =============================================================================

#[tokio::test]
async fn newer_navigation_supersedes_older() {
    let fx = portal_fixture();
    let gate = fx.backend.hold_session_fetch();

    let (first, second) = tokio::join!(fx.portal.navigate_to(Location::new(Route::Dashboard)), async {
        wait_for_fetch(&fx).await;
        let (outcome, ()) = tokio::join!(fx.portal.navigate_to(Location::new(Route::Students)), async {
            while fx.portal.generation.is_current(1) {
                tokio::task::yield_now().await;
            }
            gate.notify_one();
        });
        outcome
    });

    assert!(first.superseded);
    assert_eq!(first.redirect, None);
    assert!(!second.superseded);
    assert_eq!(second.decision, GuardDecision::RedirectToLogin);
    assert_eq!(fx.navigator.hrefs(), vec!["/platform".to_owned()]);
}

#[tokio::test]
async fn detach_drops_in_flight_results() {
    let backend = seeded_backend();
    backend.emit(AuthEvent::SignedIn, backend.session_for(ADA_EMAIL));
    let fx = portal_fixture_with(backend, PersistentCache::in_memory(), PortalFeatures::default());
    let gate = fx.backend.hold_session_fetch();

    let (outcome, ()) = tokio::join!(fx.portal.navigate_to(Location::new(Route::Dashboard)), async {
        wait_for_fetch(&fx).await;
        fx.portal.detach();
        gate.notify_one();
    });

    assert!(outcome.superseded);
    assert!(fx.navigator.hrefs().is_empty());
    let session = fx.portal.session().snapshot();
    assert_eq!(session.phase, SessionPhase::Loading);
    assert!(!session.is_authenticated());
    assert!(fx.portal.institute_state().is_pending());
}
