//! Hosted auth + REST backend over `reqwest`.
//!
//! Thin HTTP wrapper for the provider's `/auth/v1` and `/rest/v1` endpoints.
//! Response parsing lives in free functions for testability.
//!
//! The access token is kept in the persistent cache under
//! [`CacheKey::AuthToken`], so it survives process restarts and is removed
//! together with everything else when the namespace is cleared on logout.
//! Expired tokens are not refreshed: a 401 from `/auth/v1/user` drops the
//! token and the caller sees an anonymous session.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use super::{AUTH_EVENT_CAPACITY, AuthChange, AuthEvent, BackendError, IdentityBackend};
use crate::cache::{CacheKey, PersistentCache};
use crate::config::HttpTimeouts;
use crate::institute::InstituteRecord;
use crate::session::{Session, SignUpOutcome, UserMetadata, WireUser};

pub const INSTITUTE_COLUMNS: &str = "institute_id,institute_name,institution_type,status";

/// Access token persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    issued_at: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: WireUser,
}

#[derive(Debug, Deserialize)]
struct SignUpResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user: Option<WireUser>,
    #[serde(default)]
    id: Option<String>,
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpIdentityBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    cache: PersistentCache,
    events: broadcast::Sender<AuthChange>,
}

impl HttpIdentityBackend {
    /// # Errors
    ///
    /// Returns [`BackendError::ClientBuild`] if the HTTP client fails to build.
    pub fn new(
        base_url: &str,
        api_key: String,
        timeouts: HttpTimeouts,
        cache: PersistentCache,
    ) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.request_secs))
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .build()
            .map_err(|e| BackendError::ClientBuild(e.to_string()))?;
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_owned(), api_key, cache, events })
    }

    fn stored_grant(&self) -> Option<TokenGrant> {
        self.cache.get_json(CacheKey::AuthToken)
    }

    fn drop_grant(&self) {
        if let Err(e) = self.cache.remove(CacheKey::AuthToken) {
            tracing::warn!(error = %e, "failed to remove stored token");
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(u16, String), BackendError> {
        let response = request
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok((status, body))
    }

    fn broadcast(&self, event: AuthEvent, session: Option<Session>) {
        let _ = self.events.send(AuthChange { event, session });
    }
}

#[async_trait::async_trait]
impl IdentityBackend for HttpIdentityBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let Some(grant) = self.stored_grant() else {
            return Ok(None);
        };
        let request = self
            .http
            .get(endpoint(&self.base_url, "/auth/v1/user"))
            .bearer_auth(&grant.access_token);
        let (status, body) = self.send(request).await?;
        match status {
            200 => {
                let user: WireUser =
                    serde_json::from_str(&body).map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
                let issued_at =
                    OffsetDateTime::from_unix_timestamp(grant.issued_at).unwrap_or_else(|_| OffsetDateTime::now_utc());
                Session::from_wire(user, issued_at).map(Some)
            }
            401 | 403 => {
                tracing::info!(status, "stored session rejected; dropping token");
                self.drop_grant();
                Ok(None)
            }
            _ => Err(BackendError::Rejected { status, message: error_message(&body) }),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let request = self
            .http
            .post(endpoint(&self.base_url, "/auth/v1/token"))
            .query(&[("grant_type", "password")])
            .json(&serde_json::json!({ "email": email, "password": password }));
        let (status, body) = self.send(request).await?;
        match status {
            200 => {
                let now = OffsetDateTime::now_utc();
                let (grant, session) = parse_token_response(&body, now)?;
                if let Err(e) = self.cache.set_json(CacheKey::AuthToken, &grant) {
                    tracing::warn!(error = %e, "failed to persist token; session will not survive restart");
                }
                self.broadcast(AuthEvent::SignedIn, Some(session.clone()));
                Ok(session)
            }
            400 | 401 => Err(BackendError::InvalidCredentials),
            _ => Err(BackendError::Rejected { status, message: error_message(&body) }),
        }
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &UserMetadata,
    ) -> Result<SignUpOutcome, BackendError> {
        let request = self
            .http
            .post(endpoint(&self.base_url, "/auth/v1/signup"))
            .json(&serde_json::json!({ "email": email, "password": password, "data": metadata }));
        let (status, body) = self.send(request).await?;
        if status != 200 {
            return Err(BackendError::Rejected { status, message: error_message(&body) });
        }
        parse_sign_up_response(&body)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let Some(grant) = self.stored_grant() else {
            return Err(BackendError::NotSignedIn);
        };
        let request = self
            .http
            .post(endpoint(&self.base_url, "/auth/v1/logout"))
            .bearer_auth(&grant.access_token);
        let (status, body) = self.send(request).await?;
        match status {
            200..=299 | 401 | 403 => {
                self.drop_grant();
                self.broadcast(AuthEvent::SignedOut, None);
                Ok(())
            }
            _ => Err(BackendError::Rejected { status, message: error_message(&body) }),
        }
    }

    async fn fetch_institute(&self, institute_id: &str) -> Result<Option<InstituteRecord>, BackendError> {
        let bearer = self.stored_grant().map_or_else(|| self.api_key.clone(), |g| g.access_token);
        let request = self
            .http
            .get(endpoint(&self.base_url, "/rest/v1/institutes"))
            .query(&institute_query(institute_id))
            .bearer_auth(bearer);
        let (status, body) = self.send(request).await?;
        if status != 200 {
            return Err(BackendError::Rejected { status, message: error_message(&body) });
        }
        parse_institute_rows(&body)
    }
}

// =============================================================================
// PURE HELPERS
// =============================================================================

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{path}", base_url.trim_end_matches('/'))
}

fn institute_query(institute_id: &str) -> [(&'static str, String); 2] {
    [("select", INSTITUTE_COLUMNS.to_owned()), ("institute_id", format!("eq.{institute_id}"))]
}

fn parse_token_response(body: &str, now: OffsetDateTime) -> Result<(TokenGrant, Session), BackendError> {
    let resp: TokenResponse =
        serde_json::from_str(body).map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
    let session = Session::from_wire(resp.user, now)?;
    let grant =
        TokenGrant { access_token: resp.access_token, refresh_token: resp.refresh_token, issued_at: now.unix_timestamp() };
    Ok((grant, session))
}

fn parse_sign_up_response(body: &str) -> Result<SignUpOutcome, BackendError> {
    let resp: SignUpResponse =
        serde_json::from_str(body).map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
    let raw_id = resp.user.and_then(|u| u.id).or(resp.id);
    let user_id = raw_id
        .as_deref()
        .and_then(|id| uuid::Uuid::parse_str(id).ok())
        .ok_or_else(|| BackendError::MalformedResponse("sign-up response has no user id".into()))?;
    Ok(SignUpOutcome { user_id, email_confirmation_required: resp.access_token.is_none() })
}

fn parse_institute_rows(body: &str) -> Result<Option<InstituteRecord>, BackendError> {
    let rows: Vec<InstituteRecord> =
        serde_json::from_str(body).map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
    if rows.len() > 1 {
        tracing::warn!(rows = rows.len(), "institute lookup returned multiple rows; using the first");
    }
    let Some(record) = rows.into_iter().next() else {
        return Ok(None);
    };
    if record.institute_id.trim().is_empty() {
        return Err(BackendError::MalformedResponse("institute row has empty institute_id".into()));
    }
    Ok(Some(record))
}

/// Pull a human-readable message out of a provider error body.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_owned();
    };
    ["msg", "message", "error_description", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(serde_json::Value::as_str))
        .map_or_else(|| body.trim().to_owned(), str::to_owned)
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
