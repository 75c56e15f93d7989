//! Institute (tenant) context resolution.
//!
//! DESIGN
//! ======
//! Resolution walks a fixed precedence, first match wins:
//!
//! 1. An explicit URL parameter is always fetched from the backend.
//! 2. A cached id with a cached profile for that same id is used as-is.
//! 3. A cached id alone (missing, mismatched or corrupt profile) is fetched.
//! 4. Nothing cached and no parameter is [`Resolution::NoContext`].
//!
//! Every successful fetch writes the id and the full profile back to the
//! cache before returning, so the newest resolution always wins the cache.
//! [`InstituteResolver::clear`] starts a new epoch: a lookup that was already
//! in flight still returns its result but no longer writes it back.
//!
//! ERROR HANDLING
//! ==============
//! `NotFound` and `Inactive` are distinct [`ResolutionError`] kinds carrying
//! the attempted id. They are never folded into "no context". When the failed
//! id is the one currently cached, the cached id and profile are evicted so a
//! stale entry cannot satisfy the guard later. Backend failures become
//! `Network`, which is retryable.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::backend::IdentityBackend;
use crate::cache::{CacheKey, PersistentCache};
use crate::liveness::Generation;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstituteStatus {
    Active,
    Inactive,
    #[default]
    Unknown,
}

impl InstituteStatus {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => InstituteStatus::Active,
            "inactive" => InstituteStatus::Inactive,
            _ => InstituteStatus::Unknown,
        }
    }
}

impl<'de> Deserialize<'de> for InstituteStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map_or(InstituteStatus::Unknown, InstituteStatus::parse))
    }
}

/// One row of the institutes table, also the cached profile shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstituteRecord {
    pub institute_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub institute_name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub institution_type: String,
    #[serde(default)]
    pub status: InstituteStatus,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedFrom {
    /// Picked through the access gateway.
    Query,
    Cache,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstituteContext {
    pub institute_id: String,
    pub institute_name: String,
    pub institution_type: String,
    pub status: InstituteStatus,
    pub resolved_from: ResolvedFrom,
}

impl InstituteContext {
    #[must_use]
    pub fn from_record(record: InstituteRecord, resolved_from: ResolvedFrom) -> Self {
        Self {
            institute_id: record.institute_id,
            institute_name: record.institute_name,
            institution_type: record.institution_type,
            status: record.status,
            resolved_from,
        }
    }

    /// Only an active institute satisfies the "has institute" guard condition.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == InstituteStatus::Active
    }

    #[must_use]
    pub fn to_record(&self) -> InstituteRecord {
        InstituteRecord {
            institute_id: self.institute_id.clone(),
            institute_name: self.institute_name.clone(),
            institution_type: self.institution_type.clone(),
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(InstituteContext),
    /// No parameter and nothing cached. The caller shows tenant selection.
    NoContext,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("could not look up institute {id}: {message}")]
    Network { id: String, message: String },
    #[error("institute id {id} not recognised")]
    NotFound { id: String },
    #[error("institute {id} is not active")]
    Inactive { id: String },
}

impl ResolutionError {
    #[must_use]
    pub fn institute_id(&self) -> &str {
        match self {
            ResolutionError::Network { id, .. }
            | ResolutionError::NotFound { id }
            | ResolutionError::Inactive { id } => id,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolutionError::Network { .. })
    }

    /// Message shown to the user, matching the access gateway wording.
    #[must_use]
    pub fn notice(&self) -> &'static str {
        match self {
            ResolutionError::Network { .. } => "Could not reach Nexora. Check your connection and try again.",
            ResolutionError::NotFound { .. } => {
                "Institute ID not recognised. Please verify your ID or contact support."
            }
            ResolutionError::Inactive { .. } => "Institute account is not active. Please contact Nexora Support.",
        }
    }
}

/// Institute side of the guard input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InstituteState {
    #[default]
    Pending,
    Resolved(InstituteContext),
    Missing,
    Failed(ResolutionError),
}

impl InstituteState {
    #[must_use]
    pub fn from_result(result: Result<Resolution, ResolutionError>) -> Self {
        match result {
            Ok(Resolution::Resolved(ctx)) => InstituteState::Resolved(ctx),
            Ok(Resolution::NoContext) => InstituteState::Missing,
            Err(e) => InstituteState::Failed(e),
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, InstituteState::Pending)
    }

    #[must_use]
    pub fn satisfies_guard(&self) -> bool {
        matches!(self, InstituteState::Resolved(ctx) if ctx.is_active())
    }

    #[must_use]
    pub fn context(&self) -> Option<&InstituteContext> {
        match self {
            InstituteState::Resolved(ctx) => Some(ctx),
            _ => None,
        }
    }

    #[must_use]
    pub fn failure(&self) -> Option<&ResolutionError> {
        match self {
            InstituteState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

#[derive(Clone)]
pub struct InstituteResolver {
    backend: Arc<dyn IdentityBackend>,
    cache: PersistentCache,
    epoch: Arc<Generation>,
}

impl InstituteResolver {
    pub fn new(backend: Arc<dyn IdentityBackend>, cache: PersistentCache) -> Self {
        Self { backend, cache, epoch: Arc::new(Generation::new()) }
    }

    #[must_use]
    pub fn cached_institute_id(&self) -> Option<String> {
        self.cache.get(CacheKey::InstituteId).map(|id| id.trim().to_owned()).filter(|id| !id.is_empty())
    }

    /// Resolve the active institute.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError`] when a lookup fails, finds nothing, or
    /// finds an inactive institute.
    pub async fn resolve(&self, url_param: Option<&str>) -> Result<Resolution, ResolutionError> {
        if let Some(id) = url_param.map(str::trim).filter(|id| !id.is_empty()) {
            tracing::debug!(institute_id = %id, "resolving institute from url parameter");
            return self.fetch_and_store(id, ResolvedFrom::Remote).await.map(Resolution::Resolved);
        }

        let Some(cached_id) = self.cached_institute_id() else {
            tracing::debug!("no institute context");
            return Ok(Resolution::NoContext);
        };

        match self.cache.get_json::<InstituteRecord>(CacheKey::InstituteProfile) {
            Some(record) if record.institute_id == cached_id => {
                if record.status == InstituteStatus::Inactive {
                    tracing::info!(institute_id = %cached_id, "cached institute is inactive");
                    self.evict_if_cached(&cached_id);
                    return Err(ResolutionError::Inactive { id: cached_id });
                }
                tracing::debug!(institute_id = %cached_id, "institute resolved from cache");
                Ok(Resolution::Resolved(InstituteContext::from_record(record, ResolvedFrom::Cache)))
            }
            Some(record) => {
                tracing::debug!(
                    institute_id = %cached_id,
                    profile_id = %record.institute_id,
                    "cached profile belongs to another institute; refetching"
                );
                self.fetch_and_store(&cached_id, ResolvedFrom::Remote).await.map(Resolution::Resolved)
            }
            None => self.fetch_and_store(&cached_id, ResolvedFrom::Remote).await.map(Resolution::Resolved),
        }
    }

    /// Verify a typed institute id from the access gateway and make it current.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::Inactive`] for any status other than active,
    /// in addition to the lookup failures of [`InstituteResolver::resolve`].
    pub async fn select(&self, institute_id: &str) -> Result<InstituteContext, ResolutionError> {
        let id = institute_id.trim().to_uppercase();
        if id.is_empty() {
            return Err(ResolutionError::NotFound { id });
        }
        let epoch = self.epoch.current();
        let record = self.lookup(&id).await?;
        if record.status != InstituteStatus::Active {
            self.evict_if_cached(&id);
            return Err(ResolutionError::Inactive { id });
        }
        self.write_through(&record, epoch);
        Ok(InstituteContext::from_record(record, ResolvedFrom::Query))
    }

    /// Forget the current institute ("change institute"). Lookups already in
    /// flight will not write their result back.
    pub fn clear(&self) {
        self.epoch.advance();
        self.remove_entries();
    }

    fn remove_entries(&self) {
        for key in [CacheKey::InstituteId, CacheKey::InstituteProfile] {
            if let Err(e) = self.cache.remove(key) {
                tracing::warn!(key = key.suffix(), error = %e, "failed to clear institute cache entry");
            }
        }
    }

    async fn fetch_and_store(&self, id: &str, from: ResolvedFrom) -> Result<InstituteContext, ResolutionError> {
        let epoch = self.epoch.current();
        let record = self.lookup(id).await?;
        if record.status == InstituteStatus::Inactive {
            self.evict_if_cached(id);
            return Err(ResolutionError::Inactive { id: id.to_owned() });
        }
        if record.status == InstituteStatus::Unknown {
            tracing::warn!(institute_id = %id, "institute has no recognised status");
        }
        self.write_through(&record, epoch);
        tracing::info!(institute_id = %record.institute_id, "institute resolved from backend");
        Ok(InstituteContext::from_record(record, from))
    }

    async fn lookup(&self, id: &str) -> Result<InstituteRecord, ResolutionError> {
        match self.backend.fetch_institute(id).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => {
                tracing::info!(institute_id = %id, "institute not found");
                self.evict_if_cached(id);
                Err(ResolutionError::NotFound { id: id.to_owned() })
            }
            Err(e) => {
                tracing::warn!(institute_id = %id, error = %e, "institute lookup failed");
                Err(ResolutionError::Network { id: id.to_owned(), message: e.to_string() })
            }
        }
    }

    fn write_through(&self, record: &InstituteRecord, epoch: u64) {
        if !self.epoch.is_current(epoch) {
            tracing::debug!(institute_id = %record.institute_id, "institute cleared during lookup; not caching");
            return;
        }
        if let Err(e) = self.cache.set(CacheKey::InstituteId, &record.institute_id) {
            tracing::warn!(error = %e, "failed to cache institute id");
        }
        if let Err(e) = self.cache.set_json(CacheKey::InstituteProfile, record) {
            tracing::warn!(error = %e, "failed to cache institute profile");
        }
    }

    fn evict_if_cached(&self, id: &str) {
        if self.cached_institute_id().as_deref() == Some(id) {
            tracing::info!(institute_id = %id, "evicting cached institute");
            self.remove_entries();
        }
    }
}

/// `mailto:` link for the support contact, prefilled with the attempted id.
#[must_use]
pub fn support_mailto(support_email: &str, institute_id: &str) -> String {
    let body = format!("Institute ID: {institute_id}\r\n\r\nI need help accessing Nexora.");
    format!(
        "mailto:{support_email}?subject={}&body={}",
        urlencoding::encode("Institute Access Help"),
        urlencoding::encode(&body)
    )
}

#[cfg(test)]
#[path = "institute_test.rs"]
mod tests;
