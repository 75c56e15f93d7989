//! Typed session and profile shapes.
//!
//! The identity provider hands back loosely typed user objects with a free-form
//! `user_metadata` map. Everything is coerced into [`Session`] at the boundary
//! by [`Session::from_wire`]; fields of the wrong type are logged and dropped
//! instead of leaking untyped JSON further in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::backend::BackendError;

pub const MIN_PASSWORD_LEN: usize = 6;

// =============================================================================
// WIRE SHAPES
// =============================================================================

/// User object as the identity provider returns it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUser {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
    #[serde(default, rename = "zipCode")]
    pub zip_code: String,
}

impl Address {
    #[must_use]
    pub fn is_blank(&self) -> bool {
        [&self.street, &self.city, &self.state, &self.country, &self.zip_code]
            .iter()
            .all(|s| s.trim().is_empty())
    }
}

/// Registration metadata stored with the account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub institution_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub institution_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub institute_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

impl UserMetadata {
    /// Pick the known fields out of a free-form metadata map.
    #[must_use]
    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            full_name: text_field(map, "full_name"),
            institution_name: text_field(map, "institution_name"),
            institution_type: text_field(map, "institution_type"),
            institute_id: text_field(map, "institute_id"),
            phone: text_field(map, "phone"),
            address: map.get("address").and_then(|raw| match serde_json::from_value::<Address>(raw.clone()) {
                Ok(address) if !address.is_blank() => Some(address),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring malformed address metadata");
                    None
                }
            }),
        }
    }
}

fn text_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => Some(s.trim().to_owned()).filter(|s| !s.is_empty()),
        Value::Null => None,
        other => {
            tracing::warn!(field = key, kind = json_kind(other), "ignoring non-string metadata field");
            None
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Authenticated identity issued by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    /// Institute id the account registered with, if any. Display only.
    pub tenant_id_hint: Option<String>,
    pub issued_at: OffsetDateTime,
    pub metadata: UserMetadata,
}

impl Session {
    #[must_use]
    pub fn new(user_id: Uuid, email: &str, metadata: UserMetadata, issued_at: OffsetDateTime) -> Self {
        let email = email.trim().to_owned();
        let display_name = metadata.full_name.clone().unwrap_or_else(|| email_local_part(&email).to_owned());
        let tenant_id_hint = metadata.institute_id.clone();
        Self { user_id, email, display_name, tenant_id_hint, issued_at, metadata }
    }

    /// Validate a provider user object into a session.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::MalformedResponse`] if the user id is missing or
    /// not a UUID, or the email is missing.
    pub fn from_wire(user: WireUser, issued_at: OffsetDateTime) -> Result<Self, BackendError> {
        let user_id = user
            .id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id.trim()).ok())
            .ok_or_else(|| BackendError::MalformedResponse("user id missing or not a uuid".into()))?;
        let email = user
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| BackendError::MalformedResponse("user email missing".into()))?;
        let metadata = UserMetadata::from_map(&user.user_metadata);
        Ok(Self::new(user_id, email, metadata, issued_at))
    }
}

fn email_local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

/// Trim and lower-case an email address.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// =============================================================================
// PROFILE VIEW
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }
}

/// Normalized user view for display. Never consulted for authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub institution_name: String,
    pub institution_type: String,
    pub institute_id: String,
    pub phone: String,
    pub address: Option<Address>,
    pub role: Role,
}

impl UserProfile {
    #[must_use]
    pub fn from_session(session: &Session, role_hint: Option<Role>) -> Self {
        let meta = &session.metadata;
        Self {
            id: session.user_id,
            email: session.email.clone(),
            full_name: session.display_name.clone(),
            institution_name: meta.institution_name.clone().unwrap_or_default(),
            institution_type: meta.institution_type.clone().unwrap_or_default(),
            institute_id: meta.institute_id.clone().unwrap_or_default(),
            phone: meta.phone.clone().unwrap_or_default(),
            address: meta.address.clone(),
            role: role_hint.unwrap_or(Role::Admin),
        }
    }
}

// =============================================================================
// SIGN-UP
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct SignUpRequest {
    pub institute_id: String,
    pub institution_name: String,
    pub institution_type: String,
    pub email: String,
    pub phone: String,
    pub full_name: String,
    pub password: String,
    pub password_confirm: String,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpOutcome {
    pub user_id: Uuid,
    /// The provider wants the address confirmed before the first sign-in.
    pub email_confirmation_required: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SignUpError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("passwords do not match")]
    PasswordMismatch,
    #[error("password must be at least {} characters", MIN_PASSWORD_LEN)]
    PasswordTooShort,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SignUpRequest {
    /// Check required fields and password rules, in form order.
    ///
    /// # Errors
    ///
    /// Returns the first failing rule.
    pub fn validate(&self) -> Result<(), SignUpError> {
        let required = [
            (&self.institute_id, "Institute ID"),
            (&self.institution_name, "Institution Name"),
            (&self.full_name, "Full Name"),
            (&self.email, "Email"),
        ];
        for (value, label) in required {
            if value.trim().is_empty() {
                return Err(SignUpError::Missing(label));
            }
        }
        if self.password.is_empty() {
            return Err(SignUpError::Missing("Password"));
        }
        if self.password != self.password_confirm {
            return Err(SignUpError::PasswordMismatch);
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(SignUpError::PasswordTooShort);
        }
        Ok(())
    }

    /// Institute ids are stored upper-case, matching the access gateway.
    #[must_use]
    pub fn normalized_institute_id(&self) -> String {
        self.institute_id.trim().to_uppercase()
    }

    #[must_use]
    pub fn metadata(&self) -> UserMetadata {
        let non_empty = |s: &str| Some(s.trim().to_owned()).filter(|s| !s.is_empty());
        UserMetadata {
            full_name: non_empty(&self.full_name),
            institution_name: non_empty(&self.institution_name),
            institution_type: non_empty(&self.institution_type),
            institute_id: non_empty(&self.normalized_institute_id()),
            phone: non_empty(&self.phone),
            address: Some(self.address.clone()).filter(|a| !a.is_blank()),
        }
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
