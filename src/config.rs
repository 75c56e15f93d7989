//! Portal configuration parsed from environment variables.

use std::path::PathBuf;

use crate::cache::DEFAULT_NAMESPACE;

pub const DEFAULT_CACHE_PATH: &str = ".nexora/cache.json";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_FEATURES: &str = "signup,email_verification";
pub const DEFAULT_SUPPORT_EMAIL: &str = "nexora@chatakeinnoworks.com";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {var}")]
    Missing { var: &'static str },
    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self { request_secs: DEFAULT_REQUEST_TIMEOUT_SECS, connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS }
    }
}

// =============================================================================
// CAPABILITY FLAGS
// =============================================================================

/// Optional portal surfaces. One state machine serves every deployment; the
/// flags only switch routes and hints on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct PortalFeatures {
    pub signup: bool,
    pub email_verification: bool,
    pub role_selection: bool,
    pub design_demo: bool,
}

impl Default for PortalFeatures {
    fn default() -> Self {
        Self { signup: true, email_verification: true, role_selection: false, design_demo: false }
    }
}

impl PortalFeatures {
    /// Every flag off.
    #[must_use]
    pub const fn none() -> Self {
        Self { signup: false, email_verification: false, role_selection: false, design_demo: false }
    }

    /// Parse a comma-separated flag list such as `signup,role_selection`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on an unknown flag name.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut features = Self::none();
        for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name.to_ascii_lowercase().as_str() {
                "signup" => features.signup = true,
                "email_verification" => features.email_verification = true,
                "role_selection" => features.role_selection = true,
                "design_demo" => features.design_demo = true,
                other => return Err(ConfigError::Parse(format!("unknown feature '{other}' in NEXORA_FEATURES"))),
            }
        }
        Ok(features)
    }
}

// =============================================================================
// PORTAL CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalConfig {
    pub backend_url: String,
    pub api_key: String,
    pub cache_path: PathBuf,
    pub cache_namespace: String,
    pub timeouts: HttpTimeouts,
    pub features: PortalFeatures,
    pub support_email: String,
}

impl PortalConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `NEXORA_BACKEND_URL`
    /// - `NEXORA_API_KEY`
    ///
    /// Optional:
    /// - `NEXORA_CACHE_PATH`: default `.nexora/cache.json`
    /// - `NEXORA_CACHE_NAMESPACE`: default `nexora`
    /// - `NEXORA_REQUEST_TIMEOUT_SECS`: default 30
    /// - `NEXORA_CONNECT_TIMEOUT_SECS`: default 10
    /// - `NEXORA_FEATURES`: default `signup,email_verification`
    /// - `NEXORA_SUPPORT_EMAIL`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`PortalConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            lookup(var).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty()).ok_or(ConfigError::Missing { var })
        };

        let backend_url = required("NEXORA_BACKEND_URL")?.trim_end_matches('/').to_owned();
        if reqwest::Url::parse(&backend_url).is_err() {
            return Err(ConfigError::Parse(format!("NEXORA_BACKEND_URL is not a valid url: {backend_url}")));
        }
        let api_key = required("NEXORA_API_KEY")?;

        let cache_path = lookup("NEXORA_CACHE_PATH").map_or_else(|| PathBuf::from(DEFAULT_CACHE_PATH), PathBuf::from);
        let cache_namespace = lookup("NEXORA_CACHE_NAMESPACE")
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned());
        let timeouts = HttpTimeouts {
            request_secs: parse_u64(&lookup, "NEXORA_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_secs: parse_u64(&lookup, "NEXORA_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
        };
        let features = PortalFeatures::parse(&lookup("NEXORA_FEATURES").unwrap_or_else(|| DEFAULT_FEATURES.to_owned()))?;
        let support_email = lookup("NEXORA_SUPPORT_EMAIL").unwrap_or_else(|| DEFAULT_SUPPORT_EMAIL.to_owned());

        Ok(Self { backend_url, api_key, cache_path, cache_namespace, timeouts, features, support_email })
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key).and_then(|v| v.trim().parse::<u64>().ok()).unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
