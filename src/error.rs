//! Unified error handling for the courier-nav library.
//!
//! Expected failure modes (no route, no geocode match, socket failure) are
//! represented as values of [`NavError`] and never unwind past the callback
//! or task that observed them.

use thiserror::Error;

/// Unified error type for courier-nav operations.
#[derive(Debug, Clone, PartialEq, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
pub enum NavError {
    /// The directions provider returned no usable geometry
    #[error("Route unavailable: {message}")]
    RouteUnavailable { message: String },

    /// The geocoding provider had no feature for the address
    #[error("Address not found: '{address}'")]
    NotFound { address: String },

    /// HTTP/API error
    #[error("HTTP error{}: {message}", status_suffix(.status_code))]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    /// Credentials missing or rejected by the backend
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Malformed JSON or an unencodable value
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl NavError {
    pub fn route_unavailable(message: impl Into<String>) -> Self {
        NavError::RouteUnavailable {
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        NavError::Auth {
            message: message.into(),
        }
    }

    /// True when the backend rejected the credentials themselves.
    pub fn is_auth(&self) -> bool {
        matches!(self, NavError::Auth { .. })
            || matches!(
                self,
                NavError::Http {
                    status_code: Some(401),
                    ..
                }
            )
    }

    /// True for failures the normal flow retries on its own (next tick,
    /// next reconnect). The live channel stops retrying on anything else.
    pub fn is_transient(&self) -> bool {
        match self {
            NavError::Http {
                status_code: Some(code),
                ..
            } => *code == 429 || *code >= 500,
            NavError::Http {
                status_code: None, ..
            } => true,
            NavError::RouteUnavailable { .. } => true,
            _ => false,
        }
    }
}

fn status_suffix(status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!(" ({})", code),
        None => String::new(),
    }
}

impl From<serde_json::Error> for NavError {
    fn from(e: serde_json::Error) -> Self {
        NavError::Serialization {
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for NavError {
    fn from(e: reqwest::Error) -> Self {
        NavError::Http {
            message: e.to_string(),
            status_code: e.status().map(|s| s.as_u16()),
        }
    }
}

/// Result type alias for courier-nav operations.
pub type Result<T> = std::result::Result<T, NavError>;

/// Extension trait for converting Option to NavError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a route-unavailable error.
    fn ok_or_route_unavailable(self, message: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_route_unavailable(self, message: &str) -> Result<T> {
        self.ok_or_else(|| NavError::route_unavailable(message))
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| NavError::Internal {
            message: message.to_string(),
        })
    }
}
