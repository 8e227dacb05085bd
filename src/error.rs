//! Error type shared by every cart operation.
//!
//! Failures are classified up front so the retry helper can tell a
//! transient outage (worth another attempt) from a request the server will
//! reject no matter how often it is repeated.

use reqwest::StatusCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CartError {
    /// The user must sign in with the retailer before mutating the cart.
    #[error("Sign in to your grocery account to change the cart")]
    AuthRequired,

    /// The API answered with a non-2xx status.
    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },

    /// The request never produced a response (connect, timeout, DNS...).
    #[error("{0}")]
    Network(String),

    /// The API answered 2xx but with `success: false`.
    #[error("Cart service rejected the request: {0}")]
    Rejected(String),

    /// The response body was not the JSON envelope we expect.
    #[error("Invalid response from cart service: {0}")]
    Decode(String),

    #[error("{0}")]
    Validation(String),

    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CartError {
    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Http {
            status: status.as_u16(),
            message: message.into(),
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Network failures, 5xx, 408, 429 and `success: false` envelopes are
    /// retried. Everything else (4xx validation, auth, decode, local
    /// storage) fails fast so the backoff budget is not spent on a request
    /// that cannot succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Rejected(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::AuthRequired
            | Self::Decode(_)
            | Self::Validation(_)
            | Self::Storage(_)
            | Self::Config(_) => false,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthRequired)
    }
}
