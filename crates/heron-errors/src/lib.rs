//! Tagged error taxonomy shared by HeronStack services.
//!
//! Every failure carries a closed [`ErrorKind`], an HTTP-ish status code, a
//! message safe to show externally, and a private message for logs. The type
//! serializes with serde so a service's error encoding can round-trip through
//! an opaque transport payload.

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Internal fault; details are never safe to expose externally.
    Private,
    /// Caller-visible fault with an explicit status code.
    Public,
    Validation,
    Unauthorized,
    Forbidden,
    NotFound,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ThisError)]
#[error("{status} {public_message}")]
pub struct Error {
    kind: ErrorKind,
    status: u16,
    public_message: String,
    private_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl Error {
    /// Internal fault. The public message is fixed; the private message is
    /// for logs only.
    pub fn private(private_message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Private,
            status: 500,
            public_message: "Internal error".to_string(),
            private_message: private_message.into(),
            data: None,
        }
    }

    pub fn public(
        status: u16,
        public_message: impl Into<String>,
        private_message: impl Into<String>,
    ) -> Self {
        Self {
            kind: ErrorKind::Public,
            status,
            public_message: public_message.into(),
            private_message: private_message.into(),
            data: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::Validation, 400, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::Unauthorized, 401, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::Forbidden, 403, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::NotFound, 404, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::Timeout, 504, message)
    }

    fn tagged(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            status,
            public_message: message.clone(),
            private_message: message,
            data: None,
        }
    }

    /// Attach structured data observable by the caller.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn public_message(&self) -> &str {
        &self.public_message
    }

    pub fn private_message(&self) -> &str {
        &self.private_message
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }
}
