//! Error types for the document store.

use thiserror::Error;

/// Errors that can occur when talking to the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Document not found.
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// The caller is not allowed to perform this operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Backend unreachable or failing (network, 5xx, injected outage).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A write precondition failed because the document changed underneath us.
    #[error("write conflict on {collection}/{id}")]
    Conflict { collection: String, id: String },

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A pagination cursor token could not be decoded.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl StoreError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::RateLimited { .. } => true,
            StoreError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StoreError::PermissionDenied(_))
    }

    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_message_includes_retry_after() {
        let err = StoreError::RateLimited {
            retry_after_secs: Some(30),
        };
        assert_eq!(err.to_string(), "rate limited (retry after 30s)");

        let err = StoreError::RateLimited {
            retry_after_secs: None,
        };
        assert_eq!(err.to_string(), "rate limited");
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(StoreError::RateLimited { retry_after_secs: None }.is_transient());
        assert!(!StoreError::PermissionDenied("no".into()).is_transient());
        assert!(!StoreError::not_found("comments", "abc").is_transient());
    }

    #[test]
    fn not_found_display() {
        let err = StoreError::not_found("comments", "abc");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "document not found: comments/abc");
    }
}
