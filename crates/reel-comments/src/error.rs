use reel_store::StoreError;
use thiserror::Error;

use crate::CommentId;

/// Errors from comment operations.
#[derive(Debug, Error)]
pub enum CommentError {
    /// Backend failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The caller may not modify this comment.
    #[error("not authorized to modify comment {comment_id}")]
    PermissionDenied { comment_id: CommentId },

    /// A stored document could not be read as a comment.
    #[error("malformed comment document {id}: {reason}")]
    Malformed { id: String, reason: String },

    /// The comment has not been confirmed by the backend yet.
    #[error("comment {0} is still pending")]
    Pending(CommentId),

    /// The comment is degraded-mode placeholder data.
    #[error("comment {0} is a placeholder")]
    Placeholder(CommentId),

    #[error("comment text is empty")]
    EmptyText,

    /// Replies to replies are not modeled.
    #[error("comment {parent} is itself a reply")]
    NestedReply { parent: CommentId },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CommentError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            CommentError::PermissionDenied { .. } => true,
            CommentError::Store(e) => e.is_permission_denied(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_permission_errors_classify_as_permission_denied() {
        let err = CommentError::from(StoreError::PermissionDenied("nope".into()));
        assert!(err.is_permission_denied());
        assert!(!CommentError::EmptyText.is_permission_denied());
    }

    #[test]
    fn permission_denied_display() {
        let err = CommentError::PermissionDenied {
            comment_id: CommentId::from("abc"),
        };
        assert_eq!(err.to_string(), "not authorized to modify comment abc");
    }
}
