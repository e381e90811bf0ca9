//! Comment data types.

use chrono::{DateTime, Utc};
use reel_store::{Cursor, Document};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CommentError;

/// Reserved prefix of locally generated ids. Backend ids never start with it.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Comment identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(String);

impl CommentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh id for an optimistic entry.
    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CommentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Author snapshot taken when a comment is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorProfile {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A remark on a post, or a reply to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    /// Document id; not part of the stored fields.
    #[serde(skip)]
    pub id: CommentId,
    pub post_id: String,
    /// `None` for top-level comments.
    #[serde(default)]
    pub parent_comment_id: Option<CommentId>,
    pub author_id: String,
    pub author_display_name: String,
    #[serde(default)]
    pub author_avatar_url: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Derived from the like counter, never stored on the comment.
    #[serde(skip)]
    pub like_count: u64,
    #[serde(default, deserialize_with = "non_negative")]
    pub reply_count: u64,
    /// Oldest first. Empty until loaded.
    #[serde(skip)]
    pub replies: Vec<Comment>,
}

impl Comment {
    /// Decode a stored comment document.
    pub fn from_document(doc: &Document) -> Result<Self, CommentError> {
        let mut comment: Comment = doc.decode().map_err(|e| CommentError::Malformed {
            id: doc.id.clone(),
            reason: e.to_string(),
        })?;
        comment.id = CommentId::new(doc.id.clone());
        Ok(comment)
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_comment_id.is_none()
    }
}

/// Denormalized counters can be driven below zero by racing decrements; clamp them.
fn non_negative<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = i64::deserialize(deserializer)?;
    Ok(value.max(0) as u64)
}

/// One page of top-level comments.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    pub has_more: bool,
    /// Resume point for the next page; `None` when the page is empty.
    pub next_cursor: Option<Cursor>,
    pub total_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_store::Fields;
    use serde_json::json;

    fn doc(fields: serde_json::Value) -> Document {
        let fields: Fields = serde_json::from_value(fields).unwrap();
        Document::new("3kq2abc", fields)
    }

    #[test]
    fn temporary_ids_are_namespaced_and_unique() {
        let a = CommentId::temporary();
        let b = CommentId::temporary();
        assert!(a.is_temporary());
        assert_ne!(a, b);
        assert!(!CommentId::from("3kq2abc").is_temporary());
    }

    #[test]
    fn decodes_top_level_comment() {
        let comment = Comment::from_document(&doc(json!({
            "postId": "p1",
            "parentCommentId": null,
            "authorId": "u1",
            "authorDisplayName": "Ada",
            "text": "first",
            "createdAt": "2026-01-01T00:00:00.000000Z",
            "likeCount": 99
        })))
        .unwrap();

        assert_eq!(comment.id.as_str(), "3kq2abc");
        assert!(comment.is_top_level());
        assert_eq!(comment.author_avatar_url, None);
        assert_eq!(comment.reply_count, 0);
        // Like counts come from the counter relation only.
        assert_eq!(comment.like_count, 0);
    }

    #[test]
    fn decodes_reply() {
        let comment = Comment::from_document(&doc(json!({
            "postId": "p1",
            "parentCommentId": "c1",
            "authorId": "u1",
            "authorDisplayName": "Ada",
            "text": "re",
            "createdAt": "2026-01-01T00:00:00Z",
            "replyCount": 0
        })))
        .unwrap();
        assert_eq!(comment.parent_comment_id, Some(CommentId::from("c1")));
        assert!(!comment.is_top_level());
    }

    #[test]
    fn negative_reply_count_clamps_to_zero() {
        let comment = Comment::from_document(&doc(json!({
            "postId": "p1",
            "parentCommentId": null,
            "authorId": "u1",
            "authorDisplayName": "Ada",
            "text": "first",
            "createdAt": "2026-01-01T00:00:00Z",
            "replyCount": -1
        })))
        .unwrap();
        assert_eq!(comment.reply_count, 0);
    }

    #[test]
    fn malformed_document_reports_id() {
        let err = Comment::from_document(&doc(json!({ "postId": "p1" }))).unwrap_err();
        assert!(matches!(err, CommentError::Malformed { ref id, .. } if id == "3kq2abc"));
    }
}
