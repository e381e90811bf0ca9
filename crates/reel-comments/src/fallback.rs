//! Built-in comments shown when a thread cannot be loaded.

use chrono::{Duration, Utc};

use crate::{Comment, CommentId};

/// Id prefix of placeholder comments. Never produced by the backend.
pub const PLACEHOLDER_ID_PREFIX: &str = "placeholder-";

const PLACEHOLDERS: &[(&str, &str)] = &[
    ("Reel", "Comments are taking a moment to load."),
    ("Reel", "Pull down to refresh and join the conversation."),
    ("Reel", "Be kind, stay on topic, and have fun."),
];

/// Placeholder thread for `post_id`, newest first.
pub fn placeholder_comments(post_id: &str) -> Vec<Comment> {
    let now = Utc::now();
    PLACEHOLDERS
        .iter()
        .enumerate()
        .map(|(i, (author, text))| Comment {
            id: CommentId::new(format!("{}{}", PLACEHOLDER_ID_PREFIX, i + 1)),
            post_id: post_id.to_string(),
            parent_comment_id: None,
            author_id: String::new(),
            author_display_name: author.to_string(),
            author_avatar_url: None,
            text: text.to_string(),
            created_at: now - Duration::minutes(i as i64),
            like_count: 0,
            reply_count: 0,
            replies: Vec::new(),
        })
        .collect()
}

pub fn is_placeholder(id: &CommentId) -> bool {
    id.as_str().starts_with(PLACEHOLDER_ID_PREFIX)
}
