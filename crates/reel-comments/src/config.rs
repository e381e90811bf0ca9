use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CommentError;

/// Tunables for repositories and sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentsConfig {
    /// Top-level comments per page.
    pub page_size: usize,
    /// Replies loaded per top-level comment.
    pub reply_limit: usize,
    pub cache_ttl_secs: u64,
    /// Most recent comments whose removals the realtime feed reports.
    pub realtime_window: usize,
    /// Wait after a delete before re-reading, for cross-region consistency.
    pub delete_settle_ms: u64,
    pub comments_collection: String,
    pub counts_collection: String,
    pub likes_collection: String,
}

impl Default for CommentsConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            reply_limit: 20,
            cache_ttl_secs: 300,
            realtime_window: 50,
            delete_settle_ms: 500,
            comments_collection: "comments".to_string(),
            counts_collection: "post_comment_counts".to_string(),
            likes_collection: "comment_like_counts".to_string(),
        }
    }
}

impl CommentsConfig {
    pub fn validate(&self) -> Result<(), CommentError> {
        if self.page_size == 0 {
            return Err(CommentError::InvalidConfig("page_size must be at least 1".into()));
        }
        if self.realtime_window == 0 {
            return Err(CommentError::InvalidConfig(
                "realtime_window must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("comments_collection", &self.comments_collection),
            ("counts_collection", &self.counts_collection),
            ("likes_collection", &self.likes_collection),
        ] {
            if value.is_empty() {
                return Err(CommentError::InvalidConfig(format!("{} is empty", name)));
            }
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn delete_settle(&self) -> Duration {
        Duration::from_millis(self.delete_settle_ms)
    }
}
