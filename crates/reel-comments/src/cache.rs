//! Read-through cache of comment pages.
//!
//! One instance is shared process-wide. Invalidation is coarse: a write drops
//! every page of the affected post, a delete drops everything.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::CommentPage;

/// Key of a cached page: the post and the cursor token the page starts after.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub post_id: String,
    /// `None` for the first page.
    pub cursor: Option<String>,
}

impl PageKey {
    pub fn new(post_id: impl Into<String>, cursor: Option<String>) -> Self {
        Self {
            post_id: post_id.into(),
            cursor,
        }
    }
}

struct CachedPage {
    page: CommentPage,
    expires_at: Instant,
}

/// Time-expiring page cache.
pub struct PageCache {
    entries: DashMap<PageKey, CachedPage>,
    ttl: Duration,
}

impl PageCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            ttl,
        })
    }

    /// Fetch a live entry. Expired entries are dropped on the way.
    pub fn get(&self, key: &PageKey) -> Option<CommentPage> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                trace!(post_id = %key.post_id, cursor = ?key.cursor, "page cache hit");
                return Some(entry.page.clone());
            }
        }

        if self
            .entries
            .remove_if(key, |_, entry| entry.expires_at <= now)
            .is_some()
        {
            trace!(post_id = %key.post_id, "page cache entry expired");
        }
        None
    }

    pub fn insert(&self, key: PageKey, page: CommentPage) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.insert(key, CachedPage { page, expires_at });
    }

    /// Drop every page of a post.
    pub fn invalidate_post(&self, post_id: &str) {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.post_id != post_id);
        debug!(
            post_id,
            dropped = before.saturating_sub(self.entries.len()),
            "invalidated cached pages"
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
        debug!("cleared page cache");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(total: u64) -> CommentPage {
        CommentPage {
            comments: Vec::new(),
            has_more: false,
            next_cursor: None,
            total_count: total,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = PageCache::new(Duration::from_secs(300));
        let key = PageKey::new("p1", None);
        cache.insert(key.clone(), page(3));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get(&key).map(|p| p.total_count), Some(3));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_post_keeps_other_posts() {
        let cache = PageCache::new(Duration::from_secs(60));
        cache.insert(PageKey::new("p1", None), page(1));
        cache.insert(PageKey::new("p1", Some("abc".into())), page(1));
        cache.insert(PageKey::new("p2", None), page(2));

        cache.invalidate_post("p1");
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&PageKey::new("p2", None)).is_some());
    }

    #[test]
    fn clear_drops_everything() {
        let cache = PageCache::new(Duration::from_secs(60));
        cache.insert(PageKey::new("p1", None), page(1));
        cache.insert(PageKey::new("p2", None), page(2));
        cache.clear();
        assert!(cache.is_empty());
    }
}
