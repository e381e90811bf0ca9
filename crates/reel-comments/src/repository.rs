//! Backend I/O for comments.
//!
//! Reads go through the shared [`PageCache`]; every write invalidates it.
//! Pages are enriched with reply batches and like counts on a best-effort
//! basis: a failed enrichment leaves the page usable.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use futures_util::future::join_all;
use reel_store::{
    Change, Cursor, Direction, Document, DocumentStore, FieldUpdate, Fields, Filter, Query,
    StoreError, WatchOptions, WriteOp, server_timestamp,
};
use serde_json::{Value, json};
use tracing::{debug, error, info, trace, warn};

use crate::cache::{PageCache, PageKey};
use crate::{
    AuthorProfile, Comment, CommentError, CommentId, CommentPage, CommentsConfig, CountStore,
    Subscription,
};

/// Field comments are ordered by.
pub const CREATED_AT: &str = "createdAt";

/// Callback for comments created by other sessions.
pub type AddedCallback = Arc<dyn Fn(Comment) + Send + Sync>;

/// Callback for comments deleted by other sessions.
pub type RemovedCallback = Arc<dyn Fn(CommentId) + Send + Sync>;

/// Comment reads, writes and realtime subscriptions against a document store.
pub struct CommentRepository {
    store: Arc<dyn DocumentStore>,
    cache: Arc<PageCache>,
    counts: CountStore,
    config: CommentsConfig,
}

fn is_top_level_doc(doc: &Document) -> bool {
    matches!(doc.get("parentCommentId"), None | Some(Value::Null))
}

fn belongs_to(doc: &Document, post_id: &str) -> bool {
    doc.get_str("postId") == Some(post_id)
}

fn decode_all(docs: &[Document]) -> Vec<Comment> {
    docs.iter()
        .filter_map(|doc| match Comment::from_document(doc) {
            Ok(comment) => Some(comment),
            Err(e) => {
                warn!(error = %e, "skipping malformed comment");
                None
            }
        })
        .collect()
}

impl CommentRepository {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<PageCache>, config: CommentsConfig) -> Self {
        let counts = CountStore::new(
            store.clone(),
            config.counts_collection.clone(),
            config.comments_collection.clone(),
        );
        Self {
            store,
            cache,
            counts,
            config,
        }
    }

    pub fn config(&self) -> &CommentsConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn counts(&self) -> &CountStore {
        &self.counts
    }

    /// One page of top-level comments, newest first, starting after `cursor`.
    #[tracing::instrument(skip(self, cursor))]
    pub async fn get_page(
        &self,
        post_id: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
        bypass_cache: bool,
    ) -> Result<CommentPage, CommentError> {
        let key = PageKey::new(post_id, cursor.map(Cursor::token));
        if !bypass_cache {
            if let Some(mut page) = self.cache.get(&key) {
                // Counts move independently of cached pages.
                page.total_count = self.counts.get_count(post_id).await;
                return Ok(page);
            }
        }

        let query = Query::new()
            .filter(Filter::eq("postId", post_id))
            .filter(Filter::is_null("parentCommentId"))
            .order_by(CREATED_AT, Direction::Desc)
            .start_after(cursor.cloned())
            .limit(page_size + 1);
        let mut docs = self
            .store
            .query(&self.config.comments_collection, &query)
            .await?;

        // The extra row only signals that another page exists.
        let has_more = docs.len() > page_size;
        docs.truncate(page_size);

        let next_cursor = docs.last().map(|doc| Cursor::from_document(doc, CREATED_AT));
        let mut comments = decode_all(&docs);
        self.enrich(&mut comments).await;

        let page = CommentPage {
            comments,
            has_more,
            next_cursor,
            total_count: self.counts.get_count(post_id).await,
        };
        debug!(
            post_id,
            comments = page.comments.len(),
            has_more,
            "fetched comment page"
        );

        self.cache.insert(key, page.clone());
        Ok(page)
    }

    /// Attach replies and like counts.
    async fn enrich(&self, comments: &mut [Comment]) {
        let replies = join_all(comments.iter().map(|c| self.get_replies(&c.id))).await;
        for (comment, result) in comments.iter_mut().zip(replies) {
            match result {
                Ok(replies) => comment.replies = replies,
                Err(e) => warn!(comment_id = %comment.id, error = %e, "failed to load replies"),
            }
        }

        let ids: Vec<String> = comments
            .iter()
            .flat_map(|c| std::iter::once(c).chain(c.replies.iter()))
            .map(|c| c.id.as_str().to_string())
            .collect();
        if ids.is_empty() {
            return;
        }

        match self
            .store
            .get_many(&self.config.likes_collection, &ids)
            .await
        {
            Ok(docs) => {
                let likes: HashMap<String, u64> = docs
                    .into_iter()
                    .map(|doc| {
                        let count = doc.get_u64("count").unwrap_or(0);
                        (doc.id, count)
                    })
                    .collect();
                let lookup = |c: &mut Comment| {
                    c.like_count = likes.get(c.id.as_str()).copied().unwrap_or(0);
                };
                for comment in comments.iter_mut() {
                    lookup(comment);
                    comment.replies.iter_mut().for_each(lookup);
                }
            }
            Err(e) => warn!(error = %e, "failed to load like counts"),
        }
    }

    /// Replies to a comment, oldest first, up to the configured limit.
    pub async fn get_replies(&self, comment_id: &CommentId) -> Result<Vec<Comment>, CommentError> {
        let query = Query::new()
            .filter(Filter::eq("parentCommentId", comment_id.as_str()))
            .order_by(CREATED_AT, Direction::Asc)
            .limit(self.config.reply_limit);
        let docs = self
            .store
            .query(&self.config.comments_collection, &query)
            .await?;
        Ok(decode_all(&docs))
    }

    /// Persist a new comment or reply.
    #[tracing::instrument(skip(self, text, author), fields(author_id = %author.id))]
    pub async fn add_comment(
        &self,
        post_id: &str,
        text: &str,
        author: &AuthorProfile,
        parent_comment_id: Option<&CommentId>,
    ) -> Result<Comment, CommentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CommentError::EmptyText);
        }

        if let Some(parent) = parent_comment_id {
            if parent.is_temporary() {
                return Err(CommentError::Pending(parent.clone()));
            }
            match self
                .store
                .get(&self.config.comments_collection, parent.as_str())
                .await
            {
                Ok(Some(doc)) if !is_top_level_doc(&doc) => {
                    return Err(CommentError::NestedReply {
                        parent: parent.clone(),
                    });
                }
                Ok(Some(_)) => {}
                Ok(None) => debug!(parent_id = %parent, "replying to a missing parent"),
                Err(e) => warn!(parent_id = %parent, error = %e, "failed to read parent comment"),
            }
        }

        let mut fields = Fields::new();
        fields.insert("postId".into(), json!(post_id));
        fields.insert(
            "parentCommentId".into(),
            json!(parent_comment_id.map(CommentId::as_str)),
        );
        fields.insert("authorId".into(), json!(author.id));
        fields.insert("authorDisplayName".into(), json!(author.display_name));
        fields.insert("authorAvatarUrl".into(), json!(author.avatar_url));
        fields.insert("text".into(), json!(text));
        fields.insert(CREATED_AT.into(), server_timestamp());
        fields.insert("replyCount".into(), json!(0));

        let doc = self
            .store
            .create(&self.config.comments_collection, fields)
            .await?;
        let comment = Comment::from_document(&doc)?;

        match parent_comment_id {
            None => {
                if let Err(e) = self.counts.increment(post_id).await {
                    warn!(post_id, error = %e, "failed to increment comment count");
                }
            }
            Some(parent) => self.adjust_reply_count(parent, 1).await,
        }

        self.cache.invalidate_post(post_id);
        info!(post_id, comment_id = %comment.id, "comment added");
        Ok(comment)
    }

    /// Best-effort `replyCount` maintenance on a parent comment.
    async fn adjust_reply_count(&self, parent: &CommentId, by: i64) {
        match self
            .store
            .update(
                &self.config.comments_collection,
                parent.as_str(),
                vec![FieldUpdate::increment("replyCount", by)],
            )
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(parent_id = %parent, "parent comment gone, skipping reply count");
            }
            Err(e) => warn!(parent_id = %parent, error = %e, "failed to update reply count"),
        }
    }

    /// Delete a comment together with its replies.
    ///
    /// Deleting something already gone succeeds.
    #[tracing::instrument(skip(self))]
    pub async fn delete_comment(
        &self,
        comment_id: &CommentId,
        post_id: &str,
    ) -> Result<(), CommentError> {
        if comment_id.is_temporary() {
            return Err(CommentError::Pending(comment_id.clone()));
        }

        let permission = |e: StoreError| {
            if e.is_permission_denied() {
                CommentError::PermissionDenied {
                    comment_id: comment_id.clone(),
                }
            } else {
                CommentError::Store(e)
            }
        };

        let collection = &self.config.comments_collection;
        let Some(doc) = self
            .store
            .get(collection, comment_id.as_str())
            .await
            .map_err(permission)?
        else {
            debug!(comment_id = %comment_id, "comment already deleted");
            self.cache.clear();
            return Ok(());
        };

        let parent = doc.get_str("parentCommentId").map(CommentId::from);
        let mut ops = vec![WriteOp::Delete {
            collection: collection.clone(),
            id: comment_id.as_str().to_string(),
        }];

        if parent.is_none() {
            let replies = Query::new().filter(Filter::eq("parentCommentId", comment_id.as_str()));
            match self.store.query(collection, &replies).await {
                Ok(replies) => ops.extend(replies.into_iter().map(|reply| WriteOp::Delete {
                    collection: collection.clone(),
                    id: reply.id,
                })),
                Err(e) => warn!(comment_id = %comment_id, error = %e, "failed to list replies for deletion"),
            }
        }

        let deleted = ops.len();
        match self.store.batch(ops).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(comment_id = %comment_id, "comment deleted concurrently");
                self.cache.clear();
                return Ok(());
            }
            Err(e) => return Err(permission(e)),
        }

        match &parent {
            None => {
                if let Err(e) = self.counts.decrement(post_id).await {
                    warn!(post_id, error = %e, "failed to decrement comment count");
                }
            }
            Some(parent) => self.adjust_reply_count(parent, -1).await,
        }

        self.cache.clear();
        info!(post_id, comment_id = %comment_id, documents = deleted, "comment deleted");
        Ok(())
    }

    /// Realtime feed of this post's top-level comments.
    ///
    /// Only removals among the most recent `realtime_window` comments of the
    /// collection are observed.
    pub async fn subscribe_to_new_comments(
        &self,
        post_id: &str,
        on_added: AddedCallback,
        on_removed: RemovedCallback,
    ) -> Result<Subscription, CommentError> {
        let options = WatchOptions {
            window: self.config.realtime_window,
            order_by: CREATED_AT.to_string(),
        };
        let mut feed = self
            .store
            .watch(&self.config.comments_collection, options)
            .await?;

        let closed = Arc::new(AtomicBool::new(false));
        let task_closed = closed.clone();
        let task_post_id = post_id.to_string();

        let task = tokio::spawn(async move {
            while let Some(change) = feed.next().await {
                if task_closed.load(Ordering::SeqCst) {
                    break;
                }
                match change {
                    Change::Added(doc) if belongs_to(&doc, &task_post_id) && is_top_level_doc(&doc) => {
                        match Comment::from_document(&doc) {
                            Ok(comment) => on_added(comment),
                            Err(e) => warn!(error = %e, "ignoring malformed realtime comment"),
                        }
                    }
                    Change::Removed(doc) if belongs_to(&doc, &task_post_id) && is_top_level_doc(&doc) => {
                        on_removed(CommentId::new(doc.id));
                    }
                    other => trace!(id = %other.document().id, "ignoring realtime change"),
                }
            }
            if !task_closed.load(Ordering::SeqCst) {
                error!(post_id = %task_post_id, "comment feed ended unexpectedly");
            }
        });

        info!(post_id, window = self.config.realtime_window, "comment subscription started");
        Ok(Subscription::new(post_id.to_string(), closed, task))
    }

    /// Adjust a comment's like counter by `delta`, floored at 0.
    #[tracing::instrument(skip(self))]
    pub async fn like_comment(
        &self,
        comment_id: &CommentId,
        post_id: &str,
        delta: i64,
    ) -> Result<u64, CommentError> {
        if comment_id.is_temporary() {
            return Err(CommentError::Pending(comment_id.clone()));
        }

        let apply = |current: Option<&Fields>| {
            let count = current
                .and_then(|f| f.get("count"))
                .and_then(Value::as_u64)
                .unwrap_or(0)
                .saturating_add_signed(delta);
            let mut fields = Fields::new();
            fields.insert("count".into(), json!(count));
            fields
        };

        let fields = self
            .store
            .transact(&self.config.likes_collection, comment_id.as_str(), &apply)
            .await
            .map_err(|e| {
                if e.is_permission_denied() {
                    CommentError::PermissionDenied {
                        comment_id: comment_id.clone(),
                    }
                } else {
                    CommentError::Store(e)
                }
            })?;

        self.cache.invalidate_post(post_id);
        Ok(fields.get("count").and_then(Value::as_u64).unwrap_or(0))
    }

    /// Top-level comment count for a badge, without opening a session.
    pub async fn comment_count(&self, post_id: &str) -> u64 {
        self.counts.get_count(post_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reel_store::{Fault, MemoryStore, Operation, format_timestamp};
    use std::time::Duration;

    fn author(id: &str) -> AuthorProfile {
        AuthorProfile {
            id: id.to_string(),
            display_name: format!("User {}", id),
            avatar_url: None,
        }
    }

    fn setup() -> (Arc<MemoryStore>, CommentRepository) {
        let store = Arc::new(MemoryStore::new());
        let repo = CommentRepository::new(
            store.clone(),
            PageCache::new(Duration::from_secs(300)),
            CommentsConfig::default(),
        );
        (store, repo)
    }

    async fn seed_comment(store: &MemoryStore, id: &str, secs: u32, parent: Option<&str>) {
        let created = chrono::DateTime::from_timestamp(1_767_225_600 + secs as i64, 0).unwrap();
        let fields = json!({
            "postId": "p1",
            "parentCommentId": parent,
            "authorId": "u2",
            "authorDisplayName": "Other",
            "text": format!("comment {}", id),
            "createdAt": format_timestamp(created),
            "replyCount": 0,
        });
        store
            .seed("comments", id, serde_json::from_value(fields).unwrap())
            .await;
    }

    fn ids(comments: &[Comment]) -> Vec<&str> {
        comments.iter().map(|c| c.id.as_str()).collect()
    }

    #[tokio::test]
    async fn pages_newest_first_with_has_more() {
        let (store, repo) = setup();
        for i in 0..5 {
            seed_comment(&store, &format!("c{}", i), i, None).await;
        }

        let first = repo.get_page("p1", 2, None, false).await.unwrap();
        assert_eq!(ids(&first.comments), vec!["c4", "c3"]);
        assert!(first.has_more);
        assert_eq!(first.total_count, 5);

        let second = repo
            .get_page("p1", 2, first.next_cursor.as_ref(), false)
            .await
            .unwrap();
        assert_eq!(ids(&second.comments), vec!["c2", "c1"]);

        let third = repo
            .get_page("p1", 2, second.next_cursor.as_ref(), false)
            .await
            .unwrap();
        assert_eq!(ids(&third.comments), vec!["c0"]);
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn pages_attach_replies_and_likes() {
        let (store, repo) = setup();
        seed_comment(&store, "c1", 1, None).await;
        seed_comment(&store, "r2", 3, Some("c1")).await;
        seed_comment(&store, "r1", 2, Some("c1")).await;
        store
            .seed("comment_like_counts", "c1", serde_json::from_value(json!({ "count": 4 })).unwrap())
            .await;
        store
            .seed("comment_like_counts", "r2", serde_json::from_value(json!({ "count": 1 })).unwrap())
            .await;

        let page = repo.get_page("p1", 20, None, false).await.unwrap();
        assert_eq!(ids(&page.comments), vec!["c1"]);
        let comment = &page.comments[0];
        assert_eq!(comment.like_count, 4);
        assert_eq!(ids(&comment.replies), vec!["r1", "r2"]);
        assert_eq!(comment.replies[0].like_count, 0);
        assert_eq!(comment.replies[1].like_count, 1);
    }

    #[tokio::test]
    async fn failed_like_enrichment_still_returns_page() {
        let (store, repo) = setup();
        seed_comment(&store, "c1", 1, None).await;
        store.fail_next(Operation::GetMany, Fault::Unavailable);

        let page = repo.get_page("p1", 20, None, false).await.unwrap();
        assert_eq!(ids(&page.comments), vec!["c1"]);
        assert_eq!(page.comments[0].like_count, 0);
    }

    #[tokio::test]
    async fn cached_page_served_until_bypassed() {
        let (store, repo) = setup();
        seed_comment(&store, "c1", 1, None).await;

        let cached = repo.get_page("p1", 20, None, false).await.unwrap();
        seed_comment(&store, "c2", 2, None).await;

        let again = repo.get_page("p1", 20, None, false).await.unwrap();
        assert_eq!(again, cached);

        let fresh = repo.get_page("p1", 20, None, true).await.unwrap();
        assert_eq!(ids(&fresh.comments), vec!["c2", "c1"]);

        // The bypassing read refreshed the cached entry.
        let after = repo.get_page("p1", 20, None, false).await.unwrap();
        assert_eq!(after, fresh);
    }

    #[tokio::test]
    async fn add_top_level_increments_count_and_invalidates() {
        let (_store, repo) = setup();
        repo.get_page("p1", 20, None, false).await.unwrap();
        assert_eq!(repo.cache().len(), 1);

        let comment = repo
            .add_comment("p1", "  hello  ", &author("u1"), None)
            .await
            .unwrap();
        assert_eq!(comment.text, "hello");
        assert!(!comment.id.is_temporary());
        assert!(repo.cache().is_empty());
        assert_eq!(repo.comment_count("p1").await, 1);
    }

    #[tokio::test]
    async fn add_reply_bumps_parent_reply_count() {
        let (store, repo) = setup();
        seed_comment(&store, "c1", 1, None).await;

        let reply = repo
            .add_comment("p1", "re", &author("u1"), Some(&CommentId::from("c1")))
            .await
            .unwrap();
        assert_eq!(reply.parent_comment_id, Some(CommentId::from("c1")));

        let parent = store.get("comments", "c1").await.unwrap().unwrap();
        assert_eq!(parent.get_u64("replyCount"), Some(1));
        // Replies don't count toward the post total.
        assert_eq!(repo.comment_count("p1").await, 1);
    }

    #[tokio::test]
    async fn reply_to_missing_parent_is_tolerated() {
        let (_store, repo) = setup();
        let reply = repo
            .add_comment("p1", "re", &author("u1"), Some(&CommentId::from("gone")))
            .await;
        assert!(reply.is_ok());
    }

    #[tokio::test]
    async fn reply_to_reply_rejected() {
        let (store, repo) = setup();
        seed_comment(&store, "c1", 1, None).await;
        seed_comment(&store, "r1", 2, Some("c1")).await;

        let err = repo
            .add_comment("p1", "deep", &author("u1"), Some(&CommentId::from("r1")))
            .await
            .unwrap_err();
        assert!(matches!(err, CommentError::NestedReply { .. }));
    }

    #[tokio::test]
    async fn empty_text_rejected() {
        let (_store, repo) = setup();
        let err = repo.add_comment("p1", "   ", &author("u1"), None).await.unwrap_err();
        assert!(matches!(err, CommentError::EmptyText));
    }

    #[tokio::test]
    async fn delete_removes_replies_and_decrements() {
        let (store, repo) = setup();
        let comment = repo.add_comment("p1", "top", &author("u1"), None).await.unwrap();
        repo.add_comment("p1", "re", &author("u2"), Some(&comment.id))
            .await
            .unwrap();
        repo.add_comment("p1", "other", &author("u2"), None).await.unwrap();
        assert_eq!(repo.comment_count("p1").await, 2);

        repo.delete_comment(&comment.id, "p1").await.unwrap();
        assert_eq!(store.len("comments").await, 1);
        assert_eq!(repo.comment_count("p1").await, 1);
    }

    #[tokio::test]
    async fn delete_reply_decrements_parent_reply_count() {
        let (store, repo) = setup();
        seed_comment(&store, "c1", 1, None).await;
        let reply = repo
            .add_comment("p1", "re", &author("u1"), Some(&CommentId::from("c1")))
            .await
            .unwrap();

        repo.delete_comment(&reply.id, "p1").await.unwrap();
        let parent = store.get("comments", "c1").await.unwrap().unwrap();
        assert_eq!(parent.get_u64("replyCount"), Some(0));
    }

    #[tokio::test]
    async fn delete_missing_is_noop_and_clears_cache() {
        let (_store, repo) = setup();
        repo.get_page("p1", 20, None, false).await.unwrap();
        repo.get_page("p2", 20, None, false).await.unwrap();

        repo.delete_comment(&CommentId::from("gone"), "p1").await.unwrap();
        assert!(repo.cache().is_empty());
    }

    #[tokio::test]
    async fn delete_permission_denied_is_distinct() {
        let (store, repo) = setup();
        seed_comment(&store, "c1", 1, None).await;
        store.fail_next(Operation::Batch, Fault::PermissionDenied);

        let err = repo.delete_comment(&CommentId::from("c1"), "p1").await.unwrap_err();
        assert!(matches!(err, CommentError::PermissionDenied { .. }));
        assert_eq!(store.len("comments").await, 1);
    }

    #[tokio::test]
    async fn likes_floor_at_zero() {
        let (store, repo) = setup();
        seed_comment(&store, "c1", 1, None).await;
        let id = CommentId::from("c1");

        assert_eq!(repo.like_comment(&id, "p1", 1).await.unwrap(), 1);
        assert_eq!(repo.like_comment(&id, "p1", -1).await.unwrap(), 0);
        assert_eq!(repo.like_comment(&id, "p1", -1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn like_temporary_rejected() {
        let (_store, repo) = setup();
        let err = repo
            .like_comment(&CommentId::temporary(), "p1", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CommentError::Pending(_)));
    }

    #[tokio::test]
    async fn subscription_filters_to_post_top_level() {
        let (store, repo) = setup();
        seed_comment(&store, "c1", 1, None).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let added_tx = tx.clone();
        let mut subscription = repo
            .subscribe_to_new_comments(
                "p1",
                Arc::new(move |c: Comment| {
                    let _ = added_tx.send(format!("added {}", c.text));
                }),
                Arc::new(move |id: CommentId| {
                    let _ = tx.send(format!("removed {}", id));
                }),
            )
            .await
            .unwrap();

        repo.add_comment("p2", "elsewhere", &author("u2"), None).await.unwrap();
        repo.add_comment("p1", "reply", &author("u2"), Some(&CommentId::from("c1")))
            .await
            .unwrap();
        let top = repo.add_comment("p1", "top", &author("u2"), None).await.unwrap();
        repo.delete_comment(&top.id, "p1").await.unwrap();

        async fn recv(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> String {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap()
        }
        assert_eq!(recv(&mut rx).await, "added top");
        assert_eq!(recv(&mut rx).await, format!("removed {}", top.id));

        subscription.close();
        assert!(subscription.is_closed());
    }
}
