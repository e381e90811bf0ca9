//! Shared fixtures for session tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reel_comments::{
    AuthorProfile, CommentRepository, CommentSession, CommentsConfig, PageCache, SessionSnapshot,
};
use reel_store::{
    ChangeFeed, Document, DocumentStore, FieldUpdate, Fields, Filter, MemoryStore, Query,
    StoreError, TransactFn, WatchOptions, WriteOp, format_timestamp,
};
use serde_json::json;
use tokio::sync::{Notify, Semaphore};

pub const POST: &str = "p1";

/// Seconds since the epoch of the first seeded comment.
const SEED_EPOCH: i64 = 1_767_225_600;

/// A [`MemoryStore`] whose creates wait for a permit, so optimistic state can be observed.
///
/// Queries pass freely unless [`GatedStore::hold_queries`] was called; held
/// queries run, signal `query_reached`, then wait for a permit before returning.
pub struct GatedStore {
    pub inner: Arc<MemoryStore>,
    pub create_gate: Arc<Semaphore>,
    pub query_gate: Arc<Semaphore>,
    pub query_reached: Arc<Notify>,
}

impl GatedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            create_gate: Arc::new(Semaphore::new(0)),
            query_gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
            query_reached: Arc::new(Notify::new()),
        }
    }

    pub fn hold_queries(mut self) -> Self {
        self.query_gate = Arc::new(Semaphore::new(0));
        self
    }
}

#[async_trait]
impl DocumentStore for GatedStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get(collection, id).await
    }

    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, StoreError> {
        self.inner.get_many(collection, ids).await
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let result = self.inner.query(collection, query).await;
        self.query_reached.notify_one();
        let permit = self
            .query_gate
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable("gate closed".into()))?;
        permit.forget();
        result
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        self.inner.count(collection, filters).await
    }

    async fn create(&self, collection: &str, fields: Fields) -> Result<Document, StoreError> {
        let permit = self
            .create_gate
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable("gate closed".into()))?;
        permit.forget();
        self.inner.create(collection, fields).await
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<Document, StoreError> {
        self.inner.set(collection, id, fields).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        updates: Vec<FieldUpdate>,
    ) -> Result<Document, StoreError> {
        self.inner.update(collection, id, updates).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.inner.delete(collection, id).await
    }

    async fn transact(
        &self,
        collection: &str,
        id: &str,
        apply: TransactFn<'_>,
    ) -> Result<Fields, StoreError> {
        self.inner.transact(collection, id, apply).await
    }

    async fn batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.inner.batch(ops).await
    }

    async fn watch(&self, collection: &str, options: WatchOptions) -> Result<ChangeFeed, StoreError> {
        self.inner.watch(collection, options).await
    }
}

pub fn config(page_size: usize) -> CommentsConfig {
    CommentsConfig {
        page_size,
        delete_settle_ms: 10,
        ..Default::default()
    }
}

pub fn author(id: &str) -> AuthorProfile {
    AuthorProfile {
        id: id.to_string(),
        display_name: format!("User {}", id),
        avatar_url: None,
    }
}

pub fn repository(store: Arc<dyn DocumentStore>, page_size: usize) -> Arc<CommentRepository> {
    Arc::new(CommentRepository::new(
        store,
        PageCache::new(Duration::from_secs(300)),
        config(page_size),
    ))
}

/// Write a top-level comment by `u2` directly, without change events.
pub async fn seed_comment(store: &MemoryStore, id: &str, secs: i64) {
    let created = DateTime::from_timestamp(SEED_EPOCH + secs, 0).unwrap();
    let fields = json!({
        "postId": POST,
        "parentCommentId": null,
        "authorId": "u2",
        "authorDisplayName": "User u2",
        "text": format!("comment {}", id),
        "createdAt": format_timestamp(created),
        "replyCount": 0,
    });
    store
        .seed("comments", id, serde_json::from_value(fields).unwrap())
        .await;
}

/// Seed `n` comments `seed000..`, oldest first.
pub async fn seed_comments(store: &MemoryStore, n: usize) {
    for i in 0..n {
        seed_comment(store, &format!("seed{:03}", i), i as i64).await;
    }
}

/// Poll the session until `pred` holds, failing after two seconds.
pub async fn wait_until<F>(session: &CommentSession, pred: F) -> SessionSnapshot
where
    F: Fn(&SessionSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = session.snapshot().await;
        if pred(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached; last snapshot: {:?}",
            snapshot
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn ids(snapshot: &SessionSnapshot) -> Vec<String> {
    snapshot.comments.iter().map(|c| c.id.to_string()).collect()
}
