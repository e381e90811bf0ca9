//! Denormalized top-level comment counts per post.
//!
//! The counter can drift from the true count; `recompute` and
//! `batch_recompute` repair it from a full scan.

use std::sync::Arc;

use reel_store::{DocumentStore, Fields, Filter, WriteOp};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::CommentError;

const COUNT_FIELD: &str = "count";

/// Counter store for top-level comments.
pub struct CountStore {
    store: Arc<dyn DocumentStore>,
    counts_collection: String,
    comments_collection: String,
}

fn count_fields(count: u64) -> Fields {
    let mut fields = Fields::new();
    fields.insert(COUNT_FIELD.to_string(), json!(count));
    fields
}

fn read_count(fields: Option<&Fields>) -> u64 {
    fields
        .and_then(|f| f.get(COUNT_FIELD))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

impl CountStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        counts_collection: impl Into<String>,
        comments_collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            counts_collection: counts_collection.into(),
            comments_collection: comments_collection.into(),
        }
    }

    fn top_level_filters(post_id: &str) -> [Filter; 2] {
        [
            Filter::eq("postId", post_id),
            Filter::is_null("parentCommentId"),
        ]
    }

    async fn scan(&self, post_id: &str) -> Result<u64, CommentError> {
        Ok(self
            .store
            .count(&self.comments_collection, &Self::top_level_filters(post_id))
            .await?)
    }

    /// Stored counter, or a full scan persisted as the new counter.
    ///
    /// Never fails: a scan error degrades to 0.
    #[tracing::instrument(skip(self))]
    pub async fn get_count(&self, post_id: &str) -> u64 {
        match self.store.get(&self.counts_collection, post_id).await {
            Ok(Some(doc)) => {
                if let Some(count) = doc.get_u64(COUNT_FIELD) {
                    return count;
                }
                warn!(post_id, "counter record has no count field, rescanning");
            }
            Ok(None) => debug!(post_id, "no counter record, scanning"),
            Err(e) => warn!(post_id, error = %e, "failed to read counter, scanning"),
        }

        let count = match self.scan(post_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(post_id, error = %e, "comment count scan failed, reporting 0");
                return 0;
            }
        };

        if let Err(e) = self
            .store
            .set(&self.counts_collection, post_id, count_fields(count))
            .await
        {
            warn!(post_id, error = %e, "failed to persist scanned comment count");
        }
        count
    }

    /// Add one, creating the record at 1 when absent.
    ///
    /// A failed transaction on an existing record is returned as an error.
    #[tracing::instrument(skip(self))]
    pub async fn increment(&self, post_id: &str) -> Result<u64, CommentError> {
        self.adjust(post_id, 1, 1).await
    }

    /// Subtract one, floored at 0.
    #[tracing::instrument(skip(self))]
    pub async fn decrement(&self, post_id: &str) -> Result<u64, CommentError> {
        self.adjust(post_id, -1, 0).await
    }

    async fn adjust(&self, post_id: &str, delta: i64, initial: u64) -> Result<u64, CommentError> {
        let apply = |current: Option<&Fields>| {
            let next = match current {
                Some(_) => read_count(current).saturating_add_signed(delta),
                None => initial,
            };
            count_fields(next)
        };

        match self
            .store
            .transact(&self.counts_collection, post_id, &apply)
            .await
        {
            Ok(fields) => Ok(read_count(Some(&fields))),
            Err(e) => {
                // Only a missing record may be created outright; an existing
                // counter is never overwritten.
                match self.store.get(&self.counts_collection, post_id).await {
                    Ok(None) => {
                        warn!(post_id, delta, error = %e, "counter transaction failed, creating record");
                        self.store
                            .set(&self.counts_collection, post_id, count_fields(initial))
                            .await?;
                        Ok(initial)
                    }
                    Ok(Some(_)) | Err(_) => {
                        warn!(post_id, delta, error = %e, "counter transaction failed");
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Full scan, overwriting the counter.
    #[tracing::instrument(skip(self))]
    pub async fn recompute(&self, post_id: &str) -> Result<u64, CommentError> {
        let count = self.scan(post_id).await?;
        self.store
            .set(&self.counts_collection, post_id, count_fields(count))
            .await?;
        info!(post_id, count, "recomputed comment count");
        Ok(count)
    }

    /// Recompute many posts, writing every counter in one batch.
    #[tracing::instrument(skip(self, post_ids), fields(posts = post_ids.len()))]
    pub async fn batch_recompute(&self, post_ids: &[String]) -> Result<(), CommentError> {
        let mut ops = Vec::with_capacity(post_ids.len());
        for post_id in post_ids {
            let count = self.scan(post_id).await?;
            ops.push(WriteOp::Set {
                collection: self.counts_collection.clone(),
                id: post_id.clone(),
                fields: count_fields(count),
            });
        }

        self.store.batch(ops).await?;
        info!(posts = post_ids.len(), "batch recomputed comment counts");
        Ok(())
    }
}
