//! Process-local document store.
//!
//! Backs tests, the demo command and offline embeddings. Supports fault
//! injection so callers can exercise their degraded paths.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use crate::StoreError;
use crate::store::{DocumentStore, TransactFn};
use crate::types::{
    Change, ChangeFeed, DocId, Document, FieldUpdate, Fields, Filter, OrderBy, Query,
    WatchOptions, WriteOp, compare_values, format_timestamp, is_server_timestamp,
};

/// Store operations that can have a fault injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    GetMany,
    Query,
    Count,
    Create,
    Set,
    Update,
    Delete,
    Transact,
    Batch,
    Watch,
}

/// Failure returned by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    PermissionDenied,
    NotFound,
}

#[derive(Debug, Clone)]
struct StoredDoc {
    fields: Fields,
    version: u64,
}

type Collection = HashMap<String, StoredDoc>;

struct Watcher {
    collection: String,
    options: WatchOptions,
    tx: mpsc::UnboundedSender<Change>,
}

/// In-memory [`DocumentStore`].
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    watchers: Mutex<Vec<Watcher>>,
    faults: Mutex<VecDeque<(Operation, Fault)>>,
    /// Last issued server timestamp in microseconds; keeps stamps strictly increasing.
    clock: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            faults: Mutex::new(VecDeque::new()),
            clock: AtomicI64::new(0),
        }
    }

    /// Make the next call of `operation` fail with `fault`.
    ///
    /// Faults queue up: injecting twice fails the next two calls.
    pub fn fail_next(&self, operation: Operation, fault: Fault) {
        lock(&self.faults).push_back((operation, fault));
    }

    /// Drop every pending injected fault.
    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// Write a document directly, bypassing fault injection and change notification.
    ///
    /// Simulates an out-of-band backend write. Server-timestamp sentinels are still resolved.
    pub async fn seed(&self, collection: &str, id: &str, fields: Fields) {
        let fields = self.resolve(fields);
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        let version = docs.get(id).map(|d| d.version + 1).unwrap_or(1);
        docs.insert(id.to_string(), StoredDoc { fields, version });
    }

    /// Deliver `change` to watchers again without writing anything.
    ///
    /// Simulates the duplicate delivery of an at-least-once change feed.
    pub async fn redeliver(&self, collection: &str, change: Change) {
        let collections = self.collections.read().await;
        let empty = Collection::new();
        let docs = collections.get(collection).unwrap_or(&empty);
        self.notify(collection, docs, change);
    }

    /// Number of documents in a collection.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, collection: &str) -> bool {
        self.len(collection).await == 0
    }

    fn take_fault(&self, operation: Operation, collection: &str, id: &str) -> Result<(), StoreError> {
        let mut faults = lock(&self.faults);
        let Some(pos) = faults.iter().position(|(op, _)| *op == operation) else {
            return Ok(());
        };
        let Some((_, fault)) = faults.remove(pos) else {
            return Ok(());
        };
        debug!(?operation, ?fault, collection, "injected fault");
        Err(match fault {
            Fault::Unavailable => StoreError::Unavailable("injected fault".to_string()),
            Fault::PermissionDenied => StoreError::PermissionDenied("injected fault".to_string()),
            Fault::NotFound => StoreError::not_found(collection, id),
        })
    }

    fn now_timestamp(&self) -> String {
        let now = Utc::now().timestamp_micros();
        let prev = self
            .clock
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        let micros = now.max(prev + 1);
        let at = DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_else(Utc::now);
        format_timestamp(at)
    }

    fn resolve(&self, mut fields: Fields) -> Fields {
        for value in fields.values_mut() {
            if is_server_timestamp(value) {
                *value = Value::String(self.now_timestamp());
            }
        }
        fields
    }

    fn apply_updates(&self, fields: &mut Fields, updates: Vec<FieldUpdate>) {
        for update in updates {
            match update {
                FieldUpdate::Set { field, value } => {
                    let value = if is_server_timestamp(&value) {
                        Value::String(self.now_timestamp())
                    } else {
                        value
                    };
                    fields.insert(field, value);
                }
                FieldUpdate::Increment { field, by } => {
                    let current = fields.get(&field).and_then(Value::as_i64).unwrap_or(0);
                    fields.insert(field, Value::from(current + by));
                }
                FieldUpdate::ServerTimestamp { field } => {
                    fields.insert(field, Value::String(self.now_timestamp()));
                }
            }
        }
    }

    /// Deliver a change to every watcher of `collection`.
    ///
    /// `docs` is the collection state in which the changed document's recency is ranked:
    /// before the write for removals, after it for modifications.
    fn notify(&self, collection: &str, docs: &Collection, change: Change) {
        let mut watchers = lock(&self.watchers);
        watchers.retain(|w| !w.tx.is_closed());

        for watcher in watchers.iter().filter(|w| w.collection == collection) {
            let deliver = match &change {
                Change::Added(_) => true,
                Change::Modified(doc) | Change::Removed(doc) => {
                    newer_count(docs, &watcher.options.order_by, doc) < watcher.options.window
                }
            };
            if deliver {
                let _ = watcher.tx.send(change.clone());
            } else {
                trace!(collection, id = %change.document().id, "change outside recent window");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_document(id: &str, stored: &StoredDoc) -> Document {
    Document {
        id: id.to_string(),
        version: stored.version,
        fields: stored.fields.clone(),
    }
}

fn recency(a_value: &Value, a_id: &str, b_value: &Value, b_id: &str) -> Ordering {
    compare_values(a_value, b_value).then_with(|| a_id.cmp(b_id))
}

/// Number of documents in `docs` strictly more recent than `doc` under `order_field`.
fn newer_count(docs: &Collection, order_field: &str, doc: &Document) -> usize {
    let value = doc.get(order_field).unwrap_or(&Value::Null);
    docs.iter()
        .filter(|(id, stored)| {
            let other = stored.fields.get(order_field).unwrap_or(&Value::Null);
            recency(other, id, value, &doc.id) == Ordering::Greater
        })
        .count()
}

fn sort_documents(docs: &mut [Document], order: &OrderBy) {
    use crate::types::Direction;

    docs.sort_by(|a, b| {
        let ord = recency(
            a.get(&order.field).unwrap_or(&Value::Null),
            &a.id,
            b.get(&order.field).unwrap_or(&Value::Null),
            &b.id,
        );
        match order.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    });
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.take_fault(Operation::Get, collection, id)?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|stored| to_document(id, stored)))
    }

    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, StoreError> {
        self.take_fault(Operation::GetMany, collection, "")?;
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| docs.get(id).map(|stored| to_document(id, stored)))
            .collect())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.take_fault(Operation::Query, collection, "")?;
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<Document> = docs
            .iter()
            .filter(|(_, stored)| query.matches(&stored.fields))
            .map(|(id, stored)| to_document(id, stored))
            .collect();

        let order = query.order_by.clone().unwrap_or(OrderBy {
            field: String::new(),
            direction: crate::types::Direction::Asc,
        });
        sort_documents(&mut matched, &order);

        if let Some(cursor) = &query.start_after {
            matched.retain(|doc| cursor.compare(doc, &order) == Ordering::Greater);
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }

        trace!(collection, results = matched.len(), "query");
        Ok(matched)
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        self.take_fault(Operation::Count, collection, "")?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|stored| filters.iter().all(|f| f.matches(&stored.fields)))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn create(&self, collection: &str, fields: Fields) -> Result<Document, StoreError> {
        self.take_fault(Operation::Create, collection, "")?;
        let id = DocId::now().0;
        let stored = StoredDoc {
            fields: self.resolve(fields),
            version: 1,
        };
        let doc = to_document(&id, &stored);

        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        docs.insert(id, stored);
        self.notify(collection, docs, Change::Added(doc.clone()));

        trace!(collection, id = %doc.id, "created");
        Ok(doc)
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<Document, StoreError> {
        self.take_fault(Operation::Set, collection, id)?;
        let fields = self.resolve(fields);

        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        let previous = docs.get(id).map(|d| d.version);
        let stored = StoredDoc {
            fields,
            version: previous.map(|v| v + 1).unwrap_or(1),
        };
        let doc = to_document(id, &stored);
        docs.insert(id.to_string(), stored);

        let change = match previous {
            Some(_) => Change::Modified(doc.clone()),
            None => Change::Added(doc.clone()),
        };
        self.notify(collection, docs, change);
        Ok(doc)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        updates: Vec<FieldUpdate>,
    ) -> Result<Document, StoreError> {
        self.take_fault(Operation::Update, collection, id)?;

        let mut collections = self.collections.write().await;
        let docs = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        let stored = docs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(collection, id))?;

        self.apply_updates(&mut stored.fields, updates);
        stored.version += 1;
        let doc = to_document(id, stored);

        self.notify(collection, docs, Change::Modified(doc.clone()));
        Ok(doc)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.take_fault(Operation::Delete, collection, id)?;

        let mut collections = self.collections.write().await;
        let docs = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        let stored = docs
            .get(id)
            .ok_or_else(|| StoreError::not_found(collection, id))?;

        let doc = to_document(id, stored);
        self.notify(collection, docs, Change::Removed(doc));
        docs.remove(id);

        trace!(collection, id, "deleted");
        Ok(())
    }

    async fn transact(
        &self,
        collection: &str,
        id: &str,
        apply: TransactFn<'_>,
    ) -> Result<Fields, StoreError> {
        self.take_fault(Operation::Transact, collection, id)?;

        // The write lock is held across read and write, so the transaction never contends.
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        let current = docs.get(id);
        let previous = current.map(|d| d.version);

        let fields = self.resolve(apply(current.map(|d| &d.fields)));
        let stored = StoredDoc {
            fields: fields.clone(),
            version: previous.map(|v| v + 1).unwrap_or(1),
        };
        let doc = to_document(id, &stored);
        docs.insert(id.to_string(), stored);

        let change = match previous {
            Some(_) => Change::Modified(doc),
            None => Change::Added(doc),
        };
        self.notify(collection, docs, change);
        Ok(fields)
    }

    async fn batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.take_fault(Operation::Batch, "", "")?;

        let mut collections = self.collections.write().await;

        // Stage every touched collection so a failing op leaves the store untouched.
        let mut staged: HashMap<String, Collection> = HashMap::new();
        let mut changes: Vec<(String, Change, Option<Collection>)> = Vec::new();

        for op in ops {
            let name = match &op {
                WriteOp::Set { collection, .. }
                | WriteOp::Update { collection, .. }
                | WriteOp::Delete { collection, .. } => collection.clone(),
            };
            let docs = staged
                .entry(name.clone())
                .or_insert_with(|| collections.get(&name).cloned().unwrap_or_default());

            match op {
                WriteOp::Set { id, fields, .. } => {
                    let previous = docs.get(&id).map(|d| d.version);
                    let stored = StoredDoc {
                        fields: self.resolve(fields),
                        version: previous.map(|v| v + 1).unwrap_or(1),
                    };
                    let doc = to_document(&id, &stored);
                    docs.insert(id, stored);
                    let change = match previous {
                        Some(_) => Change::Modified(doc),
                        None => Change::Added(doc),
                    };
                    changes.push((name, change, None));
                }
                WriteOp::Update { id, updates, .. } => {
                    let stored = docs
                        .get_mut(&id)
                        .ok_or_else(|| StoreError::not_found(&name, &id))?;
                    self.apply_updates(&mut stored.fields, updates);
                    stored.version += 1;
                    let doc = to_document(&id, stored);
                    changes.push((name, Change::Modified(doc), None));
                }
                WriteOp::Delete { id, .. } => {
                    let before = docs.clone();
                    let stored = docs
                        .remove(&id)
                        .ok_or_else(|| StoreError::not_found(&name, &id))?;
                    let doc = to_document(&id, &stored);
                    changes.push((name, Change::Removed(doc), Some(before)));
                }
            }
        }

        let committed = changes.len();
        for (name, docs) in staged {
            collections.insert(name, docs);
        }
        for (name, change, before) in changes {
            match before {
                Some(before) => self.notify(&name, &before, change),
                None => {
                    let empty = Collection::new();
                    let docs = collections.get(&name).unwrap_or(&empty);
                    self.notify(&name, docs, change);
                }
            }
        }

        debug!(ops = committed, "batch committed");
        Ok(())
    }

    async fn watch(&self, collection: &str, options: WatchOptions) -> Result<ChangeFeed, StoreError> {
        self.take_fault(Operation::Watch, collection, "")?;

        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.watchers).push(Watcher {
            collection: collection.to_string(),
            options,
            tx,
        });

        debug!(collection, "watch started");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, server_timestamp};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn seeded_comments(store: &MemoryStore, n: usize) {
        for i in 0..n {
            store
                .seed(
                    "comments",
                    &format!("c{:02}", i),
                    fields(json!({
                        "postId": "p1",
                        "createdAt": format!("2026-01-01T00:00:{:02}.000000Z", i),
                    })),
                )
                .await;
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_resolves_timestamp() {
        let store = MemoryStore::new();
        let doc = store
            .create("comments", fields(json!({ "text": "hi", "createdAt": server_timestamp() })))
            .await
            .unwrap();

        assert_eq!(doc.id.len(), 13);
        assert!(doc.get_str("createdAt").unwrap().ends_with('Z'));
        assert_eq!(store.get("comments", &doc.id).await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn test_server_timestamps_strictly_increase() {
        let store = MemoryStore::new();
        let mut last = String::new();
        for _ in 0..50 {
            let doc = store
                .create("comments", fields(json!({ "createdAt": server_timestamp() })))
                .await
                .unwrap();
            let stamp = doc.get_str("createdAt").unwrap().to_string();
            assert!(stamp > last);
            last = stamp;
        }
    }

    #[tokio::test]
    async fn test_query_orders_and_resumes_after_cursor() {
        let store = MemoryStore::new();
        seeded_comments(&store, 5).await;

        let query = Query::new()
            .filter(Filter::eq("postId", "p1"))
            .order_by("createdAt", Direction::Desc)
            .limit(2);
        let first = store.query("comments", &query).await.unwrap();
        let ids: Vec<_> = first.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c04", "c03"]);

        let cursor = crate::Cursor::from_document(first.last().unwrap(), "createdAt");
        let second = store
            .query("comments", &query.clone().start_after(Some(cursor)))
            .await
            .unwrap();
        let ids: Vec<_> = second.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c02", "c01"]);
    }

    #[tokio::test]
    async fn test_count_with_null_filter() {
        let store = MemoryStore::new();
        seeded_comments(&store, 3).await;
        store
            .seed("comments", "r1", fields(json!({ "postId": "p1", "parentCommentId": "c00" })))
            .await;

        let top_level = store
            .count(
                "comments",
                &[Filter::eq("postId", "p1"), Filter::is_null("parentCommentId")],
            )
            .await
            .unwrap();
        assert_eq!(top_level, 3);
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_fail_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update("comments", "nope", vec![FieldUpdate::increment("replyCount", 1)])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.delete("comments", "nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_increment_update() {
        let store = MemoryStore::new();
        store.seed("comments", "c1", fields(json!({ "replyCount": 2 }))).await;
        let doc = store
            .update("comments", "c1", vec![FieldUpdate::increment("replyCount", -1)])
            .await
            .unwrap();
        assert_eq!(doc.get_u64("replyCount"), Some(1));
    }

    #[tokio::test]
    async fn test_transact_creates_and_modifies() {
        let store = MemoryStore::new();
        let bump = |current: Option<&Fields>| {
            let count = current
                .and_then(|f| f.get("count"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            fields(json!({ "count": count + 1 }))
        };

        store.transact("counts", "p1", &bump).await.unwrap();
        let result = store.transact("counts", "p1", &bump).await.unwrap();
        assert_eq!(result.get("count"), Some(&json!(2)));

        let doc = store.get("counts", "p1").await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        seeded_comments(&store, 2).await;

        let result = store
            .batch(vec![
                WriteOp::Delete {
                    collection: "comments".into(),
                    id: "c00".into(),
                },
                WriteOp::Delete {
                    collection: "comments".into(),
                    id: "missing".into(),
                },
            ])
            .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(store.len("comments").await, 2);

        store
            .batch(vec![
                WriteOp::Delete {
                    collection: "comments".into(),
                    id: "c00".into(),
                },
                WriteOp::Set {
                    collection: "counts".into(),
                    id: "p1".into(),
                    fields: fields(json!({ "count": 1 })),
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.len("comments").await, 1);
        assert_eq!(store.len("counts").await, 1);
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next(Operation::Get, Fault::Unavailable);

        let err = store.get("comments", "c1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.get("comments", "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fault_only_hits_matching_operation() {
        let store = MemoryStore::new();
        store.fail_next(Operation::Create, Fault::PermissionDenied);

        assert!(store.query("comments", &Query::new()).await.is_ok());
        let err = store.create("comments", Fields::new()).await.unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn test_watch_delivers_additions_and_recent_removals() {
        let store = MemoryStore::new();
        seeded_comments(&store, 5).await;

        let mut feed = store
            .watch(
                "comments",
                WatchOptions {
                    window: 2,
                    order_by: "createdAt".into(),
                },
            )
            .await
            .unwrap();

        // c00 is the oldest of five, outside a window of two.
        store.delete("comments", "c00").await.unwrap();
        store.delete("comments", "c04").await.unwrap();
        let created = store
            .create("comments", fields(json!({ "createdAt": server_timestamp() })))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, Change::Removed(to_document_for_test("c04")));

        let second = tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second, Change::Added(doc) if doc.id == created.id));
    }

    fn to_document_for_test(id: &str) -> Document {
        let i: usize = id[1..].parse().unwrap();
        Document {
            id: id.to_string(),
            version: 1,
            fields: fields(json!({
                "postId": "p1",
                "createdAt": format!("2026-01-01T00:00:{:02}.000000Z", i),
            })),
        }
    }
}
