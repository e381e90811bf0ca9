//! Core types for documents, queries and change events.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::StoreError;

/// Field map of a document.
pub type Fields = serde_json::Map<String, Value>;

/// Key of the sentinel object that asks the backend to stamp a field with its own clock.
pub const SERVER_TIMESTAMP_KEY: &str = "$serverTimestamp";

/// Global counter for the clock identifier bits of generated ids.
static DOC_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A time-sortable document id.
///
/// 13 characters of base32-sortable encoding:
/// - 53 bits of microsecond timestamp
/// - 10 bits of clock identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(pub String);

impl DocId {
    /// Generate a new id from the current time.
    pub fn now() -> Self {
        let micros = Utc::now().timestamp_micros().max(0) as u64;

        // Counter wraps at 1024 (10 bits).
        let clock_id = DOC_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed) & 0x3FF;

        Self::from_u64((micros << 10) | clock_id)
    }

    fn from_u64(val: u64) -> Self {
        const CHARSET: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";
        let mut id = String::with_capacity(13);

        let mut v = val;
        for _ in 0..13 {
            id.push(CHARSET[(v & 0x1f) as usize] as char);
            v >>= 5;
        }

        Self(id.chars().rev().collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sentinel value replaced by the backend's clock at write time.
pub fn server_timestamp() -> Value {
    json!({ SERVER_TIMESTAMP_KEY: true })
}

/// Check whether a value is the server-timestamp sentinel.
pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.len() == 1 && map.contains_key(SERVER_TIMESTAMP_KEY))
}

/// Canonical wire format for timestamps.
///
/// Fixed-width RFC 3339 in UTC so lexical order matches chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Monotonic per-document version, used for write preconditions.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            version: 0,
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn get_u64(&self, field: &str) -> Option<u64> {
        self.fields.get(field).and_then(Value::as_u64)
    }

    /// Deserialize the field map into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

/// Equality filter on a single field.
///
/// A `null` value matches documents where the field is null or absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: Value::Null,
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        match (fields.get(&self.field), &self.value) {
            (None, Value::Null) => true,
            (Some(actual), expected) => actual == expected,
            (None, _) => false,
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// Order-by clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Opaque pagination token referencing the last item of a page.
///
/// Carries the order-field value and the document id so ties resolve deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub value: Value,
    pub id: String,
}

impl Cursor {
    /// Build a cursor pointing at `doc` for a query ordered by `order_field`.
    pub fn from_document(doc: &Document, order_field: &str) -> Self {
        Self {
            value: doc.get(order_field).cloned().unwrap_or(Value::Null),
            id: doc.id.clone(),
        }
    }

    /// Encode as an opaque, URL-safe token.
    pub fn token(&self) -> String {
        // Serializing a Value/String pair cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn from_token(token: &str) -> Result<Self, StoreError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| StoreError::InvalidCursor(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::InvalidCursor(e.to_string()))
    }

    /// Position of `doc` relative to this cursor under `order`.
    ///
    /// `Greater` means the document sorts after the cursor.
    pub fn compare(&self, doc: &Document, order: &OrderBy) -> Ordering {
        let doc_value = doc.get(&order.field).unwrap_or(&Value::Null);
        let ord = compare_values(doc_value, &self.value).then_with(|| doc.id.cmp(&self.id));
        match order.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }
}

/// A filtered, ordered, optionally resumed and bounded query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_after: Option<Cursor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.filters.iter().all(|f| f.matches(fields))
    }
}

/// Total order over JSON values used for sorting: null < bool < number < string < other.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// A single field mutation for partial updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FieldUpdate {
    Set { field: String, value: Value },
    Increment { field: String, by: i64 },
    ServerTimestamp { field: String },
}

impl FieldUpdate {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Set {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn increment(field: impl Into<String>, by: i64) -> Self {
        Self::Increment {
            field: field.into(),
            by,
        }
    }
}

/// A single write operation for atomic batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WriteOp {
    Set {
        collection: String,
        id: String,
        fields: Fields,
    },
    Update {
        collection: String,
        id: String,
        updates: Vec<FieldUpdate>,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// A realtime change delivered by a collection watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "document", rename_all = "lowercase")]
pub enum Change {
    Added(Document),
    Modified(Document),
    Removed(Document),
}

impl Change {
    pub fn document(&self) -> &Document {
        match self {
            Change::Added(doc) | Change::Modified(doc) | Change::Removed(doc) => doc,
        }
    }
}

/// Stream of changes returned by a collection watch. Dropping it ends the subscription.
pub type ChangeFeed = futures_util::stream::BoxStream<'static, Change>;

/// Options for a collection watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchOptions {
    /// Number of most recent documents whose removals and modifications are observed.
    pub window: usize,
    /// Field that defines recency.
    pub order_by: String,
}
