//! HTTP client for a JSON document API.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use futures_util::StreamExt;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::StoreError;
use crate::feed::FeedClient;
use crate::store::{DocumentStore, TransactFn};
use crate::types::{
    ChangeFeed, Document, FieldUpdate, Fields, Filter, Query, WatchOptions, WriteOp,
};

/// Upper bound on how long a contended transaction keeps retrying.
const TRANSACT_MAX_ELAPSED: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct DocumentsResponse {
    documents: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PutRequest<'a> {
    fields: &'a Fields,
    /// Expected current version; 0 means the document must not exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    if_version: Option<u64>,
}

/// [`DocumentStore`] backed by a remote JSON API.
pub struct RestStore {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl RestStore {
    /// Create a client for the API at `base_url`, authenticating with an optional bearer token.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, StoreError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/v1/{}", self.base_url, collection)
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/v1/{}/{}", self.base_url, collection, id)
    }

    /// WebSocket URL of a collection's change feed.
    fn watch_url(&self, collection: &str, options: &WatchOptions) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!(
            "{}/v1/{}:watch?window={}&orderBy={}",
            ws_base, collection, options.window, options.order_by
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Rate limits are surfaced to the caller rather than retried here.
    fn is_retryable(err: &StoreError) -> bool {
        err.is_transient() && !matches!(err, StoreError::RateLimited { .. })
    }

    /// Send a request, retrying transient failures with exponential backoff.
    ///
    /// `collection` and `id` name the target in `NotFound`/`Conflict` errors.
    async fn send<T: DeserializeOwned>(
        &self,
        op: &str,
        collection: &str,
        id: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<T, StoreError> {
        // Retry up to 4 times: initial + 3 retries with backoff
        let mut last_error = None;
        for attempt in 0..4 {
            let result = match build().send().await {
                Ok(response) => Self::handle_response(response, collection, id).await,
                Err(e) => Err(StoreError::from(e)),
            };

            match result {
                Ok(v) => return Ok(v),
                Err(ref e) if Self::is_retryable(e) && attempt < 3 => {
                    let backoff_ms = 500 * (1 << attempt); // 500ms, 1s, 2s
                    debug!(
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "transient error in {}, retrying",
                        op
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    last_error = Some(result);
                    continue;
                }
                Err(_) => return result,
            }
        }

        last_error.unwrap_or_else(|| Err(StoreError::InvalidResponse("retry exhausted".into())))
    }

    /// Map status codes to errors and parse the JSON body. An empty body parses as `null`.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
        collection: &str,
        id: &str,
    ) -> Result<T, StoreError> {
        let status = response.status();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse().ok());
                return Err(StoreError::RateLimited { retry_after_secs });
            }
            StatusCode::NOT_FOUND => return Err(StoreError::not_found(collection, id)),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                return Err(StoreError::Conflict {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            _ => {}
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    StoreError::PermissionDenied(format!("{} ({})", text, status))
                }
                s if s.is_server_error() => {
                    StoreError::Unavailable(format!("request failed ({}): {}", status, text))
                }
                _ => StoreError::InvalidResponse(format!("request failed ({}): {}", status, text)),
            });
        }

        let text = response.text().await?;
        let body = if text.trim().is_empty() { "null" } else { &text };
        Ok(serde_json::from_str(body)?)
    }

    async fn try_transact(
        &self,
        collection: &str,
        id: &str,
        apply: TransactFn<'_>,
    ) -> Result<Fields, StoreError> {
        let current = self.get(collection, id).await?;
        let expected = current.as_ref().map(|d| d.version).unwrap_or(0);
        let fields = apply(current.as_ref().map(|d| &d.fields));

        let url = self.document_url(collection, id);
        let written: Document = self
            .send("transact", collection, id, || {
                self.request(Method::PUT, &url).json(&PutRequest {
                    fields: &fields,
                    if_version: Some(expected),
                })
            })
            .await?;
        Ok(written.fields)
    }
}

#[async_trait]
impl DocumentStore for RestStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let url = self.document_url(collection, id);
        match self
            .send::<Document>("get", collection, id, || self.request(Method::GET, &url))
            .await
        {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}:batchGet", self.collection_url(collection));
        let body = json!({ "ids": ids });
        let response: DocumentsResponse = self
            .send("get_many", collection, "", || {
                self.request(Method::POST, &url).json(&body)
            })
            .await?;
        Ok(response.documents)
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let url = format!("{}:query", self.collection_url(collection));
        let response: DocumentsResponse = self
            .send("query", collection, "", || {
                self.request(Method::POST, &url).json(query)
            })
            .await?;
        Ok(response.documents)
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        let url = format!("{}:count", self.collection_url(collection));
        let body = json!({ "filters": filters });
        let response: CountResponse = self
            .send("count", collection, "", || {
                self.request(Method::POST, &url).json(&body)
            })
            .await?;
        Ok(response.count)
    }

    async fn create(&self, collection: &str, fields: Fields) -> Result<Document, StoreError> {
        let url = self.collection_url(collection);
        let body = json!({ "fields": fields });
        self.send("create", collection, "", || {
            self.request(Method::POST, &url).json(&body)
        })
        .await
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<Document, StoreError> {
        let url = self.document_url(collection, id);
        self.send("set", collection, id, || {
            self.request(Method::PUT, &url).json(&PutRequest {
                fields: &fields,
                if_version: None,
            })
        })
        .await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        updates: Vec<FieldUpdate>,
    ) -> Result<Document, StoreError> {
        let url = self.document_url(collection, id);
        let body = json!({ "updates": updates });
        self.send("update", collection, id, || {
            self.request(Method::PATCH, &url).json(&body)
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let url = self.document_url(collection, id);
        self.send("delete", collection, id, || self.request(Method::DELETE, &url))
            .await
    }

    async fn transact(
        &self,
        collection: &str,
        id: &str,
        apply: TransactFn<'_>,
    ) -> Result<Fields, StoreError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(TRANSACT_MAX_ELAPSED))
            .build();

        backoff::future::retry(policy, || async move {
            match self.try_transact(collection, id, apply).await {
                Ok(fields) => Ok(fields),
                Err(e @ StoreError::Conflict { .. }) => {
                    debug!(collection, id, "transaction contended, retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let url = format!("{}/v1:commit", self.base_url);
        let body = json!({ "writes": ops });
        // The target of a failed write is reported in the response body, not known up front.
        self.send::<serde_json::Value>("batch", "batch", "", || {
            self.request(Method::POST, &url).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn watch(&self, collection: &str, options: WatchOptions) -> Result<ChangeFeed, StoreError> {
        let url = self.watch_url(collection, &options);
        let client = FeedClient::new(url, self.token.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let collection = collection.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.run(tx).await {
                warn!(collection = %collection, error = %e, "change feed stopped");
            }
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
