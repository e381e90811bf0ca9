//! WebSocket change-feed client.
//!
//! Connects to a collection's `:watch` endpoint and forwards JSON change
//! events to a channel, reconnecting with exponential backoff until the
//! receiving side goes away.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, error, info, trace, warn};

use crate::StoreError;
use crate::types::Change;

const READ_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_BACKOFF_SECS: u64 = 60;

/// Parse a single change message. Unknown or malformed messages yield `None`.
pub fn parse_message(text: &str) -> Option<Change> {
    match serde_json::from_str::<Change>(text) {
        Ok(change) => Some(change),
        Err(e) => {
            trace!(error = %e, "ignoring unparseable feed message");
            None
        }
    }
}

/// Change-feed connection to a single `:watch` URL.
pub struct FeedClient {
    url: String,
    token: Option<String>,
}

impl FeedClient {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }

    /// Receive changes until `tx` is closed.
    ///
    /// Runs in a reconnection loop with exponential backoff.
    pub async fn run(&self, tx: mpsc::UnboundedSender<Change>) -> Result<(), StoreError> {
        let mut backoff_secs = 1u64;

        loop {
            if tx.is_closed() {
                debug!(url = %self.url, "feed receiver dropped, stopping");
                return Ok(());
            }

            info!(url = %self.url, "connecting to change feed");

            match self.connect_and_process(&tx, &mut backoff_secs).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(error = %e, "change feed connection error, reconnecting");

                    let wait = Duration::from_secs(backoff_secs);
                    tokio::select! {
                        _ = tx.closed() => return Ok(()),
                        _ = tokio::time::sleep(wait) => {}
                    }

                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    async fn connect_and_process(
        &self,
        tx: &mpsc::UnboundedSender<Change>,
        backoff_secs: &mut u64,
    ) -> Result<(), StoreError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| StoreError::WebSocket(format!("invalid feed url: {}", e)))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| StoreError::WebSocket(format!("invalid token: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| StoreError::WebSocket(format!("connection failed: {}", e)))?;

        let (_, mut read) = ws_stream.split();

        info!("change feed connected");
        *backoff_secs = 1;

        loop {
            tokio::select! {
                biased;

                _ = tx.closed() => {
                    debug!("change feed receiver dropped, closing connection");
                    return Ok(());
                }

                result = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                    match result {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Some(change) = parse_message(&text) {
                                if tx.send(change).is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Ok(Some(Ok(Message::Ping(_)))) => {
                            // tungstenite auto-responds to pings
                            trace!("received ping");
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            info!("change feed closed by server");
                            return Err(StoreError::WebSocket("connection closed".to_string()));
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return Err(StoreError::WebSocket(format!("read error: {}", e)));
                        }
                        Ok(None) => {
                            return Err(StoreError::WebSocket("stream ended".to_string()));
                        }
                        Err(_) => {
                            warn!("change feed read timeout after {}s", READ_TIMEOUT.as_secs());
                            return Err(StoreError::WebSocket("read timeout".to_string()));
                        }
                    }
                }
            }
        }
    }
}
