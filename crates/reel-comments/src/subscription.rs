use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::info;

/// Handle to a realtime comment feed.
///
/// Delivery stops on [`Subscription::close`] or when the handle is dropped.
pub struct Subscription {
    post_id: String,
    closed: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(post_id: String, closed: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self {
            post_id,
            closed,
            task: Some(task),
        }
    }

    /// Stop delivery. Idempotent.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!(post_id = %self.post_id, "comment subscription closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.task.as_ref().is_none_or(|task| task.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
