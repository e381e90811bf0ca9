//! Per-post comment controller.
//!
//! Merges paginated reads, optimistic local writes and realtime deltas into
//! one ordered list. Pending entries always render first. Realtime and
//! paginated results are reconciled by id only.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use reel_store::Cursor;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::fallback::placeholder_comments;
use crate::{
    AuthorProfile, Comment, CommentError, CommentId, CommentPage, CommentRepository, Subscription,
};

pub const ADD_FAILED: &str = "Failed to post comment. Please try again.";
pub const DELETE_UNAUTHORIZED: &str = "You are not authorized to delete this comment.";
pub const DELETE_FAILED: &str = "Failed to delete comment. Please try again.";
pub const LOAD_FAILED: &str = "Failed to load comments. Pull to refresh.";
pub const LIKE_FAILED: &str = "Failed to update like. Please try again.";

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    /// More pages may exist.
    Loaded,
    /// Every page has been loaded.
    Exhausted,
    /// Initial load failed; showing placeholders.
    Degraded,
    Closed,
}

/// Point-in-time view of a session for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Top-level comments in display order, replies nested.
    pub comments: Vec<Comment>,
    pub loading: bool,
    pub loading_more: bool,
    pub has_more: bool,
    pub total_count: u64,
    pub error: Option<String>,
    /// Set while `comments` holds placeholder data.
    pub degraded: bool,
    pub phase: SessionPhase,
}

#[derive(Debug, Clone)]
enum Entry {
    /// Written locally, not yet confirmed. Carries a temporary id.
    Pending(Comment),
    Confirmed(Comment),
    Placeholder(Comment),
}

impl Entry {
    fn comment(&self) -> &Comment {
        match self {
            Entry::Pending(c) | Entry::Confirmed(c) | Entry::Placeholder(c) => c,
        }
    }

    fn comment_mut(&mut self) -> &mut Comment {
        match self {
            Entry::Pending(c) | Entry::Confirmed(c) | Entry::Placeholder(c) => c,
        }
    }

    fn id(&self) -> &CommentId {
        &self.comment().id
    }

    fn is_pending(&self) -> bool {
        matches!(self, Entry::Pending(_))
    }
}

#[derive(Debug, Clone)]
struct Thread {
    entry: Entry,
    replies: Vec<Entry>,
}

impl Thread {
    fn confirmed(mut comment: Comment) -> Self {
        let replies = std::mem::take(&mut comment.replies)
            .into_iter()
            .map(Entry::Confirmed)
            .collect();
        Self {
            entry: Entry::Confirmed(comment),
            replies,
        }
    }

    fn render(&self) -> Comment {
        let mut comment = self.entry.comment().clone();
        comment.replies = self.replies.iter().map(|r| r.comment().clone()).collect();
        comment
    }
}

enum RealtimeEvent {
    Added(Comment),
    Removed(CommentId),
}

struct SessionState {
    /// Pending threads lead; everything after them is in backend order.
    threads: Vec<Thread>,
    cursor: Option<Cursor>,
    has_more: bool,
    total_count: u64,
    loading: bool,
    loading_more: bool,
    error: Option<String>,
    phase: SessionPhase,
    /// Bumped whenever the list is replaced, so stale page results are dropped.
    generation: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            threads: Vec::new(),
            cursor: None,
            has_more: false,
            total_count: 0,
            loading: false,
            loading_more: false,
            error: None,
            phase: SessionPhase::Idle,
            generation: 0,
        }
    }

    fn closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    fn degraded(&self) -> bool {
        self.phase == SessionPhase::Degraded
    }

    /// Index just past the last pending thread.
    fn after_pending(&self) -> usize {
        self.threads
            .iter()
            .rposition(|t| t.entry.is_pending())
            .map_or(0, |idx| idx + 1)
    }

    fn contains(&self, id: &CommentId) -> bool {
        self.find(id).is_some()
    }

    fn find(&self, id: &CommentId) -> Option<&Entry> {
        self.threads.iter().find_map(|t| {
            if t.entry.id() == id {
                Some(&t.entry)
            } else {
                t.replies.iter().find(|r| r.id() == id)
            }
        })
    }

    fn find_mut(&mut self, id: &CommentId) -> Option<&mut Entry> {
        self.threads.iter_mut().find_map(|t| {
            if t.entry.id() == id {
                Some(&mut t.entry)
            } else {
                t.replies.iter_mut().find(|r| r.id() == id)
            }
        })
    }

    fn remove(&mut self, id: &CommentId) -> Option<Entry> {
        if let Some(idx) = self.threads.iter().position(|t| t.entry.id() == id) {
            return Some(self.threads.remove(idx).entry);
        }
        for thread in &mut self.threads {
            if let Some(idx) = thread.replies.iter().position(|r| r.id() == id) {
                return Some(thread.replies.remove(idx));
            }
        }
        None
    }

    fn phase_for(has_more: bool) -> SessionPhase {
        if has_more {
            SessionPhase::Loaded
        } else {
            SessionPhase::Exhausted
        }
    }

    /// Replace the list with a first page, keeping pending entries.
    fn replace(&mut self, page: CommentPage) {
        let mut pending_threads = Vec::new();
        let mut pending_replies: Vec<(CommentId, Entry)> = Vec::new();
        for thread in self.threads.drain(..) {
            if thread.entry.is_pending() {
                pending_threads.push(thread);
                continue;
            }
            let parent = thread.entry.id().clone();
            pending_replies.extend(
                thread
                    .replies
                    .into_iter()
                    .filter(Entry::is_pending)
                    .map(|r| (parent.clone(), r)),
            );
        }

        self.threads = pending_threads;
        self.threads
            .extend(page.comments.into_iter().map(Thread::confirmed));
        for (parent, reply) in pending_replies {
            if let Some(thread) = self.threads.iter_mut().find(|t| t.entry.id() == &parent) {
                thread.replies.push(reply);
            }
        }

        self.cursor = page.next_cursor;
        self.has_more = page.has_more;
        self.total_count = page.total_count;
        self.phase = Self::phase_for(page.has_more);
        self.error = None;
        self.generation += 1;
    }

    /// Append a following page, skipping ids already shown.
    fn append(&mut self, page: CommentPage) {
        for comment in page.comments {
            if self.contains(&comment.id) {
                trace!(comment_id = %comment.id, "skipping duplicate from next page");
                continue;
            }
            self.threads.push(Thread::confirmed(comment));
        }
        if page.next_cursor.is_some() {
            self.cursor = page.next_cursor;
        }
        self.has_more = page.has_more;
        self.total_count = page.total_count;
        self.phase = Self::phase_for(page.has_more);
        self.error = None;
    }

    fn degrade(&mut self, post_id: &str) {
        self.threads = placeholder_comments(post_id)
            .into_iter()
            .map(|comment| Thread {
                entry: Entry::Placeholder(comment),
                replies: Vec::new(),
            })
            .collect();
        self.cursor = None;
        self.has_more = false;
        self.total_count = 0;
        self.phase = SessionPhase::Degraded;
        self.generation += 1;
    }

    /// Swap a pending entry for its confirmed comment, in place.
    ///
    /// Returns false when the confirmed id was already shown and the pending
    /// entry was dropped instead.
    fn confirm(&mut self, temp_id: &CommentId, comment: Comment) -> bool {
        if self.contains(&comment.id) {
            self.remove(temp_id);
            return false;
        }
        let parent = comment.parent_comment_id.clone();
        match self.find_mut(temp_id) {
            Some(entry) => *entry = Entry::Confirmed(comment),
            None => return false,
        }
        if let Some(parent) = parent {
            if let Some(entry) = self.find_mut(&parent) {
                entry.comment_mut().reply_count += 1;
            }
        }
        true
    }

    /// Apply one realtime change. Returns true when a comment was inserted.
    fn apply_realtime(&mut self, event: RealtimeEvent, actor_id: Option<&str>) -> bool {
        if self.degraded() {
            trace!("ignoring realtime change while showing placeholders");
            return false;
        }
        match event {
            RealtimeEvent::Added(comment) => {
                if actor_id == Some(comment.author_id.as_str()) {
                    trace!(comment_id = %comment.id, "ignoring own realtime comment");
                    return false;
                }
                if self.contains(&comment.id) {
                    trace!(comment_id = %comment.id, "ignoring duplicate realtime comment");
                    return false;
                }
                let at = self.after_pending();
                self.threads.insert(at, Thread::confirmed(comment));
                self.total_count += 1;
                true
            }
            RealtimeEvent::Removed(id) => {
                if let Some(idx) = self
                    .threads
                    .iter()
                    .position(|t| t.entry.id() == &id && !t.entry.is_pending())
                {
                    self.threads.remove(idx);
                    self.total_count = self.total_count.saturating_sub(1);
                }
                false
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            comments: self.threads.iter().map(Thread::render).collect(),
            loading: self.loading,
            loading_more: self.loading_more,
            has_more: self.has_more,
            total_count: self.total_count,
            error: self.error.clone(),
            degraded: self.degraded(),
            phase: self.phase,
        }
    }
}

struct Realtime {
    subscription: Subscription,
    applier: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The object a UI surface talks to for one post's comment thread.
pub struct CommentSession {
    repo: Arc<CommentRepository>,
    post_id: String,
    actor: Option<AuthorProfile>,
    state: Arc<RwLock<SessionState>>,
    realtime: Mutex<Option<Realtime>>,
}

impl CommentSession {
    /// Load the first page and start realtime delivery.
    ///
    /// `actor` is the signed-in user; without one the session is read-only.
    pub async fn open(
        repo: Arc<CommentRepository>,
        post_id: impl Into<String>,
        actor: Option<AuthorProfile>,
    ) -> Self {
        let session = Self {
            repo,
            post_id: post_id.into(),
            actor,
            state: Arc::new(RwLock::new(SessionState::new())),
            realtime: Mutex::new(None),
        };

        // Subscribe first so comments written while the first page loads
        // are queued, then deduplicated against the page.
        let events = session.subscribe().await;
        session.initial_load().await;
        if let Some((subscription, rx)) = events {
            session.start_applier(subscription, rx).await;
        }
        info!(post_id = %session.post_id, "comment session opened");
        session
    }

    pub fn post_id(&self) -> &str {
        &self.post_id
    }

    async fn initial_load(&self) {
        self.state.write().await.loading = true;

        let page_size = self.repo.config().page_size;
        let result = self.repo.get_page(&self.post_id, page_size, None, false).await;

        let mut state = self.state.write().await;
        state.loading = false;
        match result {
            Ok(page) => state.replace(page),
            Err(e) => {
                warn!(post_id = %self.post_id, error = %e, "initial comment load failed, showing placeholders");
                state.degrade(&self.post_id);
            }
        }
    }

    async fn subscribe(&self) -> Option<(Subscription, mpsc::UnboundedReceiver<RealtimeEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let removed_tx = tx.clone();

        match self
            .repo
            .subscribe_to_new_comments(
                &self.post_id,
                Arc::new(move |comment| {
                    let _ = tx.send(RealtimeEvent::Added(comment));
                }),
                Arc::new(move |id| {
                    let _ = removed_tx.send(RealtimeEvent::Removed(id));
                }),
            )
            .await
        {
            Ok(subscription) => Some((subscription, rx)),
            Err(e) => {
                warn!(post_id = %self.post_id, error = %e, "realtime unavailable for comment session");
                None
            }
        }
    }

    /// Apply the changes queued during the initial load, then keep applying.
    async fn start_applier(
        &self,
        subscription: Subscription,
        mut rx: mpsc::UnboundedReceiver<RealtimeEvent>,
    ) {
        let actor_id = self.actor.as_ref().map(|a| a.id.clone());

        let inserted = {
            let mut state = self.state.write().await;
            let mut inserted = false;
            while let Ok(event) = rx.try_recv() {
                inserted |= state.apply_realtime(event, actor_id.as_deref());
            }
            inserted
        };
        if inserted {
            // The first page's total may already include queued comments.
            let count = self.repo.comment_count(&self.post_id).await;
            let mut state = self.state.write().await;
            if !state.degraded() {
                state.total_count = count;
            }
        }

        let state = self.state.clone();
        let applier = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut state = state.write().await;
                if state.closed() {
                    break;
                }
                state.apply_realtime(event, actor_id.as_deref());
            }
        });

        *lock(&self.realtime) = Some(Realtime {
            subscription,
            applier,
        });
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.state.read().await.snapshot()
    }

    /// Post a comment or reply with instant local feedback.
    ///
    /// No-op without an actor or with blank text. Returns the confirmed
    /// comment, or `None` when nothing was persisted.
    pub async fn add_comment(
        &self,
        text: &str,
        parent_id: Option<&CommentId>,
    ) -> Option<Comment> {
        let text = text.trim();
        let actor = self.actor.as_ref()?;
        if text.is_empty() {
            return None;
        }

        let temp = Comment {
            id: CommentId::temporary(),
            post_id: self.post_id.clone(),
            parent_comment_id: parent_id.cloned(),
            author_id: actor.id.clone(),
            author_display_name: actor.display_name.clone(),
            author_avatar_url: actor.avatar_url.clone(),
            text: text.to_string(),
            created_at: Utc::now(),
            like_count: 0,
            reply_count: 0,
            replies: Vec::new(),
        };
        let temp_id = temp.id.clone();

        {
            let mut state = self.state.write().await;
            if state.closed() {
                return None;
            }
            if state.degraded() {
                drop(state);
                return self.add_while_degraded(text, actor, parent_id).await;
            }
            match parent_id {
                None => state.threads.insert(
                    0,
                    Thread {
                        entry: Entry::Pending(temp),
                        replies: Vec::new(),
                    },
                ),
                Some(parent) => {
                    let Some(thread) = state.threads.iter_mut().find(|t| t.entry.id() == parent)
                    else {
                        debug!(parent_id = %parent, "reply target not shown, ignoring");
                        return None;
                    };
                    if !matches!(thread.entry, Entry::Confirmed(_)) {
                        debug!(parent_id = %parent, "reply target is not confirmed, ignoring");
                        return None;
                    }
                    thread.replies.push(Entry::Pending(temp));
                }
            }
            state.error = None;
        }

        let result = self
            .repo
            .add_comment(&self.post_id, text, actor, parent_id)
            .await;

        let mut state = self.state.write().await;
        if state.closed() {
            return result.ok();
        }
        match result {
            Ok(comment) => {
                let fresh = state.confirm(&temp_id, comment.clone());
                if fresh && comment.is_top_level() {
                    state.total_count += 1;
                }
                Some(comment)
            }
            Err(e) => {
                warn!(post_id = %self.post_id, error = %e, "failed to post comment, rolling back");
                state.remove(&temp_id);
                state.error = Some(ADD_FAILED.to_string());
                None
            }
        }
    }

    /// Placeholders are never mixed with real comments: write without an
    /// optimistic entry and reload the thread once the write lands.
    async fn add_while_degraded(
        &self,
        text: &str,
        actor: &AuthorProfile,
        parent_id: Option<&CommentId>,
    ) -> Option<Comment> {
        if let Some(parent) = parent_id {
            debug!(parent_id = %parent, "cannot reply to a placeholder");
            return None;
        }
        match self.repo.add_comment(&self.post_id, text, actor, None).await {
            Ok(comment) => {
                self.refresh_comments().await;
                Some(comment)
            }
            Err(e) => {
                warn!(post_id = %self.post_id, error = %e, "failed to post comment");
                let mut state = self.state.write().await;
                if !state.closed() {
                    state.error = Some(ADD_FAILED.to_string());
                }
                None
            }
        }
    }

    /// Check that `id` refers to a persisted comment that may be mutated.
    async fn ensure_mutable(&self, id: &CommentId) -> Result<(), CommentError> {
        let state = self.state.read().await;
        match state.find(id) {
            Some(Entry::Pending(_)) => Err(CommentError::Pending(id.clone())),
            Some(Entry::Placeholder(_)) => Err(CommentError::Placeholder(id.clone())),
            Some(Entry::Confirmed(_)) => Ok(()),
            None if crate::fallback::is_placeholder(id) => Err(CommentError::Placeholder(id.clone())),
            None if id.is_temporary() => Err(CommentError::Pending(id.clone())),
            None => Ok(()),
        }
    }

    /// Delete a comment, then reload the thread from the backend.
    pub async fn delete_comment(&self, id: &CommentId) -> Result<(), CommentError> {
        self.ensure_mutable(id).await?;

        match self.repo.delete_comment(id, &self.post_id).await {
            Ok(()) => {
                tokio::time::sleep(self.repo.config().delete_settle()).await;
                self.refresh_comments().await;
                Ok(())
            }
            Err(e) => {
                warn!(post_id = %self.post_id, comment_id = %id, error = %e, "failed to delete comment");
                let message = if e.is_permission_denied() {
                    DELETE_UNAUTHORIZED
                } else {
                    DELETE_FAILED
                };
                let mut state = self.state.write().await;
                if !state.closed() {
                    state.error = Some(message.to_string());
                }
                Err(e)
            }
        }
    }

    /// Fetch and append the next page. No-op while loading, without a
    /// cursor, or once exhausted.
    pub async fn load_more_comments(&self) {
        let (cursor, generation) = {
            let mut state = self.state.write().await;
            if state.closed() || state.loading || state.loading_more || !state.has_more {
                return;
            }
            let Some(cursor) = state.cursor.clone() else {
                return;
            };
            state.loading_more = true;
            (cursor, state.generation)
        };

        let page_size = self.repo.config().page_size;
        let result = self
            .repo
            .get_page(&self.post_id, page_size, Some(&cursor), false)
            .await;

        let mut state = self.state.write().await;
        state.loading_more = false;
        if state.closed() || state.generation != generation {
            debug!(post_id = %self.post_id, "discarding stale page");
            return;
        }
        match result {
            Ok(page) => state.append(page),
            Err(e) => {
                warn!(post_id = %self.post_id, error = %e, "failed to load more comments");
                state.error = Some(LOAD_FAILED.to_string());
            }
        }
    }

    /// Reload from the first page, bypassing the cache.
    pub async fn refresh_comments(&self) {
        {
            let mut state = self.state.write().await;
            if state.closed() {
                return;
            }
            state.loading = true;
        }

        let page_size = self.repo.config().page_size;
        let result = self.repo.get_page(&self.post_id, page_size, None, true).await;

        let mut state = self.state.write().await;
        if state.closed() {
            return;
        }
        state.loading = false;
        match result {
            Ok(page) => state.replace(page),
            Err(e) => {
                warn!(post_id = %self.post_id, error = %e, "failed to refresh comments");
                state.error = Some(LOAD_FAILED.to_string());
            }
        }
    }

    pub async fn like_comment(&self, id: &CommentId) -> Result<u64, CommentError> {
        self.adjust_like(id, 1).await
    }

    pub async fn unlike_comment(&self, id: &CommentId) -> Result<u64, CommentError> {
        self.adjust_like(id, -1).await
    }

    async fn adjust_like(&self, id: &CommentId, delta: i64) -> Result<u64, CommentError> {
        self.ensure_mutable(id).await?;

        let result = self.repo.like_comment(id, &self.post_id, delta).await;

        let mut state = self.state.write().await;
        if state.closed() {
            return result;
        }
        match &result {
            Ok(count) => {
                if let Some(entry) = state.find_mut(id) {
                    entry.comment_mut().like_count = *count;
                }
            }
            Err(e) => {
                warn!(post_id = %self.post_id, comment_id = %id, error = %e, "failed to update like");
                state.error = Some(LIKE_FAILED.to_string());
            }
        }
        result
    }

    /// Stop realtime delivery. Results of operations still in flight are discarded.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().await;
            if state.closed() {
                return;
            }
            state.phase = SessionPhase::Closed;
        }
        if let Some(mut realtime) = lock(&self.realtime).take() {
            realtime.subscription.close();
            realtime.applier.abort();
        }
        info!(post_id = %self.post_id, "comment session closed");
    }
}

impl Drop for CommentSession {
    fn drop(&mut self) {
        if let Some(realtime) = lock(&self.realtime).take() {
            realtime.applier.abort();
        }
    }
}
