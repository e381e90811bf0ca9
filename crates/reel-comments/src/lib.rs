//! Comment threads for Reel.
//!
//! - [`CountStore`]: denormalized top-level comment counts with drift repair.
//! - [`CommentRepository`]: paginated, cached reads; writes; realtime feeds.
//! - [`CommentSession`]: one post's merged view of persisted, optimistic and
//!   realtime comments.

pub mod cache;
mod config;
mod count;
mod error;
pub mod fallback;
mod repository;
mod session;
mod subscription;
mod types;

pub use cache::{PageCache, PageKey};
pub use config::CommentsConfig;
pub use count::CountStore;
pub use error::CommentError;
pub use repository::{AddedCallback, CREATED_AT, CommentRepository, RemovedCallback};
pub use session::{
    ADD_FAILED, CommentSession, DELETE_FAILED, DELETE_UNAUTHORIZED, LIKE_FAILED, LOAD_FAILED,
    SessionPhase, SessionSnapshot,
};
pub use subscription::Subscription;
pub use types::{AuthorProfile, Comment, CommentId, CommentPage, TEMP_ID_PREFIX};
