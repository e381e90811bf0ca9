//! Document-store backend for Reel.
//!
//! Provides the [`DocumentStore`] abstraction the comment system is written
//! against, an in-process [`MemoryStore`], and a [`RestStore`] client for a
//! hosted JSON document API with a websocket change feed.

mod error;
pub mod feed;
pub mod memory;
pub mod rest;
mod store;
mod types;

pub use error::StoreError;
pub use memory::{Fault, MemoryStore, Operation};
pub use rest::RestStore;
pub use store::{DocumentStore, TransactFn};
pub use types::{
    ChangeFeed, Change, Cursor, Direction, DocId, Document, FieldUpdate, Fields, Filter, OrderBy,
    Query, SERVER_TIMESTAMP_KEY, WatchOptions, WriteOp, compare_values, format_timestamp,
    is_server_timestamp, server_timestamp,
};
