//! # xpchat-store
//!
//! SQLite row store for XPchat, backed by `rusqlite`.
//!
//! The crate exposes a synchronous [`Database`] handle with typed CRUD helpers
//! for users, chats, messages and call records, and the [`RowStore`] trait the
//! relay server consumes. [`SqliteStore`] adapts a `Database` to that trait so
//! it can be shared across connection tasks.

pub mod calls;
pub mod chats;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod row_store;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use row_store::{RowStore, SqliteStore};
