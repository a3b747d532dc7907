//! The narrow storage contract the relay depends on.
//!
//! Connection tasks only need a handful of writes and lookups, so the relay
//! router is written against [`RowStore`] rather than [`Database`] directly.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use xpchat_shared::types::{CallId, ChatId, PresenceStatus, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{CallRecord, CallStatus, Message, NewUser, User};

pub trait RowStore: Send + Sync {
    fn get_user_by_id(&self, id: &UserId) -> Result<Option<User>>;
    fn create_user(&self, user: &NewUser) -> Result<User>;
    fn update_user_status(&self, id: &UserId, status: PresenceStatus) -> Result<()>;
    fn save_message(&self, message: &Message) -> Result<()>;
    fn save_call(&self, call: &CallRecord) -> Result<()>;
    fn update_call_status(
        &self,
        id: CallId,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<CallRecord>;
    fn chat_participants(&self, chat_id: &ChatId) -> Result<Vec<UserId>>;
}

/// [`RowStore`] over a single SQLite connection guarded by a mutex.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Run `f` with exclusive access to the database.
    pub fn with<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        f(&db)
    }
}

impl RowStore for SqliteStore {
    fn get_user_by_id(&self, id: &UserId) -> Result<Option<User>> {
        self.with(|db| db.get_user_by_id(id))
    }

    fn create_user(&self, user: &NewUser) -> Result<User> {
        self.with(|db| db.create_user(user))
    }

    fn update_user_status(&self, id: &UserId, status: PresenceStatus) -> Result<()> {
        self.with(|db| db.update_user_status(id, status))
    }

    fn save_message(&self, message: &Message) -> Result<()> {
        self.with(|db| db.insert_message(message))
    }

    fn save_call(&self, call: &CallRecord) -> Result<()> {
        self.with(|db| db.insert_call(call))
    }

    fn update_call_status(
        &self,
        id: CallId,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<CallRecord> {
        self.with(|db| db.update_call_status(id, status, ended_at))
    }

    fn chat_participants(&self, chat_id: &ChatId) -> Result<Vec<UserId>> {
        self.with(|db| db.chat_participants(chat_id))
    }
}
