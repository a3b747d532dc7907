//! Identity → live connection map.
//!
//! Each authenticated user owns at most one entry. Registering an identity
//! that is already present evicts the previous connection (its socket task
//! receives [`Outbound::Close`]). Every register and unregister broadcasts a
//! `user_status_change` to all other connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use xpchat_shared::protocol::{UserStatusChange, UserSummary};
use xpchat_shared::{PresenceStatus, ServerMessage, UserId};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Item queued for a connection's socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialized envelope, shared between all recipients of a broadcast.
    Frame(Arc<str>),
    /// The connection was superseded; close the socket.
    Close,
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a message. Returns `false` if the queue is full or the socket
    /// task is gone.
    pub fn send(&self, message: &ServerMessage) -> bool {
        match message.to_text() {
            Ok(text) => self.send_frame(Arc::from(text)),
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Failed to encode envelope");
                false
            }
        }
    }

    fn send_frame(&self, frame: Arc<str>) -> bool {
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(connection = self.id, "Dropping frame for slow connection");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self) {
        // A full queue still has to learn it was superseded.
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Outbound::Close).await;
        });
    }
}

/// One registry entry.
#[derive(Debug, Clone)]
pub struct Connection {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub connected_at: DateTime<Utc>,
    handle: ConnectionHandle,
}

impl Connection {
    pub fn new(
        user_id: UserId,
        display_name: impl Into<String>,
        avatar: Option<String>,
        handle: ConnectionHandle,
    ) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar,
            connected_at: Utc::now(),
            handle,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.handle.id
    }

    pub fn send(&self, message: &ServerMessage) -> bool {
        self.handle.send(message)
    }

    pub fn summary(&self, status: PresenceStatus) -> UserSummary {
        UserSummary {
            id: self.user_id.clone(),
            username: self.display_name.clone(),
            avatar: self.avatar.clone(),
            status,
            last_seen: Some(Utc::now().timestamp_millis()),
        }
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<UserId, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `connection`, evicting any previous connection for the same
    /// identity, then announce the user as online to everyone else.
    pub async fn register(&self, connection: Connection) -> Connection {
        let evicted = {
            let mut map = self.connections.write().await;
            map.insert(connection.user_id.clone(), connection.clone())
        };

        if let Some(old) = evicted {
            if old.connection_id() != connection.connection_id() {
                info!(
                    user = %connection.user_id,
                    old = old.connection_id(),
                    new = connection.connection_id(),
                    "Identity reconnected, evicting previous connection"
                );
                old.handle.close();
            }
        }

        info!(
            user = %connection.user_id,
            name = %connection.display_name,
            connection = connection.connection_id(),
            "User online"
        );
        self.announce(&connection, true).await;
        connection
    }

    /// Remove `user_id` only if it is still bound to `connection_id`.
    /// Idempotent.
    ///
    /// A superseded socket closing late must not unregister its successor.
    pub async fn unregister(&self, user_id: &UserId, connection_id: u64) -> bool {
        let removed = {
            let mut map = self.connections.write().await;
            match map.get(user_id) {
                Some(current) if current.connection_id() == connection_id => map.remove(user_id),
                _ => None,
            }
        };
        match removed {
            Some(conn) => {
                let online_secs = (Utc::now() - conn.connected_at).num_seconds();
                info!(user = %user_id, connection = connection_id, online_secs, "User offline");
                self.announce(&conn, false).await;
                true
            }
            None => false,
        }
    }

    pub async fn lookup(&self, user_id: &UserId) -> Option<Connection> {
        self.connections.read().await.get(user_id).cloned()
    }

    /// Snapshot of everyone currently connected.
    pub async fn list_online(&self) -> Vec<UserSummary> {
        let map = self.connections.read().await;
        let mut users: Vec<UserSummary> = map
            .values()
            .map(|c| c.summary(PresenceStatus::Online))
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    pub async fn online_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Unicast. Returns `false` when the target is not connected.
    pub async fn send_to(&self, user_id: &UserId, message: &ServerMessage) -> bool {
        let map = self.connections.read().await;
        match map.get(user_id) {
            Some(conn) => conn.send(message),
            None => false,
        }
    }

    /// Deliver to every connection except `except`.
    pub async fn broadcast_except(&self, except: Option<&UserId>, message: &ServerMessage) {
        let Some(frame) = encode(message) else {
            return;
        };
        let map = self.connections.read().await;
        for (user_id, conn) in map.iter() {
            if Some(user_id) == except {
                continue;
            }
            conn.handle.send_frame(Arc::clone(&frame));
        }
    }

    /// Deliver to each listed identity that is online, skipping `except`.
    pub async fn send_to_many(
        &self,
        targets: &[UserId],
        except: Option<&UserId>,
        message: &ServerMessage,
    ) {
        let Some(frame) = encode(message) else {
            return;
        };
        let map = self.connections.read().await;
        for user_id in targets {
            if Some(user_id) == except {
                continue;
            }
            if let Some(conn) = map.get(user_id) {
                conn.handle.send_frame(Arc::clone(&frame));
            }
        }
    }

    /// Broadcast `connection` coming or going to everyone else. Going
    /// offline here always means the socket is gone.
    async fn announce(&self, connection: &Connection, is_online: bool) {
        let status = if is_online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        };
        let change = ServerMessage::UserStatusChange(UserStatusChange {
            user_id: connection.user_id.clone(),
            user: connection.summary(status),
            is_online,
            disconnected: !is_online,
        });
        self.broadcast_except(Some(&connection.user_id), &change).await;
    }
}

fn encode(message: &ServerMessage) -> Option<Arc<str>> {
    match message.to_text() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            warn!(kind = message.kind(), error = %e, "Failed to encode envelope");
            None
        }
    }
}
