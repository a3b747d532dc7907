//! Inbound envelope dispatch.
//!
//! Every text frame read by a socket task goes through
//! [`MessageRouter::handle`]. The router parses it, checks that the
//! connection is authenticated, fills the sender in from the connection
//! and hands the result to the [`ConnectionRegistry`] for delivery.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use xpchat_shared::protocol::{
    AuthFailure, AuthRequest, AuthSuccess, ChatMessage, ChatMessageRequest, NewMessage,
    OnlineUsers, TypingRequest, UserStatusChange, UserStatusRequest, UserTyping,
};
use xpchat_shared::{ClientMessage, PresenceStatus, Relayed, ServerMessage, UserId};
use xpchat_store::{CallRecord, CallStatus, Message, NewUser, RowStore, StoreError};

use crate::error::RouterError;
use crate::registry::{Connection, ConnectionHandle, ConnectionRegistry};

/// Identity bound to a connection after a successful `auth`.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

/// Per-socket state owned by the connection task.
#[derive(Debug)]
pub struct ConnectionState {
    handle: ConnectionHandle,
    identity: Option<Identity>,
}

impl ConnectionState {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            identity: None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn connection_id(&self) -> u64 {
        self.handle.id()
    }
}

pub struct MessageRouter {
    store: Arc<dyn RowStore>,
    registry: ConnectionRegistry,
}

async fn blocking<T, F>(store: &Arc<dyn RowStore>, f: F) -> Result<T, RouterError>
where
    T: Send + 'static,
    F: FnOnce(&dyn RowStore) -> xpchat_store::Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    Ok(tokio::task::spawn_blocking(move || f(store.as_ref())).await??)
}

impl MessageRouter {
    pub fn new(store: Arc<dyn RowStore>, registry: ConnectionRegistry) -> Self {
        Self { store, registry }
    }

    pub async fn handle(&self, raw: &str, conn: &mut ConnectionState) -> Result<(), RouterError> {
        let message = ClientMessage::from_text(raw)?;

        let identity = match (&message, conn.identity.clone()) {
            (ClientMessage::Auth(_), _) => None,
            (_, Some(identity)) => Some(identity),
            (other, None) => {
                return Err(RouterError::NotAuthenticated { kind: other.kind() });
            }
        };

        match (message, identity) {
            (ClientMessage::Auth(req), _) => self.on_auth(req, conn).await,
            (ClientMessage::Message(req), Some(from)) => self.on_chat_message(req, &from).await,
            (ClientMessage::Typing(req), Some(from)) => self.on_typing(req, &from).await,
            (ClientMessage::UserStatus(req), Some(from)) => self.on_user_status(req, &from).await,
            (
                signal @ (ClientMessage::CallOffer(_)
                | ClientMessage::CallAnswer(_)
                | ClientMessage::CallRejection(_)
                | ClientMessage::IceCandidate(_)
                | ClientMessage::CallEnd(_)),
                Some(from),
            ) => self.on_call_signal(signal, &from).await,
            (_, None) => Ok(()),
        }
    }

    /// Socket closed: drop the registry entry if it is still ours.
    pub async fn disconnect(&self, conn: &ConnectionState) {
        let Some(identity) = conn.identity() else {
            return;
        };
        if !self
            .registry
            .unregister(&identity.user_id, conn.connection_id())
            .await
        {
            debug!(user = %identity.user_id, "Superseded connection closed");
            return;
        }
        let user_id = identity.user_id.clone();
        if let Err(e) = blocking(&self.store, move |s| {
            s.update_user_status(&user_id, PresenceStatus::Offline)
        })
        .await
        {
            warn!(user = %identity.user_id, error = %e, "Failed to persist offline status");
        }
    }

    async fn on_auth(&self, req: AuthRequest, conn: &mut ConnectionState) -> Result<(), RouterError> {
        let display_name = req.user_name.trim().to_string();
        if display_name.is_empty() {
            return self.reject_auth(conn, "userName is required");
        }
        let user_id = req.user_id.clone().unwrap_or_else(UserId::generate);

        let new_user = NewUser {
            id: user_id.clone(),
            username: display_name.clone(),
            avatar: req.avatar.clone(),
        };
        let stored = blocking(&self.store, move |s| {
            let user = match s.get_user_by_id(&new_user.id)? {
                Some(user) => user,
                None => s.create_user(&new_user)?,
            };
            s.update_user_status(&user.id, PresenceStatus::Online)?;
            Ok(user)
        })
        .await;
        let stored = match stored {
            Ok(user) => user,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Auth failed in storage");
                return self.reject_auth(conn, "Authentication failed");
            }
        };

        if let Some(previous) = conn.identity.take() {
            if previous.user_id != user_id {
                self.registry
                    .unregister(&previous.user_id, conn.connection_id())
                    .await;
            }
        }

        let avatar = req.avatar.or(stored.avatar);
        let connection = Connection::new(
            user_id.clone(),
            display_name.clone(),
            avatar.clone(),
            conn.handle.clone(),
        );
        conn.identity = Some(Identity {
            user_id: user_id.clone(),
            display_name,
            avatar,
        });

        connection.send(&ServerMessage::AuthSuccess(AuthSuccess {
            user_id: user_id.clone(),
            user: connection.summary(PresenceStatus::Online),
        }));
        let connection = self.registry.register(connection).await;

        let users = self.registry.list_online().await;
        debug!(user = %user_id, online = users.len(), "Sending online users");
        connection.send(&ServerMessage::OnlineUsers(OnlineUsers { users }));
        Ok(())
    }

    fn reject_auth(&self, conn: &ConnectionState, reason: &str) -> Result<(), RouterError> {
        conn.handle.send(&ServerMessage::AuthError(AuthFailure {
            error: reason.to_string(),
        }));
        Err(RouterError::AuthRejected(reason.to_string()))
    }

    async fn on_chat_message(&self, req: ChatMessageRequest, from: &Identity) -> Result<(), RouterError> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: req.chat_id,
            sender_id: from.user_id.clone(),
            content: req.content,
            message_type: req.message_type.unwrap_or_else(|| "text".to_string()),
            file_path: req.file_path,
            file_name: req.file_name,
            file_size: req.file_size,
            reply_to: req.reply_to,
            created_at: now,
        };

        let row = message.clone();
        if let Err(e) = blocking(&self.store, move |s| s.save_message(&row)).await {
            warn!(chat = %message.chat_id, error = %e, "Failed to persist message");
        }

        let chat_id = message.chat_id.clone();
        let envelope = ServerMessage::NewMessage(NewMessage {
            message: ChatMessage {
                id: message.id,
                chat_id: message.chat_id,
                sender_id: message.sender_id,
                sender_name: from.display_name.clone(),
                sender_avatar: from.avatar.clone(),
                content: message.content,
                message_type: message.message_type,
                file_path: message.file_path,
                file_name: message.file_name,
                file_size: message.file_size,
                reply_to: message.reply_to,
                timestamp: now.timestamp_millis(),
            },
        });

        if chat_id.is_general() {
            self.registry.broadcast_except(None, &envelope).await;
        } else {
            let mut targets = self.participants(&chat_id).await;
            if !targets.contains(&from.user_id) {
                targets.push(from.user_id.clone());
            }
            self.registry.send_to_many(&targets, None, &envelope).await;
        }
        debug!(user = %from.user_id, chat = %chat_id, "Message relayed");
        Ok(())
    }

    async fn on_typing(&self, req: TypingRequest, from: &Identity) -> Result<(), RouterError> {
        let user_name = match self.registry.lookup(&from.user_id).await {
            Some(conn) => conn.display_name,
            None => from.display_name.clone(),
        };
        let envelope = ServerMessage::UserTyping(UserTyping {
            user_id: from.user_id.clone(),
            user_name,
            chat_id: req.chat_id.clone(),
            is_typing: req.is_typing,
        });

        if req.chat_id.is_general() {
            self.registry
                .broadcast_except(Some(&from.user_id), &envelope)
                .await;
        } else {
            let targets = self.participants(&req.chat_id).await;
            self.registry
                .send_to_many(&targets, Some(&from.user_id), &envelope)
                .await;
        }
        Ok(())
    }

    async fn on_user_status(&self, req: UserStatusRequest, from: &Identity) -> Result<(), RouterError> {
        let user_id = from.user_id.clone();
        let status = req.status;
        if let Err(e) = blocking(&self.store, move |s| s.update_user_status(&user_id, status)).await {
            warn!(user = %from.user_id, error = %e, "Failed to persist status");
        }

        let Some(conn) = self.registry.lookup(&from.user_id).await else {
            return Ok(());
        };
        info!(user = %from.user_id, status = status.as_str(), "Manual status change");
        let change = ServerMessage::UserStatusChange(UserStatusChange {
            user_id: from.user_id.clone(),
            user: conn.summary(status),
            is_online: status.is_online(),
            disconnected: false,
        });
        self.registry
            .broadcast_except(Some(&from.user_id), &change)
            .await;
        Ok(())
    }

    async fn on_call_signal(&self, signal: ClientMessage, from: &Identity) -> Result<(), RouterError> {
        let kind = signal.kind();
        let Some(Relayed { target, message }) = signal.relay_from(&from.user_id, &from.display_name)
        else {
            return Ok(());
        };

        self.record_call(&message).await;

        if !self.registry.send_to(&target, &message).await {
            return Err(RouterError::UnknownTarget(target));
        }
        debug!(kind, from = %from.user_id, to = %target, "Signal relayed");
        Ok(())
    }

    /// Keep the call history in step with the signals that pass through.
    /// Failures are logged; the signal is relayed regardless.
    async fn record_call(&self, message: &ServerMessage) {
        let result = match message {
            ServerMessage::CallOffer(offer) => {
                let record = CallRecord {
                    id: offer.call_id,
                    caller_id: offer.from_user_id.clone(),
                    receiver_id: offer.to_user_id.clone(),
                    call_type: offer.call_type,
                    status: CallStatus::Initiated,
                    start_time: Utc::now(),
                    end_time: None,
                    duration: None,
                };
                blocking(&self.store, move |s| s.save_call(&record)).await
            }
            ServerMessage::CallAnswer(answer) => match answer.call_id {
                Some(id) => self.set_call_status(id, CallStatus::Accepted, false).await,
                None => Ok(()),
            },
            ServerMessage::CallRejection(reject) => match reject.call_id {
                Some(id) => self.set_call_status(id, CallStatus::Rejected, false).await,
                None => Ok(()),
            },
            ServerMessage::CallEnd(end) => match end.call_id {
                Some(id) => self.set_call_status(id, CallStatus::Ended, true).await,
                None => Ok(()),
            },
            _ => Ok(()),
        };

        match result {
            Ok(()) => {}
            Err(RouterError::Store(StoreError::NotFound)) => {
                debug!(kind = message.kind(), "No call record to update");
            }
            Err(e) => warn!(kind = message.kind(), error = %e, "Failed to record call"),
        }
    }

    async fn set_call_status(
        &self,
        id: xpchat_shared::CallId,
        status: CallStatus,
        ended: bool,
    ) -> Result<(), RouterError> {
        let ended_at = ended.then(Utc::now);
        blocking(&self.store, move |s| s.update_call_status(id, status, ended_at).map(|_| ())).await
    }

    async fn participants(&self, chat_id: &xpchat_shared::ChatId) -> Vec<UserId> {
        let id = chat_id.clone();
        match blocking(&self.store, move |s| s.chat_participants(&id)).await {
            Ok(users) => users,
            Err(e) => {
                warn!(chat = %chat_id, error = %e, "Failed to load chat participants");
                Vec::new()
            }
        }
    }
}
