//! JSON envelopes exchanged over the WebSocket.
//!
//! Every frame is one JSON object tagged by `type`. Field names are camelCase.
//! Inbound (client → server) and outbound (server → client) kinds are separate
//! enums so that a client can never inject a server-only field such as
//! `fromUserId`: unknown fields are dropped during deserialization and the
//! router fills the sender in from the authenticated connection.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::types::{CallId, CallKind, ChatId, PresenceStatus, UserId};

/// Opaque SDP object (`{type, sdp}`) produced by the browser's peer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub serde_json::Value);

/// Opaque ICE candidate object (`{candidate, sdpMid, sdpMLineIndex}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub serde_json::Value);

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth(AuthRequest),
    #[serde(alias = "chatMessage")]
    Message(ChatMessageRequest),
    Typing(TypingRequest),
    CallOffer(CallOfferRequest),
    CallAnswer(CallAnswerRequest),
    #[serde(alias = "call_reject")]
    CallRejection(CallRejectionRequest),
    IceCandidate(IceCandidateRequest),
    CallEnd(CallEndRequest),
    UserStatus(UserStatusRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRequest {
    pub content: String,
    #[serde(default)]
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    #[serde(default)]
    pub chat_id: ChatId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOfferRequest {
    pub to_user_id: UserId,
    pub offer: SessionDescription,
    #[serde(default)]
    pub call_type: CallKind,
    /// Client-chosen id; the server mints one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswerRequest {
    pub to_user_id: UserId,
    pub answer: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRejectionRequest {
    pub to_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateRequest {
    pub to_user_id: UserId,
    pub candidate: IceCandidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndRequest {
    pub to_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusRequest {
    #[serde(default = "default_online")]
    pub status: PresenceStatus,
}

fn default_online() -> PresenceStatus {
    PresenceStatus::Online
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess(AuthSuccess),
    AuthError(AuthFailure),
    OnlineUsers(OnlineUsers),
    NewMessage(NewMessage),
    UserTyping(UserTyping),
    CallOffer(CallOfferSignal),
    CallAnswer(CallAnswerSignal),
    CallRejection(CallRejectionSignal),
    IceCandidate(IceCandidateSignal),
    CallEnd(CallEndSignal),
    UserStatusChange(UserStatusChange),
}

/// Public view of a user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub status: PresenceStatus,
    /// Unix epoch millis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub user_id: UserId,
    pub user: UserSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthFailure {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineUsers {
    pub users: Vec<UserSummary>,
}

/// A chat message as delivered to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Unix epoch millis.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub user_id: UserId,
    pub user_name: String,
    pub chat_id: ChatId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOfferSignal {
    pub call_id: CallId,
    pub from_user_id: UserId,
    pub from_user_name: String,
    pub to_user_id: UserId,
    pub offer: SessionDescription,
    pub call_type: CallKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswerSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRejectionSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub from_user_id: UserId,
    pub from_user_name: String,
    pub to_user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusChange {
    pub user_id: UserId,
    pub user: UserSummary,
    pub is_online: bool,
    /// Set only when the user's connection went away. A manual "offline"
    /// status leaves it unset while the socket stays live.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disconnected: bool,
}

// ---------------------------------------------------------------------------
// Relay rewriting
// ---------------------------------------------------------------------------

/// A unicast signaling envelope ready to be delivered to `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct Relayed {
    pub target: UserId,
    pub message: ServerMessage,
}

impl ClientMessage {
    /// Wire name of this kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Message(_) => "message",
            Self::Typing(_) => "typing",
            Self::CallOffer(_) => "call_offer",
            Self::CallAnswer(_) => "call_answer",
            Self::CallRejection(_) => "call_rejection",
            Self::IceCandidate(_) => "ice_candidate",
            Self::CallEnd(_) => "call_end",
            Self::UserStatus(_) => "user_status",
        }
    }

    /// Rewrite a call signal into the envelope its target receives.
    ///
    /// The sender fields always come from `sender`, the identity bound to the
    /// connection the signal arrived on. Non-signal kinds return `None`.
    pub fn relay_from(self, sender: &UserId, sender_name: &str) -> Option<Relayed> {
        let relayed = match self {
            Self::CallOffer(req) => Relayed {
                target: req.to_user_id.clone(),
                message: ServerMessage::CallOffer(CallOfferSignal {
                    call_id: req.call_id.unwrap_or_default(),
                    from_user_id: sender.clone(),
                    from_user_name: sender_name.to_string(),
                    to_user_id: req.to_user_id,
                    offer: req.offer,
                    call_type: req.call_type,
                }),
            },
            Self::CallAnswer(req) => Relayed {
                target: req.to_user_id.clone(),
                message: ServerMessage::CallAnswer(CallAnswerSignal {
                    call_id: req.call_id,
                    from_user_id: sender.clone(),
                    to_user_id: req.to_user_id,
                    answer: req.answer,
                }),
            },
            Self::CallRejection(req) => Relayed {
                target: req.to_user_id.clone(),
                message: ServerMessage::CallRejection(CallRejectionSignal {
                    call_id: req.call_id,
                    from_user_id: sender.clone(),
                    to_user_id: req.to_user_id,
                }),
            },
            Self::IceCandidate(req) => Relayed {
                target: req.to_user_id.clone(),
                message: ServerMessage::IceCandidate(IceCandidateSignal {
                    call_id: req.call_id,
                    from_user_id: sender.clone(),
                    to_user_id: req.to_user_id,
                    candidate: req.candidate,
                }),
            },
            Self::CallEnd(req) => Relayed {
                target: req.to_user_id.clone(),
                message: ServerMessage::CallEnd(CallEndSignal {
                    call_id: req.call_id,
                    from_user_id: sender.clone(),
                    from_user_name: sender_name.to_string(),
                    to_user_id: req.to_user_id,
                }),
            },
            Self::Auth(_)
            | Self::Message(_)
            | Self::Typing(_)
            | Self::UserStatus(_) => return None,
        };
        Some(relayed)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthSuccess(_) => "auth_success",
            Self::AuthError(_) => "auth_error",
            Self::OnlineUsers(_) => "online_users",
            Self::NewMessage(_) => "new_message",
            Self::UserTyping(_) => "user_typing",
            Self::CallOffer(_) => "call_offer",
            Self::CallAnswer(_) => "call_answer",
            Self::CallRejection(_) => "call_rejection",
            Self::IceCandidate(_) => "ice_candidate",
            Self::CallEnd(_) => "call_end",
            Self::UserStatusChange(_) => "user_status_change",
        }
    }

    /// Whether this kind is a point-to-point call signal.
    pub fn is_call_signal(&self) -> bool {
        matches!(
            self,
            Self::CallOffer(_)
                | Self::CallAnswer(_)
                | Self::CallRejection(_)
                | Self::IceCandidate(_)
                | Self::CallEnd(_)
        )
    }

    /// Presence change announcing that the user's connection is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::UserStatusChange(c) if c.disconnected)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }
}

fn check_size(text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_call_offer_from_browser_json() {
        let raw = json!({
            "type": "call_offer",
            "toUserId": "bob",
            "offer": {"type": "offer", "sdp": "v=0"},
            "callType": "video"
        })
        .to_string();

        let msg = ClientMessage::from_text(&raw).unwrap();
        match msg {
            ClientMessage::CallOffer(req) => {
                assert_eq!(req.to_user_id, UserId::from("bob"));
                assert_eq!(req.call_type, CallKind::Video);
                assert!(req.call_id.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn accepts_kind_aliases() {
        let reject = ClientMessage::from_text(r#"{"type":"call_reject","toUserId":"a"}"#).unwrap();
        assert!(matches!(reject, ClientMessage::CallRejection(_)));

        let chat = ClientMessage::from_text(r#"{"type":"chatMessage","content":"hi"}"#).unwrap();
        match chat {
            ClientMessage::Message(req) => assert!(req.chat_id.is_general()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_kind_and_missing_fields() {
        assert!(matches!(
            ClientMessage::from_text(r#"{"type":"teleport","toUserId":"a"}"#),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            ClientMessage::from_text(r#"{"type":"call_answer","toUserId":"a"}"#),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
        assert!(ClientMessage::from_text("not json").is_err());
    }

    #[test]
    fn rejects_oversized_frames() {
        let big = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            ClientMessage::from_text(&big),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn relay_ignores_spoofed_sender_fields() {
        let raw = json!({
            "type": "ice_candidate",
            "toUserId": "bob",
            "fromUserId": "mallory",
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host"}
        })
        .to_string();

        let relayed = ClientMessage::from_text(&raw)
            .unwrap()
            .relay_from(&UserId::from("alice"), "Alice")
            .unwrap();

        assert_eq!(relayed.target, UserId::from("bob"));
        match relayed.message {
            ServerMessage::IceCandidate(sig) => assert_eq!(sig.from_user_id, UserId::from("alice")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn relay_mints_call_id_only_when_missing() {
        let id = CallId::new();
        let with_id = ClientMessage::CallOffer(CallOfferRequest {
            to_user_id: UserId::from("bob"),
            offer: SessionDescription(json!({"type": "offer"})),
            call_type: CallKind::Audio,
            call_id: Some(id),
        });
        match with_id.relay_from(&UserId::from("alice"), "Alice").unwrap().message {
            ServerMessage::CallOffer(sig) => {
                assert_eq!(sig.call_id, id);
                assert_eq!(sig.from_user_name, "Alice");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let typing = ClientMessage::Typing(TypingRequest {
            chat_id: ChatId::general(),
            is_typing: true,
        });
        assert!(typing.relay_from(&UserId::from("alice"), "Alice").is_none());
    }

    #[test]
    fn server_messages_use_wire_names() {
        let msg = ServerMessage::UserTyping(UserTyping {
            user_id: UserId::from("alice"),
            user_name: "Alice".into(),
            chat_id: ChatId::general(),
            is_typing: true,
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "user_typing");
        assert_eq!(value["userName"], "Alice");
        assert_eq!(value["isTyping"], true);
    }

    #[test]
    fn only_dropped_connections_are_marked_disconnected() {
        let user = UserSummary {
            id: UserId::from("bob"),
            username: "Bob".into(),
            avatar: None,
            status: PresenceStatus::Offline,
            last_seen: None,
        };
        let manual = ServerMessage::UserStatusChange(UserStatusChange {
            user_id: UserId::from("bob"),
            user: user.clone(),
            is_online: false,
            disconnected: false,
        });
        let value: serde_json::Value = serde_json::from_str(&manual.to_text().unwrap()).unwrap();
        assert!(value.get("disconnected").is_none());
        assert!(!manual.is_disconnect());

        let gone = ServerMessage::UserStatusChange(UserStatusChange {
            user_id: UserId::from("bob"),
            user,
            is_online: false,
            disconnected: true,
        });
        assert!(gone.is_disconnect());
        assert_eq!(ServerMessage::from_text(&gone.to_text().unwrap()).unwrap(), gone);

        // Older relays never send the flag.
        let legacy = json!({
            "type": "user_status_change",
            "userId": "bob",
            "user": { "id": "bob", "username": "Bob", "status": "offline" },
            "isOnline": false
        });
        let parsed = ServerMessage::from_text(&legacy.to_string()).unwrap();
        assert!(!parsed.is_disconnect());
        assert!(!parsed.is_call_signal());
    }
}
