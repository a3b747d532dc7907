use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use xpchat_shared::constants::MAX_FRAME_SIZE;

use crate::api::AppState;
use crate::error::RouterError;
use crate::registry::{ConnectionHandle, Outbound};
use crate::router::{ConnectionState, MessageRouter};

/// Socket-level cap. Envelopes between [`MAX_FRAME_SIZE`] and this reach the
/// router, which drops them and keeps the connection open.
const SOCKET_MESSAGE_LIMIT: usize = MAX_FRAME_SIZE * 4;

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let router = Arc::clone(&state.router);
    let queue = state.config.outbound_queue;
    ws.max_message_size(SOCKET_MESSAGE_LIMIT)
        .on_upgrade(move |socket| run_connection(socket, router, queue))
}

/// Drive one socket until either side closes it.
///
/// Inbound frames are handled strictly in arrival order; outbound frames come
/// from the connection's queue, fed by the registry.
pub async fn run_connection(socket: WebSocket, router: Arc<MessageRouter>, queue: usize) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound) = ConnectionHandle::channel(queue);
    let mut conn = ConnectionState::new(handle);
    debug!(connection = conn.connection_id(), "WebSocket opened");

    let reason = loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = router.handle(text.as_str(), &mut conn).await {
                        log_router_error(&conn, &e);
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(connection = conn.connection_id(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break "client closed",
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = conn.connection_id(), error = %e, "WebSocket receive error");
                    break "receive error";
                }
            },
            item = outbound.recv() => match item {
                Some(Outbound::Frame(text)) => {
                    if sender.send(Message::Text(text.to_string().into())).await.is_err() {
                        break "send failed";
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break "superseded";
                }
            },
        }
    };

    match conn.identity() {
        Some(identity) => info!(
            user = %identity.user_id,
            connection = conn.connection_id(),
            reason,
            "WebSocket closed"
        ),
        None => debug!(connection = conn.connection_id(), reason, "WebSocket closed"),
    }
    router.disconnect(&conn).await;
}

fn log_router_error(conn: &ConnectionState, error: &RouterError) {
    let user = conn.identity().map(|i| i.user_id.as_str()).unwrap_or("-");
    match error {
        RouterError::UnknownTarget(target) => {
            debug!(user, target = %target, "Target offline, signal dropped");
        }
        RouterError::MalformedEnvelope(_) | RouterError::NotAuthenticated { .. } => {
            warn!(user, error = %error, "Frame dropped");
        }
        RouterError::AuthRejected(_) => info!(error = %error, "Auth rejected"),
        RouterError::Store(_) | RouterError::Task(_) => {
            warn!(user, error = %error, "Frame handling failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use xpchat_shared::constants::MAX_FRAME_SIZE;
    use xpchat_shared::{ServerMessage, UserId};

    use crate::api::{build_router, AppState};

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn spawn_server() -> (String, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let state = AppState::for_tests(dir.path()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        (format!("ws://{addr}/ws"), dir)
    }

    async fn next_message(client: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return ServerMessage::from_text(text.as_str()).unwrap();
            }
        }
    }

    async fn login(url: &str, id: &str, name: &str) -> Client {
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let auth = json!({ "type": "auth", "userId": id, "userName": name }).to_string();
        client.send(WsMessage::Text(auth.into())).await.unwrap();
        assert!(matches!(next_message(&mut client).await, ServerMessage::AuthSuccess(_)));
        assert!(matches!(next_message(&mut client).await, ServerMessage::OnlineUsers(_)));
        client
    }

    #[tokio::test]
    async fn offer_is_relayed_between_sockets() {
        let (url, _dir) = spawn_server().await;
        let mut alice = login(&url, "alice", "Alice").await;
        let mut bob = login(&url, "bob", "Bob").await;

        match next_message(&mut alice).await {
            ServerMessage::UserStatusChange(c) => assert_eq!(c.user_id, UserId::from("bob")),
            other => panic!("unexpected {other:?}"),
        }

        let offer = json!({
            "type": "call_offer",
            "toUserId": "bob",
            "offer": { "type": "offer", "sdp": "v=0" },
            "callType": "audio"
        });
        alice
            .send(WsMessage::Text(offer.to_string().into()))
            .await
            .unwrap();

        match next_message(&mut bob).await {
            ServerMessage::CallOffer(sig) => {
                assert_eq!(sig.from_user_id, UserId::from("alice"));
                assert_eq!(sig.from_user_name, "Alice");
            }
            other => panic!("unexpected {other:?}"),
        }

        bob.close(None).await.unwrap();
        match next_message(&mut alice).await {
            ServerMessage::UserStatusChange(c) => {
                assert_eq!(c.user_id, UserId::from("bob"));
                assert!(!c.is_online);
                assert!(c.disconnected);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_login_closes_first_socket() {
        let (url, _dir) = spawn_server().await;
        let mut first = login(&url, "alice", "Alice").await;
        let _second = login(&url, "alice", "Alice").await;

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match first.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn oversized_envelope_is_dropped_and_socket_stays_open() {
        let (url, _dir) = spawn_server().await;
        let mut alice = login(&url, "alice", "Alice").await;
        let mut bob = login(&url, "bob", "Bob").await;
        assert!(matches!(
            next_message(&mut alice).await,
            ServerMessage::UserStatusChange(_)
        ));

        let huge = json!({
            "type": "message",
            "content": "x".repeat(MAX_FRAME_SIZE),
            "chatId": "general"
        });
        alice
            .send(WsMessage::Text(huge.to_string().into()))
            .await
            .unwrap();

        let hello = json!({ "type": "message", "content": "hello", "chatId": "general" });
        alice
            .send(WsMessage::Text(hello.to_string().into()))
            .await
            .unwrap();

        match next_message(&mut bob).await {
            ServerMessage::NewMessage(m) => {
                assert_eq!(m.message.content, "hello");
                assert_eq!(m.message.sender_id, UserId::from("alice"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
