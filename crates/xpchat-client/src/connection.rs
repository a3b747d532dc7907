//! Persistent WebSocket connection to the relay.
//!
//! [`SignalingClient::spawn`] runs a supervisor task that connects with
//! backoff, sends `auth` on every (re)connect and pumps envelopes both ways.
//! Once the relay assigns an identity it is reused for later reconnects.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use xpchat_shared::protocol::{AuthRequest, AuthSuccess};
use xpchat_shared::{ClientMessage, ServerMessage};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::retry::RetryPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    Shutdown,
    ServerClosed,
}

pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), ClientError>>,
}

impl SignalingClient {
    /// Start the connection task. Envelopes from the relay arrive on the
    /// returned receiver, which closes when the task gives up.
    pub fn spawn(
        config: &ClientConfig,
        auth: AuthRequest,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(supervise(
            config.server_url.clone(),
            config.retry.clone(),
            auth,
            outbound_rx,
            incoming_tx,
            shutdown_rx,
        ));

        let client = Self {
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task,
        };
        (client, incoming_rx)
    }

    /// Queue an envelope. Envelopes queued while reconnecting go out once
    /// the connection is back.
    pub fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.outbound.send(message).map_err(|_| ClientError::Closed)
    }

    /// A sender for other components (the call manager) to write through.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    /// Close the connection and wait for the task to finish.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        let _ = self.shutdown.send(true);
        self.task.await.unwrap_or(Err(ClientError::Closed))
    }
}

/// Wait for the relay's answer to `auth`.
pub async fn await_auth(
    incoming: &mut mpsc::UnboundedReceiver<ServerMessage>,
    timeout: Duration,
) -> Result<AuthSuccess, ClientError> {
    tokio::time::timeout(timeout, async {
        while let Some(message) = incoming.recv().await {
            match message {
                ServerMessage::AuthSuccess(ok) => return Ok(ok),
                ServerMessage::AuthError(failure) => {
                    return Err(ClientError::AuthRejected(failure.error))
                }
                other => debug!(kind = other.kind(), "Envelope before auth ignored"),
            }
        }
        Err(ClientError::Closed)
    })
    .await
    .map_err(|_| ClientError::Timeout)?
}

pub async fn connect_with_retry(url: &str, policy: &RetryPolicy) -> Result<WsStream, ClientError> {
    policy
        .run("connect", || async move {
            tokio_tungstenite::connect_async(url).await.map(|(ws, _)| ws)
        })
        .await
        .map_err(|(e, attempts)| {
            warn!(url, attempts, error = %e, "Relay unreachable");
            ClientError::RetriesExhausted { attempts }
        })
}

async fn supervise(
    url: String,
    policy: RetryPolicy,
    mut auth: AuthRequest,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    incoming: mpsc::UnboundedSender<ServerMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ClientError> {
    loop {
        let ws = tokio::select! {
            res = connect_with_retry(&url, &policy) => res?,
            _ = shutdown.changed() => return Ok(()),
        };
        info!(url = %url, "Connected to relay");

        match run_session(ws, &mut auth, &mut outbound, &incoming, &mut shutdown).await {
            Ok(SessionEnd::Shutdown) => {
                info!("Signaling connection closed");
                return Ok(());
            }
            Ok(SessionEnd::ServerClosed) => warn!("Relay closed the connection, reconnecting"),
            Err(e) => warn!(error = %e, "Connection lost, reconnecting"),
        }
    }
}

async fn run_session(
    ws: WsStream,
    auth: &mut AuthRequest,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    incoming: &mpsc::UnboundedSender<ServerMessage>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, ClientError> {
    let (mut write, mut read) = ws.split();

    let hello = ClientMessage::Auth(auth.clone()).to_text()?;
    write.send(Message::Text(hello.into())).await?;

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::from_text(text.as_str()) {
                    Ok(message) => {
                        if let ServerMessage::AuthSuccess(ok) = &message {
                            auth.user_id = Some(ok.user_id.clone());
                        }
                        if incoming.send(message).is_err() {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    Err(e) => warn!(error = %e, "Malformed envelope from relay"),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::ServerClosed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            out = outbound.recv() => match out {
                Some(message) => {
                    debug!(kind = message.kind(), "Sending envelope");
                    write.send(Message::Text(message.to_text()?.into())).await?;
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
            },
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use xpchat_shared::protocol::{TypingRequest, UserSummary};
    use xpchat_shared::types::{ChatId, PresenceStatus, UserId};

    async fn accept_one(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn next_client_message(ws: &mut WebSocketStream<TcpStream>) -> ClientMessage {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return ClientMessage::from_text(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    fn config(url: String, max_attempts: u32) -> ClientConfig {
        ClientConfig {
            server_url: url,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(10),
                multiplier: 2,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reconnect_reuses_the_assigned_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (client, mut incoming) = SignalingClient::spawn(
            &config(url, 3),
            AuthRequest {
                user_id: None,
                user_name: "Alice".into(),
                avatar: None,
            },
        );

        let mut ws = accept_one(&listener).await;
        match next_client_message(&mut ws).await {
            ClientMessage::Auth(req) => {
                assert_eq!(req.user_id, None);
                assert_eq!(req.user_name, "Alice");
            }
            other => panic!("expected auth, got {other:?}"),
        }

        let assigned = UserId::from("u-1");
        let success = ServerMessage::AuthSuccess(AuthSuccess {
            user_id: assigned.clone(),
            user: UserSummary {
                id: assigned.clone(),
                username: "Alice".into(),
                avatar: None,
                status: PresenceStatus::Online,
                last_seen: None,
            },
        });
        ws.send(Message::Text(success.to_text().unwrap().into()))
            .await
            .unwrap();
        let ok = await_auth(&mut incoming, Duration::from_secs(5)).await.unwrap();
        assert_eq!(ok.user_id, assigned);

        ws.close(None).await.unwrap();
        drop(ws);

        let mut ws = accept_one(&listener).await;
        match next_client_message(&mut ws).await {
            ClientMessage::Auth(req) => assert_eq!(req.user_id, Some(assigned)),
            other => panic!("expected auth, got {other:?}"),
        }

        client
            .send(ClientMessage::Typing(TypingRequest {
                chat_id: ChatId::general(),
                is_typing: true,
            }))
            .unwrap();
        assert_eq!(next_client_message(&mut ws).await.kind(), "typing");

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_relay_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (client, mut incoming) = SignalingClient::spawn(
            &config(url, 2),
            AuthRequest {
                user_id: None,
                user_name: "Bob".into(),
                avatar: None,
            },
        );

        assert!(incoming.recv().await.is_none());
        assert!(matches!(
            client.shutdown().await,
            Err(ClientError::RetriesExhausted { attempts: 2 })
        ));
    }

    #[tokio::test]
    async fn auth_error_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ServerMessage::AuthError(xpchat_shared::protocol::AuthFailure {
            error: "name required".into(),
        }))
        .unwrap();

        assert!(matches!(
            await_auth(&mut rx, Duration::from_secs(1)).await,
            Err(ClientError::AuthRejected(reason)) if reason == "name required"
        ));
    }
}
