use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use xpchat_media::{CallManager, CallNotification, MediaDevices, PeerFactory};
use xpchat_shared::ServerMessage;

/// What the application layer sees.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Chat, presence and typing envelopes, passed through untouched.
    Server(ServerMessage),
    Call(CallNotification),
}

/// Route relay traffic: call signals into `manager`, everything else plus
/// the manager's notifications out on `events`. A peer's disconnect goes to
/// both so calls with a departed peer end.
pub fn spawn_bridge<D: MediaDevices, F: PeerFactory>(
    manager: CallManager<D, F>,
    mut incoming: mpsc::UnboundedReceiver<ServerMessage>,
    mut notes: mpsc::UnboundedReceiver<CallNotification>,
    events: mpsc::UnboundedSender<ClientEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = incoming.recv() => {
                    let Some(message) = message else {
                        info!("Relay stream ended, bridge stopping");
                        break;
                    };
                    if message.is_call_signal() {
                        manager.handle_signal(message).await;
                        continue;
                    }
                    if message.is_disconnect() {
                        manager.handle_signal(message.clone()).await;
                    }
                    if events.send(ClientEvent::Server(message)).is_err() {
                        break;
                    }
                }
                Some(note) = notes.recv() => {
                    if events.send(ClientEvent::Call(note)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}
