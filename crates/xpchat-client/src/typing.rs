use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use xpchat_shared::protocol::TypingRequest;
use xpchat_shared::types::ChatId;
use xpchat_shared::ClientMessage;

enum Command {
    Keystroke,
    Stop,
}

/// Debounced typing indicator for one chat.
///
/// The first keystroke sends `isTyping=true`; further keystrokes only push
/// the deadline back. After `idle` without keystrokes, or on [`stop`], a
/// single `isTyping=false` follows. Dropping the notifier also clears the
/// indicator.
///
/// [`stop`]: TypingNotifier::stop
pub struct TypingNotifier {
    commands: mpsc::UnboundedSender<Command>,
    _task: JoinHandle<()>,
}

impl TypingNotifier {
    pub fn spawn(chat_id: ChatId, idle: Duration, out: mpsc::UnboundedSender<ClientMessage>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(chat_id, idle, rx, out));
        Self {
            commands,
            _task: task,
        }
    }

    pub fn keystroke(&self) {
        let _ = self.commands.send(Command::Keystroke);
    }

    /// Clear the indicator now (the message was sent).
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

async fn run(
    chat_id: ChatId,
    idle: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    out: mpsc::UnboundedSender<ClientMessage>,
) {
    let emit = |is_typing: bool| {
        debug!(chat = %chat_id, is_typing, "Typing indicator");
        let _ = out.send(ClientMessage::Typing(TypingRequest {
            chat_id: chat_id.clone(),
            is_typing,
        }));
    };

    let timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(timer);
    let mut typing = false;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Keystroke) => {
                    if !typing {
                        typing = true;
                        emit(true);
                    }
                    timer.as_mut().reset(Instant::now() + idle);
                }
                Some(Command::Stop) => {
                    if typing {
                        typing = false;
                        emit(false);
                    }
                }
                None => {
                    if typing {
                        emit(false);
                    }
                    break;
                }
            },
            _ = &mut timer, if typing => {
                typing = false;
                emit(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<bool> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                ClientMessage::Typing(t) => out.push(t.is_typing),
                other => panic!("unexpected {other:?}"),
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_keystrokes_sends_one_start_and_one_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = TypingNotifier::spawn(ChatId::general(), Duration::from_secs(1), tx);

        for _ in 0..3 {
            notifier.keystroke();
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert_eq!(flags(&mut rx), vec![true]);

        // 900 ms after the last keystroke: still typing.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(flags(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(flags(&mut rx), vec![false]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(flags(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_immediately_and_typing_can_resume() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = TypingNotifier::spawn(ChatId::new("team"), Duration::from_secs(1), tx);

        notifier.keystroke();
        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.stop();
        notifier.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flags(&mut rx), vec![true, false]);

        notifier.keystroke();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(notifier);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flags(&mut rx), vec![true, false]);
    }
}
