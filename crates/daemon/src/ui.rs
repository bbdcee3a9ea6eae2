//! Terminal implementation of the `ui` topic
//!
//! Prompts are printed to stdout and answered line by line. Lines come from
//! an `async_channel` so tests can script them; the daemon feeds it from a
//! dedicated stdin thread ([`stdin_lines`]).

use common::{Bus, Message, MessageId, Payload, Topic, UiPayload};
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PIN_MATRIX: [&str; 3] = ["7 8 9", "4 5 6", "1 2 3"];

/// Spawn a thread that forwards stdin lines until EOF
pub fn stdin_lines() -> io::Result<async_channel::Receiver<String>> {
    let (tx, rx) = async_channel::bounded(16);
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send_blocking(line).is_err() {
                    break;
                }
            }
            debug!("stdin closed");
        })?;
    Ok(rx)
}

pub struct TerminalUi {
    lines: async_channel::Receiver<String>,
}

struct Inner {
    bus: Bus,
    lines: async_channel::Receiver<String>,
    /// Close signals of the open hails, keyed by hail message id
    hails: Mutex<HashMap<MessageId, oneshot::Sender<()>>>,
}

impl TerminalUi {
    pub fn new(lines: async_channel::Receiver<String>) -> Self {
        Self { lines }
    }

    /// Serve the `ui` topic until the bus shuts down
    pub fn spawn(self, bus: &Bus) -> JoinHandle<()> {
        let subscription = bus.subscribe(&[Topic::Ui]);
        let inner = Arc::new(Inner {
            bus: bus.clone(),
            lines: self.lines,
            hails: Mutex::new(HashMap::new()),
        });

        tokio::spawn(async move {
            while let Ok(message) = subscription.recv().await {
                if message.is_response() {
                    continue;
                }
                if let Payload::Ui(UiPayload::RemoveHail { hail }) = message.payload {
                    inner.remove_hail(hail);
                    continue;
                }
                // Registered now so a remove-hail that follows is not missed
                let removed = inner.register_hail(&message);
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { inner.handle(message, removed).await });
            }
            debug!("Terminal UI stopped");
        })
    }
}

impl Inner {
    fn hails(&self) -> MutexGuard<'_, HashMap<MessageId, oneshot::Sender<()>>> {
        self.hails.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register_hail(&self, message: &Message) -> Option<oneshot::Receiver<()>> {
        if !matches!(message.payload, Payload::Ui(UiPayload::Hail { .. })) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.hails().insert(message.id, tx);
        Some(rx)
    }

    fn remove_hail(&self, hail: MessageId) {
        match self.hails().remove(&hail) {
            // The hail task may have finished already
            Some(close) => {
                let _ = close.send(());
            }
            None => debug!("No open hail {}", hail),
        }
    }

    async fn handle(&self, message: Message, removed: Option<oneshot::Receiver<()>>) {
        let result = match (&message.payload, removed) {
            (Payload::Ui(UiPayload::Hail { text, cancellable }), Some(removed)) => {
                let answer = self.hail(text, *cancellable, removed).await;
                self.hails().remove(&message.id);
                Ok(answer)
            }
            (Payload::Ui(UiPayload::GetPin { prompt }), _) => {
                println!("{}", prompt);
                for row in PIN_MATRIX {
                    println!("    {}", row);
                }
                println!("PIN (empty to cancel):");
                Ok(match self.lines.recv().await {
                    Ok(line) if !line.trim().is_empty() => UiPayload::Pin(line.trim().to_string()),
                    _ => UiPayload::Cancelled,
                })
            }
            (Payload::Ui(UiPayload::GetPassphrase { prompt }), _) => {
                println!("{}:", prompt);
                Ok(match self.lines.recv().await {
                    Ok(line) => UiPayload::Passphrase(line),
                    Err(_) => UiPayload::Cancelled,
                })
            }
            _ => Err(format!("{} is not a ui request", message.kind)),
        };

        let sent = match result {
            Ok(answer) => self.bus.respond(&message, Payload::Ui(answer), None),
            Err(e) => self.bus.respond(&message, Payload::Empty, Some(e)),
        };
        if let Err(e) = sent {
            warn!("Dropping UI response to {}: {}", message.id, e);
        }
    }

    /// Wait for this hail's remove-hail, or for Enter when cancellable
    async fn hail(
        &self,
        text: &str,
        cancellable: bool,
        removed: oneshot::Receiver<()>,
    ) -> UiPayload {
        if cancellable {
            println!("{} (press Enter to cancel)", text);
        } else {
            println!("{}", text);
        }

        tokio::select! {
            _ = removed => UiPayload::Dismissed,
            Ok(_) = self.lines.recv(), if cancellable => {
                debug!("Hail cancelled by the user");
                UiPayload::Cancelled
            }
        }
    }
}
